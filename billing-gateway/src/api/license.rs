use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::license::ActivationOutcome;
use crate::wire::{EventPayload, LicenseRevoked, PlanChanged};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub(super) struct ActivateBody {
    machine_id_hash: String,
    terminal_name: String,
    ip_address: Option<String>,
    location: Option<String>,
}

#[derive(Serialize)]
pub(super) struct ActivateResponse {
    activated: bool,
}

pub(super) async fn post_activate(
    State(state): State<AppState>,
    Path(license_key): Path<String>,
    Json(body): Json<ActivateBody>,
) -> AppResult<Json<ActivateResponse>> {
    let outcome = state
        .license_service
        .activate(&license_key, &body.machine_id_hash, &body.terminal_name, body.ip_address.as_deref(), body.location.as_deref())
        .await?;

    Ok(Json(ActivateResponse { activated: matches!(outcome, ActivationOutcome::Activated) }))
}

#[derive(Debug, Deserialize)]
pub(super) struct HeartbeatBody {
    machine_id_hash: String,
}

#[derive(Serialize)]
pub(super) struct HeartbeatResponse {
    is_valid: bool,
    grace_period_remaining_ms: i64,
}

pub(super) async fn post_heartbeat(
    State(state): State<AppState>,
    Path(license_key): Path<String>,
    Json(body): Json<HeartbeatBody>,
) -> AppResult<Json<HeartbeatResponse>> {
    let result = state.license_service.heartbeat(&license_key, &body.machine_id_hash).await?;
    Ok(Json(HeartbeatResponse { is_valid: result.is_valid, grace_period_remaining_ms: result.grace_period_remaining_ms }))
}

#[derive(Debug, Deserialize)]
pub(super) struct DeactivateBody {
    machine_id_hash: String,
}

pub(super) async fn post_deactivate(
    State(state): State<AppState>,
    Path(license_key): Path<String>,
    Json(body): Json<DeactivateBody>,
) -> AppResult<Json<serde_json::Value>> {
    state.license_service.deactivate(&license_key, &body.machine_id_hash).await?;
    Ok(Json(serde_json::json!({ "deactivated": true })))
}

#[derive(Debug, Deserialize)]
pub(super) struct RevokeBody {
    reason: String,
}

pub(super) async fn post_revoke(
    State(state): State<AppState>,
    Path(license_key): Path<String>,
    Json(body): Json<RevokeBody>,
) -> AppResult<Json<serde_json::Value>> {
    state.license_service.revoke(&license_key, &body.reason).await?;
    Ok(Json(serde_json::json!({ "revoked": true })))
}

#[derive(Debug, Deserialize)]
pub(super) struct PlanChangeBody {
    subscription_id: String,
    customer_id: String,
    new_plan: license_key::Plan,
}

#[derive(Serialize)]
pub(super) struct PlanChangeResponse {
    new_license_key: String,
}

/// The plan-change API: revoke every existing license for the subscription, mint a new one,
/// migrate in-trial activations across (capped at `MAX_TRIAL_PLAN_CHANGES`), record the change,
/// then publish `license_revoked` followed by `plan_changed` to each old key.
pub(super) async fn post_plan_change(
    State(state): State<AppState>,
    Json(body): Json<PlanChangeBody>,
) -> AppResult<Json<PlanChangeResponse>> {
    let tx = state.conn.transaction().await.map_err(AppError::transient_store)?;

    let mut rows = tx
        .query(
            "SELECT license_key FROM licenses WHERE subscription_id = ?1 AND is_active = 1",
            [body.subscription_id.clone()],
        )
        .await
        .map_err(AppError::transient_store)?;

    let mut old_keys = Vec::new();
    while let Some(row) = rows.next().await.map_err(AppError::transient_store)? {
        old_keys.push(row.get::<String>(0).map_err(AppError::transient_store)?);
    }

    let mut subscription_row = tx
        .query("SELECT plan_change_count, status FROM subscriptions WHERE id = ?1", [body.subscription_id.clone()])
        .await
        .map_err(AppError::transient_store)?;
    let subscription_row = subscription_row
        .next()
        .await
        .map_err(AppError::transient_store)?
        .ok_or_else(|| AppError::not_found("subscription not found"))?;
    let change_count: i64 = subscription_row.get(0).map_err(AppError::transient_store)?;
    let status: String = subscription_row.get(1).map_err(AppError::transient_store)?;
    let migrate_activations = status == "trialing" && change_count < i64::from(state.conf.get().max_trial_plan_changes);

    let new_key = license_key::mint(body.new_plan, &body.customer_id, &state.conf.get().license_hmac_secret);
    tx.execute(
        "INSERT INTO licenses (license_key, customer_id, subscription_id, max_terminals)
         VALUES (:key, :customer_id, :subscription_id, :max_terminals)",
        (
            (":key", new_key.clone()),
            (":customer_id", body.customer_id.clone()),
            (":subscription_id", body.subscription_id.clone()),
            (":max_terminals", i64::from(body.new_plan.default_max_terminals())),
        ),
    )
    .await
    .map_err(AppError::transient_store)?;

    for old_key in &old_keys {
        tx.execute(
            "UPDATE licenses SET is_active = 0, revoked_at = unixepoch(), revocation_reason = 'plan changed' WHERE license_key = ?1",
            [old_key.clone()],
        )
        .await
        .map_err(AppError::transient_store)?;

        if migrate_activations {
            tx.execute("UPDATE activations SET license_key = ?1 WHERE license_key = ?2", [new_key.clone(), old_key.clone()])
                .await
                .map_err(AppError::transient_store)?;
        }
    }

    tx.execute(
        "UPDATE subscriptions SET plan_change_count = plan_change_count + 1 WHERE id = ?1",
        [body.subscription_id.clone()],
    )
    .await
    .map_err(AppError::transient_store)?;

    tx.execute(
        "INSERT INTO subscription_changes (id, subscription_id, to_plan_id) VALUES (?1, ?2, ?3)",
        (ulid::Ulid::new().to_string(), body.subscription_id.clone(), format!("{:?}", body.new_plan)),
    )
    .await
    .map_err(AppError::transient_store)?;

    tx.commit().await.map_err(AppError::transient_store)?;

    // Publish after commit: a transport failure must never undo the license/activation rewrite above.
    for old_key in old_keys {
        let revoked_envelope = crate::wire::EventEnvelope {
            id: ulid::Ulid::new().to_string(),
            timestamp: time::OffsetDateTime::now_utc(),
            license_key: old_key.clone(),
            payload: EventPayload::LicenseRevoked(LicenseRevoked { reason: "plan changed".to_owned() }),
        };
        state.bus.publish(&old_key, &revoked_envelope).await;

        let plan_changed_envelope = crate::wire::EventEnvelope {
            id: ulid::Ulid::new().to_string(),
            timestamp: time::OffsetDateTime::now_utc(),
            license_key: old_key.clone(),
            payload: EventPayload::PlanChanged(PlanChanged {
                new_license_key: new_key.clone(),
                new_plan_id: format!("{:?}", body.new_plan),
            }),
        };
        state.bus.publish(&old_key, &plan_changed_envelope).await;
    }

    Ok(Json(PlanChangeResponse { new_license_key: new_key }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfHandle;

    async fn state_with_subscription(status: &str, plan_change_count: i64) -> (AppState, String) {
        let conf = ConfHandle::mock_for_tests(":memory:");
        let state = AppState::new(conf).await.unwrap();

        state.conn.execute("INSERT INTO customers (id, email) VALUES ('cust_1', 'a@example.com')", ()).await.unwrap();
        state
            .conn
            .execute(
                "INSERT INTO subscriptions
                    (id, customer_id, plan_id, billing_cycle, status, current_period_start, current_period_end,
                     external_subscription_id, plan_change_count)
                 VALUES ('sub_1', 'cust_1', 'basic', 'monthly', :status, 0, 9999999999, 'ext_1', :plan_change_count)",
                ((":status", status.to_owned()), (":plan_change_count", plan_change_count)),
            )
            .await
            .unwrap();

        let old_key = license_key::mint(license_key::Plan::Basic, "cust_1", &state.conf.get().license_hmac_secret);
        state
            .conn
            .execute(
                "INSERT INTO licenses (license_key, customer_id, subscription_id, max_terminals)
                 VALUES (:key, 'cust_1', 'sub_1', 2)",
                [(":key", old_key.clone())],
            )
            .await
            .unwrap();
        state
            .conn
            .execute(
                "INSERT INTO activations (id, license_key, machine_id_hash, terminal_name, first_activation, is_active)
                 VALUES ('act_1', :key, 'machine-a', 'box-a', 0, 1)",
                [(":key", old_key.clone())],
            )
            .await
            .unwrap();

        (state, old_key)
    }

    async fn activation_license_key(state: &AppState) -> String {
        let mut rows = state.conn.query("SELECT license_key FROM activations WHERE id = 'act_1'", ()).await.unwrap();
        rows.next().await.unwrap().unwrap().get(0).unwrap()
    }

    #[tokio::test]
    async fn non_trial_plan_change_does_not_migrate_activations() {
        let (state, old_key) = state_with_subscription("active", 0).await;

        let body = PlanChangeBody {
            subscription_id: "sub_1".to_owned(),
            customer_id: "cust_1".to_owned(),
            new_plan: license_key::Plan::Pro,
        };
        post_plan_change(State(state.clone()), Json(body)).await.unwrap();

        assert_eq!(activation_license_key(&state).await, old_key, "a non-trial plan change must not migrate activations");
    }

    #[tokio::test]
    async fn trialing_plan_change_under_the_cap_migrates_activations() {
        let (state, old_key) = state_with_subscription("trialing", 0).await;

        let body = PlanChangeBody {
            subscription_id: "sub_1".to_owned(),
            customer_id: "cust_1".to_owned(),
            new_plan: license_key::Plan::Pro,
        };
        let response = post_plan_change(State(state.clone()), Json(body)).await.unwrap();

        assert_ne!(activation_license_key(&state).await, old_key);
        assert_eq!(activation_license_key(&state).await, response.0.new_license_key);
    }

    #[tokio::test]
    async fn trialing_plan_change_at_the_cap_does_not_migrate_activations() {
        let (state, old_key) = state_with_subscription("trialing", 4).await;

        let body = PlanChangeBody {
            subscription_id: "sub_1".to_owned(),
            customer_id: "cust_1".to_owned(),
            new_plan: license_key::Plan::Pro,
        };
        post_plan_change(State(state.clone()), Json(body)).await.unwrap();

        assert_eq!(activation_license_key(&state).await, old_key);
    }
}
