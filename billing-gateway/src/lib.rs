//! Subscription Event Delivery Fabric: webhook ingress, license state machine, durable event
//! store, cross-instance pub/sub fan-out, and the retry/DLQ engine that ties them together.
//!
//! `main.rs` wires this crate's pieces into a running process; everything here is usable
//! independently in tests, which is why [`AppState`] holds `Arc`s of already-constructed
//! components rather than building them lazily.

#[macro_use]
extern crate tracing;

pub mod ack_ledger;
pub mod api;
pub mod bus;
pub mod config;
pub mod db;
pub mod delivery;
pub mod error;
pub mod event_store;
pub mod http;
pub mod license;
pub mod log;
pub mod models;
pub mod pattern_analyzer;
pub mod retry;
pub mod sweeps;
pub mod webhook;
pub mod wire;

use std::sync::Arc;

use libsql::Connection;

use crate::ack_ledger::AckLedger;
use crate::bus::{Bus, InProcessBus, RedisBus};
use crate::config::ConfHandle;
use crate::delivery::{AckRouter, DeliveryEndpoint};
use crate::event_store::EventStore;
use crate::license::LicenseService;
use crate::pattern_analyzer::PatternAnalyzer;
use crate::webhook::WebhookIngress;

/// Everything an HTTP handler needs, cheaply cloneable (every field is already an `Arc` or a
/// `libsql::Connection`, which is itself a cheap handle around a shared connection pool).
#[derive(Clone)]
pub struct AppState {
    pub conf: ConfHandle,
    pub conn: Connection,
    pub event_store: Arc<EventStore>,
    pub ack_ledger: Arc<AckLedger>,
    pub bus: Arc<dyn Bus>,
    pub delivery: Arc<DeliveryEndpoint>,
    pub license_service: Arc<LicenseService>,
    pub webhook_ingress: Arc<WebhookIngress>,
    pub pattern_analyzer: Arc<PatternAnalyzer>,
}

impl AppState {
    pub async fn new(conf: ConfHandle) -> anyhow::Result<Self> {
        let c = conf.get();
        let conn = db::connect(&c.database_url).await?;

        let event_store = Arc::new(EventStore::new(conn.clone(), time::Duration::hours(c.event_ttl_hours)));
        let ack_ledger = Arc::new(AckLedger::new(conn.clone()));

        let bus: Arc<dyn Bus> = match &c.pubsub_url {
            Some(url) => Arc::new(RedisBus::new(url, 256)?),
            None => Arc::new(InProcessBus::default()),
        };

        let ack_router = AckRouter::new();
        let delivery = Arc::new(DeliveryEndpoint {
            event_store: event_store.clone(),
            ack_ledger: ack_ledger.clone(),
            bus: bus.clone(),
            ack_router,
        });

        let license_service = Arc::new(LicenseService {
            conn: conn.clone(),
            bus: bus.clone(),
            hmac_secret: c.license_hmac_secret.clone(),
            max_deactivations_per_year: c.max_deactivations_per_year,
        });

        let webhook_ingress = Arc::new(WebhookIngress {
            conn: conn.clone(),
            event_store: event_store.clone(),
            bus: bus.clone(),
            hmac_secret: c.license_hmac_secret.clone(),
        });

        let pattern_analyzer = Arc::new(PatternAnalyzer { conn: conn.clone(), ack_ledger: AckLedger::new(conn.clone()) });

        Ok(Self {
            conf,
            conn,
            event_store,
            ack_ledger,
            bus,
            delivery,
            license_service,
            webhook_ingress,
            pattern_analyzer,
        })
    }
}
