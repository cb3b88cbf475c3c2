//! Domain error taxonomy.
//!
//! Every fallible operation in this crate returns an [`AppError`] carrying one of five
//! [`ErrorKind`]s. The kind is what a caller (the HTTP layer, the retry engine, a sweep job)
//! actually branches on; the wrapped [`anyhow::Error`] is for humans reading logs.

use std::fmt;

/// The five error categories the delivery fabric distinguishes between, because each one
/// implies a different response: retry, don't retry, surface to the caller, or alert an
/// operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller sent something that will never succeed no matter how many times it's retried.
    Validation,
    /// A caller failed to prove who they are, or isn't allowed to do what they asked.
    Auth,
    /// The referenced entity doesn't exist.
    NotFound,
    /// The request conflicts with the current state of the entity (e.g. a replayed webhook,
    /// a license already at its seat limit).
    Conflict,
    /// The underlying store or transport is unavailable right now, but the operation itself is
    /// sound; it should be retried.
    TransientStore,
    /// A downstream transport (the event bus, an outbound webhook) is unavailable right now.
    TransientTransport,
    /// The operation is well-formed but forbidden by a business rule (e.g. deactivation limit
    /// exhausted). Distinct from [`ErrorKind::Conflict`]: there is no racing write to retry
    /// against, the rule itself says no.
    PermanentBusinessRule,
}

impl ErrorKind {
    /// Whether an operation that failed with this kind is worth retrying automatically.
    pub const fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientStore | ErrorKind::TransientTransport)
    }
}

pub struct AppError {
    pub kind: ErrorKind,
    pub source: anyhow::Error,
}

impl AppError {
    pub fn new(kind: ErrorKind, source: impl Into<anyhow::Error>) -> Self {
        Self { kind, source: source.into() }
    }

    pub fn validation(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Validation, anyhow::anyhow!("{msg}"))
    }

    pub fn auth(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Auth, anyhow::anyhow!("{msg}"))
    }

    pub fn not_found(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, anyhow::anyhow!("{msg}"))
    }

    pub fn conflict(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Conflict, anyhow::anyhow!("{msg}"))
    }

    pub fn transient_store(source: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorKind::TransientStore, source)
    }

    pub fn transient_transport(source: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorKind::TransientTransport, source)
    }

    pub fn business_rule(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::PermanentBusinessRule, anyhow::anyhow!("{msg}"))
    }

    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Debug for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:?})", self.source, self.kind)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.source()
    }
}

impl From<libsql::Error> for AppError {
    fn from(value: libsql::Error) -> Self {
        AppError::transient_store(value)
    }
}

impl From<redis::RedisError> for AppError {
    fn from(value: redis::RedisError) -> Self {
        AppError::transient_transport(value)
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(ErrorKind::TransientStore.is_retryable());
        assert!(ErrorKind::TransientTransport.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::PermanentBusinessRule.is_retryable());
    }

    #[test]
    fn display_forwards_to_source() {
        let err = AppError::validation("missing field `licenseKey`");
        assert_eq!(err.to_string(), "missing field `licenseKey`");
    }
}
