//! Errors surfaced by the read path.
//!
//! The write path never errors to callers: failures there turn into metrics,
//! log lines, and the boolean result of
//! [`StratusClient::put`](crate::StratusClient::put).

use thiserror::Error;

/// Building a network client for a service failed.
#[derive(Debug, Error)]
#[error("failed to connect to service {service}: {reason}")]
pub struct ConnectError {
    /// The service that could not be reached.
    pub service: String,
    /// Human-readable cause.
    pub reason: String,
}

/// A read could not be served.
#[derive(Debug, Error)]
pub enum ReadError {
    /// No read services are configured or reachable.
    #[error("no read services available")]
    NoReadServices,

    /// Strict mode only: transient failures survived every replica.
    #[error("failed reading from storage: transient errors on all services")]
    Exhausted,

    /// A `service_override` named a service the client could not connect to.
    #[error(transparent)]
    Connect(#[from] ConnectError),
}
