use thiserror::Error;

use crate::store::LinkId;

/// Failures raised by a [`SecretStore`](crate::store::SecretStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not serve the request (I/O, transaction or lock failure).
    #[error("store unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A record already exists under this link id. Never overwritten.
    #[error("link id {0} already exists")]
    Duplicate(LinkId),

    /// A stored record could not be decoded.
    #[error("record {link_id} is corrupt: {reason}")]
    Corrupt { link_id: String, reason: String },
}

/// Outcome of a lifecycle operation that did not yield a value.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unknown, expired, over-viewed or address-restricted. Deliberately a
    /// single variant so callers cannot tell these apart.
    #[error("not found")]
    NotFound,

    /// The optimistic view increment kept conflicting under a bounded retry policy.
    #[error("view counter update did not converge after {attempts} attempts")]
    ConflictRetryExhausted { attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}
