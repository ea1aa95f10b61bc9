pub mod clock;
pub mod dirs;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod server;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: engine::SecretLifecycleEngine,
    /// Prefix for shareable links, without a trailing slash.
    pub base_url: String,
    /// Largest accepted secret, in bytes.
    pub max_secret_bytes: usize,
}

pub use engine::{FinalView, SecretLifecycleEngine};
pub use error::{EngineError, StoreError};
pub use server::{build_router, run, ServerConfig, StoreKind};
