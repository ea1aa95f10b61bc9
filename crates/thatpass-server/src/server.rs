use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    clock::{Clock, SystemClock},
    engine::{FinalView, SecretLifecycleEngine},
    handlers::{create_password, health, reveal_password, view_password},
    store::{self, MemoryStore, RedbStore, RetryPolicy, SecretStore},
    AppState,
};

/// Which backend holds the secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    #[default]
    Redb,
    Memory,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redb" => Ok(Self::Redb),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store '{other}', expected 'redb' or 'memory'")),
        }
    }
}

#[derive(Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Prefix for shareable links. Derived from host and port when unset.
    pub base_url: Option<String>,
    pub store: StoreKind,
    pub data_dir: Option<PathBuf>,
    pub sweep_interval: Duration,
    pub retry: RetryPolicy,
    pub final_view: FinalView,
    pub max_secret_bytes: usize,
    pub cors_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            base_url: None,
            store: StoreKind::default(),
            data_dir: None,
            sweep_interval: Duration::from_secs(300),
            retry: RetryPolicy::Unbounded,
            final_view: FinalView::default(),
            max_secret_bytes: 65_536,
            cors_origins: None,
        }
    }
}

/// Parse `name` if it is set. A set but unparseable value is an error, never a fallback.
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow!("{name}={raw:?}: {e}"))
        })
        .transpose()
}

impl ServerConfig {
    /// Read the `TP_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let sweep_secs: u64 = parse_var(&lookup, "TP_SWEEP_INTERVAL_SECS")?
            .unwrap_or(defaults.sweep_interval.as_secs());
        ensure!(sweep_secs > 0, "TP_SWEEP_INTERVAL_SECS must be at least 1");

        let retry = match parse_var::<u32>(&lookup, "TP_MAX_RETRIES")? {
            Some(max) => RetryPolicy::bounded(
                max,
                Duration::from_millis(parse_var(&lookup, "TP_RETRY_BACKOFF_MS")?.unwrap_or(5)),
            ),
            None => defaults.retry,
        };

        Ok(Self {
            host: lookup("TP_HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "TP_PORT")?.unwrap_or(defaults.port),
            base_url: lookup("TP_BASE_URL"),
            store: parse_var(&lookup, "TP_STORE")?.unwrap_or(defaults.store),
            data_dir: lookup("TP_DATA_DIR").map(PathBuf::from),
            sweep_interval: Duration::from_secs(sweep_secs),
            retry,
            final_view: parse_var(&lookup, "TP_FINAL_VIEW")?.unwrap_or(defaults.final_view),
            max_secret_bytes: parse_var(&lookup, "TP_MAX_SECRET_BYTES")?
                .unwrap_or(defaults.max_secret_bytes),
            cors_origins: lookup("TP_CORS_ORIGINS"),
        })
    }

    fn link_base(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_owned(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }
}

/// Resolve the data directory, creating it if needed. Falls back to the
/// platform data dir when none is configured.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::platform_data_dir(),
    }
}

fn open_store(cfg: &ServerConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn SecretStore>> {
    Ok(match cfg.store {
        StoreKind::Memory => {
            info!("using in-memory store; secrets will not survive a restart");
            Arc::new(MemoryStore::new(clock))
        }
        StoreKind::Redb => {
            let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
            info!(data_dir = %data_dir.display(), "using data directory");
            let db_path = data_dir.join("thatpass.db");
            Arc::new(RedbStore::open(&db_path, clock).context("open store")?)
        }
    })
}

/// Routes for the JSON API.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/passwords", post(create_password))
        .route(
            "/password/{id}",
            get(view_password).post(reveal_password),
        )
        .with_state(state)
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = open_store(&cfg, clock.clone())?;

    store::spawn_sweep(store.clone(), cfg.sweep_interval);

    let engine = SecretLifecycleEngine::new(store, clock)
        .with_retry(cfg.retry)
        .with_final_view(cfg.final_view);
    info!(retry = ?cfg.retry, final_view = ?cfg.final_view, "lifecycle engine ready");

    let state = AppState {
        engine,
        base_url: cfg.link_base(),
        max_secret_bytes: cfg.max_secret_bytes,
    };

    let app = build_router(state)
        .layer(build_cors(cfg.cors_origins.as_deref()))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "thatpass server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
