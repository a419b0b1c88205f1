use thiserror::Error;

/// Service/endpoint identity types shared by every other module.
pub mod metadata;

/// Backend adapters: the KV-lease store and the naming/config service,
/// plus a fake in-memory backend used by the test suite.
pub mod backend;

/// Registration with keepalive/lease renewal and recovery-on-loss.
pub mod registrar;

/// Name resolution: watches a backend and pushes endpoint updates.
pub mod resolver;

/// Bounded pool of multiplexed RPC connections.
pub mod pool;

/// Key/value configuration client with watch support.
pub mod config_client;

/// Uniform plugin lifecycle (`Config -> Init -> Run`) and app runner.
pub mod plugin;

/// Configuration envelope shared by every backend.
pub mod config;

/// Log and trace integrations.
pub mod telemetry;

/// Metrics registry shared by the pool, registrar and resolver.
mod metrics;
pub use metrics::Metrics;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed options or missing required fields at plugin `Init`. Fatal;
    /// aborts startup.
    #[error("config error: {0}")]
    Config(String),

    /// Cannot connect/authenticate to a backend. Fatal on `Init`, triggers
    /// recovery on `Run`.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Config key or service key absent. Local; callers decide.
    #[error("not found: {0}")]
    NotFound(String),

    /// Heartbeat channel closed unexpectedly. Internal; the registrar
    /// auto-recovers and callers should not normally observe this variant.
    #[error("lease lost")]
    LeaseLost,

    /// `Pool::acquire` saw `max_active` reached and all retries elapsed.
    #[error("pool exhausted")]
    PoolExhausted,

    /// `Pool::acquire` called after `Pool::close`.
    #[error("pool closed")]
    PoolClosed,

    /// `Pool::acquire` for a service that was never registered with the pool.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The backend acknowledged a publish negatively even though the
    /// transport call itself succeeded. Treated as `BackendUnavailable` by
    /// callers that don't need the distinction.
    #[error("publish rejected: {0}")]
    PublishRejected(String),

    /// An endpoint string did not parse as `host:port`.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("grpc transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// A lowercase, metrics-label-friendly variant name, matching the
    /// `{component, event, error}` observability fields of the external
    /// interface contract.
    pub fn metric_label(&self) -> String {
        match self {
            Error::Config(_) => "config",
            Error::BackendUnavailable(_) => "backend_unavailable",
            Error::NotFound(_) => "not_found",
            Error::LeaseLost => "lease_lost",
            Error::PoolExhausted => "pool_exhausted",
            Error::PoolClosed => "pool_closed",
            Error::UnknownService(_) => "unknown_service",
            Error::PublishRejected(_) => "publish_rejected",
            Error::InvalidEndpoint(_) => "invalid_endpoint",
            Error::Serialization(_) => "serialization",
            Error::ConfigParse(_) => "config_parse",
            Error::Etcd(_) => "etcd",
            Error::Http(_) => "http",
            Error::Transport(_) => "transport",
        }
        .to_string()
    }
}
