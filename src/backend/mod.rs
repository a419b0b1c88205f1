//! Two interchangeable backend adapters — a strongly-consistent KV-lease
//! store and a naming/config service — exposing the same capability set
//! (spec §4.1, §9 "polymorphism across backends").

pub mod etcd;
pub mod fake;
pub mod naming;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::metadata::{Endpoint, ServiceMetadata};
use crate::Result;

/// A backend-issued lease id. Opaque beyond equality/display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseId(pub i64);

/// A granted lease plus the channel that signals loss.
///
/// The channel closing (yielding `None`) is the lease-lost signal, matching
/// the Go source's "keepalive channel close => lease presumed expired".
pub struct LeaseHandle {
    pub id: LeaseId,
    pub keepalive: mpsc::Receiver<()>,
}

/// One change to a watched key: the full current value, not a diff.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub key: String,
    pub value: String,
}

/// Capability set shared by every backend adapter (spec §4.1).
///
/// All operations are idempotent w.r.t. repeated calls with identical
/// arguments, except where noted.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Idempotent registration of `endpoint` under `service`.
    async fn register_instance(&self, service: &ServiceMetadata, endpoint: &Endpoint) -> Result<()>;

    /// Idempotent removal of `endpoint` under `service`.
    async fn deregister_instance(&self, service: &ServiceMetadata, endpoint: &Endpoint) -> Result<()>;

    /// One-shot resolve: the full, de-duplicated, currently registered
    /// address list for `service`. Unparsable entries are silently skipped.
    async fn resolve_once(&self, service: &ServiceMetadata) -> Result<Vec<Endpoint>>;

    /// Streams the *full* address list on every change (not a diff).
    async fn subscribe(&self, service: &ServiceMetadata) -> Result<mpsc::Receiver<Vec<Endpoint>>>;

    async fn kv_get(&self, key: &str) -> Result<Option<String>>;

    async fn kv_set(&self, key: &str, value: &str) -> Result<()>;

    /// Publishes `value` at `key` under a newly granted lease with the
    /// given TTL, returning that lease so callers can keep it alive.
    async fn kv_set_with_lease(&self, key: &str, value: &str, ttl_secs: i64) -> Result<LeaseId>;

    async fn kv_watch(&self, key: &str) -> Result<mpsc::Receiver<KvEvent>>;

    async fn kv_watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<KvEvent>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Grants a fresh lease and starts its keepalive. Used by the
    /// Registrar; backends without a real lease primitive (naming) return a
    /// handle that never closes on its own.
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseHandle>;

    /// Publishes `value` at `key` under the given already-granted lease.
    async fn put_with_lease(&self, key: &str, value: &str, lease: LeaseId) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
