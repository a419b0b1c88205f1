//! Key/value configuration client with watch support (spec §4.5).
//!
//! Grounded in `config/center.go`/`config/center/center.go`'s `Client`
//! interface and `Item` type. The Go interface exposes `Watch`/
//! `WatchWithPrefix` as callback registration; here a watch is a stream of
//! [`ConfigItem`] snapshots, the same callback-vs-stream substitution
//! `resolver` makes (spec §9).

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::backend::Backend;
use crate::config::BackendKind;
use crate::Result;

/// A config value plus the key it was read under. Mirrors the Go source's
/// `Item`, but the RWMutex-guarded `value` becomes a plain
/// `Arc<RwLock<String>>` so snapshots can be cloned out cheaply.
#[derive(Clone)]
pub struct ConfigItem {
    pub namespace: String,
    pub key: String,
    value: Arc<RwLock<String>>,
}

impl ConfigItem {
    fn new(namespace: impl Into<String>, key: impl Into<String>, value: String) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
            value: Arc::new(RwLock::new(value)),
        }
    }

    pub async fn value(&self) -> String {
        self.value.read().await.clone()
    }

    async fn set_value(&self, value: String) {
        *self.value.write().await = value;
    }
}

/// Uniform configuration surface over either backend (spec §4.5).
pub struct ConfigClient {
    backend: Arc<dyn Backend>,
    kind: BackendKind,
    namespace: String,
}

impl ConfigClient {
    pub fn new(backend: Arc<dyn Backend>, kind: BackendKind, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            kind,
            namespace: namespace.into(),
        }
    }

    /// `/{namespace}/{key}` for the KV-lease backend (matching
    /// `config/center/etcd.go`'s `genKey`); the naming backend keys its own
    /// config store by `DataId` and needs no extra prefix.
    fn full_key(&self, key: &str) -> String {
        match self.kind {
            BackendKind::KvLease => format!("/{}/{}", self.namespace, key),
            BackendKind::Naming => key.to_string(),
        }
    }

    pub async fn get(&self, key: &str) -> Result<ConfigItem> {
        let value = self.backend.kv_get(&self.full_key(key)).await?.unwrap_or_default();
        Ok(ConfigItem::new(self.namespace.clone(), key, value))
    }

    pub async fn get_default(&self, key: &str, default_value: &str) -> Result<ConfigItem> {
        match self.backend.kv_get(&self.full_key(key)).await? {
            Some(value) => Ok(ConfigItem::new(self.namespace.clone(), key, value)),
            None => Ok(ConfigItem::new(self.namespace.clone(), key, default_value.to_string())),
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.backend.kv_set(&self.full_key(key), value).await
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: i64) -> Result<()> {
        self.backend.kv_set_with_lease(&self.full_key(key), value, ttl_secs).await?;
        Ok(())
    }

    /// Like `set_ex`, but keeps the lease alive instead of letting it
    /// expire once (`SetExKeepAlive` in the Go source).
    pub async fn set_ex_keep_alive(&self, key: &str, value: &str, ttl_secs: i64) -> Result<()> {
        let lease = self.backend.grant_lease(ttl_secs).await?;
        self.backend.put_with_lease(&self.full_key(key), value, lease.id).await?;
        let backend = self.backend.clone();
        let full_key = self.full_key(key);
        let value = value.to_string();
        let mut keepalive = lease.keepalive;
        tokio::spawn(async move {
            while keepalive.recv().await.is_some() {
                debug!(component = "config_client", event = "lease_renewed", key = %full_key);
            }
            // Lease lost: best-effort one-shot republish without a lease so
            // the value isn't silently dropped.
            let _ = backend.kv_set(&full_key, &value).await;
        });
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.backend.exists(&self.full_key(key)).await
    }

    /// Streams the full, up-to-date [`ConfigItem`] on every change to `key`.
    pub async fn watch(&self, key: &str) -> Result<mpsc::Receiver<ConfigItem>> {
        let full_key = self.full_key(key);
        let mut events = self.backend.kv_watch(&full_key).await?;
        let (tx, rx) = mpsc::channel(32);
        let item = ConfigItem::new(self.namespace.clone(), key, String::new());
        let key = key.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                item.set_value(event.value).await;
                if tx.send(item.clone()).await.is_err() {
                    break;
                }
            }
            debug!(component = "config_client", event = "watch_ended", key = %key);
        });
        Ok(rx)
    }

    /// Streams every key under `prefix`, one [`ConfigItem`] per change
    /// (`WatchWithPrefix` in the Go source).
    pub async fn watch_with_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<ConfigItem>> {
        let full_prefix = self.full_key(prefix);
        let mut events = self.backend.kv_watch_prefix(&full_prefix).await?;
        let (tx, rx) = mpsc::channel(32);
        let namespace = self.namespace.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let item = ConfigItem::new(namespace.clone(), event.key.clone(), event.value);
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let backend = Arc::new(FakeBackend::new());
        let client = ConfigClient::new(backend, BackendKind::KvLease, "ns");
        client.set("feature.flag", "on").await.unwrap();
        let item = client.get("feature.flag").await.unwrap();
        assert_eq!(item.value().await, "on");
    }

    #[tokio::test]
    async fn get_default_used_when_key_absent() {
        let backend = Arc::new(FakeBackend::new());
        let client = ConfigClient::new(backend, BackendKind::KvLease, "ns");
        let item = client.get_default("missing", "fallback").await.unwrap();
        assert_eq!(item.value().await, "fallback");
    }

    #[tokio::test]
    async fn watch_delivers_updates_in_order() {
        let backend = Arc::new(FakeBackend::new());
        let client = ConfigClient::new(backend.clone(), BackendKind::KvLease, "ns");
        let mut rx = client.watch("feature.flag").await.unwrap();
        client.set("feature.flag", "v1").await.unwrap();
        client.set("feature.flag", "v2").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().value().await, "v1");
        assert_eq!(rx.recv().await.unwrap().value().await, "v2");
    }
}
