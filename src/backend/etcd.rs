//! KV-lease backend adapter: a strongly-consistent store with revocable
//! leases (etcd). Grounded in `grpc_service/etcd.go` and
//! `config/center/etcd.go` of the Go source.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions, WatchOptions};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::{Backend, KvEvent, LeaseHandle, LeaseId};
use crate::config::BackendConfig;
use crate::metadata::{Endpoint, ServiceMetadata};
use crate::{Error, Result};

fn service_prefix(service: &ServiceMetadata) -> String {
    format!("{}/", service.unique_key())
}

/// Process hostname, published as the value of a registered endpoint key.
///
/// The Go source resolves this via `os.Hostname()`; the core does not
/// depend on a hostname-resolution crate, so it falls back to the
/// environment the way a containerized deployment typically sets it.
fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Adapter over an `etcd_client::Client`.
pub struct EtcdBackend {
    client: Client,
}

impl EtcdBackend {
    pub async fn connect(config: &BackendConfig) -> Result<Self> {
        let endpoints = config.endpoint_list();
        if endpoints.is_empty() {
            return Err(Error::Config("etcd backend requires at least one endpoint".into()));
        }
        let mut options = ConnectOptions::new().with_timeout(config.dial_timeout());
        if !config.username.is_empty() {
            options = options.with_user(config.username.clone(), config.password.clone());
        }
        options = options
            .with_keep_alive(config.dial_keepalive_time(), config.dial_keepalive_timeout());
        let client = Client::connect(endpoints, Some(options)).await?;
        Ok(Self { client })
    }

    #[cfg(test)]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Backend for EtcdBackend {
    async fn register_instance(&self, service: &ServiceMetadata, endpoint: &Endpoint) -> Result<()> {
        // Callers are expected to have granted a lease via `grant_lease` and
        // keep republishing through `put_with_lease`; a bare register here
        // (no lease argument in the trait) publishes without one, which is
        // fine for idempotent overwrites of an already-leased key.
        let mut client = self.client.clone();
        client
            .put(service.instance_key(endpoint), local_hostname(), None)
            .await?;
        Ok(())
    }

    async fn deregister_instance(&self, service: &ServiceMetadata, endpoint: &Endpoint) -> Result<()> {
        let mut client = self.client.clone();
        client.delete(service.instance_key(endpoint), None).await?;
        Ok(())
    }

    async fn resolve_once(&self, service: &ServiceMetadata) -> Result<Vec<Endpoint>> {
        let prefix = service_prefix(service);
        let mut client = self.client.clone();
        let resp = client
            .get(prefix.clone(), Some(GetOptions::new().with_prefix()))
            .await?;
        let mut addrs = Vec::new();
        for kv in resp.kvs() {
            let key = kv.key_str().unwrap_or_default();
            let suffix = key.strip_prefix(prefix.as_str()).unwrap_or(key);
            match Endpoint::parse(suffix) {
                Ok(ep) => addrs.push(ep),
                Err(_) => {
                    warn!(component = "etcd_backend", event = "skip_malformed_endpoint", key = %key);
                    continue;
                }
            }
        }
        addrs.sort();
        addrs.dedup();
        Ok(addrs)
    }

    async fn subscribe(&self, service: &ServiceMetadata) -> Result<mpsc::Receiver<Vec<Endpoint>>> {
        let prefix = service_prefix(service);
        let mut watch_client = self.client.clone();
        let (mut watcher, mut stream) = watch_client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?;
        let (tx, rx) = mpsc::channel(32);
        let resolver_client = self.client.clone();
        let service = service.clone();
        tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(_resp)) => {
                        // Always re-issue the authoritative list rather than
                        // reconciling incremental events (spec §4.1).
                        let backend = EtcdBackend {
                            client: resolver_client.clone(),
                        };
                        match backend.resolve_once(&service).await {
                            Ok(addrs) => {
                                if tx.send(addrs).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(component = "etcd_backend", event = "resolve_after_watch_failed", error = %err);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(component = "etcd_backend", event = "watch_stream_error", error = %err);
                        break;
                    }
                }
            }
            let _ = watcher.cancel().await;
        });
        Ok(rx)
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .and_then(|kv| kv.value_str().ok())
            .map(str::to_string))
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.put(key, value, None).await?;
        Ok(())
    }

    async fn kv_set_with_lease(&self, key: &str, value: &str, ttl_secs: i64) -> Result<LeaseId> {
        let handle = self.grant_lease(ttl_secs).await?;
        self.put_with_lease(key, value, handle.id).await?;
        Ok(handle.id)
    }

    async fn kv_watch(&self, key: &str) -> Result<mpsc::Receiver<KvEvent>> {
        self.watch_inner(key.to_string(), false).await
    }

    async fn kv_watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<KvEvent>> {
        self.watch_inner(prefix.to_string(), true).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut client = self.client.clone();
        let resp = client
            .get(key, Some(GetOptions::new().with_count_only()))
            .await?;
        Ok(resp.count() > 0)
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseHandle> {
        let mut client = self.client.clone();
        let grant = client.lease_grant(ttl_secs, None).await?;
        let lease_id = grant.id();
        let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let tick = Duration::from_secs((ttl_secs.max(1) as u64 / 3).max(1));
            loop {
                tokio::time::sleep(tick).await;
                if keeper.keep_alive().await.is_err() {
                    break;
                }
                match stream.message().await {
                    Ok(Some(_)) => {
                        if tx.send(()).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            debug!(component = "etcd_backend", event = "keepalive_channel_closed", lease_id);
        });
        Ok(LeaseHandle {
            id: LeaseId(lease_id),
            keepalive: rx,
        })
    }

    async fn put_with_lease(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease.0)))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl EtcdBackend {
    async fn watch_inner(&self, key: String, prefix: bool) -> Result<mpsc::Receiver<KvEvent>> {
        let mut watch_client = self.client.clone();
        let options = if prefix {
            Some(WatchOptions::new().with_prefix())
        } else {
            None
        };
        let (mut watcher, mut stream) = watch_client.watch(key, options).await?;
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            if let Some(kv) = event.kv() {
                                let key = kv.key_str().unwrap_or_default().to_string();
                                let value = kv.value_str().unwrap_or_default().to_string();
                                if tx.send(KvEvent { key, value }).await.is_err() {
                                    let _ = watcher.cancel().await;
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(component = "etcd_backend", event = "kv_watch_error", error = %err);
                        break;
                    }
                }
            }
            let _ = watcher.cancel().await;
        });
        Ok(rx)
    }
}
