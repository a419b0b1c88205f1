//! An observable in-memory backend used by the test suite.
//!
//! Mirrors the Go source's `grpc_service/nop.go` no-op adapter, but records
//! state and exposes `disconnect`/`reconnect` so the lease-recovery and
//! watch-delivery scenarios of spec §8 can be driven deterministically
//! without a real etcd/naming cluster.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::backend::{Backend, KvEvent, LeaseHandle, LeaseId};
use crate::metadata::{Endpoint, ServiceMetadata};
use crate::{Error, Result};

struct State {
    connected: bool,
    kv: HashMap<String, String>,
    services: HashMap<String, HashSet<Endpoint>>,
    service_subscribers: HashMap<String, Vec<mpsc::Sender<Vec<Endpoint>>>>,
    key_watchers: HashMap<String, Vec<mpsc::Sender<KvEvent>>>,
    prefix_watchers: Vec<(String, mpsc::Sender<KvEvent>)>,
    next_lease: i64,
    leases: HashMap<i64, mpsc::Sender<()>>,
}

/// In-memory [`Backend`] for tests.
#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<State>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                connected: true,
                kv: HashMap::new(),
                services: HashMap::new(),
                service_subscribers: HashMap::new(),
                key_watchers: HashMap::new(),
                prefix_watchers: Vec::new(),
                next_lease: 1,
                leases: HashMap::new(),
            })),
        }
    }

    /// Simulates a backend partition: all in-flight leases appear lost and
    /// further calls fail with [`Error::BackendUnavailable`].
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.connected = false;
        state.leases.clear();
    }

    pub async fn reconnect(&self) {
        let mut state = self.state.lock().await;
        state.connected = true;
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    async fn notify_service(state: &mut State, unique_key: &str) {
        let addrs: Vec<Endpoint> = state
            .services
            .get(unique_key)
            .map(|set| {
                let mut v: Vec<_> = set.iter().cloned().collect();
                v.sort();
                v
            })
            .unwrap_or_default();
        if let Some(subs) = state.service_subscribers.get_mut(unique_key) {
            subs.retain(|tx| !tx.is_closed());
            for tx in subs.iter() {
                let _ = tx.send(addrs.clone()).await;
            }
        }
    }

    async fn notify_key(state: &mut State, key: &str, value: &str) {
        let event = KvEvent {
            key: key.to_string(),
            value: value.to_string(),
        };
        if let Some(watchers) = state.key_watchers.get_mut(key) {
            watchers.retain(|tx| !tx.is_closed());
            for tx in watchers.iter() {
                let _ = tx.send(event.clone()).await;
            }
        }
        state.prefix_watchers.retain(|(_, tx)| !tx.is_closed());
        for (prefix, tx) in state.prefix_watchers.iter() {
            if key.starts_with(prefix.as_str()) {
                let _ = tx.send(event.clone()).await;
            }
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn register_instance(&self, service: &ServiceMetadata, endpoint: &Endpoint) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(Error::BackendUnavailable("fake backend disconnected".into()));
        }
        state
            .services
            .entry(service.unique_key().to_string())
            .or_default()
            .insert(endpoint.clone());
        Self::notify_service(&mut state, service.unique_key()).await;
        Ok(())
    }

    async fn deregister_instance(&self, service: &ServiceMetadata, endpoint: &Endpoint) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(Error::BackendUnavailable("fake backend disconnected".into()));
        }
        if let Some(set) = state.services.get_mut(service.unique_key()) {
            set.remove(endpoint);
        }
        Self::notify_service(&mut state, service.unique_key()).await;
        Ok(())
    }

    async fn resolve_once(&self, service: &ServiceMetadata) -> Result<Vec<Endpoint>> {
        let state = self.state.lock().await;
        if !state.connected {
            return Err(Error::BackendUnavailable("fake backend disconnected".into()));
        }
        let mut addrs: Vec<Endpoint> = state
            .services
            .get(service.unique_key())
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        addrs.sort();
        Ok(addrs)
    }

    async fn subscribe(&self, service: &ServiceMetadata) -> Result<mpsc::Receiver<Vec<Endpoint>>> {
        let (tx, rx) = mpsc::channel(32);
        let mut state = self.state.lock().await;
        state
            .service_subscribers
            .entry(service.unique_key().to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let state = self.state.lock().await;
        if !state.connected {
            return Err(Error::BackendUnavailable("fake backend disconnected".into()));
        }
        Ok(state.kv.get(key).cloned())
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(Error::BackendUnavailable("fake backend disconnected".into()));
        }
        state.kv.insert(key.to_string(), value.to_string());
        Self::notify_key(&mut state, key, value).await;
        Ok(())
    }

    async fn kv_set_with_lease(&self, key: &str, value: &str, ttl_secs: i64) -> Result<LeaseId> {
        let handle = self.grant_lease(ttl_secs).await?;
        self.put_with_lease(key, value, handle.id).await?;
        Ok(handle.id)
    }

    async fn kv_watch(&self, key: &str) -> Result<mpsc::Receiver<KvEvent>> {
        let (tx, rx) = mpsc::channel(32);
        let mut state = self.state.lock().await;
        state.key_watchers.entry(key.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn kv_watch_prefix(&self, prefix: &str) -> Result<mpsc::Receiver<KvEvent>> {
        let (tx, rx) = mpsc::channel(32);
        let mut state = self.state.lock().await;
        state.prefix_watchers.push((prefix.to_string(), tx));
        Ok(rx)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let state = self.state.lock().await;
        if !state.connected {
            return Err(Error::BackendUnavailable("fake backend disconnected".into()));
        }
        Ok(state.kv.contains_key(key))
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseHandle> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(Error::BackendUnavailable("fake backend disconnected".into()));
        }
        let id = state.next_lease;
        state.next_lease += 1;
        let (tx, rx) = mpsc::channel(4);
        state.leases.insert(id, tx);
        drop(state);

        let shared = self.state.clone();
        let tick = Duration::from_secs((ttl_secs.max(1) as u64 / 3).max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                let tx = {
                    let guard = shared.lock().await;
                    if !guard.connected {
                        break;
                    }
                    match guard.leases.get(&id) {
                        Some(tx) => tx.clone(),
                        None => break,
                    }
                };
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        });

        Ok(LeaseHandle {
            id: LeaseId(id),
            keepalive: rx,
        })
    }

    async fn put_with_lease(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.connected || !state.leases.contains_key(&lease.0) {
            return Err(Error::BackendUnavailable("lease not live".into()));
        }
        state.kv.insert(key.to_string(), value.to_string());
        Self::notify_key(&mut state, key, value).await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.leases.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_resolve_once_sees_endpoint() {
        let backend = FakeBackend::new();
        let md = ServiceMetadata::new("ns", "Echo", "v1");
        let ep = Endpoint::parse("10.0.0.1:7000").unwrap();
        backend.register_instance(&md, &ep).await.unwrap();
        let addrs = backend.resolve_once(&md).await.unwrap();
        assert_eq!(addrs, vec![ep]);
    }

    #[tokio::test]
    async fn deregister_removes_endpoint() {
        let backend = FakeBackend::new();
        let md = ServiceMetadata::new("ns", "Echo", "v1");
        let ep = Endpoint::parse("10.0.0.1:7000").unwrap();
        backend.register_instance(&md, &ep).await.unwrap();
        backend.deregister_instance(&md, &ep).await.unwrap();
        let addrs = backend.resolve_once(&md).await.unwrap();
        assert!(addrs.is_empty());
    }

    #[tokio::test]
    async fn disconnect_fails_calls_and_drops_lease() {
        let backend = FakeBackend::new();
        let mut lease = backend.grant_lease(6).await.unwrap();
        backend.disconnect().await;
        assert!(lease.keepalive.recv().await.is_none());
        let md = ServiceMetadata::new("ns", "Echo", "v1");
        assert!(backend.resolve_once(&md).await.is_err());
    }

    #[tokio::test]
    async fn subscribe_receives_full_list_on_change() {
        let backend = FakeBackend::new();
        let md = ServiceMetadata::new("ns", "Echo", "v1");
        let mut rx = backend.subscribe(&md).await.unwrap();
        let ep = Endpoint::parse("10.0.0.1:7000").unwrap();
        backend.register_instance(&md, &ep).await.unwrap();
        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed, vec![ep]);
    }
}
