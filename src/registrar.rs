//! Registration with a single shared lease, keepalive and recovery-on-loss.
//!
//! Grounded in `grpc_service/etcd.go`'s `EtcdRegister` (`Register`,
//! `leaseKeepalive`, `reRegisterServices`) and `grpc_service/interface.go`'s
//! package-level `Register`/`Unregister`/`Close` backed by a default
//! instance. As in the Go source, the process holds exactly one lease per
//! `Registrar`; every `(service, endpoint)` registered through it shares
//! that lease and is republished as a full set whenever the lease is lost
//! and regranted (spec §3's `RegistryState`, §4.2).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{Backend, LeaseId};
use crate::config::BackendKind;
use crate::metadata::{Endpoint, ServiceMetadata};
use crate::{Error, Result};

/// Registrar tuning, derived from a `BackendConfig` (spec §4.2).
#[derive(Debug, Clone, Copy)]
pub struct RegistrarConfig {
    pub kind: BackendKind,
    pub lease_ttl_secs: i64,
    /// Outer ceiling on the recovery loop's total elapsed retry time.
    /// `None` matches the Go source's unbounded retry; callers that want
    /// to surface a fatal error after prolonged backend unavailability
    /// should set this (spec §9 design note on the recovery backoff).
    pub max_recovery_elapsed: Option<Duration>,
}

impl RegistrarConfig {
    pub fn new(kind: BackendKind, lease_ttl_secs: i64) -> Self {
        Self {
            kind,
            lease_ttl_secs,
            max_recovery_elapsed: None,
        }
    }
}

/// The full set of what this process has told the backend it is serving:
/// `unique_key -> endpoints`, plus the metadata needed to republish each
/// key (spec §3's `RegistryState`). Everything in here shares the one
/// `lease`.
struct SharedState {
    services: HashMap<String, ServiceMetadata>,
    registry: HashMap<String, HashSet<Endpoint>>,
    lease: Option<LeaseId>,
    /// Set for the duration of a recovery cycle. A `Register` call that
    /// lands while this is true still appends to `registry` above, but
    /// defers publishing to the in-flight recovery loop's next republish
    /// rather than racing it with its own Put.
    recovering: bool,
}

/// Tracks every `(service, endpoint)` this process has registered and keeps
/// them alive under one shared lease with a single background task.
pub struct Registrar {
    backend: Arc<dyn Backend>,
    config: RegistrarConfig,
    state: Arc<Mutex<SharedState>>,
    /// Last successful publish time per endpoint, for diagnostics (the
    /// Rust analogue of the teacher's `Diagnostics.last_event`).
    last_registered: Arc<Mutex<HashMap<(String, Endpoint), DateTime<Utc>>>>,
    /// Stops the lease lifecycle task on `close`.
    cancel: CancellationToken,
    fatal_tx: mpsc::Sender<Error>,
    fatal_rx: Mutex<mpsc::Receiver<Error>>,
}

impl Registrar {
    pub fn new(backend: Arc<dyn Backend>, config: RegistrarConfig) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::channel(8);
        Self {
            backend,
            config,
            state: Arc::new(Mutex::new(SharedState {
                services: HashMap::new(),
                registry: HashMap::new(),
                lease: None,
                recovering: false,
            })),
            last_registered: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            fatal_tx,
            fatal_rx: Mutex::new(fatal_rx),
        }
    }

    /// The last time `(service, endpoint)` was successfully published,
    /// `None` if it has never succeeded.
    pub async fn last_registered(&self, service: &ServiceMetadata, endpoint: &Endpoint) -> Option<DateTime<Utc>> {
        let key = (service.unique_key().to_string(), endpoint.clone());
        self.last_registered.lock().await.get(&key).copied()
    }

    /// Registers `endpoint` under `service`. The first call on this
    /// Registrar grants the shared lease and starts the lease lifecycle
    /// task; later calls just publish under the existing lease.
    ///
    /// If a recovery cycle is in flight, the endpoint is appended to
    /// [`SharedState::registry`] immediately but its publish is deferred to
    /// that cycle's next full republish (spec §3/§4.2 tie-break), so this
    /// returns `Ok(())` without talking to the backend at all.
    pub async fn register(&self, service: ServiceMetadata, endpoint: Endpoint) -> Result<()> {
        let unique_key = service.unique_key().to_string();
        let (lease, recovering) = {
            let mut state = self.state.lock().await;
            state.services.entry(unique_key.clone()).or_insert_with(|| service.clone());
            let is_new = state.registry.entry(unique_key).or_default().insert(endpoint.clone());
            if !is_new {
                return Ok(());
            }
            (state.lease, state.recovering)
        };

        if recovering {
            info!(component = "registrar", event = "register_deferred_to_recovery", service = %service, endpoint = %endpoint);
            return Ok(());
        }

        let lease_id = match lease {
            Some(id) => id,
            None => {
                let handle = self.backend.grant_lease(self.config.lease_ttl_secs).await?;
                let id = handle.id;
                self.state.lock().await.lease = Some(id);
                self.spawn_lease_lifecycle(handle.keepalive);
                id
            }
        };

        self.publish_instance(&service, &endpoint, lease_id).await?;
        Self::record_registered(&self.last_registered, &service, &endpoint).await;
        Ok(())
    }

    /// Deregisters `endpoint`. The shared lease and any other endpoint
    /// under it are unaffected.
    pub async fn deregister(&self, service: &ServiceMetadata, endpoint: &Endpoint) -> Result<()> {
        let unique_key = service.unique_key().to_string();
        {
            let mut state = self.state.lock().await;
            if let Some(set) = state.registry.get_mut(&unique_key) {
                set.remove(endpoint);
                if set.is_empty() {
                    state.registry.remove(&unique_key);
                    state.services.remove(&unique_key);
                }
            }
        }
        self.backend.deregister_instance(service, endpoint).await
    }

    /// Stops the lease lifecycle task and clears `RegistryState`.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let mut state = self.state.lock().await;
        state.registry.clear();
        state.services.clear();
        state.lease = None;
        drop(state);
        self.backend.close().await
    }

    /// Resolves once a fatal, unrecoverable registration error is reported
    /// by the lease lifecycle task (e.g. `max_recovery_elapsed` exceeded).
    pub async fn recv_fatal(&self) -> Option<Error> {
        self.fatal_rx.lock().await.recv().await
    }

    async fn record_registered(
        last_registered: &Mutex<HashMap<(String, Endpoint), DateTime<Utc>>>,
        service: &ServiceMetadata,
        endpoint: &Endpoint,
    ) {
        let key = (service.unique_key().to_string(), endpoint.clone());
        last_registered.lock().await.insert(key, Utc::now());
    }

    async fn publish_instance(&self, service: &ServiceMetadata, endpoint: &Endpoint, lease_id: LeaseId) -> Result<()> {
        Self::publish_one(&self.backend, self.config.kind, service, endpoint, lease_id).await
    }

    async fn publish_one(
        backend: &Arc<dyn Backend>,
        kind: BackendKind,
        service: &ServiceMetadata,
        endpoint: &Endpoint,
        lease_id: LeaseId,
    ) -> Result<()> {
        match kind {
            BackendKind::KvLease => {
                let key = service.instance_key(endpoint);
                backend.put_with_lease(&key, endpoint.as_str(), lease_id).await
            }
            BackendKind::Naming => backend.register_instance(service, endpoint).await,
        }
    }

    fn spawn_lease_lifecycle(&self, keepalive: mpsc::Receiver<()>) {
        tokio::spawn(Self::lease_lifecycle(
            self.backend.clone(),
            self.config,
            self.state.clone(),
            self.last_registered.clone(),
            self.cancel.clone(),
            self.fatal_tx.clone(),
            keepalive,
        ));
    }

    /// Owns the shared lease end to end: watches its keepalive channel,
    /// and on loss runs the re-registration loop (nominal interval
    /// `ttl/3`, backing off exponentially up to a ceiling of `ttl` seconds,
    /// itself bounded by `max_recovery_elapsed` if set — spec §9) until a
    /// fresh lease is granted and the *entire* `RegistryState` is
    /// republished under it, then resumes watching the new lease.
    async fn lease_lifecycle(
        backend: Arc<dyn Backend>,
        config: RegistrarConfig,
        state: Arc<Mutex<SharedState>>,
        last_registered: Arc<Mutex<HashMap<(String, Endpoint), DateTime<Utc>>>>,
        cancel: CancellationToken,
        fatal_tx: mpsc::Sender<Error>,
        mut keepalive: mpsc::Receiver<()>,
    ) {
        loop {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    tick = keepalive.recv() => match tick {
                        Some(()) => continue,
                        None => break,
                    },
                }
            }
            warn!(component = "registrar", event = "lease_lost");
            {
                let mut s = state.lock().await;
                s.lease = None;
                s.recovering = true;
            }

            let nominal = Duration::from_secs((config.lease_ttl_secs.max(1) as u64 / 3).max(1));
            let ceiling = Duration::from_secs(config.lease_ttl_secs.max(1) as u64);
            let mut backoff = nominal;
            let mut elapsed = Duration::ZERO;

            let new_keepalive = loop {
                match Self::republish_all(&backend, &config, &state, &last_registered).await {
                    Ok(handle) => break handle,
                    Err(()) => {
                        let jittered = jitter(backoff);
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(jittered) => {}
                        }
                        elapsed += jittered;
                        if let Some(max) = config.max_recovery_elapsed {
                            if elapsed >= max {
                                error!(component = "registrar", event = "recovery_exhausted");
                                let _ = fatal_tx
                                    .send(Error::BackendUnavailable(format!(
                                        "registrar recovery exceeded {max:?}"
                                    )))
                                    .await;
                                return;
                            }
                        }
                        backoff = (backoff * 2).min(ceiling);
                    }
                }
            };

            state.lock().await.recovering = false;
            keepalive = new_keepalive;
        }
    }

    /// One recovery attempt: grant a fresh lease, then republish every
    /// `(service, endpoint)` currently in `RegistryState` under it. Any
    /// single publish failure aborts the attempt — the next loop iteration
    /// starts over with a fresh lease rather than leaving a half-published
    /// set under an id some entries never saw.
    async fn republish_all(
        backend: &Arc<dyn Backend>,
        config: &RegistrarConfig,
        state: &Arc<Mutex<SharedState>>,
        last_registered: &Arc<Mutex<HashMap<(String, Endpoint), DateTime<Utc>>>>,
    ) -> std::result::Result<mpsc::Receiver<()>, ()> {
        let handle = backend.grant_lease(config.lease_ttl_secs).await.map_err(|err| {
            warn!(component = "registrar", event = "grant_lease_failed", error = %err);
        })?;
        let lease_id = handle.id;

        // Snapshot under the lock, then publish outside it so a slow
        // backend call doesn't block concurrent Register/Deregister calls
        // from observing RegistryState.
        let (services, registry) = {
            let s = state.lock().await;
            (s.services.clone(), s.registry.clone())
        };

        for (unique_key, endpoints) in &registry {
            let Some(service) = services.get(unique_key) else {
                continue;
            };
            for endpoint in endpoints {
                if let Err(err) = Self::publish_one(backend, config.kind, service, endpoint, lease_id).await {
                    warn!(component = "registrar", event = "republish_failed", service = %service, endpoint = %endpoint, error = %err);
                    return Err(());
                }
                Self::record_registered(last_registered, service, endpoint).await;
            }
        }

        state.lock().await.lease = Some(lease_id);
        info!(component = "registrar", event = "recovered", service_count = registry.len());
        Ok(handle.keepalive)
    }
}

/// Adds up to 20% jitter to a backoff duration so that many registrars
/// recovering from the same backend outage don't retry in lockstep.
fn jitter(backoff: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_secs_f64(backoff.as_secs_f64() * factor)
}

lazy_static! {
    static ref DEFAULT_REGISTRAR: Mutex<Option<Arc<Registrar>>> = Mutex::new(None);
}

/// Installs the process-wide default Registrar used by [`register`] and
/// [`unregister`] (mirrors the Go source's `SetDefaultRegister`).
pub async fn set_default_registrar(registrar: Arc<Registrar>) {
    *DEFAULT_REGISTRAR.lock().await = Some(registrar);
}

pub async fn register(service: ServiceMetadata, endpoint: Endpoint) -> Result<()> {
    let guard = DEFAULT_REGISTRAR.lock().await;
    match guard.as_ref() {
        Some(registrar) => registrar.register(service, endpoint).await,
        None => Err(Error::Config("no default registrar installed".into())),
    }
}

pub async fn unregister(service: &ServiceMetadata, endpoint: &Endpoint) -> Result<()> {
    let guard = DEFAULT_REGISTRAR.lock().await;
    match guard.as_ref() {
        Some(registrar) => registrar.deregister(service, endpoint).await,
        None => Err(Error::Config("no default registrar installed".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;

    #[tokio::test]
    async fn register_publishes_to_backend() {
        let fake = Arc::new(FakeBackend::new());
        let registrar = Registrar::new(fake.clone(), RegistrarConfig::new(BackendKind::Naming, 6));
        let md = ServiceMetadata::new("ns", "Echo", "v1");
        let ep = Endpoint::parse("10.0.0.1:7000").unwrap();
        registrar.register(md.clone(), ep.clone()).await.unwrap();
        let addrs = fake.resolve_once(&md).await.unwrap();
        assert_eq!(addrs, vec![ep]);
    }

    #[tokio::test]
    async fn second_register_reuses_the_shared_lease() {
        let fake = Arc::new(FakeBackend::new());
        let registrar = Registrar::new(fake.clone(), RegistrarConfig::new(BackendKind::Naming, 6));
        let md = ServiceMetadata::new("ns", "Echo", "v1");
        let ep1 = Endpoint::parse("10.0.0.1:7000").unwrap();
        let ep2 = Endpoint::parse("10.0.0.2:7000").unwrap();
        registrar.register(md.clone(), ep1.clone()).await.unwrap();
        registrar.register(md.clone(), ep2.clone()).await.unwrap();

        let mut addrs = fake.resolve_once(&md).await.unwrap();
        addrs.sort();
        let mut want = vec![ep1, ep2];
        want.sort();
        assert_eq!(addrs, want);
    }

    #[tokio::test]
    async fn deregister_removes_endpoint() {
        let fake = Arc::new(FakeBackend::new());
        let registrar = Registrar::new(fake.clone(), RegistrarConfig::new(BackendKind::Naming, 6));
        let md = ServiceMetadata::new("ns", "Echo", "v1");
        let ep = Endpoint::parse("10.0.0.1:7000").unwrap();
        registrar.register(md.clone(), ep.clone()).await.unwrap();
        registrar.deregister(&md, &ep).await.unwrap();
        let addrs = fake.resolve_once(&md).await.unwrap();
        assert!(addrs.is_empty());
    }

    /// Spec §8 scenario 2: a lease interrupted by a backend partition is
    /// re-registered once the backend comes back, without a duplicate
    /// entry.
    #[tokio::test]
    async fn recovers_registration_after_backend_partition() {
        let fake = Arc::new(FakeBackend::new());
        let mut config = RegistrarConfig::new(BackendKind::Naming, 3);
        config.max_recovery_elapsed = Some(Duration::from_secs(10));
        let registrar = Registrar::new(fake.clone(), config);
        let md = ServiceMetadata::new("ns", "Echo", "v1");
        let ep = Endpoint::parse("10.0.0.1:7000").unwrap();
        registrar.register(md.clone(), ep.clone()).await.unwrap();

        fake.disconnect().await;
        // Give the lease lifecycle task time to observe the lease is gone
        // and enter the recovery loop.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        fake.reconnect().await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
        loop {
            let addrs = fake.resolve_once(&md).await.unwrap();
            if addrs == vec![ep.clone()] {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "endpoint was not re-registered within the recovery window"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// A `Register` that lands while recovery is in flight must not race
    /// the recovery loop's own republish with a second Put under a lease
    /// id that may already be stale by the time it lands.
    #[tokio::test]
    async fn register_during_recovery_is_picked_up_by_the_recovery_cycle() {
        let fake = Arc::new(FakeBackend::new());
        let mut config = RegistrarConfig::new(BackendKind::Naming, 3);
        config.max_recovery_elapsed = Some(Duration::from_secs(10));
        let registrar = Arc::new(Registrar::new(fake.clone(), config));
        let md = ServiceMetadata::new("ns", "Echo", "v1");
        let ep1 = Endpoint::parse("10.0.0.1:7000").unwrap();
        let ep2 = Endpoint::parse("10.0.0.2:7000").unwrap();
        registrar.register(md.clone(), ep1.clone()).await.unwrap();

        fake.disconnect().await;
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(registrar.register(md.clone(), ep2.clone()).await.is_ok());
        fake.reconnect().await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
        loop {
            let mut addrs = fake.resolve_once(&md).await.unwrap();
            addrs.sort();
            let mut want = vec![ep1.clone(), ep2.clone()];
            want.sort();
            if addrs == want {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "both endpoints were not republished within the recovery window"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
