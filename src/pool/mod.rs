//! Bounded pool of multiplexed RPC connections (spec §4.4). Grounded in
//! `grpc_pool/pool.go`, `grpc_pool/stack.go`, `grpc_pool/conn.go`.

mod conn;
mod holder;
mod stack;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tonic::transport::{Channel, Endpoint as TonicEndpoint};

pub use conn::PoolHandle;

pub use holder::PoolStats;

use self::holder::{HolderMsg, RestoreMsg};
use crate::{Error, Result};

const DEFAULT_MAX_IDLE: u32 = 1;
const DEFAULT_MAX_ACTIVE: usize = 64;
const DEFAULT_MAX_STREAMS_PER_CONN: u32 = 1000;
const DEFAULT_MAX_CONN_IDLE: Duration = Duration::from_secs(60);
const DEFAULT_MAX_WAIT_CONN_TIME: Duration = Duration::from_millis(20);
const DEFAULT_CYCLE_MONITOR_TICKER: Duration = Duration::from_secs(5);
const DEFAULT_CHANNEL_CAP: usize = 20;

/// Dials a fresh connection to one target. The holder is the only caller.
#[async_trait]
pub trait ConnBuilder: Send + Sync {
    async fn build(&self) -> Result<Channel>;
}

/// [`ConnBuilder`] wrapping a plain async closure, for the common case of
/// dialing a single fixed address.
pub struct FnBuilder<F> {
    f: F,
}

type BuildFuture = Pin<Box<dyn Future<Output = Result<Channel>> + Send>>;

impl<F> FnBuilder<F>
where
    F: Fn() -> BuildFuture + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ConnBuilder for FnBuilder<F>
where
    F: Fn() -> BuildFuture + Send + Sync + 'static,
{
    async fn build(&self) -> Result<Channel> {
        (self.f)().await
    }
}

/// Builds a [`ConnBuilder`] that lazily connects to a single `host:port`
/// address using `tonic`'s default transport settings.
pub fn single_endpoint_builder(uri: String) -> FnBuilder<impl Fn() -> BuildFuture + Send + Sync + 'static> {
    FnBuilder::new(move || {
        let uri = uri.clone();
        Box::pin(async move {
            let endpoint = TonicEndpoint::from_shared(uri)
                .map_err(|e| Error::InvalidEndpoint(e.to_string()))?;
            Ok(endpoint.connect().await?)
        }) as BuildFuture
    })
}

/// The six tuning dimensions of spec §4.4's table, with its defaults.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_idle: u32,
    pub max_active: usize,
    pub max_streams_per_conn: u32,
    pub max_conn_idle: Duration,
    pub max_wait_conn_time: Duration,
    pub cycle_monitor_ticker: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: DEFAULT_MAX_IDLE,
            max_active: DEFAULT_MAX_ACTIVE,
            max_streams_per_conn: DEFAULT_MAX_STREAMS_PER_CONN,
            max_conn_idle: DEFAULT_MAX_CONN_IDLE,
            max_wait_conn_time: DEFAULT_MAX_WAIT_CONN_TIME,
            cycle_monitor_ticker: DEFAULT_CYCLE_MONITOR_TICKER,
        }
    }
}

/// Builder for [`ConnectionPool`], mirroring the Go source's functional
/// options (`WithMaxIdle`, `WithMaxActive`, ...).
#[derive(Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
        }
    }

    pub fn max_idle(mut self, n: u32) -> Self {
        self.config.max_idle = n;
        self
    }

    pub fn max_active(mut self, n: usize) -> Self {
        self.config.max_active = n;
        self
    }

    pub fn max_streams_per_conn(mut self, n: u32) -> Self {
        self.config.max_streams_per_conn = n;
        self
    }

    pub fn max_conn_idle(mut self, d: Duration) -> Self {
        self.config.max_conn_idle = d;
        self
    }

    pub fn max_wait_conn_time(mut self, d: Duration) -> Self {
        self.config.max_wait_conn_time = d;
        self
    }

    pub fn cycle_monitor_ticker(mut self, d: Duration) -> Self {
        self.config.cycle_monitor_ticker = d;
        self
    }

    pub fn build(self) -> PoolConfig {
        self.config
    }
}

/// A bounded pool of multiplexed connections to one target service.
///
/// The pool itself holds no mutable connection state — that all lives in
/// the holder task spawned by [`ConnectionPool::new`]; this handle is just
/// the two channels used to talk to it (spec §4.4's "single-threaded event
/// loop").
pub struct ConnectionPool {
    msg_tx: mpsc::Sender<HolderMsg>,
    restore_tx: mpsc::Sender<RestoreMsg>,
}

impl ConnectionPool {
    pub fn new(builder: Arc<dyn ConnBuilder>, config: PoolConfig) -> Arc<Self> {
        let (msg_tx, msg_rx) = mpsc::channel(DEFAULT_CHANNEL_CAP);
        let (restore_tx, restore_rx) = mpsc::channel(DEFAULT_CHANNEL_CAP);
        tokio::spawn(holder::run(config, builder, msg_rx, restore_rx));
        Arc::new(Self { msg_tx, restore_tx })
    }

    /// Acquires a multiplexed handle, blocking until one is available or
    /// the pool closes.
    pub async fn acquire(&self) -> Result<PoolHandle> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.msg_tx
            .send(HolderMsg::Get(reply_tx))
            .await
            .map_err(|_| Error::PoolClosed)?;
        let (id, channel) = reply_rx.await.map_err(|_| Error::PoolClosed)??;
        Ok(PoolHandle::new(id, channel, self.restore_tx.clone()))
    }

    /// Signals the holder to drain and close every connection. Outstanding
    /// handles may still be released afterward; the restore channel simply
    /// has no reader left to act on it.
    pub async fn close(&self) {
        let _ = self.msg_tx.send(HolderMsg::Close).await;
    }

    /// A snapshot of the holder's connection bookkeeping, for verifying
    /// spec §8's steady-state invariants from outside the holder task.
    pub async fn stats(&self) -> Result<PoolStats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.msg_tx
            .send(HolderMsg::Stats(reply_tx))
            .await
            .map_err(|_| Error::PoolClosed)?;
        reply_rx.await.map_err(|_| Error::PoolClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBuilder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConnBuilder for CountingBuilder {
        async fn build(&self) -> Result<Channel> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // A channel to an address nothing listens on yet connects
            // lazily in tonic — `connect_lazy` never touches the network,
            // matching the holder's need for an immediately-usable handle.
            let endpoint = TonicEndpoint::from_static("http://127.0.0.1:0");
            Ok(endpoint.connect_lazy())
        }
    }

    fn config(max_idle: u32, max_active: usize, max_streams: u32, max_wait: Duration) -> PoolConfig {
        PoolConfigBuilder::new()
            .max_idle(max_idle)
            .max_active(max_active)
            .max_streams_per_conn(max_streams)
            .max_wait_conn_time(max_wait)
            .cycle_monitor_ticker(Duration::from_secs(3600))
            .build()
    }

    #[tokio::test]
    async fn acquire_reuses_connections_within_stream_cap() {
        let builder = Arc::new(CountingBuilder { calls: AtomicUsize::new(0) });
        let pool = ConnectionPool::new(builder.clone(), config(1, 4, 1000, Duration::from_millis(5)));
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(builder.calls.load(Ordering::SeqCst), 1);
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn acquire_blocks_then_succeeds_after_release() {
        let builder = Arc::new(CountingBuilder { calls: AtomicUsize::new(0) });
        let pool = ConnectionPool::new(
            builder,
            config(1, 2, 1, Duration::from_millis(10)),
        );
        let first = pool.acquire().await.unwrap();
        let _second = pool.acquire().await.unwrap();

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);

        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn acquire_after_close_returns_pool_closed() {
        let builder = Arc::new(CountingBuilder { calls: AtomicUsize::new(0) });
        let pool = ConnectionPool::new(builder, config(0, 2, 1000, Duration::from_millis(5)));
        pool.close().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = pool.acquire().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn idle_reclamation_shrinks_back_to_max_idle() {
        let builder = Arc::new(CountingBuilder { calls: AtomicUsize::new(0) });
        let mut cfg = config(1, 10, 1, Duration::from_millis(5));
        cfg.max_conn_idle = Duration::from_millis(30);
        cfg.cycle_monitor_ticker = Duration::from_millis(20);
        let pool = ConnectionPool::new(builder, cfg);

        // Acquire 5 concurrently-held handles, pushing current_conns above
        // max_idle, then release them all.
        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(pool.acquire().await.unwrap());
        }
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.current_conns, 5);
        drop(handles);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.current_conns, 1);
        assert_eq!(stats.available + stats.full, stats.current_conns);
    }

    #[tokio::test]
    async fn stats_invariant_holds_at_stream_cap() {
        let builder = Arc::new(CountingBuilder { calls: AtomicUsize::new(0) });
        let pool = ConnectionPool::new(builder, config(1, 4, 1, Duration::from_millis(5)));
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let stats = pool.stats().await.unwrap();
        assert_eq!(stats.current_conns, 2);
        assert_eq!(stats.available + stats.full, stats.current_conns);
        assert!(stats.current_conns <= 4);
        drop(a);
        drop(b);
    }
}
