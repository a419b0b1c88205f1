//! The holder: a single task owning all mutable pool state. Direct port of
//! `grpc_pool/pool.go`'s `Hold` loop, adapted so a slow dial or a bounded
//! wait for capacity never stalls the processing of `Restore`/ticker events
//! (see the fairness note below and DESIGN.md).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tonic::transport::Channel;
use tracing::{debug, warn};

use super::conn::PooledConn;
use super::stack::Stack;
use super::{ConnBuilder, PoolConfig};
use crate::Error;

pub(super) struct RestoreMsg {
    pub(super) id: u64,
}

pub(super) enum HolderMsg {
    Get(oneshot::Sender<crate::Result<(u64, Channel)>>),
    Stats(oneshot::Sender<PoolStats>),
    Close,
}

/// A snapshot of the holder's state, for verifying spec §8's invariants
/// (`available + full == current_conns`, `current_conns <= max_active`)
/// from outside the holder task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub current_conns: usize,
    pub available: usize,
    pub full: usize,
}

struct Waiter {
    reply: oneshot::Sender<crate::Result<(u64, Channel)>>,
    deadline: Instant,
}

struct BuildOutcome {
    result: crate::Result<Channel>,
}

struct State {
    stack: Stack,
    storage: HashMap<u64, PooledConn>,
    to_recycle: HashMap<u64, Instant>,
    waiters: VecDeque<Waiter>,
    current_conn: usize,
}

impl State {
    /// One pass of the GET phase (spec §4.4 steps 1,4,5,6 — step 2/3's
    /// build-or-wait branch is handled by the caller, since both require
    /// suspending past this synchronous pass).
    ///
    /// The Go source also checks `conn.GetState() == Shutdown` here and
    /// discards/closes a dead connection before handing it out (see
    /// DESIGN.md's pool entry for why that check has no equivalent here:
    /// `tonic::transport::Channel` exposes no connectivity-state
    /// introspection, only `tower::Service::poll_ready`, which needs a
    /// task context this synchronous pass doesn't have). A channel that's
    /// gone bad surfaces as an RPC error to the caller instead of being
    /// caught here; `max_conn_idle` recycling bounds how long it lingers.
    fn try_acquire(&mut self, max_streams_per_conn: u32) -> Option<(u64, Channel)> {
        loop {
            let id = self.stack.peek()?.id;
            self.to_recycle.remove(&id);
            let conn = self.stack.find_mut(id).expect("just peeked");
            if conn.streams + 1 <= max_streams_per_conn {
                conn.streams += 1;
                let channel = conn.channel.clone();
                return Some((id, channel));
            }
            // Full: detach into the side-table and look at the next one.
            let full = self.stack.pop().expect("just peeked");
            self.storage.insert(full.id, full);
        }
    }

    fn drain_waiters(&mut self, max_streams_per_conn: u32) {
        while !self.waiters.is_empty() {
            match self.try_acquire(max_streams_per_conn) {
                Some(parts) => {
                    let waiter = self.waiters.pop_front().expect("checked non-empty");
                    let _ = waiter.reply.send(Ok(parts));
                }
                None => break,
            }
        }
    }
}

pub(super) async fn run(
    config: PoolConfig,
    builder: Arc<dyn ConnBuilder>,
    mut msg_rx: mpsc::Receiver<HolderMsg>,
    mut restore_rx: mpsc::Receiver<RestoreMsg>,
) {
    let mut state = State {
        stack: Stack::new(),
        storage: HashMap::new(),
        to_recycle: HashMap::new(),
        waiters: VecDeque::new(),
        current_conn: 0,
    };

    for _ in 0..config.max_idle {
        match builder.build().await {
            Ok(channel) => {
                state.stack.push(PooledConn::new(channel));
                state.current_conn += 1;
            }
            Err(err) => {
                warn!(component = "pool", event = "prewarm_dial_failed", error = %err);
            }
        }
    }

    let (build_tx, mut build_rx) = mpsc::channel::<BuildOutcome>(config.max_active.max(1));
    let mut ticker = tokio::time::interval(config.cycle_monitor_ticker);
    ticker.tick().await; // first tick fires immediately; discard it

    loop {
        let next_wake = state
            .waiters
            .front()
            .map(|w| w.deadline)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            _ = ticker.tick() => {
                reclaim_idle(&mut state, &config);
            }
            msg = msg_rx.recv() => match msg {
                Some(HolderMsg::Get(reply)) => {
                    handle_get(&mut state, &config, &builder, &build_tx, reply);
                }
                Some(HolderMsg::Stats(reply)) => {
                    let _ = reply.send(PoolStats {
                        current_conns: state.current_conn,
                        available: state.stack.len(),
                        full: state.storage.len(),
                    });
                }
                Some(HolderMsg::Close) | None => {
                    shutdown(&mut state);
                    return;
                }
            },
            restored = restore_rx.recv() => {
                if let Some(msg) = restored {
                    handle_restore(&mut state, &config, msg);
                }
            }
            outcome = build_rx.recv() => {
                if let Some(outcome) = outcome {
                    handle_build_done(&mut state, &config, outcome);
                }
            }
            _ = tokio::time::sleep_until(next_wake.into()) => {
                expire_waiters(&mut state);
            }
        }
    }
}

fn handle_get(
    state: &mut State,
    config: &PoolConfig,
    builder: &Arc<dyn ConnBuilder>,
    build_tx: &mpsc::Sender<BuildOutcome>,
    reply: oneshot::Sender<crate::Result<(u64, Channel)>>,
) {
    if let Some(parts) = state.try_acquire(config.max_streams_per_conn) {
        let _ = reply.send(Ok(parts));
        return;
    }

    if state.current_conn < config.max_active {
        state.current_conn += 1;
        let builder = builder.clone();
        let build_tx = build_tx.clone();
        tokio::spawn(async move {
            let result = builder.build().await;
            let _ = build_tx.send(BuildOutcome { result }).await;
        });
    }

    // 5 retries at `maxWaitConnTime` each (spec §4.4 step 3), collapsed into
    // one bounded wait so the holder keeps servicing Restore/BuildDone
    // events instead of blocking on a sleep the way the Go source's select
    // arm does — otherwise the very Release a waiter needs could never be
    // observed while the holder slept (see DESIGN.md).
    let total_wait = config.max_wait_conn_time * 5;
    state.waiters.push_back(Waiter {
        reply,
        deadline: Instant::now() + total_wait,
    });
}

fn handle_restore(state: &mut State, config: &PoolConfig, msg: RestoreMsg) {
    if let Some(mut full) = state.storage.remove(&msg.id) {
        full.streams = full.streams.saturating_sub(1);
        full.returned_at = Instant::now();
        let (id, streams, returned_at) = (full.id, full.streams, full.returned_at);
        state.stack.push(full);
        // A connection coming back from the full table is just as idle as
        // one that never left the stack; candidacy must not depend on
        // which table it happened to be in (spec §4.4's reclaim invariant).
        if streams == 0 && state.current_conn > config.max_idle {
            state.to_recycle.insert(id, returned_at);
        }
    } else if let Some(conn) = state.stack.find_mut(msg.id) {
        conn.streams = conn.streams.saturating_sub(1);
        conn.returned_at = Instant::now();
        if conn.streams == 0 && state.current_conn > config.max_idle {
            state.to_recycle.insert(msg.id, conn.returned_at);
        }
    } else {
        debug!(component = "pool", event = "restore_unknown_conn", id = msg.id);
        return;
    }
    state.drain_waiters(config.max_streams_per_conn);
}

fn handle_build_done(state: &mut State, config: &PoolConfig, outcome: BuildOutcome) {
    match outcome.result {
        Ok(channel) => {
            state.stack.push(PooledConn::new(channel));
            state.drain_waiters(config.max_streams_per_conn);
        }
        Err(err) => {
            state.current_conn = state.current_conn.saturating_sub(1);
            warn!(component = "pool", event = "dial_failed", error = %err);
        }
    }
}

fn reclaim_idle(state: &mut State, config: &PoolConfig) {
    let now = Instant::now();
    let expired: Vec<u64> = state
        .to_recycle
        .iter()
        .filter(|(_, ts)| now.duration_since(**ts) > config.max_conn_idle)
        .map(|(id, _)| *id)
        .collect();
    for id in expired {
        if state.current_conn > config.max_idle {
            if state.stack.remove(id).is_some() {
                state.current_conn -= 1;
            }
            state.to_recycle.remove(&id);
        }
    }
}

fn expire_waiters(state: &mut State) {
    let now = Instant::now();
    while let Some(front) = state.waiters.front() {
        if front.deadline > now {
            break;
        }
        let waiter = state.waiters.pop_front().expect("front just checked");
        let _ = waiter.reply.send(Err(Error::PoolExhausted));
    }
}

fn shutdown(state: &mut State) {
    for conn in state.storage.drain().map(|(_, c)| c) {
        drop(conn);
    }
    for conn in state.stack.drain() {
        drop(conn);
    }
    while let Some(waiter) = state.waiters.pop_front() {
        let _ = waiter.reply.send(Err(Error::PoolClosed));
    }
}
