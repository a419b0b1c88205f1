//! A single physical connection tracked by the pool.
//!
//! Splits the Go source's `rpcConn` (which closes over its own `Pool` to
//! implement `Close`) into a plain data record owned by the holder
//! (`PooledConn`) and a caller-facing release handle (`PoolHandle`) that
//! carries no reference back into `ConnectionPool` itself — only a channel
//! sender, breaking the cyclic pool↔connection reference (spec §9).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::mpsc;
use tonic::transport::Channel;

use super::holder::RestoreMsg;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub(super) struct PooledConn {
    pub(super) id: u64,
    pub(super) channel: Channel,
    pub(super) streams: u32,
    pub(super) returned_at: Instant,
}

impl PooledConn {
    pub(super) fn new(channel: Channel) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            channel,
            streams: 0,
            returned_at: Instant::now(),
        }
    }
}

/// A single-flight handle to a pooled, multiplexed connection.
///
/// Dropping it without calling [`PoolHandle::release`] still returns the
/// connection to the pool (the `Drop` impl sends the same restore message),
/// so callers that simply let the handle go out of scope behave correctly.
pub struct PoolHandle {
    id: u64,
    channel: Option<Channel>,
    restore_tx: mpsc::Sender<RestoreMsg>,
}

impl PoolHandle {
    pub(super) fn new(id: u64, channel: Channel, restore_tx: mpsc::Sender<RestoreMsg>) -> Self {
        Self {
            id,
            channel: Some(channel),
            restore_tx,
        }
    }

    /// The underlying multiplexed transport. Clone it to issue RPCs; the
    /// pool counts this handle, not individual clones, against
    /// `maxStreamsPerConn`.
    pub fn channel(&self) -> &Channel {
        self.channel.as_ref().expect("channel taken only on drop")
    }

    /// Explicitly returns the connection to the pool. Equivalent to letting
    /// the handle drop, spelled out for call sites that want it visible.
    pub fn release(mut self) {
        self.send_restore();
    }

    /// Delivers the restore message with a guaranteed (non-lossy) send —
    /// the Go source's `Restore` is a plain blocking channel send on a
    /// bounded channel, which never silently drops under backpressure the
    /// way a `try_send` would. `Drop` can't `.await`, so the send is done
    /// on a spawned task instead of blocking the dropping thread; the only
    /// way it doesn't land is the holder having already shut down, in
    /// which case there's nothing left to restore to anyway.
    fn send_restore(&mut self) {
        if let Some(_channel) = self.channel.take() {
            let id = self.id;
            let restore_tx = self.restore_tx.clone();
            tokio::spawn(async move {
                let _ = restore_tx.send(RestoreMsg { id }).await;
            });
        }
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        self.send_restore();
    }
}
