//! LIFO store of idle connections. Direct port of `grpc_pool/stack.go`;
//! only ever touched by the holder task (spec §4.4 "single-writer").

use super::conn::PooledConn;

#[derive(Default)]
pub(super) struct Stack {
    values: Vec<PooledConn>,
}

impl Stack {
    pub(super) fn new() -> Self {
        Self { values: Vec::new() }
    }

    pub(super) fn peek(&self) -> Option<&PooledConn> {
        self.values.last()
    }

    pub(super) fn push(&mut self, conn: PooledConn) {
        self.values.push(conn);
    }

    pub(super) fn pop(&mut self) -> Option<PooledConn> {
        self.values.pop()
    }

    pub(super) fn remove(&mut self, id: u64) -> Option<PooledConn> {
        let idx = self.values.iter().position(|c| c.id == id)?;
        Some(self.values.remove(idx))
    }

    pub(super) fn find_mut(&mut self, id: u64) -> Option<&mut PooledConn> {
        self.values.iter_mut().find(|c| c.id == id)
    }

    pub(super) fn drain(&mut self) -> std::vec::Drain<'_, PooledConn> {
        self.values.drain(..)
    }

    pub(super) fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(super) fn len(&self) -> usize {
        self.values.len()
    }
}
