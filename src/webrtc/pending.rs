//! Pending produce requests
//!
//! The server answers `produce` requests on a transport in the order they
//! were sent, so the oldest outstanding request owns the next
//! `produceResult`.

use crate::engine::{Completion, EngineError, MediaKind};
use std::collections::VecDeque;

/// One outstanding `produce` request
#[derive(Debug)]
pub struct PendingProduce {
    pub kind: MediaKind,
    pub reply: Completion<String>,
}

/// FIFO of produce completions awaiting `produceResult`
#[derive(Debug, Default)]
pub struct PendingProduceQueue {
    queue: VecDeque<PendingProduce>,
}

impl PendingProduceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: MediaKind, reply: Completion<String>) {
        self.queue.push_back(PendingProduce { kind, reply });
    }

    /// Take back the most recent request, used when its send failed
    pub fn pop_latest(&mut self) -> Option<PendingProduce> {
        self.queue.pop_back()
    }

    /// Resolve the oldest request with a server producer id
    pub fn resolve_oldest(&mut self, producer_id: String) -> Option<MediaKind> {
        let pending = self.queue.pop_front()?;
        let kind = pending.kind;
        pending.reply.succeed(producer_id);
        Some(kind)
    }

    /// Fail the oldest request if it is for `kind`
    pub fn reject_oldest_of(&mut self, kind: MediaKind, error: EngineError) -> bool {
        match self.queue.front() {
            Some(front) if front.kind == kind => {}
            _ => return false,
        }
        if let Some(pending) = self.queue.pop_front() {
            pending.reply.fail(error);
        }
        true
    }

    /// Resolve every outstanding request with an empty id so nothing waits forever
    pub fn flush(&mut self) -> usize {
        let count = self.queue.len();
        for pending in self.queue.drain(..) {
            pending.reply.succeed(String::new());
        }
        count
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
