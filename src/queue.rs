//! Bounded outbound command queue with conflict replacement.
//!
//! A newly enqueued item evicts every pending item it conflicts with, so only
//! the most recent of a conflicting group is ever sent. Non-conflicting items
//! keep FIFO order.

use crate::error::{Result, TuyaError};
use crate::protocol::CommandKind;
use std::collections::VecDeque;

pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Anything the queue can hold.
pub trait QueueEntry {
    /// True if `self` makes a pending `other` pointless to send.
    fn conflicts_with(&self, other: &Self) -> bool;

    fn is_heartbeat(&self) -> bool {
        false
    }
}

/// Outcome of an accepted `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Stored at the tail after evicting `replaced` conflicting entries.
    Queued { replaced: usize },
    /// Heartbeat skipped because the queue is more than half full.
    HeartbeatDropped,
}

#[derive(Debug)]
pub struct CommandQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: QueueEntry> CommandQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn enqueue(&mut self, item: T) -> Result<Admission> {
        self.admit(item, false)
    }

    /// Like [`enqueue`](Self::enqueue), but the head is never evicted.
    ///
    /// Used while the head has been written and its reply is pending.
    pub fn enqueue_with_pinned_head(&mut self, item: T) -> Result<Admission> {
        self.admit(item, true)
    }

    fn admit(&mut self, item: T, pin_head: bool) -> Result<Admission> {
        if item.is_heartbeat() && self.items.len() * 2 > self.capacity {
            return Ok(Admission::HeartbeatDropped);
        }

        let skip = usize::from(pin_head && !self.items.is_empty());
        let replaced = self
            .items
            .iter()
            .skip(skip)
            .filter(|queued| item.conflicts_with(queued))
            .count();
        if self.items.len() - replaced >= self.capacity {
            return Err(TuyaError::QueueOverflow);
        }

        if replaced > 0 {
            let mut index = 0;
            self.items.retain(|queued| {
                let keep = index < skip || !item.conflicts_with(queued);
                index += 1;
                keep
            });
        }
        self.items.push_back(item);
        Ok(Admission::Queued { replaced })
    }

    pub fn peek_head(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn pop_head(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: QueueEntry> Default for CommandQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// An application command waiting to be framed and written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub command: CommandKind,
    pub payload: Vec<u8>,
    /// Items with the same command and the same key replace each other.
    pub conflict_key: Option<String>,
}

impl QueueItem {
    pub fn new<P: Into<Vec<u8>>>(command: CommandKind, payload: P) -> Self {
        Self {
            command,
            payload: payload.into(),
            conflict_key: None,
        }
    }

    pub fn with_conflict_key<K: Into<String>>(mut self, key: K) -> Self {
        self.conflict_key = Some(key.into());
        self
    }
}

impl QueueEntry for QueueItem {
    fn conflicts_with(&self, other: &Self) -> bool {
        if self.is_heartbeat() && other.is_heartbeat() {
            return true;
        }
        self.command == other.command
            && self.conflict_key.is_some()
            && self.conflict_key == other.conflict_key
    }

    fn is_heartbeat(&self) -> bool {
        self.command == CommandKind::HeartBeat
    }
}
