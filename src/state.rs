//! Per-connection bookkeeping owned by the client task.

use crate::error::Result;
use crate::protocol::CommandKind;
use crate::queue::{Admission, CommandQueue, QueueEntry, QueueItem};

/// Result of recording a failed write or connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Keep the head queued and try again; `attempt` failures so far.
    WithinRetry { attempt: u32 },
    /// Ceiling reached: the head was dropped and the counter reset.
    Exhausted { dropped: Option<QueueItem> },
}

#[derive(Debug)]
pub struct LinkState {
    queue: CommandQueue<QueueItem>,
    seqno: u32,
    outstanding_heartbeats: u32,
    heartbeat_limit: u32,
    retries: u32,
    max_retries: u32,
    awaiting_reply: bool,
}

impl LinkState {
    pub fn new(queue_capacity: usize, heartbeat_limit: u32, max_retries: u32) -> Self {
        Self {
            queue: CommandQueue::new(queue_capacity),
            seqno: 1,
            outstanding_heartbeats: 0,
            heartbeat_limit,
            retries: 0,
            max_retries: max_retries.max(1),
            awaiting_reply: false,
        }
    }

    /// Fresh connection: sequence restarts, nothing is in flight.
    pub fn on_connected(&mut self) {
        self.seqno = 1;
        self.outstanding_heartbeats = 0;
        self.awaiting_reply = false;
    }

    pub fn on_disconnected(&mut self) {
        self.awaiting_reply = false;
    }

    pub fn next_seqno(&mut self) -> u32 {
        let current = self.seqno;
        self.seqno = self.seqno.wrapping_add(1);
        current
    }

    pub fn seqno_mut(&mut self) -> &mut u32 {
        &mut self.seqno
    }

    /// Queue an item, keeping the in-flight head out of conflict eviction.
    pub fn offer(&mut self, item: QueueItem) -> Result<Admission> {
        let heartbeat = item.is_heartbeat();
        let admission = if self.awaiting_reply {
            self.queue.enqueue_with_pinned_head(item)?
        } else {
            self.queue.enqueue(item)?
        };

        match admission {
            Admission::HeartbeatDropped => self.outstanding_heartbeats = self.heartbeat_limit,
            Admission::Queued { .. } if heartbeat => self.outstanding_heartbeats += 1,
            Admission::Queued { .. } => {}
        }
        Ok(admission)
    }

    /// Head of the queue if it may be written now.
    pub fn writable_head(&self) -> Option<&QueueItem> {
        if self.awaiting_reply {
            return None;
        }
        self.queue.peek_head()
    }

    pub fn mark_written(&mut self) {
        self.awaiting_reply = true;
    }

    pub fn awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }

    /// A frame arrived. Completes the in-flight command, if any.
    pub fn on_frame_received(&mut self, cmd: CommandKind) -> Option<QueueItem> {
        if cmd == CommandKind::HeartBeat {
            self.outstanding_heartbeats = self.outstanding_heartbeats.saturating_sub(1);
        }
        self.retries = 0;
        if !self.awaiting_reply {
            return None;
        }
        self.awaiting_reply = false;
        self.queue.pop_head()
    }

    /// An undecodable frame still answers whatever was in flight.
    pub fn on_undecodable_frame(&mut self) -> Option<QueueItem> {
        if !self.awaiting_reply {
            return None;
        }
        self.awaiting_reply = false;
        self.queue.pop_head()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queued(&self) -> impl Iterator<Item = &QueueItem> {
        self.queue.iter()
    }

    pub fn heartbeat_overdue(&self) -> bool {
        self.outstanding_heartbeats >= self.heartbeat_limit
    }

    pub fn outstanding_heartbeats(&self) -> u32 {
        self.outstanding_heartbeats
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn register_failure(&mut self) -> RetryDecision {
        self.retries += 1;
        if self.retries < self.max_retries {
            return RetryDecision::WithinRetry {
                attempt: self.retries,
            };
        }
        self.retries = 0;
        self.awaiting_reply = false;
        RetryDecision::Exhausted {
            dropped: self.queue.pop_head(),
        }
    }
}
