//! Typed message transport ("via") between the parent and pool members.
//!
//! Three bounded lanes, one per frame type: Call (parent → pool, consumed by
//! exactly one member), Running (member → parent pick-up ack) and Return
//! (member → parent result). Frames are serializable tuples so the in-process
//! channel backend can be swapped for an out-of-process transport without
//! touching the mediator. Delivery is FIFO per lane with no cross-lane
//! ordering; saturation on put is retried with exponential backoff and
//! jitter up to the configured retry budget.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::mediator::CallStatus;

/// Base backoff delay applied to the first re-send attempt.
pub const BACKOFF_BASE_MS: u64 = 100;

/// Upper bound on a single backoff delay.
pub const BACKOFF_CAP_MS: u64 = 5_000;

/// Poll granularity of blocking gets, so members notice release promptly.
const BLOCKING_POLL: Duration = Duration::from_millis(50);

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// Parent → pool: a call to execute.
    Call,
    /// Member → parent: pick-up acknowledgement.
    Running,
    /// Member → parent: result.
    Return,
}

/// A message on the transport: `(type, call id, payload)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Work for exactly one member.
    Call {
        /// Call id, unique per mediator.
        id: u64,
        /// Worker method name.
        method: String,
        /// Serialized arguments.
        args: Vec<Value>,
        /// Transport re-send count so far.
        retries: u32,
        /// Epoch seconds when the call was queued.
        queued_at: f64,
    },
    /// A member picked the call up.
    Running {
        /// Call id.
        id: u64,
        /// Index of the executing member.
        member: usize,
        /// Epoch seconds at pick-up.
        started_at: f64,
    },
    /// A member finished the call.
    Return {
        /// Call id.
        id: u64,
        /// Terminal status carried back: Returned or Uncaught.
        status: CallStatus,
        /// Result on success, error description on Uncaught.
        value: Value,
        /// Epoch seconds when the result was published.
        returned_at: f64,
    },
}

impl Frame {
    /// The frame's type tag.
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Call { .. } => FrameKind::Call,
            Self::Running { .. } => FrameKind::Running,
            Self::Return { .. } => FrameKind::Return,
        }
    }

    /// The call id this frame belongs to.
    #[must_use]
    pub fn id(&self) -> u64 {
        match self {
            Self::Call { id, .. } | Self::Running { id, .. } | Self::Return { id, .. } => *id,
        }
    }

    /// Serialized payload size in bytes.
    #[must_use]
    pub fn wire_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// Transport state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViaState {
    /// Frames currently queued across all lanes.
    pub messages: usize,
    /// Bytes of queued payload.
    pub memory_allocation: usize,
    /// Transient put failures observed so far.
    pub error_count: u64,
}

#[derive(Clone)]
struct Lane {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
}

impl Lane {
    fn new(depth: usize) -> Self {
        let (tx, rx) = bounded(depth);
        Self { tx, rx }
    }
}

/// The typed queue primitive shared by a mediator and its members.
#[derive(Clone)]
pub struct Via {
    call: Lane,
    running: Lane,
    ret: Lane,
    cancelled: Arc<Mutex<HashSet<u64>>>,
    memory: Arc<AtomicUsize>,
    errors: Arc<AtomicU64>,
    retries: Arc<AtomicU32>,
    released: Arc<AtomicBool>,
}

impl Via {
    /// Create a transport with the given per-lane depth and retry budget.
    #[must_use]
    pub fn new(depth: usize, retries: u32) -> Self {
        Self {
            call: Lane::new(depth),
            running: Lane::new(depth),
            ret: Lane::new(depth),
            cancelled: Arc::new(Mutex::new(HashSet::new())),
            memory: Arc::new(AtomicUsize::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            retries: Arc::new(AtomicU32::new(retries)),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lane(&self, kind: FrameKind) -> &Lane {
        match kind {
            FrameKind::Call => &self.call,
            FrameKind::Running => &self.running,
            FrameKind::Return => &self.ret,
        }
    }

    /// Enqueue a frame on its lane. A full lane is retried with
    /// exponential backoff up to the retry budget; Call frames have their
    /// `retries` field incremented on each re-send.
    ///
    /// Returns the number of re-send attempts that were needed.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the transport is released, the lane
    /// is disconnected, or the retry budget is exhausted.
    pub fn put(&self, mut frame: Frame) -> Result<u32> {
        if self.is_released() {
            return Err(Error::transport("transport has been released"));
        }
        let size = frame.wire_size();
        let budget = self.retries.load(Ordering::Acquire);
        let mut attempt: u32 = 0;
        loop {
            match self.lane(frame.kind()).tx.try_send(frame) {
                Ok(()) => {
                    self.memory.fetch_add(size, Ordering::AcqRel);
                    return Ok(attempt);
                }
                Err(TrySendError::Full(returned)) => {
                    self.errors.fetch_add(1, Ordering::AcqRel);
                    if attempt >= budget {
                        return Err(Error::transport_full(format!(
                            "lane {:?} still full after {attempt} retries",
                            returned.kind()
                        )));
                    }
                    frame = returned;
                    if let Frame::Call { retries, .. } = &mut frame {
                        *retries += 1;
                    }
                    attempt += 1;
                    std::thread::sleep(Self::backoff(attempt));
                }
                Err(TrySendError::Disconnected(returned)) => {
                    return Err(Error::transport(format!(
                        "lane {:?} is disconnected",
                        returned.kind()
                    )));
                }
            }
        }
    }

    /// Dequeue the next frame of the given type. Non-blocking gets return
    /// `None` on an empty lane; blocking gets poll until a frame arrives or
    /// the transport is released (then `None`, the member-exit signal).
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` keeps the signature stable for
    /// fallible transport backends.
    pub fn get(&self, kind: FrameKind, blocking: bool) -> Result<Option<Frame>> {
        let lane = self.lane(kind);
        if blocking {
            loop {
                if self.is_released() {
                    return Ok(None);
                }
                match lane.rx.recv_timeout(BLOCKING_POLL) {
                    Ok(frame) => {
                        self.credit_memory(frame.wire_size());
                        return Ok(Some(frame));
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return Ok(None),
                }
            }
        } else {
            match lane.rx.try_recv() {
                Ok(frame) => {
                    self.credit_memory(frame.wire_size());
                    Ok(Some(frame))
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => Ok(None),
            }
        }
    }

    fn credit_memory(&self, size: usize) {
        let _ = self
            .memory
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |m| {
                Some(m.saturating_sub(size))
            });
    }

    /// Snapshot of queue depth, payload bytes and transient error count.
    #[must_use]
    pub fn state(&self) -> ViaState {
        ViaState {
            messages: self.call.rx.len() + self.running.rx.len() + self.ret.rx.len(),
            memory_allocation: self.memory.load(Ordering::Acquire),
            error_count: self.errors.load(Ordering::Acquire),
        }
    }

    /// Mark a call id as dropped. Members skip dropped ids at pick-up.
    pub fn drop_call(&self, id: u64) {
        self.cancelled.lock().insert(id);
    }

    /// Consume a pending cancellation for `id`, returning whether one was
    /// registered.
    #[must_use]
    pub fn consume_cancel(&self, id: u64) -> bool {
        self.cancelled.lock().remove(&id)
    }

    /// Drain every lane and forget all cancellations.
    pub fn purge(&self) {
        for kind in [FrameKind::Call, FrameKind::Running, FrameKind::Return] {
            while self.lane(kind).rx.try_recv().is_ok() {}
        }
        self.cancelled.lock().clear();
        self.memory.store(0, Ordering::Release);
        debug!("transport purged");
    }

    /// Release the transport: pending blocking gets return `None` and
    /// subsequent puts fail.
    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
    }

    /// Whether the transport has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Replace the retry budget applied by [`put`](Self::put).
    pub fn set_retries(&self, retries: u32) {
        self.retries.store(retries, Ordering::Release);
    }

    /// Backoff delay before re-send `attempt` (1-based): exponential from
    /// [`BACKOFF_BASE_MS`], capped at [`BACKOFF_CAP_MS`], with jitter over
    /// the upper half of the window.
    #[must_use]
    pub fn backoff(attempt: u32) -> Duration {
        let exp = BACKOFF_BASE_MS
            .saturating_mul(1_u64 << attempt.min(12))
            .min(BACKOFF_CAP_MS);
        Duration::from_millis(exp / 2 + fastrand::u64(0..=exp / 2))
    }
}
