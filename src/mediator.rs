//! Worker mediator: asynchronous, pool-parallel method calls on a worker.
//!
//! The mediator turns `call(method, args)` into a first-class Call tracked
//! through a monotonic status lifecycle (Uncalled → Called → Running →
//! terminal), executed by a pool of members that each own a private clone
//! of the worker object and communicate with the parent only through the
//! typed transport. The parent side drains acknowledgement and result
//! frames once per loop iteration, sweeps timeouts, applies backpressure,
//! garbage-collects terminal calls after a grace period, and supervises the
//! pool (a member lost mid-call surfaces that call as a timeout-class
//! failure and is replaced).
//!
//! Handles are cheap clones over shared state, so the user routine and the
//! lifecycle controller can both hold the same mediator: the routine issues
//! calls, the controller drives [`Mediator::tick`] after every iteration.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::clock::epoch_now;
use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::via::{Frame, FrameKind, Via, ViaState};

/// A stateful worker whose methods are invoked by pool members.
///
/// Arguments and results are serializable values, matching the transport
/// wire contract. A returned `Err` surfaces the call as Uncaught with the
/// message as its value; panics are caught and surfaced the same way.
pub trait Worker: Send + 'static {
    /// Execute `method` with `args` and produce a result.
    fn perform(&mut self, method: &str, args: &[Value]) -> std::result::Result<Value, String>;
}

/// Call lifecycle status. Statuses only ever advance; terminal statuses
/// never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallStatus {
    /// Created, not yet on the transport.
    Uncalled,
    /// Queued on the transport.
    Called,
    /// Picked up by a member.
    Running,
    /// Completed with a return value.
    Returned,
    /// Dropped before execution.
    Cancelled,
    /// Exceeded its per-method bound.
    Timeout,
    /// Failed: the worker raised, panicked, or its member died mid-call.
    Uncaught,
}

impl CallStatus {
    /// Whether this status ends the call lifecycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Returned | Self::Cancelled | Self::Timeout | Self::Uncaught
        )
    }

    fn rank(self) -> u8 {
        match self {
            Self::Uncalled => 0,
            Self::Called => 1,
            Self::Running => 2,
            Self::Returned | Self::Cancelled | Self::Timeout | Self::Uncaught => 3,
        }
    }
}

/// A tracked invocation of a worker method.
#[derive(Debug, Clone)]
pub struct Call {
    /// Monotonically increasing id, unique per mediator.
    pub id: u64,
    /// Worker method name.
    pub method: String,
    /// Serialized arguments.
    pub args: Vec<Value>,
    /// Transport re-send count.
    pub retries: u32,
    /// Errors surfaced for this call.
    pub errors: u32,
    /// Serialized payload size in bytes.
    pub size: usize,
    /// Epoch seconds when the call was queued.
    pub queued_at: f64,
    /// Epoch seconds when a member picked it up.
    pub started_at: Option<f64>,
    /// Epoch seconds when the result was published.
    pub returned_at: Option<f64>,
    /// Epoch seconds after which the terminal record may be collected.
    pub gc_at: Option<f64>,
    /// Current lifecycle status.
    pub status: CallStatus,
    /// Result value; present iff the call returned.
    pub return_value: Option<Value>,
}

impl Call {
    fn new(id: u64, method: &str, args: Vec<Value>) -> Self {
        Self {
            id,
            method: method.to_string(),
            args,
            retries: 0,
            errors: 0,
            size: 0,
            queued_at: epoch_now(),
            started_at: None,
            returned_at: None,
            gc_at: None,
            status: CallStatus::Uncalled,
            return_value: None,
        }
    }

    /// Advance the status monotonically. Returns whether the transition was
    /// applied; regressions and transitions out of a terminal status are
    /// refused, which is what makes the terminal dispatch exactly-once.
    pub(crate) fn advance(&mut self, to: CallStatus) -> bool {
        if self.status.is_terminal() || to.rank() <= self.status.rank() {
            return false;
        }
        self.status = to;
        true
    }

    /// Seconds this call has been in flight relative to `now`, measured
    /// from pick-up when acknowledged, else from queueing.
    #[must_use]
    pub fn elapsed(&self, now: f64) -> f64 {
        now - self.started_at.unwrap_or(self.queued_at)
    }
}

/// Call-lifecycle listener.
pub type CallListener = Box<dyn FnMut(&Call) + Send>;

struct Member {
    handle: Option<JoinHandle<()>>,
    spawned_at: f64,
    current_call: Option<u64>,
    stop: Arc<AtomicBool>,
}

struct MediatorInner<W> {
    worker: W,
    calls: HashMap<u64, Call>,
    members: Vec<Member>,
    timeouts: HashMap<String, f64>,
    default_timeout: f64,
    pool_size: usize,
    high_water: usize,
    low_water: usize,
    gc_grace: f64,
    next_id: u64,
    started: bool,
    shutdown: bool,
    saturated: bool,
    on_return: Vec<CallListener>,
    on_timeout: Vec<CallListener>,
}

/// Parent-side handle owning the Call table and the pool. Cheap to clone.
pub struct Mediator<W: Worker> {
    name: Arc<str>,
    via: Via,
    inner: Arc<Mutex<MediatorInner<W>>>,
}

impl<W: Worker> Clone for Mediator<W> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            via: self.via.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: Worker + Clone> Mediator<W> {
    /// Create a mediator around a worker prototype, taking pool size,
    /// timeout, retry, queue and grace defaults from the configuration.
    #[must_use]
    pub fn new(name: &str, worker: W, config: &WorkerConfig) -> Self {
        Self {
            name: Arc::from(name),
            via: Via::new(config.queue_depth, config.retries),
            inner: Arc::new(Mutex::new(MediatorInner {
                worker,
                calls: HashMap::new(),
                members: Vec::new(),
                timeouts: HashMap::new(),
                default_timeout: config.timeout_secs,
                pool_size: config.workers,
                high_water: config.high_water,
                low_water: config.low_water,
                gc_grace: config.gc_grace_secs,
                next_id: 1,
                started: false,
                shutdown: false,
                saturated: false,
                on_return: Vec::new(),
                on_timeout: Vec::new(),
            })),
        }
    }

    /// Set the pool size. Only valid before [`setup`](Self::setup).
    ///
    /// # Errors
    ///
    /// Returns a lifecycle error when the pool is already running.
    pub fn workers(&self, n: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.started {
            return Err(Error::pool_lifecycle(
                "workers",
                "pool size cannot change after setup",
            ));
        }
        inner.pool_size = n;
        Ok(())
    }

    /// Set the per-method timeout bound, in seconds.
    pub fn timeout(&self, method: &str, seconds: f64) {
        self.inner.lock().timeouts.insert(method.to_string(), seconds);
    }

    /// Set the maximum transport re-send attempts before a call is failed.
    pub fn retries(&self, n: u32) {
        self.via.set_retries(n);
    }

    /// Register a listener invoked exactly once per call that reaches
    /// Returned (or comes back Uncaught from a member).
    pub fn on_return<F: FnMut(&Call) + Send + 'static>(&self, listener: F) {
        self.inner.lock().on_return.push(Box::new(listener));
    }

    /// Register a listener invoked exactly once per call that times out,
    /// loses its member mid-call, or is orphaned by teardown.
    pub fn on_timeout<F: FnMut(&Call) + Send + 'static>(&self, listener: F) {
        self.inner.lock().on_timeout.push(Box::new(listener));
    }

    /// Spawn the pool. Idempotent; the controller also invokes this for
    /// adopted mediators during init.
    ///
    /// # Errors
    ///
    /// Returns an error when a member thread cannot be spawned.
    pub fn setup(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.started {
            return Ok(());
        }
        inner.started = true;
        for index in 0..inner.pool_size {
            let member = self.spawn_member(index, inner.worker.clone())?;
            inner.members.push(member);
        }
        info!(pool = %self.name, members = inner.pool_size, "worker pool started");
        Ok(())
    }

    /// Queue a call to `method`. The new Call starts Uncalled and reaches
    /// Called once its frame is accepted by the transport.
    ///
    /// # Errors
    ///
    /// Returns a saturation error while backpressure is active, and a
    /// transport error when the frame could not be queued within the retry
    /// budget (no Call record is kept in that case).
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return Err(Error::pool_lifecycle(method, "mediator is shut down"));
        }

        let queued = self.via.state().messages;
        if inner.saturated {
            if queued <= inner.low_water {
                inner.saturated = false;
                debug!(pool = %self.name, queued, "backpressure cleared");
            } else {
                return Err(Error::saturated(queued));
            }
        } else if queued >= inner.high_water {
            inner.saturated = true;
            warn!(pool = %self.name, queued, "backpressure engaged");
            return Err(Error::saturated(queued));
        }

        let id = inner.next_id;
        inner.next_id += 1;

        let mut call = Call::new(id, method, args.clone());
        let frame = Frame::Call {
            id,
            method: call.method.clone(),
            args,
            retries: 0,
            queued_at: call.queued_at,
        };
        call.size = frame.wire_size();
        call.retries = self.via.put(frame)?;
        call.advance(CallStatus::Called);
        inner.calls.insert(id, call);
        Ok(id)
    }

    /// Cancel a queued call. Cancellation is best-effort: a call already
    /// picked up keeps running and its result is dropped as late.
    pub fn cancel(&self, id: u64) {
        let mut inner = self.inner.lock();
        let gc_grace = inner.gc_grace;
        if let Some(call) = inner.calls.get_mut(&id) {
            if call.advance(CallStatus::Cancelled) {
                call.gc_at = Some(epoch_now() + gc_grace);
                self.via.drop_call(id);
            }
        }
    }

    /// One parent-side scheduling pass; the controller runs this after the
    /// user routine every iteration. Drains acknowledgements and results,
    /// sweeps timeouts and the GC grace window, updates the backpressure
    /// latch, and supervises the pool.
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub fn tick(&self) -> Result<()> {
        let mut returned: Vec<Call> = Vec::new();
        let mut timed_out: Vec<Call> = Vec::new();
        let mut on_return;
        let mut on_timeout;
        {
            let mut guard = self.inner.lock();
            let now = epoch_now();

            // Running acks: Call → Running, note which member holds it.
            while let Some(frame) = self.via.get(FrameKind::Running, false)? {
                let Frame::Running {
                    id,
                    member,
                    started_at,
                } = frame
                else {
                    continue;
                };
                match guard.calls.get_mut(&id) {
                    Some(call) if !call.status.is_terminal() => {
                        if call.advance(CallStatus::Running) {
                            call.started_at = Some(started_at);
                        }
                        if let Some(m) = guard.members.get_mut(member) {
                            m.current_call = Some(id);
                        }
                    }
                    _ => debug!(call = id, "dropping late or duplicate running ack"),
                }
            }

            // Results: Call → Returned/Uncaught, remember for dispatch.
            while let Some(frame) = self.via.get(FrameKind::Return, false)? {
                let Frame::Return {
                    id,
                    status,
                    value,
                    returned_at,
                } = frame
                else {
                    continue;
                };
                for m in &mut guard.members {
                    if m.current_call == Some(id) {
                        m.current_call = None;
                    }
                }
                let gc_grace = guard.gc_grace;
                match guard.calls.get_mut(&id) {
                    Some(call) if !call.status.is_terminal() => {
                        let terminal = if status == CallStatus::Uncaught {
                            CallStatus::Uncaught
                        } else {
                            CallStatus::Returned
                        };
                        if call.advance(terminal) {
                            call.returned_at = Some(returned_at);
                            call.return_value = Some(value);
                            call.gc_at = Some(returned_at + gc_grace);
                            if terminal == CallStatus::Uncaught {
                                call.errors += 1;
                            }
                            returned.push(call.clone());
                        }
                    }
                    _ => debug!(call = id, "dropping late or duplicate return"),
                }
            }

            // Timeout sweep over everything queued or running.
            {
                let MediatorInner {
                    calls,
                    members,
                    timeouts,
                    default_timeout,
                    gc_grace,
                    ..
                } = &mut *guard;
                for call in calls.values_mut() {
                    if !matches!(call.status, CallStatus::Called | CallStatus::Running) {
                        continue;
                    }
                    let bound = timeouts
                        .get(&call.method)
                        .copied()
                        .unwrap_or(*default_timeout);
                    if call.elapsed(now) <= bound {
                        continue;
                    }
                    if call.advance(CallStatus::Timeout) {
                        call.errors += 1;
                        call.gc_at = Some(now + *gc_grace);
                        self.via.drop_call(call.id);
                        timed_out.push(call.clone());
                        // Condemn the member stuck on this call and restore
                        // pool capacity with a fresh one.
                        for member in members.iter_mut() {
                            if member.current_call == Some(call.id) {
                                member.stop.store(true, Ordering::Release);
                                member.current_call = None;
                                member.handle = None;
                            }
                        }
                    }
                }
            }

            // GC terminal calls past their grace window.
            guard
                .calls
                .retain(|_, c| !(c.status.is_terminal() && c.gc_at.is_some_and(|at| at <= now)));

            // Backpressure latch.
            let queued = self.via.state().messages;
            if guard.saturated && queued <= guard.low_water {
                guard.saturated = false;
                debug!(pool = %self.name, queued, "backpressure cleared");
            } else if !guard.saturated && queued >= guard.high_water {
                guard.saturated = true;
                warn!(pool = %self.name, queued, "backpressure engaged");
            }

            // Supervision: replace members that died or were condemned. A
            // member lost mid-call surfaces that call as a timeout-class
            // failure.
            if !guard.shutdown {
                let gc_grace = guard.gc_grace;
                for index in 0..guard.members.len() {
                    let finished = match &guard.members[index].handle {
                        Some(handle) => handle.is_finished(),
                        None => true,
                    };
                    if !finished {
                        continue;
                    }
                    debug!(
                        pool = %self.name,
                        member = index,
                        lived_secs = now - guard.members[index].spawned_at,
                        "replacing pool member"
                    );
                    if let Some(call_id) = guard.members[index].current_call.take() {
                        if let Some(call) = guard.calls.get_mut(&call_id) {
                            if call.advance(CallStatus::Uncaught) {
                                call.errors += 1;
                                call.gc_at = Some(now + gc_grace);
                                error!(
                                    pool = %self.name,
                                    member = index,
                                    call = call_id,
                                    "member lost mid-call"
                                );
                                timed_out.push(call.clone());
                            }
                        }
                    }
                    match self.spawn_member(index, guard.worker.clone()) {
                        Ok(member) => guard.members[index] = member,
                        Err(e) => error!(pool = %self.name, member = index, error = %e, "respawn failed"),
                    }
                }
            }

            on_return = std::mem::take(&mut guard.on_return);
            on_timeout = std::mem::take(&mut guard.on_timeout);
        }

        // Listener dispatch happens outside the lock so listeners may call
        // back into the mediator.
        for call in &returned {
            for listener in &mut on_return {
                listener(call);
            }
        }
        for call in &timed_out {
            for listener in &mut on_timeout {
                listener(call);
            }
        }

        let mut guard = self.inner.lock();
        let added = std::mem::replace(&mut guard.on_return, on_return);
        guard.on_return.extend(added);
        let added = std::mem::replace(&mut guard.on_timeout, on_timeout);
        guard.on_timeout.extend(added);
        Ok(())
    }

    /// Stop the pool: members exit, in-flight calls become Uncaught and are
    /// surfaced to `on_timeout`, the transport is released and purged.
    /// Idempotent.
    pub fn teardown(&self) {
        let mut orphans: Vec<Call> = Vec::new();
        let mut idle_members = Vec::new();
        let mut on_timeout;
        {
            let mut guard = self.inner.lock();
            if guard.shutdown {
                return;
            }
            guard.shutdown = true;
            self.via.release();

            let now = epoch_now();
            let gc_grace = guard.gc_grace;
            for member in &mut guard.members {
                member.stop.store(true, Ordering::Release);
            }
            for mut member in guard.members.drain(..) {
                // Members stuck in a user method are detached; they exit
                // after their call, which is already surfaced as Uncaught.
                if member.current_call.is_none() {
                    if let Some(handle) = member.handle.take() {
                        idle_members.push(handle);
                    }
                }
            }
            for call in guard.calls.values_mut() {
                if call.status.is_terminal() {
                    continue;
                }
                if call.advance(CallStatus::Uncaught) {
                    call.errors += 1;
                    call.gc_at = Some(now + gc_grace);
                    orphans.push(call.clone());
                }
            }
            on_timeout = std::mem::take(&mut guard.on_timeout);
        }

        for handle in idle_members {
            let _ = handle.join();
        }
        for call in &orphans {
            for listener in &mut on_timeout {
                listener(call);
            }
        }
        self.via.purge();
        info!(pool = %self.name, "worker pool stopped");
    }

    /// Direct synchronous access to the prototype worker, bypassing the
    /// queue. Escape hatch for cheap helpers; timeouts do not apply.
    pub fn inline(&self) -> MappedMutexGuard<'_, W> {
        MutexGuard::map(self.inner.lock(), |inner| &mut inner.worker)
    }

    /// Validate this mediator's settings for the startup environment check.
    #[must_use]
    pub fn check_environment(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut problems = Vec::new();
        if inner.pool_size == 0 {
            problems.push(format!("pool '{}': size must be at least 1", self.name));
        }
        if inner.low_water >= inner.high_water {
            problems.push(format!(
                "pool '{}': water marks must satisfy low < high",
                self.name
            ));
        }
        if inner.default_timeout <= 0.0 {
            problems.push(format!("pool '{}': default timeout must be positive", self.name));
        }
        problems
    }

    /// Snapshot of a tracked call, if it has not been collected yet.
    #[must_use]
    pub fn call_snapshot(&self, id: u64) -> Option<Call> {
        self.inner.lock().calls.get(&id).cloned()
    }

    /// Number of calls that have not reached a terminal status.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .calls
            .values()
            .filter(|c| !c.status.is_terminal())
            .count()
    }

    /// Whether backpressure is currently refusing new calls.
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.inner.lock().saturated
    }

    /// Transport state snapshot.
    #[must_use]
    pub fn transport_state(&self) -> ViaState {
        self.via.state()
    }

    /// The mediator's name, used in logs and environment checks.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn spawn_member(&self, index: usize, worker: W) -> Result<Member> {
        let stop = Arc::new(AtomicBool::new(false));
        let via = self.via.clone();
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(format!("{}-member-{index}", self.name))
            .spawn(move || run_executor(index, worker, &via, &thread_stop))
            .map_err(|e| Error::runtime_with_source("failed to spawn pool member", e))?;
        Ok(Member {
            handle: Some(handle),
            spawned_at: epoch_now(),
            current_call: None,
            stop,
        })
    }
}

/// Member executor loop: block on the Call lane, acknowledge pick-up, run
/// the method, publish the result. A failed call never ends the member;
/// only teardown, transport release or condemnation do.
fn run_executor<W: Worker>(index: usize, mut worker: W, via: &Via, stop: &AtomicBool) {
    debug!(member = index, "executor started");
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let frame = match via.get(FrameKind::Call, true) {
            Ok(Some(frame)) => frame,
            // Release or disconnect: the parent is gone or tearing down.
            Ok(None) | Err(_) => break,
        };
        let Frame::Call {
            id, method, args, ..
        } = frame
        else {
            continue;
        };
        if via.consume_cancel(id) {
            debug!(member = index, call = id, "skipping cancelled call");
            continue;
        }

        let _ = via.put(Frame::Running {
            id,
            member: index,
            started_at: epoch_now(),
        });

        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| worker.perform(&method, &args)));
        let (status, value) = match outcome {
            Ok(Ok(value)) => (CallStatus::Returned, value),
            Ok(Err(message)) => (CallStatus::Uncaught, Value::String(message)),
            Err(panic) => (CallStatus::Uncaught, Value::String(panic_message(&panic))),
        };

        if via
            .put(Frame::Return {
                id,
                status,
                value,
                returned_at: epoch_now(),
            })
            .is_err()
        {
            break;
        }
    }
    debug!(member = index, "executor stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Capability surface the lifecycle controller uses to drive adopted pools:
/// setup during init, a scheduling pass per iteration, environment checks
/// before run, teardown at shutdown.
pub trait Supervised: Send {
    /// Name for logs and error messages.
    fn name(&self) -> &str;
    /// Start the pool (idempotent).
    ///
    /// # Errors
    ///
    /// Returns an error when the pool cannot be started.
    fn setup(&self) -> Result<()>;
    /// One parent-side scheduling pass.
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    fn tick(&self) -> Result<()>;
    /// Stop the pool and surface in-flight work.
    fn teardown(&self);
    /// Collect environment problems; non-empty fails startup.
    fn check_environment(&self) -> Vec<String>;
}

impl<W: Worker + Clone> Supervised for Mediator<W> {
    fn name(&self) -> &str {
        Self::name(self)
    }

    fn setup(&self) -> Result<()> {
        Self::setup(self)
    }

    fn tick(&self) -> Result<()> {
        Self::tick(self)
    }

    fn teardown(&self) {
        Self::teardown(self);
    }

    fn check_environment(&self) -> Vec<String> {
        Self::check_environment(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    #[derive(Clone)]
    struct Arith;

    impl Worker for Arith {
        fn perform(&mut self, method: &str, args: &[Value]) -> std::result::Result<Value, String> {
            match method {
                "square" => {
                    let n = args[0].as_i64().ok_or("not a number")?;
                    Ok(json!(n * n))
                }
                "sleep_ms" => {
                    let ms = args[0].as_u64().unwrap_or(0);
                    std::thread::sleep(Duration::from_millis(ms));
                    Ok(json!(ms))
                }
                "fail" => Err("arithmetic went sideways".to_string()),
                "explode" => panic!("boom"),
                other => Err(format!("unknown method {other}")),
            }
        }
    }

    fn settings() -> WorkerConfig {
        WorkerConfig::default()
    }

    fn drive<W: Worker + Clone>(
        mediator: &Mediator<W>,
        until: impl Fn() -> bool,
        limit: Duration,
    ) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            mediator.tick().unwrap();
            if until() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_status_advances_monotonically() {
        let mut call = Call::new(1, "square", vec![json!(2)]);
        assert!(call.advance(CallStatus::Called));
        assert!(call.advance(CallStatus::Running));
        assert!(!call.advance(CallStatus::Called), "no regression");
        assert!(call.advance(CallStatus::Returned));
        assert!(
            !call.advance(CallStatus::Timeout),
            "terminal status is final"
        );
        assert_eq!(call.status, CallStatus::Returned);
    }

    #[test]
    fn test_round_trip_dispatches_on_return_once() {
        let mediator = Mediator::new("arith", Arith, &settings());
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None::<Call>));
        {
            let hits = Arc::clone(&hits);
            let seen = Arc::clone(&seen);
            mediator.on_return(move |call| {
                hits.fetch_add(1, Ordering::SeqCst);
                *seen.lock() = Some(call.clone());
            });
        }
        mediator.setup().unwrap();

        let id = mediator.call("square", vec![json!(7)]).unwrap();
        assert!(drive(
            &mediator,
            || hits.load(Ordering::SeqCst) == 1,
            Duration::from_secs(2)
        ));

        let call = seen.lock().clone().unwrap();
        assert_eq!(call.id, id);
        assert_eq!(call.status, CallStatus::Returned);
        assert_eq!(call.return_value, Some(json!(49)));
        assert!(call.started_at.is_some());
        assert!(call.returned_at.is_some());
        assert!(call.size > 0);

        // Extra passes never re-dispatch the terminal status.
        for _ in 0..5 {
            mediator.tick().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        mediator.teardown();
    }

    #[test]
    fn test_worker_error_surfaces_as_uncaught() {
        let mediator = Mediator::new("arith", Arith, &settings());
        let seen = Arc::new(Mutex::new(None::<Call>));
        {
            let seen = Arc::clone(&seen);
            mediator.on_return(move |call| *seen.lock() = Some(call.clone()));
        }
        mediator.setup().unwrap();

        mediator.call("fail", vec![]).unwrap();
        assert!(drive(
            &mediator,
            || seen.lock().is_some(),
            Duration::from_secs(2)
        ));

        let call = seen.lock().clone().unwrap();
        assert_eq!(call.status, CallStatus::Uncaught);
        assert_eq!(
            call.return_value,
            Some(json!("arithmetic went sideways"))
        );
        assert_eq!(call.errors, 1);
        mediator.teardown();
    }

    #[test]
    fn test_worker_panic_does_not_kill_the_member() {
        let mut config = settings();
        config.workers = 1;
        let mediator = Mediator::new("arith", Arith, &config);
        let results = Arc::new(Mutex::new(Vec::new()));
        {
            let results = Arc::clone(&results);
            mediator.on_return(move |call| results.lock().push(call.status));
        }
        mediator.setup().unwrap();

        mediator.call("explode", vec![]).unwrap();
        mediator.call("square", vec![json!(3)]).unwrap();
        assert!(drive(
            &mediator,
            || results.lock().len() == 2,
            Duration::from_secs(2)
        ));

        let statuses = results.lock().clone();
        assert_eq!(statuses[0], CallStatus::Uncaught);
        assert_eq!(statuses[1], CallStatus::Returned);
        mediator.teardown();
    }

    #[test]
    fn test_timeout_fires_once_and_pool_recovers() {
        let mut config = settings();
        config.workers = 1;
        let mediator = Mediator::new("arith", Arith, &config);
        mediator.timeout("sleep_ms", 0.2);

        let timeouts = Arc::new(AtomicUsize::new(0));
        let returns = Arc::new(AtomicUsize::new(0));
        {
            let timeouts = Arc::clone(&timeouts);
            mediator.on_timeout(move |call| {
                assert_eq!(call.status, CallStatus::Timeout);
                timeouts.fetch_add(1, Ordering::SeqCst);
            });
            let returns = Arc::clone(&returns);
            mediator.on_return(move |_| {
                returns.fetch_add(1, Ordering::SeqCst);
            });
        }
        mediator.setup().unwrap();

        let started = Instant::now();
        let id = mediator.call("sleep_ms", vec![json!(2_000)]).unwrap();
        assert!(drive(
            &mediator,
            || timeouts.load(Ordering::SeqCst) == 1,
            Duration::from_secs(1)
        ));
        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(
            mediator.call_snapshot(id).unwrap().status,
            CallStatus::Timeout
        );

        // The condemned member was replaced: a fresh call completes while
        // the old member is still sleeping, and the late result of the
        // timed-out call is dropped.
        mediator.call("square", vec![json!(4)]).unwrap();
        assert!(drive(
            &mediator,
            || returns.load(Ordering::SeqCst) == 1,
            Duration::from_secs(2)
        ));
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        mediator.teardown();
    }

    #[test]
    fn test_backpressure_refuses_then_recovers() {
        let mut config = settings();
        config.queue_depth = 8;
        config.high_water = 2;
        config.low_water = 1;
        let mediator = Mediator::new("arith", Arith, &config);
        // No setup: nothing consumes the queue.

        mediator.call("square", vec![json!(1)]).unwrap();
        mediator.call("square", vec![json!(2)]).unwrap();
        let err = mediator.call("square", vec![json!(3)]).unwrap_err();
        assert!(matches!(err, Error::Saturated { queued, .. } if queued >= 2));
        assert!(mediator.is_saturated());

        // Drain below the low-water mark; the next tick clears the latch.
        mediator.via.get(FrameKind::Call, false).unwrap();
        mediator.via.get(FrameKind::Call, false).unwrap();
        mediator.tick().unwrap();
        assert!(!mediator.is_saturated());
        assert!(mediator.call("square", vec![json!(4)]).is_ok());
    }

    #[test]
    fn test_workers_rejected_after_setup() {
        let mediator = Mediator::new("arith", Arith, &settings());
        mediator.workers(3).unwrap();
        mediator.setup().unwrap();
        assert!(mediator.workers(5).is_err());
        mediator.teardown();
    }

    #[test]
    fn test_teardown_orphans_go_to_on_timeout() {
        let mut config = settings();
        config.workers = 1;
        let mediator = Mediator::new("arith", Arith, &config);
        let orphaned = Arc::new(AtomicUsize::new(0));
        {
            let orphaned = Arc::clone(&orphaned);
            mediator.on_timeout(move |call| {
                assert_eq!(call.status, CallStatus::Uncaught);
                orphaned.fetch_add(1, Ordering::SeqCst);
            });
        }
        mediator.setup().unwrap();

        mediator.call("sleep_ms", vec![json!(1_000)]).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        mediator.tick().unwrap();
        mediator.teardown();
        assert_eq!(orphaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_inline_bypasses_the_queue() {
        let mediator = Mediator::new("arith", Arith, &settings());
        let value = mediator.inline().perform("square", &[json!(9)]).unwrap();
        assert_eq!(value, json!(81));
    }

    #[test]
    fn test_cancel_before_pickup() {
        let mediator = Mediator::new("arith", Arith, &settings());
        // No members: the call stays queued and can be cancelled.
        let id = mediator.call("square", vec![json!(5)]).unwrap();
        mediator.cancel(id);
        assert_eq!(
            mediator.call_snapshot(id).unwrap().status,
            CallStatus::Cancelled
        );
        assert_eq!(mediator.pending(), 0);
    }

    #[test]
    fn test_gc_collects_terminal_calls_after_grace() {
        let mut config = settings();
        config.gc_grace_secs = 0.05;
        let mediator = Mediator::new("arith", Arith, &config);
        mediator.setup().unwrap();

        let id = mediator.call("square", vec![json!(2)]).unwrap();
        assert!(drive(
            &mediator,
            || mediator
                .call_snapshot(id)
                .is_some_and(|c| c.status == CallStatus::Returned),
            Duration::from_secs(2)
        ));

        std::thread::sleep(Duration::from_millis(80));
        mediator.tick().unwrap();
        assert!(mediator.call_snapshot(id).is_none());
        mediator.teardown();
    }

    #[test]
    fn test_environment_check_flags_bad_settings() {
        let mediator = Mediator::new("arith", Arith, &settings());
        mediator.workers(0).unwrap();
        let problems = Supervised::check_environment(&mediator);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("arith"));
    }
}
