//! The lifecycle controller: init → run → shutdown.
//!
//! A `Daemon` is an explicitly constructed controller passed by reference
//! through the subsystems; uniqueness is enforced by the installed lock
//! providers, not by the type system. It owns the event bus, the loop
//! timer, the signal flags, the one-shot task runner and any adopted
//! worker pools, and drives one cooperative iteration per tick: poll
//! signal flags → start timer → auto-restart check → PreExecute → user
//! `execute()` → pool scheduling passes and task reaping → PostExecute →
//! finish timer (Idle dispatch, then sleep out the budget).
//!
//! Fatal errors follow the daemon policy: when detached and past the
//! minimum uptime, the process re-execs itself (flags preserved, output on
//! the null device); otherwise the error is returned so the embedding
//! binary can exit with status 1.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::clock::epoch_now;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{CallbackHandle, EventArgs, EventBus, EventId};
use crate::launch::{self, Invocation, PidFileGuard};
use crate::lock::LockProvider;
use crate::logging;
use crate::mediator::Supervised;
use crate::signal::SignalMonitor;
use crate::task::{Task, TaskRunner};
use crate::timer::{self, LoopSample, LoopTimer};
use crate::MIN_RESTART_SECS;

/// Iterations between idle-time statistics trims.
const STATS_TRIM_EVERY: u64 = 50;

/// Nap taken instead of the idle sleep when an iteration ran over budget.
const OVERRUN_NAP: Duration = Duration::from_micros(100);

/// How long a replacement waits to take over a still-held lock before
/// giving up, beyond the lease's own ttl + padding.
const LOCK_WAIT_MARGIN_SECS: f64 = 5.0;

/// Delay between lock acquisition attempts while waiting for a lease.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Controller lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Constructed, not yet initialized.
    New,
    /// Init in progress: signals, locks, service setup.
    Initializing,
    /// Main loop running.
    Running,
    /// Tearing down after shutdown was requested.
    ShuttingDown,
    /// Re-exec in progress.
    Restarting,
    /// Done; the controller will not run again.
    Exited,
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "New"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Restarting => write!(f, "Restarting"),
            Self::Exited => write!(f, "Exited"),
        }
    }
}

/// The user-supplied work routine driven by the controller.
pub trait Service: Send {
    /// Name for logs.
    fn name(&self) -> &str {
        "service"
    }

    /// One-time preparation, after the lock gate and Init dispatch.
    ///
    /// # Errors
    ///
    /// A setup error is a fatal startup failure.
    fn setup(&mut self, _daemon: &mut Daemon) -> Result<()> {
        Ok(())
    }

    /// One unit of periodic work. Long work here is an anti-pattern and
    /// shows up in the overrun log; push heavy lifting to tasks or pools.
    ///
    /// # Errors
    ///
    /// An execute error is fatal (subject to the restart policy).
    fn execute(&mut self, daemon: &mut Daemon) -> Result<()>;

    /// Teardown, run once during shutdown.
    ///
    /// # Errors
    ///
    /// Teardown errors are logged, never fatal.
    fn teardown(&mut self, _daemon: &mut Daemon) -> Result<()> {
        Ok(())
    }
}

/// The lifecycle controller.
pub struct Daemon {
    config: Config,
    invocation: Invocation,
    state: DaemonState,
    bus: EventBus,
    timer: LoopTimer,
    signals: Option<SignalMonitor>,
    locks: Vec<Box<dyn LockProvider>>,
    pools: Vec<Box<dyn Supervised>>,
    tasks: TaskRunner,
    start_time: f64,
    pid: u32,
    parent_pid: u32,
    is_parent: bool,
    shutdown: bool,
    iterations: u64,
    last_lock_refresh: f64,
    pid_guard: Option<PidFileGuard>,
}

impl Daemon {
    /// Construct a controller from a validated configuration and the
    /// parsed invocation. Lock providers and pools are installed before
    /// [`run`](Self::run).
    ///
    /// # Errors
    ///
    /// Returns the first violated configuration invariant.
    pub fn new(config: Config, invocation: Invocation) -> Result<Self> {
        config.validate()?;
        let timer = LoopTimer::new(config.loop_interval, config.idle_probability);
        Ok(Self {
            config,
            invocation,
            state: DaemonState::New,
            bus: EventBus::new(),
            timer,
            signals: None,
            locks: Vec::new(),
            pools: Vec::new(),
            tasks: TaskRunner::new(),
            start_time: epoch_now(),
            pid: std::process::id(),
            parent_pid: parent_pid(),
            is_parent: true,
            shutdown: false,
            iterations: 0,
            last_lock_refresh: epoch_now(),
            pid_guard: None,
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Our process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The id of the process that launched us.
    #[must_use]
    pub fn parent_pid(&self) -> u32 {
        self.parent_pid
    }

    /// Whether this controller belongs to the originating process. Members
    /// never hold a controller, so this is true for its whole life.
    #[must_use]
    pub fn is_parent(&self) -> bool {
        self.is_parent
    }

    /// Epoch seconds at construction.
    #[must_use]
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Seconds since construction.
    #[must_use]
    pub fn runtime(&self) -> f64 {
        epoch_now() - self.start_time
    }

    /// Completed loop iterations.
    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Iterations that ran over their budget.
    #[must_use]
    pub fn overruns(&self) -> u64 {
        self.timer.overruns()
    }

    /// Trimmed mean over recent iteration samples.
    #[must_use]
    pub fn stats_mean(&self, last: usize) -> Option<LoopSample> {
        self.timer.stats_mean(last)
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown
    }

    /// Request a clean shutdown; the current iteration completes first.
    pub fn request_shutdown(&mut self) {
        if !self.shutdown {
            info!("shutdown requested");
            self.shutdown = true;
        }
    }

    /// Register an event callback, optionally throttled.
    pub fn on<F>(
        &mut self,
        event: EventId,
        callback: F,
        throttle: Option<Duration>,
    ) -> CallbackHandle
    where
        F: FnMut(&EventArgs) -> Result<()> + Send + 'static,
    {
        self.bus.on(event, Box::new(callback), throttle)
    }

    /// Remove a previously registered callback.
    pub fn off(&mut self, handle: &CallbackHandle) -> bool {
        self.bus.off(handle)
    }

    /// Dispatch an event through the bus.
    ///
    /// # Errors
    ///
    /// Propagates the first callback error.
    pub fn dispatch(&mut self, event: &EventId, args: &EventArgs) -> Result<()> {
        self.bus.dispatch(event, args)
    }

    /// Dispatch a user-defined event by tag.
    ///
    /// # Errors
    ///
    /// Propagates the first callback error.
    pub fn dispatch_user(&mut self, tag: &str, args: &EventArgs) -> Result<()> {
        self.bus.dispatch(&EventId::user(tag), args)
    }

    /// Install a singleton lock provider. Must happen before `run`.
    pub fn add_lock(&mut self, provider: Box<dyn LockProvider>) {
        self.locks.push(provider);
    }

    /// Adopt a worker pool: the controller runs its setup during init, a
    /// scheduling pass every iteration, and its teardown at shutdown.
    pub fn adopt_pool(&mut self, pool: Box<dyn Supervised>) {
        debug!(pool = pool.name(), "pool adopted");
        self.pools.push(pool);
    }

    /// Spawn a one-shot background routine.
    ///
    /// # Errors
    ///
    /// Propagates Fork-dispatch callback errors and spawn failures.
    pub fn task<F>(&mut self, name: &str, routine: F) -> Result<u64>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.bus
            .dispatch(&EventId::Fork, &EventArgs::Message(name.to_string()))?;
        self.tasks.spawn(name, routine)
    }

    /// Spawn a one-shot [`Task`] object (`setup()` then `start()`).
    ///
    /// # Errors
    ///
    /// Propagates Fork-dispatch callback errors and spawn failures.
    pub fn task_object<T: Task>(&mut self, name: &str, task: T) -> Result<u64> {
        self.bus
            .dispatch(&EventId::Fork, &EventArgs::Message(name.to_string()))?;
        self.tasks.spawn_task(name, task)
    }

    /// Aggregate every installed plugin's environment problems.
    #[must_use]
    pub fn check_environment(&self) -> Vec<String> {
        let mut problems: Vec<String> = Vec::new();
        for lock in &self.locks {
            problems.extend(lock.check_environment());
        }
        for pool in &self.pools {
            problems.extend(pool.check_environment());
        }
        problems
    }

    /// Run the daemon to completion: init, the main loop, then teardown.
    /// Consumes the controller; map an `Err` to exit status 1.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that ended the daemon (environment-check
    /// failures, lock acquisition failure, or an error escaping the loop)
    /// unless the restart policy re-exec'd the process instead.
    pub async fn run<S: Service>(mut self, mut service: S) -> Result<()> {
        if let Err(e) = self.startup(&mut service).await {
            return self.fail(e, &mut service).await;
        }

        while !self.shutdown && self.is_parent {
            if let Err(e) = self.iteration(&mut service).await {
                return self.fail(e, &mut service).await;
            }
        }

        self.state = DaemonState::ShuttingDown;
        self.teardown(&mut service);
        self.state = DaemonState::Exited;
        Ok(())
    }

    async fn startup<S: Service>(&mut self, service: &mut S) -> Result<()> {
        self.state = DaemonState::Initializing;

        if let Err(e) = logging::init(&self.config.logging) {
            // A subscriber installed by the embedder (or an earlier run in
            // tests) keeps precedence.
            debug!(error = %e, "keeping the already-installed log subscriber");
        }

        if let Some(path) = self.invocation.pid_file.clone() {
            self.pid_guard = Some(PidFileGuard::create(&path)?);
        }

        if launch::is_detached_replacement() {
            self.bus.dispatch(
                &EventId::PidChange,
                &EventArgs::Value(serde_json::json!({ "pid": self.pid })),
            )?;
        }

        if self.config.signals {
            self.signals = Some(SignalMonitor::install()?);
        }

        timer::apply_priority_hint(self.config.loop_interval);

        // The duplicate-instance gate runs on Init, before the service's
        // own (possibly expensive) setup.
        self.bus.dispatch(&EventId::Init, &EventArgs::None)?;
        self.acquire_locks().await?;

        service.setup(self)?;
        for pool in &self.pools {
            pool.setup()?;
        }

        let problems = self.check_environment();
        if !problems.is_empty() {
            return Err(Error::environment(problems));
        }

        self.state = DaemonState::Running;
        info!(
            name = %self.config.name,
            pid = self.pid,
            interval_secs = self.config.loop_interval,
            service = service.name(),
            "daemon started"
        );
        Ok(())
    }

    /// Claim every installed lock, waiting out a predecessor's lease when
    /// we are its replacement.
    async fn acquire_locks(&mut self) -> Result<()> {
        for lock in &mut self.locks {
            lock.setup()?;
            let patience = lock.ttl() + lock.padding() + LOCK_WAIT_MARGIN_SECS;
            let deadline = Instant::now() + Duration::from_secs_f64(patience);
            loop {
                match lock.set() {
                    Ok(()) => {
                        debug!(backend = lock.name(), "lease acquired");
                        break;
                    }
                    Err(e @ Error::Lock { holder: Some(_), .. }) => {
                        if Instant::now() >= deadline {
                            return Err(e);
                        }
                        debug!(backend = lock.name(), "waiting for lease holder to expire");
                        tokio::time::sleep(LOCK_RETRY_DELAY).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    async fn iteration<S: Service>(&mut self, service: &mut S) -> Result<()> {
        self.handle_signals()?;
        if self.shutdown {
            return Ok(());
        }

        self.timer.start();
        self.iterations += 1;

        if self.auto_restart_due() {
            info!(
                runtime_secs = self.runtime(),
                "auto-restart interval reached"
            );
            self.restart()?;
        }
        self.refresh_locks();

        self.bus.dispatch(&EventId::PreExecute, &EventArgs::None)?;
        service.execute(self)?;

        // Parent-side scheduling passes, after the user routine.
        for pool in &self.pools {
            pool.tick()?;
        }
        let exits = self.tasks.reap();
        for exit in exits {
            if let Some(failure) = exit.error {
                error!(task = %exit.name, id = exit.id, failure = %failure, "task failed");
                self.bus.dispatch(
                    &EventId::Error,
                    &EventArgs::Message(format!("task '{}' failed: {failure}", exit.name)),
                )?;
            }
        }

        self.bus.dispatch(&EventId::PostExecute, &EventArgs::None)?;

        let outcome = self.timer.finish();
        if outcome.was_idle {
            self.bus
                .dispatch(&EventId::Idle, &EventArgs::Idle(outcome.probe.clone()))?;
            if self.iterations % STATS_TRIM_EVERY == 0 {
                self.timer.stats_trim();
            }
        }

        // Sleep out whatever budget the idle listeners left; member-exit
        // handling is deferred to the next iteration's scheduling pass, so
        // nothing interrupts this sleep.
        match outcome.budget_until {
            Some(until) => {
                let now = Instant::now();
                if until > now {
                    tokio::time::sleep(until - now).await;
                } else {
                    tokio::time::sleep(OVERRUN_NAP).await;
                }
            }
            None => tokio::time::sleep(OVERRUN_NAP).await,
        }
        Ok(())
    }

    fn handle_signals(&mut self) -> Result<()> {
        let Some(monitor) = &self.signals else {
            return Ok(());
        };
        let events = monitor.poll();
        if events.shutdown {
            self.request_shutdown();
        }
        if events.dump_stats {
            self.dump_stats();
        }
        for signum in events.others {
            self.bus
                .dispatch(&EventId::Signal, &EventArgs::Signal(signum))?;
        }
        if events.restart {
            self.restart()?;
        }
        Ok(())
    }

    fn is_daemonized(&self) -> bool {
        self.invocation.detach || launch::is_detached_replacement()
    }

    fn auto_restart_due(&self) -> bool {
        self.is_daemonized()
            && self
                .config
                .auto_restart_interval
                .is_some_and(|interval| self.runtime() >= interval as f64)
    }

    /// Re-exec the original command line and exit this process. The
    /// replacement inherits `-d` and `-p` and must wait out our lease.
    /// Parent-only; never returns on success.
    fn restart(&mut self) -> Result<()> {
        if !self.is_parent {
            return Err(Error::runtime("restart attempted outside the parent"));
        }
        self.state = DaemonState::Restarting;
        self.shutdown = true;
        info!(pid = self.pid, "restarting by re-exec");

        // No re-entrant dispatch past this point.
        self.bus.clear();
        if let Some(monitor) = &mut self.signals {
            monitor.stop();
        }
        // Let the replacement own the pid file from its first write.
        self.pid_guard = None;

        launch::respawn_command(self.invocation.argv())?
            .spawn()
            .map_err(|e| Error::io_with_source("failed to spawn restart replacement", e))?;
        std::process::exit(0);
    }

    /// Fatal-error policy: log, dispatch Error, then either re-exec (when
    /// daemonized and past the minimum uptime) or tear down and return the
    /// error for an exit-1.
    async fn fail<S: Service>(&mut self, fatal: Error, service: &mut S) -> Result<()> {
        error!(error = %fatal, category = fatal.category(), "fatal daemon error");
        if let Err(e) = self
            .bus
            .dispatch(&EventId::Error, &EventArgs::Message(fatal.to_string()))
        {
            warn!(error = %e, "error dispatch failed");
        }

        if self.is_parent
            && self.is_daemonized()
            && self.runtime() + 2.0 > MIN_RESTART_SECS as f64
        {
            tokio::time::sleep(Duration::from_secs(2)).await;
            self.restart()?;
        }

        self.state = DaemonState::ShuttingDown;
        self.teardown(service);
        self.state = DaemonState::Exited;
        Err(fatal)
    }

    fn teardown<S: Service>(&mut self, service: &mut S) {
        info!("shutting down");
        if let Err(e) = self.bus.dispatch(&EventId::Shutdown, &EventArgs::None) {
            warn!(error = %e, "shutdown dispatch failed");
        }
        if let Err(e) = service.teardown(self) {
            error!(error = %e, service = service.name(), "service teardown failed");
        }
        for pool in &self.pools {
            pool.teardown();
        }
        for exit in self.tasks.join_all() {
            if let Some(failure) = exit.error {
                error!(task = %exit.name, failure = %failure, "task failed during shutdown");
            }
        }
        for lock in &mut self.locks {
            if let Err(e) = lock.teardown() {
                warn!(backend = lock.name(), error = %e, "lock teardown failed");
            }
        }
        if let Some(mut monitor) = self.signals.take() {
            monitor.stop();
        }
        self.pid_guard = None;
        info!(
            uptime_secs = self.runtime(),
            iterations = self.iterations,
            "daemon stopped"
        );
    }

    fn refresh_locks(&mut self) {
        if self.locks.is_empty() {
            return;
        }
        let now = epoch_now();
        if now - self.last_lock_refresh < self.config.lock.ttl_secs / 2.0 {
            return;
        }
        self.last_lock_refresh = now;
        for lock in &mut self.locks {
            if let Err(e) = lock.refresh() {
                warn!(backend = lock.name(), error = %e, "lease refresh failed");
            }
        }
    }

    fn dump_stats(&self) {
        let mean = self.timer.stats_mean(100);
        info!(
            pid = self.pid,
            state = %self.state,
            runtime_secs = self.runtime(),
            iterations = self.iterations,
            overruns = self.timer.overruns(),
            samples = self.timer.sample_count(),
            mean_duration = mean.map(|m| m.duration),
            mean_idle = mean.map(|m| m.idle),
            tasks = self.tasks.active(),
            pools = self.pools.len(),
            "runtime statistics"
        );
    }
}

#[cfg(unix)]
fn parent_pid() -> u32 {
    u32::try_from(nix::unistd::getppid().as_raw()).unwrap_or(0)
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    0
}
