//! # tick-daemon: Periodic Daemon Framework
//!
//! A framework for building long-running background services that run a
//! user-supplied work routine on a periodic schedule, dispatch lifecycle
//! events, execute one-shot background tasks, and supervise pools of
//! stateful workers reachable through an asynchronous call/return mediator.
//!
//! ## Key Features
//!
//! - **Paced event loop**: per-iteration timing with drift detection, idle
//!   budgeting, overrun logging and auto-restart
//! - **Event bus**: lifecycle and user events with per-callback throttling
//! - **Worker mediator**: method calls on a worker object become
//!   asynchronous jobs executed by a pool of members, with per-method
//!   timeouts, transport retries, backpressure and call-lifecycle callbacks
//! - **Typed transport**: serializable Call/Running/Return frames over
//!   bounded per-type queues
//! - **Singleton locking**: pluggable lease providers (null, file, kv)
//!   guaranteeing at most one live instance per logical daemon
//! - **Structured logging**: fixed-format daemon log lines via `tracing`
//!
//! ## Quick Start
//!
//! ```no_run
//! use tick_daemon::{Config, Daemon, Invocation, Result, Service};
//!
//! struct Poller {
//!     rounds: u64,
//! }
//!
//! impl Service for Poller {
//!     fn name(&self) -> &str {
//!         "poller"
//!     }
//!
//!     fn execute(&mut self, daemon: &mut Daemon) -> Result<()> {
//!         self.rounds += 1;
//!         if self.rounds == 100 {
//!             daemon.request_shutdown();
//!         }
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let invocation = Invocation::parse();
//!     let mut config = Config::new()?;
//!     config.loop_interval = 1.0;
//!
//!     let runtime = tokio::runtime::Builder::new_current_thread()
//!         .enable_all()
//!         .build()
//!         .expect("runtime");
//!     let daemon = Daemon::new(config, invocation)?;
//!     runtime.block_on(daemon.run(Poller { rounds: 0 }))
//! }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]

mod clock;
mod config;
mod daemon;
mod error;
mod logging;
mod timer;

pub mod event;
pub mod launch;
pub mod lock;
pub mod mediator;
pub mod signal;
pub mod task;
pub mod via;

pub use config::{Config, LockConfig, LogConfig, LogLevel, WorkerConfig};
pub use daemon::{Daemon, DaemonState, Service};
pub use error::{Error, ErrorCode, Result};
pub use event::{CallbackHandle, EventArgs, EventBus, EventId};
pub use launch::Invocation;
pub use lock::{FileLock, KvLock, KvStore, Lease, LockProvider, MemoryStore, NullLock};
pub use mediator::{Call, CallStatus, Mediator, Supervised, Worker};
pub use task::{Task, TaskExit, TaskRunner};
pub use timer::{priority_hint, IdleProbe, LoopSample, LoopTimer, TickOutcome};
pub use via::{Frame, FrameKind, Via, ViaState};

/// Version of the tick-daemon library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum uptime in seconds before a restart may be attempted, and the
/// lower bound for the auto-restart interval.
pub const MIN_RESTART_SECS: u64 = 10;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "tickd.toml";

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "TICKD_";
