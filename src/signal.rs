//! Dedicated signal reception for the daemon lifecycle.
//!
//! A background task owns the OS signal streams and does nothing but set
//! flags: shutdown (SIGTERM, SIGINT), restart (SIGHUP), statistics dump
//! (SIGUSR1), and a queue of any other monitored signal numbers. The
//! controller polls the flags once per iteration and performs the actual
//! work on the loop, so no dispatch ever happens in signal context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::Result;

#[derive(Debug, Default)]
struct Flags {
    shutdown: AtomicBool,
    restart: AtomicBool,
    dump_stats: AtomicBool,
    others: Mutex<Vec<i32>>,
}

impl Flags {
    fn note(&self, signum: i32) {
        #[cfg(unix)]
        match signum {
            libc::SIGTERM | libc::SIGINT => {
                info!(signum, "shutdown signal received");
                self.shutdown.store(true, Ordering::Release);
            }
            libc::SIGHUP => {
                info!(signum, "restart signal received");
                self.restart.store(true, Ordering::Release);
            }
            libc::SIGUSR1 => {
                self.dump_stats.store(true, Ordering::Release);
            }
            other => {
                debug!(signum = other, "queueing signal for dispatch");
                self.others.lock().push(other);
            }
        }
        #[cfg(not(unix))]
        {
            self.others.lock().push(signum);
        }
    }
}

/// Snapshot of pending signal activity, drained once per loop iteration.
#[derive(Debug, Default)]
pub struct SignalEvents {
    /// A shutdown signal has been received (sticky).
    pub shutdown: bool,
    /// A restart was requested since the last poll.
    pub restart: bool,
    /// A statistics dump was requested since the last poll.
    pub dump_stats: bool,
    /// Other monitored signals received since the last poll, in order.
    pub others: Vec<i32>,
}

/// Owner of the signal streams and their flag state.
pub struct SignalMonitor {
    flags: Arc<Flags>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl SignalMonitor {
    /// Install the reception task. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a signal error if a stream cannot be registered.
    pub fn install() -> Result<Self> {
        let flags = Arc::new(Flags::default());

        #[cfg(unix)]
        let task = {
            use tokio::signal::unix::{signal, SignalKind};

            let mut streams = Vec::new();
            for (kind, signum) in [
                (SignalKind::terminate(), libc::SIGTERM),
                (SignalKind::interrupt(), libc::SIGINT),
                (SignalKind::hangup(), libc::SIGHUP),
                (SignalKind::user_defined1(), libc::SIGUSR1),
                (SignalKind::user_defined2(), libc::SIGUSR2),
                (SignalKind::quit(), libc::SIGQUIT),
            ] {
                let stream = signal(kind).map_err(|e| {
                    crate::error::Error::signal(format!(
                        "failed to register handler for signal {signum}: {e}"
                    ))
                })?;
                streams.push((stream, signum));
            }
            info!("signal reception installed (TERM, INT, HUP, USR1, USR2, QUIT)");

            let flags = Arc::clone(&flags);
            Some(tokio::spawn(async move {
                use std::task::Poll;
                loop {
                    let signum = std::future::poll_fn(|cx| {
                        for (stream, signum) in &mut streams {
                            if stream.poll_recv(cx).is_ready() {
                                return Poll::Ready(*signum);
                            }
                        }
                        Poll::Pending
                    })
                    .await;
                    flags.note(signum);
                }
            }))
        };

        #[cfg(not(unix))]
        let task = None;

        Ok(Self { flags, task })
    }

    /// Drain pending signal activity. Restart, dump and other-signal state
    /// reset on read; the shutdown flag is sticky.
    #[must_use]
    pub fn poll(&self) -> SignalEvents {
        SignalEvents {
            shutdown: self.flags.shutdown.load(Ordering::Acquire),
            restart: self.flags.restart.swap(false, Ordering::AcqRel),
            dump_stats: self.flags.dump_stats.swap(false, Ordering::AcqRel),
            others: std::mem::take(&mut *self.flags.others.lock()),
        }
    }

    /// Stop the reception task.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("signal reception stopped");
        }
    }
}

impl Drop for SignalMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
