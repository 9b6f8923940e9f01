//! Invocation contract: flag scan, detach, pid file, re-exec.
//!
//! The recognized surface is `cmd [-H|-h] [-d] [-p <pid_file>]`; unknown
//! flags are ignored by contract, which is why the scan is hand-rolled
//! rather than delegated to an argv-parsing crate (those reject unknown
//! flags by design). `-d` detaches by re-spawning the executable with null
//! stdio and a marker environment variable; the replacement becomes its own
//! session leader. Restart re-uses the same respawn with the original argv
//! preserved.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{Error, Result};

/// Environment marker set on detached replacements so they do not detach
/// again, and on restart replacements so they keep daemon-mode behavior.
pub(crate) const DETACH_ENV: &str = "TICKD_DETACHED";

/// Parsed command-line invocation.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// `-H`/`-h`: print usage and exit 0.
    pub help: bool,
    /// `-d`: detach into the background.
    pub detach: bool,
    /// `-p <file>`: write the pid to this path, removed at shutdown.
    pub pid_file: Option<PathBuf>,
    argv: Vec<String>,
}

impl Invocation {
    /// Parse the process's own command line.
    #[must_use]
    pub fn parse() -> Self {
        Self::from_args(std::env::args().collect())
    }

    /// Parse an explicit argv (element 0 is the program name). Unknown
    /// flags are ignored; a trailing `-p` without a path is ignored too.
    #[must_use]
    pub fn from_args(argv: Vec<String>) -> Self {
        let mut invocation = Self {
            argv: argv.clone(),
            ..Self::default()
        };
        let mut args = argv.into_iter().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-H" | "-h" => invocation.help = true,
                "-d" => invocation.detach = true,
                "-p" => {
                    if let Some(path) = args.next() {
                        invocation.pid_file = Some(PathBuf::from(path));
                    }
                }
                other => debug!(flag = other, "ignoring unknown flag"),
            }
        }
        invocation
    }

    /// The original argv, program name included.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Program name for usage text.
    #[must_use]
    pub fn program(&self) -> &str {
        self.argv.first().map_or("daemon", String::as_str)
    }

    /// Usage text for `-H`/`-h`.
    #[must_use]
    pub fn usage(&self) -> String {
        format!(
            "Usage: {} [-H|-h] [-d] [-p <pid_file>]\n\
             \n\
             \x20 -H, -h         print this help and exit\n\
             \x20 -d             detach and run in the background\n\
             \x20 -p <pid_file>  write the pid to <pid_file>\n",
            self.program()
        )
    }
}

/// Whether this process is a detached or re-exec'd replacement.
#[must_use]
pub fn is_detached_replacement() -> bool {
    std::env::var_os(DETACH_ENV).is_some()
}

/// Honor `-d`: re-spawn the executable detached and exit the foreground
/// process. In the replacement this only claims a fresh session.
///
/// # Errors
///
/// Returns an error when the replacement cannot be spawned.
pub fn maybe_detach(invocation: &Invocation) -> Result<()> {
    if is_detached_replacement() {
        #[cfg(unix)]
        {
            // Already detached; become session leader. Failure here means
            // we already lead one.
            let _ = nix::unistd::setsid();
        }
        return Ok(());
    }
    if !invocation.detach {
        return Ok(());
    }

    respawn_command(invocation.argv())?
        .spawn()
        .map_err(|e| Error::io_with_source("failed to spawn detached replacement", e))?;
    std::process::exit(0);
}

/// Build the replacement command used by detach and restart: the current
/// executable with the original flags (including `-d` and `-p`), stdio on
/// the null device, and the replacement marker set.
pub(crate) fn respawn_command(argv: &[String]) -> Result<Command> {
    let exe = std::env::current_exe()
        .map_err(|e| Error::io_with_source("failed to resolve current executable", e))?;
    let mut command = Command::new(exe);
    command
        .args(argv.get(1..).unwrap_or(&[]))
        .env(DETACH_ENV, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    Ok(command)
}

/// Writes the decimal pid on creation and removes the file on drop, but
/// only when its contents still match our own pid (a replacement may have
/// overwritten it already).
#[derive(Debug)]
pub(crate) struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    pub(crate) fn create(path: &Path) -> Result<Self> {
        std::fs::write(path, std::process::id().to_string()).map_err(|e| {
            Error::io_with_source(format!("failed to write pid file {}", path.display()), e)
        })?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let own = std::process::id().to_string();
        match std::fs::read_to_string(&self.path) {
            Ok(body) if body.trim() == own => {
                let _ = std::fs::remove_file(&self.path);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_flag_scan_recognizes_the_contract() {
        let inv = Invocation::from_args(strings(&["sieved", "-d", "-p", "/tmp/x.pid"]));
        assert!(!inv.help);
        assert!(inv.detach);
        assert_eq!(inv.pid_file, Some(PathBuf::from("/tmp/x.pid")));
        assert_eq!(inv.program(), "sieved");
    }

    #[test]
    fn test_unknown_flags_are_ignored() {
        let inv = Invocation::from_args(strings(&["d", "--verbose", "-x", "-h", "stray"]));
        assert!(inv.help);
        assert!(!inv.detach);
        assert!(inv.pid_file.is_none());
    }

    #[test]
    fn test_trailing_pid_flag_without_value() {
        let inv = Invocation::from_args(strings(&["d", "-p"]));
        assert!(inv.pid_file.is_none());
    }

    #[test]
    fn test_usage_names_the_program() {
        let inv = Invocation::from_args(strings(&["sieved"]));
        assert!(inv.usage().starts_with("Usage: sieved"));
    }

    #[test]
    fn test_respawn_preserves_daemon_flags() {
        let argv = strings(&["sieved", "-d", "-p", "/tmp/x.pid", "--custom"]);
        let command = respawn_command(&argv).unwrap();
        let args: Vec<_> = command
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(args, vec!["-d", "-p", "/tmp/x.pid", "--custom"]);
        assert!(command
            .get_envs()
            .any(|(k, v)| k == DETACH_ENV && v.is_some()));
    }

    #[test]
    fn test_pid_guard_writes_and_removes_own_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        {
            let _guard = PidFileGuard::create(&path).unwrap();
            let body = std::fs::read_to_string(&path).unwrap();
            assert_eq!(body, std::process::id().to_string());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_pid_guard_leaves_foreign_pid_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        {
            let _guard = PidFileGuard::create(&path).unwrap();
            // A replacement took over the file.
            std::fs::write(&path, "1").unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1");
    }
}
