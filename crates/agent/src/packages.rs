//! System package manager adapters.
//!
//! Each adapter shells out to the host's package manager. Failures of the
//! package manager itself (non-zero exit) are reported as unsuccessful
//! outcomes; failing to run it at all is an error.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Output};
use std::sync::Arc;

use thiserror::Error;

/// Errors from running a package manager.
#[derive(Debug, Error)]
pub enum PackageError {
    /// The package manager could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// The program that failed to start.
        program: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

/// Result of refreshing the package index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefreshOutcome {
    /// Whether the refresh succeeded.
    pub success: bool,
    /// Whether updates are pending.
    pub needs_update: bool,
}

/// A system package manager.
pub trait PackageManager: Send + Sync + fmt::Debug {
    /// Short name, for logging.
    fn name(&self) -> &str;

    /// Refresh the package index and report whether updates are pending.
    fn refresh(&self) -> Result<RefreshOutcome, PackageError>;

    /// Install pending updates. `upgrade` allows package removals and
    /// replacements (a full distribution upgrade).
    fn update(&self, upgrade: bool) -> Result<bool, PackageError>;
}

fn run(program: &str, args: &[&str]) -> Result<Output, PackageError> {
    tracing::debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .env("DEBIAN_FRONTEND", "noninteractive")
        .output()
        .map_err(|source| PackageError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        tracing::warn!(
            "{} {} exited with {}: {}",
            program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}

/// Debian family (`apt-get`).
#[derive(Debug, Clone)]
pub struct Apt {
    program: PathBuf,
}

impl Apt {
    /// Use the given `apt-get` binary.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn program(&self) -> String {
        self.program.display().to_string()
    }
}

/// Number of packages a simulated `apt-get upgrade` would install.
fn count_apt_pending(simulation: &str) -> usize {
    simulation
        .lines()
        .filter(|line| line.starts_with("Inst "))
        .count()
}

impl PackageManager for Apt {
    fn name(&self) -> &str {
        "apt"
    }

    fn refresh(&self) -> Result<RefreshOutcome, PackageError> {
        let program = self.program();
        if !run(&program, &["-q", "update"])?.status.success() {
            return Ok(RefreshOutcome::default());
        }

        let simulation = run(&program, &["-s", "-q", "upgrade"])?;
        Ok(RefreshOutcome {
            success: simulation.status.success(),
            needs_update: count_apt_pending(&String::from_utf8_lossy(&simulation.stdout)) > 0,
        })
    }

    fn update(&self, upgrade: bool) -> Result<bool, PackageError> {
        let action = if upgrade { "dist-upgrade" } else { "upgrade" };
        Ok(run(&self.program(), &["-y", "-q", action])?.status.success())
    }
}

/// Red Hat family (`yum` or `dnf`).
#[derive(Debug, Clone)]
pub struct Yum {
    name: &'static str,
    program: PathBuf,
}

impl Yum {
    /// Use the given `yum` binary.
    pub fn yum(program: impl Into<PathBuf>) -> Self {
        Self {
            name: "yum",
            program: program.into(),
        }
    }

    /// Use the given `dnf` binary.
    pub fn dnf(program: impl Into<PathBuf>) -> Self {
        Self {
            name: "dnf",
            program: program.into(),
        }
    }
}

/// Interprets the exit status of `check-update`: 100 means updates are
/// pending, 0 means none, anything else is a failure.
fn check_update_outcome(status: ExitStatus) -> RefreshOutcome {
    match status.code() {
        Some(0) => RefreshOutcome {
            success: true,
            needs_update: false,
        },
        Some(100) => RefreshOutcome {
            success: true,
            needs_update: true,
        },
        _ => RefreshOutcome::default(),
    }
}

impl PackageManager for Yum {
    fn name(&self) -> &str {
        self.name
    }

    fn refresh(&self) -> Result<RefreshOutcome, PackageError> {
        let program = self.program.display().to_string();
        let output = run(&program, &["-q", "check-update"])?;
        Ok(check_update_outcome(output.status))
    }

    fn update(&self, upgrade: bool) -> Result<bool, PackageError> {
        let action = if upgrade { "upgrade" } else { "update" };
        let program = self.program.display().to_string();
        Ok(run(&program, &["-y", "-q", action])?.status.success())
    }
}

/// Stand-in when no supported package manager is installed.
#[derive(Debug, Clone, Default)]
pub struct Unavailable;

impl PackageManager for Unavailable {
    fn name(&self) -> &str {
        "none"
    }

    fn refresh(&self) -> Result<RefreshOutcome, PackageError> {
        Ok(RefreshOutcome::default())
    }

    fn update(&self, _upgrade: bool) -> Result<bool, PackageError> {
        Ok(false)
    }
}

/// Detect the host's package manager.
pub fn detect() -> Arc<dyn PackageManager> {
    if let Ok(path) = which::which("apt-get") {
        return Arc::new(Apt::new(path));
    }
    if let Ok(path) = which::which("dnf") {
        return Arc::new(Yum::dnf(path));
    }
    if let Ok(path) = which::which("yum") {
        return Arc::new(Yum::yum(path));
    }

    tracing::warn!("No supported package manager found; package actions will fail");
    Arc::new(Unavailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_apt_pending() {
        let simulation = "\
Reading package lists...
Building dependency tree...
The following packages will be upgraded:
  curl libcurl4
2 upgraded, 0 newly installed, 0 to remove and 0 not upgraded.
Inst curl [7.88.1-10] (7.88.1-10+deb12u5 Debian-Security:12/stable-security [amd64])
Inst libcurl4 [7.88.1-10] (7.88.1-10+deb12u5 Debian-Security:12/stable-security [amd64])
Conf curl (7.88.1-10+deb12u5 Debian-Security:12/stable-security [amd64])
";
        assert_eq!(count_apt_pending(simulation), 2);
        assert_eq!(
            count_apt_pending("0 upgraded, 0 newly installed, 0 to remove and 0 not upgraded."),
            0
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_check_update_outcome() {
        use std::os::unix::process::ExitStatusExt;

        let status = |code: i32| ExitStatus::from_raw(code << 8);

        assert_eq!(
            check_update_outcome(status(0)),
            RefreshOutcome {
                success: true,
                needs_update: false
            }
        );
        assert_eq!(
            check_update_outcome(status(100)),
            RefreshOutcome {
                success: true,
                needs_update: true
            }
        );
        assert_eq!(check_update_outcome(status(1)), RefreshOutcome::default());
    }

    #[test]
    fn test_unavailable_always_fails() {
        let pm = Unavailable;
        assert_eq!(pm.refresh().unwrap(), RefreshOutcome::default());
        assert!(!pm.update(true).unwrap());
        assert_eq!(pm.name(), "none");
    }

    #[test]
    fn test_spawn_failure_is_error() {
        let pm = Apt::new("/nonexistent/apt-get");
        assert!(matches!(pm.refresh(), Err(PackageError::Spawn { .. })));
    }

    #[test]
    fn test_detect_returns_a_manager() {
        let pm = detect();
        assert!(["apt", "dnf", "yum", "none"].contains(&pm.name()));
    }
}
