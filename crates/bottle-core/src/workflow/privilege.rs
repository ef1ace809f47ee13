use crate::config::Escalation;
use crate::error::{BottleError, BottleResult};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub(crate) const PKEXEC_BINARIES: &[&str] = &["/usr/bin/pkexec", "/bin/pkexec"];
pub(crate) const SUDO_BINARIES: &[&str] = &["/usr/bin/sudo", "/bin/sudo"];

/// Wraps privileged helper invocations in pkexec or sudo when needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalator {
    wrapper: Option<PathBuf>,
}

impl Escalator {
    /// Resolve the wrapper for `mode`. Root never needs one.
    pub fn resolve(mode: Escalation) -> BottleResult<Self> {
        if running_as_root() || mode == Escalation::None {
            return Ok(Self::direct());
        }

        let found = match mode {
            Escalation::Pkexec => first_existing(PKEXEC_BINARIES),
            Escalation::Sudo => first_existing(SUDO_BINARIES),
            Escalation::Auto => {
                first_existing(PKEXEC_BINARIES).or_else(|| first_existing(SUDO_BINARIES))
            }
            Escalation::None => None,
        };

        match found {
            Some(path) => Ok(Self {
                wrapper: Some(path),
            }),
            None => Err(missing_privilege_error(mode)),
        }
    }

    /// Run helpers as-is.
    pub fn direct() -> Self {
        Self { wrapper: None }
    }

    pub fn wrapper(&self) -> Option<&Path> {
        self.wrapper.as_deref()
    }

    /// Turn `binary args...` into the program and argv actually spawned.
    pub fn wrap(&self, binary: &Path, args: &[OsString]) -> (PathBuf, Vec<OsString>) {
        match &self.wrapper {
            Some(wrapper) => {
                let mut argv = Vec::with_capacity(args.len() + 1);
                argv.push(binary.as_os_str().to_os_string());
                argv.extend(args.iter().cloned());
                (wrapper.clone(), argv)
            }
            None => (binary.to_path_buf(), args.to_vec()),
        }
    }
}

/// Fail early when formatting would need privileges we cannot obtain.
pub fn ensure_privilege_support(mode: Escalation) -> BottleResult<()> {
    Escalator::resolve(mode).map(|_| ())
}

fn first_existing(candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
}

#[cfg(unix)]
pub fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn running_as_root() -> bool {
    true
}

fn missing_privilege_error(mode: Escalation) -> BottleError {
    let wanted = match mode {
        Escalation::Pkexec => "pkexec",
        Escalation::Sudo => "sudo",
        _ => "pkexec or sudo",
    };
    BottleError::Privilege(format!(
        "{wanted} is not installed and bottle-launch is not running as root. Install polkit (`pkexec`) or sudo, or set tools.escalation = \"none\" if the helpers are already permitted."
    ))
}
