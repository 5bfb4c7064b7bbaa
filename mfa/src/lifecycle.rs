//! Process shell of the worker: fork, privilege drop and reaping.
//!
//! Everything here must run before the async runtime exists; `fork` in a
//! multi-threaded process is undefined behavior.
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, geteuid, setgroups, setresgid, setresuid, ForkResult, Pid, User};
use tracing::{info, warn};

use crate::config::CfgAgent;
use crate::MfaError;

pub enum Worker {
    Parent(Pid),
    Child,
}

#[allow(unsafe_code)] // fork() requires unsafe
pub fn fork_worker() -> Result<Worker, MfaError> {
    // SAFETY: called from the synchronous main before any runtime or other
    // thread has been started.
    match unsafe { fork() }.map_err(MfaError::Fork)? {
        ForkResult::Parent { child } => Ok(Worker::Parent(child)),
        ForkResult::Child => Ok(Worker::Child),
    }
}

/// Blocks until `pid` exits and returns a shell style exit code.
pub fn wait_worker(pid: Pid) -> Result<i32, MfaError> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                warn!(%pid, %signal, "mail filter worker killed");
                return Ok(128 + signal as i32);
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(MfaError::IoError(e.into())),
        }
    }
}

/// The configured account, or the fallback one.
pub fn resolve_user(cfg: &CfgAgent) -> Result<User, MfaError> {
    for name in [&cfg.user, &cfg.fallback_user] {
        let found = User::from_name(name).map_err(|e| MfaError::IoError(e.into()))?;
        if let Some(user) = found {
            return Ok(user);
        }
    }
    Err(MfaError::UnknownUser(cfg.user.clone()))
}

/// Switches to the unprivileged account for good.
///
/// Without root there is nothing to drop and the current identity is kept.
pub fn drop_privileges(cfg: &CfgAgent) -> Result<(), MfaError> {
    if !geteuid().is_root() {
        warn!(uid = %geteuid(), "not running as root, keeping current privileges");
        return Ok(());
    }

    let user = resolve_user(cfg)?;
    setgroups(&[user.gid])
        .and_then(|_| setresgid(user.gid, user.gid, user.gid))
        .and_then(|_| setresuid(user.uid, user.uid, user.uid))
        .map_err(MfaError::Privileges)?;

    info!(user = %user.name, uid = %user.uid, "dropped privileges");
    Ok(())
}
