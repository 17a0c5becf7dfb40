//! PPPD supervisor (§4.E)
//!
//! Allocates a PTY, forks, and execs `pppd` as real root with the PTY
//! slave as its controlling terminal and fd 4 wired to a log pipe the
//! parent reads from.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::pty::openpty;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, execv, fork, pipe, setsid, ForkResult, Pid};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PppdError {
    #[error("failed to allocate pty: {0}")]
    Pty(String),
    #[error("fork failed: {0}")]
    Fork(String),
    #[error("waitpid failed: {0}")]
    Wait(String),
    #[error("failed to send signal: {0}")]
    Signal(String),
}

pub struct PppdHandle {
    pub pid: Pid,
    pub pty_master: OwnedFd,
    pub log_pipe_read: OwnedFd,
}

/// Forks and execs `/usr/sbin/pppd` attached to a fresh PTY. `tls_fd`
/// is explicitly closed in the child before exec so the TLS socket
/// isn't inherited. `override_gateway` selects `defaultroute` vs
/// `nodefaultroute`; `service_id` is only passed on macOS.
pub fn spawn_pppd(
    tls_fd: RawFd,
    override_gateway: bool,
    service_id: &str,
) -> Result<PppdHandle, PppdError> {
    let pty = openpty(None, None).map_err(|e| PppdError::Pty(e.to_string()))?;
    let (log_read, log_write) = pipe().map_err(|e| PppdError::Pty(e.to_string()))?;

    // Safety: the child only calls async-signal-safe functions (dup2,
    // setsid, close, execv) before replacing its image.
    match unsafe { fork() }.map_err(|e| PppdError::Fork(e.to_string()))? {
        ForkResult::Parent { child } => {
            drop(pty.slave);
            drop(log_write);
            Ok(PppdHandle {
                pid: child,
                pty_master: pty.master,
                log_pipe_read: log_read,
            })
        }
        ForkResult::Child => {
            drop(pty.master);
            drop(log_read);
            let _ = nix::unistd::close(tls_fd);

            let _ = setsid();
            let slave_fd = pty.slave.as_raw_fd();
            // setsid() leaves the new session without a controlling
            // terminal; dup2 alone doesn't assign one, so pppd would
            // never see a ctty to hang up on.
            let _ = unsafe { libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) };
            let _ = dup2(slave_fd, 0);
            let _ = dup2(slave_fd, 1);
            let _ = dup2(slave_fd, 2);
            let _ = dup2(log_write.as_raw_fd(), 4);

            let _ = nix::unistd::setuid(nix::unistd::Uid::from_raw(0));
            let _ = nix::unistd::seteuid(nix::unistd::Uid::from_raw(0));

            let mut args = vec![
                "pppd".to_string(),
                "logfd".to_string(),
                "4".to_string(),
                "noauth".to_string(),
                "nodetach".to_string(),
                "crtscts".to_string(),
                "passive".to_string(),
                "ipcp-accept-local".to_string(),
                "ipcp-accept-remote".to_string(),
                "nodeflate".to_string(),
                "novj".to_string(),
                "local".to_string(),
                "+ipv6".to_string(),
                (if override_gateway { "defaultroute" } else { "nodefaultroute" }).to_string(),
            ];
            if cfg!(target_os = "macos") {
                args.push("serviceid".to_string());
                args.push(service_id.to_string());
            }

            let c_args: Vec<CString> = args
                .iter()
                .map(|a| CString::new(a.as_str()).unwrap_or_default())
                .collect();
            let path = CString::new("/usr/sbin/pppd").unwrap();
            let _ = execv(&path, &c_args);
            // execv only returns on failure.
            std::process::exit(127);
        }
    }
}

/// Reaps `pid`, preferring a non-blocking check (the child may already
/// be dead) before sending `SIGTERM` and blocking for it.
pub fn shutdown_pppd(pid: Pid) -> Result<(), PppdError> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) | Err(_) => {
            if kill(pid, Signal::SIGTERM).is_ok() {
                let _ = waitpid(pid, None);
            }
            Ok(())
        }
        Ok(status) => {
            tracing::warn!("pppd exited unexpectedly: {status:?}");
            Ok(())
        }
    }
}
