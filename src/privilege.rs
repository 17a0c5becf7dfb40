//! Scoped privilege elevation (§9)
//!
//! The process starts with effective-uid == real-uid (dropped in
//! `main` immediately after the root check, §4.H step 1). Every
//! operation that needs root — routing table edits, resolver state,
//! spawning/killing PPPD — runs inside `as_root`, which restores the
//! original effective uid on every exit path, including unwind.

use nix::unistd::{geteuid, seteuid, Uid};
use std::io::Write;
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubprocessError {
    #[error("failed to elevate privileges: {0}")]
    Elevate(#[from] nix::Error),
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("{0} exited with status {1}")]
    NonZeroExit(String, i32),
}

/// Restores the caller's effective uid when dropped, regardless of how
/// the scope is exited.
struct RootGuard {
    restore_to: Uid,
}

impl RootGuard {
    fn acquire() -> Result<Self, SubprocessError> {
        let restore_to = geteuid();
        seteuid(Uid::from_raw(0))?;
        Ok(Self { restore_to })
    }
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        let _ = seteuid(self.restore_to);
    }
}

/// Runs `f` with effective uid 0, restoring the original euid
/// afterwards even if `f` panics.
pub fn as_root<T>(f: impl FnOnce() -> T) -> Result<T, SubprocessError> {
    let _guard = RootGuard::acquire()?;
    Ok(f())
}

/// Runs an external command with effective uid 0 and optional stdin,
/// checking its exit status. Mirrors the original's `run_as_root`.
pub fn run_as_root(args: &[&str], stdin: Option<&[u8]>) -> Result<(), SubprocessError> {
    let program = args[0];
    as_root(|| -> Result<(), SubprocessError> {
        let mut command = Command::new(program);
        command.args(&args[1..]);
        if stdin.is_some() {
            command.stdin(Stdio::piped());
        }
        command.stdout(Stdio::null());

        let mut child = command
            .spawn()
            .map_err(|e| SubprocessError::Spawn(program.to_string(), e))?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                let _ = pipe.write_all(input);
            }
        }

        let status = child
            .wait()
            .map_err(|e| SubprocessError::Spawn(program.to_string(), e))?;

        if status.success() {
            Ok(())
        } else {
            Err(SubprocessError::NonZeroExit(
                program.to_string(),
                status.code().unwrap_or(-1),
            ))
        }
    })?
}

/// Like `run_as_root`, but swallows failures — for teardown paths that
/// must stay idempotent even if the underlying state was never set up.
pub fn run_as_root_best_effort(args: &[&str], stdin: Option<&[u8]>) {
    if let Err(e) = run_as_root(args, stdin) {
        tracing::warn!("teardown command failed (ignored): {e}");
    }
}
