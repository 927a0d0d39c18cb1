// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::SpawnError;
use crate::Error;

/// How a process ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    Code(i32),
    Signal(i32),
    /// The process never started, treated as a zero length run
    SpawnFailed,
    /// The exit status could not be collected
    Unknown,
}

impl ExitStatus {
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Code(code) => Some(*code),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "code {}", code),
            ExitStatus::Signal(sig) => match Signal::try_from(*sig) {
                Ok(sig) => write!(f, "signal {}", sig),
                Err(_) => write!(f, "signal {}", sig),
            },
            ExitStatus::SpawnFailed => f.write_str("spawn failed"),
            ExitStatus::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResult {
    pub status: ExitStatus,
    /// How long the process ran
    pub duration: Duration,
}

impl ExitResult {
    pub fn spawn_failed() -> Self {
        Self {
            status: ExitStatus::SpawnFailed,
            duration: Duration::ZERO,
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => ExitStatus::Code(code),
            (None, Some(sig)) => ExitStatus::Signal(sig),
            (None, None) => ExitStatus::Unknown,
        }
    }
}

/// One spawned OS process
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    started: Instant,
}

impl ProcessHandle {
    /// Spawn `command` in `cwd`, stdout and stderr are piped and should be taken for logging
    pub fn spawn<S: AsRef<str>>(
        command: &str,
        args: &[S],
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<Self, Error> {
        // checked up front, otherwise this surfaces as a confusing NotFound for the executable
        if !cwd.is_dir() {
            return Err(SpawnError::CwdMissing(cwd.to_path_buf()).into());
        }

        let child = Command::new(command)
            .args(args.iter().map(AsRef::as_ref))
            .current_dir(cwd)
            .envs(env)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => SpawnError::ExecutableNotFound(command.to_string()),
                io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied(command.to_string()),
                _ => SpawnError::Io(command.to_string(), e),
            })?;

        let pid = child
            .id()
            .ok_or_else(|| Error::from("spawned process has no pid"))?;
        debug!("spawned {} as pid {}", command, pid);

        Ok(Self {
            child,
            pid,
            started: Instant::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Deliver `sig`, fails with `NotRunning` if the process has already exited
    pub fn signal(&self, sig: Signal) -> Result<(), Error> {
        // tokio clears the id once the child has been reaped
        if self.child.id().is_none() {
            return Err(Error::not_running(self.pid));
        }

        match kill(Pid::from_raw(self.pid as libc::pid_t), sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(Error::not_running(self.pid)),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for the process to exit
    ///
    /// Cancel safe, the future may be dropped and `wait` called again.
    pub async fn wait(&mut self) -> ExitResult {
        let status = match self.child.wait().await {
            Ok(status) => ExitStatus::from(status),
            Err(e) => {
                warn!("failed to collect exit status of {}: {}", self.pid, e);
                ExitStatus::Unknown
            }
        };

        ExitResult {
            status,
            duration: self.started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sh(script: &str) -> Result<ProcessHandle, Error> {
        ProcessHandle::spawn("sh", &["-c", script], Path::new("/"), &BTreeMap::new())
    }

    #[tokio::test]
    async fn test_exit_code() {
        let mut process = sh("exit 3").expect("spawn sh");
        let result = process.wait().await;

        assert_eq!(result.status, ExitStatus::Code(3));
        assert!(!result.status.success());
    }

    #[tokio::test]
    async fn test_signal_then_wait() {
        let mut process = sh("sleep 30").expect("spawn sh");
        process.signal(Signal::SIGTERM).expect("running");

        let result = process.wait().await;
        assert_eq!(result.status, ExitStatus::Signal(Signal::SIGTERM as i32));
        assert!(result.duration < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_signal_after_exit() {
        let mut process = sh("exit 0").expect("spawn sh");
        process.wait().await;

        let err = process.signal(Signal::SIGTERM).expect_err("already exited");
        assert!(matches!(err.kind(), ErrorKind::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_spawn_errors() {
        let err = ProcessHandle::spawn::<&str>(
            "/definitely/not/a/real/binary",
            &[],
            Path::new("/"),
            &BTreeMap::new(),
        )
        .expect_err("missing executable");
        assert!(matches!(
            err.kind(),
            ErrorKind::SpawnError(SpawnError::ExecutableNotFound(_))
        ));

        let err = ProcessHandle::spawn::<&str>(
            "sh",
            &[],
            Path::new("/definitely/not/a/real/dir"),
            &BTreeMap::new(),
        )
        .expect_err("missing cwd");
        assert!(matches!(
            err.kind(),
            ErrorKind::SpawnError(SpawnError::CwdMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_env_and_cwd() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut env = BTreeMap::new();
        env.insert("MINIUM_TEST".to_string(), "7".to_string());

        let mut process = ProcessHandle::spawn(
            "sh",
            &["-c", "test \"$MINIUM_TEST\" = 7 && test -d . && touch marker"],
            dir.path(),
            &env,
        )
        .expect("spawn sh");

        assert_eq!(process.wait().await.status, ExitStatus::Code(0));
        assert!(dir.path().join("marker").exists());
    }
}
