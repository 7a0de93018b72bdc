//! Abortable child-process execution.
//!
//! `qemu-img`, `fallocate` and friends run as child processes; a task
//! abort must be able to interrupt them mid-flight. Each run registers a
//! kill handle as the owning task's abort callback, so `Task::abort`
//! terminates the child and the waiting thread sees the run fail with
//! [`Error::ActionStopped`].

#![allow(unsafe_code)]

use std::process::{Command, Output, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::task::Task;
use crate::{Error, Result};

/// Kill handle shared between the waiting thread and the abort path.
#[derive(Debug, Default)]
struct OpState {
    pid: Mutex<Option<i32>>,
    aborted: AtomicBool,
}

impl OpState {
    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        if let Some(pid) = *self.pid.lock() {
            warn!(pid, "killing aborted child process");
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
    }
}

/// Runs `cmd` to completion, abortable through `task`.
pub fn run_abortable(cmd: Command, cmd_name: &str, task: &Task) -> Result<Output> {
    let state = Arc::new(OpState::default());
    let state_for_abort = Arc::clone(&state);
    let _guard = task.abort_callback(move || state_for_abort.abort());
    task.check_abort()?;
    run_with_state(cmd, cmd_name, &state)
}

/// Runs `cmd` to completion with no abort surface.
pub fn run(cmd: Command, cmd_name: &str) -> Result<Output> {
    run_with_state(cmd, cmd_name, &OpState::default())
}

fn run_with_state(mut cmd: Command, cmd_name: &str, state: &OpState) -> Result<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let child = cmd.spawn()?;

    {
        let mut pid = state.pid.lock();
        *pid = Some(child.id() as i32);
        // An abort that raced the spawn set the flag but had no pid to
        // kill; finish the job for it.
        if state.aborted.load(Ordering::SeqCst) {
            unsafe {
                libc::kill(child.id() as i32, libc::SIGKILL);
            }
        }
    }

    let output = child.wait_with_output()?;
    *state.pid.lock() = None;

    if state.aborted.load(Ordering::SeqCst) {
        return Err(Error::ActionStopped);
    }
    if !output.status.success() {
        return Err(Error::Command {
            cmd: cmd_name.to_owned(),
            rc: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(output)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let out = run(cmd, "echo").unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hello");
    }

    #[test]
    fn nonzero_exit_is_command_error() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo oops >&2; exit 3"]);
        let err = run(cmd, "sh").unwrap_err();
        match err {
            Error::Command { rc, stderr, .. } => {
                assert_eq!(rc, 3);
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn abort_kills_running_child() {
        let task = Arc::new(Task::new());
        let task_clone = Arc::clone(&task);
        let aborter = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(100));
            task_clone.abort();
        });

        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let started = std::time::Instant::now();
        let err = run_abortable(cmd, "sleep", &task).unwrap_err();
        assert!(matches!(err, Error::ActionStopped));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        aborter.join().unwrap();
    }

    #[test]
    fn aborted_task_refuses_to_start() {
        let task = Task::new();
        task.abort();
        let err = run_abortable(Command::new("true"), "true", &task).unwrap_err();
        assert!(matches!(err, Error::ActionStopped));
    }
}
