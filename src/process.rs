//! Subprocess helpers shared by the renderer, encoder and remote storage backends.

use std::io::Read as _;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How a supervised child process ended.
#[derive(Debug)]
pub(crate) enum Exit {
    Finished { status: ExitStatus, stderr: String },
    /// The deadline passed; the child was killed and reaped.
    TimedOut,
}

impl Exit {
    pub(crate) fn success(&self) -> bool {
        matches!(self, Self::Finished { status, .. } if status.success())
    }
}

const POLL_MIN: Duration = Duration::from_millis(20);
const POLL_MAX: Duration = Duration::from_secs(1);
/// How long an untimed run waits for stderr to close after the child exits.
const DRAIN_GRACE: Duration = Duration::from_secs(5);
const DRAIN_MIN: Duration = Duration::from_millis(200);

/// Run `cmd` to completion, optionally killing it once `timeout` has elapsed.
///
/// stdin and stdout are detached; stderr is drained on a helper thread so a chatty child never
/// blocks on a full pipe. On Unix the child leads its own process group, so a timeout also takes
/// down wrapper-spawned grandchildren (`xvfb-run` forks the renderer).
pub(crate) fn run(cmd: &mut Command, timeout: Option<Duration>) -> std::io::Result<Exit> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        cmd.process_group(0);
    }
    let mut child = cmd.spawn()?;
    let drain = drain_stderr(&mut child);

    let Some(timeout) = timeout else {
        let status = child.wait()?;
        kill_group(&mut child);
        return Ok(Exit::Finished {
            status,
            stderr: join_drain(drain, Instant::now() + DRAIN_GRACE),
        });
    };

    let deadline = Instant::now() + timeout;
    let mut poll = POLL_MIN;
    loop {
        if let Some(status) = child.try_wait()? {
            // Descendants that inherited stderr would otherwise keep the drain (and us) waiting.
            kill_group(&mut child);
            return Ok(Exit::Finished {
                status,
                stderr: join_drain(drain, deadline.max(Instant::now() + DRAIN_MIN)),
            });
        }
        let now = Instant::now();
        if now >= deadline {
            if !kill_group(&mut child) {
                tracing::debug!(pid = child.id(), "failed to kill timed-out process group");
            }
            child.wait()?;
            // The drain thread is detached: a grandchild that escaped the group may still hold
            // the pipe open.
            drop(drain);
            return Ok(Exit::TimedOut);
        }
        std::thread::sleep(poll.min(deadline - now));
        poll = (poll * 2).min(POLL_MAX);
    }
}

/// Kill every process in the child's group and then the child itself.
///
/// Returns whether the group signal was delivered. Once the leader has been reaped this only
/// catches stragglers, and an empty group makes `kill` fail.
fn kill_group(child: &mut Child) -> bool {
    #[cfg(unix)]
    let delivered = {
        let group = format!("-{}", child.id());
        match Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => status.success(),
            Err(e) => {
                tracing::debug!(group = %group, error = %e, "could not run kill");
                false
            }
        }
    };
    #[cfg(not(unix))]
    let delivered = false;
    // Fails harmlessly once the child has been reaped.
    let killed = child.kill().is_ok();
    delivered || killed
}

fn drain_stderr(child: &mut Child) -> Option<JoinHandle<std::io::Result<Vec<u8>>>> {
    let mut stderr = child.stderr.take()?;
    Some(std::thread::spawn(move || {
        let mut bytes = Vec::new();
        stderr.read_to_end(&mut bytes)?;
        Ok(bytes)
    }))
}

/// Collect the drained stderr, giving up at `until`. A reader still blocked then is detached.
fn join_drain(drain: Option<JoinHandle<std::io::Result<Vec<u8>>>>, until: Instant) -> String {
    let Some(handle) = drain else {
        return String::new();
    };
    while !handle.is_finished() {
        let now = Instant::now();
        if now >= until {
            tracing::debug!("stderr still open after the child exited, detaching reader");
            return String::new();
        }
        std::thread::sleep(POLL_MIN.min(until - now));
    }
    let bytes = handle
        .join()
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).trim().to_string()
}

/// Return `true` when `program -version` can be spawned and exits cleanly.
pub fn is_on_path(program: &Path) -> bool {
    Command::new(program)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn captures_stderr_of_failed_child() {
        let exit = run(&mut sh("echo boom >&2; exit 3"), None).unwrap();
        match exit {
            Exit::Finished { status, stderr } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "boom");
            }
            Exit::TimedOut => panic!("unexpected timeout"),
        }
    }

    #[test]
    fn fast_child_beats_deadline() {
        let exit = run(&mut sh("exit 0"), Some(Duration::from_secs(5))).unwrap();
        assert!(exit.success());
    }

    #[test]
    fn slow_child_is_killed() {
        let start = Instant::now();
        let exit = run(&mut sh("sleep 30"), Some(Duration::from_millis(200))).unwrap();
        assert!(matches!(exit, Exit::TimedOut));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn background_grandchild_does_not_outlive_deadline() {
        let start = Instant::now();
        let exit = run(
            &mut sh("echo started >&2; sleep 20 & exit 0"),
            Some(Duration::from_secs(1)),
        )
        .unwrap();
        assert!(exit.success());
        assert!(start.elapsed() < Duration::from_secs(5), "{:?}", start.elapsed());
    }

    #[test]
    fn untimed_run_reaps_background_grandchild() {
        let start = Instant::now();
        let exit = run(&mut sh("sleep 20 & exit 0"), None).unwrap();
        assert!(exit.success());
        assert!(start.elapsed() < Duration::from_secs(10), "{:?}", start.elapsed());
    }
}
