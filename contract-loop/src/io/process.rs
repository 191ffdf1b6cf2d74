//! Helpers for running child processes with timeouts and bounded output.

use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const READER_GRACE: Duration = Duration::from_secs(1);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Stdin is fed and both output streams are drained on helper threads while the
/// child runs, so the timeout always applies. `output_limit_bytes` bounds the
/// stdout/stderr kept in memory (bytes beyond it are discarded while the pipe
/// is still drained). The child runs in its own process group; the child is
/// reaped and the whole group is killed before this returns, whatever the
/// outcome.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes = output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    isolate_process_group(&mut cmd);

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    let group = child.id();

    let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => (stdout, stderr),
        _ => {
            kill_and_reap(&mut child);
            return Err(anyhow!("stdout/stderr were not piped"));
        }
    };
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let stdin_handle = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut child_stdin)) => Some(thread::spawn(move || {
            // Dropping `child_stdin` at the end of the closure closes the pipe.
            write_stdin(&mut child_stdin, &input)
        })),
        (Some(_), None) => {
            kill_and_reap(&mut child);
            return Err(anyhow!("stdin was not piped"));
        }
        (None, _) => None,
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_group(group);
            if let Err(e) = child.kill() {
                // Already exited between the wait and the kill.
                debug!(err = %e, "kill after timeout");
            }
            child.wait().context("wait command after kill")?
        }
        Err(e) => {
            kill_and_reap(&mut child);
            return Err(e).context("wait for command");
        }
    };

    // Anything the tool started in the background dies with the call.
    if !timed_out {
        kill_group(group);
    }

    // A process that left the group may still hold the pipes open; helper
    // threads then get until the deadline (at least a short grace) and are
    // abandoned.
    let remaining = (started + timeout).saturating_duration_since(Instant::now());
    let join_deadline = Instant::now() + remaining.max(READER_GRACE);
    if let Some(handle) = stdin_handle {
        if !finished_by(&handle, join_deadline) {
            warn!("stdin writer still blocked after child exit, abandoning");
        } else {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(err = %e, "failed to write command stdin"),
                Err(_) => warn!("stdin writer thread panicked"),
            }
        }
    }
    let (stdout, stdout_truncated) =
        join_output(stdout_handle, join_deadline).context("join stdout")?;
    let (stderr, stderr_truncated) =
        join_output(stderr_handle, join_deadline).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn kill_and_reap(child: &mut Child) {
    kill_group(child.id());
    if let Err(e) = child.kill() {
        debug!(err = %e, "kill after failure");
    }
    if let Err(e) = child.wait() {
        debug!(err = %e, "reap after failure");
    }
}

/// Run the child as the leader of its own process group.
#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

/// SIGKILL every process left in the group led by `leader`.
#[cfg(unix)]
fn kill_group(leader: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(leader) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => debug!(pgid, "killed process group"),
        // Nothing left in the group.
        Err(Errno::ESRCH) => {}
        Err(e) => debug!(pgid, err = %e, "kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_leader: u32) {}

/// A child that exits without reading all of stdin closes the pipe early.
/// That is the child's choice, not a write failure.
fn write_stdin<W: Write>(writer: &mut W, input: &[u8]) -> Result<()> {
    match writer.write_all(input) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            debug!("child closed stdin before reading all input");
            Ok(())
        }
        Err(e) => Err(e).context("write stdin"),
    }
}

fn join_output(
    handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>,
    deadline: Instant,
) -> Result<(Vec<u8>, usize)> {
    if !finished_by(&handle, deadline) {
        warn!("output reader still blocked after child exit, abandoning");
        return Ok((Vec::new(), 0));
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn finished_by<T>(handle: &thread::JoinHandle<T>, deadline: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = match reader.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("read output"),
        };
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
