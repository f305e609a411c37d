//! Helpers for running child processes with timeouts and bounded output.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long output pipes may stay open after the child exits before its
/// process group is killed.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

type OutputResult = Result<(Vec<u8>, usize)>;

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

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Stdin is fed and output is read concurrently while the child runs. `output_limit_bytes`
/// bounds the amount of stdout/stderr stored in memory (bytes beyond this are discarded while
/// still draining the pipe).
///
/// On unix the child leads its own process group. A timeout kills the whole group, and so
/// does a pipe still held open `OUTPUT_DRAIN_GRACE` after the child exits, so background
/// grandchildren cannot stretch a call much beyond `timeout`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            // A child that exits without reading stdin closes the pipe; that
            // is not an error for the caller.
            Some(thread::spawn(move || {
                if let Err(e) = child_stdin.write_all(&input) {
                    debug!(err = %e, "child closed stdin early");
                }
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_rx = spawn_reader(stdout, output_limit_bytes);
    let stderr_rx = spawn_reader(stderr, output_limit_bytes);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(&mut child);
            child.wait().context("wait command after kill")?
        }
    };

    let drain_deadline = Instant::now() + OUTPUT_DRAIN_GRACE;
    let mut stdout_result = recv_until(&stdout_rx, drain_deadline);
    let mut stderr_result = recv_until(&stderr_rx, drain_deadline);
    if stdout_result.is_none() || stderr_result.is_none() {
        warn!("output pipes still open after the command exited, killing its process group");
        kill_process_group(&mut child);
        let retry_deadline = Instant::now() + OUTPUT_DRAIN_GRACE;
        stdout_result = stdout_result.or_else(|| recv_until(&stdout_rx, retry_deadline));
        stderr_result = stderr_result.or_else(|| recv_until(&stderr_rx, retry_deadline));
    }

    if let Some(handle) = stdin_handle {
        if handle.is_finished() {
            if handle.join().is_err() {
                warn!("stdin writer thread panicked");
            }
        } else {
            debug!("stdin writer still blocked, detaching");
        }
    }
    let (stdout, stdout_truncated) = abandoned_or(stdout_result, "stdout")?;
    let (stderr, stderr_truncated) = abandoned_or(stderr_result, "stderr")?;

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

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> Receiver<OutputResult> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver is gone once the caller abandoned this pipe.
        let _ = tx.send(read_stream_limited(reader, limit));
    });
    rx
}

/// `None` when the reader is still blocked at `deadline`.
fn recv_until(rx: &Receiver<OutputResult>, deadline: Instant) -> Option<OutputResult> {
    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(result) => Some(result),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => Some(Err(anyhow!("output reader thread panicked"))),
    }
}

fn abandoned_or(result: Option<OutputResult>, stream: &str) -> OutputResult {
    match result {
        Some(result) => result.with_context(|| format!("read {stream}")),
        None => {
            warn!(stream, "abandoning output pipe held open by a detached process");
            Ok((Vec::new(), 0))
        }
    }
}

/// Kill the child's process group, then the child itself.
fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        match Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => debug!(code = ?status.code(), "kill of process group failed"),
            Err(e) => warn!(err = %e, "failed to run kill for process group"),
        }
    }
    if let Err(e) = child.kill() {
        debug!(err = %e, "child already exited");
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
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

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_feeds_stdin() {
        let output = run_command_with_timeout(
            sh("cat; echo err >&2"),
            Some(b"hello"),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout_lossy(), "hello");
        assert_eq!(output.stderr_lossy(), "err\n");
        assert!(!output.timed_out);
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let output = run_command_with_timeout(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 6);
        assert!(output.stdout_truncated_notice("tool").contains("truncated 6 bytes"));
    }

    #[test]
    fn kills_command_on_timeout() {
        let output = run_command_with_timeout(
            sh("exec sleep 5"),
            None,
            Duration::from_millis(200),
            1024,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
    }

    /// The shell forks `sleep` instead of exec'ing it, so the grandchild holds
    /// the output pipes after the shell is killed.
    #[test]
    fn timeout_kills_grandchildren_holding_pipes() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 6; echo done"),
            None,
            Duration::from_secs(1),
            1024,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
        assert!(!output.stdout_lossy().contains("done"));
    }

    #[test]
    fn background_process_cannot_hold_output_open() {
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 8 & echo started"),
            None,
            Duration::from_secs(1),
            1024,
        )
        .expect("run");
        assert!(!output.timed_out);
        assert!(output.status.success());
        assert_eq!(output.stdout_lossy(), "started\n");
        assert!(started.elapsed() < Duration::from_secs(6), "{:?}", started.elapsed());
    }
}
