//! Helpers for running child processes with timeouts, bounded output, and a
//! line observer that can force termination.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::ops::ControlFlow;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const READER_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// The observer returned `ControlFlow::Break` and the child was killed.
    pub aborted: bool,
}

impl CommandOutput {
    pub fn stderr_tail(&self, max_bytes: usize) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let text = text.trim();
        let mut start = text.len().saturating_sub(max_bytes);
        while !text.is_char_boundary(start) {
            start += 1;
        }
        text[start..].to_string()
    }
}

/// Parameters for [`run_streaming`].
pub struct StreamingCommand<'a> {
    pub cmd: Command,
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// When set, every stdout line is appended to this file as it arrives.
    pub tee_path: Option<&'a Path>,
}

/// Run a command, handing each stdout line to `on_line` as it arrives.
///
/// Returning `ControlFlow::Break` from `on_line` kills the child immediately
/// (no grace period). The child is always reaped before this returns, on
/// normal exit, timeout, or abort.
#[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), output_limit_bytes = request.output_limit_bytes, tee = request.tee_path.is_some()))]
pub fn run_streaming<F>(request: StreamingCommand<'_>, mut on_line: F) -> Result<CommandOutput>
where
    F: FnMut(&str) -> ControlFlow<()>,
{
    let StreamingCommand {
        mut cmd,
        stdin,
        timeout,
        output_limit_bytes,
        tee_path,
    } = request;
    // `None` when the timeout is too large to represent: wait without a deadline.
    let deadline = Instant::now().checked_add(timeout);

    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut tee = match tee_path {
        Some(path) => Some(open_tee(path)?),
        None => None,
    };

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let child_stdin = match stdin {
        Some(_) => Some(
            child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?,
        ),
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

    let (line_tx, line_rx) = mpsc::channel::<String>();
    let stdout_handle = thread::spawn(move || forward_lines(stdout, line_tx));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    // Written from its own thread so a child that fills stdout before
    // reading stdin cannot block us.
    let stdin_handle = child_stdin.zip(stdin).map(|(mut pipe, input)| {
        let input = input.to_vec();
        thread::spawn(move || pipe.write_all(&input))
    });

    let mut collected = Vec::new();
    let mut stdout_truncated = 0usize;
    let mut timed_out = false;
    let mut aborted = false;

    loop {
        let received = match deadline {
            Some(deadline) => line_rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => line_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(line) => {
                if let Some(writer) = tee.as_mut()
                    && let Err(e) = writer.write_all(line.as_bytes()).and_then(|()| writer.flush())
                {
                    warn!(err = %e, "failed to write to tee file");
                }
                stdout_truncated += append_limited(&mut collected, line.as_bytes(), output_limit_bytes);
                if on_line(line.trim_end_matches(['\n', '\r'])).is_break() {
                    warn!("observer requested abort, killing child");
                    aborted = true;
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
                timed_out = true;
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = if aborted || timed_out {
        kill_and_reap(&mut child).ok_or_else(|| anyhow!("wait command after kill"))?
    } else {
        let waited = match deadline {
            Some(deadline) => child
                .wait_timeout(deadline.saturating_duration_since(Instant::now()))
                .context("wait for command")?,
            None => Some(child.wait().context("wait for command")?),
        };
        match waited {
            Some(status) => status,
            None => {
                warn!(timeout_secs = timeout.as_secs(), "command timed out after closing stdout, killing");
                timed_out = true;
                kill_and_reap(&mut child).ok_or_else(|| anyhow!("wait command after kill"))?
            }
        }
    };

    drop(line_rx);
    // A killed child's descendants may still hold the pipes open, so readers
    // only get a short grace period before being detached.
    let killed = aborted || timed_out;
    let stderr_result = if killed {
        join_within(stderr_handle, READER_GRACE)
    } else {
        Some(join_thread(stderr_handle).context("join stderr")?)
    };
    if killed {
        if join_within(stdout_handle, READER_GRACE).is_none() {
            debug!("stdout still held open by a descendant, detaching reader");
        }
    } else {
        join_thread(stdout_handle).context("join stdout")?;
    }
    if let Some(handle) = stdin_handle {
        let written = if killed {
            join_within(handle, READER_GRACE)
        } else {
            Some(join_thread(handle).context("join stdin writer")?)
        };
        if let Some(Err(err)) = written {
            // A child that exits without reading all of stdin reports through its status.
            if killed || err.kind() == std::io::ErrorKind::BrokenPipe {
                debug!(err = %err, "stdin not fully written");
            } else {
                return Err(err).context("write stdin");
            }
        }
    }
    let (stderr, stderr_truncated) = match stderr_result {
        Some(result) => result.context("read stderr")?,
        None => (Vec::new(), 0),
    };

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, aborted, "command finished");
    Ok(CommandOutput {
        status,
        stdout: collected,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        aborted,
    })
}

fn open_tee(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create stream dir {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("create stream file {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn kill_and_reap(child: &mut Child) -> Option<ExitStatus> {
    if let Err(e) = child.kill() {
        debug!(err = %e, "kill failed (child may have already exited)");
    }
    match child.wait() {
        Ok(status) => Some(status),
        Err(e) => {
            error!(err = %e, "failed to reap child");
            None
        }
    }
}

fn join_within<T>(handle: thread::JoinHandle<T>, grace: Duration) -> Option<T> {
    let deadline = Instant::now() + grace;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
    handle.join().ok()
}

fn join_thread<T>(handle: thread::JoinHandle<T>) -> Result<T> {
    handle
        .join()
        .map_err(|_| anyhow!("pipe thread panicked"))
}

/// Forward stdout line by line; stops quietly once the receiver is gone.
fn forward_lines<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    loop {
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                    // Keep draining so the child never blocks on a full pipe.
                    let _ = std::io::copy(&mut reader, &mut std::io::sink());
                    break;
                }
            }
            Err(e) => {
                warn!(err = %e, "read stdout failed");
                break;
            }
        }
    }
}

/// Append up to the limit; returns the number of bytes dropped.
fn append_limited(buf: &mut Vec<u8>, chunk: &[u8], limit: usize) -> usize {
    let remaining = limit.saturating_sub(buf.len());
    let keep = chunk.len().min(remaining);
    buf.extend_from_slice(&chunk[..keep]);
    chunk.len() - keep
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
        truncated += append_limited(&mut buf, &chunk[..n], limit);
    }

    Ok((buf, truncated))
}
