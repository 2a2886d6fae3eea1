use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::dispatch::CancelToken;
use crate::error::CoreError;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const INSTALL_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
pub const RECORDING_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
pub const SCREENSHOT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .chain(self.stderr.lines())
            .map(|line| line.to_string())
            .collect()
    }

    /// Map a non-zero exit into the typed error, carrying the output tail.
    pub fn require_success(&self, command: &str) -> Result<(), CoreError> {
        let code = self.exit_code.unwrap_or(-1);
        if code == 0 {
            return Ok(());
        }
        Err(CoreError::NonZeroExit {
            command: command.to_string(),
            code,
            tail: output_tail(&self.stdout, &self.stderr),
        })
    }
}

fn output_tail(stdout: &str, stderr: &str) -> String {
    let combined = if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    };
    const TAIL_LEN: usize = 400;
    if combined.len() <= TAIL_LEN {
        combined.to_string()
    } else {
        let start = combined.len() - TAIL_LEN;
        let mut index = start;
        while !combined.is_char_boundary(index) {
            index += 1;
        }
        combined[index..].to_string()
    }
}

fn drain_pipe(mut reader: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 4096];
        loop {
            match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
                Err(_) => break,
            }
        }
        buffer
    })
}

fn spawn_error(program: &str, err: &std::io::Error) -> CoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        CoreError::AdbMissing {
            program: program.to_string(),
        }
    } else {
        CoreError::io(format!("failed to spawn {program}: {err}"))
    }
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<CommandOutput, CoreError> {
    run_command_cancellable(program, args, timeout, &CancelToken::new())
}

/// Run a child process, draining stdout/stderr concurrently so a chatty child
/// never blocks on a full pipe, and polling for timeout and cancellation.
pub fn run_command_cancellable(
    program: &str,
    args: &[String],
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<CommandOutput, CoreError> {
    let start = Instant::now();
    let raw = run_command_raw(program, args, timeout, cancel)?;
    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&raw.stdout).to_string(),
        stderr: String::from_utf8_lossy(&raw.stderr).to_string(),
        exit_code: raw.exit_code,
        duration: start.elapsed(),
    })
}

fn display_command(program: &str, args: &[String]) -> String {
    let mut parts = vec![program.to_string()];
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

/// Invocation seam shared by the executors and workers: args in, output out,
/// with the adb program baked in. Tests substitute scripted invokers.
pub type AdbInvoker = Arc<
    dyn Fn(&[String], Duration, &CancelToken) -> Result<CommandOutput, CoreError> + Send + Sync,
>;

pub fn adb_invoker(program: impl Into<String>) -> AdbInvoker {
    let program = program.into();
    Arc::new(move |args, timeout, token| run_command_cancellable(&program, args, timeout, token))
}

/// Byte-preserving output for commands whose stdout is binary (exec-out).
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
}

pub type RawInvoker = Arc<
    dyn Fn(&[String], Duration, &CancelToken) -> Result<RawOutput, CoreError> + Send + Sync,
>;

pub fn raw_invoker(program: impl Into<String>) -> RawInvoker {
    let program = program.into();
    Arc::new(move |args, timeout, token| run_command_raw(&program, args, timeout, token))
}

pub fn run_command_raw(
    program: &str,
    args: &[String],
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<RawOutput, CoreError> {
    let command_line = display_command(program, args);
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| spawn_error(program, &err))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CoreError::io("failed to capture stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| CoreError::io("failed to capture stderr"))?;
    let stdout_handle = drain_pipe(stdout);
    let stderr_handle = drain_pipe(stderr);

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if cancel.is_cancelled() {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(CoreError::Cancelled);
                }
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(CoreError::timeout(command_line, start.elapsed()));
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(CoreError::io(format!("failed to poll command: {err}")));
            }
        }
    };

    Ok(RawOutput {
        stdout: stdout_handle.join().unwrap_or_default(),
        stderr: stderr_handle.join().unwrap_or_default(),
        exit_code,
    })
}

const SERVER_DEAD_SIGNATURES: [&str; 3] = [
    "cannot connect to daemon",
    "adb server is out of date",
    "server died",
];

fn looks_like_dead_server(output: &CommandOutput) -> bool {
    let haystack = format!("{}\n{}", output.stdout, output.stderr).to_lowercase();
    SERVER_DEAD_SIGNATURES
        .iter()
        .any(|signature| haystack.contains(signature))
}

/// Run an adb command; if the output points at a dead server, restart it once
/// (`kill-server` + `start-server`) and retry before surfacing the failure.
pub fn run_adb_with_server_recovery(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<CommandOutput, CoreError> {
    let output = run_command_with_timeout(program, args, timeout)?;
    if output.exit_code == Some(0) || !looks_like_dead_server(&output) {
        return Ok(output);
    }
    warn!("adb server appears dead; attempting restart");
    let _ = run_command_with_timeout(program, &["kill-server".to_string()], timeout);
    let restart =
        run_command_with_timeout(program, &["start-server".to_string()], timeout)?;
    debug!(exit_code = ?restart.exit_code, "adb start-server finished");
    run_command_with_timeout(program, args, timeout)
}

/// Long-lived child whose stdout is streamed line-by-line. Cancelling kills
/// the child, which unblocks and terminates the reader.
pub struct StreamingChild {
    child: Arc<Mutex<Option<Child>>>,
    lines_rx: Receiver<String>,
    reader: Option<JoinHandle<()>>,
}

impl StreamingChild {
    pub fn lines(&self) -> &Receiver<String> {
        &self.lines_rx
    }

    pub fn next_line(&self, timeout: Duration) -> Option<String> {
        self.lines_rx.recv_timeout(timeout).ok()
    }

    pub fn cancel(&mut self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        if let Some(join) = self.reader.take() {
            let _ = join.join();
        }
    }

    /// Shared slot for registering the kill on a cancel token.
    pub fn child_slot(&self) -> Arc<Mutex<Option<Child>>> {
        Arc::clone(&self.child)
    }
}

impl Drop for StreamingChild {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub fn run_streaming(program: &str, args: &[String]) -> Result<StreamingChild, CoreError> {
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| spawn_error(program, &err))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CoreError::io("failed to capture stdout"))?;
    let child_slot = Arc::new(Mutex::new(Some(child)));
    let (tx, rx) = channel();

    let reader = thread::spawn(move || {
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    Ok(StreamingChild {
        child: child_slot,
        lines_rx: rx,
        reader: Some(reader),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn does_not_deadlock_on_large_stdout() {
        // If stdout is piped but not drained, the child can block once the
        // pipe buffer fills and a fast command appears to hang until timeout.
        let args = vec![
            "-c".to_string(),
            "i=0; while [ $i -lt 100000 ]; do echo 1234567890; i=$((i+1)); done".to_string(),
        ];
        let output = run_command_with_timeout("sh", &args, Duration::from_secs(10))
            .expect("large-output command should finish");
        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.len() >= 1_000_000);
    }

    #[test]
    fn times_out_and_reports_command() {
        let args = vec!["-c".to_string(), "sleep 5".to_string()];
        let err = run_command_with_timeout("sh", &args, Duration::from_millis(200))
            .expect_err("should time out");
        match err {
            CoreError::Timeout { command, .. } => assert!(command.contains("sleep 5")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_binary_maps_to_adb_missing() {
        let err = run_command_with_timeout(
            "/definitely/not/a/real/adb",
            &["version".to_string()],
            Duration::from_secs(1),
        )
        .expect_err("should fail to spawn");
        assert!(matches!(err, CoreError::AdbMissing { .. }));
    }

    #[test]
    fn cancellation_kills_the_child() {
        let token = CancelToken::new();
        let token_clone = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            token_clone.cancel();
        });
        let args = vec!["-c".to_string(), "sleep 5".to_string()];
        let start = Instant::now();
        let err = run_command_cancellable("sh", &args, Duration::from_secs(10), &token)
            .expect_err("should be cancelled");
        assert!(matches!(err, CoreError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn streaming_child_delivers_lines_and_cancels() {
        let args = vec![
            "-c".to_string(),
            "echo one; echo two; sleep 5".to_string(),
        ];
        let mut stream = run_streaming("sh", &args).expect("spawn");
        assert_eq!(stream.next_line(Duration::from_secs(2)).as_deref(), Some("one"));
        assert_eq!(stream.next_line(Duration::from_secs(2)).as_deref(), Some("two"));
        stream.cancel();
    }

    #[test]
    fn require_success_carries_tail() {
        let args = vec!["-c".to_string(), "echo oops >&2; exit 3".to_string()];
        let output =
            run_command_with_timeout("sh", &args, Duration::from_secs(5)).expect("run");
        let err = output.require_success("sh -c ...").expect_err("non-zero");
        match err {
            CoreError::NonZeroExit { code, tail, .. } => {
                assert_eq!(code, 3);
                assert!(tail.contains("oops"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
