//! Worker process supervision.
//!
//! A worker runs in its own process group so the whole tree can be signalled
//! at once. Each output pipe is drained by a reader task into a channel; the
//! stream multiplexer waits on those channels directly instead of polling.

use crate::error::ProcessStartError;
use crate::process_signal::{group_alive, signal_group};
use nix::sys::signal::Signal;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const LINE_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Result of a non-blocking line read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    Line(String),
    /// Nothing buffered yet; the stream is still open.
    Pending,
    /// The worker closed this stream and every line has been consumed.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// Exit code, or `None` when the worker died from a signal.
    Exited(Option<i32>),
}

/// Buffered lines from one of a worker's output pipes.
pub struct LineReader {
    rx: mpsc::Receiver<String>,
    open: bool,
}

impl LineReader {
    fn spawn<R>(reader: R, stream: OutputStream, pid: u32) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(pid, ?stream, "Worker pipe read failed: {}", e);
                        break;
                    }
                }
            }
            debug!(pid, ?stream, "Worker pipe closed");
        });
        Self { rx, open: true }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn try_read(&mut self) -> LineRead {
        if !self.open {
            return LineRead::Closed;
        }
        match self.rx.try_recv() {
            Ok(line) => LineRead::Line(line),
            Err(mpsc::error::TryRecvError::Empty) => LineRead::Pending,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.open = false;
                LineRead::Closed
            }
        }
    }

    /// Wait for the next line. `None` once the stream is closed and drained.
    pub async fn next_line(&mut self) -> Option<String> {
        if !self.open {
            return None;
        }
        let line = self.rx.recv().await;
        if line.is_none() {
            self.open = false;
        }
        line
    }
}

/// A running worker.
pub struct ProcessHandle {
    pub worker_id: String,
    pub pid: u32,
    pub(crate) child: Child,
    pub stdout: LineReader,
    pub stderr: LineReader,
}

impl ProcessHandle {
    pub fn read_line(&mut self, stream: OutputStream) -> LineRead {
        match stream {
            OutputStream::Stdout => self.stdout.try_read(),
            OutputStream::Stderr => self.stderr.try_read(),
        }
    }

    pub fn poll(&mut self) -> ProcessStatus {
        match self.child.try_wait() {
            Ok(Some(status)) => ProcessStatus::Exited(status.code()),
            Ok(None) => ProcessStatus::Running,
            Err(e) => {
                warn!(pid = self.pid, "try_wait failed: {}", e);
                ProcessStatus::Exited(None)
            }
        }
    }

    /// Wait for the group leader to exit.
    pub async fn wait(&mut self) -> ProcessStatus {
        match self.child.wait().await {
            Ok(status) => ProcessStatus::Exited(status.code()),
            Err(e) => {
                warn!(pid = self.pid, "wait failed: {}", e);
                ProcessStatus::Exited(None)
            }
        }
    }

    /// SIGTERM the process group, then SIGKILL it if the leader is still
    /// running after `grace`. Returns once the leader has been reaped and no
    /// member of the group survives.
    pub async fn terminate(&mut self, grace: Duration) -> ProcessStatus {
        if let ProcessStatus::Exited(code) = self.poll() {
            self.kill_stragglers();
            return ProcessStatus::Exited(code);
        }

        info!(pid = self.pid, worker_id = %self.worker_id, "Terminating worker");
        if let Err(e) = signal_group(self.pid, Signal::SIGTERM) {
            warn!(pid = self.pid, "SIGTERM failed: {}", e);
        }

        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => ProcessStatus::Exited(status.code()),
            Ok(Err(e)) => {
                warn!(pid = self.pid, "wait failed: {}", e);
                ProcessStatus::Exited(None)
            }
            Err(_) => {
                warn!(pid = self.pid, "Worker ignored SIGTERM, killing process group");
                self.kill().await
            }
        };
        self.kill_stragglers();
        status
    }

    /// SIGKILL the whole process group and reap the leader.
    pub async fn kill(&mut self) -> ProcessStatus {
        if let Err(e) = signal_group(self.pid, Signal::SIGKILL) {
            warn!(pid = self.pid, "SIGKILL failed: {}", e);
        }
        self.wait().await
    }

    /// Children that outlived the leader still belong to its group.
    pub fn kill_stragglers(&self) {
        if group_alive(self.pid) {
            debug!(pid = self.pid, "Killing leftover processes in worker group");
            let _ = signal_group(self.pid, Signal::SIGKILL);
        }
    }
}

/// Launches workers bound to a sandbox's control endpoint.
#[derive(Debug, Clone)]
pub struct Supervisor {
    command: Vec<String>,
}

impl Supervisor {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// Start a worker. The task payload is passed as a single compact JSON
    /// argument with `cdp_url` set to the sandbox's control endpoint.
    pub fn start(
        &self,
        control_endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<ProcessHandle, ProcessStartError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(ProcessStartError::EmptyCommand)?;

        let mut payload = payload.clone();
        payload
            .as_object_mut()
            .ok_or(ProcessStartError::InvalidPayload)?
            .insert(
                "cdp_url".to_string(),
                serde_json::Value::String(control_endpoint.to_string()),
            );
        let payload = serde_json::to_string(&payload)?;

        let mut child = Command::new(program)
            .args(args)
            .arg(payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;

        // A spawned child always has a pid until it is reaped.
        let pid = child.id().unwrap_or_default();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("stderr not captured"))?;

        let worker_id = uuid::Uuid::new_v4().to_string();
        info!(pid, worker_id = %worker_id, control = %control_endpoint, "Worker started");

        Ok(ProcessHandle {
            worker_id,
            pid,
            child,
            stdout: LineReader::spawn(stdout, OutputStream::Stdout, pid),
            stderr: LineReader::spawn(stderr, OutputStream::Stderr, pid),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shell(script: &str) -> Supervisor {
        Supervisor::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "worker".to_string(),
        ])
    }

    async fn collect(reader: &mut LineReader) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn captures_both_streams_in_order() {
        let supervisor = shell("echo one; echo warn >&2; echo two; echo three");
        let mut handle = supervisor
            .start("ws://localhost:9333", &json!({"task": "t"}))
            .unwrap();

        assert_eq!(collect(&mut handle.stdout).await, vec!["one", "two", "three"]);
        assert_eq!(collect(&mut handle.stderr).await, vec!["warn"]);
        assert_eq!(handle.wait().await, ProcessStatus::Exited(Some(0)));
        assert_eq!(handle.read_line(OutputStream::Stdout), LineRead::Closed);
    }

    #[tokio::test]
    async fn payload_carries_control_endpoint() {
        // $1 is the JSON payload appended after the configured arguments.
        let supervisor = shell("echo \"$1\"");
        let mut handle = supervisor
            .start("ws://host:1234", &json!({"task": "search"}))
            .unwrap();
        let lines = collect(&mut handle.stdout).await;
        let echoed: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(echoed["task"], "search");
        assert_eq!(echoed["cdp_url"], "ws://host:1234");
    }

    #[tokio::test]
    async fn read_line_does_not_block() {
        let supervisor = shell("sleep 5");
        let mut handle = supervisor.start("ws://x", &json!({})).unwrap();
        assert_eq!(handle.read_line(OutputStream::Stdout), LineRead::Pending);
        assert_eq!(handle.poll(), ProcessStatus::Running);
        handle.kill().await;
    }

    #[tokio::test]
    async fn terminate_escalates_and_kills_children() {
        // Ignores SIGTERM and leaves a background child in the group.
        let supervisor = shell("trap '' TERM; sleep 30 & echo ready; wait");
        let mut handle = supervisor.start("ws://x", &json!({})).unwrap();
        assert_eq!(handle.stdout.next_line().await.as_deref(), Some("ready"));

        let status = handle.terminate(Duration::from_millis(200)).await;
        assert!(matches!(status, ProcessStatus::Exited(_)));
        // The background sleep held the pipe open; it closes only once the
        // whole group is dead.
        let drained = tokio::time::timeout(Duration::from_secs(2), handle.stdout.next_line()).await;
        assert_eq!(drained, Ok(None));
    }

    #[test]
    fn rejects_empty_command_and_non_object_payload() {
        let empty = Supervisor::new(Vec::new());
        assert!(matches!(
            empty.start("ws://x", &json!({})),
            Err(ProcessStartError::EmptyCommand)
        ));
        let sh = shell("true");
        assert!(matches!(
            sh.start("ws://x", &json!(["not", "an", "object"])),
            Err(ProcessStartError::InvalidPayload)
        ));
    }

    #[tokio::test]
    async fn missing_program_is_a_start_error() {
        let supervisor = Supervisor::new(vec!["/nonexistent/worker-binary".to_string()]);
        assert!(matches!(
            supervisor.start("ws://x", &json!({})),
            Err(ProcessStartError::Spawn(_))
        ));
    }
}
