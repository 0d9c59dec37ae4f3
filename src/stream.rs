//! Relays a worker's output to the caller until a terminal cause occurs.

use crate::registry::PreemptRequest;
use crate::store::SessionStore;
use crate::supervisor::{LineRead, ProcessHandle, ProcessStatus};
use chrono::Utc;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{info, warn};

/// How often an otherwise quiet loop wakes up.
const TICK: Duration = Duration::from_millis(250);
/// Minimum spacing between liveness writes to the store.
const LIVENESS_REFRESH: Duration = Duration::from_secs(1);
/// How long lines are still collected after the worker exits.
const DRAIN_GRACE: Duration = Duration::from_secs(1);
/// Lines held for a slow caller before the worker's pipes stop being read.
const PENDING_LIMIT: usize = 16;
/// Longest the final events wait for a caller that stopped reading.
const FINAL_SEND_WAIT: Duration = Duration::from_secs(2);

/// An outbound event for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Data(String),
    /// Final marker; nothing follows it.
    Close,
}

/// Why a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalCause {
    Completed(Option<i32>),
    TimedOut,
    ClientDisconnected,
    Error(String),
}

enum Step {
    Line(String),
    Sent,
    StreamClosed,
    Exited(ProcessStatus),
    Disconnected,
    Deadline,
    Preempted(Option<PreemptRequest>),
    Tick,
}

/// Drives one session's worker to a terminal cause.
pub struct Multiplexer {
    store: SessionStore,
    session_id: String,
    deadline: Duration,
    kill_grace: Duration,
}

impl Multiplexer {
    pub fn new(store: SessionStore, session_id: &str, deadline: Duration, kill_grace: Duration) -> Self {
        Self {
            store,
            session_id: session_id.to_string(),
            deadline,
            kill_grace,
        }
    }

    /// Relay output until the worker exits, the deadline passes, the caller
    /// goes away, or the session is preempted. Sends `Close` last (unless
    /// the caller is gone) and never leaves the worker's group running.
    ///
    /// Lines are handed to the caller from inside the same race as the
    /// deadline and preemption, so a caller that stops reading stalls only
    /// its own output, never the terminal causes.
    pub async fn run(
        &self,
        handle: &mut ProcessHandle,
        tx: &mpsc::Sender<StreamEvent>,
        preempt: oneshot::Receiver<PreemptRequest>,
    ) -> TerminalCause {
        let deadline = sleep_until(Instant::now() + self.deadline);
        tokio::pin!(deadline);
        let mut preempt = preempt;
        let mut preempt_armed = true;
        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut exited: Option<(ProcessStatus, Instant)> = None;
        let mut last_refresh: Option<Instant> = None;
        let mut pending: VecDeque<String> = VecDeque::new();

        loop {
            self.refresh_liveness(&mut last_refresh).await;

            if let Some((status, at)) = exited {
                let drained = pending.is_empty()
                    && !handle.stdout.is_open()
                    && !handle.stderr.is_open();
                if drained || at.elapsed() >= DRAIN_GRACE {
                    return self.complete(handle, tx, status, pending).await;
                }
            }

            let reading = pending.len() < PENDING_LIMIT;
            let step = tokio::select! {
                biased;
                _ = tx.closed() => Step::Disconnected,
                _ = &mut deadline => Step::Deadline,
                request = &mut preempt, if preempt_armed => Step::Preempted(request.ok()),
                permit = tx.reserve(), if !pending.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(line) = pending.pop_front() {
                            permit.send(StreamEvent::Data(line));
                        }
                        Step::Sent
                    }
                    Err(_) => Step::Disconnected,
                },
                line = handle.stdout.next_line(), if reading && handle.stdout.is_open() => {
                    line.map(Step::Line).unwrap_or(Step::StreamClosed)
                }
                line = handle.stderr.next_line(), if reading && handle.stderr.is_open() => {
                    line.map(Step::Line).unwrap_or(Step::StreamClosed)
                }
                status = handle.child.wait(), if exited.is_none() => {
                    Step::Exited(match status {
                        Ok(status) => ProcessStatus::Exited(status.code()),
                        Err(e) => {
                            warn!(pid = handle.pid, "wait failed: {}", e);
                            ProcessStatus::Exited(None)
                        }
                    })
                }
                _ = ticker.tick() => Step::Tick,
            };

            match step {
                Step::Line(line) => {
                    pending.push_back(line);
                    // stderr that was ready alongside stdout goes out in the
                    // same turn.
                    if let LineRead::Line(line) = handle.stderr.try_read() {
                        pending.push_back(line);
                    }
                }
                Step::Sent | Step::StreamClosed | Step::Tick => {}
                Step::Exited(status) => exited = Some((status, Instant::now())),
                Step::Disconnected => return self.disconnected(handle).await,
                Step::Deadline => {
                    info!(session_id = %self.session_id, pid = handle.pid, "Worker deadline exceeded");
                    handle.terminate(self.kill_grace).await;
                    pending.push_back("Task timed out, killing process...".to_string());
                    self.send_final(tx, pending).await;
                    return TerminalCause::TimedOut;
                }
                Step::Preempted(None) => preempt_armed = false,
                Step::Preempted(Some(ack)) => {
                    info!(session_id = %self.session_id, pid = handle.pid, "Worker superseded");
                    handle.terminate(self.kill_grace).await;
                    let _ = ack.send(());
                    pending.push_back("error: worker superseded by a newer request".to_string());
                    self.send_final(tx, pending).await;
                    return TerminalCause::Error("superseded".to_string());
                }
            }
        }
    }

    async fn complete(
        &self,
        handle: &mut ProcessHandle,
        tx: &mpsc::Sender<StreamEvent>,
        status: ProcessStatus,
        mut pending: VecDeque<String>,
    ) -> TerminalCause {
        handle.kill_stragglers();
        let code = match status {
            ProcessStatus::Exited(code) => code,
            ProcessStatus::Running => None,
        };
        info!(session_id = %self.session_id, pid = handle.pid, ?code, "Worker completed");
        pending.push_back(match code {
            Some(0) => "Task completed.".to_string(),
            Some(code) => format!("Task completed (exit code {}).", code),
            None => "Task completed (terminated by signal).".to_string(),
        });
        self.send_final(tx, pending).await;
        TerminalCause::Completed(code)
    }

    /// Deliver the remaining lines and the close marker, giving up on a
    /// caller that does not read them in time.
    async fn send_final(&self, tx: &mpsc::Sender<StreamEvent>, lines: VecDeque<String>) {
        let delivery = async {
            for line in lines {
                if tx.send(StreamEvent::Data(line)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(StreamEvent::Close).await;
        };
        if tokio::time::timeout(FINAL_SEND_WAIT, delivery).await.is_err() {
            warn!(session_id = %self.session_id, "Caller stopped reading, dropping final events");
        }
    }

    async fn disconnected(&self, handle: &mut ProcessHandle) -> TerminalCause {
        info!(session_id = %self.session_id, pid = handle.pid, "Caller disconnected, killing worker");
        handle.terminate(self.kill_grace).await;
        TerminalCause::ClientDisconnected
    }

    async fn refresh_liveness(&self, last: &mut Option<Instant>) {
        if last.is_some_and(|at| at.elapsed() < LIVENESS_REFRESH) {
            return;
        }
        *last = Some(Instant::now());
        if let Err(e) = self.store.touch(&self.session_id, Utc::now()).await {
            warn!(session_id = %self.session_id, "Liveness refresh failed: {}", e);
        }
    }
}
