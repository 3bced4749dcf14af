//! Restart state machine and the coordinator that drives it.
//!
//! ```text
//! RUNNING ──sentinel / crash──▶ TERMINATING ──▶ SPAWNING ──▶ REPLAYING ──▶ RUNNING
//! ```
//!
//! Exactly one coordinator task consumes [`WorkerEvent`]s, one at a time, so
//! two restarts can never interleave. Events are tagged with the generation
//! of the worker that produced them; anything not from the live generation
//! is stale and ignored.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::{ProxyError, Result};
use crate::proxy::Proxy;
use crate::worker::{Supervisor, WorkerEvent};

// ─── RestartState ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RestartState {
    Spawning = 0,
    Running = 1,
    Terminating = 2,
    Replaying = 3,
    ShuttingDown = 4,
}

impl RestartState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RestartState::Running,
            2 => RestartState::Terminating,
            3 => RestartState::Replaying,
            4 => RestartState::ShuttingDown,
            _ => RestartState::Spawning,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RestartState::Spawning => "spawning",
            RestartState::Running => "running",
            RestartState::Terminating => "terminating",
            RestartState::Replaying => "replaying",
            RestartState::ShuttingDown => "shutting_down",
        }
    }
}

/// Lock-free cell holding the current [`RestartState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(RestartState::Spawning as u8))
    }
}

impl StateCell {
    pub fn get(&self) -> RestartState {
        RestartState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: RestartState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move `from → to` only if the cell currently holds `from`.
    pub fn transition(&self, from: RestartState, to: RestartState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// ─── Sentinel ─────────────────────────────────────────────────────────────

/// Exact whole-line comparison after stripping the line terminator.
/// Partial matches inside ordinary log output never count, and neither do
/// indented or otherwise decorated copies of the sentinel.
pub fn is_sentinel(line: &str, sentinel: &str) -> bool {
    line.trim_end_matches(['\r', '\n']) == sentinel
}

// ─── CrashGuard ───────────────────────────────────────────────────────────

/// Bounds consecutive crash restarts of workers that never produced output.
#[derive(Debug)]
pub struct CrashGuard {
    max: u32,
    streak: u32,
}

impl CrashGuard {
    pub fn new(max: u32) -> Self {
        Self { max, streak: 0 }
    }

    /// Count one crash. A worker that forwarded at least one line was
    /// healthy, so its crash starts a new streak.
    pub fn record_crash(&mut self, produced_output: bool) -> Result<u32> {
        if produced_output {
            self.streak = 0;
        }
        self.streak += 1;
        if self.streak > self.max {
            return Err(ProxyError::RestartLimit {
                attempts: self.streak,
            });
        }
        Ok(self.streak)
    }

    pub fn reset(&mut self) {
        self.streak = 0;
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}

// ─── Coordinator ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    /// The worker wrote the sentinel to stderr.
    Requested,
    /// The worker's stdout closed without a request.
    Crash,
}

pub(crate) struct Coordinator {
    proxy: Arc<Proxy>,
    supervisor: Arc<Supervisor>,
    guard: CrashGuard,
}

impl Coordinator {
    pub(crate) fn new(proxy: Arc<Proxy>, supervisor: Arc<Supervisor>) -> Self {
        let guard = CrashGuard::new(proxy.config().restart.max_crash_restarts);
        Self {
            proxy,
            supervisor,
            guard,
        }
    }

    /// Consume worker events until the channel closes. Returns only on a
    /// fatal error or when every event sender is gone.
    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<WorkerEvent>) -> Result<()> {
        while let Some(event) = events.recv().await {
            if self.proxy.state().get() != RestartState::Running {
                tracing::debug!(?event, "ignoring worker event outside running state");
                continue;
            }
            let live = self.proxy.live_worker().await;
            let Some((generation, produced_output)) = live else {
                continue;
            };
            if event.generation() != generation {
                tracing::debug!(?event, live = generation, "ignoring stale worker event");
                continue;
            }

            match event {
                WorkerEvent::RestartRequested { generation, pid } => {
                    self.proxy.audit().info(
                        "restart_marker_detected",
                        json!({ "pid": pid, "generation": generation }),
                    );
                    self.guard.reset();
                    self.restart(RestartReason::Requested).await?;
                }
                WorkerEvent::Exited { generation, pid } => {
                    self.proxy.audit().error(
                        "server_crashed",
                        json!({
                            "pid": pid,
                            "generation": generation,
                            "produced_output": produced_output,
                        }),
                    );
                    self.count_crash(produced_output, RestartReason::Crash)?;
                    self.restart(RestartReason::Crash).await?;
                }
            }
        }
        Ok(())
    }

    fn count_crash(&mut self, produced_output: bool, reason: RestartReason) -> Result<()> {
        match self.guard.record_crash(produced_output) {
            Ok(streak) => {
                tracing::warn!(streak, ?reason, "worker failed; restarting");
                Ok(())
            }
            Err(e) => {
                self.proxy.audit().error(
                    "restart_failed",
                    json!({ "reason": reason, "error": e.to_string(), "fatal": true }),
                );
                Err(e)
            }
        }
    }

    /// TERMINATING → SPAWNING → REPLAYING → RUNNING.
    async fn restart(&mut self, reason: RestartReason) -> Result<()> {
        if !self
            .proxy
            .state()
            .transition(RestartState::Running, RestartState::Terminating)
        {
            return Ok(());
        }
        let started = Instant::now();

        let old = self.proxy.take_worker().await;
        let old_pid = old.as_ref().and_then(|w| w.pid());
        self.proxy.audit().info(
            "restart_initiated",
            json!({
                "reason": reason,
                "old_pid": old_pid,
                "generation": old.as_ref().map(|w| w.generation()),
            }),
        );
        if let Some(old) = old {
            if let Err(e) = self.supervisor.terminate(old).await {
                tracing::warn!(error = %e, "error while terminating worker");
            }
        }

        loop {
            self.proxy.state().set(RestartState::Spawning);
            let handshake = self.proxy.handshake().snapshot();
            match self.supervisor.start(true, handshake).await {
                Ok(worker) => {
                    let new_pid = worker.pid();
                    let generation = worker.generation();
                    self.proxy.install_worker(worker).await;
                    self.proxy.audit().info(
                        "restart_completed",
                        json!({
                            "reason": reason,
                            "old_pid": old_pid,
                            "new_pid": new_pid,
                            "generation": generation,
                            "duration_ms": started.elapsed().as_millis() as u64,
                        }),
                    );
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    self.proxy.audit().error(
                        "restart_failed",
                        json!({ "reason": reason, "error": e.to_string(), "fatal": true }),
                    );
                    return Err(e);
                }
                Err(e) => {
                    self.proxy.audit().error(
                        "restart_failed",
                        json!({ "reason": reason, "error": e.to_string(), "fatal": false }),
                    );
                    self.count_crash(false, reason)?;
                }
            }
        }
    }
}
