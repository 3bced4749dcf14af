//! Worker process supervision.
//!
//! Each worker generation gets its own stdin pipe (shared through
//! [`WorkerInput`] handles so writers never hold the worker slot), a
//! stdout forwarder task that relays lines to the client, and a stderr task
//! that watches for the restart sentinel and the optional ready marker.
//! stderr is the out-of-band control channel and never reaches the client.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::audit::AuditLog;
use crate::channel::{decode_lossy, write_line, ClientSink, LineReader};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::handshake::{self, HandshakeSnapshot};
use crate::restart::{is_sentinel, RestartState, StateCell};

// ─── WorkerEvent ──────────────────────────────────────────────────────────

/// Out-of-band signals from a worker's background tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The sentinel line appeared on stderr.
    RestartRequested { generation: u64, pid: Option<u32> },
    /// stdout reached EOF.
    Exited { generation: u64, pid: Option<u32> },
}

impl WorkerEvent {
    pub fn generation(&self) -> u64 {
        match self {
            WorkerEvent::RestartRequested { generation, .. }
            | WorkerEvent::Exited { generation, .. } => *generation,
        }
    }
}

// ─── WorkerInput ──────────────────────────────────────────────────────────

/// Cloneable write handle to one worker's stdin.
///
/// A write may block for as long as the worker leaves its stdin unread.
/// Holders keep the pipe open until they drop the handle; a blocked write
/// fails once the process is killed.
#[derive(Debug, Clone)]
pub struct WorkerInput {
    pipe: Arc<Mutex<ChildStdin>>,
}

impl WorkerInput {
    fn new(stdin: ChildStdin) -> Self {
        Self {
            pipe: Arc::new(Mutex::new(stdin)),
        }
    }

    /// Write one line, newline-terminated, and flush.
    pub async fn send(&self, line: &str) -> Result<()> {
        let mut pipe = self.pipe.lock().await;
        write_line(&mut *pipe, line).await?;
        Ok(())
    }
}

// ─── Worker ───────────────────────────────────────────────────────────────

/// Handle to one live worker process.
#[derive(Debug)]
pub struct Worker {
    generation: u64,
    pid: Option<u32>,
    child: Child,
    stdin: Option<WorkerInput>,
    produced_output: Arc<AtomicBool>,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether this worker has forwarded at least one stdout line.
    pub fn produced_output(&self) -> bool {
        self.produced_output.load(Ordering::Acquire)
    }

    /// A handle for writing to this worker's stdin, or `None` once the
    /// pipe has been closed for termination.
    pub fn input(&self) -> Option<WorkerInput> {
        self.stdin.clone()
    }

    /// Forward one client line to the worker's stdin.
    pub async fn send(&self, line: &str) -> Result<()> {
        let input = self
            .stdin
            .as_ref()
            .ok_or_else(|| ProxyError::Worker("stdin already closed".into()))?;
        input.send(line).await
    }
}

// ─── Supervisor ───────────────────────────────────────────────────────────

pub struct Supervisor {
    config: Arc<ProxyConfig>,
    audit: Arc<AuditLog>,
    state: Arc<StateCell>,
    sink: ClientSink,
    events: mpsc::UnboundedSender<WorkerEvent>,
    generation: AtomicU64,
    live: AtomicUsize,
}

impl Supervisor {
    pub fn new(
        config: Arc<ProxyConfig>,
        audit: Arc<AuditLog>,
        state: Arc<StateCell>,
        sink: ClientSink,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            config,
            audit,
            state,
            sink,
            events,
            generation: AtomicU64::new(0),
            live: AtomicUsize::new(0),
        }
    }

    /// Number of spawned workers not yet terminated. Never above one.
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Spawn a fresh worker. With `is_restart`, the captured handshake is
    /// replayed before the worker's stdout is connected to the client.
    pub async fn start(
        &self,
        is_restart: bool,
        handshake: Option<HandshakeSnapshot>,
    ) -> Result<Worker> {
        if self.live_workers() > 0 {
            return Err(ProxyError::Worker(
                "refusing to spawn while another worker is live".into(),
            ));
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let worker_cfg = &self.config.worker;

        let mut cmd = Command::new(&worker_cfg.command);
        cmd.args(&worker_cfg.args)
            .envs(&worker_cfg.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &worker_cfg.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|source| ProxyError::Spawn {
            command: worker_cfg.command.clone(),
            source,
        })?;
        self.live.fetch_add(1, Ordering::AcqRel);
        let pid = child.id();

        let (stdin, stdout, stderr) = match take_pipes(&mut child) {
            Ok(pipes) => pipes,
            Err(e) => {
                self.discard(child).await;
                return Err(e);
            }
        };
        let mut stdin = Some(stdin);
        let mut stdout = LineReader::new(stdout);

        let (ready_tx, ready_rx) = match &self.config.restart.ready_marker {
            Some(_) => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        let stderr_task = tokio::spawn(scan_stderr(
            stderr,
            StderrScan {
                generation,
                pid,
                sentinel: self.config.restart.sentinel.clone(),
                ready_marker: self.config.restart.ready_marker.clone(),
                ready_tx,
                events: self.events.clone(),
            },
        ));

        self.audit.info(
            "server_spawned",
            json!({
                "pid": pid,
                "generation": generation,
                "restart": is_restart,
                "command": worker_cfg.command,
            }),
        );

        if is_restart {
            match handshake {
                Some(snapshot) => {
                    self.state.set(RestartState::Replaying);
                    let replayed = self
                        .replay(&snapshot, stdin.as_mut(), &mut stdout, ready_rx, pid, generation)
                        .await;
                    if let Err(e) = replayed {
                        stderr_task.abort();
                        self.discard(child).await;
                        return Err(e);
                    }
                }
                None => {
                    tracing::info!(pid, generation, "no handshake captured yet; skipping replay");
                }
            }
        } else {
            self.audit.info(
                "server_ready",
                json!({ "pid": pid, "generation": generation, "via": "initial" }),
            );
        }

        let produced_output = Arc::new(AtomicBool::new(false));
        let stdout_task = tokio::spawn(forward_stdout(
            stdout,
            self.sink.clone(),
            Arc::clone(&produced_output),
            self.events.clone(),
            generation,
            pid,
        ));

        Ok(Worker {
            generation,
            pid,
            child,
            stdin: stdin.take().map(WorkerInput::new),
            produced_output,
            stdout_task: Some(stdout_task),
            stderr_task: Some(stderr_task),
        })
    }

    async fn replay(
        &self,
        snapshot: &HandshakeSnapshot,
        stdin: Option<&mut ChildStdin>,
        stdout: &mut LineReader<ChildStdout>,
        ready_rx: Option<oneshot::Receiver<()>>,
        pid: Option<u32>,
        generation: u64,
    ) -> Result<()> {
        let restart_cfg = &self.config.restart;
        let via = wait_ready(ready_rx, restart_cfg.ready_timeout(), restart_cfg.replay_delay()).await;
        self.audit.info(
            "server_ready",
            json!({ "pid": pid, "generation": generation, "via": via }),
        );

        let stdin = stdin.ok_or_else(|| ProxyError::Worker("stdin not captured".into()))?;
        let discarded = handshake::replay(
            snapshot,
            stdin,
            stdout,
            restart_cfg.replay_timeout(),
            restart_cfg.replay_initialized,
        )
        .await?;
        self.audit.info(
            "initialize_replayed",
            json!({
                "pid": pid,
                "generation": generation,
                "discarded_bytes": discarded.len(),
                "initialized_sent": restart_cfg.replay_initialized && snapshot.initialized.is_some(),
            }),
        );
        Ok(())
    }

    /// Stop a worker: close stdin, SIGTERM, wait, then SIGKILL.
    ///
    /// Any output the worker produced before exiting is still forwarded;
    /// the caller spawns the replacement only after this returns, so two
    /// generations never forward at once.
    pub async fn terminate(&self, mut worker: Worker) -> Result<Option<i32>> {
        let grace = self.config.restart.terminate_grace();
        worker.stdin.take();

        let mut forced = false;
        let status = match worker.child.try_wait()? {
            Some(status) => status,
            None => {
                signal_terminate(&mut worker.child);
                match tokio::time::timeout(grace, worker.child.wait()).await {
                    Ok(status) => status?,
                    Err(_) => {
                        tracing::warn!(pid = worker.pid, "worker ignored SIGTERM; killing");
                        forced = true;
                        worker.child.kill().await?;
                        worker.child.wait().await?
                    }
                }
            }
        };

        self.finish(&mut worker, grace).await;
        self.live.fetch_sub(1, Ordering::AcqRel);

        let code = status.code();
        self.audit.info(
            "server_terminated",
            json!({
                "pid": worker.pid,
                "generation": worker.generation,
                "code": code,
                "forced": forced,
            }),
        );
        Ok(code)
    }

    /// Stop a worker at the end of the session: close stdin and give it
    /// the grace period to finish in-flight work before [`terminate`].
    ///
    /// [`terminate`]: Supervisor::terminate
    pub async fn shutdown(&self, mut worker: Worker) -> Result<Option<i32>> {
        let grace = self.config.restart.terminate_grace();
        worker.stdin.take();
        if tokio::time::timeout(grace, worker.child.wait()).await.is_err() {
            tracing::info!(pid = worker.pid, "worker still running after stdin close");
        }
        self.terminate(worker).await
    }

    /// Let the pipe tasks drain what the dead process left behind.
    async fn finish(&self, worker: &mut Worker, grace: Duration) {
        for task in [worker.stdout_task.take(), worker.stderr_task.take()]
            .into_iter()
            .flatten()
        {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                abort.abort();
            }
        }
    }

    /// Kill a worker that never became usable.
    async fn discard(&self, mut child: Child) {
        let _ = child.kill().await;
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

fn take_pipes(child: &mut Child) -> Result<(ChildStdin, ChildStdout, ChildStderr)> {
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ProxyError::Worker("stdin not captured".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProxyError::Worker("stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ProxyError::Worker("stderr not captured".into()))?;
    Ok((stdin, stdout, stderr))
}

#[cfg(unix)]
fn signal_terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(pid, error = ?e, "SIGTERM failed");
        }
    }
}

#[cfg(not(unix))]
fn signal_terminate(child: &mut Child) {
    // No graceful signal available; closing stdin was the polite request.
    let _ = child.start_kill();
}

/// How readiness was established, for the audit line.
async fn wait_ready(
    ready_rx: Option<oneshot::Receiver<()>>,
    ready_timeout: Duration,
    delay: Duration,
) -> &'static str {
    match ready_rx {
        Some(rx) => match tokio::time::timeout(ready_timeout, rx).await {
            Ok(Ok(())) => "marker",
            Ok(Err(_)) => "stderr_closed",
            Err(_) => {
                tracing::warn!(
                    timeout_ms = ready_timeout.as_millis() as u64,
                    "ready marker not seen; replaying anyway"
                );
                "marker_timeout"
            }
        },
        None => {
            tokio::time::sleep(delay).await;
            "delay"
        }
    }
}

// ─── Background tasks ─────────────────────────────────────────────────────

struct StderrScan {
    generation: u64,
    pid: Option<u32>,
    sentinel: String,
    ready_marker: Option<String>,
    ready_tx: Option<oneshot::Sender<()>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

async fn scan_stderr(stderr: ChildStderr, mut scan: StderrScan) {
    let mut lines = LineReader::new(stderr);
    loop {
        let raw = match lines.next_line().await {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(pid = scan.pid, error = %e, "worker stderr read failed");
                break;
            }
        };
        let line = decode_lossy(&raw);

        if is_sentinel(&line, &scan.sentinel) {
            let _ = scan.events.send(WorkerEvent::RestartRequested {
                generation: scan.generation,
                pid: scan.pid,
            });
            continue;
        }

        if let Some(marker) = &scan.ready_marker {
            if line.trim_end_matches(['\r', '\n']) == marker {
                if let Some(tx) = scan.ready_tx.take() {
                    let _ = tx.send(());
                }
                continue;
            }
        }

        tracing::info!(
            pid = scan.pid,
            generation = scan.generation,
            "worker: {}",
            line.trim_end()
        );
    }
}

async fn forward_stdout(
    mut reader: LineReader<ChildStdout>,
    sink: ClientSink,
    produced_output: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    generation: u64,
    pid: Option<u32>,
) {
    loop {
        match reader.next_line().await {
            Ok(Some(raw)) => {
                if raw.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                produced_output.store(true, Ordering::Release);
                if !sink.send(decode_lossy(&raw).into_owned()).await {
                    // Client is gone; the main loop shuts the session down.
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(pid, generation, error = %e, "worker stdout read failed");
                break;
            }
        }
    }
    let _ = events.send(WorkerEvent::Exited { generation, pid });
}
