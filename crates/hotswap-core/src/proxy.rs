use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::audit::AuditLog;
use crate::channel::{ClientSink, Frame, LineReader};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::handshake::{Handshake, Observed};
use crate::jsonrpc;
use crate::restart::{Coordinator, RestartState, StateCell};
use crate::validate::{oversized, validate, Verdict, MAX_LINE_BYTES};
use crate::worker::{Supervisor, Worker};

// ─── Proxy ────────────────────────────────────────────────────────────────

/// The relay between one MCP client and a succession of worker processes.
///
/// Shared by reference (`Arc`) between the client loop, the worker's pipe
/// tasks and the restart coordinator. The worker slot is the only mutable
/// link to a process; the client loop writes through it but never creates
/// or destroys workers.
pub struct Proxy {
    config: Arc<ProxyConfig>,
    audit: Arc<AuditLog>,
    handshake: Handshake,
    state: Arc<StateCell>,
    worker: Mutex<Option<Worker>>,
}

impl Proxy {
    pub fn new(config: ProxyConfig, audit: AuditLog) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config: Arc::new(config),
            audit: Arc::new(audit),
            handshake: Handshake::new(),
            state: Arc::new(StateCell::default()),
            worker: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn state(&self) -> &StateCell {
        &self.state
    }

    /// Generation and output flag of the live worker, if any.
    pub(crate) async fn live_worker(&self) -> Option<(u64, bool)> {
        self.worker
            .lock()
            .await
            .as_ref()
            .map(|w| (w.generation(), w.produced_output()))
    }

    pub(crate) async fn take_worker(&self) -> Option<Worker> {
        self.worker.lock().await.take()
    }

    /// Put a ready worker in the slot and resume forwarding.
    pub(crate) async fn install_worker(&self, worker: Worker) {
        let mut slot = self.worker.lock().await;
        *slot = Some(worker);
        self.state.set(RestartState::Running);
    }

    /// Relay between `input`/`output` (the client) and the worker until the
    /// client closes its input or a fatal error occurs.
    pub async fn run<R, W>(self: Arc<Self>, input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.audit.info(
            "proxy_started",
            json!({
                "pid": std::process::id(),
                "command": self.config.worker.command,
                "args": self.config.worker.args,
                "sentinel": self.config.restart.sentinel,
            }),
        );

        let (sink, writer) = ClientSink::spawn(output);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&self.config),
            Arc::clone(&self.audit),
            Arc::clone(&self.state),
            sink.clone(),
            events_tx,
        ));

        match supervisor.start(false, None).await {
            Ok(worker) => self.install_worker(worker).await,
            Err(e) => {
                self.audit.error(
                    "proxy_stopped",
                    json!({ "reason": "spawn_failed", "error": e.to_string() }),
                );
                return Err(e);
            }
        }

        let mut coordinator: Option<JoinHandle<Result<()>>> = Some(tokio::spawn(
            Coordinator::new(Arc::clone(&self), Arc::clone(&supervisor)).run(events_rx),
        ));

        let outcome = self.client_loop(input, &sink, &mut coordinator).await;

        self.state.set(RestartState::ShuttingDown);
        if let Some(task) = coordinator.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(worker) = self.take_worker().await {
            if let Err(e) = supervisor.shutdown(worker).await {
                tracing::warn!(error = %e, "error while stopping worker");
            }
        }

        // The writer exits once every sink clone is gone.
        drop(supervisor);
        drop(sink);
        let grace = self.config.restart.terminate_grace();
        if tokio::time::timeout(grace, writer).await.is_err() {
            tracing::warn!("client writer did not drain in time");
        }

        let (reason, error) = match &outcome {
            Ok(()) => ("client_closed", Value::Null),
            Err(e) => ("fatal", Value::String(e.to_string())),
        };
        self.audit
            .info("proxy_stopped", json!({ "reason": reason, "error": error }));
        outcome
    }

    async fn client_loop<R: AsyncRead + Unpin>(
        &self,
        input: R,
        sink: &ClientSink,
        coordinator: &mut Option<JoinHandle<Result<()>>>,
    ) -> Result<()> {
        let mut reader = LineReader::with_limit(input, MAX_LINE_BYTES);
        loop {
            let Some(task) = coordinator.as_mut() else {
                return Ok(());
            };
            let joined = tokio::select! {
                frame = reader.next_frame() => match frame? {
                    Some(Frame::Line(raw)) => {
                        self.handle_client_line(&raw, sink).await;
                        continue;
                    }
                    Some(Frame::Oversized { len }) => {
                        self.handle_verdict(oversized(len), len, sink).await;
                        continue;
                    }
                    None => return Ok(()),
                },
                joined = task => joined,
            };
            coordinator.take();
            return match joined {
                Ok(result) => result,
                Err(e) => Err(ProxyError::Worker(format!("restart coordinator died: {e}"))),
            };
        }
    }

    /// Validate one client line and forward, block or drop it.
    pub(crate) async fn handle_client_line(&self, raw: &[u8], sink: &ClientSink) {
        self.handle_verdict(validate(raw), raw.len(), sink).await;
    }

    async fn handle_verdict(&self, verdict: Verdict, bytes: usize, sink: &ClientSink) {
        match verdict {
            Verdict::Skip => {}
            Verdict::Drop { reason } => {
                self.audit.warn(
                    "parse_dropped",
                    json!({ "reason": reason, "bytes": bytes }),
                );
            }
            Verdict::Block {
                id,
                reason,
                response,
            } => {
                self.audit
                    .warn("validation_blocked", json!({ "id": id, "reason": reason }));
                sink.send(response).await;
            }
            Verdict::Forward { line, message } => {
                self.observe_handshake(&message, &line);
                self.forward(&line, &message).await;
            }
        }
    }

    fn observe_handshake(&self, message: &Value, line: &str) {
        match self.handshake.observe(message, line) {
            Observed::Captured => self.audit.info(
                "initialize_captured",
                json!({ "id": jsonrpc::id(message), "replaced": false }),
            ),
            Observed::Replaced => self.audit.info(
                "initialize_captured",
                json!({ "id": jsonrpc::id(message), "replaced": true }),
            ),
            Observed::Initialized => {
                tracing::debug!("captured initialized notification");
            }
            Observed::Ignored => {}
        }
    }

    /// Write a validated line to the live worker.
    ///
    /// The slot lock is held only to pick the worker's input handle; the
    /// write itself runs unlocked so a worker that stops reading stdin
    /// cannot stall a restart.
    async fn forward(&self, line: &str, message: &Value) {
        let (state, input) = {
            let slot = self.worker.lock().await;
            let state = self.state.get();
            let input = match slot.as_ref() {
                Some(worker) if state == RestartState::Running => worker.input(),
                _ => None,
            };
            (state, input)
        };
        let dropped = |error: Option<String>| {
            self.audit.warn(
                "message_dropped",
                json!({
                    "state": state.as_str(),
                    "method": jsonrpc::method(message),
                    "id": jsonrpc::id(message),
                    "error": error,
                }),
            );
        };
        match input {
            Some(input) => {
                if let Err(e) = input.send(line).await {
                    dropped(Some(e.to_string()));
                }
            }
            None => dropped(None),
        }
    }
}
