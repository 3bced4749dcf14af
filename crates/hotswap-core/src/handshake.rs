//! Recording and replaying the MCP initialization handshake.
//!
//! The client performs `initialize` → response → `notifications/initialized`
//! exactly once per session. A freshly spawned worker has never seen it, yet
//! the client will not send it again, so the relay keeps the client's own
//! lines and plays them back to each replacement worker.

use std::sync::RwLock;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::channel::{decode_lossy, write_line, LineReader};
use crate::error::{ProxyError, Result};
use crate::jsonrpc;

pub const INITIALIZE: &str = "initialize";
pub const INITIALIZED: &str = "notifications/initialized";

/// What [`Handshake::observe`] did with a client message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    /// First `initialize` of the session.
    Captured,
    /// The client sent `initialize` again; the newer line wins.
    Replaced,
    /// `notifications/initialized` stored.
    Initialized,
    Ignored,
}

/// Frozen copy of the handshake handed to a replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeSnapshot {
    pub initialize: String,
    pub initialized: Option<String>,
}

#[derive(Debug, Default)]
struct Captured {
    initialize: Option<String>,
    initialized: Option<String>,
}

/// Session-lifetime store for the client's handshake lines.
///
/// Once `initialize` is captured it is never cleared; it can only be
/// replaced by a newer `initialize` from the client.
#[derive(Debug, Default)]
pub struct Handshake {
    inner: RwLock<Captured>,
}

impl Handshake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, message: &Value, line: &str) -> Observed {
        let method = jsonrpc::method(message);
        let Ok(mut captured) = self.inner.write() else {
            return Observed::Ignored;
        };
        match method {
            Some(INITIALIZE) if jsonrpc::is_request(message) => {
                let previous = captured.initialize.replace(line.to_string());
                if previous.is_some() {
                    Observed::Replaced
                } else {
                    Observed::Captured
                }
            }
            Some(INITIALIZED) if jsonrpc::is_notification(message) => {
                captured.initialized = Some(line.to_string());
                Observed::Initialized
            }
            _ => Observed::Ignored,
        }
    }

    pub fn is_captured(&self) -> bool {
        self.inner
            .read()
            .map(|c| c.initialize.is_some())
            .unwrap_or(false)
    }

    /// `None` until the client has sent `initialize`.
    pub fn snapshot(&self) -> Option<HandshakeSnapshot> {
        let captured = self.inner.read().ok()?;
        let initialize = captured.initialize.clone()?;
        Some(HandshakeSnapshot {
            initialize,
            initialized: captured.initialized.clone(),
        })
    }
}

/// Play `snapshot` to a new worker.
///
/// Writes the stored `initialize` line verbatim, reads exactly one
/// non-blank line back and returns it so the caller can log and drop it
/// (the client already holds the original response), then writes the
/// stored `initialized` notification when `send_initialized` is set.
pub async fn replay<W, R>(
    snapshot: &HandshakeSnapshot,
    stdin: &mut W,
    stdout: &mut LineReader<R>,
    timeout: Duration,
    send_initialized: bool,
) -> Result<String>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    write_line(stdin, &snapshot.initialize).await?;

    let discarded = tokio::time::timeout(timeout, read_reply(stdout))
        .await
        .map_err(|_| {
            ProxyError::Replay(format!(
                "no initialize response within {}ms",
                timeout.as_millis()
            ))
        })??;

    if send_initialized {
        if let Some(note) = &snapshot.initialized {
            write_line(stdin, note).await?;
        }
    }

    Ok(discarded)
}

async fn read_reply<R: AsyncRead + Unpin>(stdout: &mut LineReader<R>) -> Result<String> {
    loop {
        match stdout.next_line().await? {
            None => {
                return Err(ProxyError::Replay(
                    "worker closed stdout before answering initialize".into(),
                ))
            }
            Some(line) if line.iter().all(u8::is_ascii_whitespace) => continue,
            Some(line) => return Ok(decode_lossy(&line).into_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    const INIT: &str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#;
    const INITIALIZED_LINE: &str = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;

    fn observe_line(hs: &Handshake, line: &str) -> Observed {
        let v: Value = serde_json::from_str(line).unwrap();
        hs.observe(&v, line)
    }

    #[test]
    fn first_initialize_is_captured_verbatim() {
        let hs = Handshake::new();
        assert!(!hs.is_captured());
        assert_eq!(observe_line(&hs, INIT), Observed::Captured);
        assert!(hs.is_captured());
        assert_eq!(hs.snapshot().unwrap().initialize, INIT);
    }

    #[test]
    fn fresh_initialize_replaces_previous() {
        let hs = Handshake::new();
        observe_line(&hs, INIT);
        let again = r#"{"jsonrpc":"2.0","id":9,"method":"initialize","params":{"v":2}}"#;
        assert_eq!(observe_line(&hs, again), Observed::Replaced);
        assert_eq!(hs.snapshot().unwrap().initialize, again);
    }

    #[test]
    fn other_traffic_never_clears_the_handshake() {
        let hs = Handshake::new();
        observe_line(&hs, INIT);
        observe_line(&hs, r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#);
        observe_line(&hs, r#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
        assert_eq!(hs.snapshot().unwrap().initialize, INIT);
    }

    #[test]
    fn initialize_without_id_is_not_a_handshake() {
        let hs = Handshake::new();
        let v = json!({"jsonrpc":"2.0","method":"initialize"});
        assert_eq!(hs.observe(&v, &v.to_string()), Observed::Ignored);
        assert!(hs.snapshot().is_none());
    }

    #[test]
    fn initialized_notification_is_kept_alongside() {
        let hs = Handshake::new();
        observe_line(&hs, INIT);
        assert_eq!(observe_line(&hs, INITIALIZED_LINE), Observed::Initialized);
        let snap = hs.snapshot().unwrap();
        assert_eq!(snap.initialized.as_deref(), Some(INITIALIZED_LINE));
    }

    /// A fake worker on the far side of two duplex pipes: answers every
    /// line that carries an id and records everything it receives.
    fn fake_worker() -> (
        tokio::io::DuplexStream,
        LineReader<tokio::io::DuplexStream>,
        tokio::task::JoinHandle<Vec<String>>,
    ) {
        let (stdin_ours, stdin_theirs) = tokio::io::duplex(4096);
        let (stdout_theirs, stdout_ours) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut lines = BufReader::new(stdin_theirs).lines();
            let mut out = stdout_theirs;
            while let Ok(Some(line)) = lines.next_line().await {
                let v: Value = serde_json::from_str(&line).unwrap();
                if let Some(id) = v.get("id") {
                    let resp = json!({"jsonrpc":"2.0","id":id,"result":{"fresh":true}});
                    out.write_all(format!("{resp}\n").as_bytes()).await.unwrap();
                }
                seen.push(line);
            }
            seen
        });
        (stdin_ours, LineReader::new(stdout_ours), task)
    }

    #[tokio::test]
    async fn replay_writes_stored_lines_and_discards_one_response() {
        let hs = Handshake::new();
        observe_line(&hs, INIT);
        observe_line(&hs, INITIALIZED_LINE);
        let snap = hs.snapshot().unwrap();

        let (mut stdin, mut stdout, worker) = fake_worker();
        let discarded = replay(&snap, &mut stdin, &mut stdout, Duration::from_secs(5), true)
            .await
            .unwrap();
        assert!(discarded.contains(r#""fresh":true"#));

        drop(stdin);
        let seen = worker.await.unwrap();
        assert_eq!(seen, vec![INIT.to_string(), INITIALIZED_LINE.to_string()]);
    }

    #[tokio::test]
    async fn replay_can_skip_initialized_notification() {
        let hs = Handshake::new();
        observe_line(&hs, INIT);
        observe_line(&hs, INITIALIZED_LINE);
        let snap = hs.snapshot().unwrap();

        let (mut stdin, mut stdout, worker) = fake_worker();
        replay(&snap, &mut stdin, &mut stdout, Duration::from_secs(5), false)
            .await
            .unwrap();
        drop(stdin);
        assert_eq!(worker.await.unwrap(), vec![INIT.to_string()]);
    }

    #[tokio::test]
    async fn repeated_replays_never_alter_the_stored_message() {
        let hs = Handshake::new();
        observe_line(&hs, INIT);
        let before = hs.snapshot().unwrap();

        for _ in 0..5 {
            let snap = hs.snapshot().unwrap();
            let (mut stdin, mut stdout, worker) = fake_worker();
            replay(&snap, &mut stdin, &mut stdout, Duration::from_secs(5), true)
                .await
                .unwrap();
            drop(stdin);
            assert_eq!(worker.await.unwrap(), vec![INIT.to_string()]);
        }

        assert_eq!(hs.snapshot().unwrap(), before);
    }

    #[tokio::test]
    async fn replay_fails_when_worker_closes_stdout() {
        let snap = HandshakeSnapshot {
            initialize: INIT.to_string(),
            initialized: None,
        };
        let (mut stdin, _stdin_far) = tokio::io::duplex(4096);
        let (stdout_far, stdout_ours) = tokio::io::duplex(4096);
        drop(stdout_far);
        let mut stdout = LineReader::new(stdout_ours);

        let err = replay(&snap, &mut stdin, &mut stdout, Duration::from_secs(5), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Replay(_)));
    }

    #[tokio::test]
    async fn replay_times_out_on_silent_worker() {
        let snap = HandshakeSnapshot {
            initialize: INIT.to_string(),
            initialized: None,
        };
        let (mut stdin, _stdin_far) = tokio::io::duplex(4096);
        let (_stdout_far, stdout_ours) = tokio::io::duplex(4096);
        let mut stdout = LineReader::new(stdout_ours);

        let err = replay(&snap, &mut stdin, &mut stdout, Duration::from_millis(50), true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no initialize response"));
    }
}
