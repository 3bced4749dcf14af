//! Newline-delimited framing for the client side of the relay.
//!
//! Input is read as raw bytes so that no platform codepage ever gets a say:
//! the relay decides how bytes become text (see [`decode_lossy`] and the
//! validator). Output goes through a single writer task so lines from the
//! validator and the worker forwarder never interleave mid-line.

use std::borrow::Cow;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ─── LineReader ───────────────────────────────────────────────────────────

/// One framed unit read from a [`LineReader`].
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// A complete line without its terminator.
    Line(Vec<u8>),
    /// A line longer than the reader's limit. Its bytes were discarded up to
    /// and including the next `\n`; `len` counts them.
    Oversized { len: usize },
}

pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max: usize,
    /// Set while skipping the rest of an oversized line.
    discarded: Option<usize>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Reader with no line limit, for worker pipes.
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, usize::MAX)
    }

    /// Reader that never buffers more than `max` bytes of one line.
    pub fn with_limit(reader: R, max: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::with_capacity(4096),
            max,
            discarded: None,
        }
    }

    /// Next frame. `Ok(None)` on EOF; a final unterminated line is still
    /// returned.
    ///
    /// Cancel safe: partial lines and discard progress live in `self`, and
    /// the only await point is `fill_buf`.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if let Some(len) = self.discarded.take() {
                    return Ok(Some(Frame::Oversized { len }));
                }
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(Frame::Line(take_line(&mut self.buf))));
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let chunk = newline.map_or(available.len(), |pos| pos + 1);
            let content = chunk - usize::from(newline.is_some());

            if let Some(len) = self.discarded.as_mut() {
                *len += chunk;
            } else if self.buf.len() + content > self.max {
                self.discarded = Some(self.buf.len() + chunk);
                self.buf = Vec::with_capacity(4096);
            } else {
                self.buf.extend_from_slice(&available[..chunk]);
            }
            self.inner.consume(chunk);

            if newline.is_some() {
                if let Some(len) = self.discarded.take() {
                    return Ok(Some(Frame::Oversized { len }));
                }
                return Ok(Some(Frame::Line(take_line(&mut self.buf))));
            }
        }
    }

    /// Next line without its `\n` / `\r\n` terminator. `Ok(None)` on EOF.
    /// Oversized lines are skipped.
    pub async fn next_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            match self.next_frame().await? {
                Some(Frame::Line(line)) => return Ok(Some(line)),
                Some(Frame::Oversized { len }) => {
                    tracing::warn!(len, max = self.max, "skipped oversized line");
                }
                None => return Ok(None),
            }
        }
    }
}

fn take_line(buf: &mut Vec<u8>) -> Vec<u8> {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    std::mem::take(buf)
}

/// Decode bytes as UTF-8, replacing invalid sequences with U+FFFD.
pub fn decode_lossy(bytes: &[u8]) -> Cow<'_, str> {
    let text = String::from_utf8_lossy(bytes);
    if let Cow::Owned(_) = text {
        tracing::debug!(len = bytes.len(), "substituted invalid UTF-8 in line");
    }
    text
}

/// Write `line` plus `\n` and flush, so the peer sees a complete frame.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await
}

// ─── ClientSink ───────────────────────────────────────────────────────────

/// Cloneable handle to the task that owns the client's output stream.
#[derive(Clone)]
pub struct ClientSink {
    tx: mpsc::Sender<String>,
}

impl ClientSink {
    /// Spawn the writer task. It exits once every `ClientSink` clone is
    /// dropped or the client output fails.
    pub fn spawn<W>(writer: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<String>(256);
        let handle = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = rx.recv().await {
                if let Err(e) = write_line(&mut writer, &line).await {
                    tracing::warn!(error = %e, "client output closed");
                    break;
                }
            }
        });
        (Self { tx }, handle)
    }

    /// Queue one line for the client. Returns `false` once the client
    /// output is gone.
    pub async fn send(&self, line: String) -> bool {
        self.tx.send(line).await.is_ok()
    }
}
