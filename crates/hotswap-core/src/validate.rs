//! Gatekeeper between the client and the worker.
//!
//! The worker may run on a runtime with a much stricter text layer than
//! ours; a single lone surrogate in a request can crash it and take the
//! whole session with it. Every client line therefore gets a [`Verdict`]
//! before it is allowed anywhere near the worker's stdin.

use serde_json::Value;

use crate::channel::decode_lossy;
use crate::jsonrpc::{self, JsonRpcResponse, INVALID_PARAMS, INVALID_REQUEST};

/// Lines above this size are refused without parsing.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub enum Verdict {
    /// Blank line; ignored without logging.
    Skip,
    /// Not JSON. Never forwarded and never answered.
    Drop { reason: String },
    /// JSON with unsafe text. Never forwarded; `response` goes to the client.
    Block {
        id: Option<Value>,
        reason: String,
        response: String,
    },
    /// Safe to hand to the worker verbatim.
    Forward { line: String, message: Value },
}

pub fn validate(raw: &[u8]) -> Verdict {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Verdict::Skip;
    }

    if raw.len() > MAX_LINE_BYTES {
        return oversized(raw.len());
    }

    let text = decode_lossy(raw);
    let trimmed = text.trim();

    let lone = find_lone_surrogate_escapes(trimmed);
    let unsafe_text = match (find_encoded_surrogate(raw), lone.first()) {
        (Some(offset), _) => Some(format!(
            "lone surrogate encoded in raw bytes at offset {offset}"
        )),
        (None, Some(first)) => Some(format!(
            "unpaired surrogate escape {} at offset {}",
            &trimmed[first.clone()],
            first.start
        )),
        (None, None) => None,
    };
    if let Some(reason) = unsafe_text {
        // Only a line that is JSON once the bad text is neutralised earns an
        // error response; anything else is noise like any other non-JSON.
        let Some(message) = parse_patched(trimmed, &lone) else {
            return Verdict::Drop {
                reason: format!("not JSON; {reason}"),
            };
        };
        return block(jsonrpc::id(&message).cloned(), INVALID_PARAMS, reason);
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(message) => Verdict::Forward {
            line: trimmed.to_string(),
            message,
        },
        Err(e) => Verdict::Drop {
            reason: e.to_string(),
        },
    }
}

/// Verdict for a line of `len` bytes that exceeded [`MAX_LINE_BYTES`].
pub fn oversized(len: usize) -> Verdict {
    block(
        None,
        INVALID_REQUEST,
        format!("message of {len} bytes exceeds {MAX_LINE_BYTES}"),
    )
}

fn block(id: Option<Value>, code: i32, reason: String) -> Verdict {
    let message = if code == INVALID_PARAMS {
        format!("Invalid params: message is not valid UTF-8 text ({reason}); it was not forwarded")
    } else {
        format!("Invalid request: {reason}")
    };
    let response = JsonRpcResponse::error(id.clone(), code, message).to_line();
    Verdict::Block {
        id,
        reason,
        response,
    }
}

/// Byte offset of a UTF-16 surrogate encoded as three UTF-8-like bytes
/// (`ED A0..BF xx`), as produced by CESU-8/WTF-8 encoders.
///
/// `0xED` is always a lead byte, so the pair can only mean a surrogate.
fn find_encoded_surrogate(raw: &[u8]) -> Option<usize> {
    raw.windows(2)
        .position(|w| w[0] == 0xED && (0xA0..=0xBF).contains(&w[1]))
}

/// Byte ranges of `\uXXXX` escapes naming a surrogate without its partner.
fn find_lone_surrogate_escapes(text: &str) -> Vec<std::ops::Range<usize>> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            i += 1;
            continue;
        }
        let Some(unit) = hex_escape_at(bytes, i) else {
            // `\\`, `\"`, `\n` …: skip the escaped character as well.
            i += 2;
            continue;
        };
        match unit {
            0xD800..=0xDBFF => match hex_escape_at(bytes, i + 6) {
                Some(0xDC00..=0xDFFF) => i += 12,
                _ => {
                    found.push(i..i + 6);
                    i += 6;
                }
            },
            0xDC00..=0xDFFF => {
                found.push(i..i + 6);
                i += 6;
            }
            _ => i += 6,
        }
    }
    found
}

/// Decode the code unit of a `\uXXXX` escape starting at `at`.
fn hex_escape_at(bytes: &[u8], at: usize) -> Option<u16> {
    let esc = bytes.get(at..at + 6)?;
    if esc[0] != b'\\' || esc[1] != b'u' {
        return None;
    }
    let hex = std::str::from_utf8(&esc[2..]).ok()?;
    u16::from_str_radix(hex, 16).ok()
}

/// Parse `text` with its lone surrogate escapes swapped for U+FFFD, which
/// serde_json would otherwise refuse. Raw surrogate bytes were already
/// substituted by the lossy decode.
fn parse_patched(text: &str, lone: &[std::ops::Range<usize>]) -> Option<Value> {
    let mut patched = String::with_capacity(text.len());
    let mut last = 0;
    for range in lone {
        patched.push_str(&text[last..range.start]);
        patched.push_str("\\ufffd");
        last = range.end;
    }
    patched.push_str(&text[last..]);
    serde_json::from_str::<Value>(&patched).ok()
}
