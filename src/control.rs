//! Control channel (C2, §4.2): newline-delimited JSON envelopes exchanged
//! with the parent process over stdin/stdout.
//!
//! The outbound side is a single serializing writer task fed by an `mpsc`
//! channel (§9 "Callback shape"), so `deliver`/`session-error`/heartbeat
//! emission never needs to take a lock on stdout from arbitrary call sites —
//! the same shape the teacher uses for `pending` (a channel-like handoff
//! rather than a shared mutable buffer threaded through every call site).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Envelope received from the parent process.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundEnvelope {
    Open {
        session_id: String,
        root_path: String,
        language: String,
    },
    Message {
        session_id: String,
        payload: Value,
    },
    Close {
        session_id: String,
    },
    Warmup {
        root_path: String,
    },
    Stats,
    Shutdown,
}

/// Envelope sent to the parent process.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundEnvelope {
    #[serde(rename = "ready")]
    Ready { pid: u32, started_at: u64 },
    #[serde(rename = "heartbeat")]
    Heartbeat {
        ts: u64,
        active_instances: usize,
        active_sessions: usize,
        pending_requests: usize,
    },
    #[serde(rename = "deliver")]
    Deliver { session_id: String, payload: Value },
    #[serde(rename = "session-error")]
    SessionError { session_id: String, error: String },
    #[serde(rename = "stats")]
    Stats { data: Value },
    #[serde(rename = "fatal")]
    Fatal { error: String },
}

/// Handle for emitting outbound envelopes from anywhere in the executor.
#[derive(Clone)]
pub struct OutboundSink {
    tx: mpsc::UnboundedSender<OutboundEnvelope>,
}

impl OutboundSink {
    /// Send an envelope. Silently drops it if the writer task has already
    /// exited (e.g. during shutdown race) rather than panicking — the
    /// sidecar is tearing down either way.
    pub fn send(&self, envelope: OutboundEnvelope) {
        let _ = self.tx.send(envelope);
    }
}

impl OutboundSink {
    /// Build a sink directly from a channel half, bypassing the writer task.
    /// Used by tests to inspect envelopes themselves rather than their
    /// serialized form.
    #[must_use]
    pub fn for_tests(tx: mpsc::UnboundedSender<OutboundEnvelope>) -> Self {
        Self { tx }
    }
}

/// Spawn the single serializing writer task and return a sink to feed it.
///
/// `writer` is typically stdout; tests can substitute an in-memory buffer.
pub fn spawn_writer<W>(mut writer: W) -> OutboundSink
where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundEnvelope>();
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let Ok(mut line) = serde_json::to_string(&envelope) else {
                tracing::error!("failed to serialize outbound envelope");
                continue;
            };
            line.push('\n');
            if writer.write_all(line.as_bytes()).await.is_err() {
                tracing::error!("control channel write failed, stopping writer task");
                break;
            }
            let _ = writer.flush().await;
        }
    });
    OutboundSink { tx }
}

/// Read newline-terminated JSON lines from `reader`, invoking `on_envelope`
/// for each successfully parsed one. Empty lines are ignored; unparseable
/// lines are silently dropped (§4.2 — the parent owns retry semantics).
/// Returns when the stream reaches EOF.
pub async fn read_inbound<R, F>(reader: R, mut on_envelope: F)
where
    R: tokio::io::AsyncRead + Unpin,
    F: FnMut(InboundEnvelope),
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<InboundEnvelope>(trimmed) {
                    Ok(envelope) => on_envelope(envelope),
                    Err(e) => {
                        tracing::debug!("dropping unparseable control line: {e}");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("control channel read error: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_open_envelope() {
        let line = r#"{"type":"open","sessionId":"s1","rootPath":"/repo","language":"typescript"}"#;
        let env: InboundEnvelope = serde_json::from_str(line).unwrap();
        match env {
            InboundEnvelope::Open {
                session_id,
                root_path,
                language,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(root_path, "/repo");
                assert_eq!(language, "typescript");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn parses_shutdown_and_stats_without_payload() {
        assert!(matches!(
            serde_json::from_str::<InboundEnvelope>(r#"{"type":"shutdown"}"#).unwrap(),
            InboundEnvelope::Shutdown
        ));
        assert!(matches!(
            serde_json::from_str::<InboundEnvelope>(r#"{"type":"stats"}"#).unwrap(),
            InboundEnvelope::Stats
        ));
    }

    #[test]
    fn serializes_outbound_tags() {
        let deliver = OutboundEnvelope::Deliver {
            session_id: "s1".into(),
            payload: serde_json::json!({"id": 7}),
        };
        let text = serde_json::to_string(&deliver).unwrap();
        assert!(text.contains(r#""type":"deliver""#));
        assert!(text.contains(r#""sessionId":"s1""#));
    }

    #[tokio::test]
    async fn read_inbound_drops_unparseable_and_empty_lines() {
        let input = b"\nnot json\n{\"type\":\"stats\"}\n".to_vec();
        let mut seen = Vec::new();
        read_inbound(&input[..], |env| seen.push(env)).await;
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], InboundEnvelope::Stats));
    }

    #[tokio::test]
    async fn writer_emits_newline_terminated_json() {
        let buf = Vec::new();
        let cursor = std::io::Cursor::new(buf);
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundEnvelope>();
        // Drive the writer loop directly against a Vec-backed async writer.
        let mut writer = cursor;
        tx.send(OutboundEnvelope::Ready {
            pid: 42,
            started_at: 0,
        })
        .unwrap();
        drop(tx);
        while let Some(envelope) = rx.recv().await {
            let mut line = serde_json::to_string(&envelope).unwrap();
            line.push('\n');
            tokio::io::AsyncWriteExt::write_all(&mut writer, line.as_bytes())
                .await
                .unwrap();
        }
        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert!(out.ends_with('\n'));
        assert!(out.contains(r#""type":"ready""#));
    }
}
