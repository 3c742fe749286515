//! End-to-end coverage driving `Sidecar` against a small fake language
//! server (a shell script), so these run anywhere without `rust-analyzer`
//! or any other real toolchain installed.

use std::time::Duration;

use lsp_sidecar::control::{OutboundEnvelope, OutboundSink};
use lsp_sidecar::dispatcher::{Event, Sidecar};
use lsp_sidecar::policy::Policy;
use lsp_sidecar::resolver::{FixedResolver, LanguageServerResolver};
use serde_json::json;
use tokio::sync::mpsc;

/// Write an executable shell script implementing a minimal LSP server:
/// answers `initialize` and echoes back any other request with an empty
/// result, ignores notifications, never exits on its own.
fn fake_server_script(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("fake-lsp-server.py");
    let script = r#"#!/usr/bin/env python3
import sys, json

def read_message():
    headers = {}
    while True:
        line = sys.stdin.buffer.readline()
        if not line:
            return None
        if line == b"\r\n":
            break
        key, _, value = line.decode("utf-8").partition(":")
        headers[key.strip().lower()] = value.strip()
    length = int(headers.get("content-length", "0"))
    body = sys.stdin.buffer.read(length)
    return json.loads(body)

def write_message(obj):
    body = json.dumps(obj).encode("utf-8")
    sys.stdout.buffer.write(f"Content-Length: {len(body)}\r\n\r\n".encode("ascii"))
    sys.stdout.buffer.write(body)
    sys.stdout.buffer.flush()

while True:
    msg = read_message()
    if msg is None:
        break
    if "id" in msg and msg.get("method") != "initialized":
        write_message({"jsonrpc": "2.0", "id": msg["id"], "result": {"ok": True, "echoedMethod": msg.get("method")}})
"#;
    std::fs::write(&path, script).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn python3_available() -> bool {
    which::which("python3").is_ok()
}

struct Harness {
    sidecar_task: tokio::task::JoinHandle<i32>,
    events_tx: mpsc::UnboundedSender<Event>,
    outbound_rx: mpsc::UnboundedReceiver<OutboundEnvelope>,
}

fn start_harness(resolver: Box<dyn LanguageServerResolver>) -> Harness {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let outbound = OutboundSink::for_tests(outbound_tx);
    let mut policy = Policy::default();
    policy.instance_init_timeout = Duration::from_secs(5);
    policy.request_timeout = Duration::from_secs(5);
    let (sidecar, events_rx) = Sidecar::new(policy, resolver, outbound);
    let events_tx = sidecar.events_sender();
    let sidecar_task = tokio::spawn(sidecar.run(events_rx));
    Harness {
        sidecar_task,
        events_tx,
        outbound_rx,
    }
}

async fn recv_until<F: Fn(&OutboundEnvelope) -> bool>(
    rx: &mut mpsc::UnboundedReceiver<OutboundEnvelope>,
    predicate: F,
) -> OutboundEnvelope {
    loop {
        let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for outbound envelope")
            .expect("outbound channel closed");
        if predicate(&envelope) {
            return envelope;
        }
    }
}

#[tokio::test]
async fn hover_request_round_trips_through_a_fake_server() {
    if !python3_available() {
        eprintln!("skipping: python3 not available");
        return;
    }
    let workspace = tempfile::tempdir().unwrap();
    let script = fake_server_script(workspace.path());
    let resolver: Box<dyn LanguageServerResolver> =
        Box::new(FixedResolver(vec!["python3".to_string(), script.to_string_lossy().into_owned()]));
    let mut harness = start_harness(resolver);

    harness
        .events_tx
        .send(Event::Inbound(lsp_sidecar::control::InboundEnvelope::Open {
            session_id: "s1".to_string(),
            root_path: workspace.path().to_string_lossy().into_owned(),
            language: "rust".to_string(),
        }))
        .unwrap();

    harness
        .events_tx
        .send(Event::Inbound(lsp_sidecar::control::InboundEnvelope::Message {
            session_id: "s1".to_string(),
            payload: json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "textDocument/hover",
                "params": { "textDocument": { "uri": "file:///src/main.rs" }, "position": { "line": 0, "character": 0 } },
            }),
        }))
        .unwrap();

    let delivered = recv_until(&mut harness.outbound_rx, |env| {
        matches!(env, OutboundEnvelope::Deliver { session_id, .. } if session_id == "s1")
    })
    .await;

    match delivered {
        OutboundEnvelope::Deliver { payload, .. } => {
            assert_eq!(payload["id"], 1);
            assert_eq!(payload["result"]["echoedMethod"], "textDocument/hover");
        }
        _ => unreachable!(),
    }

    harness
        .events_tx
        .send(Event::Inbound(lsp_sidecar::control::InboundEnvelope::Shutdown))
        .unwrap();
    let code = tokio::time::timeout(Duration::from_secs(5), harness.sidecar_task)
        .await
        .expect("sidecar did not shut down in time")
        .unwrap();
    assert_eq!(code, 0);
}

#[tokio::test]
async fn unresolvable_language_yields_a_session_error() {
    struct AlwaysFails;
    impl LanguageServerResolver for AlwaysFails {
        fn resolve(&self, _root_path: &str, _language: &str) -> Result<Vec<String>, String> {
            Err("no server configured".to_string())
        }
    }

    let mut harness = start_harness(Box::new(AlwaysFails));
    harness
        .events_tx
        .send(Event::Inbound(lsp_sidecar::control::InboundEnvelope::Open {
            session_id: "s1".to_string(),
            root_path: "/tmp".to_string(),
            language: "cobol".to_string(),
        }))
        .unwrap();

    let env = recv_until(&mut harness.outbound_rx, |env| matches!(env, OutboundEnvelope::SessionError { .. })).await;
    assert!(matches!(env, OutboundEnvelope::SessionError { session_id, .. } if session_id == "s1"));

    harness
        .events_tx
        .send(Event::Inbound(lsp_sidecar::control::InboundEnvelope::Shutdown))
        .unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), harness.sidecar_task).await;
}

#[tokio::test]
async fn stats_request_reports_zero_when_idle() {
    let mut harness = start_harness(Box::new(FixedResolver(vec!["cat".to_string()])));
    harness
        .events_tx
        .send(Event::Inbound(lsp_sidecar::control::InboundEnvelope::Stats))
        .unwrap();

    let env = recv_until(&mut harness.outbound_rx, |env| matches!(env, OutboundEnvelope::Stats { .. })).await;
    match env {
        OutboundEnvelope::Stats { data } => assert_eq!(data["activeInstances"], 0),
        _ => unreachable!(),
    }

    harness
        .events_tx
        .send(Event::Inbound(lsp_sidecar::control::InboundEnvelope::Shutdown))
        .unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), harness.sidecar_task).await;
}
