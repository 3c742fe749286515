//! Server instance (C3, §3, §4.3): one managed child language-server
//! process — its framed I/O, write queue, init state, pending requests,
//! stderr scanner and circuit breaker.
//!
//! Everything here is plain owned data mutated from the single dispatcher
//! loop (§5) — no internal locking. The only things that cross a task
//! boundary are the child's stdio handles (owned directly, since only the
//! dispatcher ever writes to `stdin`) and the per-instance reader/stderr
//! tasks, which only ever *send* decoded frames into the dispatcher's event
//! channel; they never touch `Instance` state directly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::UnboundedSender;

use crate::dispatcher::Event;
use crate::framing;
use crate::resolver::LanguageServerResolver;

/// The id used for the internal `initialize` request sent at spawn time.
pub const INIT_REQUEST_ID: &str = "internal-init";

/// Key identifying one managed instance: `(rootPath, normalizedLanguage)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub root_path: String,
    pub language: String,
}

impl InstanceKey {
    #[must_use]
    pub fn new(root_path: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            language: language.into(),
        }
    }
}

/// An event produced by an instance's background I/O tasks, forwarded into
/// the dispatcher's single event channel.
#[derive(Debug)]
pub enum InstanceIoEvent {
    Frame { key: InstanceKey, body: Vec<u8> },
    StderrLine { key: InstanceKey, line: String },
    Exited { key: InstanceKey },
}

/// One pending request awaiting a response from the child (§3).
pub struct PendingRequest {
    pub session_id: String,
    pub client_request_id: Value,
    pub timeout_handle: tokio::task::JoinHandle<()>,
}

/// One managed language-server child process (§3).
pub struct Instance {
    pub key: InstanceKey,
    pub root_uri: String,
    child: Child,
    stdin: ChildStdin,
    pub clients: HashSet<String>,
    pub initialized: bool,
    pub pre_init_queue: VecDeque<(String, Value)>,
    pub last_used_at: Instant,
    pub pending_requests: HashMap<String, PendingRequest>,
    pub write_queue: VecDeque<Vec<u8>>,
    pub queued_bytes: usize,
    pub write_in_flight: bool,
    pub consecutive_timeouts: u32,
    pub breaker_open_until: Option<Instant>,
    pub init_timer: Option<tokio::task::JoinHandle<()>>,
    pub stabilization_timer: Option<tokio::task::JoinHandle<()>>,
    pub shutting_down: bool,
    pub reported_once_errors: HashSet<String>,
}

impl Instance {
    /// Spawn a child process for `key` using `resolver`, wire up its stdio,
    /// and spawn the background reader/stderr tasks that forward
    /// [`InstanceIoEvent`]s into `events`.
    ///
    /// # Errors
    ///
    /// Returns an error string suitable for a `session-error` payload if the
    /// resolver fails or the process cannot be spawned.
    pub fn spawn(
        key: InstanceKey,
        resolver: &dyn LanguageServerResolver,
        events: UnboundedSender<Event>,
    ) -> Result<Self, String> {
        let argv = resolver.resolve(&key.root_path, &key.language)?;
        let (program, args) = argv.split_first().ok_or("resolver returned empty argv")?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&key.root_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn language server: {e}"))?;

        let stdin = child.stdin.take().ok_or("no stdin on spawned child")?;
        let stdout = child.stdout.take().ok_or("no stdout on spawned child")?;
        let stderr = child.stderr.take().ok_or("no stderr on spawned child")?;

        spawn_reader_task(key.clone(), stdout, events.clone());
        spawn_stderr_task(key.clone(), stderr, events);

        // §4.3: rootUri is a file URI with trailing slash.
        let root_uri = format!("{}/", crate::json_walk::path_to_file_uri(&key.root_path));

        Ok(Self {
            key,
            root_uri,
            child,
            stdin,
            clients: HashSet::new(),
            initialized: false,
            pre_init_queue: VecDeque::new(),
            last_used_at: Instant::now(),
            pending_requests: HashMap::new(),
            write_queue: VecDeque::new(),
            queued_bytes: 0,
            write_in_flight: false,
            consecutive_timeouts: 0,
            breaker_open_until: None,
            init_timer: None,
            stabilization_timer: None,
            shutting_down: false,
            reported_once_errors: HashSet::new(),
        })
    }

    /// Kill the child process. Best-effort; the process may already be dead.
    pub async fn kill(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }

    /// Is the per-instance circuit breaker currently open?
    #[must_use]
    pub fn breaker_open(&self) -> bool {
        self.breaker_open_until
            .is_some_and(|deadline| deadline > Instant::now())
    }

    /// Abort every pending request's timeout task and clear the map. Used on
    /// session close and instance teardown.
    pub fn abort_all_pending(&mut self) {
        for (_, pending) in self.pending_requests.drain() {
            pending.timeout_handle.abort();
        }
    }

    /// Abort and remove pending requests belonging to `session_id`.
    pub fn abort_pending_for_session(&mut self, session_id: &str) {
        let ids: Vec<String> = self
            .pending_requests
            .iter()
            .filter(|(_, p)| p.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(pending) = self.pending_requests.remove(&id) {
                pending.timeout_handle.abort();
            }
        }
    }

    /// Abort the init and stabilization timers, if any.
    pub fn abort_init_timers(&mut self) {
        if let Some(h) = self.init_timer.take() {
            h.abort();
        }
        if let Some(h) = self.stabilization_timer.take() {
            h.abort();
        }
    }

    /// Queue a framed packet for writing, enforcing the per-instance
    /// backpressure cap (§4.3 "Write queue & backpressure").
    pub fn try_enqueue(&mut self, packet: Vec<u8>, max_queue_bytes: usize) -> EnqueueOutcome {
        if self.queued_bytes + packet.len() > max_queue_bytes {
            return EnqueueOutcome::Overflow;
        }
        self.queued_bytes += packet.len();
        self.write_queue.push_back(packet);
        EnqueueOutcome::Enqueued
    }

    /// Drain the write queue to the child's stdin. A no-op if a drain is
    /// already in flight (§3 invariant: at most one write drainer).
    pub async fn drain_writes(&mut self) -> std::io::Result<()> {
        if self.write_in_flight {
            return Ok(());
        }
        self.write_in_flight = true;
        while let Some(packet) = self.write_queue.pop_front() {
            self.queued_bytes -= packet.len();
            if let Err(e) = self.stdin.write_all(&packet).await {
                self.write_in_flight = false;
                return Err(e);
            }
        }
        let flush_result = self.stdin.flush().await;
        self.write_in_flight = false;
        flush_result
    }
}

/// Outcome of attempting to enqueue a packet onto an instance's write queue.
#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Overflow,
}

/// Build the internal `initialize` request body (§4.3).
#[must_use]
pub fn build_initialize_request(key: &InstanceKey, root_uri: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": INIT_REQUEST_ID,
        "method": "initialize",
        "params": {
            "processId": std::process::id(),
            "rootPath": key.root_path,
            "rootUri": root_uri,
            "workspaceFolders": [{
                "uri": root_uri,
                "name": workspace_folder_name(&key.root_path),
            }],
            "capabilities": client_capabilities(),
        }
    })
}

fn workspace_folder_name(root_path: &str) -> String {
    std::path::Path::new(root_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(root_path)
        .to_string()
}

/// Client capabilities advertised to every spawned server (§4.3): the
/// common `textDocument`/`workspace` feature set.
fn client_capabilities() -> Value {
    json!({
        "textDocument": {
            "hover": { "contentFormat": ["markdown", "plaintext"] },
            "definition": { "linkSupport": true },
            "references": {},
            "documentSymbol": {},
            "codeAction": {},
            "rename": {},
            "signatureHelp": {},
            "completion": {
                "completionItem": {
                    "snippetSupport": true,
                    "documentationFormat": ["markdown", "plaintext"],
                }
            },
            "publishDiagnostics": {},
        },
        "workspace": {
            "workspaceFolders": true,
            "configuration": true,
            "didChangeWatchedFiles": { "dynamicRegistration": true },
            "symbol": {},
            "executeCommand": {},
        }
    })
}

/// Build the `initialized` notification sent after the init response.
#[must_use]
pub fn build_initialized_notification() -> Value {
    json!({ "jsonrpc": "2.0", "method": "initialized", "params": {} })
}

/// Build the default `workspace/didChangeConfiguration` sent after init.
#[must_use]
pub fn build_did_change_configuration() -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "workspace/didChangeConfiguration",
        "params": { "settings": {} }
    })
}

/// If `method`/`id` identify one of the three requests the sidecar answers
/// on the server's behalf (§4.3), build the synthetic response. Returns
/// `None` for anything else, which should instead be broadcast.
#[must_use]
pub fn self_answer(method: &str, id: &Value, params: &Value, root_folder_uri: &str) -> Option<Value> {
    match method {
        "workspace/configuration" => {
            let count = params
                .get("items")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            let result: Vec<Value> = (0..count).map(|_| json!({})).collect();
            Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
        }
        "client/registerCapability" => {
            Some(json!({ "jsonrpc": "2.0", "id": id, "result": Value::Null }))
        }
        "workspace/workspaceFolders" => Some(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": [{ "uri": root_folder_uri, "name": root_folder_uri }]
        })),
        _ => None,
    }
}

/// Construct the internal id sent to the child for a client request (§3
/// invariant 4).
#[must_use]
pub fn internal_request_id(session_id: &str, client_request_id: &Value) -> String {
    format!("{session_id}:{}", compact_id(client_request_id))
}

fn compact_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn spawn_reader_task(
    key: InstanceKey,
    mut stdout: tokio::process::ChildStdout,
    events: UnboundedSender<Event>,
) {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        loop {
            match framing::read_and_decode(&mut stdout, &mut buf, |body| {
                let _ = events.send(Event::Io(InstanceIoEvent::Frame {
                    key: key.clone(),
                    body,
                }));
            })
            .await
            {
                Ok(true) => continue,
                Ok(false) | Err(_) => {
                    let _ = events.send(Event::Io(InstanceIoEvent::Exited { key: key.clone() }));
                    break;
                }
            }
        }
    });
}

fn spawn_stderr_task(
    key: InstanceKey,
    stderr: tokio::process::ChildStderr,
    events: UnboundedSender<Event>,
) {
    use tokio::io::{AsyncBufReadExt, BufReader};
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if events
                .send(Event::Io(InstanceIoEvent::StderrLine {
                    key: key.clone(),
                    line,
                }))
                .is_err()
            {
                break;
            }
        }
    });
}

/// Known stderr advisory patterns surfaced once per instance (§4.3). Returns
/// a dedupe key and canned message for the first matching pattern.
#[must_use]
pub fn match_known_stderr_advisory(line: &str) -> Option<(&'static str, &'static str)> {
    if line.contains("Could not load project") || line.contains("MSBuild") && line.contains("fail")
    {
        return Some((
            "msbuild-load-failure",
            "Language server reported a project load failure. \
             Check that the workspace builds with the local toolchain.",
        ));
    }
    None
}

/// Lines from the child's stderr that are pure noise (§4.3 "informational
/// line filter").
#[must_use]
pub fn is_informational_stderr_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("[Info")
        || trimmed.starts_with("[info")
        || trimmed.starts_with("info:")
        || trimmed.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_id_round_trips_session() {
        let id = internal_request_id("s1", &json!(7));
        assert_eq!(id, "s1:7");
    }

    #[test]
    fn internal_id_with_string_client_id() {
        let id = internal_request_id("s1", &json!("abc"));
        assert_eq!(id, "s1:abc");
    }

    #[test]
    fn self_answers_workspace_configuration_with_matching_length() {
        let params = json!({ "items": [{}, {}, {}] });
        let resp = self_answer("workspace/configuration", &json!(1), &params, "file:///repo").unwrap();
        assert_eq!(resp["result"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn self_answers_register_capability_with_null() {
        let resp =
            self_answer("client/registerCapability", &json!(2), &json!({}), "file:///repo").unwrap();
        assert_eq!(resp["result"], Value::Null);
    }

    #[test]
    fn non_self_answered_methods_return_none() {
        assert!(self_answer("window/logMessage", &json!(3), &json!({}), "file:///repo").is_none());
    }

    #[test]
    fn informational_stderr_lines_are_filtered() {
        assert!(is_informational_stderr_line("[Info] starting up"));
        assert!(!is_informational_stderr_line("panic: out of memory"));
    }

    #[tokio::test]
    async fn try_enqueue_reports_overflow_past_the_byte_cap() {
        use crate::resolver::FixedResolver;
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let resolver = FixedResolver(vec!["cat".to_string()]);
        let mut inst = Instance::spawn(InstanceKey::new("/tmp", "rust"), &resolver, tx).unwrap();
        assert_eq!(inst.try_enqueue(vec![0u8; 10], 20), EnqueueOutcome::Enqueued);
        assert_eq!(inst.try_enqueue(vec![0u8; 20], 20), EnqueueOutcome::Overflow);
        assert_eq!(inst.queued_bytes, 10);
    }

    #[test]
    fn initialize_request_has_reserved_id_and_workspace_folder() {
        let key = InstanceKey::new("/repo/project", "rust");
        let req = build_initialize_request(&key, "file:///repo/project/");
        assert_eq!(req["id"], INIT_REQUEST_ID);
        assert_eq!(req["params"]["rootUri"], "file:///repo/project/");
        assert_eq!(req["params"]["workspaceFolders"][0]["uri"], "file:///repo/project/");
        assert_eq!(req["params"]["workspaceFolders"][0]["name"], "project");
    }

    #[tokio::test]
    async fn spawned_instance_root_uri_has_trailing_slash() {
        use crate::resolver::FixedResolver;
        let resolver = FixedResolver(vec!["cat".to_string()]);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let inst = Instance::spawn(InstanceKey::new("/tmp", "rust"), &resolver, tx).unwrap();
        assert!(inst.root_uri.ends_with('/'), "root_uri was {:?}", inst.root_uri);
    }
}
