//! Central event loop (C6, §5): the single task that owns the instance
//! registry and session router and is the only place either is mutated.
//! Every background task — the control channel reader, per-instance
//! stdout/stderr readers, timers — only ever sends an [`Event`] into one
//! channel; nothing outside this module touches [`Instance`] state.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::control::{InboundEnvelope, OutboundEnvelope, OutboundSink};
use crate::instance::{self, EnqueueOutcome, Instance, InstanceIoEvent, InstanceKey, PendingRequest};
use crate::json_walk;
use crate::policy::Policy;
use crate::registry;
use crate::resolver::{LanguageDetector, LanguageServerResolver};

/// Everything that can move the sidecar's state forward. Produced by
/// background tasks, consumed one at a time by [`Sidecar::run`].
#[derive(Debug)]
pub enum Event {
    Inbound(InboundEnvelope),
    Io(InstanceIoEvent),
    RequestTimeout { key: InstanceKey, internal_id: String },
    InitTimeout { key: InstanceKey },
    StabilizationElapsed { key: InstanceKey },
    TtlSweep,
    Heartbeat,
    /// The control channel was lost without an explicit `shutdown`, or some
    /// other condition the dispatcher cannot recover from (§7 class 1).
    Fatal(String),
}

/// Owns the instance registry and session router. Constructed once in
/// `main`, driven to completion by [`Sidecar::run`].
pub struct Sidecar {
    instances: HashMap<InstanceKey, Instance>,
    router: HashMap<String, InstanceKey>,
    policy: Policy,
    resolver: Box<dyn LanguageServerResolver>,
    detector: LanguageDetector,
    outbound: OutboundSink,
    events_tx: UnboundedSender<Event>,
    restarting_keys: HashSet<InstanceKey>,
}

impl Sidecar {
    #[must_use]
    pub fn new(
        policy: Policy,
        resolver: Box<dyn LanguageServerResolver>,
        outbound: OutboundSink,
    ) -> (Self, UnboundedReceiver<Event>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                instances: HashMap::new(),
                router: HashMap::new(),
                policy,
                resolver,
                detector: LanguageDetector::new(),
                outbound,
                events_tx,
                restarting_keys: HashSet::new(),
            },
            events_rx,
        )
    }

    /// A sender background tasks (control reader, timers) can clone to feed
    /// events into this sidecar.
    #[must_use]
    pub fn events_sender(&self) -> UnboundedSender<Event> {
        self.events_tx.clone()
    }

    /// Run until a `shutdown` envelope or a fatal condition is seen. Returns
    /// the process exit code (§6).
    pub async fn run(mut self, mut events_rx: UnboundedReceiver<Event>) -> i32 {
        self.spawn_timers();
        loop {
            let Some(event) = events_rx.recv().await else {
                break;
            };
            if let Some(code) = self.handle_event(event).await {
                return code;
            }
        }
        0
    }

    fn spawn_timers(&self) {
        let tx = self.events_tx.clone();
        let sweep_interval = self.policy.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                if tx.send(Event::TtlSweep).is_err() {
                    break;
                }
            }
        });

        let tx = self.events_tx.clone();
        let heartbeat_interval = self.policy.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            loop {
                ticker.tick().await;
                if tx.send(Event::Heartbeat).is_err() {
                    break;
                }
            }
        });
    }

    async fn handle_event(&mut self, event: Event) -> Option<i32> {
        match event {
            Event::Inbound(InboundEnvelope::Open {
                session_id,
                root_path,
                language,
            }) => {
                self.open(session_id, root_path, language).await;
                None
            }
            Event::Inbound(InboundEnvelope::Message { session_id, payload }) => {
                self.message(session_id, payload).await;
                None
            }
            Event::Inbound(InboundEnvelope::Close { session_id }) => {
                self.close(&session_id);
                None
            }
            Event::Inbound(InboundEnvelope::Warmup { root_path }) => {
                self.warmup(root_path).await;
                None
            }
            Event::Inbound(InboundEnvelope::Stats) => {
                self.stats();
                None
            }
            Event::Inbound(InboundEnvelope::Shutdown) => {
                self.shutdown_all().await;
                Some(0)
            }
            Event::Io(InstanceIoEvent::Frame { key, body }) => {
                self.handle_child_frame(key, body).await;
                None
            }
            Event::Io(InstanceIoEvent::StderrLine { key, line }) => {
                self.handle_stderr_line(&key, &line);
                None
            }
            Event::Io(InstanceIoEvent::Exited { key }) => {
                self.handle_child_exited(key).await;
                None
            }
            Event::RequestTimeout { key, internal_id } => {
                self.handle_request_timeout(&key, &internal_id).await;
                None
            }
            Event::InitTimeout { key } => {
                self.trigger_restart(key, "language server did not respond to initialize in time".to_string())
                    .await;
                None
            }
            Event::StabilizationElapsed { key } => {
                self.handle_stabilization(&key).await;
                None
            }
            Event::TtlSweep => {
                self.handle_ttl_sweep().await;
                None
            }
            Event::Heartbeat => {
                self.emit_heartbeat();
                None
            }
            Event::Fatal(error) => {
                self.outbound.send(OutboundEnvelope::Fatal { error });
                self.shutdown_all().await;
                Some(1)
            }
        }
    }

    // ---- control envelope handlers -------------------------------------

    async fn open(&mut self, session_id: String, root_path: String, language: String) {
        let normalized = crate::resolver::normalize_language(&language);
        let key = InstanceKey::new(root_path, normalized);

        if let Some(existing) = self.router.get(&session_id) {
            if *existing == key {
                if let Some(inst) = self.instances.get_mut(existing) {
                    inst.last_used_at = Instant::now();
                }
            } else {
                tracing::warn!(
                    "ignoring open for session {session_id} against a different root/language while already attached"
                );
            }
            return;
        }

        if !self.instances.contains_key(&key) {
            if let Err(e) = self.admit_and_spawn(key.clone()).await {
                self.outbound.send(OutboundEnvelope::SessionError { session_id, error: e });
                return;
            }
        }

        if let Some(inst) = self.instances.get_mut(&key) {
            inst.clients.insert(session_id.clone());
            inst.last_used_at = Instant::now();
        }
        self.router.insert(session_id, key);
    }

    async fn message(&mut self, session_id: String, payload: Value) {
        let Some(key) = self.router.get(&session_id).cloned() else {
            self.outbound.send(OutboundEnvelope::SessionError {
                session_id,
                error: "no open session with this id".to_string(),
            });
            return;
        };
        if let Some(inst) = self.instances.get_mut(&key) {
            inst.last_used_at = Instant::now();
        }

        match payload {
            // §9 "Raw-forward escape hatch": a payload that arrives as a
            // JSON string rather than an object is a pre-framed blob the
            // host could not parse as structured JSON-RPC. It is forwarded
            // byte-for-byte, with no id correlation or URI rewriting, since
            // we cannot safely rewrite what we cannot parse.
            Value::String(raw) => {
                self.write_raw(&key, raw.into_bytes()).await;
            }
            Value::Object(_) => {
                self.route_structured_message(&key, &session_id, payload).await;
            }
            other => {
                tracing::warn!("dropping message with unexpected payload shape: {other}");
            }
        }
    }

    async fn route_structured_message(&mut self, key: &InstanceKey, session_id: &str, mut payload: Value) {
        let root_path = key.root_path.clone();
        json_walk::rewrite_uris(&mut payload, &|u| json_walk::rewrite_ingress(u, &root_path));

        // Only a request (id + method) goes through id-rewrite/correlation/
        // breaker refusal (§4.3). A response to a server-originated request
        // (id, no method) must reach the child with its id untouched.
        let is_client_request = payload.get("id").is_some() && payload.get("method").is_some();
        if is_client_request {
            self.route_client_request(key, session_id, payload).await;
        } else {
            self.enqueue_or_write(key, session_id, payload).await;
        }
    }

    async fn route_client_request(&mut self, key: &InstanceKey, session_id: &str, mut payload: Value) {
        let breaker_open = self.instances.get(key).is_some_and(Instance::breaker_open);
        if breaker_open {
            let client_id = payload["id"].clone();
            self.outbound.send(OutboundEnvelope::Deliver {
                session_id: session_id.to_string(),
                payload: json!({
                    "jsonrpc": "2.0",
                    "id": client_id,
                    "error": {
                        "code": -32001,
                        "message": "language server temporarily unavailable (circuit breaker open)",
                    },
                }),
            });
            return;
        }

        let client_request_id = payload["id"].clone();
        let internal_id = instance::internal_request_id(session_id, &client_request_id);
        payload["id"] = json!(internal_id.clone());

        let timeout = self.policy.request_timeout_for(&key.language);
        let tx = self.events_tx.clone();
        let (timeout_key, timeout_id) = (key.clone(), internal_id.clone());
        let timeout_handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Event::RequestTimeout {
                key: timeout_key,
                internal_id: timeout_id,
            });
        });

        if let Some(inst) = self.instances.get_mut(key) {
            if let Some(old) = inst.pending_requests.remove(&internal_id) {
                old.timeout_handle.abort();
            }
            inst.pending_requests.insert(
                internal_id,
                PendingRequest {
                    session_id: session_id.to_string(),
                    client_request_id,
                    timeout_handle,
                },
            );
        }

        self.enqueue_or_write(key, session_id, payload).await;
    }

    async fn enqueue_or_write(&mut self, key: &InstanceKey, session_id: &str, payload: Value) {
        let needs_queue = self.instances.get(key).is_some_and(|i| !i.initialized);
        if needs_queue {
            if let Some(inst) = self.instances.get_mut(key) {
                inst.pre_init_queue.push_back((session_id.to_string(), payload));
            }
        } else {
            self.write_value(key, &payload).await;
        }
    }

    fn close(&mut self, session_id: &str) {
        let Some(key) = self.router.remove(session_id) else {
            return;
        };
        if let Some(inst) = self.instances.get_mut(&key) {
            inst.clients.remove(session_id);
            inst.abort_pending_for_session(session_id);
            inst.last_used_at = Instant::now();
        }
    }

    async fn warmup(&mut self, root_path: String) {
        let Some(language) = self.detector.detect(std::path::Path::new(&root_path)) else {
            tracing::debug!("warmup: no recognizable language marker under {root_path}");
            return;
        };
        let key = InstanceKey::new(root_path, language.to_string());
        if self.instances.contains_key(&key) {
            if let Some(inst) = self.instances.get_mut(&key) {
                inst.last_used_at = Instant::now();
            }
            return;
        }
        if let Err(e) = self.admit_and_spawn(key).await {
            tracing::warn!("warmup spawn failed: {e}");
        }
    }

    fn stats(&mut self) {
        let pending_requests: usize = self.instances.values().map(|i| i.pending_requests.len()).sum();
        let instances: Vec<Value> = self
            .instances
            .keys()
            .map(|k| json!({ "rootPath": k.root_path, "language": k.language }))
            .collect();
        let data = json!({
            "activeInstances": self.instances.len(),
            "activeSessions": self.router.len(),
            "pendingRequests": pending_requests,
            "instances": instances,
        });
        self.outbound.send(OutboundEnvelope::Stats { data });
    }

    async fn shutdown_all(&mut self) {
        let keys: Vec<InstanceKey> = self.instances.keys().cloned().collect();
        for key in keys {
            if let Some(mut inst) = self.instances.remove(&key) {
                inst.shutting_down = true;
                inst.abort_all_pending();
                inst.abort_init_timers();
                inst.kill().await;
            }
        }
        self.router.clear();
    }

    // ---- child process events -------------------------------------------

    async fn handle_child_frame(&mut self, key: InstanceKey, body: Vec<u8>) {
        let Ok(mut msg) = serde_json::from_slice::<Value>(&body) else {
            tracing::warn!("dropping malformed JSON frame from language server at {}", key.root_path);
            return;
        };

        let Some(id) = msg.get("id").cloned() else {
            let root_uri = self.instances.get(&key).map(|i| i.root_uri.clone()).unwrap_or_default();
            json_walk::rewrite_uris(&mut msg, &|u| json_walk::rewrite_egress(u, &root_uri));
            self.broadcast(&key, &msg);
            return;
        };

        if id == json!(instance::INIT_REQUEST_ID) {
            self.handle_init_response(&key).await;
            return;
        }

        if let Some(id_str) = id.as_str() {
            let pending = self.instances.get_mut(&key).and_then(|i| i.pending_requests.remove(id_str));
            if let Some(pending) = pending {
                pending.timeout_handle.abort();
                if let Some(inst) = self.instances.get_mut(&key) {
                    inst.consecutive_timeouts = 0;
                }
                msg["id"] = pending.client_request_id;
                let root_uri = self.instances.get(&key).map(|i| i.root_uri.clone()).unwrap_or_default();
                json_walk::rewrite_uris(&mut msg, &|u| json_walk::rewrite_egress(u, &root_uri));
                self.outbound.send(OutboundEnvelope::Deliver {
                    session_id: pending.session_id,
                    payload: msg,
                });
                return;
            }
        }

        if let Some(method) = msg.get("method").and_then(Value::as_str).map(str::to_string) {
            let params = msg.get("params").cloned().unwrap_or(Value::Null);
            let root_uri = self.instances.get(&key).map(|i| i.root_uri.clone()).unwrap_or_default();
            if let Some(response) = instance::self_answer(&method, &id, &params, &root_uri) {
                self.write_value(&key, &response).await;
            } else {
                json_walk::rewrite_uris(&mut msg, &|u| json_walk::rewrite_egress(u, &root_uri));
                self.broadcast(&key, &msg);
            }
            return;
        }

        tracing::debug!("dropping response to an unknown or already-resolved request id");
    }

    fn broadcast(&self, key: &InstanceKey, msg: &Value) {
        let Some(inst) = self.instances.get(key) else {
            return;
        };
        for session_id in &inst.clients {
            self.outbound.send(OutboundEnvelope::Deliver {
                session_id: session_id.clone(),
                payload: msg.clone(),
            });
        }
    }

    async fn handle_init_response(&mut self, key: &InstanceKey) {
        if let Some(inst) = self.instances.get_mut(key) {
            if let Some(h) = inst.init_timer.take() {
                h.abort();
            }
        } else {
            return;
        }

        self.write_value(key, &instance::build_initialized_notification()).await;
        self.write_value(key, &instance::build_did_change_configuration()).await;

        let delay = self.policy.stabilization_delay_for(&key.language);
        let tx = self.events_tx.clone();
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Event::StabilizationElapsed { key: timer_key });
        });
        if let Some(inst) = self.instances.get_mut(key) {
            inst.stabilization_timer = Some(handle);
        }
    }

    async fn handle_stabilization(&mut self, key: &InstanceKey) {
        let queued = {
            let Some(inst) = self.instances.get_mut(key) else {
                return;
            };
            inst.initialized = true;
            inst.stabilization_timer = None;
            inst.consecutive_timeouts = 0;
            std::mem::take(&mut inst.pre_init_queue)
        };
        for (_session_id, payload) in queued {
            self.write_value(key, &payload).await;
        }
    }

    fn handle_stderr_line(&mut self, key: &InstanceKey, line: &str) {
        if instance::is_informational_stderr_line(line) {
            return;
        }
        if let Some((dedupe_key, advisory)) = instance::match_known_stderr_advisory(line) {
            let already_reported = self
                .instances
                .get(key)
                .is_some_and(|i| i.reported_once_errors.contains(dedupe_key));
            if already_reported {
                return;
            }
            let sessions: Vec<String> = self
                .instances
                .get_mut(key)
                .map(|i| {
                    i.reported_once_errors.insert(dedupe_key.to_string());
                    i.clients.iter().cloned().collect()
                })
                .unwrap_or_default();
            for session_id in sessions {
                self.outbound.send(OutboundEnvelope::SessionError {
                    session_id,
                    error: advisory.to_string(),
                });
            }
            return;
        }
        tracing::debug!(root = %key.root_path, language = %key.language, "language server stderr: {line}");
    }

    async fn handle_child_exited(&mut self, key: InstanceKey) {
        if !self.instances.contains_key(&key) {
            return;
        }
        self.trigger_restart(key, "language server process exited unexpectedly".to_string())
            .await;
    }

    async fn handle_request_timeout(&mut self, key: &InstanceKey, internal_id: &str) {
        let Some(pending) = self.instances.get_mut(key).and_then(|i| i.pending_requests.remove(internal_id)) else {
            return;
        };

        self.outbound.send(OutboundEnvelope::Deliver {
            session_id: pending.session_id,
            payload: json!({
                "jsonrpc": "2.0",
                "id": pending.client_request_id,
                "error": { "code": -32001, "message": "language server request timed out" },
            }),
        });

        let breaker_tripped = {
            let Some(inst) = self.instances.get_mut(key) else {
                return;
            };
            inst.consecutive_timeouts += 1;
            let tripped =
                self.policy.circuit_breaker_enabled && inst.consecutive_timeouts >= self.policy.circuit_breaker_threshold;
            if tripped {
                inst.breaker_open_until = Some(Instant::now() + self.policy.circuit_breaker_open);
                inst.consecutive_timeouts = 0;
            }
            tripped
        };

        // Opening the breaker alone leaves a wedged process running; §4.3
        // pairs it with a restart so the next attempt gets a fresh instance.
        if breaker_tripped {
            self.trigger_restart(key.clone(), "request timeout threshold exceeded".to_string())
                .await;
        }
    }

    async fn handle_ttl_sweep(&mut self) {
        let now = Instant::now();
        let expired = registry::ttl_expired_keys(&self.instances, self.policy.idle_eviction, now);
        for key in expired {
            self.evict(key, "idle eviction").await;
        }
    }

    fn emit_heartbeat(&self) {
        let pending_requests: usize = self.instances.values().map(|i| i.pending_requests.len()).sum();
        self.outbound.send(OutboundEnvelope::Heartbeat {
            ts: now_millis(),
            active_instances: self.instances.len(),
            active_sessions: self.router.len(),
            pending_requests,
        });
    }

    // ---- admission, eviction, restart ------------------------------------

    async fn admit_and_spawn(&mut self, key: InstanceKey) -> Result<(), String> {
        if !self.instances.contains_key(&key) && self.instances.len() >= self.policy.capacity {
            if let Some(victim) = registry::select_eviction_victim(&self.instances) {
                self.evict(victim, "capacity limit reached").await;
            }
        }
        let inst = Instance::spawn(key.clone(), self.resolver.as_ref(), self.events_tx.clone())?;
        self.instances.insert(key.clone(), inst);
        self.begin_initialize(&key).await;
        Ok(())
    }

    async fn begin_initialize(&mut self, key: &InstanceKey) {
        let Some(root_uri) = self.instances.get(key).map(|i| i.root_uri.clone()) else {
            return;
        };
        let request = instance::build_initialize_request(key, &root_uri);

        let timeout = self.policy.instance_init_timeout;
        let tx = self.events_tx.clone();
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Event::InitTimeout { key: timer_key });
        });
        if let Some(inst) = self.instances.get_mut(key) {
            inst.init_timer = Some(handle);
        }

        self.write_value(key, &request).await;
    }

    /// Evict `key` without preserving its sessions: each attached session is
    /// told why before being dropped from the router (capacity pressure and
    /// idle TTL both go through here; see `registry::select_eviction_victim`
    /// for why an attached instance can be the victim).
    async fn evict(&mut self, key: InstanceKey, reason: &str) {
        if let Some(inst) = self.instances.get(&key) {
            let sessions: Vec<String> = inst.clients.iter().cloned().collect();
            for session_id in sessions {
                self.outbound.send(OutboundEnvelope::SessionError {
                    session_id: session_id.clone(),
                    error: format!("LSP server evicted: {reason}"),
                });
                self.router.remove(&session_id);
            }
        }
        if let Some(mut inst) = self.instances.remove(&key) {
            inst.shutting_down = true;
            inst.abort_all_pending();
            inst.abort_init_timers();
            inst.kill().await;
        }
    }

    /// Idempotent restart-with-session-preservation (§4.4): tearing down and
    /// respawning under the same key transfers every attached session for
    /// free, since the router still maps them to `key`.
    async fn trigger_restart(&mut self, key: InstanceKey, reason: String) {
        if self.restarting_keys.contains(&key) {
            return;
        }
        self.restarting_keys.insert(key.clone());

        let Some(mut old) = self.instances.remove(&key) else {
            self.restarting_keys.remove(&key);
            return;
        };
        let sessions: Vec<String> = old.clients.iter().cloned().collect();
        old.shutting_down = true;
        old.abort_all_pending();
        old.abort_init_timers();
        old.kill().await;

        match Instance::spawn(key.clone(), self.resolver.as_ref(), self.events_tx.clone()) {
            Ok(mut fresh) => {
                fresh.clients = sessions.iter().cloned().collect();
                self.instances.insert(key.clone(), fresh);
                for session_id in &sessions {
                    self.outbound.send(OutboundEnvelope::SessionError {
                        session_id: session_id.clone(),
                        error: format!("LSP server restarted: {reason}"),
                    });
                }
                Box::pin(self.begin_initialize(&key)).await;
            }
            Err(e) => {
                for session_id in &sessions {
                    self.router.remove(session_id);
                    self.outbound.send(OutboundEnvelope::SessionError {
                        session_id: session_id.clone(),
                        error: format!("LSP server restart failed: {e}"),
                    });
                }
            }
        }

        self.restarting_keys.remove(&key);
    }

    async fn write_value(&mut self, key: &InstanceKey, value: &Value) {
        let Ok(body) = serde_json::to_vec(value) else {
            tracing::warn!("dropping value that failed to serialize");
            return;
        };
        self.write_raw(key, body).await;
    }

    async fn write_raw(&mut self, key: &InstanceKey, body: Vec<u8>) {
        let packet = crate::framing::encode_frame(&body);
        let outcome = {
            let Some(inst) = self.instances.get_mut(key) else {
                return;
            };
            inst.try_enqueue(packet, self.policy.max_queue_bytes)
        };

        match outcome {
            EnqueueOutcome::Overflow => {
                self.trigger_restart(key.clone(), "write queue overflow".to_string()).await;
            }
            EnqueueOutcome::Enqueued => {
                let result = {
                    let Some(inst) = self.instances.get_mut(key) else {
                        return;
                    };
                    inst.drain_writes().await
                };
                if result.is_err() {
                    self.trigger_restart(key.clone(), "write to language server failed".to_string())
                        .await;
                }
            }
        }
    }
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
