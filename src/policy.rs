//! Startup configuration (§4.7). Read once from the environment, immutable
//! thereafter. Mirrors the teacher's habit of centralizing tuning constants
//! (`LSP_REQUEST_TIMEOUT`, `MAX_LSP_MESSAGE_SIZE`) near the top of the module
//! that uses them, but collected into one struct so the whole tunable surface
//! is visible and unit-testable in one place.

use std::collections::HashMap;
use std::time::Duration;

/// Default per-request timeout before a synthetic `-32001` error is sent.
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 6_000;
/// Multiplier applied to the base request timeout for slow languages (C#).
const SLOW_LANGUAGE_TIMEOUT_MULTIPLIER: u64 = 4;
/// Per-instance pending write-queue byte cap.
const DEFAULT_MAX_QUEUE_BYTES: usize = 1_048_576;
/// Deadline for a spawned instance to complete `initialize`.
const DEFAULT_INSTANCE_INIT_TIMEOUT_MS: u64 = 15_000;
/// Consecutive request timeouts before the circuit breaker opens.
const CIRCUIT_BREAKER_THRESHOLD: u32 = 3;
/// How long the breaker stays open once tripped.
const CIRCUIT_BREAKER_OPEN_MS: u64 = 10_000;
/// How long a detached instance may sit idle before TTL eviction reclaims it.
const IDLE_EVICTION_MS: u64 = 300_000;
/// Interval between TTL sweeps.
const SWEEP_INTERVAL_MS: u64 = 60_000;
/// Interval between heartbeat emissions on the control channel.
const HEARTBEAT_INTERVAL_MS: u64 = 5_000;
/// Maximum number of concurrently alive instances.
const DEFAULT_CAPACITY: usize = 3;
/// Stabilization delay after `initialized` before the pre-init queue flushes.
const DEFAULT_STABILIZATION_MS: u64 = 500;
/// Stabilization delay for languages known to report ready before they
/// truly are (per §9's open question on the stabilization delay).
const HEAVY_STABILIZATION_MS: u64 = 3_000;

/// Immutable runtime policy, read once at startup via [`Policy::from_env`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Policy {
    pub request_timeout: Duration,
    pub instance_init_timeout: Duration,
    pub max_queue_bytes: usize,
    pub circuit_breaker_enabled: bool,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_open: Duration,
    pub idle_eviction: Duration,
    pub sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    pub capacity: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            instance_init_timeout: Duration::from_millis(DEFAULT_INSTANCE_INIT_TIMEOUT_MS),
            max_queue_bytes: DEFAULT_MAX_QUEUE_BYTES,
            circuit_breaker_enabled: true,
            circuit_breaker_threshold: CIRCUIT_BREAKER_THRESHOLD,
            circuit_breaker_open: Duration::from_millis(CIRCUIT_BREAKER_OPEN_MS),
            idle_eviction: Duration::from_millis(IDLE_EVICTION_MS),
            sweep_interval: Duration::from_millis(SWEEP_INTERVAL_MS),
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl Policy {
    /// Build policy from the real process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&env)
    }

    /// Build policy from an explicit map, so the non-finite-fallback and
    /// boolean-parsing rules are testable without mutating the real process
    /// environment (which is racy across test threads).
    #[must_use]
    pub fn from_map(env: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            request_timeout: env
                .get("LSP_REQUEST_TIMEOUT_MS")
                .and_then(|v| parse_millis(v))
                .unwrap_or(defaults.request_timeout),
            instance_init_timeout: env
                .get("LSP_INSTANCE_INIT_TIMEOUT_MS")
                .and_then(|v| parse_millis(v))
                .unwrap_or(defaults.instance_init_timeout),
            max_queue_bytes: env
                .get("LSP_MAX_QUEUE_BYTES")
                .and_then(|v| parse_bytes(v))
                .unwrap_or(defaults.max_queue_bytes),
            circuit_breaker_enabled: env
                .get("LSP_CIRCUIT_BREAKER_ENABLED")
                .map_or(defaults.circuit_breaker_enabled, |v| v != "false"),
            ..defaults
        }
    }

    /// Per-request timeout for a given language, applying the slow-language
    /// multiplier (§4.3, "a longer multiplier for slow languages").
    #[must_use]
    pub fn request_timeout_for(&self, language: &str) -> Duration {
        if is_slow_language(language) {
            self.request_timeout * u32::try_from(SLOW_LANGUAGE_TIMEOUT_MULTIPLIER).unwrap_or(4)
        } else {
            self.request_timeout
        }
    }

    /// Stabilization delay after `initialized` before the pre-init queue
    /// flushes, per language (§4.3, §9).
    #[must_use]
    pub fn stabilization_delay_for(&self, language: &str) -> Duration {
        if is_heavy_language(language) {
            Duration::from_millis(HEAVY_STABILIZATION_MS)
        } else {
            Duration::from_millis(DEFAULT_STABILIZATION_MS)
        }
    }
}

/// Languages whose servers are known to be slow to respond to requests.
fn is_slow_language(language: &str) -> bool {
    matches!(language, "csharp")
}

/// Languages whose servers are known to report `initialized` before they
/// are actually ready to serve requests (e.g. heavy project-loading servers).
fn is_heavy_language(language: &str) -> bool {
    matches!(language, "csharp")
}

fn parse_millis(raw: &str) -> Option<Duration> {
    let n: f64 = raw.parse().ok()?;
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    Some(Duration::from_millis(n as u64))
}

fn parse_bytes(raw: &str) -> Option<usize> {
    let n: f64 = raw.parse().ok()?;
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    Some(n as usize)
}
