use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use oproxy_common::GlobalConfig;

use crate::store::SharedStore;

const STATE_TTL: Duration = Duration::from_secs(86_400);
const CAS_ATTEMPTS: u32 = 4;
/// Open duration doubles on half-open failure, capped at this multiple.
const MAX_OPEN_MULTIPLIER: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

/// Shared per-provider state, serialized as JSON under `cb:{provider_id}`.
/// Every mutation goes through compare-and-swap on the raw value so a fleet
/// of proxies agrees on transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub phase: CircuitPhase,
    pub failures: u32,
    pub window_start: u64,
    pub open_until: u64,
    pub open_secs: u64,
    pub probes_admitted: u32,
    pub probe_successes: u32,
}

impl CircuitState {
    fn closed(now: u64) -> Self {
        Self {
            phase: CircuitPhase::Closed,
            failures: 0,
            window_start: now,
            open_until: 0,
            open_secs: 0,
            probes_admitted: 0,
            probe_successes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub window: Duration,
    pub open_duration: Duration,
    pub probe_count: u32,
}

impl BreakerConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            failure_threshold: global.breaker_threshold,
            window: Duration::from_secs(global.breaker_window_secs),
            open_duration: Duration::from_secs(global.breaker_open_secs),
            probe_count: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, call proceeds.
    Allowed,
    /// Half-open probe slot granted.
    Probe,
    /// Short-circuited; skip to the next candidate.
    Open { retry_after: Duration },
}

pub struct CircuitBreaker {
    store: Arc<dyn SharedStore>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn SharedStore>, config: BreakerConfig) -> Self {
        Self { store, config }
    }

    /// Gate a call to `provider_id`. May transition open → half-open when the
    /// open period has elapsed.
    pub async fn admit(&self, provider_id: i64) -> Admission {
        let key = state_key(provider_id);
        for _ in 0..CAS_ATTEMPTS {
            let now = now_unix();
            let (raw, state) = self.load(&key).await;
            let Some(state) = state else {
                return Admission::Allowed;
            };
            match state.phase {
                CircuitPhase::Closed => return Admission::Allowed,
                CircuitPhase::Open => {
                    if now < state.open_until {
                        return Admission::Open {
                            retry_after: Duration::from_secs(state.open_until - now),
                        };
                    }
                    // Open period elapsed: claim the first half-open probe.
                    let mut next = state.clone();
                    next.phase = CircuitPhase::HalfOpen;
                    next.probes_admitted = 1;
                    next.probe_successes = 0;
                    if self.swap(&key, raw.as_deref(), &next).await {
                        return Admission::Probe;
                    }
                }
                CircuitPhase::HalfOpen => {
                    if state.probes_admitted >= self.config.probe_count {
                        return Admission::Open {
                            retry_after: Duration::from_secs(1),
                        };
                    }
                    let mut next = state.clone();
                    next.probes_admitted += 1;
                    if self.swap(&key, raw.as_deref(), &next).await {
                        return Admission::Probe;
                    }
                }
            }
        }
        // Contended beyond reason; let the call through rather than stall.
        Admission::Allowed
    }

    pub async fn record_success(&self, provider_id: i64) {
        let key = state_key(provider_id);
        for _ in 0..CAS_ATTEMPTS {
            let now = now_unix();
            let (raw, state) = self.load(&key).await;
            let Some(state) = state else {
                return;
            };
            let next = match state.phase {
                CircuitPhase::Closed => {
                    if state.failures == 0 {
                        return;
                    }
                    CircuitState::closed(now)
                }
                CircuitPhase::HalfOpen => {
                    let mut next = state.clone();
                    next.probe_successes += 1;
                    if next.probe_successes >= self.config.probe_count {
                        CircuitState::closed(now)
                    } else {
                        next
                    }
                }
                // A success landing after the breaker re-opened is stale.
                CircuitPhase::Open => return,
            };
            if self.swap(&key, raw.as_deref(), &next).await {
                return;
            }
        }
    }

    pub async fn record_failure(&self, provider_id: i64) {
        let key = state_key(provider_id);
        for _ in 0..CAS_ATTEMPTS {
            let now = now_unix();
            let (raw, state) = self.load(&key).await;
            let state = state.unwrap_or_else(|| CircuitState::closed(now));
            let next = match state.phase {
                CircuitPhase::Closed => {
                    let mut next = state.clone();
                    if now.saturating_sub(next.window_start) > self.config.window.as_secs() {
                        next.window_start = now;
                        next.failures = 0;
                    }
                    next.failures += 1;
                    if next.failures >= self.config.failure_threshold {
                        next.phase = CircuitPhase::Open;
                        next.open_secs = self.config.open_duration.as_secs().max(1);
                        next.open_until = now + next.open_secs;
                    }
                    next
                }
                CircuitPhase::HalfOpen => {
                    // Probe failed: back to open with doubled duration.
                    let base = self.config.open_duration.as_secs().max(1);
                    let doubled = (state.open_secs.max(base)) * 2;
                    let mut next = state.clone();
                    next.phase = CircuitPhase::Open;
                    next.open_secs = doubled.min(base * MAX_OPEN_MULTIPLIER);
                    next.open_until = now + next.open_secs;
                    next.failures = 0;
                    next.probes_admitted = 0;
                    next.probe_successes = 0;
                    next
                }
                CircuitPhase::Open => return,
            };
            if self.swap(&key, raw.as_deref(), &next).await {
                return;
            }
        }
    }

    /// Admin force-reset back to closed.
    pub async fn reset(&self, provider_id: i64) {
        let key = state_key(provider_id);
        for _ in 0..CAS_ATTEMPTS {
            let (raw, state) = self.load(&key).await;
            if state.is_none() {
                return;
            }
            let next = CircuitState::closed(now_unix());
            if self.swap(&key, raw.as_deref(), &next).await {
                return;
            }
        }
    }

    pub async fn current_phase(&self, provider_id: i64) -> CircuitPhase {
        let (_, state) = self.load(&state_key(provider_id)).await;
        state.map(|state| state.phase).unwrap_or(CircuitPhase::Closed)
    }

    async fn load(&self, key: &str) -> (Option<String>, Option<CircuitState>) {
        match self.store.get(key).await {
            Ok(Some(raw)) => {
                let state = serde_json::from_str(&raw).ok();
                (Some(raw), state)
            }
            Ok(None) => (None, None),
            Err(err) => {
                tracing::warn!(error = %err, "circuit state read failed");
                (None, None)
            }
        }
    }

    async fn swap(&self, key: &str, expected: Option<&str>, next: &CircuitState) -> bool {
        let Ok(value) = serde_json::to_string(next) else {
            return true;
        };
        match self
            .store
            .compare_and_swap(key, expected, &value, Some(STATE_TTL))
            .await
        {
            Ok(swapped) => swapped,
            Err(err) => {
                tracing::warn!(error = %err, "circuit state write failed");
                true
            }
        }
    }
}

fn state_key(provider_id: i64) -> String {
    format!("cb:{provider_id}")
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
