use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use oproxy_provider::Outcome;

/// Consecutive auth/quota failures before a key is demoted to failed.
const DEMOTE_THRESHOLD: u32 = 3;
/// Cooldown ceiling for upstream Retry-After hints.
const MAX_COOLDOWN: Duration = Duration::from_secs(60);
const DEFAULT_RATE_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Lowest priority value wins; ties broken least-recently-used.
    Priority,
    /// Per-provider rotating cursor. An ineligible cursor target scans
    /// forward, wrapping at most once.
    RoundRobin,
    /// Smallest usage count in the current minute window.
    LeastUsed,
}

/// One selectable upstream credential, as materialized by the model router.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub id: i64,
    /// Logging handle; never the secret.
    pub key_id: String,
    pub ciphertext: String,
    pub masked: String,
    pub priority: i32,
    pub rpm_limit: Option<i64>,
    pub tpm_limit: Option<i64>,
    pub daily_quota: Option<i64>,
    /// status == active in the config store.
    pub active: bool,
}

#[derive(Debug, Default, Clone)]
struct KeyHealth {
    consecutive_failures: u32,
    transient_failures: u32,
    failed: bool,
    cooldown_until: Option<Instant>,
    over_quota_until: Option<Instant>,
    last_used: Option<Instant>,
    usage_window: u64,
    usage_count: u64,
    last_outcome: Option<&'static str>,
}

impl KeyHealth {
    fn eligible(&self, now: Instant) -> bool {
        if self.failed {
            return false;
        }
        if self.cooldown_until.is_some_and(|until| until > now) {
            return false;
        }
        if self.over_quota_until.is_some_and(|until| until > now) {
            return false;
        }
        true
    }
}

/// Feedback the engine may need to act on after an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    /// The key crossed the demotion threshold and is evicted for this
    /// process until a manual reset.
    Demoted { failure_count: u32 },
}

/// Picks one eligible key per attempt and tracks per-key health locally.
/// Health is deliberately per-process: it is cheap, and disagreement between
/// processes only costs a wasted probe.
pub struct KeySelector {
    strategy: SelectionStrategy,
    health: RwLock<HashMap<i64, KeyHealth>>,
    cursors: RwLock<HashMap<i64, usize>>,
}

impl KeySelector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            health: RwLock::new(HashMap::new()),
            cursors: RwLock::new(HashMap::new()),
        }
    }

    /// Select one key for `provider_id`, skipping `excluded` ids (keys
    /// already tried within the current request).
    pub async fn acquire(
        &self,
        provider_id: i64,
        keys: &[KeyRecord],
        excluded: &[i64],
    ) -> Option<KeyRecord> {
        let now = Instant::now();
        let mut health = self.health.write().await;

        let eligible: Vec<usize> = keys
            .iter()
            .enumerate()
            .filter(|(_, key)| key.active && !excluded.contains(&key.id))
            .filter(|(_, key)| {
                health
                    .get(&key.id)
                    .map(|entry| entry.eligible(now))
                    .unwrap_or(true)
            })
            .filter(|(_, key)| within_rpm_budget(health.get(&key.id), key, now_minute()))
            .map(|(index, _)| index)
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let chosen = match self.strategy {
            SelectionStrategy::Priority => pick_priority(keys, &eligible, &health),
            SelectionStrategy::RoundRobin => {
                let mut cursors = self.cursors.write().await;
                let cursor = cursors.entry(provider_id).or_insert(0);
                let index = pick_round_robin(keys, &eligible, *cursor)
                    .unwrap_or_else(|| pick_priority(keys, &eligible, &health));
                *cursor = (index + 1) % keys.len().max(1);
                index
            }
            SelectionStrategy::LeastUsed => pick_least_used(keys, &eligible, &health),
        };

        let key = keys[chosen].clone();
        let entry = health.entry(key.id).or_default();
        let minute = now_minute();
        if entry.usage_window != minute {
            entry.usage_window = minute;
            entry.usage_count = 0;
        }
        entry.usage_count += 1;
        Some(key)
    }

    /// Feed the attempt outcome back into local health state. Auth/quota
    /// rejections count toward demotion; transient faults only cool down.
    pub async fn observe(&self, key: &KeyRecord, outcome: &Outcome) -> Option<KeyEvent> {
        let mut health = self.health.write().await;
        let entry = health.entry(key.id).or_default();
        entry.last_outcome = Some(outcome.as_str());
        match outcome {
            Outcome::Ok => {
                entry.consecutive_failures = 0;
                entry.transient_failures = 0;
                entry.last_used = Some(Instant::now());
                None
            }
            Outcome::AuthFailed | Outcome::QuotaExhausted => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= DEMOTE_THRESHOLD && !entry.failed {
                    entry.failed = true;
                    return Some(KeyEvent::Demoted {
                        failure_count: entry.consecutive_failures,
                    });
                }
                None
            }
            Outcome::RateLimited { retry_after } => {
                let cooldown = retry_after
                    .unwrap_or(DEFAULT_RATE_COOLDOWN)
                    .min(MAX_COOLDOWN);
                entry.cooldown_until = Some(Instant::now() + cooldown);
                None
            }
            Outcome::Timeout | Outcome::NetworkError | Outcome::ServerError => {
                entry.transient_failures += 1;
                None
            }
            Outcome::BadRequest => None,
        }
    }

    /// Post-call token budget verdicts land here.
    pub async fn mark_over_quota(&self, key_id: i64, cooldown: Duration) {
        let mut health = self.health.write().await;
        let entry = health.entry(key_id).or_default();
        entry.over_quota_until = Some(Instant::now() + cooldown);
    }

    /// Manual reset: clears the failed flag and counters for one key.
    pub async fn reset_key(&self, key_id: i64) {
        let mut health = self.health.write().await;
        health.remove(&key_id);
    }

    pub async fn is_failed(&self, key_id: i64) -> bool {
        self.health
            .read()
            .await
            .get(&key_id)
            .map(|entry| entry.failed)
            .unwrap_or(false)
    }
}

fn within_rpm_budget(entry: Option<&KeyHealth>, key: &KeyRecord, minute: u64) -> bool {
    let Some(limit) = key.rpm_limit else {
        return true;
    };
    let Some(entry) = entry else {
        return true;
    };
    if entry.usage_window != minute {
        return true;
    }
    (entry.usage_count as i64) < limit
}

fn pick_priority(
    keys: &[KeyRecord],
    eligible: &[usize],
    health: &HashMap<i64, KeyHealth>,
) -> usize {
    *eligible
        .iter()
        .min_by_key(|&&index| {
            let key = &keys[index];
            let last_used = health.get(&key.id).and_then(|entry| entry.last_used);
            // Ties on priority go to the least-recently-used key.
            (key.priority, last_used.map(|at| at.elapsed()).map(std::cmp::Reverse))
        })
        .expect("eligible is non-empty")
}

fn pick_round_robin(keys: &[KeyRecord], eligible: &[usize], cursor: usize) -> Option<usize> {
    if keys.is_empty() {
        return None;
    }
    let len = keys.len();
    (0..len)
        .map(|offset| (cursor + offset) % len)
        .find(|index| eligible.contains(index))
}

fn pick_least_used(
    keys: &[KeyRecord],
    eligible: &[usize],
    health: &HashMap<i64, KeyHealth>,
) -> usize {
    let minute = now_minute();
    *eligible
        .iter()
        .min_by_key(|&&index| {
            health
                .get(&keys[index].id)
                .filter(|entry| entry.usage_window == minute)
                .map(|entry| entry.usage_count)
                .unwrap_or(0)
        })
        .expect("eligible is non-empty")
}

fn now_minute() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() / 60)
        .unwrap_or(0)
}
