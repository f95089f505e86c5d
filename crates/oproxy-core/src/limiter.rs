use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use oproxy_common::GlobalConfig;

use crate::store::SharedStore;

const DAY_SECS: u64 = 86_400;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub window: Duration,
    pub global_rpm: u64,
    pub key_rpm: u64,
    pub ip_rpm: u64,
}

impl RateLimiterConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            window: Duration::from_secs(60),
            global_rpm: global.global_rpm,
            key_rpm: global.key_rpm,
            ip_rpm: global.ip_rpm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDenied {
    pub axis: &'static str,
    pub retry_after: Duration,
}

/// Result of post-call token charging against a key's token budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeVerdict {
    WithinBudget,
    /// The key is over its tokens-per-minute budget until the window rolls.
    TpmExceeded { cooldown: Duration },
    /// The key burned its daily quota; ineligible until midnight UTC.
    DailyExceeded { cooldown: Duration },
}

/// Sliding-window request counters over the shared store, checked in order
/// global → per-principal-key → per-client-IP. The increment and the
/// comparison ride one atomic script, so concurrent requests across a fleet
/// each consume exactly one count.
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>, config: RateLimiterConfig) -> Self {
        Self { store, config }
    }

    /// Gate one accepted request. `key_rpm_override` is the principal's own
    /// limit when set. The first denied axis wins and its window remainder
    /// becomes the Retry-After hint.
    pub async fn check(
        &self,
        client_key_id: i64,
        key_rpm_override: Option<i64>,
        client_ip: Option<&str>,
    ) -> Result<(), RateDenied> {
        let window = self.config.window.as_secs().max(1);
        let bucket = now_unix() / window;
        let ttl = self.config.window * 2;

        let global_key = format!("rl:global:{bucket}");
        if self.over(&global_key, self.config.global_rpm, ttl).await {
            return Err(self.denied("global"));
        }

        let key_limit = key_rpm_override
            .map(|limit| limit.max(0) as u64)
            .unwrap_or(self.config.key_rpm);
        let key_key = format!("rl:key:{client_key_id}:{bucket}");
        if self.over(&key_key, key_limit, ttl).await {
            return Err(self.denied("key"));
        }

        if let Some(ip) = client_ip {
            let ip_key = format!("rl:ip:{ip}:{bucket}");
            if self.over(&ip_key, self.config.ip_rpm, ttl).await {
                return Err(self.denied("ip"));
            }
        }
        Ok(())
    }

    /// Charge reported usage against the key's token budgets. Called after
    /// the upstream response; the in-flight response still completes even
    /// when the verdict marks the key ineligible for the window remainder.
    pub async fn charge_tokens(
        &self,
        key_handle: &str,
        tokens: i64,
        tpm_limit: Option<i64>,
        daily_quota: Option<i64>,
    ) -> ChargeVerdict {
        if tokens <= 0 {
            return ChargeVerdict::WithinBudget;
        }
        let window = self.config.window.as_secs().max(1);
        let now = now_unix();

        if let Some(limit) = tpm_limit {
            let bucket = now / window;
            let key = format!("tl:key:{key_handle}:{bucket}");
            match self
                .store
                .incr_window(&key, tokens, self.config.window * 2)
                .await
            {
                Ok(total) if total > limit => {
                    return ChargeVerdict::TpmExceeded {
                        cooldown: Duration::from_secs(window - now % window),
                    };
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "token charge skipped"),
            }
        }

        if let Some(quota) = daily_quota {
            let day = now / DAY_SECS;
            let key = format!("tl:key:{key_handle}:day:{day}");
            match self
                .store
                .incr_window(&key, tokens, Duration::from_secs(DAY_SECS * 2))
                .await
            {
                Ok(total) if total > quota => {
                    return ChargeVerdict::DailyExceeded {
                        cooldown: Duration::from_secs(DAY_SECS - now % DAY_SECS),
                    };
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "daily quota charge skipped"),
            }
        }
        ChargeVerdict::WithinBudget
    }

    async fn over(&self, key: &str, limit: u64, ttl: Duration) -> bool {
        if limit == 0 {
            return false;
        }
        match self.store.incr_window(key, 1, ttl).await {
            Ok(count) => count > limit as i64,
            Err(err) => {
                // A dead shared store must not take the data plane down with
                // it; the request proceeds uncounted.
                tracing::warn!(error = %err, "rate limit check skipped");
                false
            }
        }
    }

    fn denied(&self, axis: &'static str) -> RateDenied {
        let window = self.config.window.as_secs().max(1);
        RateDenied {
            axis,
            retry_after: Duration::from_secs(window - now_unix() % window),
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
