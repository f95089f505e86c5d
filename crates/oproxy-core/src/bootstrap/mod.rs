use std::sync::Arc;

use anyhow::Context;

use oproxy_common::{GlobalConfig, GlobalConfigPatch};
use oproxy_provider::KeyVault;
use oproxy_storage::{ChangeBus, ConfigStore, connect_shared};

use crate::auth::ClientAuth;
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::engine::DispatchEngine;
use crate::limiter::{RateLimiter, RateLimiterConfig};
use crate::model_router::{ModelRouter, REFRESH_INTERVAL};
use crate::selector::{KeySelector, SelectionStrategy};
use crate::store;
use crate::upstream_client::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};

/// Everything a serving process needs, wired together once at startup.
pub struct Bootstrap {
    pub config: GlobalConfig,
    pub engine: Arc<DispatchEngine>,
    pub router: Arc<ModelRouter>,
    pub auth: Arc<ClientAuth>,
    pub limiter: Arc<RateLimiter>,
    pub bus: ChangeBus,
    pub storage: ConfigStore,
}

/// Read the OPROXY_* environment surface into a config patch. CLI flags are
/// overlaid on top of this by the binary.
pub fn patch_from_env() -> GlobalConfigPatch {
    fn var(name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|value| !value.is_empty())
    }
    fn parse<T: std::str::FromStr>(name: &str) -> Option<T> {
        var(name).and_then(|value| value.parse().ok())
    }

    GlobalConfigPatch {
        host: var("OPROXY_HOST"),
        port: parse("OPROXY_PORT"),
        dsn: var("OPROXY_DSN"),
        shared_store_url: var("OPROXY_SHARED_STORE_URL"),
        master_key: var("OPROXY_MASTER_KEY"),
        global_rpm: parse("OPROXY_GLOBAL_RPM"),
        key_rpm: parse("OPROXY_KEY_RPM"),
        ip_rpm: parse("OPROXY_IP_RPM"),
        breaker_threshold: parse("OPROXY_BREAKER_THRESHOLD"),
        breaker_window_secs: parse("OPROXY_BREAKER_WINDOW_SECS"),
        breaker_open_secs: parse("OPROXY_BREAKER_OPEN_SECS"),
        request_timeout_secs: parse("OPROXY_REQUEST_TIMEOUT_SECS"),
        log: var("OPROXY_LOG"),
    }
}

pub async fn bootstrap(config: GlobalConfig) -> anyhow::Result<Bootstrap> {
    let vault =
        KeyVault::from_master_key(&config.master_key).context("master encryption key rejected")?;

    let db = connect_shared(&config.dsn)
        .await
        .context("database connection failed")?;
    let storage = ConfigStore::new(db);
    storage.sync().await.context("schema sync failed")?;
    let snapshot = storage
        .load_snapshot()
        .await
        .context("initial config snapshot failed")?;
    tracing::info!(
        providers = snapshot.providers.len(),
        api_keys = snapshot.api_keys.len(),
        mappings = snapshot.mappings.len(),
        "configuration loaded"
    );

    let shared = store::connect(&config.shared_store_url)
        .await
        .context("shared store connection failed")?;
    if config.use_memory_store() {
        tracing::warn!("using process-local shared store; rate limits and circuit state are not fleet-wide");
    }

    let router = Arc::new(ModelRouter::new(&snapshot));
    let auth = Arc::new(ClientAuth::new(&snapshot));
    let limiter = Arc::new(RateLimiter::new(
        Arc::clone(&shared),
        RateLimiterConfig::from_global(&config),
    ));
    let breaker = CircuitBreaker::new(Arc::clone(&shared), BreakerConfig::from_global(&config));
    let selector = Arc::new(KeySelector::new(SelectionStrategy::Priority));

    let client: Arc<dyn UpstreamClient> = Arc::new(
        WreqUpstreamClient::new(UpstreamClientConfig::default())
            .context("upstream client build failed")?,
    );

    let engine = Arc::new(DispatchEngine::new(
        Arc::clone(&router),
        breaker,
        selector,
        vault,
        Arc::clone(&limiter),
        client,
        Some(storage.clone()),
    ));

    let bus = ChangeBus::new();
    router.spawn_refresh(storage.clone(), bus.subscribe());
    spawn_auth_refresh(Arc::clone(&auth), storage.clone(), bus.subscribe());

    Ok(Bootstrap {
        config,
        engine,
        router,
        auth,
        limiter,
        bus,
        storage,
    })
}

fn spawn_auth_refresh(
    auth: Arc<ClientAuth>,
    storage: ConfigStore,
    mut changes: tokio::sync::watch::Receiver<u64>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            match storage.load_snapshot().await {
                Ok(snapshot) => auth.rebuild(&snapshot),
                Err(err) => tracing::warn!(error = %err, "client key snapshot reload failed"),
            }
        }
    });
}
