use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

use oproxy_provider::{MappingOverride, ProviderEndpoint};
use oproxy_storage::{ConfigSnapshot, ConfigStore};

use crate::selector::KeyRecord;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// One entry of the ranked candidate list for an alias.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub mapping_id: i64,
    pub alias: String,
    pub provider: ProviderEndpoint,
    pub provider_model: String,
    pub override_config: MappingOverride,
    /// Provider keys in priority order; the selector filters for health.
    pub keys: Vec<KeyRecord>,
}

/// alias → ordered candidates, resolved from an in-memory snapshot. The
/// snapshot is replaced wholesale by the refresh task (bounded interval plus
/// eager change signals), so the hot path is one lock-free load.
pub struct ModelRouter {
    table: ArcSwap<HashMap<String, Vec<Candidate>>>,
}

impl ModelRouter {
    pub fn new(snapshot: &ConfigSnapshot) -> Self {
        Self {
            table: ArcSwap::from_pointee(build_table(snapshot)),
        }
    }

    pub fn empty() -> Self {
        Self {
            table: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn rebuild(&self, snapshot: &ConfigSnapshot) {
        self.table.store(Arc::new(build_table(snapshot)));
    }

    /// The ordered candidate list for `alias`; empty means model_not_found.
    pub fn resolve(&self, alias: &str) -> Vec<Candidate> {
        self.table
            .load()
            .get(alias)
            .cloned()
            .unwrap_or_default()
    }

    /// Client-visible model ids, for `GET /v1/models`.
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.table.load().keys().cloned().collect();
        aliases.sort();
        aliases
    }

    /// Reload on a bounded interval and eagerly on admin change signals.
    /// Changes become visible within REFRESH_INTERVAL at the latest.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        store: ConfigStore,
        mut changes: watch::Receiver<u64>,
    ) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
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
                match store.load_snapshot().await {
                    Ok(snapshot) => router.rebuild(&snapshot),
                    Err(err) => tracing::warn!(error = %err, "config snapshot reload failed"),
                }
            }
        })
    }
}

fn build_table(snapshot: &ConfigSnapshot) -> HashMap<String, Vec<Candidate>> {
    // Resolve endpoints once; mappings to unparseable or disabled providers
    // are dropped as if absent.
    let mut endpoints: HashMap<i64, ProviderEndpoint> = HashMap::new();
    for provider in &snapshot.providers {
        if !provider.enabled {
            continue;
        }
        match ProviderEndpoint::from_record(
            provider.id,
            &provider.name,
            &provider.kind,
            &provider.base_url,
            &provider.config_json,
        ) {
            Ok(endpoint) => {
                endpoints.insert(provider.id, endpoint);
            }
            Err(err) => {
                tracing::warn!(provider = %provider.name, error = %err, "provider config rejected");
            }
        }
    }

    let mut keys_by_provider: HashMap<i64, Vec<KeyRecord>> = HashMap::new();
    for key in &snapshot.api_keys {
        if key.status == "disabled" {
            continue;
        }
        keys_by_provider
            .entry(key.provider_id)
            .or_default()
            .push(KeyRecord {
                id: key.id,
                key_id: key.key_id.clone(),
                ciphertext: key.secret_ciphertext.clone(),
                masked: key.masked.clone(),
                priority: key.priority,
                rpm_limit: key.rpm_limit,
                tpm_limit: key.tpm_limit,
                daily_quota: key.daily_quota,
                active: key.status == "active",
            });
    }
    for keys in keys_by_provider.values_mut() {
        keys.sort_by_key(|key| key.priority);
    }

    let mut table: HashMap<String, Vec<Candidate>> = HashMap::new();
    for mapping in &snapshot.mappings {
        if !mapping.enabled {
            continue;
        }
        let Some(endpoint) = endpoints.get(&mapping.provider_id) else {
            continue;
        };
        let override_config = match MappingOverride::from_json(&mapping.override_json) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(alias = %mapping.alias, error = %err, "mapping override rejected");
                continue;
            }
        };
        table
            .entry(mapping.alias.clone())
            .or_default()
            .push(Candidate {
                mapping_id: mapping.id,
                alias: mapping.alias.clone(),
                provider: endpoint.clone(),
                provider_model: mapping.provider_model.clone(),
                override_config,
                keys: keys_by_provider
                    .get(&mapping.provider_id)
                    .cloned()
                    .unwrap_or_default(),
            });
    }

    // order_index ascending, with the default mapping hoisted first.
    let order: HashMap<i64, (bool, i32)> = snapshot
        .mappings
        .iter()
        .map(|mapping| (mapping.id, (!mapping.is_default, mapping.order_index)))
        .collect();
    for candidates in table.values_mut() {
        candidates.sort_by_key(|candidate| {
            order
                .get(&candidate.mapping_id)
                .copied()
                .unwrap_or((true, i32::MAX))
        });
    }
    table
}
