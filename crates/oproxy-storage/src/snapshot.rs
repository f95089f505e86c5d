use serde_json::Value as JsonValue;
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct ProviderRow {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub base_url: String,
    pub config_json: JsonValue,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRow {
    pub id: i64,
    pub provider_id: i64,
    pub key_id: String,
    pub secret_ciphertext: String,
    pub masked: String,
    pub priority: i32,
    pub rpm_limit: Option<i64>,
    pub tpm_limit: Option<i64>,
    pub daily_quota: Option<i64>,
    pub status: String,
    pub failure_count: i32,
    pub last_used_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct MappingRow {
    pub id: i64,
    pub alias: String,
    pub provider_id: i64,
    pub provider_model: String,
    pub order_index: i32,
    pub is_default: bool,
    pub override_json: JsonValue,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct ClientKeyRow {
    pub id: i64,
    pub key_value: String,
    pub label: Option<String>,
    pub rpm_limit: Option<i64>,
    pub enabled: bool,
}

/// One consistent read of the routing configuration. Runtime reads never hit
/// the database; they work off in-memory copies of this snapshot.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub providers: Vec<ProviderRow>,
    pub api_keys: Vec<ApiKeyRow>,
    pub mappings: Vec<MappingRow>,
    pub client_keys: Vec<ClientKeyRow>,
}

impl ConfigSnapshot {
    pub fn provider(&self, id: i64) -> Option<&ProviderRow> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn keys_for_provider(&self, provider_id: i64) -> Vec<&ApiKeyRow> {
        self.api_keys
            .iter()
            .filter(|k| k.provider_id == provider_id)
            .collect()
    }
}
