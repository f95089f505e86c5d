use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: String,
    },
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > built-in defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN where provider/key/mapping records live.
    pub dsn: String,
    /// Shared key-value store URL (redis). The literal value `memory`
    /// opts into the process-local store for single-process deployments.
    pub shared_store_url: String,
    /// 32-byte master encryption key, hex or base64 encoded.
    pub master_key: String,
    pub global_rpm: u64,
    pub key_rpm: u64,
    pub ip_rpm: u64,
    pub breaker_threshold: u32,
    pub breaker_window_secs: u64,
    pub breaker_open_secs: u64,
    pub request_timeout_secs: u64,
    /// tracing filter directive, e.g. `info` or `oproxy_core=debug`.
    pub log: String,
}

impl GlobalConfig {
    pub fn use_memory_store(&self) -> bool {
        self.shared_store_url.trim().eq_ignore_ascii_case("memory")
    }
}

/// Optional layer used while merging global config sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub shared_store_url: Option<String>,
    pub master_key: Option<String>,
    pub global_rpm: Option<u64>,
    pub key_rpm: Option<u64>,
    pub ip_rpm: Option<u64>,
    pub breaker_threshold: Option<u32>,
    pub breaker_window_secs: Option<u64>,
    pub breaker_open_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub log: Option<String>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.shared_store_url.is_some() {
            self.shared_store_url = other.shared_store_url;
        }
        if other.master_key.is_some() {
            self.master_key = other.master_key;
        }
        if other.global_rpm.is_some() {
            self.global_rpm = other.global_rpm;
        }
        if other.key_rpm.is_some() {
            self.key_rpm = other.key_rpm;
        }
        if other.ip_rpm.is_some() {
            self.ip_rpm = other.ip_rpm;
        }
        if other.breaker_threshold.is_some() {
            self.breaker_threshold = other.breaker_threshold;
        }
        if other.breaker_window_secs.is_some() {
            self.breaker_window_secs = other.breaker_window_secs;
        }
        if other.breaker_open_secs.is_some() {
            self.breaker_open_secs = other.breaker_open_secs;
        }
        if other.request_timeout_secs.is_some() {
            self.request_timeout_secs = other.request_timeout_secs;
        }
        if other.log.is_some() {
            self.log = other.log;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let config = GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8700),
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            shared_store_url: self
                .shared_store_url
                .ok_or(GlobalConfigError::MissingField("shared_store_url"))?,
            master_key: self
                .master_key
                .ok_or(GlobalConfigError::MissingField("master_key"))?,
            global_rpm: self.global_rpm.unwrap_or(600),
            key_rpm: self.key_rpm.unwrap_or(60),
            ip_rpm: self.ip_rpm.unwrap_or(120),
            breaker_threshold: self.breaker_threshold.unwrap_or(5),
            breaker_window_secs: self.breaker_window_secs.unwrap_or(60),
            breaker_open_secs: self.breaker_open_secs.unwrap_or(30),
            request_timeout_secs: self.request_timeout_secs.unwrap_or(120),
            log: self.log.unwrap_or_else(|| "info".to_string()),
        };
        if config.breaker_threshold == 0 {
            return Err(GlobalConfigError::InvalidValue {
                field: "breaker_threshold",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(config)
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            dsn: Some(value.dsn),
            shared_store_url: Some(value.shared_store_url),
            master_key: Some(value.master_key),
            global_rpm: Some(value.global_rpm),
            key_rpm: Some(value.key_rpm),
            ip_rpm: Some(value.ip_rpm),
            breaker_threshold: Some(value.breaker_threshold),
            breaker_window_secs: Some(value.breaker_window_secs),
            breaker_open_secs: Some(value.breaker_open_secs),
            request_timeout_secs: Some(value.request_timeout_secs),
            log: Some(value.log),
        }
    }
}
