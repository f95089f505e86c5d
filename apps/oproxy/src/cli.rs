use clap::Parser;

use oproxy_common::GlobalConfigPatch;

/// OpenAI-compatible LLM proxy with key pooling, rate limiting and
/// provider fallback.
#[derive(Debug, Parser)]
#[command(name = "oproxy", version)]
pub struct Cli {
    /// Bind address.
    #[arg(long)]
    pub host: Option<String>,
    /// Bind port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Database DSN holding provider/key/mapping records.
    #[arg(long)]
    pub dsn: Option<String>,
    /// Shared store URL (redis://...), or `memory` for single-process runs.
    #[arg(long)]
    pub shared_store_url: Option<String>,
    /// Default request timeout in seconds.
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,
    /// tracing filter directive.
    #[arg(long)]
    pub log: Option<String>,
}

impl Cli {
    /// CLI flags as a config layer; the master key stays env-only so it
    /// never shows up in process listings.
    pub fn into_patch(self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: self.host,
            port: self.port,
            dsn: self.dsn,
            shared_store_url: self.shared_store_url,
            request_timeout_secs: self.request_timeout_secs,
            log: self.log,
            ..Default::default()
        }
    }
}
