pub mod adapter;
pub mod adapters;
pub mod config;
pub mod errors;
pub mod http;
pub mod outcome;
pub mod vault;

pub use adapter::{Capability, ProviderAdapter, adapter_for};
pub use config::{
    KindOptions, MappingOverride, ProviderEndpoint, ProviderKind, ProviderSettings,
};
pub use errors::{ProviderError, ProviderResult};
pub use http::{
    ByteStream, Headers, HttpMethod, TransportErrorKind, UpstreamBody, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse, header_get, header_set,
};
pub use outcome::Outcome;
pub use vault::{KeyVault, UnsealedKey, VaultError, mask_secret};
