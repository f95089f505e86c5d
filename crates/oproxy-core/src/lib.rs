pub mod auth;
pub mod bootstrap;
pub mod breaker;
pub mod context;
pub mod engine;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod model_router;
pub mod selector;
pub mod store;
pub mod upstream_client;

pub use context::{AttemptOutcome, AttemptRecord, RequestContext};
pub use engine::{DispatchEngine, DispatchRequest, DispatchResponse};
pub use error::DispatchError;
