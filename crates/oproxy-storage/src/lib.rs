pub mod bus;
pub mod db;
pub mod entities;
pub mod snapshot;
pub mod store;

pub use bus::ChangeBus;
pub use db::connect_shared;
pub use snapshot::{ApiKeyRow, ClientKeyRow, ConfigSnapshot, MappingRow, ProviderRow};
pub use store::{ConfigStore, StorageError, StorageResult};
