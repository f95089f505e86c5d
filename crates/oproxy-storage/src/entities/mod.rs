pub mod api_keys;
pub mod client_keys;
pub mod model_mappings;
pub mod providers;

pub use api_keys::Entity as ApiKeys;
pub use client_keys::Entity as ClientKeys;
pub use model_mappings::Entity as ModelMappings;
pub use providers::Entity as Providers;
