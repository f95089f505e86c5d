use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Alias → provider-model binding. `(alias, order_index)` is unique; at most
/// one mapping per alias carries `is_default` (enforced at admin ingest).
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "model_mappings")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "mapping_alias_order")]
    pub alias: String,
    pub provider_id: i64,
    pub provider_model: String,
    /// Smaller = tried first.
    #[sea_orm(unique_key = "mapping_alias_order")]
    pub order_index: i32,
    pub is_default: bool,
    /// Closed override schema (temperature, top_p, max_tokens, forced).
    pub override_json: Json,
    pub enabled: bool,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "provider_id", to = "id", on_delete = "Cascade")]
    pub provider: HasOne<super::providers::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
