use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "providers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "provider_name")]
    pub name: String,
    /// Type tag: openai | anthropic | ollama | mock | custom_http.
    pub kind: String,
    pub base_url: String,
    /// Closed schema, validated at admin ingest (timeout_ms, max_retries, ...).
    pub config_json: Json,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub api_keys: HasMany<super::api_keys::Entity>,
    #[sea_orm(has_many)]
    pub model_mappings: HasMany<super::model_mappings::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
