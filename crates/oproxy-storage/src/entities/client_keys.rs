use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Downstream principals: the bearer keys clients present to the proxy.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "client_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "client_key_value")]
    pub key_value: String,
    pub label: Option<String>,
    /// Per-principal requests/minute; `None` falls back to the global default.
    pub rpm_limit: Option<i64>,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
}

impl ActiveModelBehavior for ActiveModel {}
