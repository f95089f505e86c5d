use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Upstream provider credentials. The secret is stored sealed; the masked
/// form is fixed at creation and is the only shape that ever reaches logs.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub provider_id: i64,
    /// Stable handle used in logs and selection bookkeeping.
    #[sea_orm(unique_key = "api_key_handle")]
    pub key_id: String,
    /// base64(nonce || aes-256-gcm ciphertext).
    pub secret_ciphertext: String,
    pub masked: String,
    /// Lower value = preferred.
    pub priority: i32,
    pub rpm_limit: Option<i64>,
    pub tpm_limit: Option<i64>,
    pub daily_quota: Option<i64>,
    /// active | disabled | failed.
    pub status: String,
    pub failure_count: i32,
    pub last_failure_at: Option<OffsetDateTime>,
    pub last_used_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "provider_id", to = "id", on_delete = "Cascade")]
    pub provider: HasOne<super::providers::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
