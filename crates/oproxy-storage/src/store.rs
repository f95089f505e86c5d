use sea_orm::{
    ActiveValue, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Schema,
};
use time::OffsetDateTime;

use crate::entities;
use crate::snapshot::{ApiKeyRow, ClientKeyRow, ConfigSnapshot, MappingRow, ProviderRow};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] DbErr),
}

/// Read-mostly access to the routing configuration. Used at bootstrap and by
/// the periodic snapshot refresh; the dispatch hot path never touches it.
#[derive(Clone)]
pub struct ConfigStore {
    db: DatabaseConnection,
}

impl ConfigStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Entity-first schema sync (SeaORM 2.0), run once at bootstrap.
    pub async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Providers)
            .register(entities::ApiKeys)
            .register(entities::ModelMappings)
            .register(entities::ClientKeys)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    pub async fn load_snapshot(&self) -> StorageResult<ConfigSnapshot> {
        let providers = entities::Providers::find()
            .order_by_asc(entities::providers::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| ProviderRow {
                id: row.id,
                name: row.name,
                kind: row.kind,
                base_url: row.base_url,
                config_json: row.config_json,
                enabled: row.enabled,
            })
            .collect();

        let api_keys = entities::ApiKeys::find()
            .order_by_asc(entities::api_keys::Column::Priority)
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| ApiKeyRow {
                id: row.id,
                provider_id: row.provider_id,
                key_id: row.key_id,
                secret_ciphertext: row.secret_ciphertext,
                masked: row.masked,
                priority: row.priority,
                rpm_limit: row.rpm_limit,
                tpm_limit: row.tpm_limit,
                daily_quota: row.daily_quota,
                status: row.status,
                failure_count: row.failure_count,
                last_used_at: row.last_used_at,
            })
            .collect();

        let mappings = entities::ModelMappings::find()
            .order_by_asc(entities::model_mappings::Column::OrderIndex)
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| MappingRow {
                id: row.id,
                alias: row.alias,
                provider_id: row.provider_id,
                provider_model: row.provider_model,
                order_index: row.order_index,
                is_default: row.is_default,
                override_json: row.override_json,
                enabled: row.enabled,
            })
            .collect();

        let client_keys = entities::ClientKeys::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| ClientKeyRow {
                id: row.id,
                key_value: row.key_value,
                label: row.label,
                rpm_limit: row.rpm_limit,
                enabled: row.enabled,
            })
            .collect();

        Ok(ConfigSnapshot {
            providers,
            api_keys,
            mappings,
            client_keys,
        })
    }

    /// Persist a key demotion (auto-demote to `failed`) so other processes
    /// pick it up on their next snapshot refresh.
    pub async fn set_api_key_status(
        &self,
        key_id: i64,
        status: &str,
        failure_count: i32,
    ) -> StorageResult<()> {
        let now = OffsetDateTime::now_utc();
        entities::ApiKeys::update_many()
            .col_expr(
                entities::api_keys::Column::Status,
                sea_orm::sea_query::Expr::value(status),
            )
            .col_expr(
                entities::api_keys::Column::FailureCount,
                sea_orm::sea_query::Expr::value(failure_count),
            )
            .col_expr(
                entities::api_keys::Column::LastFailureAt,
                sea_orm::sea_query::Expr::value(now),
            )
            .filter(entities::api_keys::Column::Id.eq(key_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Seed helper used by deploy tooling and integration tests.
    pub async fn insert_provider(
        &self,
        name: &str,
        kind: &str,
        base_url: &str,
        config_json: serde_json::Value,
    ) -> StorageResult<i64> {
        let now = OffsetDateTime::now_utc();
        let result = entities::Providers::insert(entities::providers::ActiveModel {
            id: ActiveValue::NotSet,
            name: ActiveValue::Set(name.to_string()),
            kind: ActiveValue::Set(kind.to_string()),
            base_url: ActiveValue::Set(base_url.to_string()),
            config_json: ActiveValue::Set(config_json),
            enabled: ActiveValue::Set(true),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        })
        .exec(&self.db)
        .await?;
        Ok(result.last_insert_id)
    }
}
