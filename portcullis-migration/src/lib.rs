//! Schema migrations for durable counter stores
//!
//! Fast stores such as Redis need no schema. Durable SQL stores describe their
//! tables as an ordered list of [`Migration`]s and apply them through a
//! backend-specific [`MigrationManager`], which records applied versions in
//! its own tracking table.
use async_trait::async_trait;
use portcullis_core::error::StorageError;
use sqlx::Database;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, MigrationError>;

impl From<MigrationError> for portcullis_core::Error {
    fn from(e: MigrationError) -> Self {
        StorageError::Migration(e.to_string()).into()
    }
}

#[async_trait]
pub trait Migration<DB: Database>: Send + Sync {
    /// Execute the migration
    async fn up<'a>(&'a self, conn: &'a mut <DB as Database>::Connection) -> Result<()>;

    /// Rollback the migration
    async fn down<'a>(&'a self, conn: &'a mut <DB as Database>::Connection) -> Result<()>;

    /// Unique version number for ordering migrations
    fn version(&self) -> i64;

    /// Human readable name of the migration
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MigrationRecord {
    pub version: i64,
    pub name: String,
    /// Unix timestamp in seconds.
    pub applied_at: i64,
}

#[async_trait]
pub trait MigrationManager<DB: Database>: Send + Sync {
    fn get_migration_table_name(&self) -> &str {
        "_portcullis_migrations"
    }

    /// Initialize migration tracking table
    async fn initialize(&self) -> Result<()>;

    /// Apply pending migrations in version order
    async fn up(&self, migrations: &[Box<dyn Migration<DB>>]) -> Result<()>;

    /// Roll back applied migrations in reverse version order
    async fn down(&self, migrations: &[Box<dyn Migration<DB>>]) -> Result<()>;

    /// Get list of applied migrations
    async fn get_applied_migrations(&self) -> Result<Vec<MigrationRecord>>;

    /// Check if specific migration was applied
    async fn is_applied(&self, version: i64) -> Result<bool>;

    /// Versions from `migrations` not yet applied, in ascending order.
    async fn pending_versions(&self, migrations: &[Box<dyn Migration<DB>>]) -> Result<Vec<i64>> {
        let applied: Vec<i64> = self
            .get_applied_migrations()
            .await?
            .into_iter()
            .map(|record| record.version)
            .collect();
        let mut pending: Vec<i64> = migrations
            .iter()
            .map(|migration| migration.version())
            .filter(|version| !applied.contains(version))
            .collect();
        pending.sort_unstable();
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_error_maps_to_storage_error() {
        let error: portcullis_core::Error =
            MigrationError::Migration("version 3 failed".to_string()).into();
        assert!(error.is_storage_error());
        assert_eq!(
            error.to_string(),
            "Storage error: Migration error: Migration failed: version 3 failed"
        );
    }
}
