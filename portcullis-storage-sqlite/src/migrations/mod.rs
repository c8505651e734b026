use async_trait::async_trait;
use chrono::Utc;
use portcullis_migration::{Migration, MigrationError, MigrationManager, MigrationRecord};
use sqlx::{Database, Sqlite, SqlitePool};

pub struct SqliteMigrationManager {
    pool: SqlitePool,
}

impl SqliteMigrationManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Every migration of the counter store schema, in version order.
pub fn all() -> Vec<Box<dyn Migration<Sqlite>>> {
    vec![
        Box::new(CreateKvEntriesTable),
        Box::new(CreateCountersTable),
        Box::new(CreateSetMembersTable),
        Box::new(CreateExpiryIndexes),
    ]
}

#[async_trait]
impl MigrationManager<Sqlite> for SqliteMigrationManager {
    async fn initialize(&self) -> Result<(), MigrationError> {
        sqlx::query(
            format!(
                r#"
            CREATE TABLE IF NOT EXISTS {} (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at INTEGER NOT NULL DEFAULT (unixepoch())
            );"#,
                self.get_migration_table_name()
            )
            .as_str(),
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn up(&self, migrations: &[Box<dyn Migration<Sqlite>>]) -> Result<(), MigrationError> {
        let mut ordered: Vec<&Box<dyn Migration<Sqlite>>> = migrations.iter().collect();
        ordered.sort_by_key(|migration| migration.version());

        for migration in ordered {
            if !self.is_applied(migration.version()).await? {
                let mut tx = self.pool.begin().await?;

                tracing::info!(
                    version = migration.version(),
                    name = migration.name(),
                    "Applying migration"
                );

                migration
                    .up(&mut *tx as &mut <Sqlite as Database>::Connection)
                    .await?;

                sqlx::query(
                    format!(
                        "INSERT INTO {} (version, name, applied_at) VALUES (?, ?, ?)",
                        self.get_migration_table_name()
                    )
                    .as_str(),
                )
                .bind(migration.version())
                .bind(migration.name())
                .bind(Utc::now().timestamp())
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
            }
        }
        Ok(())
    }

    async fn down(&self, migrations: &[Box<dyn Migration<Sqlite>>]) -> Result<(), MigrationError> {
        let mut ordered: Vec<&Box<dyn Migration<Sqlite>>> = migrations.iter().collect();
        ordered.sort_by_key(|migration| std::cmp::Reverse(migration.version()));

        for migration in ordered {
            if self.is_applied(migration.version()).await? {
                let mut tx = self.pool.begin().await?;

                tracing::info!(
                    version = migration.version(),
                    name = migration.name(),
                    "Rolling back migration"
                );

                migration
                    .down(&mut *tx as &mut <Sqlite as Database>::Connection)
                    .await?;

                sqlx::query(
                    format!(
                        "DELETE FROM {} WHERE version = ?",
                        self.get_migration_table_name()
                    )
                    .as_str(),
                )
                .bind(migration.version())
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
            }
        }
        Ok(())
    }

    async fn get_applied_migrations(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        let records = sqlx::query_as::<_, MigrationRecord>(
            format!(
                "SELECT version, name, applied_at FROM {} ORDER BY version",
                self.get_migration_table_name()
            )
            .as_str(),
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn is_applied(&self, version: i64) -> Result<bool, MigrationError> {
        let result: bool = sqlx::query_scalar(
            format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE version = ?)",
                self.get_migration_table_name()
            )
            .as_str(),
        )
        .bind(version)
        .fetch_one(&self.pool)
        .await?;
        Ok(result)
    }
}

/// Plain values: session records, remember-me payloads, IP block markers.
pub struct CreateKvEntriesTable;

#[async_trait]
impl Migration<Sqlite> for CreateKvEntriesTable {
    fn version(&self) -> i64 {
        1
    }

    fn name(&self) -> &str {
        "CreateKvEntriesTable"
    }

    async fn up<'a>(
        &'a self,
        conn: &'a mut <Sqlite as Database>::Connection,
    ) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );"#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn down<'a>(
        &'a self,
        conn: &'a mut <Sqlite as Database>::Connection,
    ) -> Result<(), MigrationError> {
        sqlx::query("DROP TABLE IF EXISTS kv_entries")
            .execute(conn)
            .await?;
        Ok(())
    }
}

/// Windowed counters: failed attempts per identifier and IP, device logins.
pub struct CreateCountersTable;

#[async_trait]
impl Migration<Sqlite> for CreateCountersTable {
    fn version(&self) -> i64 {
        2
    }

    fn name(&self) -> &str {
        "CreateCountersTable"
    }

    async fn up<'a>(
        &'a self,
        conn: &'a mut <Sqlite as Database>::Connection,
    ) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS counters (
                key TEXT PRIMARY KEY,
                count INTEGER NOT NULL,
                window_start INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );"#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn down<'a>(
        &'a self,
        conn: &'a mut <Sqlite as Database>::Connection,
    ) -> Result<(), MigrationError> {
        sqlx::query("DROP TABLE IF EXISTS counters")
            .execute(conn)
            .await?;
        Ok(())
    }
}

/// Set members: the per-user session index.
pub struct CreateSetMembersTable;

#[async_trait]
impl Migration<Sqlite> for CreateSetMembersTable {
    fn version(&self) -> i64 {
        3
    }

    fn name(&self) -> &str {
        "CreateSetMembersTable"
    }

    async fn up<'a>(
        &'a self,
        conn: &'a mut <Sqlite as Database>::Connection,
    ) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS set_members (
                key TEXT NOT NULL,
                member TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (key, member)
            );"#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn down<'a>(
        &'a self,
        conn: &'a mut <Sqlite as Database>::Connection,
    ) -> Result<(), MigrationError> {
        sqlx::query("DROP TABLE IF EXISTS set_members")
            .execute(conn)
            .await?;
        Ok(())
    }
}

pub struct CreateExpiryIndexes;

const EXPIRY_INDEXES: [(&str, &str, &str); 6] = [
    ("idx_kv_entries_expires_at", "kv_entries", "expires_at"),
    ("idx_kv_entries_updated_at", "kv_entries", "updated_at"),
    ("idx_counters_expires_at", "counters", "expires_at"),
    ("idx_counters_updated_at", "counters", "updated_at"),
    ("idx_set_members_expires_at", "set_members", "expires_at"),
    ("idx_set_members_updated_at", "set_members", "updated_at"),
];

#[async_trait]
impl Migration<Sqlite> for CreateExpiryIndexes {
    fn version(&self) -> i64 {
        4
    }

    fn name(&self) -> &str {
        "CreateExpiryIndexes"
    }

    async fn up<'a>(
        &'a self,
        conn: &'a mut <Sqlite as Database>::Connection,
    ) -> Result<(), MigrationError> {
        for (index, table, column) in EXPIRY_INDEXES {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {index} ON {table} ({column})"
            ))
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    async fn down<'a>(
        &'a self,
        conn: &'a mut <Sqlite as Database>::Connection,
    ) -> Result<(), MigrationError> {
        for (index, _, _) in EXPIRY_INDEXES {
            sqlx::query(&format!("DROP INDEX IF EXISTS {index}"))
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}
