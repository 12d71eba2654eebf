//! Table registry: the set of tables approved for synchronization.

use std::sync::Arc;

use chrono::Utc;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::{info, instrument, warn};

use tablesync_core::{
    destination_table_name, quote_ident, validate_identifier, RegisteredTable, SyncError,
    SyncResult, TableId, TableStatus,
};

use crate::db::{begin_write, format_ts, map_sqlx_error, parse_stored, parse_ts};
use crate::source::SourceClient;

#[derive(Debug, FromRow)]
struct TableRow {
    table_id: String,
    table_name: String,
    schema_name: String,
    source_system: String,
    status: String,
    created_at: String,
}

impl TryFrom<TableRow> for RegisteredTable {
    type Error = SyncError;

    fn try_from(row: TableRow) -> SyncResult<Self> {
        Ok(Self {
            table_id: parse_stored("table_id", &row.table_id)?,
            table_name: row.table_name,
            schema_name: row.schema_name,
            source_system: row.source_system,
            status: parse_stored("status", &row.status)?,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

const SELECT_TABLE: &str = r#"
    SELECT table_id, table_name, schema_name, source_system, status, created_at
    FROM registered_tables
"#;

#[derive(Clone)]
pub struct TableRegistry {
    pool: SqlitePool,
    source: Arc<dyn SourceClient>,
}

impl std::fmt::Debug for TableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableRegistry")
            .field("source", &self.source.system_name())
            .finish()
    }
}

impl TableRegistry {
    pub fn new(pool: SqlitePool, source: Arc<dyn SourceClient>) -> Self {
        Self { pool, source }
    }

    /// Register a table, or reactivate it if it is already known.
    ///
    /// New tables must exist in the source; reactivation keeps the same
    /// `table_id` and `created_at`.
    #[instrument(skip(self), err)]
    pub async fn register(&self, table_name: &str, schema_name: &str) -> SyncResult<RegisteredTable> {
        validate_identifier("table name", table_name)?;
        validate_identifier("schema name", schema_name)?;

        if let Some(existing) = self.get(table_name, schema_name).await? {
            return self.reactivate(existing).await;
        }

        let columns = self
            .source
            .fetch_schema(table_name, schema_name)
            .await
            .map_err(SyncError::from)?;
        if columns.is_empty() {
            return Err(SyncError::not_found(format!(
                "table {schema_name}.{table_name} does not exist in {}",
                self.source.system_name()
            )));
        }

        let now = format_ts(Utc::now());
        // A concurrent registration of the same table wins the insert; the
        // conflict arm hands back its identity instead.
        let row: TableRow = sqlx::query_as(
            r#"
            INSERT INTO registered_tables
                (table_id, table_name, schema_name, source_system, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)
            ON CONFLICT (schema_name, table_name) DO UPDATE SET
                status = 'active',
                updated_at = excluded.updated_at
            RETURNING table_id, table_name, schema_name, source_system, status, created_at
            "#,
        )
        .bind(TableId::new().to_string())
        .bind(table_name)
        .bind(schema_name)
        .bind(self.source.system_name())
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("register_table", e))?;

        let table = RegisteredTable::try_from(row)?;
        info!(
            table_id = %table.table_id,
            table = %table.qualified_name(),
            columns = columns.len(),
            "table registered"
        );
        Ok(table)
    }

    async fn reactivate(&self, mut table: RegisteredTable) -> SyncResult<RegisteredTable> {
        if table.is_active() {
            return Ok(table);
        }

        sqlx::query("UPDATE registered_tables SET status = 'active', updated_at = ?2 WHERE table_id = ?1")
            .bind(table.table_id.to_string())
            .bind(format_ts(Utc::now()))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("reactivate_table", e))?;

        table.status = TableStatus::Active;
        info!(table_id = %table.table_id, table = %table.qualified_name(), "table reactivated");
        Ok(table)
    }

    /// Deactivate a table and purge everything derived from it in one
    /// transaction: the mirrored table, its column mapping, its jobs and its
    /// watermark. On failure nothing changes.
    #[instrument(skip(self), err)]
    pub async fn remove(&self, table_name: &str, schema_name: &str) -> SyncResult<RegisteredTable> {
        let mut table = self.get(table_name, schema_name).await?.ok_or_else(|| {
            SyncError::not_found(format!("table {schema_name}.{table_name} is not registered"))
        })?;

        let mut tx = begin_write(&self.pool, "remove_table").await?;

        let result = Self::purge_in(&mut *tx, &table).await;
        if let Err(err) = result {
            warn!(table = %table.qualified_name(), error = %err, "table removal rolled back");
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "rollback failed");
            }
            return Err(err);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("remove_table", e))?;

        table.status = TableStatus::Inactive;
        info!(table_id = %table.table_id, table = %table.qualified_name(), "table removed");
        Ok(table)
    }

    async fn purge_in(conn: &mut SqliteConnection, table: &RegisteredTable) -> SyncResult<()> {
        let id = table.table_id.to_string();

        sqlx::query("UPDATE registered_tables SET status = 'inactive', updated_at = ?2 WHERE table_id = ?1")
            .bind(&id)
            .bind(format_ts(Utc::now()))
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("deactivate_table", e))?;

        let drop = format!(
            "DROP TABLE IF EXISTS {}",
            quote_ident(&destination_table_name(&table.schema_name, &table.table_name))
        );
        sqlx::query(&drop)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("drop_destination", e))?;

        for (operation, sql) in [
            ("delete_columns", "DELETE FROM table_columns WHERE table_id = ?1"),
            ("delete_watermark", "DELETE FROM table_sync_status WHERE table_id = ?1"),
            ("delete_jobs", "DELETE FROM sync_jobs WHERE table_id = ?1"),
        ] {
            sqlx::query(sql)
                .bind(&id)
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error(operation, e))?;
        }
        Ok(())
    }

    pub async fn is_active(&self, table_name: &str, schema_name: &str) -> SyncResult<bool> {
        Ok(self
            .get(table_name, schema_name)
            .await?
            .is_some_and(|t| t.is_active()))
    }

    pub async fn get(&self, table_name: &str, schema_name: &str) -> SyncResult<Option<RegisteredTable>> {
        let row: Option<TableRow> =
            sqlx::query_as(&format!("{SELECT_TABLE} WHERE schema_name = ?1 AND table_name = ?2"))
                .bind(schema_name)
                .bind(table_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("get_table", e))?;

        row.map(RegisteredTable::try_from).transpose()
    }

    pub async fn get_by_id_in(
        conn: &mut SqliteConnection,
        table_id: TableId,
    ) -> SyncResult<Option<RegisteredTable>> {
        let row: Option<TableRow> = sqlx::query_as(&format!("{SELECT_TABLE} WHERE table_id = ?1"))
            .bind(table_id.to_string())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("get_table_by_id", e))?;

        row.map(RegisteredTable::try_from).transpose()
    }

    pub async fn get_by_id(&self, table_id: TableId) -> SyncResult<Option<RegisteredTable>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("get_table_by_id", e))?;
        Self::get_by_id_in(&mut *conn, table_id).await
    }

    /// All registered tables, active and inactive, by schema then name.
    pub async fn list(&self) -> SyncResult<Vec<RegisteredTable>> {
        let rows: Vec<TableRow> =
            sqlx::query_as(&format!("{SELECT_TABLE} ORDER BY schema_name, table_name"))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("list_tables", e))?;

        rows.into_iter().map(RegisteredTable::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::source::{MemorySource, SourceError, SourceOp};
    use serde_json::json;
    use tablesync_core::SourceColumn;

    async fn setup() -> (TableRegistry, Arc<MemorySource>, SqlitePool) {
        let pool = db::connect_in_memory().await.unwrap();
        db::migrate(&pool).await.unwrap();
        let source = MemorySource::arc();
        source.add_table(
            "sales",
            "orders",
            vec![SourceColumn::new("ID", "NUMBER")],
            vec![vec![json!(1)]],
        );
        (TableRegistry::new(pool.clone(), source.clone()), source, pool)
    }

    #[tokio::test]
    async fn register_unknown_table_is_not_found() {
        let (registry, _, _) = setup().await;
        let err = registry.register("missing", "sales").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_records_source_system() {
        let (registry, _, _) = setup().await;
        let table = registry.register("orders", "sales").await.unwrap();

        assert_eq!(table.status, TableStatus::Active);
        assert_eq!(table.source_system, "memory");
        assert!(registry.is_active("orders", "sales").await.unwrap());
    }

    #[tokio::test]
    async fn re_registration_keeps_identity_without_source_call() {
        let (registry, source, _) = setup().await;
        let first = registry.register("orders", "sales").await.unwrap();
        registry.remove("orders", "sales").await.unwrap();
        source.drop_table("sales", "orders");

        let again = registry.register("orders", "sales").await.unwrap();
        assert_eq!(again.table_id, first.table_id);
        assert_eq!(again.created_at, first.created_at);
        assert!(again.is_active());
    }

    #[tokio::test]
    async fn source_faults_surface_during_registration() {
        let (registry, source, _) = setup().await;
        source.fail_next(SourceOp::Schema, SourceError::transient("connection reset"));

        let err = registry.register("orders", "sales").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn remove_unregistered_is_not_found() {
        let (registry, _, _) = setup().await;
        let err = registry.remove("orders", "sales").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn invalid_identifiers_are_rejected() {
        let (registry, _, _) = setup().await;
        let err = registry.register("orders; --", "sales").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidRequest(_)));
    }
}
