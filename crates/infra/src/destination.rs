//! Mirrored tables in the local store and their column-mapping artifact.
//!
//! A table is created once from the translated schema and never altered;
//! the artifact in `table_columns` is the shape rows are written against.
//! Jobs stage their rows in a per-job table first and publish them into the
//! mirrored table inside the job's final transaction.

use sqlx::sqlite::SqliteRow;
use sqlx::{Column, FromRow, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool, TypeInfo, ValueRef};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use tablesync_core::{
    create_table_sql, destination_table_name, quote_ident, DestinationColumn, JobId,
    RegisteredTable, SyncResult, TableId,
};

use crate::db::{begin_write, map_sqlx_error};
use crate::source::RowBatch;

/// SQLite's default bound on host parameters per statement.
const MAX_BIND_PARAMS: usize = 32_766;

#[derive(Debug, FromRow)]
struct ColumnRow {
    column_name: String,
    source_type: String,
    destination_type: String,
    nullable: bool,
}

impl From<ColumnRow> for DestinationColumn {
    fn from(row: ColumnRow) -> Self {
        Self {
            name: row.column_name,
            source_type: row.source_type,
            destination_type: row.destination_type,
            nullable: row.nullable,
        }
    }
}

/// Local name of the mirrored table.
pub fn mirror_name(table: &RegisteredTable) -> String {
    destination_table_name(&table.schema_name, &table.table_name)
}

/// Local name of the staging table a job writes into.
pub fn staging_name(job_id: JobId) -> String {
    format!("_staging_{}", job_id.as_uuid().simple())
}

#[derive(Debug, Clone)]
pub struct DestinationStore {
    pool: SqlitePool,
}

impl DestinationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn columns(&self, table_id: TableId) -> SyncResult<Vec<DestinationColumn>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("load_columns", e))?;
        Self::columns_in(&mut *conn, table_id).await
    }

    pub async fn columns_in(
        conn: &mut SqliteConnection,
        table_id: TableId,
    ) -> SyncResult<Vec<DestinationColumn>> {
        let rows: Vec<ColumnRow> = sqlx::query_as(
            r#"
            SELECT column_name, source_type, destination_type, nullable
            FROM table_columns
            WHERE table_id = ?1
            ORDER BY ordinal
            "#,
        )
        .bind(table_id.to_string())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_columns", e))?;

        Ok(rows.into_iter().map(DestinationColumn::from).collect())
    }

    /// Create the mirrored table if absent and return the recorded column
    /// mapping. An existing mapping wins over `translated`.
    #[instrument(skip(self, table, translated), fields(table = %table.qualified_name()), err)]
    pub async fn ensure_table(
        &self,
        table: &RegisteredTable,
        translated: &[DestinationColumn],
    ) -> SyncResult<Vec<DestinationColumn>> {
        let mut tx = begin_write(&self.pool, "ensure_table").await?;

        let mut columns = Self::columns_in(&mut *tx, table.table_id).await?;
        if columns.is_empty() {
            Self::record_columns_in(&mut *tx, table.table_id, translated).await?;
            columns = translated.to_vec();
        }
        execute(&mut *tx, &create_table_sql(&mirror_name(table), &columns), "create_table").await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("ensure_table", e))?;
        Ok(columns)
    }

    /// Drop and recreate the mirrored table from `columns`, replacing the
    /// mapping.
    pub async fn recreate_in(
        conn: &mut SqliteConnection,
        table: &RegisteredTable,
        columns: &[DestinationColumn],
    ) -> SyncResult<()> {
        let name = mirror_name(table);
        execute(conn, &format!("DROP TABLE IF EXISTS {}", quote_ident(&name)), "drop_table").await?;
        execute(conn, &create_table_sql(&name, columns), "create_table").await?;
        Self::record_columns_in(conn, table.table_id, columns).await
    }

    async fn record_columns_in(
        conn: &mut SqliteConnection,
        table_id: TableId,
        columns: &[DestinationColumn],
    ) -> SyncResult<()> {
        sqlx::query("DELETE FROM table_columns WHERE table_id = ?1")
            .bind(table_id.to_string())
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("record_columns", e))?;

        if columns.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO table_columns (table_id, ordinal, column_name, source_type, destination_type, nullable) ",
        );
        qb.push_values(columns.iter().enumerate(), |mut b, (ordinal, col)| {
            b.push_bind(table_id.to_string())
                .push_bind(ordinal as i64)
                .push_bind(col.name.clone())
                .push_bind(col.source_type.clone())
                .push_bind(col.destination_type.clone())
                .push_bind(col.nullable);
        });
        qb.build()
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("record_columns", e))?;
        Ok(())
    }

    /// Fresh staging table for `job_id` shaped like `columns`.
    pub async fn create_staging(&self, job_id: JobId, columns: &[DestinationColumn]) -> SyncResult<String> {
        let name = staging_name(job_id);
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("create_staging", e))?;

        execute(&mut *conn, &format!("DROP TABLE IF EXISTS {}", quote_ident(&name)), "create_staging").await?;
        execute(&mut *conn, &create_table_sql(&name, columns), "create_staging").await?;
        Ok(name)
    }

    pub async fn drop_staging(&self, job_id: JobId) -> SyncResult<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("drop_staging", e))?;
        Self::drop_staging_in(&mut *conn, job_id).await
    }

    pub async fn drop_staging_in(conn: &mut SqliteConnection, job_id: JobId) -> SyncResult<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(&staging_name(job_id)));
        execute(conn, &sql, "drop_staging").await
    }

    /// Append a batch to `table`, aligned on `columns`. Batch columns
    /// outside the mapping are ignored and mapped columns missing from the
    /// batch are written as NULL. Returns the serialized size of the rows.
    #[instrument(skip(self, columns, batch), fields(rows = batch.len()), err)]
    pub async fn insert_batch(
        &self,
        table: &str,
        columns: &[DestinationColumn],
        batch: &RowBatch,
    ) -> SyncResult<u64> {
        if batch.is_empty() || columns.is_empty() {
            return Ok(0);
        }

        let positions: Vec<Option<usize>> =
            columns.iter().map(|c| batch.column_index(&c.name)).collect();
        let column_list = columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let rows_per_statement = (MAX_BIND_PARAMS / columns.len()).max(1);

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("insert_batch", e))?;

        let mut bytes = 0u64;
        for chunk in batch.rows.chunks(rows_per_statement) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("INSERT INTO {} ({column_list}) ", quote_ident(table)));
            qb.push_values(chunk, |mut b, row| {
                for pos in &positions {
                    match pos.and_then(|i| row.get(i)) {
                        None | Some(Value::Null) => b.push_bind(None::<String>),
                        Some(Value::Bool(v)) => b.push_bind(*v),
                        Some(Value::Number(n)) => match n.as_i64() {
                            Some(i) => b.push_bind(i),
                            None => b.push_bind(n.as_f64()),
                        },
                        Some(Value::String(s)) => b.push_bind(s.clone()),
                        Some(other) => b.push_bind(other.to_string()),
                    };
                }
            });
            qb.build()
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_error("insert_batch", e))?;

            bytes += chunk
                .iter()
                .map(|r| Value::Array(r.clone()).to_string().len() as u64)
                .sum::<u64>();
        }

        debug!(table, rows = batch.len(), bytes, "batch staged");
        Ok(bytes)
    }

    /// Publish staged rows into the mirrored table. `replace` clears the
    /// mirrored table first.
    pub async fn publish_in(
        conn: &mut SqliteConnection,
        staging: &str,
        target: &str,
        columns: &[DestinationColumn],
        replace: bool,
    ) -> SyncResult<u64> {
        if replace {
            execute(conn, &format!("DELETE FROM {}", quote_ident(target)), "clear_table").await?;
        }
        if columns.is_empty() {
            return Ok(0);
        }

        let column_list = columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({column_list}) SELECT {column_list} FROM {}",
            quote_ident(target),
            quote_ident(staging)
        );
        let result = sqlx::query(&sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("publish_rows", e))?;
        Ok(result.rows_affected())
    }

    pub async fn row_count(&self, table: &RegisteredTable) -> SyncResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&mirror_name(table)));
        let (count,): (i64,) = sqlx::query_as(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("row_count", e))?;
        Ok(crate::db::to_u64(count))
    }

    /// Every row of the mirrored table as a column map, ordered by
    /// `order_by` when given.
    pub async fn fetch_rows(
        &self,
        table: &RegisteredTable,
        order_by: Option<&str>,
    ) -> SyncResult<Vec<Map<String, Value>>> {
        let order = order_by
            .map(|c| format!(" ORDER BY {}", quote_ident(c)))
            .unwrap_or_default();
        let sql = format!("SELECT * FROM {}{order}", quote_ident(&mirror_name(table)));
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_rows", e))?;

        rows.iter().map(row_to_map).collect()
    }
}

async fn execute(conn: &mut SqliteConnection, sql: &str, operation: &str) -> SyncResult<()> {
    sqlx::query(sql)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

fn row_to_map(row: &SqliteRow) -> SyncResult<Map<String, Value>> {
    let mut map = Map::new();
    for column in row.columns() {
        let i = column.ordinal();
        let raw = row
            .try_get_raw(i)
            .map_err(|e| map_sqlx_error("fetch_rows", e))?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => Value::from(row.try_get::<i64, _>(i).map_err(|e| map_sqlx_error("fetch_rows", e))?),
                "REAL" => Value::from(row.try_get::<f64, _>(i).map_err(|e| map_sqlx_error("fetch_rows", e))?),
                _ => Value::from(row.try_get::<String, _>(i).map_err(|e| map_sqlx_error("fetch_rows", e))?),
            }
        };
        map.insert(column.name().to_string(), value);
    }
    Ok(map)
}
