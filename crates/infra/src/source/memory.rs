//! In-process source used by tests and local development.
//!
//! Tables are declared with their columns and JSON rows. Filter expressions
//! must be registered with a predicate before use; faults can be scripted
//! per operation and every call is logged.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};

use tablesync_core::watermark::{compare_watermarks, watermark_text};
use tablesync_core::SourceColumn;

use super::{Page, RowBatch, SourceClient, SourceError, TableStats};

/// Predicate standing in for a warehouse-side filter expression.
pub type RowPredicate = Arc<dyn Fn(&Map<String, Value>) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceOp {
    Schema,
    Stats,
    Data,
    IncrementalData,
}

/// Logged source call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCall {
    pub op: SourceOp,
    pub schema: String,
    pub table: String,
    pub offset: Option<u64>,
    pub last_value: Option<String>,
    pub filter: Option<String>,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    columns: Vec<SourceColumn>,
    rows: Vec<Vec<Value>>,
    size_bytes: Option<u64>,
}

#[derive(Default)]
struct State {
    tables: HashMap<(String, String), MemoryTable>,
    filters: HashMap<String, RowPredicate>,
    faults: HashMap<SourceOp, VecDeque<SourceError>>,
    calls: Vec<SourceCall>,
}

pub struct MemorySource {
    system_name: String,
    state: Mutex<State>,
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MemorySource")
            .field("system_name", &self.system_name)
            .field("tables", &state.tables.len())
            .field("calls", &state.calls.len())
            .finish()
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self::with_system_name("memory")
    }

    pub fn with_system_name(name: impl Into<String>) -> Self {
        Self {
            system_name: name.into(),
            state: Mutex::new(State::default()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare (or replace) a table.
    pub fn add_table(&self, schema: &str, table: &str, columns: Vec<SourceColumn>, rows: Vec<Vec<Value>>) {
        self.lock().tables.insert(
            (schema.to_string(), table.to_string()),
            MemoryTable {
                columns,
                rows,
                size_bytes: None,
            },
        );
    }

    pub fn drop_table(&self, schema: &str, table: &str) {
        self.lock()
            .tables
            .remove(&(schema.to_string(), table.to_string()));
    }

    /// Replace the rows of an existing table.
    pub fn set_rows(&self, schema: &str, table: &str, rows: Vec<Vec<Value>>) {
        if let Some(t) = self.lock().tables.get_mut(&(schema.to_string(), table.to_string())) {
            t.rows = rows;
        }
    }

    pub fn append_rows(&self, schema: &str, table: &str, rows: Vec<Vec<Value>>) {
        if let Some(t) = self.lock().tables.get_mut(&(schema.to_string(), table.to_string())) {
            t.rows.extend(rows);
        }
    }

    /// Replace the declared columns, leaving rows as they are.
    pub fn set_columns(&self, schema: &str, table: &str, columns: Vec<SourceColumn>) {
        if let Some(t) = self.lock().tables.get_mut(&(schema.to_string(), table.to_string())) {
            t.columns = columns;
        }
    }

    /// Override the reported table size.
    pub fn set_size_bytes(&self, schema: &str, table: &str, size_bytes: u64) {
        if let Some(t) = self.lock().tables.get_mut(&(schema.to_string(), table.to_string())) {
            t.size_bytes = Some(size_bytes);
        }
    }

    pub fn register_filter<F>(&self, expression: impl Into<String>, predicate: F)
    where
        F: Fn(&Map<String, Value>) -> bool + Send + Sync + 'static,
    {
        self.lock()
            .filters
            .insert(expression.into(), Arc::new(predicate));
    }

    /// Fail the next call of `op` with `err`.
    pub fn fail_next(&self, op: SourceOp, err: SourceError) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }

    /// Fail the next `times` calls of `op` with `err`.
    pub fn fail_times(&self, op: SourceOp, times: usize, err: SourceError) {
        let mut state = self.lock();
        let queue = state.faults.entry(op).or_default();
        queue.extend(std::iter::repeat_n(err, times));
    }

    pub fn calls(&self) -> Vec<SourceCall> {
        self.lock().calls.clone()
    }

    pub fn calls_of(&self, op: SourceOp) -> Vec<SourceCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    fn record(
        &self,
        call: SourceCall,
    ) -> Result<MutexGuard<'_, State>, SourceError> {
        let mut state = self.lock();
        let op = call.op;
        state.calls.push(call);
        if let Some(err) = state.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }

    fn call(op: SourceOp, schema: &str, table: &str) -> SourceCall {
        SourceCall {
            op,
            schema: schema.to_string(),
            table: table.to_string(),
            offset: None,
            last_value: None,
            filter: None,
        }
    }
}

impl State {
    fn table(&self, schema: &str, table: &str) -> Result<&MemoryTable, SourceError> {
        self.tables
            .get(&(schema.to_string(), table.to_string()))
            .ok_or_else(|| {
                SourceError::logical(format!(
                    "Object '{schema}.{table}' does not exist or not authorized."
                ))
            })
    }

    fn filtered_rows(
        &self,
        table: &MemoryTable,
        filter: Option<&str>,
    ) -> Result<Vec<Vec<Value>>, SourceError> {
        let Some(expression) = filter else {
            return Ok(table.rows.clone());
        };
        let predicate = self.filters.get(expression).ok_or_else(|| {
            SourceError::logical(format!("SQL compilation error: invalid filter '{expression}'"))
        })?;

        Ok(table
            .rows
            .iter()
            .filter(|row| predicate(&row_map(&table.columns, row)))
            .cloned()
            .collect())
    }
}

fn row_map(columns: &[SourceColumn], row: &[Value]) -> Map<String, Value> {
    columns
        .iter()
        .zip(row)
        .map(|(c, v)| (c.name.clone(), v.clone()))
        .collect()
}

fn page_of(rows: Vec<Vec<Value>>, columns: &[SourceColumn], page: Page) -> RowBatch {
    let total_rows = rows.len() as u64;
    let start = usize::try_from(page.offset).unwrap_or(usize::MAX);
    let rows = rows
        .into_iter()
        .skip(start)
        .take(page.batch_size as usize)
        .collect();

    RowBatch {
        columns: columns.iter().map(|c| c.name.clone()).collect(),
        rows,
        total_rows,
    }
}

/// Ascending by key text, NULL keys last.
fn compare_keys(a: &Value, b: &Value) -> Ordering {
    match (watermark_text(a), watermark_text(b)) {
        (Some(x), Some(y)) => compare_watermarks(&x, &y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[async_trait]
impl SourceClient for MemorySource {
    fn system_name(&self) -> &str {
        &self.system_name
    }

    async fn fetch_schema(
        &self,
        table: &str,
        schema: &str,
    ) -> Result<Vec<SourceColumn>, SourceError> {
        let state = self.record(Self::call(SourceOp::Schema, schema, table))?;
        Ok(state
            .tables
            .get(&(schema.to_string(), table.to_string()))
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn fetch_table_stats(&self, table: &str, schema: &str) -> Result<TableStats, SourceError> {
        let state = self.record(Self::call(SourceOp::Stats, schema, table))?;
        let Some(t) = state.tables.get(&(schema.to_string(), table.to_string())) else {
            return Ok(TableStats::default());
        };

        let size_bytes = t.size_bytes.unwrap_or_else(|| {
            t.rows
                .iter()
                .map(|r| Value::Array(r.clone()).to_string().len() as u64)
                .sum()
        });
        Ok(TableStats {
            row_count: t.rows.len() as u64,
            size_bytes,
        })
    }

    async fn fetch_data(
        &self,
        table: &str,
        schema: &str,
        page: Page,
        filter: Option<&str>,
    ) -> Result<RowBatch, SourceError> {
        let mut call = Self::call(SourceOp::Data, schema, table);
        call.offset = Some(page.offset);
        call.filter = filter.map(str::to_string);
        let state = self.record(call)?;

        let t = state.table(schema, table)?;
        let rows = state.filtered_rows(t, filter)?;
        Ok(page_of(rows, &t.columns, page))
    }

    async fn fetch_incremental_data(
        &self,
        table: &str,
        schema: &str,
        key: &str,
        last_value: Option<&str>,
        page: Page,
        filter: Option<&str>,
    ) -> Result<RowBatch, SourceError> {
        let mut call = Self::call(SourceOp::IncrementalData, schema, table);
        call.offset = Some(page.offset);
        call.last_value = last_value.map(str::to_string);
        call.filter = filter.map(str::to_string);
        let state = self.record(call)?;

        let t = state.table(schema, table)?;
        let key_idx = t
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(key))
            .ok_or_else(|| {
                SourceError::logical(format!("SQL compilation error: invalid identifier '{key}'"))
            })?;

        let mut rows: Vec<Vec<Value>> = state
            .filtered_rows(t, filter)?
            .into_iter()
            .filter(|row| match (last_value, row.get(key_idx).and_then(watermark_text)) {
                (None, _) => true,
                (Some(last), Some(v)) => compare_watermarks(&v, last) == Ordering::Greater,
                (Some(_), None) => false,
            })
            .collect();
        rows.sort_by(|a, b| {
            compare_keys(
                a.get(key_idx).unwrap_or(&Value::Null),
                b.get(key_idx).unwrap_or(&Value::Null),
            )
        });

        Ok(page_of(rows, &t.columns, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> MemorySource {
        let src = MemorySource::new();
        src.add_table(
            "sales",
            "orders",
            vec![
                SourceColumn::new("ID", "NUMBER"),
                SourceColumn::new("REGION", "VARCHAR"),
            ],
            vec![
                vec![json!(3), json!("eu")],
                vec![json!(1), json!("us")],
                vec![json!(2), json!("eu")],
            ],
        );
        src
    }

    #[tokio::test]
    async fn missing_table_has_empty_schema() {
        let src = source();
        assert!(src.fetch_schema("nope", "sales").await.unwrap().is_empty());
        assert_eq!(src.fetch_schema("orders", "sales").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn data_is_paged_and_filtered() {
        let src = source();
        src.register_filter("REGION = 'eu'", |row| row["REGION"] == json!("eu"));

        let batch = src
            .fetch_data("orders", "sales", Page::first(1), Some("REGION = 'eu'"))
            .await
            .unwrap();
        assert_eq!(batch.total_rows, 2);
        assert_eq!(batch.rows, vec![vec![json!(3), json!("eu")]]);

        let err = src
            .fetch_data("orders", "sales", Page::first(10), Some("bogus"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Logical(_)));
    }

    #[tokio::test]
    async fn incremental_reads_are_ordered_and_exclusive() {
        let src = source();
        let batch = src
            .fetch_incremental_data("orders", "sales", "ID", Some("1"), Page::first(10), None)
            .await
            .unwrap();

        let ids: Vec<_> = batch.rows.iter().map(|r| r[0].clone()).collect();
        assert_eq!(ids, vec![json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn scripted_faults_fire_in_order_then_clear() {
        let src = source();
        src.fail_times(SourceOp::Schema, 2, SourceError::transient("connection reset"));

        assert!(src.fetch_schema("orders", "sales").await.is_err());
        assert!(src.fetch_schema("orders", "sales").await.is_err());
        assert!(src.fetch_schema("orders", "sales").await.is_ok());
        assert_eq!(src.calls_of(SourceOp::Schema).len(), 3);
    }
}
