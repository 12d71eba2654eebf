//! Snowflake source over the SQL REST API (`/api/v2/statements`).
//!
//! Statements run synchronously when they finish within the server's wait
//! window; otherwise the API answers `202` with a handle that is polled until
//! the statement completes or `statement_timeout` elapses. Large results come
//! back in partitions, fetched one by one.
//!
//! Table reads page with `LIMIT`/`OFFSET` under an order covering every
//! sortable column, and each page carries the window's row count through a
//! `COUNT(*) OVER ()` column.
//!
//! Failures are classified here: connect/timeout errors, HTTP 408/429/5xx and
//! statements still running past the timeout are transient; everything the
//! server rejects (400/401/403/404/422) is logical.

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Number, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, instrument, warn};

use tablesync_core::SourceColumn;

use super::{Page, RowBatch, SourceClient, SourceError, TableStats};

const STATEMENTS_PATH: &str = "/api/v2/statements";
const CLIENT_NAME: &str = concat!("tablesync/", env!("CARGO_PKG_VERSION"));

/// Connection settings for the SQL API.
#[derive(Debug, Clone)]
pub struct SnowflakeConfig {
    /// `https://<account>.snowflakecomputing.com`
    pub account_url: String,
    pub token: String,
    /// `OAUTH` or `KEYPAIR_JWT`
    pub token_type: String,
    pub warehouse: Option<String>,
    pub database: Option<String>,
    pub role: Option<String>,
    pub statement_timeout: Duration,
    /// Delay between polls of an asynchronous statement.
    pub poll_interval: Duration,
}

impl SnowflakeConfig {
    pub fn new(account_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            account_url: account_url.into(),
            token: token.into(),
            token_type: "OAUTH".to_string(),
            warehouse: None,
            database: None,
            role: None,
            statement_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    pub fn with_warehouse(mut self, warehouse: impl Into<String>) -> Self {
        self.warehouse = Some(warehouse.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SnowflakeClient {
    http: Client,
    config: SnowflakeConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    statement_handle: Option<String>,
    code: Option<String>,
    message: Option<String>,
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    row_type: Vec<RowType>,
    #[serde(default)]
    partition_info: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    scale: Option<i64>,
}

/// Completed statement result.
#[derive(Debug, Default)]
struct ResultSet {
    row_type: Vec<RowType>,
    data: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    fn column_names(&self) -> Vec<String> {
        self.row_type.iter().map(|r| r.name.clone()).collect()
    }

    fn typed_rows(&self) -> Vec<Vec<Value>> {
        self.data
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(i, raw)| match self.row_type.get(i) {
                        Some(ty) => convert_value(raw.as_deref(), ty),
                        None => raw.clone().map(Value::String).unwrap_or(Value::Null),
                    })
                    .collect()
            })
            .collect()
    }

    /// Remove the window-total column and return its value. An empty page
    /// carries no total and reports zero.
    fn take_total(&mut self) -> u64 {
        let Some(idx) = self
            .row_type
            .iter()
            .position(|r| r.name.eq_ignore_ascii_case(TOTAL_COLUMN))
        else {
            return 0;
        };
        self.row_type.remove(idx);

        let total = self
            .data
            .first()
            .and_then(|row| row.get(idx))
            .and_then(|v| v.as_deref())
            .and_then(parse_u64)
            .unwrap_or(0);
        for row in &mut self.data {
            if idx < row.len() {
                row.remove(idx);
            }
        }
        total
    }
}

impl SnowflakeClient {
    pub fn new(config: SnowflakeConfig) -> Result<Self, SourceError> {
        let http = Client::builder()
            .timeout(config.statement_timeout + Duration::from_secs(30))
            .build()
            .map_err(|e| SourceError::logical(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    fn statements_url(&self) -> String {
        format!(
            "{}{}",
            self.config.account_url.trim_end_matches('/'),
            STATEMENTS_PATH
        )
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header(AUTHORIZATION, format!("Bearer {}", self.config.token))
            .header("X-Snowflake-Authorization-Token-Type", &self.config.token_type)
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, CLIENT_NAME)
    }

    /// Run one statement to completion and collect every partition.
    #[instrument(skip(self), err)]
    async fn execute(&self, sql: &str) -> Result<ResultSet, SourceError> {
        let timeout_secs = self.config.statement_timeout.as_secs();
        let mut body = json!({
            "statement": sql,
            "timeout": timeout_secs,
        });
        for (field, value) in [
            ("warehouse", &self.config.warehouse),
            ("database", &self.config.database),
            ("role", &self.config.role),
        ] {
            if let Some(value) = value {
                body[field] = Value::String(value.clone());
            }
        }

        let request = self
            .authorized(self.http.post(self.statements_url()))
            .header(CONTENT_TYPE, "application/json")
            .json(&body);
        let (mut status, mut response) = read_response(request.send().await).await?;

        let deadline = Instant::now() + self.config.statement_timeout;
        while status == StatusCode::ACCEPTED {
            let handle = response.statement_handle.clone().ok_or_else(|| {
                SourceError::logical("statement accepted without a statement handle")
            })?;
            if Instant::now() >= deadline {
                return Err(SourceError::transient(format!(
                    "statement {handle} still running after {timeout_secs}s"
                )));
            }
            debug!(handle = %handle, "statement still running; polling");
            sleep(self.config.poll_interval).await;

            let url = format!("{}/{}", self.statements_url(), handle);
            (status, response) = read_response(self.authorized(self.http.get(url)).send().await).await?;
        }

        let meta = response.result_set_meta_data.take().unwrap_or_default();
        let mut data = std::mem::take(&mut response.data);

        if meta.partition_info.len() > 1 {
            let handle = response.statement_handle.clone().ok_or_else(|| {
                SourceError::logical("partitioned result without a statement handle")
            })?;
            for partition in 1..meta.partition_info.len() {
                let url = format!("{}/{}", self.statements_url(), handle);
                let request = self
                    .authorized(self.http.get(url))
                    .query(&[("partition", partition)]);
                let (_, mut part) = read_response(request.send().await).await?;
                data.append(&mut part.data);
            }
        }

        Ok(ResultSet {
            row_type: meta.row_type,
            data,
        })
    }
}

/// Decode a response, classifying transport and HTTP failures.
async fn read_response(
    sent: Result<Response, reqwest::Error>,
) -> Result<(StatusCode, StatementResponse), SourceError> {
    let response = sent.map_err(classify_transport)?;
    let status = response.status();
    let text = response.text().await.map_err(classify_transport)?;

    if !status.is_success() {
        return Err(classify_status(status, &text));
    }

    let parsed: StatementResponse = serde_json::from_str(&text)
        .map_err(|e| SourceError::logical(format!("malformed SQL API response: {e}")))?;
    if let (Some(code), Some(message)) = (&parsed.code, &parsed.message) {
        debug!(%status, code = %code, message = %message, "statement response");
    }
    Ok((status, parsed))
}

fn classify_transport(err: reqwest::Error) -> SourceError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        SourceError::transient(format!("snowflake request failed: {err}"))
    } else {
        SourceError::logical(format!("snowflake request failed: {err}"))
    }
}

fn classify_status(status: StatusCode, body: &str) -> SourceError {
    let message = serde_json::from_str::<StatementResponse>(body)
        .ok()
        .and_then(|r| r.message)
        .unwrap_or_else(|| body.chars().take(512).collect());
    let msg = format!("snowflake returned {}: {}", status.as_u16(), message);

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        warn!(%status, "transient snowflake error");
        SourceError::transient(msg)
    } else {
        SourceError::logical(msg)
    }
}

fn parse_u64(raw: &str) -> Option<u64> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .or_else(|| raw.trim().parse::<f64>().ok().map(|f| f.max(0.0) as u64))
}

/// Convert a raw SQL API cell using the column's declared type.
fn convert_value(raw: Option<&str>, ty: &RowType) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };

    match ty.kind.to_ascii_lowercase().as_str() {
        "fixed" if ty.scale.unwrap_or(0) == 0 => raw
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| float_or_text(raw)),
        "fixed" | "real" => float_or_text(raw),
        "boolean" => match raw {
            "true" | "TRUE" | "1" => Value::Bool(true),
            "false" | "FALSE" | "0" => Value::Bool(false),
            other => Value::String(other.to_string()),
        },
        "date" => raw
            .parse::<i64>()
            .ok()
            .and_then(|days| DateTime::from_timestamp(days.checked_mul(86_400)?, 0))
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or_else(|| Value::String(raw.to_string())),
        "timestamp_ntz" | "timestamp_ltz" | "timestamp_tz" => epoch_to_text(raw)
            .map(Value::String)
            .unwrap_or_else(|| Value::String(raw.to_string())),
        _ => Value::String(raw.to_string()),
    }
}

fn float_or_text(raw: &str) -> Value {
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

/// `"1700000000.123456789[ 1440]"` → `"2023-11-14 22:13:20.123456"`.
fn epoch_to_text(raw: &str) -> Option<String> {
    let epoch = raw.split_whitespace().next()?;
    let (secs, frac) = epoch.split_once('.').unwrap_or((epoch, "0"));
    let negative = secs.starts_with('-');
    let mut secs: i64 = secs.parse().ok()?;

    let digits: String = frac.chars().take(9).collect();
    let mut nanos: u32 = format!("{digits:0<9}").parse().ok()?;
    if negative && nanos > 0 {
        secs -= 1;
        nanos = 1_000_000_000 - nanos;
    }

    DateTime::from_timestamp(secs, nanos).map(|ts| ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
}

/// Single-quoted SQL string literal.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn schema_query(table: &str, schema: &str) -> String {
    format!(
        "SELECT column_name, data_type, character_maximum_length, numeric_precision, \
         numeric_scale, is_nullable \
         FROM information_schema.columns \
         WHERE table_schema = {} AND table_name = {} \
         ORDER BY ordinal_position",
        quote_literal(&schema.to_uppercase()),
        quote_literal(&table.to_uppercase()),
    )
}

fn stats_query(table: &str, schema: &str) -> String {
    format!(
        "SELECT row_count, bytes FROM information_schema.tables \
         WHERE table_schema = {} AND table_name = {}",
        quote_literal(&schema.to_uppercase()),
        quote_literal(&table.to_uppercase()),
    )
}

fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

/// Window-function column carrying the size of the whole read window.
const TOTAL_COLUMN: &str = "_TABLESYNC_TOTAL";

/// Types Snowflake cannot sort on.
const UNORDERABLE_TYPES: [&str; 3] = ["GEOGRAPHY", "GEOMETRY", "VECTOR"];

fn quote_column(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Total order for paging: the incremental key first, then every sortable
/// column by position. Pages cut from separate statements only line up when
/// the order leaves no ties between distinct rows.
fn ordering(columns: &[SourceColumn], key: Option<&str>) -> Vec<String> {
    key.map(str::to_string)
        .into_iter()
        .chain(
            columns
                .iter()
                .filter(|c| !key.is_some_and(|k| k.eq_ignore_ascii_case(&c.name)))
                .filter(|c| {
                    !UNORDERABLE_TYPES
                        .iter()
                        .any(|t| c.data_type.to_uppercase().starts_with(t))
                })
                .map(|c| quote_column(&c.name)),
        )
        .collect()
}

fn select_query(
    table: &str,
    schema: &str,
    conditions: &[String],
    order: &[String],
    page: Page,
) -> String {
    let order = if order.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", order.join(", "))
    };
    format!(
        "SELECT *, COUNT(*) OVER () AS {TOTAL_COLUMN} FROM {schema}.{table}{}{order} LIMIT {} OFFSET {}",
        where_clause(conditions),
        page.batch_size,
        page.offset,
    )
}

impl SnowflakeClient {
    async fn fetch_window(
        &self,
        table: &str,
        schema: &str,
        conditions: &[String],
        key: Option<&str>,
        page: Page,
    ) -> Result<RowBatch, SourceError> {
        let columns = self.fetch_schema(table, schema).await?;
        if columns.is_empty() {
            return Err(SourceError::logical(format!(
                "table {schema}.{table} does not exist or is not visible"
            )));
        }

        let mut result = self
            .execute(&select_query(table, schema, conditions, &ordering(&columns, key), page))
            .await?;
        let total_rows = result.take_total();

        Ok(RowBatch {
            columns: result.column_names(),
            rows: result.typed_rows(),
            total_rows,
        })
    }
}

#[async_trait]
impl SourceClient for SnowflakeClient {
    fn system_name(&self) -> &str {
        "snowflake"
    }

    async fn fetch_schema(
        &self,
        table: &str,
        schema: &str,
    ) -> Result<Vec<SourceColumn>, SourceError> {
        let result = self.execute(&schema_query(table, schema)).await?;

        let columns = result
            .data
            .iter()
            .filter_map(|row| {
                let cell = |i: usize| row.get(i).and_then(|v| v.as_deref());
                let to_u32 = |i: usize| cell(i).and_then(parse_u64).and_then(|v| u32::try_from(v).ok());
                Some(SourceColumn {
                    name: cell(0)?.to_string(),
                    data_type: cell(1).unwrap_or("VARCHAR").to_string(),
                    max_length: to_u32(2),
                    precision: to_u32(3),
                    scale: to_u32(4),
                    nullable: cell(5).is_none_or(|v| v.eq_ignore_ascii_case("YES")),
                })
            })
            .collect();
        Ok(columns)
    }

    async fn fetch_table_stats(&self, table: &str, schema: &str) -> Result<TableStats, SourceError> {
        let result = self.execute(&stats_query(table, schema)).await?;
        let Some(row) = result.data.first() else {
            return Ok(TableStats::default());
        };
        let cell = |i: usize| row.get(i).and_then(|v| v.as_deref()).and_then(parse_u64);

        Ok(TableStats {
            row_count: cell(0).unwrap_or(0),
            size_bytes: cell(1).unwrap_or(0),
        })
    }

    async fn fetch_data(
        &self,
        table: &str,
        schema: &str,
        page: Page,
        filter: Option<&str>,
    ) -> Result<RowBatch, SourceError> {
        let conditions: Vec<String> = filter.map(|f| format!("({f})")).into_iter().collect();
        self.fetch_window(table, schema, &conditions, None, page).await
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
        let mut conditions = Vec::new();
        if let Some(last) = last_value {
            conditions.push(format!("{key} > {}", quote_literal(last)));
        }
        if let Some(f) = filter {
            conditions.push(format!("({f})"));
        }
        self.fetch_window(table, schema, &conditions, Some(key), page)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(kind: &str, scale: Option<i64>) -> RowType {
        RowType {
            name: "C".into(),
            kind: kind.into(),
            scale,
        }
    }

    #[test]
    fn converts_cells_by_row_type() {
        assert_eq!(convert_value(Some("42"), &ty("fixed", Some(0))), json!(42));
        assert_eq!(convert_value(Some("4.25"), &ty("fixed", Some(2))), json!(4.25));
        assert_eq!(convert_value(Some("1.5"), &ty("real", None)), json!(1.5));
        assert_eq!(convert_value(Some("true"), &ty("boolean", None)), json!(true));
        assert_eq!(convert_value(Some("19723"), &ty("date", None)), json!("2024-01-01"));
        assert_eq!(
            convert_value(Some("1704067200.500000000"), &ty("timestamp_ntz", Some(9))),
            json!("2024-01-01 00:00:00.500000")
        );
        assert_eq!(
            convert_value(Some("1704067200.000000000 1440"), &ty("timestamp_tz", Some(9))),
            json!("2024-01-01 00:00:00.000000")
        );
        assert_eq!(convert_value(Some("abc"), &ty("text", None)), json!("abc"));
        assert_eq!(convert_value(None, &ty("text", None)), Value::Null);
    }

    #[test]
    fn negative_epochs_borrow_a_second() {
        assert_eq!(epoch_to_text("-1.500000000").as_deref(), Some("1969-12-31 23:59:58.500000"));
    }

    #[test]
    fn http_statuses_are_classified() {
        for code in [408u16, 429, 500, 503] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(matches!(classify_status(status, ""), SourceError::Transient(_)));
        }
        for code in [400u16, 401, 403, 404, 422] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(matches!(classify_status(status, ""), SourceError::Logical(_)));
        }
    }

    #[test]
    fn server_message_is_surfaced() {
        let body = r#"{"code":"002003","message":"SQL compilation error: Object does not exist"}"#;
        let err = classify_status(StatusCode::UNPROCESSABLE_ENTITY, body);
        assert!(err.to_string().contains("Object does not exist"));
    }

    #[test]
    fn incremental_query_conjoins_window_and_filter() {
        let conditions = vec!["UPDATED_AT > '2024-01-01'".to_string(), "(REGION = 'EU')".to_string()];
        let order = vec!["UPDATED_AT".to_string(), "\"ID\"".to_string()];
        let sql = select_query("ORDERS", "SALES", &conditions, &order, Page::first(100).next());
        assert_eq!(
            sql,
            "SELECT *, COUNT(*) OVER () AS _TABLESYNC_TOTAL FROM SALES.ORDERS \
             WHERE UPDATED_AT > '2024-01-01' AND (REGION = 'EU') \
             ORDER BY UPDATED_AT, \"ID\" LIMIT 100 OFFSET 100"
        );
    }

    fn order_columns() -> Vec<SourceColumn> {
        vec![
            SourceColumn::new("ID", "NUMBER"),
            SourceColumn::new("UPDATED_AT", "TIMESTAMP_NTZ"),
            SourceColumn::new("AREA", "GEOGRAPHY"),
            SourceColumn::new("Note \"x\"", "VARCHAR"),
        ]
    }

    #[test]
    fn full_reads_page_in_a_total_column_order() {
        let order = ordering(&order_columns(), None);
        assert_eq!(order, vec!["\"ID\"", "\"UPDATED_AT\"", "\"Note \"\"x\"\"\""]);

        let sql = select_query("ORDERS", "SALES", &[], &order, Page::first(2).next());
        assert_eq!(
            sql,
            "SELECT *, COUNT(*) OVER () AS _TABLESYNC_TOTAL FROM SALES.ORDERS \
             ORDER BY \"ID\", \"UPDATED_AT\", \"Note \"\"x\"\"\" LIMIT 2 OFFSET 2"
        );
    }

    #[test]
    fn incremental_order_breaks_key_ties_on_the_other_columns() {
        let order = ordering(&order_columns(), Some("updated_at"));
        assert_eq!(order, vec!["updated_at", "\"ID\"", "\"Note \"\"x\"\"\""]);
    }

    #[test]
    fn window_total_is_split_from_the_rows() {
        let mut result = ResultSet {
            row_type: vec![
                ty("fixed", Some(0)),
                RowType {
                    name: TOTAL_COLUMN.into(),
                    kind: "fixed".into(),
                    scale: Some(0),
                },
            ],
            data: vec![
                vec![Some("1".into()), Some("7".into())],
                vec![Some("2".into()), Some("7".into())],
            ],
        };
        assert_eq!(result.take_total(), 7);
        assert_eq!(result.column_names(), vec!["C".to_string()]);
        assert_eq!(result.typed_rows(), vec![vec![json!(1)], vec![json!(2)]]);

        let mut empty = ResultSet {
            row_type: vec![RowType {
                name: TOTAL_COLUMN.into(),
                kind: "fixed".into(),
                scale: Some(0),
            }],
            data: Vec::new(),
        };
        assert_eq!(empty.take_total(), 0);
    }

    #[test]
    fn literals_escape_quotes() {
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
        assert!(schema_query("orders", "sales").contains("table_schema = 'SALES' AND table_name = 'ORDERS'"));
    }

    #[test]
    fn partition_response_deserializes() {
        let body = r#"{
            "statementHandle": "01b2",
            "resultSetMetaData": {
                "numRows": 2,
                "rowType": [{"name": "ID", "type": "fixed", "scale": 0}],
                "partitionInfo": [{"rowCount": 1}, {"rowCount": 1}]
            },
            "data": [["1"]]
        }"#;
        let parsed: StatementResponse = serde_json::from_str(body).unwrap();
        let meta = parsed.result_set_meta_data.unwrap();
        assert_eq!(meta.partition_info.len(), 2);
        assert_eq!(meta.row_type[0].name, "ID");
        assert_eq!(parsed.data, vec![vec![Some("1".to_string())]]);
    }
}
