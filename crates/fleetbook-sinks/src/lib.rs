//! Remote sink contracts plus PostgreSQL and Google Sheets implementations.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fleetbook_core::{DuplicateKey, Record};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::{Connection, Postgres, Row};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "fleetbook-sinks";

pub const DEFAULT_TABLE: &str = "maintenance";
pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_WORKSHEET: &str = "Sheet1";
pub const DEFAULT_SHEETS_API_BASE: &str = "https://sheets.googleapis.com";

/// Grid size used when a missing worksheet has to be created.
pub const NEW_WORKSHEET_ROWS: u32 = 5000;
pub const NEW_WORKSHEET_COLS: u32 = 20;

const ERROR_BODY_CHARS: usize = 400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Batch(String),
}

/// Result of attempting to write one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Inserted,
    /// The unique index already holds this key.
    Duplicate,
    /// Rejected for any other reason (bad value, statement error).
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableStatus {
    Existing,
    Created,
}

/// One checked-out handle on the relational table. Dropping it returns the
/// underlying connection to its pool.
#[async_trait]
pub trait RecordTable: Send {
    async fn ping(&mut self) -> Result<(), SinkError>;
    async fn ensure_table(&mut self) -> Result<TableStatus, SinkError>;
    async fn existing_keys(&mut self) -> Result<HashSet<DuplicateKey>, SinkError>;
    /// Attempt every row of `chunk` independently and commit once at the end.
    async fn write_chunk(&mut self, chunk: &[Record]) -> Result<Vec<RowOutcome>, SinkError>;
    async fn row_count(&mut self) -> Result<i64, SinkError>;
}

#[async_trait]
pub trait TableProvider: Send + Sync {
    type Table: RecordTable;

    async fn acquire(&self) -> Result<Self::Table, SinkError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub max_lifetime: Duration,
    pub connect_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            max_lifetime: Duration::from_secs(900),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub connect: PgConnectOptions,
    pub table: String,
    pub chunk_size: usize,
    pub pool: PoolSettings,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Prefers `DATABASE_URL`; otherwise assembles options from the
    /// individual `FLEETBOOK_DB_*` variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let connect = match lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            Some(url) => PgConnectOptions::from_str(url.trim()).map_err(|e| ConfigError::Invalid {
                name: "DATABASE_URL",
                reason: e.to_string(),
            })?,
            None => {
                let required = |name: &'static str| {
                    lookup(name)
                        .filter(|v| !v.trim().is_empty())
                        .ok_or(ConfigError::Missing(name))
                };
                let host = required("FLEETBOOK_DB_HOST")?;
                let user = required("FLEETBOOK_DB_USER")?;
                let password = required("FLEETBOOK_DB_PASSWORD")?;
                let database = required("FLEETBOOK_DB_NAME")?;
                let port = parse_var(&lookup, "FLEETBOOK_DB_PORT", 5432u16)?;
                PgConnectOptions::new()
                    .host(host.trim())
                    .port(port)
                    .username(user.trim())
                    .password(&password)
                    .database(database.trim())
            }
        };

        let table = lookup("FLEETBOOK_DB_TABLE")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TABLE.to_string());
        validate_identifier(&table).map_err(|reason| ConfigError::Invalid {
            name: "FLEETBOOK_DB_TABLE",
            reason,
        })?;

        let chunk_size = parse_var(&lookup, "FLEETBOOK_DB_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?.max(1);
        let pool = PoolSettings {
            max_connections: parse_var(&lookup, "FLEETBOOK_DB_POOL_SIZE", 5u32)?.max(1),
            ..PoolSettings::default()
        };

        Ok(Self {
            connect,
            table,
            chunk_size,
            pool,
        })
    }

    pub fn target(&self) -> String {
        format!(
            "{}:{}/{}",
            self.connect.get_host(),
            self.connect.get_port(),
            self.connect.get_database().unwrap_or("-")
        )
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(name).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Table names are interpolated into DDL, so only plain identifiers pass.
pub fn validate_identifier(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let starts_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !starts_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') || name.len() > 48 {
        return Err(format!("`{name}` is not a plain identifier"));
    }
    Ok(())
}

/// Process-wide PostgreSQL pool for the maintenance table.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    table: String,
}

impl PgRecordStore {
    /// Builds the pool lazily; nothing connects until the first acquire.
    pub fn new(config: &DatabaseConfig) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool.max_connections)
            .max_lifetime(config.pool.max_lifetime)
            .acquire_timeout(config.pool.connect_timeout)
            .test_before_acquire(true)
            .connect_lazy_with(config.connect.clone());
        Self {
            pool,
            table: config.table.clone(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl TableProvider for PgRecordStore {
    type Table = PgRecordTable;

    async fn acquire(&self) -> Result<PgRecordTable, SinkError> {
        let conn = self.pool.acquire().await?;
        Ok(PgRecordTable {
            conn,
            table: self.table.clone(),
        })
    }
}

pub struct PgRecordTable {
    conn: PoolConnection<Postgres>,
    table: String,
}

impl PgRecordTable {
    fn create_sql(&self) -> String {
        let t = &self.table;
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{t}" (
                id          BIGSERIAL PRIMARY KEY,
                invoice     VARCHAR(100),
                date        DATE,
                vehicle     VARCHAR(50),
                description TEXT,
                quantity    INTEGER,
                unit_cost   NUMERIC(12,2),
                total       NUMERIC(12,2),
                supplier    VARCHAR(255),
                owner       VARCHAR(100),
                created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE UNIQUE INDEX IF NOT EXISTS "ux_{t}_invoice_desc"
                ON "{t}" (invoice, LEFT(description, 255));
            CREATE OR REPLACE FUNCTION fleetbook_touch_updated_at() RETURNS trigger AS $$
            BEGIN
                NEW.updated_at = NOW();
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql;
            DROP TRIGGER IF EXISTS "{t}_touch_updated_at" ON "{t}";
            CREATE TRIGGER "{t}_touch_updated_at"
                BEFORE UPDATE ON "{t}"
                FOR EACH ROW EXECUTE FUNCTION fleetbook_touch_updated_at();
            "#
        )
    }

    fn insert_sql(&self) -> String {
        format!(
            r#"
            INSERT INTO "{}"
                (invoice, date, vehicle, description, quantity, unit_cost, total, supplier, owner)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT DO NOTHING
            "#,
            self.table
        )
    }
}

#[async_trait]
impl RecordTable for PgRecordTable {
    async fn ping(&mut self) -> Result<(), SinkError> {
        sqlx::query("SELECT 1").execute(&mut *self.conn).await?;
        Ok(())
    }

    async fn ensure_table(&mut self) -> Result<TableStatus, SinkError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                 WHERE table_schema = current_schema()
                   AND table_name = $1
            )
            "#,
        )
        .bind(&self.table)
        .fetch_one(&mut *self.conn)
        .await?;
        if exists {
            return Ok(TableStatus::Existing);
        }

        let ddl = self.create_sql();
        sqlx::Executor::execute(&mut *self.conn, sqlx::raw_sql(&ddl)).await?;
        info!(table = %self.table, "created maintenance table");
        Ok(TableStatus::Created)
    }

    async fn existing_keys(&mut self) -> Result<HashSet<DuplicateKey>, SinkError> {
        let sql = format!(r#"SELECT invoice, description FROM "{}""#, self.table);
        let rows = sqlx::query(&sql).fetch_all(&mut *self.conn).await?;
        let mut keys = HashSet::with_capacity(rows.len());
        for row in rows {
            let invoice: Option<String> = row.try_get("invoice")?;
            let description: Option<String> = row.try_get("description")?;
            keys.insert(DuplicateKey::from_parts(
                invoice.as_deref().unwrap_or_default(),
                description.as_deref().unwrap_or_default(),
            ));
        }
        info!(table = %self.table, keys = keys.len(), "loaded existing keys");
        Ok(keys)
    }

    async fn write_chunk(&mut self, chunk: &[Record]) -> Result<Vec<RowOutcome>, SinkError> {
        let sql = self.insert_sql();
        let mut outcomes = Vec::with_capacity(chunk.len());
        let mut tx = Connection::begin(&mut *self.conn).await?;

        for record in chunk {
            let quantity = match quantity_column(record.quantity) {
                Ok(quantity) => quantity,
                Err(reason) => {
                    outcomes.push(RowOutcome::Failed(reason));
                    continue;
                }
            };

            // Savepoint per row: a failed statement must not poison the chunk.
            let mut row_tx = Connection::begin(&mut *tx).await?;
            let result = sqlx::query(&sql)
                .bind(&record.document_id)
                .bind(record.date.calendar())
                .bind(&record.vehicle)
                .bind(&record.description)
                .bind(quantity)
                .bind(record.unit_cost)
                .bind(record.total)
                .bind(&record.supplier)
                .bind(&record.owner)
                .execute(&mut *row_tx)
                .await;

            match result {
                Ok(done) => {
                    row_tx.commit().await?;
                    outcomes.push(if done.rows_affected() == 0 {
                        RowOutcome::Duplicate
                    } else {
                        RowOutcome::Inserted
                    });
                }
                Err(err) => {
                    row_tx.rollback().await?;
                    outcomes.push(RowOutcome::Failed(err.to_string()));
                }
            }
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    async fn row_count(&mut self) -> Result<i64, SinkError> {
        let sql = format!(r#"SELECT COUNT(*) FROM "{}""#, self.table);
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&mut *self.conn).await?;
        Ok(count)
    }
}

/// The relational column is an INTEGER; fractional quantities round to the
/// nearest unit.
pub fn quantity_column(quantity: Option<f64>) -> Result<Option<i32>, String> {
    match quantity {
        None => Ok(None),
        Some(q) if !q.is_finite() => Err(format!("quantity {q} is not a number")),
        Some(q) => {
            let rounded = q.round();
            if rounded < i32::MIN as f64 || rounded > i32::MAX as f64 {
                Err(format!("quantity {q} is out of range"))
            } else {
                Ok(Some(rounded as i32))
            }
        }
    }
}

/// OAuth bearer token; never printed.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SheetsConfig {
    pub spreadsheet_id: String,
    #[serde(default = "default_worksheet")]
    pub worksheet_name: String,
    #[serde(default)]
    pub access_token: Option<AccessToken>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_worksheet() -> String {
    DEFAULT_WORKSHEET.to_string()
}

fn default_api_base() -> String {
    DEFAULT_SHEETS_API_BASE.to_string()
}

impl SheetsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the optional JSON file named by `FLEETBOOK_SHEETS_CONFIG`, then
    /// lets individual variables override its fields.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut config = match var("FLEETBOOK_SHEETS_CONFIG") {
            Some(path) => Self::from_json_file(Path::new(path.trim())).map_err(|e| {
                ConfigError::Invalid {
                    name: "FLEETBOOK_SHEETS_CONFIG",
                    reason: format!("{e:#}"),
                }
            })?,
            None => Self {
                spreadsheet_id: String::new(),
                worksheet_name: default_worksheet(),
                access_token: None,
                api_base: default_api_base(),
            },
        };

        if let Some(id) = var("FLEETBOOK_SHEET_ID") {
            config.spreadsheet_id = id.trim().to_string();
        }
        if let Some(worksheet) = var("FLEETBOOK_WORKSHEET") {
            config.worksheet_name = worksheet.trim().to_string();
        }
        if let Some(token) = var("FLEETBOOK_SHEETS_TOKEN") {
            config.access_token = Some(AccessToken::new(token.trim()));
        }
        if let Some(base) = var("FLEETBOOK_SHEETS_API_BASE") {
            config.api_base = base.trim().to_string();
        }

        if config.spreadsheet_id.trim().is_empty() {
            return Err(ConfigError::Missing("FLEETBOOK_SHEET_ID"));
        }
        if config.access_token.is_none() {
            return Err(ConfigError::Missing("FLEETBOOK_SHEETS_TOKEN"));
        }
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn target(&self) -> WorksheetTarget {
        WorksheetTarget {
            spreadsheet_id: self.spreadsheet_id.clone(),
            title: self.worksheet_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorksheetTarget {
    pub spreadsheet_id: String,
    pub title: String,
}

impl WorksheetTarget {
    /// A1 range covering the whole worksheet, or starting at `cell`.
    pub fn a1(&self, cell: Option<&str>) -> String {
        let quoted = format!("'{}'", self.title.replace('\'', "''"));
        match cell {
            Some(cell) => format!("{quoted}!{cell}"),
            None => quoted,
        }
    }
}

/// The handful of spreadsheet operations the sheet writer relies on.
#[async_trait]
pub trait SheetsApi: Send + Sync {
    async fn worksheet_exists(&self, target: &WorksheetTarget) -> Result<bool, SinkError>;
    async fn add_worksheet(&self, target: &WorksheetTarget, rows: u32, cols: u32) -> Result<(), SinkError>;
    async fn read_rows(&self, target: &WorksheetTarget) -> Result<Vec<Vec<String>>, SinkError>;
    async fn clear(&self, target: &WorksheetTarget) -> Result<(), SinkError>;
    /// Overwrite starting at A1.
    async fn write_rows(&self, target: &WorksheetTarget, rows: &[Vec<String>]) -> Result<(), SinkError>;
    async fn append_rows(&self, target: &WorksheetTarget, rows: &[Vec<String>]) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Whether a request may be replayed after an ambiguous failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Safe,
    /// Appends are only replayed when the server refused them outright (429).
    RateLimitOnly,
}

#[derive(Debug, Default, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

#[derive(Debug, Default, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

/// Google Sheets v4 REST client authenticated with a bearer token.
#[derive(Debug, Clone)]
pub struct GoogleSheetsClient {
    http: reqwest::Client,
    api_base: Url,
    token: AccessToken,
    backoff: BackoffPolicy,
}

impl GoogleSheetsClient {
    pub fn new(config: &SheetsConfig) -> Result<Self, SinkError> {
        let token = config
            .access_token
            .clone()
            .ok_or_else(|| SinkError::Batch("sheets access token missing".to_string()))?;
        let api_base = Url::parse(&config.api_base)
            .map_err(|e| SinkError::InvalidResponse(format!("api base {}: {e}", config.api_base)))?;
        let http = reqwest::Client::builder()
            .gzip(true)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("fleetbook/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_base,
            token,
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url, SinkError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| SinkError::InvalidResponse(format!("api base {} cannot hold a path", self.api_base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn values_url(&self, target: &WorksheetTarget, range: &str, action: &str) -> Result<Url, SinkError> {
        let last = format!("{range}{action}");
        self.url(&["v4", "spreadsheets", &target.spreadsheet_id, "values", &last])
    }

    async fn send<F>(&self, replay: Replay, build: F) -> Result<reqwest::Response, SinkError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        for attempt in 0..=self.backoff.max_retries {
            let last_attempt = attempt == self.backoff.max_retries;
            match build(&self.http).bearer_auth(self.token.expose()).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let replayable = match replay {
                        Replay::Safe => classify_status(status) == RetryDisposition::Retryable,
                        Replay::RateLimitOnly => status == StatusCode::TOO_MANY_REQUESTS,
                    };
                    if replayable && !last_attempt {
                        warn!(%status, attempt, "sheets api retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    let body = resp.text().await.unwrap_or_default();
                    return Err(SinkError::HttpStatus {
                        status: status.as_u16(),
                        body: error_excerpt(&body),
                    });
                }
                Err(err) => {
                    let replayable = replay == Replay::Safe
                        && classify_reqwest_error(&err) == RetryDisposition::Retryable;
                    if replayable && !last_attempt {
                        warn!(error = %err, attempt, "sheets api retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SinkError::Request(err));
                }
            }
        }
        Err(SinkError::Batch("sheets api retries exhausted".to_string()))
    }
}

/// Error bodies echo ranges and titles back; cut on a character boundary.
fn error_excerpt(body: &str) -> String {
    body.chars().take(ERROR_BODY_CHARS).collect()
}

fn cell_to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SheetsApi for GoogleSheetsClient {
    async fn worksheet_exists(&self, target: &WorksheetTarget) -> Result<bool, SinkError> {
        let url = self.url(&["v4", "spreadsheets", &target.spreadsheet_id])?;
        let meta: SpreadsheetMeta = self
            .send(Replay::Safe, |http| {
                http.get(url.clone())
                    .query(&[("fields", "sheets.properties.title")])
            })
            .await?
            .json()
            .await?;
        Ok(meta.sheets.iter().any(|s| s.properties.title == target.title))
    }

    async fn add_worksheet(&self, target: &WorksheetTarget, rows: u32, cols: u32) -> Result<(), SinkError> {
        let batch = format!("{}:batchUpdate", target.spreadsheet_id);
        let url = self.url(&["v4", "spreadsheets", &batch])?;
        let body = json!({
            "requests": [{
                "addSheet": {
                    "properties": {
                        "title": target.title,
                        "gridProperties": { "rowCount": rows, "columnCount": cols }
                    }
                }
            }]
        });
        self.send(Replay::RateLimitOnly, |http| http.post(url.clone()).json(&body))
            .instrument(info_span!("sheets_add_worksheet", title = %target.title))
            .await?;
        info!(title = %target.title, "created worksheet");
        Ok(())
    }

    async fn read_rows(&self, target: &WorksheetTarget) -> Result<Vec<Vec<String>>, SinkError> {
        let url = self.values_url(target, &target.a1(None), "")?;
        let range: ValueRange = self
            .send(Replay::Safe, |http| http.get(url.clone()))
            .await?
            .json()
            .await?;
        Ok(range
            .values
            .iter()
            .map(|row| row.iter().map(cell_to_text).collect())
            .collect())
    }

    async fn clear(&self, target: &WorksheetTarget) -> Result<(), SinkError> {
        let url = self.values_url(target, &target.a1(None), ":clear")?;
        self.send(Replay::Safe, |http| http.post(url.clone()).json(&json!({})))
            .await?;
        Ok(())
    }

    async fn write_rows(&self, target: &WorksheetTarget, rows: &[Vec<String>]) -> Result<(), SinkError> {
        let range = target.a1(Some("A1"));
        let url = self.values_url(target, &range, "")?;
        let body = json!({ "range": range, "majorDimension": "ROWS", "values": rows });
        self.send(Replay::Safe, |http| {
            http.put(url.clone())
                .query(&[("valueInputOption", "RAW")])
                .json(&body)
        })
        .await?;
        Ok(())
    }

    async fn append_rows(&self, target: &WorksheetTarget, rows: &[Vec<String>]) -> Result<(), SinkError> {
        let url = self.values_url(target, &target.a1(Some("A1")), ":append")?;
        let body = json!({ "majorDimension": "ROWS", "values": rows });
        self.send(Replay::RateLimitOnly, |http| {
            http.post(url.clone())
                .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
                .json(&body)
        })
        .await?;
        Ok(())
    }
}
