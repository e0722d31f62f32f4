//! Approval workflow, master export and multi-sink sync for fleetbook.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetbook_core::{header_row, DuplicateKey, Record, HEADER_MARKER};
use fleetbook_sinks::{
    DatabaseConfig, GoogleSheetsClient, PgRecordStore, RecordTable, RowOutcome, SheetsApi,
    SheetsConfig, SinkError, TableProvider, WorksheetTarget, NEW_WORKSHEET_COLS,
    NEW_WORKSHEET_ROWS,
};
use fleetbook_storage::{
    AdminCredential, MasterStore, StagingStore, StorageError, TrackingStore, DEFAULT_ADMIN_SHA256,
};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fleetbook-sync";

pub const STAGING_FILE: &str = "approved_data.xlsx";
pub const MASTER_FILE: &str = "master_data.xlsx";
pub const TRACKING_FILE: &str = "processed_files.json";

/// How many staged rows the approval summary lists.
pub const RECENT_ENTRIES: usize = 10;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub pdf_root: PathBuf,
    pub admin_sha256: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            data_dir: var("FLEETBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./output")),
            pdf_root: var("FLEETBOOK_PDF_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./pdfs")),
            admin_sha256: var("FLEETBOOK_ADMIN_SHA256")
                .unwrap_or_else(|| DEFAULT_ADMIN_SHA256.to_string()),
        }
    }

    pub fn staging(&self) -> StagingStore {
        StagingStore::new(self.data_dir.join(STAGING_FILE))
    }

    pub fn master(&self) -> MasterStore {
        MasterStore::new(self.data_dir.join(MASTER_FILE))
    }

    pub fn tracking(&self) -> TrackingStore {
        TrackingStore::new(self.data_dir.join(TRACKING_FILE))
    }

    pub fn group_dir(&self, group: &str) -> PathBuf {
        self.pdf_root.join(group)
    }

    pub fn admin_credential(&self) -> anyhow::Result<AdminCredential> {
        AdminCredential::from_sha256_hex(&self.admin_sha256)
            .context("FLEETBOOK_ADMIN_SHA256 must be a hex SHA-256 digest")
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("master table could not be read: {0}")]
    MasterRead(#[source] StorageError),
    #[error("master table could not be written: {0}")]
    MasterWrite(#[source] StorageError),
    #[error("staging table could not be written: {0}")]
    Staging(#[source] StorageError),
    #[error("tracking document could not be written: {0}")]
    Tracking(#[source] StorageError),
}

/// Accepts a single JSON object or an array of them.
pub fn parse_line_items(json: &str) -> anyhow::Result<Vec<Record>> {
    let value: serde_json::Value =
        serde_json::from_str(json).context("line items are not valid JSON")?;
    let records = if value.is_array() {
        serde_json::from_value(value).context("line items do not match the record shape")?
    } else {
        vec![serde_json::from_value(value).context("line item does not match the record shape")?]
    };
    Ok(records)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalReport {
    pub appended: usize,
    pub staged_rows: usize,
    pub newly_marked: bool,
}

/// Stage every line item of one source document, then record the document as
/// handled. Missing unit costs are derived from total and quantity.
pub fn approve_document(
    staging: &StagingStore,
    tracking: &TrackingStore,
    group: &str,
    filename: &str,
    mut records: Vec<Record>,
) -> Result<ApprovalReport, PipelineError> {
    for record in &mut records {
        record.fill_unit_cost();
    }
    let appended = records.len();
    let staged_rows = if records.is_empty() {
        staging.load().len()
    } else {
        staging.append_all(records).map_err(PipelineError::Staging)?
    };
    let newly_marked = tracking
        .mark_processed(group, filename)
        .map_err(PipelineError::Tracking)?;
    info!(group, filename, appended, staged_rows, "document approved");
    Ok(ApprovalReport {
        appended,
        staged_rows,
        newly_marked,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub records: Vec<Record>,
    pub duplicates_removed: usize,
}

/// Concatenate `master` then `staged`, keep the first occurrence of each key,
/// and order newest first with undated rows last. The sort is stable.
pub fn merge_records(master: Vec<Record>, staged: Vec<Record>) -> MergeOutcome {
    let mut seen = HashSet::with_capacity(master.len() + staged.len());
    let mut records = Vec::with_capacity(master.len() + staged.len());
    let mut duplicates_removed = 0;

    for record in master.into_iter().chain(staged) {
        if seen.insert(record.key()) {
            records.push(record);
        } else {
            duplicates_removed += 1;
        }
    }
    records.sort_by(|a, b| fleetbook_core::RecordDate::newest_first(&a.date, &b.date));

    MergeOutcome {
        records,
        duplicates_removed,
    }
}

/// Durable home of the merged record set.
pub trait MasterTable {
    fn load(&self) -> Result<Vec<Record>, StorageError>;
    fn replace(&self, records: &[Record]) -> Result<(), StorageError>;
}

impl MasterTable for MasterStore {
    fn load(&self) -> Result<Vec<Record>, StorageError> {
        MasterStore::load(self)
    }

    fn replace(&self, records: &[Record]) -> Result<(), StorageError> {
        MasterStore::replace(self, records)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    pub staged_rows: usize,
    pub total_rows: usize,
    pub duplicates_removed: usize,
    pub staging_cleared: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExportOutcome {
    NothingStaged,
    Exported(ExportReport),
}

/// Fold staged rows into the master table.
///
/// Staging is only cleared once the new master is on disk. If the master cannot
/// be read or written, both tables are left as they were.
pub fn export_staging<M: MasterTable>(
    staging: &StagingStore,
    master: &M,
) -> Result<ExportOutcome, PipelineError> {
    let staged = staging.load();
    if staged.is_empty() {
        info!("nothing staged; master left untouched");
        return Ok(ExportOutcome::NothingStaged);
    }
    let staged_rows = staged.len();

    let existing = master.load().map_err(PipelineError::MasterRead)?;
    let merged = merge_records(existing, staged);
    master
        .replace(&merged.records)
        .map_err(PipelineError::MasterWrite)?;

    // A leftover staging table is harmless: its rows dedupe away next time.
    let staging_cleared = match staging.clear() {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "master written but staging table could not be cleared");
            false
        }
    };

    info!(
        staged_rows,
        total_rows = merged.records.len(),
        duplicates_removed = merged.duplicates_removed,
        "master table exported"
    );
    Ok(ExportOutcome::Exported(ExportReport {
        staged_rows,
        total_rows: merged.records.len(),
        duplicates_removed: merged.duplicates_removed,
        staging_cleared,
    }))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelationalReport {
    pub success: bool,
    pub inserted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub chunks_committed: usize,
    pub rows_in_table: Option<i64>,
    pub error: Option<String>,
}

impl RelationalReport {
    fn aborted(error: String) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Idempotent bulk insert into the relational table.
pub struct RelationalWriter<P> {
    provider: P,
    chunk_size: usize,
}

impl<P: TableProvider> RelationalWriter<P> {
    pub fn new(provider: P, chunk_size: usize) -> Self {
        Self {
            provider,
            chunk_size: chunk_size.max(1),
        }
    }

    pub async fn write(&self, records: &[Record]) -> RelationalReport {
        let mut table = match self.provider.acquire().await {
            Ok(table) => table,
            Err(err) => return aborted_report("acquiring connection", err),
        };
        if let Err(err) = table.ping().await {
            return aborted_report("connectivity probe", err);
        }
        if let Err(err) = table.ensure_table().await {
            return aborted_report("ensuring table", err);
        }
        let mut known = match table.existing_keys().await {
            Ok(keys) => keys,
            Err(err) => return aborted_report("reading existing keys", err),
        };

        let mut report = RelationalReport {
            success: true,
            ..RelationalReport::default()
        };
        let fresh = records
            .iter()
            .filter(|record| known.insert(record.key()))
            .cloned()
            .collect::<Vec<_>>();
        report.skipped = records.len() - fresh.len();
        info!(
            batch = records.len(),
            fresh = fresh.len(),
            skipped = report.skipped,
            "relational batch filtered"
        );

        for (index, chunk) in fresh.chunks(self.chunk_size).enumerate() {
            let span = info_span!("relational_chunk", chunk = index + 1, rows = chunk.len());
            match table.write_chunk(chunk).instrument(span).await {
                Ok(outcomes) => {
                    report.chunks_committed += 1;
                    for (record, outcome) in chunk.iter().zip(outcomes) {
                        match outcome {
                            RowOutcome::Inserted => report.inserted += 1,
                            RowOutcome::Duplicate => report.skipped += 1,
                            RowOutcome::Failed(reason) => {
                                warn!(key = %record.key(), %reason, "row rejected");
                                report.failed += 1;
                            }
                        }
                    }
                }
                Err(err) => {
                    error!(chunk = index + 1, error = %err, "chunk rolled back");
                    report.failed += chunk.len();
                    report.error = Some(err.to_string());
                }
            }
        }

        match table.row_count().await {
            Ok(count) => report.rows_in_table = Some(count),
            Err(err) => warn!(error = %err, "could not count table rows"),
        }
        info!(
            inserted = report.inserted,
            skipped = report.skipped,
            failed = report.failed,
            chunks = report.chunks_committed,
            "relational sink finished"
        );
        report
    }
}

fn aborted_report(stage: &str, err: SinkError) -> RelationalReport {
    error!(stage, error = %err, "relational sink aborted");
    RelationalReport::aborted(format!("{stage}: {err}"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SheetReport {
    pub success: bool,
    pub pushed: usize,
    pub skipped: usize,
    pub initialized: bool,
    pub error: Option<String>,
}

/// Mirrors records into one worksheet, appending only unseen keys.
pub struct SheetWriter<A> {
    api: A,
    target: WorksheetTarget,
}

impl<A: SheetsApi> SheetWriter<A> {
    pub fn new(api: A, target: WorksheetTarget) -> Self {
        Self { api, target }
    }

    pub fn target(&self) -> &WorksheetTarget {
        &self.target
    }

    pub async fn write(&self, records: &[Record]) -> SheetReport {
        let span = info_span!("sheet_sink", worksheet = %self.target.title);
        match self.try_write(records).instrument(span).await {
            Ok(report) => report,
            Err(err) => {
                error!(worksheet = %self.target.title, error = %err, "spreadsheet sink failed");
                SheetReport {
                    success: false,
                    error: Some(err.to_string()),
                    ..SheetReport::default()
                }
            }
        }
    }

    async fn try_write(&self, records: &[Record]) -> Result<SheetReport, SinkError> {
        if !self.api.worksheet_exists(&self.target).await? {
            self.api
                .add_worksheet(&self.target, NEW_WORKSHEET_ROWS, NEW_WORKSHEET_COLS)
                .await?;
        }

        let existing = self.api.read_rows(&self.target).await?;
        if !has_header(&existing) {
            let mut rows = Vec::with_capacity(records.len() + 1);
            rows.push(header_row());
            rows.extend(records.iter().map(Record::to_cells));
            self.api.clear(&self.target).await?;
            self.api.write_rows(&self.target, &rows).await?;
            info!(rows = records.len(), "worksheet initialized");
            return Ok(SheetReport {
                success: true,
                pushed: records.len(),
                skipped: 0,
                initialized: true,
                error: None,
            });
        }

        let mut known = existing
            .iter()
            .skip(1)
            .filter(|row| row.len() >= 4)
            .map(|row| DuplicateKey::from_parts(&row[0], &row[3]))
            .collect::<HashSet<_>>();
        let fresh = records
            .iter()
            .filter(|record| known.insert(record.key()))
            .map(Record::to_cells)
            .collect::<Vec<_>>();
        let skipped = records.len() - fresh.len();

        if !fresh.is_empty() {
            self.api.append_rows(&self.target, &fresh).await?;
        }
        info!(pushed = fresh.len(), skipped, "worksheet appended");
        Ok(SheetReport {
            success: true,
            pushed: fresh.len(),
            skipped,
            initialized: false,
            error: None,
        })
    }
}

fn has_header(rows: &[Vec<String>]) -> bool {
    rows.first()
        .and_then(|row| row.first())
        .is_some_and(|cell| cell.trim().to_uppercase() == HEADER_MARKER)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "sink", rename_all = "snake_case")]
pub enum SinkReport {
    Sheets(SheetReport),
    Database(RelationalReport),
}

impl SinkReport {
    pub fn succeeded(&self) -> bool {
        match self {
            SinkReport::Sheets(report) => report.success,
            SinkReport::Database(report) => report.success,
        }
    }
}

/// A destination for the master record set. Implementations capture their own
/// failures in the returned report.
#[async_trait]
pub trait RecordSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn push(&self, records: &[Record]) -> SinkReport;
}

#[async_trait]
impl<A: SheetsApi> RecordSink for SheetWriter<A> {
    fn name(&self) -> &'static str {
        "sheets"
    }

    async fn push(&self, records: &[Record]) -> SinkReport {
        SinkReport::Sheets(self.write(records).await)
    }
}

#[async_trait]
impl<P: TableProvider> RecordSink for RelationalWriter<P> {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn push(&self, records: &[Record]) -> SinkReport {
        SinkReport::Database(self.write(records).await)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkSelection {
    #[default]
    All,
    SheetsOnly,
    DatabaseOnly,
}

impl SinkSelection {
    pub fn sheets(self) -> bool {
        matches!(self, SinkSelection::All | SinkSelection::SheetsOnly)
    }

    pub fn database(self) -> bool {
        matches!(self, SinkSelection::All | SinkSelection::DatabaseOnly)
    }
}

pub enum SinkSlot {
    Ready(Box<dyn RecordSink>),
    NotConfigured(String),
    NotSelected,
}

impl SinkSlot {
    pub fn ready<S: RecordSink + 'static>(sink: S) -> Self {
        SinkSlot::Ready(Box::new(sink))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SinkOutcome {
    Succeeded { report: SinkReport },
    Failed { report: SinkReport },
    NotConfigured { reason: String },
    NotSelected,
}

impl SinkOutcome {
    fn selected(&self) -> bool {
        !matches!(self, SinkOutcome::NotSelected)
    }

    fn succeeded(&self) -> bool {
        matches!(self, SinkOutcome::Succeeded { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Complete,
    Partial,
    Failed,
}

impl SyncStatus {
    pub fn from_outcomes(outcomes: &[&SinkOutcome]) -> Self {
        let selected = outcomes.iter().filter(|o| o.selected()).count();
        let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
        if selected > 0 && succeeded == selected {
            SyncStatus::Complete
        } else if succeeded > 0 {
            SyncStatus::Partial
        } else {
            SyncStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records: usize,
    pub sheets: SinkOutcome,
    pub database: SinkOutcome,
    pub status: SyncStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    NothingToSync,
    Synced(SyncSummary),
}

/// Pushes one batch to the spreadsheet sink and then the relational sink.
pub struct SyncOrchestrator {
    sheets: SinkSlot,
    database: SinkSlot,
}

impl SyncOrchestrator {
    pub fn new(sheets: SinkSlot, database: SinkSlot) -> Self {
        Self { sheets, database }
    }

    /// Builds both sinks from the environment. Missing or invalid settings
    /// leave the sink in the not-configured state instead of failing.
    pub fn from_env(selection: SinkSelection) -> Self {
        let sheets = if !selection.sheets() {
            SinkSlot::NotSelected
        } else {
            match SheetsConfig::from_env() {
                Ok(config) => match GoogleSheetsClient::new(&config) {
                    Ok(client) => SinkSlot::ready(SheetWriter::new(client, config.target())),
                    Err(err) => SinkSlot::NotConfigured(err.to_string()),
                },
                Err(err) => SinkSlot::NotConfigured(err.to_string()),
            }
        };

        let database = if !selection.database() {
            SinkSlot::NotSelected
        } else {
            match DatabaseConfig::from_env() {
                Ok(config) => {
                    info!(db = %config.target(), table = %config.table, "database sink configured");
                    SinkSlot::ready(RelationalWriter::new(
                        PgRecordStore::new(&config),
                        config.chunk_size,
                    ))
                }
                Err(err) => SinkSlot::NotConfigured(err.to_string()),
            }
        };

        Self { sheets, database }
    }

    pub async fn run(&self, records: &[Record]) -> SyncSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id, records = records.len());

        let (sheets, database) = async {
            let sheets = push_slot(&self.sheets, records).await;
            let database = push_slot(&self.database, records).await;
            (sheets, database)
        }
        .instrument(span)
        .await;

        let status = SyncStatus::from_outcomes(&[&sheets, &database]);
        info!(%run_id, ?status, "sync finished");
        SyncSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            records: records.len(),
            sheets,
            database,
            status,
        }
    }
}

async fn push_slot(slot: &SinkSlot, records: &[Record]) -> SinkOutcome {
    match slot {
        SinkSlot::NotSelected => SinkOutcome::NotSelected,
        SinkSlot::NotConfigured(reason) => {
            warn!(%reason, "sink not configured");
            SinkOutcome::NotConfigured {
                reason: reason.clone(),
            }
        }
        SinkSlot::Ready(sink) => {
            info!(sink = sink.name(), "pushing batch");
            let report = sink.push(records).await;
            if report.succeeded() {
                SinkOutcome::Succeeded { report }
            } else {
                SinkOutcome::Failed { report }
            }
        }
    }
}

/// Sync the master table to every configured sink. An absent or empty master
/// is reported without contacting any sink.
pub async fn sync_master<M: MasterTable>(
    master: &M,
    orchestrator: &SyncOrchestrator,
) -> Result<SyncOutcome, PipelineError> {
    let records = master.load().map_err(PipelineError::MasterRead)?;
    if records.is_empty() {
        info!("master table empty; nothing to sync");
        return Ok(SyncOutcome::NothingToSync);
    }
    Ok(SyncOutcome::Synced(orchestrator.run(&records).await))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupplierSummary {
    pub supplier: String,
    pub invoices: usize,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalSummary {
    pub rows: usize,
    pub invoices: usize,
    pub total: Decimal,
    pub suppliers: Vec<SupplierSummary>,
    pub recent: Vec<Record>,
}

/// Per-supplier invoice counts and totals, plus the last `recent` rows.
pub fn summarize(records: &[Record], recent: usize) -> ApprovalSummary {
    let mut by_supplier: BTreeMap<&str, (BTreeSet<&str>, Decimal)> = BTreeMap::new();
    let mut invoices = BTreeSet::new();
    let mut total = Decimal::ZERO;

    for record in records {
        let supplier = match record.supplier.trim() {
            "" => "(unknown)",
            name => name,
        };
        let amount = record.total.unwrap_or(Decimal::ZERO);
        let entry = by_supplier.entry(supplier).or_default();
        entry.0.insert(record.document_id.as_str());
        entry.1 += amount;
        invoices.insert(record.document_id.as_str());
        total += amount;
    }

    ApprovalSummary {
        rows: records.len(),
        invoices: invoices.len(),
        total,
        suppliers: by_supplier
            .into_iter()
            .map(|(supplier, (docs, total))| SupplierSummary {
                supplier: supplier.to_string(),
                invoices: docs.len(),
                total,
            })
            .collect(),
        recent: records[records.len().saturating_sub(recent)..].to_vec(),
    }
}
