//! Local persistence for fleetbook: xlsx record tables, the source-tracking
//! document and the administrative credential guard.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, DataType, Reader};
use fleetbook_core::{Column, Record};
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fleetbook-storage";

/// Worksheet name used for the local staging and master tables.
pub const RECORD_SHEET_NAME: &str = "Records";

/// SHA-256 of the stock administrator password. Deployments override it with
/// `FLEETBOOK_ADMIN_SHA256`.
pub const DEFAULT_ADMIN_SHA256: &str =
    "1b303982e338acd7310d83bbe99ef4c07011dcf68a604484f5515c1d15c0c488";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading xlsx table: {0}")]
    XlsxRead(#[from] calamine::Error),
    #[error("writing xlsx table: {0}")]
    XlsxWrite(#[from] XlsxError),
    #[error("tracking document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("administrator password rejected")]
    CredentialRejected,
    #[error("invalid reference digest: {0}")]
    InvalidReference(String),
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write a file through a sibling temp file and an atomic rename, so readers
/// only ever observe the old or the new content.
pub fn write_atomically<F>(target: &Path, write: F) -> Result<(), StorageError>
where
    F: FnOnce(&Path) -> Result<(), StorageError>,
{
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|e| StorageError::io(&parent, e))?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "table".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    if let Err(err) = write(&temp_path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    fs::rename(&temp_path, target).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        StorageError::io(target, e)
    })
}

/// An xlsx file holding a header row plus one row per record, every cell text.
#[derive(Debug, Clone)]
pub struct RecordBook {
    path: PathBuf,
}

impl RecordBook {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read every record. A missing file reads as an empty table; columns are
    /// located by header name and absent columns become empty values.
    pub fn read(&self) -> Result<Vec<Record>, StorageError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut workbook = open_workbook_auto(&self.path)?;
        let Some(sheet_name) = workbook.sheet_names().first().cloned() else {
            return Ok(Vec::new());
        };
        let range = workbook.worksheet_range(&sheet_name)?;
        let mut rows = range.rows();
        let Some(header) = rows.next() else {
            return Ok(Vec::new());
        };
        let columns = header
            .iter()
            .map(|cell| Column::from_header(&cell_text(cell)))
            .collect::<Vec<_>>();

        let mut records = Vec::new();
        for row in rows {
            if row.iter().all(|cell| cell_text(cell).trim().is_empty()) {
                continue;
            }
            records.push(Record::from_cells(|column| {
                columns
                    .iter()
                    .position(|c| *c == Some(column))
                    .and_then(|idx| row.get(idx))
                    .map(cell_text)
            }));
        }
        Ok(records)
    }

    /// Replace the whole file with `records`.
    pub fn write(&self, records: &[Record]) -> Result<(), StorageError> {
        write_atomically(&self.path, |temp_path| {
            let mut workbook = Workbook::new();
            let worksheet = workbook.add_worksheet();
            worksheet.set_name(RECORD_SHEET_NAME)?;

            let header_format = Format::new().set_bold();
            for (col, column) in Column::ALL.iter().enumerate() {
                worksheet.write_string_with_format(0, col as u16, column.header(), &header_format)?;
            }
            for (idx, record) in records.iter().enumerate() {
                let row = (idx + 1) as u32;
                for (col, value) in record.to_cells().into_iter().enumerate() {
                    if !value.is_empty() {
                        worksheet.write_string(row, col as u16, value)?;
                    }
                }
            }
            worksheet.set_freeze_panes(1, 0)?;
            workbook.save(temp_path)?;
            Ok(())
        })
    }

    /// Delete the file. A file that is already gone is not an error.
    pub fn remove(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(&self.path, err)),
        }
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(text) => text.clone(),
        Data::DateTime(_) => cell
            .as_date()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| cell.to_string()),
        other => other.to_string(),
    }
}

/// Approved records waiting for the next export.
#[derive(Debug, Clone)]
pub struct StagingStore {
    book: RecordBook,
}

impl StagingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            book: RecordBook::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.book.path()
    }

    /// Staged rows, or nothing when the file is absent or unreadable.
    pub fn load(&self) -> Vec<Record> {
        match self.book.read() {
            Ok(records) => records,
            Err(err) => {
                warn!(path = %self.book.path().display(), error = %err, "staging table unreadable; treating as empty");
                Vec::new()
            }
        }
    }

    pub fn append(&self, record: Record) -> Result<usize, StorageError> {
        self.append_all(vec![record])
    }

    /// Append records and rewrite the table. Returns the staged row count.
    pub fn append_all(&self, records: Vec<Record>) -> Result<usize, StorageError> {
        let mut staged = self.load();
        staged.extend(records);
        self.book.write(&staged)?;
        info!(rows = staged.len(), "staging table updated");
        Ok(staged.len())
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.book.remove()
    }
}

/// The deduplicated, date-ordered record set pushed to remote sinks.
#[derive(Debug, Clone)]
pub struct MasterStore {
    book: RecordBook,
}

impl MasterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            book: RecordBook::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.book.path()
    }

    pub fn exists(&self) -> bool {
        self.book.exists()
    }

    /// Unlike staging, an unreadable master is an error: overwriting it would
    /// discard history.
    pub fn load(&self) -> Result<Vec<Record>, StorageError> {
        self.book.read()
    }

    pub fn replace(&self, records: &[Record]) -> Result<(), StorageError> {
        self.book.write(records)
    }
}

/// Proof that an administrator password was verified. Only
/// [`AdminCredential::verify`] can produce one.
#[derive(Debug)]
pub struct AdminGrant {
    _private: (),
}

/// Reference digest guarding destructive tracking operations.
#[derive(Debug, Clone)]
pub struct AdminCredential {
    reference_sha256: String,
}

impl AdminCredential {
    pub fn from_sha256_hex(reference: &str) -> Result<Self, StorageError> {
        let reference = reference.trim().to_ascii_lowercase();
        if reference.len() != 64 || !reference.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidReference(
                "expected 64 hex characters".to_string(),
            ));
        }
        Ok(Self {
            reference_sha256: reference,
        })
    }

    pub fn verify(&self, password: &str) -> Result<AdminGrant, StorageError> {
        let entered = sha256_hex(password.as_bytes());
        let matches = entered.len() == self.reference_sha256.len()
            && entered
                .bytes()
                .zip(self.reference_sha256.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0;
        if matches {
            info!("administrator password verified");
            Ok(AdminGrant { _private: () })
        } else {
            warn!("administrator password rejected");
            Err(StorageError::CredentialRejected)
        }
    }
}

impl Default for AdminCredential {
    fn default() -> Self {
        Self {
            reference_sha256: DEFAULT_ADMIN_SHA256.to_string(),
        }
    }
}

pub type ProcessedFiles = BTreeMap<String, Vec<String>>;

/// Which source documents (per group) already received an approval decision.
#[derive(Debug, Clone)]
pub struct TrackingStore {
    path: PathBuf,
}

impl TrackingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current tracking state; absent or malformed documents read as empty.
    pub fn load(&self) -> ProcessedFiles {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return ProcessedFiles::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "tracking file unreadable; treating as empty");
                return ProcessedFiles::new();
            }
        };
        match serde_json::from_slice::<ProcessedFiles>(&bytes) {
            Ok(processed) => processed,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "tracking file malformed; treating as empty");
                ProcessedFiles::new()
            }
        }
    }

    pub fn is_processed(&self, group: &str, filename: &str) -> bool {
        self.load()
            .get(group)
            .is_some_and(|files| files.iter().any(|f| f == filename))
    }

    /// Returns `true` when the file was newly marked.
    pub fn mark_processed(&self, group: &str, filename: &str) -> Result<bool, StorageError> {
        let mut processed = self.load();
        let files = processed.entry(group.to_string()).or_default();
        if files.iter().any(|f| f == filename) {
            return Ok(false);
        }
        files.push(filename.to_string());
        self.save(&processed)?;
        info!(group, filename, "source marked processed");
        Ok(true)
    }

    pub fn group_counts(&self) -> Vec<(String, usize)> {
        self.load()
            .into_iter()
            .map(|(group, files)| (group, files.len()))
            .collect()
    }

    /// PDF files under `dir` that are not yet marked for `group`, sorted by name.
    pub fn pending_files(&self, group: &str, dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::io(dir, err)),
        };
        let processed = self.load();
        let done = processed.get(group).cloned().unwrap_or_default();

        let mut pending = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
            })
            .filter(|path| {
                path.file_name()
                    .map(|name| !done.iter().any(|f| f.as_str() == name.to_string_lossy()))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();
        pending.sort();
        Ok(pending)
    }

    /// Forget every processed file of one group. Returns `false` if the group
    /// was not tracked.
    pub fn unmark(&self, _grant: &AdminGrant, group: &str) -> Result<bool, StorageError> {
        let mut processed = self.load();
        if processed.remove(group).is_none() {
            return Ok(false);
        }
        self.save(&processed)?;
        warn!(group, "processed status reset for group");
        Ok(true)
    }

    pub fn unmark_all(&self, _grant: &AdminGrant) -> Result<bool, StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                warn!("processed status reset for all groups");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StorageError::io(&self.path, err)),
        }
    }

    fn save(&self, processed: &ProcessedFiles) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(processed)?;
        write_atomically(&self.path, |temp_path| {
            fs::write(temp_path, &bytes).map_err(|e| StorageError::io(temp_path, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbook_core::{parse_money, RecordDate};
    use tempfile::tempdir;

    fn record(doc: &str, desc: &str, total: &str) -> Record {
        Record {
            document_id: doc.to_string(),
            date: RecordDate::parse("2024-05-02"),
            vehicle: "KBX 001".to_string(),
            description: desc.to_string(),
            quantity: Some(1.0),
            unit_cost: parse_money(total),
            total: parse_money(total),
            supplier: "Tyre Centre".to_string(),
            owner: String::new(),
        }
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn record_book_preserves_rows_and_empty_cells() {
        let dir = tempdir().expect("tempdir");
        let book = RecordBook::new(dir.path().join("master.xlsx"));
        let rows = vec![record("INV1", "Oil filter", "500"), record("INV2", "Tyre", "7200.5")];

        book.write(&rows).expect("write");
        let read = book.read().expect("read");

        assert_eq!(read.len(), 2);
        assert_eq!(read[0].key(), rows[0].key());
        assert_eq!(read[1].total, parse_money("7200.50"));
        assert!(read[0].owner.is_empty());
        assert_eq!(read[0].date, RecordDate::parse("2024-05-02"));
    }

    #[test]
    fn missing_record_book_reads_empty() {
        let dir = tempdir().expect("tempdir");
        let book = RecordBook::new(dir.path().join("absent.xlsx"));
        assert!(book.read().expect("read").is_empty());
        book.remove().expect("removing absent file is fine");
    }

    #[test]
    fn staging_appends_and_clears() {
        let dir = tempdir().expect("tempdir");
        let staging = StagingStore::new(dir.path().join("out").join("approved.xlsx"));

        assert_eq!(staging.append(record("INV1", "Oil filter", "500")).expect("append"), 1);
        assert_eq!(
            staging
                .append_all(vec![record("INV1", "Air filter", "300"), record("INV2", "Tyre", "7200")])
                .expect("append all"),
            3
        );
        let loaded = staging.load();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[1].description, "Air filter");

        staging.clear().expect("clear");
        assert!(staging.load().is_empty());
        assert!(!staging.path().exists());
    }

    #[test]
    fn corrupt_staging_reads_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("approved.xlsx");
        fs::write(&path, b"not a workbook").expect("write junk");
        let staging = StagingStore::new(&path);
        assert!(staging.load().is_empty());
        assert_eq!(staging.append(record("INV3", "Wiper", "90")).expect("append"), 1);
    }

    #[test]
    fn corrupt_master_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("master.xlsx");
        fs::write(&path, b"not a workbook").expect("write junk");
        assert!(MasterStore::new(&path).load().is_err());
    }

    #[test]
    fn tracking_marks_idempotently() {
        let dir = tempdir().expect("tempdir");
        let tracking = TrackingStore::new(dir.path().join("processed_files.json"));

        assert!(!tracking.is_processed("tyres", "a.pdf"));
        assert!(tracking.mark_processed("tyres", "a.pdf").expect("mark"));
        assert!(!tracking.mark_processed("tyres", "a.pdf").expect("mark again"));
        assert!(tracking.mark_processed("oil", "b.pdf").expect("mark other group"));

        assert!(tracking.is_processed("tyres", "a.pdf"));
        assert!(!tracking.is_processed("oil", "a.pdf"));
        assert_eq!(
            tracking.group_counts(),
            vec![("oil".to_string(), 1), ("tyres".to_string(), 1)]
        );
    }

    #[test]
    fn malformed_tracking_reads_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("processed_files.json");
        fs::write(&path, b"[1, 2, 3]").expect("write");
        let tracking = TrackingStore::new(&path);
        assert!(tracking.load().is_empty());
        assert!(tracking.mark_processed("tyres", "a.pdf").expect("mark"));
        assert!(tracking.is_processed("tyres", "a.pdf"));
    }

    #[test]
    fn pending_files_skip_processed_and_non_pdf() {
        let dir = tempdir().expect("tempdir");
        let group_dir = dir.path().join("tyres");
        fs::create_dir_all(&group_dir).expect("mkdir");
        for name in ["b.pdf", "a.PDF", "notes.txt", "c.pdf"] {
            fs::write(group_dir.join(name), b"x").expect("write");
        }
        let tracking = TrackingStore::new(dir.path().join("processed_files.json"));
        tracking.mark_processed("tyres", "b.pdf").expect("mark");

        let pending = tracking.pending_files("tyres", &group_dir).expect("pending");
        let names = pending
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a.PDF", "c.pdf"]);
        assert!(tracking
            .pending_files("tyres", &dir.path().join("missing"))
            .expect("missing dir")
            .is_empty());
    }

    #[test]
    fn reset_requires_verified_password() {
        let dir = tempdir().expect("tempdir");
        let tracking = TrackingStore::new(dir.path().join("processed_files.json"));
        tracking.mark_processed("tyres", "a.pdf").expect("mark");
        tracking.mark_processed("oil", "b.pdf").expect("mark");

        let credential = AdminCredential::from_sha256_hex(&sha256_hex(b"s3cret")).expect("reference");
        assert!(matches!(
            credential.verify("wrong"),
            Err(StorageError::CredentialRejected)
        ));
        assert!(tracking.is_processed("tyres", "a.pdf"));

        let grant = credential.verify("s3cret").expect("grant");
        assert!(tracking.unmark(&grant, "tyres").expect("unmark"));
        assert!(!tracking.unmark(&grant, "tyres").expect("unmark again"));
        assert!(!tracking.is_processed("tyres", "a.pdf"));
        assert!(tracking.is_processed("oil", "b.pdf"));

        assert!(tracking.unmark_all(&grant).expect("unmark all"));
        assert!(tracking.load().is_empty());
    }

    #[test]
    fn default_credential_accepts_stock_password() {
        assert!(AdminCredential::default().verify("fleetbook-admin").is_ok());
        assert!(AdminCredential::from_sha256_hex("abc").is_err());
    }
}
