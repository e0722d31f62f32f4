use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fleetbook_core::{parse_money, DuplicateKey, Record, RecordDate};
use fleetbook_sinks::{RecordTable, RowOutcome, SheetsApi, SinkError, TableProvider, TableStatus, WorksheetTarget};
use fleetbook_sync::{
    approve_document, export_staging, sync_master, ExportOutcome, RelationalWriter, SheetWriter,
    SinkOutcome, SinkReport, SinkSlot, SyncConfig, SyncOrchestrator, SyncOutcome, SyncStatus,
};
use tempfile::tempdir;

#[derive(Clone, Default)]
struct Table(Arc<Mutex<HashSet<DuplicateKey>>>);

#[async_trait]
impl TableProvider for Table {
    type Table = Table;

    async fn acquire(&self) -> Result<Table, SinkError> {
        Ok(self.clone())
    }
}

#[async_trait]
impl RecordTable for Table {
    async fn ping(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn ensure_table(&mut self) -> Result<TableStatus, SinkError> {
        Ok(TableStatus::Existing)
    }

    async fn existing_keys(&mut self) -> Result<HashSet<DuplicateKey>, SinkError> {
        Ok(self.0.lock().unwrap().clone())
    }

    async fn write_chunk(&mut self, chunk: &[Record]) -> Result<Vec<RowOutcome>, SinkError> {
        let mut keys = self.0.lock().unwrap();
        Ok(chunk
            .iter()
            .map(|r| {
                if keys.insert(r.key()) {
                    RowOutcome::Inserted
                } else {
                    RowOutcome::Duplicate
                }
            })
            .collect())
    }

    async fn row_count(&mut self) -> Result<i64, SinkError> {
        Ok(self.0.lock().unwrap().len() as i64)
    }
}

#[derive(Clone, Default)]
struct Sheet(Arc<Mutex<Vec<Vec<String>>>>);

#[async_trait]
impl SheetsApi for Sheet {
    async fn worksheet_exists(&self, _: &WorksheetTarget) -> Result<bool, SinkError> {
        Ok(true)
    }

    async fn add_worksheet(&self, _: &WorksheetTarget, _: u32, _: u32) -> Result<(), SinkError> {
        Ok(())
    }

    async fn read_rows(&self, _: &WorksheetTarget) -> Result<Vec<Vec<String>>, SinkError> {
        Ok(self.0.lock().unwrap().clone())
    }

    async fn clear(&self, _: &WorksheetTarget) -> Result<(), SinkError> {
        self.0.lock().unwrap().clear();
        Ok(())
    }

    async fn write_rows(&self, _: &WorksheetTarget, rows: &[Vec<String>]) -> Result<(), SinkError> {
        *self.0.lock().unwrap() = rows.to_vec();
        Ok(())
    }

    async fn append_rows(&self, _: &WorksheetTarget, rows: &[Vec<String>]) -> Result<(), SinkError> {
        self.0.lock().unwrap().extend(rows.iter().cloned());
        Ok(())
    }
}

fn item(doc: &str, description: &str, total: &str, date: &str) -> Record {
    Record {
        document_id: doc.into(),
        date: RecordDate::parse(date),
        vehicle: "VAN-7".into(),
        description: description.into(),
        quantity: Some(2.0),
        unit_cost: None,
        total: parse_money(total),
        supplier: "Northside Motors".into(),
        owner: "Fleet Ops".into(),
    }
}

fn orchestrator(sheet: &Sheet, table: &Table) -> SyncOrchestrator {
    SyncOrchestrator::new(
        SinkSlot::ready(SheetWriter::new(
            sheet.clone(),
            WorksheetTarget {
                spreadsheet_id: "ledger".into(),
                title: "Sheet1".into(),
            },
        )),
        SinkSlot::ready(RelationalWriter::new(table.clone(), 2)),
    )
}

#[tokio::test]
async fn approve_export_and_sync_round() {
    let data = tempdir().unwrap();
    let pdfs = tempdir().unwrap();
    let group = pdfs.path().join("Northside");
    std::fs::create_dir_all(&group).unwrap();
    for name in ["a.pdf", "b.PDF", "notes.txt"] {
        std::fs::write(group.join(name), b"%PDF").unwrap();
    }

    let config = SyncConfig::from_lookup(|name| match name {
        "FLEETBOOK_DATA_DIR" => Some(data.path().display().to_string()),
        "FLEETBOOK_PDF_ROOT" => Some(pdfs.path().display().to_string()),
        _ => None,
    });
    let (staging, master, tracking) = (config.staging(), config.master(), config.tracking());

    let pending = tracking
        .pending_files("Northside", &config.group_dir("Northside"))
        .unwrap();
    assert_eq!(pending.len(), 2);

    approve_document(
        &staging,
        &tracking,
        "Northside",
        "a.pdf",
        vec![
            item("INV1", "Oil filter", "500", "2024-03-01"),
            item("INV1", "Labour", "120", "2024-03-01"),
        ],
    )
    .unwrap();
    approve_document(
        &staging,
        &tracking,
        "Northside",
        "b.PDF",
        vec![item("INV2", "Wiper blades", "40", "2024-04-10")],
    )
    .unwrap();
    assert!(tracking
        .pending_files("Northside", &config.group_dir("Northside"))
        .unwrap()
        .is_empty());

    let ExportOutcome::Exported(report) = export_staging(&staging, &master).unwrap() else {
        panic!("expected an export");
    };
    assert_eq!(report.total_rows, 3);
    let rows = master.load().unwrap();
    assert_eq!(rows[0].document_id, "INV2");
    assert_eq!(rows[1].unit_cost, parse_money("250"));

    let (sheet, table) = (Sheet::default(), Table::default());
    let SyncOutcome::Synced(first) = sync_master(&master, &orchestrator(&sheet, &table)).await.unwrap() else {
        panic!("expected a sync");
    };
    assert_eq!(first.status, SyncStatus::Complete);
    assert_eq!(sheet.0.lock().unwrap().len(), 4);
    match &first.database {
        SinkOutcome::Succeeded {
            report: SinkReport::Database(db),
        } => {
            assert_eq!(db.inserted, 3);
            assert_eq!(db.chunks_committed, 2);
        }
        other => panic!("unexpected database outcome: {other:?}"),
    }

    // Re-extraction of an already exported line plus one new line.
    staging
        .append_all(vec![
            item("INV1", "Oil filter", "999", "2024-03-01"),
            item("INV3", "Tyre rotation", "60", "2024-05-02"),
        ])
        .unwrap();
    let ExportOutcome::Exported(second_export) = export_staging(&staging, &master).unwrap() else {
        panic!("expected an export");
    };
    assert_eq!(second_export.duplicates_removed, 1);
    assert_eq!(second_export.total_rows, 4);

    let SyncOutcome::Synced(second) = sync_master(&master, &orchestrator(&sheet, &table)).await.unwrap() else {
        panic!("expected a sync");
    };
    assert_eq!(second.status, SyncStatus::Complete);
    assert_eq!(sheet.0.lock().unwrap().len(), 5);
    assert_eq!(table.0.lock().unwrap().len(), 4);
    match &second.sheets {
        SinkOutcome::Succeeded {
            report: SinkReport::Sheets(sheets),
        } => {
            assert!(!sheets.initialized);
            assert_eq!(sheets.pushed, 1);
            assert_eq!(sheets.skipped, 3);
        }
        other => panic!("unexpected sheets outcome: {other:?}"),
    }

    assert_eq!(
        export_staging(&staging, &master).unwrap(),
        ExportOutcome::NothingStaged
    );
}
