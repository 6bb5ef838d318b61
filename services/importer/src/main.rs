//! Importer Service - Loads CFE billing workbooks into the consumption store
//!
//! Responsibilities:
//! - Read the first worksheet of a billing workbook (.xlsx or .xls)
//! - Extract canonical records from the fixed template layout
//! - Skip rows already stored under the (rpu, periodo) natural key
//! - Batch-insert the new rows under a fresh sequential import id
//! - Record one history entry per import that added anything
//! - Delete a previous import (records plus history entry) on request
//!
//! Usage:
//!   # Import a workbook:
//!   cargo run --bin importer -- --file facturas_enero.xlsx
//!
//!   # Parse and classify without writing:
//!   cargo run --bin importer -- --file facturas_enero.xlsx --dry-run
//!
//!   # Preview a deletion, then run it for real:
//!   cargo run --bin importer -- --delete-import 3 --dry-run
//!   cargo run --bin importer -- --delete-import 3 --yes

use anyhow::{Context, Result};
use async_trait::async_trait;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime};
use clap::Parser;
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::path::PathBuf;
use store_client::{next_import_id, NewImportBatch, NewRecord, Store, StoreConfig, StoreError};
use thiserror::Error;
use tokio::fs;

#[derive(Parser, Debug)]
#[command(
    name = "importer",
    about = "Imports CFE billing workbooks into the consumption store"
)]
struct Args {
    /// Path to the .xlsx/.xls workbook to import
    #[arg(long)]
    file: Option<PathBuf>,

    /// Delete a previous import: all its records plus its history entry
    #[arg(long, value_name = "IMPORT_ID")]
    delete_import: Option<i64>,

    /// Confirm a deletion (delete mode refuses to run without it)
    #[arg(long, default_value = "false")]
    yes: bool,

    /// Dry run - report what an import or deletion would do, write nothing
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

// =============================================================================
// Template layout
// =============================================================================
// The CFE billing template is positional: 18 metadata rows, then one header
// row, then data. Each field worth keeping sits at a fixed offset in the raw
// row; the three date columns sit far to the right of the main block.

/// Metadata rows before the template's own header row.
const PREAMBLE_ROWS: usize = 18;

const COL_RPU: usize = 0;
const COL_PERIODO: usize = 1;
const COL_NOMBRE: usize = 4;
const COL_DIRECCION: usize = 5;
const COL_CIUDAD: usize = 6;
const COL_ESTADO: usize = 7;
const COL_RFC: usize = 8;
const COL_COLONIA: usize = 9;
const COL_CALLE_1: usize = 10;
const COL_CALLE_2: usize = 11;
const COL_IMPORTE_TOTAL: usize = 19;
const COL_FECHA_DESDE: usize = 92;
const COL_FECHA_HASTA: usize = 93;
const COL_FECHA_LIMITE_PAGO: usize = 94;

// =============================================================================
// Field coercion
// =============================================================================

/// Parse a currency cell ("$1,234.50") into a plain amount. Strips pesos
/// signs, thousands separators and whitespace, then reads the longest
/// numeric prefix, so a trailing unit label ("1234.50 MXN") still yields
/// the amount. Cells with no leading number become 0.0. Never fails.
fn coerce_currency(raw: &str) -> f64 {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != '$' && *c != ',' && !c.is_whitespace())
        .collect();

    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in cleaned.char_indices() {
        match c {
            '+' | '-' if i == 0 => {}
            '.' if !seen_dot => seen_dot = true,
            '0'..='9' => {}
            _ => break,
        }
        end = i + c.len_utf8();
    }

    cleaned[..end].parse().unwrap_or(0.0)
}

/// Normalize a billing period token to `YYYY-MM`. Keeps only the digits;
/// fewer than six digits come back as-is and fail the validity check
/// downstream.
fn coerce_period(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 6 {
        format!("{}-{}", &digits[..4], &digits[4..6])
    } else {
        digits
    }
}

/// Render an Excel date serial as display text: midnight serials as a bare
/// date, anything with a time part as date and time. Out-of-range serials
/// print as the number itself.
fn excel_serial_to_text(serial: f64) -> String {
    // 2958465 is 9999-12-31, the last date a sheet can hold.
    if !serial.is_finite() || serial < 0.0 || serial > 2_958_465.0 {
        return serial.to_string();
    }
    let days = serial.floor() as u64;
    let secs = ((serial - serial.floor()) * 86_400.0).round() as u32 % 86_400;
    // Serial 0 sits on 1899-12-30, which also absorbs the sheet's
    // fictional 1900-02-29 for every date in this data's range.
    let date = NaiveDate::from_ymd_opt(1899, 12, 30).unwrap() + Days::new(days);
    if secs == 0 {
        return date.format("%Y-%m-%d").to_string();
    }
    let time = NaiveTime::from_num_seconds_from_midnight_opt(secs, 0).unwrap_or(NaiveTime::MIN);
    NaiveDateTime::new(date, time)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Render a cell to display text. Typed date cells are formatted; string
/// dates flow through verbatim and are interpreted at display time, not
/// here.
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            // RPUs arrive as 12-digit numeric cells; keep them free of a
            // trailing ".0" as long as the float is exactly integral.
            if f.fract() == 0.0 && f.abs() <= 9_007_199_254_740_992.0 {
                format!("{f:.0}")
            } else {
                f.to_string()
            }
        }
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => excel_serial_to_text(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.trim().to_string(),
        Data::Error(_) => String::new(),
    }
}

// =============================================================================
// Row extraction
// =============================================================================

/// A candidate record, not yet tagged with an import id.
#[derive(Debug, Clone, PartialEq)]
struct RecordDraft {
    rpu: String,
    periodo: String,
    nombre: String,
    direccion: String,
    ciudad: String,
    estado: String,
    rfc: String,
    colonia: String,
    calle_1: String,
    calle_2: String,
    importe_total: f64,
    fecha_desde: String,
    fecha_hasta: String,
    fecha_limite_pago: String,
}

impl RecordDraft {
    fn to_record(&self, import_id: i64) -> NewRecord {
        NewRecord {
            import_id,
            rpu: self.rpu.clone(),
            periodo: self.periodo.clone(),
            nombre: self.nombre.clone(),
            direccion: self.direccion.clone(),
            ciudad: self.ciudad.clone(),
            estado: self.estado.clone(),
            rfc: self.rfc.clone(),
            colonia: self.colonia.clone(),
            calle_1: self.calle_1.clone(),
            calle_2: self.calle_2.clone(),
            importe_total: self.importe_total,
            fecha_desde: self.fecha_desde.clone(),
            fecha_hasta: self.fecha_hasta.clone(),
            fecha_limite_pago: self.fecha_limite_pago.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RejectReason {
    MissingRpu,
    MissingPeriodo,
}

#[derive(Debug, Clone, PartialEq)]
enum RowOutcome {
    Accepted(RecordDraft),
    Rejected(RejectReason),
}

/// Map one raw template row to a candidate record.
///
/// The template pads its data block with subtotal and spacer rows; a row
/// with no RPU, or whose period is empty after normalization, is dropped.
/// Rejection is silent, callers only ever see the counts.
fn extract_row(row: &[Data]) -> RowOutcome {
    let text = |offset: usize| row.get(offset).map(cell_text).unwrap_or_default();

    let rpu = text(COL_RPU);
    if rpu.is_empty() {
        return RowOutcome::Rejected(RejectReason::MissingRpu);
    }

    let periodo = coerce_period(&text(COL_PERIODO));
    if periodo.is_empty() {
        return RowOutcome::Rejected(RejectReason::MissingPeriodo);
    }

    RowOutcome::Accepted(RecordDraft {
        rpu,
        periodo,
        nombre: text(COL_NOMBRE),
        direccion: text(COL_DIRECCION),
        ciudad: text(COL_CIUDAD),
        estado: text(COL_ESTADO),
        rfc: text(COL_RFC),
        colonia: text(COL_COLONIA),
        calle_1: text(COL_CALLE_1),
        calle_2: text(COL_CALLE_2),
        importe_total: coerce_currency(&text(COL_IMPORTE_TOTAL)),
        fecha_desde: text(COL_FECHA_DESDE),
        fecha_hasta: text(COL_FECHA_HASTA),
        fecha_limite_pago: text(COL_FECHA_LIMITE_PAGO),
    })
}

// =============================================================================
// Sheet normalization
// =============================================================================

#[derive(Debug, Error)]
enum ParseError {
    #[error("workbook has no sheets")]
    NoSheets,

    #[error("no data rows after the preamble block")]
    EmptyDocument,

    #[error("failed to read workbook: {0}")]
    Workbook(#[from] calamine::Error),
}

/// Everything extracted from one workbook.
#[derive(Debug, Clone, PartialEq)]
struct ParsedSheet {
    records: Vec<RecordDraft>,
    data_rows: usize,
    rejected_missing_rpu: usize,
    rejected_missing_periodo: usize,
}

/// Parse the first worksheet of a billing workbook into candidate records.
/// Candidate order follows sheet order.
fn parse_workbook(bytes: &[u8]) -> Result<ParsedSheet, ParseError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))?;

    let sheet_names = workbook.sheet_names();
    let sheet_name = sheet_names.first().ok_or(ParseError::NoSheets)?.clone();
    println!("  Sheet: '{}' (first of {})", sheet_name, sheet_names.len());

    let range = workbook.worksheet_range(&sheet_name)?;
    let rows: Vec<&[Data]> = range.rows().collect();
    println!("  Size: {} rows x {} columns", rows.len(), range.width());

    if rows.len() <= PREAMBLE_ROWS {
        return Err(ParseError::EmptyDocument);
    }

    // The first surviving row is the template's own header; data starts
    // right after it.
    let data = &rows[PREAMBLE_ROWS + 1..];

    let mut records = Vec::new();
    let mut rejected_missing_rpu = 0;
    let mut rejected_missing_periodo = 0;
    for row in data {
        match extract_row(row) {
            RowOutcome::Accepted(draft) => records.push(draft),
            RowOutcome::Rejected(RejectReason::MissingRpu) => rejected_missing_rpu += 1,
            RowOutcome::Rejected(RejectReason::MissingPeriodo) => rejected_missing_periodo += 1,
        }
    }

    Ok(ParsedSheet {
        records,
        data_rows: data.len(),
        rejected_missing_rpu,
        rejected_missing_periodo,
    })
}

// =============================================================================
// Store seam
// =============================================================================

/// The storage operations the import and delete flows need. The live
/// implementation is the shared REST client; tests swap in an in-memory
/// fake.
#[async_trait]
trait RecordStore {
    async fn record_exists(&self, rpu: &str, periodo: &str) -> Result<bool, StoreError>;
    async fn insert_records(&self, records: &[NewRecord]) -> Result<(), StoreError>;
    async fn insert_history(&self, batch: &NewImportBatch) -> Result<(), StoreError>;
    async fn delete_records_by_import(&self, import_id: i64) -> Result<(), StoreError>;
    async fn delete_history_entry(&self, import_id: i64) -> Result<(), StoreError>;
}

#[async_trait]
impl RecordStore for Store {
    async fn record_exists(&self, rpu: &str, periodo: &str) -> Result<bool, StoreError> {
        Store::record_exists(self, rpu, periodo).await
    }

    async fn insert_records(&self, records: &[NewRecord]) -> Result<(), StoreError> {
        Store::insert_records(self, records).await
    }

    async fn insert_history(&self, batch: &NewImportBatch) -> Result<(), StoreError> {
        Store::insert_history(self, batch).await
    }

    async fn delete_records_by_import(&self, import_id: i64) -> Result<(), StoreError> {
        Store::delete_records_by_import(self, import_id).await
    }

    async fn delete_history_entry(&self, import_id: i64) -> Result<(), StoreError> {
        Store::delete_history_entry(self, import_id).await
    }
}

// =============================================================================
// Import session
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ImportOutcome {
    added: usize,
    duplicates: usize,
    lookup_failures: usize,
}

/// Classify every candidate against the store, then write the new ones as
/// one batch under `import_id`, followed by the batch's history entry.
///
/// A failed duplicate lookup skips that candidate and keeps going; the
/// store's unique index on `(rpu, periodo)` backstops anything the loop
/// lets through. The two writes are not one transaction: a failed history
/// insert leaves the records committed, which the error says outright.
async fn run_import_session<S: RecordStore>(
    store: &S,
    sheet: &ParsedSheet,
    import_id: i64,
    file_name: &str,
    dry_run: bool,
) -> Result<ImportOutcome> {
    let mut staged: Vec<NewRecord> = Vec::new();
    let mut duplicates = 0;
    let mut lookup_failures = 0;

    for draft in &sheet.records {
        match store.record_exists(&draft.rpu, &draft.periodo).await {
            Ok(false) => staged.push(draft.to_record(import_id)),
            Ok(true) => duplicates += 1,
            Err(e) => {
                eprintln!(
                    "  ⚠ Duplicate check failed for {} / {}: {}",
                    draft.rpu, draft.periodo, e
                );
                lookup_failures += 1;
            }
        }
    }

    let added = staged.len();

    if staged.is_empty() {
        println!("  Nothing new to insert");
    } else if dry_run {
        println!("  Dry run - would insert {added} records as import #{import_id}");
    } else {
        store
            .insert_records(&staged)
            .await
            .with_context(|| format!("batch insert of {added} records failed"))?;
        store
            .insert_history(&NewImportBatch {
                id: import_id,
                file_name: file_name.to_string(),
                records_added: added as i64,
            })
            .await
            .with_context(|| {
                format!(
                    "import #{import_id}: records were inserted but recording the history entry failed"
                )
            })?;
        println!("  Inserted {added} records as import #{import_id}");
    }

    Ok(ImportOutcome {
        added,
        duplicates,
        lookup_failures,
    })
}

/// Remove every record created by `import_id`, then its history entry.
///
/// The two deletes are sequential, not transactional. When the second one
/// fails the history entry stays behind and the error says so; nothing is
/// repaired automatically. A dry run returns before the first delete.
async fn delete_import<S: RecordStore>(store: &S, import_id: i64, dry_run: bool) -> Result<()> {
    if dry_run {
        println!("  Dry run - would delete the records and the history entry");
        return Ok(());
    }
    store
        .delete_records_by_import(import_id)
        .await
        .with_context(|| format!("failed to delete records for import #{import_id}"))?;
    store
        .delete_history_entry(import_id)
        .await
        .with_context(|| {
            format!("import #{import_id}: records were deleted but its history entry remains")
        })?;
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== Consumo Eléctrico Importer ===");

    let store = Store::new(StoreConfig::from_env()?)?;

    if let Some(import_id) = args.delete_import {
        if !args.yes && !args.dry_run {
            anyhow::bail!(
                "Deleting import #{} removes all of its records and its history entry.\n\
                 Re-run with --yes to confirm, or --dry-run to preview.",
                import_id
            );
        }

        println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

        let records = store.fetch_records().await.context("failed to load records")?;
        let doomed = records.iter().filter(|r| r.import_id == import_id).count();
        println!("Target: import #{import_id} ({doomed} records)");

        delete_import(&store, import_id, args.dry_run).await?;

        if !args.dry_run {
            let records = store
                .fetch_records()
                .await
                .context("failed to reload records")?;
            let history = store
                .fetch_history()
                .await
                .context("failed to reload import history")?;
            println!("\n=== Delete Complete ===");
            println!(
                "Store now holds {} records across {} imports",
                records.len(),
                history.len()
            );
        }
    } else if let Some(file) = &args.file {
        let file_name = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("import.xlsx")
            .to_string();

        println!("File: {}", file.display());
        println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

        let bytes = fs::read(file)
            .await
            .with_context(|| format!("failed to read {}", file.display()))?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        println!("  Size: {} bytes", bytes.len());
        println!("  Hash: sha256:{:x}", hasher.finalize());

        let sheet = parse_workbook(&bytes)?;
        println!(
            "  Data rows: {} ({} candidates, {} missing RPU, {} missing periodo)",
            sheet.data_rows,
            sheet.records.len(),
            sheet.rejected_missing_rpu,
            sheet.rejected_missing_periodo
        );

        let history = store
            .fetch_history()
            .await
            .context("failed to load import history")?;
        let import_id = next_import_id(&history);

        println!(
            "\nChecking {} candidates against the store (import #{})...",
            sheet.records.len(),
            import_id
        );
        let outcome = run_import_session(&store, &sheet, import_id, &file_name, args.dry_run).await?;

        println!("\n=== Import Summary ===");
        println!("Added: {}", outcome.added);
        println!("Duplicates: {}", outcome.duplicates);
        println!("Lookup failures: {}", outcome.lookup_failures);

        if !args.dry_run {
            let records = store
                .fetch_records()
                .await
                .context("failed to reload records")?;
            let history = store
                .fetch_history()
                .await
                .context("failed to reload import history")?;
            println!(
                "Store now holds {} records across {} imports (next import id: {})",
                records.len(),
                history.len(),
                next_import_id(&history)
            );
        }
    } else {
        anyhow::bail!(
            "Must specify either:\n  \
             --file <path> to import a workbook, or\n  \
             --delete-import <id> --yes to remove a previous import"
        );
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
