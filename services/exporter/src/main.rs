//! Exporter Service - Writes the accumulated dataset back out as a workbook
//!
//! Responsibilities:
//! - Load the full record set through the public read key
//! - Write a single-sheet .xlsx in the reporting column order
//! - Name the file after the current date so repeated exports don't collide
//!
//! Usage:
//!   cargo run --bin exporter
//!   cargo run --bin exporter -- --out-dir ./exports

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::Parser;
use rust_xlsxwriter::{Workbook, XlsxError};
use std::path::PathBuf;
use store_client::{ConsumptionRecord, Store, StoreConfig};
use tokio::fs;

#[derive(Parser, Debug)]
#[command(
    name = "exporter",
    about = "Exports the consumption dataset to a spreadsheet"
)]
struct Args {
    /// Directory the export file is written into
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
}

/// Reporting column order. Colonia and the calle fields are stored but not
/// reported.
const EXPORT_HEADERS: [&str; 11] = [
    "RPU",
    "Periodo",
    "Nombre",
    "Dirección",
    "Ciudad",
    "Estado",
    "RFC",
    "Importe total",
    "Fecha desde",
    "Fecha hasta",
    "Fecha límite pago",
];

const SHEET_NAME: &str = "Datos";

fn export_file_name(date: NaiveDate) -> String {
    format!("consumo_electrico_{}.xlsx", date.format("%Y-%m-%d"))
}

/// Build the export workbook in memory. `Importe total` is written as a
/// number; every other column as text, the date columns exactly as stored.
fn write_dataset(records: &[ConsumptionRecord]) -> Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME)?;

    for (col, header) in EXPORT_HEADERS.iter().enumerate() {
        sheet.write_string(0, col as u16, *header)?;
    }

    for (idx, record) in records.iter().enumerate() {
        let row = (idx + 1) as u32;
        sheet.write_string(row, 0, &record.rpu)?;
        sheet.write_string(row, 1, &record.periodo)?;
        sheet.write_string(row, 2, &record.nombre)?;
        sheet.write_string(row, 3, &record.direccion)?;
        sheet.write_string(row, 4, &record.ciudad)?;
        sheet.write_string(row, 5, &record.estado)?;
        sheet.write_string(row, 6, &record.rfc)?;
        sheet.write_number(row, 7, record.importe_total)?;
        sheet.write_string(row, 8, &record.fecha_desde)?;
        sheet.write_string(row, 9, &record.fecha_hasta)?;
        sheet.write_string(row, 10, &record.fecha_limite_pago)?;
    }

    workbook.save_to_buffer()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    println!("=== Consumo Eléctrico Exporter ===");

    let store = Store::new(StoreConfig::from_env()?)?;

    let records = store.fetch_records().await.context("failed to load records")?;
    println!("Records to export: {}", records.len());

    let bytes = write_dataset(&records).context("failed to build the export workbook")?;

    fs::create_dir_all(&args.out_dir)
        .await
        .with_context(|| format!("failed to create {}", args.out_dir.display()))?;
    let path = args.out_dir.join(export_file_name(Utc::now().date_naive()));
    fs::write(&path, &bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;

    println!("\n=== Export Complete ===");
    println!("File: {} ({} bytes)", path.display(), bytes.len());

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
