//! Shared client for the hosted consumption store.
//!
//! Every service talks to the same Supabase-style backend: the two logical
//! tables sit behind PostgREST endpoints under `/rest/v1/`, and write
//! credentials are exchanged for an access token at `/auth/v1/token`.
//! Reads carry the public anon key. Each mutating call resolves a fresh
//! token immediately before the request and drops it when the call returns,
//! so a stale session can never be reused across operations.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const RECORDS_TABLE: &str = "consumption_records";
const HISTORY_TABLE: &str = "import_history";

// =============================================================================
// Configuration
// =============================================================================

/// Connection settings, read from the environment.
///
/// `STORE_EMAIL` and `STORE_PASSWORD` are only needed by services that
/// write; a read-only deployment can leave them unset.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub anon_key: String,
    pub email: Option<String>,
    pub password: Option<String>,
}

impl StoreConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            url: std::env::var("STORE_URL").context("STORE_URL env var missing")?,
            anon_key: std::env::var("STORE_ANON_KEY").context("STORE_ANON_KEY env var missing")?,
            email: std::env::var("STORE_EMAIL").ok(),
            password: std::env::var("STORE_PASSWORD").ok(),
        })
    }
}

// =============================================================================
// Models
// =============================================================================

/// One billed period for one metering point (RPU), as stored.
///
/// `fecha_*` columns hold whatever text the source document carried; they
/// are display values, not parsed dates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub id: i64,
    pub import_id: i64,
    pub rpu: String,
    pub periodo: String,
    pub nombre: String,
    pub direccion: String,
    pub ciudad: String,
    pub estado: String,
    pub rfc: String,
    pub colonia: String,
    pub calle_1: String,
    pub calle_2: String,
    pub importe_total: f64,
    pub fecha_desde: String,
    pub fecha_hasta: String,
    pub fecha_limite_pago: String,
    pub created_at: DateTime<Utc>,
}

/// A record about to be inserted; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewRecord {
    pub import_id: i64,
    pub rpu: String,
    pub periodo: String,
    pub nombre: String,
    pub direccion: String,
    pub ciudad: String,
    pub estado: String,
    pub rfc: String,
    pub colonia: String,
    pub calle_1: String,
    pub calle_2: String,
    pub importe_total: f64,
    pub fecha_desde: String,
    pub fecha_hasta: String,
    pub fecha_limite_pago: String,
}

/// One completed import, as stored in the history table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportBatch {
    pub id: i64,
    pub file_name: String,
    pub records_added: i64,
    pub created_at: DateTime<Utc>,
}

/// A history entry about to be written. `id` is chosen by the caller, not
/// the store; see [`next_import_id`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewImportBatch {
    pub id: i64,
    pub file_name: String,
    pub records_added: i64,
}

/// Next sequential import id: one past the highest id in the current
/// history, starting at 1. Deleting the newest import frees its id for
/// the next session to hand out again.
pub fn next_import_id(history: &[ImportBatch]) -> i64 {
    history.iter().map(|b| b.id).max().map_or(1, |max| max + 1)
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("authentication failed with HTTP {status}: {body}")]
    Auth { status: u16, body: String },

    #[error("write credentials not configured; set STORE_EMAIL and STORE_PASSWORD")]
    NoWriteCredentials,
}

async fn require_success(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

// =============================================================================
// Client
// =============================================================================

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Bearer credential scoped to a single mutating call. Constructed inside
/// the call, dropped when it returns.
struct WriteAuth {
    bearer: String,
}

#[derive(Deserialize)]
struct RowId {
    #[allow(dead_code)]
    id: i64,
}

pub struct Store {
    http: reqwest::Client,
    base_url: String,
    config: StoreConfig,
}

impl Store {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .user_agent("ConsumoElectrico/0.1 (carga de facturacion CFE)")
            .build()?;
        let base_url = config.url.trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            config,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Attach the read headers: the anon key doubles as the bearer token.
    fn with_read_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.config.anon_key)
            .bearer_auth(&self.config.anon_key)
    }

    /// Exchange the write credentials for a fresh access token.
    async fn write_auth(&self) -> Result<WriteAuth, StoreError> {
        let (email, password) = match (&self.config.email, &self.config.password) {
            (Some(email), Some(password)) => (email, password),
            _ => return Err(StoreError::NoWriteCredentials),
        };

        let resp = self
            .http
            .post(format!("{}/auth/v1/token", self.base_url))
            .query(&[("grant_type", "password")])
            .header("apikey", &self.config.anon_key)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Auth {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = resp.json().await?;
        Ok(WriteAuth {
            bearer: token.access_token,
        })
    }

    fn with_write_auth(
        &self,
        req: reqwest::RequestBuilder,
        auth: &WriteAuth,
    ) -> reqwest::RequestBuilder {
        req.header("apikey", &self.config.anon_key)
            .bearer_auth(&auth.bearer)
            .header("Prefer", "return=minimal")
    }

    /// All stored records, newest first.
    pub async fn fetch_records(&self) -> Result<Vec<ConsumptionRecord>, StoreError> {
        let resp = self
            .with_read_auth(self.http.get(self.table_url(RECORDS_TABLE)))
            .query(&[("select", "*"), ("order", "created_at.desc")])
            .send()
            .await?;
        Ok(require_success(resp).await?.json().await?)
    }

    /// Import history, newest first.
    pub async fn fetch_history(&self) -> Result<Vec<ImportBatch>, StoreError> {
        let resp = self
            .with_read_auth(self.http.get(self.table_url(HISTORY_TABLE)))
            .query(&[("select", "*"), ("order", "created_at.desc")])
            .send()
            .await?;
        Ok(require_success(resp).await?.json().await?)
    }

    /// Check whether a record already exists for the `(rpu, periodo)`
    /// natural key.
    ///
    /// Best effort only: two clients importing overlapping sheets can both
    /// see "no match" for the same pair. The store's unique index on
    /// `(rpu, periodo)` is what enforces the invariant; this lookup just
    /// keeps known duplicates out of the batch.
    pub async fn record_exists(&self, rpu: &str, periodo: &str) -> Result<bool, StoreError> {
        let rpu_eq = format!("eq.{rpu}");
        let periodo_eq = format!("eq.{periodo}");
        let resp = self
            .with_read_auth(self.http.get(self.table_url(RECORDS_TABLE)))
            .query(&[
                ("select", "id"),
                ("rpu", rpu_eq.as_str()),
                ("periodo", periodo_eq.as_str()),
            ])
            .send()
            .await?;
        let rows: Vec<RowId> = require_success(resp).await?.json().await?;
        Ok(!rows.is_empty())
    }

    /// Insert a batch of records in one request.
    pub async fn insert_records(&self, records: &[NewRecord]) -> Result<(), StoreError> {
        let auth = self.write_auth().await?;
        let resp = self
            .with_write_auth(self.http.post(self.table_url(RECORDS_TABLE)), &auth)
            .json(records)
            .send()
            .await?;
        require_success(resp).await?;
        Ok(())
    }

    /// Record one completed import in the history table.
    pub async fn insert_history(&self, batch: &NewImportBatch) -> Result<(), StoreError> {
        let auth = self.write_auth().await?;
        let resp = self
            .with_write_auth(self.http.post(self.table_url(HISTORY_TABLE)), &auth)
            .json(batch)
            .send()
            .await?;
        require_success(resp).await?;
        Ok(())
    }

    /// Delete every record created by the given import.
    pub async fn delete_records_by_import(&self, import_id: i64) -> Result<(), StoreError> {
        let auth = self.write_auth().await?;
        let import_eq = format!("eq.{import_id}");
        let resp = self
            .with_write_auth(self.http.delete(self.table_url(RECORDS_TABLE)), &auth)
            .query(&[("import_id", import_eq.as_str())])
            .send()
            .await?;
        require_success(resp).await?;
        Ok(())
    }

    /// Delete the history entry for the given import.
    pub async fn delete_history_entry(&self, import_id: i64) -> Result<(), StoreError> {
        let auth = self.write_auth().await?;
        let id_eq = format!("eq.{import_id}");
        let resp = self
            .with_write_auth(self.http.delete(self.table_url(HISTORY_TABLE)), &auth)
            .query(&[("id", id_eq.as_str())])
            .send()
            .await?;
        require_success(resp).await?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(id: i64) -> ImportBatch {
        ImportBatch {
            id,
            file_name: format!("carga_{id}.xlsx"),
            records_added: 10,
            created_at: "2024-01-15T10:00:00Z".parse().unwrap(),
        }
    }

    fn config() -> StoreConfig {
        StoreConfig {
            url: "https://example.supabase.co/".to_string(),
            anon_key: "anon-key".to_string(),
            email: None,
            password: None,
        }
    }

    // -------------------------------------------------------------------------
    // Import id sequencing
    // -------------------------------------------------------------------------

    #[test]
    fn next_import_id_starts_at_one() {
        assert_eq!(next_import_id(&[]), 1);
    }

    #[test]
    fn next_import_id_is_one_past_the_maximum() {
        let history = vec![batch(1), batch(3), batch(2)];
        assert_eq!(next_import_id(&history), 4);
    }

    #[test]
    fn next_import_id_is_recomputed_from_remaining_history() {
        // Gaps left by deleted imports stay open while a higher id
        // survives them.
        let history = vec![batch(1), batch(3), batch(4)];
        assert_eq!(next_import_id(&history), 5);
        // Deleting the import that held the maximum frees its id; the
        // next session hands out 4 again.
        let after_deleting_four = vec![batch(1), batch(3)];
        assert_eq!(next_import_id(&after_deleting_four), 4);
    }

    // -------------------------------------------------------------------------
    // Client construction
    // -------------------------------------------------------------------------

    #[test]
    fn base_url_drops_trailing_slashes() {
        let store = Store::new(config()).unwrap();
        assert_eq!(store.base_url, "https://example.supabase.co");
        assert_eq!(
            store.table_url("consumption_records"),
            "https://example.supabase.co/rest/v1/consumption_records"
        );
    }

    // -------------------------------------------------------------------------
    // Wire shapes
    // -------------------------------------------------------------------------

    #[test]
    fn new_record_serializes_with_store_column_names() {
        let record = NewRecord {
            import_id: 3,
            rpu: "123456789012".to_string(),
            periodo: "2024-01".to_string(),
            nombre: "Comercial del Norte".to_string(),
            direccion: "Av. Juárez 100".to_string(),
            ciudad: "Monterrey".to_string(),
            estado: "Nuevo León".to_string(),
            rfc: "CNO010101AAA".to_string(),
            colonia: "Centro".to_string(),
            calle_1: "Juárez".to_string(),
            calle_2: "Hidalgo".to_string(),
            importe_total: 1234.5,
            fecha_desde: "2024-01-01".to_string(),
            fecha_hasta: "2024-01-31".to_string(),
            fecha_limite_pago: "2024-02-15".to_string(),
        };

        let value = serde_json::to_value(&record).unwrap();
        let object = value.as_object().unwrap();
        for key in [
            "import_id",
            "rpu",
            "periodo",
            "nombre",
            "direccion",
            "ciudad",
            "estado",
            "rfc",
            "colonia",
            "calle_1",
            "calle_2",
            "importe_total",
            "fecha_desde",
            "fecha_hasta",
            "fecha_limite_pago",
        ] {
            assert!(object.contains_key(key), "missing column {key}");
        }
        assert_eq!(object.len(), 15);
        assert_eq!(value["import_id"], 3);
        assert_eq!(value["importe_total"], 1234.5);
    }

    #[test]
    fn consumption_record_deserializes_from_a_store_row() {
        let row = r#"{
            "id": 42,
            "import_id": 2,
            "rpu": "998877665544",
            "periodo": "2024-03",
            "nombre": "Planta Saltillo",
            "direccion": "Carretera 57 km 8",
            "ciudad": "Saltillo",
            "estado": "Coahuila",
            "rfc": "PSA9310016Z1",
            "colonia": "Parque Industrial",
            "calle_1": "",
            "calle_2": "",
            "importe_total": 88210.4,
            "fecha_desde": "2024-03-01",
            "fecha_hasta": "2024-03-31",
            "fecha_limite_pago": "2024-04-15",
            "created_at": "2024-04-02T08:30:15.123456+00:00"
        }"#;

        let record: ConsumptionRecord = serde_json::from_str(row).unwrap();
        assert_eq!(record.id, 42);
        assert_eq!(record.rpu, "998877665544");
        assert_eq!(record.periodo, "2024-03");
        assert_eq!(record.importe_total, 88210.4);
        assert_eq!(record.created_at.to_rfc3339(), "2024-04-02T08:30:15.123456+00:00");
    }

    #[test]
    fn new_import_batch_carries_its_own_id() {
        let batch = NewImportBatch {
            id: 7,
            file_name: "facturas_julio.xlsx".to_string(),
            records_added: 250,
        };
        let value = serde_json::to_value(&batch).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["file_name"], "facturas_julio.xlsx");
        assert_eq!(value["records_added"], 250);
        // created_at is assigned by the store, never sent.
        assert!(value.as_object().unwrap().get("created_at").is_none());
    }
}
