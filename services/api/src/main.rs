//! API Service - Read-only presentation API over the consumption store
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /records - Filtered, paginated records
//! - GET /imports - Import history, newest first
//! - GET /stats - Dataset totals and importe summary
//! - GET /chart/importe-por-periodo - Per-period importe sums for charting
//!
//! Every request reads the store fresh; nothing is cached between requests.

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use store_client::{ConsumptionRecord, Store, StoreConfig};
use tower_http::cors::{Any, CorsLayer};

const DEFAULT_PER_PAGE: usize = 50;
const MAX_PER_PAGE: usize = 500;

// ============================================================================
// State
// ============================================================================

struct AppState {
    store: Store,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize)]
struct RecordsResponse {
    records: Vec<ConsumptionRecord>,
    total: usize,
    page: usize,
    per_page: usize,
    total_pages: usize,
}

#[derive(Debug, PartialEq, Serialize)]
struct StatsResponse {
    total_records: usize,
    unique_rpus: usize,
    unique_periods: usize,
    importe: ImporteStats,
}

#[derive(Debug, PartialEq, Serialize)]
struct ImporteStats {
    total: f64,
    average: f64,
    max: f64,
    min: f64,
}

#[derive(Debug, PartialEq, Serialize)]
struct ChartResponse {
    labels: Vec<String>,
    values: Vec<i64>,
    filtered_count: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Query params
// ============================================================================

/// Filters for the records table. List parameters take comma-separated
/// values and match any of them; every parameter given must match.
#[derive(Debug, Default, Deserialize)]
struct RecordsQuery {
    rpu: Option<String>,
    periodo: Option<String>,
    nombre: Option<String>,
    ciudad: Option<String>,
    estado: Option<String>,
    rfc: Option<String>,
    min_importe: Option<f64>,
    max_importe: Option<f64>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ChartQuery {
    estados: Option<String>,
    ciudades: Option<String>,
    periodos: Option<String>,
    min_importe: Option<f64>,
    max_importe: Option<f64>,
}

// ============================================================================
// Filtering
// ============================================================================

/// Split a comma-separated query value into trimmed, non-empty entries.
fn parse_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// An empty list means "no constraint on this field".
fn in_list(list: &[String], value: &str) -> bool {
    list.is_empty() || list.iter().any(|v| v == value)
}

#[derive(Debug, Default)]
struct RecordFilter {
    rpus: Vec<String>,
    periodos: Vec<String>,
    nombres: Vec<String>,
    ciudades: Vec<String>,
    estados: Vec<String>,
    rfcs: Vec<String>,
    min_importe: Option<f64>,
    max_importe: Option<f64>,
}

impl RecordFilter {
    fn from_records_query(q: &RecordsQuery) -> Self {
        Self {
            rpus: parse_list(q.rpu.as_deref()),
            periodos: parse_list(q.periodo.as_deref()),
            nombres: parse_list(q.nombre.as_deref()),
            ciudades: parse_list(q.ciudad.as_deref()),
            estados: parse_list(q.estado.as_deref()),
            rfcs: parse_list(q.rfc.as_deref()),
            min_importe: q.min_importe,
            max_importe: q.max_importe,
        }
    }

    fn from_chart_query(q: &ChartQuery) -> Self {
        Self {
            estados: parse_list(q.estados.as_deref()),
            ciudades: parse_list(q.ciudades.as_deref()),
            periodos: parse_list(q.periodos.as_deref()),
            min_importe: q.min_importe,
            max_importe: q.max_importe,
            ..Self::default()
        }
    }

    fn matches(&self, r: &ConsumptionRecord) -> bool {
        in_list(&self.rpus, &r.rpu)
            && in_list(&self.periodos, &r.periodo)
            && in_list(&self.nombres, &r.nombre)
            && in_list(&self.ciudades, &r.ciudad)
            && in_list(&self.estados, &r.estado)
            && in_list(&self.rfcs, &r.rfc)
            && self.min_importe.map_or(true, |m| r.importe_total >= m)
            && self.max_importe.map_or(true, |m| r.importe_total <= m)
    }
}

/// Filter without reordering; the store already returns newest first.
fn apply_filter<'a>(
    records: &'a [ConsumptionRecord],
    filter: &RecordFilter,
) -> Vec<&'a ConsumptionRecord> {
    records.iter().filter(|r| filter.matches(r)).collect()
}

// ============================================================================
// Aggregation
// ============================================================================

/// Slice bounds for one page of a filtered set; `page` is 1-based and a
/// page past the end comes back empty rather than erroring.
fn page_bounds(total: usize, page: usize, per_page: usize) -> (usize, usize) {
    let start = (page - 1).saturating_mul(per_page).min(total);
    let end = start.saturating_add(per_page).min(total);
    (start, end)
}

/// Dataset-wide summary. `max` floors at zero; `min` is the smallest
/// strictly positive amount, zero when there is none.
fn dataset_stats(records: &[ConsumptionRecord]) -> StatsResponse {
    let unique_rpus: HashSet<&str> = records.iter().map(|r| r.rpu.as_str()).collect();
    let unique_periods: HashSet<&str> = records.iter().map(|r| r.periodo.as_str()).collect();

    let total: f64 = records.iter().map(|r| r.importe_total).sum();
    let average = if records.is_empty() {
        0.0
    } else {
        total / records.len() as f64
    };
    let max = records.iter().map(|r| r.importe_total).fold(0.0, f64::max);
    let min = records
        .iter()
        .map(|r| r.importe_total)
        .filter(|v| *v > 0.0)
        .fold(f64::INFINITY, f64::min);

    StatsResponse {
        total_records: records.len(),
        unique_rpus: unique_rpus.len(),
        unique_periods: unique_periods.len(),
        importe: ImporteStats {
            total,
            average,
            max,
            min: if min.is_finite() { min } else { 0.0 },
        },
    }
}

/// Sum `importe_total` per period over the filtered records. Labels come
/// out sorted ascending; records without a period land under "Sin periodo".
fn importe_por_periodo(records: &[&ConsumptionRecord]) -> (Vec<String>, Vec<i64>) {
    let mut by_period: BTreeMap<String, f64> = BTreeMap::new();
    for r in records {
        let label = if r.periodo.is_empty() {
            "Sin periodo".to_string()
        } else {
            r.periodo.clone()
        };
        *by_period.entry(label).or_insert(0.0) += r.importe_total;
    }

    let labels = by_period.keys().cloned().collect();
    let values = by_period.values().map(|v| v.round() as i64).collect();
    (labels, values)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

async fn records_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecordsQuery>,
) -> impl IntoResponse {
    let records = match state.store.fetch_records().await {
        Ok(records) => records,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let filter = RecordFilter::from_records_query(&params);
    let filtered = apply_filter(&records, &filter);

    let page = params.page.unwrap_or(1).max(1);
    let per_page = params
        .per_page
        .unwrap_or(DEFAULT_PER_PAGE)
        .clamp(1, MAX_PER_PAGE);
    let total = filtered.len();
    let (start, end) = page_bounds(total, page, per_page);

    Json(RecordsResponse {
        records: filtered[start..end].iter().map(|r| (*r).clone()).collect(),
        total,
        page,
        per_page,
        total_pages: total.div_ceil(per_page),
    })
    .into_response()
}

async fn imports_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.fetch_history().await {
        Ok(history) => Json(serde_json::json!({ "imports": history })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.fetch_records().await {
        Ok(records) => Json(dataset_stats(&records)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn chart_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ChartQuery>,
) -> impl IntoResponse {
    let records = match state.store.fetch_records().await {
        Ok(records) => records,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let filter = RecordFilter::from_chart_query(&params);
    let filtered = apply_filter(&records, &filter);
    let (labels, values) = importe_por_periodo(&filtered);

    Json(ChartResponse {
        labels,
        values,
        filtered_count: filtered.len(),
    })
    .into_response()
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("=== Consumo Eléctrico API ===");

    let store = Store::new(StoreConfig::from_env().context("store configuration incomplete")?)?;
    let state = Arc::new(AppState { store });

    // CORS for the web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/records", get(records_handler))
        .route("/imports", get(imports_handler))
        .route("/stats", get(stats_handler))
        .route("/chart/importe-por-periodo", get(chart_handler))
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET /health");
    println!("  GET /records?rpu=&periodo=&nombre=&ciudad=&estado=&rfc=&min_importe=&max_importe=&page=&per_page=");
    println!("  GET /imports");
    println!("  GET /stats");
    println!("  GET /chart/importe-por-periodo?estados=&ciudades=&periodos=&min_importe=&max_importe=");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(
        rpu: &str,
        periodo: &str,
        ciudad: &str,
        estado: &str,
        importe: f64,
    ) -> ConsumptionRecord {
        ConsumptionRecord {
            id: 0,
            import_id: 1,
            rpu: rpu.to_string(),
            periodo: periodo.to_string(),
            nombre: format!("Cliente {rpu}"),
            direccion: String::new(),
            ciudad: ciudad.to_string(),
            estado: estado.to_string(),
            rfc: format!("RFC{rpu}"),
            colonia: String::new(),
            calle_1: String::new(),
            calle_2: String::new(),
            importe_total: importe,
            fecha_desde: String::new(),
            fecha_hasta: String::new(),
            fecha_limite_pago: String::new(),
            created_at: Utc::now(),
        }
    }

    fn sample() -> Vec<ConsumptionRecord> {
        vec![
            record("111", "2024-01", "Monterrey", "Nuevo León", 1000.0),
            record("222", "2024-01", "Saltillo", "Coahuila", 2500.5),
            record("333", "2024-02", "Monterrey", "Nuevo León", 400.0),
            record("444", "2024-02", "Torreón", "Coahuila", 0.0),
        ]
    }

    // -------------------------------------------------------------------------
    // Filtering
    // -------------------------------------------------------------------------

    #[test]
    fn parse_list_splits_and_trims() {
        assert_eq!(
            parse_list(Some("Monterrey, Saltillo ,Torreón")),
            vec!["Monterrey", "Saltillo", "Torreón"]
        );
        assert_eq!(parse_list(Some(" , ,")), Vec::<String>::new());
        assert_eq!(parse_list(None), Vec::<String>::new());
    }

    #[test]
    fn list_filters_match_any_value_in_the_list() {
        let records = sample();
        let filter = RecordFilter {
            ciudades: vec!["Monterrey".to_string(), "Torreón".to_string()],
            ..RecordFilter::default()
        };
        let got = apply_filter(&records, &filter);
        let rpus: Vec<&str> = got.iter().map(|r| r.rpu.as_str()).collect();
        assert_eq!(rpus, vec!["111", "333", "444"]);
    }

    #[test]
    fn filters_across_fields_must_all_match() {
        let records = sample();
        let filter = RecordFilter {
            estados: vec!["Coahuila".to_string()],
            periodos: vec!["2024-02".to_string()],
            ..RecordFilter::default()
        };
        let got = apply_filter(&records, &filter);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].rpu, "444");
    }

    #[test]
    fn importe_bounds_are_inclusive() {
        let records = sample();
        let filter = RecordFilter {
            min_importe: Some(400.0),
            max_importe: Some(1000.0),
            ..RecordFilter::default()
        };
        let got = apply_filter(&records, &filter);
        let rpus: Vec<&str> = got.iter().map(|r| r.rpu.as_str()).collect();
        assert_eq!(rpus, vec!["111", "333"]);
    }

    #[test]
    fn an_empty_filter_keeps_everything_in_order() {
        let records = sample();
        let got = apply_filter(&records, &RecordFilter::default());
        assert_eq!(got.len(), 4);
        assert_eq!(got[0].rpu, "111");
        assert_eq!(got[3].rpu, "444");
    }

    #[test]
    fn chart_query_maps_onto_the_shared_filter() {
        let q = ChartQuery {
            estados: Some("Nuevo León".to_string()),
            ciudades: None,
            periodos: Some("2024-01,2024-02".to_string()),
            min_importe: Some(500.0),
            max_importe: None,
        };
        let filter = RecordFilter::from_chart_query(&q);
        assert_eq!(filter.estados, vec!["Nuevo León"]);
        assert_eq!(filter.periodos, vec!["2024-01", "2024-02"]);
        assert!(filter.rpus.is_empty());

        let records = sample();
        let got = apply_filter(&records, &filter);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].rpu, "111");
    }

    // -------------------------------------------------------------------------
    // Pagination
    // -------------------------------------------------------------------------

    #[test]
    fn page_bounds_walk_the_set_in_order() {
        assert_eq!(page_bounds(120, 1, 50), (0, 50));
        assert_eq!(page_bounds(120, 2, 50), (50, 100));
        assert_eq!(page_bounds(120, 3, 50), (100, 120));
    }

    #[test]
    fn page_bounds_past_the_end_are_empty() {
        assert_eq!(page_bounds(120, 4, 50), (120, 120));
        assert_eq!(page_bounds(0, 1, 50), (0, 0));
    }

    #[test]
    fn total_pages_rounds_up() {
        assert_eq!(120usize.div_ceil(50), 3);
        assert_eq!(100usize.div_ceil(50), 2);
        assert_eq!(0usize.div_ceil(50), 0);
    }

    // -------------------------------------------------------------------------
    // Stats
    // -------------------------------------------------------------------------

    #[test]
    fn stats_summarize_the_dataset() {
        let stats = dataset_stats(&sample());
        assert_eq!(stats.total_records, 4);
        assert_eq!(stats.unique_rpus, 4);
        assert_eq!(stats.unique_periods, 2);
        assert_eq!(stats.importe.total, 3900.5);
        assert_eq!(stats.importe.average, 975.125);
        assert_eq!(stats.importe.max, 2500.5);
        // 0.0 amounts are ignored for the minimum.
        assert_eq!(stats.importe.min, 400.0);
    }

    #[test]
    fn stats_on_an_empty_dataset_are_all_zero() {
        let stats = dataset_stats(&[]);
        assert_eq!(
            stats,
            StatsResponse {
                total_records: 0,
                unique_rpus: 0,
                unique_periods: 0,
                importe: ImporteStats {
                    total: 0.0,
                    average: 0.0,
                    max: 0.0,
                    min: 0.0,
                },
            }
        );
    }

    #[test]
    fn stats_min_is_zero_when_no_amount_is_positive() {
        let records = vec![
            record("111", "2024-01", "Monterrey", "Nuevo León", 0.0),
            record("222", "2024-01", "Saltillo", "Coahuila", 0.0),
        ];
        let stats = dataset_stats(&records);
        assert_eq!(stats.importe.min, 0.0);
        assert_eq!(stats.importe.max, 0.0);
    }

    #[test]
    fn repeated_rpus_count_once() {
        let records = vec![
            record("111", "2024-01", "Monterrey", "Nuevo León", 100.0),
            record("111", "2024-02", "Monterrey", "Nuevo León", 200.0),
        ];
        let stats = dataset_stats(&records);
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.unique_rpus, 1);
        assert_eq!(stats.unique_periods, 2);
    }

    // -------------------------------------------------------------------------
    // Chart
    // -------------------------------------------------------------------------

    #[test]
    fn chart_groups_by_period_with_sorted_labels() {
        let records = sample();
        let refs: Vec<&ConsumptionRecord> = records.iter().collect();
        let (labels, values) = importe_por_periodo(&refs);
        assert_eq!(labels, vec!["2024-01", "2024-02"]);
        // Sums round to whole pesos: 1000 + 2500.5 rounds to 3501.
        assert_eq!(values, vec![3501, 400]);
    }

    #[test]
    fn chart_buckets_missing_periods_separately() {
        let records = vec![
            record("111", "2024-01", "Monterrey", "Nuevo León", 100.0),
            record("222", "", "Saltillo", "Coahuila", 50.0),
        ];
        let refs: Vec<&ConsumptionRecord> = records.iter().collect();
        let (labels, values) = importe_por_periodo(&refs);
        assert_eq!(labels, vec!["2024-01", "Sin periodo"]);
        assert_eq!(values, vec![100, 50]);
    }

    #[test]
    fn chart_of_nothing_is_empty() {
        let (labels, values) = importe_por_periodo(&[]);
        assert!(labels.is_empty());
        assert!(values.is_empty());
    }
}
