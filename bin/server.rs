// Tally Sync - Edge Function Server
// Serves the bulk-import and XML-parser edge functions over the local database

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use tally_sync::db::fetch_rows;
use tally_sync::{
    logging, parse_payload, setup_database, BatchImporter, BulkImportRequest, BulkImportResponse,
    Collection, DeduplicationEngine, ImportOperation, ImportStats, Payload, RetryPolicy, Row,
    Schema, SqliteSink, SyncConfig, TallyTable, Tenant, VERSION,
};

#[derive(Parser, Debug)]
#[command(name = "tally-sync-server", version, about = "Local edge-function server for tally-sync")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    db: Option<PathBuf>,

    #[arg(long, default_value = "0.0.0.0:3000")]
    bind: String,

    /// Expected api_key in request bodies; unset disables the check
    #[arg(long)]
    api_key: Option<String>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    api_key: Option<String>,
    schema: Schema,
    batch_size: usize,
}

impl AppState {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.db
            .lock()
            .map_err(|_| ApiError::internal("database lock poisoned"))
    }

    fn check_key(&self, provided: &str) -> Result<(), ApiError> {
        match &self.api_key {
            Some(expected) if expected != provided => Err(ApiError {
                status: StatusCode::UNAUTHORIZED,
                message: "Invalid API key".to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn importer(&self) -> BatchImporter {
        BatchImporter::new(self.batch_size, RetryPolicy::none())
    }
}

/// Error body shaped like the bulk-import response
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(BulkImportResponse::failed(self.message))).into_response()
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self { success: true, data }
    }
}

fn tenant_of(company_id: &str, division_id: &str) -> Result<Tenant, ApiError> {
    if company_id.trim().is_empty() || division_id.trim().is_empty() {
        return Err(ApiError::bad_request("company_id and division_id are required"));
    }
    Ok(Tenant::new(company_id.trim(), division_id.trim()))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/health
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok(serde_json::json!({ "status": "OK", "version": VERSION })))
}

/// POST /functions/v1/tally-bulk-import
async fn bulk_import(
    State(state): State<AppState>,
    Json(request): Json<BulkImportRequest>,
) -> Result<Json<BulkImportResponse>, ApiError> {
    state.check_key(&request.api_key)?;
    let tenant = tenant_of(&request.company_id, &request.division_id)?;
    let table: TallyTable = request.table.parse().map_err(ApiError::bad_request)?;

    let rows: Vec<Row> = request.data.into_iter().map(|row| tenant.enrich(row)).collect();

    let conn = state.conn()?;
    let sink = SqliteSink::new(&conn, state.schema);
    let stats = state
        .importer()
        .import(&sink, table, request.operation, &tenant, &rows)
        .map_err(|e| {
            error!(table = %table, error = %e, "bulk import failed");
            ApiError::internal(e.to_string())
        })?;

    Ok(Json(BulkImportResponse::ok(stats)))
}

#[derive(Deserialize)]
struct XmlParserRequest {
    #[serde(default)]
    api_key: String,
    company_id: String,
    division_id: String,
    collection: String,
    xml: String,
    #[serde(default)]
    operation: ImportOperation,
}

#[derive(Serialize)]
struct TableImport {
    table: TallyTable,
    records: usize,
    #[serde(flatten)]
    stats: ImportStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct XmlParserResponse {
    success: bool,
    collection: Collection,
    parsed: usize,
    skipped: usize,
    tables: Vec<TableImport>,
}

/// POST /functions/v1/tally-xml-parser
///
/// A failed table is reported next to the others and does not stop them;
/// any failure turns the status into 500.
async fn xml_parser(
    State(state): State<AppState>,
    Json(request): Json<XmlParserRequest>,
) -> Result<(StatusCode, Json<XmlParserResponse>), ApiError> {
    state.check_key(&request.api_key)?;
    let tenant = tenant_of(&request.company_id, &request.division_id)?;
    let collection: Collection = request.collection.parse().map_err(ApiError::bad_request)?;

    let parsed = parse_payload(&Payload::xml(request.xml), collection)
        .map_err(|e| ApiError::bad_request(format!("{:#}", e)))?;
    let deduped = DeduplicationEngine::new().dedupe(parsed.records);
    if !parsed.skipped.is_empty() {
        warn!(collection = %collection, skipped = parsed.skipped.len(), "records skipped");
    }

    let conn = state.conn()?;
    let sink = SqliteSink::new(&conn, state.schema);
    let importer = state.importer();

    let mut tables = Vec::new();
    for (table, rows) in deduped.records.table_rows() {
        let rows: Vec<Row> = rows.into_iter().map(|row| tenant.enrich(row)).collect();
        let (stats, error) =
            match importer.import_records(&sink, table, request.operation, &tenant, &rows, &deduped.records) {
                Ok(stats) => (stats, None),
                Err(e) => {
                    error!(table = %table, error = %e, "xml import failed");
                    (ImportStats::default(), Some(e.to_string()))
                }
            };
        tables.push(TableImport {
            table,
            records: rows.len(),
            stats,
            error,
        });
    }

    let success = tables.iter().all(|t| t.error.is_none());
    let status = if success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    Ok((
        status,
        Json(XmlParserResponse {
            success,
            collection,
            parsed: deduped.records.len(),
            skipped: parsed.skipped.len(),
            tables,
        }),
    ))
}

#[derive(Deserialize)]
struct TableQuery {
    company_id: String,
    division_id: String,
    schema: Option<String>,
}

/// GET /api/tables/:table?company_id=&division_id=&schema=
async fn get_table(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(query): Query<TableQuery>,
) -> Result<Json<ApiResponse<Vec<Row>>>, ApiError> {
    let table: TallyTable = urlencoding::decode(&table)
        .map_err(|e| ApiError::bad_request(e.to_string()))?
        .parse()
        .map_err(ApiError::bad_request)?;
    let schema = match query.schema.as_deref() {
        Some(raw) => raw.parse().map_err(ApiError::bad_request)?,
        None => state.schema,
    };
    let tenant = tenant_of(&query.company_id, &query.division_id)?;

    let conn = state.conn()?;
    let rows = fetch_rows(&conn, schema, table, &tenant)
        .map_err(|e| ApiError::internal(format!("{:#}", e)))?
        .into_iter()
        .map(|stored| stored.row)
        .collect();

    Ok(Json(ApiResponse::ok(rows)))
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = SyncConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let conn = Connection::open(&config.db_path)?;
    setup_database(&conn)?;
    info!(db = %config.db_path.display(), "database opened");

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        api_key: cli.api_key.or(config.api_key),
        schema: config.schema,
        batch_size: config.batch_size,
    };
    if state.api_key.is_none() {
        warn!("no API key configured; requests are not authenticated");
    }

    let app = Router::new()
        .route("/api/health", get(health_check))
        .route("/api/tables/:table", get(get_table))
        .route("/functions/v1/tally-bulk-import", post(bulk_import))
        .route("/functions/v1/tally-xml-parser", post(xml_parser))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&cli.bind).await?;
    info!(addr = %cli.bind, "server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOUCHERS: &str = r#"<ENVELOPE>
        <VOUCHER><GUID>v-1</GUID><DATE>20240401</DATE><VOUCHERTYPENAME>Payment</VOUCHERTYPENAME><VOUCHERNUMBER>1</VOUCHERNUMBER>
          <ALLLEDGERENTRIES.LIST><LEDGERNAME>Rent</LEDGERNAME><AMOUNT>-500.00</AMOUNT></ALLLEDGERENTRIES.LIST>
          <ALLLEDGERENTRIES.LIST><LEDGERNAME>Bank</LEDGERNAME><AMOUNT>500.00</AMOUNT></ALLLEDGERENTRIES.LIST>
        </VOUCHER>
    </ENVELOPE>"#;

    fn state(api_key: Option<&str>) -> AppState {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        AppState {
            db: Arc::new(Mutex::new(conn)),
            api_key: api_key.map(str::to_string),
            schema: Schema::Legacy,
            batch_size: 100,
        }
    }

    fn request(api_key: &str) -> XmlParserRequest {
        XmlParserRequest {
            api_key: api_key.to_string(),
            company_id: "acme".to_string(),
            division_id: "north".to_string(),
            collection: "vouchers".to_string(),
            xml: VOUCHERS.to_string(),
            operation: ImportOperation::Upsert,
        }
    }

    #[tokio::test]
    async fn test_xml_parser_imports_every_table() {
        let state = state(Some("secret"));
        let (status, Json(body)) = xml_parser(State(state.clone()), Json(request("secret"))).await.unwrap();

        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        assert_eq!(body.parsed, 1);
        assert_eq!(body.tables.len(), 3);
        assert_eq!(body.tables[1].stats.inserted, 2);
    }

    #[tokio::test]
    async fn test_failed_table_does_not_stop_the_rest() {
        let state = state(None);
        state
            .conn()
            .unwrap()
            .execute("DROP TABLE accounting_entries", [])
            .unwrap();

        let (status, Json(body)) = xml_parser(State(state.clone()), Json(request(""))).await.unwrap();

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.success);
        let outcome: Vec<(TallyTable, bool)> = body.tables.iter().map(|t| (t.table, t.error.is_none())).collect();
        assert_eq!(
            outcome,
            vec![
                (TallyTable::Vouchers, true),
                (TallyTable::AccountingEntries, false),
                (TallyTable::InventoryEntries, true),
            ]
        );
        assert_eq!(body.tables[0].stats.inserted, 1);
    }

    #[tokio::test]
    async fn test_wrong_api_key_is_rejected() {
        let state = state(Some("secret"));
        match xml_parser(State(state), Json(request("guess"))).await {
            Err(error) => assert_eq!(error.status, StatusCode::UNAUTHORIZED),
            Ok((status, _)) => panic!("accepted with status {}", status),
        }
    }
}
