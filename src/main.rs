//! Receipt Kanri - photographed-receipt ingestion and reporting server.

mod config;
mod db;
mod error;
mod extractor;
mod ingest;
mod openrouter;
mod reports;
mod schema;
mod source;
mod validate;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use db::Database;
use error::PipelineError;
use extractor::VisionExtractor;
use ingest::Ingestor;
use openrouter::OpenRouterClient;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    db: Database,
    config: Arc<Config>,
    openrouter: OpenRouterClient,
    ingestor: Arc<Ingestor>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "receipt_kanri=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration up front
    let config = Config::from_env()?;
    info!("config loaded: model={}, db={}", config.model, config.db_path.display());

    // Open storage and make sure the schema exists
    let db = Database::open(&config.db_path)?;
    db.init_schema()?;

    std::fs::create_dir_all(&config.images_dir)?;

    let openrouter = OpenRouterClient::new(
        config.api_key.clone(),
        config.model.clone(),
        config.extract_timeout,
    );
    let ingestor = Arc::new(Ingestor::new(db.clone(), config.archive_subdir.clone()));

    let bind_addr = config.bind_addr.clone();
    let state = AppState {
        db,
        config: Arc::new(config),
        openrouter,
        ingestor,
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/ingest", post(ingest_image))
        .route("/ingest/batch", post(ingest_batch))
        .route("/receipts", get(list_receipts))
        .route("/receipts/:id", get(get_receipt))
        .route("/items", get(list_items))
        .route("/reports/stores", get(report_stores))
        .route("/reports/genres", get(report_genres))
        .route("/reports/monthly", get(report_monthly))
        .route("/reports/weekdays", get(report_weekdays))
        .route("/export", post(export_csv))
        .layer(DefaultBodyLimit::max(50 * 1024 * 1024)) // 50MB
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // Run server
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server listening on http://{bind_addr}");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

#[derive(serde::Deserialize)]
struct DeliveryQuery {
    /// Split the report into chat-sized text chunks instead of one document.
    chunked: Option<bool>,
}

/// Single-image ingestion: multipart upload of one receipt photo, with an
/// optional per-request credential override. This is the ephemeral buffer
/// mode: no source file exists, so nothing is archived.
async fn ingest_image(
    State(state): State<AppState>,
    Query(query): Query<DeliveryQuery>,
    mut multipart: Multipart,
) -> Result<axum::response::Response, (StatusCode, String)> {
    let mut image_name = "attachment".to_string();
    let mut image_data = Vec::new();
    let mut api_key_override: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Multipart error: {e}")))?
    {
        match field.name() {
            Some("image") | Some("file") => {
                if let Some(name) = field.file_name() {
                    image_name = name.to_string();
                }
                image_data = field
                    .bytes()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Failed to read image: {e}")))?
                    .to_vec();
            }
            Some("api_key") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("Failed to read field: {e}")))?;
                if !value.trim().is_empty() {
                    api_key_override = Some(value);
                }
            }
            _ => {}
        }
    }

    if image_data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No image uploaded".to_string()));
    }

    info!("received {} ({} bytes)", image_name, image_data.len());

    let extractor = VisionExtractor::new(client_for(&state, api_key_override));
    let report = state
        .ingestor
        .run_bytes(&extractor, &image_name, &image_data)
        .await;

    Ok(deliver_report(&report, query.chunked.unwrap_or(false)))
}

#[derive(serde::Deserialize, Default)]
struct BatchRequest {
    /// Folder to scan; empty or absent means the configured default.
    folder: Option<String>,
    /// Per-request credential override; empty means the process-wide one.
    api_key: Option<String>,
}

/// Folder-mode ingestion over every supported image in a folder.
async fn ingest_batch(
    State(state): State<AppState>,
    Query(query): Query<DeliveryQuery>,
    body: Option<Json<BatchRequest>>,
) -> Result<axum::response::Response, (StatusCode, String)> {
    let Json(request) = body.unwrap_or_default();

    let folder = request
        .folder
        .filter(|f| !f.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| state.config.images_dir.clone());

    let api_key_override = request.api_key.filter(|k| !k.trim().is_empty());
    let extractor = VisionExtractor::new(client_for(&state, api_key_override));

    let report = state
        .ingestor
        .run_folder(&extractor, &folder)
        .await
        .map_err(|e| match e {
            PipelineError::NoImagesFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
            other => {
                error!("batch failed: {other}");
                (StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
            }
        })?;

    Ok(deliver_report(&report, query.chunked.unwrap_or(false)))
}

/// Get one persisted receipt with its line items.
async fn get_receipt(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<schema::Receipt>, StatusCode> {
    state
        .db
        .fetch_receipt(id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn list_receipts(
    State(state): State<AppState>,
) -> Result<Json<Vec<reports::ReceiptRow>>, (StatusCode, String)> {
    reports::list_receipts(&state.db).map(Json).map_err(internal)
}

async fn list_items(
    State(state): State<AppState>,
) -> Result<Json<Vec<reports::ItemRow>>, (StatusCode, String)> {
    reports::list_items(&state.db).map(Json).map_err(internal)
}

async fn report_stores(
    State(state): State<AppState>,
) -> Result<Json<Vec<reports::KeyedSummary>>, (StatusCode, String)> {
    reports::store_summary(&state.db).map(Json).map_err(internal)
}

async fn report_genres(
    State(state): State<AppState>,
) -> Result<Json<Vec<reports::KeyedSummary>>, (StatusCode, String)> {
    reports::genre_summary(&state.db).map(Json).map_err(internal)
}

async fn report_monthly(
    State(state): State<AppState>,
) -> Result<Json<Vec<reports::MonthlySummary>>, (StatusCode, String)> {
    reports::monthly_summary(&state.db).map(Json).map_err(internal)
}

async fn report_weekdays(
    State(state): State<AppState>,
) -> Result<Json<Vec<reports::WeekdaySummary>>, (StatusCode, String)> {
    reports::weekday_summary(&state.db).map(Json).map_err(internal)
}

#[derive(serde::Deserialize, Default)]
struct ExportRequest {
    /// Output folder; empty or absent means a timestamped default.
    dir: Option<String>,
}

/// Dump both tables as CSV files.
async fn export_csv(
    State(state): State<AppState>,
    body: Option<Json<ExportRequest>>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let Json(request) = body.unwrap_or_default();
    let dir = request
        .dir
        .filter(|d| !d.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(reports::default_export_dir);

    let (receipts_path, items_path) =
        reports::export_csv(&state.db, &dir).map_err(internal)?;

    Ok(Json(serde_json::json!({
        "receipts_csv": receipts_path,
        "items_csv": items_path,
    })))
}

// ============================================================================
// Helper functions
// ============================================================================

/// Base client, or a copy carrying the caller's credential override.
fn client_for(state: &AppState, api_key_override: Option<String>) -> OpenRouterClient {
    match api_key_override {
        Some(key) => state.openrouter.clone().with_api_key(key),
        None => state.openrouter.clone(),
    }
}

/// Render the batch report per the front-end contract: pretty-printed JSON,
/// or chat-sized text chunks when the caller asked for them.
fn deliver_report(report: &ingest::BatchReport, chunked: bool) -> axum::response::Response {
    let pretty = report.to_pretty_json();
    if chunked {
        Json(ingest::chunk_for_delivery(&pretty, 2000)).into_response()
    } else {
        (
            [(header::CONTENT_TYPE, "application/json")],
            pretty,
        )
            .into_response()
    }
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    error!("request failed: {e:#}");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
