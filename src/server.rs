use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::evidence::collector::{IncidentDetail, IncidentQuery};
use crate::evidence::{CaptureReceipt, ChainEntry, ChainHead, ChainVerification, Collector, CustodyError, Severity};

/// Capture errors become 4xx when the request was at fault, 5xx otherwise.
struct ServerError(CustodyError);

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CustodyError::Canonicalization(_) => StatusCode::BAD_REQUEST,
            CustodyError::NotFound(_) => StatusCode::NOT_FOUND,
            CustodyError::LockContention(_) | CustodyError::HeadMoved { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CustodyError::DuplicateEvidence(_) | CustodyError::StorageUnavailable(_) => {
                error!("Evidence service fault: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<CustodyError> for ServerError {
    fn from(err: CustodyError) -> Self {
        Self(err)
    }
}

#[derive(Deserialize)]
struct CaptureRequest {
    incident_type: String,
    application: String,
    severity: String,
    #[serde(default = "empty_metadata")]
    metadata: Value,
}

fn empty_metadata() -> Value {
    Value::Object(Default::default())
}

/// Query string for `GET /incidents`. The floor is parsed by hand so a bad
/// value gets the same error body as any other caller error.
#[derive(Deserialize)]
struct ListParams {
    min_severity: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct OrphanResponse {
    orphans: Vec<String>,
}

pub fn router(collector: Arc<Collector>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/incidents", get(list_handler).post(capture_handler))
        .route("/incidents/{incident_id}", get(get_handler))
        .route("/chain/verify", get(verify_handler))
        .route("/chain/head", get(head_handler))
        .route("/evidence/orphans", get(orphans_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(collector)
}

pub async fn run_server(collector: Arc<Collector>) -> anyhow::Result<()> {
    let addr = collector.config().bind_addr.clone();
    let app = router(collector);

    info!("🚀 Evidence collector listening at http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn capture_handler(
    State(collector): State<Arc<Collector>>,
    Json(payload): Json<CaptureRequest>,
) -> Result<(StatusCode, Json<CaptureReceipt>), ServerError> {
    let severity: Severity = payload.severity.parse()?;
    let receipt = collector
        .capture_incident(&payload.incident_type, &payload.application, severity, payload.metadata)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn list_handler(
    State(collector): State<Arc<Collector>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<ChainEntry>>, ServerError> {
    let min_severity = params.min_severity.map(|s| s.parse::<Severity>()).transpose()?;
    let query = IncidentQuery { min_severity, limit: params.limit };
    Ok(Json(collector.list_incidents(&query).await?))
}

async fn get_handler(
    State(collector): State<Arc<Collector>>,
    Path(incident_id): Path<String>,
) -> Result<Json<IncidentDetail>, ServerError> {
    Ok(Json(collector.get_incident(&incident_id).await?))
}

// A broken chain is still a 200; only an unreadable ledger is an error.
async fn verify_handler(State(collector): State<Arc<Collector>>) -> Result<Json<ChainVerification>, ServerError> {
    Ok(Json(collector.verify_chain().await?))
}

async fn head_handler(State(collector): State<Arc<Collector>>) -> Result<Json<ChainHead>, ServerError> {
    Ok(Json(collector.head().await?))
}

async fn orphans_handler(State(collector): State<Arc<Collector>>) -> Result<Json<OrphanResponse>, ServerError> {
    let orphans = collector.orphaned_evidence().await?;
    Ok(Json(OrphanResponse { orphans }))
}
