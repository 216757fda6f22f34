//! JSON HTTP API for flow-report ingestion and queries.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use meterlog_core::{
    batch_number_from_json, identifier_from_json, parse_numeric_text, BatchSubmission,
    MeasurementField, Measurements, NewReport, ReportFilter,
};
use meterlog_historian::{parse_timestamp, parse_timestamp_str};
use meterlog_ingest::{IngestError, IngestService, IngestSummary};
use meterlog_storage::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "meterlog-web";

const MISSING_TOKEN: &str = "No Bearer Token Provided";
const INVALID_TOKEN: &str = "Not a valid key";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    MalformedPayload(String),
    #[error("Missing fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("DATABASE_URL not set (database not configured)")]
    StoreUnavailable,
    #[error("report already exists for (meter, ship, batch_number, timestamp)")]
    DuplicateReport,
    #[error("{message}")]
    StoreOperationFailed {
        message: String,
        details: Option<String>,
    },
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MalformedPayload(_)
            | ApiError::MissingFields(_)
            | ApiError::DuplicateReport => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::StoreUnavailable | ApiError::StoreOperationFailed { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable => ApiError::StoreUnavailable,
            StoreError::DuplicateKey => ApiError::DuplicateReport,
            other => ApiError::StoreOperationFailed {
                details: other.diagnostic(),
                message: other.to_string(),
            },
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Store(store) => store.into(),
            IngestError::ChunkFailed { ref source, .. } => ApiError::StoreOperationFailed {
                details: source.diagnostic(),
                message: err.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(%status, error = %self, "request failed");
        }
        let mut body = json!({ "success": false, "error": self.to_string() });
        if let ApiError::StoreOperationFailed {
            details: Some(details),
            ..
        } = &self
        {
            body["details"] = Value::String(details.clone());
        }
        (status, Json(body)).into_response()
    }
}

/// Request gate applied to every `/report-*` route.
pub trait Authenticator: Send + Sync + 'static {
    fn check(&self, headers: &HeaderMap) -> Result<(), ApiError>;
}

/// Open gate, used when no token is configured.
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn check(&self, _headers: &HeaderMap) -> Result<(), ApiError> {
        Ok(())
    }
}

/// Single shared-secret bearer token.
pub struct BearerTokenAuth {
    token: String,
}

impl BearerTokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Authenticator for BearerTokenAuth {
    fn check(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        // The auth scheme is case-insensitive (RFC 9110); the token is not.
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim_start().split_once(' '))
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("Bearer"))
            .map(|(_, token)| token.trim())
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::Unauthorized(MISSING_TOKEN))?;
        if presented == self.token {
            Ok(())
        } else {
            Err(ApiError::Unauthorized(INVALID_TOKEN))
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    /// `None` when no database is configured.
    pub ingest: Option<IngestService>,
    pub auth: Arc<dyn Authenticator>,
}

impl AppState {
    pub fn new(ingest: Option<IngestService>) -> Self {
        Self {
            ingest,
            auth: Arc::new(AllowAll),
        }
    }

    pub fn with_auth(mut self, auth: impl Authenticator) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    fn ingest(&self) -> Result<&IngestService, ApiError> {
        self.ingest.as_ref().ok_or(ApiError::StoreUnavailable)
    }
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let reports = Router::new()
        .route("/report-ingest", post(ingest_single_handler))
        .route("/report-query", get(query_handler))
        .route("/report-ingest-batch", post(ingest_batch_handler))
        .route("/report-query-batch", get(query_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));
    Router::new()
        .merge(reports)
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn require_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    state.auth.check(request.headers())?;
    Ok(next.run(request).await)
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let Some(ingest) = &state.ingest else {
        return Ok(Json(json!({ "success": true, "store": "unconfigured" })));
    };
    ingest.store().ping().await?;
    Ok(Json(json!({ "success": true, "store": "ok" })))
}

async fn ingest_single_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let ingest = state.ingest()?;
    let report = parse_single_report(parse_json(&body)?)?;
    let id = ingest.ingest_single(&report).await?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "id": id }))))
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    success: bool,
    #[serde(flatten)]
    summary: IngestSummary,
}

async fn ingest_batch_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<BatchResponse>), ApiError> {
    let ingest = state.ingest()?;
    let submission = parse_batch(parse_json(&body)?)?;
    let summary = ingest.ingest_batch(&submission).await?;
    Ok((
        StatusCode::CREATED,
        Json(BatchResponse {
            success: true,
            summary,
        }),
    ))
}

/// Raw query-string filters; blanks are treated as absent.
#[derive(Debug, Default, Deserialize)]
pub struct ReportQueryParams {
    pub meter_id: Option<String>,
    pub ship_name: Option<String>,
    pub batch_number: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl ReportQueryParams {
    pub fn into_filter(self) -> Result<ReportFilter, ApiError> {
        let batch_number = match non_blank(self.batch_number) {
            Some(raw) => Some(
                raw.parse::<i64>()
                    .map_err(|_| ApiError::MalformedPayload(format!("invalid batch_number: {raw}")))?,
            ),
            None => None,
        };
        Ok(ReportFilter {
            meter_id: non_blank(self.meter_id),
            ship_name: non_blank(self.ship_name),
            batch_number,
            from: time_bound("from", self.from)?,
            to: time_bound("to", self.to)?,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn time_bound(name: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>, ApiError> {
    match non_blank(value) {
        Some(raw) => parse_timestamp_str(&raw)
            .map(Some)
            .ok_or_else(|| ApiError::MalformedPayload(format!("invalid {name}: {raw}"))),
        None => Ok(None),
    }
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<ReportQueryParams>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(params) =
        params.map_err(|rejection| ApiError::MalformedPayload(rejection.body_text()))?;
    let ingest = state.ingest()?;
    let filter = params.into_filter()?;
    let rows = ingest.store().query_reports(&filter).await?;
    Ok(Json(json!({ "success": true, "data": rows })))
}

fn parse_json(body: &[u8]) -> Result<Value, ApiError> {
    serde_json::from_slice(body).map_err(|_| ApiError::MalformedPayload("Invalid JSON payload".into()))
}

fn as_object(value: &Value) -> Result<&Map<String, Value>, ApiError> {
    value
        .as_object()
        .ok_or_else(|| ApiError::MalformedPayload("payload must be a JSON object".into()))
}

/// Identifier fields that are absent, not string/number, or blank after trimming.
fn missing_identifiers(object: &Map<String, Value>) -> Vec<String> {
    ["meter_id", "ship_name"]
        .into_iter()
        .filter(|name| object.get(*name).and_then(identifier_from_json).is_none())
        .map(String::from)
        .collect()
}

fn batch_number(object: &Map<String, Value>) -> Result<Option<i64>, ApiError> {
    match object.get("batch_number") {
        Some(value) => {
            batch_number_from_json(value).map_err(|err| ApiError::MalformedPayload(err.to_string()))
        }
        None => Ok(None),
    }
}

/// Validate a single-report body and coerce it into an insertable report.
pub fn parse_single_report(payload: Value) -> Result<NewReport, ApiError> {
    let object = as_object(&payload)?;

    let mut missing = missing_identifiers(object);
    missing.extend(
        std::iter::once("timestamp")
            .chain(MeasurementField::ALL.iter().map(|f| f.as_str()))
            .filter(|name| !object.contains_key(*name))
            .map(String::from),
    );
    if !missing.is_empty() {
        return Err(ApiError::MissingFields(missing));
    }

    let timestamp = object
        .get("timestamp")
        .and_then(parse_timestamp)
        .ok_or_else(|| ApiError::MalformedPayload("invalid timestamp".into()))?;

    let mut measurements = Measurements::default();
    let mut invalid = Vec::new();
    for field in MeasurementField::ALL {
        match object.get(field.as_str()).map(coerce_measurement) {
            Some(Ok(value)) => measurements.set(field, value),
            _ => invalid.push(field.as_str()),
        }
    }
    if !invalid.is_empty() {
        return Err(ApiError::MalformedPayload(format!(
            "Invalid numeric fields: {}",
            invalid.join(", ")
        )));
    }

    Ok(NewReport {
        meter: object.get("meter_id").and_then(identifier_from_json).unwrap_or_default(),
        ship: object.get("ship_name").and_then(identifier_from_json).unwrap_or_default(),
        batch_number: batch_number(object)?,
        timestamp,
        measurements,
    })
}

/// Numbers, numeric strings and null are accepted; blank strings are null.
fn coerce_measurement(value: &Value) -> Result<Option<f64>, ()> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).map(Some).ok_or(()),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => parse_numeric_text(s).map(Some).ok_or(()),
        _ => Err(()),
    }
}

/// Validate a batch body before handing it to the lenient deserializer.
pub fn parse_batch(payload: Value) -> Result<BatchSubmission, ApiError> {
    let object = as_object(&payload)?;

    let mut missing = missing_identifiers(object);
    if !object.contains_key("snapshots") {
        missing.push("snapshots".into());
    }
    if !missing.is_empty() {
        return Err(ApiError::MissingFields(missing));
    }
    if !object.get("snapshots").is_some_and(Value::is_array) {
        return Err(ApiError::MalformedPayload("snapshots must be an array".into()));
    }
    batch_number(object)?;

    serde_json::from_value(payload)
        .map_err(|err| ApiError::MalformedPayload(format!("Invalid JSON payload: {err}")))
}
