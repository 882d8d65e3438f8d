//! JSON HTTP API over [JobsiteService].
//!
//! Contractor-facing routes live under `/api`; the routes under `/client` are reached from the
//! link emailed with an estimate and are authorized only by its share token.
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::{future::Future, net::SocketAddr, sync::Arc};
use tower_http::trace::TraceLayer;

use crate::{
    collection::Collection,
    commands::{Op, OpPayload, OpResult},
    error::JobsiteError,
    estimate::{ClientView, Estimate},
    properties::DocId,
    service::JobsiteService,
};

type ApiResult<T> = Result<Json<T>, JobsiteError>;

impl IntoResponse for JobsiteError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("[http] {self}");
        } else {
            tracing::debug!("[http] {status}: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct AcceptBody {
    pub token: String,
    pub signer: String,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectBody {
    pub token: String,
    #[serde(default)]
    pub reason: Option<String>,
}

fn doc_id(raw: &str) -> Result<DocId, JobsiteError> {
    DocId::try_from(raw)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn execute_op(
    State(service): State<Arc<JobsiteService>>,
    Json(payload): Json<OpPayload>,
) -> ApiResult<OpResult> {
    Ok(Json(service.execute(payload.op).await?))
}

async fn list_collections(State(service): State<Arc<JobsiteService>>) -> ApiResult<Vec<Collection>> {
    Ok(Json(service.list_collections().await?))
}

async fn get_estimate(
    State(service): State<Arc<JobsiteService>>,
    Path(id): Path<String>,
) -> ApiResult<Estimate> {
    Ok(Json(service.load_estimate(&doc_id(&id)?).await?))
}

fn expect_client_view(result: OpResult) -> Result<Json<ClientView>, JobsiteError> {
    match result {
        OpResult::ClientView(view) => Ok(Json(view)),
        other => Err(JobsiteError::Custom(format!(
            "expected a client view, got {other}"
        ))),
    }
}

async fn client_view(
    State(service): State<Arc<JobsiteService>>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<ClientView> {
    let op = Op::ViewEstimate {
        estimate_id: doc_id(&id)?,
        token: query.token,
    };
    expect_client_view(service.execute(op).await?)
}

async fn client_accept(
    State(service): State<Arc<JobsiteService>>,
    Path(id): Path<String>,
    Json(body): Json<AcceptBody>,
) -> ApiResult<ClientView> {
    let op = Op::AcceptEstimate {
        estimate_id: doc_id(&id)?,
        token: body.token,
        signer: body.signer,
        comment: body.comment,
    };
    expect_client_view(service.execute(op).await?)
}

async fn client_reject(
    State(service): State<Arc<JobsiteService>>,
    Path(id): Path<String>,
    Json(body): Json<RejectBody>,
) -> ApiResult<ClientView> {
    let op = Op::RejectEstimate {
        estimate_id: doc_id(&id)?,
        token: body.token,
        reason: body.reason,
    };
    expect_client_view(service.execute(op).await?)
}

pub fn router(service: Arc<JobsiteService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/op", post(execute_op))
        .route("/api/collections", get(list_collections))
        .route("/api/estimates/:id", get(get_estimate))
        .route("/client/estimates/:id", get(client_view))
        .route("/client/estimates/:id/accept", post(client_accept))
        .route("/client/estimates/:id/reject", post(client_reject))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Serve the API on `addr` until `shutdown_signal` resolves.
pub async fn serve(
    service: Arc<JobsiteService>,
    addr: SocketAddr,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), JobsiteError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Jobsite API listening on http://{}", addr);
    axum::serve(listener, router(service).into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;
    tracing::info!("Jobsite API shut down");
    Ok(())
}
