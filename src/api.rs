//! JSON-over-HTTP boundary
//!
//! Every response carries a `success` flag. Failures are
//! `{success: false, error, code}` with a status derived from the error.

use crate::config::ProviderDefaults;
use crate::dispatch::{ForwardEmail, OutgoingEmail};
use crate::error::Error;
use crate::folder::Folder;
use crate::gateway::{ConnectRequest, Gateway};
use crate::message::MessageView;
use crate::model::MessageSummary;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, warn};

type AppState = Arc<Gateway>;

/// Build the router with every endpoint under `/api`.
#[must_use]
pub fn router(gateway: AppState) -> Router {
    Router::new()
        .route("/api/connect", post(connect))
        .route("/api/folders", get(folders))
        .route("/api/emails", get(emails))
        .route("/api/email/:id", get(email))
        .route("/api/send-email", post(send_email))
        .route("/api/forward-email", post(forward_email))
        .route("/api/logout", post(logout))
        .route("/api/health", get(health))
        .route("/api/config", get(config))
        .with_state(gateway)
}

/// Serve the API until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if accepting connections fails.
pub async fn serve<F>(listener: TcpListener, gateway: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown)
        .await
}

/// HTTP status for a gateway error.
#[must_use]
pub const fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidSession | Error::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::FetchTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::SessionLimit(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A failed request.
#[derive(Debug)]
pub enum ApiError {
    Gateway(Error),
    /// The request body could not be read.
    BadRequest(String),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self::Gateway(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, code) = match self {
            Self::Gateway(err) => (status_for(&err), err.to_string(), err.code()),
            Self::BadRequest(reason) => (StatusCode::BAD_REQUEST, reason, "BAD_REQUEST"),
        };
        if status.is_server_error() {
            warn!(code, status = status.as_u16(), "Request failed: {error}");
        } else {
            debug!(code, status = status.as_u16(), "Request rejected: {error}");
        }
        let body = ErrorBody {
            success: false,
            error,
            code,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    session_id: Option<String>,
    folder: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SessionBody {
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendEmailBody {
    session_id: Option<String>,
    #[serde(default)]
    email: OutgoingEmail,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForwardEmailBody {
    session_id: Option<String>,
    #[serde(flatten)]
    forward: ForwardEmail,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectResponse {
    success: bool,
    session_id: String,
}

#[derive(Serialize)]
struct FoldersResponse {
    success: bool,
    folders: Vec<Folder>,
}

#[derive(Serialize)]
struct EmailsResponse {
    success: bool,
    emails: Vec<MessageSummary>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    partial: bool,
}

#[derive(Serialize)]
struct EmailResponse {
    success: bool,
    #[serde(flatten)]
    view: MessageView,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SentResponse {
    success: bool,
    message_id: String,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
}

async fn connect(
    State(gateway): State<AppState>,
    body: Result<Json<ConnectRequest>, JsonRejection>,
) -> ApiResult<ConnectResponse> {
    let Json(request) = body?;
    let session_id = gateway.connect(request).await?;
    Ok(Json(ConnectResponse {
        success: true,
        session_id,
    }))
}

async fn folders(
    State(gateway): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<FoldersResponse> {
    let folders = gateway.folders(query.session_id.as_deref()).await?;
    Ok(Json(FoldersResponse {
        success: true,
        folders,
    }))
}

async fn emails(
    State(gateway): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<EmailsResponse> {
    let listing = gateway
        .emails(query.session_id.as_deref(), query.folder.as_deref())
        .await?;
    Ok(Json(EmailsResponse {
        success: true,
        emails: listing.messages,
        partial: listing.partial,
    }))
}

async fn email(
    State(gateway): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<EmailResponse> {
    let view = gateway
        .email(query.session_id.as_deref(), &id, query.folder.as_deref())
        .await?;
    Ok(Json(EmailResponse {
        success: true,
        view,
    }))
}

async fn send_email(
    State(gateway): State<AppState>,
    body: Result<Json<SendEmailBody>, JsonRejection>,
) -> ApiResult<SentResponse> {
    let Json(body) = body?;
    let message_id = gateway
        .send(body.session_id.as_deref(), &body.email)
        .await?;
    Ok(Json(SentResponse {
        success: true,
        message_id,
    }))
}

async fn forward_email(
    State(gateway): State<AppState>,
    body: Result<Json<ForwardEmailBody>, JsonRejection>,
) -> ApiResult<SentResponse> {
    let Json(body) = body?;
    let message_id = gateway
        .forward(body.session_id.as_deref(), &body.forward)
        .await?;
    Ok(Json(SentResponse {
        success: true,
        message_id,
    }))
}

async fn logout(
    State(gateway): State<AppState>,
    body: Option<Json<SessionBody>>,
) -> Json<SuccessResponse> {
    let session_id = body.and_then(|Json(body)| body.session_id);
    gateway.logout(session_id.as_deref());
    Json(SuccessResponse { success: true })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
    })
}

async fn config(State(gateway): State<AppState>) -> Json<BTreeMap<String, ProviderDefaults>> {
    Json(gateway.config().providers.clone())
}
