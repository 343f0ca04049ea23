//! Axum request handlers for the operator admin API.
//!
//! Handlers are thin: they parse the request, call one key service operation
//! and render the result. Every failure is rendered as an [`ErrorResponse`]
//! with the status mapped from [`ServiceError`].

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::protocol::{
    CreateTmkRequest, ErrorResponse, ExportTmkRequest, ExportTmkResponse, HealthResponse,
    JobResponse, RotateTmkRequest, RotateTmkResponse, TmkResponse, TmkStatusResponse,
};
use common::ServiceError;
use keyring::KeyError;
use tracing::{error, warn};
use uuid::Uuid;

use super::state::AppState;

/// A [`ServiceError`] on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl From<KeyError> for ApiError {
    fn from(err: KeyError) -> Self {
        Self(err.into())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(ServiceError::BadRequest(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(ServiceError::BadRequest(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        } else {
            warn!(error = %self.0, "request rejected");
        }
        (status, Json(ErrorResponse::from(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// `POST /tenants/:tenant/tmk`: create the tenant's first TMK.
pub async fn create_tmk(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    body: Result<Json<CreateTmkRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TmkResponse>)> {
    let Json(req) = body?;
    let record = state
        .tmk
        .create_tmk(&tenant, &req.created_by, &state.root_key_id)
        .await?;
    Ok((StatusCode::CREATED, Json(TmkResponse::from(&record))))
}

/// `POST /tenants/:tenant/tmk/rotate`: rotate, then schedule the re-wrap job.
///
/// Responds `202 Accepted`: the rotation has committed but the re-wrap job
/// runs in the background.
pub async fn rotate_tmk(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    body: Result<Json<RotateTmkRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<RotateTmkResponse>)> {
    let Json(req) = body?;
    let (current, job) = state
        .rewrap
        .rotate_and_rewrap(&tenant, &req.rotated_by, &state.root_key_id)
        .await?;
    let body = RotateTmkResponse {
        tmk: TmkResponse::from(&current),
        job: JobResponse::from(&job),
    };
    Ok((StatusCode::ACCEPTED, Json(body)))
}

/// `GET /tenants/:tenant/tmk/status`
pub async fn tmk_status(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<Json<TmkStatusResponse>> {
    let status = state.tmk.tmk_status(&tenant).await?;
    Ok(Json(TmkStatusResponse::from(&status)))
}

/// `POST /tenants/:tenant/tmk/export`: backup of the still-wrapped active TMK.
pub async fn export_tmk(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    body: Result<Json<ExportTmkRequest>, JsonRejection>,
) -> ApiResult<Json<ExportTmkResponse>> {
    let Json(req) = body?;
    let backup = state.tmk.export_tmk(&tenant, &req.requested_by).await?;
    Ok(Json(ExportTmkResponse { backup }))
}

/// `GET /jobs/:id`
pub async fn job_status(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<JobResponse>> {
    let Path(id) = id?;
    let job = state.rewrap.job_status(id).await?;
    Ok(Json(JobResponse::from(&job)))
}

/// `POST /jobs/:id/cancel`
pub async fn cancel_job(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<JobResponse>> {
    let Path(id) = id?;
    let job = state.rewrap.cancel_job(id).await?;
    Ok(Json(JobResponse::from(&job)))
}

/// `GET /health`: liveness and readiness check.
///
/// Returns `200 OK` when the key store answers a probe query.
/// Returns `503 Service Unavailable` otherwise.
pub async fn health(State(state): State<AppState>) -> Response {
    let store_ready = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "key store probe failed");
            false
        }
    };

    let (status_code, status_str) = if store_ready {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let body = HealthResponse {
        status: status_str.into(),
        store_ready,
        cached_keys: state.tmk.cache().len().await,
        running_jobs: state.rewrap.running_jobs().await,
    };
    (status_code, Json(body)).into_response()
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}
