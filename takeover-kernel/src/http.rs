/**
 * ADMIN API - HTTP surface of the takeover kernel
 *
 * ROLE : platform registration / update / deregistration, on-demand sync and
 * take-over, topology listings and system health, for admin tooling.
 *
 * CONVENTIONS :
 * - `x-api-key` header required on every route except /health
 * - `{type}` path segment is the platform type (`a` | `b`, any case)
 * - mutating routes answer `{"action": "success", "result": ...}`, every
 *   failure answers `{"action": "failed", "errormsg": "..."}`
 */

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

use crate::error::TakeoverError;
use crate::health::SystemHealth;
use crate::models::{NewPlatform, PlatformType, PlatformUpdate, PlatformView, Template};
use crate::registry::{PlatformRegistry, PlatformScoped};
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    /// Requests are refused when unset.
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>, api_key: Option<String>) -> Self {
        Self { scheduler, api_key: api_key.filter(|k| !k.is_empty()) }
    }

    fn registry(&self, raw_type: &str) -> Result<&Arc<PlatformRegistry>, ApiError> {
        let platform_type: PlatformType = raw_type.parse()?;
        Ok(self.scheduler.registry(platform_type))
    }
}

/// Failure rendered as `{"action": "failed", "errormsg": ...}`.
#[derive(Debug)]
pub struct ApiError(TakeoverError);

impl From<TakeoverError> for ApiError {
    fn from(e: TakeoverError) -> Self {
        ApiError(e)
    }
}

pub fn status_for(e: &TakeoverError) -> StatusCode {
    match e {
        TakeoverError::PlatformNotFound(_) => StatusCode::NOT_FOUND,
        TakeoverError::SyncInProgress | TakeoverError::DeletionInProgress | TakeoverError::DuplicatePlatform { .. } => {
            StatusCode::CONFLICT
        }
        TakeoverError::InvalidPlatformType(_) | TakeoverError::InvalidCommand(_) | TakeoverError::Serialization(_) => {
            StatusCode::BAD_REQUEST
        }
        TakeoverError::LoginFailed(_) | TakeoverError::ComputeServiceActivationFailed { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        TakeoverError::RemoteRequest(_) | TakeoverError::RemoteConnect(_) => StatusCode::BAD_GATEWAY,
        TakeoverError::ImageNotFound(_) => StatusCode::PRECONDITION_FAILED,
        TakeoverError::Store(_) | TakeoverError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        (status, Json(json!({ "action": "failed", "errormsg": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn success<T: Serialize>(result: T) -> ApiResult<Value> {
    Ok(Json(json!({ "action": "success", "result": result })))
}

/// Parses a required JSON body. Failures render as a `failed` envelope.
fn json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    Ok(serde_json::from_slice(body).map_err(TakeoverError::from)?)
}

/// Parses an optional JSON body; an empty body yields the default.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    json_body(body)
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref() else {
        warn!("TAKEOVER_API_KEY not set, admin API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(system_health))
        .route("/platforms/{type}", get(list_platforms).post(register_platform))
        .route("/platforms/{type}/datacenters", get(list_datacenters))
        .route("/platforms/{type}/clusters", get(list_clusters))
        .route("/platforms/{type}/hosts", get(list_hosts))
        .route("/platforms/{type}/{uuid}", put(update_platform).delete(deregister_platform))
        .route("/platforms/{type}/{uuid}/sync", post(sync_platform))
        .route("/platforms/{type}/{uuid}/takeover", post(take_over))
        .route("/platforms/{type}/{uuid}/templates", get(list_templates))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

async fn system_health(State(app): State<AppState>) -> Json<SystemHealth> {
    Json(app.scheduler.system_health().await)
}

async fn list_platforms(State(app): State<AppState>, Path(kind): Path<String>) -> ApiResult<Vec<PlatformView>> {
    Ok(Json(app.registry(&kind)?.list_instances().await?))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(flatten)]
    platform: NewPlatform,
    #[serde(default)]
    commands: Vec<String>,
    #[serde(default)]
    rollback_commands: Vec<String>,
}

async fn register_platform(
    State(app): State<AppState>,
    Path(kind): Path<String>,
    body: Bytes,
) -> ApiResult<Value> {
    let registry = app.registry(&kind)?;
    let body: RegisterRequest = json_body(&body)?;
    let instance = registry.register(body.platform, &body.commands, &body.rollback_commands).await?;
    success(instance)
}

async fn update_platform(
    State(app): State<AppState>,
    Path((kind, uuid)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Value> {
    let registry = app.registry(&kind)?;
    let update: PlatformUpdate = json_body(&body)?;
    let instance = registry.update_instance(&uuid, update).await?;
    success(instance)
}

#[derive(Debug, Default, Deserialize)]
struct DeregisterRequest {
    #[serde(default)]
    commands: Vec<String>,
}

async fn deregister_platform(
    State(app): State<AppState>,
    Path((kind, uuid)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Value> {
    let request: DeregisterRequest = optional_body(&body)?;
    app.registry(&kind)?.deregister(&uuid, &request.commands).await?;
    success(json!({ "uuid": uuid }))
}

#[derive(Debug, Default, Deserialize)]
struct SyncRequest {
    #[serde(default)]
    only_these_ids: BTreeSet<String>,
}

async fn sync_platform(
    State(app): State<AppState>,
    Path((kind, uuid)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Value> {
    let request: SyncRequest = optional_body(&body)?;
    let report = app.registry(&kind)?.sync_instance(&uuid, &request.only_these_ids).await?;
    success(report)
}

#[derive(Debug, Deserialize)]
struct TakeoverRequest {
    vm_ids: BTreeSet<String>,
}

async fn take_over(
    State(app): State<AppState>,
    Path((kind, uuid)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<Value> {
    let registry = app.registry(&kind)?;
    let request: TakeoverRequest = json_body(&body)?;
    let report = registry.take_over(&uuid, &request.vm_ids).await?;
    success(report)
}

async fn list_templates(
    State(app): State<AppState>,
    Path((kind, uuid)): Path<(String, String)>,
) -> ApiResult<Vec<Template>> {
    Ok(Json(app.registry(&kind)?.templates(&uuid).await?))
}

async fn list_datacenters(
    State(app): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Vec<PlatformScoped<crate::models::Datacenter>>> {
    Ok(Json(app.registry(&kind)?.datacenters().await?))
}

async fn list_clusters(
    State(app): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Vec<PlatformScoped<crate::models::Cluster>>> {
    Ok(Json(app.registry(&kind)?.clusters().await?))
}

async fn list_hosts(
    State(app): State<AppState>,
    Path(kind): Path<String>,
) -> ApiResult<Vec<PlatformScoped<crate::models::HypervisorHost>>> {
    Ok(Json(app.registry(&kind)?.hosts().await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_guard_maps_to_conflict() {
        assert_eq!(status_for(&TakeoverError::SyncInProgress), StatusCode::CONFLICT);
        assert_eq!(status_for(&TakeoverError::PlatformNotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&TakeoverError::InvalidPlatformType("c".into())), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn empty_body_yields_defaults() {
        let request: SyncRequest = optional_body(&Bytes::from_static(b"")).unwrap();
        assert!(request.only_these_ids.is_empty());

        let request: SyncRequest = optional_body(&Bytes::from_static(br#"{"only_these_ids":["vm-1"]}"#)).unwrap();
        assert!(request.only_these_ids.contains("vm-1"));
    }

    #[test]
    fn malformed_body_is_rejected() {
        let err = optional_body::<DeregisterRequest>(&Bytes::from_static(b"{not json")).unwrap_err();
        assert!(matches!(err.0, TakeoverError::Serialization(_)));
    }

    #[test]
    fn required_body_must_be_present_and_complete() {
        let err = json_body::<TakeoverRequest>(&Bytes::new()).unwrap_err();
        assert!(matches!(err.0, TakeoverError::Serialization(_)));
        let err = json_body::<TakeoverRequest>(&Bytes::from_static(b"{}")).unwrap_err();
        assert_eq!(status_for(&err.0), StatusCode::BAD_REQUEST);

        let request: TakeoverRequest = json_body(&Bytes::from_static(br#"{"vm_ids":["v1"]}"#)).unwrap();
        assert!(request.vm_ids.contains("v1"));
    }
}
