use super::AppState;
use crate::admission::AdmissionDecision;
use crate::error::AppError;
use crate::logging;
use crate::upstream::{ChunkStream, StreamEvent, UpstreamError};
use crate::util::id;
use crate::validation::ChatRequest;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::StreamExt;

pub const SERVICE_NAME: &str = "Chat Admission Gateway";

pub async fn handle_root() -> Response {
    Json(json!({
        "message": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

pub async fn handle_health() -> Response {
    Json(json!({
        "status": "healthy",
        "timestamp": now_unix_f64(),
    }))
    .into_response()
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn now_unix_f64() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

pub async fn handle_chat(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: OriginalUri,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let log_level = state.cfg.log_level();
    if log_level.client_enabled() {
        logging::client_request(log_level, method.as_str(), uri.0.path(), &body);
    }

    let request_id = id::request_id();
    let result = chat(&state, &method, &uri, &body, &request_id).await;

    let resp = match result {
        Ok(v) => (StatusCode::OK, Json(v)).into_response(),
        Err(e) => e.into_response(),
    };
    if log_level.client_enabled() {
        logging::client_response(
            log_level,
            resp.status().as_u16(),
            start.elapsed(),
            &resp_summary(&resp),
        );
    }
    resp
}

pub async fn handle_chat_stream(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: OriginalUri,
    body: Bytes,
) -> Response {
    let log_level = state.cfg.log_level();
    if log_level.client_enabled() {
        logging::client_request(log_level, method.as_str(), uri.0.path(), &body);
    }

    let request_id = id::request_id();
    let result = open_stream(&state, &method, &uri, &body, &request_id).await;

    let chunks = match result {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };

    let events = chunks.map(|ev| {
        Ok::<Event, Infallible>(match ev {
            StreamEvent::Chunk(data) => Event::default().data(data),
            StreamEvent::Error(failure) => Event::default().data(failure.payload()),
        })
    });

    let mut resp = Sse::new(events).into_response();
    let headers = resp.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    resp
}

async fn chat(
    state: &AppState,
    method: &Method,
    uri: &OriginalUri,
    body: &[u8],
    request_id: &str,
) -> Result<sonic_rs::Value, AppError> {
    let req = validate(state, method, uri, body)?;
    let identity = admit(state, &req, request_id)?;

    match state.upstream.complete(&req).await {
        Ok(v) => {
            tracing::info!(identity, request_id, model = req.model.as_str(), "聊天请求完成");
            Ok(v)
        }
        Err(e) => {
            log_upstream_error(&e, identity, request_id);
            Err(AppError::from(e))
        }
    }
}

async fn open_stream(
    state: &AppState,
    method: &Method,
    uri: &OriginalUri,
    body: &[u8],
    request_id: &str,
) -> Result<ChunkStream, AppError> {
    let req = validate(state, method, uri, body)?;
    let identity = admit(state, &req, request_id)?;

    state.upstream.stream(&req, identity).await.map_err(|e| {
        log_upstream_error(&e, identity, request_id);
        AppError::from(e)
    })
}

fn validate(
    state: &AppState,
    method: &Method,
    uri: &OriginalUri,
    body: &[u8],
) -> Result<ChatRequest, AppError> {
    state.validator.validate(body).map_err(|errors| {
        tracing::warn!(path = uri.0.path(), errors = %errors.summary(), "请求校验失败");
        AppError::validation(method.as_str(), uri.0.path(), errors)
    })
}

fn admit<'a>(
    state: &AppState,
    req: &'a ChatRequest,
    request_id: &str,
) -> Result<&'a str, AppError> {
    let identity = req.identity();
    match state.admission.admit_and_record(identity, now_unix()) {
        AdmissionDecision::Allowed => Ok(identity),
        AdmissionDecision::DeniedBlocked => {
            tracing::warn!(identity, request_id, "已封禁用户的请求被拒绝");
            Err(AppError::Blocked)
        }
        AdmissionDecision::DeniedRateLimited(kind) => {
            tracing::warn!(identity, request_id, window = kind.as_str(), "请求超出限流");
            Err(AppError::RateLimited(kind))
        }
    }
}

fn log_upstream_error(e: &UpstreamError, identity: &str, request_id: &str) {
    match e {
        UpstreamError::Misconfigured => {
            tracing::error!(identity, request_id, "{e}");
        }
        UpstreamError::Http { status, .. } => {
            tracing::warn!(identity, request_id, status, "上游返回错误");
        }
        UpstreamError::Unreachable(source) => {
            tracing::error!(
                identity,
                request_id,
                timeout = e.is_timeout(),
                error = %source,
                "上游不可达"
            );
        }
        UpstreamError::Decode(source) => {
            tracing::error!(identity, request_id, error = %source, "上游响应解析失败");
        }
    }
}

#[derive(Serialize)]
struct ResponseSummary<'a> {
    status: u16,
    content_type: &'a str,
}

/// 响应体已交给 axum，日志里只记录状态与类型。
fn resp_summary(resp: &Response) -> Vec<u8> {
    let summary = ResponseSummary {
        status: resp.status().as_u16(),
        content_type: resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-"),
    };
    sonic_rs::to_vec(&summary).unwrap_or_default()
}
