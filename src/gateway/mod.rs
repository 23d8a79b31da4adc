//! HTTP 入口：路由、共享状态与各端点处理函数。

pub mod admin;
pub mod handler;

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::upstream::UpstreamClient;
use crate::usage::{Limits, MemoryUsageStore};
use crate::validation::RequestValidator;
use axum::Router;
use axum::routing::{delete, get, post};
use std::sync::Arc;

/// 各路由共享的网关状态。
#[derive(Debug, Clone)]
pub struct AppState {
    pub cfg: Config,
    pub admission: AdmissionController,
    pub validator: RequestValidator,
    pub upstream: UpstreamClient,
}

impl AppState {
    pub fn new(cfg: Config) -> anyhow::Result<Self> {
        let store = Arc::new(MemoryUsageStore::new(Limits::from_config(&cfg)));
        let upstream = UpstreamClient::new(&cfg)?;
        if !upstream.is_configured() {
            tracing::warn!("OPENAI_API_KEY 未设置，所有聊天请求将返回 500");
        }
        Ok(Self {
            admission: AdmissionController::new(store),
            validator: RequestValidator::from_config(&cfg),
            upstream,
            cfg,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handler::handle_root))
        .route("/health", get(handler::handle_health))
        .route("/usage/{identity}", get(admin::handle_usage))
        .route("/chat", post(handler::handle_chat))
        .route("/chat/stream", post(handler::handle_chat_stream))
        .route("/admin/block-user/{identity}", post(admin::handle_block))
        .route("/admin/unblock-user/{identity}", delete(admin::handle_unblock))
        .route("/admin/reset-usage/{identity}", delete(admin::handle_reset))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    pub fn app(cfg: Config) -> Router {
        router(Arc::new(AppState::new(cfg).unwrap()))
    }

    /// 启动一个本地模拟上游，返回其 base URL。
    pub async fn mock_upstream(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/v1")
    }

    pub fn config(base_url: String, api_key: &str) -> Config {
        Config {
            base_url,
            api_key: api_key.to_string(),
            timeout_ms: 5_000,
            ..Config::default()
        }
    }

    pub async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<&str>,
    ) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let mut req = Request::builder().method(method).uri(uri);
        if body.is_some() {
            req = req.header("content-type", "application/json");
        }
        let req = req
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, headers, bytes.to_vec())
    }

    pub fn json(bytes: &[u8]) -> serde_json::Value {
        serde_json::from_slice(bytes).unwrap()
    }
}
