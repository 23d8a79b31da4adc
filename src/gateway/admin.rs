use super::AppState;
use super::handler::now_unix;
use crate::usage::UsageSnapshot;
use axum::Json;
use axum::extract::{Path, State};
use serde::Serialize;
use std::sync::Arc;

// 管理端点不做鉴权，部署时应只暴露在内网。

#[derive(Debug, Serialize)]
pub struct MessageBody {
    pub message: String,
}

impl MessageBody {
    fn new(message: String) -> Json<Self> {
        Json(Self { message })
    }
}

pub async fn handle_usage(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> Json<UsageSnapshot> {
    Json(state.admission.usage(&identity, now_unix()))
}

pub async fn handle_block(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> Json<MessageBody> {
    state.admission.block(&identity);
    MessageBody::new(format!("User {identity} has been blocked"))
}

pub async fn handle_unblock(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> Json<MessageBody> {
    state.admission.unblock(&identity);
    MessageBody::new(format!("User {identity} has been unblocked"))
}

pub async fn handle_reset(
    State(state): State<Arc<AppState>>,
    Path(identity): Path<String>,
) -> Json<MessageBody> {
    state.admission.reset(&identity);
    MessageBody::new(format!("Usage statistics reset for user {identity}"))
}

#[cfg(test)]
mod tests {
    use crate::gateway::test_support::{app, config, json, send};
    use axum::http::{Method, StatusCode};

    #[tokio::test]
    async fn unknown_identity_has_zero_usage() {
        let app = app(config("http://127.0.0.1:9/v1".to_string(), "sk"));
        let (status, _, body) = send(&app, Method::GET, "/usage/nobody", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json(&body),
            serde_json::json!({
                "total_requests": 0,
                "requests_this_minute": 0,
                "requests_today": 0,
                "is_blocked": false,
            })
        );
    }

    #[tokio::test]
    async fn reset_clears_counters_and_block() {
        // 空 key：请求在上游前失败，但名额已计入。
        let app = app(config("http://127.0.0.1:9/v1".to_string(), ""));
        let body = r#"{"messages":[{"role":"user","content":"hi"}],"user_id":"r1"}"#;
        for _ in 0..3 {
            send(&app, Method::POST, "/chat", Some(body)).await;
        }
        send(&app, Method::POST, "/admin/block-user/r1", None).await;

        let (_, _, before) = send(&app, Method::GET, "/usage/r1", None).await;
        assert_eq!(json(&before)["total_requests"], 3);

        let (status, _, msg) = send(&app, Method::DELETE, "/admin/reset-usage/r1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&msg)["message"], "Usage statistics reset for user r1");

        let (_, _, after) = send(&app, Method::GET, "/usage/r1", None).await;
        let v = json(&after);
        assert_eq!(v["total_requests"], 0);
        assert_eq!(v["requests_this_minute"], 0);
        assert_eq!(v["is_blocked"], false);
    }

    #[tokio::test]
    async fn admin_routes_reject_wrong_methods() {
        let app = app(config("http://127.0.0.1:9/v1".to_string(), "sk"));
        let (status, _, _) = send(&app, Method::GET, "/admin/block-user/x", None).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
