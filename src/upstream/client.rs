use crate::config::Config;
use crate::logging::{self, LogLevel};
use crate::upstream::stream::{ChunkStream, spawn_reader};
use crate::upstream::types::UpstreamRequest;
use crate::validation::ChatRequest;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const UNREACHABLE_MESSAGE: &str = "upstream unreachable";
pub const MISCONFIGURED_MESSAGE: &str = "Service misconfigured: OPENAI_API_KEY is not set";

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// 缺少上游凭据：运维问题，不是客户端错误。
    #[error("{}", MISCONFIGURED_MESSAGE)]
    Misconfigured,

    /// 上游返回非 2xx：原样透传状态码与响应体。
    #[error("上游 API 错误 {status}: {body}")]
    Http { status: u16, body: String },

    #[error("{}", UNREACHABLE_MESSAGE)]
    Unreachable(#[source] reqwest::Error),

    #[error("上游响应解析失败: {0}")]
    Decode(#[from] sonic_rs::Error),
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Unreachable(e) if e.is_timeout())
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        Self::Unreachable(e)
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    http_stream: reqwest::Client,
    url: String,
    api_key: String,
    log_level: LogLevel,
}

impl UpstreamClient {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let mut http_builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        // 流式请求不设总超时：只限制建连与单次读取，长回答不会被整体掐断。
        let mut stream_builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if cfg.timeout_ms > 0 {
            let t = Duration::from_millis(cfg.timeout_ms);
            http_builder = http_builder.timeout(t);
            stream_builder = stream_builder.connect_timeout(t).read_timeout(t);
        }

        if !cfg.proxy.trim().is_empty() {
            // Proxy 不保证可 Clone，这里各自构建一次。
            http_builder = http_builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
            stream_builder = stream_builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: http_builder.build()?,
            http_stream: stream_builder.build()?,
            url: cfg.chat_completions_url(),
            api_key: cfg.api_key.trim().to_string(),
            log_level: cfg.log_level(),
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn build_headers(&self, stream: bool) -> Result<HeaderMap, UpstreamError> {
        if self.api_key.is_empty() {
            return Err(UpstreamError::Misconfigured);
        }
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| UpstreamError::Misconfigured)?;

        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, auth);
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if stream {
            h.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        Ok(h)
    }

    fn log_request(&self, headers: &HeaderMap, body: &[u8]) {
        if self.log_level.upstream_enabled() {
            logging::upstream_request(self.log_level, &self.url, headers, body);
        }
    }

    fn log_response(&self, status: u16, started: Instant, body: &[u8]) {
        if self.log_level.upstream_enabled() {
            logging::upstream_response(self.log_level, status, started.elapsed(), body);
        }
    }

    /// 非流式调用：返回上游 JSON 响应体（不做任何改写）。
    pub async fn complete(&self, req: &ChatRequest) -> Result<sonic_rs::Value, UpstreamError> {
        let headers = self.build_headers(false)?;
        let body = sonic_rs::to_vec(&UpstreamRequest::from_chat(req, false))?;
        self.log_request(&headers, &body);

        let started = Instant::now();
        let resp = self
            .http
            .post(&self.url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        self.log_response(status.as_u16(), started, &bytes);

        if !status.is_success() {
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(sonic_rs::from_slice::<sonic_rs::Value>(&bytes)?)
    }

    /// 流式调用：建连并确认上游状态后，交由后台任务逐块转发。
    ///
    /// 非 2xx 在任何事件发出之前以 `UpstreamError::Http` 返回。
    pub async fn stream(
        &self,
        req: &ChatRequest,
        identity: &str,
    ) -> Result<ChunkStream, UpstreamError> {
        let headers = self.build_headers(true)?;
        let body = sonic_rs::to_vec(&UpstreamRequest::from_chat(req, true))?;
        self.log_request(&headers, &body);

        let started = Instant::now();
        let resp = self
            .http_stream
            .post(&self.url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await?;
            self.log_response(status.as_u16(), started, &bytes);
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        Ok(spawn_reader(resp, self.log_level, identity.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::stream::StreamEvent;
    use crate::validation::{ChatMessage, ChatModel, Role};
    use axum::Router;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use tokio_stream::StreamExt;

    fn chat() -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage {
                role: Role::User,
                content: "hi".to_string(),
            }],
            model: ChatModel::Gpt4oMini,
            temperature: 0.7,
            max_tokens: None,
            stream: false,
            user_id: None,
        }
    }

    async fn mock_upstream(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/v1")
    }

    fn client(base_url: String, api_key: &str) -> UpstreamClient {
        UpstreamClient::new(&Config {
            base_url,
            api_key: api_key.to_string(),
            timeout_ms: 5_000,
            ..Config::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn complete_returns_body_verbatim_and_sends_wire_format() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|headers: axum::http::HeaderMap, body: String| async move {
                assert_eq!(headers["authorization"], "Bearer sk-test");
                let v: serde_json::Value = serde_json::from_str(&body).unwrap();
                assert_eq!(v["stream"], false);
                assert_eq!(v["model"], "gpt-4o-mini");
                assert!(v.get("max_tokens").is_none());
                (
                    [(axum::http::header::CONTENT_TYPE, "application/json")],
                    r#"{"id":"chatcmpl-1","choices":[{"message":{"content":"hello"}}]}"#,
                )
            }),
        );
        let c = client(mock_upstream(app).await, "sk-test");

        let out = c.complete(&chat()).await.unwrap();
        assert_eq!(
            sonic_rs::to_string(&out).unwrap(),
            r#"{"id":"chatcmpl-1","choices":[{"message":{"content":"hello"}}]}"#
        );
    }

    #[tokio::test]
    async fn upstream_http_error_keeps_status_and_body() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    r#"{"error":{"message":"bad key"}}"#,
                )
                    .into_response()
            }),
        );
        let c = client(mock_upstream(app).await, "sk-test");

        match c.complete(&chat()).await {
            Err(UpstreamError::Http { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, r#"{"error":{"message":"bad key"}}"#);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            c.stream(&chat(), "u1").await,
            Err(UpstreamError::Http { status: 401, .. })
        ));
    }

    #[tokio::test]
    async fn missing_key_is_misconfigured_without_calling_upstream() {
        let c = client("http://127.0.0.1:9/v1".to_string(), "  ");
        assert!(!c.is_configured());
        assert!(matches!(
            c.complete(&chat()).await,
            Err(UpstreamError::Misconfigured)
        ));
        assert!(matches!(
            c.stream(&chat(), "u1").await,
            Err(UpstreamError::Misconfigured)
        ));
    }

    #[tokio::test]
    async fn connection_failure_is_unreachable() {
        // 先占用再释放一个端口，确保无人监听。
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let c = client(format!("http://{addr}/v1"), "sk-test");
        let err = c.complete(&chat()).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Unreachable(_)));
        assert_eq!(err.to_string(), "upstream unreachable");
    }

    #[tokio::test]
    async fn slow_upstream_hits_configured_timeout() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                "{}"
            }),
        );
        let c = UpstreamClient::new(&Config {
            base_url: mock_upstream(app).await,
            api_key: "sk-test".to_string(),
            timeout_ms: 200,
            ..Config::default()
        })
        .unwrap();

        let err = c.complete(&chat()).await.unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err:?}");
        assert_eq!(err.to_string(), UNREACHABLE_MESSAGE);
    }

    #[tokio::test]
    async fn stream_forwards_two_chunks_then_ends() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|body: String| async move {
                assert!(body.contains(r#""stream":true"#));
                (
                    [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                    "data: {\"a\":1}\n\ndata: {\"b\":2}\n\ndata: [DONE]\n\n",
                )
            }),
        );
        let c = client(mock_upstream(app).await, "sk-test");

        let events: Vec<StreamEvent> = c.stream(&chat(), "u1").await.unwrap().collect().await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk(r#"{"a":1}"#.to_string()),
                StreamEvent::Chunk(r#"{"b":2}"#.to_string()),
            ]
        );
    }
}
