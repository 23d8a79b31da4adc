use crate::validation::{ChatMessage, ChatModel, ChatRequest};
use serde::Serialize;

/// 上游 chat/completions 请求体。
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest<'a> {
    pub model: ChatModel,
    pub messages: &'a [ChatMessage],
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

impl<'a> UpstreamRequest<'a> {
    pub fn from_chat(req: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stream,
        }
    }
}
