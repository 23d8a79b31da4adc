use serde::Serialize;

pub const MAX_MESSAGES: usize = 50;
pub const MAX_CONTENT_CHARS: usize = 10_000;
pub const MAX_USER_ID_CHARS: usize = 100;
pub const MAX_TOKENS_LIMIT: u32 = 4096;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

pub const ROLE_PATTERN: &str = "^(system|user|assistant)$";
pub const MODEL_PATTERN: &str = "^(gpt-4o|gpt-4o-mini|gpt-3.5-turbo)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ChatModel {
    #[serde(rename = "gpt-4o")]
    Gpt4o,
    #[default]
    #[serde(rename = "gpt-4o-mini")]
    Gpt4oMini,
    #[serde(rename = "gpt-3.5-turbo")]
    Gpt35Turbo,
}

impl ChatModel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gpt-4o" => Some(Self::Gpt4o),
            "gpt-4o-mini" => Some(Self::Gpt4oMini),
            "gpt-3.5-turbo" => Some(Self::Gpt35Turbo),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gpt4o => "gpt-4o",
            Self::Gpt4oMini => "gpt-4o-mini",
            Self::Gpt35Turbo => "gpt-3.5-turbo",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// 通过校验的聊天请求。
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: ChatModel,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub stream: bool,
    pub user_id: Option<String>,
}

impl ChatRequest {
    pub fn identity(&self) -> &str {
        crate::usage::resolve_identity(self.user_id.as_deref())
    }
}

/// 温度闭区间（按部署配置）。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureBounds {
    pub min: f64,
    pub max: f64,
}

impl TemperatureBounds {
    pub fn contains(&self, t: f64) -> bool {
        t >= self.min && t <= self.max
    }

    pub fn hint(&self) -> String {
        format!(
            "Temperature must be between {} and {}.",
            format_bound(self.min),
            format_bound(self.max)
        )
    }
}

/// 浮点边界至少保留一位小数：`1.0` 而非 `1`。
pub fn format_bound(v: f64) -> String {
    format!("{v:?}")
}
