use serde::Serialize;

pub const SECONDS_PER_MINUTE: i64 = 60;
pub const SECONDS_PER_DAY: i64 = 86_400;

/// 未提供 user_id 时使用的身份。
pub const DEFAULT_IDENTITY: &str = "default";

/// 每个身份的请求上限（分钟桶 / 自然日桶）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub minute: u32,
    pub daily: u32,
}

impl Limits {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self {
            minute: cfg.minute_limit,
            daily: cfg.daily_limit,
        }
    }
}

/// 触发的限流窗口。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Daily,
    Minute,
}

impl LimitKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Minute => "minute",
        }
    }
}

/// 某身份在某一时刻的用量视图。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub total_requests: u64,
    pub requests_this_minute: u32,
    pub requests_today: u32,
    pub is_blocked: bool,
}

pub fn minute_index(unix_secs: i64) -> i64 {
    unix_secs.div_euclid(SECONDS_PER_MINUTE)
}

pub fn day_index(unix_secs: i64) -> i64 {
    unix_secs.div_euclid(SECONDS_PER_DAY)
}

/// 解析请求里的 user_id：缺省或空串都落到 `default`。
pub fn resolve_identity(user_id: Option<&str>) -> &str {
    match user_id {
        Some(id) if !id.is_empty() => id,
        _ => DEFAULT_IDENTITY,
    }
}
