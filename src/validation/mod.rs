//! 入站聊天请求的结构与内容校验。
//!
//! 错误类型与文案对齐常见的 `type/loc/msg/input/ctx` 格式；所有结构错误一次性收集。
//! 提示注入筛查只是启发式的关键字匹配，不构成安全边界。

mod error;
mod types;

pub use error::{EnhancedDetail, ErrorKind, FieldError, Loc, ValidationErrors};
pub use types::{ChatMessage, ChatModel, ChatRequest, Role, TemperatureBounds};

use sonic_rs::{JsonContainerTrait, JsonValueTrait, Value, json};
use types::{
    DEFAULT_TEMPERATURE, MAX_CONTENT_CHARS, MAX_MESSAGES, MAX_TOKENS_LIMIT, MAX_USER_ID_CHARS,
    MODEL_PATTERN, ROLE_PATTERN, format_bound,
};

/// 命中即拒绝（大小写不敏感的子串匹配）。
pub const INJECTION_MARKERS: [&str; 8] = [
    "ignore previous",
    "system:",
    "assistant:",
    "forget everything",
    "new instructions:",
    "override:",
    "jailbreak",
    "roleplay",
];

const INJECTION_MESSAGE: &str = "Potential prompt injection detected";

pub fn find_injection_marker(content: &str) -> Option<&'static str> {
    let lower = content.to_lowercase();
    INJECTION_MARKERS
        .into_iter()
        .find(|marker| lower.contains(marker))
}

#[derive(Debug, Clone)]
pub struct RequestValidator {
    temperature: TemperatureBounds,
}

impl RequestValidator {
    pub fn new(temperature: TemperatureBounds) -> Self {
        Self { temperature }
    }

    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self::new(TemperatureBounds {
            min: cfg.temperature_min,
            max: cfg.temperature_max,
        })
    }

    pub fn validate(&self, body: &[u8]) -> Result<ChatRequest, ValidationErrors> {
        match sonic_rs::from_slice::<Value>(body) {
            Ok(v) => self.validate_value(&v),
            Err(e) => Err(self.fail(vec![
                FieldError::new(ErrorKind::JsonInvalid, body_loc(&[]), "JSON decode error")
                    .with_ctx(json!({ "error": e.to_string() })),
            ])),
        }
    }

    pub fn validate_value(&self, body: &Value) -> Result<ChatRequest, ValidationErrors> {
        if !body.is_object() {
            return Err(self.fail(vec![
                FieldError::new(
                    ErrorKind::DictType,
                    body_loc(&[]),
                    "Input should be a valid dictionary or object to extract fields from",
                )
                .with_input(body),
            ]));
        }

        let mut errors = Vec::new();
        let messages = validate_messages(body.get("messages"), &mut errors);
        let model = validate_model(body.get("model"), &mut errors);
        let temperature = self.validate_temperature(body.get("temperature"), &mut errors);
        let max_tokens = validate_max_tokens(body.get("max_tokens"), &mut errors);
        let stream = validate_stream(body.get("stream"), &mut errors);
        let user_id = validate_user_id(body.get("user_id"), &mut errors);

        match (messages, model, temperature, max_tokens, stream, user_id) {
            (
                Some(messages),
                Some(model),
                Some(temperature),
                Some(max_tokens),
                Some(stream),
                Some(user_id),
            ) if errors.is_empty() => Ok(ChatRequest {
                messages,
                model,
                temperature,
                max_tokens,
                stream,
                user_id,
            }),
            _ => Err(self.fail(errors)),
        }
    }

    fn fail(&self, errors: Vec<FieldError>) -> ValidationErrors {
        ValidationErrors::new(errors, self.temperature)
    }

    fn validate_temperature(&self, v: Option<&Value>, errors: &mut Vec<FieldError>) -> Option<f64> {
        let loc = || body_loc(&[Loc::Key("temperature")]);
        // 缺省值不参与区间校验。
        let Some(v) = v else {
            return Some(DEFAULT_TEMPERATURE);
        };

        let t = match number_as_f64(v) {
            Some(t) => t,
            None => match v.as_str() {
                Some(s) => match s.trim().parse::<f64>() {
                    Ok(t) if t.is_finite() => t,
                    _ => {
                        errors.push(
                            FieldError::new(
                                ErrorKind::FloatParsing,
                                loc(),
                                "Input should be a valid number, unable to parse string as a number",
                            )
                            .with_input(v),
                        );
                        return None;
                    }
                },
                None => {
                    errors.push(
                        FieldError::new(ErrorKind::FloatType, loc(), "Input should be a valid number")
                            .with_input(v),
                    );
                    return None;
                }
            },
        };

        let bounds = self.temperature;
        if t < bounds.min {
            errors.push(
                FieldError::new(
                    ErrorKind::GreaterThanEqual,
                    loc(),
                    format!(
                        "Input should be greater than or equal to {}",
                        format_bound(bounds.min)
                    ),
                )
                .with_input(v)
                .with_ctx(json!({ "ge": bounds.min })),
            );
            return None;
        }
        if t > bounds.max {
            errors.push(
                FieldError::new(
                    ErrorKind::LessThanEqual,
                    loc(),
                    format!(
                        "Input should be less than or equal to {}",
                        format_bound(bounds.max)
                    ),
                )
                .with_input(v)
                .with_ctx(json!({ "le": bounds.max })),
            );
            return None;
        }
        Some(t)
    }
}

fn body_loc(rest: &[Loc]) -> Vec<Loc> {
    let mut loc = Vec::with_capacity(rest.len() + 1);
    loc.push(Loc::Key("body"));
    loc.extend_from_slice(rest);
    loc
}

fn number_as_f64(v: &Value) -> Option<f64> {
    if !v.is_number() {
        return None;
    }
    v.as_f64()
        .or_else(|| v.as_i64().map(|i| i as f64))
        .or_else(|| v.as_u64().map(|u| u as f64))
}

fn missing(loc: Vec<Loc>) -> FieldError {
    FieldError::new(ErrorKind::Missing, loc, "Field required")
}

fn string_type(loc: Vec<Loc>, v: &Value) -> FieldError {
    FieldError::new(ErrorKind::StringType, loc, "Input should be a valid string").with_input(v)
}

fn pattern_mismatch(loc: Vec<Loc>, v: &Value, pattern: &'static str) -> FieldError {
    FieldError::new(
        ErrorKind::StringPatternMismatch,
        loc,
        format!("String should match pattern '{pattern}'"),
    )
    .with_input(v)
    .with_ctx(json!({ "pattern": pattern }))
}

fn validate_messages(v: Option<&Value>, errors: &mut Vec<FieldError>) -> Option<Vec<ChatMessage>> {
    let loc = || body_loc(&[Loc::Key("messages")]);
    let Some(v) = v else {
        errors.push(missing(loc()));
        return None;
    };
    let Some(items) = v.as_array() else {
        errors.push(
            FieldError::new(ErrorKind::ListType, loc(), "Input should be a valid list").with_input(v),
        );
        return None;
    };

    if items.is_empty() {
        errors.push(
            FieldError::new(
                ErrorKind::TooShort,
                loc(),
                "List should have at least 1 item after validation, not 0",
            )
            .with_input(v)
            .with_ctx(json!({ "field_type": "List", "min_length": 1, "actual_length": 0 })),
        );
        return None;
    }
    if items.len() > MAX_MESSAGES {
        errors.push(
            FieldError::new(
                ErrorKind::TooLong,
                loc(),
                format!(
                    "List should have at most {MAX_MESSAGES} items after validation, not {}",
                    items.len()
                ),
            )
            .with_ctx(json!({
                "field_type": "List",
                "max_length": MAX_MESSAGES,
                "actual_length": items.len(),
            })),
        );
        return None;
    }

    let before = errors.len();
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        if let Some(msg) = validate_message(i, item, errors) {
            out.push(msg);
        }
    }
    if errors.len() != before {
        return None;
    }

    // 列表级校验：仅在每条消息结构合法后执行。
    if let Some(marker) = out.iter().find_map(|m| find_injection_marker(&m.content)) {
        tracing::debug!(marker, "检测到疑似提示注入");
        errors.push(
            FieldError::new(
                ErrorKind::ValueError,
                loc(),
                format!("Value error, {INJECTION_MESSAGE}"),
            )
            .with_input(v)
            .with_ctx(json!({ "error": INJECTION_MESSAGE })),
        );
        return None;
    }

    Some(out)
}

fn validate_message(i: usize, v: &Value, errors: &mut Vec<FieldError>) -> Option<ChatMessage> {
    let loc = |field: Option<&'static str>| {
        let mut l = body_loc(&[Loc::Key("messages"), Loc::Index(i)]);
        if let Some(f) = field {
            l.push(Loc::Key(f));
        }
        l
    };

    if !v.is_object() {
        errors.push(
            FieldError::new(
                ErrorKind::ModelType,
                loc(None),
                "Input should be a valid dictionary or instance of ChatMessage",
            )
            .with_input(v),
        );
        return None;
    }

    let role = match v.get("role") {
        None => {
            errors.push(missing(loc(Some("role"))));
            None
        }
        Some(r) => match r.as_str() {
            None => {
                errors.push(string_type(loc(Some("role")), r));
                None
            }
            Some(s) => {
                let role = Role::parse(s);
                if role.is_none() {
                    errors.push(pattern_mismatch(loc(Some("role")), r, ROLE_PATTERN));
                }
                role
            }
        },
    };

    let content = match v.get("content") {
        None => {
            errors.push(missing(loc(Some("content"))));
            None
        }
        Some(c) => match c.as_str() {
            None => {
                errors.push(string_type(loc(Some("content")), c));
                None
            }
            Some(s) => {
                let len = s.chars().count();
                if len < 1 {
                    errors.push(
                        FieldError::new(
                            ErrorKind::StringTooShort,
                            loc(Some("content")),
                            "String should have at least 1 character",
                        )
                        .with_input(c)
                        .with_ctx(json!({ "min_length": 1 })),
                    );
                    None
                } else if len > MAX_CONTENT_CHARS {
                    errors.push(
                        FieldError::new(
                            ErrorKind::StringTooLong,
                            loc(Some("content")),
                            format!("String should have at most {MAX_CONTENT_CHARS} characters"),
                        )
                        .with_ctx(json!({ "max_length": MAX_CONTENT_CHARS })),
                    );
                    None
                } else {
                    Some(s.to_string())
                }
            }
        },
    };

    Some(ChatMessage {
        role: role?,
        content: content?,
    })
}

fn validate_model(v: Option<&Value>, errors: &mut Vec<FieldError>) -> Option<ChatModel> {
    let loc = || body_loc(&[Loc::Key("model")]);
    let v = match v {
        Some(v) if !v.is_null() => v,
        _ => return Some(ChatModel::default()),
    };
    let Some(s) = v.as_str() else {
        errors.push(string_type(loc(), v));
        return None;
    };
    let model = ChatModel::parse(s);
    if model.is_none() {
        errors.push(pattern_mismatch(loc(), v, MODEL_PATTERN));
    }
    model
}

fn validate_max_tokens(v: Option<&Value>, errors: &mut Vec<FieldError>) -> Option<Option<u32>> {
    let loc = || body_loc(&[Loc::Key("max_tokens")]);
    let v = match v {
        Some(v) if !v.is_null() => v,
        _ => return Some(None),
    };

    let n: i64 = if let Some(i) = v.as_i64() {
        i
    } else if let Some(f) = number_as_f64(v) {
        if f.fract() != 0.0 {
            errors.push(
                FieldError::new(
                    ErrorKind::IntFromFloat,
                    loc(),
                    "Input should be a valid integer, got a number with a fractional part",
                )
                .with_input(v),
            );
            return None;
        }
        f as i64
    } else if let Some(s) = v.as_str() {
        match s.trim().parse::<i64>() {
            Ok(i) => i,
            Err(_) => {
                errors.push(
                    FieldError::new(
                        ErrorKind::IntParsing,
                        loc(),
                        "Input should be a valid integer, unable to parse string as an integer",
                    )
                    .with_input(v),
                );
                return None;
            }
        }
    } else {
        errors.push(
            FieldError::new(ErrorKind::IntType, loc(), "Input should be a valid integer")
                .with_input(v),
        );
        return None;
    };

    if n < 1 {
        errors.push(
            FieldError::new(
                ErrorKind::GreaterThanEqual,
                loc(),
                "Input should be greater than or equal to 1",
            )
            .with_input(v)
            .with_ctx(json!({ "ge": 1 })),
        );
        return None;
    }
    if n > MAX_TOKENS_LIMIT as i64 {
        errors.push(
            FieldError::new(
                ErrorKind::LessThanEqual,
                loc(),
                format!("Input should be less than or equal to {MAX_TOKENS_LIMIT}"),
            )
            .with_input(v)
            .with_ctx(json!({ "le": MAX_TOKENS_LIMIT })),
        );
        return None;
    }
    Some(Some(n as u32))
}

fn validate_stream(v: Option<&Value>, errors: &mut Vec<FieldError>) -> Option<bool> {
    let Some(v) = v else {
        return Some(false);
    };
    match v.as_bool() {
        Some(b) => Some(b),
        None => {
            errors.push(
                FieldError::new(
                    ErrorKind::BoolType,
                    body_loc(&[Loc::Key("stream")]),
                    "Input should be a valid boolean",
                )
                .with_input(v),
            );
            None
        }
    }
}

fn validate_user_id(v: Option<&Value>, errors: &mut Vec<FieldError>) -> Option<Option<String>> {
    let loc = || body_loc(&[Loc::Key("user_id")]);
    let v = match v {
        Some(v) if !v.is_null() => v,
        _ => return Some(None),
    };
    let Some(s) = v.as_str() else {
        errors.push(string_type(loc(), v));
        return None;
    };
    if s.chars().count() > MAX_USER_ID_CHARS {
        errors.push(
            FieldError::new(
                ErrorKind::StringTooLong,
                loc(),
                format!("String should have at most {MAX_USER_ID_CHARS} characters"),
            )
            .with_input(v)
            .with_ctx(json!({ "max_length": MAX_USER_ID_CHARS })),
        );
        return None;
    }
    Some(Some(s.to_string()))
}
