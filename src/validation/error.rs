use super::types::TemperatureBounds;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// 字段路径的一段：对象键或数组下标。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Loc {
    Key(&'static str),
    Index(usize),
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) => f.write_str(k),
            Self::Index(i) => write!(f, "{i}"),
        }
    }
}

/// 机器可读的错误类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    JsonInvalid,
    DictType,
    ModelType,
    Missing,
    StringType,
    StringTooShort,
    StringTooLong,
    StringPatternMismatch,
    ListType,
    TooShort,
    TooLong,
    FloatType,
    FloatParsing,
    IntType,
    IntParsing,
    IntFromFloat,
    BoolType,
    GreaterThanEqual,
    LessThanEqual,
    ValueError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JsonInvalid => "json_invalid",
            Self::DictType => "dict_type",
            Self::ModelType => "model_type",
            Self::Missing => "missing",
            Self::StringType => "string_type",
            Self::StringTooShort => "string_too_short",
            Self::StringTooLong => "string_too_long",
            Self::StringPatternMismatch => "string_pattern_mismatch",
            Self::ListType => "list_type",
            Self::TooShort => "too_short",
            Self::TooLong => "too_long",
            Self::FloatType => "float_type",
            Self::FloatParsing => "float_parsing",
            Self::IntType => "int_type",
            Self::IntParsing => "int_parsing",
            Self::IntFromFloat => "int_from_float",
            Self::BoolType => "bool_type",
            Self::GreaterThanEqual => "greater_than_equal",
            Self::LessThanEqual => "less_than_equal",
            Self::ValueError => "value_error",
        }
    }

    pub fn is_range(self) -> bool {
        matches!(self, Self::GreaterThanEqual | Self::LessThanEqual)
    }
}

/// 单个字段的校验失败。
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub loc: Vec<Loc>,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<sonic_rs::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctx: Option<sonic_rs::Value>,
}

impl FieldError {
    pub fn new(kind: ErrorKind, loc: Vec<Loc>, msg: impl Into<String>) -> Self {
        Self {
            kind,
            loc,
            msg: msg.into(),
            input: None,
            ctx: None,
        }
    }

    pub fn with_input(mut self, input: &sonic_rs::Value) -> Self {
        self.input = Some(input.clone());
        self
    }

    pub fn with_ctx(mut self, ctx: sonic_rs::Value) -> Self {
        self.ctx = Some(ctx);
        self
    }

    pub fn field(&self) -> String {
        self.loc
            .iter()
            .map(|l| l.to_string())
            .collect::<Vec<_>>()
            .join(".")
    }

    fn is_temperature(&self) -> bool {
        self.loc.iter().any(|l| *l == Loc::Key("temperature"))
    }
}

/// 面向人的错误明细：`hint` 仅对温度越界生成。
#[derive(Debug, Clone, Serialize)]
pub struct EnhancedDetail {
    pub field: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Error)]
#[error("{} 个字段校验失败: {}", .errors.len(), summarize(.errors))]
pub struct ValidationErrors {
    errors: Vec<FieldError>,
    temperature: TemperatureBounds,
}

impl ValidationErrors {
    pub fn new(errors: Vec<FieldError>, temperature: TemperatureBounds) -> Self {
        Self {
            errors,
            temperature,
        }
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    pub fn enhanced(&self) -> Vec<EnhancedDetail> {
        self.errors
            .iter()
            .map(|e| EnhancedDetail {
                field: e.field(),
                message: e.msg.clone(),
                kind: e.kind.as_str(),
                hint: (e.is_temperature() && e.kind.is_range()).then(|| self.temperature.hint()),
            })
            .collect()
    }

    /// 日志用的简短摘要。
    pub fn summary(&self) -> String {
        summarize(&self.errors)
    }
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field(), e.msg))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> TemperatureBounds {
        TemperatureBounds { min: 0.5, max: 1.0 }
    }

    #[test]
    fn display_counts_and_lists_fields() {
        let errs = ValidationErrors::new(
            vec![
                FieldError::new(
                    ErrorKind::Missing,
                    vec![Loc::Key("body"), Loc::Key("messages")],
                    "Field required",
                ),
                FieldError::new(
                    ErrorKind::LessThanEqual,
                    vec![Loc::Key("body"), Loc::Key("temperature")],
                    "Input should be less than or equal to 1.0",
                ),
            ],
            bounds(),
        );
        assert_eq!(
            errs.to_string(),
            "2 个字段校验失败: body.messages: Field required; \
             body.temperature: Input should be less than or equal to 1.0"
        );

        let as_error: &dyn std::error::Error = &errs;
        assert!(as_error.source().is_none());
    }

    #[test]
    fn hint_only_for_temperature_range_errors() {
        let errs = ValidationErrors::new(
            vec![
                FieldError::new(
                    ErrorKind::GreaterThanEqual,
                    vec![Loc::Key("body"), Loc::Key("temperature")],
                    "Input should be greater than or equal to 0.5",
                ),
                FieldError::new(
                    ErrorKind::FloatType,
                    vec![Loc::Key("body"), Loc::Key("temperature")],
                    "Input should be a valid number",
                ),
            ],
            bounds(),
        );
        let enhanced = errs.enhanced();
        assert_eq!(
            enhanced[0].hint.as_deref(),
            Some("Temperature must be between 0.5 and 1.0.")
        );
        assert_eq!(enhanced[1].hint, None);
        assert_eq!(enhanced[1].field, "body.temperature");
    }
}
