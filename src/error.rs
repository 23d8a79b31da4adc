use crate::upstream::UpstreamError;
use crate::usage::LimitKind;
use crate::validation::{EnhancedDetail, FieldError, ValidationErrors};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub const VALIDATION_EXPLANATION: &str =
    "Your request body failed validation. Fix the invalid fields and try again.";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("请求校验失败: {errors}")]
    Validation {
        method: String,
        path: String,
        errors: ValidationErrors,
    },

    #[error("User is blocked from using the API")]
    Blocked,

    #[error("Rate limit exceeded")]
    RateLimited(LimitKind),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    r#type: &'static str,
}

#[derive(Debug, Serialize)]
struct ValidationBody<'a> {
    status_code: u16,
    error: &'static str,
    method: &'a str,
    path: &'a str,
    detail: &'a [FieldError],
    enhanced_detail: Vec<EnhancedDetail>,
    explanation: &'static str,
}

impl AppError {
    pub fn validation(
        method: impl Into<String>,
        path: impl Into<String>,
        errors: ValidationErrors,
    ) -> Self {
        Self::Validation {
            method: method.into(),
            path: path.into(),
            errors,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Blocked => StatusCode::FORBIDDEN,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Upstream(e) => match e {
                UpstreamError::Misconfigured => StatusCode::INTERNAL_SERVER_ERROR,
                UpstreamError::Http { status, .. } => {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                UpstreamError::Unreachable(_) | UpstreamError::Decode(_) => StatusCode::BAD_GATEWAY,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::Validation { .. } => "validation_error",
            AppError::Blocked => "blocked",
            AppError::RateLimited(_) => "rate_limited",
            AppError::Upstream(e) => match e {
                UpstreamError::Misconfigured => "misconfigured",
                UpstreamError::Http { .. } | UpstreamError::Decode(_) => "upstream_error",
                UpstreamError::Unreachable(_) => "upstream_unreachable",
            },
        }
    }

    fn client_message(&self) -> String {
        match self {
            // 上游错误体原样透传给调用方。
            AppError::Upstream(UpstreamError::Http { body, .. }) => body.clone(),
            AppError::Upstream(UpstreamError::Decode(_)) => {
                "invalid response from upstream".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if let AppError::Validation {
            method,
            path,
            errors,
        } = &self
        {
            let body = ValidationBody {
                status_code: status.as_u16(),
                error: status.canonical_reason().unwrap_or("Unprocessable Entity"),
                method,
                path,
                detail: errors.errors(),
                enhanced_detail: errors.enhanced(),
                explanation: VALIDATION_EXPLANATION,
            };
            return (status, Json(body)).into_response();
        }

        let body = ErrorBody {
            error: ErrorBodyInner {
                message: self.client_message(),
                r#type: self.kind(),
            },
        };
        (status, Json(body)).into_response()
    }
}
