use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

/// How the retry driver reacts to a failed attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Give up immediately.
    Fatal,
    /// Sleep for the configured backoff, then try again.
    Backoff,
    /// Try again at once with a perturbed seed.
    Resample,
}

/// Provider failure categories, from HTTP status, provider error codes or
/// message keywords.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderErrorKind {
    Authentication,
    InsufficientBalance,
    ModelNotFound,
    RateLimited,
    Timeout,
    Unavailable,
    InvalidParameters,
    ContentPolicy,
    Unknown,
}

impl ProviderErrorKind {
    pub fn class(self) -> ErrorClass {
        match self {
            Self::Authentication | Self::InsufficientBalance | Self::ModelNotFound => {
                ErrorClass::Fatal
            }
            Self::RateLimited | Self::Timeout | Self::Unavailable | Self::InvalidParameters => {
                ErrorClass::Backoff
            }
            Self::ContentPolicy | Self::Unknown => ErrorClass::Resample,
        }
    }

    /// GLM (Zhipu) business error codes.
    pub fn from_glm_code(code: u32) -> Option<Self> {
        Some(match code {
            1301 => Self::Authentication,
            1302 => Self::RateLimited,
            1303 => Self::InsufficientBalance,
            1310 => Self::Timeout,
            1311 => Self::Unavailable,
            1312 => Self::ModelNotFound,
            1313 => Self::InvalidParameters,
            1314 => Self::ContentPolicy,
            _ => return None,
        })
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Authentication => "authentication failed",
            Self::InsufficientBalance => "insufficient balance",
            Self::ModelNotFound => "model not found",
            Self::RateLimited => "rate limited",
            Self::Timeout => "timed out",
            Self::Unavailable => "service unavailable",
            Self::InvalidParameters => "invalid parameters",
            Self::ContentPolicy => "content policy violation",
            Self::Unknown => "provider error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid adapter configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no backend configured for model profile `{0}`")]
    UnknownModel(String),
    #[error("unexpected http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("{kind}: {message}")]
    Provider {
        kind: ProviderErrorKind,
        message: String,
    },
    #[error("API returned an empty response")]
    EmptyResponse,
    #[error("response has {words} words, at least {required} required")]
    ShortResponse { words: usize, required: usize },
    #[error("operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: usize,
        #[source]
        source: Box<AdapterError>,
    },
}

impl AdapterError {
    pub fn retry_exhausted(attempts: usize, source: AdapterError) -> Self {
        AdapterError::RetryExhausted {
            attempts,
            source: Box::new(source),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Http(err) if err.is_timeout() || err.is_connect() => ErrorClass::Backoff,
            Self::Http(_) | Self::Json(_) => ErrorClass::Resample,
            Self::InvalidConfig(_)
            | Self::InvalidRequest(_)
            | Self::UnknownModel(_)
            | Self::RetryExhausted { .. } => ErrorClass::Fatal,
            Self::HttpStatus { status, body } => classify_status(*status, body).class(),
            Self::Provider { kind, .. } => kind.class(),
            Self::EmptyResponse | Self::ShortResponse { .. } => ErrorClass::Resample,
        }
    }

    /// Server-provided wait hint (Gemini `retryDelay`), if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus { status, body } if *status == StatusCode::TOO_MANY_REQUESTS => {
                parse_retry_delay(body).map(Duration::from_secs)
            }
            _ => None,
        }
    }
}

/// Classifies a non-success response. Provider codes and keywords in the
/// body take precedence over the status code.
pub fn classify_status(status: StatusCode, body: &str) -> ProviderErrorKind {
    if let Some(kind) = classify_body(body) {
        return kind;
    }
    let lower = body.to_ascii_lowercase();
    match status.as_u16() {
        401 | 403 => ProviderErrorKind::Authentication,
        402 => ProviderErrorKind::InsufficientBalance,
        404 => ProviderErrorKind::ModelNotFound,
        408 | 504 => ProviderErrorKind::Timeout,
        429 if lower.contains("insufficient_quota") || lower.contains("balance") => {
            ProviderErrorKind::InsufficientBalance
        }
        429 => ProviderErrorKind::RateLimited,
        400 | 422 => ProviderErrorKind::InvalidParameters,
        500..=599 => ProviderErrorKind::Unavailable,
        _ => ProviderErrorKind::Unknown,
    }
}

static GLM_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""code"\s*:\s*"?(13\d\d)"#).expect("valid regex for glm codes"));

/// Looks for a GLM error code or a content-policy keyword in a response body.
pub fn classify_body(body: &str) -> Option<ProviderErrorKind> {
    if let Some(kind) = glm_code(body).and_then(ProviderErrorKind::from_glm_code) {
        return Some(kind);
    }
    let lower = body.to_ascii_lowercase();
    if ["content_filter", "content policy", "content_policy", "safety"]
        .iter()
        .any(|keyword| lower.contains(keyword))
    {
        return Some(ProviderErrorKind::ContentPolicy);
    }
    None
}

fn glm_code(body: &str) -> Option<u32> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let code = value.get("error").and_then(|error| error.get("code"));
        let parsed = match code {
            Some(Value::String(text)) => text.trim().parse().ok(),
            Some(Value::Number(number)) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
            _ => None,
        };
        if parsed.is_some() {
            return parsed;
        }
    }
    GLM_CODE_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .and_then(|matched| matched.as_str().parse().ok())
}

pub(crate) fn parse_retry_delay(body: &str) -> Option<u64> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(details) = value
            .get("error")
            .and_then(|v| v.get("details"))
            .and_then(|v| v.as_array())
        {
            for detail in details {
                if let Some(delay) = detail
                    .get("retryDelay")
                    .or_else(|| detail.get("retry_delay"))
                {
                    if let Some(parsed) = parse_delay_value(delay) {
                        return Some(parsed);
                    }
                }
            }
        }
    }

    static RETRY_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"retry[_ ]?delay[^0-9]*(\d+)").expect("valid regex for retry delay")
    });

    RETRY_RE
        .captures(&body.to_ascii_lowercase())
        .and_then(|caps| caps.get(1))
        .and_then(|matched| matched.as_str().parse().ok())
}

fn parse_delay_value(value: &Value) -> Option<u64> {
    if let Some(number) = value.as_u64() {
        return Some(number);
    }
    value
        .as_str()
        .and_then(|text| text.trim().trim_end_matches('s').parse::<f64>().ok())
        .map(|secs| secs.ceil() as u64)
}
