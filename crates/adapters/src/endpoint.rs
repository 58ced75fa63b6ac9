use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::AdapterError;

static VERSION_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/v\d+[a-z0-9]*$").expect("valid version suffix regex"));

static AZURE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^https://([^/]+)/openai/deployments/([^/]+)/chat/completions\?api-version=([^/?&]+)",
    )
    .expect("valid azure endpoint regex")
});

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
pub const LM_STUDIO_BASE_URL: &str = "http://localhost:1234/v1";
pub const GROK_BASE_URL: &str = "https://api.x.ai/v1";
pub const GLM_BASE_URL: &str = "https://open.bigmodel.cn/api/paas/v4";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Appends `/v1` unless the URL already carries a version segment. A
/// trailing `#` opts out and is stripped.
pub fn check_base_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if let Some(verbatim) = trimmed.strip_suffix('#') {
        return verbatim.to_string();
    }

    let without_slash = trimmed.trim_end_matches('/');
    if VERSION_SUFFIX_RE.is_match(without_slash) || without_slash.contains("/v1/") {
        without_slash.to_string()
    } else {
        format!("{without_slash}/v1")
    }
}

/// Profile URL if set, else the provider default, normalized.
pub fn resolve_base_url(base_url: &str, default: &str) -> String {
    if base_url.trim().is_empty() {
        check_base_url(default)
    } else {
        check_base_url(base_url)
    }
}

pub fn chat_completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

/// Validates a full Azure OpenAI deployment URL and rebuilds it canonically.
pub fn azure_deployment_url(base_url: &str) -> Result<String, AdapterError> {
    let captures = AZURE_RE.captures(base_url.trim()).ok_or_else(|| {
        AdapterError::InvalidConfig(
            "Invalid Azure OpenAI base_url format. Expected https://<resource>.openai.azure.com/openai/deployments/<deployment>/chat/completions?api-version=<version>"
                .to_string(),
        )
    })?;
    Ok(format!(
        "https://{}/openai/deployments/{}/chat/completions?api-version={}",
        &captures[1], &captures[2], &captures[3]
    ))
}

pub fn gemini_generate_url(base_url: &str, model_name: &str) -> String {
    let base = if base_url.trim().is_empty() {
        GEMINI_BASE_URL
    } else {
        base_url.trim().trim_end_matches('/')
    };
    format!("{base}/models/{model_name}:generateContent")
}
