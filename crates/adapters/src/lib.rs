//! Chat-completion backends for storyforge: provider dialects, error
//! classification, retries and per-stage routing.

mod endpoint;
mod error;
mod llm;
mod pool;
mod retry;

pub use endpoint::{
    check_base_url, DEEPSEEK_BASE_URL, GEMINI_BASE_URL, GLM_BASE_URL, GROK_BASE_URL,
    LM_STUDIO_BASE_URL, OLLAMA_BASE_URL, OPENAI_BASE_URL,
};
pub use error::{classify_body, classify_status, AdapterError, ErrorClass, ProviderErrorKind};
pub use llm::{ChatAdapter, Provider};
pub use pool::BackendPool;
pub use retry::{call_with_retry, RetryConfig};
