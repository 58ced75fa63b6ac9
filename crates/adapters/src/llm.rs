use std::time::Duration;

use log::{debug, warn};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{self, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use storyforge_core::{
    word_count, ChatMessage, GenerationRequest, GenerationResult, LanguageModel,
    LanguageModelError, LlmConfig, Role,
};

use crate::endpoint::{
    azure_deployment_url, chat_completions_url, gemini_generate_url, resolve_base_url,
    DEEPSEEK_BASE_URL, GLM_BASE_URL, GROK_BASE_URL, LM_STUDIO_BASE_URL, OLLAMA_BASE_URL,
    OPENAI_BASE_URL,
};
use crate::error::{classify_body, AdapterError, ProviderErrorKind};
use crate::retry::{call_with_retry, RetryConfig};

/// Wire dialect spoken by a backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Provider {
    OpenAiCompatible,
    AzureOpenAi,
    Gemini,
    Glm,
}

impl Provider {
    /// Maps a profile's `interface_format` to a provider and its default
    /// base URL.
    pub fn from_interface_format(format: &str) -> Result<(Self, &'static str), AdapterError> {
        let normalized = format.trim().to_lowercase();
        Ok(match normalized.as_str() {
            "openai" | "" => (Self::OpenAiCompatible, OPENAI_BASE_URL),
            "deepseek" => (Self::OpenAiCompatible, DEEPSEEK_BASE_URL),
            "ollama" => (Self::OpenAiCompatible, OLLAMA_BASE_URL),
            "lm studio" | "lmstudio" => (Self::OpenAiCompatible, LM_STUDIO_BASE_URL),
            "grok" => (Self::OpenAiCompatible, GROK_BASE_URL),
            "azure openai" | "azure" => (Self::AzureOpenAi, ""),
            "gemini" | "google" => (Self::Gemini, ""),
            "glm" | "zhipu" | "zhipuai" => (Self::Glm, GLM_BASE_URL),
            other => {
                return Err(AdapterError::InvalidConfig(format!(
                    "unknown interface_format: {other}"
                )))
            }
        })
    }

    fn sends_seed(self) -> bool {
        !matches!(self, Self::Glm)
    }
}

/// Chat-completion backend built from one [`LlmConfig`] profile. Retries,
/// response validation and the reasoning-channel fallback live here.
pub struct ChatAdapter {
    provider: Provider,
    client: Client,
    url: String,
    api_key: Option<String>,
    model_name: String,
    max_tokens: Option<u32>,
    temperature: f32,
    top_p: f32,
    system_prompt: Option<String>,
    retry: RetryConfig,
}

impl ChatAdapter {
    pub fn from_profile(profile: &LlmConfig) -> Result<Self, AdapterError> {
        let (provider, default_url) = Provider::from_interface_format(&profile.interface_format)?;

        let api_key = optional_string(&profile.api_key);
        let url = match provider {
            Provider::OpenAiCompatible | Provider::Glm => {
                let base = resolve_base_url(&profile.base_url, default_url);
                if base.is_empty() {
                    return Err(AdapterError::InvalidConfig(
                        "base_url must not be empty".to_string(),
                    ));
                }
                chat_completions_url(&base)
            }
            Provider::AzureOpenAi => {
                if api_key.is_none() {
                    return Err(AdapterError::InvalidConfig(
                        "Azure OpenAI api_key must not be empty".to_string(),
                    ));
                }
                azure_deployment_url(&profile.base_url)?
            }
            Provider::Gemini => {
                if api_key.is_none() {
                    return Err(AdapterError::InvalidConfig(
                        "Gemini api_key must not be empty".to_string(),
                    ));
                }
                gemini_generate_url(&profile.base_url, profile.model_name.trim())
            }
        };

        if provider != Provider::AzureOpenAi && profile.model_name.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "model_name must not be empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(profile.timeout.max(1)))
            .build()?;

        Ok(Self {
            provider,
            client,
            url,
            api_key,
            model_name: profile.model_name.trim().to_string(),
            max_tokens: (profile.max_tokens > 0).then_some(profile.max_tokens),
            temperature: profile.temperature,
            top_p: profile.top_p,
            system_prompt: profile
                .system_prompt
                .as_deref()
                .and_then(optional_string),
            retry: RetryConfig::from_profile(profile),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Request messages, with the profile's system prompt in front when the
    /// request brings none of its own.
    fn messages<'r>(&'r self, request: &'r GenerationRequest) -> Vec<WireMessage<'r>> {
        let mut messages = Vec::with_capacity(request.messages().len() + 1);
        let has_system = request
            .messages()
            .iter()
            .any(|message| message.role == Role::System);
        if let (false, Some(system)) = (has_system, self.system_prompt.as_deref()) {
            messages.push(WireMessage {
                role: Role::System.as_str(),
                content: system,
            });
        }
        messages.extend(request.messages().iter().map(WireMessage::from));
        messages
    }

    fn attempt_seed(&self, request: &GenerationRequest, attempt: usize) -> Option<u64> {
        if !self.provider.sends_seed() {
            return None;
        }
        request
            .seed()
            .map(|seed| seed.wrapping_add(attempt.saturating_sub(1) as u64))
    }

    fn send_once(
        &self,
        request: &GenerationRequest,
        attempt: usize,
    ) -> Result<String, AdapterError> {
        let seed = self.attempt_seed(request, attempt);
        let text = match self.provider {
            Provider::Gemini => self.send_gemini(request, seed)?,
            _ => self.send_chat(request, seed)?,
        };
        check_length(text, request.min_word_count())
    }

    fn send_chat(
        &self,
        request: &GenerationRequest,
        seed: Option<u64>,
    ) -> Result<String, AdapterError> {
        let body = ChatCompletionRequest {
            model: (self.provider != Provider::AzureOpenAi).then_some(self.model_name.as_str()),
            messages: self.messages(request),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            seed,
        };

        let builder = self.client.post(&self.url).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let builder = self.authorize(builder)?;
        let response = builder.json(&body).send()?;
        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            return Err(AdapterError::HttpStatus { status, body: text });
        }
        parse_chat_body(&text)
    }

    fn authorize(&self, builder: RequestBuilder) -> Result<RequestBuilder, AdapterError> {
        let Some(key) = self.api_key.as_deref() else {
            return Ok(builder);
        };
        Ok(match self.provider {
            Provider::AzureOpenAi => builder.header(
                "api-key",
                HeaderValue::from_str(key).map_err(|err| {
                    AdapterError::InvalidConfig(format!("invalid api key header: {err}"))
                })?,
            ),
            Provider::Gemini => builder.header(
                "x-goog-api-key",
                HeaderValue::from_str(key).map_err(|err| {
                    AdapterError::InvalidConfig(format!("invalid api key header: {err}"))
                })?,
            ),
            Provider::OpenAiCompatible | Provider::Glm => builder.bearer_auth(key),
        })
    }

    fn send_gemini(
        &self,
        request: &GenerationRequest,
        seed: Option<u64>,
    ) -> Result<String, AdapterError> {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();
        for message in self.messages(request) {
            match message.role {
                "system" => system_parts.push(GeminiPartRequest {
                    text: message.content,
                }),
                role => contents.push(GeminiContentRequest {
                    role: if role == "assistant" { "model" } else { "user" },
                    parts: vec![GeminiPartRequest {
                        text: message.content,
                    }],
                }),
            }
        }

        let body = GeminiRequest {
            system_instruction: (!system_parts.is_empty()).then(|| GeminiSystemInstruction {
                parts: system_parts,
            }),
            contents,
            generation_config: GeminiGenerationConfig {
                max_output_tokens: self.max_tokens,
                temperature: self.temperature,
                top_p: self.top_p,
                seed,
            },
        };

        let builder = self.authorize(self.client.post(&self.url))?;
        let response = builder.json(&body).send()?;
        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            return Err(AdapterError::HttpStatus { status, body: text });
        }
        parse_gemini_body(&text)
    }
}

impl LanguageModel for ChatAdapter {
    fn send(&self, request: &GenerationRequest) -> Result<GenerationResult, LanguageModelError> {
        if request.messages().is_empty() {
            return Err(LanguageModelError::new(AdapterError::InvalidRequest(format!(
                "request `{}` has no messages",
                request.label()
            ))));
        }

        debug!(
            "[{}] sending {} message(s) to {} ({:?})",
            request.label(),
            request.messages().len(),
            self.model_name,
            self.provider
        );
        let text = call_with_retry(
            request.label(),
            |attempt| self.send_once(request, attempt),
            &self.retry,
        )
        .map_err(LanguageModelError::new)?;
        Ok(GenerationResult::from_reply(request, text))
    }
}

fn optional_string(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn check_length(text: String, min_words: usize) -> Result<String, AdapterError> {
    if text.trim().is_empty() {
        return Err(AdapterError::EmptyResponse);
    }
    let words = word_count(&text);
    if words < min_words {
        return Err(AdapterError::ShortResponse {
            words,
            required: min_words,
        });
    }
    Ok(text)
}

/// Reads the first usable choice. The primary `content` wins; an empty one
/// falls back to `reasoning_content`. An `error` object in a 200 reply is
/// classified like an error status.
pub(crate) fn parse_chat_body(body: &str) -> Result<String, AdapterError> {
    let value: Value = serde_json::from_str(body)?;
    if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
        return Err(AdapterError::Provider {
            kind: classify_body(body).unwrap_or(ProviderErrorKind::Unknown),
            message: error.to_string(),
        });
    }

    let parsed: ChatCompletionResponse = serde_json::from_value(value)?;
    let mut filtered = false;
    for choice in parsed.choices {
        if choice.finish_reason.as_deref() == Some("content_filter")
            || choice.finish_reason.as_deref() == Some("sensitive")
        {
            filtered = true;
        }
        let Some(message) = choice.message else {
            if let Some(text) = non_blank(choice.text) {
                return Ok(text);
            }
            continue;
        };
        if let Some(content) = non_blank(message.content) {
            return Ok(content);
        }
        if let Some(reasoning) = non_blank(message.reasoning_content) {
            debug!("primary content empty, using reasoning_content");
            return Ok(reasoning);
        }
    }

    if filtered {
        return Err(AdapterError::Provider {
            kind: ProviderErrorKind::ContentPolicy,
            message: "response withheld by content filter".to_string(),
        });
    }
    Err(AdapterError::EmptyResponse)
}

pub(crate) fn parse_gemini_body(body: &str) -> Result<String, AdapterError> {
    let parsed: GeminiResponse = serde_json::from_str(body)?;
    if let Some(reason) = parsed
        .prompt_feedback
        .as_ref()
        .and_then(|feedback| feedback.block_reason.as_deref())
    {
        return Err(AdapterError::Provider {
            kind: ProviderErrorKind::ContentPolicy,
            message: format!("prompt blocked: {reason}"),
        });
    }

    let mut blocked = None;
    for candidate in parsed.candidates {
        match candidate.finish_reason.as_deref() {
            Some("MAX_TOKENS") => warn!("Gemini response truncated due to max_tokens limit"),
            Some(reason @ ("SAFETY" | "RECITATION" | "PROHIBITED_CONTENT")) => {
                blocked = Some(reason.to_string());
            }
            _ => {}
        }

        let text: String = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| match part {
                        GeminiPart::Text { text } => Some(text),
                        GeminiPart::Other(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !text.trim().is_empty() {
            return Ok(text);
        }
    }

    match blocked {
        Some(reason) => Err(AdapterError::Provider {
            kind: ProviderErrorKind::ContentPolicy,
            message: format!("candidate blocked: {reason}"),
        }),
        None => Err(AdapterError::EmptyResponse),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(message: &'a ChatMessage) -> Self {
        Self {
            role: message.role.as_str(),
            content: &message.content,
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatChoiceMessage>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Serialize)]
struct GeminiRequest<'a> {
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction<'a>>,
    contents: Vec<GeminiContentRequest<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiSystemInstruction<'a> {
    parts: Vec<GeminiPartRequest<'a>>,
}

#[derive(Serialize)]
struct GeminiContentRequest<'a> {
    role: &'static str,
    parts: Vec<GeminiPartRequest<'a>>,
}

#[derive(Serialize)]
struct GeminiPartRequest<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    temperature: f32,
    #[serde(rename = "topP")]
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "promptFeedback", default)]
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct GeminiPromptFeedback {
    #[serde(rename = "blockReason", default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    Other(Value),
}
