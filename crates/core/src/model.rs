use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;

use crate::logging::{LogLevel, LogRecord, LogSink};

#[derive(Debug)]
pub struct LanguageModelError {
    inner: Box<dyn StdError + Send + Sync>,
}

impl LanguageModelError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Box::new(error),
        }
    }
}

impl fmt::Display for LanguageModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl StdError for LanguageModelError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.inner.as_ref())
    }
}

/// A chat-completion backend. Implementations own retry and response
/// validation; a returned `Err` is always fatal for the caller.
pub trait LanguageModel: Send + Sync {
    fn send(&self, request: &GenerationRequest) -> Result<GenerationResult, LanguageModelError>;
}

impl<M: LanguageModel + ?Sized> LanguageModel for &M {
    fn send(&self, request: &GenerationRequest) -> Result<GenerationResult, LanguageModelError> {
        (**self).send(request)
    }
}

impl<M: LanguageModel + ?Sized> LanguageModel for Box<M> {
    fn send(&self, request: &GenerationRequest) -> Result<GenerationResult, LanguageModelError> {
        (**self).send(request)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// One backend call. Built once through [`GenerationRequestBuilder`] and
/// never modified afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    label: String,
    model: String,
    messages: Vec<ChatMessage>,
    min_word_count: usize,
    seed: Option<u64>,
}

impl GenerationRequest {
    pub fn builder(model: impl Into<String>) -> GenerationRequestBuilder {
        GenerationRequestBuilder {
            label: String::from("generate"),
            model: model.into(),
            messages: Vec::new(),
            min_word_count: 0,
            seed: None,
        }
    }

    /// Name of the stage that issued the request, used in diagnostics.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn min_word_count(&self) -> usize {
        self.min_word_count
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct GenerationRequestBuilder {
    label: String,
    model: String,
    messages: Vec<ChatMessage>,
    min_word_count: usize,
    seed: Option<u64>,
}

impl GenerationRequestBuilder {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn system(self, content: impl Into<String>) -> Self {
        self.message(ChatMessage::system(content))
    }

    pub fn user(self, content: impl Into<String>) -> Self {
        self.message(ChatMessage::user(content))
    }

    pub fn message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn messages<I>(mut self, messages: I) -> Self
    where
        I: IntoIterator<Item = ChatMessage>,
    {
        self.messages.extend(messages);
        self
    }

    pub fn min_word_count(mut self, words: usize) -> Self {
        self.min_word_count = words;
        self
    }

    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(self) -> GenerationRequest {
        GenerationRequest {
            label: self.label,
            model: self.model,
            messages: self.messages,
            min_word_count: self.min_word_count,
            seed: self.seed,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationResult {
    text: String,
    history: Vec<ChatMessage>,
}

impl GenerationResult {
    /// Builds the result for `request`, appending `text` as the assistant
    /// reply to the request's message history.
    pub fn from_reply(request: &GenerationRequest, text: impl Into<String>) -> Self {
        let text = text.into();
        let mut history = request.messages().to_vec();
        history.push(ChatMessage::assistant(text.clone()));
        Self { text, history }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Continues the conversation: the full history followed by a new user
    /// turn, ready to be finished with [`GenerationRequestBuilder::build`].
    pub fn into_followup(
        self,
        model: impl Into<String>,
        content: impl Into<String>,
    ) -> GenerationRequestBuilder {
        GenerationRequest::builder(model)
            .messages(self.history)
            .user(content)
    }
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Sends `request`. With `debug` set, every message and the reply are logged
/// at debug level under the request label.
pub(crate) fn send_traced<M: LanguageModel + ?Sized>(
    model: &M,
    request: &GenerationRequest,
    sink: &dyn LogSink,
    debug: bool,
) -> Result<GenerationResult, LanguageModelError> {
    let label = request.label();
    if debug {
        for message in request.messages() {
            sink.log(LogRecord::new(
                LogLevel::Debug,
                format!("[{label}] {}: {}", message.role, message.content),
            ));
        }
    }
    let result = model.send(request)?;
    if debug {
        sink.log(LogRecord::new(
            LogLevel::Debug,
            format!("[{label}] reply: {}", result.text()),
        ));
    }
    Ok(result)
}
