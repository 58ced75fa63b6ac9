//! Structured records out of free-form model output.
//!
//! Models asked for JSON tend to wrap it in prose or markdown fences and to
//! leave small syntax errors behind. Extraction first locates the structured
//! block, then parses it strictly, then retries with progressively looser
//! repairs. [`SceneExtractor`] adds bounded corrective re-requests on top, for scene
//! lists and for any other structured reply.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;
use thiserror::Error;

use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::model::{send_traced, GenerationResult, LanguageModel, LanguageModelError};
use crate::prompts::{PromptError, PromptRegistry};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no structured block found in response ({length} bytes)")]
    NoStructuredBlock { length: usize },
    #[error("invalid JSON after repair attempts: {message}")]
    Parse { message: String },
    #[error("expected {expected}, found {found}")]
    Shape {
        expected: &'static str,
        found: &'static str,
    },
    #[error("scene list is empty")]
    EmptySceneList,
    #[error("scene at position {position} has no summary")]
    MissingSummary { position: usize },
    #[error("extraction failed after {attempts} corrective requests: {last}")]
    ExtractionFailed {
        attempts: usize,
        #[source]
        last: Box<ExtractError>,
    },
    #[error("corrective request failed: {0}")]
    Model(#[source] LanguageModelError),
    #[error("failed to render corrective prompt: {0}")]
    Prompt(#[source] PromptError),
}

/// One narrative unit of a chapter. Only `index` and `summary` are required;
/// the remaining fields are passed through to the scene-writing call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneRecord {
    pub index: u32,
    pub summary: String,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub setting: Option<String>,
    #[serde(default)]
    pub narrative_beat: Option<String>,
}

impl SceneRecord {
    pub fn new(index: u32, summary: impl Into<String>) -> Self {
        Self {
            index,
            summary: summary.into(),
            ..Self::default()
        }
    }
}

impl fmt::Display for SceneRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scene {}: {}", self.index, self.summary)?;
        if !self.characters.is_empty() {
            write!(f, "\nCharacters present: {}", self.characters.join(", "))?;
        }
        if let Some(setting) = &self.setting {
            write!(f, "\nSetting: {setting}")?;
        }
        if let Some(beat) = &self.narrative_beat {
            write!(f, "\nNarrative beat: {beat}")?;
        }
        Ok(())
    }
}

const INDEX_KEYS: [&str; 5] = ["index", "scene", "scene_number", "number", "SceneNumber"];
const SUMMARY_KEYS: [&str; 6] = [
    "summary",
    "description",
    "scene_summary",
    "outline",
    "Summary",
    "SceneOutline",
];
const CHARACTER_KEYS: [&str; 4] = [
    "characters",
    "characters_present",
    "CharactersPresent",
    "Characters",
];
const SETTING_KEYS: [&str; 3] = ["setting", "location", "Setting"];
const BEAT_KEYS: [&str; 4] = ["narrative_beat", "beat", "purpose", "NarrativeBeat"];

/// Parses a scene list out of `raw`. Records come back in source order.
pub fn extract_scenes(raw: &str) -> Result<Vec<SceneRecord>, ExtractError> {
    let value = parse_lenient(raw)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => scene_array_in(map)?,
        other => {
            return Err(ExtractError::Shape {
                expected: "a list of scenes",
                found: kind_of(&other),
            })
        }
    };

    if items.is_empty() {
        return Err(ExtractError::EmptySceneList);
    }

    items
        .into_iter()
        .enumerate()
        .map(|(position, item)| scene_from_value(position, item))
        .collect()
}

fn scene_array_in(mut map: Map<String, Value>) -> Result<Vec<Value>, ExtractError> {
    if let Some(Value::Array(items)) = map.remove("scenes") {
        return Ok(items);
    }
    map.into_iter()
        .find_map(|(_, value)| match value {
            Value::Array(items) => Some(items),
            _ => None,
        })
        .ok_or(ExtractError::Shape {
            expected: "an object containing a scene list",
            found: "an object without any list",
        })
}

fn scene_from_value(position: usize, item: Value) -> Result<SceneRecord, ExtractError> {
    let fallback_index = u32::try_from(position + 1).unwrap_or(u32::MAX);
    let map = match item {
        Value::Object(map) => map,
        Value::String(summary) if !summary.trim().is_empty() => {
            return Ok(SceneRecord::new(fallback_index, summary.trim()));
        }
        _ => return Err(ExtractError::MissingSummary { position }),
    };

    let summary = first_string(&map, &SUMMARY_KEYS)
        .filter(|summary| !summary.trim().is_empty())
        .ok_or(ExtractError::MissingSummary { position })?;

    let index = INDEX_KEYS
        .iter()
        .find_map(|key| map.get(*key).and_then(as_index))
        .unwrap_or(fallback_index);

    let characters = CHARACTER_KEYS
        .iter()
        .find_map(|key| map.get(*key))
        .map(string_list)
        .unwrap_or_default();

    Ok(SceneRecord {
        index,
        summary,
        characters,
        setting: first_string(&map, &SETTING_KEYS),
        narrative_beat: first_string(&map, &BEAT_KEYS),
    })
}

fn first_string(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key) {
        Some(Value::String(text)) => Some(text.clone()),
        _ => None,
    })
}

fn as_index(value: &Value) -> Option<u32> {
    match value {
        Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(text) => text
            .trim()
            .trim_start_matches(|c: char| !c.is_ascii_digit())
            .parse()
            .ok(),
        _ => None,
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        Value::String(text) => text
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// Locates the JSON block in `raw` and parses it, applying repairs when the
/// strict parse fails.
pub fn parse_lenient(raw: &str) -> Result<Value, ExtractError> {
    let block = locate_block(raw).ok_or(ExtractError::NoStructuredBlock { length: raw.len() })?;

    let mut candidate = block.to_string();
    let mut last_error = match serde_json::from_str(&candidate) {
        Ok(value) => return Ok(value),
        Err(err) => err.to_string(),
    };

    let repairs: [fn(&str) -> String; 3] =
        [strip_trailing_commas, close_unbalanced, normalize_quotes];
    for repair in repairs {
        candidate = repair(&candidate);
        match serde_json::from_str(&candidate) {
            Ok(value) => return Ok(value),
            Err(err) => last_error = err.to_string(),
        }
    }

    Err(ExtractError::Parse {
        message: last_error,
    })
}

/// Finds the structured part of a response: a fenced block first, then the
/// first balanced `[...]` or `{...}` region. An unterminated region runs to
/// the end of the text so that the repairs can close it.
pub fn locate_block(raw: &str) -> Option<&str> {
    if let Some(fenced) = fenced_block(raw) {
        if fenced.starts_with(['[', '{']) {
            return Some(fenced);
        }
        if let Some(inner) = bracketed_region(fenced) {
            return Some(inner);
        }
    }
    bracketed_region(raw)
}

fn fenced_block(raw: &str) -> Option<&str> {
    let start = raw.find("```")?;
    let after_fence = &raw[start + 3..];
    // Skip the language tag, if any.
    let body_start = after_fence.find('\n').map(|n| n + 1).unwrap_or(0);
    let body = &after_fence[body_start..];
    let body = match body.find("```") {
        Some(end) => &body[..end],
        None => body,
    };
    let trimmed = body.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn bracketed_region(raw: &str) -> Option<&str> {
    let start = raw.find(['[', '{'])?;
    let region = &raw[start..];
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in region.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&region[..offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    Some(region.trim_end())
}

fn trailing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",(\s*[\]}])").expect("valid trailing comma regex"))
}

fn strip_trailing_commas(text: &str) -> String {
    trailing_comma_re().replace_all(text, "$1").into_owned()
}

fn close_unbalanced(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => stack.push(']'),
            '{' => stack.push('}'),
            ']' | '}' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut repaired = text.trim_end().to_string();
    if in_string {
        repaired.push('"');
    }
    while repaired.ends_with(',') || repaired.ends_with(':') {
        repaired.pop();
    }
    while let Some(closer) = stack.pop() {
        repaired.push(closer);
    }
    strip_trailing_commas(&repaired)
}

fn normalize_quotes(text: &str) -> String {
    if text.contains('"') {
        return text.to_string();
    }
    text.replace('\'', "\"")
}

/// Parses structured replies and, when parsing fails, asks the model to
/// re-emit valid JSON, up to `max_repair_requests` times.
pub struct SceneExtractor<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    model_id: &'a str,
    max_repair_requests: usize,
    seed: Option<u64>,
    debug: bool,
}

impl<'a> SceneExtractor<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink, model_id: &'a str) -> Self {
        Self {
            prompts,
            sink,
            model_id,
            max_repair_requests: 3,
            seed: None,
            debug: false,
        }
    }

    pub fn with_max_repair_requests(mut self, max_repair_requests: usize) -> Self {
        self.max_repair_requests = max_repair_requests;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn extract<M: LanguageModel + ?Sized>(
        &self,
        model: &M,
        response: GenerationResult,
    ) -> Result<Vec<SceneRecord>, ExtractError> {
        self.read(model, response, extract_scenes)
    }

    /// Runs `parse` over the reply, sending corrective follow-ups that
    /// continue the same conversation until it succeeds or the budget runs
    /// out.
    pub fn read<M, T, F>(
        &self,
        model: &M,
        response: GenerationResult,
        parse: F,
    ) -> Result<T, ExtractError>
    where
        M: LanguageModel + ?Sized,
        F: Fn(&str) -> Result<T, ExtractError>,
    {
        let mut response = response;
        let mut attempts = 0usize;
        loop {
            let error = match parse(response.text()) {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if attempts >= self.max_repair_requests {
                self.sink.log(LogRecord::new(
                    LogLevel::Error,
                    format!(
                        "structured output still invalid after {attempts} corrective requests: \
                         {error}"
                    ),
                ));
                return Err(ExtractError::ExtractionFailed {
                    attempts,
                    last: Box::new(error),
                });
            }
            attempts += 1;

            self.sink.log(LogRecord::new(
                LogLevel::Warn,
                format!(
                    "structured output invalid ({error}), corrective request {attempts}/{}",
                    self.max_repair_requests
                ),
            ));

            let correction = self
                .prompts
                .format_with("repair_json", [("error", error.to_string())])
                .map_err(ExtractError::Prompt)?;
            let request = response
                .into_followup(self.model_id, correction)
                .label("repair_json")
                .seed(self.seed)
                .build();
            response = send_traced(model, &request, self.sink, self.debug)
                .map_err(ExtractError::Model)?;
        }
    }
}
