use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Stage, StageContext};
use crate::extract::parse_lenient;
use crate::logging::LogLevel;
use crate::model::LanguageModel;

const FALLBACK_TITLE: &str = "Untitled Story";
const MAX_SLUG_LEN: usize = 60;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryInfo {
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub overall_rating: Option<u32>,
}

impl StoryInfo {
    /// Title made from the first words of the prompt.
    pub fn fallback(prompt: &str) -> Self {
        let words: Vec<&str> = prompt
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap_or_default()
            .split_whitespace()
            .take(8)
            .collect();
        let title = words
            .join(" ")
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_string();
        Self {
            title: if title.is_empty() {
                FALLBACK_TITLE.to_string()
            } else {
                title
            },
            ..Self::default()
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let Ok(Value::Object(map)) = parse_lenient(raw) else {
            return None;
        };
        let title = text_field(&map, &["title", "Title"])?;
        if title.is_empty() {
            return None;
        }
        let tags = match map.get("tags").or_else(|| map.get("Tags")) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", "),
            Some(Value::String(tags)) => tags.trim().to_string(),
            _ => String::new(),
        };
        let overall_rating = match map.get("overall_rating").or_else(|| map.get("OverallRating")) {
            Some(Value::Number(number)) => number
                .as_f64()
                .map(|n| n.round().clamp(0.0, 100.0) as u32),
            Some(Value::String(text)) => text.trim().trim_end_matches('%').parse().ok(),
            _ => None,
        };
        Some(Self {
            title,
            summary: text_field(&map, &["summary", "Summary"]).unwrap_or_default(),
            tags,
            overall_rating,
        })
    }
}

fn text_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))
        .map(|text| text.trim().to_string())
}

/// Title, summary and tags for naming the output. Never fails the run: any
/// problem falls back to a title derived from the prompt.
pub(super) fn story_info<M: LanguageModel + ?Sized>(
    ctx: &StageContext<'_, M>,
    outline: &str,
    prompt: &str,
) -> StoryInfo {
    let reply = ctx
        .render(Stage::StoryInfo, [("outline", outline)])
        .and_then(|rendered| ctx.generate(Stage::StoryInfo, &ctx.config.models.info, rendered, 0));

    match reply {
        Ok(text) => StoryInfo::parse(&text).unwrap_or_else(|| {
            ctx.log(
                LogLevel::Warn,
                "story info reply was not usable, deriving the title from the prompt",
            );
            StoryInfo::fallback(prompt)
        }),
        Err(error) => {
            ctx.log(
                LogLevel::Warn,
                format!("story info failed ({error}), deriving the title from the prompt"),
            );
            StoryInfo::fallback(prompt)
        }
    }
}

/// Lowercase ASCII file stem: alphanumerics kept, everything else collapsed
/// into single dashes.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            if slug.len() >= MAX_SLUG_LEN {
                break;
            }
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "story".to_string()
    } else {
        slug.to_string()
    }
}
