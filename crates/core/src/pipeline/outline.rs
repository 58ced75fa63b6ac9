use serde_json::Value;

use super::{ChapterOutline, PipelineError, Stage, StageContext};
use crate::evaluation::RubricKind;
use crate::extract::{parse_lenient, ExtractError};
use crate::logging::LogLevel;
use crate::model::LanguageModel;

const COUNT_KEYS: [&str; 4] = ["total_chapters", "TotalChapters", "chapters", "chapter_count"];

/// Upper bound on a declared chapter count. Larger replies are treated as
/// unreadable.
pub const MAX_CHAPTERS: u32 = 200;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outline {
    pub text: String,
    pub revision_count: u32,
}

pub(super) fn write_outline<M: LanguageModel + ?Sized>(
    ctx: &StageContext<'_, M>,
    prompt: &str,
) -> Result<Outline, PipelineError> {
    let models = &ctx.config.models;

    ctx.log(LogLevel::Info, "generating story elements");
    let elements = ctx.generate(
        Stage::StoryElements,
        &models.initial_outline,
        ctx.render(Stage::StoryElements, [("prompt", prompt)])?,
        0,
    )?;

    ctx.log(LogLevel::Info, "generating outline");
    let state = ctx
        .revision_loop(ctx.config.outline_revisions)
        .with_subject("outline")
        .run(
            |revise| match revise {
                None => ctx.generate(
                    Stage::InitialOutline,
                    &models.initial_outline,
                    ctx.render(
                        Stage::InitialOutline,
                        [("prompt", prompt), ("elements", elements.as_str())],
                    )?,
                    0,
                ),
                Some(revise) => ctx.generate(
                    Stage::OutlineRevision,
                    &models.revision,
                    ctx.render(
                        Stage::OutlineRevision,
                        [("outline", revise.content), ("feedback", revise.feedback)],
                    )?,
                    0,
                ),
            },
            |content| {
                ctx.evaluate(
                    Stage::OutlineEvaluation,
                    content,
                    prompt,
                    RubricKind::OutlineCompleteness,
                )
            },
        )?;

    Ok(Outline {
        text: state.content,
        revision_count: state.revision_count,
    })
}

pub(super) fn detect_chapter_count<M: LanguageModel + ?Sized>(
    ctx: &StageContext<'_, M>,
    outline: &str,
) -> Result<u32, PipelineError> {
    let prompt = ctx.render(Stage::ChapterCount, [("outline", outline)])?;
    let reply = ctx.call(Stage::ChapterCount, &ctx.config.models.checker, prompt, 0)?;

    ctx.extractor()
        .read(ctx.model, reply, parse_chapter_count)
        .map_err(|error| match error {
            ExtractError::Model(source) => PipelineError::Model {
                stage: Stage::ChapterCount,
                source,
            },
            ExtractError::Prompt(source) => PipelineError::Prompt {
                stage: Stage::ChapterCount,
                source,
            },
            other => PipelineError::ChapterCountFailed {
                reason: other.to_string(),
            },
        })
}

/// Reads `{"total_chapters": N}`; a bare number is accepted too. Zero and
/// anything above [`MAX_CHAPTERS`] are rejected.
pub(crate) fn parse_chapter_count(raw: &str) -> Result<u32, ExtractError> {
    let count = match parse_lenient(raw) {
        Ok(Value::Object(map)) => COUNT_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(positive_number)),
        Ok(other) => positive_number(&other),
        Err(error) => match raw.trim().parse::<u32>() {
            Ok(count) => Some(count),
            Err(_) => return Err(error),
        },
    };

    match count {
        Some(count) if (1..=MAX_CHAPTERS).contains(&count) => Ok(count),
        Some(_) => Err(ExtractError::Shape {
            expected: "a `total_chapters` number between 1 and 200",
            found: "an out-of-range chapter count",
        }),
        None => Err(ExtractError::Shape {
            expected: "a positive `total_chapters` number",
            found: "no usable chapter count",
        }),
    }
}

fn positive_number(value: &Value) -> Option<u32> {
    match value {
        Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

pub(super) fn expand_chapters<M: LanguageModel + ?Sized>(
    ctx: &StageContext<'_, M>,
    outline: &str,
    chapter_count: u32,
) -> Result<Vec<ChapterOutline>, PipelineError> {
    let mut chapters = Vec::with_capacity(chapter_count as usize);
    for number in 1..=chapter_count {
        let text = if ctx.config.expand_outline {
            ctx.log(LogLevel::Info, format!("outlining chapter {number}/{chapter_count}"));
            ctx.generate(
                Stage::ChapterOutline,
                &ctx.config.models.chapter_outline,
                ctx.render(
                    Stage::ChapterOutline,
                    [
                        ("outline", outline.to_string()),
                        ("chapter_number", number.to_string()),
                        ("chapter_count", chapter_count.to_string()),
                    ],
                )?,
                0,
            )?
        } else {
            format!("{outline}\n\nFocus on chapter {number} of {chapter_count}.")
        };
        chapters.push(ChapterOutline { number, text });
    }
    Ok(chapters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_chapter_count_variants() {
        assert_eq!(parse_chapter_count(r#"{"total_chapters": 3}"#).unwrap(), 3);
        assert_eq!(
            parse_chapter_count("```json\n{\"TotalChapters\": \"5\"}\n```").unwrap(),
            5
        );
        assert_eq!(parse_chapter_count("7").unwrap(), 7);
    }

    #[test]
    fn rejects_zero_and_prose() {
        assert!(parse_chapter_count(r#"{"total_chapters": 0}"#).is_err());
        assert!(parse_chapter_count("There are several chapters.").is_err());
    }

    #[test]
    fn rejects_runaway_counts() {
        assert_eq!(parse_chapter_count("200").unwrap(), MAX_CHAPTERS);
        assert!(matches!(
            parse_chapter_count(r#"{"total_chapters": 100000}"#),
            Err(ExtractError::Shape { .. })
        ));
        assert!(parse_chapter_count(r#"{"total_chapters": 4000000000}"#).is_err());
    }
}
