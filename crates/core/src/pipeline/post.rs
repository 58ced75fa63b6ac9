use super::{ChapterDraft, PipelineError, Stage, StageContext};
use crate::logging::LogLevel;
use crate::model::LanguageModel;

pub(super) fn translate_prompt<M: LanguageModel + ?Sized>(
    ctx: &StageContext<'_, M>,
    prompt: &str,
    language: &str,
) -> Result<String, PipelineError> {
    ctx.log(LogLevel::Info, format!("translating prompt to {language}"));
    ctx.generate(
        Stage::PromptTranslation,
        &ctx.config.models.translator,
        ctx.render(
            Stage::PromptTranslation,
            [("language", language), ("prompt", prompt)],
        )?,
        0,
    )
}

/// Re-edits every chapter with the whole story as context. Later chapters
/// see the edits made to earlier ones.
pub(super) fn final_edit<M: LanguageModel + ?Sized>(
    ctx: &StageContext<'_, M>,
    chapters: &mut [ChapterDraft],
) -> Result<(), PipelineError> {
    for i in 0..chapters.len() {
        let story = chapters
            .iter()
            .map(|chapter| chapter.text.trim())
            .collect::<Vec<_>>()
            .join("\n\n");
        let chapter = &chapters[i];
        ctx.log(LogLevel::Info, format!("final edit of chapter {}", chapter.number));
        let edited = ctx.generate(
            Stage::FinalEdit,
            &ctx.config.models.chapter_revision,
            ctx.render(
                Stage::FinalEdit,
                [
                    ("story", story),
                    ("chapter_number", chapter.number.to_string()),
                    ("chapter", chapter.text.clone()),
                ],
            )?,
            0,
        )?;
        chapters[i].text = edited;
    }
    Ok(())
}

pub(super) fn scrub<M: LanguageModel + ?Sized>(
    ctx: &StageContext<'_, M>,
    chapters: &mut [ChapterDraft],
) -> Result<(), PipelineError> {
    for chapter in chapters.iter_mut() {
        ctx.log(LogLevel::Info, format!("scrubbing chapter {}", chapter.number));
        chapter.text = ctx.generate(
            Stage::Scrub,
            &ctx.config.models.scrub,
            ctx.render(Stage::Scrub, [("chapter", chapter.text.as_str())])?,
            0,
        )?;
    }
    Ok(())
}

pub(super) fn translate<M: LanguageModel + ?Sized>(
    ctx: &StageContext<'_, M>,
    chapters: &mut [ChapterDraft],
    language: &str,
) -> Result<(), PipelineError> {
    for chapter in chapters.iter_mut() {
        ctx.log(LogLevel::Info, format!("translating chapter {} to {language}", chapter.number));
        chapter.text = ctx.generate(
            Stage::Translation,
            &ctx.config.models.translator,
            ctx.render(
                Stage::Translation,
                [("chapter", chapter.text.as_str()), ("language", language)],
            )?,
            0,
        )?;
    }
    Ok(())
}
