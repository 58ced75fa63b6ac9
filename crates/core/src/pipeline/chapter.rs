use super::outline::Outline;
use super::scene;
use super::{ChapterDraft, ChapterOutline, PipelineError, Stage, StageContext};
use crate::evaluation::RubricKind;
use crate::logging::LogLevel;
use crate::model::LanguageModel;
use crate::revision::Revise;

/// Drafts a chapter with the configured pipeline and runs it through the
/// chapter revision loop.
pub(super) fn write_revised_chapter<M: LanguageModel + ?Sized>(
    ctx: &StageContext<'_, M>,
    outline: &Outline,
    chapter: &ChapterOutline,
    summaries: &[String],
) -> Result<ChapterDraft, PipelineError> {
    let subject = format!("chapter {}", chapter.number);
    let state = ctx
        .revision_loop(ctx.config.effective_chapter_revisions())
        .with_subject(&subject)
        .run(
            |revise| match revise {
                None => draft_chapter(ctx, outline, chapter, summaries),
                Some(revise) => revise_chapter(ctx, chapter, revise),
            },
            |content| {
                ctx.evaluate(
                    Stage::ChapterEvaluation,
                    content,
                    &chapter.text,
                    RubricKind::ChapterAdherence,
                )
            },
        )?;

    Ok(ChapterDraft {
        number: chapter.number,
        text: state.content,
    })
}

fn draft_chapter<M: LanguageModel + ?Sized>(
    ctx: &StageContext<'_, M>,
    outline: &Outline,
    chapter: &ChapterOutline,
    summaries: &[String],
) -> Result<String, PipelineError> {
    let history = continuity(summaries);
    if ctx.config.scene_pipeline {
        scene::write_by_scenes(ctx, &outline.text, chapter, &history)
    } else {
        write_in_stages(ctx, outline, chapter, &history)
    }
}

/// Plot, then dialogue, then description, then a final pass. Each stage
/// rewrites the previous stage's draft.
fn write_in_stages<M: LanguageModel + ?Sized>(
    ctx: &StageContext<'_, M>,
    outline: &Outline,
    chapter: &ChapterOutline,
    history: &str,
) -> Result<String, PipelineError> {
    let models = &ctx.config.models;
    let min_words = ctx.config.chapter_min_words;
    let number = chapter.number.to_string();
    let word_target = min_words.to_string();

    ctx.log(LogLevel::Info, format!("chapter {}: plot", chapter.number));
    let plot = ctx.generate(
        Stage::ChapterPlot,
        &models.chapter_stage1,
        ctx.render(
            Stage::ChapterPlot,
            [
                ("chapter_number", number.as_str()),
                ("word_target", word_target.as_str()),
                ("outline", outline.text.as_str()),
                ("chapter_outline", chapter.text.as_str()),
                ("history", history),
            ],
        )?,
        min_words,
    )?;

    let rewrites = [
        (Stage::ChapterDialogue, &models.chapter_stage2, "dialogue"),
        (Stage::ChapterDescription, &models.chapter_stage3, "description"),
        (Stage::ChapterFinalPass, &models.chapter_stage4, "final pass"),
    ];
    let mut draft = plot;
    for (stage, model_id, name) in rewrites {
        ctx.log(LogLevel::Info, format!("chapter {}: {name}", chapter.number));
        draft = ctx.generate(
            stage,
            model_id,
            ctx.render(
                stage,
                [
                    ("chapter_number", number.as_str()),
                    ("draft", draft.as_str()),
                    ("chapter_outline", chapter.text.as_str()),
                    ("word_target", word_target.as_str()),
                ],
            )?,
            min_words,
        )?;
    }
    Ok(draft)
}

fn revise_chapter<M: LanguageModel + ?Sized>(
    ctx: &StageContext<'_, M>,
    chapter: &ChapterOutline,
    revise: Revise<'_>,
) -> Result<String, PipelineError> {
    ctx.generate(
        Stage::ChapterRevision,
        &ctx.config.models.chapter_revision,
        ctx.render(
            Stage::ChapterRevision,
            [
                ("chapter", revise.content),
                ("feedback", revise.feedback),
                ("chapter_outline", chapter.text.as_str()),
            ],
        )?,
        ctx.config.chapter_min_words,
    )
}

/// One-paragraph summary carried forward as continuity for later chapters.
pub(super) fn summarize<M: LanguageModel + ?Sized>(
    ctx: &StageContext<'_, M>,
    draft: &ChapterDraft,
) -> Result<String, PipelineError> {
    ctx.generate(
        Stage::ChapterSummary,
        &ctx.config.models.checker,
        ctx.render(
            Stage::ChapterSummary,
            [
                ("chapter_number", draft.number.to_string()),
                ("chapter", draft.text.clone()),
            ],
        )?,
        0,
    )
}

fn continuity(summaries: &[String]) -> String {
    if summaries.is_empty() {
        return "This is the first chapter.".to_string();
    }
    summaries
        .iter()
        .enumerate()
        .map(|(i, summary)| format!("Chapter {}: {}", i + 1, summary.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::continuity;

    #[test]
    fn continuity_lists_previous_chapters() {
        assert_eq!(continuity(&[]), "This is the first chapter.");
        assert_eq!(
            continuity(&["Mara finds a bottle.".to_string(), " A storm. ".to_string()]),
            "Chapter 1: Mara finds a bottle.\nChapter 2: A storm."
        );
    }
}
