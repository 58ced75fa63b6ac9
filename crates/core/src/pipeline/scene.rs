use std::thread;

use super::{ChapterOutline, PipelineError, Stage, StageContext};
use crate::extract::SceneRecord;
use crate::logging::LogLevel;
use crate::model::LanguageModel;

/// Chapter by scenes: scene outline, scene list, one request per scene, then
/// the scene texts joined in list order.
pub(super) fn write_by_scenes<M: LanguageModel + ?Sized>(
    ctx: &StageContext<'_, M>,
    outline: &str,
    chapter: &ChapterOutline,
    history: &str,
) -> Result<String, PipelineError> {
    let models = &ctx.config.models;
    let number = chapter.number.to_string();

    let scene_outline = ctx.generate(
        Stage::SceneOutline,
        &models.chapter_stage1,
        ctx.render(
            Stage::SceneOutline,
            [
                ("outline", outline),
                ("chapter_outline", chapter.text.as_str()),
                ("chapter_number", number.as_str()),
                ("history", history),
            ],
        )?,
        0,
    )?;

    let listing = ctx.call(
        Stage::SceneExtraction,
        &models.checker,
        ctx.render(
            Stage::SceneExtraction,
            [("scene_outline", scene_outline.as_str())],
        )?,
        0,
    )?;
    let scenes = ctx
        .extractor()
        .extract(ctx.model, listing)
        .map_err(|error| PipelineError::extraction(Stage::SceneExtraction, error))?;
    ctx.log(LogLevel::Info, format!("chapter {}: {} scene(s)", chapter.number, scenes.len()));

    let texts = if ctx.config.parallel_scenes && scenes.len() > 1 {
        write_parallel(ctx, outline, history, &scenes)?
    } else {
        scenes
            .iter()
            .map(|scene| write_scene(ctx, outline, history, scene))
            .collect::<Result<Vec<_>, _>>()?
    };
    Ok(assemble_scenes(&texts))
}

fn write_parallel<M: LanguageModel + ?Sized>(
    ctx: &StageContext<'_, M>,
    outline: &str,
    history: &str,
    scenes: &[SceneRecord],
) -> Result<Vec<String>, PipelineError> {
    thread::scope(|scope| {
        let handles: Vec<_> = scenes
            .iter()
            .map(|scene| scope.spawn(move || write_scene(ctx, outline, history, scene)))
            .collect();
        // Joined in spawn order, so results line up with the scene list.
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}

fn write_scene<M: LanguageModel + ?Sized>(
    ctx: &StageContext<'_, M>,
    outline: &str,
    history: &str,
    scene: &SceneRecord,
) -> Result<String, PipelineError> {
    let min_words = ctx.config.scene_min_words;
    ctx.log(LogLevel::Debug, format!("writing scene {}", scene.index));
    ctx.generate(
        Stage::SceneText,
        &ctx.config.models.chapter_stage1,
        ctx.render(
            Stage::SceneText,
            [
                ("outline", outline.to_string()),
                ("word_target", min_words.to_string()),
                ("history", history.to_string()),
                ("scene", scene.to_string()),
            ],
        )?,
        min_words,
    )
}

/// Joins scene texts in the given order, separated by a blank line.
pub fn assemble_scenes<S: AsRef<str>>(texts: &[S]) -> String {
    texts
        .iter()
        .map(|text| text.as_ref().trim())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
