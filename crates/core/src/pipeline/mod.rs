//! Stage pipelines and the driver that sequences them into a full story.

mod chapter;
mod info;
mod outline;
mod post;
mod scene;

use std::fmt;

use thiserror::Error;

use crate::config::PipelineConfig;
use crate::evaluation::{EvaluationError, QualityEvaluator, RubricKind};
use crate::extract::{ExtractError, SceneExtractor};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::model::{
    send_traced, GenerationRequest, GenerationResult, LanguageModel, LanguageModelError,
};
use crate::prompts::{PromptArguments, PromptError, PromptRegistry};
use crate::revision::RevisionLoop;

pub use info::{slugify, StoryInfo};
pub use outline::{Outline, MAX_CHAPTERS};
pub use scene::assemble_scenes;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Stage {
    PromptTranslation,
    StoryElements,
    InitialOutline,
    OutlineEvaluation,
    OutlineRevision,
    ChapterCount,
    ChapterOutline,
    ChapterPlot,
    ChapterDialogue,
    ChapterDescription,
    ChapterFinalPass,
    ChapterEvaluation,
    ChapterRevision,
    SceneOutline,
    SceneExtraction,
    SceneText,
    ChapterSummary,
    FinalEdit,
    Scrub,
    Translation,
    StoryInfo,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::PromptTranslation => "translate_prompt",
            Self::StoryElements => "story_elements",
            Self::InitialOutline => "initial_outline",
            Self::OutlineEvaluation => "evaluate_outline",
            Self::OutlineRevision => "revise_outline",
            Self::ChapterCount => "chapter_count",
            Self::ChapterOutline => "chapter_outline",
            Self::ChapterPlot => "chapter_plot",
            Self::ChapterDialogue => "chapter_dialogue",
            Self::ChapterDescription => "chapter_description",
            Self::ChapterFinalPass => "chapter_final_pass",
            Self::ChapterEvaluation => "evaluate_chapter",
            Self::ChapterRevision => "revise_chapter",
            Self::SceneOutline => "chapter_to_scenes",
            Self::SceneExtraction => "scenes_to_json",
            Self::SceneText => "scene_to_text",
            Self::ChapterSummary => "chapter_summary",
            Self::FinalEdit => "final_edit",
            Self::Scrub => "scrub_chapter",
            Self::Translation => "translate_chapter",
            Self::StoryInfo => "story_info",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("language model request failed at stage {stage}: {source}")]
    Model {
        stage: Stage,
        #[source]
        source: LanguageModelError,
    },
    #[error("failed to render prompt for stage {stage}: {source}")]
    Prompt {
        stage: Stage,
        #[source]
        source: PromptError,
    },
    #[error("could not read structured output at stage {stage}: {source}")]
    Extraction {
        stage: Stage,
        #[source]
        source: ExtractError,
    },
    #[error("could not determine the number of chapters: {reason}")]
    ChapterCountFailed { reason: String },
    #[error("stage {stage} returned empty content")]
    EmptyOutput { stage: Stage },
    #[error("chapter {number} failed: {source}")]
    Chapter {
        number: u32,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Stage the failure originated in, looking through chapter wrappers.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Model { stage, .. }
            | Self::Prompt { stage, .. }
            | Self::Extraction { stage, .. }
            | Self::EmptyOutput { stage } => *stage,
            Self::ChapterCountFailed { .. } => Stage::ChapterCount,
            Self::Chapter { source, .. } => source.stage(),
        }
    }

    fn evaluation(stage: Stage, error: EvaluationError) -> Self {
        match error {
            EvaluationError::Prompt { source, .. } => Self::Prompt { stage, source },
            EvaluationError::Model { source, .. } => Self::Model { stage, source },
        }
    }

    fn extraction(stage: Stage, error: ExtractError) -> Self {
        match error {
            ExtractError::Model(source) => Self::Model { stage, source },
            ExtractError::Prompt(source) => Self::Prompt { stage, source },
            source => Self::Extraction { stage, source },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChapterOutline {
    pub number: u32,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChapterDraft {
    pub number: u32,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Story {
    pub info: StoryInfo,
    pub outline: String,
    pub chapters: Vec<ChapterDraft>,
}

impl Story {
    /// Chapter texts in chapter order, separated by a blank line.
    pub fn text(&self) -> String {
        let mut chapters: Vec<&ChapterDraft> = self.chapters.iter().collect();
        chapters.sort_by_key(|chapter| chapter.number);
        chapters
            .iter()
            .map(|chapter| chapter.text.trim())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn word_count(&self) -> usize {
        crate::model::word_count(&self.text())
    }

    /// Markdown document with title, summary, chapters and the outline.
    pub fn render_document(&self) -> String {
        let mut doc = format!("# {}\n\n", self.info.title);
        if !self.info.summary.trim().is_empty() {
            doc.push_str(self.info.summary.trim());
            doc.push_str("\n\n");
        }
        if !self.info.tags.trim().is_empty() {
            doc.push_str(&format!("Tags: {}\n\n", self.info.tags.trim()));
        }

        let mut chapters: Vec<&ChapterDraft> = self.chapters.iter().collect();
        chapters.sort_by_key(|chapter| chapter.number);
        for chapter in chapters {
            doc.push_str(&format!(
                "## Chapter {}\n\n{}\n\n",
                chapter.number,
                chapter.text.trim()
            ));
        }

        doc.push_str("---\n\n## Outline\n\n");
        doc.push_str(self.outline.trim());
        doc.push('\n');
        doc
    }
}

/// Borrowed collaborators shared by every stage of one run.
pub(crate) struct StageContext<'a, M: ?Sized> {
    pub(crate) model: &'a M,
    pub(crate) prompts: &'a PromptRegistry,
    pub(crate) sink: &'a dyn LogSink,
    pub(crate) config: &'a PipelineConfig,
}

impl<'a, M: LanguageModel + ?Sized> StageContext<'a, M> {
    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message));
    }

    pub(crate) fn render<I, K, V>(
        &self,
        stage: Stage,
        arguments: I,
    ) -> Result<String, PipelineError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.prompts
            .format_with(stage.label(), arguments)
            .map_err(|source| PipelineError::Prompt { stage, source })
    }

    fn system_prompt(&self) -> Option<String> {
        self.prompts
            .format("system", &PromptArguments::new())
            .ok()
            .filter(|text| !text.trim().is_empty())
    }

    /// Sends one single-turn request and rejects blank replies.
    pub(crate) fn call(
        &self,
        stage: Stage,
        model_id: &str,
        prompt: String,
        min_words: usize,
    ) -> Result<GenerationResult, PipelineError> {
        let mut builder = GenerationRequest::builder(model_id).label(stage.label());
        if let Some(system) = self.system_prompt() {
            builder = builder.system(system);
        }
        let request = builder
            .user(prompt)
            .min_word_count(min_words)
            .seed(Some(self.config.seed))
            .build();
        self.send(stage, &request)
    }

    pub(crate) fn send(
        &self,
        stage: Stage,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, PipelineError> {
        let result = send_traced(self.model, request, self.sink, self.config.debug)
            .map_err(|source| PipelineError::Model { stage, source })?;
        if result.text().trim().is_empty() {
            return Err(PipelineError::EmptyOutput { stage });
        }
        Ok(result)
    }

    pub(crate) fn generate(
        &self,
        stage: Stage,
        model_id: &str,
        prompt: String,
        min_words: usize,
    ) -> Result<String, PipelineError> {
        Ok(self
            .call(stage, model_id, prompt, min_words)?
            .into_text()
            .trim()
            .to_string())
    }

    pub(crate) fn evaluator(&self) -> QualityEvaluator<'a> {
        QualityEvaluator::new(self.prompts, self.sink, &self.config.models.evaluation)
            .with_seed(Some(self.config.seed))
            .with_debug(self.config.debug)
    }

    pub(crate) fn evaluate(
        &self,
        stage: Stage,
        content: &str,
        context: &str,
        rubric: RubricKind,
    ) -> Result<crate::evaluation::Evaluation, PipelineError> {
        self.evaluator()
            .evaluate(self.model, content, context, rubric)
            .map_err(|error| PipelineError::evaluation(stage, error))
    }

    pub(crate) fn extractor(&self) -> SceneExtractor<'a> {
        SceneExtractor::new(self.prompts, self.sink, &self.config.models.checker)
            .with_max_repair_requests(self.config.max_repair_requests)
            .with_seed(Some(self.config.seed))
            .with_debug(self.config.debug)
    }

    pub(crate) fn revision_loop(&self, bounds: crate::config::RevisionBounds) -> RevisionLoop<'a> {
        RevisionLoop::new(bounds, self.sink)
    }
}

/// Runs every stage for one prompt: outline, chapters, post-passes and story
/// info. Chapters are written strictly in order; any fatal error aborts the
/// run.
pub struct StoryPipeline<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    config: &'a PipelineConfig,
}

impl<'a> StoryPipeline<'a> {
    pub fn new(
        prompts: &'a PromptRegistry,
        sink: &'a dyn LogSink,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            prompts,
            sink,
            config,
        }
    }

    pub fn run<M: LanguageModel + ?Sized>(
        &self,
        model: &M,
        prompt: &str,
    ) -> Result<Story, PipelineError> {
        let ctx = StageContext {
            model,
            prompts: self.prompts,
            sink: self.sink,
            config: self.config,
        };

        let prompt = match self.config.translate_prompt_language() {
            Some(language) => post::translate_prompt(&ctx, prompt, language)?,
            None => prompt.trim().to_string(),
        };

        let outline = outline::write_outline(&ctx, &prompt)?;
        ctx.log(
            LogLevel::Info,
            format!("outline ready after {} revision(s)", outline.revision_count),
        );
        let chapter_count = outline::detect_chapter_count(&ctx, &outline.text)?;
        ctx.log(LogLevel::Info, format!("outline declares {chapter_count} chapter(s)"));
        let chapter_outlines = outline::expand_chapters(&ctx, &outline.text, chapter_count)?;

        let mut chapters: Vec<ChapterDraft> = Vec::with_capacity(chapter_outlines.len());
        let mut summaries: Vec<String> = Vec::new();
        for chapter_outline in &chapter_outlines {
            let number = chapter_outline.number;
            let wrap = |source: PipelineError| PipelineError::Chapter {
                number,
                source: Box::new(source),
            };
            ctx.log(LogLevel::Info, format!("writing chapter {number}/{chapter_count}"));
            let draft = chapter::write_revised_chapter(&ctx, &outline, chapter_outline, &summaries)
                .map_err(wrap)?;
            let summary = chapter::summarize(&ctx, &draft).map_err(wrap)?;
            summaries.push(summary);
            chapters.push(draft);
        }

        if self.config.final_edit_pass {
            post::final_edit(&ctx, &mut chapters)?;
        }
        if self.config.scrub {
            post::scrub(&ctx, &mut chapters)?;
        }
        if let Some(language) = self.config.translate_language() {
            post::translate(&ctx, &mut chapters, language)?;
        }

        let info = info::story_info(&ctx, &outline.text, &prompt);
        let story = Story {
            info,
            outline: outline.text,
            chapters,
        };
        ctx.log(
            LogLevel::Info,
            format!(
                "finished \"{}\": {} chapter(s), {} words",
                story.info.title,
                story.chapters.len(),
                story.word_count()
            ),
        );
        Ok(story)
    }
}
