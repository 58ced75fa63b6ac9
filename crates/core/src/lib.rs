pub mod config;
pub mod evaluation;
pub mod extract;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod prompts;
pub mod revision;

pub use config::{
    Config, ConfigError, LlmConfig, PipelineConfig, PromptConfig, RevisionBounds, StageModels,
    DEFAULT_PROFILE,
};
pub use evaluation::{
    Evaluation, EvaluationError, QualityEvaluator, RubricKind, Verdict, AMBIGUOUS_VERDICT_PASSES,
};
pub use extract::{extract_scenes, ExtractError, SceneExtractor, SceneRecord};
pub use logging::{
    LogLevel, LogRecord, LogSink, NullLogSink, SharedLogSink, SinkLogger, StdoutLogSink,
    VecLogSink,
};
pub use model::{
    word_count, ChatMessage, GenerationRequest, GenerationRequestBuilder, GenerationResult,
    LanguageModel, LanguageModelError, Role,
};
pub use pipeline::{
    assemble_scenes, slugify, ChapterDraft, ChapterOutline, Outline, PipelineError, Stage, Story,
    StoryInfo, StoryPipeline, MAX_CHAPTERS,
};
pub use prompts::{PromptArguments, PromptError, PromptRegistry, PromptSource, PromptTemplate};
pub use revision::{Revise, RevisionLoop, RevisionState};
