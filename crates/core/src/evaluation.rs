use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::extract::parse_lenient;
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::model::{send_traced, GenerationRequest, LanguageModel, LanguageModelError};
use crate::prompts::{PromptArguments, PromptError, PromptRegistry};

/// Outcome applied when a critique neither clearly passes nor clearly fails.
/// Failing keeps the revision loop going, bounded by its maximum.
pub const AMBIGUOUS_VERDICT_PASSES: bool = false;

const VERDICT_KEYS: [&str; 6] = [
    "verdict",
    "is_complete",
    "IsComplete",
    "pass",
    "passed",
    "complete",
];
const FEEDBACK_KEYS: [&str; 3] = ["feedback", "Feedback", "critique"];
const AFFIRMATIVE: [&str; 7] = ["yes", "true", "pass", "passed", "complete", "approved", "approve"];
const NEGATIVE: [&str; 8] = [
    "no",
    "false",
    "fail",
    "failed",
    "incomplete",
    "reject",
    "rejected",
    "not",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RubricKind {
    OutlineCompleteness,
    ChapterAdherence,
}

impl RubricKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::OutlineCompleteness => "outline completeness",
            Self::ChapterAdherence => "chapter adherence",
        }
    }

    fn prompt_key(&self) -> &'static str {
        match self {
            Self::OutlineCompleteness => "evaluate_outline",
            Self::ChapterAdherence => "evaluate_chapter",
        }
    }
}

impl fmt::Display for RubricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Evaluation {
    pub passed: bool,
    pub feedback: String,
}

impl Evaluation {
    pub fn pass(feedback: impl Into<String>) -> Self {
        Self {
            passed: true,
            feedback: feedback.into(),
        }
    }

    pub fn fail(feedback: impl Into<String>) -> Self {
        Self {
            passed: false,
            feedback: feedback.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Pass,
    Fail,
    Ambiguous,
}

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("failed to render {rubric} prompt: {source}")]
    Prompt {
        rubric: RubricKind,
        #[source]
        source: PromptError,
    },
    #[error("{rubric} evaluation request failed: {source}")]
    Model {
        rubric: RubricKind,
        #[source]
        source: LanguageModelError,
    },
}

/// Critiques content against a rubric with a single model request.
pub struct QualityEvaluator<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    model_id: &'a str,
    seed: Option<u64>,
    debug: bool,
}

impl<'a> QualityEvaluator<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink, model_id: &'a str) -> Self {
        Self {
            prompts,
            sink,
            model_id,
            seed: None,
            debug: false,
        }
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Logs the critique request and reply at debug level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn evaluate<M: LanguageModel + ?Sized>(
        &self,
        model: &M,
        content: &str,
        context: &str,
        rubric: RubricKind,
    ) -> Result<Evaluation, EvaluationError> {
        let prompt = self
            .prompts
            .format_with(
                rubric.prompt_key(),
                [("content", content), ("context", context)],
            )
            .map_err(|source| EvaluationError::Prompt { rubric, source })?;

        let mut builder = GenerationRequest::builder(self.model_id).label(rubric.prompt_key());
        if let Ok(system) = self.prompts.format("system", &PromptArguments::new()) {
            builder = builder.system(system);
        }
        let request = builder
            .user(prompt)
            .seed(self.seed)
            .build();
        let reply = send_traced(model, &request, self.sink, self.debug)
            .map_err(|source| EvaluationError::Model { rubric, source })?;

        let (verdict, feedback) = read_critique(reply.text());
        let passed = match verdict {
            Verdict::Pass => true,
            Verdict::Fail => false,
            Verdict::Ambiguous => {
                self.sink.log(LogRecord::new(
                    LogLevel::Debug,
                    format!(
                        "{rubric} verdict ambiguous, treating as {}",
                        if AMBIGUOUS_VERDICT_PASSES { "pass" } else { "fail" }
                    ),
                ));
                AMBIGUOUS_VERDICT_PASSES
            }
        };

        self.sink.log(LogRecord::new(
            LogLevel::Info,
            format!(
                "{rubric}: {}",
                if passed { "passed" } else { "needs revision" }
            ),
        ));
        Ok(Evaluation { passed, feedback })
    }
}

/// Splits a critique into its verdict and feedback. Structured fields win;
/// free text falls back to a keyword scan and is used whole as feedback.
pub fn read_critique(raw: &str) -> (Verdict, String) {
    if let Ok(Value::Object(map)) = parse_lenient(raw) {
        let verdict = VERDICT_KEYS
            .iter()
            .find_map(|key| map.get(*key).map(verdict_of_value));
        let feedback = FEEDBACK_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::to_string);

        if verdict.is_some() || feedback.is_some() {
            let feedback = feedback.unwrap_or_else(|| raw.trim().to_string());
            let verdict = verdict.unwrap_or_else(|| scan_keywords(&feedback));
            return (verdict, feedback);
        }
    }
    (scan_keywords(raw), raw.trim().to_string())
}

fn verdict_of_value(value: &Value) -> Verdict {
    match value {
        Value::Bool(true) => Verdict::Pass,
        Value::Bool(false) => Verdict::Fail,
        Value::String(text) => scan_keywords(text),
        _ => Verdict::Ambiguous,
    }
}

/// Pass only when affirmative words appear and negative ones don't, and the
/// other way round for fail.
pub fn scan_keywords(text: &str) -> Verdict {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();
    let affirmative = words.iter().any(|word| AFFIRMATIVE.contains(word));
    let negative = words.iter().any(|word| NEGATIVE.contains(word));
    match (affirmative, negative) {
        (true, false) => Verdict::Pass,
        (false, true) => Verdict::Fail,
        _ => Verdict::Ambiguous,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::VecLogSink;
    use crate::model::GenerationResult;

    #[test]
    fn structured_verdict_wins() {
        let raw = "```json\n{\"feedback\": \"Chapter 3 is missing.\", \"verdict\": false}\n```";
        let (verdict, feedback) = read_critique(raw);
        assert_eq!(verdict, Verdict::Fail);
        assert_eq!(feedback, "Chapter 3 is missing.");

        let (verdict, _) = read_critique(r#"{"IsComplete": "Yes", "feedback": "fine"}"#);
        assert_eq!(verdict, Verdict::Pass);
    }

    #[test]
    fn free_text_falls_back_to_keywords() {
        assert_eq!(scan_keywords("Yes, the outline is complete."), Verdict::Pass);
        assert_eq!(scan_keywords("The outline is incomplete."), Verdict::Fail);
        assert_eq!(
            scan_keywords("Yes in places, but no in others."),
            Verdict::Ambiguous
        );
        assert_eq!(scan_keywords("Lovely imagery."), Verdict::Ambiguous);
    }

    struct Fixed(&'static str);

    impl LanguageModel for Fixed {
        fn send(
            &self,
            request: &GenerationRequest,
        ) -> Result<GenerationResult, LanguageModelError> {
            Ok(GenerationResult::from_reply(request, self.0))
        }
    }

    #[test]
    fn ambiguous_critique_fails_and_is_logged() {
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let evaluator = QualityEvaluator::new(&prompts, &sink, "critic");

        let evaluation = evaluator
            .evaluate(
                &Fixed("Some strong scenes."),
                "draft",
                "outline",
                RubricKind::ChapterAdherence,
            )
            .unwrap();
        assert_eq!(evaluation.passed, AMBIGUOUS_VERDICT_PASSES);
        assert_eq!(evaluation.feedback, "Some strong scenes.");
        assert_eq!(sink.count_at(LogLevel::Debug), 1);
    }
}
