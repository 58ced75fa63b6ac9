use crate::config::RevisionBounds;
use crate::evaluation::Evaluation;
use crate::logging::{LogLevel, LogRecord, LogSink};

/// Prior content plus the critique it received, handed to the generator
/// when a revision is requested.
#[derive(Clone, Copy, Debug)]
pub struct Revise<'c> {
    pub content: &'c str,
    pub feedback: &'c str,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevisionState {
    pub content: String,
    pub revision_count: u32,
    pub last_feedback: Option<String>,
}

/// Bounded generate / evaluate / revise driver.
///
/// The first draft comes from `generate(None)`. While fewer than `max`
/// revisions have been made the draft is evaluated; it is accepted once it
/// passes and at least `min` revisions have happened, otherwise it is
/// regenerated with the critique. Hitting `max` without a pass accepts the
/// current draft with a warning.
pub struct RevisionLoop<'a> {
    bounds: RevisionBounds,
    sink: &'a dyn LogSink,
    subject: &'a str,
}

impl<'a> RevisionLoop<'a> {
    pub fn new(bounds: RevisionBounds, sink: &'a dyn LogSink) -> Self {
        let clamped = RevisionBounds::new(bounds.min.min(bounds.max), bounds.max);
        if clamped != bounds {
            sink.log(LogRecord::new(
                LogLevel::Warn,
                format!(
                    "minimum revisions {} exceeds maximum {}, clamping to {}",
                    bounds.min, bounds.max, clamped.min
                ),
            ));
        }
        Self {
            bounds: clamped,
            sink,
            subject: "draft",
        }
    }

    pub fn with_subject(mut self, subject: &'a str) -> Self {
        self.subject = subject;
        self
    }

    pub fn run<G, V, E>(&self, mut generate: G, mut evaluate: V) -> Result<RevisionState, E>
    where
        G: FnMut(Option<Revise<'_>>) -> Result<String, E>,
        V: FnMut(&str) -> Result<Evaluation, E>,
    {
        let mut state = RevisionState {
            content: generate(None)?,
            revision_count: 0,
            last_feedback: None,
        };
        let mut last_passed = false;

        while state.revision_count < self.bounds.max {
            let evaluation = evaluate(&state.content)?;
            last_passed = evaluation.passed;
            if evaluation.passed && state.revision_count >= self.bounds.min {
                self.log(
                    LogLevel::Info,
                    format!(
                        "{} accepted after {} revision(s)",
                        self.subject, state.revision_count
                    ),
                );
                return Ok(state);
            }

            self.log(
                LogLevel::Info,
                format!(
                    "revising {} ({}/{})",
                    self.subject,
                    state.revision_count + 1,
                    self.bounds.max
                ),
            );
            let revised = generate(Some(Revise {
                content: &state.content,
                feedback: &evaluation.feedback,
            }))?;
            state.content = revised;
            state.revision_count += 1;
            state.last_feedback = Some(evaluation.feedback);
        }

        if self.bounds.max > 0 && !last_passed {
            self.log(
                LogLevel::Warn,
                format!(
                    "{} reached {} revision(s) without passing evaluation, accepting it as is",
                    self.subject, self.bounds.max
                ),
            );
        }
        Ok(state)
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message));
    }
}
