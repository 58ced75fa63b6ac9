use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use storyforge_core::{
    GenerationRequest, GenerationResult, LanguageModel, LanguageModelError, LogLevel,
    PipelineConfig, PipelineError, PromptRegistry, RevisionBounds, Role, Stage, StoryPipeline,
    VecLogSink,
};

const LIGHTHOUSE_PROMPT: &str =
    "A lighthouse keeper finds a message in a bottle that predicts tomorrow's storm.";

type Responder = Box<dyn Fn(&GenerationRequest) -> String + Send + Sync>;

#[derive(Clone, Debug)]
struct Call {
    label: String,
    model: String,
    min_word_count: usize,
    seed: Option<u64>,
    has_system: bool,
    prompt: String,
}

/// Replies per request label, either from a queue or computed from the
/// request, and records every call it receives.
#[derive(Default)]
struct ScriptedModel {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    responders: HashMap<String, Responder>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedModel {
    fn new() -> Self {
        Self::default()
    }

    fn script<I, S>(self, label: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues
            .lock()
            .expect("mock mutex poisoned")
            .entry(label.to_string())
            .or_default()
            .extend(replies.into_iter().map(Into::into));
        self
    }

    fn respond_with<F>(mut self, label: &str, responder: F) -> Self
    where
        F: Fn(&GenerationRequest) -> String + Send + Sync + 'static,
    {
        self.responders
            .insert(label.to_string(), Box::new(responder));
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("mock mutex poisoned").clone()
    }

    fn calls_to(&self, label: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.label == label)
            .collect()
    }

    fn assert_empty(&self) {
        let guard = self.queues.lock().expect("mock mutex poisoned");
        for (label, queue) in guard.iter() {
            assert!(
                queue.is_empty(),
                "expected all `{label}` replies to be consumed, {} left",
                queue.len()
            );
        }
    }
}

impl LanguageModel for ScriptedModel {
    fn send(&self, request: &GenerationRequest) -> Result<GenerationResult, LanguageModelError> {
        self.calls.lock().expect("mock mutex poisoned").push(Call {
            label: request.label().to_string(),
            model: request.model().to_string(),
            min_word_count: request.min_word_count(),
            seed: request.seed(),
            has_system: request
                .messages()
                .first()
                .map(|message| message.role == Role::System)
                .unwrap_or(false),
            prompt: request.last_user_message().unwrap_or_default().to_string(),
        });

        if let Some(responder) = self.responders.get(request.label()) {
            return Ok(GenerationResult::from_reply(request, responder(request)));
        }

        let reply = self
            .queues
            .lock()
            .expect("mock mutex poisoned")
            .get_mut(request.label())
            .and_then(VecDeque::pop_front);
        match reply {
            Some(text) => Ok(GenerationResult::from_reply(request, text)),
            None => Err(LanguageModelError::new(io::Error::new(
                io::ErrorKind::Other,
                format!("no scripted reply left for `{}`", request.label()),
            ))),
        }
    }
}

fn quiet_config() -> PipelineConfig {
    PipelineConfig {
        outline_revisions: RevisionBounds::DISABLED,
        chapter_revisions: RevisionBounds::DISABLED,
        scrub: false,
        ..PipelineConfig::default()
    }
}

#[test]
fn monolithic_story_follows_every_stage() -> Result<(), Box<dyn std::error::Error>> {
    let model = ScriptedModel::new()
        .script("story_elements", ["Genre: maritime mystery. Keeper: Mara."])
        .script("initial_outline", ["1. The bottle\n2. The storm"])
        .script(
            "evaluate_outline",
            [r#"{"feedback": "Raise the stakes in chapter 2.", "verdict": false}"#],
        )
        .script("revise_outline", ["1. The bottle\n2. The storm that takes the pier"])
        .script("chapter_count", [r#"{"total_chapters": 2}"#])
        .script(
            "chapter_outline",
            ["Mara finds the bottle.", "The storm hits the pier."],
        )
        .script("chapter_plot", ["plot one", "plot two"])
        .script("chapter_dialogue", ["dialogue one", "dialogue two"])
        .script("chapter_description", ["description one", "description two"])
        .script("chapter_final_pass", ["Chapter one text.", "Chapter two draft."])
        .script(
            "evaluate_chapter",
            [
                r#"{"feedback": "Follows the outline.", "verdict": true}"#,
                r#"{"feedback": "The pier never collapses.", "verdict": false}"#,
            ],
        )
        .script("revise_chapter", ["Chapter two text, pier collapsing."])
        .script(
            "chapter_summary",
            ["Mara found a bottle.", "The storm took the pier."],
        )
        .script(
            "story_info",
            [r#"{"title": "The Keeper's Bottle", "summary": "A warning at sea.", "tags": "mystery, sea", "overall_rating": 80}"#],
        );

    let mut config = PipelineConfig {
        outline_revisions: RevisionBounds::new(0, 1),
        chapter_revisions: RevisionBounds::new(0, 1),
        scrub: false,
        ..PipelineConfig::default()
    };
    config.models.evaluation = "critic".to_string();

    let prompts = PromptRegistry::new()?;
    let sink = VecLogSink::new();
    let story = StoryPipeline::new(&prompts, &sink, &config).run(&model, LIGHTHOUSE_PROMPT)?;
    model.assert_empty();

    assert_eq!(story.outline, "1. The bottle\n2. The storm that takes the pier");
    assert_eq!(story.chapters.len(), 2);
    assert_eq!(story.chapters[0].text, "Chapter one text.");
    assert_eq!(story.chapters[1].text, "Chapter two text, pier collapsing.");
    assert_eq!(
        story.text(),
        "Chapter one text.\n\nChapter two text, pier collapsing."
    );
    assert_eq!(story.info.title, "The Keeper's Bottle");

    assert_eq!(model.calls_to("revise_outline").len(), 1);
    assert_eq!(model.calls_to("chapter_outline").len(), 2);
    for label in [
        "chapter_plot",
        "chapter_dialogue",
        "chapter_description",
        "chapter_final_pass",
    ] {
        let calls = model.calls_to(label);
        assert_eq!(calls.len(), 2, "{label}");
        assert!(calls
            .iter()
            .all(|call| call.min_word_count == config.chapter_min_words));
    }

    // Each stage rewrites the previous stage's output.
    let dialogue = model.calls_to("chapter_dialogue");
    assert!(dialogue[0].prompt.contains("plot one"));
    assert!(model.calls_to("chapter_final_pass")[1]
        .prompt
        .contains("description two"));

    // Later chapters see what happened before.
    assert!(model.calls_to("chapter_plot")[1]
        .prompt
        .contains("Mara found a bottle."));

    let evaluations = model.calls_to("evaluate_chapter");
    assert!(evaluations.iter().all(|call| call.model == "critic"));
    assert!(model
        .calls()
        .iter()
        .all(|call| call.seed == Some(12) && call.has_system));

    assert!(sink
        .records()
        .iter()
        .any(|record| record.message == "outline ready after 1 revision(s)"));

    // The outline and chapter 2 both used their single revision without
    // passing.
    assert_eq!(sink.count_at(LogLevel::Warn), 2);
    Ok(())
}

const THREE_SCENES: &str = "```json
[
  {\"index\": 1, \"summary\": \"Mara pulls the bottle from the surf\", \"characters\": [\"Mara\"], \"setting\": \"Beach\"},
  {\"index\": 2, \"summary\": \"She reads the warning by lamplight\", \"characters\": [\"Mara\"], \"setting\": \"Lamp room\"},
  {\"index\": 3, \"summary\": \"The barometer starts to fall\", \"characters\": [\"Mara\"], \"setting\": \"Lamp room\"}
]
```";

#[test]
fn scene_pipeline_concatenates_scenes_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let model = ScriptedModel::new()
        .script("story_elements", ["elements"])
        .script("initial_outline", ["1. The bottle"])
        .script("chapter_count", [r#"{"total_chapters": 1}"#])
        .script("chapter_outline", ["Mara finds the bottle."])
        .script("chapter_to_scenes", ["Beach, lamp room, barometer."])
        .script("scenes_to_json", [THREE_SCENES])
        .script(
            "scene_to_text",
            ["Scene one prose.", "Scene two prose.", "Scene three prose."],
        )
        .script("chapter_summary", ["Mara found a bottle."])
        .script("story_info", ["not json"]);

    let config = PipelineConfig {
        scene_pipeline: true,
        scene_min_words: 150,
        ..quiet_config()
    };

    let prompts = PromptRegistry::new()?;
    let sink = VecLogSink::new();
    let story = StoryPipeline::new(&prompts, &sink, &config).run(&model, LIGHTHOUSE_PROMPT)?;
    model.assert_empty();

    assert_eq!(
        story.chapters[0].text,
        "Scene one prose.\n\nScene two prose.\n\nScene three prose."
    );

    let scene_calls = model.calls_to("scene_to_text");
    assert_eq!(scene_calls.len(), 3);
    assert!(scene_calls.iter().all(|call| call.min_word_count == 150));
    assert!(scene_calls[1].prompt.contains("She reads the warning by lamplight"));
    assert!(model.calls_to("chapter_plot").is_empty());
    assert!(model.calls_to("evaluate_chapter").is_empty());

    // Unusable story info only costs the title.
    assert_eq!(
        story.info.title,
        "A lighthouse keeper finds a message in a"
    );
    Ok(())
}

const ONE_SCENE: &str = r#"[{"index": 1, "summary": "The storm reaches the pier", "characters": ["Mara"]}]"#;

#[test]
fn scene_chapters_carry_earlier_summaries() -> Result<(), Box<dyn std::error::Error>> {
    let model = ScriptedModel::new()
        .script("story_elements", ["elements"])
        .script("initial_outline", ["1. The bottle\n2. The storm"])
        .script("chapter_count", [r#"{"total_chapters": 2}"#])
        .script("chapter_to_scenes", ["Beach scene.", "Pier scene."])
        .script("scenes_to_json", [ONE_SCENE, ONE_SCENE])
        .script("scene_to_text", ["Chapter one prose.", "Chapter two prose."])
        .script(
            "chapter_summary",
            ["Mara pocketed the warning and told no one.", "The pier fell."],
        )
        .script("story_info", [r#"{"title": "Bottle"}"#]);

    let config = PipelineConfig {
        scene_pipeline: true,
        expand_outline: false,
        ..quiet_config()
    };

    let prompts = PromptRegistry::new()?;
    let sink = VecLogSink::new();
    let story = StoryPipeline::new(&prompts, &sink, &config).run(&model, LIGHTHOUSE_PROMPT)?;
    model.assert_empty();
    assert_eq!(story.chapters.len(), 2);

    let earlier = "Mara pocketed the warning and told no one.";
    let outlines = model.calls_to("chapter_to_scenes");
    let scenes = model.calls_to("scene_to_text");
    assert!(outlines[0].prompt.contains("This is the first chapter."));
    assert!(!scenes[0].prompt.contains(earlier));
    assert!(outlines[1].prompt.contains(earlier));
    assert!(scenes[1].prompt.contains(earlier));
    Ok(())
}

#[test]
fn parallel_scenes_keep_record_order() -> Result<(), Box<dyn std::error::Error>> {
    let model = ScriptedModel::new()
        .script("story_elements", ["elements"])
        .script("initial_outline", ["1. The bottle"])
        .script("chapter_count", [r#"{"total_chapters": 1}"#])
        .script("chapter_to_scenes", ["three scenes"])
        .script("scenes_to_json", [THREE_SCENES])
        .script("chapter_summary", ["summary"])
        .script("story_info", [r#"{"title": "Bottle"}"#])
        .respond_with("scene_to_text", |request| {
            let prompt = request.last_user_message().unwrap_or_default();
            let index = (1..=3)
                .find(|n| prompt.contains(&format!("Scene {n}:")))
                .unwrap_or(0);
            // Earlier scenes finish last.
            thread::sleep(Duration::from_millis(30 * (4 - index as u64)));
            format!("Scene {index} prose.")
        });

    let config = PipelineConfig {
        scene_pipeline: true,
        parallel_scenes: true,
        expand_outline: false,
        ..quiet_config()
    };

    let prompts = PromptRegistry::new()?;
    let sink = VecLogSink::new();
    let story = StoryPipeline::new(&prompts, &sink, &config).run(&model, LIGHTHOUSE_PROMPT)?;
    model.assert_empty();

    assert_eq!(
        story.chapters[0].text,
        "Scene 1 prose.\n\nScene 2 prose.\n\nScene 3 prose."
    );
    assert!(model.calls_to("chapter_outline").is_empty());
    Ok(())
}

#[test]
fn post_passes_run_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let model = ScriptedModel::new()
        .script("translate_prompt", ["Un gardien de phare trouve une bouteille."])
        .script("story_elements", ["elements"])
        .script("initial_outline", ["1. La bouteille"])
        .script("chapter_count", ["1"])
        .script("chapter_plot", ["plot"])
        .script("chapter_dialogue", ["dialogue"])
        .script("chapter_description", ["description"])
        .script("chapter_final_pass", ["final"])
        .script("chapter_summary", ["summary"])
        .script("final_edit", ["edited"])
        .script("scrub_chapter", ["scrubbed"])
        .script("translate_chapter", ["traduit"])
        .script("story_info", ["The title is unclear."]);

    let config = PipelineConfig {
        expand_outline: false,
        final_edit_pass: true,
        scrub: true,
        translate: Some("French".to_string()),
        translate_prompt: Some("French".to_string()),
        ..quiet_config()
    };

    let prompts = PromptRegistry::new()?;
    let sink = VecLogSink::new();
    let story = StoryPipeline::new(&prompts, &sink, &config).run(&model, LIGHTHOUSE_PROMPT)?;
    model.assert_empty();

    assert_eq!(story.text(), "traduit");
    let labels: Vec<String> = model.calls().into_iter().map(|call| call.label).collect();
    assert_eq!(labels.first().map(String::as_str), Some("translate_prompt"));
    let position = |label: &str| labels.iter().position(|l| l == label).unwrap();
    assert!(position("final_edit") < position("scrub_chapter"));
    assert!(position("scrub_chapter") < position("translate_chapter"));
    assert!(model.calls_to("scrub_chapter")[0].prompt.contains("edited"));
    assert!(model.calls_to("story_elements")[0]
        .prompt
        .contains("Un gardien de phare"));
    assert_eq!(story.info.title, "Un gardien de phare trouve une bouteille");
    Ok(())
}

#[test]
fn unreadable_chapter_count_is_fatal() -> Result<(), Box<dyn std::error::Error>> {
    let model = ScriptedModel::new()
        .script("story_elements", ["elements"])
        .script("initial_outline", ["An outline without numbers."])
        .script("chapter_count", ["It has some chapters."])
        .script("repair_json", ["Several.", "A few.", "Many."]);

    let config = quiet_config();
    let prompts = PromptRegistry::new()?;
    let sink = VecLogSink::new();
    let error = StoryPipeline::new(&prompts, &sink, &config)
        .run(&model, LIGHTHOUSE_PROMPT)
        .expect_err("chapter count cannot be read");
    model.assert_empty();

    assert!(matches!(error, PipelineError::ChapterCountFailed { .. }));
    assert_eq!(error.stage(), Stage::ChapterCount);
    // Corrective requests continue the first conversation.
    let repairs = model.calls_to("repair_json");
    assert_eq!(repairs.len(), 3);
    assert!(repairs.iter().all(|call| call.model == config.models.checker));
    Ok(())
}

#[test]
fn runaway_chapter_count_is_fatal() -> Result<(), Box<dyn std::error::Error>> {
    let model = ScriptedModel::new()
        .script("story_elements", ["elements"])
        .script("initial_outline", ["1. The bottle"])
        .script("chapter_count", [r#"{"total_chapters": 100000}"#])
        .script("repair_json", [r#"{"total_chapters": 100000}"#]);

    let config = PipelineConfig {
        max_repair_requests: 1,
        ..quiet_config()
    };
    let prompts = PromptRegistry::new()?;
    let sink = VecLogSink::new();
    let error = StoryPipeline::new(&prompts, &sink, &config)
        .run(&model, LIGHTHOUSE_PROMPT)
        .expect_err("count above the chapter limit");
    model.assert_empty();

    assert_eq!(error.stage(), Stage::ChapterCount);
    assert!(model.calls_to("chapter_outline").is_empty());
    Ok(())
}

#[test]
fn failed_scene_extraction_aborts_the_chapter() -> Result<(), Box<dyn std::error::Error>> {
    let model = ScriptedModel::new()
        .script("story_elements", ["elements"])
        .script("initial_outline", ["1. The bottle"])
        .script("chapter_count", [r#"{"total_chapters": 1}"#])
        .script("chapter_to_scenes", ["three scenes"])
        .script("scenes_to_json", ["I would rather describe them in prose."])
        .script("repair_json", ["Still prose."]);

    let config = PipelineConfig {
        scene_pipeline: true,
        expand_outline: false,
        max_repair_requests: 1,
        ..quiet_config()
    };

    let prompts = PromptRegistry::new()?;
    let sink = VecLogSink::new();
    let error = StoryPipeline::new(&prompts, &sink, &config)
        .run(&model, LIGHTHOUSE_PROMPT)
        .expect_err("scene list never parses");
    model.assert_empty();

    match &error {
        PipelineError::Chapter { number, source } => {
            assert_eq!(*number, 1);
            assert!(matches!(**source, PipelineError::Extraction { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(error.stage(), Stage::SceneExtraction);
    assert!(model.calls_to("scene_to_text").is_empty());
    Ok(())
}

#[test]
fn debug_runs_log_critiques_and_repairs() -> Result<(), Box<dyn std::error::Error>> {
    let model = ScriptedModel::new()
        .script("story_elements", ["elements"])
        .script("initial_outline", ["1. The bottle"])
        .script("evaluate_outline", [r#"{"feedback": "Complete.", "verdict": true}"#])
        .script("chapter_count", ["a single chapter"])
        .script("repair_json", [r#"{"total_chapters": 1}"#])
        .script("chapter_plot", ["plot"])
        .script("chapter_dialogue", ["dialogue"])
        .script("chapter_description", ["description"])
        .script("chapter_final_pass", ["final"])
        .script("chapter_summary", ["summary"])
        .script("story_info", [r#"{"title": "Bottle"}"#]);

    let config = PipelineConfig {
        outline_revisions: RevisionBounds::new(0, 1),
        expand_outline: false,
        debug: true,
        ..quiet_config()
    };

    let prompts = PromptRegistry::new()?;
    let sink = VecLogSink::new();
    StoryPipeline::new(&prompts, &sink, &config).run(&model, LIGHTHOUSE_PROMPT)?;
    model.assert_empty();

    let debug: Vec<String> = sink
        .records()
        .into_iter()
        .filter(|record| record.level == LogLevel::Debug)
        .map(|record| record.message)
        .collect();
    for expected in [
        "[evaluate_outline] reply: {\"feedback\": \"Complete.\", \"verdict\": true}",
        "[repair_json] reply: {\"total_chapters\": 1}",
        "[chapter_plot] reply: plot",
    ] {
        assert!(
            debug.iter().any(|message| message == expected),
            "missing debug line {expected}"
        );
    }
    assert!(debug
        .iter()
        .any(|message| message.starts_with("[repair_json] user: ")));
    Ok(())
}

#[test]
fn backend_errors_name_their_stage() {
    let model = ScriptedModel::new().script("story_elements", ["elements"]);
    let config = quiet_config();
    let prompts = PromptRegistry::new().expect("registry");
    let sink = VecLogSink::new();

    let error = StoryPipeline::new(&prompts, &sink, &config)
        .run(&model, LIGHTHOUSE_PROMPT)
        .expect_err("no outline scripted");
    assert!(matches!(
        error,
        PipelineError::Model {
            stage: Stage::InitialOutline,
            ..
        }
    ));
}
