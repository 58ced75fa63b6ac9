use clap::{ArgAction, Args, Parser, Subcommand};
use storyforge_adapters::{AdapterError, BackendPool, ChatAdapter};
use storyforge_core::{
    slugify, Config, ConfigError, GenerationRequest, LanguageModel, LanguageModelError, LogLevel,
    LogRecord, LogSink, PipelineConfig, PipelineError, PromptError, PromptRegistry, RevisionBounds,
    SharedLogSink, SinkLogger, StdoutLogSink, Story, StoryPipeline, DEFAULT_PROFILE,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let debug_flag = matches!(&cli.command, Command::Write(args) if args.overrides.debug);
    let level = log_level(cli.verbose, cli.quiet, debug_flag);

    let sink: SharedLogSink = Arc::new(StdoutLogSink::with_min_level(level));
    // Only fails when a logger is already set, which leaves output intact.
    let _ = SinkLogger::new(Arc::clone(&sink), level).install();

    match cli.command {
        Command::Write(args) => run_write(&cli.config, args, sink.as_ref()),
        Command::TestModel(args) => run_test_model(&cli.config, args, sink.as_ref()),
    }
}

fn log_level(verbose: u8, quiet: bool, debug: bool) -> LogLevel {
    if quiet {
        return LogLevel::Warn;
    }
    match verbose {
        0 if debug => LogLevel::Debug,
        0 => LogLevel::Info,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    }
}

fn run_write(config_path: &Path, args: WriteArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let mut config = Config::load_or_default(config_path)?;
    args.overrides.apply(&mut config.pipeline);
    config.validate()?;

    let prompt = read_prompt(&args.prompt)?;
    let prompts = PromptRegistry::from_prompt_config(&config.prompts)?;
    let backends = BackendPool::from_config(&config)?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "Writing story from {} ({} pipeline)",
            args.prompt.display(),
            if config.pipeline.scene_pipeline {
                "scene"
            } else {
                "staged"
            }
        ),
    ));

    let pipeline = StoryPipeline::new(&prompts, sink, &config.pipeline);
    let story = pipeline.run(&backends, &prompt)?;

    let path = output_path(args.output.as_deref(), &config.output_dir, &story.info.title);
    write_story(&path, &story)?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "Story \"{}\" written to {} ({} chapters, {} words)",
            story.info.title,
            path.display(),
            story.chapters.len(),
            story.word_count()
        ),
    ));
    Ok(())
}

fn run_test_model(
    config_path: &Path,
    args: TestModelArgs,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    let config = Config::load_or_default(config_path)?;
    let name = args.profile.unwrap_or_else(|| DEFAULT_PROFILE.to_string());
    let profile = config
        .get_llm_profile(&name)
        .ok_or_else(|| CliError::UnknownProfile(name.clone()))?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("Testing model profile `{name}`"),
    ));
    sink.log(LogRecord::new(
        LogLevel::Debug,
        format!(
            "model: {} | interface: {} | base url: {}",
            profile.model_name, profile.interface_format, profile.base_url
        ),
    ));

    let adapter = ChatAdapter::from_profile(profile)?;
    let request = GenerationRequest::builder(name.as_str())
        .label("test_model")
        .user("Please reply 'OK'")
        .build();

    match adapter.send(&request) {
        Ok(reply) => {
            sink.log(LogRecord::new(
                LogLevel::Info,
                format!("Profile `{name}` responded"),
            ));
            sink.log(LogRecord::new(
                LogLevel::Debug,
                format!("reply: {}", reply.text()),
            ));
            Ok(())
        }
        Err(err) => {
            sink.log(LogRecord::new(
                LogLevel::Error,
                format!("Profile `{name}` failed: {err}"),
            ));
            Err(CliError::Model(err))
        }
    }
}

fn read_prompt(path: &Path) -> Result<String, CliError> {
    let prompt = fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if prompt.trim().is_empty() {
        return Err(CliError::EmptyPrompt(path.to_path_buf()));
    }
    Ok(prompt)
}

/// `--output` when given, else `<output_dir>/<title slug>.md`.
fn output_path(explicit: Option<&Path>, output_dir: &Path, title: &str) -> PathBuf {
    match explicit {
        Some(path) => path.to_path_buf(),
        None => output_dir.join(format!("{}.md", slugify(title))),
    }
}

fn write_story(path: &Path, story: &Story) -> Result<(), CliError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| CliError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    fs::write(path, story.render_document()).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Error)]
enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("no model profile named `{0}`")]
    UnknownProfile(String),
    #[error("prompt file is empty: {0}")]
    EmptyPrompt(PathBuf),
    #[error("failed to access `{path}`: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("backend setup failed: {0}")]
    Adapter(#[from] AdapterError),
    #[error("model call failed: {0}")]
    Model(#[from] LanguageModelError),
    #[error("failed to load prompts: {0}")]
    Prompt(#[from] PromptError),
    #[error("generation failed: {0}")]
    Pipeline(#[from] PipelineError),
}

#[derive(Parser)]
#[command(
    name = "storyforge",
    version,
    about = "Multi-stage story generation with LLM backends"
)]
struct Cli {
    /// Path to the config file
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a story from a prompt file
    Write(WriteArgs),
    /// Send a one-line probe to a model profile
    TestModel(TestModelArgs),
}

#[derive(Args)]
struct TestModelArgs {
    /// Profile to test, defaults to `default`
    #[arg(long)]
    profile: Option<String>,
}

#[derive(Args)]
struct WriteArgs {
    /// File holding the story prompt
    #[arg(long, value_name = "FILE")]
    prompt: PathBuf,
    /// Output file, defaults to <output_dir>/<title>.md
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    #[command(flatten)]
    overrides: PipelineOverrides,
}

/// Command-line values laid over the loaded [`PipelineConfig`].
#[derive(Args, Default)]
struct PipelineOverrides {
    #[arg(long, value_name = "PROFILE")]
    initial_outline_model: Option<String>,
    #[arg(long, value_name = "PROFILE")]
    chapter_outline_model: Option<String>,
    #[arg(long = "chapter-s1-model", value_name = "PROFILE")]
    chapter_stage1_model: Option<String>,
    #[arg(long = "chapter-s2-model", value_name = "PROFILE")]
    chapter_stage2_model: Option<String>,
    #[arg(long = "chapter-s3-model", value_name = "PROFILE")]
    chapter_stage3_model: Option<String>,
    #[arg(long = "chapter-s4-model", value_name = "PROFILE")]
    chapter_stage4_model: Option<String>,
    #[arg(long, value_name = "PROFILE")]
    chapter_revision_model: Option<String>,
    #[arg(long, value_name = "PROFILE")]
    revision_model: Option<String>,
    #[arg(long = "eval-model", value_name = "PROFILE")]
    evaluation_model: Option<String>,
    #[arg(long, value_name = "PROFILE")]
    info_model: Option<String>,
    #[arg(long, value_name = "PROFILE")]
    scrub_model: Option<String>,
    #[arg(long, value_name = "PROFILE")]
    checker_model: Option<String>,
    #[arg(long, value_name = "PROFILE")]
    translator_model: Option<String>,

    #[arg(long, value_name = "N")]
    outline_min_revisions: Option<u32>,
    #[arg(long, value_name = "N")]
    outline_max_revisions: Option<u32>,
    #[arg(long, value_name = "N")]
    chapter_min_revisions: Option<u32>,
    #[arg(long, value_name = "N")]
    chapter_max_revisions: Option<u32>,

    /// Skip the chapter critique loop
    #[arg(long)]
    no_chapter_revision: bool,
    /// Write chapters scene by scene
    #[arg(long)]
    scene_pipeline: bool,
    /// Generate the scenes of a chapter concurrently
    #[arg(long)]
    parallel_scenes: bool,
    /// Use the story outline for every chapter instead of expanding it
    #[arg(long)]
    no_expand_outline: bool,
    #[arg(long)]
    final_edit_pass: bool,
    #[arg(long)]
    no_scrub: bool,
    /// Translate the finished story into LANG
    #[arg(long, value_name = "LANG")]
    translate: Option<String>,
    /// Translate the prompt into LANG before generating
    #[arg(long, value_name = "LANG")]
    translate_prompt: Option<String>,
    #[arg(long, value_name = "N")]
    seed: Option<u64>,
    #[arg(long, value_name = "WORDS")]
    chapter_min_words: Option<usize>,
    #[arg(long, value_name = "WORDS")]
    scene_min_words: Option<usize>,
    #[arg(long, value_name = "N")]
    max_repair_requests: Option<usize>,
    /// Log every prompt and reply
    #[arg(long)]
    debug: bool,
}

impl PipelineOverrides {
    fn apply(self, pipeline: &mut PipelineConfig) {
        let models = &mut pipeline.models;
        for (slot, value) in [
            (&mut models.initial_outline, self.initial_outline_model),
            (&mut models.chapter_outline, self.chapter_outline_model),
            (&mut models.chapter_stage1, self.chapter_stage1_model),
            (&mut models.chapter_stage2, self.chapter_stage2_model),
            (&mut models.chapter_stage3, self.chapter_stage3_model),
            (&mut models.chapter_stage4, self.chapter_stage4_model),
            (&mut models.chapter_revision, self.chapter_revision_model),
            (&mut models.revision, self.revision_model),
            (&mut models.evaluation, self.evaluation_model),
            (&mut models.info, self.info_model),
            (&mut models.scrub, self.scrub_model),
            (&mut models.checker, self.checker_model),
            (&mut models.translator, self.translator_model),
        ] {
            if let Some(value) = value {
                *slot = value;
            }
        }

        pipeline.outline_revisions = overlay_bounds(
            pipeline.outline_revisions,
            self.outline_min_revisions,
            self.outline_max_revisions,
        );
        pipeline.chapter_revisions = overlay_bounds(
            pipeline.chapter_revisions,
            self.chapter_min_revisions,
            self.chapter_max_revisions,
        );

        if self.no_chapter_revision {
            pipeline.chapter_revision = false;
        }
        if self.scene_pipeline {
            pipeline.scene_pipeline = true;
        }
        if self.parallel_scenes {
            pipeline.parallel_scenes = true;
        }
        if self.no_expand_outline {
            pipeline.expand_outline = false;
        }
        if self.final_edit_pass {
            pipeline.final_edit_pass = true;
        }
        if self.no_scrub {
            pipeline.scrub = false;
        }
        if self.debug {
            pipeline.debug = true;
        }
        if self.translate.is_some() {
            pipeline.translate = self.translate;
        }
        if self.translate_prompt.is_some() {
            pipeline.translate_prompt = self.translate_prompt;
        }
        if let Some(seed) = self.seed {
            pipeline.seed = seed;
        }
        if let Some(words) = self.chapter_min_words {
            pipeline.chapter_min_words = words;
        }
        if let Some(words) = self.scene_min_words {
            pipeline.scene_min_words = words;
        }
        if let Some(requests) = self.max_repair_requests {
            pipeline.max_repair_requests = requests;
        }
    }
}

fn overlay_bounds(bounds: RevisionBounds, min: Option<u32>, max: Option<u32>) -> RevisionBounds {
    RevisionBounds::new(min.unwrap_or(bounds.min), max.unwrap_or(bounds.max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyforge_core::{ChapterDraft, StoryInfo};
    use tempfile::tempdir;

    fn parse_write(args: &[&str]) -> WriteArgs {
        let mut argv = vec!["storyforge", "write", "--prompt", "prompt.txt"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Write(args) => args,
            Command::TestModel(_) => panic!("expected write"),
        }
    }

    #[test]
    fn flags_overlay_loaded_pipeline() {
        let args = parse_write(&[
            "--eval-model",
            "critic",
            "--chapter-s1-model",
            "drafter",
            "--outline-max-revisions",
            "1",
            "--no-scrub",
            "--scene-pipeline",
            "--translate",
            "French",
            "--seed",
            "99",
        ]);

        let mut pipeline = PipelineConfig::default();
        args.overrides.apply(&mut pipeline);

        assert_eq!(pipeline.models.evaluation, "critic");
        assert_eq!(pipeline.models.chapter_stage1, "drafter");
        assert_eq!(pipeline.models.chapter_stage2, DEFAULT_PROFILE);
        assert_eq!(pipeline.outline_revisions, RevisionBounds::new(0, 1));
        assert!(!pipeline.scrub);
        assert!(pipeline.scene_pipeline);
        assert_eq!(pipeline.translate_language(), Some("French"));
        assert_eq!(pipeline.seed, 99);
    }

    #[test]
    fn absent_flags_leave_config_alone() {
        let mut pipeline = PipelineConfig {
            scrub: false,
            final_edit_pass: true,
            translate: Some("German".to_string()),
            ..PipelineConfig::default()
        };
        let expected = pipeline.clone();
        parse_write(&[]).overrides.apply(&mut pipeline);
        assert_eq!(pipeline, expected);
    }

    #[test]
    fn verbosity_flags_pick_levels() {
        assert_eq!(log_level(0, false, false), LogLevel::Info);
        assert_eq!(log_level(0, false, true), LogLevel::Debug);
        assert_eq!(log_level(2, false, false), LogLevel::Trace);
        assert_eq!(log_level(0, true, true), LogLevel::Warn);
    }

    fn story(title: &str) -> Story {
        Story {
            info: StoryInfo {
                title: title.to_string(),
                summary: "A keeper and a bottle.".to_string(),
                tags: "sea, mystery".to_string(),
                overall_rating: Some(80),
            },
            outline: "outline".to_string(),
            chapters: vec![ChapterDraft {
                number: 1,
                text: "The lamp turned.".to_string(),
            }],
        }
    }

    #[test]
    fn story_is_written_under_slugged_title() {
        let dir = tempdir().unwrap();
        let path = output_path(None, dir.path(), "The Keeper's Message!");
        assert_eq!(path, dir.path().join("the-keeper-s-message.md"));

        write_story(&path, &story("The Keeper's Message!")).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# The Keeper's Message!"));
        assert!(written.contains("The lamp turned."));
    }

    #[test]
    fn explicit_output_wins_and_parents_are_created() {
        let dir = tempdir().unwrap();
        let explicit = dir.path().join("nested").join("out.md");
        let path = output_path(Some(&explicit), dir.path(), "ignored");
        assert_eq!(path, explicit);
        write_story(&path, &story("Title")).unwrap();
        assert!(explicit.exists());
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        fs::write(&path, "  \n").unwrap();
        assert!(matches!(read_prompt(&path), Err(CliError::EmptyPrompt(_))));
    }
}
