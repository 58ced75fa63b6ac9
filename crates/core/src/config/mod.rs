use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_PROFILE: &str = "default";

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout() -> u64 {
    600
}

fn default_max_attempts() -> usize {
    10
}

fn default_backoff_secs() -> u64 {
    10
}

fn default_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_seed() -> u64 {
    12
}

fn default_chapter_min_words() -> usize {
    120
}

fn default_scene_min_words() -> usize {
    100
}

fn default_max_repair_requests() -> usize {
    3
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("stories")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("stage `{stage}` refers to unknown model profile `{profile}`")]
    UnknownProfile { stage: &'static str, profile: String },
}

/// One named chat-completion backend.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub interface_format: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            interface_format: String::new(),
            model_name: String::new(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            timeout: default_timeout(),
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            system_prompt: None,
        }
    }
}

/// Profile name used by every generation stage.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageModels {
    #[serde(default = "default_profile")]
    pub initial_outline: String,
    #[serde(default = "default_profile")]
    pub chapter_outline: String,
    #[serde(default = "default_profile")]
    pub chapter_stage1: String,
    #[serde(default = "default_profile")]
    pub chapter_stage2: String,
    #[serde(default = "default_profile")]
    pub chapter_stage3: String,
    #[serde(default = "default_profile")]
    pub chapter_stage4: String,
    #[serde(default = "default_profile")]
    pub chapter_revision: String,
    #[serde(default = "default_profile")]
    pub revision: String,
    #[serde(default = "default_profile")]
    pub evaluation: String,
    #[serde(default = "default_profile")]
    pub info: String,
    #[serde(default = "default_profile")]
    pub scrub: String,
    #[serde(default = "default_profile")]
    pub checker: String,
    #[serde(default = "default_profile")]
    pub translator: String,
}

impl Default for StageModels {
    fn default() -> Self {
        Self::uniform(DEFAULT_PROFILE)
    }
}

impl StageModels {
    pub fn uniform(profile: &str) -> Self {
        let name = profile.to_string();
        Self {
            initial_outline: name.clone(),
            chapter_outline: name.clone(),
            chapter_stage1: name.clone(),
            chapter_stage2: name.clone(),
            chapter_stage3: name.clone(),
            chapter_stage4: name.clone(),
            chapter_revision: name.clone(),
            revision: name.clone(),
            evaluation: name.clone(),
            info: name.clone(),
            scrub: name.clone(),
            checker: name.clone(),
            translator: name,
        }
    }

    /// `(stage name, profile)` pairs, in pipeline order.
    pub fn entries(&self) -> [(&'static str, &str); 13] {
        [
            ("initial_outline", self.initial_outline.as_str()),
            ("chapter_outline", self.chapter_outline.as_str()),
            ("chapter_stage1", self.chapter_stage1.as_str()),
            ("chapter_stage2", self.chapter_stage2.as_str()),
            ("chapter_stage3", self.chapter_stage3.as_str()),
            ("chapter_stage4", self.chapter_stage4.as_str()),
            ("chapter_revision", self.chapter_revision.as_str()),
            ("revision", self.revision.as_str()),
            ("evaluation", self.evaluation.as_str()),
            ("info", self.info.as_str()),
            ("scrub", self.scrub.as_str()),
            ("checker", self.checker.as_str()),
            ("translator", self.translator.as_str()),
        ]
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevisionBounds {
    #[serde(default)]
    pub min: u32,
    #[serde(default)]
    pub max: u32,
}

impl RevisionBounds {
    pub const DISABLED: RevisionBounds = RevisionBounds { min: 0, max: 0 };

    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }
}

fn default_revision_bounds() -> RevisionBounds {
    RevisionBounds::new(0, 3)
}

/// Everything a single generation run needs. Handed to the pipeline once and
/// never mutated during the run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    #[serde(default)]
    pub models: StageModels,
    #[serde(default = "default_revision_bounds")]
    pub outline_revisions: RevisionBounds,
    #[serde(default = "default_revision_bounds")]
    pub chapter_revisions: RevisionBounds,
    #[serde(default = "default_true")]
    pub chapter_revision: bool,
    #[serde(default)]
    pub scene_pipeline: bool,
    #[serde(default)]
    pub parallel_scenes: bool,
    #[serde(default = "default_true")]
    pub expand_outline: bool,
    #[serde(default)]
    pub final_edit_pass: bool,
    #[serde(default = "default_true")]
    pub scrub: bool,
    #[serde(default)]
    pub translate: Option<String>,
    #[serde(default)]
    pub translate_prompt: Option<String>,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_chapter_min_words")]
    pub chapter_min_words: usize,
    #[serde(default = "default_scene_min_words")]
    pub scene_min_words: usize,
    #[serde(default = "default_max_repair_requests")]
    pub max_repair_requests: usize,
    #[serde(default)]
    pub debug: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            models: StageModels::default(),
            outline_revisions: default_revision_bounds(),
            chapter_revisions: default_revision_bounds(),
            chapter_revision: true,
            scene_pipeline: false,
            parallel_scenes: false,
            expand_outline: true,
            final_edit_pass: false,
            scrub: true,
            translate: None,
            translate_prompt: None,
            seed: default_seed(),
            chapter_min_words: default_chapter_min_words(),
            scene_min_words: default_scene_min_words(),
            max_repair_requests: default_max_repair_requests(),
            debug: false,
        }
    }
}

impl PipelineConfig {
    /// Chapter bounds after applying the `chapter_revision` switch.
    pub fn effective_chapter_revisions(&self) -> RevisionBounds {
        if self.chapter_revision {
            self.chapter_revisions
        } else {
            RevisionBounds::DISABLED
        }
    }

    pub fn translate_language(&self) -> Option<&str> {
        non_blank(self.translate.as_deref())
    }

    pub fn translate_prompt_language(&self) -> Option<&str> {
        non_blank(self.translate_prompt.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PromptConfig {
    #[serde(default)]
    pub custom_directories: Vec<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub llm_profiles: BTreeMap<String, LlmConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub prompts: PromptConfig,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm_profiles: BTreeMap::new(),
            pipeline: PipelineConfig::default(),
            prompts: PromptConfig::default(),
            output_dir: default_output_dir(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_llm_profile(&self, name: &str) -> Option<&LlmConfig> {
        self.llm_profiles.get(name)
    }

    pub fn upsert_llm_profile<S: Into<String>>(&mut self, name: S, profile: LlmConfig) {
        self.llm_profiles.insert(name.into(), profile);
    }

    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(input)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&data)
    }

    /// Loads `path` if it exists, otherwise starts from defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_path(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Every stage must name a configured profile.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (stage, profile) in self.pipeline.models.entries() {
            if !self.llm_profiles.contains_key(profile) {
                return Err(ConfigError::UnknownProfile {
                    stage,
                    profile: profile.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_profiles_and_pipeline() {
        let json = r#"{
            "llm_profiles": {
                "default": {
                    "api_key": "123",
                    "interface_format": "OpenAI",
                    "model_name": "gpt-4o-mini",
                    "max_tokens": 2048
                },
                "judge": {
                    "interface_format": "ollama",
                    "model_name": "llama3:70b"
                }
            },
            "pipeline": {
                "models": { "evaluation": "judge" },
                "outline_revisions": { "min": 1, "max": 2 },
                "scene_pipeline": true,
                "translate": "French"
            }
        }"#;

        let config = Config::from_json_str(json).unwrap();
        assert_eq!(config.llm_profiles.len(), 2);
        assert_eq!(config.llm_profiles["default"].max_tokens, 2048);
        assert_eq!(config.llm_profiles["judge"].max_attempts, 10);
        assert_eq!(config.pipeline.models.evaluation, "judge");
        assert_eq!(config.pipeline.models.chapter_stage1, DEFAULT_PROFILE);
        assert_eq!(config.pipeline.outline_revisions, RevisionBounds::new(1, 2));
        assert_eq!(config.pipeline.chapter_revisions, RevisionBounds::new(0, 3));
        assert!(config.pipeline.scene_pipeline);
        assert!(config.pipeline.scrub);
        assert_eq!(config.pipeline.translate_language(), Some("French"));
        config.validate().unwrap();
    }

    #[test]
    fn empty_input_yields_defaults() {
        let config = Config::from_json_str("  ").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.output_dir, PathBuf::from("stories"));
    }

    #[test]
    fn validate_reports_missing_profile() {
        let mut config = Config::default();
        config.upsert_llm_profile("default", LlmConfig::default());
        config.pipeline.models.scrub = "missing".into();
        match config.validate() {
            Err(ConfigError::UnknownProfile { stage, profile }) => {
                assert_eq!(stage, "scrub");
                assert_eq!(profile, "missing");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn disabled_chapter_revision_forces_zero_bounds() {
        let mut pipeline = PipelineConfig::default();
        pipeline.chapter_revisions = RevisionBounds::new(2, 4);
        pipeline.chapter_revision = false;
        assert_eq!(
            pipeline.effective_chapter_revisions(),
            RevisionBounds::DISABLED
        );
    }

    #[test]
    fn blank_translation_language_is_ignored() {
        let mut pipeline = PipelineConfig::default();
        pipeline.translate = Some("   ".into());
        assert_eq!(pipeline.translate_language(), None);
    }

    #[test]
    fn round_trips_through_disk() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.upsert_llm_profile(
            "default",
            LlmConfig {
                interface_format: "glm".into(),
                model_name: "glm-4".into(),
                ..LlmConfig::default()
            },
        );
        config.to_path(&path).unwrap();

        let loaded = Config::load_or_default(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
