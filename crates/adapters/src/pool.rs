use std::collections::BTreeMap;
use std::fmt;

use log::info;

use storyforge_core::{
    Config, GenerationRequest, GenerationResult, LanguageModel, LanguageModelError,
};

use crate::error::AdapterError;
use crate::llm::ChatAdapter;

/// Named backends. Requests are routed by [`GenerationRequest::model`], so
/// each stage reaches the profile it was configured with.
#[derive(Default)]
pub struct BackendPool {
    backends: BTreeMap<String, Box<dyn LanguageModel>>,
}

impl BackendPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one adapter per profile that some stage refers to. Unused
    /// profiles are left alone so a half-filled entry does not block a run.
    pub fn from_config(config: &Config) -> Result<Self, AdapterError> {
        let mut pool = Self::new();
        for (stage, profile_name) in config.pipeline.models.entries() {
            if pool.contains(profile_name) {
                continue;
            }
            let profile = config.get_llm_profile(profile_name).ok_or_else(|| {
                AdapterError::InvalidConfig(format!(
                    "stage `{stage}` refers to unknown model profile `{profile_name}`"
                ))
            })?;
            let adapter = ChatAdapter::from_profile(profile)?;
            info!(
                "backend `{}` -> {} ({:?})",
                profile_name,
                adapter.model_name(),
                adapter.provider()
            );
            pool.insert(profile_name, adapter);
        }
        Ok(pool)
    }

    pub fn insert<M>(&mut self, name: impl Into<String>, backend: M)
    where
        M: LanguageModel + 'static,
    {
        self.backends.insert(name.into(), Box::new(backend));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&dyn LanguageModel> {
        self.backends.get(name).map(|backend| backend.as_ref())
    }
}

impl fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendPool")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LanguageModel for BackendPool {
    fn send(&self, request: &GenerationRequest) -> Result<GenerationResult, LanguageModelError> {
        let backend = self.get(request.model()).ok_or_else(|| {
            LanguageModelError::new(AdapterError::UnknownModel(request.model().to_string()))
        })?;
        backend.send(request)
    }
}
