use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_FILLER_SENTENCE: &str = "The story continued to unfold with deeper meaning.";
pub const DEFAULT_FILLER_PHRASE: &str = "The narrative deepened with further detail.";

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_timeout() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    5
}

fn default_chapter_floor_words() -> usize {
    2000
}

fn default_first_chapter() -> u32 {
    2
}

fn default_last_chapter() -> u32 {
    10
}

fn default_filler_sentence() -> String {
    DEFAULT_FILLER_SENTENCE.to_string()
}

fn default_tokens_per_word() -> f32 {
    2.0
}

fn default_min_tokens() -> u32 {
    512
}

fn default_factor() -> u32 {
    2
}

fn default_tolerance() -> f64 {
    0.10
}

fn default_expected_chapters() -> usize {
    9
}

fn default_filler_phrase() -> String {
    DEFAULT_FILLER_PHRASE.to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Connection settings for one generation backend.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
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
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            interface_format: String::new(),
            model_name: String::new(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            timeout: default_timeout(),
        }
    }
}

impl BackendConfig {
    pub fn ollama(model_name: impl Into<String>) -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            interface_format: "Ollama".to_string(),
            model_name: model_name.into(),
            ..Self::default()
        }
    }

    pub fn is_meaningful(&self) -> bool {
        !(self.api_key.is_empty()
            && self.base_url.is_empty()
            && self.interface_format.is_empty()
            && self.model_name.is_empty())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_chapter_floor_words")]
    pub chapter_floor_words: usize,
    #[serde(default = "default_first_chapter")]
    pub first_chapter: u32,
    #[serde(default = "default_last_chapter")]
    pub last_chapter: u32,
    #[serde(default = "default_filler_sentence")]
    pub filler_sentence: String,
    #[serde(default = "default_tokens_per_word")]
    pub tokens_per_word: f32,
    #[serde(default = "default_min_tokens")]
    pub min_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            chapter_floor_words: default_chapter_floor_words(),
            first_chapter: default_first_chapter(),
            last_chapter: default_last_chapter(),
            filler_sentence: default_filler_sentence(),
            tokens_per_word: default_tokens_per_word(),
            min_tokens: default_min_tokens(),
        }
    }
}

impl GenerationConfig {
    pub fn chapter_span(&self) -> RangeInclusive<u32> {
        self.first_chapter..=self.last_chapter
    }

    /// Token budget for a request that should produce `target_words` words.
    pub fn token_budget(&self, target_words: usize) -> u32 {
        let scaled = (target_words as f64 * f64::from(self.tokens_per_word.max(0.0))).ceil();
        let scaled = if scaled >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            scaled as u32
        };
        scaled.max(self.min_tokens)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EnhancementConfig {
    #[serde(default = "default_factor")]
    pub factor: u32,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_expected_chapters")]
    pub expected_chapters: usize,
    #[serde(default = "default_filler_phrase")]
    pub filler_phrase: String,
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            factor: default_factor(),
            tolerance: default_tolerance(),
            expected_chapters: default_expected_chapters(),
            filler_phrase: default_filler_phrase(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptConfig {
    #[serde(default)]
    pub custom_directories: Vec<PathBuf>,
    #[serde(default)]
    pub enable_hot_reload: bool,
}

/// Input files and output location for one book.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub plan: Option<PathBuf>,
    #[serde(default)]
    pub characters: Option<PathBuf>,
    #[serde(default)]
    pub instructions: Option<PathBuf>,
    #[serde(default)]
    pub other_info: Option<PathBuf>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            plan: None,
            characters: None,
            instructions: None,
            other_info: None,
        }
    }
}

impl ProjectConfig {
    pub fn chapters_dir(&self) -> PathBuf {
        self.output_dir.clone()
    }

    pub fn enhanced_dir(&self) -> PathBuf {
        self.output_dir.join("enhanced")
    }

    pub fn state_path(&self) -> PathBuf {
        self.output_dir.join("state.json")
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RecentUsage {
    #[serde(default)]
    pub last_backend: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub backend_profiles: BTreeMap<String, BackendConfig>,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub enhancement: EnhancementConfig,
    #[serde(default)]
    pub prompts: PromptConfig,
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub recent: RecentUsage,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_backend_profile(&self, name: &str) -> Option<&BackendConfig> {
        self.backend_profiles.get(name)
    }

    pub fn upsert_backend_profile<S: Into<String>>(&mut self, name: S, profile: BackendConfig) {
        self.backend_profiles.insert(name.into(), profile);
    }

    pub fn remove_backend_profile(&mut self, name: &str) -> Option<BackendConfig> {
        self.backend_profiles.remove(name)
    }

    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }

        let value: Value = serde_json::from_str(input)?;
        Self::from_value(value)
    }

    /// Accepts both the sectioned layout and a flat single-backend layout
    /// (`base_url`, `model_name`, ... at the top level).
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        const SECTIONS: [&str; 6] = [
            "backend_profiles",
            "generation",
            "enhancement",
            "prompts",
            "project",
            "recent",
        ];
        if SECTIONS.iter().any(|key| value.get(key).is_some()) {
            return Ok(serde_json::from_value(value)?);
        }

        let flat: BackendConfig = serde_json::from_value(value)?;
        let mut config = Self::default();
        if flat.is_meaningful() {
            let name = Some(flat.interface_format.clone())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "default".to_string());
            config.recent.last_backend = Some(name.clone());
            config.backend_profiles.insert(name, flat);
        }
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn to_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: Config,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = if path.exists() {
            Config::from_path(&path)?
        } else {
            Config::default()
        };

        Ok(Self { path, config })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.to_path(&self.path)
    }

    pub fn touch_backend<S: Into<String>>(&mut self, name: S) {
        self.config.recent.last_backend = Some(name.into());
    }

    pub fn last_backend(&self) -> Option<&str> {
        self.config
            .recent
            .last_backend
            .as_deref()
            .filter(|name| self.config.backend_profiles.contains_key(*name))
    }

    /// Resolves an explicit profile name, falling back to the most recently
    /// used profile and then to the first one.
    pub fn resolve_backend(&self, name: Option<&str>) -> Option<(String, BackendConfig)> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self
                .last_backend()
                .map(str::to_string)
                .or_else(|| self.config.backend_profiles.keys().next().cloned())?,
        };
        self.config
            .backend_profiles
            .get(&name)
            .cloned()
            .map(|profile| (name, profile))
    }

    /// Drops a profile and repoints recent usage at a remaining one.
    pub fn remove_backend(&mut self, name: &str) -> Option<BackendConfig> {
        let removed = self.config.remove_backend_profile(name)?;
        self.ensure_recent_defaults();
        Some(removed)
    }

    pub fn ensure_recent_defaults(&mut self) {
        if self.last_backend().is_none() {
            let next = self.config.backend_profiles.keys().next().cloned();
            self.config.recent.last_backend = next;
        }
    }
}
