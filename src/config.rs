//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.govsynth.toml` files.

use crate::cli::{Args, Command};
use crate::llm::RetryPolicy;
use crate::models::ArtifactKind;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = ".govsynth.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Prompt template paths.
    #[serde(default)]
    pub prompts: PromptConfig,

    /// Scenario stage settings.
    #[serde(default)]
    pub scenario: ScenarioConfig,

    /// Governance stage settings.
    #[serde(default)]
    pub governance: StageConfig,

    /// Evaluation stage settings.
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Root directory holding one sub-directory per run.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Default number of concurrent model invocations per stage.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Append every model attempt to `<root>/audit.jsonl`.
    #[serde(default)]
    pub audit: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            concurrency: default_concurrency(),
            audit: false,
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_concurrency() -> usize {
    4
}

/// Which model API to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Ollama chat API
    #[default]
    Ollama,
    /// Google Gemini generateContent API
    Gemini,
}

/// LLM model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider API.
    #[serde(default)]
    pub provider: Provider,

    /// Default model name.
    #[serde(default = "default_model")]
    pub name: String,

    /// API base URL. Empty means the provider default.
    #[serde(default)]
    pub endpoint: String,

    /// Environment variable holding the API key (Gemini only).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens in response.
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Timeout for a single attempt, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Total attempts per invocation, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay of the exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Cap on any single backoff delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            name: default_model(),
            endpoint: String::new(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: None,
            timeout_seconds: default_timeout(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_api_key_env() -> String {
    "GOOGLE_API_KEY".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_timeout() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl ModelConfig {
    /// Endpoint to use, falling back to the provider default.
    pub fn effective_endpoint(&self) -> String {
        if !self.endpoint.is_empty() {
            return self.endpoint.clone();
        }
        match self.provider {
            Provider::Ollama => "http://localhost:11434".to_string(),
            Provider::Gemini => crate::llm::GEMINI_BASE_URL.to_string(),
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Retry policy for the invocation adapter.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            attempt_timeout: self.attempt_timeout(),
            jitter: true,
        }
    }
}

/// Prompt template locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "default_scenario_prompt")]
    pub scenario: PathBuf,

    #[serde(default = "default_governance_prompt")]
    pub governance: PathBuf,

    #[serde(default = "default_evaluation_prompt")]
    pub evaluation: PathBuf,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            scenario: default_scenario_prompt(),
            governance: default_governance_prompt(),
            evaluation: default_evaluation_prompt(),
        }
    }
}

fn default_scenario_prompt() -> PathBuf {
    PathBuf::from("prompts/scenario_prompt.txt")
}

fn default_governance_prompt() -> PathBuf {
    PathBuf::from("prompts/governance_prompt.txt")
}

fn default_evaluation_prompt() -> PathBuf {
    PathBuf::from("prompts/evaluation_prompt.txt")
}

impl PromptConfig {
    pub fn path_for(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::Scenario => &self.scenario,
            ArtifactKind::Governance => &self.governance,
            ArtifactKind::Evaluation => &self.evaluation,
        }
    }
}

/// Scenario synthesis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Scenario classes (archetypes) to generate.
    #[serde(default = "default_classes")]
    pub classes: Vec<String>,

    /// Scenarios generated per class.
    #[serde(default = "default_count")]
    pub count: usize,

    /// Overrides `general.concurrency` for this stage.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            classes: default_classes(),
            count: default_count(),
            concurrency: None,
        }
    }
}

fn default_classes() -> Vec<String> {
    vec![
        "Normal Operation",
        "Goal Drift",
        "Resource Overconsumption",
        "Unauthorized Access Attempt",
        "Prompt Injection Response",
        "Data Evasion Attack",
        "Model Inversion Attack",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_count() -> usize {
    1
}

/// Per-stage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageConfig {
    /// Overrides `general.concurrency` for this stage.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

/// Evaluation (judge) settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Overrides `general.concurrency` for this stage.
    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Judge model; defaults to `model.name`.
    #[serde(default)]
    pub judge_model: Option<String>,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence, but only when given explicitly.
    pub fn merge_with_args(&mut self, args: &Args) {
        if let Some(ref root) = args.root {
            self.general.root = root.clone();
        }
        if let Some(concurrency) = args.concurrency {
            self.general.concurrency = concurrency;
            self.scenario.concurrency = None;
            self.governance.concurrency = None;
            self.evaluation.concurrency = None;
        }
        if args.audit {
            self.general.audit = true;
        }

        if let Some(provider) = args.provider {
            self.model.provider = provider;
        }
        if let Some(ref model) = args.model {
            self.model.name = model.clone();
        }
        if let Some(ref endpoint) = args.endpoint {
            self.model.endpoint = endpoint.clone();
        }
        if let Some(timeout) = args.timeout {
            self.model.timeout_seconds = timeout;
        }
        if let Some(max_attempts) = args.max_attempts {
            self.model.max_attempts = max_attempts;
        }

        match &args.command {
            Command::Scenario(stage) => {
                if let Some(ref classes) = stage.classes {
                    self.scenario.classes = classes.clone();
                }
                if let Some(count) = stage.count {
                    self.scenario.count = count;
                }
                if let Some(ref prompt) = stage.prompt {
                    self.prompts.scenario = prompt.clone();
                }
            }
            Command::Governance(stage) => {
                if let Some(ref prompt) = stage.prompt {
                    self.prompts.governance = prompt.clone();
                }
            }
            Command::Evaluate(stage) => {
                if let Some(ref prompt) = stage.prompt {
                    self.prompts.evaluation = prompt.clone();
                }
            }
            Command::Run(run) => {
                if let Some(ref classes) = run.classes {
                    self.scenario.classes = classes.clone();
                }
                if let Some(count) = run.count {
                    self.scenario.count = count;
                }
            }
            Command::Summarize | Command::Stats(_) | Command::InitConfig(_) => {}
        }
    }

    /// Concurrency bound for a stage.
    pub fn concurrency_for(&self, kind: ArtifactKind) -> usize {
        let stage = match kind {
            ArtifactKind::Scenario => self.scenario.concurrency,
            ArtifactKind::Governance => self.governance.concurrency,
            ArtifactKind::Evaluation => self.evaluation.concurrency,
        };
        stage.unwrap_or(self.general.concurrency)
    }

    /// Model id used by a stage.
    pub fn model_for(&self, kind: ArtifactKind) -> &str {
        match (kind, &self.evaluation.judge_model) {
            (ArtifactKind::Evaluation, Some(judge)) => judge,
            _ => &self.model.name,
        }
    }

    /// Reject settings that would make every batch fail.
    pub fn validate(&self) -> Result<()> {
        for kind in ArtifactKind::ALL {
            if self.concurrency_for(kind) == 0 {
                bail!("Concurrency for the {} stage must be at least 1", kind);
            }
        }
        if self.model.max_attempts == 0 {
            bail!("model.max_attempts must be at least 1");
        }
        if self.model.timeout_seconds == 0 {
            bail!("model.timeout_seconds must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            bail!("model.temperature must be between 0.0 and 2.0");
        }
        if self.model.backoff_base_ms > self.model.backoff_max_ms {
            bail!("model.backoff_base_ms must not exceed model.backoff_max_ms");
        }
        let endpoint = self.model.effective_endpoint();
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            bail!("Model endpoint must start with 'http://' or 'https://'");
        }
        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
