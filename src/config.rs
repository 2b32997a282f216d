use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_output_tokens() -> u32 {
    2048
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_highlights")]
    pub max_highlights_per_1000_words: u32,
    /// Ask the model for the narrative summary and barometer.
    #[serde(default = "default_true")]
    pub llm_summary: bool,
    /// Whole-run deadline; unset means no deadline.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_text_chars: default_max_text_chars(),
            chunk_chars: default_chunk_chars(),
            overlap_chars: default_overlap_chars(),
            max_concurrency: default_max_concurrency(),
            max_highlights_per_1000_words: default_max_highlights(),
            llm_summary: true,
            run_timeout_secs: None,
        }
    }
}

fn default_max_text_chars() -> usize {
    400_000
}
fn default_chunk_chars() -> usize {
    6000
}
fn default_overlap_chars() -> usize {
    400
}
fn default_max_concurrency() -> usize {
    3
}
fn default_max_highlights() -> u32 {
    12
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct BudgetConfig {
    #[serde(default = "default_daily_token_limit")]
    pub daily_token_limit: u64,
    #[serde(default = "default_lockout_hours")]
    pub lockout_hours: i64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_token_limit: default_daily_token_limit(),
            lockout_hours: default_lockout_hours(),
        }
    }
}

fn default_daily_token_limit() -> u64 {
    1_000_000
}
fn default_lockout_hours() -> i64 {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Built-in defaults with the database at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            server: ServerConfig::default(),
            llm: LlmConfig::default(),
            analysis: AnalysisConfig::default(),
            budget: BudgetConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let analysis = &config.analysis;

    if analysis.chunk_chars == 0 {
        anyhow::bail!("analysis.chunk_chars must be > 0");
    }
    if analysis.overlap_chars >= analysis.chunk_chars {
        anyhow::bail!("analysis.overlap_chars must be smaller than analysis.chunk_chars");
    }
    if analysis.max_text_chars == 0 {
        anyhow::bail!("analysis.max_text_chars must be > 0");
    }
    if analysis.max_concurrency == 0 {
        anyhow::bail!("analysis.max_concurrency must be >= 1");
    }
    if analysis.max_highlights_per_1000_words == 0 {
        anyhow::bail!("analysis.max_highlights_per_1000_words must be >= 1");
    }
    if analysis.run_timeout_secs == Some(0) {
        anyhow::bail!("analysis.run_timeout_secs must be > 0 when set");
    }

    if config.budget.daily_token_limit == 0 {
        anyhow::bail!("budget.daily_token_limit must be > 0");
    }
    if config.budget.lockout_hours <= 0 {
        anyhow::bail!("budget.lockout_hours must be > 0");
    }

    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.llm.is_enabled() {
        if config.llm.model.trim().is_empty() {
            anyhow::bail!("llm.model must be specified when provider is 'openai'");
        }
        if !(0.0..=2.0).contains(&config.llm.temperature) {
            anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_text: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = parse("[db]\npath = \"./data/parley.sqlite\"\n").unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:7341");
        assert_eq!(config.analysis.max_concurrency, 3);
        assert_eq!(config.analysis.chunk_chars, 6000);
        assert_eq!(config.budget.daily_token_limit, 1_000_000);
        assert_eq!(config.budget.lockout_hours, 24);
        assert!(config.llm.is_enabled());
        assert!(config.analysis.run_timeout_secs.is_none());
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_chunk() {
        let err = parse(
            "[db]\npath = \"x.db\"\n[analysis]\nchunk_chars = 100\noverlap_chars = 100\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlap_chars"));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = parse("[db]\npath = \"x.db\"\n[llm]\nprovider = \"carrier-pigeon\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown llm provider"));
    }

    #[test]
    fn test_minimal_is_valid() {
        assert!(validate(&Config::minimal("/tmp/parley.db")).is_ok());
    }
}
