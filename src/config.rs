use anyhow::{Context, Result, anyhow};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MAX_API_CALLS: u32 = 100;
pub const DEFAULT_MAX_CALLS_PER_STEP: u32 = 20;
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 180_000;

/// Run configuration. Supplied once per run and never mutated during it.
#[derive(Clone)]
pub struct AgentConfig {
    pub model: String,
    pub max_api_calls: u32,
    pub max_calls_per_step: u32,
    pub step_timeout_ms: u64,
    pub capture_step_screenshots: bool,
    pub api_key: String,
    pub api_base: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_api_calls: DEFAULT_MAX_API_CALLS,
            max_calls_per_step: DEFAULT_MAX_CALLS_PER_STEP,
            step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            capture_step_screenshots: true,
            api_key: String::new(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

// Keeps the key out of logs.
impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("model", &self.model)
            .field("max_api_calls", &self.max_api_calls)
            .field("max_calls_per_step", &self.max_calls_per_step)
            .field("step_timeout_ms", &self.step_timeout_ms)
            .field("capture_step_screenshots", &self.capture_step_screenshots)
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl AgentConfig {
    /// Build from the process environment (call `dotenvy::dotenv()` first if
    /// a `.env` file should be honoured). Missing variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(key) = lookup("OPENAI_API_KEY") {
            config.api_key = key;
        }
        if let Some(model) = lookup("DAPP_AGENT_MODEL") {
            config.model = model;
        }
        if let Some(base) = lookup("DAPP_AGENT_API_BASE") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(raw) = lookup("DAPP_AGENT_MAX_API_CALLS") {
            config.max_api_calls = parse_var("DAPP_AGENT_MAX_API_CALLS", &raw)?;
        }
        if let Some(raw) = lookup("DAPP_AGENT_MAX_CALLS_PER_STEP") {
            config.max_calls_per_step = parse_var("DAPP_AGENT_MAX_CALLS_PER_STEP", &raw)?;
        }
        if let Some(raw) = lookup("DAPP_AGENT_STEP_TIMEOUT_MS") {
            config.step_timeout_ms = parse_var("DAPP_AGENT_STEP_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("DAPP_AGENT_SCREENSHOTS") {
            config.capture_step_screenshots = parse_flag("DAPP_AGENT_SCREENSHOTS", &raw)?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_api_calls == 0 || self.max_calls_per_step == 0 {
            return Err(anyhow!("call budgets must be greater than zero"));
        }
        if self.step_timeout_ms == 0 {
            return Err(anyhow!("step timeout must be greater than zero"));
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("{name} must be a number, got {raw:?}"))
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{name} must be a boolean, got {other:?}")),
    }
}

/// Where screenshots go when no directory is given.
pub fn default_artifacts_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("dapp-agent-runner").join("artifacts"))
        .unwrap_or_else(|| PathBuf::from("artifacts"))
}

/// Persistent Chrome profile so the wallet extension keeps its state between runs.
pub fn default_profile_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("dapp-agent-runner").join("chrome-profile"))
        .unwrap_or_else(|| PathBuf::from("agent_profile"))
}
