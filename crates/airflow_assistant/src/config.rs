use crate::agent::{RunSettings, DEFAULT_MAX_DEPTH, DEFAULT_MAX_TOKENS, DEFAULT_SYSTEM_PROMPT};
use crate::mcp::{SessionPolicy, ToolServerConfig};
use anyhow::{Context, Result};
use llm::factory::{LLMClientConfig, LLMProviderType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const CONFIG_DIR_NAME: &str = "airflow-assistant";
const CONFIG_FILE_NAME: &str = "config.json";

/// Model backend selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: LLMProviderType,
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// Prefer the provider's environment variable over storing keys here
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSettings,
    pub tool_server: ToolServerConfig,
    pub session_policy: SessionPolicy,
    /// Upper bound on concurrently checked-out pooled sessions
    pub pool_size: usize,
    pub max_depth: usize,
    pub max_tokens: u32,
    pub model_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    /// Number of earlier chat messages replayed to the model
    pub history_limit: usize,
    pub system_prompt: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmSettings::default(),
            tool_server: default_tool_server(),
            session_policy: SessionPolicy::default(),
            pool_size: 2,
            max_depth: DEFAULT_MAX_DEPTH,
            max_tokens: DEFAULT_MAX_TOKENS,
            model_timeout_secs: 120,
            tool_timeout_secs: 60,
            history_limit: 20,
            system_prompt: None,
        }
    }
}

/// The Airflow tool server, configured from the environment.
fn default_tool_server() -> ToolServerConfig {
    ToolServerConfig::new("airflow-mcp-server")
        .with_args(["--unsafe"])
        .with_env("AIRFLOW_BASE_URL", "${AIRFLOW_BASE_URL}")
        .with_env("AUTH_TOKEN", "${AIRFLOW_AUTH_TOKEN}")
}

impl AppConfig {
    /// Loads the configuration from `path`, or from the default location.
    ///
    /// An explicitly given file must exist. A missing file at the default
    /// location yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::load_from(&path),
                _ => {
                    debug!("No configuration file found, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            max_depth: self.max_depth,
            max_tokens: Some(self.max_tokens),
            system_prompt: self
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            model_timeout: self.model_timeout(),
        }
    }

    pub fn llm_client_config(&self) -> LLMClientConfig {
        LLMClientConfig {
            provider: self.llm.provider,
            model: self.llm.model.clone(),
            base_url: self.llm.base_url.clone(),
            api_key: self.llm.api_key.clone(),
        }
    }
}

/// `<config dir>/airflow-assistant/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_config(
            r#"{
                "llm": {"provider": "gemini", "model": "gemini-1.5-flash"},
                "tool_server": {"command": "python", "args": ["server.py"]},
                "session_policy": "ephemeral",
                "max_depth": 3
            }"#,
        );

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.llm.provider, LLMProviderType::Gemini);
        assert_eq!(config.llm.model.as_deref(), Some("gemini-1.5-flash"));
        assert_eq!(config.tool_server.command, "python");
        assert_eq!(config.tool_server.args, vec!["server.py"]);
        assert!(config.tool_server.env.is_empty());
        assert_eq!(config.session_policy, SessionPolicy::Ephemeral);
        assert_eq!(config.max_depth, 3);
        assert_eq!(config.max_tokens, 4096);
        assert_eq!(config.history_limit, 20);
        assert_eq!(config.tool_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_empty_object_is_default() {
        let file = write_config("{}");
        assert_eq!(AppConfig::load(Some(file.path())).unwrap(), AppConfig::default());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = AppConfig::load(Some(&dir.path().join("missing.json")));
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("Failed to read config file"), "{message}");
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let file = write_config("{\"max_depth\": \"deep\"}");
        let message = format!("{:#}", AppConfig::load(Some(file.path())).unwrap_err());
        assert!(message.contains("Failed to parse config file"), "{message}");
    }

    #[test]
    fn test_run_settings_use_default_prompt() {
        let mut config = AppConfig::default();
        let settings = config.run_settings();
        assert_eq!(settings.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(settings.max_tokens, Some(4096));
        assert_eq!(settings.model_timeout, Duration::from_secs(120));

        config.system_prompt = Some("Be brief.".to_string());
        assert_eq!(config.run_settings().system_prompt, "Be brief.");
    }

    #[test]
    fn test_llm_client_config_mirrors_settings() {
        let mut config = AppConfig::default();
        config.llm.provider = LLMProviderType::OpenAI;
        config.llm.base_url = Some("http://localhost:1234/v1".to_string());

        let client_config = config.llm_client_config();
        assert_eq!(client_config.provider, LLMProviderType::OpenAI);
        assert_eq!(
            client_config.base_url.as_deref(),
            Some("http://localhost:1234/v1")
        );
        assert!(client_config.model.is_none());
    }
}
