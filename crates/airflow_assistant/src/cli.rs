use crate::config::AppConfig;
use crate::mcp::SessionPolicy;
use clap::{Parser, Subcommand};
use llm::factory::LLMProviderType;
use std::path::PathBuf;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Answer a single question and exit
    Ask {
        /// The question about your Airflow deployment
        question: String,
    },

    /// Interactive chat with a bounded history
    Chat,

    /// List the tool server's tools and their model declarations
    Tools,

    /// List the models offered by the configured provider
    Models,
}

/// Define the application arguments
#[derive(Parser, Debug)]
#[command(version, about = "Ask questions about Airflow through an LLM and its tools", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// LLM provider to use (overrides the configuration file)
    #[arg(short = 'p', long, global = true)]
    pub provider: Option<LLMProviderType>,

    /// Model name to use (provider-specific)
    #[arg(short = 'm', long, global = true)]
    pub model: Option<String>,

    /// Maximum number of model calls per question
    #[arg(long, global = true)]
    pub max_depth: Option<usize>,

    /// Tool server process lifecycle
    #[arg(long, global = true)]
    pub policy: Option<SessionPolicy>,
}

impl Args {
    pub fn parse() -> Self {
        <Args as Parser>::parse()
    }

    /// Applies the command line overrides to `config`.
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(provider) = self.provider {
            if provider != config.llm.provider {
                // A model or endpoint of another provider would not work
                config.llm.model = None;
                config.llm.base_url = None;
            }
            config.llm.provider = provider;
        }
        if let Some(model) = &self.model {
            config.llm.model = Some(model.clone());
        }
        if let Some(max_depth) = self.max_depth {
            config.max_depth = max_depth;
        }
        if let Some(policy) = self.policy {
            config.session_policy = policy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ask_parsing() {
        let args = Args::try_parse_from(["test", "ask", "How many dags are active?"])
            .expect("Failed to parse args");

        assert_eq!(
            args.command,
            Command::Ask {
                question: "How many dags are active?".to_string()
            }
        );
        assert_eq!(args.verbose, 0);
        assert!(args.provider.is_none());
        assert!(args.config.is_none());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "test",
            "chat",
            "-vv",
            "--provider",
            "openai",
            "--max-depth",
            "3",
            "--policy",
            "ephemeral",
        ])
        .unwrap();

        assert_eq!(args.command, Command::Chat);
        assert_eq!(args.verbose, 2);
        assert_eq!(args.provider, Some(LLMProviderType::OpenAI));
        assert_eq!(args.max_depth, Some(3));
        assert_eq!(args.policy, Some(SessionPolicy::Ephemeral));
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Args::try_parse_from(["test"]).is_err());
        assert!(Args::try_parse_from(["test", "ask"]).is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = AppConfig::default();
        config.llm.model = Some("claude-3-5-sonnet-20241022".to_string());

        let args = Args::try_parse_from(["test", "--provider", "gemini", "--max-depth", "4", "tools"])
            .unwrap();
        args.apply_overrides(&mut config);

        assert_eq!(config.llm.provider, LLMProviderType::Gemini);
        assert!(config.llm.model.is_none());
        assert_eq!(config.max_depth, 4);
        assert_eq!(config.session_policy, SessionPolicy::Pooled);

        let args = Args::try_parse_from(["test", "models", "-m", "gemini-1.5-flash"]).unwrap();
        args.apply_overrides(&mut config);
        assert_eq!(config.llm.model.as_deref(), Some("gemini-1.5-flash"));
    }
}
