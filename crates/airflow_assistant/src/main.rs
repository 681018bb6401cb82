use airflow_assistant::agent::{RunError, RunOutcome};
use airflow_assistant::chat::ChatService;
use airflow_assistant::cli::{Args, Command};
use airflow_assistant::config::AppConfig;
use airflow_assistant::logging::setup_logging;
use airflow_assistant::tools::to_provider_tool;
use anyhow::{Context, Result};
use llm::factory::create_llm_client;
use llm::{LLMProvider, Message};
use rustyline::{error::ReadlineError, history::DefaultHistory, Config, Editor};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let args = Args::parse();
    setup_logging(args.verbose);

    let mut config = AppConfig::load(args.config.as_deref())?;
    args.apply_overrides(&mut config);
    debug!("Using provider {:?}", config.llm.provider);

    match &args.command {
        Command::Ask { question } => ask(&config, question).await,
        Command::Chat => chat(&config).await,
        Command::Tools => list_tools(&config).await,
        Command::Models => list_models(&config),
    }
}

fn create_client(config: &AppConfig) -> Result<Box<dyn LLMProvider>> {
    create_llm_client(config.llm_client_config()).context("Failed to create LLM client")
}

/// Runs `run` and cancels `cancel` when Ctrl-C is pressed meanwhile.
async fn interruptible<F, T>(cancel: CancellationToken, run: F) -> T
where
    F: Future<Output = T>,
{
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    let result = run.await;
    watcher.abort();
    result
}

fn print_outcome(outcome: &RunOutcome) {
    println!("{}", outcome.answer);
    if outcome.truncated {
        eprintln!(
            "(stopped after {} model calls, the answer may be incomplete)",
            outcome.depth + 1
        );
    }
}

async fn ask(config: &AppConfig, question: &str) -> Result<()> {
    let mut llm = create_client(config)?;
    let service = ChatService::new(config);

    let cancel = CancellationToken::new();
    let result = interruptible(
        cancel.clone(),
        service.answer(llm.as_mut(), &[], question, cancel),
    )
    .await;
    service.shutdown().await;

    print_outcome(&result?);
    Ok(())
}

async fn chat(config: &AppConfig) -> Result<()> {
    let mut llm = create_client(config)?;
    let service = ChatService::new(config);

    let editor_config = Config::builder()
        .edit_mode(rustyline::EditMode::Emacs)
        .build();
    let mut editor: Editor<(), DefaultHistory> =
        Editor::with_config(editor_config).context("Failed to create line editor")?;

    println!(
        "Ask about your Airflow deployment ({}, {:?} tool sessions). Ctrl-D to quit.",
        llm.provider_name(),
        service.policy()
    );

    let mut history: Vec<Message> = Vec::new();
    loop {
        let line = match editor.readline("> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                service.shutdown().await;
                return Err(e).context("Failed to read input");
            }
        };
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if question == "exit" || question == "quit" {
            break;
        }
        if let Err(e) = editor.add_history_entry(question) {
            debug!("Failed to record history entry: {}", e);
        }

        let cancel = CancellationToken::new();
        let result = interruptible(
            cancel.clone(),
            service.answer(llm.as_mut(), &history, question, cancel),
        )
        .await;

        match result {
            Ok(outcome) => {
                print_outcome(&outcome);
                history.push(Message::new_user(question));
                history.push(Message::new_assistant(outcome.answer));
                if history.len() > config.history_limit {
                    let excess = history.len() - config.history_limit;
                    history.drain(..excess);
                }
            }
            Err(RunError::Cancelled) => eprintln!("Cancelled."),
            Err(e) => eprintln!("Error: {e}"),
        }
    }

    service.shutdown().await;
    Ok(())
}

async fn list_tools(config: &AppConfig) -> Result<()> {
    let service = ChatService::new(config);
    let tools = service.list_tools().await;
    service.shutdown().await;
    let tools = tools.context("Failed to list tools")?;

    let dialect = config.llm.provider.schema_dialect();
    for tool in &tools {
        println!("{}: {}", tool.name, tool.description);
        match to_provider_tool(tool, dialect) {
            Ok(declaration) => println!("{}", serde_json::to_string_pretty(&declaration)?),
            Err(e) => println!("  not declared: {e}"),
        }
        println!();
    }
    println!("{} tools", tools.len());
    Ok(())
}

fn list_models(config: &AppConfig) -> Result<()> {
    let llm = create_client(config)?;
    let selected = config.llm.model.as_deref();
    for (index, model) in llm.available_models().iter().enumerate() {
        let marker = match selected {
            Some(selected) if selected == model => " (selected)",
            None if index == 0 => " (default)",
            _ => "",
        };
        println!("{model}{marker}");
    }
    Ok(())
}
