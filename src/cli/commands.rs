use crate::cli::args::{Cli, Command, GraphArgs, SimulateArgs, ValidateArgs};
use crate::core::config::{validation, ChatflowConfig, ConfigLoader};
use crate::core::error::AppError;
use crate::core::flow_graph::dot::flow_to_dot;
use crate::core::flow_graph::engine::{EngineSettings, FlowEngine, TurnStatus};
use crate::core::flow_graph::lint::{LintRegistry, LintSeverity};
use crate::core::flow_graph::registry::FlowRegistry;
use crate::core::flow_graph::schema::load_flow;
use crate::core::flow_graph::state::MemoryStateStore;
use crate::core::message::{InboundMessage, MessageSender, OutboundMessage, OutboundPayload};
use crate::core::notify::RecordingSink;
use crate::core::store::MemoryCrmStore;
use crate::logging;
use crate::runtime::IdleSweeper;
use crate::Result;
use async_trait::async_trait;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Dispatch the parsed CLI command; returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Validate(args) => validate(args).await,
        Command::Graph(args) => graph(args).await,
        Command::Simulate(args) => simulate(args).await,
    }
}

fn load_config(config_arg: Option<&Path>) -> std::result::Result<ChatflowConfig, AppError> {
    match config_arg {
        Some(path) => {
            let config = ConfigLoader::load_from_file(path)?.ok_or_else(|| {
                AppError::new(
                    crate::core::types::ErrorCategory::IoError,
                    format!("config file not found: {}", path.display()),
                )
            })?;
            validation::validate(&config)?;
            Ok(config)
        }
        None => {
            let cwd = env::current_dir().map_err(AppError::from)?;
            ConfigLoader::load_from_workspace(&cwd)
        }
    }
}

async fn validate(args: ValidateArgs) -> Result<i32> {
    let config = load_config(args.config.as_deref())?;
    let _guard = logging::init(&config.logging)?;
    let dir = args.flows_dir.unwrap_or(config.flows.dir);

    let registry = match FlowRegistry::load_dir(&dir) {
        Ok(registry) => registry,
        Err(err) => {
            eprintln!("validation failed: {}", err);
            return Ok(1);
        }
    };

    let lint = LintRegistry::new();
    let mut errors = 0usize;
    let mut warnings = 0usize;
    for flow in registry.iter() {
        let results = lint.run(&flow.document);
        if !results.is_empty() {
            println!("flow '{}':", flow.name());
        }
        for result in results {
            match result.severity {
                LintSeverity::Error => errors += 1,
                LintSeverity::Warning => warnings += 1,
                LintSeverity::Info => {}
            }
            let location = result.location.as_deref().unwrap_or("-");
            println!(
                "  {} {} [{}] {}",
                result.severity, result.code, location, result.message
            );
            if let Some(suggestion) = result.suggestion {
                println!("      hint: {}", suggestion);
            }
        }
    }
    println!(
        "{} flows checked: {} errors, {} warnings",
        registry.len(),
        errors,
        warnings
    );
    if errors > 0 || (args.strict && warnings > 0) {
        Ok(1)
    } else {
        Ok(0)
    }
}

async fn graph(args: GraphArgs) -> Result<i32> {
    let flow = load_flow(&args.flow_file)?;
    let dot = flow_to_dot(&flow);
    match args.output {
        Some(path) => fs::write(&path, dot)?,
        None => println!("{}", dot),
    }
    Ok(0)
}

/// Sender that prints outbound messages to the terminal.
struct ConsoleSender;

#[async_trait]
impl MessageSender for ConsoleSender {
    async fn send(&self, message: OutboundMessage) -> std::result::Result<(), AppError> {
        match &message.payload {
            OutboundPayload::Text { body } => println!("<< {}", body),
            OutboundPayload::Buttons { body, buttons } => {
                println!("<< {}", body);
                for button in buttons {
                    println!("   [{}] {}", button.id, button.title);
                }
            }
            OutboundPayload::List {
                body,
                button,
                sections,
            } => {
                println!("<< {} ({})", body, button);
                for section in sections {
                    println!("   -- {}", section.title);
                    for row in &section.rows {
                        println!("   [{}] {}", row.id, row.title);
                    }
                }
            }
        }
        Ok(())
    }
}

async fn simulate(args: SimulateArgs) -> Result<i32> {
    let config = load_config(args.config.as_deref())?;
    let _guard = logging::init(&config.logging)?;
    let dir: PathBuf = args.flows_dir.unwrap_or_else(|| config.flows.dir.clone());

    let registry = Arc::new(FlowRegistry::load_dir(&dir)?);
    let states = Arc::new(MemoryStateStore::new());
    let store = Arc::new(MemoryCrmStore::new());
    let notifier = Arc::new(RecordingSink::new());
    let settings: EngineSettings = config.engine_settings();
    let engine = Arc::new(FlowEngine::new(
        registry,
        states.clone(),
        store,
        notifier,
        Arc::new(ConsoleSender),
        settings,
    ));

    let sweeper = IdleSweeper::new(
        states,
        validation::parse_duration(&config.sweeper.idle_timeout, "sweeper.idle_timeout")?,
        validation::parse_duration(&config.sweeper.interval, "sweeper.interval")?,
    );
    let sweeper_handle = tokio::spawn(sweeper.run());

    println!(
        "simulating as '{}'; type a message, '/tap <id>' for button taps, '/quit' to exit",
        args.contact
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        let message = match line.strip_prefix("/tap ") {
            Some(id) => {
                InboundMessage::interactive_reply(args.contact.as_str(), id.trim(), id.trim())
            }
            None => InboundMessage::text(args.contact.as_str(), line.as_str()),
        };
        match engine.handle_inbound(message).await {
            Ok(outcome) => {
                if outcome.status == TurnStatus::NoActiveFlow {
                    println!("-- no flow matched; known triggers start a conversation");
                }
            }
            Err(err) => eprintln!("turn failed: {}", err),
        }
    }
    sweeper_handle.abort();
    Ok(0)
}
