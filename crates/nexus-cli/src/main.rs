use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use nexus_core::config::ConfigLoader;
use nexus_core::tools::ToolFactory;
use nexus_core::ExecutionEngine;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

#[derive(Parser, Debug)]
#[clap(name = "nexus", author, version, about = "Run untrusted Python code in a sandbox")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, help = "Path to a YAML configuration file")]
    config: Option<PathBuf>,

    #[clap(long, short, help = "Log level; overrides logging.level from the config")]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a Python file (or stdin when no file is given) and print the result envelope
    Run {
        #[clap(help = "Source file; reads stdin when omitted or '-'")]
        file: Option<PathBuf>,

        #[clap(long, help = "Timeout in seconds, clamped to [10, 300]")]
        timeout: Option<i64>,

        #[clap(long, help = "Memory ceiling in MB, clamped to [32, 512]")]
        memory: Option<i64>,
    },
    /// Check a Python file against the security rules without running it
    Validate {
        #[clap(help = "Source file; reads stdin when omitted or '-'")]
        file: Option<PathBuf>,
    },
    /// Probe backend availability and show which one would be selected
    Probe,
    /// List the registered tools
    Tools,
    /// Invoke a tool by name with JSON arguments
    Call {
        tool: String,

        #[clap(long, default_value = "{}")]
        args: String,
    },
}

async fn read_source(file: Option<PathBuf>) -> Result<String> {
    match file {
        Some(path) if path.as_os_str() != "-" => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display())),
        _ => {
            let mut source = String::new();
            tokio::io::stdin()
                .read_to_string(&mut source)
                .await
                .context("Failed to read source from stdin")?;
            Ok(source)
        }
    }
}

/// The `--log-level` flag wins over the config file. Unparseable levels fall
/// back to `warn`.
fn effective_log_level(flag: Option<&str>, configured: &str) -> LevelFilter {
    flag.unwrap_or(configured).parse().unwrap_or(LevelFilter::Warn)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::load_or_default(cli.config.as_deref())
        .await
        .context("Failed to load configuration")?;

    let log_level_filter = effective_log_level(cli.log_level.as_deref(), &config.logging.level);
    // Logs go to stderr; stdout carries only the JSON result.
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .target(env_logger::Target::Stderr)
        .init();
    let engine = Arc::new(ExecutionEngine::from_config(config).context("Failed to build engine")?);

    match cli.command {
        Commands::Run {
            file,
            timeout,
            memory,
        } => {
            let source = read_source(file).await?;
            let result = engine.execute_dynamic_code(&source, timeout, memory).await;
            print_json(&result)?;
            if !result.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Validate { file } => {
            let source = read_source(file).await?;
            let verdict = engine.validate(&source);
            print_json(&verdict)?;
            if !verdict.is_safe() {
                std::process::exit(1);
            }
        }
        Commands::Probe => {
            let report = engine.selector().report().await;
            print_json(&report)?;
        }
        Commands::Tools => {
            let registry = ToolFactory::create_default_registry(engine);
            print_json(&registry.list_tools())?;
        }
        Commands::Call { tool, args } => {
            let arguments: Value =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            let registry = ToolFactory::create_default_registry(engine);
            let output = registry.call(&tool, arguments).await?;
            println!("{}", output);
        }
    }

    Ok(())
}
