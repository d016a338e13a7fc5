//! gui-bridge: stdio bridge between a desktop front end and a GUI agent
//!
//! Reads line-delimited JSON requests on stdin and writes events on stdout.
//! Logs go to stderr so they never mix with protocol output.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gui_core::config::InputBackend;
use gui_core::input::detect_driver;
use gui_core::process::is_available;
use gui_core::{Bridge, ChatAgentFactory, CommandScreen, Config, ScreenCapture};
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gui-bridge")]
#[command(about = "Line-JSON bridge driving a GUI automation agent", version)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true, env = "GUI_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve requests on stdin/stdout (default)
    Serve {
        /// Steps per run before giving up (overrides config)
        #[arg(long)]
        max_steps: Option<usize>,

        /// Input backend: auto, xdotool or cliclick (overrides config)
        #[arg(long)]
        input_backend: Option<String>,
    },

    /// Check that capture and input tools are installed
    Doctor,

    /// Write a default config file
    InitConfig {
        /// Overwrite target (defaults to the user config directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Commands::Serve {
            max_steps,
            input_backend,
        }) => serve(cli.config, max_steps, input_backend).await,
        Some(Commands::Doctor) => doctor(cli.config).await,
        Some(Commands::InitConfig { output }) => init_config(output),
        None => serve(cli.config, None, None).await,
    }
}

async fn serve(
    config_path: Option<PathBuf>,
    max_steps: Option<usize>,
    input_backend: Option<String>,
) -> Result<()> {
    let (_, mut config) = resolve_config(config_path)?;
    if let Some(steps) = max_steps {
        config.run.max_steps = steps;
    }
    if let Some(backend) = input_backend {
        config.input.backend = backend.parse::<InputBackend>()?;
    }

    let screen = CommandScreen::from_config(&config.screen)?;
    let input = detect_driver(&config.input)?;
    let factory = ChatAgentFactory::new(Duration::from_secs(config.agent.request_timeout_secs));

    info!(
        max_steps = config.run.max_steps,
        input = input.name(),
        "Bridge ready"
    );

    let mut bridge = Bridge::new(Arc::new(factory), Arc::new(screen), input, config);
    bridge
        .serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
}

/// The config file in effect and its contents
///
/// Only the default location may be missing; an explicit path must exist.
fn resolve_config(path: Option<PathBuf>) -> Result<(PathBuf, Config)> {
    match path {
        Some(path) => {
            let config = Config::load_from(&path)?;
            Ok((path, config))
        }
        None => Ok((Config::config_path()?, Config::load()?)),
    }
}

async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (path, config) = resolve_config(config_path)?;
    let mut healthy = true;

    if path.exists() {
        println!("Config: {}", path.display());
    } else {
        println!("Config: {} (not found, using defaults)", path.display());
    }

    let screen = CommandScreen::from_config(&config.screen)?;
    for program in screen.required_programs() {
        let found = is_available(program);
        healthy &= found;
        println!("  capture  {:<12} {}", program, if found { "ok" } else { "missing" });
    }

    match screen.size().await {
        Ok(size) => println!("  screen   {}", size),
        Err(e) => {
            healthy = false;
            println!("  screen   unavailable: {:#}", e);
        }
    }

    match detect_driver(&config.input) {
        Ok(driver) => {
            println!("  input    {}", driver.name());
            if driver.name() == "cliclick" {
                // Scrolling and middle clicks go through osascript
                let found = is_available("osascript");
                healthy &= found;
                let status = if found { "ok" } else { "missing" };
                println!("  input    {:<12} {}", "osascript", status);
            }
        }
        Err(e) => {
            healthy = false;
            println!("  input    {:#}", e);
        }
    }

    for var in ["OPENAI_API_KEY", "ANTHROPIC_API_KEY", "OPENROUTER_API_KEY", "HF_TOKEN"] {
        let set = std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false);
        println!("  env      {:<20} {}", var, if set { "set" } else { "unset" });
    }

    if !healthy {
        anyhow::bail!("Some required tools are missing");
    }
    Ok(())
}

fn init_config(output: Option<PathBuf>) -> Result<()> {
    let path = match output {
        Some(path) => path,
        None => Config::config_path()?,
    };

    Config::create_default(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}
