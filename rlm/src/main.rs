//! rlm - recursive language model engine
//!
//! Reads one JSON request, runs it, writes one JSON response.

use std::fs;
use std::io::Read;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, error, info};

use rlm::cli::{Cli, get_log_path};
use rlm::config::Config;
use rlm::request::{Request, handle_request};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Logging goes to a file; stdout carries the response
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level).map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("INFO") | None => tracing::Level::INFO,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

fn read_request(cli: &Cli) -> Result<Request> {
    let text = match &cli.input {
        Some(path) => fs::read_to_string(path).context(format!("Failed to read request from {}", path.display()))?,
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("Failed to read request from stdin")?;
            text
        }
    };
    debug!(len = text.len(), "read_request: read");
    Ok(Request::from_json(&text)?)
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let request = read_request(&cli)?;
    info!(model = %request.model, structured = request.structured.is_some(), "Handling request");

    let response = handle_request(request, &config).await?;
    println!("{}", serde_json::to_string(&response).context("Failed to serialize response")?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    if let Err(e) = setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()) {
        eprintln!("Warning: {e:#}");
    }

    if let Err(e) = run(cli).await {
        error!(error = %e, "Request failed");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
