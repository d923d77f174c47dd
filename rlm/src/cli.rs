//! CLI definitions

use clap::Parser;
use std::path::PathBuf;

/// Recursive language model engine
///
/// Reads one JSON request from stdin (or --input) and writes one JSON
/// response line to stdout.
#[derive(Debug, Parser)]
#[command(
    name = "rlm",
    about = "Recursive language model engine with structured output",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level", help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)")]
    pub log_level: Option<String>,

    /// Read the request from a file instead of stdin
    #[arg(short, long, value_name = "FILE")]
    pub input: Option<PathBuf>,
}

/// Where logs are written
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rlm")
        .join("logs")
        .join("rlm.log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::parse_from(["rlm", "--input", "req.json", "-l", "debug"]);
        assert_eq!(cli.input, Some(PathBuf::from("req.json")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_log_path() {
        assert!(get_log_path().ends_with("rlm/logs/rlm.log"));
    }
}
