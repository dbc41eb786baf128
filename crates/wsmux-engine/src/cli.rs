//! CLI argument parsing for the wsmux binary.

use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for wsmux_core::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => wsmux_core::LogFormat::Text,
            CliLogFormat::Json => wsmux_core::LogFormat::Json,
        }
    }
}

/// wsmux - attach the current terminal to a managed shell session.
#[derive(Debug, Parser)]
#[command(
    name = "wsmux",
    version,
    about = "Attach the current terminal to a managed shell session"
)]
pub struct Cli {
    /// Workspace the session belongs to
    #[arg(short = 'w', long = "workspace", default_value = "default")]
    pub workspace: String,

    /// Working directory for the session's shell
    #[arg(short = 'd', long = "working-dir", default_value = ".")]
    pub working_dir: PathBuf,

    /// Run this command in a runner session instead of opening a plain tab
    #[arg(short = 'c', long = "command", value_name = "CMD")]
    pub command: Option<String>,

    /// Runner name; the session id becomes runner:<workspace>:<name>
    #[arg(long = "runner-name", value_name = "NAME", requires = "command")]
    pub runner_name: Option<String>,

    /// Setup command run to completion before the main session (repeatable)
    #[arg(long = "setup", action = ArgAction::Append, value_name = "CMD")]
    pub setup: Vec<String>,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,
}

impl Cli {
    /// Whether the main session is a runner rather than a tab.
    pub fn is_runner(&self) -> bool {
        self.command.is_some()
    }

    /// Runner name to use when `--command` is given.
    pub fn runner_name(&self) -> &str {
        self.runner_name.as_deref().unwrap_or("main")
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        // Verify the CLI configuration is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn default_values() {
        let cli = Cli::try_parse_from(["wsmux"]).unwrap();
        assert_eq!(cli.workspace, "default");
        assert_eq!(cli.working_dir, PathBuf::from("."));
        assert!(cli.command.is_none());
        assert!(!cli.is_runner());
        assert_eq!(cli.runner_name(), "main");
        assert!(cli.setup.is_empty());
        assert_eq!(cli.verbose, 0);
        assert_eq!(cli.log_format, CliLogFormat::Text);
    }

    #[test]
    fn parse_runner_command() {
        let cli = Cli::try_parse_from(["wsmux", "-c", "npm run dev"]).unwrap();
        assert!(cli.is_runner());
        assert_eq!(cli.command.as_deref(), Some("npm run dev"));
        assert_eq!(cli.runner_name(), "main");

        let cli =
            Cli::try_parse_from(["wsmux", "-c", "npm run dev", "--runner-name", "web"]).unwrap();
        assert_eq!(cli.runner_name(), "web");
    }

    #[test]
    fn runner_name_requires_command() {
        assert!(Cli::try_parse_from(["wsmux", "--runner-name", "web"]).is_err());
    }

    #[test]
    fn parse_setup_commands() {
        let cli = Cli::try_parse_from([
            "wsmux",
            "--setup",
            "npm install",
            "--setup",
            "cp .env.sample .env",
        ])
        .unwrap();
        assert_eq!(cli.setup, vec!["npm install", "cp .env.sample .env"]);
    }

    #[test]
    fn parse_workspace_and_dir() {
        let cli =
            Cli::try_parse_from(["wsmux", "-w", "feature-x", "-d", "/work/feature-x"]).unwrap();
        assert_eq!(cli.workspace, "feature-x");
        assert_eq!(cli.working_dir, PathBuf::from("/work/feature-x"));
    }

    #[test]
    fn parse_verbosity() {
        let cli = Cli::try_parse_from(["wsmux", "-vvv"]).unwrap();
        assert_eq!(cli.verbose, 3);
    }

    #[test]
    fn parse_log_format() {
        let cli = Cli::try_parse_from(["wsmux", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format, CliLogFormat::Json);
    }
}
