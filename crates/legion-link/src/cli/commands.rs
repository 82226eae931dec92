//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use crate::transport::ProtocolHint;

/// Run this device as the commander.
#[derive(Debug, Args)]
pub struct CommanderCommand {
    /// Which port to listen on
    #[arg(long, value_enum, default_value = "fast")]
    pub hint: HintArg,
}

/// Run this device as a field node.
#[derive(Debug, Args)]
pub struct FieldCommand {
    /// Commander address, as `host` or `host:port`
    pub address: String,

    /// Which port to dial when the address has none
    #[arg(long, value_enum, default_value = "fast")]
    pub hint: HintArg,

    /// Name shown in the commander's device list
    #[arg(short, long)]
    pub name: Option<String>,

    /// Lens label to report
    #[arg(short, long)]
    pub lens: Option<String>,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show configuration file path
    Path,

    /// Validate configuration file
    Validate {
        /// Path to config file (uses default if not specified)
        file: Option<PathBuf>,
    },
}

/// Protocol hint for CLI arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HintArg {
    /// Primary low-latency path
    Fast,
    /// Fallback path
    Alternate,
}

impl From<HintArg> for ProtocolHint {
    fn from(arg: HintArg) -> Self {
        match arg {
            HintArg::Fast => Self::Fast,
            HintArg::Alternate => Self::Alternate,
        }
    }
}

/// A line typed into an interactive commander session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Trigger a synchronized start.
    Start,
    /// Trigger a global stop.
    Stop,
    /// List connected devices.
    Devices,
    /// Show session status.
    Status,
    /// Send an application command with optional JSON data.
    Send {
        /// Command name.
        name: String,
        /// Arguments, `null` when omitted.
        data: serde_json::Value,
    },
    /// Show the available commands.
    Help,
    /// End the session.
    Quit,
}

impl ConsoleCommand {
    /// Parse one input line. Blank lines yield `None`.
    ///
    /// # Errors
    ///
    /// Returns a message for unknown commands or malformed JSON data.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let command = match word.to_ascii_lowercase().as_str() {
            "start" => Self::Start,
            "stop" => Self::Stop,
            "devices" | "ls" => Self::Devices,
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            "send" => {
                let rest = rest.trim();
                let (name, data) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
                if name.is_empty() {
                    return Err("usage: send <name> [json]".to_string());
                }
                let data = if data.trim().is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::from_str(data.trim()).map_err(|e| format!("invalid JSON data: {e}"))?
                };
                Self::Send {
                    name: name.to_string(),
                    data,
                }
            }
            other => return Err(format!("unknown command '{other}' (try 'help')")),
        };
        Ok(Some(command))
    }
}

/// Help text for the interactive commander.
pub const CONSOLE_HELP: &str = "\
start              trigger a synchronized start
stop               stop recording everywhere
devices            list connected field nodes
status             show session status
send NAME [JSON]   send an application command
quit               tear down and exit";
