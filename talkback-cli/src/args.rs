use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Talk to an ElevenLabs conversational agent from the terminal.
#[derive(Debug, Parser)]
#[command(name = "talkback")]
#[command(version)]
pub struct Cli {
    /// Configuration file path (defaults to the user config directory)
    #[arg(long, global = true, env = "TALKBACK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the interactive conversation console (default)
    Run(RunArgs),

    /// Manage the ElevenLabs API key stored in the OS keyring
    #[command(subcommand)]
    Secret(SecretCommand),

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Clone, Default, Args)]
pub struct RunArgs {
    /// Agent to talk to
    #[arg(long)]
    pub agent_id: Option<String>,

    /// ElevenLabs API key; only needed for private agents
    #[arg(long)]
    pub api_key: Option<String>,

    /// How long `stop` waits for the conversation to wind down
    #[arg(long)]
    pub stop_timeout_ms: Option<u64>,

    /// Microphone to use instead of the system default
    #[arg(long)]
    pub input_device: Option<String>,

    /// Run without microphone or speakers (transcripts only)
    #[arg(long)]
    pub no_audio: bool,
}

#[derive(Debug, Subcommand)]
pub enum SecretCommand {
    /// Store the API key (read from stdin when not given)
    Set { value: Option<String> },
    /// Remove the stored API key
    Delete,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Write a default configuration file
    Init {
        /// Agent id to record in the new file
        #[arg(long)]
        agent_id: Option<String>,

        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration file
    Show,
}
