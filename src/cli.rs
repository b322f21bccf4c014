// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "codepunk",
    about = "Agentic coding assistant: a bounded model/tool loop with git-shadowed edits",
    version
)]
pub struct Cli {
    /// Path to the config file (default: ~/.config/codepunk/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the model for this invocation
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Override the provider for this invocation
    #[arg(long, global = true)]
    pub provider: Option<String>,

    /// Log to stderr (also: CODEPUNK_VERBOSE=1)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output (also: CODEPUNK_QUIET=1)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,

    /// The prompt to run when no subcommand is given
    #[arg(trailing_var_arg = true)]
    pub prompt: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one prompt headlessly and print the final answer
    Run {
        /// The prompt text
        prompt: Vec<String>,
        /// Discard the git shadow session instead of accepting it
        #[arg(long)]
        discard: bool,
    },
    /// Revert stale git shadow sessions left by crashed runs
    Cleanup,
    /// List the registered tools
    ListTools,
    /// Print the effective configuration
    ShowConfig,
    /// Manage stored provider API keys
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum AuthCommands {
    /// Store an API key for a provider
    Set { provider: String, api_key: String },
    /// Remove a stored API key
    Remove { provider: String },
    /// List providers with stored keys
    List,
}

impl Cli {
    /// The prompt text, from the subcommand or the trailing arguments.
    pub fn prompt_text(&self) -> Option<String> {
        let words = match &self.command {
            Some(Commands::Run { prompt, .. }) => prompt,
            None => &self.prompt,
            _ => return None,
        };
        if words.is_empty() {
            None
        } else {
            Some(words.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_prompt_is_collected() {
        let cli = Cli::parse_from(["codepunk", "fix", "the", "bug"]);
        assert_eq!(cli.prompt_text().as_deref(), Some("fix the bug"));
    }

    #[test]
    fn run_subcommand_collects_prompt() {
        let cli = Cli::parse_from(["codepunk", "run", "add", "tests"]);
        assert_eq!(cli.prompt_text().as_deref(), Some("add tests"));
    }

    #[test]
    fn cleanup_has_no_prompt() {
        let cli = Cli::parse_from(["codepunk", "cleanup"]);
        assert!(cli.prompt_text().is_none());
    }

    #[test]
    fn model_override_is_global() {
        let cli = Cli::parse_from(["codepunk", "--model", "claude-haiku-4-5", "run", "x"]);
        assert_eq!(cli.model.as_deref(), Some("claude-haiku-4-5"));
    }
}
