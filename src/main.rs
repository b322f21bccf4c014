// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{AuthCommands, Cli, Commands};
use codepunk_config::{AuthStore, Config, FileAuthStore};
use codepunk_core::{
    ChatOptions, ChatSession, InMemoryMessageRepository, InMemorySessionRepository, Session,
    SessionRepository, ToolInterceptor, TOOL_STATUS_PREFIX,
};
use codepunk_git::{startup_cleanup, GitSessionOptions, GitShadowSession};
use codepunk_model::{MemoryPromptCache, ProviderRegistry};
use codepunk_tools::{
    AutoApprovalService, FileEditService, ReadFileTool, ReplaceInFileTool, ShellTool,
    ToolRegistry, WriteFileTool,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let mut config = codepunk_config::load(cli.config.as_deref())?;
    if let Some(provider) = &cli.provider {
        config.model.provider = provider.clone();
    }
    if let Some(model) = &cli.model {
        config.model.name = model.clone();
    }

    match &cli.command {
        Some(Commands::ShowConfig) => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
        Some(Commands::Cleanup) => run_cleanup(&config).await,
        Some(Commands::ListTools) => {
            let tools = build_tools(&config)?;
            for spec in tools.specs() {
                let first_line = spec.description.lines().next().unwrap_or("");
                println!("{:<18} {}", spec.name, first_line);
            }
            Ok(())
        }
        Some(Commands::Auth { command }) => run_auth(command),
        Some(Commands::Run { discard, .. }) => {
            let prompt = cli
                .prompt_text()
                .context("no prompt given; usage: codepunk run <prompt>")?;
            run_prompt(&config, &prompt, *discard, cli.quiet).await
        }
        None => match cli.prompt_text() {
            Some(prompt) => run_prompt(&config, &prompt, false, cli.quiet).await,
            None => {
                eprintln!("usage: codepunk [run] <prompt>  (see --help)");
                std::process::exit(2);
            }
        },
    }
}

/// Logging goes to stderr so piped stdout stays clean model output.
/// CODEPUNK_VERBOSE=1 / --verbose enable debug; CODEPUNK_QUIET=1 / --quiet
/// suppress everything below warn.
fn init_logging(cli: &Cli) {
    let verbose = cli.verbose || std::env::var("CODEPUNK_VERBOSE").map(|v| v == "1").unwrap_or(false);
    let quiet = cli.quiet || std::env::var("CODEPUNK_QUIET").map(|v| v == "1").unwrap_or(false);
    let default = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_cleanup(config: &Config) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let options = GitSessionOptions::from(&config.git);
    let summary = startup_cleanup(&cwd, codepunk_config::state_dir(), &options).await;
    println!(
        "examined {} session(s): {} reverted, {} pruned, {} kept",
        summary.examined,
        summary.reverted.len(),
        summary.pruned.len(),
        summary.kept.len()
    );
    for id in &summary.reverted {
        println!("  reverted {id}");
    }
    Ok(())
}

fn run_auth(command: &AuthCommands) -> anyhow::Result<()> {
    let store = FileAuthStore::new(codepunk_config::state_dir());
    match command {
        AuthCommands::Set { provider, api_key } => {
            store.set(provider, api_key)?;
            println!("stored key for {provider}");
        }
        AuthCommands::Remove { provider } => {
            store.remove(provider)?;
            println!("removed key for {provider}");
        }
        AuthCommands::List => {
            for provider in store.list()? {
                println!("{provider}");
            }
        }
    }
    Ok(())
}

fn build_tools(config: &Config) -> anyhow::Result<ToolRegistry> {
    let cwd = std::env::current_dir()?;
    let edit = Arc::new(FileEditService::new(
        &cwd,
        Arc::new(AutoApprovalService),
        config.edit.max_file_size,
    ));
    let mut tools = ToolRegistry::from_config(&config.chat, &config.tools);
    tools.register(ReadFileTool::new(edit.clone()));
    tools.register(WriteFileTool::new(edit.clone(), config.edit.require_approval));
    tools.register(ReplaceInFileTool::new(edit, config.edit.require_approval));
    tools.register(ShellTool {
        workdir: Some(cwd.to_string_lossy().into_owned()),
        timeout_secs: 60,
    });
    Ok(tools)
}

async fn run_prompt(
    config: &Config,
    prompt: &str,
    discard: bool,
    quiet: bool,
) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let state_dir = codepunk_config::state_dir();
    let git_options = GitSessionOptions::from(&config.git);

    // Finish whatever a crashed run left behind before touching the tree.
    let summary = startup_cleanup(&cwd, &state_dir, &git_options).await;
    if !summary.reverted.is_empty() {
        eprintln!("reverted {} stale session(s)", summary.reverted.len());
    }

    let auth = FileAuthStore::new(&state_dir);
    let provider = codepunk_model::from_config(&config.model, Some(&auth as &dyn AuthStore))?;
    let registry = Arc::new(ProviderRegistry::new(
        &config.model.provider,
        &config.model.name,
    ));
    registry.register(provider);

    let session = Session::new(prompt.chars().take(60).collect::<String>());
    let sessions = Arc::new(InMemorySessionRepository::default());
    let messages = Arc::new(InMemoryMessageRepository::default());
    sessions.create(&session).await?;

    let mut git = GitShadowSession::new(&cwd, &state_dir, git_options);
    let git_active = git.begin(&session.id).await?;
    let git = Arc::new(Mutex::new(git));

    let tools = Arc::new(build_tools(config)?);
    let interceptor = ToolInterceptor::new(tools, Some(git.clone()));
    let chat = Arc::new(ChatSession::new(
        session.id.clone(),
        sessions,
        messages,
        registry,
        Some(Arc::new(MemoryPromptCache::new(64))),
        interceptor,
        ChatOptions::from_config(config),
    ));

    let cancel = CancellationToken::new();
    let mut stream = chat.clone().send_message_stream(prompt, cancel.clone());
    let mut failed = false;
    while let Some(chunk) = stream.next().await {
        if let Some(delta) = &chunk.content_delta {
            if delta.starts_with(TOOL_STATUS_PREFIX) {
                if !quiet {
                    eprintln!("{delta}");
                }
            } else {
                if delta.starts_with("Error: ") && chunk.is_complete {
                    failed = true;
                }
                print!("{delta}");
                use std::io::Write;
                let _ = std::io::stdout().flush();
            }
        }
    }
    println!();

    if git_active {
        let mut git = git.lock().await;
        if failed || discard {
            git.reject().await?;
            if !quiet {
                eprintln!("git session rejected; working tree restored");
            }
        } else {
            let title = prompt.chars().take(50).collect::<String>();
            git.accept(&format!("CodePunk: {title}")).await?;
            if !quiet {
                eprintln!("git session accepted");
            }
        }
    }

    let usage_note = format!(
        "tokens: {} in / {} out, est. cost ${:.4}",
        chat.accumulated_prompt_tokens(),
        chat.accumulated_completion_tokens(),
        chat.accumulated_cost()
    );
    if !quiet {
        eprintln!("{usage_note}");
    }
    Ok(())
}
