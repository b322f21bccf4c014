// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use codepunk_config::{PromptCompose, PromptConfig};
use tracing::debug;

/// Embedded base layer: provider-agnostic operating instructions.
const BASE_PROMPT: &str = "\
You are CodePunk, an AI coding assistant operating inside the user's \
repository. You read, write, and modify files through the provided tools; \
never describe an edit you could make with a tool call instead. Keep \
changes minimal and consistent with the surrounding code. When a task is \
complete, answer with a short summary of what changed.";

/// Embedded provider layer for the Anthropic driver.
const ANTHROPIC_PROMPT: &str = "\
Batch independent tool calls into a single response when possible. When \
you have enough information to finish, stop calling tools and write the \
final answer.";

/// Compose the system prompt from the base and provider layers.
///
/// `custom` (user-configured) overrides everything. Otherwise each layer
/// may be overridden by a file in one of the configured prompt
/// directories (`base.md` / `<provider>.md`), searched in order, and the
/// layers combine per the configured compose mode.
pub fn system_prompt(config: &PromptConfig, provider: &str, custom: Option<&str>) -> String {
    if let Some(text) = custom {
        return text.to_string();
    }

    let base = load_layer(config, "base").unwrap_or_else(|| BASE_PROMPT.to_string());
    let provider_layer = load_layer(config, provider).unwrap_or_else(|| {
        match provider {
            "anthropic" => ANTHROPIC_PROMPT.to_string(),
            _ => String::new(),
        }
    });

    match config.compose {
        PromptCompose::Base => base,
        PromptCompose::Provider => {
            if provider_layer.is_empty() {
                base
            } else {
                provider_layer
            }
        }
        PromptCompose::Composite => {
            if provider_layer.is_empty() {
                base
            } else {
                format!("{base}\n\n{provider_layer}")
            }
        }
    }
}

fn load_layer(config: &PromptConfig, name: &str) -> Option<String> {
    for dir in &config.paths {
        let path = Path::new(dir).join(format!("{name}.md"));
        if let Ok(text) = std::fs::read_to_string(&path) {
            debug!(path = %path.display(), "loaded prompt layer override");
            let trimmed = text.trim().to_string();
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
