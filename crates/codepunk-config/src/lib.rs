// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod auth;
mod loader;
mod schema;

pub use auth::{AuthStore, FileAuthStore};
pub use loader::{load, state_dir};
pub use schema::{
    ChatConfig, Config, EditConfig, GitConfig, ModelConfig, PromptCompose, PromptConfig,
    ToolsConfig,
};
