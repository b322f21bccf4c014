// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::provider::LlmProvider;

/// Process-wide provider registry with mutable session defaults.
///
/// Readers are common (every request resolves a provider), writers are
/// rare (registration at startup, `set_session_defaults` when the user
/// switches models), so a plain `RwLock` is sufficient.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn LlmProvider>>>,
    defaults: RwLock<SessionDefaults>,
}

#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub provider: String,
    pub model: String,
}

impl ProviderRegistry {
    pub fn new(default_provider: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            defaults: RwLock::new(SessionDefaults {
                provider: default_provider.into(),
                model: default_model.into(),
            }),
        }
    }

    pub fn register(&self, provider: Arc<dyn LlmProvider>) {
        self.providers
            .write()
            .expect("provider registry lock poisoned")
            .insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers
            .read()
            .expect("provider registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Provider for the current session defaults.
    pub fn default_provider(&self) -> Option<Arc<dyn LlmProvider>> {
        let name = self.session_defaults().provider;
        self.get(&name)
    }

    /// Update the default provider/model pair for subsequent requests.
    /// `None` keeps the current value.
    pub fn set_session_defaults(&self, provider: Option<&str>, model: Option<&str>) {
        let mut defaults = self
            .defaults
            .write()
            .expect("provider registry lock poisoned");
        if let Some(p) = provider {
            defaults.provider = p.to_string();
        }
        if let Some(m) = model {
            defaults.model = m.to_string();
        }
    }

    pub fn session_defaults(&self) -> SessionDefaults {
        self.defaults
            .read()
            .expect("provider registry lock poisoned")
            .clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
