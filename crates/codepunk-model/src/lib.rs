// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod catalog;
pub mod registry;
mod anthropic;
mod cache;
mod error;
mod mock;
mod provider;
mod types;

pub use anthropic::AnthropicProvider;
pub use cache::{CacheContext, CachingProvider, MemoryPromptCache, PromptCache};
pub use error::ProviderError;
pub use mock::{MockProvider, ScriptedMockProvider};
pub use provider::{collect_response, ChunkStream, LlmProvider};
pub use registry::{ProviderRegistry, SessionDefaults};
pub use types::*;

use std::sync::Arc;

use anyhow::bail;
use codepunk_config::{AuthStore, ModelConfig};

/// Construct a boxed [`LlmProvider`] from configuration.
///
/// The API key is resolved in precedence order: explicit `api_key` in the
/// config, the auth store, a configured `api_key_env` variable, then the
/// provider's canonical environment variable.
pub fn from_config(
    cfg: &ModelConfig,
    auth: Option<&dyn AuthStore>,
) -> anyhow::Result<Arc<dyn LlmProvider>> {
    match cfg.provider.as_str() {
        "anthropic" => {
            let key = resolve_api_key(cfg, auth, "ANTHROPIC_API_KEY").unwrap_or_default();
            Ok(Arc::new(AnthropicProvider::new(key, cfg.base_url.clone())))
        }
        "mock" => Ok(Arc::new(MockProvider)),
        other => bail!(
            "unknown model provider: {other:?} (supported: anthropic, mock)"
        ),
    }
}

fn resolve_api_key(
    cfg: &ModelConfig,
    auth: Option<&dyn AuthStore>,
    default_env: &str,
) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(store) = auth {
        match store.get(&cfg.provider) {
            Ok(Some(k)) => return Some(k),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "auth store lookup failed"),
        }
    }
    if let Some(env) = &cfg.api_key_env {
        if let Ok(k) = std::env::var(env) {
            return Some(k);
        }
    }
    std::env::var(default_env).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(provider: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            api_key: Some("sk-test".into()),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn from_config_anthropic_succeeds() {
        assert!(from_config(&cfg("anthropic"), None).is_ok());
    }

    #[test]
    fn from_config_mock_succeeds() {
        assert!(from_config(&cfg("mock"), None).is_ok());
    }

    #[test]
    fn from_config_unknown_provider_is_an_error() {
        match from_config(&cfg("totally-unknown"), None) {
            Err(err) => assert!(err.to_string().contains("unknown model provider")),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn resolve_api_key_prefers_explicit_key() {
        let c = ModelConfig {
            api_key: Some("explicit".into()),
            api_key_env: Some("NONEXISTENT_ENV_VAR_XYZ".into()),
            ..ModelConfig::default()
        };
        assert_eq!(
            resolve_api_key(&c, None, "ALSO_NONEXISTENT").as_deref(),
            Some("explicit")
        );
    }

    #[test]
    fn resolve_api_key_consults_auth_store() {
        struct FixedStore;
        impl AuthStore for FixedStore {
            fn get(&self, _p: &str) -> anyhow::Result<Option<String>> {
                Ok(Some("from-store".into()))
            }
            fn set(&self, _p: &str, _k: &str) -> anyhow::Result<()> {
                Ok(())
            }
            fn remove(&self, _p: &str) -> anyhow::Result<()> {
                Ok(())
            }
            fn list(&self) -> anyhow::Result<Vec<String>> {
                Ok(vec![])
            }
        }
        let c = ModelConfig {
            api_key: None,
            ..ModelConfig::default()
        };
        assert_eq!(
            resolve_api_key(&c, Some(&FixedStore), "NONEXISTENT_XYZ").as_deref(),
            Some("from-store")
        );
    }
}
