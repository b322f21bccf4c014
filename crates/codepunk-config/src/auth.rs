// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;

/// Provider → API-key mapping.
///
/// The store is deliberately opaque to callers: the on-disk layout is a
/// private concern of the implementation so it can move to a keyring later
/// without touching consumers.
pub trait AuthStore: Send + Sync {
    fn get(&self, provider: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, provider: &str, api_key: &str) -> anyhow::Result<()>;
    fn remove(&self, provider: &str) -> anyhow::Result<()>;
    /// Provider names that currently have a stored key.
    fn list(&self) -> anyhow::Result<Vec<String>>;
}

/// JSON-file backed [`AuthStore`] at `<state-dir>/auth.json`.
///
/// The document is a flat `{ "<provider>": "<key>" }` object. Writes go
/// through a sibling temp file + rename so a crash never leaves a
/// half-written credentials file.
pub struct FileAuthStore {
    path: PathBuf,
}

impl FileAuthStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: state_dir.into().join("auth.json"),
        }
    }

    fn read_map(&self) -> anyhow::Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading auth store {}", self.path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing auth store {}", self.path.display()))
    }

    fn write_map(&self, map: &BTreeMap<String, String>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))
    }
}

impl AuthStore for FileAuthStore {
    fn get(&self, provider: &str) -> anyhow::Result<Option<String>> {
        Ok(self.read_map()?.get(provider).cloned())
    }

    fn set(&self, provider: &str, api_key: &str) -> anyhow::Result<()> {
        let mut map = self.read_map()?;
        map.insert(provider.to_string(), api_key.to_string());
        self.write_map(&map)
    }

    fn remove(&self, provider: &str) -> anyhow::Result<()> {
        let mut map = self.read_map()?;
        if map.remove(provider).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }

    fn list(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.read_map()?.keys().cloned().collect())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FileAuthStore) {
        let dir = tempfile::tempdir().unwrap();
        let s = FileAuthStore::new(dir.path());
        (dir, s)
    }

    #[test]
    fn get_on_empty_store_is_none() {
        let (_d, s) = store();
        assert!(s.get("anthropic").unwrap().is_none());
    }

    #[test]
    fn set_then_get_round_trips() {
        let (_d, s) = store();
        s.set("anthropic", "sk-test-123").unwrap();
        assert_eq!(s.get("anthropic").unwrap().as_deref(), Some("sk-test-123"));
    }

    #[test]
    fn set_overwrites_existing_key() {
        let (_d, s) = store();
        s.set("anthropic", "old").unwrap();
        s.set("anthropic", "new").unwrap();
        assert_eq!(s.get("anthropic").unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn remove_deletes_the_entry() {
        let (_d, s) = store();
        s.set("anthropic", "k").unwrap();
        s.remove("anthropic").unwrap();
        assert!(s.get("anthropic").unwrap().is_none());
    }

    #[test]
    fn remove_missing_provider_is_a_noop() {
        let (_d, s) = store();
        assert!(s.remove("nope").is_ok());
    }

    #[test]
    fn list_returns_sorted_provider_names() {
        let (_d, s) = store();
        s.set("openai", "a").unwrap();
        s.set("anthropic", "b").unwrap();
        assert_eq!(s.list().unwrap(), vec!["anthropic", "openai"]);
    }
}
