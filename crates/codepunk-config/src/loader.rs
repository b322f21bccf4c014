// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::Config;

/// Load configuration from `path`, or from the default location
/// (`~/.config/codepunk/config.yaml`) when `path` is `None`.
///
/// A missing file is not an error — defaults are returned so a fresh
/// install works without any setup. `CODEPUNK_*` environment overrides are
/// applied on top of whatever was loaded.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let resolved = match path {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path(),
    };

    let mut config = match resolved {
        Some(p) if p.exists() => {
            let text = std::fs::read_to_string(&p)
                .with_context(|| format!("reading config file {}", p.display()))?;
            serde_yaml::from_str(&text)
                .with_context(|| format!("parsing config file {}", p.display()))?
        }
        Some(p) => {
            tracing::debug!(path = %p.display(), "no config file; using defaults");
            Config::default()
        }
        None => Config::default(),
    };

    config.apply_env();
    Ok(config)
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("codepunk").join("config.yaml"))
}

/// Directory that holds CodePunk's persisted runtime state
/// (git-session documents, auth store).
///
/// `~/.local/share/codepunk` on Linux; the platform data dir elsewhere.
/// Falls back to `.codepunk` in the working directory when no data dir is
/// available (containers with no HOME).
pub fn state_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("codepunk"))
        .unwrap_or_else(|| PathBuf::from(".codepunk"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(Some(&dir.path().join("nope.yaml"))).unwrap();
        assert_eq!(cfg.chat.max_tool_call_iterations, 5);
    }

    #[test]
    fn explicit_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "model:\n  provider: mock\n  name: mock-model").unwrap();
        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.model.provider, "mock");
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "model: [unclosed").unwrap();
        assert!(load(Some(&path)).is_err());
    }

    #[test]
    fn state_dir_is_not_empty() {
        assert!(!state_dir().as_os_str().is_empty());
    }
}
