// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Failures surfaced by a provider call.
///
/// Transient conditions (429/503, network blips) are retried inside the
/// driver and only appear here after the retry budget is exhausted.
/// Malformed stream payloads are logged and skipped per-chunk; `Protocol`
/// is reserved for failures that make the whole call unusable.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request unauthorized (401); check the API key")]
    Unauthorized,

    #[error("provider server error {status} after {attempts} attempts")]
    Server { status: u16, attempts: u32 },

    #[error("provider rate limited; gave up after {attempts} attempts")]
    RateLimited { attempts: u32 },

    /// Non-retryable 4xx. The body is truncated to 300 chars.
    #[error("provider rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("provider call failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("provider protocol error: {0}")]
    Protocol(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Truncate an error body for inclusion in a [`ProviderError::Rejected`].
pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 300;
    if body.chars().count() <= MAX {
        return body.to_string();
    }
    let mut out: String = body.chars().take(MAX).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_body_is_untouched() {
        assert_eq!(truncate_body("bad request"), "bad request");
    }

    #[test]
    fn long_body_is_truncated_with_ellipsis() {
        let body = "x".repeat(400);
        let out = truncate_body(&body);
        assert_eq!(out.chars().count(), 301);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let body = "é".repeat(400);
        let out = truncate_body(&body);
        assert!(out.ends_with('…'));
        assert_eq!(out.chars().count(), 301);
    }

    #[test]
    fn error_messages_are_actionable() {
        let e = ProviderError::Unauthorized;
        assert!(e.to_string().contains("API key"));
        let e = ProviderError::RateLimited { attempts: 4 };
        assert!(e.to_string().contains("4 attempts"));
    }
}
