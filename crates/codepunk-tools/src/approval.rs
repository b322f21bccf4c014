// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use crate::diff::DiffStats;

/// A pending file edit presented for approval.
#[derive(Debug, Clone)]
pub struct FileEditRequest {
    pub file_path: String,
    pub original_content: String,
    pub proposed_content: String,
}

/// Outcome of an approval prompt.
///
/// `ApproveSession` approves this edit and every later one in the same
/// process (the edit service latches the flag). `Deny` covers both an
/// explicit rejection and a dismissed prompt; the edit service reports it
/// as a user cancellation either way.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    Approve {
        /// User-amended replacement for the proposed content, if any.
        modified_content: Option<String>,
    },
    ApproveSession {
        modified_content: Option<String>,
    },
    Deny,
}

/// Pluggable approval prompt. The interactive implementation lives in the
/// UI layer; the core only depends on this contract.
#[async_trait]
pub trait ApprovalService: Send + Sync {
    async fn request_approval(
        &self,
        request: &FileEditRequest,
        diff: &str,
        stats: &DiffStats,
    ) -> ApprovalDecision;
}

/// Approves everything. Used for headless runs and tests.
pub struct AutoApprovalService;

#[async_trait]
impl ApprovalService for AutoApprovalService {
    async fn request_approval(
        &self,
        _request: &FileEditRequest,
        _diff: &str,
        _stats: &DiffStats,
    ) -> ApprovalDecision {
        ApprovalDecision::Approve {
            modified_content: None,
        }
    }
}

/// Returns a fixed sequence of decisions, then denies. Test helper.
pub struct ScriptedApprovalService {
    decisions: std::sync::Mutex<Vec<ApprovalDecision>>,
    /// Number of prompts shown, so tests can assert short-circuiting.
    pub prompts: std::sync::Mutex<u32>,
}

impl ScriptedApprovalService {
    pub fn new(decisions: Vec<ApprovalDecision>) -> Self {
        Self {
            decisions: std::sync::Mutex::new(decisions),
            prompts: std::sync::Mutex::new(0),
        }
    }
}

#[async_trait]
impl ApprovalService for ScriptedApprovalService {
    async fn request_approval(
        &self,
        _request: &FileEditRequest,
        _diff: &str,
        _stats: &DiffStats,
    ) -> ApprovalDecision {
        *self.prompts.lock().unwrap() += 1;
        let mut decisions = self.decisions.lock().unwrap();
        if decisions.is_empty() {
            ApprovalDecision::Deny
        } else {
            decisions.remove(0)
        }
    }
}
