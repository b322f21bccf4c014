// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cleanup;
mod exec;
mod session;
mod state;

pub use cleanup::{startup_cleanup, CleanupSummary};
pub use exec::{GitCli, GitError, GitOutput};
pub use session::{GitSessionOptions, GitShadowSession};
pub use state::{should_auto_revert, GitSessionState, SessionStateStore, ToolCallCommit};
