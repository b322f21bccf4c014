// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::trace;

/// Lifecycle events emitted by the orchestrator for observers (TUI, logs).
///
/// The stream is advisory: emission is non-blocking and dropped events have
/// no effect on loop correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatEventKind {
    MessageStart,
    ToolIterationStart,
    StreamDelta,
    ToolIterationEnd,
    ToolLoopAborted,
    ToolLoopExceeded,
    MessageComplete,
    SessionCleared,
}

#[derive(Debug, Clone)]
pub struct ChatEvent {
    pub kind: ChatEventKind,
    pub session_id: Option<String>,
    pub iteration: Option<u32>,
    pub content_delta: Option<String>,
    pub is_final: bool,
}

/// Bounded multi-producer single-consumer event channel.
///
/// `try_send` only — a slow or absent consumer drops events instead of
/// stalling the tool loop.
#[derive(Default)]
pub struct EventBus {
    tx: Mutex<Option<mpsc::Sender<ChatEvent>>>,
}

impl EventBus {
    /// Attach a consumer. Replaces any previous subscription.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.tx.lock().unwrap() = Some(tx);
        rx
    }

    pub fn emit(&self, event: ChatEvent) {
        let guard = self.tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            if let Err(e) = tx.try_send(event) {
                trace!(error = %e, "dropping chat event (consumer slow or gone)");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
