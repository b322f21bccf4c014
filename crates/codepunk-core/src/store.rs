// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use codepunk_model::Message;

use crate::session::Session;

/// Session persistence. Updates are last-writer-wins on a single session;
/// the orchestrator is the only writer during a call.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: &Session) -> anyhow::Result<()>;
    async fn get(&self, id: &str) -> anyhow::Result<Option<Session>>;
    async fn update(&self, session: &Session) -> anyhow::Result<()>;
    async fn delete(&self, id: &str) -> anyhow::Result<()>;
    /// Most recently active sessions, newest first.
    async fn get_recent(&self, n: usize) -> anyhow::Result<Vec<Session>>;
}

/// Message persistence. Creation order is the conversation order.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn list_by_session(&self, session_id: &str) -> anyhow::Result<Vec<Message>>;
    async fn create(&self, message: &Message) -> anyhow::Result<()>;
    async fn delete_by_session(&self, session_id: &str) -> anyhow::Result<()>;
}

/// Process-local [`SessionRepository`] for tests and headless runs.
#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: Mutex<HashMap<String, Session>>,
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn create(&self, session: &Session) -> anyhow::Result<()> {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Session>> {
        Ok(self.sessions.lock().unwrap().get(id).cloned())
    }

    async fn update(&self, session: &Session) -> anyhow::Result<()> {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.sessions.lock().unwrap().remove(id);
        Ok(())
    }

    async fn get_recent(&self, n: usize) -> anyhow::Result<Vec<Session>> {
        let mut all: Vec<Session> = self.sessions.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        all.truncate(n);
        Ok(all)
    }
}

/// Process-local [`MessageRepository`] preserving insertion order.
///
/// Rejects messages that violate the role/part pairing invariant so a bug
/// in message assembly is caught at the persistence boundary.
#[derive(Default)]
pub struct InMemoryMessageRepository {
    messages: Mutex<Vec<Message>>,
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn list_by_session(&self, session_id: &str) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn create(&self, message: &Message) -> anyhow::Result<()> {
        message.validate().map_err(|e| anyhow::anyhow!(e))?;
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn delete_by_session(&self, session_id: &str) -> anyhow::Result<()> {
        self.messages
            .lock()
            .unwrap()
            .retain(|m| m.session_id != session_id);
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
