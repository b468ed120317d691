// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::sync::{oneshot, RwLock};
use tracing::warn;

use alex_config::Config;
use alex_model::{LlmClient, SleepFn};
use alex_tools::SharedToolRegistry;

use crate::context::{ContextManager, LlmSummarizer};
use crate::driver::{IterationDriver, TaskResult};
use crate::events::{ChunkCallback, ChunkType, StreamChunk};
use crate::message::Message;
use crate::session::Session;
use crate::store::SessionStore;

/// The public entry point: owns the single active session and runs the
/// iteration driver over it.
///
/// Session access goes through a read-write lock: history and tool-catalog
/// reads share it, while processing a message (which mutates the session)
/// holds it exclusively — one task owns the session at a time.
pub struct Agent {
    registry: SharedToolRegistry,
    store: Arc<dyn SessionStore>,
    driver: IterationDriver,
    session: RwLock<Option<Session>>,
}

impl Agent {
    pub fn new(
        client: Arc<dyn LlmClient>,
        registry: SharedToolRegistry,
        store: Arc<dyn SessionStore>,
        config: &Config,
    ) -> Self {
        let summarizer = Arc::new(LlmSummarizer::new(
            Arc::clone(&client),
            config.model.name.clone(),
        ));
        let context = Arc::new(ContextManager::new(&config.context).with_summarizer(summarizer));
        let driver = IterationDriver::new(
            client,
            Arc::clone(&registry),
            context,
            Some(Arc::clone(&store)),
            config.agent.clone(),
            config.model.clone(),
        );
        Self {
            registry,
            store,
            driver,
            session: RwLock::new(None),
        }
    }

    /// Replace the retry backoff sleep (tests inject a no-op).
    pub fn with_sleep(mut self, sleep: SleepFn) -> Self {
        self.driver = self.driver.with_sleep(sleep);
        self
    }

    /// Create (or replace) the active session, rooted at the process
    /// working directory.
    pub async fn start_session(&self, id: &str) -> anyhow::Result<Session> {
        let working_dir =
            std::env::current_dir().context("determining process working directory")?;
        let session = self.store.start(id, working_dir)?;
        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    /// Reload a persisted session and make it active.
    pub async fn restore_session(&self, id: &str) -> anyhow::Result<Session> {
        let session = self.store.restore(id)?;
        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    /// Non-streaming path: append the user message, run the loop, return
    /// the result.  The assistant/tool messages land in the session as the
    /// driver produces them.
    pub async fn process_message(&self, user_text: &str) -> anyhow::Result<TaskResult> {
        self.process_inner(user_text, None, None).await
    }

    /// Streaming path: same as [`process_message`], emitting chunks along
    /// the way and a terminal `complete` chunk with cumulative totals.
    pub async fn process_message_stream(
        &self,
        user_text: &str,
        on_chunk: ChunkCallback<'_>,
    ) -> anyhow::Result<()> {
        self.stream_inner(user_text, on_chunk, None).await
    }

    /// Streaming path with a cancel signal; cancellation aborts at the next
    /// suspension point.
    pub async fn process_message_stream_with_cancel(
        &self,
        user_text: &str,
        on_chunk: ChunkCallback<'_>,
        cancel: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        self.stream_inner(user_text, on_chunk, Some(cancel)).await
    }

    async fn stream_inner(
        &self,
        user_text: &str,
        on_chunk: ChunkCallback<'_>,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> anyhow::Result<()> {
        let result = self.process_inner(user_text, Some(on_chunk), cancel).await?;
        on_chunk(
            StreamChunk::new(ChunkType::Complete, result.final_answer.clone())
                .with_meta("success", result.success.to_string())
                .with_meta("steps", result.steps.len().to_string())
                .with_tokens(result.tokens),
        );
        Ok(())
    }

    async fn process_inner(
        &self,
        user_text: &str,
        on_chunk: Option<ChunkCallback<'_>>,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> anyhow::Result<TaskResult> {
        let mut guard = self.session.write().await;
        let session = guard.as_mut().ok_or_else(|| anyhow!("no active session"))?;

        let user = Message::user(user_text);
        if let Err(e) = self.store.append(session, &user) {
            warn!(session_id = %session.id, error = %e, "failed to persist user message");
        }
        session.add_message(user);

        self.driver.solve_task(session, user_text, on_chunk, cancel).await
    }

    /// Names of every registered tool (builtin and MCP-provided).
    pub async fn available_tools(&self) -> Vec<String> {
        self.registry.read().await.names()
    }

    /// Snapshot of the active session's message log.
    pub async fn session_history(&self) -> anyhow::Result<Vec<Message>> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(|| anyhow!("no active session"))?;
        Ok(session.messages.clone())
    }

    /// Id of the active session, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.session.read().await.as_ref().map(|s| s.id.clone())
    }
}
