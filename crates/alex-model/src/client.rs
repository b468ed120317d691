// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{CompletionRequest, CompletionResponse, StreamDelta};

pub type DeltaStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamDelta>> + Send>>;

/// The model client consumed by the agent loop.
///
/// Implementations must be cheap to share (`Arc<dyn LlmClient>`); one client
/// serves every iteration of a task.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Human-readable client name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users and forwarded on requests.
    fn model_name(&self) -> &str;

    /// The API base URL.  Drives provider-family detection; return an empty
    /// string when there is no meaningful URL (mocks, local shims).
    fn base_url(&self) -> &str;

    /// Blocking completion: one request, one complete response.
    async fn chat(&self, req: CompletionRequest) -> anyhow::Result<CompletionResponse>;

    /// Streaming completion: one request, a finite stream of deltas.
    async fn chat_stream(&self, req: CompletionRequest) -> anyhow::Result<DeltaStream>;

    /// Release any held resources.  Default: nothing to release.
    async fn close(&self) {}
}

/// Whether this base URL belongs to the Gemini family, which rejects
/// role=tool messages.  Tool results for such providers are sent as
/// role=user messages prefixed with "`<toolName> executed result: `".
///
/// Detection is a substring check rather than an enum so the set of
/// providers stays open.
pub fn is_gemini_family(base_url: &str) -> bool {
    base_url.contains("googleapis")
}
