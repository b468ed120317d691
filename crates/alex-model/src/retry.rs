// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Retry policy for model calls.
//!
//! Errors are split into two classes: *permanent* network failures that a
//! retry cannot fix (client-side HTTP errors, refused/reset connections,
//! DNS/TLS trouble) and everything else, which is retried with exponential
//! backoff.  The sleep function is injectable so tests run at full speed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::sync::oneshot;
use tracing::warn;

use crate::{
    assembler::{assemble_stream, Cancelled},
    CompletionRequest, CompletionResponse, LlmClient, StreamDelta,
};

/// Substring patterns (lowercase) that mark an error as permanent.
const PERMANENT_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timeout",
    "network unreachable",
    "network is unreachable",
    "no route to host",
    "host is down",
    "dns",
    "tls",
    "ssl",
    "certificate",
];

/// Classify an error message as a permanent network failure.
///
/// Matches case-insensitively on the pattern list above, plus any HTTP
/// status in 400–499 or exactly 500 mentioned after an `http` token
/// (e.g. "HTTP error 400: Bad Request", "openai http error 500: …").
pub fn is_permanent_network_error(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return true;
    }
    if let Some(status) = http_status_in(&lower) {
        return (400..=499).contains(&status) || status == 500;
    }
    false
}

/// Extract the first integer that follows an "http" token, if any.
fn http_status_in(lower: &str) -> Option<u32> {
    let pos = lower.find("http")?;
    let rest = &lower[pos..];
    let digits: String = rest
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Injectable async sleep.  Production uses [`default_sleep`]; tests inject
/// a recorder or a no-op.
pub type SleepFn = Arc<dyn Fn(Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub fn default_sleep() -> SleepFn {
    Arc::new(|d| Box::pin(tokio::time::sleep(d)))
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt *after* `attempt` (1-based): doubles each
    /// time, capped at `max_delay`.  Non-decreasing by construction.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Validate a request before the first attempt: no point retrying a request
/// that can never succeed.
fn validate(req: &CompletionRequest) -> anyhow::Result<()> {
    if req.messages.is_empty() {
        bail!("invalid request: messages must not be empty");
    }
    if req.model.is_empty() {
        bail!("invalid request: model is not configured");
    }
    Ok(())
}

/// Stream a completion with retries, returning the assembled response.
///
/// - Permanent network errors report after exactly one attempt, prefixed
///   "permanent network error".
/// - Cancellation surfaces unchanged and is never retried.
/// - Everything else retries up to `policy.max_attempts`, sleeping
///   `policy.backoff(n)` between attempts; the final failure reports
///   "LLM call failed after N attempts".
pub async fn chat_stream_with_retry(
    client: &dyn LlmClient,
    req: &CompletionRequest,
    policy: &RetryPolicy,
    sleep: &SleepFn,
    mut on_delta: Option<&mut (dyn FnMut(&StreamDelta) + Send)>,
    mut cancel: Option<&mut oneshot::Receiver<()>>,
) -> anyhow::Result<CompletionResponse> {
    validate(req)?;

    let attempts = policy.max_attempts.max(1);
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 1..=attempts {
        let result = match client.chat_stream(req.clone()).await {
            Ok(stream) => match (&mut on_delta, &mut cancel) {
                (Some(cb), Some(c)) => assemble_stream(stream, Some(&mut **cb), Some(&mut **c)).await,
                (Some(cb), None) => assemble_stream(stream, Some(&mut **cb), None).await,
                (None, Some(c)) => assemble_stream(stream, None, Some(&mut **c)).await,
                (None, None) => assemble_stream(stream, None, None).await,
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(resp) => return Ok(resp),
            Err(e) if e.downcast_ref::<Cancelled>().is_some() => return Err(e),
            Err(e) if is_permanent_network_error(&e.to_string()) => {
                return Err(anyhow::anyhow!("permanent network error: {e}"));
            }
            Err(e) => {
                warn!(attempt, error = %e, "model call failed");
                if attempt < attempts {
                    sleep(policy.backoff(attempt)).await;
                }
                last_err = Some(e);
            }
        }
    }

    let e = last_err.expect("at least one attempt ran");
    Err(anyhow::anyhow!("LLM call failed after {attempts} attempts: {e}"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
