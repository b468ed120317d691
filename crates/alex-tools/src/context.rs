// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancel flag: the driver sets it when the caller's cancel signal
/// fires, and every in-flight tool can poll it at its own granularity.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-invocation execution context injected into every tool call.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// The filesystem root the tool should treat as "here".  Taken from the
    /// session's working directory, falling back to the process CWD.
    pub working_dir: PathBuf,
    pub session_id: String,
    pub cancel: CancelFlag,
}

impl ExecutionContext {
    pub fn new(working_dir: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            session_id: session_id.into(),
            cancel: CancelFlag::new(),
        }
    }

    /// Context rooted at the session working dir, or the process CWD when
    /// the session has none.
    pub fn for_session(working_dir: Option<PathBuf>, session_id: impl Into<String>) -> Self {
        let dir = working_dir
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(dir, session_id)
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
