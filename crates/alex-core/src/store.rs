// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Session persistence with durable append semantics.
//!
//! One JSONL file per session: the first line is the session header, every
//! following line one message.  Files are opened and closed per operation;
//! no handle outlives a call.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::session::Session;

/// Store contract consumed by the agent facade: create, reload, and append.
pub trait SessionStore: Send + Sync {
    fn start(&self, id: &str, working_dir: PathBuf) -> anyhow::Result<Session>;
    fn restore(&self, id: &str) -> anyhow::Result<Session>;
    fn append(&self, session: &Session, message: &Message) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionHeader {
    id: String,
    working_dir: PathBuf,
    created_at: DateTime<Utc>,
}

/// JSONL-file-backed store.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, id: &str) -> PathBuf {
        // Session ids are uuids in practice; guard against separators anyway.
        let safe: String = id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }
}

impl SessionStore for FileSessionStore {
    fn start(&self, id: &str, working_dir: PathBuf) -> anyhow::Result<Session> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating session dir {}", self.dir.display()))?;
        let session = Session::with_working_dir(id, working_dir);
        let header = SessionHeader {
            id: session.id.clone(),
            working_dir: session.working_dir.clone(),
            created_at: session.created_at,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.path(id))
            .with_context(|| format!("creating session file for {id}"))?;
        serde_json::to_writer(&mut file, &header)?;
        file.write_all(b"\n")?;
        Ok(session)
    }

    fn restore(&self, id: &str) -> anyhow::Result<Session> {
        let path = self.path(id);
        let file = std::fs::File::open(&path)
            .with_context(|| format!("opening session file {}", path.display()))?;
        let mut lines = BufReader::new(file).lines();
        let header_line = lines
            .next()
            .context("session file is empty")??;
        let header: SessionHeader =
            serde_json::from_str(&header_line).context("parsing session header")?;

        let mut session = Session::with_working_dir(header.id, header.working_dir);
        session.created_at = header.created_at;
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let message: Message =
                serde_json::from_str(&line).context("parsing persisted message")?;
            session.add_message(message);
        }
        Ok(session)
    }

    fn append(&self, session: &Session, message: &Message) -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.path(&session.id))
            .with_context(|| format!("opening session file for {}", session.id))?;
        serde_json::to_writer(&mut file, message)?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, (PathBuf, Vec<Message>)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn start(&self, id: &str, working_dir: PathBuf) -> anyhow::Result<Session> {
        self.sessions
            .lock()
            .unwrap()
            .insert(id.to_string(), (working_dir.clone(), Vec::new()));
        Ok(Session::with_working_dir(id, working_dir))
    }

    fn restore(&self, id: &str) -> anyhow::Result<Session> {
        let sessions = self.sessions.lock().unwrap();
        let (dir, messages) = sessions
            .get(id)
            .with_context(|| format!("no persisted session {id}"))?;
        let mut session = Session::with_working_dir(id, dir.clone());
        for m in messages {
            session.add_message(m.clone());
        }
        Ok(session)
    }

    fn append(&self, session: &Session, message: &Message) -> anyhow::Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions
            .get_mut(&session.id)
            .with_context(|| format!("no persisted session {}", session.id))?;
        entry.1.push(message.clone());
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trips_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());

        let session = store.start("abc-123", PathBuf::from("/work")).unwrap();
        store.append(&session, &Message::user("hello")).unwrap();
        store
            .append(&session, &Message::assistant("hi there"))
            .unwrap();

        let restored = store.restore("abc-123").unwrap();
        assert_eq!(restored.id, "abc-123");
        assert_eq!(restored.working_dir, PathBuf::from("/work"));
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.messages[0].content, "hello");
        assert_eq!(restored.messages[1].content, "hi there");
    }

    #[test]
    fn file_store_preserves_tool_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let session = store.start("s", PathBuf::from("/w")).unwrap();
        store
            .append(&session, &Message::tool_response("c1", "shell", "ok"))
            .unwrap();
        let restored = store.restore("s").unwrap();
        assert_eq!(restored.messages[0].tool_call_id(), Some("c1"));
        assert_eq!(restored.messages[0].tool_name(), Some("shell"));
    }

    #[test]
    fn restore_of_unknown_session_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        assert!(store.restore("missing").is_err());
    }

    #[test]
    fn start_twice_truncates_prior_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let session = store.start("s", PathBuf::from("/w")).unwrap();
        store.append(&session, &Message::user("old")).unwrap();
        let _ = store.start("s", PathBuf::from("/w")).unwrap();
        let restored = store.restore("s").unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn hostile_session_id_stays_inside_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let session = store.start("../escape", PathBuf::from("/w")).unwrap();
        store.append(&session, &Message::user("x")).unwrap();
        // The file must live under the store dir, not beside it.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemorySessionStore::new();
        let session = store.start("m1", PathBuf::from("/w")).unwrap();
        store.append(&session, &Message::user("hi")).unwrap();
        let restored = store.restore("m1").unwrap();
        assert_eq!(restored.len(), 1);
    }
}
