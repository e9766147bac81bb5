use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use crate::chat::HistoryRecord;

pub const MAX_HISTORY_RECORDS: usize = 50;
pub const MAX_SESSIONS: usize = 1000;

#[derive(Debug, Default)]
struct Session {
    records: Vec<HistoryRecord>,
    last_used: u64,
}

#[derive(Debug, Default)]
struct Sessions {
    by_id: HashMap<String, Session>,
    clock: u64,
}

/// Per-session conversation history, bounded in records per session and in sessions
#[derive(Debug)]
pub struct SessionStore {
    inner: RwLock<Sessions>,
    max_records: usize,
    max_sessions: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::with_limits(MAX_HISTORY_RECORDS, MAX_SESSIONS)
    }
}

impl SessionStore {
    pub fn new(max_records: usize) -> Self {
        Self::with_limits(max_records, MAX_SESSIONS)
    }

    pub fn with_limits(max_records: usize, max_sessions: usize) -> Self {
        Self {
            inner: RwLock::new(Sessions::default()),
            max_records: max_records.max(1),
            max_sessions: max_sessions.max(1),
        }
    }

    pub fn history(&self, session_id: &str) -> Vec<HistoryRecord> {
        self.inner
            .read()
            .by_id
            .get(session_id)
            .map(|s| s.records.clone())
            .unwrap_or_default()
    }

    /// Appends a record, dropping the oldest ones past the cap. A new session
    /// past the session limit evicts the least recently appended one.
    pub fn append(&self, session_id: &str, record: HistoryRecord) {
        let mut inner = self.inner.write();
        inner.clock += 1;
        let now = inner.clock;

        if !inner.by_id.contains_key(session_id) && inner.by_id.len() >= self.max_sessions {
            let oldest = inner
                .by_id
                .iter()
                .min_by_key(|(_, s)| s.last_used)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                debug!(session = %oldest, "Evicting least recently used session");
                inner.by_id.remove(&oldest);
            }
        }

        let session = inner.by_id.entry(session_id.to_string()).or_default();
        session.last_used = now;
        session.records.push(record);
        if session.records.len() > self.max_records {
            let excess = session.records.len() - self.max_records;
            session.records.drain(..excess);
        }
    }

    pub fn clear(&self, session_id: &str) -> bool {
        self.inner.write().by_id.remove(session_id).is_some()
    }

    pub fn session_count(&self) -> usize {
        self.inner.read().by_id.len()
    }
}
