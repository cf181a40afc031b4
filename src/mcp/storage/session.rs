//! DashMap-based session record storage.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::mcp::session::SessionRecord;
use crate::mcp::types::{OsFingerprint, SessionStatus, SessionSummary};

/// Concurrent map of session id to [`SessionRecord`].
///
/// Created by the session manager and shared (`Arc`) with each session's tasks.
/// Detected OS fingerprints are also cached per `user@host`, outliving the records,
/// so later sessions to the same account start with what is already known.
pub struct SessionStore {
    records: DashMap<String, SessionRecord>,
    host_os: DashMap<String, OsFingerprint>,
}

fn host_key(username: &str, host: &str) -> String {
    format!("{}@{}", username, host)
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            host_os: DashMap::new(),
        }
    }

    pub fn cached_os(&self, username: &str, host: &str) -> Option<OsFingerprint> {
        self.host_os
            .get(&host_key(username, host))
            .map(|entry| entry.value().clone())
    }

    pub fn remember_os(&self, username: &str, host: &str, os: &OsFingerprint) {
        if !os.is_known() {
            return;
        }
        self.host_os
            .entry(host_key(username, host))
            .and_modify(|known| {
                known.merge(os);
            })
            .or_insert_with(|| os.clone());
    }

    /// Merge an OS observation into the session's record and the host cache.
    /// Returns `false` if the session does not exist or nothing changed.
    pub fn record_os(&self, session_id: &str, observed: &OsFingerprint) -> bool {
        let merged = self.update(session_id, |r| {
            r.record_os(observed)
                .then(|| (r.username.clone(), r.host.clone(), r.os_fingerprint().clone()))
        });
        match merged.flatten() {
            Some((username, host, os)) => {
                self.remember_os(&username, &host, &os);
                true
            }
            None => false,
        }
    }

    pub fn insert(&self, record: SessionRecord) {
        self.records.insert(record.session_id.clone(), record);
    }

    /// Insert unless the id is taken; the rejected record is handed back.
    pub fn try_insert(&self, record: SessionRecord) -> Result<(), SessionRecord> {
        match self.records.entry(record.session_id.clone()) {
            Entry::Occupied(_) => Err(record),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    /// Mutate a record in place. Returns `None` if the session does not exist.
    pub fn update<R>(&self, session_id: &str, f: impl FnOnce(&mut SessionRecord) -> R) -> Option<R> {
        self.records
            .get_mut(session_id)
            .map(|mut entry| f(entry.value_mut()))
    }

    /// Read from a record. Returns `None` if the session does not exist.
    pub fn read<R>(&self, session_id: &str, f: impl FnOnce(&SessionRecord) -> R) -> Option<R> {
        self.records.get(session_id).map(|entry| f(entry.value()))
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionRecord> {
        self.records.remove(session_id).map(|(_, record)| record)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.records.contains_key(session_id)
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        self.records
            .iter()
            .map(|entry| entry.value().summary())
            .collect()
    }

    /// `(id, status, last_activity)` for every record, used by the reaper.
    pub fn activity_snapshot(&self) -> Vec<(String, SessionStatus, DateTime<Utc>)> {
        self.records
            .iter()
            .map(|entry| {
                let record = entry.value();
                (record.session_id.clone(), record.status(), record.last_activity)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
