//! Live user presence.
//!
//! Tracks which remote actors are currently known and what they last
//! reported looking at. Records are created on first join, merged on every
//! subsequent track, and marked offline on leave, never deleted, so "last
//! seen" stays queryable. A sync snapshot from the backend replaces the
//! whole map atomically.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::backend::PresenceEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// One remote actor's last known state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    /// RFC 3339; refreshed on every transition.
    pub last_seen: String,
    pub status: PresenceStatus,
}

impl PresenceRecord {
    fn online(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            project_id: None,
            task_id: None,
            last_seen: Utc::now().to_rfc3339(),
            status: PresenceStatus::Online,
        }
    }

    /// Apply a partial update. Unspecified fields keep their previous
    /// value; explicit clears empty the field; `last_seen` always
    /// refreshes.
    pub fn merge(&mut self, update: PresenceUpdate) {
        if let Some(name) = update.display_name {
            self.display_name = name;
        }
        update.project_id.apply(&mut self.project_id);
        update.task_id.apply(&mut self.task_id);
        if let Some(status) = update.status {
            self.status = status;
        }
        self.last_seen = Utc::now().to_rfc3339();
    }
}

/// Three-way field update: leave untouched, overwrite, or clear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FieldUpdate<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> FieldUpdate<T> {
    fn apply(self, slot: &mut Option<T>) {
        match self {
            Self::Keep => {}
            Self::Set(value) => *slot = Some(value),
            Self::Clear => *slot = None,
        }
    }

    /// `Some(v)` sets, `None` clears, for payload fields whose presence
    /// already signals intent.
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) => Self::Set(value),
            None => Self::Clear,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PresenceUpdate {
    pub display_name: Option<String>,
    pub project_id: FieldUpdate<String>,
    pub task_id: FieldUpdate<String>,
    pub status: Option<PresenceStatus>,
}

impl PresenceUpdate {
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: FieldUpdate::Set(project_id.into()),
            ..Self::default()
        }
    }

    pub fn task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: FieldUpdate::Set(task_id.into()),
            ..Self::default()
        }
    }
}

/// Owns all presence records, keyed by actor id, one record per actor
/// (last write wins).
pub struct PresenceTracker {
    local_user_id: String,
    local_display_name: String,
    records: Mutex<HashMap<String, PresenceRecord>>,
}

impl PresenceTracker {
    pub fn new(local_user_id: impl Into<String>, local_display_name: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            local_display_name: local_display_name.into(),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Merge a partial update into the local actor's record, creating it
    /// online if absent, and return the merged record for re-broadcast.
    pub fn merge_local(&self, update: PresenceUpdate) -> PresenceRecord {
        let mut records = self.lock();
        let record = records
            .entry(self.local_user_id.clone())
            .or_insert_with(|| {
                PresenceRecord::online(&self.local_user_id, &self.local_display_name)
            });
        record.merge(update);
        record.clone()
    }

    pub fn apply(&self, event: PresenceEvent) {
        match event {
            PresenceEvent::Sync(state) => self.apply_sync(state),
            PresenceEvent::Join { key, joins } => self.apply_join(&key, &joins),
            PresenceEvent::Leave { key, .. } => self.apply_leave(&key),
        }
    }

    /// First join creates the record online; repeat joins merge the
    /// reported fields into it.
    pub fn apply_join(&self, key: &str, payloads: &[serde_json::Value]) {
        let Some(payload) = payloads.first() else {
            return;
        };
        let mut records = self.lock();
        let record = records
            .entry(key.to_string())
            .or_insert_with(|| PresenceRecord::online(key, display_name_of(payload, key)));
        record.merge(update_from_payload(payload));
        record.status = PresenceStatus::Online;
    }

    /// Leave keeps the record but marks it offline and refreshes
    /// `last_seen`; only a fresh join transitions it back.
    pub fn apply_leave(&self, key: &str) {
        let mut records = self.lock();
        if let Some(record) = records.get_mut(key) {
            record.status = PresenceStatus::Offline;
            record.last_seen = Utc::now().to_rfc3339();
        } else {
            tracing::debug!("leave for unknown presence key {key}");
        }
    }

    /// Full-state snapshot: replaces the entire map in one step, taking
    /// the first stacked presence per actor.
    pub fn apply_sync(&self, state: HashMap<String, Vec<serde_json::Value>>) {
        let mut next = HashMap::with_capacity(state.len());
        for (key, payloads) in state {
            let Some(payload) = payloads.first() else {
                continue;
            };
            let mut record = PresenceRecord::online(&key, display_name_of(payload, &key));
            record.merge(update_from_payload(payload));
            record.status = PresenceStatus::Online;
            next.insert(key, record);
        }
        *self.lock() = next;
    }

    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn users_in_project(&self, project_id: &str) -> Vec<PresenceRecord> {
        self.lock()
            .values()
            .filter(|r| {
                r.status == PresenceStatus::Online && r.project_id.as_deref() == Some(project_id)
            })
            .cloned()
            .collect()
    }

    pub fn users_on_task(&self, task_id: &str) -> Vec<PresenceRecord> {
        self.lock()
            .values()
            .filter(|r| r.status == PresenceStatus::Online && r.task_id.as_deref() == Some(task_id))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PresenceRecord>> {
        self.records.lock().expect("presence map poisoned")
    }
}

fn display_name_of(payload: &serde_json::Value, fallback: &str) -> String {
    payload
        .get("display_name")
        .and_then(|v| v.as_str())
        .unwrap_or(fallback)
        .to_string()
}

/// Translate a tracked presence payload into a merge: a present key
/// overwrites (null clears), an absent key is left untouched.
fn update_from_payload(payload: &serde_json::Value) -> PresenceUpdate {
    let field = |key: &str| match payload.get(key) {
        None => FieldUpdate::Keep,
        Some(serde_json::Value::Null) => FieldUpdate::Clear,
        Some(value) => match crate::backend::scalar_field(payload, key) {
            Some(s) => FieldUpdate::Set(s),
            None => {
                tracing::debug!("ignoring non-scalar presence field {key}: {value}");
                FieldUpdate::Keep
            }
        },
    };

    PresenceUpdate {
        display_name: payload
            .get("display_name")
            .and_then(|v| v.as_str())
            .map(String::from),
        project_id: field("project_id"),
        task_id: field("task_id"),
        status: None,
    }
}
