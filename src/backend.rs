//! Abstract interface to the realtime change-event source.
//!
//! The registry never talks to a concrete vendor SDK. Everything it needs
//! (named channels carrying row-change and presence events, a point-read
//! for cross-entity resolution, and auth state transitions) comes in
//! through the two traits here, so the backing service is swappable and
//! tests run against an in-process mock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("channel error: {0}")]
    Channel(String),
    #[error("lookup failed: {0}")]
    Lookup(String),
    #[error("presence track failed: {0}")]
    Track(String),
}

/// Lifecycle state of a channel as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Pending,
    Joined,
    Errored,
    Closed,
}

/// Row-mutation kind a listener can scope to. `Any` matches all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Any,
}

impl Default for ChangeKind {
    fn default() -> Self {
        Self::Any
    }
}

impl ChangeKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Any => "any",
        }
    }

    /// Whether a listener scoped to `self` should see an event of `kind`.
    pub fn matches(&self, kind: ChangeKind) -> bool {
        matches!(self, Self::Any) || *self == kind
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scope of one change listener: schema, table, event kind, and an optional
/// column-equality filter in `column=eq.value` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeFilter {
    pub schema: String,
    pub table: String,
    pub event: ChangeKind,
    pub filter: Option<String>,
}

/// One row mutation delivered by the backend. Transient: consumed
/// synchronously by dispatch, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub old: Option<serde_json::Value>,
    pub new: Option<serde_json::Value>,
}

impl ChangeEvent {
    /// The most relevant row image: new for inserts/updates, old for deletes.
    pub fn row(&self) -> Option<&serde_json::Value> {
        self.new.as_ref().or(self.old.as_ref())
    }

    /// Scalar column from the relevant row image, coerced to a string.
    pub fn field(&self, column: &str) -> Option<String> {
        self.row().and_then(|row| scalar_field(row, column))
    }

    pub fn old_field(&self, column: &str) -> Option<String> {
        self.old.as_ref().and_then(|row| scalar_field(row, column))
    }

    pub fn new_field(&self, column: &str) -> Option<String> {
        self.new.as_ref().and_then(|row| scalar_field(row, column))
    }
}

/// String or integer column value as a string; ids arrive as either
/// depending on the table's key type.
pub(crate) fn scalar_field(row: &serde_json::Value, column: &str) -> Option<String> {
    match row.get(column)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Ephemeral presence activity on a channel.
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    /// Full-state snapshot; actors may report multiple stacked presences.
    Sync(HashMap<String, Vec<serde_json::Value>>),
    Join {
        key: String,
        joins: Vec<serde_json::Value>,
    },
    Leave {
        key: String,
        leaves: Vec<serde_json::Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
}

pub type ChangeHandler = Arc<dyn Fn(ChangeEvent) + Send + Sync>;
pub type PresenceHandler = Arc<dyn Fn(PresenceEvent) + Send + Sync>;
pub type StatusHandler = Arc<dyn Fn(ChannelState) + Send + Sync>;
pub type AuthHandler = Arc<dyn Fn(AuthEvent) + Send + Sync>;

/// A named, bidirectional subscription handle multiplexing one or more
/// table/event filters plus ephemeral presence.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> ChannelState;

    /// Attach a row-change listener scoped to `filter`. May be called more
    /// than once to multiplex several tables onto one channel.
    fn on_change(&self, filter: ChangeFilter, handler: ChangeHandler);

    /// Attach a presence listener for join/leave/sync events.
    fn on_presence(&self, handler: PresenceHandler);

    /// Ask the backend to join the channel. `status` observes every state
    /// transition, including the initial `pending -> joined` or
    /// `pending -> errored`.
    fn subscribe(&self, status: StatusHandler);

    /// Broadcast the local actor's presence payload on this channel.
    async fn track(&self, payload: serde_json::Value) -> Result<(), BackendError>;

    /// The backend's current view of channel presence, keyed by actor.
    fn presence_state(&self) -> HashMap<String, Vec<serde_json::Value>>;
}

/// The change-event source capability the registry consumes.
#[async_trait]
pub trait RealtimeBackend: Send + Sync {
    fn open_channel(&self, name: &str) -> Arc<dyn RealtimeChannel>;

    fn remove_channel(&self, channel: Arc<dyn RealtimeChannel>);

    /// Point read of a single column, used for the phase→project and
    /// step→project invalidation resolution.
    async fn select_one(
        &self,
        table: &str,
        column: &str,
        match_column: &str,
        match_value: &str,
    ) -> Result<serde_json::Value, BackendError>;

    fn on_auth_state_change(&self, handler: AuthHandler);
}
