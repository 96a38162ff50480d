//! Shared test doubles for the realtime layer.
//!
//! `MockBackend`/`MockChannel` stand in for the change-event source:
//! tests drive them by injecting change events, presence events, and
//! channel status transitions, and inspect what the code under test
//! opened, removed, tracked, and looked up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::backend::{
    AuthEvent, AuthHandler, BackendError, ChangeEvent, ChangeFilter, ChangeHandler, ChannelState,
    PresenceEvent, PresenceHandler, RealtimeBackend, RealtimeChannel, StatusHandler,
};
use crate::invalidation::{InvalidationKey, QueryCache};

pub struct MockChannel {
    name: String,
    state: Mutex<ChannelState>,
    change_handlers: Mutex<Vec<(ChangeFilter, ChangeHandler)>>,
    presence_handlers: Mutex<Vec<PresenceHandler>>,
    status_handlers: Mutex<Vec<StatusHandler>>,
    tracked: Mutex<Vec<serde_json::Value>>,
    presence_snapshot: Mutex<HashMap<String, Vec<serde_json::Value>>>,
    auto_join: bool,
}

impl MockChannel {
    fn new(name: &str, auto_join: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(ChannelState::Pending),
            change_handlers: Mutex::new(Vec::new()),
            presence_handlers: Mutex::new(Vec::new()),
            status_handlers: Mutex::new(Vec::new()),
            tracked: Mutex::new(Vec::new()),
            presence_snapshot: Mutex::new(HashMap::new()),
            auto_join,
        })
    }

    /// Deliver a change event to every listener whose filter matches.
    pub fn emit_change(&self, event: ChangeEvent) {
        let handlers = self.change_handlers.lock().unwrap().clone();
        for (filter, handler) in handlers {
            if filter.table != event.table || !filter.event.matches(event.kind) {
                continue;
            }
            if let Some(spec) = &filter.filter {
                if !row_matches_filter(&event, spec) {
                    continue;
                }
            }
            handler(event.clone());
        }
    }

    pub fn emit_presence(&self, event: PresenceEvent) {
        let handlers = self.presence_handlers.lock().unwrap().clone();
        for handler in handlers {
            handler(event.clone());
        }
    }

    /// Transition the channel and notify status observers.
    pub fn set_status(&self, state: ChannelState) {
        *self.state.lock().unwrap() = state;
        let handlers = self.status_handlers.lock().unwrap().clone();
        for handler in handlers {
            handler(state);
        }
    }

    pub fn set_presence_snapshot(&self, state: HashMap<String, Vec<serde_json::Value>>) {
        *self.presence_snapshot.lock().unwrap() = state;
    }

    pub fn tracked(&self) -> Vec<serde_json::Value> {
        self.tracked.lock().unwrap().clone()
    }

    pub fn change_listener_count(&self) -> usize {
        self.change_handlers.lock().unwrap().len()
    }

    pub fn filters(&self) -> Vec<ChangeFilter> {
        self.change_handlers
            .lock()
            .unwrap()
            .iter()
            .map(|(f, _)| f.clone())
            .collect()
    }
}

/// `column=eq.value` filter check against the event's row image, mirroring
/// how a real backend scopes listeners server-side.
fn row_matches_filter(event: &ChangeEvent, spec: &str) -> bool {
    let Some((column, value)) = spec.split_once("=eq.") else {
        return true;
    };
    event.field(column).as_deref() == Some(value)
}

#[async_trait]
impl RealtimeChannel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    fn on_change(&self, filter: ChangeFilter, handler: ChangeHandler) {
        self.change_handlers.lock().unwrap().push((filter, handler));
    }

    fn on_presence(&self, handler: PresenceHandler) {
        self.presence_handlers.lock().unwrap().push(handler);
    }

    fn subscribe(&self, status: StatusHandler) {
        self.status_handlers.lock().unwrap().push(status);
        if self.auto_join {
            self.set_status(ChannelState::Joined);
        }
    }

    async fn track(&self, payload: serde_json::Value) -> Result<(), BackendError> {
        self.tracked.lock().unwrap().push(payload);
        Ok(())
    }

    fn presence_state(&self) -> HashMap<String, Vec<serde_json::Value>> {
        self.presence_snapshot.lock().unwrap().clone()
    }
}

pub struct MockBackend {
    channels: Mutex<Vec<Arc<MockChannel>>>,
    removed: Mutex<Vec<String>>,
    rows: Mutex<HashMap<(String, String), serde_json::Value>>,
    auth_handlers: Mutex<Vec<AuthHandler>>,
    fail_lookups: AtomicBool,
    auto_join: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            rows: Mutex::new(HashMap::new()),
            auth_handlers: Mutex::new(Vec::new()),
            fail_lookups: AtomicBool::new(false),
            auto_join: AtomicBool::new(true),
        })
    }

    /// Seed a row for `select_one` lookups, keyed by table and id.
    pub fn put_row(&self, table: &str, id: &str, row: serde_json::Value) {
        self.rows
            .lock()
            .unwrap()
            .insert((table.to_string(), id.to_string()), row);
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// When disabled, `subscribe` leaves the channel pending so tests can
    /// drive status transitions by hand.
    pub fn set_auto_join(&self, auto_join: bool) {
        self.auto_join.store(auto_join, Ordering::SeqCst);
    }

    /// Most recently opened channel with this name.
    pub fn channel(&self, name: &str) -> Option<Arc<MockChannel>> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn open_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn fire_auth(&self, event: AuthEvent) {
        let handlers = self.auth_handlers.lock().unwrap().clone();
        for handler in handlers {
            handler(event);
        }
    }
}

#[async_trait]
impl RealtimeBackend for MockBackend {
    fn open_channel(&self, name: &str) -> Arc<dyn RealtimeChannel> {
        let channel = MockChannel::new(name, self.auto_join.load(Ordering::SeqCst));
        self.channels.lock().unwrap().push(channel.clone());
        channel
    }

    fn remove_channel(&self, channel: Arc<dyn RealtimeChannel>) {
        self.removed.lock().unwrap().push(channel.name().to_string());
        if let Some(mock) = self.channel(channel.name()) {
            *mock.state.lock().unwrap() = ChannelState::Closed;
        }
    }

    async fn select_one(
        &self,
        table: &str,
        _column: &str,
        _match_column: &str,
        match_value: &str,
    ) -> Result<serde_json::Value, BackendError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(BackendError::Lookup(format!(
                "simulated lookup failure for {table}"
            )));
        }
        self.rows
            .lock()
            .unwrap()
            .get(&(table.to_string(), match_value.to_string()))
            .cloned()
            .ok_or_else(|| BackendError::Lookup(format!("no {table} row with id {match_value}")))
    }

    fn on_auth_state_change(&self, handler: AuthHandler) {
        self.auth_handlers.lock().unwrap().push(handler);
    }
}

/// Invalidation sink that records every call.
#[derive(Default)]
pub struct RecordingCache {
    keys: Mutex<Vec<InvalidationKey>>,
}

impl RecordingCache {
    pub fn keys(&self) -> Vec<InvalidationKey> {
        self.keys.lock().unwrap().clone()
    }
}

impl QueryCache for RecordingCache {
    fn invalidate(&self, key: &InvalidationKey) {
        self.keys.lock().unwrap().push(key.clone());
    }
}

/// Let spawned dispatch tasks run to completion on the test runtime.
pub async fn settle() {
    for _ in 0..25 {
        tokio::task::yield_now().await;
    }
}
