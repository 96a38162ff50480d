//! The subscription registry.
//!
//! One explicitly constructed service instance owns every realtime
//! concern: named channels multiplexing logical subscriptions, the
//! per-table dispatch routes, debounced cache invalidation, the presence
//! channel, and reconnect-with-backoff. The composition root builds it
//! with an injected [`RealtimeBackend`], calls [`SubscriptionRegistry::init`],
//! and hands the `Arc` to the binding layer; there is no module-level
//! singleton.

mod reconnect;
pub mod routes;


use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::{DashMap, Entry};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::backend::{
    AuthEvent, ChangeEvent, ChangeFilter, ChangeKind, ChannelState, PresenceEvent, RealtimeBackend,
    RealtimeChannel,
};
use crate::invalidation::{InvalidationDebouncer, QueryCache};
use crate::notify::{Notification, NotificationEmitter, NotificationKind};
use crate::presence::{PresenceRecord, PresenceTracker, PresenceUpdate};

use reconnect::{ReconnectDecision, ReconnectSupervisor};
use routes::{DispatchContext, TableRoute, TABLE_PHASES, TABLE_PROJECTS, TABLE_STEPS, TABLE_TASKS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_debounce_window_ms")]
    pub debounce_window_ms: u64,
    #[serde(default = "default_reconnect_ceiling")]
    pub reconnect_ceiling: u32,
    #[serde(default = "default_presence_poll_secs")]
    pub presence_poll_secs: u64,
    #[serde(default = "default_presence_channel")]
    pub presence_channel: String,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            debounce_window_ms: default_debounce_window_ms(),
            reconnect_ceiling: default_reconnect_ceiling(),
            presence_poll_secs: default_presence_poll_secs(),
            presence_channel: default_presence_channel(),
        }
    }
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_debounce_window_ms() -> u64 {
    1000
}

fn default_reconnect_ceiling() -> u32 {
    5
}

fn default_presence_poll_secs() -> u64 {
    30
}

fn default_presence_channel() -> String {
    "online-users".to_string()
}

/// Identity the local process announces on the presence channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalActor {
    pub user_id: String,
    pub display_name: String,
}

/// One registered interest in change events on a table.
#[derive(Debug, Clone)]
pub struct TableSubscription {
    pub table: String,
    pub event: ChangeKind,
    pub filter: Option<String>,
    pub schema: Option<String>,
}

impl TableSubscription {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            event: ChangeKind::Any,
            filter: None,
            schema: None,
        }
    }

    pub fn event(mut self, event: ChangeKind) -> Self {
        self.event = event;
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Channel name when the caller did not supply one: distinct filters
    /// get distinct channels, identical configs collapse.
    fn resolved_name(&self, default_schema: &str) -> String {
        let schema = self.schema.as_deref().unwrap_or(default_schema);
        match &self.filter {
            Some(filter) => format!("{schema}:{}:{}:{filter}", self.table, self.event),
            None => format!("{schema}:{}:{}", self.table, self.event),
        }
    }
}

struct Subscription {
    channel: Arc<dyn RealtimeChannel>,
    /// Cleared on unsubscribe; gates dispatch synchronously so a removed
    /// channel can never deliver another event.
    alive: Arc<AtomicBool>,
}

type JoinedHook = Box<dyn Fn() + Send + Sync>;

pub struct SubscriptionRegistry {
    backend: Arc<dyn RealtimeBackend>,
    config: RealtimeConfig,
    subscriptions: DashMap<String, Subscription>,
    routes: HashMap<&'static str, Arc<dyn TableRoute>>,
    debouncer: Arc<InvalidationDebouncer>,
    emitter: Arc<NotificationEmitter>,
    presence: Arc<PresenceTracker>,
    presence_channel: Mutex<Option<Arc<dyn RealtimeChannel>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    reconnect: ReconnectSupervisor,
}

impl SubscriptionRegistry {
    pub fn new(
        backend: Arc<dyn RealtimeBackend>,
        actor: LocalActor,
        config: RealtimeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            subscriptions: DashMap::new(),
            routes: routes::default_routes(),
            debouncer: Arc::new(InvalidationDebouncer::new(Duration::from_millis(
                config.debounce_window_ms,
            ))),
            emitter: Arc::new(NotificationEmitter::new()),
            presence: Arc::new(PresenceTracker::new(actor.user_id, actor.display_name)),
            presence_channel: Mutex::new(None),
            poll_task: Mutex::new(None),
            reconnect: ReconnectSupervisor::new(config.reconnect_ceiling),
            config,
        })
    }

    /// Join the presence channel, start the presence poll loop, and hook
    /// auth state transitions. Call once from the composition root.
    pub fn init(self: &Arc<Self>) {
        let registry = Arc::downgrade(self);
        self.backend
            .on_auth_state_change(Arc::new(move |event| {
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                match event {
                    AuthEvent::SignedIn => {
                        tracing::info!("signed in, resetting reconnect attempts");
                        registry.reconnect.reset();
                    }
                    AuthEvent::SignedOut => {
                        tracing::info!("signed out, tearing down realtime state");
                        registry.cleanup();
                    }
                }
            }));

        let channel = self.backend.open_channel(&self.config.presence_channel);

        let registry = Arc::downgrade(self);
        channel.on_presence(Arc::new(move |event| {
            if let Some(registry) = registry.upgrade() {
                registry.handle_presence_event(event);
            }
        }));

        // Stored before the join so the status handler can track through
        // it as soon as the channel reports joined.
        *self
            .presence_channel
            .lock()
            .expect("presence channel lock poisoned") = Some(channel.clone());

        let registry = Arc::downgrade(self);
        let name = self.config.presence_channel.clone();
        channel.subscribe(Arc::new(move |state| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            match state {
                ChannelState::Joined => {
                    tracing::debug!("presence channel {name} joined");
                    registry.reconnect.reset();
                    // Announce ourselves as soon as the channel is up.
                    registry.update_presence(PresenceUpdate::default());
                }
                ChannelState::Errored => {
                    tracing::warn!("presence channel {name} errored");
                }
                _ => {}
            }
        }));

        self.spawn_presence_poll();
        tracing::info!("subscription registry initialized");
    }

    // -----------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------

    /// Subscribe to change events on one table. Idempotent per resolved
    /// name: a second call with the same name returns it without opening
    /// another channel.
    pub fn subscribe_to_table(
        self: &Arc<Self>,
        sub: TableSubscription,
        name: Option<&str>,
    ) -> String {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| sub.resolved_name(&self.config.schema));
        // Reserving the map slot before opening the channel keeps
        // idempotence race-free: a concurrent call for the same name blocks
        // on the entry and then sees it occupied.
        let slot = match self.subscriptions.entry(name.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!("subscription {name} already active, reusing");
                return name;
            }
            Entry::Vacant(slot) => slot,
        };

        let channel = self.backend.open_channel(&name);
        let alive = Arc::new(AtomicBool::new(true));
        let filter = ChangeFilter {
            schema: sub
                .schema
                .unwrap_or_else(|| self.config.schema.clone()),
            table: sub.table,
            event: sub.event,
            filter: sub.filter,
        };
        self.attach_change_listener(&channel, filter, &alive);
        self.join_channel(&name, &channel, None);

        slot.insert(Subscription { channel, alive });
        tracing::debug!("subscribed channel {name}");
        name
    }

    /// Composite subscription for one project: the project row itself
    /// plus its phase/step/task tables, multiplexed onto one channel. On
    /// successful join the local actor's presence moves to this project.
    pub fn subscribe_to_project(self: &Arc<Self>, project_id: &str) -> String {
        let name = format!("project:{project_id}");
        let slot = match self.subscriptions.entry(name.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!("subscription {name} already active, reusing");
                return name;
            }
            Entry::Vacant(slot) => slot,
        };

        let channel = self.backend.open_channel(&name);
        let alive = Arc::new(AtomicBool::new(true));
        let scoped = [
            (TABLE_PROJECTS, Some(format!("id=eq.{project_id}"))),
            (TABLE_PHASES, Some(format!("project_id=eq.{project_id}"))),
            // Steps and tasks carry no project column; they are filtered
            // down to the project during dispatch resolution instead.
            (TABLE_STEPS, None),
            (TABLE_TASKS, None),
        ];
        for (table, filter) in scoped {
            self.attach_change_listener(
                &channel,
                ChangeFilter {
                    schema: self.config.schema.clone(),
                    table: table.to_string(),
                    event: ChangeKind::Any,
                    filter,
                },
                &alive,
            );
        }

        let registry = Arc::downgrade(self);
        let project = project_id.to_string();
        self.join_channel(
            &name,
            &channel,
            Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.update_presence(PresenceUpdate::project(project.clone()));
                }
            })),
        );

        slot.insert(Subscription { channel, alive });
        tracing::debug!("subscribed project channel {name}");
        name
    }

    /// Update events on tasks assigned to one user.
    pub fn subscribe_to_user_tasks(self: &Arc<Self>, user_id: &str) -> String {
        self.subscribe_to_table(
            TableSubscription::table(TABLE_TASKS)
                .event(ChangeKind::Update)
                .filter(format!("assigned_to=eq.{user_id}")),
            Some(&format!("user-tasks:{user_id}")),
        )
    }

    /// Tear down one named channel. Unknown names are a no-op.
    pub fn unsubscribe(&self, name: &str) {
        let Some((_, subscription)) = self.subscriptions.remove(name) else {
            tracing::debug!("unsubscribe of unknown channel {name}, ignoring");
            return;
        };
        subscription.alive.store(false, Ordering::SeqCst);
        self.backend.remove_channel(subscription.channel);
        tracing::debug!("unsubscribed channel {name}");
    }

    pub fn unsubscribe_all(&self) {
        let names: Vec<String> = self
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            self.unsubscribe(&name);
        }
    }

    /// Full teardown: every channel, the presence channel, the poll loop,
    /// all pending debounce timers, and the presence map. Called on
    /// sign-out.
    pub fn cleanup(&self) {
        self.unsubscribe_all();
        if let Some(channel) = self
            .presence_channel
            .lock()
            .expect("presence channel lock poisoned")
            .take()
        {
            self.backend.remove_channel(channel);
        }
        if let Some(task) = self
            .poll_task
            .lock()
            .expect("poll task lock poisoned")
            .take()
        {
            task.abort();
        }
        self.debouncer.clear();
        self.presence.clear();
        tracing::info!("subscription registry cleaned up");
    }

    // -----------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------

    pub fn subscription_status(&self) -> HashMap<String, ChannelState> {
        self.subscriptions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().channel.state()))
            .collect()
    }

    /// True iff at least one managed channel is joined.
    pub fn is_connected(&self) -> bool {
        self.subscriptions
            .iter()
            .any(|entry| entry.value().channel.state() == ChannelState::Joined)
    }

    /// Inject the cache-invalidation sink. Until then, invalidations are
    /// silently skipped.
    pub fn set_query_client(&self, cache: Arc<dyn QueryCache>) {
        self.debouncer.set_query_cache(cache);
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.emitter.subscribe()
    }

    // -----------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------

    /// Merge a partial update into the local actor's record and
    /// re-broadcast it over the presence channel, fire-and-forget.
    pub fn update_presence(&self, update: PresenceUpdate) {
        let record = self.presence.merge_local(update);
        let channel = self
            .presence_channel
            .lock()
            .expect("presence channel lock poisoned")
            .clone();
        let Some(channel) = channel else {
            tracing::debug!("presence channel not open, skipping track");
            return;
        };
        match serde_json::to_value(&record) {
            Ok(payload) => {
                tokio::spawn(async move {
                    if let Err(e) = channel.track(payload).await {
                        tracing::warn!("presence track failed: {e}");
                    }
                });
            }
            Err(e) => tracing::warn!("presence payload serialization failed: {e}"),
        }
    }

    pub fn presence_state(&self) -> Vec<PresenceRecord> {
        self.presence.snapshot()
    }

    pub fn users_in_project(&self, project_id: &str) -> Vec<PresenceRecord> {
        self.presence.users_in_project(project_id)
    }

    pub fn users_on_task(&self, task_id: &str) -> Vec<PresenceRecord> {
        self.presence.users_on_task(task_id)
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn attach_change_listener(
        self: &Arc<Self>,
        channel: &Arc<dyn RealtimeChannel>,
        filter: ChangeFilter,
        alive: &Arc<AtomicBool>,
    ) {
        let registry = Arc::downgrade(self);
        let alive = alive.clone();
        channel.on_change(
            filter,
            Arc::new(move |event| {
                if !alive.load(Ordering::SeqCst) {
                    return;
                }
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                registry.handle_database_change(event);
            }),
        );
    }

    /// Route one change event to its table handler. Unrecognized tables
    /// are a no-op. Handlers run on their own task so a slow cross-entity
    /// lookup never blocks event delivery.
    fn handle_database_change(self: &Arc<Self>, event: ChangeEvent) {
        let Some(route) = self.routes.get(event.table.as_str()) else {
            tracing::trace!("no route for table {}, ignoring event", event.table);
            return;
        };
        let route = route.clone();
        let cx = DispatchContext {
            backend: self.backend.clone(),
            debouncer: self.debouncer.clone(),
            emitter: self.emitter.clone(),
        };
        tokio::spawn(async move {
            route.handle(&cx, &event).await;
        });
    }

    fn join_channel(
        self: &Arc<Self>,
        name: &str,
        channel: &Arc<dyn RealtimeChannel>,
        on_joined: Option<JoinedHook>,
    ) {
        let registry = Arc::downgrade(self);
        let name = name.to_string();
        let joined_once = AtomicBool::new(false);
        channel.subscribe(Arc::new(move |state| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            match state {
                ChannelState::Joined => {
                    tracing::debug!("channel {name} joined");
                    registry.reconnect.reset();
                    if let Some(hook) = &on_joined {
                        if !joined_once.swap(true, Ordering::SeqCst) {
                            hook();
                        }
                    }
                }
                ChannelState::Errored => {
                    registry.channel_errored(&name);
                }
                ChannelState::Closed => {
                    tracing::debug!("channel {name} closed");
                }
                ChannelState::Pending => {}
            }
        }));
    }

    /// Reconnect policy on channel error: single-flight across all
    /// channels, 2^attempt seconds of backoff, then force-unsubscribe the
    /// failed channel. The consumer observes the drop and re-subscribes;
    /// the registry does not recreate channels on its own.
    fn channel_errored(self: &Arc<Self>, name: &str) {
        match self.reconnect.begin(name) {
            ReconnectDecision::Skip | ReconnectDecision::Abandoned => {}
            ReconnectDecision::Backoff(delay) => {
                let registry = Arc::downgrade(self);
                let name = name.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Some(registry) = registry.upgrade() else {
                        return;
                    };
                    tracing::info!(
                        "dropping errored channel {name}; consumer re-subscribe expected"
                    );
                    registry.unsubscribe(&name);
                    registry.reconnect.finish();
                });
            }
        }
    }

    fn handle_presence_event(&self, event: PresenceEvent) {
        match &event {
            PresenceEvent::Join { key, .. } if key != self.presence.local_user_id() => {
                self.emitter.send(
                    Notification::new(NotificationKind::PresenceUpdate, "user", key.clone())
                        .with_payload(serde_json::json!({"event": "join"})),
                );
            }
            PresenceEvent::Leave { key, .. } if key != self.presence.local_user_id() => {
                self.emitter.send(
                    Notification::new(NotificationKind::PresenceUpdate, "user", key.clone())
                        .with_payload(serde_json::json!({"event": "leave"})),
                );
            }
            _ => {}
        }
        self.presence.apply(event);
    }

    /// Periodic presence refresh: re-announce the local actor and replace
    /// the tracker from the channel's snapshot. Polling trades latency
    /// for simplicity; the push handlers keep the map fresh in between.
    fn spawn_presence_poll(self: &Arc<Self>) {
        let registry = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.presence_poll_secs);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The immediate first tick would race the channel join.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let channel = registry
                    .presence_channel
                    .lock()
                    .expect("presence channel lock poisoned")
                    .clone();
                let Some(channel) = channel else {
                    continue;
                };
                registry.update_presence(PresenceUpdate::default());
                registry.presence.apply_sync(channel.presence_state());
            }
        });
        *self
            .poll_task
            .lock()
            .expect("poll task lock poisoned") = Some(handle);
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        if let Some(task) = self
            .poll_task
            .lock()
            .expect("poll task lock poisoned")
            .take()
        {
            task.abort();
        }
    }
}
