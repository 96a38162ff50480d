//! Realtime subscription and cache-coherence layer.
//!
//! A process-wide [`SubscriptionRegistry`] multiplexes logical
//! subscriptions over a small number of named realtime channels, tracks
//! live user presence, debounces cache invalidation in response to
//! row-change events, and reconnects with bounded backoff on channel
//! failure.
//!
//! # Architecture
//!
//! - `backend`: abstract interface to the change-event source (channels,
//!   presence, point reads, auth transitions)
//! - `registry`: the subscription manager, per-table dispatch routes, and
//!   the reconnect supervisor
//! - `invalidation`: debounced invalidation of logical query-cache keys
//! - `presence`: live user presence records and merge semantics
//! - `notify`: user-facing notification fan-out
//!
//! The host injects a concrete [`RealtimeBackend`] and a [`QueryCache`]
//! sink; the core never talks to a vendor SDK or a cache implementation
//! directly.

pub mod backend;
pub mod invalidation;
pub mod notify;
pub mod presence;
pub mod registry;

#[cfg(test)]
mod testing;

pub use backend::{
    AuthEvent, BackendError, ChangeEvent, ChangeFilter, ChangeKind, ChannelState, PresenceEvent,
    RealtimeBackend, RealtimeChannel,
};
pub use invalidation::{InvalidationDebouncer, InvalidationKey, QueryCache};
pub use notify::{Notification, NotificationKind};
pub use presence::{FieldUpdate, PresenceRecord, PresenceStatus, PresenceTracker, PresenceUpdate};
pub use registry::{LocalActor, RealtimeConfig, SubscriptionRegistry, TableSubscription};
