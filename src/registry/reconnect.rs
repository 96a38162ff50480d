//! Bounded exponential backoff for errored channels.
//!
//! One reconnect cycle at a time, process-wide (single-flight): an error
//! reported while a cycle is in progress is ignored, whichever channel it
//! came from. The attempt counter is global and only resets on a
//! successful join or sign-in; past the ceiling, errors are logged and no
//! timer is started, so the caller must re-subscribe manually.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReconnectDecision {
    /// Another cycle is already in flight; ignore this error.
    Skip,
    /// Ceiling exhausted; no automatic recovery for this channel.
    Abandoned,
    /// Wait this long, then force-unsubscribe the failed channel.
    Backoff(Duration),
}

pub(crate) struct ReconnectSupervisor {
    in_flight: AtomicBool,
    attempts: AtomicU32,
    ceiling: u32,
}

impl ReconnectSupervisor {
    pub fn new(ceiling: u32) -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            ceiling,
        }
    }

    /// Called on a channel error. Claims the single-flight gate and
    /// advances the attempt counter; the caller owns the returned backoff
    /// and must call `finish` when the cycle completes.
    pub fn begin(&self, channel: &str) -> ReconnectDecision {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            tracing::debug!("reconnect already in flight, ignoring error on channel {channel}");
            return ReconnectDecision::Skip;
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.ceiling {
            tracing::error!(
                "channel {channel}: reconnect ceiling ({}) exceeded, giving up; manual re-subscribe required",
                self.ceiling
            );
            self.in_flight.store(false, Ordering::SeqCst);
            return ReconnectDecision::Abandoned;
        }

        let delay = Duration::from_secs(2u64.pow(attempt));
        tracing::warn!(
            "channel {channel} errored, reconnect attempt {attempt}/{} in {delay:?}",
            self.ceiling
        );
        ReconnectDecision::Backoff(delay)
    }

    /// Release the single-flight gate at the end of a cycle.
    pub fn finish(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }

    /// Reset on successful sign-in or channel join.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}
