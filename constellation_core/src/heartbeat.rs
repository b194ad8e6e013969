//! Heartbeat scheduling: periodic self re-broadcast and staleness eviction.
//!
//! Timers here are plain deadline bookkeeping against the context's
//! monotonic clock. The session loop asks for the next deadline, sleeps
//! until then, and polls. A stopped timer never reports due again, so
//! stopping has no further side effects.

use std::time::Duration;
use crate::config::HeartbeatConfig;

/// A restartable fixed-period deadline.
#[derive(Debug, Clone)]
pub struct PeriodicTimer {
    period: Duration,
    next_due: Option<Duration>,
}

impl PeriodicTimer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_due: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Arms the timer; first fire at `now + period`.
    ///
    /// Returns false (and changes nothing) if already running.
    pub fn start(&mut self, now: Duration) -> bool {
        if self.next_due.is_some() {
            return false;
        }
        self.next_due = Some(now + self.period);
        true
    }

    pub fn stop(&mut self) {
        self.next_due = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    pub fn next_due(&self) -> Option<Duration> {
        self.next_due
    }

    /// Returns true once per elapsed deadline.
    ///
    /// Missed periods collapse into a single fire; the next deadline is
    /// always in the future.
    pub fn poll(&mut self, now: Duration) -> bool {
        match self.next_due {
            Some(due) if now >= due => {
                let mut next = due + self.period;
                if next <= now {
                    next = now + self.period;
                }
                self.next_due = Some(next);
                true
            }
            _ => false,
        }
    }
}

/// Which heartbeat duties are due on this poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatDue {
    pub publish: bool,
    pub prune: bool,
}

impl HeartbeatDue {
    pub fn any(&self) -> bool {
        self.publish || self.prune
    }
}

/// Drives the publish and prune cadences together.
#[derive(Debug, Clone)]
pub struct HeartbeatScheduler {
    publish: PeriodicTimer,
    prune: PeriodicTimer,
}

impl HeartbeatScheduler {
    pub fn new(config: &HeartbeatConfig) -> Self {
        // Pruning runs on the same or a coarser period than publishing
        let prune_interval = config.prune_interval.max(config.publish_interval);
        Self {
            publish: PeriodicTimer::new(config.publish_interval),
            prune: PeriodicTimer::new(prune_interval),
        }
    }

    /// Idempotent: returns false if already running.
    pub fn start(&mut self, now: Duration) -> bool {
        if self.is_running() {
            return false;
        }
        self.publish.start(now);
        self.prune.start(now);
        true
    }

    pub fn stop(&mut self) {
        self.publish.stop();
        self.prune.stop();
    }

    pub fn is_running(&self) -> bool {
        self.publish.is_running()
    }

    pub fn poll(&mut self, now: Duration) -> HeartbeatDue {
        HeartbeatDue {
            publish: self.publish.poll(now),
            prune: self.prune.poll(now),
        }
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        match (self.publish.next_due(), self.prune.next_due()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn publish_interval(&self) -> Duration {
        self.publish.period()
    }

    pub fn prune_interval(&self) -> Duration {
        self.prune.period()
    }
}
