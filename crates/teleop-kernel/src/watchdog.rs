//! [`Watchdog`] – liveness supervision for pipeline components.
//!
//! Operators, sink drivers and camera drivers each publish at a known rate.
//! A supervisor feeds every observed message into [`Watchdog::heartbeat`]
//! and periodically calls [`Watchdog::poll`], which reports *edges* only: a
//! component going silent is reported once, and again once when it recovers.
//!
//! All time-dependent methods have an `_at` variant taking an explicit
//! [`Instant`] so supervision logic can be tested without sleeping.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{info, warn};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Health state reported for a single component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Registered but no heartbeat seen yet.
    Pending,
    /// Last heartbeat is within the deadline.
    Healthy,
    /// Deadline exceeded; `silent_for` is the time since the last heartbeat.
    TimedOut { silent_for: Duration },
}

impl ComponentHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ComponentHealth::Healthy)
    }

    fn class(&self) -> u8 {
        match self {
            ComponentHealth::Pending => 0,
            ComponentHealth::Healthy => 1,
            ComponentHealth::TimedOut { .. } => 2,
        }
    }
}

impl fmt::Display for ComponentHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentHealth::Pending => write!(f, "pending"),
            ComponentHealth::Healthy => write!(f, "healthy"),
            ComponentHealth::TimedOut { silent_for } => {
                write!(f, "timed out ({} ms silent)", silent_for.as_millis())
            }
        }
    }
}

/// A health transition observed by [`Watchdog::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthChange {
    pub component: String,
    pub from: ComponentHealth,
    pub to: ComponentHealth,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct ComponentEntry {
    last_heartbeat: Option<Instant>,
    timeout: Duration,
    heartbeats: u64,
    reported: ComponentHealth,
}

impl ComponentEntry {
    fn health_at(&self, now: Instant) -> ComponentHealth {
        match self.last_heartbeat {
            None => ComponentHealth::Pending,
            Some(last) => {
                let silent_for = now.saturating_duration_since(last);
                if silent_for <= self.timeout {
                    ComponentHealth::Healthy
                } else {
                    ComponentHealth::TimedOut { silent_for }
                }
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

/// Tracks heartbeats from registered components.
///
/// # Example
///
/// ```
/// use std::time::{Duration, Instant};
/// use teleop_kernel::watchdog::{ComponentHealth, Watchdog};
///
/// let mut wd = Watchdog::new();
/// wd.register("operator/arm", Duration::from_millis(200));
/// let t0 = Instant::now();
/// wd.heartbeat_at("operator/arm", t0);
///
/// assert_eq!(wd.health_at("operator/arm", t0), ComponentHealth::Healthy);
/// let later = t0 + Duration::from_millis(500);
/// assert!(!wd.health_at("operator/arm", later).is_healthy());
/// ```
#[derive(Default)]
pub struct Watchdog {
    components: HashMap<String, ComponentEntry>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `component_id` with a heartbeat `timeout`.
    ///
    /// A new component is [`ComponentHealth::Pending`] until its first
    /// heartbeat.  Re-registering resets it.
    pub fn register(&mut self, component_id: &str, timeout: Duration) {
        self.components.insert(
            component_id.to_string(),
            ComponentEntry {
                last_heartbeat: None,
                timeout,
                heartbeats: 0,
                reported: ComponentHealth::Pending,
            },
        );
    }

    pub fn is_registered(&self, component_id: &str) -> bool {
        self.components.contains_key(component_id)
    }

    pub fn heartbeat(&mut self, component_id: &str) {
        self.heartbeat_at(component_id, Instant::now());
    }

    /// Record a heartbeat observed at `now`.  Unknown components are ignored.
    pub fn heartbeat_at(&mut self, component_id: &str, now: Instant) {
        if let Some(entry) = self.components.get_mut(component_id) {
            entry.last_heartbeat = Some(now);
            entry.heartbeats += 1;
        }
    }

    /// Number of heartbeats recorded for `component_id` since registration.
    pub fn heartbeats(&self, component_id: &str) -> u64 {
        self.components.get(component_id).map_or(0, |e| e.heartbeats)
    }

    pub fn health(&self, component_id: &str) -> Option<ComponentHealth> {
        self.components
            .get(component_id)
            .map(|e| e.health_at(Instant::now()))
    }

    /// Health of `component_id` at `now`.  Unknown components are reported
    /// as [`ComponentHealth::Pending`].
    pub fn health_at(&self, component_id: &str, now: Instant) -> ComponentHealth {
        self.components
            .get(component_id)
            .map_or(ComponentHealth::Pending, |e| e.health_at(now))
    }

    /// Every component with its current health, sorted by id.
    pub fn snapshot_at(&self, now: Instant) -> Vec<(String, ComponentHealth)> {
        let mut out: Vec<_> = self
            .components
            .iter()
            .map(|(id, e)| (id.clone(), e.health_at(now)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn poll(&mut self) -> Vec<HealthChange> {
        self.poll_at(Instant::now())
    }

    /// Report components whose health class changed since the previous poll.
    ///
    /// A component that stays timed out is reported once, not on every poll.
    pub fn poll_at(&mut self, now: Instant) -> Vec<HealthChange> {
        let mut changes = Vec::new();
        for (id, entry) in &mut self.components {
            let current = entry.health_at(now);
            if current.class() != entry.reported.class() {
                match current {
                    ComponentHealth::TimedOut { silent_for } => warn!(
                        component = %id,
                        silent_ms = silent_for.as_millis() as u64,
                        "component timed out"
                    ),
                    ComponentHealth::Healthy => info!(component = %id, "component healthy"),
                    ComponentHealth::Pending => {}
                }
                changes.push(HealthChange {
                    component: id.clone(),
                    from: entry.reported,
                    to: current,
                });
                entry.reported = current;
            }
        }
        changes.sort_by(|a, b| a.component.cmp(&b.component));
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[test]
    fn registered_component_is_pending_until_first_heartbeat() {
        let mut wd = Watchdog::new();
        wd.register("sink/arm", TIMEOUT);
        let now = Instant::now();
        assert_eq!(wd.health_at("sink/arm", now), ComponentHealth::Pending);
        wd.heartbeat_at("sink/arm", now);
        assert_eq!(wd.health_at("sink/arm", now), ComponentHealth::Healthy);
        assert_eq!(wd.heartbeats("sink/arm"), 1);
    }

    #[test]
    fn silence_past_deadline_times_out() {
        let mut wd = Watchdog::new();
        wd.register("operator/arm", TIMEOUT);
        let t0 = Instant::now();
        wd.heartbeat_at("operator/arm", t0);
        let health = wd.health_at("operator/arm", t0 + Duration::from_millis(150));
        assert_eq!(
            health,
            ComponentHealth::TimedOut {
                silent_for: Duration::from_millis(150)
            }
        );
    }

    #[test]
    fn poll_reports_edges_once() {
        let mut wd = Watchdog::new();
        wd.register("camera/wrist", TIMEOUT);
        let t0 = Instant::now();
        wd.heartbeat_at("camera/wrist", t0);

        let changes = wd.poll_at(t0);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, ComponentHealth::Healthy);
        assert!(wd.poll_at(t0 + Duration::from_millis(50)).is_empty());

        let late = t0 + Duration::from_millis(300);
        let changes = wd.poll_at(late);
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0].to, ComponentHealth::TimedOut { .. }));
        // Still silent: no repeat report.
        assert!(wd.poll_at(late + Duration::from_millis(300)).is_empty());

        wd.heartbeat_at("camera/wrist", late + Duration::from_millis(400));
        let changes = wd.poll_at(late + Duration::from_millis(400));
        assert_eq!(changes[0].to, ComponentHealth::Healthy);
    }

    #[test]
    fn unknown_components_are_ignored() {
        let mut wd = Watchdog::new();
        wd.heartbeat("ghost");
        assert!(!wd.is_registered("ghost"));
        assert_eq!(wd.health("ghost"), None);
        assert!(wd.poll().is_empty());
    }

    #[test]
    fn snapshot_is_sorted() {
        let mut wd = Watchdog::new();
        wd.register("sink/b", TIMEOUT);
        wd.register("sink/a", TIMEOUT);
        let ids: Vec<_> = wd
            .snapshot_at(Instant::now())
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["sink/a", "sink/b"]);
    }
}
