//! Liveness supervision of the running pipeline.
//!
//! [`Supervisor`] treats every sample on a watched topic as a heartbeat of
//! the component that publishes it (the operator's diagnostics, a sink's
//! state, a camera's frames) and polls a [`Watchdog`] on a fixed period.
//! Health transitions are logged by the watchdog and the current snapshot
//! is exposed through a `watch` channel for the console.

use std::collections::HashMap;
use std::time::Duration;

use teleop_kernel::{ComponentHealth, Watchdog};
use teleop_middleware::MessageBus;
use teleop_types::TeleopError;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::info;

pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_millis(100);

/// Health of every watched component, sorted by component id.
pub type HealthSnapshot = Vec<(String, ComponentHealth)>;

pub struct Supervisor {
    bus: MessageBus,
    watchdog: Watchdog,
    /// topic name → component id
    routes: HashMap<String, String>,
    poll_period: Duration,
    health: watch::Sender<HealthSnapshot>,
}

impl Supervisor {
    pub fn new(bus: MessageBus) -> Self {
        let (health, _) = watch::channel(Vec::new());
        Self {
            bus,
            watchdog: Watchdog::new(),
            routes: HashMap::new(),
            poll_period: DEFAULT_POLL_PERIOD,
            health,
        }
    }

    /// Expect a sample on `topic` at least every `timeout`.
    pub fn watch_topic(mut self, component: &str, topic: &str, timeout: Duration) -> Self {
        self.watchdog.register(component, timeout);
        self.routes.insert(topic.to_string(), component.to_string());
        self
    }

    pub fn with_poll_period(mut self, period: Duration) -> Self {
        self.poll_period = period;
        self
    }

    /// Receiver of the latest health snapshot.
    pub fn health(&self) -> watch::Receiver<HealthSnapshot> {
        self.health.subscribe()
    }

    /// Run until `stop` flips to `true`.  Returns the number of health
    /// transitions observed.
    ///
    /// # Errors
    ///
    /// [`TeleopError::FatalConfig`] when nothing is being watched.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<u64, TeleopError> {
        if self.routes.is_empty() {
            return Err(TeleopError::FatalConfig("supervisor has no topics to watch".to_string()));
        }
        let names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        // Only the arrival matters; a small queue with drops is fine.
        let mut samples = self.bus.subscribe_merged(&names, 64);
        let mut ticker = interval(self.poll_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut transitions = 0u64;
        info!(components = self.routes.len(), "supervisor started");

        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                envelope = samples.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let Some(component) = self.routes.get(envelope.topic()) {
                        self.watchdog.heartbeat(component);
                    }
                }
                _ = ticker.tick() => {
                    let changes = self.watchdog.poll();
                    transitions += changes.len() as u64;
                    let now = std::time::Instant::now();
                    self.health.send_replace(self.watchdog.snapshot_at(now));
                }
            }
        }

        info!(transitions, "supervisor stopped");
        Ok(transitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teleop_middleware::Topic;

    #[tokio::test]
    async fn silent_component_times_out_and_recovers() {
        let bus = MessageBus::new();
        let topic: Topic<u32> = Topic::new("state/arm");
        let supervisor = Supervisor::new(bus.clone())
            .watch_topic("sink/arm", "state/arm", Duration::from_millis(60))
            .with_poll_period(Duration::from_millis(10));
        let mut health = supervisor.health();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(stop_rx));

        let status = |snapshot: &HealthSnapshot| snapshot.first().map(|(_, h)| *h);

        for n in 0..5 {
            bus.publish(&topic, n);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        health
            .wait_for(|s| status(s) == Some(ComponentHealth::Healthy))
            .await
            .unwrap();

        health
            .wait_for(|s| matches!(status(s), Some(ComponentHealth::TimedOut { .. })))
            .await
            .unwrap();

        bus.publish(&topic, 99);
        health
            .wait_for(|s| status(s) == Some(ComponentHealth::Healthy))
            .await
            .unwrap();

        stop_tx.send(true).unwrap();
        let transitions = task.await.unwrap().unwrap();
        assert!(transitions >= 3);
    }

    #[tokio::test]
    async fn nothing_to_watch_is_fatal() {
        let (_tx, rx) = watch::channel(false);
        let err = Supervisor::new(MessageBus::new()).run(rx).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
