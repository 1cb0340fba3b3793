//! Tasks connecting hardware to the message bus.
//!
//! | Task | Consumes | Publishes |
//! |---|---|---|
//! | [`SinkDriver`] | `command/<robot>` (queued) | `state/<robot>` |
//! | [`CameraDriver`] | – | `camera/<id>` at a fixed rate |
//!
//! Both run until their stop signal flips to `true`.

use std::time::Duration;

use teleop_middleware::{MessageBus, topics};
use teleop_types::{Command, RobotState, StateStatus, TeleopError};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::camera::Camera;
use crate::sink::{RobotSink, SinkResponse};

/// Commands buffered between the operator and a slow sink.
pub const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Last command handled, keyed by operator instance so a restarted operator
/// (whose seq starts over) is not mistaken for a replay.
#[derive(Default)]
struct LastHandled(Option<(Uuid, u64)>);

impl LastHandled {
    fn is_replay(&self, command: &Command) -> bool {
        self.0
            .is_some_and(|(instance, seq)| instance == command.operator_instance && command.seq <= seq)
    }

    fn record(&mut self, command: &Command) {
        self.0 = Some((command.operator_instance, command.seq));
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SinkDriver
// ────────────────────────────────────────────────────────────────────────────

/// Counters reported when a [`SinkDriver`] stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub accepted: u64,
    pub rejected: u64,
    pub replays_skipped: u64,
}

/// Feeds commands to a [`RobotSink`] and reports the resulting state.
///
/// On [`SinkResponse::Reject`] the previously accepted state is published
/// again with status [`StateStatus::Held`], so downstream consumers always
/// see what the robot is actually holding.
pub struct SinkDriver {
    bus: MessageBus,
    sink: Box<dyn RobotSink>,
}

impl SinkDriver {
    pub fn new(bus: MessageBus, sink: Box<dyn RobotSink>) -> Self {
        Self { bus, sink }
    }

    /// Run until `stop` flips to `true`.  Returns the sink for inspection.
    pub async fn run(
        mut self,
        mut stop: watch::Receiver<bool>,
    ) -> Result<(Box<dyn RobotSink>, SinkStats), TeleopError> {
        let robot = self.sink.id().to_string();
        let mut commands = self
            .bus
            .subscribe_queued(&topics::command(&robot), COMMAND_QUEUE_CAPACITY)?;
        let state_topic = topics::state(&robot);
        let mut stats = SinkStats::default();
        let mut handled = LastHandled::default();

        let mut last_accepted: RobotState = self.sink.state();
        self.bus.publish(&state_topic, last_accepted.clone());
        info!(robot = %robot, "sink driver started");

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if handled.is_replay(&command) {
                        stats.replays_skipped += 1;
                        continue;
                    }
                    handled.record(&command);
                    match self.sink.send(&command) {
                        SinkResponse::Ack => {
                            stats.accepted += 1;
                            last_accepted = self.sink.state();
                            if last_accepted.command_seq.is_none() {
                                last_accepted.command_seq = Some(command.seq);
                            }
                            self.bus.publish(&state_topic, last_accepted.clone());
                        }
                        SinkResponse::Reject(reason) => {
                            stats.rejected += 1;
                            warn!(robot = %robot, seq = command.seq, reason = %reason, "command rejected");
                            let held = RobotState {
                                status: StateStatus::Held {
                                    reason,
                                    rejected_seq: command.seq,
                                },
                                ..last_accepted.clone()
                            };
                            self.bus.publish(&state_topic, held);
                        }
                    }
                    debug!(robot = %robot, seq = command.seq, "command handled");
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            robot = %robot,
            accepted = stats.accepted,
            rejected = stats.rejected,
            "sink driver stopped"
        );
        Ok((self.sink, stats))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CameraDriver
// ────────────────────────────────────────────────────────────────────────────

/// Counters reported when a [`CameraDriver`] stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CameraStats {
    pub published: u64,
    pub failed: u64,
}

/// Captures from a [`Camera`] at a fixed rate.  Capture failures are logged
/// and skipped; the next tick tries again.
pub struct CameraDriver {
    bus: MessageBus,
    camera: Box<dyn Camera>,
    period: Duration,
}

impl CameraDriver {
    /// # Errors
    ///
    /// [`TeleopError::FatalConfig`] when `rate_hz` is not a positive finite
    /// number.
    pub fn new(bus: MessageBus, camera: Box<dyn Camera>, rate_hz: f64) -> Result<Self, TeleopError> {
        if !(rate_hz.is_finite() && rate_hz > 0.0) {
            return Err(TeleopError::FatalConfig(format!(
                "camera '{}' rate must be positive, got {rate_hz}",
                camera.id()
            )));
        }
        Ok(Self {
            bus,
            camera,
            period: Duration::from_secs_f64(1.0 / rate_hz),
        })
    }

    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> CameraStats {
        let id = self.camera.id().to_string();
        let topic = topics::camera(&id);
        let mut stats = CameraStats::default();
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(camera = %id, period_ms = self.period.as_millis() as u64, "camera driver started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.camera.capture() {
                        Ok(frame) => {
                            self.bus.publish(&topic, frame);
                            stats.published += 1;
                        }
                        Err(e) => {
                            stats.failed += 1;
                            warn!(camera = %id, error = %e, "capture failed");
                        }
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!(camera = %id, published = stats.published, failed = stats.failed, "camera driver stopped");
        stats
    }
}
