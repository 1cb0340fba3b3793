//! Fixed-rate task driving an [`Operator`].
//!
//! [`OperatorService::run`] ticks the operator on a `tokio` interval
//! ([`MissedTickBehavior::Skip`]: a slow tick never causes a burst of
//! catch-up ticks), publishes each command on `command/<robot>` and each
//! diagnostics record on `diagnostics/<robot>`, and serves
//! `control/operator/<robot>` for pause, resume and shutdown.

use teleop_middleware::{MessageBus, Request, Topic, topics};
use teleop_types::{ControlRequest, ControlResponse, TeleopError};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

use crate::operator::{Operator, OperatorDiagnostics};

/// Diagnostics topic of `robot_id`.
pub fn diagnostics_topic(robot_id: &str) -> Topic<OperatorDiagnostics> {
    Topic::new(topics::diagnostics_name(robot_id))
}

/// Counters reported when the service stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperatorStats {
    pub ticks: u64,
    pub commands: u64,
    /// Ticks that ended without a command.
    pub silent_ticks: u64,
}

pub struct OperatorService {
    bus: MessageBus,
    operator: Operator,
}

impl OperatorService {
    pub fn new(bus: MessageBus, operator: Operator) -> Self {
        Self { bus, operator }
    }

    fn handle(&mut self, request: Request<ControlRequest, ControlResponse>) -> bool {
        let robot = self.operator.robot_id().to_string();
        let mut shutdown = false;
        let response = match request.payload() {
            ControlRequest::PauseOperator { robot_id } if *robot_id == robot => match self.operator.pause() {
                Ok(()) => ControlResponse::Ok,
                Err(e) => ControlResponse::Rejected { reason: e.to_string() },
            },
            ControlRequest::ResumeOperator { robot_id } if *robot_id == robot => match self.operator.resume() {
                Ok(()) => ControlResponse::Ok,
                Err(e) => ControlResponse::Rejected { reason: e.to_string() },
            },
            ControlRequest::PauseOperator { robot_id } | ControlRequest::ResumeOperator { robot_id } => {
                ControlResponse::Rejected {
                    reason: format!("operator drives '{robot}', not '{robot_id}'"),
                }
            }
            ControlRequest::Shutdown => {
                self.operator.stop();
                shutdown = true;
                ControlResponse::Ok
            }
            other => ControlResponse::Rejected {
                reason: format!("operator does not handle {other:?}"),
            },
        };
        request.respond(response);
        shutdown
    }

    /// Run until `stop` flips to `true` or a `Shutdown` request arrives.
    ///
    /// # Errors
    ///
    /// [`TeleopError::Channel`] when another operator already serves this
    /// robot's control endpoint.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<OperatorStats, TeleopError> {
        let robot = self.operator.robot_id().to_string();
        let mut control = self.bus.serve(&topics::operator_control(&robot), 8)?;
        let commands = topics::command(&robot);
        let diagnostics = diagnostics_topic(&robot);
        let mut ticker = interval(self.operator.config().period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stats = OperatorStats::default();
        info!(
            robot = %robot,
            instance = %self.operator.instance(),
            rate_hz = self.operator.config().rate_hz,
            "operator started"
        );

        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                request = control.next() => {
                    let Some(request) = request else { break };
                    if self.handle(request) {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let report = self.operator.tick();
                    stats.ticks += 1;
                    if report.diagnostics.tick_latency_us > self.operator.config().period().as_micros() as u64 {
                        warn!(robot = %robot, latency_us = report.diagnostics.tick_latency_us, "tick overran its period");
                    }
                    match report.command {
                        Some(command) => {
                            self.bus.publish(&commands, command);
                            stats.commands += 1;
                        }
                        None => stats.silent_ticks += 1,
                    }
                    self.bus.publish(&diagnostics, report.diagnostics);
                }
            }
        }

        self.operator.stop();
        info!(robot = %robot, ticks = stats.ticks, commands = stats.commands, "operator stopped");
        Ok(stats)
    }
}
