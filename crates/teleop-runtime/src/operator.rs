//! [`Operator`] – one robot's pose-to-command control loop.
//!
//! The operator is a synchronous state machine advanced once per control
//! tick by [`Operator::tick`]; the fixed-rate timer lives in
//! [`OperatorService`][crate::service::OperatorService].  A tick never
//! blocks: it reads the latest pose, retargets, saturates and returns at
//! most one [`Command`] plus an [`OperatorDiagnostics`] record.
//!
//! ```text
//!            first valid pose        pause request
//!   Idle ───────────────────▶ Tracking ──────────▶ Paused(Requested)
//!                              ▲  │                   │ resume
//!          valid fresh pose    │  │ pose_loss_ticks   ▼
//!   Paused(PoseLoss) ◀─────────┼──┘            Paused(AwaitingPose)
//!          └───────────────────┴───────────────────────┘
//!                  any state ── shutdown ──▶ Stopped
//! ```
//!
//! Per tick while tracking:
//!
//! | Pose sample | Result |
//! |---|---|
//! | fresh, retargets | new payload through the limiter |
//! | fresh, solver fails to converge | last valid payload, `stale` |
//! | fresh, invalid | no command; counts toward pose loss |
//! | not fresh / unavailable | last payload again, `repeated`; counts toward pose loss |

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use teleop_kernel::SafetyLimiter;
use teleop_perception::PoseSource;
use teleop_retarget::{RetargetModel, retarget};
use teleop_types::{Command, CommandFlags, CommandPayload, RetargetFailure, TeleopError};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_RATE_HZ: f64 = 30.0;
pub const DEFAULT_POSE_LOSS_TIMEOUT_MS: u64 = 250;

// ────────────────────────────────────────────────────────────────────────────
// States
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Paused by a control request; poses are ignored until resumed.
    Requested,
    /// No valid fresh pose for `pose_loss_ticks` ticks.
    PoseLoss,
    /// Resumed; waiting for the next valid fresh pose.
    AwaitingPose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum OperatorState {
    Idle,
    Tracking,
    Paused(PauseReason),
    Stopped,
}

impl std::fmt::Display for OperatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatorState::Idle => write!(f, "idle"),
            OperatorState::Tracking => write!(f, "tracking"),
            OperatorState::Paused(PauseReason::Requested) => write!(f, "paused (requested)"),
            OperatorState::Paused(PauseReason::PoseLoss) => write!(f, "paused (pose loss)"),
            OperatorState::Paused(PauseReason::AwaitingPose) => write!(f, "paused (awaiting pose)"),
            OperatorState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot {action} while {state}")]
    Invalid { action: &'static str, state: OperatorState },
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration & diagnostics
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    pub rate_hz: f64,
    pub pose_loss_timeout_ms: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            rate_hz: DEFAULT_RATE_HZ,
            pose_loss_timeout_ms: DEFAULT_POSE_LOSS_TIMEOUT_MS,
        }
    }
}

impl OperatorConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }

    /// `ceil(timeout · rate)`, at least 1.
    pub fn pose_loss_ticks(&self) -> u32 {
        let ticks = (self.pose_loss_timeout_ms as f64 * self.rate_hz / 1000.0).ceil();
        (ticks as u32).max(1)
    }

    fn validate(&self) -> Result<(), TeleopError> {
        if !(self.rate_hz.is_finite() && self.rate_hz > 0.0) {
            return Err(TeleopError::FatalConfig(format!(
                "operator rate must be positive, got {}",
                self.rate_hz
            )));
        }
        Ok(())
    }
}

/// What the solver did this tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SolverStatus {
    /// No fresh pose was processed.
    NotRun,
    Converged { iterations: u32, residual: f64 },
    Limited { iterations: u32, residual: f64 },
    NonConvergence { iterations: u32, residual: f64 },
    InvalidInput { reason: String },
}

/// Published on `diagnostics/<robot>` every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorDiagnostics {
    pub robot_id: String,
    pub tick: u64,
    pub state: OperatorState,
    /// Seq of the last published command.
    pub last_seq: Option<u64>,
    /// Seq of the last pose sample consumed.
    pub pose_seq: Option<u64>,
    pub tick_latency_us: u64,
    pub solver: SolverStatus,
    pub flags: CommandFlags,
    pub confidence: f64,
}

/// Output of one [`Operator::tick`].
#[derive(Debug, Clone)]
pub struct TickReport {
    pub command: Option<Command>,
    pub diagnostics: OperatorDiagnostics,
}

// ────────────────────────────────────────────────────────────────────────────
// Operator
// ────────────────────────────────────────────────────────────────────────────

struct Published {
    payload: CommandPayload,
    flags: CommandFlags,
    confidence: f64,
    pose_seq: Option<u64>,
}

enum Sample {
    /// Nothing newer than the last consumed seq.
    Stale,
    Fresh(u64, Result<teleop_retarget::Retargeted, RetargetFailure>),
}

pub struct Operator {
    robot_id: String,
    instance: Uuid,
    model: Arc<RetargetModel>,
    limiter: SafetyLimiter,
    poses: Arc<dyn PoseSource>,
    config: OperatorConfig,
    pose_loss_ticks: u32,
    state: OperatorState,
    tick: u64,
    last_seq: Option<u64>,
    last_pose_seq: Option<u64>,
    missed: u32,
    last_published: Option<Published>,
    /// Last payload produced from a converged (or limited) solve.
    last_valid: Option<(CommandPayload, f64, Option<u64>)>,
    degraded_log: DefaultDirectRateLimiter,
}

impl Operator {
    /// # Errors
    ///
    /// [`TeleopError::FatalConfig`] for an invalid model or rate.
    pub fn new(
        model: Arc<RetargetModel>,
        poses: Arc<dyn PoseSource>,
        config: OperatorConfig,
    ) -> Result<Self, TeleopError> {
        model.validate().map_err(TeleopError::from)?;
        config.validate()?;
        let limiter = SafetyLimiter::for_model(&model);
        let instance = Uuid::new_v4();
        info!(
            robot = %model.robot_id,
            instance = %instance,
            embodiment = model.embodiment.kind(),
            rate_hz = config.rate_hz,
            "operator created"
        );
        Ok(Self {
            robot_id: model.robot_id.clone(),
            instance,
            pose_loss_ticks: config.pose_loss_ticks(),
            model,
            limiter,
            poses,
            config,
            state: OperatorState::Idle,
            tick: 0,
            last_seq: None,
            last_pose_seq: None,
            missed: 0,
            last_published: None,
            last_valid: None,
            degraded_log: RateLimiter::direct(Quota::per_second(NonZeroU32::MIN)),
        })
    }

    pub fn robot_id(&self) -> &str {
        &self.robot_id
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn state(&self) -> OperatorState {
        self.state
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub fn pose_loss_ticks(&self) -> u32 {
        self.pose_loss_ticks
    }

    pub fn pause(&mut self) -> Result<(), TransitionError> {
        match self.state {
            OperatorState::Stopped => Err(TransitionError::Invalid {
                action: "pause",
                state: self.state,
            }),
            _ => {
                self.set_state(OperatorState::Paused(PauseReason::Requested));
                Ok(())
            }
        }
    }

    pub fn resume(&mut self) -> Result<(), TransitionError> {
        match self.state {
            OperatorState::Paused(PauseReason::Requested) => {
                self.set_state(OperatorState::Paused(PauseReason::AwaitingPose));
                Ok(())
            }
            // Already waiting for a pose; resuming again is a no-op.
            OperatorState::Paused(_) | OperatorState::Tracking | OperatorState::Idle => Ok(()),
            OperatorState::Stopped => Err(TransitionError::Invalid {
                action: "resume",
                state: self.state,
            }),
        }
    }

    /// Enter the terminal state.  Later ticks produce no commands.
    pub fn stop(&mut self) {
        self.set_state(OperatorState::Stopped);
        self.last_published = None;
        self.last_valid = None;
    }

    fn set_state(&mut self, next: OperatorState) {
        if self.state != next {
            info!(robot = %self.robot_id, from = %self.state, to = %next, "operator state change");
            self.state = next;
        }
    }

    fn warn_degraded(&self, message: &str, detail: &str) {
        if self.degraded_log.check().is_ok() {
            warn!(robot = %self.robot_id, tick = self.tick, detail, "{message}");
        }
    }

    fn sample(&mut self) -> Sample {
        match self.poses.latest_pose(self.model.source) {
            Ok(pose) if self.last_pose_seq.is_none_or(|last| pose.seq > last) => {
                self.last_pose_seq = Some(pose.seq);
                Sample::Fresh(pose.seq, retarget(&self.model, &pose))
            }
            Ok(_) => Sample::Stale,
            Err(unavailable) => {
                debug!(robot = %self.robot_id, reason = %unavailable, "no pose");
                Sample::Stale
            }
        }
    }

    fn issue(&mut self, payload: CommandPayload, flags: CommandFlags, confidence: f64, pose_seq: Option<u64>) -> Command {
        let seq = self.last_seq.map_or(1, |s| s + 1);
        self.last_seq = Some(seq);
        self.last_published = Some(Published {
            payload: payload.clone(),
            flags,
            confidence,
            pose_seq,
        });
        Command {
            robot_id: self.robot_id.clone(),
            operator_instance: self.instance,
            seq,
            payload,
            flags,
            confidence,
            pose_seq,
            issued_at: Utc::now(),
        }
    }

    /// Saturate and publish a freshly retargeted payload.
    fn issue_fresh(&mut self, pose_seq: u64, out: teleop_retarget::Retargeted) -> Command {
        let dt = 1.0 / self.config.rate_hz;
        let previous = self.last_published.as_ref().map(|p| &p.payload);
        let limited = self.limiter.limit(previous, out.payload, dt);
        self.last_valid = Some((limited.payload.clone(), out.confidence, Some(pose_seq)));
        let flags = CommandFlags {
            limited: out.limited || limited.limited,
            stale: false,
            repeated: false,
        };
        self.issue(limited.payload, flags, out.confidence, Some(pose_seq))
    }

    /// Count a tick without a valid fresh pose; `true` when tracking is lost.
    fn miss(&mut self) -> bool {
        self.missed += 1;
        if self.missed >= self.pose_loss_ticks {
            self.warn_degraded("pose lost; pausing", &format!("{} ticks without a pose", self.missed));
            self.set_state(OperatorState::Paused(PauseReason::PoseLoss));
            self.missed = 0;
            return true;
        }
        false
    }

    fn tick_tracking(&mut self, sample: Sample, solver: &mut SolverStatus) -> Option<Command> {
        match sample {
            Sample::Fresh(pose_seq, Ok(out)) => {
                self.missed = 0;
                *solver = solver_status(&out);
                Some(self.issue_fresh(pose_seq, out))
            }
            Sample::Fresh(_, Err(RetargetFailure::NonConvergence { iterations, residual })) => {
                self.missed = 0;
                *solver = SolverStatus::NonConvergence { iterations, residual };
                self.warn_degraded("solver did not converge; holding last command", &format!("residual {residual:.5}"));
                let (payload, confidence, pose_seq) = self.last_valid.clone()?;
                let flags = CommandFlags {
                    stale: true,
                    ..CommandFlags::default()
                };
                Some(self.issue(payload, flags, confidence, pose_seq))
            }
            Sample::Fresh(_, Err(RetargetFailure::InvalidInput(reason))) => {
                self.warn_degraded("invalid pose sample rejected", &reason);
                *solver = SolverStatus::InvalidInput { reason };
                self.miss();
                None
            }
            Sample::Stale => {
                if self.miss() {
                    return None;
                }
                let last = self.last_published.as_ref()?;
                let (payload, confidence, pose_seq) = (last.payload.clone(), last.confidence, last.pose_seq);
                let flags = CommandFlags {
                    repeated: true,
                    ..last.flags
                };
                Some(self.issue(payload, flags, confidence, pose_seq))
            }
        }
    }

    /// Advance one control tick.
    pub fn tick(&mut self) -> TickReport {
        let started = Instant::now();
        self.tick += 1;
        let mut solver = SolverStatus::NotRun;

        let command = match self.state {
            OperatorState::Stopped => None,
            OperatorState::Paused(PauseReason::Requested) => {
                // Consume without acting so only poses after resume count.
                if let Ok(pose) = self.poses.latest_pose(self.model.source) {
                    self.last_pose_seq = Some(self.last_pose_seq.map_or(pose.seq, |s| s.max(pose.seq)));
                }
                None
            }
            OperatorState::Tracking => {
                let sample = self.sample();
                self.tick_tracking(sample, &mut solver)
            }
            OperatorState::Idle | OperatorState::Paused(_) => match self.sample() {
                Sample::Fresh(pose_seq, Ok(out)) => {
                    solver = solver_status(&out);
                    self.missed = 0;
                    self.set_state(OperatorState::Tracking);
                    Some(self.issue_fresh(pose_seq, out))
                }
                Sample::Fresh(_, Err(e)) => {
                    solver = match e {
                        RetargetFailure::NonConvergence { iterations, residual } => {
                            SolverStatus::NonConvergence { iterations, residual }
                        }
                        RetargetFailure::InvalidInput(reason) => SolverStatus::InvalidInput { reason },
                    };
                    None
                }
                Sample::Stale => None,
            },
        };

        let (flags, confidence) = command
            .as_ref()
            .map_or((CommandFlags::default(), 0.0), |c| (c.flags, c.confidence));
        let diagnostics = OperatorDiagnostics {
            robot_id: self.robot_id.clone(),
            tick: self.tick,
            state: self.state,
            last_seq: self.last_seq,
            pose_seq: self.last_pose_seq,
            tick_latency_us: u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            solver,
            flags,
            confidence,
        };
        TickReport { command, diagnostics }
    }
}

fn solver_status(out: &teleop_retarget::Retargeted) -> SolverStatus {
    if out.limited {
        SolverStatus::Limited {
            iterations: out.iterations,
            residual: out.residual,
        }
    } else {
        SolverStatus::Converged {
            iterations: out.iterations,
            residual: out.residual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teleop_perception::StaticPoseSource;
    use teleop_types::{Pose6D, TrackedPart};

    fn pose(seq: u64, t: [f64; 3]) -> Pose6D {
        Pose6D::new(TrackedPart::RightHand, seq, t, [1.0, 0.0, 0.0, 0.0])
    }

    fn operator(config: OperatorConfig) -> (Operator, Arc<StaticPoseSource>) {
        let poses = Arc::new(StaticPoseSource::new());
        let op = Operator::new(Arc::new(RetargetModel::demo_arm("arm")), poses.clone(), config).unwrap();
        (op, poses)
    }

    fn positions(cmd: &Command) -> Vec<f64> {
        match &cmd.payload {
            CommandPayload::Joints { positions, .. } => positions.clone(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn pose_loss_ticks_round_up() {
        let config = OperatorConfig::default();
        assert_eq!(config.pose_loss_ticks(), 8);
        let fast = OperatorConfig {
            rate_hz: 1.0,
            pose_loss_timeout_ms: 10,
        };
        assert_eq!(fast.pose_loss_ticks(), 1);
    }

    #[test]
    fn idle_until_first_valid_pose() {
        let (mut op, poses) = operator(OperatorConfig::default());
        assert!(op.tick().command.is_none());
        assert_eq!(op.state(), OperatorState::Idle);

        poses.set(pose(1, [0.3, 0.0, 0.3]));
        let report = op.tick();
        let cmd = report.command.unwrap();
        assert_eq!(op.state(), OperatorState::Tracking);
        assert_eq!(cmd.seq, 1);
        assert_eq!(cmd.pose_seq, Some(1));
        assert!(!cmd.flags.repeated);
        assert_eq!(report.diagnostics.last_seq, Some(1));
    }

    #[test]
    fn stale_pose_repeats_last_payload_with_increasing_seq() {
        let (mut op, poses) = operator(OperatorConfig::default());
        poses.set(pose(1, [0.3, 0.0, 0.3]));
        let first = op.tick().command.unwrap();
        let again = op.tick().command.unwrap();
        assert_eq!(again.seq, 2);
        assert!(again.flags.repeated);
        assert_eq!(again.payload, first.payload);
        assert_eq!(again.pose_seq, first.pose_seq);
    }

    #[test]
    fn seqs_are_strictly_increasing_across_mixed_ticks() {
        let (mut op, poses) = operator(OperatorConfig::default());
        let mut seqs = Vec::new();
        for t in 0..40u64 {
            if t % 3 == 0 {
                poses.set(pose(t + 1, [0.3, 0.01 * t as f64, 0.3]));
            }
            if let Some(cmd) = op.tick().command {
                seqs.push(cmd.seq);
            }
        }
        assert!(!seqs.is_empty());
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn pose_loss_pauses_once_and_fresh_pose_resumes() {
        let (mut op, poses) = operator(OperatorConfig {
            rate_hz: 30.0,
            pose_loss_timeout_ms: 100,
        });
        assert_eq!(op.pose_loss_ticks(), 3);
        poses.set(pose(1, [0.3, 0.0, 0.3]));
        op.tick();

        let repeated: Vec<_> = (0..2).filter_map(|_| op.tick().command).collect();
        assert_eq!(repeated.len(), 2);
        assert!(op.tick().command.is_none());
        assert_eq!(op.state(), OperatorState::Paused(PauseReason::PoseLoss));
        for _ in 0..5 {
            assert!(op.tick().command.is_none());
            assert_eq!(op.state(), OperatorState::Paused(PauseReason::PoseLoss));
        }

        poses.set(pose(2, [0.3, 0.0, 0.3]));
        let cmd = op.tick().command.unwrap();
        assert_eq!(op.state(), OperatorState::Tracking);
        assert_eq!(cmd.seq, 4);
    }

    #[test]
    fn requested_pause_ignores_poses_until_resume() {
        let (mut op, poses) = operator(OperatorConfig::default());
        poses.set(pose(1, [0.3, 0.0, 0.3]));
        op.tick();
        op.pause().unwrap();

        poses.set(pose(2, [0.3, 0.1, 0.3]));
        assert!(op.tick().command.is_none());
        assert_eq!(op.state(), OperatorState::Paused(PauseReason::Requested));

        op.resume().unwrap();
        assert_eq!(op.state(), OperatorState::Paused(PauseReason::AwaitingPose));
        // Pose 2 arrived while paused; it does not resume tracking.
        assert!(op.tick().command.is_none());

        poses.set(pose(3, [0.3, 0.1, 0.3]));
        assert!(op.tick().command.is_some());
        assert_eq!(op.state(), OperatorState::Tracking);
    }

    #[test]
    fn invalid_pose_produces_no_command() {
        let (mut op, poses) = operator(OperatorConfig::default());
        poses.set(pose(1, [0.3, 0.0, 0.3]));
        op.tick();
        poses.set(pose(2, [f64::NAN, 0.0, 0.3]));
        let report = op.tick();
        assert!(report.command.is_none());
        assert!(matches!(report.diagnostics.solver, SolverStatus::InvalidInput { .. }));
        assert_eq!(op.state(), OperatorState::Tracking);
    }

    #[test]
    fn non_convergence_holds_last_valid_payload_as_stale() {
        let poses = Arc::new(StaticPoseSource::new());
        let mut model = RetargetModel::demo_hand("hand");
        model.source = TrackedPart::RightHand;
        let mut op = Operator::new(Arc::new(model.clone()), poses.clone(), OperatorConfig::default()).unwrap();

        // Fingertips straight out: reachable.
        let teleop_retarget::Embodiment::Hand(chain) = &model.embodiment else {
            unreachable!()
        };
        let mut keypoints = vec![[0.0; 3]; 24];
        for finger in &chain.fingers {
            keypoints[finger.tip_keypoint] =
                teleop_retarget::hand::forward(finger, [0.0, 0.4, 0.4]).to_array();
        }
        poses.set(pose(1, [0.0; 3]).with_keypoints(keypoints.clone()));
        let first = op.tick().command.unwrap();
        assert!(!first.flags.stale);

        // Same operator, a model whose solver cannot finish in one iteration.
        let mut strict = model.clone();
        strict.solver.max_iterations = 1;
        strict.solver.tolerance = Some(1e-12);
        op.model = Arc::new(strict);
        for finger in &chain.fingers {
            keypoints[finger.tip_keypoint] =
                teleop_retarget::hand::forward(finger, [0.3, 1.2, 1.0]).to_array();
        }
        poses.set(pose(2, [0.0; 3]).with_keypoints(keypoints));
        let report = op.tick();
        let held = report.command.unwrap();
        assert!(held.flags.stale);
        assert_eq!(held.payload, first.payload);
        assert!(matches!(report.diagnostics.solver, SolverStatus::NonConvergence { .. }));
    }

    #[test]
    fn large_pose_jumps_are_rate_limited() {
        let (mut op, poses) = operator(OperatorConfig::default());
        poses.set(pose(1, [0.3, 0.0, 0.3]));
        let a = positions(&op.tick().command.unwrap());
        poses.set(pose(2, [-0.3, 0.0, 0.3]));
        let cmd = op.tick().command.unwrap();
        assert!(cmd.flags.limited);
        let b = positions(&cmd);
        // Base yaw swings by π; the limiter allows 3 rad/s · 1/30 s.
        assert!((b[0] - a[0]).abs() <= 0.1 + 1e-9);
    }

    #[test]
    fn end_effector_jumps_are_clamped_per_tick() {
        let poses = Arc::new(StaticPoseSource::new());
        let model = RetargetModel::demo_cartesian("ee");
        let max_step = model.safety.max_translation_step;
        let mut op = Operator::new(Arc::new(model), poses.clone(), OperatorConfig::default()).unwrap();
        let translation = |cmd: &Command| match &cmd.payload {
            CommandPayload::EndEffector { translation, .. } => *translation,
            other => panic!("unexpected {other:?}"),
        };

        poses.set(pose(1, [0.3, 0.0, 0.3]));
        let first = op.tick().command.unwrap();
        assert!(!first.flags.limited);
        assert_eq!(translation(&first), [0.3, 0.0, 0.3]);

        poses.set(pose(2, [0.6, 0.0, 0.3]));
        let report = op.tick();
        let cmd = report.command.unwrap();
        assert!(cmd.flags.limited);
        assert!(matches!(report.diagnostics.solver, SolverStatus::Converged { .. }));
        let t = translation(&cmd);
        assert!((t[0] - (0.3 + max_step)).abs() < 1e-12, "{t:?}");
        assert_eq!((t[1], t[2]), (0.0, 0.3));

        // Converges on the new target over the following ticks.
        poses.set(pose(3, [0.6, 0.0, 0.3]));
        let next = op.tick().command.unwrap();
        assert!((translation(&next)[0] - (0.3 + 2.0 * max_step)).abs() < 1e-12);
    }

    #[test]
    fn stopped_is_terminal() {
        let (mut op, poses) = operator(OperatorConfig::default());
        poses.set(pose(1, [0.3, 0.0, 0.3]));
        op.tick();
        op.stop();
        poses.set(pose(2, [0.3, 0.0, 0.3]));
        assert!(op.tick().command.is_none());
        assert!(op.pause().is_err());
        assert!(op.resume().is_err());
        assert_eq!(op.state(), OperatorState::Stopped);
    }

    #[test]
    fn zero_rate_is_fatal() {
        let poses = Arc::new(StaticPoseSource::new());
        let err = Operator::new(
            Arc::new(RetargetModel::demo_arm("arm")),
            poses,
            OperatorConfig {
                rate_hz: 0.0,
                pose_loss_timeout_ms: 250,
            },
        )
        .err()
        .unwrap();
        assert!(err.is_fatal());
    }
}
