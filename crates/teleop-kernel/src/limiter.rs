//! [`SafetyLimiter`] – per-tick command saturation.
//!
//! Every candidate payload passes through [`SafetyLimiter::limit`] before it
//! is published.  Each registered [`LimitRule`] is applied in order and may
//! pull the payload back toward the previously published one.  Rules
//! saturate; they never reject, so the operator always has something safe to
//! send.
//!
//! Built-in rules:
//!
//! | Rule | Bound |
//! |---|---|
//! | [`JointRangeRule`] | absolute joint range `[min, max]` |
//! | [`JointStepRule`] | per-joint `min(max_velocity · dt, max_joint_step)` |
//! | [`TranslationStepRule`] | end-effector translation delta |
//! | [`GripperStepRule`] | gripper aperture delta |

use teleop_retarget::RetargetModel;
use teleop_types::CommandPayload;
use tracing::trace;

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single displacement bound.
///
/// `previous` is the last payload actually published, or `None` on the first
/// tick. Return `true` when `proposed` was modified.
pub trait LimitRule: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, previous: Option<&CommandPayload>, proposed: &mut CommandPayload, dt: f64) -> bool;
}

fn clamp_toward(prev: f64, next: f64, max_delta: f64) -> (f64, bool) {
    let delta = next - prev;
    if delta.abs() > max_delta {
        (prev + max_delta.copysign(delta), true)
    } else {
        (next, false)
    }
}

fn gripper_mut(payload: &mut CommandPayload) -> &mut Option<f64> {
    match payload {
        CommandPayload::Joints { gripper, .. } | CommandPayload::EndEffector { gripper, .. } => gripper,
    }
}

fn gripper(payload: &CommandPayload) -> Option<f64> {
    match payload {
        CommandPayload::Joints { gripper, .. } | CommandPayload::EndEffector { gripper, .. } => *gripper,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Clamps joint targets into their absolute range.
pub struct JointRangeRule {
    pub ranges: Vec<(f64, f64)>,
}

impl LimitRule for JointRangeRule {
    fn name(&self) -> &str {
        "joint_range"
    }

    fn apply(&self, _previous: Option<&CommandPayload>, proposed: &mut CommandPayload, _dt: f64) -> bool {
        let CommandPayload::Joints { positions, .. } = proposed else {
            return false;
        };
        let mut limited = false;
        for (q, (min, max)) in positions.iter_mut().zip(&self.ranges) {
            let clamped = q.clamp(*min, *max);
            if clamped != *q {
                *q = clamped;
                limited = true;
            }
        }
        limited
    }
}

/// Caps each joint's displacement per tick.
pub struct JointStepRule {
    /// Per-joint velocity limit (rad/s).
    pub max_velocity: Vec<f64>,
    /// Absolute per-tick cap (rad) regardless of `dt`.
    pub max_joint_step: f64,
}

impl JointStepRule {
    pub fn max_delta(&self, joint: usize, dt: f64) -> f64 {
        let by_velocity = self.max_velocity.get(joint).copied().unwrap_or(f64::INFINITY) * dt;
        by_velocity.min(self.max_joint_step)
    }
}

impl LimitRule for JointStepRule {
    fn name(&self) -> &str {
        "joint_step"
    }

    fn apply(&self, previous: Option<&CommandPayload>, proposed: &mut CommandPayload, dt: f64) -> bool {
        let (
            Some(CommandPayload::Joints { positions: prev, .. }),
            CommandPayload::Joints { positions: next, .. },
        ) = (previous, proposed)
        else {
            return false;
        };
        if prev.len() != next.len() {
            return false;
        }
        let mut limited = false;
        for (i, (q, p)) in next.iter_mut().zip(prev).enumerate() {
            let (v, hit) = clamp_toward(*p, *q, self.max_delta(i, dt));
            *q = v;
            limited |= hit;
        }
        limited
    }
}

/// Caps end-effector translation per tick, preserving direction.
pub struct TranslationStepRule {
    pub max_step: f64,
}

impl LimitRule for TranslationStepRule {
    fn name(&self) -> &str {
        "translation_step"
    }

    fn apply(&self, previous: Option<&CommandPayload>, proposed: &mut CommandPayload, _dt: f64) -> bool {
        let (
            Some(CommandPayload::EndEffector { translation: prev, .. }),
            CommandPayload::EndEffector { translation: next, .. },
        ) = (previous, proposed)
        else {
            return false;
        };
        let delta = [next[0] - prev[0], next[1] - prev[1], next[2] - prev[2]];
        let norm = delta.iter().map(|d| d * d).sum::<f64>().sqrt();
        if norm <= self.max_step {
            return false;
        }
        let scale = self.max_step / norm;
        for axis in 0..3 {
            next[axis] = prev[axis] + delta[axis] * scale;
        }
        true
    }
}

/// Caps gripper aperture change per tick.
pub struct GripperStepRule {
    pub max_step: f64,
}

impl LimitRule for GripperStepRule {
    fn name(&self) -> &str {
        "gripper_step"
    }

    fn apply(&self, previous: Option<&CommandPayload>, proposed: &mut CommandPayload, _dt: f64) -> bool {
        let Some(prev) = previous.and_then(gripper) else {
            return false;
        };
        let slot = gripper_mut(proposed);
        let Some(next) = *slot else {
            return false;
        };
        let (v, hit) = clamp_toward(prev, next, self.max_step);
        *slot = Some(v);
        hit
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SafetyLimiter
// ────────────────────────────────────────────────────────────────────────────

/// Result of [`SafetyLimiter::limit`].
#[derive(Debug, Clone, PartialEq)]
pub struct LimitOutcome {
    pub payload: CommandPayload,
    pub limited: bool,
    /// Names of the rules that modified the payload, in application order.
    pub fired: Vec<String>,
}

/// Ordered chain of [`LimitRule`]s.
///
/// # Example
///
/// ```
/// use teleop_kernel::limiter::{GripperStepRule, SafetyLimiter};
/// use teleop_types::CommandPayload;
///
/// let mut limiter = SafetyLimiter::new();
/// limiter.add_rule(Box::new(GripperStepRule { max_step: 0.1 }));
///
/// let prev = CommandPayload::Joints { positions: vec![], gripper: Some(0.0) };
/// let next = CommandPayload::Joints { positions: vec![], gripper: Some(1.0) };
/// let out = limiter.limit(Some(&prev), next, 0.033);
/// assert!(out.limited);
/// assert_eq!(out.payload, CommandPayload::Joints { positions: vec![], gripper: Some(0.1) });
/// ```
#[derive(Default)]
pub struct SafetyLimiter {
    rules: Vec<Box<dyn LimitRule>>,
}

impl SafetyLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard rule chain for `model`: joint range, joint step,
    /// translation step, gripper step.
    pub fn for_model(model: &RetargetModel) -> Self {
        let mut limiter = Self::new();
        limiter.add_rule(Box::new(JointRangeRule {
            ranges: model.joints.iter().map(|j| (j.min, j.max)).collect(),
        }));
        limiter.add_rule(Box::new(JointStepRule {
            max_velocity: model.joints.iter().map(|j| j.max_velocity).collect(),
            max_joint_step: model.safety.max_joint_step,
        }));
        limiter.add_rule(Box::new(TranslationStepRule {
            max_step: model.safety.max_translation_step,
        }));
        limiter.add_rule(Box::new(GripperStepRule {
            max_step: model.safety.max_gripper_step,
        }));
        limiter
    }

    /// Register a rule. Rules run in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn LimitRule>) {
        self.rules.push(rule);
    }

    /// Saturate `proposed` against `previous` for a tick of `dt` seconds.
    pub fn limit(&self, previous: Option<&CommandPayload>, mut proposed: CommandPayload, dt: f64) -> LimitOutcome {
        let mut fired = Vec::new();
        for rule in &self.rules {
            if rule.apply(previous, &mut proposed, dt) {
                trace!(rule = rule.name(), "limit rule fired");
                fired.push(rule.name().to_string());
            }
        }
        LimitOutcome {
            payload: proposed,
            limited: !fired.is_empty(),
            fired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joints(q: &[f64]) -> CommandPayload {
        CommandPayload::Joints {
            positions: q.to_vec(),
            gripper: None,
        }
    }

    fn positions(p: &CommandPayload) -> Vec<f64> {
        match p {
            CommandPayload::Joints { positions, .. } => positions.clone(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn first_command_only_checks_range() {
        let limiter = SafetyLimiter::for_model(&RetargetModel::demo_arm("arm"));
        let out = limiter.limit(None, joints(&[0.0, 5.0, 0.0]), 1.0 / 30.0);
        assert!(out.limited);
        assert_eq!(out.fired, vec!["joint_range".to_string()]);
        assert_eq!(positions(&out.payload)[1], 2.2);
    }

    #[test]
    fn joint_step_uses_tighter_of_velocity_and_step() {
        let rule = JointStepRule {
            max_velocity: vec![3.0, 30.0],
            max_joint_step: 0.25,
        };
        let dt = 1.0 / 30.0;
        assert!((rule.max_delta(0, dt) - 0.1).abs() < 1e-12);
        assert_eq!(rule.max_delta(1, dt), 0.25);

        let mut next = joints(&[1.0, -1.0]);
        assert!(rule.apply(Some(&joints(&[0.0, 0.0])), &mut next, dt));
        let q = positions(&next);
        assert!((q[0] - 0.1).abs() < 1e-12);
        assert!((q[1] + 0.25).abs() < 1e-12);
    }

    #[test]
    fn small_moves_pass_unchanged() {
        let limiter = SafetyLimiter::for_model(&RetargetModel::demo_arm("arm"));
        let prev = joints(&[0.1, 0.2, 0.3]);
        let out = limiter.limit(Some(&prev), joints(&[0.11, 0.21, 0.29]), 1.0 / 30.0);
        assert!(!out.limited);
        assert!(out.fired.is_empty());
        assert_eq!(out.payload, joints(&[0.11, 0.21, 0.29]));
    }

    #[test]
    fn translation_step_preserves_direction() {
        let rule = TranslationStepRule { max_step: 0.05 };
        let prev = CommandPayload::EndEffector {
            translation: [0.0, 0.0, 0.0],
            rotation: [1.0, 0.0, 0.0, 0.0],
            gripper: None,
        };
        let mut next = CommandPayload::EndEffector {
            translation: [0.3, 0.4, 0.0],
            rotation: [1.0, 0.0, 0.0, 0.0],
            gripper: None,
        };
        assert!(rule.apply(Some(&prev), &mut next, 0.033));
        let CommandPayload::EndEffector { translation, .. } = next else {
            unreachable!()
        };
        assert!((translation[0] - 0.03).abs() < 1e-12);
        assert!((translation[1] - 0.04).abs() < 1e-12);
    }

    #[test]
    fn joint_count_change_skips_step_rule() {
        let rule = JointStepRule {
            max_velocity: vec![1.0; 3],
            max_joint_step: 0.1,
        };
        let mut next = joints(&[1.0, 1.0, 1.0]);
        assert!(!rule.apply(Some(&joints(&[0.0, 0.0])), &mut next, 0.033));
    }

    #[test]
    fn limited_output_is_within_every_bound() {
        let model = RetargetModel::demo_hand("hand");
        let limiter = SafetyLimiter::for_model(&model);
        let dt = 1.0 / 30.0;
        let prev = joints(&vec![0.0; model.joints.len()]);
        let out = limiter.limit(Some(&prev), joints(&vec![10.0; model.joints.len()]), dt);
        for (q, j) in positions(&out.payload).iter().zip(&model.joints) {
            assert!(*q <= j.max);
            assert!(q.abs() <= (j.max_velocity * dt).min(model.safety.max_joint_step) + 1e-12);
        }
    }
}
