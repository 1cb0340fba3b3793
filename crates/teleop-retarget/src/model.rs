//! Per-robot retargeting model.
//!
//! A [`RetargetModel`] is loaded once when an operator starts and is
//! read-only afterwards.  It is normally a TOML file:
//!
//! ```toml
//! robot_id = "arm"
//! source = "right_hand"
//!
//! [embodiment]
//! kind = "arm"
//! base_height = 0.10
//! upper_arm = 0.30
//! forearm = 0.25
//! elbow_up = true
//!
//! [[joints]]
//! name = "base_yaw"
//! min = -3.14
//! max = 3.14
//! max_velocity = 2.0
//! # ...one entry per joint
//! ```
//!
//! A task-space robot uses `kind = "cartesian"` with a `workspace_min` /
//! `workspace_max` box instead of link lengths; its `joints` only describe
//! the robot and may have any length.
//!
//! [`RetargetModel::validate`] rejects anything the solvers cannot work
//! with; every such failure is fatal at startup.

use std::path::Path;

use serde::{Deserialize, Serialize};
use teleop_types::{TeleopError, TrackedPart};
use thiserror::Error;

use teleop_perception::transform::{Quaternion, Transform3D, Vec3};

/// Default analytic arm tolerance (metres, FK check).
pub const ARM_TOLERANCE: f64 = 1e-4;
/// Default iterative hand solver tolerance (metres).
pub const HAND_TOLERANCE: f64 = 1e-3;
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;
pub const DEFAULT_DAMPING: f64 = 0.05;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("cannot read model {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse model: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid model '{robot_id}': {reason}")]
    Invalid { robot_id: String, reason: String },
}

impl From<ModelError> for TeleopError {
    fn from(err: ModelError) -> Self {
        TeleopError::FatalConfig(err.to_string())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Model types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointLimit {
    pub name: String,
    /// Radians.
    pub min: f64,
    /// Radians.
    pub max: f64,
    /// Radians per second.
    pub max_velocity: f64,
}

impl JointLimit {
    pub fn clamp(&self, q: f64) -> f64 {
        q.clamp(self.min, self.max)
    }

    pub fn midpoint(&self) -> f64 {
        0.5 * (self.min + self.max)
    }
}

/// Three-joint arm: base yaw, shoulder pitch, elbow pitch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmChain {
    /// Height of the shoulder axis above the base origin.
    pub base_height: f64,
    pub upper_arm: f64,
    pub forearm: f64,
    /// Pick the elbow-above-the-wrist solution.
    #[serde(default = "default_true")]
    pub elbow_up: bool,
    /// Map thumb–index pinch distance onto a gripper aperture.
    #[serde(default)]
    pub gripper: Option<GripperMapping>,
}

impl ArmChain {
    pub fn reach(&self) -> f64 {
        self.upper_arm + self.forearm
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GripperMapping {
    pub thumb_tip: usize,
    pub index_tip: usize,
    /// Pinch distance (m) at which the gripper is fully open.
    pub open_distance: f64,
    /// Pinch distance (m) at which the gripper is fully closed.
    pub closed_distance: f64,
}

impl GripperMapping {
    fn is_valid(&self) -> bool {
        self.open_distance.is_finite()
            && self.closed_distance.is_finite()
            && self.open_distance > self.closed_distance
    }

    /// Aperture in `[0, 1]` for a pinch distance.
    pub fn aperture(&self, distance: f64) -> f64 {
        ((distance - self.closed_distance) / (self.open_distance - self.closed_distance))
            .clamp(0.0, 1.0)
    }
}

/// One robot finger: abduction, proximal flexion, distal flexion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerChain {
    pub name: String,
    /// Finger base in the calibrated hand frame.
    pub base: [f64; 3],
    pub links: [f64; 2],
    /// Index of the human fingertip keypoint this finger tracks.
    pub tip_keypoint: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandChain {
    pub fingers: Vec<FingerChain>,
}

/// End effector driven in task space; the robot's own controller solves
/// its joints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartesianChain {
    /// Lower corner of the reachable box in the robot base frame (m).
    pub workspace_min: [f64; 3],
    /// Upper corner of the reachable box in the robot base frame (m).
    pub workspace_max: [f64; 3],
    #[serde(default)]
    pub gripper: Option<GripperMapping>,
}

impl CartesianChain {
    pub fn contains(&self, p: [f64; 3]) -> bool {
        (0..3).all(|axis| p[axis] >= self.workspace_min[axis] && p[axis] <= self.workspace_max[axis])
    }

    /// Nearest point of the workspace box.
    pub fn clamp(&self, p: Vec3) -> Vec3 {
        Vec3::new(
            p.x.clamp(self.workspace_min[0], self.workspace_max[0]),
            p.y.clamp(self.workspace_min[1], self.workspace_max[1]),
            p.z.clamp(self.workspace_min[2], self.workspace_max[2]),
        )
    }
}

/// Kinematic structure of a robot. Every variant has its own solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Embodiment {
    Arm(ArmChain),
    Hand(HandChain),
    Cartesian(CartesianChain),
}

impl Embodiment {
    /// Joints the solver produces; `None` when the embodiment emits
    /// task-space targets.
    pub fn joint_count(&self) -> Option<usize> {
        match self {
            Embodiment::Arm(_) => Some(3),
            Embodiment::Hand(h) => Some(3 * h.fingers.len()),
            Embodiment::Cartesian(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Embodiment::Arm(_) => "arm",
            Embodiment::Hand(_) => "hand",
            Embodiment::Cartesian(_) => "cartesian",
        }
    }
}

/// Maps VR-space poses into the robot base frame: `p' = offset(scale · p)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    #[serde(default)]
    pub translation_offset: [f64; 3],
    #[serde(default = "identity_rotation")]
    pub rotation_offset: [f64; 4],
    #[serde(default = "default_scale")]
    pub scale: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            translation_offset: [0.0; 3],
            rotation_offset: identity_rotation(),
            scale: default_scale(),
        }
    }
}

impl Calibration {
    pub fn transform(&self) -> Transform3D {
        Transform3D::new(
            Vec3::from(self.translation_offset),
            Quaternion::from_array(self.rotation_offset)
                .normalized()
                .unwrap_or_else(Quaternion::identity),
        )
    }

    pub fn apply(&self, point: Vec3) -> Vec3 {
        self.transform().apply(point * self.scale)
    }

    /// Orientation of a VR-space rotation in the robot base frame.
    pub fn apply_rotation(&self, rotation: Quaternion) -> Quaternion {
        let q = self.transform().rotation.mul(rotation);
        q.normalized().unwrap_or(q)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    /// Residual (m) below which a solution is accepted. Defaults per
    /// embodiment: [`ARM_TOLERANCE`] or [`HAND_TOLERANCE`].
    #[serde(default)]
    pub tolerance: Option<f64>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_damping")]
    pub damping: f64,
    /// Joint-space step (rad) below which the iterative solver is considered
    /// settled.
    #[serde(default = "default_stationary_step")]
    pub stationary_step: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            tolerance: None,
            max_iterations: default_max_iterations(),
            damping: default_damping(),
            stationary_step: default_stationary_step(),
        }
    }
}

/// Per-tick displacement caps enforced by the safety limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Radians per tick, applied on top of `max_velocity · dt`.
    #[serde(default = "default_max_joint_step")]
    pub max_joint_step: f64,
    /// Metres per tick for end-effector targets.
    #[serde(default = "default_max_translation_step")]
    pub max_translation_step: f64,
    /// Aperture units per tick.
    #[serde(default = "default_max_gripper_step")]
    pub max_gripper_step: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_joint_step: default_max_joint_step(),
            max_translation_step: default_max_translation_step(),
            max_gripper_step: default_max_gripper_step(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetargetModel {
    pub robot_id: String,
    /// Tracked part driving this robot.
    #[serde(default = "default_source")]
    pub source: TrackedPart,
    pub embodiment: Embodiment,
    pub joints: Vec<JointLimit>,
    #[serde(default)]
    pub calibration: Calibration,
    #[serde(default)]
    pub solver: SolverSettings,
    #[serde(default)]
    pub safety: SafetyLimits,
}

fn default_true() -> bool {
    true
}
fn identity_rotation() -> [f64; 4] {
    [1.0, 0.0, 0.0, 0.0]
}
fn default_scale() -> f64 {
    1.0
}
fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}
fn default_damping() -> f64 {
    DEFAULT_DAMPING
}
fn default_stationary_step() -> f64 {
    1e-7
}
fn default_max_joint_step() -> f64 {
    0.25
}
fn default_max_translation_step() -> f64 {
    0.05
}
fn default_max_gripper_step() -> f64 {
    0.25
}
fn default_source() -> TrackedPart {
    TrackedPart::RightHand
}

// ────────────────────────────────────────────────────────────────────────────
// Loading and validation
// ────────────────────────────────────────────────────────────────────────────

impl RetargetModel {
    /// Load and validate a model from a TOML file.
    ///
    /// # Errors
    ///
    /// Any [`ModelError`]; all of them are fatal configuration errors.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ModelError> {
        let model: RetargetModel = toml::from_str(text)?;
        model.validate()?;
        Ok(model)
    }

    pub fn tolerance(&self) -> f64 {
        self.solver.tolerance.unwrap_or(match self.embodiment {
            Embodiment::Arm(_) | Embodiment::Cartesian(_) => ARM_TOLERANCE,
            Embodiment::Hand(_) => HAND_TOLERANCE,
        })
    }

    /// Check every structural constraint the solvers rely on.
    pub fn validate(&self) -> Result<(), ModelError> {
        let invalid = |reason: String| ModelError::Invalid {
            robot_id: self.robot_id.clone(),
            reason,
        };

        if self.robot_id.trim().is_empty() {
            return Err(invalid("robot_id is empty".into()));
        }
        if self.joints.is_empty() {
            return Err(invalid("no joints defined".into()));
        }
        for j in &self.joints {
            if !(j.min.is_finite() && j.max.is_finite()) || j.min > j.max {
                return Err(invalid(format!("joint '{}' has min > max or non-finite bounds", j.name)));
            }
            if !(j.max_velocity.is_finite() && j.max_velocity > 0.0) {
                return Err(invalid(format!("joint '{}' needs a positive max_velocity", j.name)));
            }
        }
        if let Some(expected) = self.embodiment.joint_count()
            && self.joints.len() != expected
        {
            return Err(invalid(format!(
                "{} embodiment needs {expected} joints, {} defined",
                self.embodiment.kind(),
                self.joints.len()
            )));
        }

        match &self.embodiment {
            Embodiment::Arm(arm) => {
                if !(positive(arm.upper_arm) && positive(arm.forearm)) {
                    return Err(invalid("arm link lengths must be positive".into()));
                }
                if !arm.base_height.is_finite() {
                    return Err(invalid("base_height must be finite".into()));
                }
                if arm.gripper.as_ref().is_some_and(|g| !g.is_valid()) {
                    return Err(invalid("gripper open_distance must exceed closed_distance".into()));
                }
            }
            Embodiment::Hand(hand) => {
                if hand.fingers.is_empty() {
                    return Err(invalid("hand has no fingers".into()));
                }
                for f in &hand.fingers {
                    if !f.links.iter().all(|l| positive(*l)) {
                        return Err(invalid(format!("finger '{}' link lengths must be positive", f.name)));
                    }
                    if !f.base.iter().all(|v| v.is_finite()) {
                        return Err(invalid(format!("finger '{}' base must be finite", f.name)));
                    }
                }
            }
            Embodiment::Cartesian(ee) => {
                let ordered = (0..3).all(|axis| {
                    let (lo, hi) = (ee.workspace_min[axis], ee.workspace_max[axis]);
                    lo.is_finite() && hi.is_finite() && lo <= hi
                });
                if !ordered {
                    return Err(invalid("workspace_min must not exceed workspace_max".into()));
                }
                if ee.gripper.as_ref().is_some_and(|g| !g.is_valid()) {
                    return Err(invalid("gripper open_distance must exceed closed_distance".into()));
                }
            }
        }

        if !positive(self.tolerance()) {
            return Err(invalid("solver tolerance must be positive".into()));
        }
        if self.solver.max_iterations == 0 {
            return Err(invalid("solver max_iterations must be at least 1".into()));
        }
        if !(self.solver.damping.is_finite() && self.solver.damping >= 0.0) {
            return Err(invalid("solver damping must be non-negative".into()));
        }
        if !positive(self.calibration.scale) {
            return Err(invalid("calibration scale must be positive".into()));
        }
        if Quaternion::from_array(self.calibration.rotation_offset)
            .normalized()
            .is_none()
        {
            return Err(invalid("calibration rotation_offset is degenerate".into()));
        }
        let s = &self.safety;
        if !(positive(s.max_joint_step) && positive(s.max_translation_step) && positive(s.max_gripper_step)) {
            return Err(invalid("safety step limits must be positive".into()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Built-in models
    // -----------------------------------------------------------------------

    /// Demo three-joint arm following the right wrist, with pinch gripper.
    pub fn demo_arm(robot_id: impl Into<String>) -> Self {
        let joint = |name: &str, min: f64, max: f64| JointLimit {
            name: name.to_string(),
            min,
            max,
            max_velocity: 3.0,
        };
        Self {
            robot_id: robot_id.into(),
            source: TrackedPart::RightHand,
            embodiment: Embodiment::Arm(ArmChain {
                base_height: 0.10,
                upper_arm: 0.30,
                forearm: 0.25,
                elbow_up: true,
                gripper: Some(GripperMapping {
                    thumb_tip: 19,
                    index_tip: 20,
                    open_distance: 0.10,
                    closed_distance: 0.02,
                }),
            }),
            joints: vec![
                joint("base_yaw", -std::f64::consts::PI, std::f64::consts::PI),
                joint("shoulder_pitch", -1.6, 2.2),
                joint("elbow_pitch", -2.6, 2.6),
            ],
            calibration: Calibration::default(),
            solver: SolverSettings::default(),
            safety: SafetyLimits::default(),
        }
    }

    /// Demo task-space arm: the right wrist pose is sent as an end-effector
    /// target inside a box in front of the robot.
    pub fn demo_cartesian(robot_id: impl Into<String>) -> Self {
        let joints = ["j1", "j2", "j3", "j4", "j5", "j6"]
            .into_iter()
            .map(|name| JointLimit {
                name: name.to_string(),
                min: -std::f64::consts::PI,
                max: std::f64::consts::PI,
                max_velocity: 2.0,
            })
            .collect();
        Self {
            robot_id: robot_id.into(),
            source: TrackedPart::RightHand,
            embodiment: Embodiment::Cartesian(CartesianChain {
                workspace_min: [0.15, -0.40, 0.05],
                workspace_max: [0.65, 0.40, 0.60],
                gripper: Some(GripperMapping {
                    thumb_tip: 19,
                    index_tip: 20,
                    open_distance: 0.10,
                    closed_distance: 0.02,
                }),
            }),
            joints,
            calibration: Calibration::default(),
            solver: SolverSettings::default(),
            safety: SafetyLimits::default(),
        }
    }

    /// Demo four-finger hand (index, middle, ring, thumb) tracking the
    /// Oculus fingertip keypoints.
    pub fn demo_hand(robot_id: impl Into<String>) -> Self {
        let finger = |name: &str, base: [f64; 3], tip: usize| FingerChain {
            name: name.to_string(),
            base,
            links: [0.045, 0.035],
            tip_keypoint: tip,
        };
        let fingers = vec![
            finger("index", [-0.025, 0.09, 0.0], 20),
            finger("middle", [0.0, 0.095, 0.0], 21),
            finger("ring", [0.025, 0.09, 0.0], 22),
            finger("thumb", [-0.04, 0.03, 0.0], 19),
        ];
        let mut joints = Vec::new();
        for f in &fingers {
            for (suffix, min, max) in [("abd", -0.4, 0.4), ("mcp", -0.2, 1.6), ("pip", 0.0, 1.8)] {
                joints.push(JointLimit {
                    name: format!("{}_{suffix}", f.name),
                    min,
                    max,
                    max_velocity: 6.0,
                });
            }
        }
        Self {
            robot_id: robot_id.into(),
            source: TrackedPart::RightHand,
            embodiment: Embodiment::Hand(HandChain { fingers }),
            joints,
            calibration: Calibration::default(),
            solver: SolverSettings::default(),
            safety: SafetyLimits {
                max_joint_step: 0.5,
                ..SafetyLimits::default()
            },
        }
    }
}

fn positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARM_TOML: &str = r#"
robot_id = "arm"
source = "right_hand"

[embodiment]
kind = "arm"
base_height = 0.1
upper_arm = 0.3
forearm = 0.25

[[joints]]
name = "base_yaw"
min = -3.14
max = 3.14
max_velocity = 2.0

[[joints]]
name = "shoulder_pitch"
min = -1.5
max = 2.0
max_velocity = 2.0

[[joints]]
name = "elbow_pitch"
min = -2.5
max = 2.5
max_velocity = 2.0

[solver]
max_iterations = 50
"#;

    #[test]
    fn parses_arm_model_with_defaults() {
        let model = RetargetModel::from_toml_str(ARM_TOML).unwrap();
        assert_eq!(model.robot_id, "arm");
        assert_eq!(model.joints.len(), 3);
        assert_eq!(model.solver.max_iterations, 50);
        assert_eq!(model.solver.damping, DEFAULT_DAMPING);
        assert_eq!(model.tolerance(), ARM_TOLERANCE);
        assert_eq!(model.calibration, Calibration::default());
        match &model.embodiment {
            Embodiment::Arm(arm) => {
                assert!(arm.elbow_up);
                assert!(arm.gripper.is_none());
            }
            other => panic!("unexpected embodiment {other:?}"),
        }
    }

    #[test]
    fn hand_default_tolerance_is_looser() {
        assert_eq!(RetargetModel::demo_hand("hand").tolerance(), HAND_TOLERANCE);
    }

    #[test]
    fn builtin_models_validate() {
        RetargetModel::demo_arm("arm").validate().unwrap();
        RetargetModel::demo_hand("hand").validate().unwrap();
        RetargetModel::demo_cartesian("ee").validate().unwrap();
    }

    #[test]
    fn cartesian_model_parses_with_any_joint_count() {
        let text = r#"
robot_id = "ee"

[embodiment]
kind = "cartesian"
workspace_min = [0.1, -0.3, 0.0]
workspace_max = [0.6, 0.3, 0.5]

[[joints]]
name = "j1"
min = -3.14
max = 3.14
max_velocity = 2.0
"#;
        let model = RetargetModel::from_toml_str(text).unwrap();
        assert_eq!(model.embodiment.kind(), "cartesian");
        assert_eq!(model.embodiment.joint_count(), None);
        assert_eq!(model.tolerance(), ARM_TOLERANCE);
    }

    #[test]
    fn inverted_workspace_is_rejected() {
        let mut model = RetargetModel::demo_cartesian("ee");
        if let Embodiment::Cartesian(ee) = &mut model.embodiment {
            ee.workspace_min[2] = 1.0;
        }
        let err = model.validate().unwrap_err();
        assert!(err.to_string().contains("workspace"), "{err}");
    }

    #[test]
    fn workspace_clamp_is_the_nearest_point() {
        let Embodiment::Cartesian(ee) = RetargetModel::demo_cartesian("ee").embodiment else {
            unreachable!()
        };
        let inside = Vec3::new(0.3, 0.0, 0.3);
        assert_eq!(ee.clamp(inside), inside);
        assert_eq!(ee.clamp(Vec3::new(2.0, -1.0, 0.3)), Vec3::new(0.65, -0.40, 0.3));
        assert!(ee.contains([0.3, 0.0, 0.3]));
        assert!(!ee.contains([0.3, 0.0, 0.7]));
    }

    #[test]
    fn demo_models_roundtrip_through_toml() {
        let model = RetargetModel::demo_hand("hand");
        let text = toml::to_string(&model).unwrap();
        assert_eq!(RetargetModel::from_toml_str(&text).unwrap(), model);
    }

    #[test]
    fn joint_count_must_match_embodiment() {
        let text = ARM_TOML.replace(
            "[[joints]]\nname = \"elbow_pitch\"\nmin = -2.5\nmax = 2.5\nmax_velocity = 2.0\n",
            "",
        );
        let err = RetargetModel::from_toml_str(&text).unwrap_err();
        assert!(err.to_string().contains("needs 3 joints"), "{err}");
    }

    #[test]
    fn inverted_joint_limits_are_fatal() {
        let mut model = RetargetModel::demo_arm("arm");
        model.joints[1].min = 3.0;
        let err = model.validate().unwrap_err();
        assert!(TeleopError::from(err).is_fatal());
    }

    #[test]
    fn non_positive_link_is_rejected() {
        let mut model = RetargetModel::demo_arm("arm");
        if let Embodiment::Arm(arm) = &mut model.embodiment {
            arm.forearm = 0.0;
        }
        assert!(model.validate().is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = RetargetModel::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ModelError::Io { .. }));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arm.toml");
        std::fs::write(&path, ARM_TOML).unwrap();
        assert_eq!(RetargetModel::load(&path).unwrap().robot_id, "arm");
    }

    #[test]
    fn calibration_scales_then_offsets() {
        let cal = Calibration {
            translation_offset: [0.1, 0.0, 0.0],
            rotation_offset: [1.0, 0.0, 0.0, 0.0],
            scale: 2.0,
        };
        let p = cal.apply(Vec3::new(0.5, 0.25, 0.0));
        assert!(p.distance(Vec3::new(1.1, 0.5, 0.0)) < 1e-12);
    }

    #[test]
    fn gripper_aperture_is_clamped() {
        let g = GripperMapping {
            thumb_tip: 19,
            index_tip: 20,
            open_distance: 0.1,
            closed_distance: 0.02,
        };
        assert_eq!(g.aperture(0.0), 0.0);
        assert_eq!(g.aperture(0.5), 1.0);
        assert!((g.aperture(0.06) - 0.5).abs() < 1e-12);
    }
}
