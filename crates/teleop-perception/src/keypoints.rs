//! Hand keypoint frame transform.
//!
//! Raw headset keypoints are re-expressed in a canonical, wrist-centred hand
//! frame built from the wrist and three knuckles, and smoothed with a
//! moving average over the last `window` samples.  The wrist pose (origin and
//! orientation of the hand-direction frame) becomes the [`Pose6D`] the
//! operators consume.
//!
//! Frame construction, with `v_i = knuckle_i - wrist`:
//!
//! | Axis | Definition |
//! |---|---|
//! | palm normal | `normalize(v_index × v_middle)` |
//! | palm direction | `normalize((v_index + v_pinky + v_middle) / 3)` |
//! | lateral | `normalize(direction × normal)` |
//!
//! followed by Gram–Schmidt so the result is always a proper rotation.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use teleop_types::{HandKeypoints, Pose6D, RetargetFailure, TrackedPart};

use crate::transform::{Quaternion, Vec3};

/// Default moving-average window.
pub const DEFAULT_SMOOTHING_WINDOW: usize = 5;

/// Index map of the keypoints reported by a headset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeypointLayout {
    pub count: usize,
    pub wrist: usize,
    pub index_knuckle: usize,
    pub middle_knuckle: usize,
    pub pinky_knuckle: usize,
    /// Thumb, index, middle, ring, pinky tips.
    pub fingertips: [usize; 5],
}

impl KeypointLayout {
    /// Oculus hand skeleton: 24 joints, tips last.
    pub const OCULUS: Self = Self {
        count: 24,
        wrist: 0,
        index_knuckle: 6,
        middle_knuckle: 9,
        pinky_knuckle: 16,
        fingertips: [19, 20, 21, 22, 23],
    };

    pub fn thumb_tip(&self) -> usize {
        self.fingertips[0]
    }

    pub fn index_tip(&self) -> usize {
        self.fingertips[1]
    }
}

impl Default for KeypointLayout {
    fn default() -> Self {
        Self::OCULUS
    }
}

/// Origin plus orthonormal axes of a hand frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandFrame {
    pub origin: Vec3,
    pub x: Vec3,
    pub y: Vec3,
    pub z: Vec3,
}

impl HandFrame {
    pub fn rotation(&self) -> Quaternion {
        Quaternion::from_basis(self.x, self.y, self.z)
    }
}

/// Output of one [`HandKeypointTransformer::transform`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedHand {
    pub side: TrackedPart,
    pub source_seq: u64,
    /// Smoothed keypoints in the canonical hand frame.
    pub keypoints: Vec<[f64; 3]>,
    /// Smoothed hand-direction frame in headset coordinates.
    pub frame: HandFrame,
    pub is_relative: bool,
    pub captured_at: DateTime<Utc>,
}

impl TransformedHand {
    /// The wrist pose with the canonical keypoints attached.
    pub fn to_pose(&self) -> Pose6D {
        let mut pose = Pose6D::new(
            self.side,
            self.source_seq,
            self.frame.origin.to_array(),
            self.frame.rotation().to_array(),
        )
        .with_keypoints(self.keypoints.clone());
        pose.captured_at = self.captured_at;
        pose
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Frame construction
// ────────────────────────────────────────────────────────────────────────────

fn degenerate(what: &str) -> RetargetFailure {
    RetargetFailure::InvalidInput(format!("degenerate hand geometry: {what}"))
}

/// Gram–Schmidt: keep `x`, make `y` orthogonal to it, and rebuild `z = x × y`.
pub fn orthogonalize(x: Vec3, y: Vec3) -> Result<(Vec3, Vec3, Vec3), RetargetFailure> {
    let x = x.normalized().ok_or_else(|| degenerate("x axis"))?;
    let y = (y - x * y.dot(x))
        .normalized()
        .ok_or_else(|| degenerate("y axis parallel to x"))?;
    let z = x.cross(y).normalized().ok_or_else(|| degenerate("z axis"))?;
    Ok((x, y, z))
}

struct PalmAxes {
    normal: Vec3,
    direction: Vec3,
    lateral: Vec3,
}

fn palm_axes(layout: &KeypointLayout, points: &[Vec3]) -> Result<PalmAxes, RetargetFailure> {
    let wrist = points[layout.wrist];
    let v_index = points[layout.index_knuckle] - wrist;
    let v_pinky = points[layout.pinky_knuckle] - wrist;
    let v_middle = points[layout.middle_knuckle] - wrist;

    let normal = v_index
        .cross(v_middle)
        .normalized()
        .ok_or_else(|| degenerate("palm normal"))?;
    let direction = ((v_index + v_pinky + v_middle) * (1.0 / 3.0))
        .normalized()
        .ok_or_else(|| degenerate("palm direction"))?;
    let lateral = direction
        .cross(normal)
        .normalized()
        .ok_or_else(|| degenerate("lateral axis"))?;
    Ok(PalmAxes {
        normal,
        direction,
        lateral,
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Transformer
// ────────────────────────────────────────────────────────────────────────────

/// Stateful per-hand transformer with moving-average smoothing.
#[derive(Debug)]
pub struct HandKeypointTransformer {
    side: TrackedPart,
    layout: KeypointLayout,
    window: usize,
    keypoint_history: VecDeque<Vec<Vec3>>,
    frame_history: VecDeque<HandFrame>,
}

impl HandKeypointTransformer {
    pub fn new(side: TrackedPart, layout: KeypointLayout, window: usize) -> Self {
        let window = window.max(1);
        Self {
            side,
            layout,
            window,
            keypoint_history: VecDeque::with_capacity(window),
            frame_history: VecDeque::with_capacity(window),
        }
    }

    pub fn side(&self) -> TrackedPart {
        self.side
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Forget the smoothing history, e.g. after tracking was lost.
    pub fn reset(&mut self) {
        self.keypoint_history.clear();
        self.frame_history.clear();
    }

    /// Transform one raw sample.
    ///
    /// # Errors
    ///
    /// [`RetargetFailure::InvalidInput`] when the sample has the wrong number
    /// of keypoints, non-finite values or degenerate palm geometry. The
    /// smoothing history is left untouched in that case.
    pub fn transform(&mut self, raw: &HandKeypoints) -> Result<TransformedHand, RetargetFailure> {
        if raw.keypoints.len() != self.layout.count {
            return Err(RetargetFailure::InvalidInput(format!(
                "expected {} keypoints, got {}",
                self.layout.count,
                raw.keypoints.len()
            )));
        }
        let points: Vec<Vec3> = raw.keypoints.iter().copied().map(Vec3::from).collect();
        if let Some(bad) = points.iter().position(|p| !p.is_finite()) {
            return Err(RetargetFailure::InvalidInput(format!("non-finite keypoint {bad}")));
        }

        let wrist = points[self.layout.wrist];
        let translated: Vec<Vec3> = points.iter().map(|p| *p - wrist).collect();

        // Canonical frame for the keypoints.
        let axes = palm_axes(&self.layout, &translated)?;
        let (cx, cy, cz) = orthogonalize(axes.lateral, axes.direction)?;
        let canonical: Vec<Vec3> = translated
            .iter()
            .map(|p| Vec3::new(cx.dot(*p), cy.dot(*p), cz.dot(*p)))
            .collect();

        // Hand-direction frame for the wrist pose.
        let (hx, hy, hz) = orthogonalize(axes.lateral, axes.normal)?;
        let frame = HandFrame {
            origin: wrist,
            x: hx,
            y: hy,
            z: hz,
        };

        push_bounded(&mut self.keypoint_history, canonical, self.window);
        push_bounded(&mut self.frame_history, frame, self.window);

        let keypoints = self.averaged_keypoints();
        let frame = self.averaged_frame()?;

        Ok(TransformedHand {
            side: self.side,
            source_seq: raw.seq,
            keypoints,
            frame,
            is_relative: raw.is_relative,
            captured_at: raw.captured_at,
        })
    }

    fn averaged_keypoints(&self) -> Vec<[f64; 3]> {
        let n = self.keypoint_history.len() as f64;
        let mut sum = vec![Vec3::zero(); self.layout.count];
        for sample in &self.keypoint_history {
            for (acc, p) in sum.iter_mut().zip(sample) {
                *acc = *acc + *p;
            }
        }
        sum.into_iter().map(|p| (p * (1.0 / n)).to_array()).collect()
    }

    fn averaged_frame(&self) -> Result<HandFrame, RetargetFailure> {
        let n = self.frame_history.len() as f64;
        let mut origin = Vec3::zero();
        let mut x = Vec3::zero();
        let mut y = Vec3::zero();
        for f in &self.frame_history {
            origin = origin + f.origin;
            x = x + f.x;
            y = y + f.y;
        }
        // Averaged axes are no longer orthonormal.
        let (x, y, z) = orthogonalize(x * (1.0 / n), y * (1.0 / n))?;
        Ok(HandFrame {
            origin: origin * (1.0 / n),
            x,
            y,
            z,
        })
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, value: T, limit: usize) {
    queue.push_back(value);
    while queue.len() > limit {
        queue.pop_front();
    }
}
