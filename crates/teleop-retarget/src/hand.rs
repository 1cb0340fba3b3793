//! Iterative fingertip inverse kinematics for multi-finger hands.
//!
//! Every finger is an independent 3-joint chain (abduction, proximal flexion,
//! distal flexion) solved with damped least squares on a finite-difference
//! Jacobian:
//!
//! ```text
//! dq = Jᵀ (J Jᵀ + λ² I)⁻¹ e,    λ² = damping · |e|²
//! ```
//!
//! The damping shrinks with the residual: steps stay bounded near singular
//! (straight-finger) poses and convergence is fast close to the target.
//!
//! Joints are projected back onto their limits after every step.  A joint
//! sitting on a limit with the error pushing it further out is frozen for
//! that step, so the remaining joints settle instead of fighting the clamp.

use teleop_perception::transform::Vec3;
use teleop_types::RetargetFailure;

use crate::model::{FingerChain, JointLimit, SolverSettings};

const JACOBIAN_STEP: f64 = 1e-6;
const AT_LIMIT: f64 = 1e-12;
/// Largest joint-space step (rad) taken in one iteration.
const MAX_STEP: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct FingerSolution {
    pub joints: [f64; 3],
    pub residual: f64,
    pub iterations: u32,
    /// Settled on a limit (or otherwise stalled) above tolerance.
    pub limited: bool,
}

/// Fingertip position for joint angles `q` in the calibrated hand frame.
///
/// At `q = 0` the finger is straight along `+y`; flexion curls it toward
/// `-z`, abduction swings it toward `+x`.
pub fn forward(finger: &FingerChain, q: [f64; 3]) -> Vec3 {
    let [l1, l2] = finger.links;
    let s = l1 * q[1].cos() + l2 * (q[1] + q[2]).cos();
    let h = l1 * q[1].sin() + l2 * (q[1] + q[2]).sin();
    Vec3::from(finger.base) + Vec3::new(s * q[0].sin(), s * q[0].cos(), -h)
}

fn jacobian(finger: &FingerChain, q: [f64; 3]) -> [[f64; 3]; 3] {
    let p0 = forward(finger, q);
    // Columns are joints, rows are x/y/z.
    let mut j = [[0.0; 3]; 3];
    for col in 0..3 {
        let mut dq = q;
        dq[col] += JACOBIAN_STEP;
        let d = (forward(finger, dq) - p0) * (1.0 / JACOBIAN_STEP);
        j[0][col] = d.x;
        j[1][col] = d.y;
        j[2][col] = d.z;
    }
    j
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Solve `m · x = b` by Cramer's rule; `None` when `m` is singular.
fn solve3(m: &[[f64; 3]; 3], b: [f64; 3]) -> Option<[f64; 3]> {
    let det = det3(m);
    if det.abs() < 1e-30 || !det.is_finite() {
        return None;
    }
    let mut x = [0.0; 3];
    for (col, out) in x.iter_mut().enumerate() {
        let mut mi = *m;
        for row in 0..3 {
            mi[row][col] = b[row];
        }
        *out = det3(&mi) / det;
    }
    Some(x)
}

/// Solve one finger for `target` starting from the middle of its joint range.
///
/// # Errors
///
/// [`RetargetFailure::NonConvergence`] when `max_iterations` pass without the
/// residual dropping below `tolerance` or the joints settling.
pub fn solve_finger(
    finger: &FingerChain,
    limits: &[JointLimit],
    target: Vec3,
    tolerance: f64,
    settings: &SolverSettings,
) -> Result<FingerSolution, RetargetFailure> {
    let mut q = [limits[0].midpoint(), limits[1].midpoint(), limits[2].midpoint()];

    for iteration in 1..=settings.max_iterations {
        let e = target - forward(finger, q);
        let residual = e.norm();
        if residual < tolerance {
            return Ok(FingerSolution {
                joints: q,
                residual,
                iterations: iteration,
                limited: false,
            });
        }

        let mut j = jacobian(finger, q);
        let e = [e.x, e.y, e.z];
        // Freeze joints pinned against a limit by the descent direction.
        for col in 0..3 {
            let grad: f64 = (0..3).map(|row| j[row][col] * e[row]).sum();
            let at_min = q[col] - limits[col].min < AT_LIMIT && grad < 0.0;
            let at_max = limits[col].max - q[col] < AT_LIMIT && grad > 0.0;
            if at_min || at_max {
                for row in j.iter_mut() {
                    row[col] = 0.0;
                }
            }
        }

        // A = J Jᵀ + λ² I
        let lambda2 = settings.damping * residual * residual;
        let mut a = [[0.0; 3]; 3];
        for r in 0..3 {
            for c in 0..3 {
                a[r][c] = (0..3).map(|k| j[r][k] * j[c][k]).sum::<f64>();
            }
            a[r][r] += lambda2;
        }
        let Some(y) = solve3(&a, e) else {
            break;
        };

        let mut dq = [0.0; 3];
        for (col, d) in dq.iter_mut().enumerate() {
            *d = (0..3).map(|row| j[row][col] * y[row]).sum();
        }
        let norm = dq.iter().map(|d| d * d).sum::<f64>().sqrt();
        let scale = if norm > MAX_STEP { MAX_STEP / norm } else { 1.0 };

        let mut step = 0.0;
        for col in 0..3 {
            let next = limits[col].clamp(q[col] + dq[col] * scale);
            step += (next - q[col]).powi(2);
            q[col] = next;
        }

        if step.sqrt() < settings.stationary_step {
            let residual = forward(finger, q).distance(target);
            return Ok(FingerSolution {
                joints: q,
                residual,
                iterations: iteration,
                limited: residual > tolerance,
            });
        }
    }

    let residual = forward(finger, q).distance(target);
    if residual < tolerance {
        return Ok(FingerSolution {
            joints: q,
            residual,
            iterations: settings.max_iterations,
            limited: false,
        });
    }
    Err(RetargetFailure::NonConvergence {
        iterations: settings.max_iterations,
        residual,
    })
}
