//! Synthetic headset for running the stack without VR hardware.
//!
//! Publishes right-hand poses at 90 Hz: the wrist traces a slow horizontal
//! circle in front of the arm and the fingertip keypoints open and close,
//! so both built-in models (arm with pinch gripper, four-finger hand) have
//! something to follow.

use std::time::Duration;

use teleop_middleware::{MessageBus, topics};
use teleop_retarget::model::HandChain;
use teleop_retarget::{Embodiment, RetargetModel, hand};
use teleop_types::{Pose6D, TrackedPart};
use tokio::sync::watch;
use tracing::info;

pub const HEADSET_RATE_HZ: f64 = 90.0;
const KEYPOINTS: usize = 24;

/// Finger geometry the fingertip keypoints are generated from.
pub fn demo_fingers() -> HandChain {
    match RetargetModel::demo_hand("demo").embodiment {
        Embodiment::Hand(chain) => chain,
        _ => HandChain { fingers: Vec::new() },
    }
}

/// Pose `seq` of the synthetic trajectory, `t` seconds in.
pub fn sample(fingers: &HandChain, seq: u64, t: f64) -> Pose6D {
    let angle = 0.4 * t;
    let translation = [0.30 + 0.05 * angle.cos(), 0.10 * angle.sin(), 0.30];

    let mut keypoints = vec![[0.0; 3]; KEYPOINTS];
    let curl = 0.5 + 0.4 * (1.5 * t).sin();
    for finger in &fingers.fingers {
        if let Some(slot) = keypoints.get_mut(finger.tip_keypoint) {
            *slot = hand::forward(finger, [0.0, curl, curl]).to_array();
        }
    }
    Pose6D::new(TrackedPart::RightHand, seq, translation, [1.0, 0.0, 0.0, 0.0]).with_keypoints(keypoints)
}

/// Publish [`sample`]s until `stop` flips to `true`.  Returns the number
/// published.
pub async fn run(bus: MessageBus, mut stop: watch::Receiver<bool>) -> u64 {
    let topic = topics::pose(TrackedPart::RightHand);
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / HEADSET_RATE_HZ));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let fingers = demo_fingers();
    let started = tokio::time::Instant::now();
    let mut seq = 0;
    info!(rate_hz = HEADSET_RATE_HZ, "demo headset streaming");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                seq += 1;
                bus.publish(&topic, sample(&fingers, seq, started.elapsed().as_secs_f64()));
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    seq
}
