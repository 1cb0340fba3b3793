//! Task turning raw headset keypoints into hand poses.
//!
//! Subscribes to `hand/raw/<side>`, runs the [`HandKeypointTransformer`] on
//! every new sample and publishes the wrist pose on `pose/<side>`.  Invalid
//! samples are dropped and counted; the operator sees them as missing poses.

use teleop_middleware::{MessageBus, topics};
use teleop_types::TeleopError;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::keypoint_log::KeypointLogger;
use crate::keypoints::HandKeypointTransformer;

/// Counters reported when the service stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformStats {
    pub published: u64,
    pub rejected: u64,
}

pub struct HandTransformService {
    bus: MessageBus,
    transformer: HandKeypointTransformer,
    logger: Option<KeypointLogger>,
}

impl HandTransformService {
    pub fn new(bus: MessageBus, transformer: HandKeypointTransformer) -> Self {
        Self {
            bus,
            transformer,
            logger: None,
        }
    }

    /// Log every published frame through `logger`.
    pub fn with_logger(mut self, logger: KeypointLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Run until `stop` flips to `true` or the bus goes away.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<TransformStats, TeleopError> {
        let side = self.transformer.side();
        let mut raw = self.bus.subscribe(&topics::raw_hand(side))?;
        let out = topics::pose(side);
        let mut stats = TransformStats::default();
        info!(side = %side, window = self.transformer.window(), "hand transform started");

        loop {
            tokio::select! {
                sample = raw.recv() => {
                    let Some(sample) = sample else { break };
                    match self.transformer.transform(&sample) {
                        Ok(hand) => {
                            self.bus.publish(&out, hand.to_pose());
                            stats.published += 1;
                            if let Some(logger) = self.logger.as_mut() {
                                if let Err(e) = logger.log(&hand) {
                                    warn!(error = %e, "keypoint log write failed");
                                }
                            }
                        }
                        Err(e) => {
                            stats.rejected += 1;
                            debug!(side = %side, seq = sample.seq, error = %e, "hand sample rejected");
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

        if let Some(logger) = self.logger.as_mut() {
            logger.flush()?;
        }
        info!(side = %side, published = stats.published, rejected = stats.rejected, "hand transform stopped");
        Ok(stats)
    }
}
