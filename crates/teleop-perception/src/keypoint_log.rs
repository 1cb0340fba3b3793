//! JSON log of transformed hand frames.
//!
//! Frames accumulate in memory and are flushed every `auto_save_interval`
//! frames to a numbered chunk file
//! `keypoints_<side>_<YYYYmmdd_HHMMSS>_<chunk>.json`, so a long session never
//! overwrites earlier chunks.  Whatever is still buffered is written on
//! [`KeypointLogger::flush`] and when the logger is dropped.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use teleop_types::{TeleopError, TrackedPart};
use tracing::{debug, error, info};

use crate::keypoints::TransformedHand;

pub const DEFAULT_AUTO_SAVE_INTERVAL: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateFrame {
    pub origin: [f64; 3],
    pub x_vector: [f64; 3],
    pub y_vector: [f64; 3],
    pub z_vector: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedFrame {
    pub frame_id: u64,
    pub timestamp: DateTime<Utc>,
    pub keypoints: Vec<[f64; 3]>,
    pub coordinate_frame: CoordinateFrame,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMetadata {
    pub save_timestamp: DateTime<Utc>,
    pub moving_average_limit: usize,
    pub chunk: u32,
}

/// On-disk shape of one chunk file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeypointLogFile {
    pub hand_side: TrackedPart,
    pub total_frames: usize,
    pub frames: Vec<LoggedFrame>,
    pub metadata: LogMetadata,
}

#[derive(Debug)]
pub struct KeypointLogger {
    side: TrackedPart,
    dir: PathBuf,
    stem: String,
    auto_save_interval: usize,
    moving_average_limit: usize,
    frame_counter: u64,
    chunk: u32,
    buffer: Vec<LoggedFrame>,
}

impl KeypointLogger {
    /// Create the log directory (if needed) and a logger for `side`.
    ///
    /// # Errors
    ///
    /// Returns [`TeleopError::FatalConfig`] if the directory cannot be
    /// created.
    pub fn new(
        side: TrackedPart,
        dir: impl AsRef<Path>,
        auto_save_interval: usize,
        moving_average_limit: usize,
    ) -> Result<Self, TeleopError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            TeleopError::FatalConfig(format!("cannot create keypoint log dir {}: {e}", dir.display()))
        })?;
        let stem = format!("keypoints_{side}_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        info!(side = %side, dir = %dir.display(), "keypoint logging enabled");
        Ok(Self {
            side,
            dir,
            stem,
            auto_save_interval: auto_save_interval.max(1),
            moving_average_limit,
            frame_counter: 0,
            chunk: 0,
            buffer: Vec::new(),
        })
    }

    pub fn frames_logged(&self) -> u64 {
        self.frame_counter
    }

    /// Buffer one frame; flushes a chunk every `auto_save_interval` frames.
    pub fn log(&mut self, hand: &TransformedHand) -> Result<(), TeleopError> {
        self.buffer.push(LoggedFrame {
            frame_id: self.frame_counter,
            timestamp: hand.captured_at,
            keypoints: hand.keypoints.clone(),
            coordinate_frame: CoordinateFrame {
                origin: hand.frame.origin.to_array(),
                x_vector: hand.frame.x.to_array(),
                y_vector: hand.frame.y.to_array(),
                z_vector: hand.frame.z.to_array(),
            },
        });
        self.frame_counter += 1;

        if self.frame_counter % self.auto_save_interval as u64 == 0 {
            self.flush()?;
            debug!(frame = self.frame_counter, "keypoint log auto-saved");
        }
        Ok(())
    }

    /// Write buffered frames to the next chunk file. Returns the path written,
    /// or `None` when there was nothing to write.
    pub fn flush(&mut self) -> Result<Option<PathBuf>, TeleopError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let frames = std::mem::take(&mut self.buffer);
        let file = KeypointLogFile {
            hand_side: self.side,
            total_frames: frames.len(),
            frames,
            metadata: LogMetadata {
                save_timestamp: Utc::now(),
                moving_average_limit: self.moving_average_limit,
                chunk: self.chunk,
            },
        };
        let path = self.dir.join(format!("{}_{:04}.json", self.stem, self.chunk));
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| TeleopError::Serialization(e.to_string()))?;
        fs::write(&path, json).map_err(|e| {
            TeleopError::Serialization(format!("cannot write {}: {e}", path.display()))
        })?;
        self.chunk += 1;
        info!(frames = file.total_frames, path = %path.display(), "keypoint log saved");
        Ok(Some(path))
    }
}

impl Drop for KeypointLogger {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!(error = %e, "final keypoint log save failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypoints::tests::{raw, synthetic_hand};
    use crate::keypoints::{HandKeypointTransformer, KeypointLayout};

    fn hand(seq: u64) -> TransformedHand {
        let mut tf = HandKeypointTransformer::new(TrackedPart::RightHand, KeypointLayout::OCULUS, 1);
        tf.transform(&raw(seq, synthetic_hand())).unwrap()
    }

    fn chunk_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }

    #[test]
    fn auto_saves_every_interval_into_separate_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = KeypointLogger::new(TrackedPart::RightHand, dir.path(), 3, 5).unwrap();
        for seq in 0..7 {
            logger.log(&hand(seq)).unwrap();
        }
        // Two full chunks written, one frame still buffered.
        assert_eq!(chunk_files(dir.path()).len(), 2);

        drop(logger);
        let files = chunk_files(dir.path());
        assert_eq!(files.len(), 3);

        let first: KeypointLogFile =
            serde_json::from_str(&fs::read_to_string(&files[0]).unwrap()).unwrap();
        assert_eq!(first.total_frames, 3);
        assert_eq!(first.frames[0].frame_id, 0);
        assert_eq!(first.metadata.moving_average_limit, 5);
        assert_eq!(first.hand_side, TrackedPart::RightHand);

        let last: KeypointLogFile =
            serde_json::from_str(&fs::read_to_string(&files[2]).unwrap()).unwrap();
        assert_eq!(last.total_frames, 1);
        assert_eq!(last.frames[0].frame_id, 6);
        assert_eq!(last.metadata.chunk, 2);
    }

    #[test]
    fn empty_logger_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = KeypointLogger::new(TrackedPart::LeftHand, dir.path(), 10, 5).unwrap();
        assert!(logger.flush().unwrap().is_none());
        drop(logger);
        assert!(chunk_files(dir.path()).is_empty());
    }

    #[test]
    fn log_json_uses_named_frame_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = KeypointLogger::new(TrackedPart::RightHand, dir.path(), 100, 5).unwrap();
        logger.log(&hand(1)).unwrap();
        let path = logger.flush().unwrap().unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["hand_side"], "right_hand");
        assert!(json["frames"][0]["coordinate_frame"]["x_vector"].is_array());
        assert_eq!(json["frames"][0]["keypoints"].as_array().unwrap().len(), 24);
    }
}
