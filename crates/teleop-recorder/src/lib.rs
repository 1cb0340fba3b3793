//! `teleop-recorder` – synchronized multi-stream recording.
//!
//! Turns the command, state, pose and camera streams of one robot into
//! replayable [`Episode`]s and persists them.
//!
//! # Modules
//!
//! - [`episode`] – the versioned episode model ([`Episode`], [`Step`],
//!   [`Aligned`]) and its JSON Schema.
//! - [`recorder`] – [`Recorder`]: fresh-slot alignment keyed on command
//!   sequence numbers, sealing with gap validation.
//! - [`store`] – [`EpisodeStore`]: SQLite persistence and JSON export.
//! - [`service`] – [`RecorderService`]: the bus-facing task serving
//!   `control/recorder` and publishing [`RecorderStatus`] on
//!   `diagnostics/recorder`.

pub mod episode;
pub mod recorder;
pub mod service;
pub mod store;

pub use episode::{Aligned, EPISODE_SCHEMA_VERSION, Episode, EpisodeIssue, Step, episode_json_schema};
pub use recorder::{Recorder, RecorderConfig, RecorderError, RecorderStatus};
pub use service::{RecorderService, RecorderStats, status_topic};
pub use store::{EpisodeStore, StoreError};
