//! SQLite persistence for sealed episodes.
//!
//! # Storage layout
//!
//! | table | key | columns |
//! |---|---|---|
//! | `episodes` | `episode_id` | schema_version, robot_id, cameras (JSON), started_at, sealed_at (RFC 3339), incomplete, issues (JSON), step_count |
//! | `steps` | `(episode_id, step_index)` | command, state, pose, frames (JSON) |
//! | `frames` | `(episode_id, camera_id, frame_index)` | data (BLOB) |
//!
//! An episode is written in one transaction and never updated afterwards.
//!
//! # Example
//!
//! ```rust
//! use teleop_recorder::recorder::{Recorder, RecorderConfig};
//! use teleop_recorder::store::EpisodeStore;
//! use teleop_types::TrackedPart;
//!
//! let store = EpisodeStore::open_in_memory().unwrap();
//! let mut rec = Recorder::new(RecorderConfig::new("arm", TrackedPart::RightHand));
//! rec.start("pick-01").unwrap();
//! let episode = rec.stop().unwrap();
//!
//! store.save(&episode).unwrap();
//! assert_eq!(store.load("pick-01").unwrap(), episode);
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use teleop_types::{EpisodeSummary, TeleopError};
use thiserror::Error;
use tracing::debug;

use crate::episode::{EPISODE_SCHEMA_VERSION, Episode, EpisodeIssue, EpisodeParts, FrameBlob, Step};

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Episode not found: {0}")]
    NotFound(String),
    #[error("Episode already stored: {0}")]
    AlreadyExists(String),
    #[error("Episode {episode_id} has unsupported schema version {found}")]
    UnsupportedSchema { episode_id: String, found: u32 },
    #[error("Corrupt timestamp '{0}'")]
    Timestamp(String),
    #[error("cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl From<StoreError> for TeleopError {
    fn from(err: StoreError) -> Self {
        TeleopError::Serialization(err.to_string())
    }
}

fn parse_time(text: &str) -> Result<DateTime<Utc>, StoreError> {
    text.parse::<DateTime<Utc>>()
        .map_err(|_| StoreError::Timestamp(text.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// EpisodeStore
// ─────────────────────────────────────────────────────────────────────────────

pub struct EpisodeStore {
    conn: Connection,
}

impl EpisodeStore {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS episodes (
                episode_id     TEXT NOT NULL PRIMARY KEY,
                schema_version INTEGER NOT NULL,
                robot_id       TEXT NOT NULL,
                cameras        TEXT NOT NULL,
                started_at     TEXT NOT NULL,
                sealed_at      TEXT NOT NULL,
                incomplete     INTEGER NOT NULL,
                issues         TEXT NOT NULL,
                step_count     INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS steps (
                episode_id TEXT NOT NULL REFERENCES episodes(episode_id),
                step_index INTEGER NOT NULL,
                command    TEXT NOT NULL,
                state      TEXT NOT NULL,
                pose       TEXT NOT NULL,
                frames     TEXT NOT NULL,
                PRIMARY KEY (episode_id, step_index)
            );
            CREATE TABLE IF NOT EXISTS frames (
                episode_id  TEXT NOT NULL REFERENCES episodes(episode_id),
                camera_id   TEXT NOT NULL,
                frame_index INTEGER NOT NULL,
                data        BLOB NOT NULL,
                PRIMARY KEY (episode_id, camera_id, frame_index)
            );",
        )?;
        Ok(())
    }

    pub fn contains(&self, episode_id: &str) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM episodes WHERE episode_id = ?1",
                params![episode_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Persist a sealed episode.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyExists`] if an episode with the same id is
    /// stored; sealed episodes are never overwritten.
    pub fn save(&self, episode: &Episode) -> Result<(), StoreError> {
        if self.contains(episode.episode_id())? {
            return Err(StoreError::AlreadyExists(episode.episode_id().to_string()));
        }
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO episodes
                 (episode_id, schema_version, robot_id, cameras, started_at,
                  sealed_at, incomplete, issues, step_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                episode.episode_id(),
                episode.schema_version(),
                episode.robot_id(),
                serde_json::to_string(episode.cameras())?,
                episode.started_at().to_rfc3339(),
                episode.sealed_at().to_rfc3339(),
                episode.incomplete(),
                serde_json::to_string(episode.issues())?,
                episode.len() as i64,
            ],
        )?;
        {
            let mut insert_step = tx.prepare(
                "INSERT INTO steps (episode_id, step_index, command, state, pose, frames)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for step in episode.steps() {
                insert_step.execute(params![
                    episode.episode_id(),
                    step.index as i64,
                    serde_json::to_string(&step.command)?,
                    serde_json::to_string(&step.state)?,
                    serde_json::to_string(&step.pose)?,
                    serde_json::to_string(&step.frames)?,
                ])?;
            }
            let mut insert_frame = tx.prepare(
                "INSERT OR REPLACE INTO frames (episode_id, camera_id, frame_index, data)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for blob in episode.frame_data() {
                insert_frame.execute(params![
                    episode.episode_id(),
                    blob.camera_id,
                    blob.frame_index as i64,
                    blob.data,
                ])?;
            }
        }
        tx.commit()?;
        debug!(episode = episode.episode_id(), steps = episode.len(), "episode stored");
        Ok(())
    }

    /// Reload an episode exactly as it was saved.
    pub fn load(&self, episode_id: &str) -> Result<Episode, StoreError> {
        let header = self
            .conn
            .query_row(
                "SELECT schema_version, robot_id, cameras, started_at, sealed_at, issues
                 FROM episodes WHERE episode_id = ?1",
                params![episode_id],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(episode_id.to_string()))?;
        let (schema_version, robot_id, cameras, started_at, sealed_at, issues) = header;
        if schema_version != EPISODE_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema {
                episode_id: episode_id.to_string(),
                found: schema_version,
            });
        }

        let mut stmt = self.conn.prepare(
            "SELECT step_index, command, state, pose, frames
             FROM steps WHERE episode_id = ?1
             ORDER BY step_index ASC",
        )?;
        let rows = stmt.query_map(params![episode_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut steps = Vec::new();
        for row in rows {
            let (index, command, state, pose, frames) = row?;
            steps.push(Step {
                index: index as u64,
                command: serde_json::from_str(&command)?,
                state: serde_json::from_str(&state)?,
                pose: serde_json::from_str(&pose)?,
                frames: serde_json::from_str(&frames)?,
            });
        }

        let mut stmt = self.conn.prepare(
            "SELECT camera_id, frame_index, data FROM frames
             WHERE episode_id = ?1
             ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![episode_id], |row| {
            Ok(FrameBlob {
                camera_id: row.get(0)?,
                frame_index: row.get::<_, i64>(1)? as u64,
                data: row.get(2)?,
            })
        })?;
        let frame_data = rows.collect::<Result<Vec<_>, _>>()?;

        Ok(Episode::from_parts(EpisodeParts {
            schema_version,
            episode_id: episode_id.to_string(),
            robot_id,
            cameras: serde_json::from_str(&cameras)?,
            started_at: parse_time(&started_at)?,
            sealed_at: parse_time(&sealed_at)?,
            issues: serde_json::from_str::<Vec<EpisodeIssue>>(&issues)?,
            steps,
            frame_data,
        }))
    }

    /// Summaries of every stored episode, oldest first.
    pub fn list(&self) -> Result<Vec<EpisodeSummary>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT e.episode_id, e.step_count, e.incomplete,
                    (SELECT COUNT(*) FROM steps s
                      WHERE s.episode_id = e.episode_id
                        AND json_extract(s.state, '$.status') = 'missing')
             FROM episodes e
             ORDER BY e.started_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (episode_id, steps, incomplete, missing_states) = row?;
            let missing_frames = self.count_missing_frames(&episode_id)?;
            out.push(EpisodeSummary {
                episode_id,
                steps: steps as usize,
                incomplete,
                missing_states: missing_states as usize,
                missing_frames,
            });
        }
        Ok(out)
    }

    fn count_missing_frames(&self, episode_id: &str) -> Result<usize, StoreError> {
        let missing: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM steps s, json_each(s.frames) f
             WHERE s.episode_id = ?1
               AND json_extract(f.value, '$.frame.status') = 'missing'",
            params![episode_id],
            |row| row.get(0),
        )?;
        Ok(missing as usize)
    }

    /// Write the episode's JSON document to `path`.
    pub fn export_json(&self, episode_id: &str, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let episode = self.load(episode_id)?;
        let path = path.as_ref();
        std::fs::write(path, episode.to_json()?).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
