//! The recorder task.
//!
//! [`RecorderService`] drains one merged queued subscription over the
//! command, state, pose and camera topics of a robot, feeding a
//! [`Recorder`] in arrival order, and serves `control/recorder` for
//! `StartRecording` / `StopRecording`.  Sealed episodes are written to the
//! [`EpisodeStore`] on the blocking pool.
//!
//! A [`RecorderStatus`] is published on [`status_topic`] whenever recording
//! starts or stops and after every command handled while recording, so
//! gaps and missing samples show up on the diagnostics stream before the
//! episode is sealed.

use teleop_middleware::{Envelope, MessageBus, Request, Topic, topics};
use teleop_types::{CameraFrame, ControlRequest, ControlResponse, TeleopError};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::episode::Episode;
use crate::recorder::{Recorder, RecorderConfig, RecorderError, RecorderStatus};
use crate::store::EpisodeStore;

/// Samples buffered between the bus and the recorder.
pub const INGEST_QUEUE_CAPACITY: usize = 4096;

/// Live recorder status topic, `diagnostics/recorder`.
pub fn status_topic() -> Topic<RecorderStatus> {
    Topic::new(topics::RECORDER_DIAGNOSTICS)
}

/// Counters reported when the service stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub episodes: u64,
    pub persist_failures: u64,
}

pub struct RecorderService {
    bus: MessageBus,
    recorder: Recorder,
    store: Option<EpisodeStore>,
    topic_names: Vec<String>,
}

impl RecorderService {
    pub fn new(bus: MessageBus, config: RecorderConfig) -> Self {
        let topic_names = Self::topic_names(&config);
        Self {
            bus,
            recorder: Recorder::new(config),
            store: None,
            topic_names,
        }
    }

    /// Persist sealed episodes to `store`.
    pub fn with_store(mut self, store: EpisodeStore) -> Self {
        self.store = Some(store);
        self
    }

    fn topic_names(config: &RecorderConfig) -> Vec<String> {
        let mut names = vec![
            topics::command(&config.robot_id).name().to_string(),
            topics::state(&config.robot_id).name().to_string(),
            topics::pose(config.pose_source).name().to_string(),
        ];
        names.extend(config.cameras.iter().map(|c| topics::camera(c).name().to_string()));
        names
    }

    /// Feed one sample to the recorder.  Returns `true` for a command.
    fn ingest(&mut self, envelope: &Envelope) -> bool {
        let config = self.recorder.config();
        let command = topics::command(&config.robot_id);
        let state = topics::state(&config.robot_id);
        let pose = topics::pose(config.pose_source);
        if let Some(c) = envelope.decode(&command) {
            self.recorder.ingest_command(&c);
            return true;
        }
        if let Some(s) = envelope.decode(&state) {
            self.recorder.ingest_state(&s);
        } else if let Some(p) = envelope.decode(&pose) {
            self.recorder.ingest_pose(&p);
        } else if let Some(f) = envelope.decode(&Topic::<CameraFrame>::new(envelope.topic())) {
            self.recorder.ingest_frame(&f);
        }
        false
    }

    fn publish_status(&self) {
        let dropped_samples = self
            .bus
            .topics()
            .iter()
            .filter(|info| self.topic_names.contains(&info.name))
            .map(|info| info.dropped)
            .sum();
        let status = RecorderStatus {
            dropped_samples,
            ..self.recorder.status()
        };
        self.bus.publish(&status_topic(), status);
    }

    /// Seal the active episode and persist it.  `None` when not recording.
    async fn seal(&mut self, stats: &mut RecorderStats) -> Option<Episode> {
        let episode = self.recorder.stop().ok()?;
        stats.episodes += 1;
        if let Err(e) = episode.check_complete() {
            warn!(error = %e, "episode incomplete");
        }

        if let Some(store) = self.store.take() {
            let to_save = episode.clone();
            let joined = tokio::task::spawn_blocking(move || {
                let result = store.save(&to_save);
                (store, result)
            })
            .await;
            match joined {
                Ok((store, result)) => {
                    self.store = Some(store);
                    if let Err(e) = result {
                        stats.persist_failures += 1;
                        error!(episode = episode.episode_id(), error = %e, "episode not persisted");
                    }
                }
                Err(e) => {
                    stats.persist_failures += 1;
                    error!(episode = episode.episode_id(), error = %e, "persist task failed; store closed");
                }
            }
        }
        Some(episode)
    }

    async fn handle(&mut self, request: Request<ControlRequest, ControlResponse>, stats: &mut RecorderStats) {
        let response = match request.payload().clone() {
            ControlRequest::StartRecording { episode_id } => {
                let exists = match self.store.as_ref().map(|s| s.contains(&episode_id)) {
                    Some(Ok(exists)) => exists,
                    Some(Err(e)) => {
                        warn!(error = %e, "episode store lookup failed");
                        false
                    }
                    None => false,
                };
                if exists {
                    ControlResponse::Rejected {
                        reason: format!("episode '{episode_id}' already stored"),
                    }
                } else {
                    match self.recorder.start(&episode_id) {
                        Ok(()) => ControlResponse::Recording { episode_id },
                        Err(e) => ControlResponse::Rejected { reason: e.to_string() },
                    }
                }
            }
            ControlRequest::StopRecording => match self.seal(stats).await {
                Some(episode) => ControlResponse::EpisodeSealed(episode.summary()),
                None => ControlResponse::Rejected {
                    reason: RecorderError::NotRecording.to_string(),
                },
            },
            other => ControlResponse::Rejected {
                reason: format!("recorder does not handle {other:?}"),
            },
        };
        request.respond(response);
    }

    /// Run until `stop` flips to `true`.  An episode still recording at that
    /// point is sealed and persisted first.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<RecorderStats, TeleopError> {
        let mut control = self.bus.serve(&topics::recorder_control(), 16)?;
        let refs: Vec<&str> = self.topic_names.iter().map(String::as_str).collect();
        let mut samples = self.bus.subscribe_merged(&refs, INGEST_QUEUE_CAPACITY);
        let mut stats = RecorderStats::default();
        info!(robot = %self.recorder.config().robot_id, topics = ?self.topic_names, "recorder started");
        self.publish_status();

        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                request = control.next() => {
                    let Some(request) = request else { break };
                    // Everything published before the request belongs to the
                    // episode it starts or stops.
                    while let Some(envelope) = samples.try_recv() {
                        self.ingest(&envelope);
                    }
                    self.handle(request, &mut stats).await;
                    self.publish_status();
                }
                envelope = samples.recv() => {
                    let Some(envelope) = envelope else { break };
                    if self.ingest(&envelope) && self.recorder.is_recording() {
                        self.publish_status();
                    }
                }
            }
        }

        if self.recorder.is_recording() {
            while let Some(envelope) = samples.try_recv() {
                self.ingest(&envelope);
            }
            self.seal(&mut stats).await;
            self.publish_status();
        }
        info!(episodes = stats.episodes, "recorder stopped");
        Ok(stats)
    }
}
