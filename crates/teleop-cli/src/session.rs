//! A running teleoperation session.
//!
//! [`Session::start`] spawns one task per component on the current tokio
//! runtime, all sharing one [`MessageBus`] and one stop signal:
//!
//! | Task | Count |
//! |---|---|
//! | demo headset or hand-keypoint transforms | 1 or 2 |
//! | [`OperatorService`] | per robot |
//! | [`SinkDriver`] over a [`SimSink`] | per robot |
//! | [`CameraDriver`] over a [`SimCamera`] | per camera |
//! | [`RecorderService`] | 1 |
//! | [`Supervisor`] | 1 |
//! | [`DiagnosticsBridge`] WebSocket server and forwarders | 2 + 3 per robot |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use teleop_hal::{CameraDriver, SimCamera, SimSink, SinkDriver};
use teleop_middleware::{DiagnosticsBridge, MessageBus, topics};
use teleop_perception::keypoints::{DEFAULT_SMOOTHING_WINDOW, HandKeypointTransformer, KeypointLayout};
use teleop_perception::keypoint_log::{DEFAULT_AUTO_SAVE_INTERVAL, KeypointLogger};
use teleop_perception::service::HandTransformService;
use teleop_perception::BusPoseSource;
use teleop_recorder::{EpisodeStore, RecorderConfig, RecorderService, RecorderStatus, status_topic};
use teleop_runtime::{
    HealthSnapshot, Operator, OperatorConfig, OperatorDiagnostics, OperatorService, Supervisor,
    diagnostics_topic,
};
use teleop_types::{ControlRequest, ControlResponse, EpisodeSummary, TeleopError, TrackedPart};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::demo;

/// Deadline for console control requests.
pub const CONTROL_TIMEOUT: Duration = Duration::from_millis(500);
const SIM_CAMERA_SIZE: (u32, u32) = (64, 48);

fn spawn_component<F, T>(name: &str, fut: F) -> (String, JoinHandle<()>)
where
    F: std::future::Future<Output = Result<T, TeleopError>> + Send + 'static,
    T: Send + 'static,
{
    let label = name.to_string();
    let handle = tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!(component = %label, error = %e, "component failed");
        }
    });
    (name.to_string(), handle)
}

/// Cloneable control-plane access, usable from the Ctrl-C handler.
#[derive(Clone)]
pub struct Controller {
    bus: MessageBus,
    robots: Arc<[String]>,
    stop: Arc<watch::Sender<bool>>,
}

impl Controller {
    /// Route `request` to the component that owns it.  `Shutdown` goes to
    /// every operator; the first rejection (if any) is returned.
    pub async fn request(&self, request: ControlRequest) -> Result<ControlResponse, TeleopError> {
        match topics::control_route(&request) {
            Some(endpoint) => Ok(self.bus.request(&endpoint, request, CONTROL_TIMEOUT).await?),
            None => {
                let mut outcome = ControlResponse::Ok;
                for robot in self.robots.iter() {
                    let endpoint = topics::operator_control(robot);
                    match self.bus.request(&endpoint, request.clone(), CONTROL_TIMEOUT).await {
                        Ok(ControlResponse::Ok) => {}
                        Ok(other) => outcome = other,
                        Err(e) => warn!(robot = %robot, error = %e, "operator did not acknowledge"),
                    }
                }
                Ok(outcome)
            }
        }
    }

    /// Stop the operators first so no command is left half-issued, then
    /// signal every other task.
    pub async fn shutdown(&self) {
        if let Err(e) = self.request(ControlRequest::Shutdown).await {
            warn!(error = %e, "shutdown request failed");
        }
        self.stop.send_replace(true);
    }
}

pub struct Session {
    controller: Controller,
    tasks: Vec<(String, JoinHandle<()>)>,
    health: watch::Receiver<HealthSnapshot>,
    episode_db: PathBuf,
    dashboard: SocketAddr,
}

impl Session {
    /// Load every model and spawn the pipeline.
    ///
    /// # Errors
    ///
    /// [`TeleopError::FatalConfig`] for an invalid config or model.  Tasks
    /// spawned before the failure see the stop signal drop and exit.
    pub async fn start(cfg: &Config) -> Result<Self, TeleopError> {
        cfg.validate()?;
        let models = cfg
            .robots
            .iter()
            .map(|r| r.load_model().map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        let recorded = cfg
            .recorded_robot()
            .ok_or_else(|| TeleopError::FatalConfig("no robot to record".to_string()))?;
        let recorded_model = models
            .iter()
            .find(|m| m.robot_id == recorded.robot_id)
            .ok_or_else(|| TeleopError::FatalConfig(format!("no model for '{}'", recorded.robot_id)))?;
        let episode_db = cfg.episode_db_path();
        if let Some(dir) = episode_db.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| TeleopError::FatalConfig(format!("cannot create {}: {e}", dir.display())))?;
        }
        let store = EpisodeStore::open(&episode_db)?;

        let bus = MessageBus::new();
        let (stop, stop_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let operator_config = OperatorConfig {
            rate_hz: cfg.operator_rate_hz,
            pose_loss_timeout_ms: cfg.pose_loss_timeout_ms,
        };

        let parts: Vec<TrackedPart> = models.iter().map(|m| m.source).collect();
        let poses = Arc::new(BusPoseSource::new(&bus, &parts)?);
        let mut operators = Vec::new();
        for model in &models {
            operators.push(Operator::new(model.clone(), poses.clone(), operator_config.clone())?);
        }
        let mut cameras = Vec::new();
        for id in &cfg.cameras {
            let camera = SimCamera::new(id.clone(), SIM_CAMERA_SIZE.0, SIM_CAMERA_SIZE.1);
            cameras.push(CameraDriver::new(bus.clone(), Box::new(camera), cfg.camera_rate_hz)?);
        }

        // Recorder first so the first command of a recording is never missed.
        let mut recorder_config = RecorderConfig::new(recorded.robot_id.clone(), recorded_model.source);
        for id in &cfg.cameras {
            recorder_config = recorder_config.with_camera(id.clone());
        }
        let recorder = RecorderService::new(bus.clone(), recorder_config).with_store(store);
        tasks.push(spawn_component("recorder", recorder.run(stop_rx.clone())));

        let mut supervisor = Supervisor::new(bus.clone());
        let period = Duration::from_secs_f64(1.0 / cfg.operator_rate_hz);
        for model in &models {
            let robot = &model.robot_id;
            let sink = SimSink::for_model(model);
            let driver = SinkDriver::new(bus.clone(), Box::new(sink));
            let rx = stop_rx.clone();
            tasks.push(spawn_component(&format!("sink/{robot}"), async move {
                driver.run(rx).await.map(|_| ())
            }));
            supervisor = supervisor
                .watch_topic(
                    &format!("operator/{robot}"),
                    &topics::diagnostics_name(robot),
                    (period * 4).max(Duration::from_millis(200)),
                )
                .watch_topic(&format!("sink/{robot}"), topics::state(robot).name(), Duration::from_secs(1));
        }
        for operator in operators {
            let name = format!("operator/{}", operator.robot_id());
            let service = OperatorService::new(bus.clone(), operator);
            tasks.push(spawn_component(&name, service.run(stop_rx.clone())));
        }
        let camera_period = Duration::from_secs_f64(1.0 / cfg.camera_rate_hz);
        for (id, driver) in cfg.cameras.iter().zip(cameras) {
            let rx = stop_rx.clone();
            tasks.push(spawn_component(&format!("camera/{id}"), async move {
                Ok::<_, TeleopError>(driver.run(rx).await)
            }));
            supervisor = supervisor.watch_topic(
                &format!("camera/{id}"),
                topics::camera(id).name(),
                (camera_period * 3).max(Duration::from_millis(500)),
            );
        }
        let health = supervisor.health();
        tasks.push(spawn_component("supervisor", supervisor.run(stop_rx.clone())));

        if cfg.demo_headset {
            let rx = stop_rx.clone();
            let headset_bus = bus.clone();
            tasks.push(spawn_component("headset", async move {
                Ok::<_, TeleopError>(demo::run(headset_bus, rx).await)
            }));
        } else {
            for side in [TrackedPart::LeftHand, TrackedPart::RightHand] {
                let transformer = HandKeypointTransformer::new(side, KeypointLayout::OCULUS, DEFAULT_SMOOTHING_WINDOW);
                let mut service = HandTransformService::new(bus.clone(), transformer);
                if let Some(dir) = &cfg.keypoint_log_dir {
                    let logger = KeypointLogger::new(side, dir, DEFAULT_AUTO_SAVE_INTERVAL, DEFAULT_SMOOTHING_WINDOW)?;
                    service = service.with_logger(logger);
                }
                tasks.push(spawn_component(&format!("hand/{side}"), service.run(stop_rx.clone())));
            }
        }

        let dashboard = SocketAddr::from(([0, 0, 0, 0], cfg.dashboard_port));
        let bridge = DiagnosticsBridge::new(bus.clone());
        for model in &models {
            let robot = &model.robot_id;
            let forwarders = [
                bridge.forward(&diagnostics_topic(robot), stop_rx.clone())?,
                bridge.forward(&topics::state(robot), stop_rx.clone())?,
                bridge.forward(&topics::command(robot), stop_rx.clone())?,
            ];
            tasks.extend(forwarders.into_iter().map(|h| (format!("bridge/{robot}"), h)));
        }
        let recorder_forwarder = bridge.forward(&status_topic(), stop_rx.clone())?;
        tasks.push(("bridge/recorder".to_string(), recorder_forwarder));
        tasks.push(spawn_component("bridge", bridge.run_ws_server(dashboard, stop_rx)));

        let robots: Vec<String> = models.iter().map(|m| m.robot_id.clone()).collect();
        info!(robots = ?robots, cameras = ?cfg.cameras, db = %episode_db.display(), "session started");
        Ok(Self {
            controller: Controller {
                bus,
                robots: robots.into(),
                stop: Arc::new(stop),
            },
            tasks,
            health,
            episode_db,
            dashboard,
        })
    }

    pub fn controller(&self) -> Controller {
        self.controller.clone()
    }

    pub fn robots(&self) -> &[String] {
        &self.controller.robots
    }

    pub fn dashboard(&self) -> SocketAddr {
        self.dashboard
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.borrow().clone()
    }

    /// Latest diagnostics of `robot_id`, if its operator has ticked.
    pub fn diagnostics(&self, robot_id: &str) -> Option<Arc<OperatorDiagnostics>> {
        self.controller
            .bus
            .subscribe(&diagnostics_topic(robot_id))
            .ok()
            .and_then(|sub| sub.latest())
    }

    /// Latest recorder progress.
    pub fn recorder_status(&self) -> Option<Arc<RecorderStatus>> {
        self.controller
            .bus
            .subscribe(&status_topic())
            .ok()
            .and_then(|sub| sub.latest())
    }

    pub async fn request(&self, request: ControlRequest) -> Result<ControlResponse, TeleopError> {
        self.controller.request(request).await
    }

    /// Every stored episode.
    pub fn episodes(&self) -> Result<Vec<EpisodeSummary>, TeleopError> {
        Ok(EpisodeStore::open(&self.episode_db)?.list()?)
    }

    /// Shut every component down and wait for it.
    pub async fn shutdown(self) {
        self.controller.shutdown().await;
        for (name, task) in self.tasks {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(component = %name, error = %e, "component panicked"),
                Err(_) => warn!(component = %name, "component did not stop in time"),
            }
        }
        info!("session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuiltinModel, RobotConfig};

    fn test_config(dir: &std::path::Path) -> Config {
        let mut cfg = Config {
            dashboard_port: 0,
            episode_db: Some(dir.join("episodes.db")),
            ..Config::default()
        };
        cfg.robots.push(RobotConfig::builtin("hand", BuiltinModel::Hand));
        cfg
    }

    async fn settle<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn record_pause_and_list_through_the_controller() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::start(&test_config(dir.path())).await.unwrap();
        assert_eq!(session.robots(), ["arm".to_string(), "hand".to_string()]);

        settle(|| session.diagnostics("arm").is_some_and(|d| d.last_seq.is_some())).await;

        let start = |id: &str| ControlRequest::StartRecording { episode_id: id.to_string() };
        let resp = session.request(start("demo-1")).await.unwrap();
        assert_eq!(resp, ControlResponse::Recording { episode_id: "demo-1".into() });
        settle(|| {
            session
                .recorder_status()
                .is_some_and(|s| s.episode_id.as_deref() == Some("demo-1") && s.steps > 0)
        })
        .await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let pause = ControlRequest::PauseOperator { robot_id: "hand".into() };
        assert_eq!(session.request(pause).await.unwrap(), ControlResponse::Ok);

        let resp = session.request(ControlRequest::StopRecording).await.unwrap();
        let ControlResponse::EpisodeSealed(summary) = resp else {
            panic!("unexpected {resp:?}");
        };
        assert!(summary.steps > 0);

        let episodes = session.episodes().unwrap();
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].episode_id, "demo-1");

        settle(|| session.health().iter().any(|(id, h)| id == "operator/arm" && h.is_healthy())).await;
        session.shutdown().await;
    }

    #[tokio::test]
    async fn bad_model_path_fails_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.robots[1].model_path = Some(dir.path().join("missing.toml"));
        let err = Session::start(&cfg).await.err().unwrap();
        assert!(err.is_fatal());
    }
}
