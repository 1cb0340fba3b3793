//! Configuration vault – reads/writes `~/.teleop/config.toml`.
//!
//! ```toml
//! dashboard_port = 9090
//! operator_rate_hz = 30.0
//! pose_loss_timeout_ms = 250
//! cameras = ["wrist"]
//!
//! [[robots]]
//! robot_id = "arm"
//! builtin = "arm"
//!
//! [[robots]]
//! robot_id = "left_hand"
//! model_path = "/etc/teleop/allegro.toml"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use teleop_middleware::topics;
use teleop_retarget::RetargetModel;
use teleop_types::TeleopError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for TeleopError {
    fn from(err: ConfigError) -> Self {
        TeleopError::FatalConfig(err.to_string())
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Robots
// ─────────────────────────────────────────────────────────────────────────────

/// Retarget models compiled into the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuiltinModel {
    #[default]
    Arm,
    Hand,
    /// Task-space arm driven by end-effector targets.
    Cartesian,
}

impl std::fmt::Display for BuiltinModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuiltinModel::Arm => write!(f, "arm"),
            BuiltinModel::Hand => write!(f, "hand"),
            BuiltinModel::Cartesian => write!(f, "cartesian"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotConfig {
    pub robot_id: String,
    /// Used when `model_path` is not set.
    #[serde(default)]
    pub builtin: BuiltinModel,
    /// TOML retarget model; its `robot_id` must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
}

impl RobotConfig {
    pub fn builtin(robot_id: impl Into<String>, builtin: BuiltinModel) -> Self {
        Self {
            robot_id: robot_id.into(),
            builtin,
            model_path: None,
        }
    }

    /// Load and validate the retarget model for this robot.
    ///
    /// # Errors
    ///
    /// [`TeleopError::FatalConfig`] when the file cannot be read, does not
    /// validate, or names another robot.
    pub fn load_model(&self) -> Result<RetargetModel, TeleopError> {
        let model = match &self.model_path {
            Some(path) => RetargetModel::load(path)?,
            None => match self.builtin {
                BuiltinModel::Arm => RetargetModel::demo_arm(&self.robot_id),
                BuiltinModel::Hand => RetargetModel::demo_hand(&self.robot_id),
                BuiltinModel::Cartesian => RetargetModel::demo_cartesian(&self.robot_id),
            },
        };
        if model.robot_id != self.robot_id {
            return Err(TeleopError::FatalConfig(format!(
                "model for '{}' is written for robot '{}'",
                self.robot_id, model.robot_id
            )));
        }
        model.validate()?;
        Ok(model)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

/// Persisted user configuration stored in `~/.teleop/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket port of the diagnostics bridge.
    #[serde(default = "default_dashboard_port")]
    pub dashboard_port: u16,

    #[serde(default = "default_operator_rate_hz")]
    pub operator_rate_hz: f64,

    #[serde(default = "default_pose_loss_timeout_ms")]
    pub pose_loss_timeout_ms: u64,

    #[serde(default = "default_camera_rate_hz")]
    pub camera_rate_hz: f64,

    /// Simulated cameras, recorded in every step.
    #[serde(default = "default_cameras")]
    pub cameras: Vec<String>,

    /// Drive the pose topics from a built-in synthetic headset instead of
    /// waiting for an external one.
    #[serde(default = "default_demo_headset")]
    pub demo_headset: bool,

    /// Log transformed hand keypoints here when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypoint_log_dir: Option<PathBuf>,

    /// Episode database; defaults to `~/.teleop/episodes.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_db: Option<PathBuf>,

    /// Robot whose command stream defines recorded steps; defaults to the
    /// first robot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_robot: Option<String>,

    #[serde(default = "default_robots")]
    pub robots: Vec<RobotConfig>,
}

fn default_dashboard_port() -> u16 {
    9090
}
fn default_operator_rate_hz() -> f64 {
    30.0
}
fn default_pose_loss_timeout_ms() -> u64 {
    250
}
fn default_camera_rate_hz() -> f64 {
    15.0
}
fn default_cameras() -> Vec<String> {
    vec!["wrist".to_string()]
}
fn default_demo_headset() -> bool {
    true
}
fn default_robots() -> Vec<RobotConfig> {
    vec![RobotConfig::builtin("arm", BuiltinModel::Arm)]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dashboard_port: default_dashboard_port(),
            operator_rate_hz: default_operator_rate_hz(),
            pose_loss_timeout_ms: default_pose_loss_timeout_ms(),
            camera_rate_hz: default_camera_rate_hz(),
            cameras: default_cameras(),
            demo_headset: default_demo_headset(),
            keypoint_log_dir: None,
            episode_db: None,
            record_robot: None,
            robots: default_robots(),
        }
    }
}

impl Config {
    /// The robot the recorder follows.
    pub fn recorded_robot(&self) -> Option<&RobotConfig> {
        match &self.record_robot {
            Some(id) => self.robots.iter().find(|r| &r.robot_id == id),
            None => self.robots.first(),
        }
    }

    pub fn episode_db_path(&self) -> PathBuf {
        self.episode_db
            .clone()
            .unwrap_or_else(|| data_dir().join("episodes.db"))
    }

    /// Structural checks; model files are checked when loaded.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.robots.is_empty() {
            return Err(ConfigError::Invalid("at least one robot is required".to_string()));
        }
        let mut seen = HashSet::new();
        for robot in &self.robots {
            if robot.robot_id.trim().is_empty() {
                return Err(ConfigError::Invalid("robot_id must not be empty".to_string()));
            }
            if topics::diagnostics_name(&robot.robot_id) == topics::RECORDER_DIAGNOSTICS {
                return Err(ConfigError::Invalid(format!(
                    "robot_id '{}' is reserved for the recorder",
                    robot.robot_id
                )));
            }
            if !seen.insert(robot.robot_id.as_str()) {
                return Err(ConfigError::Invalid(format!("robot '{}' listed twice", robot.robot_id)));
            }
        }
        for (name, rate) in [
            ("operator_rate_hz", self.operator_rate_hz),
            ("camera_rate_hz", self.camera_rate_hz),
        ] {
            if !(rate.is_finite() && rate > 0.0) {
                return Err(ConfigError::Invalid(format!("{name} must be positive, got {rate}")));
            }
        }
        if self.recorded_robot().is_none() {
            return Err(ConfigError::Invalid(format!(
                "record_robot '{}' is not a configured robot",
                self.record_robot.as_deref().unwrap_or_default()
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Paths
// ─────────────────────────────────────────────────────────────────────────────

fn home() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

/// `~/.teleop`
pub fn data_dir() -> PathBuf {
    PathBuf::from(home()).join(".teleop")
}

/// Return the path to `~/.teleop/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".teleop").join("config.toml")
}

// ─────────────────────────────────────────────────────────────────────────────
// Load / save
// ─────────────────────────────────────────────────────────────────────────────

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, ConfigError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(io_error(path))?;
    let mut cfg: Config = toml::from_str(&raw)?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `TELEOP_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TELEOP_DASHBOARD_PORT` | `dashboard_port` |
/// | `TELEOP_RATE_HZ` | `operator_rate_hz` |
/// | `TELEOP_POSE_LOSS_MS` | `pose_loss_timeout_ms` |
/// | `TELEOP_EPISODE_DB` | `episode_db` |
/// | `TELEOP_DEMO_HEADSET` | `demo_headset` (`true` / `false`) |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TELEOP_DASHBOARD_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.dashboard_port = port;
    }
    if let Ok(v) = std::env::var("TELEOP_RATE_HZ")
        && let Ok(rate) = v.parse::<f64>()
    {
        cfg.operator_rate_hz = rate;
    }
    if let Ok(v) = std::env::var("TELEOP_POSE_LOSS_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.pose_loss_timeout_ms = ms;
    }
    if let Ok(v) = std::env::var("TELEOP_EPISODE_DB")
        && !v.trim().is_empty()
    {
        cfg.episode_db = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("TELEOP_DEMO_HEADSET")
        && let Ok(flag) = v.parse::<bool>()
    {
        cfg.demo_headset = flag;
    }
}

/// Save the config to disk, creating `~/.teleop/` if necessary.
pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
        // Owner only (rwx------).
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(io_error(parent))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(io_error(path))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(io_error(path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path).unwrap();

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_config_with_robots() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let mut cfg = Config::default();
        cfg.robots.push(RobotConfig::builtin("hand", BuiltinModel::Hand));
        cfg.record_robot = Some("hand".to_string());
        save_to(&cfg, &path).unwrap();

        let loaded = load_from(&path).unwrap().unwrap();
        assert_eq!(loaded.robots, cfg.robots);
        assert_eq!(loaded.recorded_robot().map(|r| r.robot_id.as_str()), Some("hand"));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: Config = toml::from_str("dashboard_port = 7000").unwrap();
        assert_eq!(cfg.dashboard_port, 7000);
        assert_eq!(cfg.operator_rate_hz, 30.0);
        assert_eq!(cfg.pose_loss_timeout_ms, 250);
        assert_eq!(cfg.robots, default_robots());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_path_points_to_teleop_dir() {
        let p = config_path_for_home("/home/testuser");
        assert_eq!(p, PathBuf::from("/home/testuser/.teleop/config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).unwrap().is_none());
    }

    #[test]
    fn duplicate_robots_and_bad_rates_are_invalid() {
        let mut cfg = Config::default();
        cfg.robots.push(RobotConfig::builtin("arm", BuiltinModel::Hand));
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::default();
        cfg.operator_rate_hz = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.record_robot = Some("ghost".to_string());
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.robots.push(RobotConfig::builtin("recorder", BuiltinModel::Hand));
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn model_file_must_name_the_configured_robot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arm.toml");
        let model = RetargetModel::demo_arm("other");
        std::fs::write(&path, toml::to_string(&model).unwrap()).unwrap();

        let robot = RobotConfig {
            robot_id: "arm".to_string(),
            builtin: BuiltinModel::Arm,
            model_path: Some(path),
        };
        let err = robot.load_model().unwrap_err();
        assert!(err.is_fatal());
        assert!(RobotConfig::builtin("hand", BuiltinModel::Hand).load_model().is_ok());
        let ee = RobotConfig::builtin("ee", BuiltinModel::Cartesian).load_model().unwrap();
        assert_eq!(ee.embodiment.kind(), "cartesian");
    }

    #[test]
    fn apply_env_overrides_changes_fields() {
        // SAFETY: the only test in this crate touching these variables.
        unsafe {
            std::env::set_var("TELEOP_DASHBOARD_PORT", "9999");
            std::env::set_var("TELEOP_RATE_HZ", "not-a-rate");
            std::env::set_var("TELEOP_POSE_LOSS_MS", "500");
            std::env::set_var("TELEOP_DEMO_HEADSET", "false");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.dashboard_port, 9999);
        assert_eq!(cfg.operator_rate_hz, 30.0);
        assert_eq!(cfg.pose_loss_timeout_ms, 500);
        assert!(!cfg.demo_headset);
        unsafe {
            std::env::remove_var("TELEOP_DASHBOARD_PORT");
            std::env::remove_var("TELEOP_RATE_HZ");
            std::env::remove_var("TELEOP_POSE_LOSS_MS");
            std::env::remove_var("TELEOP_DEMO_HEADSET");
        }
    }
}
