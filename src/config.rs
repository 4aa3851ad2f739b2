use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::actuator::{ActuatorConfig, DEFAULT_ACTUATOR_PORT, DEFAULT_BAUD_RATE};
use crate::detect::{BackendRegistry, StubBackend, DEFAULT_STUB_CLASSES};
use crate::ingest::{
    CameraConfig, DEFAULT_CAMERA_SOURCE, DEFAULT_FRAME_HEIGHT, DEFAULT_FRAME_WIDTH,
    DEFAULT_TARGET_FPS,
};
use crate::orchestrator::{OrchestratorSettings, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::trigger::{TriggerSettings, DEFAULT_AUTO_SORT_DELAY, DEFAULT_MIN_DETECTIONS};

const DEFAULT_DB_PATH: &str = "smart_bin.db";
const DEFAULT_TRAINING_DIR: &str = "training_data";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8800";
const DEFAULT_MODEL_BACKEND: &str = "stub";

#[derive(Debug, Deserialize, Default)]
struct SmartBinConfigFile {
    db_path: Option<String>,
    training_dir: Option<PathBuf>,
    camera: Option<CameraConfigFile>,
    model: Option<ModelConfigFile>,
    trigger: Option<TriggerConfigFile>,
    learning: Option<LearningConfigFile>,
    actuator: Option<ActuatorConfigFile>,
    prompt: Option<PromptConfigFile>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    backend: Option<String>,
    path: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    class_names: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct TriggerConfigFile {
    min_detections: Option<u32>,
    auto_sort_delay_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct LearningConfigFile {
    enabled: Option<bool>,
    save_images: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct ActuatorConfigFile {
    port: Option<String>,
    baud_rate: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct PromptConfigFile {
    mode: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct SmartBinConfig {
    pub db_path: String,
    pub training_dir: PathBuf,
    pub camera: CameraConfig,
    pub model: ModelSettings,
    pub trigger: TriggerSettings,
    pub learning: LearningSettings,
    pub actuator: ActuatorConfig,
    pub prompt: PromptSettings,
    pub api: ApiSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    /// Detector backend name: `stub`, or `tract` with feature `backend-tract`.
    pub backend: String,
    pub path: Option<PathBuf>,
    pub confidence_threshold: f32,
    /// Model class names by class id.
    pub class_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LearningSettings {
    pub enabled: bool,
    pub save_images: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    /// Questions are asked on the terminal.
    Console,
    /// Questions are queued for the HTTP API.
    Api,
}

impl FromStr for PromptMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" => Ok(PromptMode::Console),
            "api" => Ok(PromptMode::Api),
            other => Err(anyhow!("unknown prompt mode '{}' (expected console or api)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptSettings {
    pub mode: PromptMode,
    /// Unanswered questions are skipped after this long.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub addr: String,
    pub enabled: bool,
}

impl SmartBinConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SMART_BIN_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SmartBinConfigFile) -> Result<Self> {
        let camera_file = file.camera.unwrap_or_default();
        let camera = CameraConfig {
            source: camera_file
                .source
                .unwrap_or_else(|| DEFAULT_CAMERA_SOURCE.to_string()),
            width: camera_file.width.unwrap_or(DEFAULT_FRAME_WIDTH),
            height: camera_file.height.unwrap_or(DEFAULT_FRAME_HEIGHT),
            target_fps: camera_file.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
        };

        let model_file = file.model.unwrap_or_default();
        let model = ModelSettings {
            backend: model_file
                .backend
                .unwrap_or_else(|| DEFAULT_MODEL_BACKEND.to_string()),
            path: model_file.path,
            confidence_threshold: model_file
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            class_names: model_file.class_names.unwrap_or_else(|| {
                DEFAULT_STUB_CLASSES.iter().map(|c| c.to_string()).collect()
            }),
        };

        let trigger_file = file.trigger.unwrap_or_default();
        let trigger = TriggerSettings {
            min_detections: trigger_file.min_detections.unwrap_or(DEFAULT_MIN_DETECTIONS),
            cooldown: match trigger_file.auto_sort_delay_secs {
                Some(secs) => delay_from_secs(secs)?,
                None => DEFAULT_AUTO_SORT_DELAY,
            },
        };

        let learning_file = file.learning.unwrap_or_default();
        let learning = LearningSettings {
            enabled: learning_file.enabled.unwrap_or(true),
            save_images: learning_file.save_images.unwrap_or(true),
        };

        let actuator_file = file.actuator.unwrap_or_default();
        let actuator = ActuatorConfig {
            port: match actuator_file.port {
                Some(port) => port_setting(&port),
                None => Some(DEFAULT_ACTUATOR_PORT.to_string()),
            },
            baud_rate: actuator_file.baud_rate.unwrap_or(DEFAULT_BAUD_RATE),
        };

        let prompt_file = file.prompt.unwrap_or_default();
        let prompt = PromptSettings {
            mode: match prompt_file.mode {
                Some(mode) => mode.parse()?,
                None => PromptMode::Console,
            },
            timeout: timeout_setting(prompt_file.timeout_secs),
        };

        let api_file = file.api.unwrap_or_default();
        let api = ApiSettings {
            addr: api_file
                .addr
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            enabled: api_file.enabled.unwrap_or(true),
        };

        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            training_dir: file
                .training_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TRAINING_DIR)),
            camera,
            model,
            trigger,
            learning,
            actuator,
            prompt,
            api,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = non_empty_env("SMART_BIN_DB_PATH") {
            self.db_path = path;
        }
        if let Some(dir) = non_empty_env("SMART_BIN_TRAINING_DIR") {
            self.training_dir = PathBuf::from(dir);
        }
        if let Some(source) = non_empty_env("SMART_BIN_CAMERA") {
            self.camera.source = source;
        }
        if let Some(port) = non_empty_env("SMART_BIN_ACTUATOR_PORT") {
            self.actuator.port = port_setting(&port);
        }
        if let Some(enabled) = non_empty_env("SMART_BIN_LEARNING_MODE") {
            self.learning.enabled = parse_bool(&enabled)
                .ok_or_else(|| anyhow!("SMART_BIN_LEARNING_MODE must be true or false"))?;
        }
        if let Some(count) = non_empty_env("SMART_BIN_MIN_DETECTIONS") {
            self.trigger.min_detections = count
                .parse()
                .map_err(|_| anyhow!("SMART_BIN_MIN_DETECTIONS must be a positive integer"))?;
        }
        if let Some(delay) = non_empty_env("SMART_BIN_AUTO_SORT_DELAY") {
            let secs: f64 = delay
                .parse()
                .map_err(|_| anyhow!("SMART_BIN_AUTO_SORT_DELAY must be a number of seconds"))?;
            self.trigger.cooldown = delay_from_secs(secs)?;
        }
        if let Some(mode) = non_empty_env("SMART_BIN_PROMPT_MODE") {
            self.prompt.mode = mode.parse()?;
        }
        if let Some(timeout) = non_empty_env("SMART_BIN_PROMPT_TIMEOUT_SECS") {
            let secs: u64 = timeout.parse().map_err(|_| {
                anyhow!("SMART_BIN_PROMPT_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.prompt.timeout = timeout_setting(Some(secs));
        }
        if let Some(addr) = non_empty_env("SMART_BIN_API_ADDR") {
            self.api.addr = addr;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.trigger.min_detections == 0 {
            return Err(anyhow!("trigger.min_detections must be at least 1"));
        }
        let threshold = self.model.confidence_threshold;
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!("model.confidence_threshold must be within 0..=1"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        if self.camera.source.trim().is_empty() {
            return Err(anyhow!("camera.source must not be empty"));
        }
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        self.model.backend = self.model.backend.trim().to_ascii_lowercase();
        if !matches!(self.model.backend.as_str(), "stub" | "tract") {
            return Err(anyhow!(
                "unknown model backend '{}' (expected stub or tract)",
                self.model.backend
            ));
        }
        if self.model.backend == "tract" && self.model.path.is_none() {
            return Err(anyhow!("model.path is required for the tract backend"));
        }
        Ok(())
    }

    /// Pipeline settings derived from this configuration.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            learning_mode: self.learning.enabled,
            min_confidence: self.model.confidence_threshold,
            trigger: self.trigger,
        }
    }

    /// Detector backends for `model.backend`; the selected one is the default.
    pub fn detector_registry(&self) -> Result<BackendRegistry> {
        let mut registry = BackendRegistry::new();
        match self.model.backend.as_str() {
            "stub" => registry.register(StubBackend::with_classes(self.model.class_names.clone())),
            #[cfg(feature = "backend-tract")]
            "tract" => {
                let path = self
                    .model
                    .path
                    .as_ref()
                    .ok_or_else(|| anyhow!("model.path is required for the tract backend"))?;
                registry.register(crate::detect::TractBackend::new(
                    path,
                    self.camera.width,
                    self.camera.height,
                    self.model.class_names.clone(),
                )?);
            }
            #[cfg(not(feature = "backend-tract"))]
            "tract" => {
                return Err(anyhow!(
                    "model backend 'tract' requires building with feature 'backend-tract'"
                ))
            }
            other => return Err(anyhow!("unknown model backend '{}'", other)),
        }
        Ok(registry)
    }
}

fn read_config_file(path: &Path) -> Result<SmartBinConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn delay_from_secs(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(anyhow!("auto sort delay must be a non-negative number of seconds"));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| anyhow!("auto sort delay out of range: {}", e))
}

/// `none` (or `simulated`) disables the serial port.
fn port_setting(port: &str) -> Option<String> {
    match port.trim() {
        "" | "none" | "simulated" => None,
        port => Some(port.to_string()),
    }
}

/// Zero means wait forever.
fn timeout_setting(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|secs| *secs > 0).map(Duration::from_secs)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_stock_station() {
        let cfg = SmartBinConfig::from_file(SmartBinConfigFile::default()).unwrap();
        assert_eq!(cfg.db_path, DEFAULT_DB_PATH);
        assert_eq!(cfg.camera.source, DEFAULT_CAMERA_SOURCE);
        #[cfg(not(feature = "ingest-v4l2"))]
        assert!(cfg.camera.source.starts_with("stub://"));
        assert_eq!((cfg.camera.width, cfg.camera.height), (640, 480));
        assert_eq!(cfg.model.confidence_threshold, 0.6);
        assert_eq!(cfg.trigger.min_detections, 3);
        assert_eq!(cfg.trigger.cooldown, Duration::from_secs(2));
        assert!(cfg.learning.enabled && cfg.learning.save_images);
        assert_eq!(cfg.actuator.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(cfg.actuator.baud_rate, 9600);
        assert_eq!(cfg.prompt.mode, PromptMode::Console);
        assert_eq!(cfg.prompt.timeout, None);
    }

    #[test]
    fn helper_parsers() {
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(port_setting(" none "), None);
        assert_eq!(port_setting("/dev/ttyUSB0"), Some("/dev/ttyUSB0".to_string()));
        assert_eq!(timeout_setting(Some(0)), None);
        assert!(delay_from_secs(-1.0).is_err());
        assert!(delay_from_secs(f64::NAN).is_err());
        assert_eq!(delay_from_secs(0.5).unwrap(), Duration::from_millis(500));
        assert!("telepathy".parse::<PromptMode>().is_err());
    }

    #[test]
    fn validation_normalizes_and_rejects_backends() {
        let mut cfg = SmartBinConfig::from_file(SmartBinConfigFile::default()).unwrap();
        cfg.model.backend = " STUB ".to_string();
        cfg.validate().unwrap();
        assert_eq!(cfg.detector_registry().unwrap().list(), vec!["stub".to_string()]);

        cfg.model.backend = "darknet".to_string();
        assert!(cfg.validate().is_err());

        cfg.model.backend = "tract".to_string();
        cfg.model.path = None;
        assert!(cfg.validate().is_err());
    }
}
