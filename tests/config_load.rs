use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use smart_bin::config::{PromptMode, SmartBinConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SMART_BIN_CONFIG",
        "SMART_BIN_DB_PATH",
        "SMART_BIN_TRAINING_DIR",
        "SMART_BIN_CAMERA",
        "SMART_BIN_ACTUATOR_PORT",
        "SMART_BIN_LEARNING_MODE",
        "SMART_BIN_MIN_DETECTIONS",
        "SMART_BIN_AUTO_SORT_DELAY",
        "SMART_BIN_PROMPT_MODE",
        "SMART_BIN_PROMPT_TIMEOUT_SECS",
        "SMART_BIN_API_ADDR",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "db_path": "station_a.db",
            "training_dir": "/var/lib/smart-bin/training",
            "camera": { "source": "stub://belt?frames=20", "width": 320, "height": 240 },
            "model": { "confidence_threshold": 0.75, "class_names": ["can", "banana_peel"] },
            "trigger": { "min_detections": 5, "auto_sort_delay_secs": 1.5 },
            "learning": { "enabled": false, "save_images": false },
            "actuator": { "port": "/dev/ttyUSB1", "baud_rate": 115200 },
            "prompt": { "mode": "api", "timeout_secs": 30 },
            "api": { "addr": "127.0.0.1:9100", "enabled": false }
        }"#,
    );

    std::env::set_var("SMART_BIN_CONFIG", file.path());
    std::env::set_var("SMART_BIN_MIN_DETECTIONS", "2");
    std::env::set_var("SMART_BIN_ACTUATOR_PORT", "none");
    std::env::set_var("SMART_BIN_LEARNING_MODE", "yes");

    let cfg = SmartBinConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "station_a.db");
    assert_eq!(cfg.training_dir.to_str(), Some("/var/lib/smart-bin/training"));
    assert_eq!(cfg.camera.source, "stub://belt?frames=20");
    assert_eq!((cfg.camera.width, cfg.camera.height), (320, 240));
    assert_eq!(cfg.camera.target_fps, 10);
    assert_eq!(cfg.model.backend, "stub");
    assert_eq!(cfg.model.confidence_threshold, 0.75);
    assert_eq!(cfg.model.class_names, vec!["can", "banana_peel"]);
    assert_eq!(cfg.trigger.min_detections, 2);
    assert_eq!(cfg.trigger.cooldown, Duration::from_millis(1500));
    assert!(cfg.learning.enabled);
    assert!(!cfg.learning.save_images);
    assert_eq!(cfg.actuator.port, None);
    assert_eq!(cfg.actuator.baud_rate, 115200);
    assert_eq!(cfg.prompt.mode, PromptMode::Api);
    assert_eq!(cfg.prompt.timeout, Some(Duration::from_secs(30)));
    assert_eq!(cfg.api.addr, "127.0.0.1:9100");
    assert!(!cfg.api.enabled);

    let settings = cfg.orchestrator_settings();
    assert!(settings.learning_mode);
    assert_eq!(settings.min_confidence, 0.75);

    clear_env();
}

#[test]
fn defaults_apply_without_a_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SMART_BIN_CAMERA", "stub://demo");
    std::env::set_var("SMART_BIN_AUTO_SORT_DELAY", "0");

    let cfg = SmartBinConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "smart_bin.db");
    assert_eq!(cfg.camera.source, "stub://demo");
    assert_eq!(cfg.trigger.min_detections, 3);
    assert_eq!(cfg.trigger.cooldown, Duration::ZERO);
    assert_eq!(cfg.actuator.port.as_deref(), Some("/dev/ttyACM0"));
    assert_eq!(cfg.api.addr, "127.0.0.1:8800");
    assert!(cfg.api.enabled);

    clear_env();
}

#[test]
fn rejects_invalid_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SMART_BIN_MIN_DETECTIONS", "0");
    assert!(SmartBinConfig::load().is_err());
    clear_env();

    std::env::set_var("SMART_BIN_AUTO_SORT_DELAY", "-2");
    assert!(SmartBinConfig::load().is_err());
    clear_env();

    std::env::set_var("SMART_BIN_PROMPT_MODE", "carrier_pigeon");
    assert!(SmartBinConfig::load().is_err());
    clear_env();

    let file = write_config(r#"{ "model": { "confidence_threshold": 1.5 } }"#);
    std::env::set_var("SMART_BIN_CONFIG", file.path());
    assert!(SmartBinConfig::load().is_err());
    clear_env();

    let file = write_config(r#"{ "camera": { "width": 0 } }"#);
    std::env::set_var("SMART_BIN_CONFIG", file.path());
    assert!(SmartBinConfig::load().is_err());
    clear_env();

    let file = write_config("{ not json");
    std::env::set_var("SMART_BIN_CONFIG", file.path());
    assert!(SmartBinConfig::load().is_err());
    clear_env();
}
