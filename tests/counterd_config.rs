use std::io::Write;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use intersection_counter::config::CounterdConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "COUNTER_CONFIG",
        "COUNTER_SOURCE",
        "COUNTER_ZONES_PATH",
        "COUNTER_DB_PATH",
        "COUNTER_FALLBACK_DIR",
        "COUNTER_STORE_ENABLED",
        "COUNTER_STRIDE",
        "COUNTER_ALLOWED_CLASSES",
        "COUNTER_CONFIDENCE",
        "COUNTER_DETECTOR",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, body: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(body.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = CounterdConfig::load().expect("load config");
    assert_eq!(cfg.source.url, "stub://intersection");
    assert_eq!((cfg.source.width, cfg.source.height), (1248, 704));
    assert_eq!(cfg.stride, 3);
    assert_eq!(cfg.flush_min_frames, 4500);
    assert_eq!(cfg.flush_min_records, 11);
    assert_eq!(cfg.allowed_classes, vec!["car", "bus", "truck"]);
    assert_eq!(cfg.store.deadline.as_secs(), 5);
    assert!(cfg.store.enabled);
    assert_eq!(cfg.detector.backend, "stub");
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".json",
        r#"{
            "source": { "url": "/srv/video/junction.rgb", "width": 640, "height": 360 },
            "zones_path": "/etc/counter/polygons.json",
            "store": { "db_path": "traffic.db", "deadline_secs": 2, "fallback_dir": "/var/lib/counter" },
            "pipeline": { "stride": 2, "flush_min_frames": 100, "flush_min_records": 3,
                          "allowed_classes": ["Car", "bus", "car"] },
            "detector": { "backend": "replay", "replay_path": "detections.jsonl",
                          "confidence_threshold": 0.4 },
            "tracker": { "confirm_hits": 2, "max_age": 10 }
        }"#,
    );

    std::env::set_var("COUNTER_CONFIG", file.path());
    std::env::set_var("COUNTER_DB_PATH", "override.db");
    std::env::set_var("COUNTER_STRIDE", "5");
    std::env::set_var("COUNTER_CONFIDENCE", "0.7");

    let cfg = CounterdConfig::load().expect("load config");

    assert_eq!(cfg.source.url, "/srv/video/junction.rgb");
    assert_eq!(cfg.source.width, 640);
    assert_eq!(cfg.zones_path.to_str(), Some("/etc/counter/polygons.json"));
    assert_eq!(cfg.store.db_path, "override.db");
    assert_eq!(cfg.store.deadline.as_secs(), 2);
    assert_eq!(cfg.store.fallback_dir.to_str(), Some("/var/lib/counter"));
    assert_eq!(cfg.stride, 5);
    assert_eq!(cfg.flush_min_frames, 100);
    assert_eq!(cfg.flush_min_records, 3);
    assert_eq!(cfg.allowed_classes, vec!["car", "bus"]);
    assert_eq!(cfg.detector.backend, "replay");
    assert!((cfg.detector.confidence_threshold - 0.7).abs() < 1e-6);
    assert_eq!(cfg.tracker.confirm_hits, 2);
    assert_eq!(cfg.tracker.max_age, 10);
    assert!((cfg.tracker.iou_threshold - 0.3).abs() < 1e-6);

    let settings = cfg.pipeline_settings();
    assert!(settings.allowed_classes.contains("car"));
    assert_eq!(settings.stride, 5);

    clear_env();
}

#[test]
fn loads_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".toml",
        r#"
zones_path = "zones.json"

[pipeline]
stride = 1
allowed_classes = ["motorbike"]
"#,
    );
    std::env::set_var("COUNTER_ALLOWED_CLASSES", "car, truck");
    let cfg = CounterdConfig::load_from(Some(file.path())).expect("load config");

    assert_eq!(cfg.zones_path.to_str(), Some("zones.json"));
    assert_eq!(cfg.stride, 1);
    assert_eq!(cfg.allowed_classes, vec!["car", "truck"]);

    clear_env();
}

#[test]
fn store_can_be_disabled() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".toml",
        r#"
[store]
enabled = false
db_path = "unused.db"
"#,
    );
    let cfg = CounterdConfig::load_from(Some(file.path())).expect("load config");
    assert!(!cfg.store.enabled);
    assert_eq!(cfg.store.db_path, "unused.db");

    std::env::set_var("COUNTER_STORE_ENABLED", "yes");
    let cfg = CounterdConfig::load_from(Some(file.path())).expect("load config");
    assert!(cfg.store.enabled);

    std::env::set_var("COUNTER_STORE_ENABLED", "0");
    assert!(!CounterdConfig::load().expect("load config").store.enabled);

    std::env::set_var("COUNTER_STORE_ENABLED", "maybe");
    assert!(CounterdConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("COUNTER_STRIDE", "0");
    assert!(CounterdConfig::load().is_err());
    std::env::set_var("COUNTER_STRIDE", "three");
    assert!(CounterdConfig::load().is_err());
    std::env::remove_var("COUNTER_STRIDE");

    std::env::set_var("COUNTER_CONFIDENCE", "1.5");
    assert!(CounterdConfig::load().is_err());
    std::env::remove_var("COUNTER_CONFIDENCE");

    std::env::set_var("COUNTER_DETECTOR", "replay");
    assert!(CounterdConfig::load().is_err());
    std::env::set_var("COUNTER_DETECTOR", "yolo");
    assert!(CounterdConfig::load().is_err());

    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("COUNTER_CONFIG", "/nonexistent/counter.json");
    assert!(CounterdConfig::load().is_err());

    clear_env();
}
