use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use camwatch::config::CamwatchConfig;
use camwatch::{BoundingBox, Detection, Overlay, SourceDescriptor};
use image::RgbImage;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAMWATCH_CONFIG",
        "CAMWATCH_ADDR",
        "CAMWATCH_SNAPSHOT_DIR",
        "CAMWATCH_DETECTOR",
        "CAMWATCH_MODEL_PATH",
        "CAMWATCH_CONFIDENCE",
        "CAMWATCH_ALERT_SOUND",
        "CAMWATCH_FONT_PATH",
        "CAMWATCH_CAMERAS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    let mut file = Builder::new().suffix(".json").tempfile().expect("temp config");
    let json = r#"{
        "api": { "addr": "127.0.0.1:9000" },
        "snapshot_dir": "/var/lib/camwatch/snaps",
        "detection": { "confidence": 0.5, "monitored_label": "person" },
        "alert": { "cooldown_secs": 2, "snapshot_cooldown_secs": 10, "player": ["aplay"] },
        "capture": { "width": 320, "height": 240, "target_fps": 15, "jpeg_quality": 90 },
        "retry": { "initial_backoff_ms": 50, "max_backoff_ms": 500, "max_consecutive_failures": 20 },
        "cameras": [
            { "id": "laptop", "url": 0 },
            { "id": "door", "url": "rtsp://10.0.0.5/stream" }
        ]
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("CAMWATCH_CONFIG", file.path());
    std::env::set_var("CAMWATCH_CONFIDENCE", "0.75");
    std::env::set_var("CAMWATCH_FONT_PATH", "/usr/share/fonts/DejaVuSans.ttf");

    let cfg = CamwatchConfig::load().expect("load config");
    assert_eq!(cfg.api_addr, "127.0.0.1:9000");
    assert_eq!(cfg.snapshot_dir, PathBuf::from("/var/lib/camwatch/snaps"));
    assert_eq!(cfg.detection.confidence, 0.75);
    assert_eq!(cfg.detection.backend, camwatch::config::DEFAULT_BACKEND);
    assert_eq!(cfg.alert.cooldown, Duration::from_secs(2));
    assert_eq!(cfg.alert.snapshot_cooldown, Duration::from_secs(10));
    assert_eq!(cfg.alert.player, vec!["aplay".to_string()]);
    assert_eq!(cfg.capture.width, 320);
    assert_eq!(cfg.capture.target_fps, 15);
    assert_eq!(cfg.jpeg_quality, 90);
    assert_eq!(cfg.retry.initial_backoff, Duration::from_millis(50));
    assert_eq!(cfg.retry.max_consecutive_failures, 20);
    assert_eq!(
        cfg.font_path,
        Some(PathBuf::from("/usr/share/fonts/DejaVuSans.ttf"))
    );
    assert_eq!(cfg.cameras.len(), 2);
    assert_eq!(cfg.cameras[0].source, SourceDescriptor::Device(0));
    assert_eq!(
        cfg.cameras[1].source,
        SourceDescriptor::Uri("rtsp://10.0.0.5/stream".to_string())
    );

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
snapshot_dir = "snaps"
shutdown_timeout_secs = 9

[detection]
backend = "stub"
iou = 0.5

[[cameras]]
id = "garage"
url = "stub://garage"
"#;
    file.write_all(toml.as_bytes()).expect("write config");
    std::env::set_var("CAMWATCH_CONFIG", file.path());
    std::env::set_var("CAMWATCH_CAMERAS", "porch=stub://porch,laptop=0");

    let cfg = CamwatchConfig::load().expect("load config");
    assert_eq!(cfg.snapshot_dir, PathBuf::from("snaps"));
    assert_eq!(cfg.shutdown_timeout, Duration::from_secs(9));
    assert_eq!(cfg.detection.iou, 0.5);
    assert_eq!(cfg.api_addr, "0.0.0.0:5000");
    // env camera list replaces the file's
    let ids: Vec<&str> = cfg.cameras.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["porch", "laptop"]);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    std::env::set_var("CAMWATCH_CONFIDENCE", "not-a-number");
    assert!(CamwatchConfig::load().is_err());

    std::env::set_var("CAMWATCH_CONFIDENCE", "1.2");
    assert!(CamwatchConfig::load().is_err());
    std::env::remove_var("CAMWATCH_CONFIDENCE");

    std::env::set_var("CAMWATCH_CAMERAS", "dup=0,dup=1");
    assert!(CamwatchConfig::load().is_err());
    std::env::remove_var("CAMWATCH_CAMERAS");

    let mut file = Builder::new().suffix(".json").tempfile().expect("temp config");
    file.write_all(br#"{ "alert": { "cooldown_secs": 0 } }"#)
        .expect("write config");
    std::env::set_var("CAMWATCH_CONFIG", file.path());
    assert!(CamwatchConfig::load().is_err());

    std::env::set_var("CAMWATCH_CONFIG", "/definitely/not/here.json");
    assert!(CamwatchConfig::load().is_err());

    clear_env();
}

#[test]
fn defaults_without_any_config() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    let cfg = CamwatchConfig::load().expect("defaults load");
    assert_eq!(cfg.api_addr, "0.0.0.0:5000");
    assert_eq!(cfg.snapshot_dir, PathBuf::from("detected_persons"));
    assert_eq!(cfg.detection.monitored_label, "person");
    assert!(cfg.font_path.is_none());
    assert!(cfg.cameras.is_empty());
    if cfg!(feature = "backend-tract") {
        assert_eq!(cfg.detection.backend, "tract");
    } else {
        assert_eq!(cfg.detection.backend, "stub");
    }
}

#[test]
fn default_overlay_draws_captions_and_banner() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    let cfg = CamwatchConfig::load().expect("defaults load");
    let overlay = Overlay::load(&cfg.detection.monitored_label, cfg.font_path.as_deref());
    assert!(overlay.has_text());

    let person = Detection::new(
        "person",
        0.91,
        BoundingBox::new(100.0, 120.0, 160.0, 200.0).expect("valid box"),
    );
    let mut image = RgbImage::new(320, 240);
    overlay.draw(&mut image, &[person], "porch", true);

    let lit = |xs: std::ops::Range<u32>, ys: std::ops::Range<u32>| {
        ys.flat_map(|y| xs.clone().map(move |x| (x, y)))
            .filter(|&(x, y)| image.get_pixel(x, y).0 != [0, 0, 0])
            .count()
    };
    // banner starts at (20, 40); the caption sits just above the box
    assert!(lit(20..300, 40..70) > 50);
    assert!(lit(100..200, 100..118) > 20);
}
