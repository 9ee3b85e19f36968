use std::fs;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

fn loopdemo(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_loopdemo"))
        .env_remove("LOOPDEMO_CONFIG")
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("failed to run loopdemo")
}

fn json_report(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "loopdemo failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is a JSON report")
}

#[test]
fn builtin_demo_evicts_the_faulty_routine() {
    let output = loopdemo(&["--backend", "recording", "--frames", "600", "--report", "json"]);
    let report = json_report(&output);

    assert_eq!(report["frames"], 600);
    assert_eq!(report["backend"]["kind"], "recording");
    assert!(report["routines_evicted"].as_u64().unwrap() >= 1);
    assert_eq!(report["failures"][0]["routine"], "glitch");
    assert_eq!(report["failures"][0]["stage"], "render");
    assert_eq!(report["idle_ticks"], 0);
}

#[test]
fn single_spinner_renders_every_frame() {
    let root = TempDir::new().unwrap();
    let config = root.path().join("spinner.toml");
    fs::write(
        &config,
        r#"
[host]
frame_delta = "8ms"

[[routines]]
name = "solo"
kind = "spinner"
"#,
    )
    .unwrap();

    let output = loopdemo(&[
        "--config",
        config.to_str().unwrap(),
        "--frames",
        "10",
        "--report",
        "json",
    ]);
    let report = json_report(&output);

    assert_eq!(report["frames_rendered"], 10);
    assert_eq!(report["delta_ms"], 8.0);
    assert_eq!(report["routines"][0]["name"], "solo");
    assert_eq!(report["routines"][0]["frames_rendered"], 10);
    assert_eq!(report["backend"]["draws"], 10);
}

#[test]
fn invalid_config_is_rejected() {
    let root = TempDir::new().unwrap();
    let config = root.path().join("dupes.toml");
    fs::write(
        &config,
        r#"
[[routines]]
name = "a"
kind = "spinner"

[[routines]]
name = "a"
kind = "animated"
"#,
    )
    .unwrap();

    let output = loopdemo(&["--config", config.to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid configuration"), "stderr: {stderr}");
    assert!(stderr.contains("defined more than once"), "stderr: {stderr}");
}

#[test]
fn unknown_start_routine_fails() {
    let output = loopdemo(&["--backend", "recording", "--routine", "teapot"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown routine 'teapot'"), "stderr: {stderr}");
}

#[test]
fn check_lists_configured_routines() {
    let root = TempDir::new().unwrap();
    let config = root.path().join("demo.toml");
    fs::write(
        &config,
        r##"
[[routines]]
name = "pulse"
kind = "animated"
textures = ["#ff0000", "missing"]

[[routines]]
name = "glitch"
kind = "faulty"
fail_after = 3
"##,
    )
    .unwrap();

    let output = loopdemo(&["check", config.to_str().unwrap()]);
    assert!(
        output.status.success(),
        "check failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("pulse"));
    assert!(stdout.contains("kind=faulty"));
}
