use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_rjswarm"))
}

fn tmp_path(filename: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("rjswarm_cli_{}_{}_{}", std::process::id(), nanos, filename));
    p
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

fn write_config(name: &str, body: &str) -> PathBuf {
    let path = tmp_path(name);
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn version_smoke() {
    let out = run(&["version"]);
    assert!(out.status.success(), "version should succeed");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("rjswarm "), "unexpected stdout: {}", stdout);
}

#[test]
fn run_gaussian_writes_summary_to_stdout() {
    let cfg = write_config(
        "gauss.json",
        r#"{"burn_in_length": 100, "max_iterations": 200, "k_max": 1, "n_chains": 2, "t_start": 1.0,
            "chi_scaled_temperature": false}"#,
    );
    let out = run(&["run", "--config", cfg.to_string_lossy().as_ref(), "--model", "gaussian", "--seed", "3"]);
    assert!(out.status.success(), "run should succeed, stderr={}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("stdout should be JSON");
    let probs = v.get("model_probabilities").and_then(|x| x.as_array()).expect("model_probabilities array");
    assert_eq!(probs.len(), 1);
    assert_eq!(v["chains"].as_array().map(|c| c.len()), Some(2));
    assert_eq!(v["total_iterations"].as_u64(), Some(600));
    let _ = std::fs::remove_file(cfg);
}

#[test]
fn run_full_then_summarize() {
    let cfg = write_config("bursts.yaml", "burn_in_length: 50\nmax_iterations: 100\nk_max: 3\nn_chains: 2\n");
    let full = tmp_path("full.json");
    let out = run(&[
        "run",
        "--config",
        cfg.to_string_lossy().as_ref(),
        "--model",
        "bursts",
        "--full",
        "--output",
        full.to_string_lossy().as_ref(),
    ]);
    assert!(out.status.success(), "run --full should succeed, stderr={}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&full).unwrap()).unwrap();
    let chains = v["chains"].as_array().expect("chains array");
    assert_eq!(chains.len(), 2);
    assert_eq!(chains[0]["k_trace"].as_array().map(|t| t.len()), Some(150));

    let out = run(&["summarize", "--input", full.to_string_lossy().as_ref()]);
    assert!(out.status.success(), "summarize should succeed, stderr={}", String::from_utf8_lossy(&out.stderr));
    let s: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(s["model_probabilities"].as_array().map(|p| p.len()), Some(3));

    let _ = std::fs::remove_file(cfg);
    let _ = std::fs::remove_file(full);
}

#[test]
fn unknown_topology_fails_before_sampling() {
    let cfg = write_config("bad.json", r#"{"topology": "hexagon"}"#);
    let out = run(&["run", "--config", cfg.to_string_lossy().as_ref()]);
    assert!(!out.status.success(), "unknown topology must fail");
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("hexagon"), "stderr should name the topology: {}", stderr);
    let _ = std::fs::remove_file(cfg);
}

#[test]
fn unknown_model_fails() {
    let out = run(&["run", "--model", "lorentzian"]);
    assert!(!out.status.success());
}
