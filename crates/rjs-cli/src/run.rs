//! `rjswarm run` orchestration: config loading, demo models and output shaping.

use anyhow::{Result, bail};
use rjs_inference::diagnostics::{QualityGates, compute_diagnostics, quality_summary};
use rjs_inference::toy::{GaussianTarget, SyntheticBursts};
use rjs_inference::{RunConfig, SamplerResult, sample_rjmcmc};
use std::path::Path;

/// Read a run config from JSON (`.json`) or YAML (anything else) and validate it.
pub fn read_run_config(path: &Path) -> Result<RunConfig> {
    let bytes = std::fs::read(path)?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
    let cfg: RunConfig = if ext == "json" {
        serde_json::from_slice(&bytes)?
    } else {
        // Default: YAML (serde_yaml_ng).
        serde_yaml_ng::from_slice(&bytes)?
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Built-in likelihoods the CLI can sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DemoModel {
    /// `GaussianTarget` centred on the given value.
    Gaussian(f64),
    /// `SyntheticBursts::demo` with the given number of true bursts.
    Bursts(usize),
}

impl DemoModel {
    /// Parse `gaussian` / `bursts` with their numeric argument.
    pub fn parse(name: &str, center: f64, n_bursts: usize) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "gaussian" => Ok(DemoModel::Gaussian(center)),
            "bursts" => {
                if n_bursts == 0 {
                    bail!("--bursts must be >= 1");
                }
                Ok(DemoModel::Bursts(n_bursts))
            }
            other => bail!("unknown model '{other}' (expected gaussian or bursts)"),
        }
    }

    /// Sample this model with `cfg`. Burst data are generated from `cfg.seed`.
    pub fn sample(&self, cfg: &RunConfig) -> Result<SamplerResult> {
        let result = match *self {
            DemoModel::Gaussian(center) => sample_rjmcmc(&GaussianTarget::new(center, 1.0), cfg)?,
            DemoModel::Bursts(n) => sample_rjmcmc(&SyntheticBursts::demo(n, cfg.seed), cfg)?,
        };
        Ok(result)
    }
}

/// Compact run summary: model probabilities, global best and diagnostics.
pub fn summary_json(result: &SamplerResult) -> Result<serde_json::Value> {
    let diag = compute_diagnostics(result);
    let quality = quality_summary(&diag, &QualityGates::default());
    for w in &quality.warnings {
        tracing::warn!("{w}");
    }
    let probabilities: Vec<serde_json::Value> = result
        .model_probabilities(true)
        .into_iter()
        .map(|(k, p)| serde_json::json!({ "k": k, "probability": p }))
        .collect();
    let chains: Vec<serde_json::Value> = result
        .chains
        .iter()
        .map(|c| {
            serde_json::json!({
                "chain_id": c.chain_id,
                "iterations": c.iterations,
                "best_chi": c.best.chi,
                "best_k": c.best.k,
                "jumps_attempted": c.jumps_attempted,
                "jumps_accepted": c.jumps_accepted,
            })
        })
        .collect();
    Ok(serde_json::json!({
        "model_probabilities": probabilities,
        "global_best": result.global_best,
        "total_iterations": result.total_iterations,
        "chains": chains,
        "diagnostics": serde_json::to_value(&diag)?,
        "quality": serde_json::to_value(&quality)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!("rjswarm_run_{}_{}_{}", std::process::id(), nanos, name))
    }

    #[test]
    fn test_read_run_config_json_and_yaml() {
        let json = tmp_path("cfg.json");
        std::fs::write(&json, r#"{"n_chains": 3, "topology": "ring"}"#).unwrap();
        let cfg = read_run_config(&json).unwrap();
        assert_eq!(cfg.n_chains, 3);
        assert_eq!(cfg.burn_in_length, 5000);

        let yaml = tmp_path("cfg.yaml");
        std::fs::write(&yaml, "k_max: 4\nswarm_function: hybrid\n").unwrap();
        let cfg = read_run_config(&yaml).unwrap();
        assert_eq!(cfg.k_max, 4);

        let bad = tmp_path("bad.yaml");
        std::fs::write(&bad, "topology: hexagon\n").unwrap();
        let err = read_run_config(&bad).unwrap_err();
        assert!(err.to_string().contains("hexagon"), "{err}");

        for p in [json, yaml, bad] {
            let _ = std::fs::remove_file(p);
        }
    }

    #[test]
    fn test_demo_model_parse() {
        assert_eq!(DemoModel::parse("Gaussian", 1.5, 0).unwrap(), DemoModel::Gaussian(1.5));
        assert_eq!(DemoModel::parse("bursts", 0.0, 3).unwrap(), DemoModel::Bursts(3));
        assert!(DemoModel::parse("bursts", 0.0, 0).is_err());
        assert!(DemoModel::parse("lorentzian", 0.0, 1).is_err());
    }

    #[test]
    fn test_summary_json_shape() {
        let cfg = RunConfig {
            burn_in_length: 50,
            max_iterations: 100,
            k_max: 1,
            t_start: 1.0,
            chi_scaled_temperature: false,
            ..RunConfig::default()
        };
        let result = DemoModel::Gaussian(0.0).sample(&cfg).unwrap();
        let v = summary_json(&result).unwrap();
        let probs = v["model_probabilities"].as_array().unwrap();
        assert_eq!(probs.len(), 1);
        assert_eq!(probs[0]["probability"].as_f64(), Some(1.0));
        assert_eq!(v["chains"].as_array().unwrap().len(), 1);
        assert!(v["global_best"]["chi"].as_f64().unwrap().is_finite());
    }
}
