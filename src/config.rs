use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::combiner::CombinerConfig;
use crate::features::{FeatureConfig, FeatureGroup, FeatureSchema};
use crate::metrics::DEFAULT_TOLERANCES;

const CACHE_DIR: &str = "xmins";
const MODEL_FILE: &str = "xmins_model.json";
const DB_FILE: &str = "xmins_appearances.sqlite";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Earlier records a target appearance needs before it becomes a sample.
    #[serde(default = "default_min_history")]
    pub min_history: usize,
    #[serde(default = "default_holdout")]
    pub holdout_fraction: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_tolerances")]
    pub tolerances: Vec<u16>,
    #[serde(default = "default_start_l2")]
    pub start_l2: f64,
    #[serde(default = "default_minutes_l2")]
    pub minutes_l2: f64,
    #[serde(default = "default_true")]
    pub exclude_outlier_targets: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            min_history: default_min_history(),
            holdout_fraction: default_holdout(),
            seed: default_seed(),
            tolerances: default_tolerances(),
            start_l2: default_start_l2(),
            minutes_l2: default_minutes_l2(),
            exclude_outlier_targets: true,
        }
    }
}

fn default_min_history() -> usize {
    3
}

fn default_holdout() -> f64 {
    0.2
}

fn default_seed() -> u64 {
    42
}

fn default_tolerances() -> Vec<u16> {
    DEFAULT_TOLERANCES.to_vec()
}

fn default_start_l2() -> f64 {
    1e-3
}

fn default_minutes_l2() -> f64 {
    1e-3
}

fn default_true() -> bool {
    true
}

fn default_model_version() -> String {
    format!("xmins-{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_model_version")]
    pub model_version: String,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub combiner: CombinerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_version: default_model_version(),
            features: FeatureConfig::default(),
            training: TrainingConfig::default(),
            combiner: CombinerConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn schema(&self) -> FeatureSchema {
        FeatureSchema::from_config(&self.features)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = match opt_env("XMINS_CONFIG_PATH") {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };
        cfg.apply_overrides(opt_env)?;
        Ok(cfg)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("XMINS_WINDOWS") {
            let windows = raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| {
                    s.trim()
                        .parse::<usize>()
                        .with_context(|| format!("XMINS_WINDOWS entry `{s}`"))
                })
                .collect::<Result<Vec<_>>>()?;
            if windows.iter().all(|w| *w == 0) {
                bail!("XMINS_WINDOWS needs at least one positive window");
            }
            self.features.windows = windows;
        }
        if let Some(raw) = lookup("XMINS_FEATURE_GROUPS") {
            let mut groups = Vec::new();
            for label in raw.split(',').filter(|s| !s.trim().is_empty()) {
                let Some(group) = FeatureGroup::parse(label) else {
                    bail!("unknown feature group `{}`", label.trim());
                };
                groups.push(group);
            }
            if groups.is_empty() {
                bail!("XMINS_FEATURE_GROUPS is empty");
            }
            self.features.groups = groups;
        }
        if let Some(raw) = lookup("XMINS_HOLDOUT_FRACTION") {
            let frac = raw
                .trim()
                .parse::<f64>()
                .context("XMINS_HOLDOUT_FRACTION")?;
            if !(0.0..1.0).contains(&frac) {
                bail!("XMINS_HOLDOUT_FRACTION must be in [0, 1), got {frac}");
            }
            self.training.holdout_fraction = frac;
        }
        if let Some(raw) = lookup("XMINS_SEED") {
            self.training.seed = raw.trim().parse().context("XMINS_SEED")?;
        }
        if let Some(raw) = lookup("XMINS_UNCERTAINTY_MINUTES") {
            let band = raw
                .trim()
                .parse::<f64>()
                .context("XMINS_UNCERTAINTY_MINUTES")?;
            self.combiner.uncertainty_minutes = band.max(0.0);
        }
        if let Some(raw) = lookup("XMINS_MATCH_LENGTH") {
            let length = raw.trim().parse::<f64>().context("XMINS_MATCH_LENGTH")?;
            if !(length.is_finite() && length > 0.0) {
                bail!("XMINS_MATCH_LENGTH must be positive, got {length}");
            }
            self.combiner.match_length = length;
        }
        if let Some(raw) = lookup("XMINS_TEAM_PRIOR") {
            self.combiner.team_prior = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => true,
                "0" | "false" | "off" => false,
                other => bail!("XMINS_TEAM_PRIOR must be true or false, got `{other}`"),
            };
        }
        if let Some(raw) = lookup("XMINS_MODEL_VERSION") {
            self.model_version = raw.trim().to_string();
        }
        Ok(())
    }
}

fn opt_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .and_then(|val| if val.trim().is_empty() { None } else { Some(val) })
}

pub fn app_cache_dir() -> Option<PathBuf> {
    if let Some(base) = opt_env("XDG_CACHE_HOME") {
        return Some(PathBuf::from(base).join(CACHE_DIR));
    }
    let home = opt_env("HOME")?;
    Some(PathBuf::from(home).join(".cache").join(CACHE_DIR))
}

pub fn default_model_path() -> Option<PathBuf> {
    opt_env("XMINS_MODEL_PATH")
        .map(PathBuf::from)
        .or_else(|| app_cache_dir().map(|dir| dir.join(MODEL_FILE)))
}

pub fn default_db_path() -> Option<PathBuf> {
    opt_env("XMINS_DB_PATH")
        .map(PathBuf::from)
        .or_else(|| app_cache_dir().map(|dir| dir.join(DB_FILE)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let mut cfg = PipelineConfig::default();
        cfg.apply_overrides(lookup(&[
            ("XMINS_WINDOWS", "3, 6"),
            ("XMINS_FEATURE_GROUPS", "position,recent_form"),
            ("XMINS_SEED", "7"),
            ("XMINS_UNCERTAINTY_MINUTES", "12.5"),
            ("XMINS_MATCH_LENGTH", "120"),
            ("XMINS_TEAM_PRIOR", "off"),
        ]))
        .unwrap();
        assert_eq!(cfg.combiner.match_length, 120.0);
        assert!(!cfg.combiner.team_prior);
        assert_eq!(cfg.features.windows, vec![3, 6]);
        assert_eq!(
            cfg.features.groups,
            vec![FeatureGroup::Position, FeatureGroup::RecentForm]
        );
        assert_eq!(cfg.training.seed, 7);
        assert_eq!(cfg.combiner.uncertainty_minutes, 12.5);
        assert_eq!(cfg.schema().len(), 4 + 2 * 4);
    }

    #[test]
    fn unknown_group_is_rejected() {
        let mut cfg = PipelineConfig::default();
        let err = cfg
            .apply_overrides(lookup(&[("XMINS_FEATURE_GROUPS", "position,vibes")]))
            .unwrap_err();
        assert!(err.to_string().contains("vibes"));
        assert_eq!(cfg.features.groups, FeatureGroup::ALL.to_vec());
    }

    #[test]
    fn match_length_must_be_positive() {
        let mut cfg = PipelineConfig::default();
        assert!(cfg.apply_overrides(lookup(&[("XMINS_MATCH_LENGTH", "0")])).is_err());
        assert!(cfg.apply_overrides(lookup(&[("XMINS_TEAM_PRIOR", "maybe")])).is_err());
        assert_eq!(cfg.combiner.match_length, 90.0);
    }

    #[test]
    fn holdout_must_leave_training_data() {
        let mut cfg = PipelineConfig::default();
        assert!(
            cfg.apply_overrides(lookup(&[("XMINS_HOLDOUT_FRACTION", "1.0")]))
                .is_err()
        );
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"features":{"windows":[4]},"training":{"seed":9}}"#).unwrap();
        assert_eq!(cfg.features.windows, vec![4]);
        assert_eq!(cfg.features.high_minutes_threshold, 85);
        assert_eq!(cfg.training.seed, 9);
        assert_eq!(cfg.training.holdout_fraction, 0.2);
        assert_eq!(cfg.combiner.uncertainty_minutes, 10.0);
    }
}
