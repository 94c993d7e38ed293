//! Configuration for the loss functions, from JSON files or the environment

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    error::{TandemError, TandemResult},
    nn::{losses::LossKind, similarity::SimilarityKind},
    tensor::Device,
};

/// How a loss reacts to a non-finite result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericPolicy {
    /// Return NaN/Inf to the caller and log a warning
    #[default]
    Propagate,
    /// Turn a non-finite loss into `NumericInstability`
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContrastiveConfig {
    pub temperature: f32,
    /// Negatives kept per row; `None` or `Some(0)` keeps all of them
    pub n_negative: Option<usize>,
    pub similarity: SimilarityKind,
}

impl Default for ContrastiveConfig {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            n_negative: None,
            similarity: SimilarityKind::Cosine,
        }
    }
}

impl ContrastiveConfig {
    /// The negative-sample cap with `0` normalized away
    pub fn negative_cap(&self) -> Option<usize> {
        self.n_negative.filter(|&k| k > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VicRegConfig {
    pub sim_coeff: f32,
    pub std_coeff: f32,
    pub cov_coeff: f32,
}

impl Default for VicRegConfig {
    fn default() -> Self {
        Self {
            sim_coeff: 25.0,
            std_coeff: 25.0,
            cov_coeff: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub device: Device,
    /// Seed for negative subsampling; entropy when unset
    pub seed: Option<u64>,
    pub numeric_policy: NumericPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub loss: LossKind,
    pub batch_size: usize,
    pub hidden_dim: usize,
    pub contrastive: ContrastiveConfig,
    pub vicreg: VicRegConfig,
    pub runtime: RuntimeConfig,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            loss: LossKind::SimClr,
            batch_size: 32,
            hidden_dim: 128,
            contrastive: ContrastiveConfig::default(),
            vicreg: VicRegConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl LossConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> TandemResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable name
    pub fn from_lookup<F>(lookup: F) -> TandemResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(k) = parse_var::<usize, _>(&lookup, "N_negative")? {
            config.contrastive.n_negative = Some(k).filter(|&k| k > 0);
        }
        if let Some(device) = lookup("DEVICE") {
            config.runtime.device = device.parse()
                .map_err(|_| TandemError::config_error("DEVICE", &format!("unknown device '{}'", device)))?;
        }
        if let Some(v) = parse_var(&lookup, "BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = parse_var(&lookup, "HIDDEN_DIM")? {
            config.hidden_dim = v;
        }
        if let Some(v) = parse_var(&lookup, "VICREG_SIM_COEFF")? {
            config.vicreg.sim_coeff = v;
        }
        if let Some(v) = parse_var(&lookup, "VICREG_STD_COEFF")? {
            config.vicreg.std_coeff = v;
        }
        if let Some(v) = parse_var(&lookup, "VICREG_COV_COEFF")? {
            config.vicreg.cov_coeff = v;
        }
        if let Some(v) = parse_var(&lookup, "TEMPERATURE")? {
            config.contrastive.temperature = v;
        }
        if let Some(v) = parse_var(&lookup, "SEED")? {
            config.runtime.seed = Some(v);
        }

        tracing::debug!(?config, "loss configuration read from environment");
        Ok(config)
    }

    /// Check every field against its allowed range
    pub fn validate(&self) -> TandemResult<()> {
        if self.batch_size == 0 {
            return Err(TandemError::config_error("batch_size", "must be positive"));
        }
        if self.hidden_dim == 0 {
            return Err(TandemError::config_error("hidden_dim", "must be positive"));
        }
        let temperature = self.contrastive.temperature;
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(TandemError::config_error(
                "contrastive.temperature",
                &format!("must be positive and finite, got {}", temperature),
            ));
        }
        self.vicreg.validate()?;
        if self.loss == LossKind::VicReg && self.batch_size < 2 {
            return Err(TandemError::config_error(
                "batch_size",
                "vicreg needs at least 2 samples for unbiased statistics",
            ));
        }
        Ok(())
    }
}

impl VicRegConfig {
    pub fn validate(&self) -> TandemResult<()> {
        for (field, value) in [
            ("vicreg.sim_coeff", self.sim_coeff),
            ("vicreg.std_coeff", self.std_coeff),
            ("vicreg.cov_coeff", self.cov_coeff),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(TandemError::config_error(
                    field,
                    &format!("must be non-negative and finite, got {}", value),
                ));
            }
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> TandemResult<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e| {
            TandemError::config_error(key, &format!("cannot parse '{}': {}", raw, e))
        }),
    }
}

/// Holds the active configuration and keeps it in sync with a JSON file
pub struct ConfigManager {
    config: Arc<RwLock<LossConfig>>,
    config_file: Option<PathBuf>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(LossConfig::default())),
            config_file: None,
        }
    }

    /// Persist every later update to `path`
    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.config_file = Some(path);
        self
    }

    pub fn load_from_file(&mut self, path: &Path) -> TandemResult<()> {
        let content = std::fs::read_to_string(path)?;
        let config: LossConfig = serde_json::from_str(&content)?;
        config.validate()?;

        *self.config.write() = config;
        self.config_file = Some(path.to_path_buf());
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> TandemResult<()> {
        let content = serde_json::to_string_pretty(&*self.config.read())?;
        std::fs::write(path, content)?;
        tracing::info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn get_config(&self) -> LossConfig {
        self.config.read().clone()
    }

    /// Apply `f`; the change is kept only if the result validates
    pub fn update_config<F>(&mut self, f: F) -> TandemResult<()>
    where
        F: FnOnce(&mut LossConfig),
    {
        let mut updated = self.get_config();
        f(&mut updated);
        self.set_config(updated)
    }

    pub fn set_config(&mut self, config: LossConfig) -> TandemResult<()> {
        config.validate()?;
        *self.config.write() = config;
        if let Some(path) = &self.config_file {
            self.save_to_file(path)?;
        }
        Ok(())
    }
}

lazy_static! {
    static ref CONFIG_MANAGER: RwLock<ConfigManager> = RwLock::new(ConfigManager::new());
}

/// Get the global configuration
pub fn get_config() -> LossConfig {
    CONFIG_MANAGER.read().get_config()
}

/// Update the global configuration
pub fn update_config<F>(f: F) -> TandemResult<()>
where
    F: FnOnce(&mut LossConfig),
{
    CONFIG_MANAGER.write().update_config(f)
}

/// Load the global configuration from a JSON file
pub fn load_config_from_file(path: &Path) -> TandemResult<()> {
    CONFIG_MANAGER.write().load_from_file(path)
}

/// Builder with one closure per configuration section
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: LossConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loss(mut self, kind: LossKind) -> Self {
        self.config.loss = kind;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn hidden_dim(mut self, hidden_dim: usize) -> Self {
        self.config.hidden_dim = hidden_dim;
        self
    }

    pub fn contrastive(mut self, f: impl FnOnce(&mut ContrastiveConfig)) -> Self {
        f(&mut self.config.contrastive);
        self
    }

    pub fn vicreg(mut self, f: impl FnOnce(&mut VicRegConfig)) -> Self {
        f(&mut self.config.vicreg);
        self
    }

    pub fn runtime(mut self, f: impl FnOnce(&mut RuntimeConfig)) -> Self {
        f(&mut self.config.runtime);
        self
    }

    pub fn build(self) -> TandemResult<LossConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Replace the global configuration
    pub fn apply(self) -> TandemResult<()> {
        let config = self.build()?;
        update_config(|c| *c = config)
    }
}
