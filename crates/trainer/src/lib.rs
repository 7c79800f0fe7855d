pub mod checkpoint;
pub mod dataset;
pub mod meter;
pub mod optim;
pub mod schedule;
pub mod telemetry;
pub mod train;

pub use checkpoint::Checkpoint;
pub use dataset::{Batch, DataLoader, GazeDataset};
pub use meter::AverageMeter;
pub use optim::{Adam, AdamConfig, OptimizerState};
pub use schedule::LrSchedule;
pub use telemetry::{JsonlSink, LogSink, MetricsSink, RecordingSink, ScalarRecord};
pub use train::Trainer;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use gaze_core::{GazeError, LoadMode, ModelConfig, ModelName};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub init_lr: f64,
    /// Epochs between two learning-rate decays.
    pub lr_patience: usize,
    pub lr_decay_factor: f64,
    /// Length of the linear warmup ramp; 0 disables it.
    pub warmup_epochs: usize,
    pub use_gpu: bool,
    pub ckpt_dir: PathBuf,
    /// Batches between two progress reports.
    pub print_freq: usize,
    pub model_name: ModelName,
    /// Crops fed to the model. Derived from `model_name` when absent.
    pub load_mode: Option<LoadMode>,
    pub continue_train: bool,
    pub continue_train_model_path: Option<PathBuf>,
    pub pre_trained_model_path: PathBuf,
    pub results_path: PathBuf,
    pub shuffle: bool,
    pub seed: u64,
    pub model: ModelConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            epochs: 25,
            init_lr: 1e-4,
            lr_patience: 10,
            lr_decay_factor: 0.1,
            warmup_epochs: 0,
            use_gpu: true,
            ckpt_dir: PathBuf::from("./ckpt"),
            print_freq: 100,
            model_name: ModelName::FaceRes50,
            load_mode: None,
            continue_train: false,
            continue_train_model_path: None,
            pre_trained_model_path: PathBuf::from("./ckpt/ckpt.safetensors"),
            results_path: PathBuf::from("within_eva_results.txt"),
            shuffle: true,
            seed: 0,
            model: ModelConfig::default(),
        }
    }
}

impl TrainerConfig {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config: TrainerConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        Ok(config)
    }

    /// Checks the run parameters and returns the effective load mode.
    pub fn validate(&self) -> Result<LoadMode> {
        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        if self.print_freq == 0 {
            bail!("print_freq must be positive");
        }
        if self.lr_patience == 0 {
            bail!("lr_patience must be positive");
        }
        if !(self.init_lr > 0.0) {
            bail!("init_lr must be positive, got {}", self.init_lr);
        }
        if self.model.in_stride < 1 {
            bail!("in_stride must be at least 1, got {}", self.model.in_stride);
        }
        if self.continue_train && self.continue_train_model_path.is_none() {
            bail!("continue_train requires continue_train_model_path");
        }

        let expected = self.model_name.load_mode();
        match self.load_mode {
            Some(mode) if mode != expected => Err(GazeError::LoadModeMismatch {
                model: self.model_name.to_string(),
                expected: expected.to_string(),
                actual: mode.to_string(),
            }
            .into()),
            _ => Ok(expected),
        }
    }
}
