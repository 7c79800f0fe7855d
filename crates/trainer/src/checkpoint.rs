use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use gaze_core::safetensors_util::{load_tensor_file, save_tensor_file};
use gaze_core::GazeError;
use serde::{Deserialize, Serialize};
use tch::Tensor;

use crate::optim::{AdamConfig, OptimizerState};
use crate::schedule::LrSchedule;

pub const CHECKPOINT_EXT: &str = "safetensors";

const EPOCH_KEY: &str = "epoch";
const MODEL_PREFIX: &str = "model_state.";
const OPTIM_KEY: &str = "optim_state";
const EXP_AVG_PREFIX: &str = "optim_state.exp_avg.";
const EXP_AVG_SQ_PREFIX: &str = "optim_state.exp_avg_sq.";
// Key name is part of the on-disk format.
const SCHEDULE_KEY: &str = "scheule_state";

/// `<tag>_ckpt.safetensors`, or `ckpt.safetensors` without a tag.
pub fn checkpoint_file_name(tag: Option<&str>) -> String {
    match tag {
        Some(tag) => format!("{}_ckpt.{}", tag, CHECKPOINT_EXT),
        None => format!("ckpt.{}", CHECKPOINT_EXT),
    }
}

/// `epoch_<epoch>_<lr>`. The rate is printed in its shortest form, as plain
/// decimal from 1e-4 up to 1e16 and with a two-digit exponent outside that
/// range, e.g. `0.0001` and `1e-05`.
pub fn checkpoint_tag(epoch: usize, lr: f64) -> String {
    format!("epoch_{}_{}", epoch, float_repr(lr))
}

fn float_repr(value: f64) -> String {
    if !value.is_finite() || value == 0.0 {
        return format!("{:?}", value);
    }
    let sci = format!("{:e}", value);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => return sci,
    };
    if (-4..16).contains(&exp) {
        // `{:?}` keeps the trailing `.0` of integral values.
        format!("{:?}", value)
    } else {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    }
}

#[derive(Serialize, Deserialize)]
struct OptimHeader {
    step: i64,
    config: AdamConfig,
}

/// Everything needed to resume a run: the epoch to start from, the model
/// variables, the Adam moments and the schedule position.
#[derive(Debug)]
pub struct Checkpoint {
    pub epoch: usize,
    pub model_state: BTreeMap<String, Tensor>,
    pub optim_state: OptimizerState,
    pub schedule_state: LrSchedule,
}

impl Checkpoint {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut tensors = BTreeMap::new();
        for (name, t) in &self.model_state {
            tensors.insert(format!("{}{}", MODEL_PREFIX, name), t.shallow_clone());
        }
        for (name, t) in &self.optim_state.exp_avg {
            tensors.insert(format!("{}{}", EXP_AVG_PREFIX, name), t.shallow_clone());
        }
        for (name, t) in &self.optim_state.exp_avg_sq {
            tensors.insert(format!("{}{}", EXP_AVG_SQ_PREFIX, name), t.shallow_clone());
        }

        let header = OptimHeader {
            step: self.optim_state.step,
            config: self.optim_state.config,
        };
        let mut metadata = HashMap::new();
        metadata.insert(EPOCH_KEY.to_string(), self.epoch.to_string());
        metadata.insert(OPTIM_KEY.to_string(), serde_json::to_string(&header)?);
        metadata.insert(SCHEDULE_KEY.to_string(), serde_json::to_string(&self.schedule_state)?);

        save_tensor_file(&tensors, metadata, path)
            .with_context(|| format!("Failed to write checkpoint {:?}", path))?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = load_tensor_file(path)
            .with_context(|| format!("Failed to read checkpoint {:?}", path))?;
        let meta = |key: &'static str| {
            file.metadata
                .get(key)
                .ok_or(GazeError::MissingMetadata(key))
        };

        let epoch = meta(EPOCH_KEY)?
            .parse::<usize>()
            .map_err(|e| GazeError::InvalidMetadata {
                key: EPOCH_KEY,
                reason: e.to_string(),
            })?;
        let header: OptimHeader = serde_json::from_str(meta(OPTIM_KEY)?)
            .with_context(|| format!("Invalid {} in {:?}", OPTIM_KEY, path))?;
        let schedule_state: LrSchedule = serde_json::from_str(meta(SCHEDULE_KEY)?)
            .with_context(|| format!("Invalid {} in {:?}", SCHEDULE_KEY, path))?;

        let mut model_state = BTreeMap::new();
        let mut exp_avg = BTreeMap::new();
        let mut exp_avg_sq = BTreeMap::new();
        for (name, t) in file.tensors {
            if let Some(rest) = name.strip_prefix(MODEL_PREFIX) {
                model_state.insert(rest.to_string(), t);
            } else if let Some(rest) = name.strip_prefix(EXP_AVG_PREFIX) {
                exp_avg.insert(rest.to_string(), t);
            } else if let Some(rest) = name.strip_prefix(EXP_AVG_SQ_PREFIX) {
                exp_avg_sq.insert(rest.to_string(), t);
            } else {
                log::debug!("Ignoring checkpoint entry {}", name);
            }
        }

        Ok(Self {
            epoch,
            model_state,
            optim_state: OptimizerState {
                step: header.step,
                config: header.config,
                exp_avg,
                exp_avg_sq,
            },
            schedule_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn file_names() {
        assert_eq!(checkpoint_file_name(None), "ckpt.safetensors");
        assert_eq!(
            checkpoint_file_name(Some("epoch_4_0.0001")),
            "epoch_4_0.0001_ckpt.safetensors"
        );
    }

    #[test]
    fn tags_use_the_short_float_form() {
        assert_eq!(checkpoint_tag(4, 1e-3), "epoch_4_0.001");
        assert_eq!(checkpoint_tag(4, 1e-4), "epoch_4_0.0001");
        assert_eq!(checkpoint_tag(9, 1e-5), "epoch_9_1e-05");
        assert_eq!(checkpoint_tag(9, 2.5e-6), "epoch_9_2.5e-06");
        assert_eq!(checkpoint_tag(14, 1.0), "epoch_14_1.0");
        assert_eq!(checkpoint_tag(14, 0.1), "epoch_14_0.1");
        assert_eq!(checkpoint_tag(0, 1e16), "epoch_0_1e+16");
    }

    #[test]
    fn sections_are_kept_apart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(checkpoint_file_name(None));

        let t = |v: f32| Tensor::full([2], v as f64, (Kind::Float, Device::Cpu));
        let mut model_state = BTreeMap::new();
        model_state.insert("fc.weight".to_string(), t(1.0));
        let mut exp_avg = BTreeMap::new();
        exp_avg.insert("fc.weight".to_string(), t(2.0));
        let mut exp_avg_sq = BTreeMap::new();
        exp_avg_sq.insert("fc.weight".to_string(), t(3.0));

        let mut schedule_state = LrSchedule::new(0.1, 10, 0.1, 0);
        schedule_state.step();
        let ckpt = Checkpoint {
            epoch: 5,
            model_state,
            optim_state: OptimizerState {
                step: 12,
                config: AdamConfig::default(),
                exp_avg,
                exp_avg_sq,
            },
            schedule_state,
        };
        ckpt.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.epoch, 5);
        assert_eq!(loaded.optim_state.step, 12);
        assert_eq!(loaded.schedule_state.last_epoch, 1);
        assert_eq!(loaded.model_state["fc.weight"].double_value(&[0]), 1.0);
        assert_eq!(loaded.optim_state.exp_avg["fc.weight"].double_value(&[0]), 2.0);
        assert_eq!(loaded.optim_state.exp_avg_sq["fc.weight"].double_value(&[0]), 3.0);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Checkpoint::load(dir.path().join("nope.safetensors")).is_err());
    }
}
