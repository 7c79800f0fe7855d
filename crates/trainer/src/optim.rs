use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tch::{nn, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Snapshot of the Adam moments, keyed by variable name.
#[derive(Debug)]
pub struct OptimizerState {
    pub step: i64,
    pub config: AdamConfig,
    pub exp_avg: BTreeMap<String, Tensor>,
    pub exp_avg_sq: BTreeMap<String, Tensor>,
}

/// Adam over the trainable variables of a `VarStore`.
///
/// Gradients come from libtorch's autograd; the moment estimates are kept
/// here by variable name so they can be written to and read from checkpoints.
pub struct Adam {
    config: AdamConfig,
    step: i64,
    params: Vec<(String, Tensor)>,
    exp_avg: BTreeMap<String, Tensor>,
    exp_avg_sq: BTreeMap<String, Tensor>,
}

impl Adam {
    pub fn new(vs: &nn::VarStore, config: AdamConfig) -> Self {
        let mut params: Vec<(String, Tensor)> = vs
            .variables()
            .into_iter()
            .filter(|(_, t)| t.requires_grad())
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));

        Self {
            config,
            step: 0,
            params,
            exp_avg: BTreeMap::new(),
            exp_avg_sq: BTreeMap::new(),
        }
    }

    pub fn lr(&self) -> f64 {
        self.config.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    pub fn step_count(&self) -> i64 {
        self.step
    }

    pub fn zero_grad(&mut self) {
        for (_, p) in self.params.iter_mut() {
            p.zero_grad();
        }
    }

    /// Applies one update from the gradients currently stored on the variables.
    pub fn step(&mut self) {
        self.step += 1;
        let AdamConfig { lr, beta1, beta2, eps } = self.config;
        let bias1 = 1.0 - beta1.powi(self.step as i32);
        let bias2 = 1.0 - beta2.powi(self.step as i32);

        let exp_avg = &mut self.exp_avg;
        let exp_avg_sq = &mut self.exp_avg_sq;
        tch::no_grad(|| {
            for (name, param) in self.params.iter_mut() {
                let grad = param.grad();
                if !grad.defined() {
                    continue;
                }
                let m = exp_avg.entry(name.clone()).or_insert_with(|| param.zeros_like());
                let v = exp_avg_sq.entry(name.clone()).or_insert_with(|| param.zeros_like());

                let new_m = &*m * beta1 + &grad * (1.0 - beta1);
                m.copy_(&new_m);
                let new_v = &*v * beta2 + grad.square() * (1.0 - beta2);
                v.copy_(&new_v);

                let denom = v.sqrt() / bias2.sqrt() + eps;
                let update = &*m / denom * (lr / bias1);
                let updated = &*param - update;
                param.copy_(&updated);
            }
        });
    }

    /// Zeroes gradients, backpropagates `loss` and applies one update.
    pub fn backward_step(&mut self, loss: &Tensor) {
        self.zero_grad();
        loss.backward();
        self.step();
    }

    pub fn state(&self) -> OptimizerState {
        let copy = |m: &BTreeMap<String, Tensor>| {
            m.iter()
                .map(|(k, t)| (k.clone(), t.copy()))
                .collect::<BTreeMap<_, _>>()
        };
        OptimizerState {
            step: self.step,
            config: self.config,
            exp_avg: copy(&self.exp_avg),
            exp_avg_sq: copy(&self.exp_avg_sq),
        }
    }

    /// Restores moments for variables that exist here with the same shape.
    /// Returns the number of restored variables.
    pub fn load_state(&mut self, state: OptimizerState) -> usize {
        self.step = state.step;
        self.config = state.config;
        self.exp_avg.clear();
        self.exp_avg_sq.clear();

        let mut restored = 0;
        for (name, param) in &self.params {
            let device = param.device();
            let (Some(m), Some(v)) = (state.exp_avg.get(name), state.exp_avg_sq.get(name)) else {
                continue;
            };
            if m.size() != param.size() || v.size() != param.size() {
                log::debug!("Dropping optimizer state for {}: shape changed", name);
                continue;
            }
            self.exp_avg.insert(name.clone(), m.to_device(device).to_kind(param.kind()));
            self.exp_avg_sq.insert(name.clone(), v.to_device(device).to_kind(param.kind()));
            restored += 1;
        }
        restored
    }
}
