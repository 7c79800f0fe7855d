use serde::{Deserialize, Serialize};

/// Learning rate per epoch: optional linear warmup from zero, then step decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrSchedule {
    pub base_lr: f64,
    /// Epochs between two decays.
    pub step_size: usize,
    pub gamma: f64,
    pub warmup_epochs: usize,
    /// Number of `step()` calls so far.
    pub last_epoch: usize,
}

impl LrSchedule {
    pub fn new(base_lr: f64, step_size: usize, gamma: f64, warmup_epochs: usize) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            warmup_epochs,
            last_epoch: 0,
        }
    }

    pub fn lr_at(&self, epoch: usize) -> f64 {
        if epoch < self.warmup_epochs {
            return self.base_lr * epoch as f64 / self.warmup_epochs as f64;
        }
        let decays = (epoch - self.warmup_epochs) / self.step_size;
        self.base_lr * self.gamma.powi(decays as i32)
    }

    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.last_epoch)
    }

    /// Advances one epoch and returns the new learning rate.
    pub fn step(&mut self) -> f64 {
        self.last_epoch += 1;
        self.current_lr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn step_decay_without_warmup() {
        let mut s = LrSchedule::new(1e-3, 2, 0.1, 0);
        let lrs: Vec<f64> = std::iter::once(s.current_lr())
            .chain((0..4).map(|_| s.step()))
            .collect();
        let expected = [1e-3, 1e-3, 1e-4, 1e-4, 1e-5];
        for (lr, want) in lrs.iter().zip(expected) {
            assert!(close(*lr, want), "{} != {}", lr, want);
        }
    }

    #[test]
    fn warmup_ramps_then_hands_over() {
        let s = LrSchedule::new(1.0, 3, 0.5, 4);
        assert!(close(s.lr_at(0), 0.0));
        assert!(close(s.lr_at(2), 0.5));
        assert!(close(s.lr_at(4), 1.0));
        assert!(close(s.lr_at(6), 1.0));
        assert!(close(s.lr_at(7), 0.5));
    }

    #[test]
    fn state_survives_json() {
        let mut s = LrSchedule::new(0.01, 5, 0.3, 2);
        s.step();
        s.step();
        let restored: LrSchedule = serde_json::from_str(&serde_json::to_string(&s).unwrap()).unwrap();
        assert_eq!(restored, s);
        assert!(close(restored.current_lr(), 0.01));
    }
}
