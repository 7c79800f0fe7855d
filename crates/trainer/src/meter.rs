/// Running average of a scalar, weighted by sample count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AverageMeter {
    pub val: f64,
    pub sum: f64,
    pub count: usize,
    pub avg: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }
}
