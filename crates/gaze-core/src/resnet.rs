use tch::{nn, nn::ModuleT, Tensor};

use crate::config::ResNetConfig;

fn conv2d(vs: nn::Path, c_in: i64, c_out: i64, ksize: i64, padding: i64, stride: i64) -> nn::Conv2D {
    let config = nn::ConvConfig {
        stride,
        padding,
        bias: false,
        ..Default::default()
    };
    nn::conv2d(vs, c_in, c_out, ksize, config)
}

/// 1x1 projection used when a block changes resolution or width.
#[derive(Debug)]
struct Downsample {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
}

impl Downsample {
    fn new(vs: &nn::Path, c_in: i64, c_out: i64, stride: i64) -> Self {
        Self {
            conv: conv2d(vs / "0", c_in, c_out, 1, 0, stride),
            bn: nn::batch_norm2d(vs / "1", c_out, Default::default()),
        }
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        x.apply(&self.conv).apply_t(&self.bn, train)
    }
}

#[derive(Debug)]
pub struct Bottleneck {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    conv2: nn::Conv2D,
    bn2: nn::BatchNorm,
    conv3: nn::Conv2D,
    bn3: nn::BatchNorm,
    downsample: Option<Downsample>,
}

impl Bottleneck {
    pub fn new(vs: &nn::Path, c_in: i64, width: i64, stride: i64) -> Self {
        let c_out = width * ResNetConfig::EXPANSION;
        let downsample = if stride != 1 || c_in != c_out {
            Some(Downsample::new(&(vs / "downsample"), c_in, c_out, stride))
        } else {
            None
        };

        Self {
            conv1: conv2d(vs / "conv1", c_in, width, 1, 0, 1),
            bn1: nn::batch_norm2d(vs / "bn1", width, Default::default()),
            conv2: conv2d(vs / "conv2", width, width, 3, 1, stride),
            bn2: nn::batch_norm2d(vs / "bn2", width, Default::default()),
            conv3: conv2d(vs / "conv3", width, c_out, 1, 0, 1),
            bn3: nn::batch_norm2d(vs / "bn3", c_out, Default::default()),
            downsample,
        }
    }
}

impl ModuleT for Bottleneck {
    fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let ys = x
            .apply(&self.conv1)
            .apply_t(&self.bn1, train)
            .relu()
            .apply(&self.conv2)
            .apply_t(&self.bn2, train)
            .relu()
            .apply(&self.conv3)
            .apply_t(&self.bn3, train);
        let shortcut = match &self.downsample {
            Some(d) => d.forward_t(x, train),
            None => x.shallow_clone(),
        };
        (shortcut + ys).relu()
    }
}

/// ResNet trunk without the classification layer.
/// Output: `[batch, config.feature_dim()]` after global average pooling.
#[derive(Debug)]
pub struct ResNetBackbone {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    stages: Vec<Vec<Bottleneck>>,
    feature_dim: i64,
}

impl ResNetBackbone {
    pub fn new(vs: &nn::Path, config: &ResNetConfig, in_stride: i64) -> Self {
        let width = config.width;
        let conv1 = conv2d(vs / "conv1", 3, width, 7, 3, in_stride);
        let bn1 = nn::batch_norm2d(vs / "bn1", width, Default::default());

        let mut stages = Vec::with_capacity(4);
        let mut c_in = width;
        for (i, &n_blocks) in config.layers.iter().enumerate() {
            let stage_width = width << i;
            let stride = if i == 0 { 1 } else { 2 };
            let stage_vs = vs / format!("layer{}", i + 1);
            let mut blocks = Vec::with_capacity(n_blocks as usize);
            for b in 0..n_blocks {
                let block_stride = if b == 0 { stride } else { 1 };
                blocks.push(Bottleneck::new(&(&stage_vs / b), c_in, stage_width, block_stride));
                c_in = stage_width * ResNetConfig::EXPANSION;
            }
            stages.push(blocks);
        }

        Self {
            conv1,
            bn1,
            stages,
            feature_dim: config.feature_dim(),
        }
    }

    pub fn feature_dim(&self) -> i64 {
        self.feature_dim
    }
}

impl ModuleT for ResNetBackbone {
    fn forward_t(&self, x: &Tensor, train: bool) -> Tensor {
        let mut x = x
            .apply(&self.conv1)
            .apply_t(&self.bn1, train)
            .relu()
            .max_pool2d([3, 3], [2, 2], [1, 1], [1, 1], false);
        for stage in &self.stages {
            for block in stage {
                x = block.forward_t(&x, train);
            }
        }
        x.adaptive_avg_pool2d([1, 1]).flatten(1, -1)
    }
}
