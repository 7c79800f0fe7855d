use tch::{nn, nn::Module, nn::ModuleT, Kind, Tensor};

use crate::config::PoolFormerConfig;

/// Channel MLP made of two 1x1 convolutions.
#[derive(Debug)]
struct ConvMlp {
    fc1: nn::Conv2D,
    fc2: nn::Conv2D,
}

impl ConvMlp {
    fn new(vs: &nn::Path, dim: i64, hidden: i64) -> Self {
        Self {
            fc1: nn::conv2d(vs / "fc1", dim, hidden, 1, Default::default()),
            fc2: nn::conv2d(vs / "fc2", hidden, dim, 1, Default::default()),
        }
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        x.apply(&self.fc1).gelu("none").apply(&self.fc2)
    }
}

/// PoolFormer block: pooling token mixer and channel MLP, both pre-normed
/// and scaled by a learnable per-channel factor.
#[derive(Debug)]
pub struct PoolFormerBlock {
    norm1: nn::GroupNorm,
    norm2: nn::GroupNorm,
    mlp: ConvMlp,
    layer_scale_1: Tensor,
    layer_scale_2: Tensor,
    pool_size: i64,
}

impl PoolFormerBlock {
    pub fn new(vs: &nn::Path, dim: i64, config: &PoolFormerConfig) -> Self {
        let scale = config.layer_scale_init;
        Self {
            norm1: nn::group_norm(vs / "norm1", 1, dim, Default::default()),
            norm2: nn::group_norm(vs / "norm2", 1, dim, Default::default()),
            mlp: ConvMlp::new(&(vs / "mlp"), dim, dim * config.mlp_ratio),
            layer_scale_1: vs.var("layer_scale_1", &[dim], nn::Init::Const(scale)),
            layer_scale_2: vs.var("layer_scale_2", &[dim], nn::Init::Const(scale)),
            pool_size: config.pool_size,
        }
    }

    fn token_mixer(&self, x: &Tensor) -> Tensor {
        let k = self.pool_size;
        let pooled = x.avg_pool2d([k, k], [1, 1], [k / 2, k / 2], false, false, None::<i64>);
        pooled - x
    }
}

impl Module for PoolFormerBlock {
    fn forward(&self, x: &Tensor) -> Tensor {
        let ls1 = self.layer_scale_1.view([-1, 1, 1]);
        let ls2 = self.layer_scale_2.view([-1, 1, 1]);
        let x = x + ls1 * self.token_mixer(&x.apply(&self.norm1));
        let mixed = self.mlp.forward(&x.apply(&self.norm2));
        &x + ls2 * mixed
    }
}

/// PoolFormer with a 2-way regression head.
#[derive(Debug)]
pub struct PoolFormer {
    patch_embed: nn::Conv2D,
    stages: Vec<Vec<PoolFormerBlock>>,
    downsamples: Vec<nn::Conv2D>,
    norm: nn::GroupNorm,
    head: nn::Linear,
}

impl PoolFormer {
    pub fn new(vs: &nn::Path, config: &PoolFormerConfig, in_stride: i64, num_outputs: i64) -> Self {
        let dims = config.embed_dims;
        let patch_embed = nn::conv2d(
            vs / "patch_embed",
            3,
            dims[0],
            7,
            nn::ConvConfig {
                stride: 2 * in_stride,
                padding: 2,
                ..Default::default()
            },
        );

        let mut stages = Vec::with_capacity(4);
        let mut downsamples = Vec::with_capacity(3);
        for (i, &depth) in config.layers.iter().enumerate() {
            let stage_vs = vs / "network" / (2 * i);
            let blocks = (0..depth)
                .map(|b| PoolFormerBlock::new(&(&stage_vs / b), dims[i], config))
                .collect();
            stages.push(blocks);

            if i + 1 < dims.len() {
                downsamples.push(nn::conv2d(
                    vs / "network" / (2 * i + 1),
                    dims[i],
                    dims[i + 1],
                    3,
                    nn::ConvConfig {
                        stride: 2,
                        padding: 1,
                        ..Default::default()
                    },
                ));
            }
        }

        let last = dims[3];
        Self {
            patch_embed,
            stages,
            downsamples,
            norm: nn::group_norm(vs / "norm", 1, last, Default::default()),
            head: nn::linear(vs / "head", last, num_outputs, Default::default()),
        }
    }
}

impl ModuleT for PoolFormer {
    fn forward_t(&self, x: &Tensor, _train: bool) -> Tensor {
        let mut x = x.apply(&self.patch_embed);
        for (i, stage) in self.stages.iter().enumerate() {
            for block in stage {
                x = block.forward(&x);
            }
            if let Some(down) = self.downsamples.get(i) {
                x = x.apply(down);
            }
        }
        x.apply(&self.norm)
            .mean_dim(Some(&[-2, -1][..]), false, Kind::Float)
            .apply(&self.head)
    }
}
