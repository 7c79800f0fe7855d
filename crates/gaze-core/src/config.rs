use serde::{Deserialize, Serialize};

/// Architecture hyperparameters shared by every model variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Stride of the first convolution. ResNet uses it as the stem stride,
    /// PoolFormer downsamples its patch embedding by twice this value.
    pub in_stride: i64,
    pub resnet: ResNetConfig,
    pub poolformer: PoolFormerConfig,
    /// Hidden width of the fusion MLP of the multi-region models.
    pub fusion_hidden: i64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_stride: 2,
            resnet: ResNetConfig::default(),
            poolformer: PoolFormerConfig::default(),
            fusion_hidden: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResNetConfig {
    /// Number of bottleneck blocks in each of the four stages.
    pub layers: [i64; 4],
    /// Channel count of the stem and of the first stage's bottleneck.
    pub width: i64,
}

impl Default for ResNetConfig {
    fn default() -> Self {
        // ResNet-50
        Self {
            layers: [3, 4, 6, 3],
            width: 64,
        }
    }
}

impl ResNetConfig {
    /// Bottleneck expansion factor.
    pub const EXPANSION: i64 = 4;

    /// Channel count of the pooled feature vector.
    pub fn feature_dim(&self) -> i64 {
        self.width * 8 * Self::EXPANSION
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolFormerConfig {
    pub layers: [i64; 4],
    pub embed_dims: [i64; 4],
    pub mlp_ratio: i64,
    pub pool_size: i64,
    pub layer_scale_init: f64,
}

impl Default for PoolFormerConfig {
    fn default() -> Self {
        // PoolFormer-S24
        Self {
            layers: [4, 4, 12, 4],
            embed_dims: [64, 128, 320, 512],
            mlp_ratio: 4,
            pool_size: 3,
            layer_scale_init: 1e-5,
        }
    }
}

impl ModelConfig {
    /// A reduced configuration with the same topology, cheap enough for CPU runs.
    pub fn tiny() -> Self {
        Self {
            in_stride: 2,
            resnet: ResNetConfig {
                layers: [1, 1, 1, 1],
                width: 4,
            },
            poolformer: PoolFormerConfig {
                layers: [1, 1, 1, 1],
                embed_dims: [8, 8, 16, 16],
                mlp_ratio: 2,
                pool_size: 3,
                layer_scale_init: 1e-5,
            },
            fusion_hidden: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_full_size() {
        let config = ModelConfig::default();
        assert_eq!(config.resnet.feature_dim(), 2048);
        assert_eq!(config.poolformer.layers.iter().sum::<i64>(), 24);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ModelConfig = serde_json::from_str(r#"{"in_stride": 1}"#).unwrap();
        assert_eq!(config.in_stride, 1);
        assert_eq!(config.resnet, ResNetConfig::default());
    }
}
