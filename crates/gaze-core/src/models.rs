use tch::{nn, nn::ModuleT, Tensor};

use crate::config::ModelConfig;
use crate::error::{GazeError, Result};
use crate::input::{GazeInput, LoadMode};
use crate::poolformer::PoolFormer;
use crate::registry::GazeNetwork;
use crate::resnet::ResNetBackbone;

/// Number of regressed angles: pitch and yaw.
pub const GAZE_DIMS: i64 = 2;

fn mismatch(model: &str, expected: LoadMode, input: &GazeInput) -> GazeError {
    GazeError::LoadModeMismatch {
        model: model.to_string(),
        expected: expected.to_string(),
        actual: input.mode().to_string(),
    }
}

/// Full-face ResNet regressor.
#[derive(Debug)]
pub struct FaceResNet {
    backbone: ResNetBackbone,
    gaze_fc: nn::Linear,
}

impl FaceResNet {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let backbone = ResNetBackbone::new(&(vs / "gaze_network"), &config.resnet, config.in_stride);
        let gaze_fc = nn::linear(vs / "gaze_fc", backbone.feature_dim(), GAZE_DIMS, Default::default());
        Self { backbone, gaze_fc }
    }
}

impl GazeNetwork for FaceResNet {
    fn load_mode(&self) -> LoadMode {
        LoadMode::SingleFace
    }

    fn forward_t(&self, input: &GazeInput, train: bool) -> Result<Tensor> {
        match input {
            GazeInput::SingleFace { face } => Ok(self.backbone.forward_t(face, train).apply(&self.gaze_fc)),
            other => Err(mismatch("face_res50", LoadMode::SingleFace, other)),
        }
    }
}

/// Eye networks are either separate per eye or one network applied to both.
#[derive(Debug)]
enum EyeNets {
    Separate {
        left: ResNetBackbone,
        right: ResNetBackbone,
    },
    Shared(ResNetBackbone),
}

impl EyeNets {
    fn forward_t(&self, left: &Tensor, right: &Tensor, train: bool) -> (Tensor, Tensor) {
        match self {
            EyeNets::Separate { left: l, right: r } => (l.forward_t(left, train), r.forward_t(right, train)),
            EyeNets::Shared(net) => (net.forward_t(left, train), net.forward_t(right, train)),
        }
    }
}

/// Left eye, right eye and face features fused by a small MLP.
#[derive(Debug)]
pub struct MultiRegionResNet {
    eyes: EyeNets,
    face: ResNetBackbone,
    fc1: nn::Linear,
    fc2: nn::Linear,
    name: &'static str,
}

impl MultiRegionResNet {
    pub fn new(vs: &nn::Path, config: &ModelConfig, share_eye_net: bool) -> Self {
        let resnet = &config.resnet;
        let eyes = if share_eye_net {
            EyeNets::Shared(ResNetBackbone::new(&(vs / "eye_net"), resnet, config.in_stride))
        } else {
            EyeNets::Separate {
                left: ResNetBackbone::new(&(vs / "left_eye_net"), resnet, config.in_stride),
                right: ResNetBackbone::new(&(vs / "right_eye_net"), resnet, config.in_stride),
            }
        };
        let face = ResNetBackbone::new(&(vs / "face_net"), resnet, config.in_stride);

        let fused = 3 * resnet.feature_dim();
        let fc1 = nn::linear(vs / "fc1", fused, config.fusion_hidden, Default::default());
        let fc2 = nn::linear(vs / "fc2", config.fusion_hidden, GAZE_DIMS, Default::default());

        Self {
            eyes,
            face,
            fc1,
            fc2,
            name: if share_eye_net {
                "multi_region_res50_share_eyenet"
            } else {
                "multi_region_res50"
            },
        }
    }
}

impl GazeNetwork for MultiRegionResNet {
    fn load_mode(&self) -> LoadMode {
        LoadMode::MultiRegion
    }

    fn forward_t(&self, input: &GazeInput, train: bool) -> Result<Tensor> {
        match input {
            GazeInput::MultiRegion {
                left_eye,
                right_eye,
                face,
            } => {
                let (left, right) = self.eyes.forward_t(left_eye, right_eye, train);
                let face = self.face.forward_t(face, train);
                let fused = Tensor::cat(&[left, right, face], 1);
                Ok(fused.apply(&self.fc1).relu().apply(&self.fc2))
            }
            other => Err(mismatch(self.name, LoadMode::MultiRegion, other)),
        }
    }
}

/// Full-face PoolFormer regressor.
#[derive(Debug)]
pub struct FacePoolFormer {
    net: PoolFormer,
}

impl FacePoolFormer {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        Self {
            net: PoolFormer::new(vs, &config.poolformer, config.in_stride, GAZE_DIMS),
        }
    }
}

impl GazeNetwork for FacePoolFormer {
    fn load_mode(&self) -> LoadMode {
        LoadMode::SingleFace
    }

    fn forward_t(&self, input: &GazeInput, train: bool) -> Result<Tensor> {
        match input {
            GazeInput::SingleFace { face } => Ok(self.net.forward_t(face, train)),
            other => Err(mismatch("face_poolformer24", LoadMode::SingleFace, other)),
        }
    }
}
