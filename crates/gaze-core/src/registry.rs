use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tch::{nn, Tensor};

use crate::config::ModelConfig;
use crate::error::{GazeError, Result};
use crate::input::{GazeInput, LoadMode};
use crate::models::{FacePoolFormer, FaceResNet, MultiRegionResNet};

/// A network mapping image crops to `[batch, 2]` (pitch, yaw) predictions.
pub trait GazeNetwork {
    /// The crops this network consumes.
    fn load_mode(&self) -> LoadMode;

    fn forward_t(&self, input: &GazeInput, train: bool) -> Result<Tensor>;
}

/// The closed set of supported architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModelName {
    FaceRes50,
    MultiRegionRes50,
    MultiRegionRes50ShareEyeNet,
    FacePoolFormer24,
}

impl ModelName {
    pub const ALL: [ModelName; 4] = [
        ModelName::FaceRes50,
        ModelName::MultiRegionRes50,
        ModelName::MultiRegionRes50ShareEyeNet,
        ModelName::FacePoolFormer24,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelName::FaceRes50 => "face_res50",
            ModelName::MultiRegionRes50 => "multi_region_res50",
            ModelName::MultiRegionRes50ShareEyeNet => "multi_region_res50_share_eyenet",
            ModelName::FacePoolFormer24 => "face_poolformer24",
        }
    }

    pub fn load_mode(&self) -> LoadMode {
        match self {
            ModelName::FaceRes50 | ModelName::FacePoolFormer24 => LoadMode::SingleFace,
            ModelName::MultiRegionRes50 | ModelName::MultiRegionRes50ShareEyeNet => LoadMode::MultiRegion,
        }
    }

    /// Creates the network's variables under `vs`.
    pub fn build(&self, vs: &nn::Path, config: &ModelConfig) -> Box<dyn GazeNetwork> {
        match self {
            ModelName::FaceRes50 => Box::new(FaceResNet::new(vs, config)),
            ModelName::MultiRegionRes50 => Box::new(MultiRegionResNet::new(vs, config, false)),
            ModelName::MultiRegionRes50ShareEyeNet => Box::new(MultiRegionResNet::new(vs, config, true)),
            ModelName::FacePoolFormer24 => Box::new(FacePoolFormer::new(vs, config)),
        }
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelName {
    type Err = GazeError;

    fn from_str(s: &str) -> Result<Self> {
        ModelName::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| GazeError::UnknownModel(s.to_string()))
    }
}

impl TryFrom<String> for ModelName {
    type Error = GazeError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ModelName> for String {
    fn from(m: ModelName) -> Self {
        m.as_str().to_string()
    }
}
