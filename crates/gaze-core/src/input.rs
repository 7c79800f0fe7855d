use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tch::Tensor;

use crate::error::{GazeError, Result};

/// Which image crops are fed to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadMode {
    #[serde(rename = "load_single_face")]
    SingleFace,
    #[serde(rename = "load_multi_region")]
    MultiRegion,
}

impl LoadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadMode::SingleFace => "load_single_face",
            LoadMode::MultiRegion => "load_multi_region",
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadMode {
    type Err = GazeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "load_single_face" => Ok(LoadMode::SingleFace),
            "load_multi_region" => Ok(LoadMode::MultiRegion),
            other => Err(GazeError::UnknownLoadMode(other.to_string())),
        }
    }
}

/// A batch of image crops, shaped `[batch, 3, H, W]` each.
#[derive(Debug)]
pub enum GazeInput {
    SingleFace {
        face: Tensor,
    },
    MultiRegion {
        left_eye: Tensor,
        right_eye: Tensor,
        face: Tensor,
    },
}

impl GazeInput {
    pub fn mode(&self) -> LoadMode {
        match self {
            GazeInput::SingleFace { .. } => LoadMode::SingleFace,
            GazeInput::MultiRegion { .. } => LoadMode::MultiRegion,
        }
    }

    pub fn face(&self) -> &Tensor {
        match self {
            GazeInput::SingleFace { face } | GazeInput::MultiRegion { face, .. } => face,
        }
    }

    pub fn batch_size(&self) -> i64 {
        self.face().size()[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_mode_parses_both_names() {
        assert_eq!("load_single_face".parse::<LoadMode>().unwrap(), LoadMode::SingleFace);
        assert_eq!("load_multi_region".parse::<LoadMode>().unwrap(), LoadMode::MultiRegion);
        assert!(matches!(
            "load_both".parse::<LoadMode>(),
            Err(GazeError::UnknownLoadMode(_))
        ));
    }

    #[test]
    fn batch_size_comes_from_face() {
        let input = GazeInput::SingleFace {
            face: Tensor::zeros([5, 3, 8, 8], (tch::Kind::Float, tch::Device::Cpu)),
        };
        assert_eq!(input.batch_size(), 5);
        assert_eq!(input.mode(), LoadMode::SingleFace);
    }
}
