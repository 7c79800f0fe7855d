pub mod angular;
pub mod config;
pub mod error;
pub mod input;
pub mod models;
pub mod poolformer;
pub mod registry;
pub mod resnet;
pub mod safetensors_util;

pub use angular::{angular_error, mean_angular_error, pitchyaw_to_vector};
pub use config::{ModelConfig, PoolFormerConfig, ResNetConfig};
pub use error::{GazeError, Result};
pub use input::{GazeInput, LoadMode};
pub use registry::{GazeNetwork, ModelName};
