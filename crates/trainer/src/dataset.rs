use std::path::Path;

use anyhow::{bail, Context, Result};
use gaze_core::safetensors_util::load_tensor_file;
use gaze_core::{GazeError, GazeInput, LoadMode};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tch::{Device, Kind, Tensor};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub const FACE_KEY: &str = "face_patch";
pub const LEFT_EYE_KEY: &str = "left_eye_patch";
pub const RIGHT_EYE_KEY: &str = "right_eye_patch";
pub const GAZE_KEY: &str = "face_gaze";

/// One batch of model input with its optional `[batch, 2]` gaze labels.
pub struct Batch {
    pub input: GazeInput,
    pub target: Option<Tensor>,
}

/// Image crops and labels held in host memory.
///
/// Images are `[N, 3, H, W]`. `uint8` crops are scaled and normalized with
/// ImageNet statistics when a batch is built; float crops are used as is.
pub struct GazeDataset {
    face: Tensor,
    left_eye: Option<Tensor>,
    right_eye: Option<Tensor>,
    gaze: Option<Tensor>,
}

impl GazeDataset {
    pub fn new(
        face: Tensor,
        left_eye: Option<Tensor>,
        right_eye: Option<Tensor>,
        gaze: Option<Tensor>,
    ) -> Result<Self> {
        let face = channels_first(face);
        let left_eye = left_eye.map(channels_first);
        let right_eye = right_eye.map(channels_first);

        let n = face.size()[0];
        for (name, t) in [("left_eye", &left_eye), ("right_eye", &right_eye), ("gaze", &gaze)] {
            if let Some(t) = t {
                if t.size()[0] != n {
                    bail!("{} has {} samples, face has {}", name, t.size()[0], n);
                }
            }
        }
        if let Some(g) = &gaze {
            if g.size().len() != 2 || g.size()[1] != 2 {
                bail!("gaze labels must be [N, 2], got {:?}", g.size());
            }
        }
        if left_eye.is_some() != right_eye.is_some() {
            bail!("both eye crops must be provided together");
        }

        Ok(Self {
            face,
            left_eye,
            right_eye,
            gaze,
        })
    }

    pub fn single_face(face: Tensor, gaze: Option<Tensor>) -> Result<Self> {
        Self::new(face, None, None, gaze)
    }

    /// Reads a safetensors file with `face_patch`, optional
    /// `left_eye_patch`/`right_eye_patch` and optional `face_gaze` entries.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut file = load_tensor_file(path)
            .with_context(|| format!("Failed to read dataset {:?}", path))?;
        let face = file
            .tensors
            .remove(FACE_KEY)
            .ok_or_else(|| GazeError::MissingTensor(FACE_KEY.to_string()))?;
        let dataset = Self::new(
            face,
            file.tensors.remove(LEFT_EYE_KEY),
            file.tensors.remove(RIGHT_EYE_KEY),
            file.tensors.remove(GAZE_KEY),
        )?;
        log::info!(
            "Loaded {} samples from {:?} (eye crops: {}, labels: {})",
            dataset.len(),
            path,
            dataset.left_eye.is_some(),
            dataset.has_labels()
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.face.size()[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_labels(&self) -> bool {
        self.gaze.is_some()
    }

    pub fn supports(&self, mode: LoadMode) -> bool {
        match mode {
            LoadMode::SingleFace => true,
            LoadMode::MultiRegion => self.left_eye.is_some() && self.right_eye.is_some(),
        }
    }

    /// Gathers the samples at `indices` into a batch on `device`.
    pub fn batch(&self, indices: &[i64], mode: LoadMode, device: Device) -> Result<Batch> {
        let idx = Tensor::from_slice(indices);
        let take = |t: &Tensor| prepare(&t.index_select(0, &idx)).to_device(device);

        let face = take(&self.face);
        let input = match mode {
            LoadMode::SingleFace => GazeInput::SingleFace { face },
            LoadMode::MultiRegion => {
                let left = self.left_eye.as_ref().ok_or(GazeError::MissingRegion("left_eye"))?;
                let right = self.right_eye.as_ref().ok_or(GazeError::MissingRegion("right_eye"))?;
                GazeInput::MultiRegion {
                    left_eye: take(left),
                    right_eye: take(right),
                    face,
                }
            }
        };
        let target = self
            .gaze
            .as_ref()
            .map(|g| g.index_select(0, &idx).to_kind(Kind::Float).to_device(device));

        Ok(Batch { input, target })
    }
}

/// `[N, H, W, 3]` crops are permuted to `[N, 3, H, W]`.
fn channels_first(t: Tensor) -> Tensor {
    let size = t.size();
    if size.len() == 4 && size[3] == 3 && size[1] != 3 {
        t.permute([0, 3, 1, 2]).contiguous()
    } else {
        t
    }
}

fn prepare(t: &Tensor) -> Tensor {
    if t.kind() != Kind::Uint8 {
        return t.to_kind(Kind::Float);
    }
    let mean = Tensor::from_slice(&IMAGENET_MEAN).view([1, 3, 1, 1]);
    let std = Tensor::from_slice(&IMAGENET_STD).view([1, 3, 1, 1]);
    (t.to_kind(Kind::Float) / 255.0 - mean) / std
}

/// Splits `0..len` into batches of `batch_size` indices; the last one may be short.
pub struct DataLoader {
    len: usize,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
}

impl DataLoader {
    pub fn new(len: usize, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            len,
            batch_size: batch_size.max(1),
            shuffle,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_batches(&self) -> usize {
        self.len.div_ceil(self.batch_size)
    }

    /// Index batches for one pass, reshuffled on every call when shuffling.
    pub fn epoch_batches(&mut self) -> Vec<Vec<i64>> {
        let mut order: Vec<i64> = (0..self.len as i64).collect();
        if self.shuffle {
            order.shuffle(&mut self.rng);
        }
        order.chunks(self.batch_size).map(|c| c.to_vec()).collect()
    }
}
