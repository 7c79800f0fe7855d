use tch::{Kind, Tensor};

use crate::error::Result;

const NORM_FLOOR: f64 = 1e-7;

/// Converts a (pitch, yaw) pair in radians into a 3-D gaze direction.
pub fn pitchyaw_to_vector(pitch: f64, yaw: f64) -> [f64; 3] {
    let (sin_p, cos_p) = pitch.sin_cos();
    let (sin_y, cos_y) = yaw.sin_cos();
    [cos_p * sin_y, sin_p, cos_p * cos_y]
}

/// Angle in degrees between the gaze directions of two (pitch, yaw) pairs.
pub fn angular_error(pred: [f64; 2], target: [f64; 2]) -> f64 {
    let a = pitchyaw_to_vector(pred[0], pred[1]);
    let b = pitchyaw_to_vector(target[0], target[1]);

    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt().max(NORM_FLOOR);
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt().max(NORM_FLOOR);

    // Rounding can push the cosine just outside [-1, 1].
    let similarity = (dot / (norm_a * norm_b)).clamp(-1.0, 1.0);
    similarity.acos().to_degrees()
}

/// Mean angular error over a batch of `[batch, 2]` predictions and targets.
pub fn mean_angular_error(pred: &Tensor, target: &Tensor) -> Result<f64> {
    let pred = rows(pred)?;
    let target = rows(target)?;
    if pred.is_empty() {
        return Ok(0.0);
    }
    let total: f64 = pred
        .iter()
        .zip(target.iter())
        .map(|(p, t)| angular_error(*p, *t))
        .sum();
    Ok(total / pred.len() as f64)
}

/// Copies a `[n, 2]` tensor to the host as pitch/yaw rows.
pub fn rows(t: &Tensor) -> Result<Vec<[f64; 2]>> {
    let flat = t
        .detach()
        .to_device(tch::Device::Cpu)
        .to_kind(Kind::Double)
        .reshape([-1]);
    let values = Vec::<f64>::try_from(&flat)?;
    Ok(values.chunks_exact(2).map(|c| [c[0], c[1]]).collect())
}
