use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::Path;

use memmap2::MmapOptions;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tch::{nn, Device, Kind, Tensor};

use crate::error::{GazeError, Result};

/// Tensors of a safetensors file, on the CPU, together with its string metadata.
pub struct TensorFile {
    pub tensors: BTreeMap<String, Tensor>,
    pub metadata: HashMap<String, String>,
}

pub fn load_tensor_file<P: AsRef<Path>>(path: P) -> Result<TensorFile> {
    let file = File::open(path)?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let (_, header) = SafeTensors::read_metadata(&buffer)?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let st = SafeTensors::deserialize(&buffer)?;

    let mut tensors = BTreeMap::new();
    for (name, view) in st.tensors() {
        let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
        let kind = match view.dtype() {
            Dtype::F32 => Kind::Float,
            Dtype::F64 => Kind::Double,
            Dtype::F16 => Kind::Half,
            Dtype::BF16 => Kind::BFloat16,
            Dtype::U8 => Kind::Uint8,
            Dtype::I64 => Kind::Int64,
            other => return Err(GazeError::UnsupportedDtype(format!("{:?}", other))),
        };
        tensors.insert(name, Tensor::from_data_size(view.data(), &shape, kind));
    }

    Ok(TensorFile { tensors, metadata })
}

/// Writes tensors in their own dtype plus string metadata. Existing files are
/// overwritten.
pub fn save_tensor_file<P: AsRef<Path>>(
    tensors: &BTreeMap<String, Tensor>,
    metadata: HashMap<String, String>,
    path: P,
) -> Result<()> {
    let mut buffers: Vec<(&str, Dtype, Vec<usize>, Vec<u8>)> = Vec::with_capacity(tensors.len());
    for (name, t) in tensors {
        let shape: Vec<usize> = t.size().iter().map(|&d| d as usize).collect();
        let (dtype, bytes) = le_bytes(t)?;
        buffers.push((name.as_str(), dtype, shape, bytes));
    }

    let mut views = Vec::with_capacity(buffers.len());
    for (name, dtype, shape, bytes) in &buffers {
        views.push((*name, TensorView::new(*dtype, shape.clone(), bytes)?));
    }

    let metadata = if metadata.is_empty() { None } else { Some(metadata) };
    safetensors::serialize_to_file(views, &metadata, path.as_ref())?;
    Ok(())
}

/// Little-endian contents of `t` and the matching safetensors dtype.
fn le_bytes(t: &Tensor) -> Result<(Dtype, Vec<u8>)> {
    let flat = t.detach().to_device(Device::Cpu).contiguous().reshape([-1]);
    let encoded = match flat.kind() {
        Kind::Float => (
            Dtype::F32,
            Vec::<f32>::try_from(&flat)?.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ),
        Kind::Double => (
            Dtype::F64,
            Vec::<f64>::try_from(&flat)?.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ),
        // Half precision is moved bit for bit through a 16-bit integer view.
        Kind::Half | Kind::BFloat16 => {
            let dtype = if flat.kind() == Kind::Half { Dtype::F16 } else { Dtype::BF16 };
            let bits = Vec::<i16>::try_from(&flat.view_dtype(Kind::Int16))?;
            (dtype, bits.iter().flat_map(|v| v.to_le_bytes()).collect())
        }
        Kind::Uint8 => (Dtype::U8, Vec::<u8>::try_from(&flat)?),
        Kind::Int64 => (
            Dtype::I64,
            Vec::<i64>::try_from(&flat)?.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ),
        other => return Err(GazeError::UnsupportedDtype(format!("{:?}", other))),
    };
    Ok(encoded)
}

/// Outcome of copying named tensors into a `VarStore`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub mismatched: Vec<String>,
}

/// Copies `tensors` into the variables of `vs` with matching names.
///
/// With `strict`, any missing, unexpected or differently shaped entry is an
/// error and nothing is copied. Otherwise those entries are skipped.
pub fn copy_into_varstore(
    vs: &nn::VarStore,
    tensors: &BTreeMap<String, Tensor>,
    strict: bool,
) -> Result<LoadReport> {
    let mut variables = vs.variables();
    let device = vs.device();
    let mut report = LoadReport::default();

    for (name, src) in tensors {
        match variables.get(name) {
            Some(var) if var.size() == src.size() => report.loaded.push(name.clone()),
            Some(var) => {
                if strict {
                    return Err(GazeError::ShapeMismatch {
                        name: name.clone(),
                        expected: var.size(),
                        found: src.size(),
                    });
                }
                report.mismatched.push(name.clone());
            }
            None => {
                if strict {
                    return Err(GazeError::UnexpectedTensor(name.clone()));
                }
                report.unexpected.push(name.clone());
            }
        }
    }

    let mut missing: Vec<String> = variables
        .keys()
        .filter(|k| !tensors.contains_key(*k))
        .cloned()
        .collect();
    missing.sort();
    if strict {
        if let Some(first) = missing.into_iter().next() {
            return Err(GazeError::MissingTensor(first));
        }
    } else {
        report.missing = missing;
    }

    tch::no_grad(|| {
        for name in &report.loaded {
            if let (Some(var), Some(src)) = (variables.get_mut(name), tensors.get(name)) {
                var.copy_(&src.to_device(device).to_kind(var.kind()));
            }
        }
    });

    for name in report.unexpected.iter().chain(report.mismatched.iter()) {
        log::debug!("Skipping checkpoint tensor {}", name);
    }
    for name in &report.missing {
        log::debug!("No checkpoint tensor for {}", name);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_round_trip_keeps_values_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.safetensors");

        let mut tensors = BTreeMap::new();
        tensors.insert("a".to_string(), Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0]).view([2, 2]));
        tensors.insert("b".to_string(), Tensor::from_slice(&[0.5f32]));
        let mut metadata = HashMap::new();
        metadata.insert("epoch".to_string(), "7".to_string());

        save_tensor_file(&tensors, metadata, &path).unwrap();
        let loaded = load_tensor_file(&path).unwrap();

        assert_eq!(loaded.metadata.get("epoch").map(String::as_str), Some("7"));
        assert_eq!(loaded.tensors["a"].size(), vec![2, 2]);
        assert!(loaded.tensors["a"].equal(&tensors["a"]));
        assert!(loaded.tensors["b"].equal(&tensors["b"]));
    }

    #[test]
    fn saved_tensors_keep_their_dtype() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kinds.safetensors");

        let mut tensors = BTreeMap::new();
        tensors.insert("f64".to_string(), Tensor::from_slice(&[0.1f64, 1e-300, -2.5]));
        tensors.insert("i64".to_string(), Tensor::from_slice(&[i64::MAX, -7, 0]));
        tensors.insert("u8".to_string(), Tensor::from_slice(&[0u8, 128, 255]).view([3, 1]));
        tensors.insert(
            "f16".to_string(),
            Tensor::from_slice(&[0.5f32, -1.25]).to_kind(Kind::Half),
        );

        save_tensor_file(&tensors, HashMap::new(), &path).unwrap();
        let loaded = load_tensor_file(&path).unwrap();

        for (name, kind) in [
            ("f64", Kind::Double),
            ("i64", Kind::Int64),
            ("u8", Kind::Uint8),
            ("f16", Kind::Half),
        ] {
            assert_eq!(loaded.tensors[name].kind(), kind, "{}", name);
            assert!(loaded.tensors[name].equal(&tensors[name]), "{} differs", name);
        }
        assert_eq!(loaded.tensors["u8"].size(), vec![3, 1]);
    }

    #[test]
    fn unsupported_dtypes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut tensors = BTreeMap::new();
        tensors.insert("flags".to_string(), Tensor::from_slice(&[true, false]));
        let err = save_tensor_file(&tensors, HashMap::new(), dir.path().join("b.safetensors")).unwrap_err();
        assert!(matches!(err, GazeError::UnsupportedDtype(_)));
    }

    fn store() -> nn::VarStore {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let _ = root.zeros("w", &[2, 3]);
        let _ = root.zeros("b", &[3]);
        vs
    }

    #[test]
    fn non_strict_copy_skips_mismatches() {
        let vs = store();
        let mut tensors = BTreeMap::new();
        tensors.insert("w".to_string(), Tensor::ones([2, 3], (Kind::Float, Device::Cpu)));
        tensors.insert("b".to_string(), Tensor::ones([4], (Kind::Float, Device::Cpu)));
        tensors.insert("extra".to_string(), Tensor::ones([1], (Kind::Float, Device::Cpu)));

        let report = copy_into_varstore(&vs, &tensors, false).unwrap();
        assert_eq!(report.loaded, vec!["w".to_string()]);
        assert_eq!(report.mismatched, vec!["b".to_string()]);
        assert_eq!(report.unexpected, vec!["extra".to_string()]);

        let vars = vs.variables();
        assert_eq!(vars["w"].sum(Kind::Float).double_value(&[]), 6.0);
        assert_eq!(vars["b"].sum(Kind::Float).double_value(&[]), 0.0);
    }

    #[test]
    fn strict_copy_rejects_missing_entries() {
        let vs = store();
        let mut tensors = BTreeMap::new();
        tensors.insert("w".to_string(), Tensor::ones([2, 3], (Kind::Float, Device::Cpu)));

        let err = copy_into_varstore(&vs, &tensors, true).unwrap_err();
        assert!(matches!(err, GazeError::MissingTensor(ref n) if n == "b"));
        assert_eq!(vs.variables()["w"].sum(Kind::Float).double_value(&[]), 0.0);
    }
}
