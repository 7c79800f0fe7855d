use std::path::Path;

use gaze_core::{ModelConfig, ModelName};
use tch::{Device, Kind, Tensor};
use trainer::{GazeDataset, RecordingSink, Trainer, TrainerConfig};

fn crops(n: i64) -> Tensor {
    Tensor::randn([n, 3, 32, 32], (Kind::Float, Device::Cpu))
}

fn labels(n: i64) -> Tensor {
    Tensor::rand([n, 2], (Kind::Float, Device::Cpu)) - 0.5
}

fn face_dataset(n: i64) -> GazeDataset {
    GazeDataset::single_face(crops(n), Some(labels(n))).unwrap()
}

fn multi_region_dataset(n: i64) -> GazeDataset {
    GazeDataset::new(crops(n), Some(crops(n)), Some(crops(n)), Some(labels(n))).unwrap()
}

fn tiny_config(dir: &Path) -> TrainerConfig {
    TrainerConfig {
        batch_size: 4,
        epochs: 2,
        init_lr: 1e-3,
        lr_patience: 3,
        use_gpu: false,
        ckpt_dir: dir.join("ckpt"),
        print_freq: 1,
        results_path: dir.join("within_eva_results.txt"),
        seed: 3,
        model: ModelConfig::tiny(),
        ..Default::default()
    }
}

fn checkpoint_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

#[test]
fn checkpoints_every_fifth_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainerConfig {
        epochs: 10,
        ..tiny_config(dir.path())
    };
    let sink = RecordingSink::new();
    let mut trainer = Trainer::new(config, face_dataset(8), Box::new(sink.clone())).unwrap();
    trainer.train().unwrap();

    assert_eq!(sink.values("train_error_epoch").len(), 10);
    assert_eq!(trainer.scheduler().last_epoch, 10);
    assert_eq!(trainer.train_iter(), 20);
    assert_eq!(
        checkpoint_names(&dir.path().join("ckpt")),
        vec![
            "epoch_4_0.001_ckpt.safetensors".to_string(),
            "epoch_9_0.001_ckpt.safetensors".to_string(),
        ]
    );
}

#[test]
fn progress_is_reported_every_print_freq_batches() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainerConfig {
        epochs: 1,
        batch_size: 2,
        print_freq: 2,
        ..tiny_config(dir.path())
    };
    let sink = RecordingSink::new();
    let mut trainer = Trainer::new(config, face_dataset(8), Box::new(sink.clone())).unwrap();
    trainer.train().unwrap();

    // four batches: a report after batch index 2 only
    assert_eq!(sink.values("train_error").len(), 1);
    assert_eq!(sink.values("loss_gaze").len(), 1);
    let step = sink
        .records()
        .into_iter()
        .find(|r| r.name == "loss_gaze")
        .map(|r| r.step);
    assert_eq!(step, Some(2));
    assert!(sink.values("train_error")[0] >= 0.0);
}

#[test]
fn reported_loss_covers_only_the_batches_since_the_last_report() {
    let dir = tempfile::tempdir().unwrap();
    // one warmup epoch keeps the learning rate at zero, so the weights stay put
    let config = TrainerConfig {
        epochs: 1,
        batch_size: 2,
        print_freq: 1,
        warmup_epochs: 1,
        shuffle: false,
        ..tiny_config(dir.path())
    };
    let faces = crops(8);
    let gaze = labels(8);
    let slice = |k: i64| {
        GazeDataset::single_face(faces.narrow(0, 2 * k, 2), Some(gaze.narrow(0, 2 * k, 2))).unwrap()
    };

    let batch_loss: Vec<f64> = (0..4)
        .map(|k| {
            let mut single = Trainer::new(config.clone(), slice(k), Box::new(RecordingSink::new())).unwrap();
            single.train_one_epoch(0).unwrap().1
        })
        .collect();

    let dataset = GazeDataset::single_face(faces.shallow_clone(), Some(gaze.shallow_clone())).unwrap();
    let sink = RecordingSink::new();
    let mut trainer = Trainer::new(config, dataset, Box::new(sink.clone())).unwrap();
    trainer.train_one_epoch(0).unwrap();

    // batch 0 is folded into the first report at batch 1
    let expected = [(batch_loss[0] + batch_loss[1]) / 2.0, batch_loss[2], batch_loss[3]];
    let reported = sink.values("loss_gaze");
    assert_eq!(reported.len(), expected.len());
    for (got, want) in reported.iter().zip(expected) {
        assert!((got - want).abs() < 1e-6, "{} != {}", got, want);
    }
}

#[test]
fn continue_training_extends_the_epoch_range() {
    let dir = tempfile::tempdir().unwrap();
    let first = TrainerConfig {
        epochs: 5,
        ..tiny_config(dir.path())
    };
    let mut trainer = Trainer::new(first.clone(), face_dataset(8), Box::new(RecordingSink::new())).unwrap();
    trainer.train().unwrap();
    let ckpt = dir.path().join("ckpt").join("epoch_4_0.001_ckpt.safetensors");
    assert!(ckpt.exists());

    let resumed = TrainerConfig {
        epochs: 3,
        continue_train: true,
        continue_train_model_path: Some(ckpt),
        ..first
    };
    let sink = RecordingSink::new();
    let mut trainer = Trainer::new(resumed, face_dataset(8), Box::new(sink.clone())).unwrap();
    trainer.train().unwrap();

    assert_eq!(trainer.start_epoch(), 5);
    assert_eq!(trainer.epochs(), 8);
    assert_eq!(sink.values("train_error_epoch").len(), 3);
    assert_eq!(trainer.scheduler().last_epoch, 8);
}

#[test]
fn multi_region_models_train() {
    let dir = tempfile::tempdir().unwrap();
    for name in [ModelName::MultiRegionRes50, ModelName::MultiRegionRes50ShareEyeNet] {
        let config = TrainerConfig {
            model_name: name,
            epochs: 1,
            ..tiny_config(dir.path())
        };
        let sink = RecordingSink::new();
        let mut trainer = Trainer::new(config, multi_region_dataset(8), Box::new(sink.clone())).unwrap();
        trainer.train().unwrap();
        assert_eq!(sink.values("train_error_epoch").len(), 1, "{}", name);
    }
}

#[test]
fn multi_region_model_rejects_face_only_data() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainerConfig {
        model_name: ModelName::MultiRegionRes50,
        ..tiny_config(dir.path())
    };
    assert!(Trainer::new(config, face_dataset(4), Box::new(RecordingSink::new())).is_err());
}

#[test]
fn training_lowers_the_loss_on_a_fixed_batch() {
    let dir = tempfile::tempdir().unwrap();
    let config = TrainerConfig {
        model_name: ModelName::FacePoolFormer24,
        epochs: 30,
        batch_size: 4,
        print_freq: 100,
        init_lr: 1e-2,
        lr_patience: 100,
        shuffle: false,
        ..tiny_config(dir.path())
    };
    let face = crops(4);
    let gaze = Tensor::from_slice(&[0.3f32, -0.2, 0.3, -0.2, 0.3, -0.2, 0.3, -0.2]).view([4, 2]);
    let dataset = GazeDataset::single_face(face, Some(gaze)).unwrap();
    let sink = RecordingSink::new();
    let mut trainer = Trainer::new(config, dataset, Box::new(sink.clone())).unwrap();
    trainer.train().unwrap();

    let per_epoch = sink.values("train_error_epoch");
    assert_eq!(per_epoch.len(), 30);
    assert!(per_epoch[29] < per_epoch[0], "{:?}", per_epoch);
}
