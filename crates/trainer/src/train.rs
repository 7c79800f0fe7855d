use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use gaze_core::angular::rows;
use gaze_core::safetensors_util::copy_into_varstore;
use gaze_core::{mean_angular_error, GazeNetwork, LoadMode};
use log::{debug, info, warn};
use tch::{nn, Device, Reduction};

use crate::checkpoint::{checkpoint_file_name, checkpoint_tag, Checkpoint};
use crate::dataset::{DataLoader, GazeDataset};
use crate::meter::AverageMeter;
use crate::optim::{Adam, AdamConfig};
use crate::schedule::LrSchedule;
use crate::telemetry::MetricsSink;
use crate::TrainerConfig;

/// A checkpoint is written after every epoch whose index is 4 modulo this.
pub const CHECKPOINT_EVERY: usize = 5;

pub struct Trainer {
    config: TrainerConfig,
    load_mode: LoadMode,
    model: Box<dyn GazeNetwork>,
    vs: nn::VarStore,
    optimizer: Adam,
    scheduler: LrSchedule,
    dataset: GazeDataset,
    loader: DataLoader,
    sink: Box<dyn MetricsSink>,
    device: Device,
    start_epoch: usize,
    epochs: usize,
    train_iter: usize,
}

impl Trainer {
    pub fn new(config: TrainerConfig, dataset: GazeDataset, sink: Box<dyn MetricsSink>) -> Result<Self> {
        let load_mode = config.validate()?;
        if !dataset.supports(load_mode) {
            bail!(
                "{} needs {} input but the dataset has no eye crops",
                config.model_name,
                load_mode
            );
        }

        let device = if config.use_gpu {
            Device::cuda_if_available()
        } else {
            Device::Cpu
        };
        tch::manual_seed(config.seed as i64);

        info!(
            "We are using {} with the stride of {} on {:?}",
            config.model_name, config.model.in_stride, device
        );
        let vs = nn::VarStore::new(device);
        let model = config.model_name.build(&vs.root(), &config.model);

        let n_params: usize = vs.trainable_variables().iter().map(|t| t.numel()).sum();
        info!("[*] Number of model parameters: {}", n_params);

        let scheduler = LrSchedule::new(
            config.init_lr,
            config.lr_patience,
            config.lr_decay_factor,
            config.warmup_epochs,
        );
        let optimizer = Adam::new(
            &vs,
            AdamConfig {
                lr: scheduler.current_lr(),
                ..Default::default()
            },
        );

        if config.use_gpu && tch::Cuda::device_count() > 1 {
            info!(
                "{} CUDA devices visible; running on {:?}",
                tch::Cuda::device_count(),
                device
            );
        }

        let loader = DataLoader::new(dataset.len(), config.batch_size, config.shuffle, config.seed);
        let epochs = config.epochs;

        Ok(Self {
            config,
            load_mode,
            model,
            vs,
            optimizer,
            scheduler,
            dataset,
            loader,
            sink,
            device,
            start_epoch: 0,
            epochs,
            train_iter: 0,
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Exclusive end of the epoch range `train()` runs.
    pub fn epochs(&self) -> usize {
        self.epochs
    }

    pub fn train_iter(&self) -> usize {
        self.train_iter
    }

    pub fn varstore(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    pub fn scheduler(&self) -> &LrSchedule {
        &self.scheduler
    }

    pub fn train(&mut self) -> Result<()> {
        if !self.dataset.has_labels() {
            bail!("training needs gaze labels");
        }
        info!("[*] Train on {} samples", self.dataset.len());

        if self.config.continue_train {
            if let Some(path) = self.config.continue_train_model_path.clone() {
                info!("Continue training on {:?}", path);
                self.load_checkpoint(&path, false)?;
                self.epochs = self.config.epochs + self.start_epoch;
            }
        }

        for epoch in self.start_epoch..self.epochs {
            info!(
                "Epoch: {}/{} - base LR: {:.6}",
                epoch + 1,
                self.epochs,
                self.config.init_lr
            );
            info!("Learning rate: {}", self.optimizer.lr());

            let (error, loss) = self.train_one_epoch(epoch)?;
            debug!("epoch {} finished: error {:.3} loss {:.5}", epoch, error, loss);

            if epoch % CHECKPOINT_EVERY == CHECKPOINT_EVERY - 1 {
                let tag = checkpoint_tag(epoch, self.config.init_lr);
                self.save_checkpoint(&self.snapshot(epoch + 1), Some(&tag))?;
            }

            let lr = self.scheduler.step();
            self.optimizer.set_lr(lr);
        }

        self.sink.flush()
    }

    /// One pass over the training set. Returns the error and loss averages
    /// since the last progress report.
    pub fn train_one_epoch(&mut self, epoch: usize) -> Result<(f64, f64)> {
        let mut batch_time = AverageMeter::new();
        let mut errors = AverageMeter::new();
        let mut losses_gaze = AverageMeter::new();

        let batches = self.loader.epoch_batches();
        let num_batches = batches.len();
        let print_freq = self.config.print_freq;

        let mut tic = Instant::now();
        let mut window = 0usize;
        for (i, indices) in batches.iter().enumerate() {
            let batch = self.dataset.batch(indices, self.load_mode, self.device)?;
            let target = batch.target.context("training batch has no gaze labels")?;
            let n = batch.input.batch_size() as usize;

            let pred = self.model.forward_t(&batch.input, true)?;
            let error = mean_angular_error(&pred, &target)?;
            errors.update(error, n);

            let loss = pred.l1_loss(&target, Reduction::Mean);
            self.optimizer.backward_step(&loss);
            losses_gaze.update(loss.double_value(&[]), n);
            window += 1;

            if i % print_freq == 0 && i != 0 {
                info!(
                    "train error: {:.3} - loss_gaze: {:.5}",
                    errors.avg, losses_gaze.avg
                );
                self.sink.log_scalar("train_error", errors.avg, self.train_iter)?;
                self.sink.log_scalar("loss_gaze", losses_gaze.avg, self.train_iter)?;

                info!("iteration {}", self.train_iter);
                batch_time.update(tic.elapsed().as_secs_f64() / window as f64, window);
                tic = Instant::now();
                window = 0;

                let remaining = self.epochs.saturating_sub(epoch + 1) * num_batches + (num_batches - i - 1);
                let minutes = remaining as f64 * batch_time.avg / 60.0;
                info!("Estimated training time left: {:.0} mins", minutes);

                errors.reset();
                losses_gaze.reset();
            }

            self.train_iter += 1;
        }

        if window > 0 {
            batch_time.update(tic.elapsed().as_secs_f64() / window as f64, window);
        }
        self.sink.log_scalar("train_error_epoch", errors.avg, self.train_iter)?;
        info!("running time per batch is {:.3}s", batch_time.avg);

        Ok((errors.avg, losses_gaze.avg))
    }

    /// Runs the checkpoint at `pre_trained_model_path` over the whole dataset
    /// and writes the predictions to `results_path`. Returns the number of
    /// predicted samples.
    pub fn test(&mut self) -> Result<usize> {
        info!("We are now doing the final test");
        let path = self.config.pre_trained_model_path.clone();
        self.load_checkpoint(&path, false)?;

        let num_test = self.dataset.len();
        info!("Testing on {} samples", num_test);

        let mut pred_gaze_all = vec![[0.0f64; 2]; num_test];
        let mut save_index = 0usize;
        let mut loader = DataLoader::new(num_test, self.config.batch_size, false, self.config.seed);
        {
            let _guard = tch::no_grad_guard();
            for indices in loader.epoch_batches() {
                let batch = self.dataset.batch(&indices, self.load_mode, self.device)?;
                let pred = self.model.forward_t(&batch.input, false)?;
                let pred = rows(&pred)?;

                let end = (save_index + pred.len()).min(num_test);
                if end > save_index {
                    pred_gaze_all[save_index..end].copy_from_slice(&pred[..end - save_index]);
                }
                save_index += pred.len();
            }
        }

        if save_index != num_test {
            warn!(
                "the test samples save_index {} is not equal to the whole test set {}",
                save_index, num_test
            );
        }

        write_predictions(&self.config.results_path, &pred_gaze_all)?;
        info!(
            "Tested on {} samples, results in {:?}",
            pred_gaze_all.len(),
            self.config.results_path
        );
        Ok(save_index)
    }

    /// Copies the current model, optimizer and schedule state.
    pub fn snapshot(&self, epoch: usize) -> Checkpoint {
        Checkpoint {
            epoch,
            model_state: self
                .vs
                .variables()
                .into_iter()
                .map(|(name, t)| (name, t.detach().copy()))
                .collect(),
            optim_state: self.optimizer.state(),
            schedule_state: self.scheduler.clone(),
        }
    }

    pub fn save_checkpoint(&self, state: &Checkpoint, tag: Option<&str>) -> Result<PathBuf> {
        let dir = &self.config.ckpt_dir;
        if !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create checkpoint dir {:?}", dir))?;
        }
        let path = dir.join(checkpoint_file_name(tag));
        state.save(&path)?;
        info!("save file to: {:?}", path);
        Ok(path)
    }

    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P, strict: bool) -> Result<()> {
        let path = path.as_ref();
        info!("load the pre-trained model: {:?}", path);
        let ckpt = Checkpoint::load(path)?;

        let report = copy_into_varstore(&self.vs, &ckpt.model_state, strict)
            .with_context(|| format!("Checkpoint {:?} does not match {}", path, self.config.model_name))?;
        if !strict {
            debug!(
                "restored {} tensors ({} missing, {} unexpected, {} mismatched)",
                report.loaded.len(),
                report.missing.len(),
                report.unexpected.len(),
                report.mismatched.len()
            );
        }

        self.optimizer.load_state(ckpt.optim_state);
        self.scheduler = ckpt.schedule_state;
        // Periodic checkpoints hold the schedule of the epoch they close.
        while self.scheduler.last_epoch < ckpt.epoch {
            self.scheduler.step();
        }
        self.optimizer.set_lr(self.scheduler.current_lr());
        self.start_epoch = ckpt.epoch;

        info!("[*] Loaded {:?} checkpoint @ epoch {}", path, ckpt.epoch);
        Ok(())
    }
}

/// Writes one `pitch,yaw` line per prediction.
pub fn write_predictions<P: AsRef<Path>>(path: P, predictions: &[[f64; 2]]) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    let mut writer = BufWriter::new(file);
    for [pitch, yaw] in predictions {
        writeln!(writer, "{:.18e},{:.18e}", pitch, yaw)?;
    }
    writer.flush()?;
    Ok(())
}
