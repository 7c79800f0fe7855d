use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use gaze_core::ModelName;

use trainer::{GazeDataset, JsonlSink, LogSink, MetricsSink, Trainer, TrainerConfig};

const DEFAULT_CONFIG: &str = "configs/train.yaml";

#[derive(Parser)]
#[command(author, version, about = "Train and evaluate gaze estimation networks", long_about = None)]
struct Cli {
    /// YAML run configuration (defaults to configs/train.yaml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model on a labelled dataset
    Train {
        /// safetensors file with face_patch, [left|right]_eye_patch and face_gaze
        #[arg(short, long)]
        data: PathBuf,

        /// Resume from this checkpoint and train for another `epochs`
        #[arg(long)]
        resume: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },
    /// Predict gaze for every sample of a dataset
    Test {
        #[arg(short, long)]
        data: PathBuf,

        /// Checkpoint to evaluate
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Output file for the predictions
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(Args)]
struct Overrides {
    /// face_res50, multi_region_res50, multi_region_res50_share_eyenet or face_poolformer24
    #[arg(long)]
    model_name: Option<String>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    init_lr: Option<f64>,

    #[arg(long)]
    ckpt_dir: Option<PathBuf>,

    /// Append scalar metrics as JSON lines to this file
    #[arg(long)]
    metrics: Option<PathBuf>,

    /// Run on the CPU even when CUDA is available
    #[arg(long)]
    cpu: bool,
}

impl Overrides {
    fn apply(&self, config: &mut TrainerConfig) -> Result<()> {
        if let Some(name) = &self.model_name {
            config.model_name = name.parse::<ModelName>()?;
        }
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(lr) = self.init_lr {
            config.init_lr = lr;
        }
        if let Some(dir) = &self.ckpt_dir {
            config.ckpt_dir = dir.clone();
        }
        if self.cpu {
            config.use_gpu = false;
        }
        Ok(())
    }

    fn sink(&self) -> Result<Box<dyn MetricsSink>> {
        Ok(match &self.metrics {
            Some(path) => Box::new(JsonlSink::create(path)?),
            None => Box::new(LogSink),
        })
    }
}

fn load_config(path: Option<&Path>) -> Result<TrainerConfig> {
    match path {
        Some(path) => TrainerConfig::from_yaml_file(path),
        None if Path::new(DEFAULT_CONFIG).exists() => TrainerConfig::from_yaml_file(DEFAULT_CONFIG),
        None => Ok(TrainerConfig::default()),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Train {
            data,
            resume,
            overrides,
        } => {
            overrides.apply(&mut config)?;
            if let Some(path) = resume {
                config.continue_train = true;
                config.continue_train_model_path = Some(path);
            }

            let dataset = GazeDataset::load(&data)?;
            let mut trainer = Trainer::new(config, dataset, overrides.sink()?)?;
            trainer.train()?;
            log::info!("Training complete!");
        }
        Commands::Test {
            data,
            checkpoint,
            output,
            overrides,
        } => {
            overrides.apply(&mut config)?;
            if let Some(path) = checkpoint {
                config.pre_trained_model_path = path;
            }
            if let Some(path) = output {
                config.results_path = path;
            }

            let dataset = GazeDataset::load(&data)?;
            let mut trainer = Trainer::new(config, dataset, overrides.sink()?)?;
            let n = trainer.test()?;
            log::info!("Wrote {} predictions", n);
        }
    }

    Ok(())
}
