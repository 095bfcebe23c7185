//! Gerbilizer CLI - train, evaluate and assess sound source localization models

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use gerbilizer::data::{DatasetOptions, VocalizationSource, TEST_FILE, TRAIN_FILE, VAL_FILE};
use gerbilizer::utils::tensor_utils::select_device;
use gerbilizer::{
    assess_model, build_dataloaders, write_predictions, GerbilizerConfig, JobRequest, Predictor,
    SlurmResources, Trainer, VocalizationDataset, VocalizationFile, VERSION,
};

/// Gerbilizer - locate vocalizing animals from multi-channel audio
#[derive(Parser, Debug)]
#[command(name = "gerbilizer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use CPU instead of GPU
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train a model, or predict with one when --eval is given
    Run {
        /// Dataset directory (training) or HDF5 file (--eval)
        #[arg(long, visible_alias = "datafile")]
        data: PathBuf,

        /// Config file path, or the name of a config under configs/
        #[arg(long, visible_alias = "config_fil")]
        config: String,

        /// Directory for weights and the saved config
        #[arg(long)]
        save_path: Option<PathBuf>,

        /// Initialise from the config's WEIGHTS_PATH
        #[arg(long)]
        pretrained: bool,

        /// Predict locations instead of training
        #[arg(long)]
        eval: bool,

        /// Output HDF5 file for --eval
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Assess a covariance model on a labelled dataset
    Assess {
        /// HDF5 file to assess on
        #[arg(long)]
        data: PathBuf,

        /// Config file path or name; must include WEIGHTS_PATH
        #[arg(long)]
        config: String,

        /// Output HDF5 file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Submit a training job to SLURM
    Submit {
        /// Dataset directory
        data_file: Option<String>,

        /// Config file path or name
        config: Option<String>,

        /// Print the batch script instead of submitting it
        #[arg(long)]
        dry_run: bool,

        /// Scheduler partition
        #[arg(long, default_value = "gpu")]
        partition: String,

        /// Hardware constraint; empty for none
        #[arg(long, default_value = "a100")]
        constraint: String,

        /// Memory ceiling
        #[arg(long, default_value = "32G")]
        mem: String,

        /// Wall-clock limit
        #[arg(long, default_value = "2-00:00:00")]
        time: String,

        /// Log file path (%j is the job id)
        #[arg(long, default_value = "logs/gerbilizer_%j.log")]
        log: String,
    },

    /// Check dataset files against the expected schema
    Validate {
        /// HDF5 file, or a directory of split files
        #[arg(long)]
        data: PathBuf,
    },
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

fn create_progress_bar(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb
}

fn default_save_path(config_arg: &str) -> PathBuf {
    let name = Path::new(config_arg)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    PathBuf::from("trained_models").join(name)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    info!("Gerbilizer v{}", VERSION);

    match cli.command {
        Commands::Run {
            data,
            config,
            save_path,
            pretrained,
            eval,
            output,
        } => {
            let cfg = GerbilizerConfig::resolve(&config)?;
            let device = select_device(cli.cpu)?;

            if eval {
                let output = output.context("--eval requires an output file (-o)")?;
                let pb = create_progress_bar("Loading model...");
                let predictor = Predictor::new(&cfg, device, None)?;
                pb.finish_with_message("Model loaded!");

                let predictions = predictor.predict_file(&data)?;
                write_predictions(&output, predictions.kind, &predictions.predictions)?;
                return Ok(());
            }

            let save_path = save_path.unwrap_or_else(|| default_save_path(&config));
            let mut loaders = build_dataloaders(&data, &cfg)?;
            let weights = cfg.weights_path.clone();
            let mut trainer = Trainer::new(cfg, device, &save_path)?;

            if pretrained {
                match weights {
                    Some(path) => {
                        trainer.load_pretrained(&path)?;
                    }
                    None => warn!("--pretrained given without WEIGHTS_PATH; training from scratch"),
                }
            }

            let summary = trainer.fit(&mut loaders.train, &mut loaders.val)?;
            if let Some(test) = loaders.test.as_mut() {
                let test_loss = trainer.evaluate(test)?;
                info!("Test loss with final weights: {:.4}", test_loss);
            }
            info!("Config with best weights written to {:?}", summary.config_path);
            Ok(())
        }

        Commands::Assess {
            data,
            config,
            output,
        } => {
            let cfg = GerbilizerConfig::resolve(&config)?;
            let device = select_device(cli.cpu)?;
            let predictor = Predictor::new(&cfg, device, None)?;
            let dataset = VocalizationDataset::open(&data, DatasetOptions::from_config(&cfg))?;
            let summary = assess_model(&predictor, dataset, &output)?;
            println!("Mean error: {:.2} mm", summary.mean_error);
            println!("Calibration curve: {:?}", summary.calibration_curve);
            Ok(())
        }

        Commands::Submit {
            data_file,
            config,
            dry_run,
            partition,
            constraint,
            mem,
            time,
            log,
        } => {
            let job = JobRequest::from_args(data_file.as_deref(), config.as_deref())?;
            let resources = SlurmResources {
                partition,
                constraint: (!constraint.is_empty()).then_some(constraint),
                mem,
                time,
                log_path: log,
                ..Default::default()
            };
            let program = std::env::current_exe()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "gerbilizer".to_string());
            let script = job.render_script(&resources, &program);

            if dry_run {
                print!("{}", script);
            } else {
                if let Some(dir) = Path::new(&resources.log_path).parent() {
                    if !dir.as_os_str().is_empty() {
                        std::fs::create_dir_all(dir)
                            .with_context(|| format!("Failed to create log directory: {:?}", dir))?;
                    }
                }
                println!("{}", gerbilizer::job::submit(&script)?);
            }
            Ok(())
        }

        Commands::Validate { data } => {
            let files: Vec<PathBuf> = if data.is_dir() {
                [TRAIN_FILE, VAL_FILE, TEST_FILE]
                    .iter()
                    .map(|f| data.join(f))
                    .filter(|p| p.is_file())
                    .collect()
            } else {
                vec![data.clone()]
            };
            if files.is_empty() {
                anyhow::bail!("No dataset files found in {:?}", data);
            }

            for path in files {
                let file = VocalizationFile::open(&path)?;
                println!(
                    "{}: {} events, {} channels, {} samples, locations: {}",
                    path.display(),
                    file.len(),
                    file.n_channels(),
                    file.total_samples(),
                    if file.has_locations() { "yes" } else { "no" }
                );
            }
            Ok(())
        }
    }
}
