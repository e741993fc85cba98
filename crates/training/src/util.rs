use burn::backend::Autodiff;
use burn::module::Module;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use clap::{Parser, ValueEnum};
use grid_dataset::{
    index_labels, load_class_list, split_indices, BatchIter, GridSpec, LoaderConfig, SampleIndex,
};
use models::{GridDetector, GridDetectorConfig};
use std::fs;
use std::path::Path;
use std::time::Instant;

use crate::loss::{DetectionLoss, LossError, LossWeights};
use crate::summary::{Hyperparameters, TrainingSummary};
use crate::TrainBackend;

type ADBackend = Autodiff<TrainBackend>;

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(name = "train", about = "Train the grid detector on a labelled dataset")]
pub struct TrainArgs {
    /// Run name recorded in the training summary.
    #[arg(long, default_value = "grid-detector")]
    pub run_name: String,
    /// Dataset root containing labels/ and the images referenced by them.
    #[arg(long)]
    pub dataset_root: String,
    /// Class file (one name per line); defaults to <root>/classes.txt.
    #[arg(long)]
    pub classes_path: Option<String>,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Grid size S.
    #[arg(long, default_value_t = 7)]
    pub grid_size: usize,
    /// Predictor slots per cell B.
    #[arg(long, default_value_t = 2)]
    pub slots_per_cell: usize,
    /// Square input image size.
    #[arg(long, default_value_t = 448)]
    pub image_size: u32,
    /// Batch size.
    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,
    /// Number of epochs.
    #[arg(long, default_value_t = 50)]
    pub epochs: usize,
    /// Learning rate.
    #[arg(long, default_value_t = 1e-4)]
    pub lr: f64,
    /// Coordinate-term weight.
    #[arg(long, default_value_t = 5.0)]
    pub lambda_coord: f32,
    /// No-object-term weight.
    #[arg(long, default_value_t = 0.5)]
    pub lambda_noobj: f32,
    /// Fraction of samples held out for validation.
    #[arg(long, default_value_t = 0.1)]
    pub val_ratio: f32,
    /// Shuffle/split seed for reproducible runs.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Decode worker count for the loader pool.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,
    /// Prefetch queue depth in batches.
    #[arg(long, default_value_t = 2)]
    pub prefetch: usize,
    /// Consecutive non-finite batches tolerated before the run aborts.
    #[arg(long, default_value_t = 3)]
    pub max_nonfinite_batches: usize,
    /// Checkpoint output path.
    #[arg(long, default_value = "checkpoints/grid_detector.bin")]
    pub checkpoint_out: String,
    /// Training summary JSON output path.
    #[arg(long, default_value = "checkpoints/summary.json")]
    pub summary_out: String,
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let device_desc = resolve_backend_choice(args.backend);
    validate_args(&args)?;

    let root = Path::new(&args.dataset_root);
    if !root.is_dir() {
        anyhow::bail!("dataset root {} does not exist", root.display());
    }

    let classes_path = args
        .classes_path
        .clone()
        .map(Into::into)
        .unwrap_or_else(|| root.join("classes.txt"));
    let class_list = load_class_list(&classes_path)
        .map_err(|e| anyhow::anyhow!("failed to load class file {}: {e}", classes_path.display()))?;

    let indices = index_labels(root)
        .map_err(|e| anyhow::anyhow!("failed to index dataset {}: {e}", root.display()))?;
    if indices.is_empty() {
        anyhow::bail!("no label files found under {}", root.join("labels").display());
    }
    let samples = indices.len();
    let (train_indices, val_indices) = split_indices(indices, args.val_ratio, args.seed);
    if train_indices.is_empty() {
        anyhow::bail!("val split of {} leaves no training samples", args.val_ratio);
    }
    println!(
        "dataset: {} samples ({} train, {} val), {} classes",
        samples,
        train_indices.len(),
        val_indices.len(),
        class_list.len()
    );

    if let Some(parent) = Path::new(&args.checkpoint_out).parent() {
        fs::create_dir_all(parent)?;
    }

    let spec = GridSpec {
        s: args.grid_size,
        b: args.slots_per_cell,
        c: class_list.len(),
    };
    let started = Instant::now();
    let report = fit(&args, spec, &train_indices, &val_indices)?;
    let duration_secs = started.elapsed().as_secs_f64();

    let summary = TrainingSummary {
        run_name: args.run_name.clone(),
        device: device_desc,
        duration_secs,
        samples,
        train_samples: train_indices.len(),
        val_samples: val_indices.len(),
        classes: class_list.names().to_vec(),
        hyperparameters: Hyperparameters {
            grid_size: spec.s,
            slots_per_cell: spec.b,
            classes: spec.c,
            image_size: args.image_size,
            batch_size: args.batch_size,
            epochs: args.epochs,
            learning_rate: args.lr,
            lambda_coord: args.lambda_coord,
            lambda_noobj: args.lambda_noobj,
        },
        train_loss: report.train_loss,
        val_loss: report.val_loss,
        checkpoint: args.checkpoint_out.clone(),
        created_at_ms: TrainingSummary::now_ms(),
    };
    summary.save(Path::new(&args.summary_out))?;

    println!("Saved checkpoint to {}", args.checkpoint_out);
    println!("Saved summary to {}", args.summary_out);
    Ok(())
}

struct FitReport {
    train_loss: Vec<f32>,
    val_loss: Vec<f32>,
}

/// Tracks consecutive non-finite training batches. A failed batch skips
/// the optimizer step; a run of `limit` failures in a row is fatal.
struct NonFiniteTracker {
    limit: usize,
    consecutive: usize,
}

impl NonFiniteTracker {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            consecutive: 0,
        }
    }

    fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Returns true once the failure budget is exhausted.
    fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.limit
    }

    fn consecutive(&self) -> usize {
        self.consecutive
    }
}

fn fit(
    args: &TrainArgs,
    spec: GridSpec,
    train_indices: &[SampleIndex],
    val_indices: &[SampleIndex],
) -> anyhow::Result<FitReport> {
    let device = <ADBackend as burn::tensor::backend::Backend>::Device::default();
    let mut model = GridDetector::<ADBackend>::new(
        GridDetectorConfig {
            grid_size: spec.s,
            slots_per_cell: spec.b,
            classes: spec.c,
            ..Default::default()
        },
        &device,
    );
    let mut optim = AdamConfig::new().init();
    let loss_fn = DetectionLoss::new(
        spec,
        LossWeights {
            coord: args.lambda_coord,
            no_object: args.lambda_noobj,
        },
    );

    let mut train_loss = Vec::with_capacity(args.epochs);
    let mut val_loss = Vec::new();
    let mut nonfinite = NonFiniteTracker::new(args.max_nonfinite_batches);

    for epoch in 0..args.epochs {
        let mut iter = BatchIter::spawn(
            train_indices.to_vec(),
            spec,
            loader_config(args, true, epoch),
        );
        let mut losses = Vec::new();
        let mut batch_index = 0usize;
        loop {
            let Some(batch) = iter.next_batch::<ADBackend>(&device)? else {
                break;
            };
            let preds = model.forward(batch.images);
            match loss_fn.forward(preds, batch.targets) {
                Ok((loss, breakdown)) => {
                    nonfinite.record_success();
                    let grads = GradientsParams::from_grads(loss.backward(), &model);
                    model = optim.step(args.lr, model, grads);
                    losses.push(breakdown.total);
                }
                Err(LossError::NonFinite { value }) => {
                    eprintln!(
                        "[train] non-finite loss ({value}) at epoch {epoch} batch {batch_index}; skipping update"
                    );
                    if nonfinite.record_failure() {
                        anyhow::bail!(
                            "aborting: {} consecutive non-finite losses (last at epoch {epoch} batch {batch_index})",
                            nonfinite.consecutive()
                        );
                    }
                }
                Err(e) => return Err(e.into()),
            }
            batch_index += 1;
        }
        let avg = average(&losses);
        train_loss.push(avg);
        println!("epoch {epoch}: avg loss {avg:.4}");

        if !val_indices.is_empty() {
            let avg = validate(args, &loss_fn, &model, val_indices, spec, &device)?;
            val_loss.push(avg);
            println!("epoch {epoch}: val loss {avg:.4}");
        }
    }

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(Path::new(&args.checkpoint_out), &recorder)
        .map_err(|e| anyhow::anyhow!("failed to save checkpoint: {e}"))?;

    Ok(FitReport {
        train_loss,
        val_loss,
    })
}

/// Forward-only pass over the validation split. Non-finite validation
/// batches are reported but never abort the run; no update happens here.
fn validate(
    args: &TrainArgs,
    loss_fn: &DetectionLoss,
    model: &GridDetector<ADBackend>,
    val_indices: &[SampleIndex],
    spec: GridSpec,
    device: &<ADBackend as burn::tensor::backend::Backend>::Device,
) -> anyhow::Result<f32> {
    let mut iter = BatchIter::spawn(val_indices.to_vec(), spec, loader_config(args, false, 0));
    let mut losses = Vec::new();
    loop {
        let Some(batch) = iter.next_batch::<ADBackend>(device)? else {
            break;
        };
        let preds = model.forward(batch.images);
        match loss_fn.forward(preds, batch.targets) {
            Ok((_, breakdown)) => losses.push(breakdown.total),
            Err(LossError::NonFinite { value }) => {
                eprintln!("[train] non-finite validation loss ({value}); batch ignored");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(average(&losses))
}

fn loader_config(args: &TrainArgs, shuffle: bool, epoch: usize) -> LoaderConfig {
    LoaderConfig {
        target_size: (args.image_size, args.image_size),
        batch_size: args.batch_size,
        shuffle,
        // Vary the order per epoch while staying reproducible.
        seed: args.seed.map(|s| s.wrapping_add(epoch as u64)),
        workers: args.workers,
        prefetch: args.prefetch,
        skip_empty_labels: false,
        drop_last: false,
    }
}

fn average(losses: &[f32]) -> f32 {
    if losses.is_empty() {
        0.0
    } else {
        losses.iter().sum::<f32>() / losses.len() as f32
    }
}

fn validate_args(args: &TrainArgs) -> anyhow::Result<()> {
    if args.grid_size == 0 || args.slots_per_cell == 0 {
        anyhow::bail!("grid size and slots per cell must be at least 1");
    }
    if args.image_size == 0 {
        anyhow::bail!("image size must be positive");
    }
    if args.batch_size == 0 || args.epochs == 0 {
        anyhow::bail!("batch size and epoch count must be at least 1");
    }
    if !(args.lr > 0.0) {
        anyhow::bail!("learning rate must be positive, got {}", args.lr);
    }
    if !(0.0..1.0).contains(&args.val_ratio) {
        anyhow::bail!("val ratio must lie in [0, 1), got {}", args.val_ratio);
    }
    if args.lambda_coord <= 0.0 || args.lambda_noobj <= 0.0 {
        anyhow::bail!("loss weights must be positive");
    }
    if args.max_nonfinite_batches == 0 {
        anyhow::bail!("max non-finite batches must be at least 1");
    }
    Ok(())
}

/// Resolve the requested backend against what this binary was built with.
/// An unavailable accelerator falls back to the CPU path, loudly; the
/// returned description records which path actually runs.
pub fn resolve_backend_choice(kind: BackendKind) -> String {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            eprintln!("[train] wgpu backend not built in; falling back to ndarray (cpu). rebuild with --features backend-wgpu for gpu support");
            "ndarray (cpu, fallback from wgpu)".to_string()
        }
        (BackendKind::NdArray, true) => {
            println!("note: built with backend-wgpu; training uses the WGPU backend despite --backend ndarray");
            "wgpu".to_string()
        }
        (BackendKind::Wgpu, true) => "wgpu".to_string(),
        (BackendKind::NdArray, false) => "ndarray (cpu)".to_string(),
    }
}

/// Load a trained detector from a checkpoint for downstream use.
pub fn load_detector_from_checkpoint<P: AsRef<Path>>(
    path: P,
    config: GridDetectorConfig,
    device: &<TrainBackend as burn::tensor::backend::Backend>::Device,
) -> Result<GridDetector<TrainBackend>, burn::record::RecorderError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    GridDetector::<TrainBackend>::new(config, device).load_file(path.as_ref(), &recorder, device)
}
