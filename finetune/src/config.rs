use std::path::PathBuf;

use clap::{ArgAction, Parser};
use log::warn;
use machine_learning::{
    arch::{ModelKind, VitConfig, loss::TaskMode},
    mixup::{MixupConfig, MixupMode, VolumeShape},
};

use crate::{FinetuneErr, Result};

/// Fine-tunes a pretrained 3D Vision Transformer on a volume classification task.
#[derive(Debug, Clone, Parser)]
#[command(name = "finetune", rename_all = "snake_case")]
pub struct Args {
    /// Batch size per process, the effective batch is batch_size * accum_iter * world_size.
    #[arg(long, default_value_t = 3)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 200)]
    pub epochs: usize,

    /// Micro-batches accumulated per optimizer step.
    #[arg(long, default_value_t = 4)]
    pub accum_iter: usize,

    // Model parameters
    #[arg(long, default_value = "vit_large_patch16")]
    pub model: String,

    /// Side of the cubic input volume.
    #[arg(long, default_value_t = 256)]
    pub input_size: usize,

    #[arg(long, default_value_t = 1)]
    pub in_chans: usize,

    #[arg(long, default_value_t = 0.0)]
    pub drop_path: f32,

    // Optimizer parameters
    /// Clip gradients to this global norm.
    #[arg(long)]
    pub clip_grad: Option<f32>,

    #[arg(long, default_value_t = 0.05)]
    pub weight_decay: f32,

    /// Absolute learning rate, overrides blr.
    #[arg(long)]
    pub lr: Option<f32>,

    /// Base learning rate, absolute_lr = blr * effective_batch / 256.
    #[arg(long, default_value_t = 1e-3)]
    pub blr: f32,

    #[arg(long, default_value_t = 0.75)]
    pub layer_decay: f32,

    #[arg(long, default_value_t = 1e-6)]
    pub min_lr: f32,

    #[arg(long, default_value_t = 5)]
    pub warmup_epochs: usize,

    #[arg(long, default_value_t = 0.1)]
    pub smoothing: f32,

    // Mixup parameters
    #[arg(long, default_value_t = 0.0)]
    pub mixup: f32,

    #[arg(long, default_value_t = 0.0)]
    pub cutmix: f32,

    /// Cutmix min/max ratio, overrides the cutmix alpha.
    #[arg(long, value_delimiter = ',')]
    pub cutmix_minmax: Option<Vec<f32>>,

    #[arg(long, default_value_t = 1.0)]
    pub mixup_prob: f32,

    #[arg(long, default_value_t = 0.5)]
    pub mixup_switch_prob: f32,

    /// One of batch, pair or elem.
    #[arg(long, default_value = "batch")]
    pub mixup_mode: String,

    // Finetuning parameters
    /// Pretrained checkpoint to warm start from.
    #[arg(long)]
    pub finetune: Option<PathBuf>,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub global_pool: bool,

    /// Use the class token instead of global pooling.
    #[arg(long)]
    pub cls_token: bool,

    // Dataset parameters
    /// Training manifest.
    #[arg(long)]
    pub data_path_tr: Option<PathBuf>,

    /// Validation manifest.
    #[arg(long)]
    pub data_path_val: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    pub nb_classes: usize,

    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub regression: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub binary_class: bool,

    /// Positive weights of the binary outputs.
    #[arg(long, value_delimiter = ',')]
    pub binary_class_weights: Option<Vec<f32>>,

    #[arg(long, default_value = "./output_dir")]
    pub output_dir: PathBuf,

    #[arg(long, default_value = "./output_dir")]
    pub log_dir: PathBuf,

    #[arg(long, default_value_t = 5)]
    pub seed: u64,

    /// Checkpoint to resume from.
    #[arg(long)]
    pub resume: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    pub start_epoch: usize,

    /// Only evaluate.
    #[arg(long)]
    pub eval: bool,

    /// Shard the validation set across processes.
    #[arg(long)]
    pub dist_eval: bool,

    #[arg(long, default_value_t = 1)]
    pub num_workers: usize,

    /// Optimizer steps between two validation passes.
    #[arg(long, default_value_t = 20)]
    pub validate_every: usize,

    #[arg(long, default_value_t = 20)]
    pub print_freq: usize,

    // Distributed training parameters
    #[arg(long, default_value_t = 1)]
    pub world_size: usize,

    #[arg(long, default_value_t = 0)]
    pub rank: usize,

    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub local_rank: i64,

    /// `env://` or `tcp://host:port`.
    #[arg(long, default_value = "env://")]
    pub dist_url: String,
}

/// The process group settings before the environment is consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistArgs {
    pub world_size: usize,
    pub rank: usize,
    pub local_rank: Option<usize>,
    pub dist_url: String,
}

/// A validated run configuration.
#[derive(Debug, Clone)]
pub struct FinetuneConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub accum_iter: usize,
    pub model: ModelKind,
    pub input_size: usize,
    pub in_chans: usize,
    pub drop_path: f32,
    pub clip_grad: Option<f32>,
    pub weight_decay: f32,
    pub lr: Option<f32>,
    pub blr: f32,
    pub layer_decay: f32,
    pub min_lr: f32,
    pub warmup_epochs: usize,
    pub smoothing: f32,
    pub mixup: Option<MixupConfig>,
    pub finetune: Option<PathBuf>,
    pub global_pool: bool,
    pub data_path_tr: Option<PathBuf>,
    pub data_path_val: PathBuf,
    pub nb_classes: usize,
    pub task: TaskMode,
    pub binary_class_weights: Option<Vec<f32>>,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    pub seed: u64,
    pub resume: Option<PathBuf>,
    pub start_epoch: usize,
    pub eval: bool,
    pub dist_eval: bool,
    pub num_workers: usize,
    pub validate_every: usize,
    pub print_freq: usize,
    pub dist: DistArgs,
}

fn invalid<T>(msg: impl Into<String>) -> Result<T> {
    Err(FinetuneErr::InvalidConfig(msg.into()))
}

impl TryFrom<Args> for FinetuneConfig {
    type Error = FinetuneErr;

    fn try_from(args: Args) -> Result<Self> {
        let model: ModelKind = args
            .model
            .parse()
            .map_err(|e| FinetuneErr::InvalidConfig(format!("{e}")))?;

        if args.batch_size == 0 || args.accum_iter == 0 {
            return invalid("batch_size and accum_iter must be positive");
        }

        if args.validate_every == 0 || args.print_freq == 0 {
            return invalid("validate_every and print_freq must be positive");
        }

        if args.nb_classes == 0 || args.in_chans == 0 {
            return invalid("nb_classes and in_chans must be positive");
        }

        let patch_size = model.config(args.input_size, 1, 1, 0.0, true).patch_size;
        if args.input_size == 0 || args.input_size % patch_size != 0 {
            return invalid(format!(
                "input_size {} is not a multiple of the {model} patch size {patch_size}",
                args.input_size
            ));
        }

        if !(0.0..1.0).contains(&args.smoothing) {
            return invalid(format!("smoothing {} must be within [0, 1)", args.smoothing));
        }

        if !(0.0..1.0).contains(&args.drop_path) {
            return invalid(format!("drop_path {} must be within [0, 1)", args.drop_path));
        }

        if let Some(lr) = args.lr
            && lr <= 0.0
        {
            return invalid(format!("lr {lr} must be positive"));
        }

        let task = TaskMode::from_flags(args.binary_class, args.regression);

        if let Some(weights) = &args.binary_class_weights {
            if task != TaskMode::Binary {
                warn!("binary_class_weights are ignored outside of the binary task");
            } else if weights.len() != args.nb_classes {
                return invalid(format!(
                    "got {} binary_class_weights for {} outputs",
                    weights.len(),
                    args.nb_classes
                ));
            }
        }

        let data_path_val = match args.data_path_val {
            Some(path) => path,
            None => return invalid("data_path_val is required"),
        };

        if !args.eval && args.data_path_tr.is_none() {
            return invalid("data_path_tr is required unless evaluating");
        }

        if args.eval && args.resume.is_none() && args.finetune.is_none() {
            warn!("evaluating a randomly initialized model");
        }

        let cutmix_minmax = match args.cutmix_minmax.as_deref() {
            None => None,
            Some(&[min, max]) => Some((min, max)),
            Some(other) => {
                return invalid(format!("cutmix_minmax needs two values, got {other:?}"));
            }
        };

        let mode: MixupMode = args
            .mixup_mode
            .parse()
            .map_err(|e| FinetuneErr::InvalidConfig(format!("{e}")))?;

        let mixup = MixupConfig {
            mixup_alpha: args.mixup,
            cutmix_alpha: args.cutmix,
            cutmix_minmax,
            prob: args.mixup_prob,
            switch_prob: args.mixup_switch_prob,
            mode,
            label_smoothing: args.smoothing,
            num_classes: args.nb_classes,
        };
        let mixup = mixup.is_active().then_some(mixup);

        if mixup.is_some() {
            match task {
                TaskMode::Binary => warn!("mixup with binary_class keeps BCE against mixed labels"),
                TaskMode::Regression => warn!("mixup with regression blends the targets linearly"),
                TaskMode::MultiClass => {}
            }

            if mode != MixupMode::Batch && args.batch_size % 2 != 0 {
                return invalid(format!("{mode} mixup needs an even batch_size"));
            }
        }

        let local_rank = usize::try_from(args.local_rank).ok();

        Ok(Self {
            batch_size: args.batch_size,
            epochs: args.epochs,
            accum_iter: args.accum_iter,
            model,
            input_size: args.input_size,
            in_chans: args.in_chans,
            drop_path: args.drop_path,
            clip_grad: args.clip_grad,
            weight_decay: args.weight_decay,
            lr: args.lr,
            blr: args.blr,
            layer_decay: args.layer_decay,
            min_lr: args.min_lr,
            warmup_epochs: args.warmup_epochs,
            smoothing: args.smoothing,
            mixup,
            finetune: args.finetune,
            global_pool: args.global_pool && !args.cls_token,
            data_path_tr: args.data_path_tr,
            data_path_val,
            nb_classes: args.nb_classes,
            task,
            binary_class_weights: args.binary_class_weights,
            output_dir: args.output_dir,
            log_dir: args.log_dir,
            seed: args.seed,
            resume: args.resume,
            start_epoch: args.start_epoch,
            eval: args.eval,
            dist_eval: args.dist_eval,
            num_workers: args.num_workers,
            validate_every: args.validate_every,
            print_freq: args.print_freq,
            dist: DistArgs {
                world_size: args.world_size,
                rank: args.rank,
                local_rank,
                dist_url: args.dist_url,
            },
        })
    }
}

impl FinetuneConfig {
    /// Parses and validates the process arguments.
    pub fn from_cli() -> Result<Self> {
        Args::parse().try_into()
    }

    /// The amount of samples that contribute to one optimizer step.
    pub fn eff_batch_size(&self, world_size: usize) -> usize {
        self.batch_size * self.accum_iter * world_size
    }

    /// The absolute learning rate, derived from `blr` unless `lr` was given.
    pub fn resolve_lr(&self, world_size: usize) -> f32 {
        self.lr
            .unwrap_or(self.blr * self.eff_batch_size(world_size) as f32 / 256.0)
    }

    /// The architecture of the model to build.
    pub fn vit_config(&self) -> VitConfig {
        self.model.config(
            self.input_size,
            self.in_chans,
            self.nb_classes,
            self.drop_path,
            self.global_pool,
        )
    }

    /// The layout of one flattened sample.
    pub fn volume_shape(&self) -> VolumeShape {
        VolumeShape {
            channels: self.in_chans,
            side: self.input_size,
        }
    }

    /// The width of a label row.
    pub fn label_width(&self) -> usize {
        match self.task {
            TaskMode::MultiClass => 1,
            TaskMode::Binary | TaskMode::Regression => self.nb_classes,
        }
    }
}
