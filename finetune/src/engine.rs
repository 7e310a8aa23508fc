//! The training loop: gradient accumulation, periodic validation and best
//! checkpointing.

use std::{collections::BTreeMap, fmt, path::PathBuf};

use log::{debug, info, warn};
use machine_learning::{
    arch::{
        Model,
        loss::{Criterion, CrossEntropy, LossFn, TaskMode},
    },
    checkpoint::{self, TrainingState},
    metrics,
    mixup::{Mixup, one_hot},
    optimization::{AdamW, CosineSchedule, LossScaler, Optimizer},
};
use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;

use crate::{
    FinetuneErr, Result,
    best::BestMetrics,
    config::FinetuneConfig,
    data::{Batch, DataLoader},
    dist::DistContext,
    metric_logger::MetricLogger,
    sink::DashboardWriter,
};

/// Overwritten every time a validation run improves a best metric.
pub const BEST_CHECKPOINT: &str = "checkpoint-best.pth";

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Training,
    Validating,
    Checkpointing,
    Done,
}

/// State carried across epochs.
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    pub phase: Phase,
    pub best: BestMetrics,
    /// Batches processed over every completed epoch.
    pub iteration: usize,
    /// Accumulation boundaries reached since the start of the run.
    pub optimizer_steps: usize,
    pub validations: usize,
    /// Best checkpoints written by this process.
    pub checkpoints: usize,
}

impl LoopState {
    /// Picks the counters of a resumed run back up.
    pub fn resumed(saved: &TrainingState) -> Self {
        Self {
            iteration: saved.iteration,
            optimizer_steps: saved.optimizer_steps,
            ..Self::default()
        }
    }
}

/// Task metrics of one validation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalStats {
    pub loss: f32,
    /// Top-1 accuracy for multi-class, element accuracy for binary, in percent.
    pub acc1: Option<f32>,
    /// Only for multi-class with at least five classes.
    pub acc5: Option<f32>,
    /// Macro ROC-AUC over the binary outputs holding both classes.
    pub auc: Option<f32>,
    /// Only for regression.
    pub mae: Option<f32>,
    pub samples: usize,
}

impl EvalStats {
    /// Computes the metrics of `task` over a whole validation set.
    ///
    /// # Arguments
    /// * `task` - Decides which metrics apply.
    /// * `loss` - The mean loss over the set.
    /// * `logits` - The model outputs, one row per sample.
    /// * `targets` - The labels, one row per sample.
    pub fn compute(
        task: TaskMode,
        loss: f32,
        logits: ArrayView2<f32>,
        targets: ArrayView2<f32>,
    ) -> Self {
        let mut stats = Self {
            loss,
            samples: logits.nrows(),
            ..Self::default()
        };

        match task {
            TaskMode::MultiClass => {
                let labels = class_indices(targets);
                stats.acc1 = Some(metrics::accuracy_topk(logits, &labels, 1));
                if logits.ncols() >= 5 {
                    stats.acc5 = Some(metrics::accuracy_topk(logits, &labels, 5));
                }
            }
            TaskMode::Binary => {
                stats.acc1 = Some(metrics::binary_accuracy(logits, targets));
                stats.auc = metrics::macro_auc(logits, targets);
            }
            TaskMode::Regression => {
                stats.mae = Some(metrics::mean_absolute_error(logits, targets));
            }
        }

        stats
    }

    /// The metrics that were computed, by name.
    pub fn to_map(&self) -> BTreeMap<String, f32> {
        let mut map = BTreeMap::from([("loss".to_string(), self.loss)]);
        let optional = [
            ("acc1", self.acc1),
            ("acc5", self.acc5),
            ("auc", self.auc),
            ("mae", self.mae),
        ];

        for (name, value) in optional {
            if let Some(v) = value {
                map.insert(name.to_string(), v);
            }
        }

        map
    }

    /// The summary printed after an evaluation only run.
    ///
    /// # Arguments
    /// * `images` - The size of the evaluated set.
    pub fn accuracy_line(&self, images: usize) -> String {
        format!(
            "Accuracy of the network on the {images} test images: {:.1}%",
            self.acc1.unwrap_or_default()
        )
    }

    /// The accuracy line, only on the main process.
    pub fn accuracy_report(&self, dist: &DistContext, images: usize) -> Option<String> {
        dist.is_main_process().then(|| self.accuracy_line(images))
    }
}

impl fmt::Display for EvalStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "* loss {:.4}", self.loss)?;
        if let Some(acc1) = self.acc1 {
            write!(f, " Acc@1 {acc1:.3}")?;
        }
        if let Some(acc5) = self.acc5 {
            write!(f, " Acc@5 {acc5:.3}")?;
        }
        if let Some(auc) = self.auc {
            write!(f, " AUC {auc:.4}")?;
        }
        if let Some(mae) = self.mae {
            write!(f, " MAE {mae:.4}")?;
        }
        Ok(())
    }
}

/// What one epoch produced.
#[derive(Debug, Clone)]
pub struct EpochOutput {
    pub train: MetricLogger,
    /// The last validation run of the epoch, if there was one.
    pub test: Option<EvalStats>,
}

/// The class index held in the first column of every label row.
pub fn class_indices(targets: ArrayView2<f32>) -> Vec<usize> {
    targets
        .rows()
        .into_iter()
        .map(|row| row.first().map_or(0, |&v| v.max(0.0).round() as usize))
        .collect()
}

/// The loop settings taken from the run configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub accum_iter: usize,
    pub clip_grad: Option<f32>,
    pub validate_every: usize,
    pub print_freq: usize,
    pub task: TaskMode,
    pub nb_classes: usize,
    pub dist_eval: bool,
    pub output_dir: PathBuf,
}

impl From<&FinetuneConfig> for EngineConfig {
    fn from(cfg: &FinetuneConfig) -> Self {
        Self {
            accum_iter: cfg.accum_iter,
            clip_grad: cfg.clip_grad,
            validate_every: cfg.validate_every,
            print_freq: cfg.print_freq,
            task: cfg.task,
            nb_classes: cfg.nb_classes,
            dist_eval: cfg.dist_eval,
            output_dir: cfg.output_dir.clone(),
        }
    }
}

/// Validation never sees mixed targets, the soft criteria fall back to plain
/// cross entropy over the class indices.
fn eval_criterion(criterion: &Criterion) -> Criterion {
    match criterion {
        Criterion::SoftTarget(_) | Criterion::LabelSmoothing(_) => {
            Criterion::CrossEntropy(CrossEntropy)
        }
        other => other.clone(),
    }
}

/// Owns everything a training step mutates.
pub struct Trainer<M> {
    cfg: EngineConfig,
    model: M,
    optimizer: AdamW,
    scaler: LossScaler,
    criterion: Criterion,
    eval_criterion: Criterion,
    schedule: CosineSchedule,
    mixup: Option<Mixup>,
    rng: StdRng,
}

impl<M: Model> Trainer<M> {
    /// Creates a new `Trainer`.
    ///
    /// # Arguments
    /// * `cfg` - The loop settings.
    /// * `model` - The model to fine-tune.
    /// * `optimizer` - An optimizer over the model's parameters.
    /// * `scaler` - The loss scaler, possibly restored from a checkpoint.
    /// * `criterion` - The training objective.
    /// * `schedule` - The per step learning rate.
    /// * `rng` - The source of the mixup draws.
    pub fn new(
        cfg: EngineConfig,
        model: M,
        optimizer: AdamW,
        scaler: LossScaler,
        criterion: Criterion,
        schedule: CosineSchedule,
        rng: StdRng,
    ) -> Self {
        Self {
            eval_criterion: eval_criterion(&criterion),
            cfg,
            model,
            optimizer,
            scaler,
            criterion,
            schedule,
            mixup: None,
            rng,
        }
    }

    pub fn with_mixup(mut self, mixup: Option<Mixup>) -> Self {
        self.mixup = mixup;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    pub fn scaler(&self) -> &LossScaler {
        &self.scaler
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Trains for one epoch, validating every `validate_every` optimizer steps.
    ///
    /// # Arguments
    /// * `loader` - The training batches, reseeded for `epoch`.
    /// * `val_loader` - The validation batches.
    /// * `epoch` - The current epoch.
    /// * `state` - The counters and best metrics carried across epochs.
    /// * `dist` - The process group.
    /// * `dashboard` - Receives the `loss` and `lr` scalars of every step.
    ///
    /// # Returns
    /// The epoch's running statistics and its last validation run.
    pub fn train_one_epoch(
        &mut self,
        loader: &mut DataLoader,
        val_loader: &DataLoader,
        epoch: usize,
        state: &mut LoopState,
        dist: &mut DistContext,
        mut dashboard: Option<&mut DashboardWriter>,
    ) -> Result<EpochOutput> {
        let accum = self.cfg.accum_iter;
        let print_freq = self.cfg.print_freq;

        loader.set_epoch(epoch);
        let len = loader.len();

        let mut logger = MetricLogger::new();
        logger.add_meter("loss");
        logger.add_latest_meter("lr");
        let mut test = None;

        let mut window_loss = 0.0f32;
        let mut window_batches = 0usize;

        state.phase = Phase::Training;
        self.model.params_mut().zero_grad();

        for (i, batch) in loader.iter().enumerate() {
            let Batch { mut x, y } = batch?;
            let progress = epoch as f32 + i as f32 / len as f32;

            if i % accum == 0 {
                self.optimizer.set_lr(self.schedule.lr_at(progress));
            }

            let targets = self.train_targets(&mut x, y)?;
            let logits = self.model.forward(x.view(), true)?;
            let loss = self.criterion.loss(logits.view(), targets.view());

            if loss.is_finite() {
                let seed = self.criterion.loss_prime(logits.view(), targets.view())
                    * (self.scaler.scale() / accum as f32);
                self.model.backward(seed.view())?;

                window_loss += loss;
                window_batches += 1;
                logger.update("loss", loss, 1);
            } else {
                warn!("Loss is {loss}, skipping batch {i} of epoch {epoch}");
            }

            if (i + 1) % accum == 0 {
                if let Some(loss) = self.optimizer_step(dist, window_loss, window_batches)? {
                    let lr = self.optimizer.max_lr();
                    logger.update("lr", lr, 1);

                    if let Some(writer) = dashboard.as_deref_mut() {
                        let epoch_1000x = (progress * 1000.0) as u64;
                        writer.add_scalar("loss", loss, epoch_1000x)?;
                        writer.add_scalar("lr", lr, epoch_1000x)?;
                    }
                }

                window_loss = 0.0;
                window_batches = 0;
                state.optimizer_steps += 1;

                if state.optimizer_steps % self.cfg.validate_every == 0 {
                    let iteration = state.iteration + i + 1;
                    test = Some(self.validate(val_loader, epoch, iteration, state, dist)?);
                }
            }

            if i % print_freq == 0 || i + 1 == len {
                info!("Epoch: [{epoch}]  [{i}/{len}]  {logger}");
            }
        }

        state.iteration += len;

        logger.synchronize_between_processes(dist)?;
        info!("Averaged stats: {logger}");

        Ok(EpochOutput {
            train: logger,
            test,
        })
    }

    /// Dense mixed targets when mixup is on, the raw labels otherwise.
    fn train_targets(&mut self, x: &mut Array2<f32>, y: Array2<f32>) -> Result<Array2<f32>> {
        let Some(mixup) = &self.mixup else {
            return Ok(y);
        };

        let dense = match self.cfg.task {
            TaskMode::MultiClass => one_hot(
                &class_indices(y.view()),
                self.cfg.nb_classes,
                mixup.config().label_smoothing,
            ),
            TaskMode::Binary | TaskMode::Regression => y,
        };

        Ok(mixup.apply(x, &dense, &mut self.rng)?)
    }

    /// Averages the gradients across the group and steps the optimizer.
    ///
    /// Every rank takes part even when all its batches in the window were
    /// skipped, the step is only dropped when no rank contributed a batch.
    ///
    /// # Returns
    /// The group's mean loss over the window, `None` if no step was taken.
    fn optimizer_step(
        &mut self,
        dist: &mut DistContext,
        loss_sum: f32,
        batches: usize,
    ) -> Result<Option<f32>> {
        let (loss_sum, batches) = if dist.is_distributed() {
            let mut flat = self.model.params().flat_grads();
            flat.extend([loss_sum, batches as f32]);
            dist.all_reduce_mean(&mut flat)?;

            let batches = flat.pop().unwrap_or_default();
            let loss_sum = flat.pop().unwrap_or_default();
            self.model.params_mut().set_flat_grads(&flat)?;
            (loss_sum, batches)
        } else {
            (loss_sum, batches as f32)
        };

        if batches <= 0.0 {
            warn!("no finite loss in the accumulation window, skipping the optimizer step");
            self.model.params_mut().zero_grad();
            return Ok(None);
        }

        let outcome = self.scaler.step(
            &mut self.optimizer,
            self.model.params_mut(),
            self.cfg.clip_grad,
        )?;
        self.model.params_mut().zero_grad();

        if outcome.skipped {
            debug!("overflow, loss scale is now {}", self.scaler.scale());
        }

        Ok(Some(loss_sum / batches))
    }

    /// Runs a validation pass, folds it into the best record and checkpoints
    /// on improvement.
    fn validate(
        &mut self,
        val_loader: &DataLoader,
        epoch: usize,
        iteration: usize,
        state: &mut LoopState,
        dist: &mut DistContext,
    ) -> Result<EvalStats> {
        state.phase = Phase::Validating;
        let stats = self.evaluate(val_loader, dist)?;
        state.validations += 1;
        info!(
            "Validation after {} optimizer steps: {stats}",
            state.optimizer_steps
        );

        let improved = state.best.update(&stats, self.cfg.task);
        if !improved.is_empty() {
            state.phase = Phase::Checkpointing;
            info!("New best {}", improved.join(", "));

            if dist.is_main_process() {
                self.save_best(epoch, iteration, state.optimizer_steps, &improved)?;
                state.checkpoints += 1;
            }
        }

        state.phase = Phase::Training;
        Ok(stats)
    }

    fn save_best(
        &self,
        epoch: usize,
        iteration: usize,
        optimizer_steps: usize,
        improved: &[&str],
    ) -> Result<()> {
        let path = self.cfg.output_dir.join(BEST_CHECKPOINT);
        let saved = TrainingState {
            epoch,
            iteration,
            optimizer_steps,
            scaler_scale: self.scaler.scale(),
            scaler_growth_tracker: self.scaler.growth_tracker(),
            optimizer_step: self.optimizer.step_count(),
            improved: improved.iter().map(|m| m.to_string()).collect(),
        };

        checkpoint::save_checkpoint(&path, self.model.params(), &self.optimizer, &saved)?;
        info!("Saved best checkpoint at {}", path.display());
        Ok(())
    }

    /// Runs the model over a whole validation set without touching gradients.
    ///
    /// With `dist_eval` every rank evaluates its own shard and the outputs are
    /// gathered before the metrics are computed.
    pub fn evaluate(&mut self, loader: &DataLoader, dist: &mut DistContext) -> Result<EvalStats> {
        let mut logits_all: Vec<f32> = Vec::new();
        let mut targets_all: Vec<f32> = Vec::new();
        let mut loss_sum = 0.0f32;
        let mut samples = 0usize;

        for batch in loader.iter() {
            let batch = batch?;
            let logits = self.model.forward(batch.x.view(), false)?;
            let loss = self.eval_criterion.loss(logits.view(), batch.y.view());

            loss_sum += loss * batch.len() as f32;
            samples += batch.len();
            logits_all.extend(logits.iter());
            targets_all.extend(batch.y.iter());
        }

        if self.cfg.dist_eval && dist.is_distributed() {
            logits_all = dist.all_gather(&logits_all)?;
            targets_all = dist.all_gather(&targets_all)?;

            let totals = dist.all_gather(&[loss_sum, samples as f32])?;
            loss_sum = totals.iter().step_by(2).sum();
            samples = totals.iter().skip(1).step_by(2).sum::<f32>().round() as usize;
        }

        if samples == 0 {
            return Err(FinetuneErr::InvalidConfig(
                "the validation set is empty".into(),
            ));
        }

        let outputs = logits_all.len() / samples;
        let label_width = targets_all.len() / samples;
        let logits = Array2::from_shape_vec((samples, outputs), logits_all)
            .map_err(|e| FinetuneErr::Dist(format!("gathered outputs do not line up: {e}")))?;
        let targets = Array2::from_shape_vec((samples, label_width), targets_all)
            .map_err(|e| FinetuneErr::Dist(format!("gathered targets do not line up: {e}")))?;

        Ok(EvalStats::compute(
            self.cfg.task,
            loss_sum / samples as f32,
            logits.view(),
            targets.view(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn class_indices_read_the_first_column() {
        let y = array![[2.0], [0.0], [-1.0], [1.0]];
        assert_eq!(class_indices(y.view()), vec![2, 0, 0, 1]);
    }

    #[test]
    fn multi_class_stats() {
        let logits = array![
            [5.0, 4.0, 3.0, 2.0, 1.0, 0.0],
            [0.0, 1.0, 2.0, 3.0, 4.0, 5.0]
        ];
        let targets = array![[0.0], [0.0]];
        let stats = EvalStats::compute(TaskMode::MultiClass, 1.0, logits.view(), targets.view());

        assert_eq!(stats.acc1, Some(50.0));
        assert_eq!(stats.acc5, Some(50.0));
        assert_eq!(stats.auc, None);
        assert_eq!(stats.samples, 2);
    }

    #[test]
    fn binary_stats() {
        let logits = array![[2.0], [-2.0], [1.0], [-1.0]];
        let targets = array![[1.0], [0.0], [0.0], [1.0]];
        let stats = EvalStats::compute(TaskMode::Binary, 0.5, logits.view(), targets.view());

        assert_eq!(stats.acc1, Some(50.0));
        assert_eq!(stats.auc, Some(0.75));
        assert_eq!(
            stats.to_map().keys().collect::<Vec<_>>(),
            vec!["acc1", "auc", "loss"]
        );
    }

    #[test]
    fn regression_stats() {
        let logits = array![[1.0, 2.0]];
        let targets = array![[2.0, 4.0]];
        let stats = EvalStats::compute(TaskMode::Regression, 2.5, logits.view(), targets.view());

        assert_eq!(stats.mae, Some(1.5));
        assert_eq!(stats.acc1, None);
        assert_eq!(stats.to_string(), "* loss 2.5000 MAE 1.5000");
    }

    #[test]
    fn accuracy_line_rounds_to_one_decimal() {
        let stats = EvalStats {
            acc1: Some(83.3333),
            ..EvalStats::default()
        };
        assert_eq!(
            stats.accuracy_line(6),
            "Accuracy of the network on the 6 test images: 83.3%"
        );

        let regression = EvalStats::default();
        assert_eq!(
            regression.accuracy_line(4),
            "Accuracy of the network on the 4 test images: 0.0%"
        );
        assert_eq!(
            regression.accuracy_report(&DistContext::single(), 4),
            Some(regression.accuracy_line(4))
        );
    }

    #[test]
    fn soft_criteria_evaluate_with_plain_cross_entropy() {
        let soft = Criterion::select(TaskMode::MultiClass, true, 0.1, None);
        assert!(matches!(eval_criterion(&soft), Criterion::CrossEntropy(_)));

        let bce = Criterion::select(TaskMode::Binary, true, 0.1, Some(vec![2.0]));
        assert_eq!(eval_criterion(&bce).to_string(), bce.to_string());
    }
}
