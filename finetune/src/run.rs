use std::{sync::Arc, time::Instant};

use log::info;
use machine_learning::{
    arch::{Model, loss::Criterion},
    checkpoint,
    mixup::Mixup,
    optimization::{AdamW, CosineSchedule, LossScaler, param_groups_lrd},
};
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    FinetuneErr, Result,
    config::FinetuneConfig,
    data::{Compose, DataLoader, DistributedSampler, Sampler, SequentialSampler, VolumeDataset},
    dist::DistContext,
    engine::{EngineConfig, EvalStats, LoopState, Phase, Trainer},
    sink::{DashboardWriter, LogSink},
};

/// The unconditional weight dump written once training ends.
pub const FINAL_MODEL: &str = "final_model.pth";

/// The standard deviation of a re-initialized classification head.
const HEAD_INIT_STD: f32 = 2e-5;

/// What a run ended with.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Set when the run only evaluated.
    pub eval: Option<EvalStats>,
    pub state: LoopState,
    pub n_parameters: usize,
}

fn hms(secs: u64) -> String {
    format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

/// Joins the process group, runs and leaves the group.
pub fn run(cfg: &FinetuneConfig) -> Result<RunSummary> {
    let mut dist = DistContext::init(&cfg.dist)?;
    let result = run_in(cfg, &mut dist);
    dist.shutdown();
    result
}

/// Evaluates, or fine-tunes for the configured epochs, as a member of `dist`.
pub fn run_in(cfg: &FinetuneConfig, dist: &mut DistContext) -> Result<RunSummary> {
    info!("{cfg:#?}");

    let world_size = dist.world_size();
    let rank = dist.rank();
    let seed = cfg.seed.wrapping_add(rank as u64);
    let mut rng = StdRng::seed_from_u64(seed);
    let volume = cfg.volume_shape();

    let dataset_val = Arc::new(VolumeDataset::from_manifest(
        &cfg.data_path_val,
        volume,
        cfg.task,
        cfg.nb_classes,
    )?);
    let sampler_val: Box<dyn Sampler> = if cfg.dist_eval && dist.is_distributed() {
        Box::new(DistributedSampler::for_eval(
            dataset_val.len(),
            world_size,
            rank,
            cfg.seed,
        ))
    } else {
        Box::new(SequentialSampler::new(dataset_val.len()))
    };
    let val_loader = DataLoader::new(
        Arc::clone(&dataset_val),
        sampler_val,
        cfg.batch_size,
        cfg.num_workers,
        false,
        seed,
    );

    let mut model = cfg.model.build(cfg.vit_config(), &mut rng)?;

    if let Some(path) = &cfg.finetune
        && !cfg.eval
    {
        info!("Load pre-trained checkpoint from: {}", path.display());
        checkpoint::load_pretrained(path, model.params_mut())?;
        model.reset_head(&mut rng, HEAD_INIT_STD)?;
    }

    let n_parameters = model.n_parameters();
    info!("Model = {}", cfg.model);
    info!("number of params (M): {:.2}", n_parameters as f64 / 1e6);

    let eff_batch_size = cfg.eff_batch_size(world_size);
    let lr = cfg.resolve_lr(world_size);
    info!("base lr: {:.2e}", lr * 256.0 / eff_batch_size as f32);
    info!("actual lr: {lr:.2e}");
    info!("accumulate grad iterations: {}", cfg.accum_iter);
    info!("effective batch size: {eff_batch_size}");

    let groups = param_groups_lrd(&model, cfg.weight_decay, cfg.layer_decay);
    let mut optimizer = AdamW::new(model.params(), groups, lr)?;
    let mut scaler = LossScaler::default();

    let criterion = Criterion::select(
        cfg.task,
        cfg.mixup.is_some(),
        cfg.smoothing,
        cfg.binary_class_weights.clone(),
    );
    info!("criterion = {criterion}");

    let mut state = LoopState::default();
    let mut start_epoch = cfg.start_epoch;

    if let Some(path) = &cfg.resume {
        let training = (!cfg.eval).then_some((&mut optimizer, &mut scaler));
        let resume = checkpoint::load_resume(path, model.params_mut(), training)?;

        if let Some(saved) = resume.state {
            start_epoch = saved.epoch + 1;
            state = LoopState::resumed(&saved);
        }
    }

    let mixup = cfg
        .mixup
        .clone()
        .map(|m| Mixup::new(m, volume))
        .transpose()?;
    if mixup.is_some() {
        info!("Mixup is activated!");
    }

    let schedule = CosineSchedule::new(lr, cfg.min_lr, cfg.warmup_epochs, cfg.epochs);
    let mut trainer = Trainer::new(
        EngineConfig::from(cfg),
        model,
        optimizer,
        scaler,
        criterion,
        schedule,
        rng,
    )
    .with_mixup(mixup);

    if cfg.eval {
        let stats = trainer.evaluate(&val_loader, dist)?;
        if let Some(line) = stats.accuracy_report(dist, dataset_val.len()) {
            println!("{line}");
        }
        state.phase = Phase::Done;

        return Ok(RunSummary {
            eval: Some(stats),
            state,
            n_parameters,
        });
    }

    let Some(path_tr) = &cfg.data_path_tr else {
        return Err(FinetuneErr::InvalidConfig(
            "data_path_tr is required unless evaluating".into(),
        ));
    };
    let dataset_train = VolumeDataset::from_manifest(path_tr, volume, cfg.task, cfg.nb_classes)?
        .with_transform(Box::new(Compose::training()));
    let sampler_train =
        DistributedSampler::new(dataset_train.len(), world_size, rank, true, cfg.seed);
    info!("Sampler_train = {sampler_train:?}");

    let mut train_loader = DataLoader::new(
        Arc::new(dataset_train),
        Box::new(sampler_train),
        cfg.batch_size,
        cfg.num_workers,
        true,
        seed,
    );

    let (mut log_sink, mut dashboard) = if dist.is_main_process() {
        (
            Some(LogSink::create(&cfg.output_dir)?),
            Some(DashboardWriter::create(&cfg.log_dir)?),
        )
    } else {
        (None, None)
    };

    info!("Start training for {} epochs", cfg.epochs);
    let start = Instant::now();

    for epoch in start_epoch..cfg.epochs {
        let out = trainer.train_one_epoch(
            &mut train_loader,
            &val_loader,
            epoch,
            &mut state,
            dist,
            dashboard.as_mut(),
        )?;

        if let Some(sink) = log_sink.as_mut() {
            if let Some(writer) = dashboard.as_mut() {
                writer.flush()?;
            }

            let test = out.test.as_ref().map(EvalStats::to_map);
            let line =
                LogSink::epoch_line(&out.train.global_avgs(), test.as_ref(), epoch, n_parameters);
            sink.write(&line)?;
        }
    }

    state.phase = Phase::Done;

    if dist.is_main_process() {
        let path = cfg.output_dir.join(FINAL_MODEL);
        checkpoint::save_weights(&path, trainer.model().params())?;
        info!("Final model saved at: {}", path.display());
    }

    info!("Training time {}", hms(start.elapsed().as_secs()));

    Ok(RunSummary {
        eval: None,
        state,
        n_parameters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn training_time_format() {
        assert_eq!(hms(0), "0:00:00");
        assert_eq!(hms(3725), "1:02:05");
    }
}
