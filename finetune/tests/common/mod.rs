#![allow(dead_code)]

use std::{fs, path::{Path, PathBuf}, sync::Arc};

use finetune::{
    data::{DataLoader, SequentialSampler, VolumeDataset},
    engine::{EngineConfig, Trainer},
};
use machine_learning::{
    arch::{
        Model, VisionTransformer, VitConfig,
        loss::{Criterion, TaskMode},
    },
    mixup::VolumeShape,
    optimization::{AdamW, CosineSchedule, LossScaler, param_groups_lrd},
};
use rand::{SeedableRng, rngs::StdRng};

pub const SIDE: usize = 4;

pub const VOLUME: VolumeShape = VolumeShape {
    channels: 1,
    side: SIDE,
};

/// 4³ volumes cut in 8 patches, two blocks.
pub fn tiny_vit(num_classes: usize) -> VitConfig {
    VitConfig {
        img_size: SIDE,
        patch_size: 2,
        in_chans: 1,
        num_classes,
        embed_dim: 8,
        depth: 2,
        num_heads: 2,
        mlp_ratio: 2.0,
        drop_path_rate: 0.0,
        global_pool: true,
    }
}

/// Writes `n` raw volumes and their manifest into `dir/name/`.
///
/// Volume `i` gets the label `labels(i)` and values that lean towards it.
pub fn write_dataset(
    dir: &Path,
    name: &str,
    n: usize,
    labels: impl Fn(usize) -> Vec<f32>,
) -> PathBuf {
    let root = dir.join(name);
    fs::create_dir_all(&root).unwrap();
    let mut manifest = String::from("path,label\n");

    for i in 0..n {
        let label = labels(i);
        let bias = label.first().copied().unwrap_or_default();
        let bytes: Vec<u8> = (0..SIDE.pow(3))
            .map(|j| bias + ((i * 31 + j * 7) % 13) as f32 / 13.0 - 0.5)
            .flat_map(f32::to_le_bytes)
            .collect();
        fs::write(root.join(format!("{i}.raw")), bytes).unwrap();

        let label: Vec<String> = label.iter().map(f32::to_string).collect();
        manifest.push_str(&format!("{i}.raw,{}\n", label.join(",")));
    }

    let path = root.join("list.csv");
    fs::write(&path, manifest).unwrap();
    path
}

pub fn binary_label(i: usize) -> Vec<f32> {
    vec![(i % 2) as f32]
}

pub fn loader(manifest: &Path, task: TaskMode, nb_classes: usize, batch: usize) -> DataLoader {
    let ds = VolumeDataset::from_manifest(manifest, VOLUME, task, nb_classes).unwrap();
    let len = ds.len();
    DataLoader::new(
        Arc::new(ds),
        Box::new(SequentialSampler::new(len)),
        batch,
        2,
        false,
        0,
    )
}

pub fn engine_config(output_dir: &Path, task: TaskMode, nb_classes: usize) -> EngineConfig {
    EngineConfig {
        accum_iter: 1,
        clip_grad: None,
        validate_every: 20,
        print_freq: 20,
        task,
        nb_classes,
        dist_eval: false,
        output_dir: output_dir.to_path_buf(),
    }
}

/// A trainer over a freshly initialized tiny model, identical for equal seeds.
pub fn trainer(cfg: EngineConfig, seed: u64) -> Trainer<VisionTransformer> {
    let mut rng = StdRng::seed_from_u64(seed);
    let model = VisionTransformer::new(tiny_vit(cfg.nb_classes), &mut rng).unwrap();
    let groups = param_groups_lrd(&model, 0.05, 0.75);
    let optimizer = AdamW::new(model.params(), groups, 1e-3).unwrap();
    let criterion = Criterion::select(cfg.task, false, 0.0, None);
    let schedule = CosineSchedule::new(1e-3, 1e-6, 0, 10);

    Trainer::new(cfg, model, optimizer, LossScaler::default(), criterion, schedule, rng)
}
