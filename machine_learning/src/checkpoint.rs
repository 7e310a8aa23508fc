//! Checkpoints are safetensors files.
//!
//! A training checkpoint stores the model under `model.`, the AdamW moments
//! under `optimizer.exp_avg.` and `optimizer.exp_avg_sq.`, and the loop
//! counters plus the loss scaler state as string metadata. A weight dump
//! stores the model tensors under their bare names.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
};

use log::{info, warn};
use safetensors::{
    SafeTensors,
    tensor::{Dtype, TensorView},
};

use crate::{
    MlErr, ParamStore, Result,
    optimization::{AdamW, LossScaler, Moments},
    pos_embed::interpolate_pos_embed,
};

const MODEL_PREFIX: &str = "model.";
const LEGACY_MODEL_PREFIX: &str = "model_state.";
const EXP_AVG_PREFIX: &str = "optimizer.exp_avg.";
const EXP_AVG_SQ_PREFIX: &str = "optimizer.exp_avg_sq.";

/// A decoded `f32` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Every tensor and metadata entry of a checkpoint file.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    pub tensors: BTreeMap<String, Tensor>,
    pub metadata: HashMap<String, String>,
}

impl Checkpoint {
    /// Reads and decodes a checkpoint file.
    ///
    /// # Errors
    /// `CheckpointNotFound` if `path` does not exist, `MalformedCheckpoint` if
    /// it isn't a safetensors file of `f32` tensors.
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MlErr::CheckpointNotFound(path.to_path_buf()));
        }

        let bytes = fs::read(path)?;
        let st = SafeTensors::deserialize(&bytes)?;
        let (_, meta) = SafeTensors::read_metadata(&bytes)?;
        let metadata = meta.metadata().clone().unwrap_or_default();

        let mut tensors = BTreeMap::new();
        for (name, view) in st.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(MlErr::MalformedCheckpoint(format!(
                    "tensor {name} has dtype {:?}, only F32 is supported",
                    view.dtype()
                )));
            }

            // The buffer is not guaranteed to be 4 byte aligned.
            let data = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();

            tensors.insert(
                name,
                Tensor {
                    shape: view.shape().to_vec(),
                    data,
                },
            );
        }

        Ok(Self { tensors, metadata })
    }

    /// Encodes and writes this checkpoint to `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes: Vec<Vec<u8>> = self
            .tensors
            .values()
            .map(|t| t.data.iter().flat_map(|v| v.to_le_bytes()).collect())
            .collect();

        let views = self
            .tensors
            .iter()
            .zip(&bytes)
            .map(|((name, t), bytes)| {
                Ok((name.as_str(), TensorView::new(Dtype::F32, t.shape.clone(), bytes)?))
            })
            .collect::<Result<Vec<_>>>()?;

        let metadata = (!self.metadata.is_empty()).then(|| self.metadata.clone());
        let encoded = safetensors::serialize(views, metadata)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, encoded)?;
        Ok(())
    }

    /// The model tensors, with their prefix stripped.
    ///
    /// Tensors under `model.` win, then `model_state.`, then every tensor is
    /// taken as a bare model tensor.
    pub fn model_state(&self) -> BTreeMap<&str, &Tensor> {
        for prefix in [MODEL_PREFIX, LEGACY_MODEL_PREFIX] {
            let state = self.with_prefix(prefix);
            if !state.is_empty() {
                return state;
            }
        }

        self.tensors.iter().map(|(k, v)| (k.as_str(), v)).collect()
    }

    fn with_prefix(&self, prefix: &str) -> BTreeMap<&str, &Tensor> {
        self.tensors
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(prefix).map(|name| (name, v)))
            .collect()
    }
}

/// The loop counters and scaler state saved next to the weights.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingState {
    pub epoch: usize,
    pub iteration: usize,
    pub optimizer_steps: usize,
    pub scaler_scale: f32,
    pub scaler_growth_tracker: u32,
    pub optimizer_step: u64,
    /// The best metrics that improved when this checkpoint was written.
    pub improved: Vec<String>,
}

impl TrainingState {
    fn to_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            ("epoch".to_string(), self.epoch.to_string()),
            ("iteration".to_string(), self.iteration.to_string()),
            ("optimizer_steps".to_string(), self.optimizer_steps.to_string()),
            ("scaler_scale".to_string(), self.scaler_scale.to_string()),
            (
                "scaler_growth_tracker".to_string(),
                self.scaler_growth_tracker.to_string(),
            ),
            ("optimizer_step".to_string(), self.optimizer_step.to_string()),
            ("improved".to_string(), self.improved.join(",")),
        ])
    }

    /// Parses the metadata of a training checkpoint.
    ///
    /// # Returns
    /// `None` if there's no `epoch` entry, i.e. the file is a weight dump.
    fn from_metadata(metadata: &HashMap<String, String>) -> Result<Option<Self>> {
        if !metadata.contains_key("epoch") {
            return Ok(None);
        }

        fn field<T: std::str::FromStr>(
            metadata: &HashMap<String, String>,
            key: &str,
            default: T,
        ) -> Result<T> {
            match metadata.get(key) {
                Some(v) => v.parse().map_err(|_| {
                    MlErr::MalformedCheckpoint(format!("metadata {key}={v} is not valid"))
                }),
                None => Ok(default),
            }
        }

        let improved = metadata
            .get("improved")
            .map(|s| {
                s.split(',')
                    .filter(|m| !m.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(Self {
            epoch: field(metadata, "epoch", 0)?,
            iteration: field(metadata, "iteration", 0)?,
            optimizer_steps: field(metadata, "optimizer_steps", 0)?,
            scaler_scale: field(metadata, "scaler_scale", LossScaler::default().scale())?,
            scaler_growth_tracker: field(metadata, "scaler_growth_tracker", 0)?,
            optimizer_step: field(metadata, "optimizer_step", 0)?,
            improved,
        }))
    }
}

/// Which checkpoint tensors made it into the model and which did not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub dropped_shape: Vec<String>,
    pub dropped_unknown: Vec<String>,
    pub missing: Vec<String>,
}

impl LoadReport {
    fn log(&self, path: &Path) {
        info!(
            "Loaded {} tensors from {}",
            self.loaded.len(),
            path.display()
        );

        if !self.dropped_shape.is_empty() {
            info!("Removing keys with a different shape: {:?}", self.dropped_shape);
        }
        if !self.dropped_unknown.is_empty() {
            info!("Unexpected keys: {:?}", self.dropped_unknown);
        }
        if !self.missing.is_empty() {
            info!("Missing keys: {:?}", self.missing);
        }
        if self.loaded.is_empty() {
            warn!("No tensor of {} matched the model", path.display());
        }
    }
}

/// Copies every tensor whose name and shape match into `store`, non strictly.
fn apply_state(store: &mut ParamStore, state: &BTreeMap<&str, Tensor>) -> Result<LoadReport> {
    let mut report = LoadReport::default();

    for (&name, tensor) in state {
        let Some(param) = store.by_name(name) else {
            report.dropped_unknown.push(name.to_string());
            continue;
        };

        if param.shape() != tensor.shape.as_slice() {
            report.dropped_shape.push(name.to_string());
            continue;
        }

        store.assign(name, &tensor.shape, &tensor.data)?;
        report.loaded.push(name.to_string());
    }

    report.missing = store
        .iter()
        .map(|p| p.name())
        .filter(|name| !report.loaded.iter().any(|l| l == name))
        .map(String::from)
        .collect();

    Ok(report)
}

/// Warm starts `store` from a pretrained checkpoint.
///
/// A `pos_embed` of a different grid is interpolated to the live model before
/// the shape filter runs. Tensors that are unknown or have another shape are
/// dropped, parameters absent from the file keep their initialization.
///
/// # Arguments
/// * `path` - The checkpoint file.
/// * `store` - The live model's parameters.
///
/// # Returns
/// What got transferred and what did not.
pub fn load_pretrained(path: &Path, store: &mut ParamStore) -> Result<LoadReport> {
    let checkpoint = Checkpoint::read(path)?;
    let mut state: BTreeMap<&str, Tensor> = checkpoint
        .model_state()
        .into_iter()
        .map(|(k, v)| (k, v.clone()))
        .collect();

    let target = store
        .by_name("pos_embed")
        .and_then(|p| p.shape().get(1).copied())
        .map(|tokens| tokens.saturating_sub(1));

    if let (Some(target), Some(src)) = (target, state.get("pos_embed")) {
        let resized = interpolate_pos_embed(&src.data, &src.shape, target, 1);
        if let Some((data, shape)) = resized {
            state.insert("pos_embed", Tensor { shape, data });
        }
    }

    let report = apply_state(store, &state)?;
    report.log(path);
    Ok(report)
}

/// Writes the bare model tensors to `path`.
pub fn save_weights(path: &Path, store: &ParamStore) -> Result<()> {
    let tensors = store
        .iter()
        .map(|p| {
            let tensor = Tensor {
                shape: p.shape().to_vec(),
                data: p.data().to_vec(),
            };
            (p.name().to_string(), tensor)
        })
        .collect();

    Checkpoint {
        tensors,
        metadata: HashMap::new(),
    }
    .write(path)
}

/// Writes the model, the optimizer moments and the training state to `path`.
pub fn save_checkpoint(
    path: &Path,
    store: &ParamStore,
    optimizer: &AdamW,
    state: &TrainingState,
) -> Result<()> {
    let mut tensors = BTreeMap::new();

    for (p, moments) in store.iter().zip(optimizer.moments()) {
        let shape = p.shape().to_vec();
        let name = p.name();

        tensors.insert(
            format!("{MODEL_PREFIX}{name}"),
            Tensor {
                shape: shape.clone(),
                data: p.data().to_vec(),
            },
        );
        tensors.insert(
            format!("{EXP_AVG_PREFIX}{name}"),
            Tensor {
                shape: shape.clone(),
                data: moments.exp_avg.clone(),
            },
        );
        tensors.insert(
            format!("{EXP_AVG_SQ_PREFIX}{name}"),
            Tensor {
                shape,
                data: moments.exp_avg_sq.clone(),
            },
        );
    }

    Checkpoint {
        tensors,
        metadata: state.to_metadata(),
    }
    .write(path)
}

/// The outcome of restoring a run from a checkpoint.
#[derive(Debug, Clone)]
pub struct Resume {
    pub report: LoadReport,
    /// `None` when the file holds no training state or it was not requested.
    pub state: Option<TrainingState>,
}

/// Restores the model and, when given, the optimizer and loss scaler.
///
/// # Arguments
/// * `path` - The checkpoint file.
/// * `store` - The live model's parameters.
/// * `training` - The optimizer and scaler to restore, `None` when only
///   evaluating.
pub fn load_resume(
    path: &Path,
    store: &mut ParamStore,
    training: Option<(&mut AdamW, &mut LossScaler)>,
) -> Result<Resume> {
    let checkpoint = Checkpoint::read(path)?;
    let state: BTreeMap<&str, Tensor> = checkpoint
        .model_state()
        .into_iter()
        .map(|(k, v)| (k, v.clone()))
        .collect();

    let report = apply_state(store, &state)?;
    report.log(path);
    info!("Resume checkpoint {}", path.display());

    let Some((optimizer, scaler)) = training else {
        return Ok(Resume {
            report,
            state: None,
        });
    };

    let Some(state) = TrainingState::from_metadata(&checkpoint.metadata)? else {
        return Ok(Resume {
            report,
            state: None,
        });
    };

    let exp_avg = checkpoint.with_prefix(EXP_AVG_PREFIX);
    let exp_avg_sq = checkpoint.with_prefix(EXP_AVG_SQ_PREFIX);

    for (id, p) in store.iter().enumerate() {
        if let (Some(m), Some(v)) = (exp_avg.get(p.name()), exp_avg_sq.get(p.name())) {
            optimizer.set_moments(
                id,
                Moments {
                    exp_avg: m.data.clone(),
                    exp_avg_sq: v.data.clone(),
                },
            )?;
        }
    }

    optimizer.set_step_count(state.optimizer_step);
    scaler.load_state(state.scaler_scale, state.scaler_growth_tracker);
    info!("With optim & sched!");

    Ok(Resume {
        report,
        state: Some(state),
    })
}
