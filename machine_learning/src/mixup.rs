//! Mixup and CutMix over batches of 3D volumes.

use std::{fmt, str::FromStr};

use ndarray::{Array2, ArrayView1, ArrayViewMut1, Axis, Zip, s};
use rand::Rng;
use rand_distr::{Beta, Distribution};

use crate::{MlErr, Result};

/// How mixing factors are drawn across a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MixupMode {
    /// One factor for the whole batch, every sample is mixed with its mirror.
    #[default]
    Batch,
    /// One factor per mirrored pair of samples.
    Pair,
    /// One factor per sample.
    Elem,
}

impl FromStr for MixupMode {
    type Err = MlErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "batch" => Ok(MixupMode::Batch),
            "pair" => Ok(MixupMode::Pair),
            "elem" => Ok(MixupMode::Elem),
            other => Err(MlErr::InvalidHyperParam {
                name: "mixup_mode",
                reason: format!("expected one of batch, pair or elem but got {other}"),
            }),
        }
    }
}

impl fmt::Display for MixupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MixupMode::Batch => "batch",
            MixupMode::Pair => "pair",
            MixupMode::Elem => "elem",
        };
        write!(f, "{name}")
    }
}

/// The layout of one flattened sample, `channels × side³` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeShape {
    pub channels: usize,
    pub side: usize,
}

impl VolumeShape {
    pub fn len(&self) -> usize {
        self.channels * self.side.pow(3)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The mixing configuration of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct MixupConfig {
    pub mixup_alpha: f32,
    pub cutmix_alpha: f32,
    pub cutmix_minmax: Option<(f32, f32)>,
    pub prob: f32,
    pub switch_prob: f32,
    pub mode: MixupMode,
    pub label_smoothing: f32,
    pub num_classes: usize,
}

impl MixupConfig {
    /// Whether any mixing is configured at all.
    pub fn is_active(&self) -> bool {
        self.mixup_alpha > 0.0 || self.cutmix_alpha > 0.0 || self.cutmix_minmax.is_some()
    }
}

/// The draw for one group of samples.
#[derive(Debug, Clone, Copy)]
struct Draw {
    lam: f32,
    cutmix: bool,
}

/// An axis aligned box, `[start, end)` per axis in `(z, y, x)` order.
type Box3 = [(usize, usize); 3];

/// Mixes the inputs and targets of a batch.
#[derive(Debug, Clone)]
pub struct Mixup {
    cfg: MixupConfig,
    volume: VolumeShape,
    mixup: Option<Beta<f32>>,
    cutmix: Option<Beta<f32>>,
}

impl Mixup {
    /// Creates a new `Mixup`.
    ///
    /// # Arguments
    /// * `cfg` - The mixing configuration, it must be active.
    /// * `volume` - The layout of one sample row.
    pub fn new(cfg: MixupConfig, volume: VolumeShape) -> Result<Self> {
        if !cfg.is_active() {
            return Err(MlErr::InvalidHyperParam {
                name: "mixup",
                reason: "neither mixup nor cutmix are enabled".into(),
            });
        }

        if let Some((min, max)) = cfg.cutmix_minmax
            && !(0.0 < min && min < max && max <= 1.0)
        {
            return Err(MlErr::InvalidHyperParam {
                name: "cutmix_minmax",
                reason: format!("expected 0 < min < max <= 1 but got {min},{max}"),
            });
        }

        if !(0.0..=1.0).contains(&cfg.prob) || !(0.0..=1.0).contains(&cfg.switch_prob) {
            return Err(MlErr::InvalidHyperParam {
                name: "mixup_prob",
                reason: "probabilities must be within [0, 1]".into(),
            });
        }

        let mixup = (cfg.mixup_alpha > 0.0)
            .then(|| Beta::new(cfg.mixup_alpha, cfg.mixup_alpha))
            .transpose()?;
        let cutmix = (cfg.cutmix_alpha > 0.0)
            .then(|| Beta::new(cfg.cutmix_alpha, cfg.cutmix_alpha))
            .transpose()?;

        Ok(Self {
            cfg,
            volume,
            mixup,
            cutmix,
        })
    }

    pub fn config(&self) -> &MixupConfig {
        &self.cfg
    }

    /// Mixes every sample `i` with sample `batch - 1 - i`.
    ///
    /// # Arguments
    /// * `x` - The batch, one flattened volume per row, mixed in place.
    /// * `targets` - Dense targets, one row per sample.
    /// * `rng` - The source of every draw.
    ///
    /// # Returns
    /// The mixed targets.
    pub fn apply<R: Rng>(
        &self,
        x: &mut Array2<f32>,
        targets: &Array2<f32>,
        rng: &mut R,
    ) -> Result<Array2<f32>> {
        let batch = x.nrows();

        if x.ncols() != self.volume.len() {
            return Err(MlErr::SizeMismatch {
                what: "mixup sample",
                got: x.ncols(),
                expected: self.volume.len(),
            });
        }

        if targets.nrows() != batch {
            return Err(MlErr::SizeMismatch {
                what: "mixup targets",
                got: targets.nrows(),
                expected: batch,
            });
        }

        if self.cfg.mode != MixupMode::Batch && batch % 2 != 0 {
            return Err(MlErr::InvalidHyperParam {
                name: "batch_size",
                reason: format!("{} mixup needs an even batch, got {batch}", self.cfg.mode),
            });
        }

        let lams = match self.cfg.mode {
            MixupMode::Batch => self.mix_batch(x, rng),
            MixupMode::Pair => self.mix_pairs(x, rng),
            MixupMode::Elem => self.mix_elems(x, rng),
        };

        Ok(mix_targets(targets, &lams))
    }

    fn draw<R: Rng>(&self, rng: &mut R) -> Draw {
        let mut draw = Draw {
            lam: 1.0,
            cutmix: false,
        };

        if rng.random::<f32>() >= self.cfg.prob {
            return draw;
        }

        let use_cutmix = match (&self.mixup, &self.cutmix) {
            (Some(_), Some(_)) => rng.random::<f32>() < self.cfg.switch_prob,
            (Some(_), None) => false,
            _ => true,
        };

        draw.cutmix = use_cutmix;
        draw.lam = match (use_cutmix, &self.mixup, &self.cutmix) {
            (false, Some(beta), _) => beta.sample(rng),
            (true, _, Some(beta)) => beta.sample(rng),
            // Only `cutmix_minmax` is set, the box size ignores λ.
            _ => 1.0 - f32::EPSILON,
        };

        draw
    }

    /// Picks the cut box for `lam` and returns it with the corrected factor.
    fn cut_box<R: Rng>(&self, lam: f32, rng: &mut R) -> (Box3, f32) {
        let side = self.volume.side;

        let cuts: [usize; 3] = match self.cfg.cutmix_minmax {
            Some((min, max)) => {
                let lo = (side as f32 * min) as usize;
                let hi = ((side as f32 * max) as usize).max(lo + 1);
                std::array::from_fn(|_| rng.random_range(lo..hi))
            }
            None => {
                let ratio = (1.0 - lam).cbrt();
                [(side as f32 * ratio) as usize; 3]
            }
        };

        let bbox: Box3 = std::array::from_fn(|axis| {
            let center = rng.random_range(0..side.max(1));
            let half = cuts[axis] / 2;
            (center.saturating_sub(half), (center + half).min(side))
        });

        let kept: usize = bbox.iter().map(|(lo, hi)| hi - lo).product();
        let lam = 1.0 - kept as f32 / side.pow(3).max(1) as f32;

        (bbox, lam)
    }

    /// Copies the voxels of `bbox` from `src` into `dst`, for every channel.
    fn paste_box(&self, mut dst: ArrayViewMut1<f32>, src: ArrayView1<f32>, bbox: Box3) {
        let VolumeShape { channels, side } = self.volume;
        let [(z0, z1), (y0, y1), (x0, x1)] = bbox;

        for c in 0..channels {
            for z in z0..z1 {
                for y in y0..y1 {
                    let row = ((c * side + z) * side + y) * side;
                    let span = s![row + x0..row + x1];
                    dst.slice_mut(span).assign(&src.slice(span));
                }
            }
        }
    }

    /// Mixes `dst` with `src` according to `draw`, returning the effective factor.
    fn mix_one<R: Rng>(
        &self,
        mut dst: ArrayViewMut1<f32>,
        src: ArrayView1<f32>,
        draw: Draw,
        rng: &mut R,
    ) -> f32 {
        if draw.lam >= 1.0 {
            return 1.0;
        }

        if draw.cutmix {
            let (bbox, lam) = self.cut_box(draw.lam, rng);
            self.paste_box(dst, src, bbox);
            return lam;
        }

        Zip::from(&mut dst)
            .and(&src)
            .for_each(|d, &s| *d = *d * draw.lam + s * (1.0 - draw.lam));
        draw.lam
    }

    fn mix_batch<R: Rng>(&self, x: &mut Array2<f32>, rng: &mut R) -> Vec<f32> {
        let batch = x.nrows();
        let draw = self.draw(rng);
        if draw.lam >= 1.0 {
            return vec![1.0; batch];
        }

        let flipped = x.slice(s![..;-1, ..]).to_owned();

        if !draw.cutmix {
            Zip::from(&mut *x)
                .and(&flipped)
                .for_each(|d, &s| *d = *d * draw.lam + s * (1.0 - draw.lam));
            return vec![draw.lam; batch];
        }

        // A single box is shared by the whole batch.
        let (bbox, lam) = self.cut_box(draw.lam, rng);
        for (row, src) in x.axis_iter_mut(Axis(0)).zip(flipped.rows()) {
            self.paste_box(row, src, bbox);
        }

        vec![lam; batch]
    }

    fn mix_pairs<R: Rng>(&self, x: &mut Array2<f32>, rng: &mut R) -> Vec<f32> {
        let batch = x.nrows();
        let original = x.clone();
        let mut lams = vec![1.0; batch];

        for i in 0..batch / 2 {
            let j = batch - 1 - i;
            let draw = self.draw(rng);
            if draw.lam >= 1.0 {
                continue;
            }

            // Both sides of a pair share the factor and the box.
            let lam = if draw.cutmix {
                let (bbox, lam) = self.cut_box(draw.lam, rng);
                self.paste_box(x.row_mut(i), original.row(j), bbox);
                self.paste_box(x.row_mut(j), original.row(i), bbox);
                lam
            } else {
                self.mix_one(x.row_mut(i), original.row(j), draw, rng);
                self.mix_one(x.row_mut(j), original.row(i), draw, rng)
            };

            lams[i] = lam;
            lams[j] = lam;
        }

        lams
    }

    fn mix_elems<R: Rng>(&self, x: &mut Array2<f32>, rng: &mut R) -> Vec<f32> {
        let batch = x.nrows();
        let original = x.clone();

        (0..batch)
            .map(|i| {
                let draw = self.draw(rng);
                self.mix_one(x.row_mut(i), original.row(batch - 1 - i), draw, rng)
            })
            .collect()
    }
}

/// One-hot encodes class indices with label smoothing.
///
/// Every entry gets `smoothing / num_classes`, the true class gets
/// `1 - smoothing + smoothing / num_classes`. Out of range indices are clamped
/// to the last class.
pub fn one_hot(labels: &[usize], num_classes: usize, smoothing: f32) -> Array2<f32> {
    let off = smoothing / num_classes.max(1) as f32;
    let on = 1.0 - smoothing + off;

    let mut out = Array2::from_elem((labels.len(), num_classes), off);
    for (mut row, &label) in out.axis_iter_mut(Axis(0)).zip(labels) {
        if let Some(v) = row.get_mut(label.min(num_classes.saturating_sub(1))) {
            *v = on;
        }
    }
    out
}

/// `lam_i · t_i + (1 - lam_i) · t_{batch - 1 - i}` for every row.
fn mix_targets(targets: &Array2<f32>, lams: &[f32]) -> Array2<f32> {
    let flipped = targets.slice(s![..;-1, ..]);
    let mut out = targets.clone();

    for ((mut row, flip), &lam) in out.axis_iter_mut(Axis(0)).zip(flipped.rows()).zip(lams) {
        Zip::from(&mut row)
            .and(&flip)
            .for_each(|t, &f| *t = lam * *t + (1.0 - lam) * f);
    }

    out
}
