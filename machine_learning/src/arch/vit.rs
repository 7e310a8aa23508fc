use std::collections::HashSet;

use ndarray::{prelude::*, s};
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{
    Model,
    layers::{Block, Dense, LayerNorm, PatchEmbed},
};
use crate::{
    MlErr, ParamId, ParamStore, Result,
    init::{ConstWeightGen, TruncNormalWeightGen, WeightGen},
};

/// The shape and regularization of a `VisionTransformer`.
#[derive(Debug, Clone, PartialEq)]
pub struct VitConfig {
    pub img_size: usize,
    pub patch_size: usize,
    pub in_chans: usize,
    pub num_classes: usize,
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: f32,
    pub drop_path_rate: f32,
    /// Average the patch tokens through `fc_norm` instead of reading the class token through `norm`.
    pub global_pool: bool,
}

/// A Vision Transformer over cubic 3D volumes with a linear classification head.
///
/// Parameter names follow the usual `timm` layout (`cls_token`, `pos_embed`,
/// `patch_embed.proj.*`, `blocks.{i}.*`, `norm.*` or `fc_norm.*`, `head.*`)
/// so that pretrained checkpoints line up by name.
#[derive(Debug, Clone)]
pub struct VisionTransformer {
    cfg: VitConfig,
    params: ParamStore,
    patch_embed: PatchEmbed,
    cls_token: ParamId,
    pos_embed: ParamId,
    blocks: Vec<Block>,
    norm: LayerNorm,
    head: Dense,
    rng: StdRng,

    // Forward metadata
    batch: usize,
}

impl VisionTransformer {
    /// Creates a new randomly initialized `VisionTransformer`.
    ///
    /// # Arguments
    /// * `cfg` - The architecture.
    /// * `rng` - Seeds both the initialization and the stochastic depth draws.
    pub fn new<R: Rng>(cfg: VitConfig, rng: &mut R) -> Result<Self> {
        if cfg.num_classes == 0 {
            return Err(MlErr::InvalidHyperParam {
                name: "num_classes",
                reason: "must be at least 1".into(),
            });
        }

        let mut params = ParamStore::new();
        let e = cfg.embed_dim;

        let cls = TruncNormalWeightGen::new(rng, 0.02)?.sample(e);
        let cls_token = params.register("cls_token", &[1, 1, e], cls)?;

        let patch_embed = PatchEmbed::new(
            &mut params,
            cfg.img_size,
            cfg.patch_size,
            cfg.in_chans,
            e,
            rng,
        )?;

        let seq_len = patch_embed.num_patches() + 1;
        let pos = TruncNormalWeightGen::new(rng, 0.02)?.sample(seq_len * e);
        let pos_embed = params.register("pos_embed", &[1, seq_len, e], pos)?;

        let blocks = (0..cfg.depth)
            .map(|i| {
                let drop_path = if cfg.depth > 1 {
                    cfg.drop_path_rate * i as f32 / (cfg.depth - 1) as f32
                } else {
                    0.0
                };

                Block::new(
                    &mut params,
                    &format!("blocks.{i}"),
                    e,
                    cfg.num_heads,
                    cfg.mlp_ratio,
                    drop_path,
                    rng,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let norm_name = if cfg.global_pool { "fc_norm" } else { "norm" };
        let norm = LayerNorm::new(&mut params, norm_name, e)?;
        let head = Dense::new(&mut params, "head", (e, cfg.num_classes), rng, 0.02)?;

        Ok(Self {
            rng: StdRng::from_rng(rng),
            cfg,
            params,
            patch_embed,
            cls_token,
            pos_embed,
            blocks,
            norm,
            head,
            batch: 0,
        })
    }

    pub fn config(&self) -> &VitConfig {
        &self.cfg
    }

    pub fn num_patches(&self) -> usize {
        self.patch_embed.num_patches()
    }

    /// Re-initializes the classification head, `weight ~ TruncNormal(std)` and `bias = 0`.
    pub fn reset_head<R: Rng>(&mut self, rng: &mut R, std_dev: f32) -> Result<()> {
        let w = self.params.get_mut(self.head.weight());
        let n = w.len();
        w.data_mut()
            .copy_from_slice(&TruncNormalWeightGen::new(rng, std_dev)?.sample(n));

        let b = self.params.get_mut(self.head.bias());
        let n = b.len();
        b.data_mut().copy_from_slice(&ConstWeightGen(0.0).sample(n));

        Ok(())
    }

    fn seq_len(&self) -> usize {
        self.num_patches() + 1
    }
}

impl Model for VisionTransformer {
    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    fn forward(&mut self, x: ArrayView2<f32>, train: bool) -> Result<Array2<f32>> {
        let batch = x.nrows();
        let (n, t, e) = (self.num_patches(), self.seq_len(), self.cfg.embed_dim);

        let tokens = self.patch_embed.forward(&self.params, x)?;
        let cls = self.params.get(self.cls_token).view2((1, e))?;
        let pos = self.params.get(self.pos_embed).view2((t, e))?;

        let mut seq = Array2::zeros((batch * t, e));
        for b in 0..batch {
            let mut sample = seq.slice_mut(s![b * t..(b + 1) * t, ..]);
            sample.assign(&pos);
            sample.slice_mut(s![0..1, ..]).zip_mut_with(&cls, |v, &c| *v += c);
            let mut patches = sample.slice_mut(s![1.., ..]);
            patches += &tokens.slice(s![b * n..(b + 1) * n, ..]);
        }

        for blk in &mut self.blocks {
            seq = blk.forward(&self.params, seq, batch, train, &mut self.rng)?;
        }

        let mut pooled = Array2::zeros((batch, e));
        for (b, mut row) in pooled.rows_mut().into_iter().enumerate() {
            let sample = seq.slice(s![b * t..(b + 1) * t, ..]);
            if self.cfg.global_pool {
                row.assign(&sample.slice(s![1.., ..]).sum_axis(Axis(0)));
                row /= n as f32;
            } else {
                row.assign(&sample.row(0));
            }
        }

        let feat = self.norm.forward(&self.params, pooled.view())?;
        self.batch = batch;
        self.head.forward(&self.params, feat.view())
    }

    fn backward(&mut self, d: ArrayView2<f32>) -> Result<()> {
        let batch = self.batch;
        if d.nrows() != batch {
            return Err(MlErr::SizeMismatch {
                what: "output delta",
                got: d.nrows(),
                expected: batch,
            });
        }

        let (n, t, e) = (self.num_patches(), self.seq_len(), self.cfg.embed_dim);

        let dfeat = self.head.backward(&mut self.params, d)?;
        let dpooled = self.norm.backward(&mut self.params, dfeat.view())?;

        let mut dseq = Array2::zeros((batch * t, e));
        for (b, drow) in dpooled.rows().into_iter().enumerate() {
            let mut sample = dseq.slice_mut(s![b * t..(b + 1) * t, ..]);
            if self.cfg.global_pool {
                let share = &drow / n as f32;
                for mut row in sample.slice_mut(s![1.., ..]).rows_mut() {
                    row.assign(&share);
                }
            } else {
                sample.row_mut(0).assign(&drow);
            }
        }

        for blk in self.blocks.iter_mut().rev() {
            dseq = blk.backward(&mut self.params, dseq)?;
        }

        let mut dtokens = Array2::zeros((batch * n, e));
        for b in 0..batch {
            let patches = dseq.slice(s![b * t + 1..(b + 1) * t, ..]);
            dtokens.slice_mut(s![b * n..(b + 1) * n, ..]).assign(&patches);
        }

        let mut dcls = ArrayViewMut1::from(self.params.get_mut(self.cls_token).grad_mut());
        for b in 0..batch {
            dcls += &dseq.row(b * t);
        }

        let grad = self.params.get_mut(self.pos_embed).grad_mut();
        let mut dpos = ArrayViewMut2::from_shape((t, e), grad)?;
        for b in 0..batch {
            dpos += &dseq.slice(s![b * t..(b + 1) * t, ..]);
        }

        self.patch_embed.backward(&mut self.params, dtokens.view())
    }

    fn depth(&self) -> usize {
        self.cfg.depth
    }

    fn no_weight_decay(&self) -> HashSet<String> {
        ["cls_token", "pos_embed"].map(String::from).into()
    }
}

#[cfg(test)]
impl VitConfig {
    /// A model small enough for gradient checks: 4³ volumes, 8 patches, 2 blocks.
    pub(crate) fn tiny(global_pool: bool) -> Self {
        Self {
            img_size: 4,
            patch_size: 2,
            in_chans: 1,
            num_classes: 3,
            embed_dim: 8,
            depth: 2,
            num_heads: 2,
            mlp_ratio: 2.0,
            drop_path_rate: 0.0,
            global_pool,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config(global_pool: bool) -> VitConfig {
        VitConfig::tiny(global_pool)
    }

    fn input(batch: usize) -> Array2<f32> {
        Array2::from_shape_fn((batch, 64), |(b, i)| ((b * 7 + i * 3) % 11) as f32 / 11.0 - 0.5)
    }

    #[test]
    fn parameter_names_and_shapes() {
        let mut rng = StdRng::seed_from_u64(0);
        let vit = VisionTransformer::new(tiny_config(true), &mut rng).unwrap();
        let params = vit.params();

        assert_eq!(params.by_name("cls_token").unwrap().shape(), &[1, 1, 8]);
        assert_eq!(params.by_name("pos_embed").unwrap().shape(), &[1, 9, 8]);
        assert_eq!(
            params.by_name("patch_embed.proj.weight").unwrap().shape(),
            &[8, 1, 2, 2, 2]
        );
        assert_eq!(params.by_name("blocks.1.attn.qkv.weight").unwrap().shape(), &[24, 8]);
        assert_eq!(params.by_name("blocks.0.mlp.fc1.weight").unwrap().shape(), &[16, 8]);
        assert!(params.by_name("fc_norm.weight").is_some());
        assert!(params.by_name("norm.weight").is_none());
        assert_eq!(params.by_name("head.weight").unwrap().shape(), &[3, 8]);
    }

    #[test]
    fn cls_token_variant_uses_norm() {
        let mut rng = StdRng::seed_from_u64(0);
        let vit = VisionTransformer::new(tiny_config(false), &mut rng).unwrap();
        assert!(vit.params().by_name("norm.weight").is_some());
        assert!(vit.params().by_name("fc_norm.weight").is_none());
    }

    #[test]
    fn forward_output_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut vit = VisionTransformer::new(tiny_config(true), &mut rng).unwrap();
        let y = vit.forward(input(5).view(), false).unwrap();

        assert_eq!(y.dim(), (5, 3));
        assert!(y.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn reset_head_zeroes_bias() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut vit = VisionTransformer::new(tiny_config(true), &mut rng).unwrap();
        vit.params_mut().assign("head.bias", &[3], &[1.0, 1.0, 1.0]).unwrap();
        vit.reset_head(&mut rng, 2e-5).unwrap();

        assert_eq!(vit.params().by_name("head.bias").unwrap().data(), &[0.0; 3]);
        let w = vit.params().by_name("head.weight").unwrap().data();
        assert!(w.iter().all(|v| v.abs() < 1e-3));
    }

    /// Compares the analytic gradient of `sum(y · r)` against central differences.
    fn check_gradients(global_pool: bool) {
        let mut rng = StdRng::seed_from_u64(11);
        let mut vit = VisionTransformer::new(tiny_config(global_pool), &mut rng).unwrap();

        // Larger weights than the init so every path carries signal.
        for name in ["head.weight", "cls_token", "pos_embed", "blocks.0.attn.qkv.weight"] {
            let id = vit.params().id(name).unwrap();
            let p = vit.params_mut().get_mut(id);
            for (i, v) in p.data_mut().iter_mut().enumerate() {
                *v = ((i * 37 % 17) as f32 / 17.0 - 0.5) * 0.8;
            }
        }

        let x = input(2);
        let r = Array2::from_shape_fn((2, 3), |(i, j)| (i as f32 + 1.0) * (j as f32 - 1.0));

        vit.params_mut().zero_grad();
        vit.forward(x.view(), false).unwrap();
        vit.backward(r.view()).unwrap();

        let objective = |vit: &mut VisionTransformer| -> f64 {
            let y = vit.forward(x.view(), false).unwrap();
            (&y * &r).iter().map(|&v| v as f64).sum()
        };

        let sampled = [
            ("head.weight", 4),
            ("fc_norm.bias", 1),
            ("norm.weight", 2),
            ("blocks.1.mlp.fc2.weight", 9),
            ("blocks.0.attn.qkv.weight", 70),
            ("blocks.0.attn.proj.bias", 3),
            ("blocks.0.norm1.weight", 5),
            ("pos_embed", 12),
            ("cls_token", 6),
            ("patch_embed.proj.weight", 21),
        ];

        for (name, idx) in sampled {
            let Some(id) = vit.params().id(name) else {
                continue;
            };

            let analytic = vit.params().get(id).grad()[idx] as f64;
            let h = 1e-2;
            let orig = vit.params().get(id).data()[idx];

            vit.params_mut().get_mut(id).data_mut()[idx] = orig + h;
            let plus = objective(&mut vit);
            vit.params_mut().get_mut(id).data_mut()[idx] = orig - h;
            let minus = objective(&mut vit);
            vit.params_mut().get_mut(id).data_mut()[idx] = orig;

            let numeric = (plus - minus) / (2.0 * h as f64);
            let tol = 2e-2 * numeric.abs().max(analytic.abs()).max(1.0);
            assert!(
                (numeric - analytic).abs() < tol,
                "{name}[{idx}]: numeric {numeric} analytic {analytic}"
            );
        }
    }

    #[test]
    fn gradients_match_finite_differences_global_pool() {
        check_gradients(true);
    }

    #[test]
    fn gradients_match_finite_differences_cls_token() {
        check_gradients(false);
    }
}
