use ndarray::{IxDyn, prelude::*};
use rand::Rng;

use super::Dense;
use crate::{
    MlErr, ParamStore, Result,
    init::{ConstWeightGen, TruncNormalWeightGen, WeightGen},
};

/// Splits a cubic volume into non-overlapping `patch³` cubes and projects each
/// one to the embedding size.
///
/// Equivalent to a 3D convolution with `kernel = stride = patch`, the weight is
/// stored as `[embed, chans, patch, patch, patch]`.
#[derive(Debug, Clone)]
pub struct PatchEmbed {
    proj: Dense,
    img_size: usize,
    patch_size: usize,
    in_chans: usize,
}

impl PatchEmbed {
    pub fn new<R: Rng>(
        store: &mut ParamStore,
        img_size: usize,
        patch_size: usize,
        in_chans: usize,
        embed_dim: usize,
        rng: &mut R,
    ) -> Result<Self> {
        if patch_size == 0 || img_size % patch_size != 0 {
            return Err(MlErr::InvalidHyperParam {
                name: "patch_size",
                reason: format!("{patch_size} does not divide the input size {img_size}"),
            });
        }

        let patch_len = in_chans * patch_size.pow(3);
        let weights = TruncNormalWeightGen::new(rng, 0.02)?.sample(embed_dim * patch_len);
        let w = store.register(
            "patch_embed.proj.weight",
            &[embed_dim, in_chans, patch_size, patch_size, patch_size],
            weights,
        )?;
        let b = store.register(
            "patch_embed.proj.bias",
            &[embed_dim],
            ConstWeightGen(0.0).sample(embed_dim),
        )?;

        Ok(Self {
            proj: Dense::from_params(w, b, (patch_len, embed_dim)),
            img_size,
            patch_size,
            in_chans,
        })
    }

    /// The amount of patches along each axis.
    pub fn grid_size(&self) -> usize {
        self.img_size / self.patch_size
    }

    pub fn num_patches(&self) -> usize {
        self.grid_size().pow(3)
    }

    /// The amount of values in one input volume.
    pub fn input_len(&self) -> usize {
        self.in_chans * self.img_size.pow(3)
    }

    /// Rearranges `[batch, C·S³]` volumes into `[batch · N, C·p³]` patch rows,
    /// patches in `(z, y, x)` raster order.
    fn patchify(&self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let (b, c, g, p) = (x.nrows(), self.in_chans, self.grid_size(), self.patch_size);
        let volumes = x.into_shape_with_order(IxDyn(&[b, c, g, p, g, p, g, p]))?;
        let patches = volumes.permuted_axes(IxDyn(&[0, 2, 4, 6, 1, 3, 5, 7]));
        let rows = b * self.num_patches();
        let cols = c * p.pow(3);

        Ok(Array2::from_shape_vec(
            (rows, cols),
            patches.iter().copied().collect(),
        )?)
    }

    /// Embeds a batch of volumes.
    ///
    /// # Arguments
    /// * `store` - The parameter storage.
    /// * `x` - The flattened volumes, one per row.
    ///
    /// # Returns
    /// The patch tokens of shape `[batch · N, embed]`.
    pub fn forward(&mut self, store: &ParamStore, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.input_len() {
            return Err(MlErr::SizeMismatch {
                what: "input volume",
                got: x.ncols(),
                expected: self.input_len(),
            });
        }

        let patches = self.patchify(x)?;
        self.proj.forward(store, patches.view())
    }

    /// Accumulates the projection's gradients, the input volume needs none.
    pub fn backward(&mut self, store: &mut ParamStore, d: ArrayView2<f32>) -> Result<()> {
        self.proj.accumulate_grads(store, d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn patches_follow_raster_order() {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(0);
        let embed = PatchEmbed::new(&mut store, 4, 2, 1, 8, &mut rng).unwrap();

        let x = Array2::from_shape_fn((1, 64), |(_, i)| i as f32);
        let patches = embed.patchify(x.view()).unwrap();

        assert_eq!(patches.dim(), (8, 8));
        // First patch: z, y, x in {0, 1}.
        assert_eq!(
            patches.row(0).to_vec(),
            vec![0.0, 1.0, 4.0, 5.0, 16.0, 17.0, 20.0, 21.0]
        );
        // Second patch is shifted by two along x.
        assert_eq!(patches[[1, 0]], 2.0);
        // Fifth patch starts at z = 2.
        assert_eq!(patches[[4, 0]], 32.0);
    }

    #[test]
    fn rejects_wrong_volume_size() {
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(0);
        let mut embed = PatchEmbed::new(&mut store, 4, 2, 1, 8, &mut rng).unwrap();

        let x = Array2::zeros((1, 63));
        assert!(matches!(
            embed.forward(&store, x.view()),
            Err(MlErr::SizeMismatch { .. })
        ));
        assert!(PatchEmbed::new(&mut ParamStore::new(), 5, 2, 1, 8, &mut rng).is_err());
    }
}
