use std::{fmt, str::FromStr};

use rand::Rng;

use super::{VisionTransformer, VitConfig};
use crate::{MlErr, Result};

/// The architectures that can be built by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    VitTinyPatch4,
    VitSmallPatch8,
    VitBasePatch16,
    VitLargePatch16,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::VitTinyPatch4,
        ModelKind::VitSmallPatch8,
        ModelKind::VitBasePatch16,
        ModelKind::VitLargePatch16,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ModelKind::VitTinyPatch4 => "vit_tiny_patch4",
            ModelKind::VitSmallPatch8 => "vit_small_patch8",
            ModelKind::VitBasePatch16 => "vit_base_patch16",
            ModelKind::VitLargePatch16 => "vit_large_patch16",
        }
    }

    /// `(patch_size, embed_dim, depth, num_heads)`
    fn dims(self) -> (usize, usize, usize, usize) {
        match self {
            ModelKind::VitTinyPatch4 => (4, 192, 12, 3),
            ModelKind::VitSmallPatch8 => (8, 384, 12, 6),
            ModelKind::VitBasePatch16 => (16, 768, 12, 12),
            ModelKind::VitLargePatch16 => (16, 1024, 24, 16),
        }
    }

    /// Fills in a `VitConfig` for this architecture.
    ///
    /// # Arguments
    /// * `img_size` - The side of the cubic input volume.
    /// * `in_chans` - The amount of input channels.
    /// * `num_classes` - The amount of head outputs.
    /// * `drop_path_rate` - The stochastic depth rate of the last block.
    /// * `global_pool` - Whether to average the patch tokens instead of using the class token.
    pub fn config(
        self,
        img_size: usize,
        in_chans: usize,
        num_classes: usize,
        drop_path_rate: f32,
        global_pool: bool,
    ) -> VitConfig {
        let (patch_size, embed_dim, depth, num_heads) = self.dims();

        VitConfig {
            img_size,
            patch_size,
            in_chans,
            num_classes,
            embed_dim,
            depth,
            num_heads,
            mlp_ratio: 4.0,
            drop_path_rate,
            global_pool,
        }
    }

    /// Builds a randomly initialized model of this architecture.
    pub fn build<R: Rng>(self, cfg: VitConfig, rng: &mut R) -> Result<VisionTransformer> {
        VisionTransformer::new(cfg, rng)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ModelKind {
    type Err = MlErr;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| MlErr::UnknownModel(s.to_string()))
    }
}
