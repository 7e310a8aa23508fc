use std::collections::BTreeMap;

use crate::{ParamId, arch::Model};

/// A bucket of parameters sharing a learning rate scale and a weight decay.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    pub name: String,
    pub params: Vec<ParamId>,
    pub lr_scale: f32,
    pub weight_decay: f32,
    /// The current learning rate, `base_lr · lr_scale`.
    pub lr: f32,
}

/// Assigns a depth id to a parameter name.
///
/// The embeddings are layer `0`, block `i` is layer `i + 1` and everything on
/// top of the last block is layer `depth + 1`.
pub fn layer_id(name: &str, depth: usize) -> usize {
    if matches!(name, "cls_token" | "pos_embed") || name.starts_with("patch_embed") {
        return 0;
    }

    name.strip_prefix("blocks.")
        .and_then(|rest| rest.split('.').next())
        .and_then(|i| i.parse::<usize>().ok())
        .map_or(depth + 1, |i| i + 1)
}

/// Builds the parameter groups for layer-wise learning rate decay.
///
/// Layer `l` gets `layer_decay^(depth + 1 - l)` as its lr scale. One dimensional
/// parameters and names in the model's no weight decay set get zero weight decay.
///
/// # Arguments
/// * `model` - The model whose parameters are grouped.
/// * `weight_decay` - The decay for the parameters that are not exempt.
/// * `layer_decay` - The per layer lr multiplier.
///
/// # Returns
/// The groups ordered by layer id, decayed before exempt.
pub fn param_groups_lrd<M: Model>(
    model: &M,
    weight_decay: f32,
    layer_decay: f32,
) -> Vec<ParamGroup> {
    let depth = model.depth();
    let num_layers = depth + 1;
    let no_decay = model.no_weight_decay();
    let mut groups: BTreeMap<(usize, bool), ParamGroup> = BTreeMap::new();

    for (id, param) in model.params().iter().enumerate() {
        let exempt = param.shape().len() == 1 || no_decay.contains(param.name());
        let layer = layer_id(param.name(), depth);
        let lr_scale = layer_decay.powi((num_layers - layer) as i32);

        groups
            .entry((layer, exempt))
            .or_insert_with(|| ParamGroup {
                name: format!(
                    "layer_{layer}_{}",
                    if exempt { "no_decay" } else { "decay" }
                ),
                params: Vec::new(),
                lr_scale,
                weight_decay: if exempt { 0.0 } else { weight_decay },
                lr: lr_scale,
            })
            .params
            .push(id);
    }

    groups.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{VisionTransformer, VitConfig};
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn layer_ids() {
        assert_eq!(layer_id("cls_token", 12), 0);
        assert_eq!(layer_id("pos_embed", 12), 0);
        assert_eq!(layer_id("patch_embed.proj.weight", 12), 0);
        assert_eq!(layer_id("blocks.0.attn.qkv.weight", 12), 1);
        assert_eq!(layer_id("blocks.11.norm1.bias", 12), 12);
        assert_eq!(layer_id("fc_norm.weight", 12), 13);
        assert_eq!(layer_id("head.bias", 12), 13);
    }

    #[test]
    fn scales_and_exemptions() {
        let mut rng = StdRng::seed_from_u64(0);
        let vit = VisionTransformer::new(VitConfig::tiny(true), &mut rng).unwrap();
        let groups = param_groups_lrd(&vit, 0.05, 0.5);

        let total: usize = groups.iter().map(|g| g.params.len()).sum();
        assert_eq!(total, vit.params().len());

        let find = |name: &str| groups.iter().find(|g| g.name == name).unwrap();

        // depth 2, so layers 0..=3 with scales 0.5^3 .. 0.5^0.
        let emb = find("layer_0_no_decay");
        assert_eq!(emb.lr_scale, 0.125);
        assert_eq!(emb.weight_decay, 0.0);
        let names: Vec<_> = emb.params.iter().map(|&id| vit.params().get(id).name()).collect();
        assert!(names.contains(&"cls_token"));
        assert!(names.contains(&"pos_embed"));
        assert!(names.contains(&"patch_embed.proj.bias"));

        let patch = find("layer_0_decay");
        assert_eq!(patch.weight_decay, 0.05);
        assert_eq!(patch.params.len(), 1);

        assert_eq!(find("layer_2_decay").lr_scale, 0.5);

        let head = find("layer_3_decay");
        assert_eq!(head.lr_scale, 1.0);
        assert_eq!(vit.params().get(head.params[0]).name(), "head.weight");
        assert_eq!(find("layer_3_no_decay").params.len(), 3);
    }

    #[test]
    fn groups_are_ordered_by_layer() {
        let mut rng = StdRng::seed_from_u64(0);
        let vit = VisionTransformer::new(VitConfig::tiny(false), &mut rng).unwrap();
        let names: Vec<_> = param_groups_lrd(&vit, 0.05, 0.75)
            .into_iter()
            .map(|g| g.name)
            .collect();

        assert_eq!(
            names,
            [
                "layer_0_decay",
                "layer_0_no_decay",
                "layer_1_decay",
                "layer_1_no_decay",
                "layer_2_decay",
                "layer_2_no_decay",
                "layer_3_decay",
                "layer_3_no_decay",
            ]
        );
    }
}
