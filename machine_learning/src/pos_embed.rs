use log::{info, warn};

/// The side of the cube holding `n` patches, if there is one.
fn cube_side(n: usize) -> Option<usize> {
    let side = (n as f64).cbrt().round() as usize;
    (side.pow(3) == n).then_some(side)
}

/// Source taps and weights along one axis for `align_corners = false`.
fn taps(src: usize, dst: usize) -> Vec<(usize, usize, f32)> {
    let scale = src as f32 / dst as f32;

    (0..dst)
        .map(|o| {
            let real = ((o as f32 + 0.5) * scale - 0.5).max(0.0);
            let i0 = (real as usize).min(src - 1);
            let i1 = (i0 + 1).min(src - 1);
            (i0, i1, real - i0 as f32)
        })
        .collect()
}

/// Resizes a `[1, extra + g³, E]` positional embedding to `target_patches` patch tokens.
///
/// The `num_extra` leading tokens are kept as they are, the patch tokens are
/// resampled with trilinear interpolation over the cubic grid.
///
/// # Arguments
/// * `data` - The embedding values.
/// * `shape` - The embedding shape, `[1, tokens, E]`.
/// * `target_patches` - The amount of patch tokens of the live model.
/// * `num_extra` - The amount of leading class tokens.
///
/// # Returns
/// The resized values and shape, or `None` when there's nothing to do or the
/// source grid is not a cube.
pub fn interpolate_pos_embed(
    data: &[f32],
    shape: &[usize],
    target_patches: usize,
    num_extra: usize,
) -> Option<(Vec<f32>, Vec<usize>)> {
    let &[1, tokens, dim] = shape else {
        warn!("pos_embed has unexpected shape {shape:?}, leaving it untouched");
        return None;
    };

    if tokens < num_extra || data.len() != tokens * dim {
        warn!("pos_embed of shape {shape:?} is inconsistent, leaving it untouched");
        return None;
    }

    let src_patches = tokens - num_extra;
    if src_patches == target_patches {
        return None;
    }

    let (Some(src), Some(dst)) = (cube_side(src_patches), cube_side(target_patches)) else {
        warn!(
            "pos_embed grid of {src_patches} patches cannot be resized to {target_patches}, leaving it untouched"
        );
        return None;
    };

    info!("Position interpolate from {src}x{src}x{src} to {dst}x{dst}x{dst}");

    let (extra, patches) = data.split_at(num_extra * dim);
    let at = |z: usize, y: usize, x: usize| &patches[((z * src + y) * src + x) * dim..][..dim];
    let axis = taps(src, dst);

    let mut out = Vec::with_capacity((num_extra + dst.pow(3)) * dim);
    out.extend_from_slice(extra);

    let mut acc = vec![0.0; dim];
    for &(z0, z1, lz) in &axis {
        for &(y0, y1, ly) in &axis {
            for &(x0, x1, lx) in &axis {
                acc.fill(0.0);

                let corners = [
                    (z0, y0, x0, (1.0 - lz) * (1.0 - ly) * (1.0 - lx)),
                    (z0, y0, x1, (1.0 - lz) * (1.0 - ly) * lx),
                    (z0, y1, x0, (1.0 - lz) * ly * (1.0 - lx)),
                    (z0, y1, x1, (1.0 - lz) * ly * lx),
                    (z1, y0, x0, lz * (1.0 - ly) * (1.0 - lx)),
                    (z1, y0, x1, lz * (1.0 - ly) * lx),
                    (z1, y1, x0, lz * ly * (1.0 - lx)),
                    (z1, y1, x1, lz * ly * lx),
                ];

                for (z, y, x, w) in corners {
                    if w != 0.0 {
                        for (a, v) in acc.iter_mut().zip(at(z, y, x)) {
                            *a += w * v;
                        }
                    }
                }

                out.extend_from_slice(&acc);
            }
        }
    }

    Some((out, vec![1, num_extra + dst.pow(3), dim]))
}
