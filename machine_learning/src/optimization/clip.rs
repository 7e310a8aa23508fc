use crate::ParamStore;

/// Rescales every gradient so their global L2 norm is at most `max_norm`.
///
/// # Returns
/// The global norm before clipping.
pub fn clip_grad_norm(store: &mut ParamStore, max_norm: f32) -> f32 {
    let norm = store.grad_norm();

    if norm.is_finite() && norm > max_norm {
        store.scale_grads(max_norm / (norm + 1e-6));
    }

    norm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_grad(grad: &[f32]) -> ParamStore {
        let mut store = ParamStore::new();
        let id = store.register("w", &[grad.len()], vec![0.0; grad.len()]).unwrap();
        store.get_mut(id).grad_mut().copy_from_slice(grad);
        store
    }

    #[test]
    fn clips_large_gradients() {
        let mut store = store_with_grad(&[3.0, 4.0]);
        let norm = clip_grad_norm(&mut store, 1.0);

        assert_eq!(norm, 5.0);
        assert!((store.grad_norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn leaves_small_gradients() {
        let mut store = store_with_grad(&[0.3, 0.4]);
        assert!((clip_grad_norm(&mut store, 1.0) - 0.5).abs() < 1e-6);
        assert_eq!(store.get(0).grad(), &[0.3, 0.4]);
    }
}
