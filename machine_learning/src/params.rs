use std::collections::HashMap;

use ndarray::{ArrayView1, ArrayView2};
use rayon::prelude::*;

use crate::{MlErr, Result};

/// The index of a parameter inside its `ParamStore`.
pub type ParamId = usize;

/// A named tensor of trainable values together with its gradient.
#[derive(Debug, Clone)]
pub struct Param {
    name: String,
    shape: Vec<usize>,
    data: Vec<f32>,
    grad: Vec<f32>,
}

impl Param {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn grad(&self) -> &[f32] {
        &self.grad
    }

    pub fn grad_mut(&mut self) -> &mut [f32] {
        &mut self.grad
    }

    /// Borrows the values immutably and the gradient mutably at the same time.
    pub fn split_mut(&mut self) -> (&[f32], &mut [f32]) {
        (&self.data, &mut self.grad)
    }

    /// Borrows the values mutably and the gradient immutably at the same time.
    pub fn update_view(&mut self) -> (&mut [f32], &[f32]) {
        (&mut self.data, &self.grad)
    }

    /// Views the values as a matrix of `dim` rows and columns.
    ///
    /// # Arguments
    /// * `dim` - The `(rows, cols)` of the view, must cover exactly all the values.
    pub fn view2(&self, dim: (usize, usize)) -> Result<ArrayView2<'_, f32>> {
        Ok(ArrayView2::from_shape(dim, &self.data)?)
    }

    pub fn view1(&self) -> ArrayView1<'_, f32> {
        ArrayView1::from(&self.data[..])
    }
}

/// The owner of every trainable tensor of a model, addressable by id or by name.
///
/// Parameters keep their registration order, which is also the order used when
/// flattening the gradients for the collective operations.
#[derive(Debug, Default, Clone)]
pub struct ParamStore {
    params: Vec<Param>,
    index: HashMap<String, ParamId>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new parameter.
    ///
    /// # Arguments
    /// * `name` - The unique dotted name of the parameter.
    /// * `shape` - The tensor's shape.
    /// * `data` - The initial values, its length must match the shape's product.
    ///
    /// # Returns
    /// The id of the newly registered parameter.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        shape: &[usize],
        data: Vec<f32>,
    ) -> Result<ParamId> {
        let name = name.into();
        let expected = shape.iter().product();

        if data.len() != expected {
            return Err(MlErr::SizeMismatch {
                what: "parameter initialization",
                got: data.len(),
                expected,
            });
        }

        if self.index.contains_key(&name) {
            return Err(MlErr::DuplicateParam(name));
        }

        let id = self.params.len();
        self.index.insert(name.clone(), id);
        self.params.push(Param {
            name,
            shape: shape.to_vec(),
            grad: vec![0.0; data.len()],
            data,
        });

        Ok(id)
    }

    pub fn id(&self, name: &str) -> Option<ParamId> {
        self.index.get(name).copied()
    }

    pub fn get(&self, id: ParamId) -> &Param {
        &self.params[id]
    }

    pub fn get_mut(&mut self, id: ParamId) -> &mut Param {
        &mut self.params[id]
    }

    pub fn by_name(&self, name: &str) -> Option<&Param> {
        self.id(name).map(|id| &self.params[id])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Param> {
        self.params.iter_mut()
    }

    pub fn par_iter_mut(&mut self) -> rayon::slice::IterMut<'_, Param> {
        self.params.par_iter_mut()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// The total amount of scalar values across every parameter.
    pub fn n_parameters(&self) -> usize {
        self.params.iter().map(Param::len).sum()
    }

    /// Overwrites a parameter's values after checking the shape agrees.
    ///
    /// # Arguments
    /// * `name` - The parameter to overwrite.
    /// * `shape` - The shape of the incoming values.
    /// * `data` - The new values.
    pub fn assign(&mut self, name: &str, shape: &[usize], data: &[f32]) -> Result<()> {
        let id = self
            .id(name)
            .ok_or_else(|| MlErr::UnknownParam(name.to_string()))?;

        let param = &mut self.params[id];
        if param.shape != shape || param.data.len() != data.len() {
            return Err(MlErr::ShapeMismatch {
                name: name.to_string(),
                got: shape.to_vec(),
                expected: param.shape.clone(),
            });
        }

        param.data.copy_from_slice(data);
        Ok(())
    }

    /// Zeroes out every gradient.
    pub fn zero_grad(&mut self) {
        self.params
            .par_iter_mut()
            .for_each(|param| param.grad.fill(0.0));
    }

    /// Multiplies every gradient by `factor`.
    pub fn scale_grads(&mut self, factor: f32) {
        self.params.par_iter_mut().for_each(|param| {
            param.grad.iter_mut().for_each(|g| *g *= factor);
        });
    }

    /// Whether every gradient value is finite.
    pub fn grads_finite(&self) -> bool {
        self.params
            .par_iter()
            .all(|param| param.grad.iter().all(|g| g.is_finite()))
    }

    /// The global L2 norm of the concatenation of every gradient.
    pub fn grad_norm(&self) -> f32 {
        self.params
            .par_iter()
            .map(|param| param.grad.iter().map(|g| g * g).sum::<f32>())
            .sum::<f32>()
            .sqrt()
    }

    /// Copies every gradient into a single contiguous buffer in registration order.
    pub fn flat_grads(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(self.n_parameters());
        for param in &self.params {
            flat.extend_from_slice(&param.grad);
        }
        flat
    }

    /// Scatters a contiguous buffer produced by `flat_grads` back into the gradients.
    pub fn set_flat_grads(&mut self, flat: &[f32]) -> Result<()> {
        let expected = self.n_parameters();
        if flat.len() != expected {
            return Err(MlErr::SizeMismatch {
                what: "flat gradient",
                got: flat.len(),
                expected,
            });
        }

        let mut rest = flat;
        for param in &mut self.params {
            let (head, tail) = rest.split_at(param.grad.len());
            param.grad.copy_from_slice(head);
            rest = tail;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ParamStore {
        let mut store = ParamStore::new();
        store.register("a.weight", &[2, 3], vec![1.0; 6]).unwrap();
        store.register("a.bias", &[3], vec![0.0; 3]).unwrap();
        store
    }

    #[test]
    fn register_checks_len_and_duplicates() {
        let mut store = store();
        assert!(matches!(
            store.register("b", &[2, 2], vec![0.0; 3]),
            Err(MlErr::SizeMismatch { .. })
        ));
        assert!(matches!(
            store.register("a.bias", &[3], vec![0.0; 3]),
            Err(MlErr::DuplicateParam(_))
        ));
        assert_eq!(store.n_parameters(), 9);
    }

    #[test]
    fn flat_grads_roundtrip_in_registration_order() {
        let mut store = store();
        let flat: Vec<f32> = (0..9).map(|i| i as f32).collect();
        store.set_flat_grads(&flat).unwrap();

        assert_eq!(store.by_name("a.bias").unwrap().grad(), &[6.0, 7.0, 8.0]);
        assert_eq!(store.flat_grads(), flat);
        assert!(store.set_flat_grads(&flat[..4]).is_err());
    }

    #[test]
    fn grad_norm_and_scaling() {
        let mut store = store();
        store.get_mut(0).grad_mut()[0] = 3.0;
        store.get_mut(1).grad_mut()[2] = 4.0;
        assert_eq!(store.grad_norm(), 5.0);

        store.scale_grads(0.5);
        assert_eq!(store.grad_norm(), 2.5);

        store.get_mut(1).grad_mut()[0] = f32::NAN;
        assert!(!store.grads_finite());

        store.zero_grad();
        assert!(store.grads_finite());
        assert_eq!(store.grad_norm(), 0.0);
    }

    #[test]
    fn assign_rejects_other_shapes() {
        let mut store = store();
        assert!(store.assign("a.bias", &[3], &[1.0, 2.0, 3.0]).is_ok());
        assert!(matches!(
            store.assign("a.bias", &[1, 3], &[1.0, 2.0, 3.0]),
            Err(MlErr::ShapeMismatch { .. })
        ));
        assert!(matches!(
            store.assign("nope", &[3], &[1.0, 2.0, 3.0]),
            Err(MlErr::UnknownParam(_))
        ));
    }
}
