use ndarray::prelude::*;

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const COEF: f32 = 0.044_715;

/// The GELU activation in its tanh approximation.
#[derive(Debug, Clone, Default)]
pub struct Gelu {
    x: Array2<f32>,
}

impl Gelu {
    pub fn new() -> Self {
        Self::default()
    }

    fn f(x: f32) -> f32 {
        0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + COEF * x.powi(3))).tanh())
    }

    fn df(x: f32) -> f32 {
        let t = (SQRT_2_OVER_PI * (x + COEF * x.powi(3))).tanh();
        0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * SQRT_2_OVER_PI * (1.0 + 3.0 * COEF * x * x)
    }

    pub fn forward(&mut self, x: Array2<f32>) -> Array2<f32> {
        let y = x.mapv(Self::f);
        self.x = x;
        y
    }

    pub fn backward(&mut self, mut d: Array2<f32>) -> Array2<f32> {
        d.zip_mut_with(&self.x, |d, &x| *d *= Self::df(x));
        d
    }
}
