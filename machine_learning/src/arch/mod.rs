pub mod layers;
pub mod loss;
mod model;
mod registry;
mod vit;

pub use model::Model;
pub use registry::ModelKind;
pub use vit::{VisionTransformer, VitConfig};
