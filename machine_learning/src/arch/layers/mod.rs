mod attention;
mod block;
mod dense;
mod drop_path;
mod gelu;
mod layer_norm;
mod patch_embed;

pub use attention::{Attention, softmax_rows};
pub use block::Block;
pub use dense::Dense;
pub use drop_path::DropPath;
pub use gelu::Gelu;
pub use layer_norm::LayerNorm;
pub use patch_embed::PatchEmbed;
