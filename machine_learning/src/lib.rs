pub mod arch;
pub mod checkpoint;
pub mod error;
pub mod init;
pub mod metrics;
pub mod mixup;
pub mod optimization;
pub mod params;
pub mod pos_embed;

pub use error::{MlErr, Result};
pub use params::{Param, ParamId, ParamStore};
