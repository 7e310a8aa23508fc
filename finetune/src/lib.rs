pub mod best;
pub mod config;
pub mod data;
pub mod dist;
pub mod engine;
pub mod error;
pub mod metric_logger;
pub mod run;
pub mod sink;

pub use config::FinetuneConfig;
pub use error::{FinetuneErr, Result};
pub use run::{RunSummary, run};
