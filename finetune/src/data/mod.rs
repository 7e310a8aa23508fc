pub mod augment;
pub mod dataloader;
pub mod dataset;
pub mod sampler;

pub use augment::{Compose, Transform};
pub use dataloader::{Batch, BatchIter, DataLoader};
pub use dataset::{Sample, VolumeDataset};
pub use sampler::{DistributedSampler, Sampler, SequentialSampler};
