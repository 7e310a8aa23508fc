use std::{sync::Arc, thread};

use crossbeam_channel::{Receiver, bounded};
use log::debug;
use ndarray::Array2;
use rand::{SeedableRng, rngs::StdRng};

use super::{Sampler, VolumeDataset};
use crate::{FinetuneErr, Result};

/// Batches buffered by every prefetch worker.
const PREFETCH: usize = 2;

/// A collated batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `[batch, channels · side³]`
    pub x: Array2<f32>,
    /// `[batch, label_width]`
    pub y: Array2<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.x.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.x.nrows() == 0
    }
}

/// Reads batches in sampler order on background threads.
///
/// Batch `k` of an epoch is loaded by worker `k % num_workers`, every worker
/// owns a bounded channel and the consumer polls them round robin, so batches
/// come out in sampler order.
pub struct DataLoader {
    dataset: Arc<VolumeDataset>,
    sampler: Box<dyn Sampler>,
    batch_size: usize,
    num_workers: usize,
    drop_last: bool,
    seed: u64,
    epoch: usize,
}

impl DataLoader {
    /// Creates a new `DataLoader`.
    ///
    /// # Arguments
    /// * `dataset` - The samples.
    /// * `sampler` - The order in which they're visited.
    /// * `batch_size` - The amount of samples per batch.
    /// * `num_workers` - The amount of prefetch threads, at least one is used.
    /// * `drop_last` - Whether to drop the last batch when it's incomplete.
    /// * `seed` - Seeds the per sample transform randomness.
    pub fn new(
        dataset: Arc<VolumeDataset>,
        sampler: Box<dyn Sampler>,
        batch_size: usize,
        num_workers: usize,
        drop_last: bool,
        seed: u64,
    ) -> Self {
        Self {
            dataset,
            sampler,
            batch_size: batch_size.max(1),
            num_workers: num_workers.max(1),
            drop_last,
            seed,
            epoch: 0,
        }
    }

    pub fn dataset(&self) -> &VolumeDataset {
        &self.dataset
    }

    /// The amount of batches in an epoch.
    pub fn len(&self) -> usize {
        let n = self.sampler.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The amount of samples visited in an epoch, padding included.
    pub fn num_samples(&self) -> usize {
        self.sampler.len()
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.sampler.set_epoch(epoch);
    }

    /// Starts the prefetch workers for the current epoch.
    pub fn iter(&self) -> BatchIter {
        let mut indices = self.sampler.indices();
        if self.drop_last {
            indices.truncate(self.len() * self.batch_size);
        }

        let batches: Vec<Vec<usize>> = indices
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        let total = batches.len();
        let workers = self.num_workers.min(total.max(1));

        let receivers = (0..workers)
            .map(|worker| {
                let (tx, rx) = bounded(PREFETCH);
                let dataset = Arc::clone(&self.dataset);
                let mine: Vec<Vec<usize>> =
                    batches.iter().skip(worker).step_by(workers).cloned().collect();
                let seed = self.seed.wrapping_add((self.epoch as u64) << 32);

                thread::spawn(move || {
                    for batch in mine {
                        let loaded = collate(&dataset, &batch, seed);
                        let failed = loaded.is_err();

                        if tx.send(loaded).is_err() || failed {
                            break;
                        }
                    }
                    debug!("prefetch worker {worker} done");
                });

                rx
            })
            .collect();

        BatchIter {
            receivers,
            next: 0,
            total,
        }
    }
}

/// Loads and stacks the samples of one batch.
fn collate(dataset: &VolumeDataset, indices: &[usize], seed: u64) -> Result<Batch> {
    let samples = indices
        .iter()
        .map(|&idx| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(idx as u64));
            dataset.get(idx, &mut rng)
        })
        .collect::<Result<Vec<_>>>()?;

    let width = dataset.volume().len();
    let label_width = samples.first().map_or(0, |s| s.label.len());

    let mut x = Vec::with_capacity(samples.len() * width);
    let mut y = Vec::with_capacity(samples.len() * label_width);
    for sample in samples {
        x.extend(sample.volume);
        y.extend(sample.label);
    }

    let rows = indices.len();
    let x = Array2::from_shape_vec((rows, width), x)
        .map_err(|e| FinetuneErr::InvalidConfig(format!("cannot collate volumes: {e}")))?;
    let y = Array2::from_shape_vec((rows, label_width), y)
        .map_err(|e| FinetuneErr::InvalidConfig(format!("cannot collate labels: {e}")))?;

    Ok(Batch { x, y })
}

/// The batches of one epoch.
pub struct BatchIter {
    receivers: Vec<Receiver<Result<Batch>>>,
    next: usize,
    total: usize,
}

impl BatchIter {
    /// The amount of batches still to come.
    pub fn remaining(&self) -> usize {
        self.total - self.next
    }
}

impl Iterator for BatchIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }

        let rx = &self.receivers[self.next % self.receivers.len()];
        self.next += 1;

        match rx.recv() {
            Ok(batch) => Some(batch),
            Err(_) => {
                self.next = self.total;
                Some(Err(FinetuneErr::Io(std::io::Error::other(
                    "a prefetch worker stopped early",
                ))))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining(), Some(self.remaining()))
    }
}

impl ExactSizeIterator for BatchIter {}
