use log::warn;
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

/// Decides which samples a process visits in an epoch, and in which order.
pub trait Sampler: Send {
    /// The sample indices of the current epoch.
    fn indices(&self) -> Vec<usize>;

    /// The amount of indices per epoch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reseeds the order for `epoch`, a no-op for deterministic samplers.
    fn set_epoch(&mut self, _epoch: usize) {}
}

/// Visits every sample once, in order.
#[derive(Debug, Clone, Copy)]
pub struct SequentialSampler {
    len: usize,
}

impl SequentialSampler {
    pub fn new(len: usize) -> Self {
        Self { len }
    }
}

impl Sampler for SequentialSampler {
    fn indices(&self) -> Vec<usize> {
        (0..self.len).collect()
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Splits a dataset evenly across the ranks of a process group.
///
/// The index list is padded by wrapping around from its start until its length
/// is a multiple of `world_size`, then rank `r` takes every `world_size`th
/// index starting at `r`. Every rank gets the same amount of samples.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    dataset_len: usize,
    world_size: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    epoch: usize,
}

impl DistributedSampler {
    pub fn new(dataset_len: usize, world_size: usize, rank: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            dataset_len,
            world_size: world_size.max(1),
            rank,
            shuffle,
            seed,
            epoch: 0,
        }
    }

    /// Builds the validation sampler, warning when the split needs padding.
    pub fn for_eval(dataset_len: usize, world_size: usize, rank: usize, seed: u64) -> Self {
        if dataset_len % world_size.max(1) != 0 {
            warn!(
                "Enabling distributed evaluation with an eval dataset not divisible by process number. \
                 This will slightly alter validation results as extra duplicate entries are added \
                 to achieve equal num of samples per-process."
            );
        }

        Self::new(dataset_len, world_size, rank, true, seed)
    }

    fn total_size(&self) -> usize {
        self.dataset_len.div_ceil(self.world_size) * self.world_size
    }
}

impl Sampler for DistributedSampler {
    fn indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.dataset_len).collect();

        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
            indices.shuffle(&mut rng);
        }

        let total = self.total_size();
        if !indices.is_empty() {
            let mut i = 0;
            while indices.len() < total {
                indices.push(indices[i]);
                i += 1;
            }
        }

        indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }

    fn len(&self) -> usize {
        self.total_size() / self.world_size
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn shards_are_equal_disjoint_and_cover_everything() {
        let world = 3;
        let samplers: Vec<_> = (0..world)
            .map(|rank| DistributedSampler::new(10, world, rank, true, 5))
            .collect();

        let shards: Vec<Vec<usize>> = samplers.iter().map(Sampler::indices).collect();
        assert!(shards.iter().all(|s| s.len() == 4));
        assert!(samplers.iter().all(|s| s.len() == 4));

        let seen: HashSet<usize> = shards.iter().flatten().copied().collect();
        assert_eq!(seen, (0..10).collect());
    }

    #[test]
    fn padding_wraps_from_the_start() {
        let shards: Vec<Vec<usize>> = (0..4)
            .map(|rank| DistributedSampler::new(5, 4, rank, false, 0).indices())
            .collect();

        // [0, 1, 2, 3, 4, 0, 1, 2] strided by 4.
        assert_eq!(shards, vec![vec![0, 4], vec![1, 0], vec![2, 1], vec![3, 2]]);
    }

    #[test]
    fn epoch_reseeds_the_order() {
        let mut sampler = DistributedSampler::new(64, 1, 0, true, 5);
        let first = sampler.indices();
        assert_eq!(first, sampler.indices());

        sampler.set_epoch(1);
        let second = sampler.indices();
        assert_ne!(first, second);

        let mut sorted = second.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn sequential_visits_in_order() {
        let mut sampler = SequentialSampler::new(4);
        sampler.set_epoch(3);
        assert_eq!(sampler.indices(), vec![0, 1, 2, 3]);
        assert_eq!(Sampler::len(&sampler), 4);
    }
}
