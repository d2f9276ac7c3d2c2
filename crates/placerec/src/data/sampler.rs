use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Splits `0..len` into one near-equal partition per rank.
///
/// Each epoch the full index list is (optionally) shuffled with a seed of
/// `seed + epoch`, identical on every rank, padded by repeating its head until
/// it divides evenly, and then dealt out round-robin: rank `r` gets positions
/// `r, r + W, r + 2W, ...`. Every rank therefore sees exactly
/// `ceil(len / W)` indices per epoch and all ranks run the same number of
/// batches.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
}

impl DistributedSampler {
    /// # Panics
    /// Panics if `num_replicas` is zero or `rank >= num_replicas`.
    pub fn new(len: usize, num_replicas: usize, rank: usize) -> Self {
        assert!(num_replicas > 0, "num_replicas must be positive");
        assert!(
            rank < num_replicas,
            "rank {rank} out of range for {num_replicas} replicas"
        );
        Self {
            len,
            num_replicas,
            rank,
            shuffle: true,
            seed: 0,
            epoch: 0,
        }
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Select the permutation for the next pass. Every rank must call this
    /// with the same epoch before iterating.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Indices handed to this rank per epoch.
    pub fn num_samples(&self) -> usize {
        self.len.div_ceil(self.num_replicas)
    }

    /// Padded length of the global index list.
    pub fn total_size(&self) -> usize {
        self.num_samples() * self.num_replicas
    }

    /// This rank's indices for the current epoch.
    pub fn indices(&self) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }

        let mut all: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            all.shuffle(&mut rng);
        }

        let total = self.total_size();
        // cycles more than once when there are more ranks than samples
        while all.len() < total {
            let i = all[all.len() % self.len];
            all.push(i);
        }

        all.into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn partitions(len: usize, world: usize, epoch: u64) -> Vec<Vec<usize>> {
        (0..world)
            .map(|r| {
                let mut s = DistributedSampler::new(len, world, r).with_seed(11);
                s.set_epoch(epoch);
                s.indices()
            })
            .collect()
    }

    #[test]
    fn test_partitions_disjoint_and_cover_when_divisible() {
        let parts = partitions(12, 3, 1);
        let mut seen = HashSet::new();
        for part in &parts {
            assert_eq!(part.len(), 4);
            for &i in part {
                assert!(seen.insert(i), "index {i} handed to two ranks");
            }
        }
        assert_eq!(seen, (0..12).collect());
    }

    #[test]
    fn test_padding_only_repeats_to_divide_evenly() {
        let parts = partitions(10, 4, 3);
        let all: Vec<usize> = parts.iter().flatten().copied().collect();
        assert!(parts.iter().all(|p| p.len() == 3));
        assert_eq!(all.len(), 12);

        let unique: HashSet<usize> = all.iter().copied().collect();
        assert_eq!(unique, (0..10).collect());
        // exactly total_size - len duplicates
        assert_eq!(all.len() - unique.len(), 2);
    }

    #[test]
    fn test_more_ranks_than_samples() {
        let parts = partitions(2, 5, 0);
        assert!(parts.iter().all(|p| p.len() == 1));
        let unique: HashSet<usize> = parts.iter().flatten().copied().collect();
        assert_eq!(unique, (0..2).collect());
    }

    #[test]
    fn test_set_epoch_reshuffles_deterministically() {
        let mut s = DistributedSampler::new(64, 2, 0).with_seed(5);
        s.set_epoch(1);
        let e1 = s.indices();
        s.set_epoch(2);
        let e2 = s.indices();
        s.set_epoch(1);
        assert_eq!(s.indices(), e1);
        assert_ne!(e1, e2);
    }

    #[test]
    fn test_without_shuffle_is_round_robin() {
        let s = DistributedSampler::new(7, 2, 1).with_shuffle(false);
        // padded list: 0..7 then 0
        assert_eq!(s.indices(), vec![1, 3, 5, 0]);
        assert_eq!(s.num_samples(), 4);
        assert_eq!(s.total_size(), 8);
    }

    #[test]
    fn test_empty_dataset() {
        let s = DistributedSampler::new(0, 3, 2);
        assert!(s.indices().is_empty());
        assert_eq!(s.num_samples(), 0);
    }
}
