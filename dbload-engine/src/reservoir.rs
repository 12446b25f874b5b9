//! A capacity-bounded uniform sample of a stream.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Keeps a uniform random sample of at most `capacity` items from a stream of unknown length.
///
/// Uses algorithm R: the `k`-th offered item is always kept while `k <= capacity`, and afterwards
/// replaces a uniformly chosen slot with probability `capacity / k`. Every offered item therefore
/// has the same probability of being retained, independent of arrival order.
///
/// A capacity of `0` disables the bound and retains every item.
#[derive(Clone, Debug)]
pub struct Reservoir<T> {
    items: Vec<T>,
    capacity: usize,
    offered: u64,
    rng: SmallRng,
}

impl<T> Reservoir<T> {
    /// Creates an empty reservoir. The `seed` drives replacement decisions.
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            items: Vec::with_capacity(capacity.min(4096)),
            capacity,
            offered: 0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Offers an item to the reservoir.
    pub fn offer(&mut self, item: T) {
        self.offered += 1;

        if self.capacity == 0 || self.items.len() < self.capacity {
            self.items.push(item);
            return;
        }

        let slot = self.rng.random_range(0..self.offered);
        if slot < self.capacity as u64 {
            self.items[slot as usize] = item;
        }
    }

    /// Returns `true` if retained items are a sample rather than the full stream.
    pub fn is_sampled(&self) -> bool {
        self.offered > self.items.len() as u64
    }

    /// The retained items, in no particular order.
    pub fn items(&self) -> &[T] {
        &self.items
    }
}

impl<T: Clone + Ord> Reservoir<T> {
    /// Returns the retained items in ascending order.
    pub fn sorted(&self) -> Vec<T> {
        let mut items = self.items.clone();
        items.sort_unstable();
        items
    }
}
