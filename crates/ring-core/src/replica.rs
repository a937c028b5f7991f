//! The replicated payload pushed by the coordinator.

use serde::{Deserialize, Serialize};

/// Number of slots in a freshly bootstrapped replica.
pub const INITIAL_REPLICA_LEN: usize = 10;

/// Upper bound (exclusive) for values written by [`ReplicaState::drift`].
const DRIFT_VALUE_BOUND: i64 = 100;

/// Ordered sequence of integers.
///
/// The coordinator's copy is authoritative. Followers overwrite theirs
/// wholesale on every Sync; there is no merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaState {
    values: Vec<i64>,
}

impl ReplicaState {
    pub fn new(values: Vec<i64>) -> Self {
        Self { values }
    }

    /// `[0, 1, ..., 9]`, the value a bootstrap coordinator starts from.
    pub fn initial() -> Self {
        Self {
            values: (0..INITIAL_REPLICA_LEN as i64).collect(),
        }
    }

    /// Replace the whole replica (last writer wins).
    pub fn overwrite(&mut self, values: Vec<i64>) {
        self.values = values;
    }

    /// Set one slot. Returns false if `index` is out of range.
    pub fn set(&mut self, index: usize, value: i64) -> bool {
        match self.values.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Overwrite one random slot with a random value in `0..100`.
    ///
    /// Models local divergence between Sync rounds. Returns the slot and the
    /// value written, or `None` for an empty replica.
    pub fn drift(&mut self) -> Option<(usize, i64)> {
        use rand::Rng;

        if self.values.is_empty() {
            return None;
        }
        let mut rng = rand::rng();
        let index = rng.random_range(0..self.values.len());
        let value = rng.random_range(0..DRIFT_VALUE_BOUND);
        self.set(index, value).then_some((index, value))
    }

    pub fn values(&self) -> &[i64] {
        &self.values
    }

    pub fn to_vec(&self) -> Vec<i64> {
        self.values.clone()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<i64>> for ReplicaState {
    fn from(values: Vec<i64>) -> Self {
        Self::new(values)
    }
}
