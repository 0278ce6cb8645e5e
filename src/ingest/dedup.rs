//! Novelty check against the set of keys already in storage.

use std::collections::HashSet;

use crate::models::{Observation, ObservationKey};

/// Identity keys known to be persisted.
///
/// Seeded from storage at startup and grown only with keys from batches the
/// store accepted, so it never claims a write that did not happen.
#[derive(Debug, Default, Clone)]
pub struct KnownRecordSet {
    keys: HashSet<ObservationKey>,
}

impl KnownRecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn contains(&self, key: &ObservationKey) -> bool {
        self.keys.contains(key)
    }

    pub fn merge(&mut self, committed: impl IntoIterator<Item = ObservationKey>) {
        self.keys.extend(committed);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl From<HashSet<ObservationKey>> for KnownRecordSet {
    fn from(keys: HashSet<ObservationKey>) -> Self {
        Self { keys }
    }
}

/// Result of splitting one snapshot's observations
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Partition {
    pub fresh: Vec<Observation>,
    pub known: Vec<Observation>,
}

impl Partition {
    pub fn has_fresh(&self) -> bool {
        !self.fresh.is_empty()
    }
}

/// Split `observations` into unseen and already-persisted, keeping input
/// order in both halves. A key repeated within the batch is fresh only the
/// first time. No side effects: merging into `known` is the caller's job
/// once the store confirms the write.
pub fn partition(observations: Vec<Observation>, known: &KnownRecordSet) -> Partition {
    let mut out = Partition {
        fresh: Vec::with_capacity(observations.len()),
        known: Vec::new(),
    };
    let mut batch_keys: HashSet<ObservationKey> = HashSet::with_capacity(observations.len());

    for obs in observations {
        let key = obs.key();
        if known.contains(&key) || !batch_keys.insert(key) {
            out.known.push(obs);
        } else {
            out.fresh.push(obs);
        }
    }
    out
}
