//! Per-symbol short-circuit for byte-identical provider responses.
//!
//! Purely an optimization in front of dedup: a `true` answer only means the
//! payload is worth shaping, never that it contains new observations.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct ChangeFilter {
    last_accepted: HashMap<String, String>,
}

impl ChangeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `raw` differs from the last accepted payload for `symbol`
    /// (or there is none yet). Only a differing payload replaces the baseline.
    pub fn is_different(&mut self, symbol: &str, raw: &str) -> bool {
        match self.last_accepted.get(symbol) {
            Some(prev) if prev == raw => false,
            _ => {
                self.last_accepted.insert(symbol.to_string(), raw.to_string());
                true
            }
        }
    }

    /// Drop the baseline so the next payload is reprocessed even if identical.
    pub fn invalidate(&mut self, symbol: &str) {
        self.last_accepted.remove(symbol);
    }

    /// Forget symbols that are no longer tracked
    pub fn retain_symbols<'a>(&mut self, tracked: impl IntoIterator<Item = &'a str>) {
        let keep: std::collections::HashSet<&str> = tracked.into_iter().collect();
        self.last_accepted.retain(|symbol, _| keep.contains(symbol.as_str()));
    }

    pub fn len(&self) -> usize {
        self.last_accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_accepted.is_empty()
    }
}
