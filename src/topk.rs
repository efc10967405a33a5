//! Bounded "top N" maps with an amortized admission threshold.
//!
//! A [`Ranking`] holds at most `top_k` entries. Once it is full, a small
//! [`ThresholdWindow`] caches its smallest entries so that most candidates
//! can be rejected with a single comparison. The full map is only sorted
//! when the window is empty or has been invalidated by an in-place update.

use crate::error::{AggregationError, Result};
use crate::schema::RankingBounds;
use log::debug;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub total: f32,
}

impl Entry {
    pub fn new(id: impl Into<String>, total: f32) -> Self {
        Self {
            id: id.into(),
            total,
        }
    }
}

/// Rank order: larger totals first, equal totals by ascending id.
pub fn rank_order(a: &Entry, b: &Entry) -> Ordering {
    b.total.total_cmp(&a.total).then_with(|| a.id.cmp(&b.id))
}

/// Smallest entries of a full ranking, kept in rank order (minimum last).
///
/// Invariant while non-empty: `min()` is the minimum of the owning ranking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdWindow {
    entries: Vec<Entry>,
}

impl ThresholdWindow {
    pub fn min(&self) -> Option<&Entry> {
        self.entries.last()
    }

    pub fn max(&self) -> Option<&Entry> {
        self.entries.first()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Sorts the whole map and keeps its `k` smallest entries.
    pub fn rebuild_from(&mut self, amts: &BTreeMap<String, f32>, k: usize) -> Result<()> {
        if k == 0 || amts.len() < k {
            return Err(AggregationError::ThresholdUnderflow {
                required: k,
                available: amts.len(),
            });
        }

        let mut sorted: Vec<Entry> = amts
            .iter()
            .map(|(id, total)| Entry::new(id.clone(), *total))
            .collect();
        sorted.sort_by(rank_order);
        self.entries = sorted.split_off(sorted.len() - k);
        Ok(())
    }

    /// Admits `entry` (which must outrank the current minimum) and pops the
    /// minimum, returning it.
    ///
    /// An entry that outranks the whole window belongs above it, so it is
    /// not cached and the window shrinks by one. An exhausted window is
    /// rebuilt on the next admission.
    pub fn insert_evict(&mut self, entry: Entry) -> Option<Entry> {
        let outranks_window = match self.max() {
            Some(max) => rank_order(&entry, max) != Ordering::Greater,
            None => return None,
        };

        if !outranks_window {
            let pos = self
                .entries
                .binary_search_by(|held| rank_order(held, &entry))
                .unwrap_or_else(|pos| pos);
            self.entries.insert(pos, entry);
        }
        self.entries.pop()
    }

    /// Whether an in-place update of `id` to `new_total` may have moved the
    /// ranking minimum out from under the cached window.
    fn invalidated_by(&self, id: &str, new_total: f32) -> bool {
        match self.max() {
            Some(max) => {
                self.contains(id) || new_total.total_cmp(&max.total) != Ordering::Greater
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Inserted,
    Updated,
    Displaced { evicted: String },
    Rejected,
}

/// A bounded ranking map with its transaction counts and threshold window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    pub amts: BTreeMap<String, f32>,
    pub txs: BTreeMap<String, u32>,
    #[serde(default)]
    pub threshold: ThresholdWindow,
}

impl Ranking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.amts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.amts.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.amts.contains_key(id)
    }

    pub fn amount(&self, id: &str) -> Option<f32> {
        self.amts.get(id).copied()
    }

    /// Offers `id` with its cumulative `total` and transaction count.
    pub fn admit(
        &mut self,
        id: &str,
        total: f32,
        txs: u32,
        bounds: &RankingBounds,
    ) -> Result<Admission> {
        if self.amts.len() > bounds.top_k {
            self.shed_to(bounds.top_k);
        }

        if let Some(current) = self.amts.get_mut(id) {
            *current = total;
            self.txs.insert(id.to_string(), txs);
            if self.threshold.invalidated_by(id, total) {
                self.threshold.clear();
            }
            return Ok(Admission::Updated);
        }

        if self.amts.len() < bounds.top_k {
            self.amts.insert(id.to_string(), total);
            self.txs.insert(id.to_string(), txs);
            // Only a full ranking keeps a window.
            self.threshold.clear();
            return Ok(Admission::Inserted);
        }

        if self.threshold.is_empty() {
            self.threshold
                .rebuild_from(&self.amts, bounds.threshold_window)?;
        }

        let min_total = match self.threshold.min() {
            Some(min) => min.total,
            None => {
                return Err(AggregationError::ThresholdUnderflow {
                    required: bounds.threshold_window,
                    available: 0,
                })
            }
        };
        if total.total_cmp(&min_total) != Ordering::Greater {
            return Ok(Admission::Rejected);
        }

        let evicted = match self.threshold.insert_evict(Entry::new(id, total)) {
            Some(evicted) => evicted.id,
            None => {
                return Err(AggregationError::ThresholdUnderflow {
                    required: bounds.threshold_window,
                    available: 0,
                })
            }
        };
        self.amts.remove(&evicted);
        self.txs.remove(&evicted);
        self.amts.insert(id.to_string(), total);
        self.txs.insert(id.to_string(), txs);
        Ok(Admission::Displaced { evicted })
    }

    /// Drops the lowest-ranked entries until at most `top_k` remain. Only a
    /// bound lowered between runs leaves a stored map oversized.
    fn shed_to(&mut self, top_k: usize) {
        let excess = self.sorted_entries().split_off(top_k);
        for entry in &excess {
            self.amts.remove(&entry.id);
            self.txs.remove(&entry.id);
        }
        self.threshold.clear();
        debug!("Shed {} entries over the bound of {}", excess.len(), top_k);
    }

    /// Folds another ranking of the same owner into this one. Ids present
    /// in both add up; the rest compete for admission like new entries.
    pub fn absorb(&mut self, other: &Ranking, bounds: &RankingBounds) -> Result<()> {
        for (id, amount) in &other.amts {
            let txs = other.txs.get(id).copied().unwrap_or(0);
            let (total, count) = match self.amts.get(id) {
                Some(current) => (
                    current + amount,
                    self.txs.get(id).copied().unwrap_or(0) + txs,
                ),
                None => (*amount, txs),
            };
            self.admit(id, total, count, bounds)?;
        }
        Ok(())
    }

    /// All entries in rank order.
    pub fn sorted_entries(&self) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self
            .amts
            .iter()
            .map(|(id, total)| Entry::new(id.clone(), *total))
            .collect();
        entries.sort_by(rank_order);
        entries
    }

    pub fn min_entry(&self) -> Option<Entry> {
        self.sorted_entries().pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranking_of(pairs: &[(&str, f32)]) -> Ranking {
        let mut ranking = Ranking::new();
        for (id, total) in pairs {
            ranking.amts.insert(id.to_string(), *total);
            ranking.txs.insert(id.to_string(), 1);
        }
        ranking
    }

    #[test]
    fn test_insert_below_bound() {
        let bounds = RankingBounds::new(3, 2);
        let mut ranking = Ranking::new();
        assert_eq!(ranking.admit("A", 5.0, 1, &bounds).unwrap(), Admission::Inserted);
        assert_eq!(ranking.admit("B", 1.0, 1, &bounds).unwrap(), Admission::Inserted);
        assert_eq!(ranking.len(), 2);
        assert!(ranking.threshold.is_empty());
    }

    #[test]
    fn test_new_entry_displaces_minimum() {
        let bounds = RankingBounds::new(3, 2);
        let mut ranking = ranking_of(&[("A", 100.0), ("B", 150.0), ("C", 80.0)]);

        let outcome = ranking.admit("D", 120.0, 1, &bounds).unwrap();
        assert_eq!(
            outcome,
            Admission::Displaced {
                evicted: "C".to_string()
            }
        );
        assert_eq!(ranking.amount("A"), Some(100.0));
        assert_eq!(ranking.amount("B"), Some(150.0));
        assert_eq!(ranking.amount("D"), Some(120.0));
        assert!(!ranking.contains("C"));
        assert!(!ranking.txs.contains_key("C"));
    }

    #[test]
    fn test_existing_entry_update_invalidates_window() {
        let bounds = RankingBounds::new(3, 2);
        let mut ranking = ranking_of(&[("A", 100.0), ("B", 150.0), ("C", 80.0)]);
        ranking.admit("D", 120.0, 1, &bounds).unwrap();
        assert!(ranking.threshold.contains("A"));

        let outcome = ranking.admit("A", 130.0, 2, &bounds).unwrap();
        assert_eq!(outcome, Admission::Updated);
        assert!(ranking.threshold.is_empty());
        assert_eq!(ranking.amount("A"), Some(130.0));
        assert_eq!(ranking.txs.get("A"), Some(&2));
        assert_eq!(ranking.len(), 3);

        // Next admission rebuilds from the current map: D (120) is now the minimum.
        assert_eq!(ranking.admit("E", 110.0, 1, &bounds).unwrap(), Admission::Rejected);
        assert_eq!(ranking.threshold.min().map(|e| e.id.as_str()), Some("D"));
    }

    #[test]
    fn test_entry_at_threshold_is_rejected() {
        let bounds = RankingBounds::new(2, 1);
        let mut ranking = ranking_of(&[("A", 10.0), ("B", 20.0)]);
        assert_eq!(ranking.admit("C", 10.0, 1, &bounds).unwrap(), Admission::Rejected);
        assert_eq!(ranking.admit("C", 5.0, 1, &bounds).unwrap(), Admission::Rejected);
        assert!(!ranking.contains("C"));
    }

    #[test]
    fn test_window_shrinks_then_rebuilds() {
        let bounds = RankingBounds::new(4, 2);
        let mut ranking = ranking_of(&[("A", 1.0), ("B", 2.0), ("C", 3.0), ("D", 4.0)]);

        // Outranks the whole window [B, A]: A is evicted, window keeps only B.
        ranking.admit("E", 50.0, 1, &bounds).unwrap();
        assert_eq!(ranking.threshold.len(), 1);
        assert_eq!(ranking.threshold.min().map(|e| e.id.as_str()), Some("B"));

        // Exhausts the window.
        ranking.admit("F", 60.0, 1, &bounds).unwrap();
        assert!(ranking.threshold.is_empty());
        assert!(!ranking.contains("B"));

        // Rebuild picks up the current two smallest.
        ranking.admit("G", 3.5, 1, &bounds).unwrap();
        assert!(!ranking.contains("C"));
        let ids: Vec<String> = ranking.sorted_entries().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["F", "E", "D", "G"]);
    }

    #[test]
    fn test_entry_within_window_is_sorted_in() {
        let bounds = RankingBounds::new(4, 3);
        let mut ranking = ranking_of(&[("A", 10.0), ("B", 20.0), ("C", 30.0), ("D", 40.0)]);

        ranking.admit("E", 15.0, 1, &bounds).unwrap();
        let window: Vec<&str> = ranking
            .threshold
            .entries()
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(window, vec!["C", "B", "E"]);
        assert!(!ranking.contains("A"));
    }

    #[test]
    fn test_rebuild_underflow() {
        let mut window = ThresholdWindow::default();
        let mut amts = BTreeMap::new();
        amts.insert("A".to_string(), 1.0);
        assert!(matches!(
            window.rebuild_from(&amts, 3),
            Err(AggregationError::ThresholdUnderflow {
                required: 3,
                available: 1
            })
        ));
    }

    #[test]
    fn test_ties_order_by_id() {
        let ranking = ranking_of(&[("B", 5.0), ("A", 5.0), ("C", 7.0)]);
        let ids: Vec<String> = ranking.sorted_entries().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["C", "A", "B"]);
    }

    #[test]
    fn test_lowered_bound_sheds_excess() {
        let mut ranking = ranking_of(&[("A", 1.0), ("B", 2.0), ("C", 3.0), ("D", 4.0)]);
        let bounds = RankingBounds::new(3, 1);
        ranking.admit("E", 10.0, 1, &bounds).unwrap();
        assert_eq!(ranking.len(), 3);
        assert!(ranking.contains("E"));
        assert!(ranking.contains("D"));
        assert!(ranking.contains("C"));
    }

    #[test]
    fn test_lowered_bound_sheds_on_update_and_reject() {
        let bounds = RankingBounds::new(3, 2);

        let mut updated = ranking_of(&[("A", 1.0), ("B", 2.0), ("C", 3.0), ("D", 4.0), ("E", 5.0)]);
        assert_eq!(updated.admit("D", 9.0, 2, &bounds).unwrap(), Admission::Updated);
        assert_eq!(updated.len(), 3);
        let ids: Vec<String> = updated.sorted_entries().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["D", "E", "C"]);
        assert_eq!(updated.txs.len(), 3);

        let mut rejected = ranking_of(&[("A", 1.0), ("B", 2.0), ("C", 3.0), ("D", 4.0), ("E", 5.0)]);
        assert_eq!(rejected.admit("F", 0.5, 1, &bounds).unwrap(), Admission::Rejected);
        assert_eq!(rejected.len(), 3);
        assert!(!rejected.contains("B"));
    }

    #[test]
    fn test_absorb_adds_shared_and_admits_new() {
        let bounds = RankingBounds::new(3, 2);
        let mut ranking = ranking_of(&[("A", 100.0), ("B", 50.0), ("C", 20.0)]);
        let other = ranking_of(&[("C", 60.0), ("D", 30.0), ("E", 10.0)]);

        ranking.absorb(&other, &bounds).unwrap();
        assert_eq!(ranking.amount("C"), Some(80.0));
        assert_eq!(ranking.txs.get("C"), Some(&2));
        // D and E fall below the minimum, B at 50.
        let ids: Vec<String> = ranking.sorted_entries().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["A", "C", "B"]);
    }
}
