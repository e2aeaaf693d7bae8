//! Resolution of `(gid, label)` pairs to cell-local lids.
//!
//! A label may cover several placement ranges; multivalent labels are
//! resolved round-robin in connection order so repeated connections onto the
//! same label fan out across its placements.

use std::collections::BTreeMap;

use cable_core::{CellGid, CellLid};

#[derive(Debug, Clone, Default)]
pub struct LabelResolutionMap {
    ranges: BTreeMap<(CellGid, String), Vec<(u32, u32)>>,
    cursor: BTreeMap<(CellGid, String), usize>,
}

impl LabelResolutionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, gid: CellGid, label: &str, begin: u32, end: u32) {
        if begin < end {
            self.ranges
                .entry((gid, label.to_string()))
                .or_default()
                .push((begin, end));
        }
    }

    pub fn count(&self, gid: CellGid, label: &str) -> usize {
        self.ranges
            .get(&(gid, label.to_string()))
            .map_or(0, |rs| rs.iter().map(|(b, e)| (e - b) as usize).sum())
    }

    /// Round-robin resolution over the label's placements.
    pub fn resolve(&mut self, gid: CellGid, label: &str) -> Option<CellLid> {
        let key = (gid, label.to_string());
        let ranges = self.ranges.get(&key)?;
        let total: usize = ranges.iter().map(|(b, e)| (e - b) as usize).sum();
        if total == 0 {
            return None;
        }
        let cursor = self.cursor.entry(key).or_insert(0);
        let mut k = *cursor % total;
        *cursor = (*cursor + 1) % total;

        for &(begin, end) in ranges {
            let len = (end - begin) as usize;
            if k < len {
                return Some(CellLid(begin + k as u32));
            }
            k -= len;
        }
        None
    }

    /// Resolution for labels expected to name exactly one placement.
    pub fn resolve_univalent(&self, gid: CellGid, label: &str) -> Option<CellLid> {
        let ranges = self.ranges.get(&(gid, label.to_string()))?;
        match ranges.as_slice() {
            [(begin, end)] if end - begin == 1 => Some(CellLid(*begin)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_over_ranges() {
        let mut map = LabelResolutionMap::new();
        let gid = CellGid(3);
        map.add(gid, "syn", 0, 2);
        map.add(gid, "syn", 5, 6);

        let picks: Vec<u32> = (0..4).map(|_| map.resolve(gid, "syn").unwrap().0).collect();
        assert_eq!(picks, vec![0, 1, 5, 0]);
    }

    #[test]
    fn univalent_rejects_multivalent_labels() {
        let mut map = LabelResolutionMap::new();
        let gid = CellGid(0);
        map.add(gid, "det", 1, 2);
        map.add(gid, "many", 0, 3);
        assert_eq!(map.resolve_univalent(gid, "det"), Some(CellLid(1)));
        assert_eq!(map.resolve_univalent(gid, "many"), None);
        assert_eq!(map.resolve_univalent(gid, "missing"), None);
    }

    #[test]
    fn unknown_label_is_none() {
        let mut map = LabelResolutionMap::new();
        assert!(map.resolve(CellGid(0), "nope").is_none());
    }
}
