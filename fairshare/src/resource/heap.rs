/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Completion-date heap of the lazy update mode.
//!
//! A min-heap of `(date, sequence)` pairs with lazy deletion: updating or
//! removing an action only records its new live entry, and stale entries are
//! skipped when they reach the top.  The sequence number makes equal dates
//! pop in insertion order.
//!
//! Stale entries buried below the top are dropped by rebuilding the heap from
//! the live entries once they outnumber them.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use slotmap::SecondaryMap;

use super::ActionId;

/// Heaps smaller than this are never rebuilt.
const COMPACT_FLOOR: usize = 64;

/// Why an action sits in the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapType {
    /// The action finishes paying its latency.
    Latency,
    /// The action reaches its maximal duration.
    MaxDuration,
    /// The action completes its work.
    Normal,
}

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    date: f64,
    seq: u64,
    action: ActionId,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.date
            .total_cmp(&other.date)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Clone, Copy)]
struct Live {
    seq: u64,
    date: f64,
    kind: HeapType,
}

#[derive(Debug, Default)]
pub struct ActionHeap {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    live: SecondaryMap<ActionId, Live>,
    next_seq: u64,
}

impl ActionHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `action` at `date`, replacing any previous entry.
    pub fn update(&mut self, action: ActionId, date: f64, kind: HeapType) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.live.insert(action, Live { seq, date, kind });
        self.heap.push(Reverse(HeapEntry { date, seq, action }));
        self.compact();
    }

    pub fn remove(&mut self, action: ActionId) {
        if self.live.remove(action).is_some() {
            self.compact();
        }
    }

    pub fn contains(&self, action: ActionId) -> bool {
        self.live.contains_key(action)
    }

    /// Date and kind of the live entry of `action`.
    pub fn entry(&self, action: ActionId) -> Option<(f64, HeapType)> {
        self.live.get(action).map(|l| (l.date, l.kind))
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Rebuild from the live entries when more than half the heap is stale.
    fn compact(&mut self) {
        if self.heap.len() <= COMPACT_FLOOR || self.heap.len() <= 2 * self.live.len() {
            return;
        }
        self.heap = self
            .live
            .iter()
            .map(|(action, l)| {
                Reverse(HeapEntry {
                    date: l.date,
                    seq: l.seq,
                    action,
                })
            })
            .collect();
    }

    fn purge(&mut self) {
        while let Some(Reverse(top)) = self.heap.peek() {
            match self.live.get(top.action) {
                Some(l) if l.seq == top.seq => return,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    /// Earliest live date.
    pub fn top_date(&mut self) -> Option<f64> {
        self.purge();
        self.heap.peek().map(|Reverse(e)| e.date)
    }

    /// Pop the earliest live entry.
    pub fn pop(&mut self) -> Option<(ActionId, f64, HeapType)> {
        self.purge();
        let Reverse(top) = self.heap.pop()?;
        let live = self.live.remove(top.action)?;
        Some((top.action, top.date, live.kind))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn ids(n: usize) -> Vec<ActionId> {
        let mut map: SlotMap<ActionId, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn pops_in_date_order() {
        let a = ids(3);
        let mut heap = ActionHeap::new();
        heap.update(a[0], 3.0, HeapType::Normal);
        heap.update(a[1], 1.0, HeapType::Latency);
        heap.update(a[2], 2.0, HeapType::MaxDuration);

        assert_eq!(heap.top_date(), Some(1.0));
        assert_eq!(heap.pop(), Some((a[1], 1.0, HeapType::Latency)));
        assert_eq!(heap.pop(), Some((a[2], 2.0, HeapType::MaxDuration)));
        assert_eq!(heap.pop(), Some((a[0], 3.0, HeapType::Normal)));
        assert_eq!(heap.pop(), None);
    }

    #[test]
    fn update_replaces_previous_entry() {
        let a = ids(2);
        let mut heap = ActionHeap::new();
        heap.update(a[0], 1.0, HeapType::Normal);
        heap.update(a[1], 2.0, HeapType::Normal);
        heap.update(a[0], 5.0, HeapType::MaxDuration);

        assert_eq!(heap.len(), 2);
        assert_eq!(heap.entry(a[0]), Some((5.0, HeapType::MaxDuration)));
        assert_eq!(heap.pop().map(|e| e.0), Some(a[1]));
        assert_eq!(heap.pop().map(|e| e.0), Some(a[0]));
        assert!(heap.is_empty());
    }

    #[test]
    fn removed_entries_are_skipped() {
        let a = ids(2);
        let mut heap = ActionHeap::new();
        heap.update(a[0], 1.0, HeapType::Normal);
        heap.update(a[1], 2.0, HeapType::Normal);
        heap.remove(a[0]);

        assert!(!heap.contains(a[0]));
        assert_eq!(heap.top_date(), Some(2.0));
    }

    #[test]
    fn rescheduling_keeps_the_heap_small() {
        let a = ids(3);
        let mut heap = ActionHeap::new();
        for round in 0..1000 {
            for (i, &id) in a.iter().enumerate() {
                heap.update(id, (round * 3 + i) as f64, HeapType::Normal);
            }
        }
        assert!(heap.heap.len() <= COMPACT_FLOOR + 1);
        assert_eq!(heap.len(), 3);

        let popped: Vec<_> = std::iter::from_fn(|| heap.pop()).collect();
        assert_eq!(
            popped,
            vec![
                (a[0], 2997.0, HeapType::Normal),
                (a[1], 2998.0, HeapType::Normal),
                (a[2], 2999.0, HeapType::Normal),
            ]
        );
    }

    #[test]
    fn removals_compact_buried_entries() {
        let a = ids(200);
        let mut heap = ActionHeap::new();
        for (i, &id) in a.iter().enumerate() {
            heap.update(id, i as f64, HeapType::Normal);
        }
        // remove all but the earliest so stale entries sit below a live top
        for &id in &a[1..] {
            heap.remove(id);
        }
        assert!(heap.heap.len() <= COMPACT_FLOOR + 1);
        assert_eq!(heap.pop(), Some((a[0], 0.0, HeapType::Normal)));
        assert_eq!(heap.pop(), None);
    }

    #[test]
    fn equal_dates_pop_in_insertion_order() {
        let a = ids(3);
        let mut heap = ActionHeap::new();
        for &id in &a {
            heap.update(id, 4.0, HeapType::Normal);
        }
        let popped: Vec<_> = std::iter::from_fn(|| heap.pop().map(|e| e.0)).collect();
        assert_eq!(popped, a);
    }
}
