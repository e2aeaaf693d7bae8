#![forbid(unsafe_code)]

//! Deliverable event streams, event generators and sorted-sequence merging.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use cable_core::{CellLid, SpikeEvent};
use serde::{Deserialize, Serialize};

/// Resolved delivery address of an event: a mechanism instance slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHandle {
    pub mech_id: u32,
    pub mech_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeliverableEvent {
    pub time: f64,
    pub weight: f64,
    pub handle: TargetHandle,
}

/// Per-mechanism time-sorted event streams with a shared mark/drop cursor.
///
/// `mark_until_after` is inclusive on the upper bound so end-of-step events
/// are delivered before the next matrix solve.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventStreams {
    streams: Vec<Stream>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Stream {
    mech_id: u32,
    ev_time: Vec<f64>,
    ev_data: Vec<(u32, f64)>,
    begin: usize,
    mark: usize,
}

impl EventStreams {
    pub fn init(&mut self, mut staged: Vec<DeliverableEvent>) {
        staged.sort_by(|a, b| {
            a.handle
                .mech_id
                .cmp(&b.handle.mech_id)
                .then(a.time.total_cmp(&b.time))
                .then(a.handle.mech_index.cmp(&b.handle.mech_index))
        });

        self.streams.clear();
        for ev in staged {
            if self
                .streams
                .last()
                .map_or(true, |s| s.mech_id != ev.handle.mech_id)
            {
                self.streams.push(Stream {
                    mech_id: ev.handle.mech_id,
                    ev_time: Vec::new(),
                    ev_data: Vec::new(),
                    begin: 0,
                    mark: 0,
                });
            }
            let stream = self.streams.last_mut().expect("stream exists");
            stream.ev_time.push(ev.time);
            stream.ev_data.push((ev.handle.mech_index, ev.weight));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.streams.iter().all(|s| s.begin == s.ev_time.len())
    }

    /// Advances the cursor to include all events with `time <= t`.
    pub fn mark_until_after(&mut self, t: f64) {
        for s in &mut self.streams {
            while s.mark < s.ev_time.len() && s.ev_time[s.mark] <= t {
                s.mark += 1;
            }
        }
    }

    pub fn marked_events(&self, mech_id: u32) -> &[(u32, f64)] {
        self.streams
            .iter()
            .find(|s| s.mech_id == mech_id)
            .map(|s| &s.ev_data[s.begin..s.mark])
            .unwrap_or(&[])
    }

    pub fn drop_marked_events(&mut self) {
        for s in &mut self.streams {
            s.begin = s.mark;
        }
    }

    /// Earliest pending event time if it precedes `t_to`, else `t_to`.
    pub fn event_time_if_before(&self, t_to: f64) -> f64 {
        let mut t = t_to;
        for s in &self.streams {
            if s.begin < s.ev_time.len() {
                let next = s.ev_time[s.begin];
                if next < t {
                    t = next;
                }
            }
        }
        t
    }

    pub fn pending(&self) -> Vec<DeliverableEvent> {
        let mut out = Vec::new();
        for s in &self.streams {
            for i in s.begin..s.ev_time.len() {
                out.push(DeliverableEvent {
                    time: s.ev_time[i],
                    weight: s.ev_data[i].1,
                    handle: TargetHandle {
                        mech_id: s.mech_id,
                        mech_index: s.ev_data[i].0,
                    },
                });
            }
        }
        out
    }
}

/// Time schedule for an event generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Schedule {
    /// Events at `t0, t0+dt, …` up to an optional end time.
    Regular { t0: f64, dt: f64, t1: Option<f64> },
    /// Explicit sorted event time list.
    Explicit { times: Vec<f64> },
}

impl Schedule {
    /// Event times in `[t_from, t_to)`.
    pub fn events(&self, t_from: f64, t_to: f64) -> Vec<f64> {
        match self {
            Schedule::Regular { t0, dt, t1 } => {
                assert!(*dt > 0.0, "regular schedule needs positive dt");
                let hi = t1.map_or(t_to, |t1| t1.min(t_to));
                let mut out = Vec::new();
                if hi <= *t0 {
                    return out;
                }
                let mut k = ((t_from - t0) / dt).ceil().max(0.0) as u64;
                loop {
                    let t = t0 + k as f64 * dt;
                    if t >= hi {
                        break;
                    }
                    if t >= t_from {
                        out.push(t);
                    }
                    k += 1;
                }
                out
            }
            Schedule::Explicit { times } => times
                .iter()
                .copied()
                .filter(|&t| t >= t_from && t < t_to)
                .collect(),
        }
    }
}

/// Generates weighted events for one cell-local target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventGenerator {
    pub target: CellLid,
    pub weight: f32,
    pub schedule: Schedule,
}

impl EventGenerator {
    pub fn events(&self, t_from: f64, t_to: f64) -> Vec<SpikeEvent> {
        self.schedule
            .events(t_from, t_to)
            .into_iter()
            .map(|time| SpikeEvent {
                target: self.target,
                time,
                weight: self.weight,
            })
            .collect()
    }
}

struct HeapEntry<'a> {
    head: &'a SpikeEvent,
    rest: &'a [SpikeEvent],
    source: usize,
}

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry<'_> {}

impl Ord for HeapEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; ties broken by source order for stability.
        other
            .head
            .cmp(self.head)
            .then(other.source.cmp(&self.source))
    }
}

impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn linear_merge_events(a: &[SpikeEvent], b: &[SpikeEvent], out: &mut Vec<SpikeEvent>) {
    let mut ai = 0;
    let mut bi = 0;
    while ai < a.len() && bi < b.len() {
        if b[bi] < a[ai] {
            out.push(b[bi]);
            bi += 1;
        } else {
            out.push(a[ai]);
            ai += 1;
        }
    }
    out.extend_from_slice(&a[ai..]);
    out.extend_from_slice(&b[bi..]);
}

fn pqueue_merge_events(sources: &[&[SpikeEvent]], out: &mut Vec<SpikeEvent>) {
    let mut heap = BinaryHeap::with_capacity(sources.len());
    for (source, s) in sources.iter().enumerate() {
        if let Some((head, rest)) = s.split_first() {
            heap.push(HeapEntry { head, rest, source });
        }
    }
    while let Some(HeapEntry { head, rest, source }) = heap.pop() {
        out.push(*head);
        if let Some((h, r)) = rest.split_first() {
            heap.push(HeapEntry {
                head: h,
                rest: r,
                source,
            });
        }
    }
}

/// Merges sorted event sequences into a sorted output sequence.
pub fn merge_events(sources: &[&[SpikeEvent]], out: &mut Vec<SpikeEvent>) {
    out.clear();
    out.reserve(sources.iter().map(|s| s.len()).sum());
    match sources {
        [] => {}
        [only] => out.extend_from_slice(only),
        [a, b] => linear_merge_events(a, b, out),
        many => pqueue_merge_events(many, out),
    }
    debug_assert!(out.windows(2).all(|w| w[0] <= w[1]));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(mech_id: u32, mech_index: u32, time: f64) -> DeliverableEvent {
        DeliverableEvent {
            time,
            weight: 1.0,
            handle: TargetHandle {
                mech_id,
                mech_index,
            },
        }
    }

    #[test]
    fn mark_is_inclusive_on_upper_bound() {
        let mut streams = EventStreams::default();
        streams.init(vec![ev(0, 0, 1.0), ev(0, 1, 2.0), ev(0, 2, 3.0)]);
        streams.mark_until_after(2.0);
        assert_eq!(streams.marked_events(0), &[(0, 1.0), (1, 1.0)]);
        streams.drop_marked_events();
        assert_eq!(streams.marked_events(0), &[]);
        assert!(!streams.is_empty());
    }

    #[test]
    fn streams_partition_by_mechanism() {
        let mut streams = EventStreams::default();
        streams.init(vec![ev(1, 0, 2.0), ev(0, 0, 1.0), ev(1, 1, 0.5)]);
        streams.mark_until_after(10.0);
        assert_eq!(streams.marked_events(0).len(), 1);
        assert_eq!(streams.marked_events(1), &[(1, 1.0), (0, 1.0)]);
    }

    #[test]
    fn event_time_clamps_step_end() {
        let mut streams = EventStreams::default();
        streams.init(vec![ev(0, 0, 1.5)]);
        assert_eq!(streams.event_time_if_before(2.0), 1.5);
        assert_eq!(streams.event_time_if_before(1.0), 1.0);
        streams.mark_until_after(1.5);
        streams.drop_marked_events();
        assert_eq!(streams.event_time_if_before(2.0), 2.0);
        assert!(streams.is_empty());
    }

    #[test]
    fn regular_schedule_generates_half_open_range() {
        let s = Schedule::Regular {
            t0: 0.0,
            dt: 0.5,
            t1: None,
        };
        assert_eq!(s.events(1.0, 2.5), vec![1.0, 1.5, 2.0]);
        let bounded = Schedule::Regular {
            t0: 0.0,
            dt: 0.5,
            t1: Some(1.5),
        };
        assert_eq!(bounded.events(0.0, 10.0), vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn merge_events_is_stable_and_sorted() {
        use cable_core::CellLid;
        let mk = |target: u32, time: f64| SpikeEvent {
            target: CellLid(target),
            time,
            weight: 0.0,
        };
        let a = vec![mk(0, 1.0), mk(0, 3.0)];
        let b = vec![mk(1, 1.0), mk(0, 2.0)];
        let c = vec![mk(2, 0.5)];

        let mut two = Vec::new();
        merge_events(&[&a, &b], &mut two);
        assert_eq!(two, vec![mk(0, 1.0), mk(1, 1.0), mk(0, 2.0), mk(0, 3.0)]);

        let mut three = Vec::new();
        merge_events(&[&a, &b, &c], &mut three);
        assert_eq!(three.len(), 5);
        assert!(three.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(three[0], mk(2, 0.5));
    }
}
