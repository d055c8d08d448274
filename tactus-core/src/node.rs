// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Timestamped ring buffer with trigger fan-out
//!
//! [`Node<T>`] is the universal data-plane primitive: a bounded sequence of
//! `(index, timestamp, value)` samples whose indices increase monotonically
//! for the lifetime of the buffer. Only the last `capacity` samples are
//! physically stored; earlier indices are lawfully gone, and an index never
//! changes meaning while its sample is still held.
//!
//! Every insert synchronously notifies the node's trigger listeners on the
//! inserting thread before `insert` returns. Listener registration changes
//! made during a dispatch take effect on the next insert (see
//! [`crate::trigger`]).
//!
//! A single internal mutex protects the buffer contents: point accessors
//! lock per call, and [`Node::read`] hands out a guard for multi-sample
//! scans (state trackers walking backwards through history).

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::trigger::{SourceId, TriggerListener, TriggerSource};
use crate::types::Timestamp;

/// Values that support linear interpolation between adjacent samples.
pub trait Interpolable: Clone {
    fn lerp(a: &Self, b: &Self, frac: f64) -> Self;
}

impl Interpolable for f64 {
    fn lerp(a: &Self, b: &Self, frac: f64) -> Self {
        a * (1.0 - frac) + b * frac
    }
}

impl Interpolable for f32 {
    fn lerp(a: &Self, b: &Self, frac: f64) -> Self {
        (*a as f64 * (1.0 - frac) + *b as f64 * frac) as f32
    }
}

struct NodeInner<T> {
    values: std::collections::VecDeque<T>,
    timestamps: std::collections::VecDeque<Timestamp>,
    capacity: usize,
    first_index: usize,
}

impl<T> NodeInner<T> {
    fn begin_index(&self) -> usize {
        self.first_index
    }

    fn end_index(&self) -> usize {
        self.first_index + self.values.len()
    }

    fn slot(&self, index: usize) -> Option<usize> {
        if index < self.first_index || index >= self.end_index() {
            None
        } else {
            Some(index - self.first_index)
        }
    }
}

/// A bounded, timestamped, monotonically indexed ring buffer with trigger
/// dispatch on insert.
pub struct Node<T> {
    source: TriggerSource,
    inner: Mutex<NodeInner<T>>,
}

impl<T: Clone> Node<T> {
    /// Create a node holding at most `capacity` samples (minimum 1).
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Node {
            source: TriggerSource::new(),
            inner: Mutex::new(NodeInner {
                values: std::collections::VecDeque::with_capacity(capacity),
                timestamps: std::collections::VecDeque::with_capacity(capacity),
                capacity,
                first_index: 0,
            }),
        })
    }

    /// The identity this node uses when dispatching triggers.
    pub fn source_id(&self) -> SourceId {
        self.source.id()
    }

    /// Append a sample and notify all currently-registered listeners.
    ///
    /// When the buffer is full the earliest sample is dropped and
    /// `begin_index` advances by one. The trigger fan-out runs on the calling
    /// thread after the buffer mutex has been released.
    pub fn insert(&self, value: T, timestamp: Timestamp) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.values.len() == inner.capacity {
                inner.values.pop_front();
                inner.timestamps.pop_front();
                inner.first_index += 1;
            }
            inner.values.push_back(value);
            inner.timestamps.push_back(timestamp);
        }
        self.source.send_trigger(timestamp);
    }

    /// Empty the buffer. Listeners stay subscribed; indices restart at 0.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.values.clear();
        inner.timestamps.clear();
        inner.first_index = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    /// Index of the earliest sample still held.
    pub fn begin_index(&self) -> usize {
        self.inner.lock().unwrap().begin_index()
    }

    /// Index one past the most recent sample.
    pub fn end_index(&self) -> usize {
        self.inner.lock().unwrap().end_index()
    }

    pub fn latest(&self) -> Option<T> {
        self.inner.lock().unwrap().values.back().cloned()
    }

    pub fn earliest(&self) -> Option<T> {
        self.inner.lock().unwrap().values.front().cloned()
    }

    pub fn get(&self, index: usize) -> Option<T> {
        let inner = self.inner.lock().unwrap();
        inner.slot(index).map(|s| inner.values[s].clone())
    }

    pub fn latest_timestamp(&self) -> Option<Timestamp> {
        self.inner.lock().unwrap().timestamps.back().copied()
    }

    pub fn earliest_timestamp(&self) -> Option<Timestamp> {
        self.inner.lock().unwrap().timestamps.front().copied()
    }

    pub fn timestamp_at(&self, index: usize) -> Option<Timestamp> {
        let inner = self.inner.lock().unwrap();
        inner.slot(index).map(|s| inner.timestamps[s])
    }

    /// Index of the sample whose timestamp is closest to `t`.
    pub fn index_nearest_to(&self, t: Timestamp) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        NodeView { inner: &*inner }.index_nearest_to(t)
    }

    /// Index of the latest sample with timestamp <= `t` (clamped to the
    /// earliest sample if all timestamps exceed `t`).
    pub fn index_nearest_before(&self, t: Timestamp) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        NodeView { inner: &*inner }.index_nearest_before(t)
    }

    /// Index of the earliest sample with timestamp > `t` (clamped to the
    /// latest sample if none exceed `t`).
    pub fn index_nearest_after(&self, t: Timestamp) -> Option<usize> {
        let inner = self.inner.lock().unwrap();
        NodeView { inner: &*inner }.index_nearest_after(t)
    }

    /// Acquire the buffer mutex for a multi-sample scan.
    pub fn read(&self) -> NodeReadGuard<'_, T> {
        NodeReadGuard {
            guard: self.inner.lock().unwrap(),
        }
    }

    /// Stage a listener subscription for this node's triggers.
    /// Subscribing a node to itself is a no-op.
    pub fn subscribe(self: &Arc<Self>, listener: &Arc<dyn TriggerListener>) {
        if Arc::as_ptr(listener) as *const u8 == Arc::as_ptr(self) as *const u8 {
            return;
        }
        self.source.add_listener(listener);
    }

    /// Stage removal of a previously subscribed listener.
    pub fn unsubscribe(&self, listener: &Weak<dyn TriggerListener>) {
        self.source.remove_listener(listener);
    }

    pub fn has_listeners(&self) -> bool {
        self.source.has_listeners()
    }
}

impl<T: Interpolable> Node<T> {
    /// Read at a fractional index with linear interpolation.
    ///
    /// The index is clamped into `[begin_index, end_index - 1]`, so reading
    /// past either end returns the boundary sample. Integer indices return
    /// the stored sample exactly.
    pub fn interpolate(&self, index: f64) -> Option<T> {
        let inner = self.inner.lock().unwrap();
        if inner.values.is_empty() {
            return None;
        }
        let begin = inner.begin_index() as f64;
        let last = (inner.end_index() - 1) as f64;
        let index = index.clamp(begin, last);
        let before = index.floor() as usize;
        let frac = index - before as f64;
        let a_slot = inner.slot(before)?;
        if frac == 0.0 || before as f64 >= last {
            return Some(inner.values[a_slot].clone());
        }
        let b_slot = inner.slot(before + 1)?;
        Some(T::lerp(&inner.values[a_slot], &inner.values[b_slot], frac))
    }
}

struct NodeView<'a, T> {
    inner: &'a NodeInner<T>,
}

impl<T> NodeView<'_, T> {
    fn index_first_after(&self, t: Timestamp) -> Option<usize> {
        self.inner.timestamps.iter().position(|&ts| ts > t)
    }

    fn index_nearest_before(&self, t: Timestamp) -> Option<usize> {
        if self.inner.timestamps.is_empty() {
            return None;
        }
        match self.index_first_after(t) {
            None => Some(self.inner.end_index() - 1),
            Some(0) => Some(self.inner.begin_index()),
            Some(pos) => Some(self.inner.begin_index() + pos - 1),
        }
    }

    fn index_nearest_after(&self, t: Timestamp) -> Option<usize> {
        if self.inner.timestamps.is_empty() {
            return None;
        }
        let pos = self
            .index_first_after(t)
            .unwrap_or(self.inner.timestamps.len() - 1)
            .min(self.inner.timestamps.len() - 1);
        Some(self.inner.begin_index() + pos)
    }

    fn index_nearest_to(&self, t: Timestamp) -> Option<usize> {
        if self.inner.timestamps.is_empty() {
            return None;
        }
        match self.index_first_after(t) {
            None => Some(self.inner.end_index() - 1),
            Some(0) => Some(self.inner.begin_index()),
            Some(pos) => {
                let after = self.inner.timestamps[pos].delta_since(t);
                let before = t.delta_since(self.inner.timestamps[pos - 1]);
                if after < before {
                    Some(self.inner.begin_index() + pos)
                } else {
                    Some(self.inner.begin_index() + pos - 1)
                }
            }
        }
    }
}

/// Guard over a locked node, for scans that need a consistent view.
pub struct NodeReadGuard<'a, T> {
    guard: MutexGuard<'a, NodeInner<T>>,
}

impl<T> NodeReadGuard<'_, T> {
    pub fn len(&self) -> usize {
        self.guard.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.values.is_empty()
    }

    pub fn begin_index(&self) -> usize {
        self.guard.begin_index()
    }

    pub fn end_index(&self) -> usize {
        self.guard.end_index()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.guard.slot(index).map(|s| &self.guard.values[s])
    }

    pub fn timestamp_at(&self, index: usize) -> Option<Timestamp> {
        self.guard.slot(index).map(|s| self.guard.timestamps[s])
    }

    pub fn latest(&self) -> Option<&T> {
        self.guard.values.back()
    }

    pub fn latest_timestamp(&self) -> Option<Timestamp> {
        self.guard.timestamps.back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::SourceId;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn indices_are_monotonic_and_size_bounded() {
        let node: Arc<Node<f64>> = Node::with_capacity(4);
        for i in 0..10u64 {
            node.insert(i as f64, Timestamp::from_millis(i));
            assert_eq!(node.end_index(), i as usize + 1);
            assert_eq!(node.len(), (i as usize + 1).min(4));
        }
        assert_eq!(node.begin_index(), 6);
        // Early indices are gone, recent ones readable
        assert_eq!(node.get(5), None);
        assert_eq!(node.get(6), Some(6.0));
        assert_eq!(node.get(9), Some(9.0));
    }

    #[test]
    fn clear_keeps_listeners() {
        struct Tally(AtomicUsize);
        impl TriggerListener for Tally {
            fn trigger_received(&self, _s: SourceId, _t: Timestamp) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let node: Arc<Node<f64>> = Node::with_capacity(4);
        let tally = Arc::new(Tally(AtomicUsize::new(0)));
        node.subscribe(&(tally.clone() as Arc<dyn TriggerListener>));

        node.insert(1.0, Timestamp::ZERO);
        node.clear();
        assert!(node.is_empty());
        node.insert(2.0, Timestamp::from_millis(1));
        assert_eq!(tally.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn interpolation_blends_and_clamps() {
        let node: Arc<Node<f64>> = Node::with_capacity(8);
        node.insert(0.0, Timestamp::from_millis(0));
        node.insert(1.0, Timestamp::from_millis(1));
        node.insert(3.0, Timestamp::from_millis(2));

        // Integer index returns the exact value
        assert_eq!(node.interpolate(1.0), Some(1.0));
        // Fractional index blends neighbours
        let v = node.interpolate(1.5).unwrap();
        assert!((v - 2.0).abs() < 1e-12);
        // Past the end clamps to the last sample; before the start clamps too
        assert_eq!(node.interpolate(10.0), Some(3.0));
        assert_eq!(node.interpolate(-3.0), Some(0.0));
    }

    #[test]
    fn nearest_index_lookups() {
        let node: Arc<Node<f64>> = Node::with_capacity(8);
        for i in 0..5u64 {
            node.insert(i as f64, Timestamp::from_millis(i * 10));
        }
        assert_eq!(node.index_nearest_before(Timestamp::from_millis(25)), Some(2));
        assert_eq!(node.index_nearest_after(Timestamp::from_millis(25)), Some(3));
        assert_eq!(node.index_nearest_to(Timestamp::from_millis(24)), Some(2));
        assert_eq!(node.index_nearest_to(Timestamp::from_millis(26)), Some(3));
        // Beyond either end clamps
        assert_eq!(node.index_nearest_before(Timestamp::ZERO), Some(0));
        assert_eq!(node.index_nearest_after(Timestamp::from_millis(500)), Some(4));
    }

    #[test]
    fn listener_added_during_dispatch_fires_next_insert() {
        struct AddOnFirst {
            node: Arc<Node<f64>>,
            other: Arc<Tally>,
        }
        struct Tally(AtomicUsize);
        impl TriggerListener for Tally {
            fn trigger_received(&self, _s: SourceId, _t: Timestamp) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        impl TriggerListener for AddOnFirst {
            fn trigger_received(&self, _s: SourceId, _t: Timestamp) {
                self.node
                    .subscribe(&(self.other.clone() as Arc<dyn TriggerListener>));
            }
        }

        let node: Arc<Node<f64>> = Node::with_capacity(4);
        let tally = Arc::new(Tally(AtomicUsize::new(0)));
        let adder = Arc::new(AddOnFirst {
            node: node.clone(),
            other: tally.clone(),
        });
        node.subscribe(&(adder.clone() as Arc<dyn TriggerListener>));

        node.insert(1.0, Timestamp::from_millis(1));
        // Deferred: the tally listener must not have seen the insert that
        // registered it.
        assert_eq!(tally.0.load(Ordering::SeqCst), 0);
        node.insert(2.0, Timestamp::from_millis(2));
        assert_eq!(tally.0.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #[test]
        fn end_index_always_equals_insert_count(lens in proptest::collection::vec(0.0f64..1.0, 1..200)) {
            let node: Arc<Node<f64>> = Node::with_capacity(16);
            for (i, v) in lens.iter().enumerate() {
                node.insert(*v, Timestamp::from_micros(i as u64));
            }
            prop_assert_eq!(node.end_index(), lens.len());
            prop_assert_eq!(node.len(), lens.len().min(16));
            prop_assert!(node.begin_index() <= node.end_index());
        }
    }
}
