// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Trigger bus: push notifications from data producers to their listeners
//!
//! A [`TriggerSource`] fans a timestamp out to a set of listeners every time
//! its owner produces a sample. Listeners frequently add or remove
//! subscriptions from inside their own `trigger_received` callback (a mapping
//! finishing, a filter re-wiring), so edits are staged in separate add/remove
//! sets and merged at the start of the next dispatch - never mid-fan-out.
//!
//! Listeners are held weakly: dropping the listener object is enough to stop
//! deliveries, and a dead entry is swept out during the next merge.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::types::Timestamp;

/// Stable identity of a trigger source, used by listeners that subscribe to
/// more than one source to tell deliveries apart.
pub type SourceId = u64;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Receives trigger notifications from one or more [`TriggerSource`]s.
pub trait TriggerListener: Send + Sync {
    /// Called synchronously on the producing thread for every new sample.
    /// Implementations must do minimal work here and must not insert into
    /// the source that is currently dispatching to them.
    fn trigger_received(&self, source: SourceId, timestamp: Timestamp);
}

#[derive(Default)]
struct ListenerSets {
    active: Vec<Weak<dyn TriggerListener>>,
    to_add: Vec<Weak<dyn TriggerListener>>,
    to_remove: Vec<Weak<dyn TriggerListener>>,
    modified: bool,
}

impl ListenerSets {
    fn contains(list: &[Weak<dyn TriggerListener>], target: &Weak<dyn TriggerListener>) -> bool {
        list.iter().any(|w| w.ptr_eq(target))
    }

    /// Merge staged edits into the active set and sweep dead entries.
    fn flush(&mut self) {
        for add in self.to_add.drain(..) {
            if !Self::contains(&self.active, &add) {
                self.active.push(add);
            }
        }
        let removals = std::mem::take(&mut self.to_remove);
        self.active
            .retain(|w| w.strong_count() > 0 && !Self::contains(&removals, w));
        self.modified = false;
    }
}

/// The sending half of the trigger bus. Owned by every [`crate::node::Node`]
/// and by anything else that produces timestamped samples.
pub struct TriggerSource {
    id: SourceId,
    sets: Mutex<ListenerSets>,
}

impl Default for TriggerSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerSource {
    pub fn new() -> Self {
        TriggerSource {
            id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            sets: Mutex::new(ListenerSets::default()),
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    /// Stage a listener addition. Takes effect on the next dispatch.
    /// Adding the same listener twice is a no-op.
    pub fn add_listener(&self, listener: &Arc<dyn TriggerListener>) {
        let weak = Arc::downgrade(listener);
        let mut sets = self.sets.lock().unwrap();
        if ListenerSets::contains(&sets.active, &weak) && !ListenerSets::contains(&sets.to_remove, &weak) {
            return;
        }
        // Cancel a pending removal of the same listener
        sets.to_remove.retain(|w| !w.ptr_eq(&weak));
        if !ListenerSets::contains(&sets.to_add, &weak) {
            sets.to_add.push(weak);
        }
        sets.modified = true;
    }

    /// Stage a listener removal. The listener receives no calls after the
    /// dispatch in which the removal is merged.
    pub fn remove_listener(&self, listener: &Weak<dyn TriggerListener>) {
        let mut sets = self.sets.lock().unwrap();
        sets.to_add.retain(|w| !w.ptr_eq(listener));
        if ListenerSets::contains(&sets.active, listener)
            && !ListenerSets::contains(&sets.to_remove, listener)
        {
            sets.to_remove.push(listener.clone());
        }
        sets.modified = true;
    }

    pub fn clear_listeners(&self) {
        let mut sets = self.sets.lock().unwrap();
        sets.active.clear();
        sets.to_add.clear();
        sets.to_remove.clear();
        sets.modified = false;
    }

    pub fn has_listeners(&self) -> bool {
        let mut sets = self.sets.lock().unwrap();
        if sets.modified {
            sets.flush();
        }
        !sets.active.is_empty()
    }

    /// Deliver a trigger to every currently-active listener.
    ///
    /// The active set is snapshotted before the first callback runs, so
    /// listeners registering or unregistering during dispatch only affect the
    /// next dispatch, and a listener removing itself still completes its own
    /// callback safely.
    pub fn send_trigger(&self, timestamp: Timestamp) {
        let snapshot: Vec<Arc<dyn TriggerListener>> = {
            let mut sets = self.sets.lock().unwrap();
            if sets.modified {
                sets.flush();
            }
            let mut v = Vec::with_capacity(sets.active.len());
            v.extend(sets.active.iter().filter_map(Weak::upgrade));
            v
        };
        for listener in &snapshot {
            listener.trigger_received(self.id, timestamp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        count: AtomicUsize,
    }

    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Counter {
                count: AtomicUsize::new(0),
            })
        }
    }

    impl TriggerListener for Counter {
        fn trigger_received(&self, _source: SourceId, _timestamp: Timestamp) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A listener that removes itself from the source during its own callback.
    struct SelfRemover {
        source: Arc<TriggerSource>,
        count: AtomicUsize,
        this: Mutex<Option<Weak<dyn TriggerListener>>>,
    }

    impl TriggerListener for SelfRemover {
        fn trigger_received(&self, _source: SourceId, _timestamp: Timestamp) {
            self.count.fetch_add(1, Ordering::SeqCst);
            if let Some(weak) = self.this.lock().unwrap().as_ref() {
                self.source.remove_listener(weak);
            }
        }
    }

    #[test]
    fn each_listener_fires_once_per_trigger() {
        let source = TriggerSource::new();
        let a = Counter::new();
        let b = Counter::new();
        source.add_listener(&(a.clone() as Arc<dyn TriggerListener>));
        source.add_listener(&(b.clone() as Arc<dyn TriggerListener>));

        source.send_trigger(Timestamp::from_millis(1));
        source.send_trigger(Timestamp::from_millis(2));

        assert_eq!(a.count.load(Ordering::SeqCst), 2);
        assert_eq!(b.count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn duplicate_add_delivers_once() {
        let source = TriggerSource::new();
        let a = Counter::new();
        let dyn_a: Arc<dyn TriggerListener> = a.clone();
        source.add_listener(&dyn_a);
        source.add_listener(&dyn_a);

        source.send_trigger(Timestamp::ZERO);
        assert_eq!(a.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removal_during_dispatch_takes_effect_next_trigger() {
        let source = Arc::new(TriggerSource::new());
        let remover = Arc::new(SelfRemover {
            source: source.clone(),
            count: AtomicUsize::new(0),
            this: Mutex::new(None),
        });
        let dyn_remover: Arc<dyn TriggerListener> = remover.clone();
        *remover.this.lock().unwrap() = Some(Arc::downgrade(&dyn_remover));
        source.add_listener(&dyn_remover);

        // First trigger reaches the listener (and stages its removal);
        // the second must not.
        source.send_trigger(Timestamp::from_millis(1));
        source.send_trigger(Timestamp::from_millis(2));
        assert_eq!(remover.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_listener_is_swept() {
        let source = TriggerSource::new();
        let a = Counter::new();
        source.add_listener(&(a.clone() as Arc<dyn TriggerListener>));
        drop(a);
        source.send_trigger(Timestamp::ZERO);
        assert!(!source.has_listeners());
    }
}
