// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! The mapping run thread
//!
//! All `perform_mapping` work executes on one dedicated worker thread fed by
//! two structures: a channel of immediate actions and a timestamp-ordered
//! map of deferred ones. Every submitted action carries a monotonic counter,
//! and the scheduler remembers the most recent counter submitted per
//! mapping: an action whose counter is lower than that is stale - a newer
//! intent has preempted it - and is skipped when it surfaces. This is what
//! lets the trigger threads fire `schedule_now` at sample rate without the
//! worker ever running more than the latest evaluation.
//!
//! Mappings are registered with the scheduler (which holds the owning
//! reference while they run) and destroyed through
//! [`MappingScheduler::unregister_and_delete`], which drops the mapping on
//! the worker thread exactly once - never mid-`perform_mapping`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace, warn};

use super::{Mapping, MappingId};
use crate::scheduler::SchedulerClock;
use crate::types::Timestamp;

enum ActionKind {
    Register(Arc<dyn Mapping>),
    Perform,
    Unschedule,
    Unregister,
    UnregisterAndDelete,
    /// Wakes the worker so it re-reads the deferred queue head.
    Wake,
    Shutdown,
}

struct MappingAction {
    id: MappingId,
    counter: u64,
    kind: ActionKind,
}

struct Shared {
    later: Mutex<BTreeMap<(Timestamp, u64), MappingAction>>,
    /// Latest counter submitted per mapping; assigning and recording happen
    /// under this lock so staleness checks are race-free.
    latest: Mutex<LatestCounters>,
    registry: Mutex<HashMap<MappingId, Arc<dyn Mapping>>>,
    clock: Arc<SchedulerClock>,
}

#[derive(Default)]
struct LatestCounters {
    next: u64,
    by_mapping: HashMap<MappingId, u64>,
}

impl Shared {
    fn next_counter(&self, id: MappingId) -> u64 {
        let mut latest = self.latest.lock().unwrap();
        let counter = latest.next;
        latest.next += 1;
        let entry = latest.by_mapping.entry(id).or_insert(counter);
        *entry = (*entry).max(counter);
        counter
    }

    fn is_stale(&self, action: &MappingAction) -> bool {
        // Registration is never preempted; duplicate registration is caught
        // against the registry instead.
        if matches!(action.kind, ActionKind::Register(_)) {
            return false;
        }
        let latest = self.latest.lock().unwrap();
        match latest.by_mapping.get(&action.id) {
            Some(&newest) => action.counter < newest,
            // Counter gone: the mapping was unregistered after this action
            // was queued.
            None => true,
        }
    }
}

/// Dedicated scheduler for [`Mapping::perform_mapping`] evaluations.
pub struct MappingScheduler {
    shared: Arc<Shared>,
    sender: Sender<MappingAction>,
    receiver: Mutex<Option<Receiver<MappingAction>>>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl MappingScheduler {
    pub fn new(clock: Arc<SchedulerClock>) -> Self {
        let (sender, receiver) = unbounded();
        MappingScheduler {
            shared: Arc::new(Shared {
                later: Mutex::new(BTreeMap::new()),
                latest: Mutex::new(LatestCounters::default()),
                registry: Mutex::new(HashMap::new()),
                clock,
            }),
            sender,
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().unwrap().is_some()
    }

    /// Start the worker thread.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        let Some(receiver) = self.receiver.lock().unwrap().take() else {
            return;
        };
        let shared = self.shared.clone();
        *worker = Some(
            std::thread::Builder::new()
                .name("tactus-mapping".into())
                .spawn(move || run_worker(shared, receiver))
                .expect("failed to spawn mapping scheduler thread"),
        );
    }

    /// Signal the worker and join it. The in-flight action completes first.
    pub fn stop(&self) {
        let mut worker = self.worker.lock().unwrap();
        let Some(handle) = worker.take() else {
            return;
        };
        let _ = self.sender.send(MappingAction {
            id: 0,
            counter: u64::MAX,
            kind: ActionKind::Shutdown,
        });
        let _ = handle.join();
    }

    /// Register a mapping, transferring an owning reference to the
    /// scheduler. Registration is only honored when the mapping has no
    /// prior counter history.
    pub fn register(&self, mapping: Arc<dyn Mapping>) {
        let id = mapping.common().id();
        let counter = self.shared.next_counter(id);
        let _ = self.sender.send(MappingAction {
            id,
            counter,
            kind: ActionKind::Register(mapping),
        });
    }

    /// Queue an immediate `perform_mapping`, preempting anything earlier
    /// queued for the same mapping.
    pub fn schedule_now(&self, id: MappingId) {
        let counter = self.shared.next_counter(id);
        let _ = self.sender.send(MappingAction {
            id,
            counter,
            kind: ActionKind::Perform,
        });
    }

    /// Queue a deferred `perform_mapping` at `timestamp`.
    pub fn schedule_later(&self, id: MappingId, timestamp: Timestamp) {
        let counter = self.shared.next_counter(id);
        let became_head = {
            let mut later = self.shared.later.lock().unwrap();
            let head = later.keys().next().map(|(t, _)| *t);
            later.insert(
                (timestamp, counter),
                MappingAction {
                    id,
                    counter,
                    kind: ActionKind::Perform,
                },
            );
            head.map(|h| timestamp < h).unwrap_or(true)
        };
        if became_head {
            let _ = self.sender.send(MappingAction {
                id: 0,
                counter: u64::MAX,
                kind: ActionKind::Wake,
            });
        }
    }

    /// Invalidate all earlier actions for this mapping without touching its
    /// registration.
    pub fn unschedule(&self, id: MappingId) {
        let counter = self.shared.next_counter(id);
        let _ = self.sender.send(MappingAction {
            id,
            counter,
            kind: ActionKind::Unschedule,
        });
    }

    /// Remove a mapping from the scheduler. The factory keeps ownership.
    pub fn unregister(&self, id: MappingId) {
        let counter = self.shared.next_counter(id);
        let _ = self.sender.send(MappingAction {
            id,
            counter,
            kind: ActionKind::Unregister,
        });
    }

    /// Remove a mapping and drop the scheduler's owning reference on the
    /// worker thread, after any in-flight action completes.
    pub fn unregister_and_delete(&self, id: MappingId) {
        let counter = self.shared.next_counter(id);
        let _ = self.sender.send(MappingAction {
            id,
            counter,
            kind: ActionKind::UnregisterAndDelete,
        });
    }
}

impl Drop for MappingScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(shared: Arc<Shared>, receiver: Receiver<MappingAction>) {
    loop {
        // Drain everything in the immediate queue
        while let Ok(action) = receiver.try_recv() {
            if matches!(action.kind, ActionKind::Shutdown) {
                return;
            }
            perform_action(&shared, action);
        }

        // Run all deferred actions that are due by now
        loop {
            let due = {
                let mut later = shared.later.lock().unwrap();
                match later.keys().next().copied() {
                    Some((head, _)) if head <= shared.clock.now() => {
                        later.pop_first().map(|(_, action)| action)
                    }
                    _ => None,
                }
            };
            match due {
                Some(action) => perform_action(&shared, action),
                None => break,
            }
        }

        // Sleep until the next deferred action or the next send
        let timeout = {
            let later = shared.later.lock().unwrap();
            later
                .keys()
                .next()
                .map(|(head, _)| head.delta_since(shared.clock.now()))
        };
        let received = match timeout {
            Some(remaining) if remaining > 0 => {
                match receiver.recv_timeout(std::time::Duration::from_micros(remaining as u64)) {
                    Ok(action) => Some(action),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            Some(_) => None, // Head already due; loop around
            None => match receiver.recv() {
                Ok(action) => Some(action),
                Err(_) => return,
            },
        };
        if let Some(action) = received {
            if matches!(action.kind, ActionKind::Shutdown) {
                return;
            }
            perform_action(&shared, action);
        }
    }
}

fn perform_action(shared: &Arc<Shared>, action: MappingAction) {
    if matches!(action.kind, ActionKind::Wake) {
        return;
    }
    if shared.is_stale(&action) {
        trace!(id = action.id, counter = action.counter, "skipping stale mapping action");
        return;
    }

    match action.kind {
        ActionKind::Register(mapping) => {
            let mut registry = shared.registry.lock().unwrap();
            if registry.contains_key(&action.id) {
                warn!(id = action.id, "mapping already registered");
            } else {
                debug!(id = action.id, "registered mapping");
                registry.insert(action.id, mapping);
            }
        }
        ActionKind::Perform => {
            let mapping = shared.registry.lock().unwrap().get(&action.id).cloned();
            if let Some(mapping) = mapping {
                if let Some(next) = mapping.perform_mapping() {
                    let counter = shared.next_counter(action.id);
                    shared.later.lock().unwrap().insert(
                        (next, counter),
                        MappingAction {
                            id: action.id,
                            counter,
                            kind: ActionKind::Perform,
                        },
                    );
                }
            }
        }
        ActionKind::Unschedule => {
            // Nothing to do: taking a fresh counter already invalidated
            // everything queued earlier for this mapping.
        }
        ActionKind::Unregister => {
            shared.registry.lock().unwrap().remove(&action.id);
            shared.latest.lock().unwrap().by_mapping.remove(&action.id);
        }
        ActionKind::UnregisterAndDelete => {
            let dropped = shared.registry.lock().unwrap().remove(&action.id);
            shared.latest.lock().unwrap().by_mapping.remove(&action.id);
            debug!(id = action.id, existed = dropped.is_some(), "mapping retired");
            // The owning reference drops here, on the worker thread.
            drop(dropped);
        }
        ActionKind::Wake | ActionKind::Shutdown => {}
    }
}
