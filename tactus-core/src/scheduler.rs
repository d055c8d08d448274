// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Timed action scheduler with a virtual clock
//!
//! The scheduler owns the engine's notion of time: `start(t0)` anchors the
//! virtual clock against the wall clock, and every timestamp in the system is
//! read from [`SchedulerClock::now`]. A dedicated worker thread sleeps until
//! the earliest queued event is due (with ~1 ms of allowable early
//! execution), runs it, and reinserts it if the action asks to run again.
//!
//! Actions must not block; a panicking action takes the scheduler thread
//! down and is considered fatal.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::types::{millis, Timestamp, TimestampDelta};

/// Identifies the submitter of scheduled events so they can be unscheduled
/// as a group.
pub type ActorId = u64;

/// A scheduled callback. Returning `Some(t)` reschedules the same action at
/// `t`; `None` retires it.
pub type Action = Box<dyn FnMut() -> Option<Timestamp> + Send>;

/// How far ahead of its timestamp an event may execute.
const ALLOWABLE_ADVANCE_EXECUTION: TimestampDelta = millis(1);

struct ClockAnchor {
    wall: Instant,
    origin: Timestamp,
}

/// Shared read handle on the scheduler's virtual clock.
pub struct SchedulerClock {
    anchor: Mutex<Option<ClockAnchor>>,
}

impl SchedulerClock {
    fn new() -> Arc<Self> {
        Arc::new(SchedulerClock {
            anchor: Mutex::new(None),
        })
    }

    /// Current virtual time; [`Timestamp::ZERO`] while the scheduler is
    /// stopped.
    pub fn now(&self) -> Timestamp {
        let anchor = self.anchor.lock().unwrap();
        match anchor.as_ref() {
            Some(a) => a.origin.offset(a.wall.elapsed().as_micros() as i64),
            None => Timestamp::ZERO,
        }
    }
}

struct ScheduledEvent {
    actor: ActorId,
    action: Action,
}

#[derive(Default)]
struct SchedulerState {
    events: BTreeMap<(Timestamp, u64), ScheduledEvent>,
    next_seq: u64,
    should_exit: bool,
}

struct SchedulerShared {
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
}

/// Future-event scheduler: a min-ordered queue of `{timestamp, actor,
/// action}` served by one worker thread.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    clock: Arc<SchedulerClock>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            shared: Arc::new(SchedulerShared {
                state: Mutex::new(SchedulerState::default()),
                wakeup: Condvar::new(),
            }),
            clock: SchedulerClock::new(),

            worker: Mutex::new(None),
        }
    }

    /// Handle on the virtual clock, shareable with other components.
    pub fn clock(&self) -> Arc<SchedulerClock> {
        self.clock.clone()
    }

    pub fn current_timestamp(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().unwrap().is_some()
    }

    /// Start the worker thread with virtual time anchored at `origin`.
    pub fn start(&self, origin: Timestamp) {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return;
        }
        *self.clock.anchor.lock().unwrap() = Some(ClockAnchor {
            wall: Instant::now(),
            origin,
        });
        self.shared.state.lock().unwrap().should_exit = false;

        let shared = self.shared.clone();
        let clock = self.clock.clone();
        *worker = Some(
            std::thread::Builder::new()
                .name("tactus-scheduler".into())
                .spawn(move || run_worker(shared, clock))
                .expect("failed to spawn scheduler thread"),
        );
    }

    /// Signal the worker and join it. Queued events stay queued.
    pub fn stop(&self) {
        let mut worker = self.worker.lock().unwrap();
        let Some(handle) = worker.take() else {
            return;
        };
        {
            let mut state = self.shared.state.lock().unwrap();
            state.should_exit = true;
        }
        self.shared.wakeup.notify_all();
        let _ = handle.join();
        *self.clock.anchor.lock().unwrap() = None;
    }

    /// Queue an action for execution at `timestamp`. Overdue timestamps run
    /// at the next worker wake.
    pub fn schedule(&self, actor: ActorId, action: Action, timestamp: Timestamp) {
        let became_head = {
            let mut state = self.shared.state.lock().unwrap();
            let head = state.events.keys().next().map(|(t, _)| *t);
            let seq = state.next_seq;
            state.next_seq += 1;
            state
                .events
                .insert((timestamp, seq), ScheduledEvent { actor, action });
            head.map(|h| timestamp < h).unwrap_or(true)
        };
        if became_head {
            self.shared.wakeup.notify_all();
        }
    }

    /// Remove every queued event belonging to `actor`.
    pub fn unschedule(&self, actor: ActorId) {
        let mut state = self.shared.state.lock().unwrap();
        state.events.retain(|_, ev| ev.actor != actor);
    }

    /// Remove only `actor`'s events queued at exactly `timestamp`.
    pub fn unschedule_at(&self, actor: ActorId, timestamp: Timestamp) {
        let mut state = self.shared.state.lock().unwrap();
        state
            .events
            .retain(|(t, _), ev| !(ev.actor == actor && *t == timestamp));
    }

    /// Drop every queued event.
    pub fn clear(&self) {
        self.shared.state.lock().unwrap().events.clear();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(shared: Arc<SchedulerShared>, clock: Arc<SchedulerClock>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.should_exit {
            break;
        }

        let Some((&(head_ts, _), _)) = state.events.iter().next() else {
            state = shared.wakeup.wait(state).unwrap();
            continue;
        };

        let remaining = head_ts.delta_since(clock.now());
        if remaining > ALLOWABLE_ADVANCE_EXECUTION {
            let (guard, _) = shared
                .wakeup
                .wait_timeout(state, Duration::from_micros(remaining as u64))
                .unwrap();
            state = guard;
            continue;
        }

        // Head event is due. Pop and run it without holding the lock so
        // other threads can keep scheduling.
        let ((ts, _), mut event) = state.events.pop_first().expect("head vanished");
        drop(state);
        trace!(actor = event.actor, at = ts.micros(), "scheduler event");
        let next = (event.action)();
        state = shared.state.lock().unwrap();
        if let Some(next_ts) = next {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.events.insert((next_ts, seq), event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wait_for(predicate: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !predicate() {
            assert!(Instant::now() < deadline, "timed out waiting");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn runs_actions_in_timestamp_order() {
        let scheduler = Scheduler::new();
        scheduler.start(Timestamp::ZERO);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (actor, at) in [(2u64, 20u64), (1, 10), (3, 30)] {
            let order = order.clone();
            scheduler.schedule(
                actor,
                Box::new(move || {
                    order.lock().unwrap().push(actor);
                    None
                }),
                Timestamp::from_millis(at),
            );
        }

        wait_for(|| order.lock().unwrap().len() == 3);
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        scheduler.stop();
    }

    #[test]
    fn action_reschedules_itself_until_done() {
        let scheduler = Scheduler::new();
        scheduler.start(Timestamp::ZERO);
        let count = Arc::new(AtomicUsize::new(0));
        let clock = scheduler.clock();

        let c = count.clone();
        scheduler.schedule(
            7,
            Box::new(move || {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Some(clock.now().offset(millis(5)))
                } else {
                    None
                }
            }),
            Timestamp::ZERO,
        );

        wait_for(|| count.load(Ordering::SeqCst) == 3);
        scheduler.stop();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unschedule_removes_pending_events() {
        let scheduler = Scheduler::new();
        scheduler.start(Timestamp::ZERO);
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        scheduler.schedule(
            9,
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
                None
            }),
            Timestamp::from_millis(50),
        );
        scheduler.unschedule(9);

        std::thread::sleep(Duration::from_millis(80));
        scheduler.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn overdue_event_runs_promptly() {
        let scheduler = Scheduler::new();
        scheduler.start(Timestamp::from_millis(100));
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        // Already in the past relative to the clock origin
        scheduler.schedule(
            1,
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
                None
            }),
            Timestamp::from_millis(1),
        );

        wait_for(|| fired.load(Ordering::SeqCst) == 1);
        scheduler.stop();
    }
}
