// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Counter-preemption and lifecycle tests for the mapping run thread.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tactus_core::keyboard::PianoKeyboard;
use tactus_core::mapping::scheduler::MappingScheduler;
use tactus_core::mapping::{Mapping, MappingCommon};
use tactus_core::node::Node;
use tactus_core::scheduler::Scheduler;
use tactus_core::tracker::KeyPositionTracker;
use tactus_core::trigger::{SourceId, TriggerListener};
use tactus_core::types::{millis, Timestamp};

struct StubMapping {
    common: MappingCommon,
    performed: AtomicUsize,
    reschedule_once: AtomicBool,
    dropped: Arc<AtomicBool>,
    clock: Arc<tactus_core::scheduler::SchedulerClock>,
}

impl StubMapping {
    fn new(
        keyboard: &Arc<PianoKeyboard>,
        clock: Arc<tactus_core::scheduler::SchedulerClock>,
        reschedule_once: bool,
    ) -> (Arc<Self>, Arc<AtomicBool>) {
        let position: Arc<Node<f64>> = Node::with_capacity(16);
        let touch = Node::with_capacity(16);
        let tracker = KeyPositionTracker::new(16, position.clone());
        let dropped = Arc::new(AtomicBool::new(false));
        let stub = Arc::new(StubMapping {
            common: MappingCommon::new(keyboard, 60, touch, position, tracker),
            performed: AtomicUsize::new(0),
            reschedule_once: AtomicBool::new(reschedule_once),
            dropped: dropped.clone(),
            clock,
        });
        (stub, dropped)
    }
}

impl TriggerListener for StubMapping {
    fn trigger_received(&self, _source: SourceId, _timestamp: Timestamp) {}
}

impl Mapping for StubMapping {
    fn common(&self) -> &MappingCommon {
        &self.common
    }

    fn perform_mapping(&self) -> Option<Timestamp> {
        self.performed.fetch_add(1, Ordering::SeqCst);
        if self.reschedule_once.swap(false, Ordering::SeqCst) {
            Some(self.clock.now().offset(millis(10)))
        } else {
            None
        }
    }
}

impl Drop for StubMapping {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

fn wait_for(predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn test_rig() -> (Arc<PianoKeyboard>, Scheduler, MappingScheduler) {
    let keyboard = PianoKeyboard::new();
    let clock_source = Scheduler::new();
    clock_source.start(Timestamp::ZERO);
    let mapping_scheduler = MappingScheduler::new(clock_source.clock());
    (keyboard, clock_source, mapping_scheduler)
}

#[test]
fn newer_immediate_action_preempts_older_one() {
    let (keyboard, _clock_source, scheduler) = test_rig();
    let clock = _clock_source.clock();
    let (stub, _) = StubMapping::new(&keyboard, clock, false);
    let id = stub.common().id();

    // Queue everything before the worker starts so both immediate actions
    // are pending together; only the most recent may run.
    scheduler.register(stub.clone() as Arc<dyn Mapping>);
    scheduler.schedule_now(id);
    scheduler.schedule_now(id);
    scheduler.start();

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(
        stub.performed.load(Ordering::SeqCst),
        1,
        "A1 must be skipped; only A2 executes"
    );
    scheduler.stop();
}

#[test]
fn returning_a_timestamp_reschedules_exactly_once() {
    let (keyboard, _clock_source, scheduler) = test_rig();
    let clock = _clock_source.clock();
    let (stub, _) = StubMapping::new(&keyboard, clock, true);
    let id = stub.common().id();

    scheduler.start();
    scheduler.register(stub.clone() as Arc<dyn Mapping>);
    scheduler.schedule_now(id);

    // First run reschedules 10 ms out; second run returns None
    wait_for(|| stub.performed.load(Ordering::SeqCst) == 2);
    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(stub.performed.load(Ordering::SeqCst), 2, "no further runs");
    scheduler.stop();
}

#[test]
fn unregister_and_delete_drops_on_worker_exactly_once() {
    let (keyboard, _clock_source, scheduler) = test_rig();
    let clock = _clock_source.clock();
    let (stub, dropped) = StubMapping::new(&keyboard, clock, false);
    let id = stub.common().id();

    scheduler.start();
    scheduler.register(stub.clone() as Arc<dyn Mapping>);
    scheduler.schedule_now(id);
    wait_for(|| stub.performed.load(Ordering::SeqCst) >= 1);

    scheduler.unregister_and_delete(id);
    let performed_before = {
        // Release our reference; the scheduler's clone is the last owner
        let count = stub.performed.load(Ordering::SeqCst);
        drop(stub);
        count
    };
    wait_for(|| dropped.load(Ordering::SeqCst));

    // Nothing further runs for this mapping
    scheduler.schedule_now(id);
    std::thread::sleep(Duration::from_millis(30));
    assert!(dropped.load(Ordering::SeqCst));
    let _ = performed_before;
    scheduler.stop();
}

#[test]
fn unschedule_invalidates_deferred_work() {
    let (keyboard, _clock_source, scheduler) = test_rig();
    let clock = _clock_source.clock();
    let (stub, _) = StubMapping::new(&keyboard, clock.clone(), false);
    let id = stub.common().id();

    scheduler.start();
    scheduler.register(stub.clone() as Arc<dyn Mapping>);
    scheduler.schedule_later(id, clock.now().offset(millis(30)));
    scheduler.unschedule(id);

    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(stub.performed.load(Ordering::SeqCst), 0);
    scheduler.stop();
}
