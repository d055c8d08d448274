// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Per-note mappings
//!
//! A mapping is a per-note object that converts fused touch, MIDI, and
//! continuous key-position data into outbound MIDI or OSC. Mappings are
//! created and owned by their factory, identified by `(segment, note)`, and
//! live from the first of {touch began, MIDI note on} until both are off and
//! the mapping agrees it is finished.
//!
//! Concrete mappings implement the [`Mapping`] capability trait (there is no
//! inheritance chain; shared per-note state lives in [`MappingCommon`] by
//! composition). `trigger_received` runs on the data-producer thread and
//! must stay minimal - typically just queueing work; the real processing
//! happens in `perform_mapping` on the [`scheduler::MappingScheduler`]
//! thread.

pub mod factory;
pub mod midi_key_position;
pub mod mrp;
pub mod multi_finger_trigger;
pub mod onset_angle;
pub mod scheduler;
pub mod vibrato;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::keyboard::PianoKeyboard;
use crate::node::Node;
use crate::touch::KeyTouchFrame;
use crate::tracker::KeyPositionTracker;
use crate::trigger::TriggerListener;
use crate::types::{micros_interval, KeyPosition, Timestamp, TimestampDelta};

/// Stable identity of a mapping for the scheduler's bookkeeping.
pub type MappingId = u64;

static NEXT_MAPPING_ID: AtomicU64 = AtomicU64::new(1);

/// Default interval between mapping evaluations in the absence of triggers
/// (a little faster than the touch frame rate).
pub const DEFAULT_UPDATE_INTERVAL: TimestampDelta = micros_interval(5_500);

/// Capability interface of a per-note mapping.
pub trait Mapping: TriggerListener + Send + Sync {
    /// Shared per-note state.
    fn common(&self) -> &MappingCommon;

    /// The real mapping work, run on the mapping-scheduler thread.
    /// Returning `Some(t)` re-queues the mapping at `t`.
    fn perform_mapping(&self) -> Option<Timestamp>;

    /// Stop producing output and unregister. `should_delete` stages the
    /// mapping for destruction on the scheduler thread.
    fn disengage(&self, should_delete: bool) {
        self.common().disengage(should_delete);
    }

    /// Reset state back to initial values.
    fn reset(&self) {
        self.common().reset();
    }

    /// Whether the mapping has finished all of its processing and can be
    /// removed. Mappings that persist past note release return false until
    /// their tail work completes.
    fn request_finish(&self) -> bool {
        true
    }

    /// Resend the current state of all managed parameters.
    fn resend(&self) {}

    /// MIDI note-on reached this mapping's key.
    fn midi_note_on_received(&self, _channel: u8, _velocity: u8) {}

    /// MIDI note-off reached this mapping's key.
    fn midi_note_off_received(&self, _channel: u8) {}
}

struct CommonState {
    engaged: bool,
    suspended: bool,
    note_is_on: bool,
    midi_channel: Option<u8>,
    update_interval: TimestampDelta,
    control_name: String,
}

/// Shared state embedded in every concrete mapping.
pub struct MappingCommon {
    id: MappingId,
    note_number: u8,
    keyboard: Weak<PianoKeyboard>,
    touch_buffer: Arc<Node<KeyTouchFrame>>,
    position_buffer: Arc<Node<KeyPosition>>,
    tracker: Arc<KeyPositionTracker>,
    state: Mutex<CommonState>,
    self_listener: Mutex<Option<Weak<dyn TriggerListener>>>,
}

impl MappingCommon {
    pub fn new(
        keyboard: &Arc<PianoKeyboard>,
        note_number: u8,
        touch_buffer: Arc<Node<KeyTouchFrame>>,
        position_buffer: Arc<Node<KeyPosition>>,
        tracker: Arc<KeyPositionTracker>,
    ) -> Self {
        MappingCommon {
            id: NEXT_MAPPING_ID.fetch_add(1, Ordering::Relaxed),
            note_number,
            keyboard: Arc::downgrade(keyboard),
            touch_buffer,
            position_buffer,
            tracker,
            state: Mutex::new(CommonState {
                engaged: false,
                suspended: false,
                note_is_on: false,
                midi_channel: None,
                update_interval: DEFAULT_UPDATE_INTERVAL,
                control_name: String::new(),
            }),
            self_listener: Mutex::new(None),
        }
    }

    pub fn id(&self) -> MappingId {
        self.id
    }

    pub fn note_number(&self) -> u8 {
        self.note_number
    }

    pub fn keyboard(&self) -> Option<Arc<PianoKeyboard>> {
        self.keyboard.upgrade()
    }

    pub fn touch_buffer(&self) -> &Arc<Node<KeyTouchFrame>> {
        &self.touch_buffer
    }

    pub fn position_buffer(&self) -> &Arc<Node<KeyPosition>> {
        &self.position_buffer
    }

    pub fn tracker(&self) -> &Arc<KeyPositionTracker> {
        &self.tracker
    }

    pub fn engaged(&self) -> bool {
        self.state.lock().unwrap().engaged
    }

    pub fn suspended(&self) -> bool {
        self.state.lock().unwrap().suspended
    }

    pub fn suspend(&self) {
        self.state.lock().unwrap().suspended = true;
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.state.lock().unwrap().suspended = suspended;
    }

    pub fn note_is_on(&self) -> bool {
        self.state.lock().unwrap().note_is_on
    }

    pub fn set_note_on(&self, channel: Option<u8>) {
        let mut state = self.state.lock().unwrap();
        state.note_is_on = channel.is_some();
        state.midi_channel = channel;
    }

    pub fn midi_channel(&self) -> Option<u8> {
        self.state.lock().unwrap().midi_channel
    }

    pub fn update_interval(&self) -> TimestampDelta {
        self.state.lock().unwrap().update_interval
    }

    pub fn set_update_interval(&self, interval: TimestampDelta) {
        if interval <= 0 {
            return;
        }
        self.state.lock().unwrap().update_interval = interval;
    }

    pub fn control_name(&self) -> String {
        self.state.lock().unwrap().control_name.clone()
    }

    pub fn set_control_name(&self, name: &str) {
        self.state.lock().unwrap().control_name = name.to_string();
    }

    /// Current virtual time, or zero if the keyboard is gone.
    pub fn now(&self) -> Timestamp {
        self.keyboard
            .upgrade()
            .map(|kb| kb.current_timestamp())
            .unwrap_or(Timestamp::ZERO)
    }

    /// The timestamp one update interval from now, for `perform_mapping`
    /// return values.
    pub fn next_update_time(&self) -> Timestamp {
        self.now().offset(self.update_interval())
    }

    /// Ask the scheduler to run `perform_mapping` as soon as possible.
    pub fn schedule_now(&self) {
        if let Some(kb) = self.keyboard.upgrade() {
            kb.mapping_scheduler().schedule_now(self.id);
        }
    }

    fn disengage(&self, should_delete: bool) {
        self.state.lock().unwrap().engaged = false;
        if let Some(listener) = self.self_listener.lock().unwrap().take() {
            self.touch_buffer.unsubscribe(&listener);
            self.tracker.node().unsubscribe(&listener);
        }
        if let Some(kb) = self.keyboard.upgrade() {
            if should_delete {
                kb.mapping_scheduler().unregister_and_delete(self.id);
            } else {
                kb.mapping_scheduler().unregister(self.id);
            }
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.update_interval = DEFAULT_UPDATE_INTERVAL;
    }
}

/// Wire a freshly created mapping into the data plane: subscribe it to its
/// touch buffer and tracker, register it with the mapping scheduler, and
/// queue an immediate first evaluation.
pub fn engage_mapping<M: Mapping + 'static>(mapping: &Arc<M>) {
    let common = mapping.common();
    {
        let mut state = common.state.lock().unwrap();
        if state.engaged {
            return;
        }
        state.engaged = true;
    }

    let listener: Arc<dyn TriggerListener> = mapping.clone();
    common.touch_buffer.subscribe(&listener);
    common.tracker.node().subscribe(&listener);
    *common.self_listener.lock().unwrap() = Some(Arc::downgrade(&listener));

    if let Some(kb) = common.keyboard.upgrade() {
        let dyn_mapping: Arc<dyn Mapping> = mapping.clone();
        kb.mapping_scheduler().register(dyn_mapping);
        kb.mapping_scheduler().schedule_now(common.id);
    }
}

/// Resume after a suspension, optionally re-sending current state.
pub fn resume_mapping(mapping: &dyn Mapping, resend_current_state: bool) {
    if resend_current_state {
        mapping.resend();
    }
    mapping.common().set_suspended(false);
}
