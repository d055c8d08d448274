// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Per-key façade: fusing MIDI, touch, and continuous position
//!
//! [`PianoKey`] binds together everything one key produces: the continuous
//! position buffer with its idle detector and position tracker, the touch
//! frame buffer with stable touch-ID assignment, and the MIDI note state
//! delivered by a keyboard segment.
//!
//! The note-on fusion policy is the subtle part: when a MIDI note-on arrives
//! before any touch data, the key can wait a bounded grace interval for the
//! touch to show up so that downstream consumers see touch context with the
//! onset. If a touch arrives first the pending note fires immediately; if
//! the timeout lapses the note fires without touch data. A grace of zero
//! (the default) means notes always fire immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rosc::OscType;
use tracing::{debug, trace};

use crate::idle::{
    IdleState, KeyIdleDetector, DEFAULT_IDLE_ACTIVITY_THRESHOLD, DEFAULT_IDLE_COUNTER_THRESHOLD,
    DEFAULT_IDLE_POSITION_THRESHOLD,
};
use crate::keyboard::PianoKeyboard;
use crate::mapping::factory::KeyEventContext;
use crate::node::Node;
use crate::segment::SegmentId;
use crate::touch::{match_closest_points, KeyTouchFrame, MAX_TOUCHES};
use crate::tracker::KeyPositionTracker;
use crate::trigger::{SourceId, TriggerListener};
use crate::types::{micros_interval, KeyPosition, Timestamp, TimestampDelta};

/// How many key lifecycle transitions to keep.
pub const KEY_STATE_BUFFER_LENGTH: usize = 20;
/// How many idle/active transitions to keep.
pub const KEY_IDLE_BUFFER_LENGTH: usize = 10;
/// How many tracker notifications to keep.
pub const KEY_POSITION_TRACKER_BUFFER_LENGTH: usize = 30;
/// Default grace interval to wait for touch at note-on (zero = immediate).
pub const DEFAULT_TOUCH_TIMEOUT_INTERVAL: TimestampDelta = micros_interval(0);
/// Throttle on per-sample activity traces.
const ACTIVITY_TRACE_INTERVAL: TimestampDelta = micros_interval(15_000);

static NEXT_ACTOR_ID: AtomicU64 = AtomicU64::new(0x4B00);

/// Lifecycle of a key as a whole (distinct from the position-tracker state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLifecycle {
    Unknown,
    Disabled,
    Idle,
    Active,
}

struct KeyState {
    lifecycle: KeyLifecycle,
    midi_note_is_on: bool,
    midi_channel: Option<u8>,
    midi_velocity: u8,
    midi_on_timestamp: Timestamp,
    midi_off_timestamp: Timestamp,
    touch_sensors_present: bool,
    touch_is_active: bool,
    touch_is_waiting: bool,
    touch_waiting_segment: Option<SegmentId>,
    touch_waiting_timestamp: Timestamp,
    touch_timeout: TimestampDelta,
    last_activity_trace: Timestamp,
}

/// State and buffers for a single key.
pub struct PianoKey {
    keyboard: Weak<PianoKeyboard>,
    self_weak: Weak<PianoKey>,
    note_number: u8,
    actor_id: u64,

    position_buffer: Arc<Node<KeyPosition>>,
    touch_buffer: Arc<Node<KeyTouchFrame>>,
    aftertouch_buffer: Arc<Node<f64>>,
    state_buffer: Arc<Node<KeyLifecycle>>,
    idle_detector: Arc<KeyIdleDetector>,
    position_tracker: Arc<KeyPositionTracker>,

    state: Mutex<KeyState>,
}

impl PianoKey {
    pub fn new(keyboard: Weak<PianoKeyboard>, note_number: u8, buffer_length: usize) -> Arc<Self> {
        let position_buffer: Arc<Node<KeyPosition>> = Node::with_capacity(buffer_length);
        let idle_detector = KeyIdleDetector::new(
            KEY_IDLE_BUFFER_LENGTH,
            position_buffer.clone(),
            DEFAULT_IDLE_POSITION_THRESHOLD,
            DEFAULT_IDLE_ACTIVITY_THRESHOLD,
            DEFAULT_IDLE_COUNTER_THRESHOLD,
        );
        let position_tracker =
            KeyPositionTracker::new(KEY_POSITION_TRACKER_BUFFER_LENGTH, position_buffer.clone());

        let key = Arc::new_cyclic(|weak: &Weak<PianoKey>| PianoKey {
            keyboard,
            self_weak: weak.clone(),
            note_number,
            actor_id: NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed),
            position_buffer,
            touch_buffer: Node::with_capacity(buffer_length),
            aftertouch_buffer: Node::with_capacity(buffer_length),
            state_buffer: Node::with_capacity(KEY_STATE_BUFFER_LENGTH),
            idle_detector,
            position_tracker,
            state: Mutex::new(KeyState {
                lifecycle: KeyLifecycle::Unknown,
                midi_note_is_on: false,
                midi_channel: None,
                midi_velocity: 0,
                midi_on_timestamp: Timestamp::ZERO,
                midi_off_timestamp: Timestamp::ZERO,
                touch_sensors_present: true,
                touch_is_active: false,
                touch_is_waiting: false,
                touch_waiting_segment: None,
                touch_waiting_timestamp: Timestamp::ZERO,
                touch_timeout: DEFAULT_TOUCH_TIMEOUT_INTERVAL,
                last_activity_trace: Timestamp::ZERO,
            }),
        });

        // Watch our own idle detector for idle/active transitions
        key.idle_detector
            .node()
            .subscribe(&(key.clone() as Arc<dyn TriggerListener>));
        key
    }

    pub fn note_number(&self) -> u8 {
        self.note_number
    }

    pub fn position_buffer(&self) -> &Arc<Node<KeyPosition>> {
        &self.position_buffer
    }

    pub fn touch_buffer(&self) -> &Arc<Node<KeyTouchFrame>> {
        &self.touch_buffer
    }

    pub fn tracker(&self) -> &Arc<KeyPositionTracker> {
        &self.position_tracker
    }

    pub fn idle_detector(&self) -> &Arc<KeyIdleDetector> {
        &self.idle_detector
    }

    pub fn lifecycle(&self) -> KeyLifecycle {
        self.state.lock().unwrap().lifecycle
    }

    pub fn midi_note_is_on(&self) -> bool {
        self.state.lock().unwrap().midi_note_is_on
    }

    /// Output channel the current MIDI note was allocated to.
    pub fn midi_channel(&self) -> Option<u8> {
        self.state.lock().unwrap().midi_channel
    }

    pub fn midi_velocity(&self) -> u8 {
        self.state.lock().unwrap().midi_velocity
    }

    pub fn midi_on_timestamp(&self) -> Timestamp {
        self.state.lock().unwrap().midi_on_timestamp
    }

    pub fn midi_off_timestamp(&self) -> Timestamp {
        self.state.lock().unwrap().midi_off_timestamp
    }

    pub fn touch_is_active(&self) -> bool {
        self.state.lock().unwrap().touch_is_active
    }

    pub fn set_touch_sensors_present(&self, present: bool) {
        self.state.lock().unwrap().touch_sensors_present = present;
    }

    pub fn touch_sensors_present(&self) -> bool {
        self.state.lock().unwrap().touch_sensors_present
    }

    /// Bounded wait for touch data at note-on; zero fires notes immediately.
    pub fn set_touch_timeout_interval(&self, interval: TimestampDelta) {
        self.state.lock().unwrap().touch_timeout = interval.max(0);
    }

    fn event_context(&self, state: &KeyState) -> KeyEventContext {
        KeyEventContext {
            note_number: self.note_number,
            midi_note_is_on: state.midi_note_is_on,
            touch_is_on: state.touch_is_active,
            key_motion_active: self.idle_detector.idle_state() == IdleState::Active,
            midi_channel: state.midi_channel,
            midi_velocity: state.midi_velocity,
            touch_buffer: self.touch_buffer.clone(),
            position_buffer: self.position_buffer.clone(),
            tracker: self.position_tracker.clone(),
        }
    }

    fn change_state(&self, state: &mut KeyState, lifecycle: KeyLifecycle) {
        state.lifecycle = lifecycle;
        let timestamp = self.position_buffer.latest_timestamp().unwrap_or(Timestamp::ZERO);
        self.state_buffer.insert(lifecycle, timestamp);
    }

    /// Stop generating events from this key.
    pub fn disable(&self) {
        let mut state = self.state.lock().unwrap();
        if state.lifecycle == KeyLifecycle::Disabled {
            return;
        }
        self.change_state(&mut state, KeyLifecycle::Disabled);
    }

    /// Allow the key to transition to idle, then active, again.
    pub fn enable(&self) {
        let mut state = self.state.lock().unwrap();
        if state.lifecycle != KeyLifecycle::Disabled {
            return;
        }
        self.change_state(&mut state, KeyLifecycle::Unknown);
    }

    /// Force an active key back to idle, for stuck-note recovery.
    pub fn force_idle(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.lifecycle == KeyLifecycle::Disabled || state.lifecycle == KeyLifecycle::Idle {
                return;
            }
            self.change_state(&mut state, KeyLifecycle::Idle);
        }
        self.position_tracker.disengage();
    }

    /// Reset the key to its default state, clearing all history.
    pub fn reset(&self) {
        self.position_tracker.disengage();
        self.position_buffer.clear();
        self.state_buffer.clear();
        self.idle_detector.clear();
        let mut state = self.state.lock().unwrap();
        self.change_state(&mut state, KeyLifecycle::Unknown);
    }

    /// Append one continuous position sample.
    pub fn insert_position_sample(&self, position: KeyPosition, timestamp: Timestamp) {
        self.position_buffer.insert(position, timestamp);

        let mut state = self.state.lock().unwrap();
        if timestamp.delta_since(state.last_activity_trace) > ACTIVITY_TRACE_INTERVAL {
            state.last_activity_trace = timestamp;
            trace!(note = self.note_number, position, "key position");
        }
    }

    // ----- MIDI fusion -----

    /// Note On from the associated keyboard segment: record the channel we
    /// use for the duration of this note and its velocity, then either fire
    /// the onset immediately or wait (bounded) for touch data.
    pub fn midi_note_on(&self, segment: SegmentId, velocity: u8, channel: u8, timestamp: Timestamp) {
        let (ctx, fire_now, wait_until) = {
            let mut state = self.state.lock().unwrap();
            state.midi_note_is_on = true;
            state.midi_channel = Some(channel);
            state.midi_velocity = velocity;
            state.midi_on_timestamp = timestamp;

            let fire_now = (state.touch_is_active && !self.touch_buffer.is_empty())
                || !state.touch_sensors_present
                || state.touch_timeout == 0;
            let wait_until = if fire_now {
                None
            } else {
                let now = self
                    .keyboard
                    .upgrade()
                    .map(|kb| kb.current_timestamp())
                    .unwrap_or(timestamp);
                let deadline = now.offset(state.touch_timeout);
                state.touch_is_waiting = true;
                state.touch_waiting_segment = Some(segment);
                state.touch_waiting_timestamp = deadline;
                Some(deadline)
            };
            (self.event_context(&state), fire_now, wait_until)
        };

        let Some(keyboard) = self.keyboard.upgrade() else {
            return;
        };
        if let Some(factory) = keyboard.mapping_factory(segment) {
            factory.midi_note_on(&ctx);
        }

        if fire_now {
            self.midi_note_on_helper(segment);
        } else if let Some(deadline) = wait_until {
            // Schedule a timeout; an arriving touch cancels it
            let weak = self.self_weak.clone();
            keyboard.schedule_event(
                self.actor_id,
                Box::new(move || {
                    if let Some(key) = weak.upgrade() {
                        key.touch_timed_out();
                    }
                    None
                }),
                deadline,
            );
        }
    }

    /// The real work of note-on, run immediately or once touch arrives (or
    /// times out). Broadcasts the pre-onset snapshot and the onset message.
    fn midi_note_on_helper(&self, segment: SegmentId) {
        let (frame, channel, velocity) = {
            let mut state = self.state.lock().unwrap();
            state.touch_is_waiting = false;
            state.touch_waiting_segment = None;
            (
                self.touch_buffer.latest(),
                state.midi_channel.unwrap_or(0),
                state.midi_velocity,
            )
        };
        let Some(keyboard) = self.keyboard.upgrade() else {
            return;
        };

        if let Some(frame) = frame {
            // Report the location of the first-arrived touch along with the
            // full frame; consumers may use this to set up before the note.
            let mut first_index = 0usize;
            for i in 0..frame.count {
                if frame.ids[i] < frame.ids[first_index] {
                    first_index = i;
                }
            }
            keyboard.send_message(
                "/touchkeys/preonset",
                vec![
                    OscType::Int(self.note_number as i32),
                    OscType::Int(channel as i32),
                    OscType::Int(velocity as i32),
                    OscType::Int(frame.count as i32),
                    OscType::Int(first_index as i32),
                    OscType::Int(frame.ids[0]),
                    OscType::Float(frame.locs[0]),
                    OscType::Float(frame.sizes[0]),
                    OscType::Int(frame.ids[1]),
                    OscType::Float(frame.locs[1]),
                    OscType::Float(frame.sizes[1]),
                    OscType::Int(frame.ids[2]),
                    OscType::Float(frame.locs[2]),
                    OscType::Float(frame.sizes[2]),
                    OscType::Float(frame.loc_h),
                ],
            );
        }

        // Give the factory a chance to send default controller values on the
        // allocated channel before the note starts.
        if let Some(factory) = keyboard.mapping_factory(segment) {
            factory.note_will_begin(self.note_number, channel, velocity);
        }

        keyboard.send_message(
            "/midi/noteon",
            vec![
                OscType::Int(self.note_number as i32),
                OscType::Int(channel as i32),
                OscType::Int(velocity as i32),
            ],
        );
    }

    /// Note Off from the associated keyboard segment. Clears MIDI state.
    pub fn midi_note_off(&self, segment: SegmentId, timestamp: Timestamp) {
        let (ctx, channel) = {
            let mut state = self.state.lock().unwrap();
            state.midi_note_is_on = false;
            state.midi_off_timestamp = timestamp;
            let channel = state.midi_channel.unwrap_or(0);
            let ctx = self.event_context(&state);
            state.midi_velocity = 0;
            state.midi_channel = None;
            (ctx, channel)
        };
        self.aftertouch_buffer.clear();

        let Some(keyboard) = self.keyboard.upgrade() else {
            return;
        };
        if let Some(factory) = keyboard.mapping_factory(segment) {
            factory.midi_note_off(&ctx);
        }
        keyboard.send_message(
            "/midi/noteoff",
            vec![
                OscType::Int(self.note_number as i32),
                OscType::Int(channel as i32),
            ],
        );
    }

    /// Polyphonic or channel aftertouch routed to this key.
    pub fn midi_aftertouch(&self, _segment: SegmentId, value: u8, timestamp: Timestamp) {
        let channel = {
            let state = self.state.lock().unwrap();
            if !state.midi_note_is_on {
                return;
            }
            state.midi_channel.unwrap_or(0)
        };
        self.aftertouch_buffer.insert(value as f64, timestamp);

        if let Some(keyboard) = self.keyboard.upgrade() {
            keyboard.send_message(
                "/midi/aftertouch-poly",
                vec![
                    OscType::Int(self.note_number as i32),
                    OscType::Int(channel as i32),
                    OscType::Int(value as i32),
                ],
            );
        }
    }

    // ----- Touch -----

    /// Insert a new frame of touch data, assigning stable touch IDs by
    /// nearest-neighbour matching against the previous frame. May release a
    /// pending note-on wait.
    pub fn touch_insert_frame(&self, mut frame: KeyTouchFrame, timestamp: Timestamp) {
        let (became_active, ctx) = {
            let mut state = self.state.lock().unwrap();
            if !state.touch_sensors_present {
                return;
            }
            let became_active = !state.touch_is_active;
            state.touch_is_active = true;
            (became_active, self.event_context(&state))
        };

        let keyboard = self.keyboard.upgrade();
        if became_active {
            if let Some(kb) = keyboard.as_ref() {
                kb.send_message(
                    "/touchkeys/on",
                    vec![OscType::Int(self.note_number as i32)],
                );
                kb.tell_all_factories_touch_began(&ctx);
            }
        }

        if let Some(last_frame) = self.touch_buffer.latest() {
            frame.next_id = last_frame.next_id;
            self.assign_touch_ids(&mut frame, &last_frame);
        } else {
            // No previous frame: assign IDs sequentially
            frame.next_id = 0;
            for i in 0..frame.count {
                frame.ids[i] = frame.next_id;
                frame.next_id += 1;
                trace!(note = self.note_number, id = frame.ids[i], "touch added");
            }
        }

        self.touch_buffer.insert(frame, timestamp);

        // A pending MIDI note-on was waiting on this touch
        let waiting = {
            let state = self.state.lock().unwrap();
            if state.touch_is_waiting {
                state
                    .touch_waiting_segment
                    .map(|segment| (segment, state.touch_waiting_timestamp))
            } else {
                None
            }
        };
        if let Some((segment, deadline)) = waiting {
            if let Some(kb) = keyboard.as_ref() {
                kb.unschedule_event_at(self.actor_id, deadline);
            }
            self.midi_note_on_helper(segment);
        }
    }

    fn assign_touch_ids(&self, frame: &mut KeyTouchFrame, last: &KeyTouchFrame) {
        use std::cmp::Ordering as CmpOrdering;
        match frame.count.cmp(&last.count) {
            CmpOrdering::Greater => {
                // Points added: match new to old to find which are new
                let ordering = match_closest_points(&last.locs, &frame.locs);
                for (counter, &slot) in ordering.iter().enumerate().take(MAX_TOUCHES) {
                    frame.ids[slot] = last.ids[counter];
                    if frame.ids[slot] < 0 && slot < frame.count {
                        frame.ids[slot] = frame.next_id;
                        frame.next_id += 1;
                        trace!(note = self.note_number, id = frame.ids[slot], "touch added");
                    }
                }
            }
            CmpOrdering::Less => {
                // Points removed: surviving touches keep their IDs
                let ordering = match_closest_points(&last.locs, &frame.locs);
                for (counter, &slot) in ordering.iter().enumerate().take(MAX_TOUCHES) {
                    if slot < frame.count {
                        frame.ids[slot] = last.ids[counter];
                    } else if last.ids[counter] >= 0 {
                        trace!(
                            note = self.note_number,
                            id = last.ids[counter],
                            remaining = frame.count,
                            "touch removed"
                        );
                    }
                }
            }
            CmpOrdering::Equal => {
                // Touches are stored in ascending order, so IDs carry over
                for i in 0..frame.count {
                    frame.ids[i] = last.ids[i];
                }
            }
        }
    }

    /// All touch has left the key. Emits one empty frame so listeners
    /// observe the transition, then clears touch state.
    pub fn touch_off(&self, timestamp: Timestamp) {
        let ctx = {
            let mut state = self.state.lock().unwrap();
            if !state.touch_is_active || !state.touch_sensors_present {
                return;
            }
            let ctx = self.event_context(&state);
            state.touch_is_active = false;
            ctx
        };

        let keyboard = self.keyboard.upgrade();
        if let Some(kb) = keyboard.as_ref() {
            kb.tell_all_factories_touch_ended(&ctx);
        }

        if !self.touch_buffer.is_empty() {
            self.touch_buffer.insert(KeyTouchFrame::default(), timestamp);
        }
        self.touch_buffer.clear();

        if let Some(kb) = keyboard.as_ref() {
            kb.send_message(
                "/touchkeys/off",
                vec![OscType::Int(self.note_number as i32)],
            );
        }
    }

    /// Timeout waiting for a touch after note-on: fire the onset without
    /// touch data.
    fn touch_timed_out(&self) {
        let segment = {
            let state = self.state.lock().unwrap();
            if !state.touch_is_waiting {
                return;
            }
            state.touch_waiting_segment
        };
        debug!(note = self.note_number, "touch wait timed out");
        if let Some(segment) = segment {
            self.midi_note_on_helper(segment);
        }
    }
}

impl TriggerListener for PianoKey {
    fn trigger_received(&self, source: SourceId, _timestamp: Timestamp) {
        if source == self.idle_detector.node().source_id() {
            match self.idle_detector.node().latest() {
                Some(IdleState::Idle) => self.key_went_idle(),
                Some(IdleState::Active) => self.key_went_active(),
                _ => {}
            }
        } else if source == self.position_tracker.node().source_id() {
            if let Some(notification) = self.position_tracker.node().latest() {
                trace!(
                    note = self.note_number,
                    kind = ?notification.kind,
                    state = ?notification.state,
                    "tracker update"
                );
            }
        }
    }
}

impl PianoKey {
    fn key_went_idle(&self) {
        debug!(note = self.note_number, "key -> idle");
        let ctx = {
            let mut state = self.state.lock().unwrap();
            let ctx = self.event_context(&state);
            self.change_state(&mut state, KeyLifecycle::Idle);
            ctx
        };
        if let Some(kb) = self.keyboard.upgrade() {
            kb.tell_all_factories_key_motion_idle(&ctx);
        }
        self.position_tracker.disengage();
        if let Some(this) = self.self_weak.upgrade() {
            let weak: Weak<dyn TriggerListener> =
                Arc::downgrade(&(this as Arc<dyn TriggerListener>));
            self.position_tracker.node().unsubscribe(&weak);
        }
        if let Some(kb) = self.keyboard.upgrade() {
            kb.set_key_led_color_rgb(self.note_number, 0.0, 0.0, 0.0);
        }
    }

    fn key_went_active(&self) {
        let ctx = {
            let mut state = self.state.lock().unwrap();
            // Only transition from a known previous state
            if state.lifecycle == KeyLifecycle::Unknown {
                return;
            }
            let ctx = self.event_context(&state);
            self.change_state(&mut state, KeyLifecycle::Active);
            ctx
        };
        debug!(note = self.note_number, "key -> active");
        if let Some(kb) = self.keyboard.upgrade() {
            kb.tell_all_factories_key_motion_active(&ctx);
        }

        // Engage the tracker that measures key states in detail
        if let Some(this) = self.self_weak.upgrade() {
            self.position_tracker
                .node()
                .subscribe(&(this as Arc<dyn TriggerListener>));
        }
        self.position_tracker.reset();
        self.position_tracker.engage();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyboard_and_key() -> (Arc<PianoKeyboard>, Arc<PianoKey>) {
        let keyboard = PianoKeyboard::new();
        let key = keyboard.key(60).unwrap().clone();
        (keyboard, key)
    }

    fn frame_with(locs: &[f32], loc_h: f32) -> KeyTouchFrame {
        let sizes = vec![0.3; locs.len()];
        KeyTouchFrame::from_raw(locs.len(), locs, &sizes, loc_h, true)
    }

    #[test]
    fn first_touch_assigns_sequential_ids() {
        let (_kb, key) = keyboard_and_key();
        key.touch_insert_frame(frame_with(&[0.3, 0.6], -1.0), Timestamp::from_millis(1));

        let frame = key.touch_buffer().latest().unwrap();
        assert_eq!(frame.ids[0], 0);
        assert_eq!(frame.ids[1], 1);
        assert_eq!(frame.next_id, 2);
        assert!(key.touch_is_active());
    }

    #[test]
    fn moving_touch_keeps_its_id() {
        let (_kb, key) = keyboard_and_key();
        key.touch_insert_frame(frame_with(&[0.3], -1.0), Timestamp::from_millis(1));
        key.touch_insert_frame(frame_with(&[0.35], -1.0), Timestamp::from_millis(2));

        let frame = key.touch_buffer().latest().unwrap();
        assert_eq!(frame.ids[0], 0);
    }

    #[test]
    fn added_touch_gets_new_id_existing_keeps_own() {
        let (_kb, key) = keyboard_and_key();
        key.touch_insert_frame(frame_with(&[0.5], -1.0), Timestamp::from_millis(1));
        // New lower touch appears; ascending order puts it first
        key.touch_insert_frame(frame_with(&[0.2, 0.52], -1.0), Timestamp::from_millis(2));

        let frame = key.touch_buffer().latest().unwrap();
        assert_eq!(frame.ids[1], 0, "moved touch keeps id 0");
        assert_eq!(frame.ids[0], 1, "new touch takes the next id");
        assert_eq!(frame.next_id, 2);
    }

    #[test]
    fn removed_touch_leaves_survivor_id() {
        let (_kb, key) = keyboard_and_key();
        key.touch_insert_frame(frame_with(&[0.2, 0.6], -1.0), Timestamp::from_millis(1));
        key.touch_insert_frame(frame_with(&[0.61], -1.0), Timestamp::from_millis(2));

        let frame = key.touch_buffer().latest().unwrap();
        assert_eq!(frame.ids[0], 1, "upper touch survived with its id");
    }

    #[test]
    fn touch_off_clears_state_and_buffer() {
        let (_kb, key) = keyboard_and_key();
        key.touch_insert_frame(frame_with(&[0.4], -1.0), Timestamp::from_millis(1));
        key.touch_off(Timestamp::from_millis(2));

        assert!(!key.touch_is_active());
        assert!(key.touch_buffer().is_empty());
    }

    #[test]
    fn note_on_with_zero_grace_fires_immediately() {
        let (kb, key) = keyboard_and_key();
        let (sink, messages) = crate::osc::testing::RecordingOscSink::new();
        kb.osc_transmitter().add_sink(sink);

        key.midi_note_on(0, 100, 2, Timestamp::from_millis(5));

        let sent = messages.lock().unwrap();
        let note_on = sent.iter().find(|m| m.addr == "/midi/noteon").unwrap();
        assert_eq!(
            note_on.args,
            vec![OscType::Int(60), OscType::Int(2), OscType::Int(100)]
        );
        assert!(key.midi_note_is_on());
        assert_eq!(key.midi_channel(), Some(2));
    }

    #[test]
    fn preonset_sent_when_touch_already_present() {
        let (kb, key) = keyboard_and_key();
        let (sink, messages) = crate::osc::testing::RecordingOscSink::new();
        kb.osc_transmitter().add_sink(sink);

        key.touch_insert_frame(frame_with(&[0.4], 0.5), Timestamp::from_millis(1));
        key.midi_note_on(0, 90, 0, Timestamp::from_millis(5));

        let sent = messages.lock().unwrap();
        let preonset = sent.iter().find(|m| m.addr == "/touchkeys/preonset").unwrap();
        assert_eq!(preonset.args.len(), 15);
        assert_eq!(preonset.args[0], OscType::Int(60));
        assert_eq!(preonset.args[3], OscType::Int(1)); // touch count
    }

    #[test]
    fn aftertouch_requires_note_on() {
        let (kb, key) = keyboard_and_key();
        let (sink, messages) = crate::osc::testing::RecordingOscSink::new();
        kb.osc_transmitter().add_sink(sink);

        key.midi_aftertouch(0, 80, Timestamp::from_millis(1));
        assert!(messages.lock().unwrap().is_empty());

        key.midi_note_on(0, 100, 1, Timestamp::from_millis(2));
        key.midi_aftertouch(0, 80, Timestamp::from_millis(3));
        let sent = messages.lock().unwrap();
        assert!(sent.iter().any(|m| m.addr == "/midi/aftertouch-poly"));
    }

    #[test]
    fn pending_note_fires_when_touch_arrives() {
        let (kb, key) = keyboard_and_key();
        kb.start();
        let (sink, messages) = crate::osc::testing::RecordingOscSink::new();
        kb.osc_transmitter().add_sink(sink);

        key.set_touch_timeout_interval(crate::types::millis(500));
        key.midi_note_on(0, 100, 1, kb.current_timestamp());
        assert!(
            !messages
                .lock()
                .unwrap()
                .iter()
                .any(|m| m.addr == "/midi/noteon"),
            "note-on must wait for touch"
        );

        key.touch_insert_frame(frame_with(&[0.4], -1.0), kb.current_timestamp());
        assert!(messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.addr == "/midi/noteon"));
        kb.stop();
    }
}
