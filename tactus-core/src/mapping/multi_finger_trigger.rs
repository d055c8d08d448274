// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Multi-finger trigger gestures
//!
//! Watches for "N fingers held for K frames" patterns on a key, with
//! optional counting of consecutive taps within a maximum spacing. A
//! completed gesture fires a configurable MIDI event - note on or off, to
//! the current note or a fixed one, at the touch's velocity or a fixed one.
//! Extra notes the trigger turns on are tracked so they can be silenced when
//! the mapping goes away.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use rosc::{OscMessage, OscType};
use tracing::debug;

use super::factory::{
    impl_note_factory_delegates, KeyEventContext, MappingFactory, MappingFactoryKind,
    NoteFactorySupport,
};
use super::{engage_mapping, Mapping, MappingCommon};
use crate::config::{FactoryParams, FactoryPreset};
use crate::keyboard::PianoKeyboard;
use crate::osc::int_arg;
use crate::segment::MidiKeyboardSegment;
use crate::touch::MAX_TOUCHES;
use crate::trigger::{SourceId, TriggerListener};
use crate::types::{millis, Timestamp, TimestampDelta};

const DEFAULT_NUM_TOUCHES_FOR_TRIGGER: usize = 2;
const DEFAULT_NUM_FRAMES_FOR_TRIGGER: usize = 2;
const DEFAULT_NUM_CONSECUTIVE_TAPS: usize = 1;
const DEFAULT_MAX_TAP_SPACING: TimestampDelta = millis(300);

/// What a trigger edge does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    None,
    NoteOn,
    NoteOff,
}

impl TriggerAction {
    pub fn from_index(index: i32) -> TriggerAction {
        match index {
            1 => TriggerAction::NoteOn,
            2 => TriggerAction::NoteOff,
            _ => TriggerAction::None,
        }
    }

    pub fn index(&self) -> i32 {
        match self {
            TriggerAction::None => 0,
            TriggerAction::NoteOn => 1,
            TriggerAction::NoteOff => 2,
        }
    }
}

#[derive(Clone)]
struct TriggerConfig {
    num_touches: usize,
    num_frames: usize,
    num_consecutive_taps: usize,
    max_tap_spacing: TimestampDelta,
    needs_midi_note_on: bool,
    on_action: TriggerAction,
    off_action: TriggerAction,
    /// None = use the mapping's own note
    on_note: Option<u8>,
    off_note: Option<u8>,
    /// None = use the key's current MIDI velocity
    on_velocity: Option<u8>,
    off_velocity: Option<u8>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        TriggerConfig {
            num_touches: DEFAULT_NUM_TOUCHES_FOR_TRIGGER,
            num_frames: DEFAULT_NUM_FRAMES_FOR_TRIGGER,
            num_consecutive_taps: DEFAULT_NUM_CONSECUTIVE_TAPS,
            max_tap_spacing: DEFAULT_MAX_TAP_SPACING,
            needs_midi_note_on: true,
            on_action: TriggerAction::NoteOn,
            off_action: TriggerAction::None,
            on_note: None,
            off_note: None,
            on_velocity: None,
            off_velocity: None,
        }
    }
}

struct TriggerState {
    config: TriggerConfig,
    frames_count: usize,
    taps_count: usize,
    has_generated_tap: bool,
    has_triggered: bool,
    last_tap_start: Option<Timestamp>,
    /// (channel, note) pairs this trigger turned on beyond its own note
    other_notes_on: HashSet<(u8, u8)>,
}

/// Per-note multi-finger tap detector.
pub struct MultiFingerTriggerMapping {
    common: MappingCommon,
    segment: Weak<MidiKeyboardSegment>,
    state: Mutex<TriggerState>,
}

impl MultiFingerTriggerMapping {
    pub fn new(
        keyboard: &Arc<PianoKeyboard>,
        segment: &Arc<MidiKeyboardSegment>,
        ctx: &KeyEventContext,
    ) -> Arc<Self> {
        Arc::new(MultiFingerTriggerMapping {
            common: MappingCommon::new(
                keyboard,
                ctx.note_number,
                ctx.touch_buffer.clone(),
                ctx.position_buffer.clone(),
                ctx.tracker.clone(),
            ),
            segment: Arc::downgrade(segment),
            state: Mutex::new(TriggerState {
                config: TriggerConfig::default(),
                frames_count: 0,
                taps_count: 0,
                has_generated_tap: false,
                has_triggered: false,
                last_tap_start: None,
                other_notes_on: HashSet::new(),
            }),
        })
    }

    pub fn configure(&self, configure: impl FnOnce(&mut TriggerConfigView<'_>)) {
        let mut state = self.state.lock().unwrap();
        configure(&mut TriggerConfigView {
            config: &mut state.config,
        });
    }

    fn channel_and_port(&self) -> Option<(usize, u8)> {
        let segment = self.segment.upgrade()?;
        let keyboard = self.common.keyboard()?;
        let channel = keyboard
            .key(self.common.note_number())
            .and_then(|key| key.midi_channel())
            .unwrap_or(0);
        Some((segment.output_port(), channel))
    }

    fn fire(&self, action: TriggerAction, note: Option<u8>, velocity: Option<u8>) {
        if action == TriggerAction::None || self.common.suspended() {
            return;
        }
        let Some((port, channel)) = self.channel_and_port() else {
            return;
        };
        let Some(keyboard) = self.common.keyboard() else {
            return;
        };
        let own_note = self.common.note_number();
        let note = note.unwrap_or(own_note);
        if note > 127 {
            return;
        }

        let velocity = match action {
            TriggerAction::NoteOn => velocity
                .unwrap_or_else(|| {
                    keyboard
                        .key(own_note)
                        .map(|key| key.midi_velocity())
                        .unwrap_or(64)
                })
                .min(127),
            _ => 0,
        };

        {
            let mut state = self.state.lock().unwrap();
            if note != own_note {
                if action == TriggerAction::NoteOn {
                    state.other_notes_on.insert((channel, note));
                } else {
                    state.other_notes_on.remove(&(channel, note));
                }
            }
        }
        debug!(note, velocity, ?action, "multi-finger trigger");
        // A velocity-zero note on doubles as the off edge
        keyboard.midi_output().send_note_on(port, channel, note, velocity);
    }

    fn generate_trigger_on(&self, time_between_taps: TimestampDelta, distance: f32) {
        let _ = (time_between_taps, distance);
        let (action, note, velocity) = {
            let state = self.state.lock().unwrap();
            (
                state.config.on_action,
                state.config.on_note,
                state.config.on_velocity,
            )
        };
        self.fire(action, note, velocity);
    }

    fn generate_trigger_off(&self) {
        let (action, note, velocity) = {
            let state = self.state.lock().unwrap();
            (
                state.config.off_action,
                state.config.off_note,
                state.config.off_velocity,
            )
        };
        self.fire(action, note, velocity);
    }
}

/// Mutable view over the trigger configuration.
pub struct TriggerConfigView<'a> {
    config: &'a mut TriggerConfig,
}

impl TriggerConfigView<'_> {
    pub fn set_touches_for_trigger(&mut self, touches: usize) {
        self.config.num_touches = touches.clamp(1, MAX_TOUCHES);
    }

    pub fn set_frames_for_trigger(&mut self, frames: usize) {
        self.config.num_frames = frames.max(1);
    }

    pub fn set_consecutive_taps_for_trigger(&mut self, taps: usize) {
        self.config.num_consecutive_taps = taps.max(1);
    }

    pub fn set_max_time_between_taps(&mut self, spacing: TimestampDelta) {
        self.config.max_tap_spacing = spacing.max(0);
    }

    pub fn set_needs_midi_note_on(&mut self, needs: bool) {
        self.config.needs_midi_note_on = needs;
    }

    pub fn set_trigger_on_action(&mut self, action: TriggerAction) {
        self.config.on_action = action;
    }

    pub fn set_trigger_off_action(&mut self, action: TriggerAction) {
        self.config.off_action = action;
    }

    pub fn set_trigger_on_note(&mut self, note: Option<u8>) {
        self.config.on_note = note;
    }

    pub fn set_trigger_off_note(&mut self, note: Option<u8>) {
        self.config.off_note = note;
    }

    pub fn set_trigger_on_velocity(&mut self, velocity: Option<u8>) {
        self.config.on_velocity = velocity;
    }

    pub fn set_trigger_off_velocity(&mut self, velocity: Option<u8>) {
        self.config.off_velocity = velocity;
    }
}

impl TriggerListener for MultiFingerTriggerMapping {
    fn trigger_received(&self, source: SourceId, timestamp: Timestamp) {
        if source != self.common.touch_buffer().source_id() {
            return;
        }
        let Some(frame) = self.common.touch_buffer().latest() else {
            return;
        };

        enum Outcome {
            Nothing,
            TriggerOff,
            TriggerOn {
                time_between_taps: TimestampDelta,
                distance: f32,
            },
        }

        let outcome = {
            let mut state = self.state.lock().unwrap();
            if state.config.needs_midi_note_on && !self.common.note_is_on() {
                state.frames_count = 0;
                state.has_generated_tap = false;
                return;
            }

            let count = frame.count;
            if count < state.config.num_touches {
                state.frames_count = 0;
                state.has_generated_tap = false;
                if state.has_triggered {
                    state.has_triggered = false;
                    Outcome::TriggerOff
                } else {
                    Outcome::Nothing
                }
            } else if count == state.config.num_touches {
                state.frames_count += 1;
                if state.frames_count >= state.config.num_frames && !state.has_generated_tap {
                    // Enough frames to call this a tap. Is it part of a
                    // consecutive-tap run?
                    state.taps_count = match state.last_tap_start {
                        Some(last) if timestamp.delta_since(last) < state.config.max_tap_spacing => {
                            state.taps_count + 1
                        }
                        _ => 1,
                    };

                    let mut outcome = Outcome::Nothing;
                    if state.taps_count >= state.config.num_consecutive_taps
                        && !state.has_triggered
                    {
                        state.has_triggered = true;

                        // Distance runs from the oldest to the newest touch
                        // in the frame; for 3-touch taps, the widest pair
                        let mut newest = 0usize;
                        let mut oldest = 0usize;
                        for i in 0..count {
                            if frame.ids[i] > frame.ids[newest] {
                                newest = i;
                            }
                            if frame.ids[i] < frame.ids[oldest] {
                                oldest = i;
                            }
                        }
                        let mut distance = frame.locs[newest] - frame.locs[oldest];
                        if count == 3 {
                            let spread = frame.locs[2] - frame.locs[0];
                            if spread.abs() > distance.abs() {
                                distance = if frame.ids[2] > frame.ids[0] {
                                    spread
                                } else {
                                    -spread
                                };
                            }
                        }

                        let time_between_taps = if state.config.num_consecutive_taps <= 1 {
                            0
                        } else {
                            state
                                .last_tap_start
                                .map(|last| timestamp.delta_since(last))
                                .unwrap_or(0)
                        };
                        outcome = Outcome::TriggerOn {
                            time_between_taps,
                            distance,
                        };
                    }
                    state.has_generated_tap = true;
                    state.last_tap_start = Some(timestamp);
                    outcome
                } else {
                    Outcome::Nothing
                }
            } else {
                Outcome::Nothing
            }
        };

        match outcome {
            Outcome::TriggerOn {
                time_between_taps,
                distance,
            } => self.generate_trigger_on(time_between_taps, distance),
            Outcome::TriggerOff => self.generate_trigger_off(),
            Outcome::Nothing => {}
        }
    }
}

impl Mapping for MultiFingerTriggerMapping {
    fn common(&self) -> &MappingCommon {
        &self.common
    }

    fn midi_note_on_received(&self, channel: u8, _velocity: u8) {
        self.common.set_note_on(Some(channel));
    }

    fn midi_note_off_received(&self, _channel: u8) {
        self.common.set_note_on(None);
    }

    fn reset(&self) {
        self.common.reset();
        let mut state = self.state.lock().unwrap();
        state.frames_count = 0;
        state.taps_count = 0;
        state.has_generated_tap = false;
        state.has_triggered = false;
        state.last_tap_start = None;
    }

    fn disengage(&self, should_delete: bool) {
        // Silence anything this trigger turned on
        let notes: Vec<(u8, u8)> = {
            let mut state = self.state.lock().unwrap();
            state.other_notes_on.drain().collect()
        };
        if let (Some(segment), Some(keyboard)) = (self.segment.upgrade(), self.common.keyboard()) {
            let port = segment.output_port();
            for (channel, note) in notes {
                keyboard.midi_output().send_note_on(port, channel, note, 0);
            }
        }
        self.common.disengage(should_delete);
    }

    /// All the work happens on the trigger path; nothing to poll.
    fn perform_mapping(&self) -> Option<Timestamp> {
        if !self.common.engaged() {
            return None;
        }
        Some(self.common.next_update_time())
    }
}

/// Factory for [`MultiFingerTriggerMapping`]s.
pub struct MultiFingerTriggerMappingFactory {
    support: NoteFactorySupport,
    config: Mutex<TriggerConfig>,
    self_weak: Weak<MultiFingerTriggerMappingFactory>,
}

impl MultiFingerTriggerMappingFactory {
    pub fn new(
        keyboard: &Arc<PianoKeyboard>,
        segment: &Arc<MidiKeyboardSegment>,
    ) -> Arc<dyn MappingFactory> {
        Arc::new_cyclic(
            |weak: &Weak<MultiFingerTriggerMappingFactory>| MultiFingerTriggerMappingFactory {
                support: NoteFactorySupport::new(keyboard, segment),
                config: Mutex::new(TriggerConfig::default()),
                self_weak: weak.clone(),
            },
        )
    }

    fn make_mapping(&self, ctx: &KeyEventContext) -> Arc<dyn Mapping> {
        let keyboard = self.support.keyboard().expect("keyboard gone");
        let segment = self.support.segment().expect("segment gone");
        let mapping = MultiFingerTriggerMapping::new(&keyboard, &segment, ctx);
        {
            let config = self.config.lock().unwrap().clone();
            mapping.state.lock().unwrap().config = config;
        }
        mapping.common().set_control_name(&self.support.control_name());
        engage_mapping(&mapping);
        mapping
    }

    pub fn configure(&self, configure: impl FnOnce(&mut TriggerConfigView<'_>)) {
        let mut config = self.config.lock().unwrap();
        configure(&mut TriggerConfigView {
            config: &mut *config,
        });
    }
}

impl MappingFactory for MultiFingerTriggerMappingFactory {
    impl_note_factory_delegates!();

    fn kind(&self) -> MappingFactoryKind {
        MappingFactoryKind::MultiFingerTrigger
    }

    fn touch_began(&self, ctx: &KeyEventContext) {
        let this = self.self_weak.upgrade().expect("factory alive");
        self.support
            .handle_touch_began(ctx, &|ctx| this.make_mapping(ctx));
    }

    fn midi_note_on(&self, ctx: &KeyEventContext) {
        let this = self.self_weak.upgrade().expect("factory alive");
        self.support
            .handle_midi_note_on(ctx, &|ctx| this.make_mapping(ctx));
    }

    fn midi_note_off(&self, ctx: &KeyEventContext) {
        self.support.handle_midi_note_off(ctx);
    }

    fn osc_control(&self, path: &str, args: &[OscType]) -> Option<OscMessage> {
        if let Some(response) = self.support.osc_control_common(path, args) {
            return Some(response);
        }
        match path {
            "/set-touches" => {
                let touches = int_arg(args, 0)?;
                self.configure(|c| c.set_touches_for_trigger(touches.max(1) as usize));
                Some(crate::osc::success_message())
            }
            "/set-frames" => {
                let frames = int_arg(args, 0)?;
                self.configure(|c| c.set_frames_for_trigger(frames.max(1) as usize));
                Some(crate::osc::success_message())
            }
            "/set-taps" => {
                let taps = int_arg(args, 0)?;
                self.configure(|c| c.set_consecutive_taps_for_trigger(taps.max(1) as usize));
                Some(crate::osc::success_message())
            }
            _ => None,
        }
    }

    fn preset(&self) -> FactoryPreset {
        let mut preset = self.support.common_preset(self.kind());
        let config = self.config.lock().unwrap();
        preset.params = FactoryParams {
            touches: Some(config.num_touches),
            frames: Some(config.num_frames),
            consecutive_taps: Some(config.num_consecutive_taps),
            max_tap_spacing_ms: Some(config.max_tap_spacing / millis(1)),
            needs_midi_note_on: Some(config.needs_midi_note_on),
            trigger_on_action: Some(config.on_action.index()),
            trigger_off_action: Some(config.off_action.index()),
            trigger_on_note: Some(config.on_note.map(|n| n as i32).unwrap_or(-1)),
            trigger_off_note: Some(config.off_note.map(|n| n as i32).unwrap_or(-1)),
            trigger_on_velocity: Some(config.on_velocity.map(|v| v as i32).unwrap_or(-1)),
            trigger_off_velocity: Some(config.off_velocity.map(|v| v as i32).unwrap_or(-1)),
            ..Default::default()
        };
        preset
    }

    fn load_preset(&self, preset: &FactoryPreset) -> bool {
        if !self.support.load_common_preset(preset) {
            return false;
        }
        let to_opt = |v: i32| if v >= 0 { Some(v as u8) } else { None };
        let params = &preset.params;
        let mut config = self.config.lock().unwrap();
        if let Some(touches) = params.touches {
            config.num_touches = touches.clamp(1, MAX_TOUCHES);
        }
        if let Some(frames) = params.frames {
            config.num_frames = frames.max(1);
        }
        if let Some(taps) = params.consecutive_taps {
            config.num_consecutive_taps = taps.max(1);
        }
        if let Some(spacing_ms) = params.max_tap_spacing_ms {
            config.max_tap_spacing = millis(spacing_ms);
        }
        if let Some(needs) = params.needs_midi_note_on {
            config.needs_midi_note_on = needs;
        }
        if let Some(action) = params.trigger_on_action {
            config.on_action = TriggerAction::from_index(action);
        }
        if let Some(action) = params.trigger_off_action {
            config.off_action = TriggerAction::from_index(action);
        }
        if let Some(note) = params.trigger_on_note {
            config.on_note = to_opt(note);
        }
        if let Some(note) = params.trigger_off_note {
            config.off_note = to_opt(note);
        }
        if let Some(velocity) = params.trigger_on_velocity {
            config.on_velocity = to_opt(velocity);
        }
        if let Some(velocity) = params.trigger_off_velocity {
            config.off_velocity = to_opt(velocity);
        }
        true
    }
}
