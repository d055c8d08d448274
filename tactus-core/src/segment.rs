// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Keyboard segment: one MIDI zone and its output engine
//!
//! A [`MidiKeyboardSegment`] owns a configured slice of the keyboard - a
//! note range, an input channel mask, an output port - and decides how
//! incoming MIDI becomes outgoing MIDI. The interesting work is channel
//! allocation in the per-note-channel modes: Polyphonic and MPE give every
//! sounding note its own output channel so per-note controllers (pitch bend
//! from touch data, aftertouch from continuous position) can address one
//! note without smearing across the zone.
//!
//! Channel allocation on note-on:
//! 1. a note still ringing in the damper pedal reuses its prior channel;
//! 2. otherwise take a free channel;
//! 3. otherwise, with the pedal enabled, steal the oldest pedal-reserved
//!    note (force-silencing it);
//! 4. otherwise, with voice stealing enabled, steal the oldest sounding
//!    note;
//! 5. otherwise drop the note.
//!
//! While the damper pedal is down, a released note keeps its channel
//! *reserved* rather than freed, so its ring-out continues to track
//! per-note messages; pedal release frees all reservations at once.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rosc::{OscMessage, OscType};
use tracing::{debug, warn};

use crate::config::{FactoryPreset, SegmentPreset};
use crate::keyboard::PianoKeyboard;
use crate::mapping::factory::{
    create_factory, factory_kind_names, FactorySplitter, MappingFactory, MappingFactoryKind,
};
use crate::midi::{
    MidiMessage, CONTROL_ALL_NOTES_OFF, CONTROL_ALL_SOUND_OFF, CONTROL_DAMPER_PEDAL,
    CONTROL_MOD_WHEEL, CONTROL_SOSTENUTO_PEDAL, PEDAL_ACTIVE_VALUE,
};
use crate::osc::{failure_message, int_arg, float_arg, string_arg, success_message, OscHandler};
use crate::osc_midi::OscMidiConverter;
use crate::types::Timestamp;

/// Stable identity of a segment, used to key per-segment registries.
pub type SegmentId = usize;

static NEXT_SEGMENT_ID: AtomicUsize = AtomicUsize::new(1);

// Meta-controller indices: the controller table covers the 128 MIDI CCs plus
// channel aftertouch, pitch wheel, and polyphonic aftertouch.
pub const CONTROL_CHANNEL_AFTERTOUCH: usize = 128;
pub const CONTROL_PITCH_WHEEL: usize = 129;
pub const CONTROL_POLY_AFTERTOUCH: usize = 130;
pub const CONTROL_MAX: usize = 131;

/// Operating mode of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Off,
    PassThrough,
    Monophonic,
    Polyphonic,
    Mpe,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Off => "Off",
            Mode::PassThrough => "Pass Through",
            Mode::Monophonic => "Monophonic",
            Mode::Polyphonic => "Polyphonic",
            Mode::Mpe => "MPE",
        }
    }

    pub fn from_index(index: i32) -> Mode {
        match index {
            1 => Mode::PassThrough,
            2 => Mode::Monophonic,
            3 => Mode::Polyphonic,
            4 => Mode::Mpe,
            _ => Mode::Off,
        }
    }

    pub fn index(&self) -> i32 {
        match self {
            Mode::Off => 0,
            Mode::PassThrough => 1,
            Mode::Monophonic => 2,
            Mode::Polyphonic => 3,
            Mode::Mpe => 4,
        }
    }
}

/// MPE zone configuration. Only the Lower zone is currently supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpeZone {
    Off,
    Lower,
}

/// What to do with an incoming controller message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerAction {
    Block,
    PassThrough,
    Broadcast,
    SendToLatest,
}

struct SegmentState {
    mode: Mode,
    channel_mask: u16,
    note_min: u8,
    note_max: u8,
    output_port: usize,
    output_channel_lowest: u8,
    output_transposition: i32,
    retransmit_max_polyphony: usize,
    damper_pedal_enabled: bool,
    use_voice_stealing: bool,
    standalone_mode: bool,
    pitch_wheel_range: f32,
    mpe_zone: MpeZone,

    uses_keyboard_channel_pressure: bool,
    uses_keyboard_pitch_wheel: bool,
    uses_keyboard_mod_wheel: bool,
    uses_keyboard_pedals: bool,
    uses_keyboard_midi_controllers: bool,

    controller_values: [i32; CONTROL_MAX],
    controller_actions: [ControllerAction; CONTROL_MAX],

    channel_for_note: HashMap<u8, u8>,
    channels_available: BTreeSet<u8>,
    notes_held_in_pedal: BTreeSet<u8>,
    note_onset_timestamps: [Option<Timestamp>; 128],
}

impl SegmentState {
    /// Master channel for zone-wide messages: the MPE master when a zone is
    /// active, the lowest output channel otherwise.
    fn master_channel(&self) -> u8 {
        match (self.mode, self.mpe_zone) {
            (Mode::Mpe, MpeZone::Lower) => 0x00,
            _ => self.output_channel_lowest,
        }
    }

    fn reset_controller_values(&mut self) {
        for value in self.controller_values.iter_mut() {
            *value = 0;
        }
        self.controller_values[CONTROL_PITCH_WHEEL] = 8192;
    }

    fn transposed(&self, note: u8) -> u8 {
        (note as i32 + self.output_transposition).clamp(0, 127) as u8
    }

    fn refill_channels(&mut self) {
        self.channel_for_note.clear();
        self.channels_available.clear();
        self.notes_held_in_pedal.clear();
        let lowest = self.output_channel_lowest as usize;
        for channel in lowest..(lowest + self.retransmit_max_polyphony).min(16) {
            self.channels_available.insert(channel as u8);
        }
    }

    fn damper_pedal_is_down(&self) -> bool {
        self.controller_values[CONTROL_DAMPER_PEDAL as usize] >= PEDAL_ACTIVE_VALUE as i32
    }

    fn oldest_note(&self) -> Option<u8> {
        self.note_onset_timestamps
            .iter()
            .enumerate()
            .filter_map(|(note, ts)| ts.map(|t| (note as u8, t)))
            .min_by_key(|&(_, t)| t)
            .map(|(note, _)| note)
    }

    fn newest_note(&self) -> Option<u8> {
        self.note_onset_timestamps
            .iter()
            .enumerate()
            .filter_map(|(note, ts)| ts.map(|t| (note as u8, t)))
            .max_by_key(|&(_, t)| t)
            .map(|(note, _)| note)
    }

    fn oldest_note_in_pedal(&self) -> Option<u8> {
        self.notes_held_in_pedal
            .iter()
            .map(|&note| {
                (
                    note,
                    // A pedal note missing its onset is the first to steal
                    self.note_onset_timestamps[note as usize].unwrap_or(Timestamp::ZERO),
                )
            })
            .min_by_key(|&(_, t)| t)
            .map(|(note, _)| note)
    }
}

/// One configured zone of the keyboard with its own output policy.
pub struct MidiKeyboardSegment {
    id: SegmentId,
    keyboard: Arc<PianoKeyboard>,
    self_weak: Weak<MidiKeyboardSegment>,
    splitter: Arc<FactorySplitter>,
    state: Mutex<SegmentState>,
    factories: Mutex<Vec<Arc<dyn MappingFactory>>>,
    converters: Mutex<HashMap<usize, (Arc<OscMidiConverter>, usize)>>,
}

impl MidiKeyboardSegment {
    pub fn new(keyboard: Arc<PianoKeyboard>) -> Arc<Self> {
        let id = NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed);
        let splitter = FactorySplitter::new();
        let segment = Arc::new_cyclic(|weak: &Weak<MidiKeyboardSegment>| {
            let mut state = SegmentState {
                mode: Mode::Off,
                channel_mask: 0xFFFF,
                note_min: 0,
                note_max: 127,
                output_port: 0,
                output_channel_lowest: 0,
                output_transposition: 0,
                retransmit_max_polyphony: 8,
                damper_pedal_enabled: true,
                use_voice_stealing: false,
                standalone_mode: false,
                pitch_wheel_range: 2.0,
                mpe_zone: MpeZone::Off,
                uses_keyboard_channel_pressure: false,
                uses_keyboard_pitch_wheel: true,
                uses_keyboard_mod_wheel: true,
                uses_keyboard_pedals: true,
                uses_keyboard_midi_controllers: false,
                controller_values: [0; CONTROL_MAX],
                controller_actions: [ControllerAction::Block; CONTROL_MAX],
                channel_for_note: HashMap::new(),
                channels_available: BTreeSet::new(),
                notes_held_in_pedal: BTreeSet::new(),
                note_onset_timestamps: [None; 128],
            };
            state.reset_controller_values();
            MidiKeyboardSegment {
                id,
                keyboard: keyboard.clone(),
                self_weak: weak.clone(),
                splitter: splitter.clone(),
                state: Mutex::new(state),
                factories: Mutex::new(Vec::new()),
                converters: Mutex::new(HashMap::new()),
            }
        });
        keyboard.set_mapping_factory(
            id,
            Arc::downgrade(&(segment.splitter.clone() as Arc<dyn MappingFactory>)),
        );
        segment
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn keyboard(&self) -> &Arc<PianoKeyboard> {
        &self.keyboard
    }

    // ----- Configuration accessors -----

    pub fn mode(&self) -> Mode {
        self.state.lock().unwrap().mode
    }

    pub fn output_port(&self) -> usize {
        self.state.lock().unwrap().output_port
    }

    pub fn set_output_port(&self, port: usize) {
        self.state.lock().unwrap().output_port = port;
    }

    pub fn output_transposition(&self) -> i32 {
        self.state.lock().unwrap().output_transposition
    }

    pub fn set_output_transposition(&self, transposition: i32) {
        self.state.lock().unwrap().output_transposition = transposition;
    }

    pub fn output_channel_lowest(&self) -> u8 {
        self.state.lock().unwrap().output_channel_lowest
    }

    /// Set the lowest output channel. In MPE mode the Lower Zone master
    /// channel is fixed, so member channels always start at 1 and the MCM is
    /// re-sent.
    pub fn set_output_channel_lowest(&self, channel: u8) {
        let resend_mcm = {
            let mut state = self.state.lock().unwrap();
            if state.mode == Mode::Mpe {
                state.output_channel_lowest = 0x01;
                true
            } else {
                state.output_channel_lowest = channel.min(15);
                if state.mode == Mode::Polyphonic {
                    Self::polyphonic_setup(&mut state);
                }
                false
            }
        };
        if resend_mcm {
            self.send_mpe_configuration_message();
        }
    }

    pub fn polyphony(&self) -> usize {
        self.state.lock().unwrap().retransmit_max_polyphony
    }

    /// Set the maximum simultaneous notes for the per-note-channel modes.
    pub fn set_polyphony(&self, polyphony: usize) {
        let resend_mcm = {
            let mut state = self.state.lock().unwrap();
            if state.mode == Mode::Polyphonic {
                self.all_notes_off_locked(&state);
            }
            if state.mode == Mode::Mpe {
                // Lower Zone: channel 0 is the Master Channel, so at most
                // 15 member channels are available
                state.retransmit_max_polyphony = polyphony.clamp(1, 15);
                true
            } else {
                state.retransmit_max_polyphony = polyphony.clamp(1, 16);
                if state.mode == Mode::Polyphonic {
                    Self::polyphonic_setup(&mut state);
                }
                false
            }
        };
        if resend_mcm {
            {
                let mut state = self.state.lock().unwrap();
                Self::mpe_setup(&mut state);
            }
            self.send_mpe_configuration_message();
        }
    }

    pub fn note_range(&self) -> (u8, u8) {
        let state = self.state.lock().unwrap();
        (state.note_min, state.note_max)
    }

    pub fn set_note_range(&self, min_note: u8, max_note: u8) {
        if min_note > max_note {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.note_min = min_note.min(127);
        state.note_max = max_note.min(127);
    }

    pub fn channel_mask(&self) -> u16 {
        self.state.lock().unwrap().channel_mask
    }

    pub fn set_channel_mask(&self, mask: u16) {
        self.state.lock().unwrap().channel_mask = mask;
    }

    pub fn enable_channel(&self, channel: u8) {
        if channel < 16 {
            self.state.lock().unwrap().channel_mask |= 1 << channel;
        }
    }

    pub fn disable_channel(&self, channel: u8) {
        if channel < 16 {
            self.state.lock().unwrap().channel_mask &= !(1 << channel);
        }
    }

    pub fn damper_pedal_enabled(&self) -> bool {
        self.state.lock().unwrap().damper_pedal_enabled
    }

    pub fn set_damper_pedal_enabled(&self, enabled: bool) {
        let went_off = {
            let mut state = self.state.lock().unwrap();
            let went_off = state.damper_pedal_enabled && !enabled;
            state.damper_pedal_enabled = enabled;
            went_off
        };
        if went_off {
            // Notes currently ringing in the pedal must be releasable again
            self.damper_pedal_went_off();
        }
    }

    pub fn voice_stealing_enabled(&self) -> bool {
        self.state.lock().unwrap().use_voice_stealing
    }

    pub fn set_voice_stealing_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().use_voice_stealing = enabled;
    }

    pub fn set_controller_pass(
        &self,
        channel_pressure: bool,
        pitch_wheel: bool,
        mod_wheel: bool,
        pedals: bool,
        other_controllers: bool,
    ) {
        let mut state = self.state.lock().unwrap();
        state.uses_keyboard_channel_pressure = channel_pressure;
        state.uses_keyboard_pitch_wheel = pitch_wheel;
        state.uses_keyboard_mod_wheel = mod_wheel;
        state.uses_keyboard_pedals = pedals;
        state.uses_keyboard_midi_controllers = other_controllers;
    }

    pub fn controller_value(&self, controller: usize) -> i32 {
        let state = self.state.lock().unwrap();
        state
            .controller_values
            .get(controller)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_controller_action(&self, controller: usize, action: ControllerAction) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.controller_actions.get_mut(controller) {
            *slot = action;
        }
    }

    pub fn midi_pitch_wheel_range(&self) -> f32 {
        self.state.lock().unwrap().pitch_wheel_range
    }

    /// Set the pitch-wheel range in semitones, optionally announcing it by
    /// RPN immediately.
    pub fn set_midi_pitch_wheel_range(&self, semitones: f32, send: bool) {
        self.state.lock().unwrap().pitch_wheel_range = semitones.clamp(0.0, 48.0);
        if send {
            self.send_midi_pitch_wheel_range();
        }
    }

    /// Send the pitch-wheel range RPN 0 to the channels the current mode
    /// plays on.
    pub fn send_midi_pitch_wheel_range(&self) {
        let (mode, port, lowest, polyphony, range) = {
            let state = self.state.lock().unwrap();
            (
                state.mode,
                state.output_port,
                state.output_channel_lowest,
                state.retransmit_max_polyphony,
                state.pitch_wheel_range,
            )
        };
        match mode {
            Mode::Polyphonic => {
                for channel in lowest..(lowest + polyphony as u8).min(16) {
                    self.send_pitch_wheel_range_rpn(port, channel, range);
                }
            }
            Mode::Mpe => self.send_pitch_wheel_range_rpn(port, 0x00, range),
            _ => self.send_pitch_wheel_range_rpn(port, lowest, range),
        }
    }

    fn send_pitch_wheel_range_rpn(&self, port: usize, channel: u8, range: f32) {
        let midi = self.keyboard.midi_output();
        let major = range.floor() as u8;
        let minor = (100.0 * (range - range.floor())) as u8;
        // Select RPN 0, write semitones and cents, deselect
        midi.send_control_change(port, channel, 101, 0);
        midi.send_control_change(port, channel, 100, 0);
        midi.send_control_change(port, channel, 6, major);
        midi.send_control_change(port, channel, 38, minor);
        midi.send_control_change(port, channel, 101, 127);
        midi.send_control_change(port, channel, 100, 127);
    }

    // ----- Allocation inspection -----

    /// Output channels currently free for allocation.
    pub fn available_channels(&self) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .channels_available
            .iter()
            .copied()
            .collect()
    }

    /// Output channel currently allocated to `note`, if any.
    pub fn channel_for_note(&self, note: u8) -> Option<u8> {
        self.state.lock().unwrap().channel_for_note.get(&note).copied()
    }

    /// Notes whose channels are reserved by the damper pedal.
    pub fn notes_held_in_pedal(&self) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .notes_held_in_pedal
            .iter()
            .copied()
            .collect()
    }

    // ----- Mode changes -----

    pub fn set_mode(&self, mode: Mode) {
        match mode {
            Mode::Off => self.set_mode_off(),
            Mode::PassThrough => self.set_mode_pass_through(),
            Mode::Monophonic => self.set_mode_monophonic(),
            Mode::Polyphonic => self.set_mode_polyphonic(),
            Mode::Mpe => self.set_mode_mpe(),
        }
    }

    pub fn set_mode_off(&self) {
        self.all_notes_off();
        self.remove_note_on_listener();
        let mut state = self.state.lock().unwrap();
        state.controller_actions = [ControllerAction::Block; CONTROL_MAX];
        state.mode = Mode::Off;
    }

    pub fn set_mode_pass_through(&self) {
        self.all_notes_off();
        self.remove_note_on_listener();
        let mut state = self.state.lock().unwrap();
        state.controller_actions = [ControllerAction::PassThrough; CONTROL_MAX];
        state.mode = Mode::PassThrough;
    }

    pub fn set_mode_monophonic(&self) {
        self.all_notes_off();
        self.remove_note_on_listener();
        let mut state = self.state.lock().unwrap();
        state.controller_actions = [ControllerAction::PassThrough; CONTROL_MAX];
        state.mode = Mode::Monophonic;
    }

    pub fn set_mode_polyphonic(&self) {
        self.all_notes_off();
        // In per-note-channel modes the final Note On is emitted from the
        // key's onset callback, once any touch grace has resolved.
        self.add_note_on_listener();
        let mut state = self.state.lock().unwrap();
        state.controller_actions = [ControllerAction::Broadcast; CONTROL_MAX];
        state.mode = Mode::Polyphonic;
        if state.retransmit_max_polyphony < 1 {
            state.retransmit_max_polyphony = 1;
        }
        Self::polyphonic_setup(&mut state);
    }

    pub fn set_mode_mpe(&self) {
        self.all_notes_off();
        self.add_note_on_listener();
        {
            let mut state = self.state.lock().unwrap();
            state.controller_actions = [ControllerAction::Broadcast; CONTROL_MAX];
            state.mode = Mode::Mpe;
            state.mpe_zone = MpeZone::Lower;
            Self::mpe_setup(&mut state);
        }
        // RPN 6 enables the zone at the receiver
        self.send_mpe_configuration_message();
    }

    fn polyphonic_setup(state: &mut SegmentState) {
        // Polyphony is bounded by the 16 MIDI channels above the lowest
        let lowest = state.output_channel_lowest as usize;
        if state.retransmit_max_polyphony + lowest > 16 {
            state.retransmit_max_polyphony = 16 - lowest;
        }
        state.refill_channels();
    }

    fn mpe_setup(state: &mut SegmentState) {
        // Lower Zone: Master Channel 1 (0x00); members assigned upward from 2
        state.output_channel_lowest = 0x01;
        state.retransmit_max_polyphony = state.retransmit_max_polyphony.clamp(1, 15);
        state.refill_channels();
    }

    /// Send the MPE Configuration Message (RPN 6) announcing the Lower Zone
    /// with the current member-channel count.
    fn send_mpe_configuration_message(&self) {
        let (port, polyphony) = {
            let state = self.state.lock().unwrap();
            (state.output_port, state.retransmit_max_polyphony)
        };
        let midi = self.keyboard.midi_output();
        let master = 0x00;
        midi.send_control_change(port, master, 0x79, 0x00);
        midi.send_control_change(port, master, 0x64, 0x06);
        midi.send_control_change(port, master, 0x65, 0x00);
        midi.send_control_change(port, master, 0x06, polyphony as u8);
    }

    // ----- Standalone mode (touch triggers notes without a MIDI keyboard) -----

    pub fn enable_standalone_mode(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.standalone_mode {
                return;
            }
            state.standalone_mode = true;
        }
        let handler: Arc<dyn OscHandler> = self.clone();
        self.keyboard.osc_hub().add_listener("/touchkeys/on", &handler);
        self.keyboard.osc_hub().add_listener("/touchkeys/off", &handler);
    }

    pub fn disable_standalone_mode(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.standalone_mode {
                return;
            }
            state.standalone_mode = false;
        }
        let handler: Arc<dyn OscHandler> = self.clone();
        let weak = Arc::downgrade(&handler);
        self.keyboard.osc_hub().remove_listener("/touchkeys/on", &weak);
        self.keyboard.osc_hub().remove_listener("/touchkeys/off", &weak);
    }

    fn add_note_on_listener(&self) {
        if let Some(this) = self.self_weak.upgrade() {
            let handler: Arc<dyn OscHandler> = this;
            self.keyboard.osc_hub().add_listener("/midi/noteon", &handler);
        }
    }

    fn remove_note_on_listener(&self) {
        if let Some(this) = self.self_weak.upgrade() {
            let handler: Arc<dyn OscHandler> = this;
            let weak = Arc::downgrade(&handler);
            self.keyboard.osc_hub().remove_listener("/midi/noteon", &weak);
        }
    }

    // ----- Message filtering -----

    /// Whether an incoming message belongs to this segment: channel mask
    /// test for channel messages, note-range test for note-bearing ones.
    pub fn responds_to_message(&self, message: &MidiMessage) -> bool {
        let state = self.state.lock().unwrap();
        if let Some(channel) = message.channel() {
            if state.channel_mask & (1 << channel) == 0 {
                return false;
            }
        }
        if let Some(note) = message.note() {
            if note < state.note_min || note > state.note_max {
                return false;
            }
        }
        true
    }

    pub fn responds_to_note(&self, note: u8) -> bool {
        let state = self.state.lock().unwrap();
        note >= state.note_min && note <= state.note_max
    }

    // ----- Incoming MIDI -----

    /// Handle one incoming MIDI message for this segment.
    pub fn midi_handler(&self, message: &MidiMessage) {
        let now = self.keyboard.current_timestamp();

        // Log note onsets and releases regardless of processing mode
        match *message {
            MidiMessage::NoteOn { note, .. } => {
                self.state.lock().unwrap().note_onset_timestamps[note as usize] = Some(now);
            }
            MidiMessage::NoteOff { note, .. } => {
                let mut state = self.state.lock().unwrap();
                // Keep the onset when the note will ring on in the pedal
                let keep = state.damper_pedal_enabled
                    && state.damper_pedal_is_down()
                    && (state.mode == Mode::Polyphonic || state.mode == Mode::Mpe);
                if !keep {
                    state.note_onset_timestamps[note as usize] = None;
                }
            }
            _ => {}
        }
        if message.is_all_notes_off() || message.is_all_sound_off() {
            let mut state = self.state.lock().unwrap();
            state.note_onset_timestamps = [None; 128];
        }

        match *message {
            MidiMessage::ControlChange {
                controller, value, ..
            } if !message.is_all_notes_off() && !message.is_all_sound_off() => {
                // The damper pedal may affect note allocation
                if controller == CONTROL_DAMPER_PEDAL {
                    let went_off = {
                        let state = self.state.lock().unwrap();
                        (value as i32) < PEDAL_ACTIVE_VALUE as i32 && state.damper_pedal_is_down()
                    };
                    if went_off {
                        self.damper_pedal_went_off();
                    }
                }

                let (uses, is_pedal) = {
                    let state = self.state.lock().unwrap();
                    if controller == CONTROL_MOD_WHEEL {
                        (state.uses_keyboard_mod_wheel, false)
                    } else if (64..=69).contains(&controller) {
                        (state.uses_keyboard_pedals, true)
                    } else {
                        (state.uses_keyboard_midi_controllers, false)
                    }
                };
                if uses {
                    self.state.lock().unwrap().controller_values[controller as usize] =
                        value as i32;
                    if is_pedal {
                        // Pedals are zone-wide: one copy on the master /
                        // lowest channel, never per-voice copies
                        let (port, channel) = {
                            let state = self.state.lock().unwrap();
                            (state.output_port, state.master_channel())
                        };
                        self.keyboard
                            .midi_output()
                            .send_control_change(port, channel, controller, value);
                    } else {
                        self.handle_control_change_retransmit(controller as usize, message);
                    }
                }
            }
            MidiMessage::ChannelAftertouch { value, .. } => {
                let uses = self.state.lock().unwrap().uses_keyboard_channel_pressure;
                if uses {
                    self.state.lock().unwrap().controller_values[CONTROL_CHANNEL_AFTERTOUCH] =
                        value as i32;
                    self.handle_control_change_retransmit(CONTROL_CHANNEL_AFTERTOUCH, message);
                }
            }
            MidiMessage::PitchWheel { value, .. } => {
                let (uses, mode, port, master) = {
                    let state = self.state.lock().unwrap();
                    (
                        state.uses_keyboard_pitch_wheel,
                        state.mode,
                        state.output_port,
                        state.master_channel(),
                    )
                };
                if uses {
                    if mode == Mode::Mpe {
                        // Zone-wide bend goes to the Master Channel rather
                        // than into per-note calculations
                        self.keyboard.midi_output().send_pitch_wheel(port, master, value);
                    } else {
                        self.state.lock().unwrap().controller_values[CONTROL_PITCH_WHEEL] =
                            value as i32;
                        self.handle_control_change_retransmit(CONTROL_PITCH_WHEEL, message);
                    }
                }
            }
            _ => {
                let mode = self.mode();
                match mode {
                    Mode::PassThrough => self.mode_pass_through_handler(message, now),
                    Mode::Monophonic => self.mode_monophonic_handler(message, now),
                    Mode::Polyphonic | Mode::Mpe => self.mode_per_note_channel_handler(message, now),
                    Mode::Off => {}
                }
            }
        }
    }

    fn mode_pass_through_handler(&self, message: &MidiMessage, now: Timestamp) {
        let (port, transposed) = {
            let state = self.state.lock().unwrap();
            (
                state.output_port,
                message.note().map(|n| state.transposed(n)),
            )
        };
        let midi = self.keyboard.midi_output();
        match *message {
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => {
                if let Some(key) = self.keyboard.key(note) {
                    key.midi_note_on(self.id, velocity, channel, now);
                }
                midi.send_note_on(port, channel, transposed.unwrap_or(note), velocity);
            }
            MidiMessage::NoteOff { channel, note, .. } => {
                if let Some(key) = self.keyboard.key(note) {
                    key.midi_note_off(self.id, now);
                }
                midi.send_note_off(port, channel, transposed.unwrap_or(note));
            }
            MidiMessage::PolyAftertouch {
                channel,
                note,
                value,
            } => {
                midi.send_aftertouch_poly(port, channel, transposed.unwrap_or(note), value);
            }
            _ => midi.send(port, *message),
        }
    }

    fn mode_monophonic_handler(&self, message: &MidiMessage, now: Timestamp) {
        let (port, channel) = {
            let state = self.state.lock().unwrap();
            (state.output_port, state.output_channel_lowest)
        };
        let midi = self.keyboard.midi_output();
        match *message {
            MidiMessage::NoteOn { note, velocity, .. } => {
                // The newest note owns the single output channel; everyone
                // else's mapping is suspended until it comes back on top
                if let Some(factory) = self.keyboard.mapping_factory(self.id) {
                    factory.suspend_all_mappings();
                }
                let transposed = self.state.lock().unwrap().transposed(note);
                midi.send_note_on(port, channel, transposed, velocity);
                if let Some(key) = self.keyboard.key(note) {
                    key.midi_note_on(self.id, velocity, channel, now);
                }
                if let Some(factory) = self.keyboard.mapping_factory(self.id) {
                    factory.resume_mapping(note, true);
                }
            }
            MidiMessage::NoteOff { note, .. } => {
                if let Some(key) = self.keyboard.key(note) {
                    key.midi_note_off(self.id, now);
                }
                // Stack discipline: reactivate the newest remaining note
                let newest = self.state.lock().unwrap().newest_note();
                if let (Some(factory), Some(newest)) =
                    (self.keyboard.mapping_factory(self.id), newest)
                {
                    factory.resume_mapping(newest, true);
                }
                let transposed = self.state.lock().unwrap().transposed(note);
                midi.send_note_off(port, channel, transposed);
            }
            _ => midi.send(port, *message),
        }
    }

    /// Polyphonic and MPE share their handler: each incoming note gets its
    /// own output channel so its controllers can be manipulated separately.
    fn mode_per_note_channel_handler(&self, message: &MidiMessage, now: Timestamp) {
        match *message {
            MidiMessage::Reset => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.refill_channels();
                }
                let port = self.output_port();
                self.keyboard.midi_output().send_reset(port);
            }
            MidiMessage::NoteOn { note, velocity, .. } => {
                let retrigger_channel = {
                    let state = self.state.lock().unwrap();
                    if state.channel_for_note.contains_key(&note)
                        && !state.notes_held_in_pedal.contains(&note)
                    {
                        state.channel_for_note.get(&note).copied()
                    } else {
                        None
                    }
                };
                if let Some(channel) = retrigger_channel {
                    // Retrigger an already-sounding note on its channel
                    let (port, transposed) = {
                        let state = self.state.lock().unwrap();
                        (state.output_port, state.transposed(note))
                    };
                    self.keyboard
                        .midi_output()
                        .send_note_on(port, channel, transposed, velocity);
                } else {
                    self.per_note_channel_note_on(note, velocity, now);
                }
            }
            MidiMessage::NoteOff { note, .. } => {
                self.per_note_channel_note_off(note, false, now);
            }
            MidiMessage::ControlChange { .. } => {
                // Only All Notes Off / All Sound Off reach this point
                let mut state = self.state.lock().unwrap();
                state.refill_channels();
            }
            MidiMessage::PolyAftertouch { note, value, .. } => {
                let target = {
                    let state = self.state.lock().unwrap();
                    state
                        .channel_for_note
                        .get(&note)
                        .copied()
                        .map(|ch| (state.output_port, ch, state.transposed(note)))
                };
                if let Some((port, channel, transposed)) = target {
                    self.keyboard
                        .midi_output()
                        .send_aftertouch_poly(port, channel, transposed, value);
                }
            }
            _ => {}
        }
    }

    /// Allocate a channel for a new note and start it through the key's
    /// fusion path (the final Note On is emitted from the onset callback).
    fn per_note_channel_note_on(&self, note: u8, velocity: u8, now: Timestamp) {
        let new_channel = {
            let mut state = self.state.lock().unwrap();

            if state.notes_held_in_pedal.contains(&note) {
                // A note still ringing in the pedal takes back its channel
                state.notes_held_in_pedal.remove(&note);
                match state.channel_for_note.get(&note).copied() {
                    Some(channel) => Some(channel),
                    None => {
                        warn!(note, "note held in pedal without a channel");
                        None
                    }
                }
            } else {
                None
            }
        };

        let new_channel = match new_channel {
            Some(channel) => channel,
            None => {
                // Stealing may require force-offs, which send MIDI; do the
                // decisions without the lock held across sends
                loop {
                    let (free, steal_from_pedal, steal_oldest) = {
                        let state = self.state.lock().unwrap();
                        if let Some(&channel) = state.channels_available.iter().next() {
                            (Some(channel), None, None)
                        } else if state.damper_pedal_enabled {
                            (None, state.oldest_note_in_pedal(), None)
                        } else if state.use_voice_stealing {
                            (None, None, state.oldest_note())
                        } else {
                            (None, None, None)
                        }
                    };
                    if let Some(channel) = free {
                        let mut state = self.state.lock().unwrap();
                        state.channels_available.remove(&channel);
                        state.channel_for_note.insert(note, channel);
                        break channel;
                    }
                    if let Some(old_note) = steal_from_pedal {
                        debug!(old_note, note, "stealing note from pedal");
                        self.per_note_channel_note_off(old_note, true, now);
                        continue;
                    }
                    // Pedal had nothing: try the active voices
                    let steal = {
                        let state = self.state.lock().unwrap();
                        if state.use_voice_stealing {
                            steal_oldest.or_else(|| state.oldest_note())
                        } else {
                            None
                        }
                    };
                    match steal {
                        Some(old_note) => {
                            debug!(old_note, note, "stealing voice");
                            self.per_note_channel_note_off(old_note, true, now);
                            continue;
                        }
                        None => {
                            debug!(note, "no output channel available, dropping note");
                            return;
                        }
                    }
                }
            }
        };

        if let Some(key) = self.keyboard.key(note) {
            // The key responds through /midi/noteon once touch fusion
            // resolves; our OSC handler emits the actual Note On.
            key.midi_note_on(self.id, velocity, new_channel, now);
        }
    }

    /// Release (or force-silence) a note's channel allocation.
    fn per_note_channel_note_off(&self, note: u8, force_off: bool, now: Timestamp) {
        let Some(old_channel) = ({
            let state = self.state.lock().unwrap();
            state.channel_for_note.get(&note).copied()
        }) else {
            let mut state = self.state.lock().unwrap();
            state.notes_held_in_pedal.remove(&note);
            state.note_onset_timestamps[note as usize] = None;
            return;
        };

        if let Some(key) = self.keyboard.key(note) {
            key.midi_note_off(self.id, now);
        }

        let (port, transposed, damper_value, sostenuto_value) = {
            let state = self.state.lock().unwrap();
            (
                state.output_port,
                state.transposed(note),
                state.controller_values[CONTROL_DAMPER_PEDAL as usize],
                state.controller_values[CONTROL_SOSTENUTO_PEDAL as usize],
            )
        };
        let midi = self.keyboard.midi_output();
        if force_off {
            // Silencing a held note: momentarily lift any pedals holding it
            if damper_value >= PEDAL_ACTIVE_VALUE as i32 {
                midi.send_control_change(port, old_channel, CONTROL_DAMPER_PEDAL, 0);
            }
            if sostenuto_value >= PEDAL_ACTIVE_VALUE as i32 {
                midi.send_control_change(port, old_channel, CONTROL_SOSTENUTO_PEDAL, 0);
            }
            midi.send_control_change(port, old_channel, CONTROL_ALL_NOTES_OFF, 0);
            midi.send_control_change(port, old_channel, CONTROL_ALL_SOUND_OFF, 0);
        } else {
            midi.send_note_off(port, old_channel, transposed);
        }

        {
            let mut state = self.state.lock().unwrap();
            if state.damper_pedal_enabled && state.damper_pedal_is_down() && !force_off {
                // Keep the channel reserved while the note rings in the pedal
                state.notes_held_in_pedal.insert(note);
            } else {
                state.notes_held_in_pedal.remove(&note);
                if let Some(channel) = state.channel_for_note.remove(&note) {
                    state.channels_available.insert(channel);
                }
                state.note_onset_timestamps[note as usize] = None;
            }
        }

        if force_off {
            // Restore any pedals we lifted on this channel
            if damper_value >= PEDAL_ACTIVE_VALUE as i32 {
                midi.send_control_change(
                    port,
                    old_channel,
                    CONTROL_DAMPER_PEDAL,
                    damper_value as u8,
                );
            }
            if sostenuto_value >= PEDAL_ACTIVE_VALUE as i32 {
                midi.send_control_change(
                    port,
                    old_channel,
                    CONTROL_SOSTENUTO_PEDAL,
                    sostenuto_value as u8,
                );
            }
        }
    }

    /// Pedal went off: all reserved channels release in a single step.
    fn damper_pedal_went_off(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.damper_pedal_enabled {
            return;
        }
        let held: Vec<u8> = state.notes_held_in_pedal.iter().copied().collect();
        for note in held {
            if let Some(channel) = state.channel_for_note.remove(&note) {
                debug!(note, channel, "releasing pedal-held note");
                state.channels_available.insert(channel);
            }
            state.note_onset_timestamps[note as usize] = None;
        }
        state.notes_held_in_pedal.clear();
    }

    /// Retransmit an incoming controller according to its configured action.
    /// A controller with an OSC-MIDI converter resends the converter's
    /// summed value instead of raw-passing the incoming message.
    fn handle_control_change_retransmit(&self, controller: usize, message: &MidiMessage) {
        let (action, port, lowest, polyphony) = {
            let state = self.state.lock().unwrap();
            (
                state.controller_actions[controller],
                state.output_port,
                state.output_channel_lowest,
                state.retransmit_max_polyphony,
            )
        };
        let converter = self
            .converters
            .lock()
            .unwrap()
            .get(&controller)
            .map(|(converter, _)| converter.clone());
        let midi = self.keyboard.midi_output();

        match action {
            ControllerAction::PassThrough => {
                if let Some(converter) = converter {
                    converter.resend(message.channel().unwrap_or(0));
                } else {
                    midi.send(port, *message);
                }
            }
            ControllerAction::Broadcast => {
                for channel in lowest..(lowest + polyphony as u8).min(16) {
                    if let Some(converter) = converter.as_ref() {
                        converter.resend(channel);
                    } else {
                        midi.send(port, message.with_channel(channel));
                    }
                }
            }
            ControllerAction::SendToLatest => {
                let newest = self.state.lock().unwrap().newest_note();
                let Some(note) = newest else {
                    return;
                };
                let Some(channel) = self.keyboard.key(note).and_then(|k| k.midi_channel()) else {
                    return;
                };
                if let Some(converter) = converter {
                    converter.resend(channel);
                } else {
                    midi.send(port, message.with_channel(channel));
                }
            }
            ControllerAction::Block => {}
        }
    }

    /// Silence everything this segment may be sounding.
    pub fn all_notes_off(&self) {
        let state = self.state.lock().unwrap();
        self.all_notes_off_locked(&state);
    }

    fn all_notes_off_locked(&self, state: &SegmentState) {
        let midi = self.keyboard.midi_output();
        for channel in 0..16 {
            midi.send_control_change(state.output_port, channel, CONTROL_ALL_NOTES_OFF, 0);
        }
    }

    // ----- OSC-MIDI converters, reference counted per controller -----

    /// Acquire the converter for `controller`, creating it on first use.
    pub fn acquire_osc_midi_converter(self: &Arc<Self>, controller: usize) -> Arc<OscMidiConverter> {
        let mut converters = self.converters.lock().unwrap();
        match converters.get_mut(&controller) {
            Some((converter, refs)) => {
                *refs += 1;
                converter.clone()
            }
            None => {
                let converter = OscMidiConverter::new(&self.keyboard, self, controller);
                converters.insert(controller, (converter.clone(), 1));
                converter
            }
        }
    }

    /// Release a previously acquired converter; the last release drops it.
    pub fn release_osc_midi_converter(&self, controller: usize) {
        let mut converters = self.converters.lock().unwrap();
        let Some((_, refs)) = converters.get_mut(&controller) else {
            warn!(controller, "releasing a converter that was never acquired");
            return;
        };
        *refs -= 1;
        if *refs == 0 {
            converters.remove(&controller);
        }
    }

    pub fn osc_midi_converter(&self, controller: usize) -> Option<Arc<OscMidiConverter>> {
        self.converters
            .lock()
            .unwrap()
            .get(&controller)
            .map(|(converter, _)| converter.clone())
    }

    // ----- Mapping factories -----

    pub fn mapping_factories(&self) -> Vec<Arc<dyn MappingFactory>> {
        self.factories.lock().unwrap().clone()
    }

    pub fn create_mapping_factory_for_index(
        self: &Arc<Self>,
        index: usize,
    ) -> Option<Arc<dyn MappingFactory>> {
        let kind = MappingFactoryKind::from_index(index)?;
        Some(create_factory(kind, &self.keyboard, self))
    }

    /// Add a factory to this segment, autogenerating a unique short name
    /// unless one was already set.
    pub fn add_mapping_factory(&self, factory: Arc<dyn MappingFactory>, autogenerate_name: bool) {
        let mut factories = self.factories.lock().unwrap();
        if factories.iter().any(|f| Arc::ptr_eq(f, &factory)) {
            return;
        }

        if autogenerate_name {
            let base: String = factory
                .kind()
                .type_name()
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            let mut name = base.clone();
            let mut digit = 2;
            while factories.iter().any(|f| f.short_name() == name) {
                name = format!("{base}{digit}");
                digit += 1;
            }
            factory.set_name(&name, self.output_port());
        }

        self.splitter.add_factory(&factory);
        factories.push(factory);
    }

    pub fn remove_mapping_factory(&self, factory: &Arc<dyn MappingFactory>) {
        let mut factories = self.factories.lock().unwrap();
        if let Some(position) = factories.iter().position(|f| Arc::ptr_eq(f, factory)) {
            self.splitter.remove_factory(factory);
            factories.remove(position);
        }
    }

    pub fn remove_all_mapping_factories(&self) {
        let mut factories = self.factories.lock().unwrap();
        for factory in factories.drain(..) {
            self.splitter.remove_factory(&factory);
        }
    }

    // ----- OSC control -----

    /// Handle a per-segment control command (`/set-midi-mode`, ...),
    /// replying `/result 0` on success and `/result 1` on failure.
    pub fn osc_control_method(self: &Arc<Self>, path: &str, args: &[OscType]) -> Option<OscMessage> {
        if let Some(subpath) = path.strip_prefix("/mapping/") {
            // Address a named factory: /mapping/<name>/<verb>
            let separator = subpath.find('/')?;
            if separator == 0 || separator == subpath.len() - 1 {
                return None;
            }
            let (name, action) = subpath.split_at(separator);
            let factory = self
                .factories
                .lock()
                .unwrap()
                .iter()
                .find(|f| f.short_name() == name)
                .cloned()?;
            if action == "/delete" {
                self.remove_mapping_factory(&factory);
                return Some(success_message());
            }
            let response = factory.osc_control(action, args)?;
            if response.addr == "/result" {
                return Some(response);
            }
            let mut response = response;
            response.addr = format!("/mapping/{name}{}", response.addr);
            return Some(response);
        }

        match path {
            "/list-mappings" => {
                let factories = self.factories.lock().unwrap();
                let mut args: Vec<OscType> = vec![OscType::Int(factories.len() as i32)];
                for factory in factories.iter() {
                    args.push(OscType::String(factory.short_name()));
                }
                Some(OscMessage {
                    addr: "/list-mappings/result".to_string(),
                    args,
                })
            }
            "/add-mapping" => {
                let index = int_arg(args, 0)?;
                if index < 0 {
                    return Some(failure_message());
                }
                let Some(factory) = self.create_mapping_factory_for_index(index as usize) else {
                    return Some(failure_message());
                };
                if let Some(name) = string_arg(args, 1) {
                    factory.set_name(name, self.output_port());
                    self.add_mapping_factory(factory, false);
                } else {
                    self.add_mapping_factory(factory, true);
                }
                Some(success_message())
            }
            "/set-range" => {
                let (low, high) = (int_arg(args, 0)?, int_arg(args, 1)?);
                if !(0..=127).contains(&low) || !(0..=127).contains(&high) {
                    return Some(failure_message());
                }
                let (low, high) = (low.min(high) as u8, low.max(high) as u8);
                self.set_note_range(low, high);
                Some(success_message())
            }
            "/set-transpose" => {
                let transpose = int_arg(args, 0)?;
                if !(-48..=48).contains(&transpose) {
                    return Some(failure_message());
                }
                self.set_output_transposition(transpose);
                Some(success_message())
            }
            "/set-transpose-octave-up" => {
                self.set_output_transposition((self.output_transposition() + 12).min(48));
                Some(success_message())
            }
            "/set-transpose-octave-down" => {
                self.set_output_transposition((self.output_transposition() - 12).max(-48));
                Some(success_message())
            }
            "/set-controller-pass" => {
                if args.len() < 5 {
                    return None;
                }
                let flags: Vec<bool> = (0..5).filter_map(|i| int_arg(args, i)).map(|v| v != 0).collect();
                if flags.len() < 5 {
                    return None;
                }
                self.set_controller_pass(flags[0], flags[1], flags[2], flags[3], flags[4]);
                Some(success_message())
            }
            "/set-pitchwheel-range" => {
                let range = float_arg(args, 0)?;
                self.set_midi_pitch_wheel_range(range, false);
                Some(success_message())
            }
            "/send-pitchwheel-range" => {
                self.send_midi_pitch_wheel_range();
                Some(success_message())
            }
            "/set-midi-mode" => {
                let mode = string_arg(args, 0)?;
                if mode == "off" {
                    self.set_mode_off();
                } else if mode.starts_with("pass") {
                    self.set_mode_pass_through();
                } else if mode.starts_with("mono") {
                    self.set_mode_monophonic();
                } else if mode.starts_with("poly") {
                    self.set_mode_polyphonic();
                } else if mode.starts_with("mpe") {
                    self.set_mode_mpe();
                } else {
                    return Some(failure_message());
                }
                Some(success_message())
            }
            "/set-midi-channels" => {
                let (low, high) = (int_arg(args, 0)?, int_arg(args, 1)?);
                if !(1..=16).contains(&low) || !(1..=16).contains(&high) {
                    return Some(failure_message());
                }
                let (low, high) = (low.min(high), low.max(high));
                self.set_output_channel_lowest((low - 1) as u8);
                self.set_polyphony((high - low + 1).max(1) as usize);
                Some(success_message())
            }
            "/set-midi-stealing" => {
                let enabled = int_arg(args, 0)?;
                self.set_voice_stealing_enabled(enabled != 0);
                Some(success_message())
            }
            _ => None,
        }
    }

    pub fn factory_type_names() -> &'static [&'static str] {
        factory_kind_names()
    }

    // ----- Preset content -----

    pub fn preset(&self) -> SegmentPreset {
        let state = self.state.lock().unwrap();
        SegmentPreset {
            output_port: state.output_port,
            mode: state.mode.index(),
            channel_mask: state.channel_mask,
            note_min: state.note_min,
            note_max: state.note_max,
            output_channel_lowest: state.output_channel_lowest,
            output_transposition: state.output_transposition,
            damper_pedal_enabled: state.damper_pedal_enabled,
            uses_keyboard_channel_pressure: state.uses_keyboard_channel_pressure,
            uses_keyboard_pitch_wheel: state.uses_keyboard_pitch_wheel,
            uses_keyboard_mod_wheel: state.uses_keyboard_mod_wheel,
            uses_keyboard_pedals: state.uses_keyboard_pedals,
            uses_keyboard_midi_controllers: state.uses_keyboard_midi_controllers,
            pitch_wheel_range: state.pitch_wheel_range,
            retransmit_max_polyphony: state.retransmit_max_polyphony,
            use_voice_stealing: state.use_voice_stealing,
            mapping_factories: self
                .factories
                .lock()
                .unwrap()
                .iter()
                .map(|f| f.preset())
                .collect(),
        }
    }

    pub fn load_preset(self: &Arc<Self>, preset: &SegmentPreset) -> bool {
        self.remove_all_mapping_factories();
        {
            let mut state = self.state.lock().unwrap();
            state.output_port = preset.output_port;
            state.channel_mask = preset.channel_mask;
            state.note_min = preset.note_min.min(127);
            state.note_max = preset.note_max.min(127);
            state.output_channel_lowest = preset.output_channel_lowest.min(15);
            state.output_transposition = preset.output_transposition;
            state.damper_pedal_enabled = preset.damper_pedal_enabled;
            state.uses_keyboard_channel_pressure = preset.uses_keyboard_channel_pressure;
            state.uses_keyboard_pitch_wheel = preset.uses_keyboard_pitch_wheel;
            state.uses_keyboard_mod_wheel = preset.uses_keyboard_mod_wheel;
            state.uses_keyboard_pedals = preset.uses_keyboard_pedals;
            state.uses_keyboard_midi_controllers = preset.uses_keyboard_midi_controllers;
            state.pitch_wheel_range = preset.pitch_wheel_range;
            state.use_voice_stealing = preset.use_voice_stealing;
        }
        self.set_polyphony(preset.retransmit_max_polyphony);
        // Mode last: it derives controller actions and channel sets
        self.set_mode(Mode::from_index(preset.mode));

        for factory_preset in &preset.mapping_factories {
            let Some(factory) = self.create_factory_for_preset(factory_preset) else {
                continue;
            };
            if !factory.load_preset(factory_preset) {
                return false;
            }
            self.add_mapping_factory(factory, false);
        }
        true
    }

    fn create_factory_for_preset(
        self: &Arc<Self>,
        preset: &FactoryPreset,
    ) -> Option<Arc<dyn MappingFactory>> {
        Some(create_factory(preset.kind, &self.keyboard, self))
    }
}

impl Drop for MidiKeyboardSegment {
    fn drop(&mut self) {
        self.keyboard.remove_mapping_factory(self.id);
    }
}

impl OscHandler for MidiKeyboardSegment {
    fn osc_message(&self, path: &str, args: &[OscType]) -> bool {
        let standalone = self.state.lock().unwrap().standalone_mode;
        if standalone {
            if path == "/touchkeys/on" {
                if let Some(note) = int_arg(args, 0) {
                    if (0..128).contains(&note) && self.responds_to_note(note as u8) {
                        self.midi_handler(&MidiMessage::NoteOn {
                            channel: 0,
                            note: note as u8,
                            velocity: 64,
                        });
                    }
                    return true;
                }
            } else if path == "/touchkeys/off" {
                if let Some(note) = int_arg(args, 0) {
                    if (0..128).contains(&note) && self.responds_to_note(note as u8) {
                        self.midi_handler(&MidiMessage::NoteOff {
                            channel: 0,
                            note: note as u8,
                            velocity: 64,
                        });
                    }
                    return true;
                }
            }
        }

        // Note-on callback for the per-note-channel modes: the key has
        // finished its touch fusion, so emit the real Note On now.
        if path == "/midi/noteon" {
            let mode = self.mode();
            if mode != Mode::Polyphonic && mode != Mode::Mpe {
                return false;
            }
            let (Some(note), Some(channel), Some(velocity)) = (
                int_arg(args, 0),
                int_arg(args, 1),
                int_arg(args, 2),
            ) else {
                return false;
            };
            if !(0..128).contains(&note) || !self.responds_to_note(note as u8) {
                // Multiple segments share the message bus; not ours
                return false;
            }
            let (port, transposed) = {
                let state = self.state.lock().unwrap();
                (state.output_port, state.transposed(note as u8))
            };
            self.keyboard.midi_output().send_note_on(
                port,
                (channel as u8).min(15),
                transposed,
                (velocity as u8).min(127),
            );
            return true;
        }
        false
    }
}
