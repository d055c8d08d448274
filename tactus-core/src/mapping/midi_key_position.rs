// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! MIDI generation from continuous key position
//!
//! Produces MIDI notes directly from the position tracker's features: Note
//! On when press velocity becomes available, Note Off when release velocity
//! does, and an optional "percussiveness" Note On on a second channel for
//! struck notes. Between onset and release, key position past the bottom of
//! travel maps to polyphonic aftertouch.

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
use crate::segment::MidiKeyboardSegment;
use crate::tracker::NotificationKind;
use crate::trigger::{SourceId, TriggerListener};
use crate::types::{KeyVelocity, Timestamp};

/// Aftertouch sensitivity: MIDI 127 corresponds to 0.03 beyond the threshold.
const DEFAULT_AFTERTOUCH_SCALER: f64 = 127.0 / 0.03;
/// Position at which aftertouch messages start.
const MINIMUM_AFTERTOUCH_POSITION: f64 = 0.99;
/// Scaler from the percussiveness feature to normalized MIDI velocity.
const DEFAULT_PERCUSSIVENESS_SCALER: f64 = 1.0 / 300.0;
/// Press velocity corresponding to MIDI velocity 127.
const KEY_VELOCITY_FOR_MAX_MIDI: KeyVelocity = 40.0;
/// Release velocity corresponding to MIDI release velocity 127.
const KEY_RELEASE_VELOCITY_FOR_MAX_MIDI: KeyVelocity = -50.0;

struct KeyPositionState {
    note_is_on: bool,
    last_aftertouch: u8,
    aftertouch_scaler: f64,
    percussiveness_channel: Option<u8>,
}

/// Per-note mapping from continuous position to MIDI notes and aftertouch.
pub struct MidiKeyPositionMapping {
    common: MappingCommon,
    segment: Weak<MidiKeyboardSegment>,
    state: Mutex<KeyPositionState>,
}

impl MidiKeyPositionMapping {
    pub fn new(
        keyboard: &Arc<PianoKeyboard>,
        segment: &Arc<MidiKeyboardSegment>,
        ctx: &KeyEventContext,
    ) -> Arc<Self> {
        Arc::new(MidiKeyPositionMapping {
            common: MappingCommon::new(
                keyboard,
                ctx.note_number,
                ctx.touch_buffer.clone(),
                ctx.position_buffer.clone(),
                ctx.tracker.clone(),
            ),
            segment: Arc::downgrade(segment),
            state: Mutex::new(KeyPositionState {
                note_is_on: false,
                last_aftertouch: 0,
                aftertouch_scaler: DEFAULT_AFTERTOUCH_SCALER,
                percussiveness_channel: None,
            }),
        })
    }

    /// Aftertouch sensitivity: 0 disables, 1 is the default scale.
    pub fn set_aftertouch_sensitivity(&self, sensitivity: f64) {
        self.state.lock().unwrap().aftertouch_scaler = if sensitivity <= 0.0 {
            0.0
        } else {
            DEFAULT_AFTERTOUCH_SCALER * sensitivity
        };
    }

    /// Channel for percussiveness note-ons; `None` disables them.
    pub fn set_percussiveness_channel(&self, channel: Option<u8>) {
        self.state.lock().unwrap().percussiveness_channel = channel;
    }

    fn output(&self) -> Option<(usize, u8)> {
        let segment = self.segment.upgrade()?;
        let channel = self.common.midi_channel().unwrap_or(0);
        Some((segment.output_port(), channel))
    }

    fn generate_note_on(&self) {
        let Some((port, channel)) = self.output() else {
            return;
        };
        let Some(keyboard) = self.common.keyboard() else {
            return;
        };
        let velocity = self
            .common
            .tracker()
            .press_velocity()
            .map(|(_, v)| (v / KEY_VELOCITY_FOR_MAX_MIDI).clamp(0.0, 1.0))
            .unwrap_or(0.5);
        debug!(note = self.common.note_number(), velocity, "position-derived note on");
        keyboard.midi_output().send_note_on(
            port,
            channel,
            self.common.note_number(),
            (velocity * 127.0) as u8,
        );
    }

    fn generate_note_off(&self) {
        let Some((port, channel)) = self.output() else {
            return;
        };
        let Some(keyboard) = self.common.keyboard() else {
            return;
        };
        let release = self
            .common
            .tracker()
            .release_velocity()
            .map(|(_, v)| (v / KEY_RELEASE_VELOCITY_FOR_MAX_MIDI).clamp(0.0, 1.0))
            .unwrap_or(0.5);
        let velocity = (release * 127.0) as u8;
        let note = self.common.note_number();
        keyboard.midi_output().send(
            port,
            crate::midi::MidiMessage::NoteOff {
                channel,
                note,
                velocity,
            },
        );
        let percussiveness_channel = self.state.lock().unwrap().percussiveness_channel;
        if let Some(extra) = percussiveness_channel {
            keyboard.midi_output().send(
                port,
                crate::midi::MidiMessage::NoteOff {
                    channel: extra,
                    note,
                    velocity,
                },
            );
        }
        self.state.lock().unwrap().last_aftertouch = 0;
    }

    fn generate_percussiveness_note_on(&self) {
        let Some((port, _)) = self.output() else {
            return;
        };
        let channel = {
            let state = self.state.lock().unwrap();
            match state.percussiveness_channel {
                Some(channel) => channel,
                None => return,
            }
        };
        let Some(keyboard) = self.common.keyboard() else {
            return;
        };
        let Some(features) = self.common.tracker().press_percussiveness() else {
            return;
        };
        let velocity =
            (features.percussiveness * DEFAULT_PERCUSSIVENESS_SCALER).clamp(0.0, 1.0);
        debug!(
            note = self.common.note_number(),
            percussiveness = features.percussiveness,
            "percussiveness note on"
        );
        keyboard.midi_output().send_note_on(
            port,
            channel,
            self.common.note_number(),
            (velocity * 127.0) as u8,
        );
    }
}

impl TriggerListener for MidiKeyPositionMapping {
    fn trigger_received(&self, source: SourceId, _timestamp: Timestamp) {
        if source != self.common.tracker().node().source_id() {
            return;
        }
        let Some(notification) = self.common.tracker().node().latest() else {
            return;
        };
        match notification.kind {
            NotificationKind::FeatureAvailablePressVelocity => {
                let fire = {
                    let mut state = self.state.lock().unwrap();
                    if state.note_is_on {
                        false
                    } else {
                        state.note_is_on = true;
                        true
                    }
                };
                if fire {
                    self.generate_note_on();
                }
            }
            NotificationKind::FeatureAvailableReleaseVelocity => {
                let fire = {
                    let mut state = self.state.lock().unwrap();
                    if state.note_is_on {
                        state.note_is_on = false;
                        true
                    } else {
                        false
                    }
                };
                if fire {
                    self.generate_note_off();
                }
            }
            NotificationKind::FeatureAvailablePercussiveness => {
                self.generate_percussiveness_note_on();
            }
            _ => {}
        }
    }
}

impl Mapping for MidiKeyPositionMapping {
    fn common(&self) -> &MappingCommon {
        &self.common
    }

    /// Poll key position for aftertouch while the note sounds. Note on/off
    /// themselves are handled on the trigger path.
    fn perform_mapping(&self) -> Option<Timestamp> {
        if !self.common.engaged() {
            return None;
        }

        let position = self.common.position_buffer().latest();
        let send = {
            let mut state = self.state.lock().unwrap();
            match (state.note_is_on, position) {
                (true, Some(position)) => {
                    let value = if position < MINIMUM_AFTERTOUCH_POSITION {
                        0
                    } else {
                        (((position - MINIMUM_AFTERTOUCH_POSITION) * state.aftertouch_scaler)
                            .clamp(0.0, 127.0)) as u8
                    };
                    if value != state.last_aftertouch {
                        state.last_aftertouch = value;
                        Some(value)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let (Some(value), Some((port, channel)), Some(keyboard)) =
            (send, self.output(), self.common.keyboard())
        {
            if !self.common.suspended() {
                keyboard.midi_output().send_aftertouch_poly(
                    port,
                    channel,
                    self.common.note_number(),
                    value,
                );
            }
        }

        Some(self.common.next_update_time())
    }

    fn disengage(&self, should_delete: bool) {
        let was_on = {
            let mut state = self.state.lock().unwrap();
            let was_on = state.note_is_on;
            state.note_is_on = false;
            was_on
        };
        if was_on {
            self.generate_note_off();
        }
        self.common.disengage(should_delete);
    }

    fn reset(&self) {
        self.common.reset();
        self.state.lock().unwrap().note_is_on = false;
    }
}

struct KeyPositionFactoryParams {
    aftertouch_sensitivity: f64,
    percussiveness_channel: Option<u8>,
}

/// Factory for [`MidiKeyPositionMapping`]s.
pub struct MidiKeyPositionMappingFactory {
    support: NoteFactorySupport,
    params: Mutex<KeyPositionFactoryParams>,
    self_weak: Weak<MidiKeyPositionMappingFactory>,
}

impl MidiKeyPositionMappingFactory {
    pub fn new(
        keyboard: &Arc<PianoKeyboard>,
        segment: &Arc<MidiKeyboardSegment>,
    ) -> Arc<dyn MappingFactory> {
        Arc::new_cyclic(|weak: &Weak<MidiKeyPositionMappingFactory>| {
            MidiKeyPositionMappingFactory {
                support: NoteFactorySupport::new(keyboard, segment),
                params: Mutex::new(KeyPositionFactoryParams {
                    aftertouch_sensitivity: 1.0,
                    percussiveness_channel: None,
                }),
                self_weak: weak.clone(),
            }
        })
    }

    fn make_mapping(&self, ctx: &KeyEventContext) -> Arc<dyn Mapping> {
        let keyboard = self.support.keyboard().expect("keyboard gone");
        let segment = self.support.segment().expect("segment gone");
        let mapping = MidiKeyPositionMapping::new(&keyboard, &segment, ctx);
        {
            let params = self.params.lock().unwrap();
            mapping.set_aftertouch_sensitivity(params.aftertouch_sensitivity);
            mapping.set_percussiveness_channel(params.percussiveness_channel);
        }
        mapping.common().set_control_name(&self.support.control_name());
        engage_mapping(&mapping);
        mapping
    }

    pub fn set_aftertouch_sensitivity(&self, sensitivity: f64) {
        self.params.lock().unwrap().aftertouch_sensitivity = sensitivity.max(0.0);
    }

    pub fn set_percussiveness_channel(&self, channel: Option<u8>) {
        self.params.lock().unwrap().percussiveness_channel = channel;
    }
}

impl MappingFactory for MidiKeyPositionMappingFactory {
    impl_note_factory_delegates!();

    fn kind(&self) -> MappingFactoryKind {
        MappingFactoryKind::KeyPosition
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
        if let Some(mapping) = self.support.mapping(ctx.note_number) {
            mapping.common().set_note_on(ctx.midi_channel);
        }
    }

    fn midi_note_off(&self, ctx: &KeyEventContext) {
        if let Some(mapping) = self.support.mapping(ctx.note_number) {
            mapping.common().set_note_on(None);
        }
        self.support.handle_midi_note_off(ctx);
    }

    fn osc_control(&self, path: &str, args: &[OscType]) -> Option<OscMessage> {
        self.support.osc_control_common(path, args)
    }

    fn preset(&self) -> FactoryPreset {
        let mut preset = self.support.common_preset(self.kind());
        let params = self.params.lock().unwrap();
        preset.params = FactoryParams {
            aftertouch_sensitivity: Some(params.aftertouch_sensitivity as f32),
            percussiveness_channel: Some(
                params.percussiveness_channel.map(|c| c as i32).unwrap_or(-1),
            ),
            ..Default::default()
        };
        preset
    }

    fn load_preset(&self, preset: &FactoryPreset) -> bool {
        if !self.support.load_common_preset(preset) {
            return false;
        }
        if let Some(sensitivity) = preset.params.aftertouch_sensitivity {
            self.set_aftertouch_sensitivity(sensitivity as f64);
        }
        if let Some(channel) = preset.params.percussiveness_channel {
            self.set_percussiveness_channel(if channel >= 0 {
                Some(channel as u8)
            } else {
                None
            });
        }
        true
    }
}
