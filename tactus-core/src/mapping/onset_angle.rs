// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Onset angle: finger swipe speed at note onset
//!
//! Measures how fast the finger was moving along the key surface at the
//! moment of MIDI note onset by scanning the last ~100 ms of touch history
//! for the contiguous touch segment immediately preceding the onset. Fast
//! swipes optionally drive a short downward pitch "scoop" that decays back
//! to center.

use std::sync::{Arc, Mutex, Weak};

use rosc::{OscMessage, OscType};
use tracing::debug;

use super::factory::{
    impl_note_factory_delegates, KeyEventContext, MappingFactory, MappingFactoryKind,
    NoteFactorySupport,
};
use super::{engage_mapping, Mapping, MappingCommon};
use crate::config::FactoryPreset;
use crate::keyboard::PianoKeyboard;
use crate::node::Node;
use crate::segment::MidiKeyboardSegment;
use crate::touch::KeyTouchFrame;
use crate::trigger::{SourceId, TriggerListener};
use crate::types::{delta_secs, millis, Timestamp, TimestampDelta};

const DEFAULT_FILTER_BUFFER_LENGTH: usize = 30;
/// How far back (in time) to look for the pre-onset touch segment.
const DEFAULT_MAX_LOOKBACK_TIME: TimestampDelta = millis(100);
/// Hard cap on samples examined during the scan.
const DEFAULT_MAX_LOOKBACK_SAMPLES: usize = 20;
/// Upper bound on reported swipe speed (key lengths per second). Backward
/// swipes pass through with their full negative velocity.
const MAX_ONSET_VELOCITY: f32 = 6.0;
/// Below this speed no scoop is generated.
const SCOOP_VELOCITY_THRESHOLD: f32 = 1.5;

struct OnsetAngleState {
    starting_pitch_bend_semitones: f32,
    last_pitch_bend_semitones: f32,
    ramp_begin_time: Option<Timestamp>,
    ramp_length: TimestampDelta,
}

/// Per-note onset-angle measurement and scoop generator.
pub struct OnsetAngleMapping {
    common: MappingCommon,
    past_samples: Arc<Node<KeyTouchFrame>>,
    state: Mutex<OnsetAngleState>,
}

impl OnsetAngleMapping {
    pub fn new(keyboard: &Arc<PianoKeyboard>, ctx: &KeyEventContext) -> Arc<Self> {
        Arc::new(OnsetAngleMapping {
            common: MappingCommon::new(
                keyboard,
                ctx.note_number,
                ctx.touch_buffer.clone(),
                ctx.position_buffer.clone(),
                ctx.tracker.clone(),
            ),
            past_samples: Node::with_capacity(DEFAULT_FILTER_BUFFER_LENGTH),
            state: Mutex::new(OnsetAngleState {
                starting_pitch_bend_semitones: 0.0,
                last_pitch_bend_semitones: 0.0,
                ramp_begin_time: None,
                ramp_length: 0,
            }),
        })
    }

    /// Scan the saved touch history backwards from `timestamp` and compute
    /// the swipe velocity across the contiguous touch segment preceding the
    /// onset.
    pub fn process_onset(&self, timestamp: Timestamp) {
        let velocity = {
            let samples = self.past_samples.read();
            if samples.is_empty() {
                None
            } else {
                let newest = samples.end_index() - 1;
                let mut index = newest;
                let mut most_recent_touch_index = newest;
                let mut touch_was_on = false;
                let mut examined = 0usize;

                loop {
                    let Some(frame) = samples.get(index) else {
                        break;
                    };
                    let Some(frame_time) = samples.timestamp_at(index) else {
                        break;
                    };
                    if timestamp.delta_since(frame_time) >= DEFAULT_MAX_LOOKBACK_TIME {
                        break;
                    }
                    if frame.count == 0 {
                        if touch_was_on {
                            // A break in the touch ends the segment, unless
                            // the trailing frames were already empty
                            if index < newest {
                                index += 1;
                            }
                            break;
                        }
                    } else if !touch_was_on {
                        most_recent_touch_index = index;
                        touch_was_on = true;
                    }
                    examined += 1;
                    if examined >= DEFAULT_MAX_LOOKBACK_SAMPLES || index == samples.begin_index() {
                        break;
                    }
                    index -= 1;
                }
                let index = index.max(samples.begin_index());

                let start_time = samples.timestamp_at(index);
                let end_time = samples.timestamp_at(most_recent_touch_index);
                match (start_time, end_time) {
                    (Some(start), Some(end)) if end > start => {
                        let start_pos = samples.get(index).map(|f| f.locs[0]).unwrap_or(-1.0);
                        let end_pos = samples
                            .get(most_recent_touch_index)
                            .map(|f| f.locs[0])
                            .unwrap_or(-1.0);
                        Some((end_pos - start_pos) / delta_secs(end.delta_since(start)) as f32)
                    }
                    _ => None,
                }
            }
        };

        let Some(velocity) = velocity else {
            return;
        };
        let velocity = velocity.min(MAX_ONSET_VELOCITY);
        debug!(note = self.common.note_number(), velocity, "onset angle");

        if velocity > SCOOP_VELOCITY_THRESHOLD {
            let mut state = self.state.lock().unwrap();
            state.starting_pitch_bend_semitones = -velocity / 5.0;
            state.ramp_length = millis((50.0 + velocity * 25.0) as i64);
            state.ramp_begin_time = Some(self.common.now());
        } else {
            self.state.lock().unwrap().ramp_length = 0;
        }

        self.send_onset_angle_message(velocity);
    }

    fn send_onset_angle_message(&self, angle: f32) {
        if self.common.suspended() {
            return;
        }
        if let Some(keyboard) = self.common.keyboard() {
            keyboard.send_message(
                "/touchkeys/onsetangle",
                vec![
                    OscType::Int(self.common.note_number() as i32),
                    OscType::Float(angle),
                ],
            );
        }
    }

    fn send_pitch_bend_message(&self, semitones: f32) {
        if self.common.suspended() {
            return;
        }
        if let Some(keyboard) = self.common.keyboard() {
            keyboard.send_message(
                "/touchkeys/scoop",
                vec![
                    OscType::Int(self.common.note_number() as i32),
                    OscType::Float(semitones),
                ],
            );
        }
    }
}

impl TriggerListener for OnsetAngleMapping {
    fn trigger_received(&self, source: SourceId, _timestamp: Timestamp) {
        if source != self.common.touch_buffer().source_id() {
            return;
        }
        // Keep our own copy of the frames: the MIDI onset may arrive after
        // the touch has already ended and the shared buffer cleared
        let buffer = self.common.touch_buffer();
        if let (Some(frame), Some(timestamp)) = (buffer.latest(), buffer.latest_timestamp()) {
            self.past_samples.insert(frame, timestamp);
        }
    }
}

impl Mapping for OnsetAngleMapping {
    fn common(&self) -> &MappingCommon {
        &self.common
    }

    fn midi_note_on_received(&self, channel: u8, _velocity: u8) {
        self.common.set_note_on(Some(channel));
        self.process_onset(self.common.now());
    }

    fn midi_note_off_received(&self, _channel: u8) {
        self.common.set_note_on(None);
    }

    fn reset(&self) {
        self.common.reset();
        self.past_samples.clear();
        let mut state = self.state.lock().unwrap();
        state.ramp_length = 0;
        state.last_pitch_bend_semitones = 0.0;
    }

    /// Walk the scoop ramp back toward center.
    fn perform_mapping(&self) -> Option<Timestamp> {
        if !self.common.engaged() {
            return None;
        }
        let now = self.common.now();
        let send = {
            let mut state = self.state.lock().unwrap();
            let in_ramp = state.ramp_length != 0
                && state
                    .ramp_begin_time
                    .map(|begin| now.delta_since(begin) <= state.ramp_length)
                    .unwrap_or(false);
            if in_ramp {
                let elapsed = now.delta_since(state.ramp_begin_time.unwrap());
                let ramp_value = 1.0 - elapsed as f32 / state.ramp_length as f32;
                state.last_pitch_bend_semitones =
                    state.starting_pitch_bend_semitones * ramp_value;
                Some(state.last_pitch_bend_semitones)
            } else if state.last_pitch_bend_semitones != 0.0 {
                state.last_pitch_bend_semitones = 0.0;
                Some(0.0)
            } else {
                None
            }
        };
        if let Some(semitones) = send {
            self.send_pitch_bend_message(semitones);
        }
        Some(self.common.next_update_time())
    }
}

/// Factory for [`OnsetAngleMapping`]s.
pub struct OnsetAngleMappingFactory {
    support: NoteFactorySupport,
    self_weak: Weak<OnsetAngleMappingFactory>,
}

impl OnsetAngleMappingFactory {
    pub fn new(
        keyboard: &Arc<PianoKeyboard>,
        segment: &Arc<MidiKeyboardSegment>,
    ) -> Arc<dyn MappingFactory> {
        Arc::new_cyclic(|weak: &Weak<OnsetAngleMappingFactory>| OnsetAngleMappingFactory {
            support: NoteFactorySupport::new(keyboard, segment),
            self_weak: weak.clone(),
        })
    }

    fn make_mapping(&self, ctx: &KeyEventContext) -> Arc<dyn Mapping> {
        let keyboard = self.support.keyboard().expect("keyboard gone");
        let mapping = OnsetAngleMapping::new(&keyboard, ctx);
        mapping.common().set_control_name(&self.support.control_name());
        engage_mapping(&mapping);
        mapping
    }
}

impl MappingFactory for OnsetAngleMappingFactory {
    impl_note_factory_delegates!();

    fn kind(&self) -> MappingFactoryKind {
        MappingFactoryKind::OnsetAngle
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
        self.support.osc_control_common(path, args)
    }

    fn preset(&self) -> FactoryPreset {
        self.support.common_preset(self.kind())
    }

    fn load_preset(&self, preset: &FactoryPreset) -> bool {
        self.support.load_common_preset(preset)
    }
}
