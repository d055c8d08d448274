// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Magnetic-resonator-piano mapping
//!
//! Drives an augmented-acoustic instrument over OSC with four continuous
//! quality streams per note (`/mrp/quality/{intensity,brightness,pitch,
//! harmonic}`) plus `/mrp/midi` note on/off. Everything derives from
//! continuous key position:
//!
//! - intensity follows key depth; brightness kicks in past the key bed;
//! - partial presses on a neighbouring key (within two semitones) of a key
//!   that is already down create a cooperative two-key pitch bend, with the
//!   partial press depth steering the bend amount on both notes;
//! - oscillating key velocity during a partial press (alternating threshold
//!   crossings with bounded peak spacing) reads as a vibrato gesture and
//!   accumulates the "harmonic" parameter;
//! - the key LED summarizes the active qualities as a hue/saturation/value
//!   mix.

use std::sync::{Arc, Mutex, Weak};

use rosc::{OscMessage, OscType};
use tracing::debug;

use super::factory::{
    impl_note_factory_delegates, KeyEventContext, MappingFactory, MappingFactoryKind,
    NoteFactorySupport,
};
use super::{engage_mapping, Mapping, MappingCommon};
use crate::config::{FactoryParams, FactoryPreset};
use crate::filter::{design_second_order_lowpass, IirFilterNode};
use crate::keyboard::PianoKeyboard;
use crate::node::Node;
use crate::segment::MidiKeyboardSegment;
use crate::tracker::{KeyPositionTracker, KeyState};
use crate::trigger::{SourceId, TriggerListener};
use crate::types::{delta_secs, micros_interval, KeyPosition, KeyVelocity, Timestamp, TimestampDelta};

const VELOCITY_BUFFER_LENGTH: usize = 30;
const MIDI_NOTE_ON_MESSAGE: i32 = 0x90;
const DEFAULT_MIDI_CHANNEL: i32 = 15;
const DEFAULT_AFTERTOUCH_SCALER: f32 = 100.0;

// Vibrato detection on the lowpass-filtered key velocity
const VIBRATO_VELOCITY_THRESHOLD: KeyVelocity = 2.0;
const VIBRATO_MINIMUM_PEAK_SPACING: TimestampDelta = micros_interval(60_000);
const VIBRATO_TIMEOUT: TimestampDelta = micros_interval(500_000);
const VIBRATO_MINIMUM_OSCILLATIONS: usize = 4;
const VIBRATO_RATE_SCALER: f32 = 0.005;

// Partial-press bends start above twice the idle position threshold
const BEND_MINIMUM_POSITION: KeyPosition = 0.1;

const VELOCITY_FILTER_CUTOFF: f64 = 15.0;
const VELOCITY_FILTER_Q: f64 = 0.707;
const POSITION_SAMPLE_RATE: f64 = 1000.0;

/// One active two-key pitch bend relationship.
struct PitchBend {
    note: u8,
    /// true: the other key's partial press controls our pitch;
    /// false: our own partial press controls the other key's pitch
    is_controlling_bend: bool,
    is_finished: bool,
    position_buffer: Arc<Node<KeyPosition>>,
    tracker: Arc<KeyPositionTracker>,
}

struct MrpState {
    note_is_on: bool,
    last_intensity: Option<f32>,
    last_brightness: Option<f32>,
    last_pitch: Option<f32>,
    last_harmonic: Option<f32>,
    aftertouch_scaler: f32,
    should_look_for_pitch_bends: bool,
    active_pitch_bends: Vec<PitchBend>,
    last_calculated_velocity_index: usize,
    vibrato_active: bool,
    vibrato_velocity_peak_count: usize,
    vibrato_last_peak_timestamp: Option<Timestamp>,
}

/// Per-note MRP mapping.
pub struct MrpMapping {
    common: MappingCommon,
    factory: Weak<MrpMappingFactory>,
    raw_velocity: Arc<Node<KeyVelocity>>,
    filtered_velocity: Arc<IirFilterNode>,
    state: Mutex<MrpState>,
}

impl MrpMapping {
    pub fn new(
        keyboard: &Arc<PianoKeyboard>,
        factory: Weak<MrpMappingFactory>,
        ctx: &KeyEventContext,
    ) -> Arc<Self> {
        let raw_velocity: Arc<Node<KeyVelocity>> = Node::with_capacity(VELOCITY_BUFFER_LENGTH);
        let filtered_velocity = IirFilterNode::new(VELOCITY_BUFFER_LENGTH, raw_velocity.clone());
        let (b, a) =
            design_second_order_lowpass(VELOCITY_FILTER_CUTOFF, VELOCITY_FILTER_Q, POSITION_SAMPLE_RATE);
        filtered_velocity.set_coefficients(b, a, true);

        Arc::new(MrpMapping {
            common: MappingCommon::new(
                keyboard,
                ctx.note_number,
                ctx.touch_buffer.clone(),
                ctx.position_buffer.clone(),
                ctx.tracker.clone(),
            ),
            factory,
            raw_velocity,
            filtered_velocity,
            state: Mutex::new(MrpState {
                note_is_on: false,
                last_intensity: None,
                last_brightness: None,
                last_pitch: None,
                last_harmonic: None,
                aftertouch_scaler: DEFAULT_AFTERTOUCH_SCALER,
                should_look_for_pitch_bends: true,
                active_pitch_bends: Vec::new(),
                last_calculated_velocity_index: 0,
                vibrato_active: false,
                vibrato_velocity_peak_count: 0,
                vibrato_last_peak_timestamp: None,
            }),
        })
    }

    pub fn set_aftertouch_sensitivity(&self, sensitivity: f32) {
        self.state.lock().unwrap().aftertouch_scaler = if sensitivity <= 0.0 {
            0.0
        } else {
            DEFAULT_AFTERTOUCH_SCALER * sensitivity
        };
    }

    /// Called by a neighbouring MrpMapping when it finds a pitch bend
    /// starting: our pitch is now controlled by `from_note`'s partial press.
    pub fn enable_pitch_bend(
        &self,
        from_note: u8,
        position_buffer: Arc<Node<KeyPosition>>,
        tracker: Arc<KeyPositionTracker>,
    ) {
        debug!(
            this = self.common.note_number(),
            from = from_note,
            "pitch bend enabled"
        );
        self.state.lock().unwrap().active_pitch_bends.push(PitchBend {
            note: from_note,
            is_controlling_bend: true,
            is_finished: false,
            position_buffer,
            tracker,
        });
    }

    fn send_mrp_midi(&self, keyboard: &PianoKeyboard, velocity: i32) {
        keyboard.send_message(
            "/mrp/midi",
            vec![
                OscType::Int(MIDI_NOTE_ON_MESSAGE + DEFAULT_MIDI_CHANNEL),
                OscType::Int(self.common.note_number() as i32),
                OscType::Int(velocity),
            ],
        );
    }

    fn send_quality(&self, keyboard: &PianoKeyboard, quality: &str, value: f32) {
        keyboard.send_message(
            &format!("/mrp/quality/{quality}"),
            vec![
                OscType::Int(DEFAULT_MIDI_CHANNEL),
                OscType::Int(self.common.note_number() as i32),
                OscType::Float(value),
            ],
        );
    }

    /// Bring the velocity buffer up to date from the position buffer.
    /// Velocity is first-differenced as needed rather than on every sample,
    /// so trigger handlers stay cheap.
    fn update_velocity_measurements(&self) -> Option<KeyVelocity> {
        let pending: Vec<(KeyVelocity, Timestamp)> = {
            let mut state = self.state.lock().unwrap();
            let position = self.common.position_buffer().read();
            if position.len() < 2 {
                return None;
            }
            if state.last_calculated_velocity_index < position.begin_index() + 1 {
                // Fell off the beginning of the position buffer
                self.raw_velocity.clear();
                self.filtered_velocity.clear();
                state.last_calculated_velocity_index = position.begin_index() + 1;
            }
            let mut pending = Vec::new();
            while state.last_calculated_velocity_index < position.end_index() {
                let index = state.last_calculated_velocity_index;
                let (Some(&p1), Some(&p0)) = (position.get(index), position.get(index - 1)) else {
                    break;
                };
                let (Some(t1), Some(t0)) =
                    (position.timestamp_at(index), position.timestamp_at(index - 1))
                else {
                    break;
                };
                let dt = delta_secs(t1.delta_since(t0));
                // Equal timestamps would blow up the filter; substitute zero
                let velocity = if dt > 0.0 { (p1 - p0) / dt } else { 0.0 };
                pending.push((velocity, t1));
                state.last_calculated_velocity_index += 1;
            }
            pending
        };
        for (velocity, timestamp) in pending {
            self.raw_velocity.insert(velocity, timestamp);
        }
        self.filtered_velocity.calculate(None)
    }

    /// Earliest timestamp of the contiguous run of partial-press states at
    /// the end of the tracker's notification history.
    fn find_timestamp_of_partial_press(&self) -> Option<Timestamp> {
        let node = self.common.tracker().node();
        let guard = node.read();
        if guard.is_empty() {
            return None;
        }
        let mut earliest: Option<Timestamp> = None;
        let mut index = guard.end_index();
        while index > guard.begin_index() {
            index -= 1;
            let Some(notification) = guard.get(index) else {
                break;
            };
            let partial = matches!(
                notification.state,
                KeyState::PartialPressAwaitingMax | KeyState::PartialPressFoundMax
            );
            if partial {
                earliest = guard.timestamp_at(index).or(earliest);
            } else if earliest.is_some() {
                break;
            }
        }
        earliest
    }

    /// Scan neighbouring keys (up to two semitones either side) for one
    /// already in the Down state that got there before our partial press
    /// began; engage a cooperative bend with each match.
    fn look_for_pitch_bends(&self, this: &Arc<MrpMapping>) {
        let Some(factory) = self.factory.upgrade() else {
            return;
        };
        let our_partial = self.find_timestamp_of_partial_press();
        let Some(our_partial) = our_partial else {
            return;
        };
        let own_note = self.common.note_number() as i32;

        for neighbor_note in (own_note - 2)..=(own_note + 2) {
            if neighbor_note == own_note || !(0..128).contains(&neighbor_note) {
                continue;
            }
            let Some(neighbor) = factory.mrp_mapping(neighbor_note as u8) else {
                continue;
            };
            if neighbor.common.tracker().current_state() != KeyState::Down {
                continue;
            }
            let Some(down_time) = neighbor.common.tracker().node().latest_timestamp() else {
                continue;
            };
            if our_partial > down_time {
                // The neighbour went down before us: bend engages both ways
                debug!(from = own_note, to = neighbor_note, "found pitch bend");
                self.state.lock().unwrap().active_pitch_bends.push(PitchBend {
                    note: neighbor_note as u8,
                    is_controlling_bend: false,
                    is_finished: false,
                    position_buffer: neighbor.common.position_buffer().clone(),
                    tracker: neighbor.common.tracker().clone(),
                });
                neighbor.enable_pitch_bend(
                    own_note as u8,
                    this.common.position_buffer().clone(),
                    this.common.tracker().clone(),
                );
            }
        }
    }

    fn bend_amount(position: KeyPosition) -> f32 {
        (((position - BEND_MINIMUM_POSITION) / (1.0 - BEND_MINIMUM_POSITION)) as f32).max(0.0)
    }
}

impl TriggerListener for MrpMapping {
    fn trigger_received(&self, _source: SourceId, _timestamp: Timestamp) {
        // State changes and touch data are picked up during the periodic
        // perform_mapping pass
    }
}

impl Mapping for MrpMapping {
    fn common(&self) -> &MappingCommon {
        &self.common
    }

    fn disengage(&self, should_delete: bool) {
        let was_on = {
            let mut state = self.state.lock().unwrap();
            let was_on = state.note_is_on;
            state.note_is_on = false;
            state.should_look_for_pitch_bends = true;
            state.last_intensity = None;
            state.last_brightness = None;
            state.last_pitch = None;
            state.last_harmonic = None;
            was_on
        };
        if was_on {
            if let Some(keyboard) = self.common.keyboard() {
                self.send_mrp_midi(&keyboard, 0);
            }
        }
        self.common.disengage(should_delete);
    }

    fn reset(&self) {
        self.common.reset();
        let mut state = self.state.lock().unwrap();
        state.note_is_on = false;
        state.should_look_for_pitch_bends = true;
    }

    fn perform_mapping(&self) -> Option<Timestamp> {
        if !self.common.engaged() {
            return None;
        }
        let Some(keyboard) = self.common.keyboard() else {
            return None;
        };
        let now = self.common.now();
        let this = self
            .factory
            .upgrade()
            .and_then(|f| f.mrp_mapping(self.common.note_number()));

        let mut intensity = 0.0f32;
        let mut brightness = 0.0f32;
        let mut pitch = 0.0f32;
        let mut harmonic = 0.0f32;
        let mut send_note_off = false;

        let latest_position = self.common.position_buffer().latest();
        if let Some(latest_position) = latest_position {
            let tracker_state = self.common.tracker().current_state();
            let latest_velocity = self.update_velocity_measurements();

            // Check once per partial press whether this key participates in
            // a multi-key bend; keys going down later are not part of it
            let look = {
                let state = self.state.lock().unwrap();
                state.should_look_for_pitch_bends
            };
            let in_partial = matches!(
                tracker_state,
                KeyState::PartialPressAwaitingMax | KeyState::PartialPressFoundMax
            );
            if look && in_partial {
                if let Some(this) = this.as_ref() {
                    self.look_for_pitch_bends(this);
                }
                self.state.lock().unwrap().should_look_for_pitch_bends = false;
            }

            {
                let mut state = self.state.lock().unwrap();
                if in_partial {
                    // Velocity oscillation reads as vibrato while the key is
                    // not yet down
                    if state.vibrato_last_peak_timestamp.is_none() {
                        state.vibrato_last_peak_timestamp = Some(now);
                    }
                    if let Some(velocity) = latest_velocity {
                        let last_peak = state.vibrato_last_peak_timestamp.unwrap_or(now);
                        let spaced = now.delta_since(last_peak) > VIBRATO_MINIMUM_PEAK_SPACING;
                        let crossed = if state.vibrato_velocity_peak_count % 2 == 0 {
                            velocity > VIBRATO_VELOCITY_THRESHOLD
                        } else {
                            velocity < -VIBRATO_VELOCITY_THRESHOLD
                        };
                        if crossed && spaced {
                            state.vibrato_velocity_peak_count += 1;
                            state.vibrato_last_peak_timestamp = Some(now);
                        }
                        if state.vibrato_velocity_peak_count >= VIBRATO_MINIMUM_OSCILLATIONS {
                            state.vibrato_active = true;
                        }
                        if state.vibrato_active {
                            // Harmonic accumulates with |velocity| for the
                            // life of the gesture and holds afterward
                            let base = state.last_harmonic.unwrap_or(0.0);
                            harmonic =
                                base + (velocity.abs() as f32) * VIBRATO_RATE_SCALER;
                            if now.delta_since(state.vibrato_last_peak_timestamp.unwrap_or(now))
                                > VIBRATO_TIMEOUT
                            {
                                debug!("vibrato timed out");
                                state.vibrato_active = false;
                                state.vibrato_velocity_peak_count = 0;
                                state.vibrato_last_peak_timestamp = Some(now);
                            }
                        }
                    }
                } else {
                    state.vibrato_active = false;
                    state.vibrato_velocity_peak_count = 0;
                    state.vibrato_last_peak_timestamp = Some(now);
                }
            }

            if tracker_state != KeyState::ReleaseFinished {
                // Intensity tracks key depth; brightness is aftertouch-like
                // pressure past the bottom of travel
                if latest_position > 1.0 {
                    intensity = 1.0;
                    brightness = ((latest_position - 1.0) as f32)
                        * self.state.lock().unwrap().aftertouch_scaler;
                } else if latest_position < 0.0 {
                    intensity = 0.0;
                } else {
                    intensity = latest_position as f32;
                }

                // Multi-key pitch bends
                let mut state = self.state.lock().unwrap();
                if !state.active_pitch_bends.is_empty() {
                    pitch = 0.0;
                    let own_note = self.common.note_number() as f32;
                    for bend in state.active_pitch_bends.iter_mut() {
                        if bend.is_controlling_bend {
                            // The other key's partial press bends our pitch
                            let neighbor_state = bend.tracker.current_state();
                            let neighbor_partial = matches!(
                                neighbor_state,
                                KeyState::PartialPressAwaitingMax
                                    | KeyState::PartialPressFoundMax
                            );
                            if !neighbor_partial || !bend.tracker.engaged() {
                                bend.is_finished = true;
                                continue;
                            }
                            let Some(bender_position) = bend.position_buffer.latest() else {
                                continue;
                            };
                            let note_difference = bend.note as f32 - own_note;
                            pitch += note_difference * Self::bend_amount(bender_position);
                        } else {
                            // Our own partial press bends the other key; our
                            // pitch is the complement
                            if !in_partial {
                                bend.is_finished = true;
                                continue;
                            }
                            let note_difference = bend.note as f32 - own_note;
                            pitch +=
                                note_difference * (1.0 - Self::bend_amount(latest_position));
                        }
                    }
                    state.active_pitch_bends.retain(|bend| !bend.is_finished);
                }
            } else {
                // Post-release: silence and reset
                let mut state = self.state.lock().unwrap();
                if state.note_is_on {
                    send_note_off = true;
                }
                state.note_is_on = false;
                state.should_look_for_pitch_bends = true;
            }
        }

        if send_note_off {
            self.send_mrp_midi(&keyboard, 0);
        }

        // Note starts as soon as intensity rises above silence
        let send_note_on = {
            let mut state = self.state.lock().unwrap();
            if !state.note_is_on && intensity > 0.0 {
                state.note_is_on = true;
                true
            } else {
                false
            }
        };
        if send_note_on {
            self.send_mrp_midi(&keyboard, 127);
        }

        // LED summary: partial press green, aftertouch toward red, bends
        // toward blue, harmonic glissando cycles hues with a whitish tint
        let (changed, deltas) = {
            let state = self.state.lock().unwrap();
            let changed = state.last_intensity != Some(intensity)
                || state.last_brightness != Some(brightness)
                || state.last_pitch != Some(pitch)
                || state.last_harmonic != Some(harmonic);
            (
                changed,
                (
                    state.last_intensity != Some(intensity),
                    state.last_brightness != Some(brightness),
                    state.last_pitch != Some(pitch),
                    state.last_harmonic != Some(harmonic),
                ),
            )
        };
        if changed {
            let note = self.common.note_number();
            if harmonic != 0.0 {
                keyboard.set_key_led_color_hsv(note, harmonic % 1.0, 0.25, 0.5);
            } else if intensity >= 1.0 {
                let hue = if pitch != 0.0 {
                    0.33 + 0.33 * pitch.abs() - brightness * 0.2
                } else {
                    0.33 - brightness * 0.2
                };
                keyboard.set_key_led_color_hsv(note, hue, 1.0, 1.0);
            } else {
                let hue = if pitch != 0.0 {
                    0.33 + 0.33 * pitch.abs()
                } else {
                    0.33
                };
                keyboard.set_key_led_color_hsv(note, hue, 1.0, intensity);
            }
        }

        if !self.common.suspended() {
            let (d_intensity, d_brightness, d_pitch, d_harmonic) = deltas;
            if d_intensity {
                self.send_quality(&keyboard, "intensity", intensity);
            }
            if d_brightness {
                self.send_quality(&keyboard, "brightness", brightness);
            }
            if d_pitch {
                self.send_quality(&keyboard, "pitch", pitch);
            }
            if d_harmonic {
                self.send_quality(&keyboard, "harmonic", harmonic);
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            state.last_intensity = Some(intensity);
            state.last_brightness = Some(brightness);
            state.last_pitch = Some(pitch);
            state.last_harmonic = Some(harmonic);
        }

        Some(self.common.next_update_time())
    }
}

/// Factory for [`MrpMapping`]s. Keeps a concrete-typed registry so
/// neighbouring mappings can find each other for two-key bends.
pub struct MrpMappingFactory {
    support: NoteFactorySupport,
    aftertouch_sensitivity: Mutex<f32>,
    mrp_mappings: Mutex<std::collections::HashMap<u8, Weak<MrpMapping>>>,
    self_weak: Weak<MrpMappingFactory>,
}

impl MrpMappingFactory {
    pub fn new(
        keyboard: &Arc<PianoKeyboard>,
        segment: &Arc<MidiKeyboardSegment>,
    ) -> Arc<dyn MappingFactory> {
        Arc::new_cyclic(|weak: &Weak<MrpMappingFactory>| MrpMappingFactory {
            support: NoteFactorySupport::new(keyboard, segment),
            aftertouch_sensitivity: Mutex::new(1.0),
            mrp_mappings: Mutex::new(std::collections::HashMap::new()),
            self_weak: weak.clone(),
        })
    }

    /// Concrete-typed lookup for neighbour coordination.
    pub fn mrp_mapping(&self, note: u8) -> Option<Arc<MrpMapping>> {
        self.mrp_mappings
            .lock()
            .unwrap()
            .get(&note)
            .and_then(Weak::upgrade)
    }

    fn make_mapping(&self, ctx: &KeyEventContext) -> Arc<dyn Mapping> {
        let keyboard = self.support.keyboard().expect("keyboard gone");
        let mapping = MrpMapping::new(&keyboard, self.self_weak.clone(), ctx);
        mapping.set_aftertouch_sensitivity(*self.aftertouch_sensitivity.lock().unwrap());
        mapping.common().set_control_name(&self.support.control_name());
        {
            let mut registry = self.mrp_mappings.lock().unwrap();
            registry.retain(|_, weak| weak.strong_count() > 0);
            registry.insert(ctx.note_number, Arc::downgrade(&mapping));
        }
        engage_mapping(&mapping);
        mapping
    }

    pub fn set_aftertouch_sensitivity(&self, sensitivity: f32) {
        *self.aftertouch_sensitivity.lock().unwrap() = sensitivity.max(0.0);
    }
}

impl MappingFactory for MrpMappingFactory {
    impl_note_factory_delegates!();

    fn kind(&self) -> MappingFactoryKind {
        MappingFactoryKind::Mrp
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
        self.mrp_mappings
            .lock()
            .unwrap()
            .retain(|_, weak| weak.strong_count() > 0);
    }

    // The MRP follows key motion even without touch or MIDI: a key going
    // active is enough to start mapping it.
    fn key_motion_active(&self, ctx: &KeyEventContext) {
        let this = self.self_weak.upgrade().expect("factory alive");
        self.support
            .handle_touch_began(ctx, &|ctx| this.make_mapping(ctx));
    }

    fn key_motion_idle(&self, ctx: &KeyEventContext) {
        if !ctx.midi_note_is_on && !ctx.touch_is_on {
            self.support.remove_mapping(ctx.note_number);
            self.mrp_mappings.lock().unwrap().remove(&ctx.note_number);
        }
    }

    fn osc_control(&self, path: &str, args: &[OscType]) -> Option<OscMessage> {
        self.support.osc_control_common(path, args)
    }

    fn preset(&self) -> FactoryPreset {
        let mut preset = self.support.common_preset(self.kind());
        preset.params = FactoryParams {
            aftertouch_sensitivity: Some(*self.aftertouch_sensitivity.lock().unwrap()),
            ..Default::default()
        };
        preset
    }

    fn load_preset(&self, preset: &FactoryPreset) -> bool {
        if !self.support.load_common_preset(preset) {
            return false;
        }
        if let Some(sensitivity) = preset.params.aftertouch_sensitivity {
            self.set_aftertouch_sensitivity(sensitivity);
        }
        true
    }
}
