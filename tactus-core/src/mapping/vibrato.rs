// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Vibrato from side-to-side finger motion
//!
//! Detects the oscillating lateral motion of a finger on the key surface and
//! turns it into pitch bend. Lateral distance from the onset location is
//! bandpass filtered around vibrato rate; the gesture engages when a first
//! extremum beyond a threshold is followed by an opposite-sign extremum of
//! sufficient ratio within a timeout. Engagement ramps in over roughly a
//! quarter cycle (estimated from the extremum-to-zero-crossing interval) and
//! releases over the last observed zero-crossing interval, both clamped to
//! [30 ms, 300 ms]. The emitted bend is
//! `range * tanh(prescaler * scale * distance)`, accentuating small motions.

use std::sync::{Arc, Mutex, Weak};

use rosc::{OscMessage, OscType};
use tracing::{debug, trace};

use super::factory::{
    impl_note_factory_delegates, KeyEventContext, MappingFactory, MappingFactoryKind,
    NoteFactorySupport,
};
use super::{engage_mapping, Mapping, MappingCommon};
use crate::config::{FactoryParams, FactoryPreset};
use crate::filter::{design_second_order_bandpass, IirFilterNode};
use crate::keyboard::PianoKeyboard;
use crate::node::Node;
use crate::osc::float_arg;
use crate::segment::{MidiKeyboardSegment, CONTROL_PITCH_WHEEL};
use crate::touch::WHITE_FRONT_BACK_CUTOFF;
use crate::trigger::{SourceId, TriggerListener};
use crate::types::{micros_interval, millis, Timestamp, TimestampDelta};

const DEFAULT_FILTER_BUFFER_LENGTH: usize = 30;
const DEFAULT_VIBRATO_THRESHOLD: f32 = 0.05;
const DEFAULT_VIBRATO_RATIO: f32 = 0.3;
const DEFAULT_VIBRATO_TIMEOUT: TimestampDelta = micros_interval(400_000);
const DEFAULT_VIBRATO_PRESCALER: f32 = 2.0;
const DEFAULT_VIBRATO_RANGE_SEMITONES: f32 = 1.25;

const ZERO_CROSSING_MINIMUM_TIME: TimestampDelta = micros_interval(50_000);
const MINIMUM_ONSET_TIME: TimestampDelta = micros_interval(30_000);
const MAXIMUM_ONSET_TIME: TimestampDelta = micros_interval(300_000);
const MINIMUM_RELEASE_TIME: TimestampDelta = micros_interval(30_000);
const MAXIMUM_RELEASE_TIME: TimestampDelta = micros_interval(300_000);

// Bandpass centered on typical vibrato rate, at the touch frame rate
const VIBRATO_BANDPASS_CUTOFF: f64 = 9.0;
const VIBRATO_BANDPASS_Q: f64 = 0.707;
const TOUCH_FRAME_RATE: f64 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VibratoState {
    Inactive,
    SwitchingOn,
    Active,
    SwitchingOff,
}

struct VibratoDetection {
    state: VibratoState,
    ramp_begin_time: Option<Timestamp>,
    ramp_scale_value: f32,
    ramp_length: TimestampDelta,
    last_calculated_ramp_value: f32,

    onset_threshold: f32,
    onset_ratio: f32,
    onset_timeout: TimestampDelta,
    prescaler: f32,
    range_semitones: f32,

    onset_location_x: Option<f32>,
    onset_location_y: Option<f32>,
    last_x: Option<f32>,
    last_y: Option<f32>,
    id_of_current_touch: i32,
    last_timestamp: Timestamp,

    last_processed_index: usize,
    last_zero_crossing_timestamp: Option<Timestamp>,
    last_zero_crossing_interval: TimestampDelta,
    last_sample_was_positive: bool,
    found_first_extremum: bool,
    first_extremum: Option<f32>,
    first_extremum_timestamp: Option<Timestamp>,
    last_extremum_timestamp: Option<Timestamp>,

    last_pitch_bend_semitones: f32,
}

impl VibratoDetection {
    fn reset_detection(&mut self) {
        self.found_first_extremum = false;
        self.first_extremum = None;
        self.first_extremum_timestamp = None;
        self.last_extremum_timestamp = None;
        self.last_zero_crossing_timestamp = None;
    }
}

/// Per-note vibrato detector and pitch-bend generator.
pub struct VibratoMapping {
    common: MappingCommon,
    raw_distance: Arc<Node<f64>>,
    filtered_distance: Arc<IirFilterNode>,
    state: Mutex<VibratoDetection>,
}

impl VibratoMapping {
    pub fn new(keyboard: &Arc<PianoKeyboard>, ctx: &KeyEventContext) -> Arc<Self> {
        let raw_distance: Arc<Node<f64>> = Node::with_capacity(DEFAULT_FILTER_BUFFER_LENGTH);
        let filtered_distance =
            IirFilterNode::new(DEFAULT_FILTER_BUFFER_LENGTH, raw_distance.clone());
        let (b, a) =
            design_second_order_bandpass(VIBRATO_BANDPASS_CUTOFF, VIBRATO_BANDPASS_Q, TOUCH_FRAME_RATE);
        filtered_distance.set_coefficients(b, a, true);
        filtered_distance.set_auto_calculate(true, None);

        Arc::new(VibratoMapping {
            common: MappingCommon::new(
                keyboard,
                ctx.note_number,
                ctx.touch_buffer.clone(),
                ctx.position_buffer.clone(),
                ctx.tracker.clone(),
            ),
            raw_distance,
            filtered_distance,
            state: Mutex::new(VibratoDetection {
                state: VibratoState::Inactive,
                ramp_begin_time: None,
                ramp_scale_value: 0.0,
                ramp_length: 0,
                last_calculated_ramp_value: 0.0,
                onset_threshold: DEFAULT_VIBRATO_THRESHOLD,
                onset_ratio: DEFAULT_VIBRATO_RATIO,
                onset_timeout: DEFAULT_VIBRATO_TIMEOUT,
                prescaler: DEFAULT_VIBRATO_PRESCALER,
                range_semitones: DEFAULT_VIBRATO_RANGE_SEMITONES,
                onset_location_x: None,
                onset_location_y: None,
                last_x: None,
                last_y: None,
                id_of_current_touch: -1,
                last_timestamp: Timestamp::ZERO,
                last_processed_index: 0,
                last_zero_crossing_timestamp: None,
                last_zero_crossing_interval: 0,
                last_sample_was_positive: false,
                found_first_extremum: false,
                first_extremum: None,
                first_extremum_timestamp: None,
                last_extremum_timestamp: None,
                last_pitch_bend_semitones: 0.0,
            }),
        })
    }

    pub fn vibrato_state(&self) -> VibratoState {
        self.state.lock().unwrap().state
    }

    pub fn set_range(&self, range_semitones: f32) {
        self.state.lock().unwrap().range_semitones = range_semitones;
    }

    pub fn set_prescaler(&self, prescaler: f32) {
        self.state.lock().unwrap().prescaler = prescaler;
    }

    pub fn set_thresholds(&self, threshold: f32, ratio: f32) {
        let mut state = self.state.lock().unwrap();
        state.onset_threshold = threshold;
        state.onset_ratio = ratio;
    }

    pub fn set_timeout(&self, timeout: TimestampDelta) {
        self.state.lock().unwrap().onset_timeout = timeout;
    }

    fn key_is_white(&self) -> bool {
        !matches!(self.common.note_number() % 12, 1 | 3 | 6 | 8 | 10)
    }

    fn clear_buffers(&self, state: &mut VibratoDetection) {
        self.raw_distance.clear();
        self.filtered_distance.clear();
        self.raw_distance.insert(0.0, state.last_timestamp);
        state.last_processed_index = 0;
    }

    fn send_vibrato_message(&self, pitch_bend_semitones: f32, force: bool) {
        if !force && self.common.suspended() {
            return;
        }
        let Some(keyboard) = self.common.keyboard() else {
            return;
        };
        let name = self.common.control_name();
        let path = if name.is_empty() {
            "/touchkeys/vibrato".to_string()
        } else {
            name
        };
        keyboard.send_message(
            &path,
            vec![
                OscType::Int(self.common.note_number() as i32),
                OscType::Float(pitch_bend_semitones),
            ],
        );
    }

    fn change_state_switching_on(&self, state: &mut VibratoDetection, timestamp: Timestamp) {
        state.ramp_scale_value = 1.0;
        state.ramp_begin_time = Some(timestamp);
        state.ramp_length = 0;
        // A quarter cycle separates the extremum and the zero crossing; at a
        // steady rate that is also the time remaining to the next peak.
        if let (Some(zero), Some(extremum)) = (
            state.last_zero_crossing_timestamp,
            state.first_extremum_timestamp,
        ) {
            let estimated_peak = zero.offset(zero.delta_since(extremum));
            state.ramp_length = estimated_peak
                .delta_since(timestamp)
                .clamp(MINIMUM_ONSET_TIME, MAXIMUM_ONSET_TIME);
        }
        debug!(
            note = self.common.note_number(),
            ramp_us = state.ramp_length,
            "vibrato switching on"
        );
        state.state = VibratoState::SwitchingOn;
    }

    fn change_state_switching_off(&self, state: &mut VibratoDetection, timestamp: Timestamp) {
        state.ramp_scale_value = if state.state == VibratoState::SwitchingOn {
            // Mid-ramp: release from the current value
            state.last_calculated_ramp_value
        } else {
            1.0
        };
        state.ramp_begin_time = Some(timestamp);
        state.ramp_length = state
            .last_zero_crossing_interval
            .clamp(MINIMUM_RELEASE_TIME, MAXIMUM_RELEASE_TIME);
        state.reset_detection();
        state.state = VibratoState::SwitchingOff;
    }

    /// Track the latest touch and its distance from the onset location.
    fn process_touch(&self, timestamp: Timestamp) {
        let Some(frame) = self.common.touch_buffer().latest() else {
            return;
        };
        let mut schedule = false;
        {
            let mut state = self.state.lock().unwrap();
            state.last_timestamp = timestamp;

            if frame.count == 0 {
                state.last_x = None;
                state.last_y = None;
                state.id_of_current_touch = -1;
            } else {
                // Prefer the touch we were already tracking; otherwise take
                // the lowest current ID
                let mut found_current = false;
                let mut index = 0usize;
                if state.id_of_current_touch >= 0 {
                    for i in 0..frame.count {
                        if frame.ids[i] == state.id_of_current_touch {
                            index = i;
                            found_current = true;
                            break;
                        }
                    }
                }
                if !found_current {
                    let mut lowest_id = i32::MAX;
                    for i in 0..frame.count {
                        if frame.ids[i] < lowest_id {
                            lowest_id = frame.ids[i];
                            index = i;
                        }
                    }
                    state.id_of_current_touch = frame.ids[index];
                }
                state.last_y = Some(frame.locs[index]);
                state.last_x = if frame.loc_h < 0.0
                    || (self.key_is_white() && frame.locs[index] > WHITE_FRONT_BACK_CUTOFF)
                {
                    None
                } else {
                    Some(frame.loc_h)
                };

                if self.common.note_is_on() {
                    if state.onset_location_y.is_none() || !found_current {
                        // Note on but touch just arrived (or switched to a
                        // new finger): this touch becomes the onset location
                        state.onset_location_y = state.last_y;
                        state.onset_location_x = state.last_x;
                        self.clear_buffers(&mut state);
                    } else {
                        if state.onset_location_x.is_none() && state.last_x.is_some() {
                            state.onset_location_x = state.last_x;
                        }
                        let distance = match (state.last_x, state.onset_location_x) {
                            (Some(x), Some(onset_x)) => x - onset_x,
                            _ => {
                                let y = state.last_y.unwrap_or(0.0);
                                let onset_y = state.onset_location_y.unwrap_or(0.0);
                                y - onset_y
                            }
                        };
                        self.raw_distance.insert(distance as f64, timestamp);
                        schedule = true;
                    }
                }
            }
        }
        if schedule {
            self.common.schedule_now();
        }
    }
}

impl TriggerListener for VibratoMapping {
    fn trigger_received(&self, source: SourceId, timestamp: Timestamp) {
        if source == self.common.touch_buffer().source_id() {
            self.process_touch(timestamp);
        }
    }
}

impl Mapping for VibratoMapping {
    fn common(&self) -> &MappingCommon {
        &self.common
    }

    fn resend(&self) {
        let last = self.state.lock().unwrap().last_pitch_bend_semitones;
        self.send_vibrato_message(last, true);
    }

    fn midi_note_on_received(&self, channel: u8, _velocity: u8) {
        self.common.set_note_on(Some(channel));
        let mut state = self.state.lock().unwrap();
        // The most recent touch (if any) becomes the onset location
        state.onset_location_x = state.last_x;
        state.onset_location_y = state.last_y;
        if state.onset_location_y.is_some() {
            self.clear_buffers(&mut state);
        }
    }

    fn midi_note_off_received(&self, _channel: u8) {
        self.common.set_note_on(None);
        let now = self.common.now();
        let mut state = self.state.lock().unwrap();
        if state.state == VibratoState::Active || state.state == VibratoState::SwitchingOn {
            self.change_state_switching_off(&mut state, now);
        }
    }

    fn disengage(&self, should_delete: bool) {
        self.send_vibrato_message(0.0, false);
        self.common.disengage(should_delete);
    }

    fn reset(&self) {
        self.common.reset();
        self.send_vibrato_message(0.0, false);
        let mut state = self.state.lock().unwrap();
        state.reset_detection();
        state.state = VibratoState::Inactive;
        state.last_pitch_bend_semitones = 0.0;
    }

    fn perform_mapping(&self) -> Option<Timestamp> {
        if !self.common.engaged() {
            return None;
        }
        let now = self.common.now();
        let mut new_sample_present = false;
        let mut bend_to_send: Option<f32> = None;

        {
            let mut state = self.state.lock().unwrap();
            let filtered = self.filtered_distance.node();

            // Walk the filtered distance samples we have not yet examined
            let begin = filtered.begin_index();
            if state.last_processed_index < begin.saturating_add(1) {
                // Fell off the buffer under heavy load; skip forward
                state.last_processed_index = begin + 1;
            }
            while state.last_processed_index < filtered.end_index() {
                let index = state.last_processed_index;
                let Some(distance) = filtered.get(index) else {
                    break;
                };
                let distance = distance as f32;
                let Some(timestamp) = filtered.timestamp_at(index) else {
                    break;
                };
                new_sample_present = true;

                // Zero crossings time the gesture
                if (distance > 0.0 && !state.last_sample_was_positive)
                    || (distance < 0.0 && state.last_sample_was_positive)
                {
                    if let Some(last_crossing) = state.last_zero_crossing_timestamp {
                        let interval = timestamp.delta_since(last_crossing);
                        if interval > ZERO_CROSSING_MINIMUM_TIME
                            && (state.state == VibratoState::Active
                                || state.state == VibratoState::SwitchingOn
                                || state.found_first_extremum)
                        {
                            state.last_zero_crossing_interval = interval;
                            trace!(interval_us = interval, "vibrato zero crossing");
                        }
                    }
                    state.last_zero_crossing_timestamp = Some(timestamp);
                }
                state.last_sample_was_positive = distance > 0.0;

                if state.state == VibratoState::Inactive
                    || state.state == VibratoState::SwitchingOff
                {
                    if state.found_first_extremum {
                        // Look for the opposite-sign extremum that confirms
                        // the gesture
                        let first = state.first_extremum.unwrap_or(0.0);
                        if (first > 0.0 && distance < 0.0) || (first < 0.0 && distance > 0.0) {
                            if distance.abs() >= first.abs() * state.onset_ratio {
                                self.change_state_switching_on(&mut state, timestamp);
                            }
                        } else if state
                            .last_extremum_timestamp
                            .map(|t| timestamp.delta_since(t) > state.onset_timeout)
                            .unwrap_or(false)
                        {
                            state.reset_detection();
                        }
                    } else if distance.abs() >= state.onset_threshold {
                        // Track the candidate first extremum while it grows
                        if state
                            .first_extremum
                            .map(|f| distance.abs() > f.abs())
                            .unwrap_or(true)
                        {
                            state.first_extremum = Some(distance);
                            state.last_extremum_timestamp = Some(timestamp);
                        }
                    } else if state
                        .first_extremum
                        .map(|f| f.abs() > state.onset_threshold)
                        .unwrap_or(false)
                    {
                        // Dropped back below threshold after a clear
                        // extremum: the first half of the gesture is in
                        state.first_extremum_timestamp = state.last_extremum_timestamp;
                        state.found_first_extremum = true;
                    }
                } else {
                    // Engaged: sustained sub-threshold motion times out
                    if distance.abs() >= state.onset_threshold * state.onset_ratio {
                        state.last_extremum_timestamp = Some(timestamp);
                    }
                    if state
                        .last_extremum_timestamp
                        .map(|t| timestamp.delta_since(t) > state.onset_timeout)
                        .unwrap_or(false)
                    {
                        self.change_state_switching_off(&mut state, timestamp);
                    }
                }

                state.last_processed_index += 1;
            }

            // One pitch bend per batch, from the most recent sample
            if new_sample_present && state.state != VibratoState::Inactive {
                let distance = filtered.latest().unwrap_or(0.0) as f32;
                let mut scale = 1.0f32;

                match state.state {
                    VibratoState::SwitchingOn => {
                        let elapsed = state
                            .ramp_begin_time
                            .map(|t| now.delta_since(t))
                            .unwrap_or(0);
                        if state.ramp_length <= 0 || elapsed >= state.ramp_length {
                            scale = 1.0;
                            state.state = VibratoState::Active;
                        } else {
                            state.last_calculated_ramp_value = state.ramp_scale_value
                                * elapsed as f32
                                / state.ramp_length as f32;
                            scale = state.last_calculated_ramp_value;
                        }
                    }
                    VibratoState::SwitchingOff => {
                        let elapsed = state
                            .ramp_begin_time
                            .map(|t| now.delta_since(t))
                            .unwrap_or(0);
                        if state.ramp_length <= 0 || elapsed >= state.ramp_length {
                            scale = 0.0;
                            state.state = VibratoState::Inactive;
                        } else {
                            state.last_calculated_ramp_value = state.ramp_scale_value
                                * (1.0 - elapsed as f32 / state.ramp_length as f32);
                            scale = state.last_calculated_ramp_value;
                        }
                    }
                    _ => {}
                }

                let bend = state.range_semitones
                    * (state.prescaler * scale * distance).tanh();
                state.last_pitch_bend_semitones = bend;
                bend_to_send = Some(bend);
            }

            // No touch data this round: ramps still have to finish and
            // timeouts still apply
            if !new_sample_present {
                match state.state {
                    VibratoState::SwitchingOff => {
                        let elapsed = state
                            .ramp_begin_time
                            .map(|t| now.delta_since(t))
                            .unwrap_or(0);
                        if state.ramp_length <= 0 || elapsed >= state.ramp_length {
                            state.last_pitch_bend_semitones = 0.0;
                            state.state = VibratoState::Inactive;
                            bend_to_send = Some(0.0);
                        } else {
                            state.last_calculated_ramp_value = state.ramp_scale_value
                                * (1.0 - elapsed as f32 / state.ramp_length as f32);
                            bend_to_send = Some(
                                state.last_pitch_bend_semitones
                                    * state.last_calculated_ramp_value,
                            );
                        }
                    }
                    VibratoState::SwitchingOn | VibratoState::Active => {
                        if state
                            .last_extremum_timestamp
                            .map(|t| now.delta_since(t) > state.onset_timeout)
                            .unwrap_or(false)
                        {
                            self.change_state_switching_off(&mut state, now);
                        }
                    }
                    VibratoState::Inactive => {}
                }
            }
        }

        if let Some(bend) = bend_to_send {
            self.send_vibrato_message(bend, false);
        }

        Some(self.common.next_update_time())
    }
}

/// Factory for [`VibratoMapping`]s. By default the control stream drives the
/// segment's pitch wheel through an OSC-MIDI converter using the segment's
/// pitch-wheel range.
pub struct VibratoMappingFactory {
    support: NoteFactorySupport,
    params: Mutex<VibratoFactoryParams>,
    self_weak: Weak<VibratoMappingFactory>,
}

struct VibratoFactoryParams {
    range_semitones: f32,
    prescaler: f32,
    threshold: f32,
    ratio: f32,
    timeout: TimestampDelta,
}

impl VibratoMappingFactory {
    pub fn new(
        keyboard: &Arc<PianoKeyboard>,
        segment: &Arc<MidiKeyboardSegment>,
    ) -> Arc<dyn MappingFactory> {
        let factory = Arc::new_cyclic(|weak: &Weak<VibratoMappingFactory>| VibratoMappingFactory {
            support: NoteFactorySupport::new(keyboard, segment),
            params: Mutex::new(VibratoFactoryParams {
                range_semitones: DEFAULT_VIBRATO_RANGE_SEMITONES,
                prescaler: DEFAULT_VIBRATO_PRESCALER,
                threshold: DEFAULT_VIBRATO_THRESHOLD,
                ratio: DEFAULT_VIBRATO_RATIO,
                timeout: DEFAULT_VIBRATO_TIMEOUT,
            }),
            self_weak: weak.clone(),
        });
        // Vibrato drives the pitch wheel; zero input range defers to the
        // segment-wide pitch-wheel range
        factory.support.set_midi_parameters(
            CONTROL_PITCH_WHEEL,
            0.0,
            0.0,
            0.0,
            None,
            None,
            None,
            None,
            false,
            crate::osc_midi::OutOfRangeBehavior::Extrapolate,
        );
        factory
    }

    fn make_mapping(&self, ctx: &KeyEventContext) -> Arc<dyn Mapping> {
        let keyboard = self.support.keyboard().expect("keyboard gone");
        let mapping = VibratoMapping::new(&keyboard, ctx);
        {
            let params = self.params.lock().unwrap();
            mapping.set_range(params.range_semitones);
            mapping.set_prescaler(params.prescaler);
            mapping.set_thresholds(params.threshold, params.ratio);
            mapping.set_timeout(params.timeout);
        }
        mapping.common().set_control_name(&self.support.control_name());
        engage_mapping(&mapping);
        mapping
    }

    pub fn set_range(&self, range_semitones: f32) {
        self.params.lock().unwrap().range_semitones = range_semitones;
    }

    pub fn set_prescaler(&self, prescaler: f32) {
        self.params.lock().unwrap().prescaler = prescaler;
    }
}

impl MappingFactory for VibratoMappingFactory {
    impl_note_factory_delegates!();

    fn kind(&self) -> MappingFactoryKind {
        MappingFactoryKind::Vibrato
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
            "/set-range" => {
                let range = float_arg(args, 0)?;
                self.set_range(range);
                Some(crate::osc::success_message())
            }
            "/set-prescaler" => {
                let prescaler = float_arg(args, 0)?;
                self.set_prescaler(prescaler);
                Some(crate::osc::success_message())
            }
            _ => None,
        }
    }

    fn preset(&self) -> FactoryPreset {
        let mut preset = self.support.common_preset(self.kind());
        let params = self.params.lock().unwrap();
        preset.params = FactoryParams {
            range_semitones: Some(params.range_semitones),
            prescaler: Some(params.prescaler),
            threshold: Some(params.threshold),
            ratio: Some(params.ratio),
            timeout_ms: Some(params.timeout / millis(1)),
            ..Default::default()
        };
        preset
    }

    fn load_preset(&self, preset: &FactoryPreset) -> bool {
        if !self.support.load_common_preset(preset) {
            return false;
        }
        let mut params = self.params.lock().unwrap();
        if let Some(range) = preset.params.range_semitones {
            params.range_semitones = range;
        }
        if let Some(prescaler) = preset.params.prescaler {
            params.prescaler = prescaler;
        }
        if let Some(threshold) = preset.params.threshold {
            params.threshold = threshold;
        }
        if let Some(ratio) = preset.params.ratio {
            params.ratio = ratio;
        }
        if let Some(timeout_ms) = preset.params.timeout_ms {
            params.timeout = millis(timeout_ms);
        }
        true
    }
}
