// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! OSC to MIDI conversion
//!
//! One [`OscMidiConverter`] exists per `(segment, controller)` pair and
//! turns any number of named OSC control streams into a single MIDI control.
//! Each input is scaled into a normalized 0-1 range, its own center value
//! subtracted; the per-channel control value is the *sum* of every input's
//! latest contribution, optionally plus an incoming MIDI controller
//! pass-through. Output is deduplicated per channel against the last value
//! actually sent.
//!
//! 14-bit CCs keep the same apparent range as their 7-bit form - the output
//! range is premultiplied by 128 and the extra resolution lands on the LSB
//! controller at `cc + 32`. Pitch wheel is always 14-bit (already normalized
//! to its full range, no premultiply); aftertouch is always 7-bit.
//!
//! Converters are acquired and released through the owning segment, which
//! reference-counts them per controller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use rosc::OscType;
use tracing::trace;

use crate::keyboard::PianoKeyboard;
use crate::osc::{float_arg, int_arg, OscHandler};
use crate::segment::{
    MidiKeyboardSegment, CONTROL_CHANNEL_AFTERTOUCH, CONTROL_PITCH_WHEEL, CONTROL_POLY_AFTERTOUCH,
};

/// Policy for inputs that scale outside 0-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutOfRangeBehavior {
    /// Drop the message
    Ignore,
    /// Clip into range
    Clip,
    /// Use the value as-is
    Extrapolate,
}

impl OutOfRangeBehavior {
    pub fn from_index(index: i32) -> OutOfRangeBehavior {
        match index {
            0 => OutOfRangeBehavior::Ignore,
            2 => OutOfRangeBehavior::Extrapolate,
            _ => OutOfRangeBehavior::Clip,
        }
    }

    pub fn index(&self) -> i32 {
        match self {
            OutOfRangeBehavior::Ignore => 0,
            OutOfRangeBehavior::Clip => 1,
            OutOfRangeBehavior::Extrapolate => 2,
        }
    }
}

#[derive(Debug, Clone)]
struct OscInput {
    param_number: usize,
    min_value: f32,
    max_value: f32,
    /// Center already normalized into the 0-1 scale, precomputed
    scaled_center: f32,
    out_of_range: OutOfRangeBehavior,
    unique_id: u32,
}

struct ConverterState {
    control_default: i32,
    control_min: i32,
    control_max: i32,
    control_center: i32,
    is_14_bit: bool,

    incoming_controller: Option<usize>,
    incoming_center: i32,

    inputs: HashMap<String, OscInput>,
    /// (channel, input id) -> that input's latest normalized contribution
    last_values: HashMap<(u8, u32), f32>,
    current_value: [f32; 16],
    last_output_value: [Option<i32>; 16],
    next_unique_id: u32,
}

/// Sums named OSC inputs into one MIDI controller per channel.
pub struct OscMidiConverter {
    keyboard: Weak<PianoKeyboard>,
    segment: Weak<MidiKeyboardSegment>,
    controller: usize,
    state: Mutex<ConverterState>,
}

impl OscMidiConverter {
    pub fn new(
        keyboard: &Arc<PianoKeyboard>,
        segment: &Arc<MidiKeyboardSegment>,
        controller: usize,
    ) -> Arc<Self> {
        let converter = Arc::new(OscMidiConverter {
            keyboard: Arc::downgrade(keyboard),
            segment: Arc::downgrade(segment),
            controller,
            state: Mutex::new(ConverterState {
                control_default: 0,
                control_min: 0,
                control_max: 127,
                control_center: 0,
                is_14_bit: false,
                incoming_controller: None,
                incoming_center: 0,
                inputs: HashMap::new(),
                last_values: HashMap::new(),
                current_value: [0.0; 16],
                last_output_value: [None; 16],
                next_unique_id: 0,
            }),
        });
        converter.set_midi_message_type(None, None, None, None, false);
        converter
    }

    pub fn controller(&self) -> usize {
        self.controller
    }

    /// Configure the output side: default, range, center, and whether to use
    /// a 14-bit control. `None` arguments take per-controller defaults
    /// (pitch wheel centers at 8192, everything else at 0).
    pub fn set_midi_message_type(
        &self,
        default_value: Option<i32>,
        min_value: Option<i32>,
        max_value: Option<i32>,
        center_value: Option<i32>,
        use_14_bit: bool,
    ) {
        let mut state = self.state.lock().unwrap();
        // Clear active inputs but not the registered mappings themselves
        state.last_values.clear();

        let natural_center = if self.controller == CONTROL_PITCH_WHEEL {
            8192
        } else {
            0
        };
        state.control_default = default_value.unwrap_or(natural_center);
        state.control_center = center_value.unwrap_or(natural_center);

        // Pitch wheel is always 14-bit; aftertouch always 7-bit; CC numbers
        // above 95 have no defined LSB partner at cc+32
        state.is_14_bit = if self.controller == CONTROL_PITCH_WHEEL {
            true
        } else if self.controller < 96 {
            use_14_bit
        } else {
            false
        };

        let full_scale = if state.is_14_bit { 16383 } else { 127 };
        state.control_max = match max_value {
            Some(max) if (0..=full_scale).contains(&max) => max,
            _ => full_scale,
        };
        state.control_min = match min_value {
            Some(min) if (0..=full_scale).contains(&min) => min,
            _ => 0,
        };
    }

    /// Fold an incoming MIDI controller into the sum, centered on
    /// `center_value` (pitch wheel defaults to 8192).
    pub fn listen_to_incoming_control(&self, controller: usize, center_value: Option<i32>) {
        let mut state = self.state.lock().unwrap();
        state.incoming_controller = Some(controller);
        state.incoming_center = center_value.unwrap_or(if controller == CONTROL_PITCH_WHEEL {
            8192
        } else {
            0
        });
    }

    /// Add a named OSC input stream contributing to this control.
    pub fn add_control(
        self: &Arc<Self>,
        path: &str,
        param_number: usize,
        min_value: f32,
        max_value: f32,
        center_value: f32,
        out_of_range: OutOfRangeBehavior,
    ) {
        self.remove_control(path);

        let mut state = self.state.lock().unwrap();
        let scaled_center = if min_value == max_value {
            0.5
        } else {
            ((center_value - min_value) / (max_value - min_value)).clamp(0.0, 1.0)
        };
        let unique_id = state.next_unique_id;
        state.next_unique_id += 1;
        state.inputs.insert(
            path.to_string(),
            OscInput {
                param_number,
                min_value,
                max_value,
                scaled_center,
                out_of_range,
                unique_id,
            },
        );
        drop(state);

        if let Some(keyboard) = self.keyboard.upgrade() {
            let handler: Arc<dyn OscHandler> = self.clone();
            keyboard.osc_hub().add_listener(path, &handler);
        }
    }

    /// Remove an input stream, subtracting its contributions and re-emitting
    /// the affected channels.
    pub fn remove_control(self: &Arc<Self>, path: &str) {
        let affected: Vec<u8> = {
            let mut state = self.state.lock().unwrap();
            let Some(input) = state.inputs.get(path).cloned() else {
                return;
            };
            let mut affected = Vec::new();
            for channel in 0..16u8 {
                if let Some(last) = state.last_values.remove(&(channel, input.unique_id)) {
                    state.current_value[channel as usize] -= last;
                    affected.push(channel);
                }
            }
            state.inputs.remove(path);
            affected
        };

        for channel in affected {
            self.send_current_value(channel, None, true);
        }

        if let Some(keyboard) = self.keyboard.upgrade() {
            let handler: Arc<dyn OscHandler> = self.clone();
            let weak = Arc::downgrade(&handler);
            keyboard.osc_hub().remove_listener(path, &weak);
        }
    }

    pub fn remove_all_controls(self: &Arc<Self>) {
        let paths: Vec<String> = self.state.lock().unwrap().inputs.keys().cloned().collect();
        for path in paths {
            self.remove_control(&path);
        }
        let mut state = self.state.lock().unwrap();
        state.last_values.clear();
        state.next_unique_id = 0;
    }

    pub fn set_control_min_value(&self, path: &str, value: f32) {
        if let Some(input) = self.state.lock().unwrap().inputs.get_mut(path) {
            input.min_value = value;
        }
    }

    pub fn set_control_max_value(&self, path: &str, value: f32) {
        if let Some(input) = self.state.lock().unwrap().inputs.get_mut(path) {
            input.max_value = value;
        }
    }

    pub fn set_control_center_value(&self, path: &str, value: f32) {
        let mut state = self.state.lock().unwrap();
        let Some(input) = state.inputs.get(path).cloned() else {
            return;
        };
        let scaled = if input.min_value == input.max_value {
            0.0
        } else {
            ((value - input.min_value) / (input.max_value - input.min_value)).clamp(0.0, 1.0)
        };
        if let Some(input) = state.inputs.get_mut(path) {
            input.scaled_center = scaled;
        }
    }

    pub fn set_control_out_of_range_behavior(&self, path: &str, behavior: OutOfRangeBehavior) {
        if let Some(input) = self.state.lock().unwrap().inputs.get_mut(path) {
            input.out_of_range = behavior;
        }
    }

    /// Drop any active contributions on `channel`; with `send`, re-emit the
    /// default value if anything was dropped. Called when a channel is
    /// reallocated to a new note.
    pub fn clear_last_values(&self, channel: u8, send: bool) {
        if channel >= 16 {
            return;
        }
        let erased = {
            let mut state = self.state.lock().unwrap();
            let before = state.last_values.len();
            state.last_values.retain(|&(ch, _), _| ch != channel);
            state.current_value[channel as usize] = 0.0;
            state.last_output_value[channel as usize] = None;
            state.last_values.len() != before
        };
        if erased && send {
            self.send_default_value(channel);
        }
    }

    /// Resend the most recent value on `channel` unconditionally.
    pub fn resend(&self, channel: u8) {
        self.send_current_value(channel, None, true);
    }

    /// Send the default output value (modulated by any incoming controller)
    /// on `channel`.
    pub fn send_default_value(&self, channel: u8) {
        let value = {
            let state = self.state.lock().unwrap();
            let mut value = state.control_default;
            if let Some(incoming) = state.incoming_controller {
                value += self.segment_controller_value(incoming) - state.incoming_center;
            }
            value
        };
        self.emit(channel, None, value);
    }

    fn segment_controller_value(&self, controller: usize) -> i32 {
        self.segment
            .upgrade()
            .map(|segment| segment.controller_value(controller))
            .unwrap_or(0)
    }

    /// The rounded, clamped controller value for `channel` from the current
    /// sum of contributions.
    fn current_controller_value(&self, channel: u8) -> i32 {
        let state = self.state.lock().unwrap();
        let mut value = state.control_center as f32
            + state.control_min as f32
            + state.current_value[channel as usize]
                * (state.control_max - state.control_min) as f32;
        if let Some(incoming) = state.incoming_controller {
            value += (self.segment_controller_value(incoming) - state.incoming_center) as f32;
        }
        // 14-bit CCs scale a 7-bit-shaped range up, adding resolution on the
        // LSB controller. Pitch wheel values are already 14-bit normalized.
        if state.is_14_bit && self.controller != CONTROL_PITCH_WHEEL {
            value *= 128.0;
        }
        let max = if state.is_14_bit { 16383 } else { 127 };
        (value + 0.5).floor().clamp(0.0, max as f32) as i32
    }

    fn send_current_value(&self, channel: u8, note: Option<u8>, force: bool) {
        if channel >= 16 {
            return;
        }
        let value = self.current_controller_value(channel);
        {
            let mut state = self.state.lock().unwrap();
            if !force && state.last_output_value[channel as usize] == Some(value) {
                return;
            }
            state.last_output_value[channel as usize] = Some(value);
        }
        self.emit(channel, note, value);
    }

    fn emit(&self, channel: u8, note: Option<u8>, value: i32) {
        let Some(keyboard) = self.keyboard.upgrade() else {
            return;
        };
        let Some(segment) = self.segment.upgrade() else {
            return;
        };
        let port = segment.output_port();
        let midi = keyboard.midi_output();
        let is_14_bit = self.state.lock().unwrap().is_14_bit;

        match self.controller {
            CONTROL_PITCH_WHEEL => midi.send_pitch_wheel(port, channel, value.clamp(0, 16383) as u16),
            CONTROL_CHANNEL_AFTERTOUCH => {
                midi.send_aftertouch_channel(port, channel, value.clamp(0, 127) as u8)
            }
            CONTROL_POLY_AFTERTOUCH => {
                if let Some(note) = note {
                    let transposed =
                        (note as i32 + segment.output_transposition()).clamp(0, 127) as u8;
                    midi.send_aftertouch_poly(port, channel, transposed, value.clamp(0, 127) as u8);
                }
            }
            cc if is_14_bit => {
                let value = value.clamp(0, 16383);
                midi.send_control_change(port, channel, cc as u8, ((value >> 7) & 0x7F) as u8);
                midi.send_control_change(port, channel, cc as u8 + 32, (value & 0x7F) as u8);
            }
            cc => midi.send_control_change(port, channel, cc as u8, value.clamp(0, 127) as u8),
        }
    }
}

impl OscHandler for OscMidiConverter {
    /// Fold a new value from one OSC input into the per-channel sum and
    /// emit the result.
    fn osc_message(&self, path: &str, args: &[OscType]) -> bool {
        // First argument is always the MIDI note, which resolves to the
        // note's retransmission channel
        let Some(note) = int_arg(args, 0) else {
            return false;
        };
        if !(0..128).contains(&note) {
            return false;
        }
        let Some(keyboard) = self.keyboard.upgrade() else {
            return false;
        };
        let Some(channel) = keyboard.key(note as u8).and_then(|key| key.midi_channel()) else {
            trace!(note, "no retransmission channel for note");
            return false;
        };

        let scaled = {
            let state = self.state.lock().unwrap();
            let Some(input) = state.inputs.get(path) else {
                return false;
            };
            let Some(raw) = float_arg(args, input.param_number) else {
                return false;
            };

            // Pitch wheel with a zero input range means "use the segment's
            // pitch-wheel range" so it isn't cached in every converter
            let mut scaled = if self.controller == CONTROL_PITCH_WHEEL
                && input.min_value == 0.0
                && input.max_value == 0.0
            {
                let range = self
                    .segment
                    .upgrade()
                    .map(|s| s.midi_pitch_wheel_range())
                    .unwrap_or(2.0);
                (raw + range) / (2.0 * range)
            } else {
                (raw - input.min_value) / (input.max_value - input.min_value)
            };

            if !(0.0..=1.0).contains(&scaled) {
                match input.out_of_range {
                    OutOfRangeBehavior::Clip => scaled = scaled.clamp(0.0, 1.0),
                    OutOfRangeBehavior::Extrapolate => {}
                    OutOfRangeBehavior::Ignore => return false,
                }
            }

            // Subtracting the center may leave 0-1; that is expected (a
            // pitch-wheel style input becomes -0.5 to 0.5)
            Some((input.unique_id, scaled - input.scaled_center))
        };
        let Some((input_id, contribution)) = scaled else {
            return false;
        };

        {
            let mut state = self.state.lock().unwrap();
            if let Some(previous) = state.last_values.insert((channel, input_id), contribution) {
                state.current_value[channel as usize] -= previous;
            }
            state.current_value[channel as usize] += contribution;
        }

        self.send_current_value(channel, Some(note as u8), false);
        true
    }
}
