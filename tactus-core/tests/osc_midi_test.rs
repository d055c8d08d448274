// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! OSC-to-MIDI converter behavior: scaling, summation, deduplication,
//! 14-bit handling, and the pitch-wheel range RPN.

use std::sync::{Arc, Mutex};

use tactus_core::keyboard::PianoKeyboard;
use tactus_core::midi::{testing::RecordingSink, MidiMessage};
use tactus_core::osc_midi::OutOfRangeBehavior;
use tactus_core::router::MidiInputRouter;
use tactus_core::segment::{MidiKeyboardSegment, CONTROL_PITCH_WHEEL};
use tactus_core::types::Timestamp;

use rosc::OscType;

struct Rig {
    keyboard: Arc<PianoKeyboard>,
    segment: Arc<MidiKeyboardSegment>,
    messages: Arc<Mutex<Vec<MidiMessage>>>,
    _router: Arc<MidiInputRouter>,
}

fn rig() -> Rig {
    let keyboard = PianoKeyboard::new();
    let (sink, messages) = RecordingSink::new();
    keyboard.midi_output().set_port(0, sink);
    let router = MidiInputRouter::new(keyboard.clone());
    let segment = router.add_segment(0, 0, 127, 0xFFFF);
    // Give note 60 a retransmission channel for the converter to target
    keyboard
        .key(60)
        .unwrap()
        .midi_note_on(segment.id(), 100, 3, Timestamp::ZERO);
    messages.lock().unwrap().clear();
    Rig {
        keyboard,
        segment,
        messages,
        _router: router,
    }
}

fn send_input(rig: &Rig, path: &str, value: f32) {
    rig.keyboard.send_message(
        path,
        vec![OscType::Int(60), OscType::Float(value)],
    );
}

fn last_cc(rig: &Rig) -> Option<(u8, u8, u8)> {
    rig.messages
        .lock()
        .unwrap()
        .iter()
        .rev()
        .find_map(|m| match m {
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => Some((*channel, *controller, *value)),
            _ => None,
        })
}

#[test]
fn single_input_round_trip_scales_to_seven_bits() {
    let rig = rig();
    let converter = rig.segment.acquire_osc_midi_converter(1);
    converter.set_midi_message_type(Some(0), Some(0), Some(127), Some(0), false);
    converter.add_control("/test/x", 1, 0.0, 1.0, 0.0, OutOfRangeBehavior::Clip);

    for x in [0.0f32, 0.25, 0.5, 0.73, 1.0] {
        send_input(&rig, "/test/x", x);
        let (channel, controller, value) = last_cc(&rig).expect("CC emitted");
        assert_eq!(channel, 3);
        assert_eq!(controller, 1);
        assert_eq!(value, (127.0 * x).round() as u8, "input {x}");
    }
    rig.segment.release_osc_midi_converter(1);
}

#[test]
fn out_of_range_input_clips() {
    let rig = rig();
    let converter = rig.segment.acquire_osc_midi_converter(1);
    converter.set_midi_message_type(Some(0), Some(0), Some(127), Some(0), false);
    converter.add_control("/test/x", 1, 0.0, 1.0, 0.0, OutOfRangeBehavior::Clip);

    send_input(&rig, "/test/x", 4.2);
    assert_eq!(last_cc(&rig).unwrap().2, 127);
    send_input(&rig, "/test/x", -3.0);
    assert_eq!(last_cc(&rig).unwrap().2, 0);
}

#[test]
fn out_of_range_input_can_be_ignored() {
    let rig = rig();
    let converter = rig.segment.acquire_osc_midi_converter(1);
    converter.set_midi_message_type(Some(0), Some(0), Some(127), Some(0), false);
    converter.add_control("/test/x", 1, 0.0, 1.0, 0.0, OutOfRangeBehavior::Ignore);

    send_input(&rig, "/test/x", 2.0);
    assert!(last_cc(&rig).is_none(), "ignored input emits nothing");
}

#[test]
fn two_inputs_sum_and_each_update_emits_at_most_one_message() {
    let rig = rig();
    let converter = rig.segment.acquire_osc_midi_converter(1);
    converter.set_midi_message_type(Some(0), Some(0), Some(127), Some(0), false);
    converter.add_control("/test/x", 1, 0.0, 1.0, 0.0, OutOfRangeBehavior::Clip);
    converter.add_control("/test/y", 1, 0.0, 1.0, 0.0, OutOfRangeBehavior::Clip);

    send_input(&rig, "/test/x", 0.5);
    assert_eq!(last_cc(&rig).unwrap().2, 64);

    let count_before = rig.messages.lock().unwrap().len();
    send_input(&rig, "/test/y", 0.25);
    let count_after = rig.messages.lock().unwrap().len();
    // Sum of both contributions, one message for the update
    assert_eq!(last_cc(&rig).unwrap().2, (127.0f32 * 0.75).round() as u8);
    assert_eq!(count_after - count_before, 1);

    // Saturating sum clips at full scale
    send_input(&rig, "/test/x", 1.0);
    assert_eq!(last_cc(&rig).unwrap().2, 127);
}

#[test]
fn repeated_value_is_deduplicated() {
    let rig = rig();
    let converter = rig.segment.acquire_osc_midi_converter(1);
    converter.set_midi_message_type(Some(0), Some(0), Some(127), Some(0), false);
    converter.add_control("/test/x", 1, 0.0, 1.0, 0.0, OutOfRangeBehavior::Clip);

    send_input(&rig, "/test/x", 0.5);
    let count = rig.messages.lock().unwrap().len();
    // Slightly different input, same rounded controller value
    send_input(&rig, "/test/x", 0.501);
    assert_eq!(rig.messages.lock().unwrap().len(), count, "same CC suppressed");

    // resend() forces re-emission
    converter.resend(3);
    assert_eq!(rig.messages.lock().unwrap().len(), count + 1);
}

#[test]
fn fourteen_bit_cc_splits_msb_and_lsb() {
    let rig = rig();
    let converter = rig.segment.acquire_osc_midi_converter(7);
    converter.set_midi_message_type(Some(0), Some(0), Some(127), Some(0), true);
    converter.add_control("/test/x", 1, 0.0, 1.0, 0.0, OutOfRangeBehavior::Clip);

    send_input(&rig, "/test/x", 0.5);
    let ccs: Vec<(u8, u8)> = rig
        .messages
        .lock()
        .unwrap()
        .iter()
        .filter_map(|m| match m {
            MidiMessage::ControlChange {
                controller, value, ..
            } => Some((*controller, *value)),
            _ => None,
        })
        .collect();
    // Output range premultiplied by 128: 0.5 * 127 * 128 = 8128
    let expected = (0.5f32 * 127.0 * 128.0).round() as i32;
    assert_eq!(ccs.len(), 2);
    assert_eq!(ccs[0], (7, ((expected >> 7) & 0x7F) as u8));
    assert_eq!(ccs[1], (7 + 32, (expected & 0x7F) as u8));
}

#[test]
fn pitch_wheel_converter_uses_segment_range_and_14_bits() {
    let rig = rig();
    rig.segment.set_midi_pitch_wheel_range(2.0, false);
    let converter = rig.segment.acquire_osc_midi_converter(CONTROL_PITCH_WHEEL);
    // Zero input range defers to the segment's pitch-wheel range
    converter.set_midi_message_type(None, None, None, None, false);
    converter.add_control("/test/bend", 1, 0.0, 0.0, 0.0, OutOfRangeBehavior::Clip);

    // +2 semitones = full upward bend
    send_input(&rig, "/test/bend", 2.0);
    let wheel = rig
        .messages
        .lock()
        .unwrap()
        .iter()
        .rev()
        .find_map(|m| match m {
            MidiMessage::PitchWheel { value, .. } => Some(*value),
            _ => None,
        })
        .expect("pitch wheel emitted");
    assert_eq!(wheel, 16383);

    // Center
    send_input(&rig, "/test/bend", 0.0);
    let wheel = rig
        .messages
        .lock()
        .unwrap()
        .iter()
        .rev()
        .find_map(|m| match m {
            MidiMessage::PitchWheel { value, .. } => Some(*value),
            _ => None,
        })
        .unwrap();
    assert!((8191..=8192).contains(&wheel), "centered, got {wheel}");
}

#[test]
fn pitch_wheel_range_rpn_sequence() {
    let rig = rig();
    rig.segment.set_midi_pitch_wheel_range(2.5, true);

    let ccs: Vec<(u8, u8)> = rig
        .messages
        .lock()
        .unwrap()
        .iter()
        .filter_map(|m| match m {
            MidiMessage::ControlChange {
                controller, value, ..
            } => Some((*controller, *value)),
            _ => None,
        })
        .collect();
    assert_eq!(
        ccs,
        vec![
            (101, 0),
            (100, 0),
            (6, 2),   // semitones
            (38, 50), // cents
            (101, 127),
            (100, 127),
        ]
    );
}

#[test]
fn converter_reference_counting_shares_and_destroys() {
    let rig = rig();
    let first = rig.segment.acquire_osc_midi_converter(11);
    let second = rig.segment.acquire_osc_midi_converter(11);
    assert!(Arc::ptr_eq(&first, &second));

    rig.segment.release_osc_midi_converter(11);
    assert!(rig.segment.osc_midi_converter(11).is_some(), "still held");
    rig.segment.release_osc_midi_converter(11);
    assert!(rig.segment.osc_midi_converter(11).is_none(), "last release destroys");
}
