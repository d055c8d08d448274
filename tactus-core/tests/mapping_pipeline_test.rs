// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Pipeline tests across PianoKey, the mapping factories, and the mapping
//! run thread: mappings appear when notes get interesting, produce their
//! output, and disappear when touch and MIDI are both gone.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rosc::OscType;
use tactus_core::keyboard::PianoKeyboard;
use tactus_core::midi::{testing::RecordingSink, MidiMessage};
use tactus_core::router::MidiInputRouter;
use tactus_core::segment::Mode;
use tactus_core::touch::KeyTouchFrame;
use tactus_core::types::Timestamp;

fn frame(locs: &[f32], loc_h: f32) -> KeyTouchFrame {
    let sizes = vec![0.3; locs.len()];
    KeyTouchFrame::from_raw(locs.len(), locs, &sizes, loc_h, true)
}

fn wait_until(predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn factory_creates_and_removes_mappings_with_note_lifetime() {
    let keyboard = PianoKeyboard::new();
    let router = MidiInputRouter::new(keyboard.clone());
    let segment = router.add_segment(0, 0, 127, 0xFFFF);
    segment.set_mode(Mode::Polyphonic);

    let factory = segment.create_mapping_factory_for_index(2).unwrap(); // Vibrato
    segment.add_mapping_factory(factory.clone(), true);
    assert_eq!(factory.short_name(), "vibrato");

    let key = keyboard.key(60).unwrap().clone();
    key.midi_note_on(segment.id(), 100, 0, Timestamp::ZERO);
    assert_eq!(factory.active_mappings(), vec![60]);

    // MIDI off with no touch active: the mapping goes away
    key.midi_note_off(segment.id(), Timestamp::from_millis(100));
    assert!(factory.active_mappings().is_empty());
}

#[test]
fn touch_alone_sustains_the_mapping_until_both_end() {
    let keyboard = PianoKeyboard::new();
    let router = MidiInputRouter::new(keyboard.clone());
    let segment = router.add_segment(0, 0, 127, 0xFFFF);

    let factory = segment.create_mapping_factory_for_index(2).unwrap();
    segment.add_mapping_factory(factory.clone(), true);

    let key = keyboard.key(64).unwrap().clone();
    key.touch_insert_frame(frame(&[0.4], 0.5), Timestamp::from_millis(1));
    assert_eq!(factory.active_mappings(), vec![64]);

    key.midi_note_on(segment.id(), 90, 0, Timestamp::from_millis(2));
    // MIDI off while touch still down: mapping survives
    key.midi_note_off(segment.id(), Timestamp::from_millis(50));
    assert_eq!(factory.active_mappings(), vec![64]);

    key.touch_off(Timestamp::from_millis(60));
    assert!(factory.active_mappings().is_empty());
}

#[test]
fn bypassed_factory_creates_no_mappings() {
    let keyboard = PianoKeyboard::new();
    let router = MidiInputRouter::new(keyboard.clone());
    let segment = router.add_segment(0, 0, 127, 0xFFFF);

    let factory = segment.create_mapping_factory_for_index(2).unwrap();
    factory.set_bypassed(true);
    segment.add_mapping_factory(factory.clone(), true);

    let key = keyboard.key(60).unwrap().clone();
    key.midi_note_on(segment.id(), 100, 0, Timestamp::ZERO);
    assert!(factory.active_mappings().is_empty());
}

#[test]
fn active_note_mask_limits_pitch_classes() {
    let keyboard = PianoKeyboard::new();
    let router = MidiInputRouter::new(keyboard.clone());
    let segment = router.add_segment(0, 0, 127, 0xFFFF);

    let factory = segment.create_mapping_factory_for_index(2).unwrap();
    factory.set_active_notes(1 << 0); // pitch class C only
    segment.add_mapping_factory(factory.clone(), true);

    keyboard
        .key(61)
        .unwrap()
        .midi_note_on(segment.id(), 100, 0, Timestamp::ZERO); // C#
    assert!(factory.active_mappings().is_empty());
    keyboard
        .key(72)
        .unwrap()
        .midi_note_on(segment.id(), 100, 0, Timestamp::ZERO); // C
    assert_eq!(factory.active_mappings(), vec![72]);
}

#[test]
fn two_finger_tap_fires_a_trigger_note() {
    let keyboard = PianoKeyboard::new();
    let (sink, messages) = RecordingSink::new();
    keyboard.midi_output().set_port(0, sink);
    let router = MidiInputRouter::new(keyboard.clone());
    let segment = router.add_segment(0, 0, 127, 0xFFFF);

    let factory = segment.create_mapping_factory_for_index(4).unwrap(); // Multi-Finger Trigger
    segment.add_mapping_factory(factory, true);

    let key = keyboard.key(60).unwrap().clone();
    key.midi_note_on(segment.id(), 100, 2, Timestamp::ZERO);
    messages.lock().unwrap().clear();

    // Two fingers held for two frames
    key.touch_insert_frame(frame(&[0.3, 0.6], -1.0), Timestamp::from_millis(10));
    key.touch_insert_frame(frame(&[0.3, 0.6], -1.0), Timestamp::from_millis(15));

    let sent = messages.lock().unwrap();
    assert_eq!(
        sent.as_slice(),
        &[MidiMessage::NoteOn {
            channel: 2,
            note: 60,
            velocity: 100
        }],
        "gesture fires one note-on at the key's velocity"
    );
}

#[test]
fn single_finger_never_triggers() {
    let keyboard = PianoKeyboard::new();
    let (sink, messages) = RecordingSink::new();
    keyboard.midi_output().set_port(0, sink);
    let router = MidiInputRouter::new(keyboard.clone());
    let segment = router.add_segment(0, 0, 127, 0xFFFF);

    let factory = segment.create_mapping_factory_for_index(4).unwrap();
    segment.add_mapping_factory(factory, true);

    let key = keyboard.key(60).unwrap().clone();
    key.midi_note_on(segment.id(), 100, 2, Timestamp::ZERO);
    messages.lock().unwrap().clear();

    for i in 0..10u64 {
        key.touch_insert_frame(frame(&[0.4], -1.0), Timestamp::from_millis(10 + i * 5));
    }
    assert!(messages.lock().unwrap().is_empty());
}

#[test]
fn onset_angle_reports_swipe_velocity_at_note_on() {
    let keyboard = PianoKeyboard::new();
    let (osc_sink, osc_messages) = tactus_core::osc::testing::RecordingOscSink::new();
    keyboard.osc_transmitter().add_sink(osc_sink);
    let router = MidiInputRouter::new(keyboard.clone());
    let segment = router.add_segment(0, 0, 127, 0xFFFF);

    let factory = segment.create_mapping_factory_for_index(3).unwrap(); // Onset Angle
    segment.add_mapping_factory(factory, true);

    let key = keyboard.key(60).unwrap().clone();
    // Fast swipe along the key just before the onset
    for i in 0..8u64 {
        let loc = 0.2 + 0.08 * i as f32;
        key.touch_insert_frame(frame(&[loc], -1.0), Timestamp::from_millis(i * 5));
    }
    key.midi_note_on(segment.id(), 100, 0, Timestamp::from_millis(40));

    let sent = osc_messages.lock().unwrap();
    let onset = sent
        .iter()
        .find(|m| m.addr == "/touchkeys/onsetangle")
        .expect("onset angle message");
    assert_eq!(onset.args[0], OscType::Int(60));
    match onset.args[1] {
        OscType::Float(angle) => assert!(angle > 1.5, "fast swipe, got {angle}"),
        _ => panic!("angle must be a float"),
    }
}

#[test]
fn backward_swipe_reports_its_full_negative_velocity() {
    let keyboard = PianoKeyboard::new();
    let (osc_sink, osc_messages) = tactus_core::osc::testing::RecordingOscSink::new();
    keyboard.osc_transmitter().add_sink(osc_sink);
    let router = MidiInputRouter::new(keyboard.clone());
    let segment = router.add_segment(0, 0, 127, 0xFFFF);

    let factory = segment.create_mapping_factory_for_index(3).unwrap(); // Onset Angle
    segment.add_mapping_factory(factory, true);

    let key = keyboard.key(60).unwrap().clone();
    // Fast swipe toward the front of the key: well past -6 key lengths/s
    for i in 0..8u64 {
        let loc = 0.8 - 0.08 * i as f32;
        key.touch_insert_frame(frame(&[loc], -1.0), Timestamp::from_millis(i * 5));
    }
    key.midi_note_on(segment.id(), 100, 0, Timestamp::from_millis(40));

    let sent = osc_messages.lock().unwrap();
    let onset = sent
        .iter()
        .find(|m| m.addr == "/touchkeys/onsetangle")
        .expect("onset angle message");
    match onset.args[1] {
        // Only the upper bound clamps; backward motion passes through
        OscType::Float(angle) => assert!(angle < -6.0, "expected unclamped, got {angle}"),
        _ => panic!("angle must be a float"),
    }
}

#[test]
fn mrp_mapping_streams_intensity_from_key_motion() {
    let keyboard = PianoKeyboard::new();
    keyboard.start();
    let (osc_sink, osc_messages) = tactus_core::osc::testing::RecordingOscSink::new();
    keyboard.osc_transmitter().add_sink(osc_sink);
    let router = MidiInputRouter::new(keyboard.clone());
    let segment = router.add_segment(0, 0, 127, 0xFFFF);

    let factory = segment.create_mapping_factory_for_index(1).unwrap(); // MRP
    segment.add_mapping_factory(factory.clone(), true);

    let key = keyboard.key(60).unwrap().clone();

    // Rest long enough for the idle detector to classify the key, then a
    // press; going active creates the MRP mapping from key motion alone
    for i in 0..40u64 {
        key.insert_position_sample(0.0, Timestamp::from_millis(i));
    }
    for i in 0..60u64 {
        let pos = (i as f64 / 59.0).min(1.0);
        key.insert_position_sample(pos, Timestamp::from_millis(40 + i));
    }
    for i in 0..30u64 {
        key.insert_position_sample(1.0, Timestamp::from_millis(100 + i));
    }
    assert_eq!(factory.active_mappings(), vec![60]);

    // The mapping thread polls and emits the quality streams
    wait_until(|| {
        osc_messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.addr == "/mrp/quality/intensity")
    });
    wait_until(|| {
        osc_messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.addr == "/mrp/midi")
    });

    let sent = osc_messages.lock().unwrap();
    let note_on = sent
        .iter()
        .find(|m| m.addr == "/mrp/midi")
        .expect("mrp note on");
    assert_eq!(note_on.args[0], OscType::Int(0x90 + 15));
    assert_eq!(note_on.args[1], OscType::Int(60));
    assert_eq!(note_on.args[2], OscType::Int(127));

    let peak_intensity = sent
        .iter()
        .filter(|m| m.addr == "/mrp/quality/intensity")
        .filter_map(|m| match m.args[2] {
            OscType::Float(v) => Some(v),
            _ => None,
        })
        .fold(0.0f32, f32::max);
    assert!(peak_intensity > 0.9, "full press, got {peak_intensity}");

    keyboard.stop();
}
