// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Per-segment OSC control surface: every command answers `/result 0` on
//! success and `/result 1` (or a richer reply) as specified, with no state
//! change on rejected input.

use std::sync::Arc;

use rosc::{OscMessage, OscType};
use tactus_core::keyboard::PianoKeyboard;
use tactus_core::router::MidiInputRouter;
use tactus_core::segment::{MidiKeyboardSegment, Mode};

fn rig() -> (Arc<MidiInputRouter>, Arc<MidiKeyboardSegment>) {
    let keyboard = PianoKeyboard::new();
    let router = MidiInputRouter::new(keyboard);
    let segment = router.add_segment(0, 0, 127, 0xFFFF);
    (router, segment)
}

fn expect_result(response: Option<OscMessage>, code: i32) {
    let response = response.expect("command must reply");
    assert_eq!(response.addr, "/result");
    assert_eq!(response.args, vec![OscType::Int(code)]);
}

#[test]
fn set_midi_mode_switches_modes() {
    let (_router, segment) = rig();
    for (name, mode) in [
        ("poly", Mode::Polyphonic),
        ("mono", Mode::Monophonic),
        ("pass", Mode::PassThrough),
        ("mpe", Mode::Mpe),
        ("off", Mode::Off),
    ] {
        let response =
            segment.osc_control_method("/set-midi-mode", &[OscType::String(name.into())]);
        expect_result(response, 0);
        assert_eq!(segment.mode(), mode, "mode {name}");
    }

    let response =
        segment.osc_control_method("/set-midi-mode", &[OscType::String("bogus".into())]);
    expect_result(response, 1);
}

#[test]
fn set_range_validates_and_orders_arguments() {
    let (_router, segment) = rig();

    let response = segment.osc_control_method(
        "/set-range",
        &[OscType::Int(72), OscType::Int(48)],
    );
    expect_result(response, 0);
    assert_eq!(segment.note_range(), (48, 72), "swapped into order");

    let response = segment.osc_control_method(
        "/set-range",
        &[OscType::Int(-3), OscType::Int(400)],
    );
    expect_result(response, 1);
    assert_eq!(segment.note_range(), (48, 72), "no state change on failure");
}

#[test]
fn transpose_commands_clamp_at_four_octaves() {
    let (_router, segment) = rig();

    expect_result(
        segment.osc_control_method("/set-transpose", &[OscType::Int(12)]),
        0,
    );
    assert_eq!(segment.output_transposition(), 12);

    for _ in 0..6 {
        segment.osc_control_method("/set-transpose-octave-up", &[]);
    }
    assert_eq!(segment.output_transposition(), 48);

    for _ in 0..12 {
        segment.osc_control_method("/set-transpose-octave-down", &[]);
    }
    assert_eq!(segment.output_transposition(), -48);

    expect_result(
        segment.osc_control_method("/set-transpose", &[OscType::Int(90)]),
        1,
    );
}

#[test]
fn set_midi_channels_maps_to_lowest_and_polyphony() {
    let (_router, segment) = rig();
    segment.set_mode(Mode::Polyphonic);

    let response = segment.osc_control_method(
        "/set-midi-channels",
        &[OscType::Int(3), OscType::Int(6)],
    );
    expect_result(response, 0);
    assert_eq!(segment.output_channel_lowest(), 2);
    assert_eq!(segment.polyphony(), 4);

    let response = segment.osc_control_method(
        "/set-midi-channels",
        &[OscType::Int(0), OscType::Int(20)],
    );
    expect_result(response, 1);
}

#[test]
fn set_midi_stealing_toggles() {
    let (_router, segment) = rig();
    expect_result(
        segment.osc_control_method("/set-midi-stealing", &[OscType::Int(1)]),
        0,
    );
    assert!(segment.voice_stealing_enabled());
    expect_result(
        segment.osc_control_method("/set-midi-stealing", &[OscType::Int(0)]),
        0,
    );
    assert!(!segment.voice_stealing_enabled());
}

#[test]
fn set_pitchwheel_range_accepts_int_and_float() {
    let (_router, segment) = rig();
    expect_result(
        segment.osc_control_method("/set-pitchwheel-range", &[OscType::Int(12)]),
        0,
    );
    assert_eq!(segment.midi_pitch_wheel_range(), 12.0);
    expect_result(
        segment.osc_control_method("/set-pitchwheel-range", &[OscType::Float(2.5)]),
        0,
    );
    assert_eq!(segment.midi_pitch_wheel_range(), 2.5);
}

#[test]
fn add_and_list_and_address_mappings_by_name() {
    let (_router, segment) = rig();

    // Add a vibrato mapping with an explicit name
    let response = segment.osc_control_method(
        "/add-mapping",
        &[OscType::Int(2), OscType::String("wobble".into())],
    );
    expect_result(response, 0);

    // And one with an autogenerated name
    let response = segment.osc_control_method("/add-mapping", &[OscType::Int(4)]);
    expect_result(response, 0);

    let listing = segment
        .osc_control_method("/list-mappings", &[])
        .expect("listing");
    assert_eq!(listing.addr, "/list-mappings/result");
    assert_eq!(listing.args[0], OscType::Int(2));
    let names: Vec<&str> = listing.args[1..]
        .iter()
        .filter_map(|a| match a {
            OscType::String(s) => Some(s.as_str()),
            _ => None,
        })
        .collect();
    assert!(names.contains(&"wobble"));
    assert!(names.contains(&"multifingertrigger"));

    // Factory-level verbs through the named path
    let response = segment.osc_control_method(
        "/mapping/wobble/set-bypass",
        &[OscType::Int(1)],
    );
    expect_result(response, 0);
    let factory = segment
        .mapping_factories()
        .into_iter()
        .find(|f| f.short_name() == "wobble")
        .unwrap();
    assert!(factory.bypassed());

    // Delete through the named path
    let response = segment.osc_control_method("/mapping/wobble/delete", &[]);
    expect_result(response, 0);
    assert_eq!(segment.mapping_factories().len(), 1);

    // Unknown mapping name: no reply at all
    assert!(segment
        .osc_control_method("/mapping/nonexistent/set-bypass", &[OscType::Int(1)])
        .is_none());
}

#[test]
fn invalid_add_mapping_index_fails() {
    let (_router, segment) = rig();
    expect_result(
        segment.osc_control_method("/add-mapping", &[OscType::Int(99)]),
        1,
    );
    assert!(segment.mapping_factories().is_empty());
}

#[test]
fn router_routes_control_to_segment_by_index() {
    let (router, _segment) = rig();
    let response = router.osc_control_for_segment(
        0,
        "/set-midi-mode",
        &[OscType::String("poly".into())],
    );
    expect_result(response, 0);
    assert!(router
        .osc_control_for_segment(5, "/set-midi-mode", &[OscType::String("poly".into())])
        .is_none());
}
