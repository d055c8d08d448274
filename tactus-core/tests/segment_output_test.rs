// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! End-to-end tests for the keyboard-segment output engine: channel
//! allocation, sustain-pedal reservation, voice stealing, MPE
//! configuration, and transposition.

use std::sync::{Arc, Mutex};

use tactus_core::keyboard::PianoKeyboard;
use tactus_core::midi::{testing::RecordingSink, MidiMessage};
use tactus_core::router::MidiInputRouter;
use tactus_core::segment::{MidiKeyboardSegment, Mode};

struct Rig {
    router: Arc<MidiInputRouter>,
    segment: Arc<MidiKeyboardSegment>,
    messages: Arc<Mutex<Vec<MidiMessage>>>,
}

fn rig(mode: Mode, polyphony: usize) -> Rig {
    let keyboard = PianoKeyboard::new();
    let (sink, messages) = RecordingSink::new();
    keyboard.midi_output().set_port(0, sink);

    let router = MidiInputRouter::new(keyboard);
    let segment = router.add_segment(0, 0, 127, 0xFFFF);
    segment.set_polyphony(polyphony);
    segment.set_mode(mode);
    messages.lock().unwrap().clear();

    Rig {
        router,
        segment,
        messages,
    }
}

fn note_on(rig: &Rig, channel: u8, note: u8, velocity: u8) {
    rig.router.handle_incoming_message(&MidiMessage::NoteOn {
        channel,
        note,
        velocity,
    });
}

fn note_off(rig: &Rig, channel: u8, note: u8) {
    rig.router.handle_incoming_message(&MidiMessage::NoteOff {
        channel,
        note,
        velocity: 64,
    });
}

fn control_change(rig: &Rig, channel: u8, controller: u8, value: u8) {
    rig.router.handle_incoming_message(&MidiMessage::ControlChange {
        channel,
        controller,
        value,
    });
}

fn sent(rig: &Rig) -> Vec<MidiMessage> {
    rig.messages.lock().unwrap().clone()
}

fn sent_notes(rig: &Rig) -> Vec<MidiMessage> {
    sent(rig)
        .into_iter()
        .filter(|m| matches!(m, MidiMessage::NoteOn { .. } | MidiMessage::NoteOff { .. }))
        .collect()
}

#[test]
fn solo_polyphonic_press_allocates_one_channel_per_note() {
    let rig = rig(Mode::Polyphonic, 4);
    rig.segment.set_damper_pedal_enabled(false);

    note_on(&rig, 0, 60, 100);
    note_on(&rig, 0, 64, 100);
    note_off(&rig, 0, 60);
    note_off(&rig, 0, 64);

    assert_eq!(
        sent_notes(&rig),
        vec![
            MidiMessage::NoteOn {
                channel: 0,
                note: 60,
                velocity: 100
            },
            MidiMessage::NoteOn {
                channel: 1,
                note: 64,
                velocity: 100
            },
            MidiMessage::NoteOff {
                channel: 0,
                note: 60,
                velocity: 64
            },
            MidiMessage::NoteOff {
                channel: 1,
                note: 64,
                velocity: 64
            },
        ]
    );
    // All four channels free again
    assert_eq!(rig.segment.available_channels(), vec![0, 1, 2, 3]);
}

#[test]
fn simultaneous_notes_never_share_a_channel() {
    let rig = rig(Mode::Polyphonic, 4);
    rig.segment.set_damper_pedal_enabled(false);

    for note in [60u8, 62, 64, 65] {
        note_on(&rig, 0, note, 90);
    }
    let mut channels: Vec<u8> = [60u8, 62, 64, 65]
        .iter()
        .map(|&n| rig.segment.channel_for_note(n).unwrap())
        .collect();
    channels.sort_unstable();
    assert_eq!(channels, vec![0, 1, 2, 3]);
    assert!(rig.segment.available_channels().is_empty());
}

#[test]
fn note_beyond_polyphony_is_dropped_without_stealing() {
    let rig = rig(Mode::Polyphonic, 2);
    rig.segment.set_damper_pedal_enabled(false);
    rig.segment.set_voice_stealing_enabled(false);

    note_on(&rig, 0, 60, 100);
    note_on(&rig, 0, 62, 100);
    note_on(&rig, 0, 64, 100);

    assert_eq!(rig.segment.channel_for_note(64), None);
    assert_eq!(sent_notes(&rig).len(), 2, "third note silently dropped");
}

#[test]
fn voice_stealing_takes_the_oldest_note() {
    let rig = rig(Mode::Polyphonic, 2);
    rig.segment.set_damper_pedal_enabled(false);
    rig.segment.set_voice_stealing_enabled(true);

    note_on(&rig, 0, 60, 100);
    note_on(&rig, 0, 62, 100);
    note_on(&rig, 0, 64, 100);

    // The oldest note (60) was stolen; its channel went to 64
    assert_eq!(rig.segment.channel_for_note(60), None);
    assert!(rig.segment.channel_for_note(64).is_some());
    // Force-off sends All Notes Off / All Sound Off on the stolen channel
    assert!(sent(&rig).iter().any(|m| m.is_all_notes_off()));
    assert!(sent(&rig).iter().any(|m| m.is_all_sound_off()));
}

#[test]
fn sustain_pedal_reserves_and_reuses_the_channel() {
    let rig = rig(Mode::Polyphonic, 4);
    rig.segment.set_damper_pedal_enabled(true);

    note_on(&rig, 0, 60, 100);
    control_change(&rig, 0, 64, 127);
    note_off(&rig, 0, 60);
    note_on(&rig, 0, 60, 100);

    assert_eq!(
        sent(&rig),
        vec![
            MidiMessage::NoteOn {
                channel: 0,
                note: 60,
                velocity: 100
            },
            MidiMessage::ControlChange {
                channel: 0,
                controller: 64,
                value: 127
            },
            MidiMessage::NoteOff {
                channel: 0,
                note: 60,
                velocity: 64
            },
            // Same channel reused for the retaken note
            MidiMessage::NoteOn {
                channel: 0,
                note: 60,
                velocity: 100
            },
        ]
    );
}

#[test]
fn pedal_release_frees_all_reserved_channels_at_once() {
    let rig = rig(Mode::Polyphonic, 4);
    rig.segment.set_damper_pedal_enabled(true);

    note_on(&rig, 0, 60, 100);
    note_on(&rig, 0, 64, 100);
    control_change(&rig, 0, 64, 127);
    note_off(&rig, 0, 60);
    note_off(&rig, 0, 64);

    assert_eq!(rig.segment.notes_held_in_pedal(), vec![60, 64]);
    assert_eq!(rig.segment.available_channels(), vec![2, 3]);

    control_change(&rig, 0, 64, 0);
    assert!(rig.segment.notes_held_in_pedal().is_empty());
    assert_eq!(rig.segment.available_channels(), vec![0, 1, 2, 3]);
}

#[test]
fn pedal_reservation_is_stolen_before_active_voices() {
    let rig = rig(Mode::Polyphonic, 2);
    rig.segment.set_damper_pedal_enabled(true);
    rig.segment.set_voice_stealing_enabled(false);

    note_on(&rig, 0, 60, 100);
    note_on(&rig, 0, 62, 100);
    control_change(&rig, 0, 64, 127);
    note_off(&rig, 0, 60); // rings on in the pedal

    // No free channels, but the pedal-held note can be taken
    note_on(&rig, 0, 65, 100);
    assert_eq!(rig.segment.channel_for_note(60), None, "pedal note stolen");
    assert!(rig.segment.channel_for_note(65).is_some());
    assert!(rig.segment.channel_for_note(62).is_some(), "active note kept");
}

#[test]
fn mpe_configuration_message_announces_member_count() {
    let rig = rig(Mode::Polyphonic, 4);
    rig.segment.set_mode_mpe();
    rig.messages.lock().unwrap().clear();

    rig.segment.set_polyphony(5);

    let ccs: Vec<(u8, u8, u8)> = sent(&rig)
        .into_iter()
        .filter_map(|m| match m {
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => Some((channel, controller, value)),
            _ => None,
        })
        .collect();
    // MCM on the Lower Zone master channel: reset controllers, select
    // RPN 6, member channel count
    assert_eq!(
        ccs,
        vec![(0, 0x79, 0), (0, 0x64, 0x06), (0, 0x65, 0x00), (0, 0x06, 5)]
    );
}

#[test]
fn mpe_reserves_the_master_channel() {
    let rig = rig(Mode::Polyphonic, 4);
    rig.segment.set_mode_mpe();
    rig.messages.lock().unwrap().clear();

    note_on(&rig, 0, 60, 100);
    note_on(&rig, 0, 64, 100);

    // Member channels start at 1; channel 0 stays reserved as Master
    assert_eq!(rig.segment.channel_for_note(60), Some(1));
    assert_eq!(rig.segment.channel_for_note(64), Some(2));
}

#[test]
fn transposition_applies_and_clamps() {
    let rig = rig(Mode::PassThrough, 4);
    rig.segment.set_output_transposition(12);

    note_on(&rig, 2, 60, 80);
    note_off(&rig, 2, 60);

    assert_eq!(
        sent_notes(&rig),
        vec![
            MidiMessage::NoteOn {
                channel: 2,
                note: 72,
                velocity: 80
            },
            MidiMessage::NoteOff {
                channel: 2,
                note: 72,
                velocity: 64
            },
        ]
    );

    rig.messages.lock().unwrap().clear();
    rig.segment.set_output_transposition(48);
    note_on(&rig, 2, 100, 80);
    match sent_notes(&rig)[0] {
        MidiMessage::NoteOn { note, .. } => assert_eq!(note, 127, "clamped to MIDI range"),
        _ => panic!("expected note on"),
    }
}

#[test]
fn monophonic_mode_retriggers_on_one_channel() {
    let rig = rig(Mode::Monophonic, 4);
    rig.segment.set_output_channel_lowest(3);

    note_on(&rig, 0, 60, 100);
    note_on(&rig, 0, 64, 100);
    note_off(&rig, 0, 64);

    for message in sent_notes(&rig) {
        match message {
            MidiMessage::NoteOn { channel, .. } | MidiMessage::NoteOff { channel, .. } => {
                assert_eq!(channel, 3, "monophonic output stays on one channel");
            }
            _ => {}
        }
    }
}

#[test]
fn off_mode_emits_nothing() {
    let rig = rig(Mode::Off, 4);
    note_on(&rig, 0, 60, 100);
    note_off(&rig, 0, 60);
    assert!(sent_notes(&rig).is_empty());
}

#[test]
fn retrigger_of_sounding_note_reuses_its_channel() {
    let rig = rig(Mode::Polyphonic, 4);
    rig.segment.set_damper_pedal_enabled(false);

    note_on(&rig, 0, 60, 100);
    let channel = rig.segment.channel_for_note(60).unwrap();
    note_on(&rig, 0, 60, 110);

    let notes = sent_notes(&rig);
    assert_eq!(notes.len(), 2);
    for message in notes {
        match message {
            MidiMessage::NoteOn { channel: c, .. } => assert_eq!(c, channel),
            _ => panic!("expected note on"),
        }
    }
}

#[test]
fn channel_mask_filters_input() {
    let rig = rig(Mode::PassThrough, 4);
    rig.segment.set_channel_mask(0x0001); // channel 0 only

    // Routed through the router so the mask check applies
    note_on(&rig, 1, 60, 100);
    assert!(sent_notes(&rig).is_empty());
    note_on(&rig, 0, 60, 100);
    assert_eq!(sent_notes(&rig).len(), 1);
}
