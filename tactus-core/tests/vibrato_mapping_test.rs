// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! End-to-end vibrato gesture detection: a sinusoidal lateral touch trace
//! after note-on must engage the mapping within about one period and emit
//! pitch-bend values bounded by the tanh-scaled range.

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rosc::OscType;
use tactus_core::keyboard::PianoKeyboard;
use tactus_core::mapping::factory::KeyEventContext;
use tactus_core::mapping::vibrato::{VibratoMapping, VibratoState};
use tactus_core::mapping::{engage_mapping, Mapping};
use tactus_core::node::Node;
use tactus_core::touch::KeyTouchFrame;
use tactus_core::tracker::KeyPositionTracker;

const RANGE_SEMITONES: f32 = 1.25;
const PRESCALER: f32 = 2.0;
const AMPLITUDE: f64 = 0.06;
const VIBRATO_HZ: f64 = 5.0;
const FRAME_INTERVAL_MS: u64 = 5;

fn touch_frame(loc_h: f32) -> KeyTouchFrame {
    KeyTouchFrame::from_raw(1, &[0.2], &[0.4], loc_h, true)
}

#[test]
fn sine_gesture_engages_and_bends_within_bounds() {
    let keyboard = PianoKeyboard::new();
    keyboard.start();
    let (sink, messages) = tactus_core::osc::testing::RecordingOscSink::new();
    keyboard.osc_transmitter().add_sink(sink);

    let touch_buffer: Arc<Node<KeyTouchFrame>> = Node::with_capacity(256);
    let position_buffer: Arc<Node<f64>> = Node::with_capacity(256);
    let tracker = KeyPositionTracker::new(64, position_buffer.clone());
    let ctx = KeyEventContext {
        note_number: 60,
        midi_note_is_on: false,
        touch_is_on: true,
        key_motion_active: false,
        midi_channel: None,
        midi_velocity: 0,
        touch_buffer: touch_buffer.clone(),
        position_buffer,
        tracker,
    };

    let mapping = VibratoMapping::new(&keyboard, &ctx);
    mapping.common().set_control_name("/touchkeys/mapping/segment0/vibrato");
    // The 9 Hz bandpass attenuates a 5 Hz gesture to ~75%; the onset
    // threshold has to sit below the filtered amplitude
    mapping.set_thresholds(0.035, 0.3);
    engage_mapping(&mapping);

    // Finger lands at center, note starts
    touch_buffer.insert(touch_frame(0.5), keyboard.current_timestamp());
    mapping.midi_note_on_received(0, 100);

    // One and a half periods of 5 Hz lateral sine at the touch frame rate
    let start = Instant::now();
    let mut engaged_after: Option<Duration> = None;
    let total_frames = (1.5 / VIBRATO_HZ * 1000.0 / FRAME_INTERVAL_MS as f64) as usize;
    for _ in 0..total_frames {
        let elapsed = start.elapsed().as_secs_f64();
        let loc_h = 0.5 + AMPLITUDE * (2.0 * PI * VIBRATO_HZ * elapsed).sin();
        touch_buffer.insert(touch_frame(loc_h as f32), keyboard.current_timestamp());
        mapping.perform_mapping();

        if engaged_after.is_none()
            && matches!(
                mapping.vibrato_state(),
                VibratoState::SwitchingOn | VibratoState::Active
            )
        {
            engaged_after = Some(start.elapsed());
        }
        std::thread::sleep(Duration::from_millis(FRAME_INTERVAL_MS));
    }

    let engaged_after = engaged_after.expect("vibrato must engage");
    assert!(
        engaged_after <= Duration::from_millis(220),
        "engaged after {engaged_after:?}, expected within one period"
    );

    // Collect the emitted pitch bends
    let bends: Vec<f32> = messages
        .lock()
        .unwrap()
        .iter()
        .filter(|m| m.addr == "/touchkeys/mapping/segment0/vibrato")
        .filter_map(|m| match (&m.args[0], &m.args[1]) {
            (OscType::Int(60), OscType::Float(bend)) => Some(*bend),
            _ => None,
        })
        .collect();
    assert!(!bends.is_empty(), "pitch bends must be emitted");

    let peak = bends.iter().fold(0.0f32, |acc, b| acc.max(b.abs()));
    let ceiling = RANGE_SEMITONES * (PRESCALER * AMPLITUDE as f32).tanh();
    assert!(
        peak <= ceiling * 1.05,
        "peak {peak} exceeds tanh ceiling {ceiling}"
    );
    assert!(
        peak >= ceiling * 0.2,
        "peak {peak} implausibly small vs ceiling {ceiling}"
    );

    keyboard.stop();
}

#[test]
fn note_off_ramps_the_vibrato_out() {
    let keyboard = PianoKeyboard::new();
    keyboard.start();

    let touch_buffer: Arc<Node<KeyTouchFrame>> = Node::with_capacity(256);
    let position_buffer: Arc<Node<f64>> = Node::with_capacity(256);
    let tracker = KeyPositionTracker::new(64, position_buffer.clone());
    let ctx = KeyEventContext {
        note_number: 62,
        midi_note_is_on: false,
        touch_is_on: true,
        key_motion_active: false,
        midi_channel: None,
        midi_velocity: 0,
        touch_buffer: touch_buffer.clone(),
        position_buffer,
        tracker,
    };
    let mapping = VibratoMapping::new(&keyboard, &ctx);
    mapping.set_thresholds(0.035, 0.3);
    engage_mapping(&mapping);

    touch_buffer.insert(touch_frame(0.5), keyboard.current_timestamp());
    mapping.midi_note_on_received(0, 100);

    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(400)
        && !matches!(
            mapping.vibrato_state(),
            VibratoState::SwitchingOn | VibratoState::Active
        )
    {
        let elapsed = start.elapsed().as_secs_f64();
        let loc_h = 0.5 + AMPLITUDE * (2.0 * PI * VIBRATO_HZ * elapsed).sin();
        touch_buffer.insert(touch_frame(loc_h as f32), keyboard.current_timestamp());
        mapping.perform_mapping();
        std::thread::sleep(Duration::from_millis(FRAME_INTERVAL_MS));
    }
    assert!(matches!(
        mapping.vibrato_state(),
        VibratoState::SwitchingOn | VibratoState::Active
    ));

    mapping.midi_note_off_received(0);
    assert_eq!(mapping.vibrato_state(), VibratoState::SwitchingOff);

    // The release ramp (clamped to at most 300 ms) runs the state down
    let deadline = Instant::now() + Duration::from_millis(600);
    while mapping.vibrato_state() != VibratoState::Inactive {
        assert!(Instant::now() < deadline, "release ramp never finished");
        mapping.perform_mapping();
        std::thread::sleep(Duration::from_millis(10));
    }

    keyboard.stop();
}
