// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! The keyboard hub
//!
//! [`PianoKeyboard`] owns the per-key pipeline (128 [`PianoKey`]s), the
//! engine's two schedulers, the internal OSC hub, the outbound OSC
//! transmitter, and the MIDI output controller. It is the rendezvous point
//! everything else holds a (weak) reference to: keys reach their segment's
//! mapping factory through it, mappings reach the schedulers and output
//! ports, and OSC-MIDI converters subscribe to its message hub.
//!
//! [`PianoKeyboard::send_message`] is the single send path for named
//! messages: it dispatches to in-process subscribers first (keyboard
//! segments listening for `/midi/noteon`, converters listening for mapping
//! control streams) and then forwards to the external transmitter sinks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use rosc::OscType;
use tracing::{debug, info};

use crate::key::PianoKey;
use crate::mapping::factory::{KeyEventContext, MappingFactory};
use crate::mapping::scheduler::MappingScheduler;
use crate::midi::MidiOutputController;
use crate::osc::{OscHub, OscTransmitter};
use crate::scheduler::{Action, ActorId, Scheduler, SchedulerClock};
use crate::segment::SegmentId;
use crate::types::Timestamp;

/// Number of keys tracked (full MIDI note range).
pub const NUM_KEYS: usize = 128;

/// Samples of key position/touch history kept per key.
pub const DEFAULT_KEY_HISTORY_LENGTH: usize = 8192;

/// Hardware hook for per-key RGB LEDs. Absent in most installations.
pub trait KeyLedSink: Send + Sync {
    fn set_key_color(&self, note: u8, red: f32, green: f32, blue: f32);
    fn all_off(&self);
}

/// Central owner of keys, schedulers, and I/O fan-out.
pub struct PianoKeyboard {
    keys: Vec<Arc<PianoKey>>,
    scheduler: Scheduler,
    clock: Arc<SchedulerClock>,
    mapping_scheduler: MappingScheduler,
    osc_hub: OscHub,
    osc_transmitter: OscTransmitter,
    midi_output: MidiOutputController,
    factories: RwLock<HashMap<SegmentId, Weak<dyn MappingFactory>>>,
    led_sink: RwLock<Option<Box<dyn KeyLedSink>>>,

    /// Grabbed by any thread supplying performance data (MIDI or touch).
    /// Synchronizing once centrally spares the individual objects a web of
    /// finer-grained locks.
    pub performance_data_mutex: Mutex<()>,
}

impl PianoKeyboard {
    pub fn new() -> Arc<Self> {
        let scheduler = Scheduler::new();
        let clock = scheduler.clock();
        let mapping_scheduler = MappingScheduler::new(clock.clone());

        Arc::new_cyclic(|weak: &Weak<PianoKeyboard>| PianoKeyboard {
            keys: (0..NUM_KEYS)
                .map(|note| PianoKey::new(weak.clone(), note as u8, DEFAULT_KEY_HISTORY_LENGTH))
                .collect(),
            scheduler,
            clock,
            mapping_scheduler,
            osc_hub: OscHub::new(),
            osc_transmitter: OscTransmitter::new(),
            midi_output: MidiOutputController::new(),
            factories: RwLock::new(HashMap::new()),
            led_sink: RwLock::new(None),
            performance_data_mutex: Mutex::new(()),
        })
    }

    /// Start both scheduler threads with virtual time at zero.
    pub fn start(&self) {
        info!("starting keyboard engine");
        self.scheduler.start(Timestamp::ZERO);
        self.mapping_scheduler.start();
    }

    /// Stop both scheduler threads.
    pub fn stop(&self) {
        info!("stopping keyboard engine");
        self.mapping_scheduler.stop();
        self.scheduler.stop();
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Access one key by MIDI note number.
    pub fn key(&self, note: u8) -> Option<&Arc<PianoKey>> {
        self.keys.get(note as usize)
    }

    pub fn current_timestamp(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<SchedulerClock> {
        self.clock.clone()
    }

    pub fn schedule_event(&self, actor: ActorId, action: Action, timestamp: Timestamp) {
        self.scheduler.schedule(actor, action, timestamp);
    }

    pub fn unschedule_events(&self, actor: ActorId) {
        self.scheduler.unschedule(actor);
    }

    pub fn unschedule_event_at(&self, actor: ActorId, timestamp: Timestamp) {
        self.scheduler.unschedule_at(actor, timestamp);
    }

    pub fn mapping_scheduler(&self) -> &MappingScheduler {
        &self.mapping_scheduler
    }

    pub fn midi_output(&self) -> &MidiOutputController {
        &self.midi_output
    }

    pub fn osc_hub(&self) -> &OscHub {
        &self.osc_hub
    }

    pub fn osc_transmitter(&self) -> &OscTransmitter {
        &self.osc_transmitter
    }

    /// Send a named message: in-process dispatch first, then the external
    /// transmitter.
    pub fn send_message(&self, path: &str, args: Vec<OscType>) {
        self.osc_hub.dispatch(path, &args);
        self.osc_transmitter.send(path, args);
    }

    // ----- Mapping factories, keyed by keyboard segment -----

    pub fn mapping_factory(&self, segment: SegmentId) -> Option<Arc<dyn MappingFactory>> {
        self.factories
            .read()
            .unwrap()
            .get(&segment)
            .and_then(Weak::upgrade)
    }

    pub fn set_mapping_factory(&self, segment: SegmentId, factory: Weak<dyn MappingFactory>) {
        self.factories.write().unwrap().insert(segment, factory);
    }

    pub fn remove_mapping_factory(&self, segment: SegmentId) {
        self.factories.write().unwrap().remove(&segment);
    }

    fn all_factories(&self) -> Vec<Arc<dyn MappingFactory>> {
        self.factories
            .read()
            .unwrap()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn tell_all_factories_touch_began(&self, ctx: &KeyEventContext) {
        for factory in self.all_factories() {
            factory.touch_began(ctx);
        }
    }

    pub fn tell_all_factories_touch_ended(&self, ctx: &KeyEventContext) {
        for factory in self.all_factories() {
            factory.touch_ended(ctx);
        }
    }

    pub fn tell_all_factories_key_motion_active(&self, ctx: &KeyEventContext) {
        for factory in self.all_factories() {
            factory.key_motion_active(ctx);
        }
    }

    pub fn tell_all_factories_key_motion_idle(&self, ctx: &KeyEventContext) {
        for factory in self.all_factories() {
            factory.key_motion_idle(ctx);
        }
    }

    // ----- Key LEDs -----

    pub fn set_key_led_sink(&self, sink: Option<Box<dyn KeyLedSink>>) {
        *self.led_sink.write().unwrap() = sink;
    }

    pub fn set_key_led_color_rgb(&self, note: u8, red: f32, green: f32, blue: f32) {
        if let Some(sink) = self.led_sink.read().unwrap().as_ref() {
            sink.set_key_color(note, red, green, blue);
        }
    }

    pub fn set_key_led_color_hsv(&self, note: u8, hue: f32, saturation: f32, value: f32) {
        let (red, green, blue) = hsv_to_rgb(hue, saturation, value);
        self.set_key_led_color_rgb(note, red, green, blue);
    }

    pub fn set_all_key_leds_off(&self) {
        if let Some(sink) = self.led_sink.read().unwrap().as_ref() {
            sink.all_off();
        }
    }

    /// Reset every key back to its default state.
    pub fn reset(&self) {
        debug!("resetting all keys");
        for key in &self.keys {
            key.reset();
        }
    }
}

/// Convert an HSV color (all components 0-1, hue wrapping) to RGB.
fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> (f32, f32, f32) {
    let hue = hue.rem_euclid(1.0) * 6.0;
    let sector = hue.floor() as i32 % 6;
    let fraction = hue - hue.floor();
    let p = value * (1.0 - saturation);
    let q = value * (1.0 - saturation * fraction);
    let t = value * (1.0 - saturation * (1.0 - fraction));
    match sector {
        0 => (value, t, p),
        1 => (q, value, p),
        2 => (p, value, t),
        3 => (p, q, value),
        4 => (t, p, value),
        _ => (value, p, q),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_cover_full_midi_range() {
        let keyboard = PianoKeyboard::new();
        assert!(keyboard.key(0).is_some());
        assert!(keyboard.key(127).is_some());
        assert_eq!(keyboard.key(60).unwrap().note_number(), 60);
    }

    #[test]
    fn timestamp_is_zero_until_started() {
        let keyboard = PianoKeyboard::new();
        assert_eq!(keyboard.current_timestamp(), Timestamp::ZERO);
        keyboard.start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(keyboard.current_timestamp() > Timestamp::ZERO);
        keyboard.stop();
    }

    #[test]
    fn hsv_primaries() {
        assert_eq!(hsv_to_rgb(0.0, 1.0, 1.0), (1.0, 0.0, 0.0));
        let (r, g, b) = hsv_to_rgb(1.0 / 3.0, 1.0, 1.0);
        assert!(r < 0.01 && g > 0.99 && b < 0.01);
    }
}
