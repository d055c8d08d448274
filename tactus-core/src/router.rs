// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! MIDI input routing across keyboard segments
//!
//! The [`MidiInputRouter`] owns the configured [`MidiKeyboardSegment`]s and
//! fans every incoming MIDI message out to the segments whose channel mask
//! and note range accept it. Device enumeration and port management live in
//! the daemon; the router only sees parsed messages.
//!
//! Incoming handling happens under the keyboard's `performance_data_mutex`,
//! serializing MIDI effects against concurrent touch bursts on the same
//! keys.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rosc::{OscMessage, OscType};
use tracing::debug;

use crate::config::Preset;
use crate::keyboard::PianoKeyboard;
use crate::midi::MidiMessage;
use crate::replay::write_midi_record;
use crate::segment::MidiKeyboardSegment;

/// Registry of keyboard segments plus the incoming-message dispatch.
pub struct MidiInputRouter {
    keyboard: Arc<PianoKeyboard>,
    segments: Mutex<Vec<Arc<MidiKeyboardSegment>>>,
    /// Bumped on every membership change so UIs can re-query
    segment_signature: AtomicUsize,
    log: Mutex<Option<Box<dyn Write + Send>>>,
    logging_active: Mutex<bool>,
}

impl MidiInputRouter {
    pub fn new(keyboard: Arc<PianoKeyboard>) -> Arc<Self> {
        Arc::new(MidiInputRouter {
            keyboard,
            segments: Mutex::new(Vec::new()),
            segment_signature: AtomicUsize::new(0),
            log: Mutex::new(None),
            logging_active: Mutex::new(false),
        })
    }

    pub fn keyboard(&self) -> &Arc<PianoKeyboard> {
        &self.keyboard
    }

    /// Create and register a new keyboard segment.
    pub fn add_segment(
        &self,
        output_port: usize,
        note_min: u8,
        note_max: u8,
        channel_mask: u16,
    ) -> Arc<MidiKeyboardSegment> {
        let segment = MidiKeyboardSegment::new(self.keyboard.clone());
        segment.set_output_port(output_port);
        segment.set_note_range(note_min, note_max);
        segment.set_channel_mask(channel_mask);

        self.segments.lock().unwrap().push(segment.clone());
        self.segment_signature.fetch_add(1, Ordering::Relaxed);
        segment
    }

    pub fn remove_segment(&self, segment: &Arc<MidiKeyboardSegment>) -> bool {
        let mut segments = self.segments.lock().unwrap();
        let before = segments.len();
        segments.retain(|s| !Arc::ptr_eq(s, segment));
        let removed = segments.len() != before;
        if removed {
            self.segment_signature.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn remove_segment_at(&self, index: usize) -> bool {
        let mut segments = self.segments.lock().unwrap();
        if index >= segments.len() {
            return false;
        }
        segments.remove(index);
        self.segment_signature.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn remove_all_segments(&self) {
        self.segments.lock().unwrap().clear();
        self.segment_signature.fetch_add(1, Ordering::Relaxed);
    }

    pub fn num_segments(&self) -> usize {
        self.segments.lock().unwrap().len()
    }

    pub fn segment(&self, index: usize) -> Option<Arc<MidiKeyboardSegment>> {
        self.segments.lock().unwrap().get(index).cloned()
    }

    /// Signature that changes whenever the segment set changes.
    pub fn segment_signature(&self) -> usize {
        self.segment_signature.load(Ordering::Relaxed)
    }

    pub fn all_notes_off(&self) {
        for segment in self.segments.lock().unwrap().iter() {
            segment.all_notes_off();
        }
    }

    /// Dispatch one incoming MIDI message to every accepting segment.
    pub fn handle_incoming_message(&self, message: &MidiMessage) {
        if *self.logging_active.lock().unwrap() {
            let timestamp = self.keyboard.current_timestamp().secs_f64();
            if let Some(log) = self.log.lock().unwrap().as_mut() {
                let _ = write_midi_record(log, timestamp, &message.to_bytes());
            }
        }

        let _performance = self.keyboard.performance_data_mutex.lock().unwrap();
        let segments = self.segments.lock().unwrap().clone();
        for segment in segments {
            if segment.responds_to_message(message) {
                segment.midi_handler(message);
            }
        }
    }

    /// Raw-byte entry point for device callbacks.
    pub fn handle_incoming_bytes(&self, bytes: &[u8]) {
        if let Some(message) = MidiMessage::from_bytes(bytes) {
            self.handle_incoming_message(&message);
        } else {
            debug!(?bytes, "ignoring unsupported MIDI message");
        }
    }

    // ----- MIDI input logging -----

    pub fn set_log_writer(&self, writer: Option<Box<dyn Write + Send>>) {
        *self.log.lock().unwrap() = writer;
    }

    pub fn start_logging(&self) {
        *self.logging_active.lock().unwrap() = true;
    }

    pub fn stop_logging(&self) {
        *self.logging_active.lock().unwrap() = false;
    }

    // ----- Presets -----

    pub fn segment_preset(&self) -> Preset {
        Preset {
            segments: self
                .segments
                .lock()
                .unwrap()
                .iter()
                .map(|s| s.preset())
                .collect(),
        }
    }

    pub fn load_segment_preset(&self, preset: &Preset) -> bool {
        self.remove_all_segments();
        for segment_preset in &preset.segments {
            let segment = MidiKeyboardSegment::new(self.keyboard.clone());
            if !segment.load_preset(segment_preset) {
                self.remove_all_segments();
                return false;
            }
            self.segments.lock().unwrap().push(segment);
        }
        self.segment_signature.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Route an OSC control command to a segment by index.
    pub fn osc_control_for_segment(
        &self,
        index: usize,
        path: &str,
        args: &[OscType],
    ) -> Option<OscMessage> {
        let segment = self.segment(index)?;
        segment.osc_control_method(path, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Mode;

    #[test]
    fn segments_filter_by_channel_and_range() {
        let keyboard = PianoKeyboard::new();
        let router = MidiInputRouter::new(keyboard.clone());
        let (sink, messages) = crate::midi::testing::RecordingSink::new();
        keyboard.midi_output().set_port(0, sink);

        let low = router.add_segment(0, 0, 59, 0xFFFF);
        low.set_mode(Mode::PassThrough);
        let high = router.add_segment(0, 60, 127, 0xFFFF);
        high.set_mode(Mode::PassThrough);
        messages.lock().unwrap().clear();

        router.handle_incoming_message(&MidiMessage::NoteOn {
            channel: 0,
            note: 40,
            velocity: 100,
        });
        router.handle_incoming_message(&MidiMessage::NoteOn {
            channel: 0,
            note: 72,
            velocity: 100,
        });

        // Each note reached exactly one pass-through segment
        let sent = messages.lock().unwrap();
        let notes: Vec<u8> = sent
            .iter()
            .filter_map(|m| match m {
                MidiMessage::NoteOn { note, .. } => Some(*note),
                _ => None,
            })
            .collect();
        assert_eq!(notes, vec![40, 72]);
    }

    #[test]
    fn preset_round_trip_preserves_segment_count() {
        let keyboard = PianoKeyboard::new();
        let router = MidiInputRouter::new(keyboard.clone());
        router.add_segment(0, 0, 127, 0xFFFF);
        router.add_segment(1, 21, 108, 0x0001);

        let preset = router.segment_preset();
        assert_eq!(preset.segments.len(), 2);

        let restored = MidiInputRouter::new(keyboard);
        assert!(restored.load_segment_preset(&preset));
        assert_eq!(restored.num_segments(), 2);
        assert_eq!(restored.segment(1).unwrap().note_range(), (21, 108));
    }
}
