// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! MIDI channel messages and the output controller
//!
//! The engine works on parsed [`MidiMessage`] values whose byte layout is
//! exact in both directions: `from_bytes` accepts the raw wire form the
//! input driver hands over, and `to_bytes` produces what goes back out. The
//! [`MidiOutputController`] routes messages to numbered output ports backed
//! by [`MidiSink`] implementations (a midir connection in the daemon, a
//! recording sink in tests). Send failures are logged and dropped: the data
//! plane never retries.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::warn;

use crate::error::EngineError;

// Status nibbles for channel messages
pub const STATUS_NOTE_OFF: u8 = 0x80;
pub const STATUS_NOTE_ON: u8 = 0x90;
pub const STATUS_AFTERTOUCH_POLY: u8 = 0xA0;
pub const STATUS_CONTROL_CHANGE: u8 = 0xB0;
pub const STATUS_PROGRAM_CHANGE: u8 = 0xC0;
pub const STATUS_AFTERTOUCH_CHANNEL: u8 = 0xD0;
pub const STATUS_PITCH_WHEEL: u8 = 0xE0;
pub const STATUS_SYSEX: u8 = 0xF0;
pub const STATUS_RESET: u8 = 0xFF;

// Controller numbers with special meaning to the engine
pub const CONTROL_MOD_WHEEL: u8 = 1;
pub const CONTROL_DAMPER_PEDAL: u8 = 64;
pub const CONTROL_SOSTENUTO_PEDAL: u8 = 66;
pub const CONTROL_ALL_SOUND_OFF: u8 = 120;
pub const CONTROL_ALL_NOTES_OFF: u8 = 123;

/// CC value at or above which a pedal counts as engaged.
pub const PEDAL_ACTIVE_VALUE: u8 = 64;

/// A parsed MIDI channel message. Channels are 0-15 throughout the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOff { channel: u8, note: u8, velocity: u8 },
    NoteOn { channel: u8, note: u8, velocity: u8 },
    PolyAftertouch { channel: u8, note: u8, value: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelAftertouch { channel: u8, value: u8 },
    /// 14-bit value, 0-16383, center 8192
    PitchWheel { channel: u8, value: u16 },
    Reset,
}

impl MidiMessage {
    /// Parse the leading channel message from raw bytes. Sysex and system
    /// common/realtime messages other than reset are rejected.
    pub fn from_bytes(bytes: &[u8]) -> Option<MidiMessage> {
        let status = *bytes.first()?;
        if status == STATUS_RESET {
            return Some(MidiMessage::Reset);
        }
        if status < 0x80 || status >= STATUS_SYSEX {
            return None;
        }
        let channel = status & 0x0F;
        let d1 = bytes.get(1).copied().unwrap_or(0) & 0x7F;
        let d2 = bytes.get(2).copied().unwrap_or(0) & 0x7F;
        match status & 0xF0 {
            STATUS_NOTE_OFF => Some(MidiMessage::NoteOff {
                channel,
                note: d1,
                velocity: d2,
            }),
            STATUS_NOTE_ON => {
                if d2 == 0 {
                    // Note on with velocity 0 is a note off
                    Some(MidiMessage::NoteOff {
                        channel,
                        note: d1,
                        velocity: 0,
                    })
                } else {
                    Some(MidiMessage::NoteOn {
                        channel,
                        note: d1,
                        velocity: d2,
                    })
                }
            }
            STATUS_AFTERTOUCH_POLY => Some(MidiMessage::PolyAftertouch {
                channel,
                note: d1,
                value: d2,
            }),
            STATUS_CONTROL_CHANGE => Some(MidiMessage::ControlChange {
                channel,
                controller: d1,
                value: d2,
            }),
            STATUS_PROGRAM_CHANGE => Some(MidiMessage::ProgramChange {
                channel,
                program: d1,
            }),
            STATUS_AFTERTOUCH_CHANNEL => Some(MidiMessage::ChannelAftertouch { channel, value: d1 }),
            STATUS_PITCH_WHEEL => Some(MidiMessage::PitchWheel {
                channel,
                value: ((d2 as u16) << 7) | d1 as u16,
            }),
            _ => None,
        }
    }

    /// Serialize to the exact wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            MidiMessage::NoteOff {
                channel,
                note,
                velocity,
            } => vec![STATUS_NOTE_OFF | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            } => vec![STATUS_NOTE_ON | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
            MidiMessage::PolyAftertouch {
                channel,
                note,
                value,
            } => vec![
                STATUS_AFTERTOUCH_POLY | (channel & 0x0F),
                note & 0x7F,
                value & 0x7F,
            ],
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => vec![
                STATUS_CONTROL_CHANGE | (channel & 0x0F),
                controller & 0x7F,
                value & 0x7F,
            ],
            MidiMessage::ProgramChange { channel, program } => {
                vec![STATUS_PROGRAM_CHANGE | (channel & 0x0F), program & 0x7F]
            }
            MidiMessage::ChannelAftertouch { channel, value } => {
                vec![STATUS_AFTERTOUCH_CHANNEL | (channel & 0x0F), value & 0x7F]
            }
            MidiMessage::PitchWheel { channel, value } => vec![
                STATUS_PITCH_WHEEL | (channel & 0x0F),
                (value & 0x7F) as u8,
                ((value >> 7) & 0x7F) as u8,
            ],
            MidiMessage::Reset => vec![STATUS_RESET],
        }
    }

    /// Channel of the message, or `None` for system messages.
    pub fn channel(&self) -> Option<u8> {
        match *self {
            MidiMessage::NoteOff { channel, .. }
            | MidiMessage::NoteOn { channel, .. }
            | MidiMessage::PolyAftertouch { channel, .. }
            | MidiMessage::ControlChange { channel, .. }
            | MidiMessage::ProgramChange { channel, .. }
            | MidiMessage::ChannelAftertouch { channel, .. }
            | MidiMessage::PitchWheel { channel, .. } => Some(channel),
            MidiMessage::Reset => None,
        }
    }

    /// Note number for note and poly-aftertouch messages.
    pub fn note(&self) -> Option<u8> {
        match *self {
            MidiMessage::NoteOff { note, .. }
            | MidiMessage::NoteOn { note, .. }
            | MidiMessage::PolyAftertouch { note, .. } => Some(note),
            _ => None,
        }
    }

    /// Return the same message readdressed to another channel.
    pub fn with_channel(&self, channel: u8) -> MidiMessage {
        let mut message = *self;
        match &mut message {
            MidiMessage::NoteOff { channel: c, .. }
            | MidiMessage::NoteOn { channel: c, .. }
            | MidiMessage::PolyAftertouch { channel: c, .. }
            | MidiMessage::ControlChange { channel: c, .. }
            | MidiMessage::ProgramChange { channel: c, .. }
            | MidiMessage::ChannelAftertouch { channel: c, .. }
            | MidiMessage::PitchWheel { channel: c, .. } => *c = channel & 0x0F,
            MidiMessage::Reset => {}
        }
        message
    }

    pub fn is_all_notes_off(&self) -> bool {
        matches!(
            self,
            MidiMessage::ControlChange {
                controller: CONTROL_ALL_NOTES_OFF,
                ..
            }
        )
    }

    pub fn is_all_sound_off(&self) -> bool {
        matches!(
            self,
            MidiMessage::ControlChange {
                controller: CONTROL_ALL_SOUND_OFF,
                ..
            }
        )
    }
}

/// Destination for raw MIDI bytes (device connection, recorder, ...).
pub trait MidiSink: Send + Sync {
    fn send_bytes(&self, bytes: &[u8]) -> Result<(), EngineError>;
}

/// Routes MIDI messages to numbered output ports.
///
/// Ports are registered by the application (the daemon attaches midir
/// connections; tests attach recorders). Sending to an unregistered port or
/// hitting a sink error logs a warning and drops the message.
#[derive(Default)]
pub struct MidiOutputController {
    ports: RwLock<HashMap<usize, Box<dyn MidiSink>>>,
}

impl MidiOutputController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_port(&self, port: usize, sink: Box<dyn MidiSink>) {
        self.ports.write().unwrap().insert(port, sink);
    }

    pub fn remove_port(&self, port: usize) {
        self.ports.write().unwrap().remove(&port);
    }

    pub fn send(&self, port: usize, message: MidiMessage) {
        let ports = self.ports.read().unwrap();
        let Some(sink) = ports.get(&port) else {
            warn!(port, ?message, "MIDI output port not connected");
            return;
        };
        if let Err(err) = sink.send_bytes(&message.to_bytes()) {
            warn!(port, %err, "dropping MIDI message");
        }
    }

    pub fn send_note_on(&self, port: usize, channel: u8, note: u8, velocity: u8) {
        self.send(
            port,
            MidiMessage::NoteOn {
                channel,
                note,
                velocity,
            },
        );
    }

    pub fn send_note_off(&self, port: usize, channel: u8, note: u8) {
        self.send(
            port,
            MidiMessage::NoteOff {
                channel,
                note,
                velocity: 64,
            },
        );
    }

    pub fn send_control_change(&self, port: usize, channel: u8, controller: u8, value: u8) {
        self.send(
            port,
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            },
        );
    }

    pub fn send_aftertouch_poly(&self, port: usize, channel: u8, note: u8, value: u8) {
        self.send(
            port,
            MidiMessage::PolyAftertouch {
                channel,
                note,
                value,
            },
        );
    }

    pub fn send_aftertouch_channel(&self, port: usize, channel: u8, value: u8) {
        self.send(port, MidiMessage::ChannelAftertouch { channel, value });
    }

    pub fn send_pitch_wheel(&self, port: usize, channel: u8, value: u16) {
        self.send(
            port,
            MidiMessage::PitchWheel {
                channel,
                value: value.min(16383),
            },
        );
    }

    pub fn send_reset(&self, port: usize) {
        self.send(port, MidiMessage::Reset);
    }
}

/// Test support: in-memory sinks for exercising the output path without
/// device connections.
pub mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Sink that records every message for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub messages: Arc<Mutex<Vec<MidiMessage>>>,
    }

    impl RecordingSink {
        pub fn new() -> (Box<dyn MidiSink>, Arc<Mutex<Vec<MidiMessage>>>) {
            let messages = Arc::new(Mutex::new(Vec::new()));
            (
                Box::new(RecordingSink {
                    messages: messages.clone(),
                }),
                messages,
            )
        }
    }

    impl MidiSink for RecordingSink {
        fn send_bytes(&self, bytes: &[u8]) -> Result<(), EngineError> {
            let message = MidiMessage::from_bytes(bytes)
                .ok_or_else(|| EngineError::MidiOutput("unparseable bytes".into()))?;
            self.messages.lock().unwrap().push(message);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(vec![0x91, 60, 100], MidiMessage::NoteOn { channel: 1, note: 60, velocity: 100 })]
    #[case(vec![0x80, 60, 0], MidiMessage::NoteOff { channel: 0, note: 60, velocity: 0 })]
    #[case(vec![0xB2, 64, 127], MidiMessage::ControlChange { channel: 2, controller: 64, value: 127 })]
    #[case(vec![0xA3, 61, 40], MidiMessage::PolyAftertouch { channel: 3, note: 61, value: 40 })]
    #[case(vec![0xD4, 99], MidiMessage::ChannelAftertouch { channel: 4, value: 99 })]
    #[case(vec![0xC5, 7], MidiMessage::ProgramChange { channel: 5, program: 7 })]
    #[case(vec![0xFF], MidiMessage::Reset)]
    fn round_trips_are_byte_exact(#[case] bytes: Vec<u8>, #[case] message: MidiMessage) {
        assert_eq!(MidiMessage::from_bytes(&bytes), Some(message));
        assert_eq!(message.to_bytes(), bytes);
    }

    #[test]
    fn pitch_wheel_is_14_bit_lsb_first() {
        let message = MidiMessage::PitchWheel {
            channel: 0,
            value: 8192,
        };
        assert_eq!(message.to_bytes(), vec![0xE0, 0x00, 0x40]);
        assert_eq!(MidiMessage::from_bytes(&[0xE0, 0x00, 0x40]), Some(message));
    }

    #[test]
    fn note_on_velocity_zero_parses_as_note_off() {
        assert_eq!(
            MidiMessage::from_bytes(&[0x90, 64, 0]),
            Some(MidiMessage::NoteOff {
                channel: 0,
                note: 64,
                velocity: 0
            })
        );
    }

    #[test]
    fn sysex_is_rejected() {
        assert_eq!(MidiMessage::from_bytes(&[0xF0, 1, 2, 3]), None);
    }

    #[test]
    fn controller_drops_messages_for_missing_ports() {
        let controller = MidiOutputController::new();
        // Must not panic or error
        controller.send_note_on(3, 0, 60, 100);
    }

    #[test]
    fn controller_routes_to_registered_sink() {
        let controller = MidiOutputController::new();
        let (sink, messages) = testing::RecordingSink::new();
        controller.set_port(0, sink);

        controller.send_note_on(0, 1, 60, 100);
        controller.send_pitch_wheel(0, 1, 16000);

        let recorded = messages.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(
            recorded[0],
            MidiMessage::NoteOn {
                channel: 1,
                note: 60,
                velocity: 100
            }
        );
    }
}
