// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Tactus Core Engine
//!
//! Sensor-fusion engine for expressive keyboards: multi-touch sensing on
//! each key plus continuous key-position sensing, fused with incoming MIDI
//! into expressive MIDI and OSC control streams. Pure engine library with
//! zero UI dependencies; real device I/O lives in `tactus-daemon`.
//!
//! # Architecture
//!
//! Data flows through per-key pipelines into per-note mappings and out
//! through per-segment channel allocation:
//!
//! 1. **Input** - the touch driver and MIDI router push frames, position
//!    samples, and note events into each [`key::PianoKey`].
//! 2. **Analysis** - every producer is a [`node::Node`] (a timestamped ring
//!    buffer with trigger fan-out); the [`idle::KeyIdleDetector`] and
//!    [`tracker::KeyPositionTracker`] subscribe to the position stream and
//!    publish idle/active transitions, key states, and press features.
//! 3. **Mapping** - per-note [`mapping::Mapping`] objects, owned by their
//!    segment's factories, fuse the streams into output events on the
//!    dedicated [`mapping::scheduler::MappingScheduler`] thread.
//! 4. **Output** - each [`segment::MidiKeyboardSegment`] applies its mode
//!    (pass-through, monophonic, polyphonic, MPE), channel allocation with
//!    damper-pedal reservation and voice stealing, and transposition;
//!    [`osc_midi::OscMidiConverter`]s sum OSC control streams into MIDI
//!    controllers.
//!
//! # Quick start
//!
//! ```rust
//! use tactus_core::{keyboard::PianoKeyboard, router::MidiInputRouter, segment::Mode};
//!
//! let keyboard = PianoKeyboard::new();
//! keyboard.start();
//!
//! let router = MidiInputRouter::new(keyboard.clone());
//! let segment = router.add_segment(0, 0, 127, 0xFFFF);
//! segment.set_mode(Mode::Polyphonic);
//!
//! // Feed MIDI bytes from your input driver:
//! router.handle_incoming_bytes(&[0x90, 60, 100]);
//! keyboard.stop();
//! ```

pub mod config;
pub mod error;
pub mod filter;
pub mod idle;
pub mod key;
pub mod keyboard;
pub mod logging;
pub mod mapping;
pub mod midi;
pub mod node;
pub mod osc;
pub mod osc_midi;
pub mod replay;
pub mod router;
pub mod scheduler;
pub mod segment;
pub mod touch;
pub mod tracker;
pub mod trigger;
pub mod types;

// Re-exports for convenience

pub use config::{FactoryPreset, Preset, SegmentPreset};
pub use error::{ConfigError, EngineError};
pub use key::PianoKey;
pub use keyboard::PianoKeyboard;
pub use midi::{MidiMessage, MidiOutputController};
pub use node::Node;
pub use router::MidiInputRouter;
pub use scheduler::Scheduler;
pub use segment::{ControllerAction, MidiKeyboardSegment, Mode};
pub use touch::KeyTouchFrame;
pub use tracker::{KeyPositionTracker, KeyState};
pub use types::{KeyPosition, KeyVelocity, Timestamp};
