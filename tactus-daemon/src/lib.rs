// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Tactus daemon library: device wiring around tactus-core
//!
//! The daemon owns everything the core deliberately does not: MIDI device
//! enumeration and port management (midir), and OSC wire I/O (rosc over
//! UDP). The `tactus` binary in this package assembles a running engine
//! from these pieces.

pub mod midi_io;
pub mod osc_io;
