// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Tactus - expressive keyboard sensor fusion
//!
//! This crate is a thin re-export of [`tactus_core`], the UI-independent
//! engine library. Applications that need real MIDI/OSC device wiring should
//! look at the `tactus-daemon` package instead.

pub use tactus_core::*;
