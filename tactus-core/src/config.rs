// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Preset content and persistence
//!
//! The persisted state of the engine is the configuration of its keyboard
//! segments and their mapping factories. The structures here are plain serde
//! types; [`Preset::to_xml`]/[`Preset::from_xml`] wrap them in the XML
//! container format via quick-xml.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::mapping::factory::MappingFactoryKind;

/// Type-specific factory parameters, stored as a sparse property bag: each
/// factory type reads and writes only the fields it understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FactoryParams {
    // Key position / MRP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aftertouch_sensitivity: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percussiveness_channel: Option<i32>,

    // Vibrato
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_semitones: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prescaler: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,

    // Multi-finger trigger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub touches: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consecutive_taps: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tap_spacing_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_midi_note_on: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_on_action: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_off_action: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_on_note: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_off_note: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_on_velocity: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_off_velocity: Option<i32>,
}

/// Persisted configuration of one mapping factory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FactoryPreset {
    pub kind: MappingFactoryKind,
    pub short_name: String,
    pub control_name: String,
    pub input_range_min: f32,
    pub input_range_max: f32,
    pub input_range_center: f32,
    pub out_of_range_behavior: i32,
    /// -1 when no MIDI controller is assigned
    pub midi_controller: i32,
    pub bypassed: bool,
    pub active_notes: u16,
    pub params: FactoryParams,
}

/// Persisted configuration of one keyboard segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPreset {
    pub output_port: usize,
    pub mode: i32,
    pub channel_mask: u16,
    pub note_min: u8,
    pub note_max: u8,
    pub output_channel_lowest: u8,
    pub output_transposition: i32,
    pub damper_pedal_enabled: bool,
    pub uses_keyboard_channel_pressure: bool,
    pub uses_keyboard_pitch_wheel: bool,
    pub uses_keyboard_mod_wheel: bool,
    pub uses_keyboard_pedals: bool,
    pub uses_keyboard_midi_controllers: bool,
    pub pitch_wheel_range: f32,
    pub retransmit_max_polyphony: usize,
    pub use_voice_stealing: bool,
    #[serde(default)]
    pub mapping_factories: Vec<FactoryPreset>,
}

/// A full keyboard-segment preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename = "Preset")]
pub struct Preset {
    #[serde(default)]
    pub segments: Vec<SegmentPreset>,
}

impl Preset {
    pub fn to_xml(&self) -> Result<String, ConfigError> {
        quick_xml::se::to_string(self).map_err(|e| ConfigError::Xml(e.to_string()))
    }

    pub fn from_xml(xml: &str) -> Result<Preset, ConfigError> {
        quick_xml::de::from_str(xml).map_err(|e| ConfigError::Xml(e.to_string()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_xml()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Preset, ConfigError> {
        let xml = std::fs::read_to_string(path)?;
        Preset::from_xml(&xml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_segment() -> SegmentPreset {
        SegmentPreset {
            output_port: 0,
            mode: 3,
            channel_mask: 0xFFFF,
            note_min: 21,
            note_max: 108,
            output_channel_lowest: 0,
            output_transposition: 0,
            damper_pedal_enabled: true,
            uses_keyboard_channel_pressure: false,
            uses_keyboard_pitch_wheel: true,
            uses_keyboard_mod_wheel: true,
            uses_keyboard_pedals: true,
            uses_keyboard_midi_controllers: false,
            pitch_wheel_range: 2.0,
            retransmit_max_polyphony: 8,
            use_voice_stealing: false,
            mapping_factories: vec![FactoryPreset {
                kind: MappingFactoryKind::Vibrato,
                short_name: "vibrato".into(),
                control_name: "/touchkeys/mapping/segment0/vibrato".into(),
                input_range_min: 0.0,
                input_range_max: 1.0,
                input_range_center: 0.0,
                out_of_range_behavior: 1,
                midi_controller: 129,
                bypassed: false,
                active_notes: 0x0FFF,
                params: FactoryParams {
                    range_semitones: Some(1.25),
                    prescaler: Some(2.0),
                    threshold: Some(0.05),
                    ratio: Some(0.3),
                    timeout_ms: Some(400),
                    ..Default::default()
                },
            }],
        }
    }

    #[test]
    fn preset_round_trips_through_xml() {
        let preset = Preset {
            segments: vec![sample_segment()],
        };
        let xml = preset.to_xml().unwrap();
        let restored = Preset::from_xml(&xml).unwrap();
        assert_eq!(preset, restored);
    }

    #[test]
    fn empty_preset_parses() {
        let preset = Preset::default();
        let xml = preset.to_xml().unwrap();
        assert_eq!(Preset::from_xml(&xml).unwrap(), preset);
    }

    #[test]
    fn sparse_params_only_persist_set_fields() {
        let params = FactoryParams {
            prescaler: Some(2.0),
            ..Default::default()
        };
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"{"prescaler":2.0}"#);
    }
}
