// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Mapping factories: per-segment owners of per-note mappings
//!
//! A factory holds the policy for one mapping type on one keyboard segment:
//! when notes are interesting enough to get a mapping, which pitch classes
//! participate, how the mapping's OSC control stream is wired into a MIDI
//! controller, and the preset content for save/load. The shared behavior
//! (mapping lifetime driven by touch/MIDI begin/end events, bypass, active
//! note mask, converter acquisition) lives in [`NoteFactorySupport`], which
//! concrete factories embed.
//!
//! Each segment registers a [`FactorySplitter`] with the keyboard; the
//! splitter fans every key event out to the segment's factories so multiple
//! mapping types can coexist on one zone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use rosc::{OscMessage, OscType};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Mapping;
use crate::config::FactoryPreset;
use crate::keyboard::PianoKeyboard;
use crate::node::Node;
use crate::osc::{int_arg, success_message};
use crate::osc_midi::{OscMidiConverter, OutOfRangeBehavior};
use crate::segment::MidiKeyboardSegment;
use crate::touch::KeyTouchFrame;
use crate::tracker::KeyPositionTracker;
use crate::types::KeyPosition;

/// Everything a factory needs to know about a key event.
#[derive(Clone)]
pub struct KeyEventContext {
    pub note_number: u8,
    pub midi_note_is_on: bool,
    pub touch_is_on: bool,
    pub key_motion_active: bool,
    pub midi_channel: Option<u8>,
    pub midi_velocity: u8,
    pub touch_buffer: Arc<Node<KeyTouchFrame>>,
    pub position_buffer: Arc<Node<KeyPosition>>,
    pub tracker: Arc<KeyPositionTracker>,
}

/// Tagged mapping-factory type, used for preset save/load and the
/// `/add-mapping` type index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MappingFactoryKind {
    KeyPosition,
    Mrp,
    Vibrato,
    OnsetAngle,
    MultiFingerTrigger,
    /// The per-segment fan-out; never created from presets
    #[default]
    Aggregate,
}

const FACTORY_KIND_NAMES: &[&str] = &[
    "Key Position",
    "MRP",
    "Vibrato",
    "Onset Angle",
    "Multi-Finger Trigger",
];

pub fn factory_kind_names() -> &'static [&'static str] {
    FACTORY_KIND_NAMES
}

impl MappingFactoryKind {
    pub fn from_index(index: usize) -> Option<MappingFactoryKind> {
        match index {
            0 => Some(MappingFactoryKind::KeyPosition),
            1 => Some(MappingFactoryKind::Mrp),
            2 => Some(MappingFactoryKind::Vibrato),
            3 => Some(MappingFactoryKind::OnsetAngle),
            4 => Some(MappingFactoryKind::MultiFingerTrigger),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            MappingFactoryKind::KeyPosition => "Key Position",
            MappingFactoryKind::Mrp => "MRP",
            MappingFactoryKind::Vibrato => "Vibrato",
            MappingFactoryKind::OnsetAngle => "Onset Angle",
            MappingFactoryKind::MultiFingerTrigger => "Multi-Finger Trigger",
            MappingFactoryKind::Aggregate => "Aggregate",
        }
    }
}

/// Lifecycle owner of the mappings for one mapping type on one segment.
pub trait MappingFactory: Send + Sync {
    fn kind(&self) -> MappingFactoryKind;
    fn short_name(&self) -> String;
    fn control_name(&self) -> String;
    fn set_name(&self, short_name: &str, output_port: usize);

    fn bypassed(&self) -> bool {
        false
    }
    fn set_bypassed(&self, _bypass: bool) {}
    fn set_active_notes(&self, _mask: u16) {}

    // Key events, forwarded from PianoKey
    fn touch_began(&self, ctx: &KeyEventContext);
    fn touch_ended(&self, ctx: &KeyEventContext);
    fn midi_note_on(&self, ctx: &KeyEventContext);
    fn midi_note_off(&self, ctx: &KeyEventContext);
    fn key_motion_active(&self, _ctx: &KeyEventContext) {}
    fn key_motion_idle(&self, _ctx: &KeyEventContext) {}

    /// Called just before a note's onset goes out, so default controller
    /// values can be sent on the allocated channel.
    fn note_will_begin(&self, _note: u8, _channel: u8, _velocity: u8) {}

    fn suspend_mapping(&self, note: u8);
    fn suspend_all_mappings(&self);
    fn resume_mapping(&self, note: u8, resend: bool);
    fn resume_all_mappings(&self, resend: bool);
    fn remove_all_mappings(&self);

    /// Callback from a mapping announcing it has finished.
    fn mapping_finished(&self, note: u8);

    fn active_mappings(&self) -> Vec<u8>;

    /// Factory-specific OSC control (`/mapping/<name>/<verb>`).
    fn osc_control(&self, path: &str, args: &[OscType]) -> Option<OscMessage>;

    fn preset(&self) -> FactoryPreset;
    fn load_preset(&self, preset: &FactoryPreset) -> bool;
}

struct SupportConfig {
    short_name: String,
    control_name: String,
    input_min: f32,
    input_max: f32,
    input_center: f32,
    out_of_range: OutOfRangeBehavior,
    use_14_bit: bool,
    midi_controller: Option<usize>,
    bypassed: bool,
    active_notes: u16,
}

/// Shared factory behavior: the mapping table, bypass and note-mask policy,
/// control naming, and OSC-MIDI converter wiring.
pub struct NoteFactorySupport {
    keyboard: Weak<PianoKeyboard>,
    segment: Weak<MidiKeyboardSegment>,
    mappings: Mutex<HashMap<u8, Arc<dyn Mapping>>>,
    config: Mutex<SupportConfig>,
    converter: Mutex<Option<Arc<OscMidiConverter>>>,
}

impl NoteFactorySupport {
    pub fn new(keyboard: &Arc<PianoKeyboard>, segment: &Arc<MidiKeyboardSegment>) -> Self {
        NoteFactorySupport {
            keyboard: Arc::downgrade(keyboard),
            segment: Arc::downgrade(segment),
            mappings: Mutex::new(HashMap::new()),
            config: Mutex::new(SupportConfig {
                short_name: String::new(),
                control_name: String::new(),
                input_min: 0.0,
                input_max: 1.0,
                input_center: 0.0,
                out_of_range: OutOfRangeBehavior::Clip,
                use_14_bit: false,
                midi_controller: None,
                bypassed: false,
                active_notes: 0x0FFF,
            }),
            converter: Mutex::new(None),
        }
    }

    pub fn keyboard(&self) -> Option<Arc<PianoKeyboard>> {
        self.keyboard.upgrade()
    }

    pub fn segment(&self) -> Option<Arc<MidiKeyboardSegment>> {
        self.segment.upgrade()
    }

    pub fn mapping(&self, note: u8) -> Option<Arc<dyn Mapping>> {
        self.mappings.lock().unwrap().get(&note).cloned()
    }

    pub fn active_mappings(&self) -> Vec<u8> {
        self.mappings.lock().unwrap().keys().copied().collect()
    }

    pub fn short_name(&self) -> String {
        self.config.lock().unwrap().short_name.clone()
    }

    pub fn control_name(&self) -> String {
        self.config.lock().unwrap().control_name.clone()
    }

    pub fn bypassed(&self) -> bool {
        self.config.lock().unwrap().bypassed
    }

    pub fn set_bypassed(&self, bypass: bool) {
        self.config.lock().unwrap().bypassed = bypass;
    }

    pub fn set_active_notes(&self, mask: u16) {
        self.config.lock().unwrap().active_notes = mask & 0x0FFF;
    }

    pub fn active_notes(&self) -> u16 {
        self.config.lock().unwrap().active_notes
    }

    fn note_is_enabled(&self, note: u8) -> bool {
        let config = self.config.lock().unwrap();
        !config.bypassed && (config.active_notes & (1 << (note % 12))) != 0
    }

    /// Rename the mapping control stream, moving any converter listener from
    /// the old path to the new one.
    pub fn set_name(&self, short_name: &str, output_port: usize) {
        if short_name.is_empty() {
            return;
        }
        let (old_name, new_name) = {
            let mut config = self.config.lock().unwrap();
            let old = config.control_name.clone();
            config.short_name = short_name.to_string();
            config.control_name = format!("/touchkeys/mapping/segment{output_port}/{short_name}");
            (old, config.control_name.clone())
        };
        let converter = self.converter.lock().unwrap().clone();
        if let Some(converter) = converter {
            if !old_name.is_empty() {
                converter.remove_control(&old_name);
            }
            let config = self.config.lock().unwrap();
            converter.add_control(
                &new_name,
                1,
                config.input_min,
                config.input_max,
                config.input_center,
                config.out_of_range,
            );
        }
    }

    /// Wire this factory's control stream to a MIDI controller through the
    /// segment's reference-counted converter.
    #[allow(clippy::too_many_arguments)]
    pub fn set_midi_parameters(
        &self,
        controller: usize,
        input_min: f32,
        input_max: f32,
        input_center: f32,
        output_default: Option<i32>,
        output_min: Option<i32>,
        output_max: Option<i32>,
        output_center: Option<i32>,
        use_14_bit: bool,
        out_of_range: OutOfRangeBehavior,
    ) {
        let Some(segment) = self.segment.upgrade() else {
            return;
        };
        {
            let mut config = self.config.lock().unwrap();
            config.input_min = input_min;
            config.input_max = input_max;
            config.input_center = input_center;
            config.out_of_range = out_of_range;
            config.use_14_bit = use_14_bit;
        }

        let previous = self.config.lock().unwrap().midi_controller;
        let converter = {
            let mut slot = self.converter.lock().unwrap();
            match previous {
                Some(old) if old != controller => {
                    segment.release_osc_midi_converter(old);
                    let converter = segment.acquire_osc_midi_converter(controller);
                    *slot = Some(converter.clone());
                    converter
                }
                Some(_) if slot.is_some() => slot.clone().unwrap(),
                _ => {
                    let converter = segment.acquire_osc_midi_converter(controller);
                    *slot = Some(converter.clone());
                    converter
                }
            }
        };
        self.config.lock().unwrap().midi_controller = Some(controller);

        converter.set_midi_message_type(
            output_default,
            output_min,
            output_max,
            output_center,
            use_14_bit,
        );

        let config = self.config.lock().unwrap();
        if !config.control_name.is_empty() {
            converter.add_control(
                &config.control_name,
                1,
                config.input_min,
                config.input_max,
                config.input_center,
                config.out_of_range,
            );
        }
    }

    pub fn converter(&self) -> Option<Arc<OscMidiConverter>> {
        self.converter.lock().unwrap().clone()
    }

    pub fn midi_controller(&self) -> Option<usize> {
        self.config.lock().unwrap().midi_controller
    }

    /// Touch began: create the mapping unless one already exists.
    pub fn handle_touch_began(
        &self,
        ctx: &KeyEventContext,
        make: &dyn Fn(&KeyEventContext) -> Arc<dyn Mapping>,
    ) {
        let mut mappings = self.mappings.lock().unwrap();
        if !mappings.contains_key(&ctx.note_number) && self.note_is_enabled(ctx.note_number) {
            debug!(note = ctx.note_number, "adding mapping (touch)");
            mappings.insert(ctx.note_number, make(ctx));
        }
    }

    /// Touch ended: the mapping goes away once MIDI is also off and the
    /// mapping acquiesces.
    pub fn handle_touch_ended(&self, ctx: &KeyEventContext) {
        let finished = {
            let mappings = self.mappings.lock().unwrap();
            match mappings.get(&ctx.note_number) {
                Some(mapping) if !ctx.midi_note_is_on => mapping.request_finish(),
                _ => false,
            }
        };
        if finished {
            debug!(note = ctx.note_number, "removing mapping (touch)");
            self.remove_mapping(ctx.note_number);
        }
    }

    /// MIDI note on: create the mapping unless one already exists, then let
    /// it see the note event.
    pub fn handle_midi_note_on(
        &self,
        ctx: &KeyEventContext,
        make: &dyn Fn(&KeyEventContext) -> Arc<dyn Mapping>,
    ) {
        {
            let mut mappings = self.mappings.lock().unwrap();
            if !mappings.contains_key(&ctx.note_number) && self.note_is_enabled(ctx.note_number) {
                debug!(note = ctx.note_number, "adding mapping (MIDI)");
                mappings.insert(ctx.note_number, make(ctx));
            }
        }
        if let Some(mapping) = self.mapping(ctx.note_number) {
            mapping.midi_note_on_received(ctx.midi_channel.unwrap_or(0), ctx.midi_velocity);
        }
    }

    /// MIDI note off: inform the mapping, then remove it if touch is also
    /// gone and it acquiesces.
    pub fn handle_midi_note_off(&self, ctx: &KeyEventContext) {
        if let Some(mapping) = self.mapping(ctx.note_number) {
            mapping.midi_note_off_received(ctx.midi_channel.unwrap_or(0));
        }
        let finished = {
            let mappings = self.mappings.lock().unwrap();
            match mappings.get(&ctx.note_number) {
                Some(mapping) if !ctx.touch_is_on => mapping.request_finish(),
                _ => false,
            }
        };
        if finished {
            debug!(note = ctx.note_number, "removing mapping (MIDI)");
            self.remove_mapping(ctx.note_number);
        }
    }

    pub fn remove_mapping(&self, note: u8) {
        if let Some(mapping) = self.mappings.lock().unwrap().remove(&note) {
            mapping.disengage(true);
        }
    }

    pub fn remove_all_mappings(&self) {
        let mut mappings = self.mappings.lock().unwrap();
        for (_, mapping) in mappings.drain() {
            mapping.disengage(true);
        }
    }

    pub fn suspend_mapping(&self, note: u8) {
        if let Some(mapping) = self.mapping(note) {
            mapping.common().suspend();
        }
    }

    pub fn suspend_all_mappings(&self) {
        for mapping in self.mappings.lock().unwrap().values() {
            mapping.common().suspend();
        }
    }

    pub fn resume_mapping(&self, note: u8, resend: bool) {
        if let Some(mapping) = self.mapping(note) {
            super::resume_mapping(mapping.as_ref(), resend);
        }
    }

    pub fn resume_all_mappings(&self, resend: bool) {
        let mappings: Vec<Arc<dyn Mapping>> =
            self.mappings.lock().unwrap().values().cloned().collect();
        for mapping in mappings {
            super::resume_mapping(mapping.as_ref(), resend);
        }
    }

    /// Default converter hookup at note start: drop stale contributions on
    /// the allocated channel and send defaults.
    pub fn note_will_begin(&self, channel: u8) {
        if let Some(converter) = self.converter() {
            converter.clear_last_values(channel, true);
        }
    }

    /// Shared OSC control verbs: `/set-bypass i` and `/set-active-notes i`.
    pub fn osc_control_common(&self, path: &str, args: &[OscType]) -> Option<OscMessage> {
        match path {
            "/set-bypass" => {
                let bypass = int_arg(args, 0)?;
                self.set_bypassed(bypass != 0);
                Some(success_message())
            }
            "/set-active-notes" => {
                let mask = int_arg(args, 0)?;
                self.set_active_notes((mask & 0x0FFF) as u16);
                Some(success_message())
            }
            _ => None,
        }
    }

    /// Fill the preset fields shared by all factory types.
    pub fn common_preset(&self, kind: MappingFactoryKind) -> FactoryPreset {
        let config = self.config.lock().unwrap();
        FactoryPreset {
            kind,
            short_name: config.short_name.clone(),
            control_name: config.control_name.clone(),
            input_range_min: config.input_min,
            input_range_max: config.input_max,
            input_range_center: config.input_center,
            out_of_range_behavior: config.out_of_range.index(),
            midi_controller: config.midi_controller.map(|c| c as i32).unwrap_or(-1),
            bypassed: config.bypassed,
            active_notes: config.active_notes,
            params: Default::default(),
        }
    }

    /// Restore the shared preset fields, re-acquiring the converter.
    pub fn load_common_preset(&self, preset: &FactoryPreset) -> bool {
        {
            let mut config = self.config.lock().unwrap();
            config.short_name = preset.short_name.clone();
            config.control_name = preset.control_name.clone();
            config.input_min = preset.input_range_min;
            config.input_max = preset.input_range_max;
            config.input_center = preset.input_range_center;
            config.out_of_range = OutOfRangeBehavior::from_index(preset.out_of_range_behavior);
            config.bypassed = preset.bypassed;
            config.active_notes = preset.active_notes & 0x0FFF;
        }
        if preset.midi_controller >= 0 {
            let config = self.config.lock().unwrap();
            let (min, max, center, out_of_range, use_14_bit) = (
                config.input_min,
                config.input_max,
                config.input_center,
                config.out_of_range,
                config.use_14_bit,
            );
            drop(config);
            self.set_midi_parameters(
                preset.midi_controller as usize,
                min,
                max,
                center,
                None,
                None,
                None,
                None,
                use_14_bit,
                out_of_range,
            );
        }
        true
    }
}

impl Drop for NoteFactorySupport {
    fn drop(&mut self) {
        self.remove_all_mappings();
        let controller = self.config.lock().unwrap().midi_controller;
        if let (Some(segment), Some(controller)) = (self.segment.upgrade(), controller) {
            if let Some(converter) = self.converter.lock().unwrap().take() {
                let name = self.config.lock().unwrap().control_name.clone();
                if !name.is_empty() {
                    converter.remove_control(&name);
                }
            }
            segment.release_osc_midi_converter(controller);
        }
    }
}

/// Fans key events out to every factory attached to a segment.
#[derive(Default)]
pub struct FactorySplitter {
    factories: Mutex<Vec<Arc<dyn MappingFactory>>>,
}

impl FactorySplitter {
    pub fn new() -> Arc<Self> {
        Arc::new(FactorySplitter::default())
    }

    pub fn add_factory(&self, factory: &Arc<dyn MappingFactory>) {
        let mut factories = self.factories.lock().unwrap();
        if !factories.iter().any(|f| Arc::ptr_eq(f, factory)) {
            factories.push(factory.clone());
        }
    }

    pub fn remove_factory(&self, factory: &Arc<dyn MappingFactory>) {
        self.factories
            .lock()
            .unwrap()
            .retain(|f| !Arc::ptr_eq(f, factory));
    }

    pub fn remove_all_factories(&self) {
        self.factories.lock().unwrap().clear();
    }

    fn each(&self) -> Vec<Arc<dyn MappingFactory>> {
        self.factories.lock().unwrap().clone()
    }
}

impl MappingFactory for FactorySplitter {
    fn kind(&self) -> MappingFactoryKind {
        MappingFactoryKind::Aggregate
    }

    fn short_name(&self) -> String {
        String::new()
    }

    fn control_name(&self) -> String {
        String::new()
    }

    fn set_name(&self, _short_name: &str, _output_port: usize) {}

    fn touch_began(&self, ctx: &KeyEventContext) {
        for factory in self.each() {
            factory.touch_began(ctx);
        }
    }

    fn touch_ended(&self, ctx: &KeyEventContext) {
        for factory in self.each() {
            factory.touch_ended(ctx);
        }
    }

    fn midi_note_on(&self, ctx: &KeyEventContext) {
        for factory in self.each() {
            factory.midi_note_on(ctx);
        }
    }

    fn midi_note_off(&self, ctx: &KeyEventContext) {
        for factory in self.each() {
            factory.midi_note_off(ctx);
        }
    }

    fn key_motion_active(&self, ctx: &KeyEventContext) {
        for factory in self.each() {
            factory.key_motion_active(ctx);
        }
    }

    fn key_motion_idle(&self, ctx: &KeyEventContext) {
        for factory in self.each() {
            factory.key_motion_idle(ctx);
        }
    }

    fn note_will_begin(&self, note: u8, channel: u8, velocity: u8) {
        for factory in self.each() {
            factory.note_will_begin(note, channel, velocity);
        }
    }

    fn suspend_mapping(&self, note: u8) {
        for factory in self.each() {
            factory.suspend_mapping(note);
        }
    }

    fn suspend_all_mappings(&self) {
        for factory in self.each() {
            factory.suspend_all_mappings();
        }
    }

    fn resume_mapping(&self, note: u8, resend: bool) {
        for factory in self.each() {
            factory.resume_mapping(note, resend);
        }
    }

    fn resume_all_mappings(&self, resend: bool) {
        for factory in self.each() {
            factory.resume_all_mappings(resend);
        }
    }

    fn remove_all_mappings(&self) {
        for factory in self.each() {
            factory.remove_all_mappings();
        }
    }

    fn mapping_finished(&self, note: u8) {
        for factory in self.each() {
            factory.mapping_finished(note);
        }
    }

    fn active_mappings(&self) -> Vec<u8> {
        let mut notes: Vec<u8> = self
            .each()
            .iter()
            .flat_map(|f| f.active_mappings())
            .collect();
        notes.sort_unstable();
        notes.dedup();
        notes
    }

    fn osc_control(&self, _path: &str, _args: &[OscType]) -> Option<OscMessage> {
        None
    }

    fn preset(&self) -> FactoryPreset {
        FactoryPreset {
            kind: MappingFactoryKind::Aggregate,
            ..Default::default()
        }
    }

    fn load_preset(&self, _preset: &FactoryPreset) -> bool {
        false
    }
}

/// Implements the [`MappingFactory`] methods that delegate straight to an
/// embedded `support: NoteFactorySupport` field. Factories add the methods
/// with type-specific behavior (`kind`, mapping creation, OSC control,
/// presets) themselves.
macro_rules! impl_note_factory_delegates {
    () => {
        fn short_name(&self) -> String {
            self.support.short_name()
        }

        fn control_name(&self) -> String {
            self.support.control_name()
        }

        fn set_name(&self, short_name: &str, output_port: usize) {
            self.support.set_name(short_name, output_port);
        }

        fn bypassed(&self) -> bool {
            self.support.bypassed()
        }

        fn set_bypassed(&self, bypass: bool) {
            self.support.set_bypassed(bypass);
        }

        fn set_active_notes(&self, mask: u16) {
            self.support.set_active_notes(mask);
        }

        fn touch_ended(&self, ctx: &KeyEventContext) {
            self.support.handle_touch_ended(ctx);
        }

        fn note_will_begin(&self, _note: u8, channel: u8, _velocity: u8) {
            self.support.note_will_begin(channel);
        }

        fn suspend_mapping(&self, note: u8) {
            self.support.suspend_mapping(note);
        }

        fn suspend_all_mappings(&self) {
            self.support.suspend_all_mappings();
        }

        fn resume_mapping(&self, note: u8, resend: bool) {
            self.support.resume_mapping(note, resend);
        }

        fn resume_all_mappings(&self, resend: bool) {
            self.support.resume_all_mappings(resend);
        }

        fn remove_all_mappings(&self) {
            self.support.remove_all_mappings();
        }

        fn mapping_finished(&self, note: u8) {
            self.support.remove_mapping(note);
        }

        fn active_mappings(&self) -> Vec<u8> {
            self.support.active_mappings()
        }
    };
}

pub(crate) use impl_note_factory_delegates;

/// Create a concrete factory of the given kind for a segment.
pub fn create_factory(
    kind: MappingFactoryKind,
    keyboard: &Arc<PianoKeyboard>,
    segment: &Arc<MidiKeyboardSegment>,
) -> Arc<dyn MappingFactory> {
    match kind {
        MappingFactoryKind::KeyPosition => {
            super::midi_key_position::MidiKeyPositionMappingFactory::new(keyboard, segment)
        }
        MappingFactoryKind::Mrp => super::mrp::MrpMappingFactory::new(keyboard, segment),
        MappingFactoryKind::Vibrato => super::vibrato::VibratoMappingFactory::new(keyboard, segment),
        MappingFactoryKind::OnsetAngle => {
            super::onset_angle::OnsetAngleMappingFactory::new(keyboard, segment)
        }
        MappingFactoryKind::MultiFingerTrigger | MappingFactoryKind::Aggregate => {
            super::multi_finger_trigger::MultiFingerTriggerMappingFactory::new(keyboard, segment)
        }
    }
}
