// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! MIDI device I/O via midir
//!
//! Input ports feed raw bytes straight into the core's
//! [`MidiInputRouter`]; output ports are wrapped as [`MidiSink`]s and
//! registered with the keyboard's output controller.

use std::sync::{Arc, Mutex};

use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tracing::{debug, info};

use tactus_core::error::EngineError;
use tactus_core::midi::MidiSink;
use tactus_core::router::MidiInputRouter;

const CLIENT_NAME: &str = "Tactus";

/// List available MIDI input ports as (index, name).
pub fn list_input_ports() -> Vec<(usize, String)> {
    let Ok(input) = MidiInput::new(CLIENT_NAME) else {
        return Vec::new();
    };
    input
        .ports()
        .iter()
        .enumerate()
        .map(|(i, port)| {
            (
                i,
                input.port_name(port).unwrap_or_else(|_| format!("Port {i}")),
            )
        })
        .collect()
}

/// List available MIDI output ports as (index, name).
pub fn list_output_ports() -> Vec<(usize, String)> {
    let Ok(output) = MidiOutput::new(CLIENT_NAME) else {
        return Vec::new();
    };
    output
        .ports()
        .iter()
        .enumerate()
        .map(|(i, port)| {
            (
                i,
                output
                    .port_name(port)
                    .unwrap_or_else(|_| format!("Port {i}")),
            )
        })
        .collect()
}

/// A midir output connection usable as a core [`MidiSink`].
pub struct MidirSink {
    connection: Mutex<MidiOutputConnection>,
    name: String,
}

impl MidiSink for MidirSink {
    fn send_bytes(&self, bytes: &[u8]) -> Result<(), EngineError> {
        self.connection
            .lock()
            .unwrap()
            .send(bytes)
            .map_err(|e| EngineError::MidiOutput(format!("{}: {e}", self.name)))
    }
}

/// Open an output port by index and wrap it for the output controller.
pub fn open_output_port(index: usize) -> Result<Box<dyn MidiSink>, EngineError> {
    let output = MidiOutput::new(CLIENT_NAME)
        .map_err(|e| EngineError::MidiOutput(format!("MIDI init failed: {e}")))?;
    let ports = output.ports();
    let port = ports
        .get(index)
        .ok_or_else(|| EngineError::InvalidConfiguration(format!("no MIDI output port {index}")))?;
    let name = output
        .port_name(port)
        .unwrap_or_else(|_| format!("Port {index}"));
    let connection = output
        .connect(port, &name)
        .map_err(|e| EngineError::MidiOutput(format!("connect to '{name}' failed: {e}")))?;
    info!(port = index, name, "opened MIDI output");
    Ok(Box::new(MidirSink {
        connection: Mutex::new(connection),
        name,
    }))
}

/// Keeps MIDI input connections alive and feeding the router.
pub struct MidiInputManager {
    connections: Vec<MidiInputConnection<()>>,
}

impl MidiInputManager {
    pub fn new() -> Self {
        MidiInputManager {
            connections: Vec::new(),
        }
    }

    /// Open an input port by index; every message goes to the router.
    pub fn open_port(&mut self, index: usize, router: Arc<MidiInputRouter>) -> Result<(), EngineError> {
        let input = MidiInput::new(CLIENT_NAME)
            .map_err(|e| EngineError::MidiOutput(format!("MIDI init failed: {e}")))?;
        let ports = input.ports();
        let port = ports.get(index).ok_or_else(|| {
            EngineError::InvalidConfiguration(format!("no MIDI input port {index}"))
        })?;
        let name = input
            .port_name(port)
            .unwrap_or_else(|_| format!("Port {index}"));

        let connection = input
            .connect(
                port,
                &name,
                move |_stamp, bytes, _| {
                    debug!(?bytes, "MIDI in");
                    router.handle_incoming_bytes(bytes);
                },
                (),
            )
            .map_err(|e| EngineError::MidiOutput(format!("connect to '{name}' failed: {e}")))?;
        info!(port = index, name, "opened MIDI input");
        self.connections.push(connection);
        Ok(())
    }

    pub fn close_all(&mut self) {
        self.connections.clear();
    }
}

impl Default for MidiInputManager {
    fn default() -> Self {
        Self::new()
    }
}
