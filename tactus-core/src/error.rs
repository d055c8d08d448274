// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

use thiserror::Error;

/// Engine-level errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("MIDI output error: {0}")]
    MidiOutput(String),

    #[error("OSC send error: {0}")]
    OscSend(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Already running")]
    AlreadyRunning,

    #[error("Not running")]
    NotRunning,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Preset parsing and persistence errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
