// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! OSC wire I/O via rosc over UDP
//!
//! Outbound: [`OscUdpSink`] attaches to the keyboard's transmitter and
//! encodes each message to one or more UDP targets.
//!
//! Inbound: [`OscServer`] runs a receiver thread. Paths under the global
//! prefix route two ways:
//! - `/touchkeys/segment<N>/<command>` is a control command for segment N;
//!   the segment's `/result` (or richer) reply goes back to the sender;
//! - anything else under the prefix (standalone play messages like
//!   `/touchkeys/on`) is dispatched into the keyboard's internal hub.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rosc::{decoder, encoder, OscMessage, OscPacket};
use tracing::{debug, info, warn};

use tactus_core::error::EngineError;
use tactus_core::keyboard::PianoKeyboard;
use tactus_core::osc::OscSink;
use tactus_core::router::MidiInputRouter;

/// Prefix all engine OSC paths live under.
pub const GLOBAL_PREFIX: &str = "/touchkeys";

/// Sends outbound OSC messages to a fixed UDP target.
pub struct OscUdpSink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl OscUdpSink {
    pub fn new(target: SocketAddr) -> Result<OscUdpSink, EngineError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .map_err(|e| EngineError::OscSend(format!("bind failed: {e}")))?;
        Ok(OscUdpSink { socket, target })
    }
}

impl OscSink for OscUdpSink {
    fn send(&self, message: &OscMessage) {
        let packet = OscPacket::Message(message.clone());
        match encoder::encode(&packet) {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, self.target) {
                    warn!(%e, "dropping outbound OSC message");
                }
            }
            Err(e) => warn!(%e, "failed to encode OSC message"),
        }
    }
}

/// UDP OSC receiver thread.
pub struct OscServer {
    shutdown: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
    port: u16,
}

impl OscServer {
    /// Bind the given UDP port and start the receiver thread.
    pub fn start(
        port: u16,
        keyboard: Arc<PianoKeyboard>,
        router: Arc<MidiInputRouter>,
    ) -> Result<OscServer, EngineError> {
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .map_err(|e| EngineError::OscSend(format!("bind port {port} failed: {e}")))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(250)))
            .map_err(|e| EngineError::OscSend(e.to_string()))?;
        let shutdown = Arc::new(AtomicBool::new(false));
        info!(port, "OSC server listening");

        let worker = {
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("tactus-osc".into())
                .spawn(move || {
                    let mut buffer = [0u8; decoder::MTU];
                    while !shutdown.load(Ordering::Relaxed) {
                        let (size, sender) = match socket.recv_from(&mut buffer) {
                            Ok(received) => received,
                            Err(e)
                                if e.kind() == std::io::ErrorKind::WouldBlock
                                    || e.kind() == std::io::ErrorKind::TimedOut =>
                            {
                                continue;
                            }
                            Err(e) => {
                                warn!(%e, "OSC receive error");
                                continue;
                            }
                        };
                        match decoder::decode_udp(&buffer[..size]) {
                            Ok((_, packet)) => {
                                handle_packet(&socket, sender, packet, &keyboard, &router)
                            }
                            Err(e) => debug!(%e, "undecodable OSC packet"),
                        }
                    }
                })
                .expect("failed to spawn OSC thread")
        };

        Ok(OscServer {
            shutdown,
            worker: Some(worker),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for OscServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_packet(
    socket: &UdpSocket,
    sender: SocketAddr,
    packet: OscPacket,
    keyboard: &Arc<PianoKeyboard>,
    router: &Arc<MidiInputRouter>,
) {
    match packet {
        OscPacket::Message(message) => handle_message(socket, sender, message, keyboard, router),
        OscPacket::Bundle(bundle) => {
            for packet in bundle.content {
                handle_packet(socket, sender, packet, keyboard, router);
            }
        }
    }
}

fn handle_message(
    socket: &UdpSocket,
    sender: SocketAddr,
    message: OscMessage,
    keyboard: &Arc<PianoKeyboard>,
    router: &Arc<MidiInputRouter>,
) {
    let Some(stripped) = message.addr.strip_prefix(GLOBAL_PREFIX) else {
        debug!(path = message.addr, "OSC message outside prefix");
        return;
    };

    // Per-segment control: /touchkeys/segment<N>/<command>
    if let Some(rest) = stripped.strip_prefix("/segment") {
        let Some(separator) = rest.find('/') else {
            reply(socket, sender, tactus_core::osc::failure_message());
            return;
        };
        let (index, command) = rest.split_at(separator);
        let Ok(index) = index.parse::<usize>() else {
            reply(socket, sender, tactus_core::osc::failure_message());
            return;
        };
        let response = router
            .osc_control_for_segment(index, command, &message.args)
            .unwrap_or_else(tactus_core::osc::failure_message);
        reply(socket, sender, response);
        return;
    }

    // Everything else goes to the in-process hub (standalone play paths,
    // external control streams addressed to mappings)
    keyboard.osc_hub().dispatch(&message.addr, &message.args);
}

fn reply(socket: &UdpSocket, sender: SocketAddr, message: OscMessage) {
    if let Ok(bytes) = encoder::encode(&OscPacket::Message(message)) {
        if let Err(e) = socket.send_to(&bytes, sender) {
            warn!(%e, "failed to send OSC reply");
        }
    }
}
