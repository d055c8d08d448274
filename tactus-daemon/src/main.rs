// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Tactus daemon - expressive keyboard engine service
//!
//! Assembles a running engine from the core library and the device I/O in
//! this package: MIDI input ports feed the segment router, segments emit to
//! a MIDI output port, and an OSC server accepts control and play messages.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use tactus_core::config::Preset;
use tactus_core::keyboard::PianoKeyboard;
use tactus_core::router::MidiInputRouter;
use tactus_core::segment::Mode;
use tactus_daemon::{midi_io, osc_io};

/// Tactus - sensor fusion for expressive keyboards
///
/// Fuses multi-touch key sensing and continuous key position with MIDI into
/// expressive MIDI/OSC control streams, with per-note channel allocation
/// (polyphonic or MPE) at the output.
#[derive(Parser, Debug)]
#[command(name = "tactus")]
#[command(version)]
#[command(about = "Tactus - expressive keyboard engine", long_about = None)]
struct Args {
    /// List MIDI ports and exit
    #[arg(short, long)]
    list: bool,

    /// MIDI input port index
    #[arg(long, value_name = "INDEX")]
    midi_in: Option<usize>,

    /// MIDI output port index
    #[arg(long, value_name = "INDEX")]
    midi_out: Option<usize>,

    /// UDP port for the OSC server (0 disables)
    #[arg(long, value_name = "PORT", default_value_t = 8000)]
    osc_listen: u16,

    /// Target for outbound OSC messages, e.g. 127.0.0.1:8001
    #[arg(long, value_name = "ADDR")]
    osc_send: Option<String>,

    /// Segment preset file (XML)
    #[arg(short, long, value_name = "FILE")]
    preset: Option<PathBuf>,

    /// Touch-triggered notes without a MIDI keyboard
    #[arg(long)]
    standalone: bool,

    /// Directory for rotated log files (console-only when omitted)
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Write log files as JSON instead of text
    #[arg(long)]
    log_json: bool,

    /// Enable verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Enable trace-level logging
    #[arg(short = 'T', long)]
    trace: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.trace {
        "trace"
    } else if args.verbose {
        "debug"
    } else {
        "info"
    };
    match &args.log_dir {
        Some(dir) => {
            let mut config = tactus_core::logging::LoggingConfig::default()
                .with_level(level)
                .with_path(dir);
            if args.log_json {
                config = config.with_json_format();
            }
            tactus_core::logging::init_logging(&config)?;
        }
        None => tactus_core::logging::setup(level),
    }

    info!("Tactus daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if args.list {
        println!("MIDI input ports:");
        for (index, name) in midi_io::list_input_ports() {
            println!("  {index}: {name}");
        }
        println!("MIDI output ports:");
        for (index, name) in midi_io::list_output_ports() {
            println!("  {index}: {name}");
        }
        return Ok(());
    }

    // Core engine
    let keyboard = PianoKeyboard::new();
    let router = MidiInputRouter::new(keyboard.clone());

    // Segments: from a preset file, or one default polyphonic zone
    if let Some(path) = &args.preset {
        let preset = Preset::load(path)?;
        if !router.load_segment_preset(&preset) {
            error!("preset file {} failed to load", path.display());
            std::process::exit(1);
        }
        info!(
            segments = router.num_segments(),
            "loaded preset {}",
            path.display()
        );
    } else {
        let segment = router.add_segment(0, 0, 127, 0xFFFF);
        segment.set_mode(Mode::Polyphonic);
        if args.standalone {
            segment.enable_standalone_mode();
            info!("standalone mode: /touchkeys/on|off trigger notes");
        }
    }

    // MIDI output
    if let Some(index) = args.midi_out {
        let sink = midi_io::open_output_port(index)?;
        keyboard.midi_output().set_port(0, sink);
    } else {
        info!("no MIDI output port selected; output will be dropped");
    }

    // MIDI input
    let mut inputs = midi_io::MidiInputManager::new();
    if let Some(index) = args.midi_in {
        inputs.open_port(index, router.clone())?;
    }

    // OSC wire I/O
    if let Some(target) = &args.osc_send {
        let target: std::net::SocketAddr = target.parse()?;
        keyboard
            .osc_transmitter()
            .add_sink(Box::new(osc_io::OscUdpSink::new(target)?));
        info!(%target, "sending OSC");
    }
    let mut osc_server = if args.osc_listen != 0 {
        Some(osc_io::OscServer::start(
            args.osc_listen,
            keyboard.clone(),
            router.clone(),
        )?)
    } else {
        None
    };

    keyboard.start();
    info!("engine running; press Ctrl-C to stop");

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })?;
    let _ = shutdown_rx.recv();

    info!("shutting down");
    router.all_notes_off();
    if let Some(server) = osc_server.as_mut() {
        server.stop();
    }
    inputs.close_all();
    keyboard.stop();
    Ok(())
}
