// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! OSC message hub and outbound transmitter
//!
//! The [`OscHub`] is the in-process message source: components register
//! handlers for specific paths, and anything that calls
//! [`crate::keyboard::PianoKeyboard::send_message`] reaches them without
//! touching the network. Registration changes are staged and merged at the
//! start of the next dispatch, mirroring the trigger bus, because handlers
//! routinely add or remove paths from inside a dispatch.
//!
//! Path lookup supports a longest-suffix wildcard: when no handler matches
//! the full path, the last component is stripped and replaced with `*` and
//! the lookup retried, up to the root.
//!
//! The [`OscTransmitter`] carries messages out of the process through
//! whatever sinks the application attaches (UDP in the daemon, a recorder in
//! tests).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rosc::{OscMessage, OscType};
use tracing::trace;

/// Receives dispatched OSC messages for paths it registered.
pub trait OscHandler: Send + Sync {
    /// Handle a message; return true if it was consumed.
    fn osc_message(&self, path: &str, args: &[OscType]) -> bool;
}

type PathEntry = (String, Weak<dyn OscHandler>);

#[derive(Default)]
struct HubSets {
    active: Vec<PathEntry>,
    to_add: Vec<PathEntry>,
    to_remove: Vec<PathEntry>,
    blanket_removals: Vec<Weak<dyn OscHandler>>,
    modified: bool,
}

impl HubSets {
    fn same(a: &Weak<dyn OscHandler>, b: &Weak<dyn OscHandler>) -> bool {
        a.ptr_eq(b)
    }

    fn flush(&mut self) {
        let blanket = std::mem::take(&mut self.blanket_removals);
        let removals = std::mem::take(&mut self.to_remove);
        self.active.retain(|(path, handler)| {
            handler.strong_count() > 0
                && !blanket.iter().any(|b| Self::same(b, handler))
                && !removals
                    .iter()
                    .any(|(p, h)| p == path && Self::same(h, handler))
        });
        for (path, handler) in self.to_add.drain(..) {
            if !self
                .active
                .iter()
                .any(|(p, h)| *p == path && Self::same(h, &handler))
            {
                self.active.push((path, handler));
            }
        }
        self.modified = false;
    }
}

/// Path-to-handler dispatch for in-process OSC messages.
#[derive(Default)]
pub struct OscHub {
    sets: Mutex<HubSets>,
}

impl OscHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage registration of `handler` for `path`. Duplicate registrations
    /// of the same handler/path pair are ignored.
    pub fn add_listener(&self, path: &str, handler: &Arc<dyn OscHandler>) {
        let weak = Arc::downgrade(handler);
        let mut sets = self.sets.lock().unwrap();
        sets.to_remove
            .retain(|(p, h)| !(p == path && HubSets::same(h, &weak)));
        if !sets
            .to_add
            .iter()
            .any(|(p, h)| p == path && HubSets::same(h, &weak))
        {
            sets.to_add.push((path.to_string(), weak));
        }
        sets.modified = true;
    }

    /// Stage removal of `handler` from `path`.
    pub fn remove_listener(&self, path: &str, handler: &Weak<dyn OscHandler>) {
        let mut sets = self.sets.lock().unwrap();
        sets.to_add
            .retain(|(p, h)| !(p == path && HubSets::same(h, handler)));
        sets.to_remove.push((path.to_string(), handler.clone()));
        sets.modified = true;
    }

    /// Stage removal of `handler` from every path it registered.
    pub fn remove_listener_from_all(&self, handler: &Weak<dyn OscHandler>) {
        let mut sets = self.sets.lock().unwrap();
        sets.to_add.retain(|(_, h)| !HubSets::same(h, handler));
        sets.blanket_removals.push(handler.clone());
        sets.modified = true;
    }

    /// Dispatch a message to every handler matching `path`, falling back to
    /// suffix-wildcard entries (`/some/prefix/*`). Returns true if at least
    /// one handler consumed it.
    pub fn dispatch(&self, path: &str, args: &[OscType]) -> bool {
        let handlers: Vec<Arc<dyn OscHandler>> = {
            let mut sets = self.sets.lock().unwrap();
            if sets.modified {
                sets.flush();
            }

            let mut matched: Vec<Arc<dyn OscHandler>> = sets
                .active
                .iter()
                .filter(|(p, _)| p == path)
                .filter_map(|(_, h)| h.upgrade())
                .collect();

            // No exact matches: strip components and retry with a trailing *
            let mut subpath = path.to_string();
            while matched.is_empty() {
                let Some(separator) = subpath.rfind('/') else {
                    break;
                };
                subpath.truncate(separator);
                let pattern = format!("{subpath}/*");
                matched = sets
                    .active
                    .iter()
                    .filter(|(p, _)| *p == pattern)
                    .filter_map(|(_, h)| h.upgrade())
                    .collect();
                if subpath.is_empty() {
                    break;
                }
            }
            matched
        };

        let mut handled = false;
        for handler in &handlers {
            handled |= handler.osc_message(path, args);
        }
        trace!(path, handled, "osc dispatch");
        handled
    }
}

/// Destination for outbound OSC messages.
pub trait OscSink: Send + Sync {
    fn send(&self, message: &OscMessage);
}

/// Fan-out of outbound OSC messages to zero or more sinks.
pub struct OscTransmitter {
    enabled: AtomicBool,
    sinks: Mutex<Vec<Box<dyn OscSink>>>,
}

impl Default for OscTransmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl OscTransmitter {
    pub fn new() -> Self {
        OscTransmitter {
            enabled: AtomicBool::new(true),
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn add_sink(&self, sink: Box<dyn OscSink>) {
        self.sinks.lock().unwrap().push(sink);
    }

    pub fn clear_sinks(&self) {
        self.sinks.lock().unwrap().clear();
    }

    pub fn send(&self, path: &str, args: Vec<OscType>) {
        if !self.enabled() {
            return;
        }
        let message = OscMessage {
            addr: path.to_string(),
            args,
        };
        for sink in self.sinks.lock().unwrap().iter() {
            sink.send(&message);
        }
    }
}

/// Standard `/result 0` success reply for OSC control commands.
pub fn success_message() -> OscMessage {
    OscMessage {
        addr: "/result".to_string(),
        args: vec![OscType::Int(0)],
    }
}

/// Standard `/result 1` failure reply for OSC control commands.
pub fn failure_message() -> OscMessage {
    OscMessage {
        addr: "/result".to_string(),
        args: vec![OscType::Int(1)],
    }
}

/// Read an integer argument, accepting ints and integral floats.
pub fn int_arg(args: &[OscType], index: usize) -> Option<i32> {
    match args.get(index)? {
        OscType::Int(i) => Some(*i),
        OscType::Long(l) => Some(*l as i32),
        _ => None,
    }
}

/// Read a float argument, accepting floats, doubles, and ints.
pub fn float_arg(args: &[OscType], index: usize) -> Option<f32> {
    match args.get(index)? {
        OscType::Float(f) => Some(*f),
        OscType::Double(d) => Some(*d as f32),
        OscType::Int(i) => Some(*i as f32),
        _ => None,
    }
}

/// Read a string argument.
pub fn string_arg<'a>(args: &'a [OscType], index: usize) -> Option<&'a str> {
    match args.get(index)? {
        OscType::String(s) => Some(s.as_str()),
        _ => None,
    }
}

/// Test support: an OSC sink that records everything it is sent.
pub mod testing {
    use super::*;

    #[derive(Default)]
    pub struct RecordingOscSink {
        pub messages: Arc<Mutex<Vec<OscMessage>>>,
    }

    impl RecordingOscSink {
        pub fn new() -> (Box<dyn OscSink>, Arc<Mutex<Vec<OscMessage>>>) {
            let messages = Arc::new(Mutex::new(Vec::new()));
            (
                Box::new(RecordingOscSink {
                    messages: messages.clone(),
                }),
                messages,
            )
        }
    }

    impl OscSink for RecordingOscSink {
        fn send(&self, message: &OscMessage) {
            self.messages.lock().unwrap().push(message.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        hits: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(CountingHandler {
                hits: AtomicUsize::new(0),
            })
        }
    }

    impl OscHandler for CountingHandler {
        fn osc_message(&self, _path: &str, _args: &[OscType]) -> bool {
            self.hits.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn exact_path_dispatch() {
        let hub = OscHub::new();
        let handler = CountingHandler::new();
        hub.add_listener("/midi/noteon", &(handler.clone() as Arc<dyn OscHandler>));

        assert!(hub.dispatch("/midi/noteon", &[OscType::Int(60)]));
        assert!(!hub.dispatch("/midi/noteoff", &[]));
        assert_eq!(handler.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wildcard_matches_longest_suffix() {
        let hub = OscHub::new();
        let handler = CountingHandler::new();
        hub.add_listener("/mapping/*", &(handler.clone() as Arc<dyn OscHandler>));

        assert!(hub.dispatch("/mapping/vibrato/set-range", &[]));
        assert!(hub.dispatch("/mapping/anything", &[]));
        assert!(!hub.dispatch("/other/path", &[]));
        assert_eq!(handler.hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removal_during_dispatch_defers_to_next() {
        struct SelfRemovingHandler {
            hub: Arc<OscHub>,
            hits: AtomicUsize,
            this: Mutex<Option<Weak<dyn OscHandler>>>,
        }
        impl OscHandler for SelfRemovingHandler {
            fn osc_message(&self, _path: &str, _args: &[OscType]) -> bool {
                self.hits.fetch_add(1, Ordering::SeqCst);
                if let Some(weak) = self.this.lock().unwrap().as_ref() {
                    self.hub.remove_listener("/x", weak);
                }
                true
            }
        }

        let hub = Arc::new(OscHub::new());
        let handler = Arc::new(SelfRemovingHandler {
            hub: hub.clone(),
            hits: AtomicUsize::new(0),
            this: Mutex::new(None),
        });
        let dyn_handler: Arc<dyn OscHandler> = handler.clone();
        *handler.this.lock().unwrap() = Some(Arc::downgrade(&dyn_handler));
        hub.add_listener("/x", &dyn_handler);

        hub.dispatch("/x", &[]);
        hub.dispatch("/x", &[]);
        assert_eq!(handler.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transmitter_respects_enabled_flag() {
        let transmitter = OscTransmitter::new();
        let (sink, messages) = testing::RecordingOscSink::new();
        transmitter.add_sink(sink);

        transmitter.send("/touchkeys/on", vec![OscType::Int(60)]);
        transmitter.set_enabled(false);
        transmitter.send("/touchkeys/on", vec![OscType::Int(61)]);

        let sent = messages.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].addr, "/touchkeys/on");
    }
}
