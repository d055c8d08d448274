// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Binary performance logs: recording and replay
//!
//! Touch frames and MIDI events can be logged to disk in a bit-exact
//! little-endian record format and played back later; replay produces the
//! same downstream messages as live input did, at the corresponding rate.
//!
//! Record layouts (all little-endian):
//!
//! ```text
//! touch: timestamp f64 (seconds) | frame_counter i32 | midi_note i32 |
//!        count i32 | ids 3xi32 | locs 3xf32 | sizes 3xf32 |
//!        loc_h f32 | next_id i32 | white u8 | padding 3xu8
//! midi:  timestamp f64 (seconds) | status i32 | data1 i32 | data2 i32
//! ```

use std::io::{self, ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, info};

use crate::keyboard::PianoKeyboard;
use crate::router::MidiInputRouter;
use crate::midi::MidiMessage;
use crate::scheduler::Scheduler;
use crate::touch::{KeyTouchFrame, MAX_TOUCHES};
use crate::types::Timestamp;

const TOUCH_ACTOR: u64 = 1;
const MIDI_ACTOR: u64 = 2;

/// One decoded touch log record.
#[derive(Debug, Clone, PartialEq)]
pub struct TouchRecord {
    pub timestamp: f64,
    pub frame_counter: i32,
    pub midi_note: i32,
    pub frame: KeyTouchFrame,
}

/// One decoded MIDI log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiRecord {
    pub timestamp_micros: u64,
    pub bytes: [u8; 3],
}

/// Append a touch record in the log format.
pub fn write_touch_record(
    writer: &mut impl Write,
    timestamp: f64,
    frame_counter: i32,
    midi_note: i32,
    frame: &KeyTouchFrame,
) -> io::Result<()> {
    writer.write_f64::<LittleEndian>(timestamp)?;
    writer.write_i32::<LittleEndian>(frame_counter)?;
    writer.write_i32::<LittleEndian>(midi_note)?;
    writer.write_i32::<LittleEndian>(frame.count as i32)?;
    for i in 0..MAX_TOUCHES {
        writer.write_i32::<LittleEndian>(frame.ids[i])?;
    }
    for i in 0..MAX_TOUCHES {
        writer.write_f32::<LittleEndian>(frame.locs[i])?;
    }
    for i in 0..MAX_TOUCHES {
        writer.write_f32::<LittleEndian>(frame.sizes[i])?;
    }
    writer.write_f32::<LittleEndian>(frame.loc_h)?;
    writer.write_i32::<LittleEndian>(frame.next_id)?;
    writer.write_u8(frame.white as u8)?;
    writer.write_all(&[0u8; 3])?;
    Ok(())
}

/// Read the next touch record; `None` at a clean end of file.
pub fn read_touch_record(reader: &mut impl Read) -> io::Result<Option<TouchRecord>> {
    let timestamp = match reader.read_f64::<LittleEndian>() {
        Ok(t) => t,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let frame_counter = reader.read_i32::<LittleEndian>()?;
    let midi_note = reader.read_i32::<LittleEndian>()?;

    let mut frame = KeyTouchFrame {
        count: reader.read_i32::<LittleEndian>()?.clamp(0, MAX_TOUCHES as i32) as usize,
        ..Default::default()
    };
    for i in 0..MAX_TOUCHES {
        frame.ids[i] = reader.read_i32::<LittleEndian>()?;
    }
    for i in 0..MAX_TOUCHES {
        frame.locs[i] = reader.read_f32::<LittleEndian>()?;
    }
    for i in 0..MAX_TOUCHES {
        frame.sizes[i] = reader.read_f32::<LittleEndian>()?;
    }
    frame.loc_h = reader.read_f32::<LittleEndian>()?;
    frame.next_id = reader.read_i32::<LittleEndian>()?;
    frame.white = reader.read_u8()? != 0;
    let mut padding = [0u8; 3];
    reader.read_exact(&mut padding)?;

    Ok(Some(TouchRecord {
        timestamp,
        frame_counter,
        midi_note,
        frame,
    }))
}

/// Append a MIDI record in the log format.
pub fn write_midi_record(
    writer: &mut impl Write,
    timestamp: f64,
    bytes: &[u8],
) -> io::Result<()> {
    writer.write_f64::<LittleEndian>(timestamp)?;
    writer.write_i32::<LittleEndian>(bytes.first().copied().unwrap_or(0) as i32)?;
    writer.write_i32::<LittleEndian>(bytes.get(1).copied().unwrap_or(0) as i32)?;
    writer.write_i32::<LittleEndian>(bytes.get(2).copied().unwrap_or(0) as i32)?;
    Ok(())
}

/// Read the next MIDI record; `None` at a clean end of file.
pub fn read_midi_record(reader: &mut impl Read) -> io::Result<Option<MidiRecord>> {
    let timestamp = match reader.read_f64::<LittleEndian>() {
        Ok(t) => t,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let status = reader.read_i32::<LittleEndian>()?;
    let data1 = reader.read_i32::<LittleEndian>()?;
    let data2 = reader.read_i32::<LittleEndian>()?;
    Ok(Some(MidiRecord {
        timestamp_micros: Timestamp::from_secs_f64(timestamp).micros(),
        bytes: [status as u8, data1 as u8, data2 as u8],
    }))
}

struct PlaybackState {
    touch_reader: Option<Box<dyn Read + Send>>,
    midi_reader: Option<Box<dyn Read + Send>>,
    playing: bool,
    paused: bool,
    rate: f64,
    next_touch: Option<TouchRecord>,
    next_midi: Option<MidiRecord>,
    /// Record timestamp corresponding to `origin_play_time`
    origin_record_time: Timestamp,
    /// Playback-clock time at which `origin_record_time` plays
    origin_play_time: Timestamp,
    pause_time: Timestamp,
}

impl PlaybackState {
    /// Map a record timestamp onto the playback clock at the current rate.
    fn play_time_for(&self, record_time: Timestamp) -> Timestamp {
        let delta = record_time.delta_since(self.origin_record_time);
        self.origin_play_time
            .offset((delta as f64 / self.rate) as i64)
    }
}

struct PlaybackInner {
    keyboard: Arc<PianoKeyboard>,
    router: Arc<MidiInputRouter>,
    scheduler: Scheduler,
    state: Mutex<PlaybackState>,
}

/// Replays recorded touch and MIDI logs into the live pipeline.
///
/// Runs its own scheduler thread whose virtual clock paces the playback;
/// messages are fed to the keyboard with the *engine's* timestamps so the
/// downstream pipeline cannot tell replay from live input.
pub struct LogPlayback {
    inner: Arc<PlaybackInner>,
}

impl LogPlayback {
    pub fn new(keyboard: Arc<PianoKeyboard>, router: Arc<MidiInputRouter>) -> LogPlayback {
        LogPlayback {
            inner: Arc::new(PlaybackInner {
                keyboard,
                router,
                scheduler: Scheduler::new(),
                state: Mutex::new(PlaybackState {
                    touch_reader: None,
                    midi_reader: None,
                    playing: false,
                    paused: false,
                    rate: 1.0,
                    next_touch: None,
                    next_midi: None,
                    origin_record_time: Timestamp::ZERO,
                    origin_play_time: Timestamp::ZERO,
                    pause_time: Timestamp::ZERO,
                }),
            }),
        }
    }

    /// Attach log streams. Either may be absent; at least one is required.
    pub fn open_logs(
        &self,
        touch: Option<Box<dyn Read + Send>>,
        midi: Option<Box<dyn Read + Send>>,
    ) -> bool {
        if touch.is_none() && midi.is_none() {
            return false;
        }
        let mut state = self.inner.state.lock().unwrap();
        state.touch_reader = touch;
        state.midi_reader = midi;
        state.playing = false;
        state.paused = false;
        state.rate = 1.0;
        state.next_touch = None;
        state.next_midi = None;
        true
    }

    /// Start playback from the top of the logs.
    pub fn start(&self) {
        self.inner.scheduler.start(Timestamp::ZERO);

        {
            let mut guard = self.inner.state.lock().unwrap();
            let state = &mut *guard;
            if state.touch_reader.is_none() && state.midi_reader.is_none() {
                return;
            }
            if let Some(reader) = state.touch_reader.as_mut() {
                state.next_touch = read_touch_record(reader).ok().flatten();
            }
            if let Some(reader) = state.midi_reader.as_mut() {
                state.next_midi = read_midi_record(reader).ok().flatten();
            }

            // Anchor playback at the first event of either stream
            let first_touch = state
                .next_touch
                .as_ref()
                .map(|r| Timestamp::from_secs_f64(r.timestamp));
            let first_midi = state
                .next_midi
                .as_ref()
                .map(|r| Timestamp::from_micros(r.timestamp_micros));
            let first = match (first_touch, first_midi) {
                (Some(t), Some(m)) => t.min(m),
                (Some(t), None) => t,
                (None, Some(m)) => m,
                (None, None) => return,
            };
            state.origin_record_time = first;
            state.origin_play_time = self.inner.scheduler.current_timestamp();
            state.playing = true;
            state.paused = false;
            info!(start = first.micros(), "starting log playback");
        }

        self.schedule_heads();
    }

    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.playing = false;
            state.paused = false;
        }
        self.inner.scheduler.unschedule(TOUCH_ACTOR);
        self.inner.scheduler.unschedule(MIDI_ACTOR);
        self.inner.scheduler.stop();
    }

    pub fn pause(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if !state.playing || state.paused {
            return;
        }
        state.paused = true;
        state.pause_time = self.inner.scheduler.current_timestamp();
        drop(state);
        self.inner.scheduler.unschedule(TOUCH_ACTOR);
        self.inner.scheduler.unschedule(MIDI_ACTOR);
    }

    pub fn resume(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.paused {
                return;
            }
            state.paused = false;
            let gap = self
                .inner
                .scheduler
                .current_timestamp()
                .delta_since(state.pause_time);
            state.origin_play_time = state.origin_play_time.offset(gap);
        }
        self.schedule_heads();
    }

    /// Skip forward to `target` (a record timestamp); events before it are
    /// consumed without playing.
    pub fn seek(&self, target: Timestamp) {
        self.inner.scheduler.unschedule(TOUCH_ACTOR);
        self.inner.scheduler.unschedule(MIDI_ACTOR);
        {
            let mut guard = self.inner.state.lock().unwrap();
            let state = &mut *guard;
            if !state.playing {
                return;
            }
            while state
                .next_touch
                .as_ref()
                .map(|r| Timestamp::from_secs_f64(r.timestamp) <= target)
                .unwrap_or(false)
            {
                let reader = state.touch_reader.as_mut().unwrap();
                state.next_touch = read_touch_record(reader).ok().flatten();
            }
            while state
                .next_midi
                .as_ref()
                .map(|r| Timestamp::from_micros(r.timestamp_micros) <= target)
                .unwrap_or(false)
            {
                let reader = state.midi_reader.as_mut().unwrap();
                state.next_midi = read_midi_record(reader).ok().flatten();
            }

            let first_touch = state
                .next_touch
                .as_ref()
                .map(|r| Timestamp::from_secs_f64(r.timestamp));
            let first_midi = state
                .next_midi
                .as_ref()
                .map(|r| Timestamp::from_micros(r.timestamp_micros));
            let first = match (first_touch, first_midi) {
                (Some(t), Some(m)) => t.min(m),
                (Some(t), None) => t,
                (None, Some(m)) => m,
                (None, None) => {
                    state.playing = false;
                    return;
                }
            };
            state.origin_record_time = first;
            state.origin_play_time = self.inner.scheduler.current_timestamp();
        }
        self.schedule_heads();
    }

    /// Change the playback rate (1.0 = recorded speed). Takes effect from
    /// the current position.
    pub fn set_playback_rate(&self, rate: f64) {
        if rate <= 0.0 {
            return;
        }
        let mut state = self.inner.state.lock().unwrap();
        let now = self.inner.scheduler.current_timestamp();
        // Re-anchor so already-elapsed material keeps its timing
        if let Some(next) = state
            .next_touch
            .as_ref()
            .map(|r| Timestamp::from_secs_f64(r.timestamp))
            .or_else(|| {
                state
                    .next_midi
                    .as_ref()
                    .map(|r| Timestamp::from_micros(r.timestamp_micros))
            })
        {
            state.origin_record_time = next;
            state.origin_play_time = now.max(state.play_time_for(next));
        }
        state.rate = rate;
    }

    fn schedule_heads(&self) {
        let weak = Arc::downgrade(&self.inner);
        let now = self.inner.scheduler.current_timestamp();
        let touch_weak = weak.clone();
        self.inner.scheduler.schedule(
            TOUCH_ACTOR,
            Box::new(move || touch_weak.upgrade().and_then(|inner| next_touch_event(&inner))),
            now,
        );
        self.inner.scheduler.schedule(
            MIDI_ACTOR,
            Box::new(move || weak.upgrade().and_then(|inner| next_midi_event(&inner))),
            now,
        );
    }
}

impl Drop for LogPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Play every due touch frame, then return when the next one is due.
fn next_touch_event(inner: &Arc<PlaybackInner>) -> Option<Timestamp> {
    loop {
        let record = {
            let mut guard = inner.state.lock().unwrap();
            let state = &mut *guard;
            if !state.playing || state.paused {
                return None;
            }
            let Some(record) = state.next_touch.clone() else {
                debug!("touch log playback finished");
                return None;
            };
            let due = state.play_time_for(Timestamp::from_secs_f64(record.timestamp));
            if due > inner.scheduler.current_timestamp() {
                return Some(due);
            }
            let reader = state.touch_reader.as_mut()?;
            state.next_touch = read_touch_record(reader).ok().flatten();
            record
        };

        if (0..128).contains(&record.midi_note) {
            // Use engine timestamps: the playback clock is not the engine's
            let engine_now = inner.keyboard.current_timestamp();
            if let Some(key) = inner.keyboard.key(record.midi_note as u8) {
                if record.frame.count == 0 {
                    key.touch_off(engine_now);
                } else {
                    key.touch_insert_frame(record.frame.clone(), engine_now);
                }
            }
        }
    }
}

/// Play every due MIDI event, then return when the next one is due.
fn next_midi_event(inner: &Arc<PlaybackInner>) -> Option<Timestamp> {
    loop {
        let record = {
            let mut guard = inner.state.lock().unwrap();
            let state = &mut *guard;
            if !state.playing || state.paused {
                return None;
            }
            let Some(record) = state.next_midi else {
                debug!("MIDI log playback finished");
                return None;
            };
            let due = state.play_time_for(Timestamp::from_micros(record.timestamp_micros));
            if due > inner.scheduler.current_timestamp() {
                return Some(due);
            }
            let reader = state.midi_reader.as_mut()?;
            state.next_midi = read_midi_record(reader).ok().flatten();
            record
        };

        if let Some(message) = MidiMessage::from_bytes(&record.bytes) {
            inner.router.handle_incoming_message(&message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn touch_record_layout_is_bit_exact() {
        let frame = KeyTouchFrame {
            count: 2,
            ids: [0, 1, -1],
            locs: [0.25, 0.75, -1.0],
            sizes: [0.3, 0.4, 0.0],
            loc_h: 0.5,
            next_id: 2,
            white: true,
        };
        let mut bytes = Vec::new();
        write_touch_record(&mut bytes, 1.5, 42, 60, &frame).unwrap();
        assert_eq!(bytes.len(), 68);
        // Little-endian timestamp leads the record
        assert_eq!(&bytes[0..8], &1.5f64.to_le_bytes());
        assert_eq!(&bytes[8..12], &42i32.to_le_bytes());
        assert_eq!(&bytes[12..16], &60i32.to_le_bytes());

        let record = read_touch_record(&mut Cursor::new(&bytes)).unwrap().unwrap();
        assert_eq!(record.timestamp, 1.5);
        assert_eq!(record.frame_counter, 42);
        assert_eq!(record.midi_note, 60);
        assert_eq!(record.frame, frame);
    }

    #[test]
    fn midi_record_layout_is_bit_exact() {
        let mut bytes = Vec::new();
        write_midi_record(&mut bytes, 0.25, &[0x90, 60, 100]).unwrap();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[8..12], &(0x90i32).to_le_bytes());

        let record = read_midi_record(&mut Cursor::new(&bytes)).unwrap().unwrap();
        assert_eq!(record.bytes, [0x90, 60, 100]);
        assert_eq!(record.timestamp_micros, 250_000);
    }

    #[test]
    fn eof_reads_as_none() {
        let mut empty = Cursor::new(Vec::new());
        assert!(read_touch_record(&mut empty).unwrap().is_none());
        assert!(read_midi_record(&mut empty).unwrap().is_none());
    }

    #[test]
    fn multiple_records_stream_in_order() {
        let mut bytes = Vec::new();
        for i in 0..5 {
            write_midi_record(&mut bytes, i as f64 * 0.1, &[0x90, 60 + i, 100]).unwrap();
        }
        let mut cursor = Cursor::new(&bytes);
        for i in 0..5 {
            let record = read_midi_record(&mut cursor).unwrap().unwrap();
            assert_eq!(record.bytes[1], 60 + i);
        }
        assert!(read_midi_record(&mut cursor).unwrap().is_none());
    }
}
