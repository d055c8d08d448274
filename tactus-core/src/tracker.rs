// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Key-position state machine
//!
//! [`KeyPositionTracker`] parses continuous key position for one active key
//! and decides what the key is doing: partial-press patterns with their
//! minima and maxima, full presses with press velocity, key-down, release
//! with release velocity, and the percussiveness of struck (as opposed to
//! pressed) notes.
//!
//! The tracker is triggered by new samples in the key position buffer and
//! publishes its output into its own node as a stream of notifications:
//! state changes, feature-available announcements, and new minimum/maximum
//! points during partial presses. Feature values themselves are pulled
//! through accessors once announced.
//!
//! States only move forward within one engage cycle:
//!
//! ```text
//! Unknown -> PartialPressAwaitingMax <-> PartialPressFoundMax
//!         -> PressInProgress -> Down -> ReleaseInProgress -> ReleaseFinished
//! ```
//!
//! A key that finished its release goes back through the idle detector,
//! which disengages and re-engages the tracker for the next press.

use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace};

use crate::node::{Node, NodeReadGuard};
use crate::trigger::{SourceId, TriggerListener};
use crate::types::{delta_secs, KeyPosition, KeyVelocity, Timestamp, TimestampDelta};

// Thresholds for state detection, in normalized key position
// (0 = rest, 1 = fully pressed).
pub const PRESS_POSITION: KeyPosition = 0.75;
pub const PRESS_HYSTERESIS: KeyPosition = 0.05;
pub const MIN_MAX_SPACING_THRESHOLD: KeyPosition = 0.02;
pub const FIRST_MAX_THRESHOLD: KeyPosition = 0.075;
pub const RELEASE_FINISH_POSITION: KeyPosition = 0.2;

// How far back to search for the real start or release corner of a press
pub const SAMPLES_TO_SEARCH_FOR_START_LOCATION: usize = 50;
pub const SAMPLES_TO_SEARCH_BEYOND_START_LOCATION: usize = 20;
pub const SAMPLES_TO_SEARCH_FOR_RELEASE_LOCATION: usize = 100;
pub const SAMPLES_TO_AVERAGE_FOR_START_VELOCITY: usize = 3;
pub const START_VELOCITY_THRESHOLD: KeyVelocity = 0.5;
pub const START_VELOCITY_SPIKE_THRESHOLD: KeyVelocity = 2.5;
pub const RELEASE_VELOCITY_THRESHOLD: KeyVelocity = -0.2;

// Feature calculation positions. The press value approximates the location
// of the escapement, empirically measured, so only approximate.
pub const DEFAULT_POSITION_FOR_PRESS_VELOCITY: KeyPosition = 0.65;
pub const DEFAULT_POSITION_FOR_RELEASE_VELOCITY: KeyPosition = 0.5;
pub const POSITION_THRESHOLD_FOR_PERCUSSIVENESS: KeyPosition = 0.4;
pub const SAMPLES_NEEDED_FOR_PRESS_VELOCITY_AFTER_ESCAPEMENT: usize = 1;
pub const SAMPLES_NEEDED_FOR_RELEASE_VELOCITY_AFTER_ESCAPEMENT: usize = 1;

/// Key state as seen from continuous position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyState {
    Unknown,
    PartialPressAwaitingMax,
    PartialPressFoundMax,
    PressInProgress,
    Down,
    ReleaseInProgress,
    ReleaseFinished,
}

/// Bitset of features currently computable for the press in progress.
pub type FeatureFlags = u32;
pub const FEATURE_PRESS_VELOCITY: FeatureFlags = 0x0001;
pub const FEATURE_RELEASE_VELOCITY: FeatureFlags = 0x0002;
pub const FEATURE_PERCUSSIVENESS: FeatureFlags = 0x0004;

/// Index/position/timestamp triad for a significant point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyEvent {
    pub index: usize,
    pub position: KeyPosition,
    pub timestamp: Timestamp,
}

/// Index/velocity/timestamp triad on the derived velocity signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocityEvent {
    pub index: usize,
    pub velocity: KeyVelocity,
    pub timestamp: Timestamp,
}

/// What a tracker notification announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    StateChange,
    FeatureAvailablePressVelocity,
    FeatureAvailableReleaseVelocity,
    FeatureAvailablePercussiveness,
    NewMinimum,
    NewMaximum,
}

/// One notification in the tracker's output node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerNotification {
    pub kind: NotificationKind,
    pub state: KeyState,
    pub features: FeatureFlags,
}

/// Descriptor of the initial velocity spike on a percussive press.
#[derive(Debug, Clone, Copy)]
pub struct PercussivenessFeatures {
    /// Single calculated score combining everything below
    pub percussiveness: f64,
    pub velocity_spike_maximum: VelocityEvent,
    pub velocity_spike_minimum: VelocityEvent,
    pub time_from_start_to_spike: TimestampDelta,
    /// Sum of velocity values from start to the spike maximum
    pub area_preceding_spike: KeyVelocity,
    /// Sum of velocity values from the maximum to the following minimum
    pub area_following_spike: KeyVelocity,
}

struct TrackerState {
    engaged: bool,
    current_state: KeyState,
    available_features: FeatureFlags,

    start: Option<KeyEvent>,
    press: Option<KeyEvent>,
    release_begin: Option<KeyEvent>,
    release_end: Option<KeyEvent>,
    current_min: Option<KeyEvent>,
    current_max: Option<KeyEvent>,
    last_min_max_position: KeyPosition,

    press_escapement: KeyPosition,
    release_escapement: KeyPosition,
    press_velocity_available_index: Option<usize>,
    release_velocity_available_index: Option<usize>,
    release_waiting_for_escapement_cross: bool,
    percussiveness_available_index: Option<usize>,

    previous_position: Option<KeyPosition>,
}

impl TrackerState {
    fn new() -> Self {
        TrackerState {
            engaged: false,
            current_state: KeyState::Unknown,
            available_features: 0,
            start: None,
            press: None,
            release_begin: None,
            release_end: None,
            current_min: None,
            current_max: None,
            last_min_max_position: 0.0,
            press_escapement: DEFAULT_POSITION_FOR_PRESS_VELOCITY,
            release_escapement: DEFAULT_POSITION_FOR_RELEASE_VELOCITY,
            press_velocity_available_index: None,
            release_velocity_available_index: None,
            release_waiting_for_escapement_cross: false,
            percussiveness_available_index: None,
            previous_position: None,
        }
    }

    fn reset(&mut self) {
        let press_escapement = self.press_escapement;
        let release_escapement = self.release_escapement;
        let engaged = self.engaged;
        *self = TrackerState::new();
        self.engaged = engaged;
        self.press_escapement = press_escapement;
        self.release_escapement = release_escapement;
    }
}

/// State machine over a key's continuous position buffer.
pub struct KeyPositionTracker {
    output: Arc<Node<TrackerNotification>>,
    key_buffer: Arc<Node<KeyPosition>>,
    state: Mutex<TrackerState>,
}

impl KeyPositionTracker {
    pub fn new(capacity: usize, key_buffer: Arc<Node<KeyPosition>>) -> Arc<Self> {
        Arc::new(KeyPositionTracker {
            output: Node::with_capacity(capacity),
            key_buffer,
            state: Mutex::new(TrackerState::new()),
        })
    }

    /// Node carrying notifications for listeners.
    pub fn node(&self) -> &Arc<Node<TrackerNotification>> {
        &self.output
    }

    pub fn engaged(&self) -> bool {
        self.state.lock().unwrap().engaged
    }

    pub fn current_state(&self) -> KeyState {
        self.state.lock().unwrap().current_state
    }

    pub fn available_features(&self) -> FeatureFlags {
        self.state.lock().unwrap().available_features
    }

    pub fn press_start(&self) -> Option<KeyEvent> {
        self.state.lock().unwrap().start
    }

    pub fn press_finish(&self) -> Option<KeyEvent> {
        self.state.lock().unwrap().press
    }

    pub fn release_start(&self) -> Option<KeyEvent> {
        self.state.lock().unwrap().release_begin
    }

    pub fn release_finish(&self) -> Option<KeyEvent> {
        self.state.lock().unwrap().release_end
    }

    pub fn current_min(&self) -> Option<KeyEvent> {
        self.state.lock().unwrap().current_min
    }

    pub fn current_max(&self) -> Option<KeyEvent> {
        self.state.lock().unwrap().current_max
    }

    /// Set the position where press velocity is measured. Clamped so it
    /// cannot sit above the press threshold plus hysteresis.
    pub fn set_press_velocity_escapement_position(&self, position: KeyPosition) {
        let mut state = self.state.lock().unwrap();
        state.press_escapement = position.min(PRESS_POSITION + PRESS_HYSTERESIS);
    }

    /// Set the position where release velocity is measured. Clamped so it
    /// cannot sit below the release-finished threshold.
    pub fn set_release_velocity_escapement_position(&self, position: KeyPosition) {
        let mut state = self.state.lock().unwrap();
        state.release_escapement = position.max(RELEASE_FINISH_POSITION);
    }

    /// Register for updates from the key position buffer.
    pub fn engage(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.engaged {
                return;
            }
            state.engaged = true;
        }
        self.key_buffer
            .subscribe(&(self.clone() as Arc<dyn TriggerListener>));
    }

    /// Unregister from the key buffer and clear all state.
    pub fn disengage(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.engaged {
                return;
            }
            state.engaged = false;
        }
        let weak: Weak<dyn TriggerListener> = Arc::downgrade(&(self.clone() as Arc<dyn TriggerListener>));
        self.key_buffer.unsubscribe(&weak);
        self.reset();
    }

    /// Reset the state machine back to its initial values.
    pub fn reset(&self) {
        self.output.clear();
        self.state.lock().unwrap().reset();
    }

    /// Press velocity at the stored escapement point: `(timestamp, velocity)`
    /// with velocity >= 0 once a press has been detected. `None` until the
    /// press-velocity feature has been announced as available.
    pub fn press_velocity(&self) -> Option<(Timestamp, KeyVelocity)> {
        let escapement = self.state.lock().unwrap().press_escapement;
        self.press_velocity_at(escapement)
    }

    /// Press velocity measured at an explicit escapement position.
    pub fn press_velocity_at(&self, escapement: KeyPosition) -> Option<(Timestamp, KeyVelocity)> {
        let buffer = self.key_buffer.read();
        let crossing = find_most_recent_crossing(&buffer, escapement, true, buffer.end_index())?;
        velocity_around(&buffer, crossing, SAMPLES_TO_AVERAGE_FOR_START_VELOCITY)
    }

    /// Release velocity at the stored return point: `(timestamp, velocity)`
    /// with velocity <= 0 once a release has been detected.
    pub fn release_velocity(&self) -> Option<(Timestamp, KeyVelocity)> {
        let escapement = self.state.lock().unwrap().release_escapement;
        self.release_velocity_at(escapement)
    }

    /// Release velocity measured at an explicit return position.
    pub fn release_velocity_at(&self, position: KeyPosition) -> Option<(Timestamp, KeyVelocity)> {
        let buffer = self.key_buffer.read();
        let crossing = find_most_recent_crossing(&buffer, position, false, buffer.end_index())?;
        velocity_around(&buffer, crossing, SAMPLES_TO_AVERAGE_FOR_START_VELOCITY)
    }

    /// Percussiveness of the current press: the initial velocity spike that
    /// precedes a struck (rather than pressed) note. `None` when no press
    /// start has been pinned or the buffer has been lost.
    pub fn press_percussiveness(&self) -> Option<PercussivenessFeatures> {
        let (start, limit) = {
            let state = self.state.lock().unwrap();
            let start = state.start?;
            let limit = state
                .percussiveness_available_index
                .unwrap_or(usize::MAX);
            (start, limit)
        };
        let buffer = self.key_buffer.read();
        let begin = buffer.begin_index().max(start.index.max(1));
        let end = buffer.end_index().min(limit.saturating_add(1));
        if end <= begin + 1 {
            return None;
        }

        // First-difference velocity over the press onset
        let mut velocities: Vec<VelocityEvent> = Vec::with_capacity(end - begin);
        for index in begin..end {
            let (Some(&p1), Some(&p0)) = (buffer.get(index), buffer.get(index - 1)) else {
                continue;
            };
            let (Some(t1), Some(t0)) = (buffer.timestamp_at(index), buffer.timestamp_at(index - 1))
            else {
                continue;
            };
            let dt = delta_secs(t1.delta_since(t0));
            let velocity = if dt > 0.0 { (p1 - p0) / dt } else { 0.0 };
            velocities.push(VelocityEvent {
                index,
                velocity,
                timestamp: t1,
            });
        }
        if velocities.is_empty() {
            return None;
        }

        let max_pos = velocities
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.velocity.total_cmp(&b.1.velocity))
            .map(|(i, _)| i)?;
        let spike_max = velocities[max_pos];
        let spike_min = velocities[max_pos..]
            .iter()
            .min_by(|a, b| a.velocity.total_cmp(&b.velocity))
            .copied()
            .unwrap_or(spike_max);

        let area_preceding: KeyVelocity = velocities[..=max_pos].iter().map(|v| v.velocity).sum();
        let area_following: KeyVelocity = velocities[max_pos..]
            .iter()
            .take_while(|v| v.index <= spike_min.index)
            .map(|v| v.velocity)
            .sum();
        let time_to_spike = spike_max.timestamp.delta_since(start.timestamp);

        // Score: spike amplitude weighted by temporal concentration. A slow
        // buildup accumulates area before the spike and scores low; a strike
        // concentrates its energy in the spike itself.
        let swing = spike_max.velocity - spike_min.velocity;
        let percussiveness = if spike_max.velocity >= START_VELOCITY_SPIKE_THRESHOLD {
            swing * spike_max.velocity / (area_preceding.abs() + 1.0)
        } else {
            0.0
        };

        Some(PercussivenessFeatures {
            percussiveness,
            velocity_spike_maximum: spike_max,
            velocity_spike_minimum: spike_min,
            time_from_start_to_spike: time_to_spike,
            area_preceding_spike: area_preceding,
            area_following_spike: area_following,
        })
    }
}

impl TriggerListener for KeyPositionTracker {
    fn trigger_received(&self, source: SourceId, timestamp: Timestamp) {
        if source != self.key_buffer.source_id() {
            return;
        }

        let mut pending: Vec<NotificationKind> = Vec::new();
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            if !state.engaged {
                return;
            }
            let buffer = self.key_buffer.read();
            let Some(position) = buffer.latest().copied() else {
                return;
            };
            let index = buffer.end_index() - 1;
            let sample = KeyEvent {
                index,
                position,
                timestamp,
            };
            let previous = state.previous_position.unwrap_or(position);
            state.previous_position = Some(position);

            track_feature_crossings(&mut state, previous, sample, &mut pending);
            advance_state(&mut state, &buffer, sample, &mut pending);

            (state.current_state, state.available_features)
        };

        for kind in pending {
            trace!(?kind, state = ?snapshot.0, "tracker notification");
            self.output.insert(
                TrackerNotification {
                    kind,
                    state: snapshot.0,
                    features: snapshot.1,
                },
                timestamp,
            );
        }
    }
}

/// Watch for escapement crossings and announce features once enough samples
/// have elapsed past them.
fn track_feature_crossings(
    state: &mut TrackerState,
    previous: KeyPosition,
    sample: KeyEvent,
    pending: &mut Vec<NotificationKind>,
) {
    // Upward crossing of the press escapement arms the press velocity
    if state.press_velocity_available_index.is_none()
        && state.current_state < KeyState::Down
        && previous < state.press_escapement
        && sample.position >= state.press_escapement
    {
        state.press_velocity_available_index =
            Some(sample.index + SAMPLES_NEEDED_FOR_PRESS_VELOCITY_AFTER_ESCAPEMENT);
    }
    if let Some(available) = state.press_velocity_available_index {
        if sample.index >= available && state.available_features & FEATURE_PRESS_VELOCITY == 0 {
            state.available_features |= FEATURE_PRESS_VELOCITY;
            pending.push(NotificationKind::FeatureAvailablePressVelocity);
        }
    }

    // Upward crossing of the percussiveness threshold: the spike (if any)
    // has happened by now, so the feature is computable.
    if state.percussiveness_available_index.is_none()
        && state.current_state < KeyState::Down
        && previous < POSITION_THRESHOLD_FOR_PERCUSSIVENESS
        && sample.position >= POSITION_THRESHOLD_FOR_PERCUSSIVENESS
    {
        state.percussiveness_available_index = Some(sample.index);
        if state.available_features & FEATURE_PERCUSSIVENESS == 0 {
            state.available_features |= FEATURE_PERCUSSIVENESS;
            pending.push(NotificationKind::FeatureAvailablePercussiveness);
        }
    }

    // Downward crossing of the release escapement arms the release velocity
    if state.release_waiting_for_escapement_cross
        && previous > state.release_escapement
        && sample.position <= state.release_escapement
    {
        state.release_velocity_available_index =
            Some(sample.index + SAMPLES_NEEDED_FOR_RELEASE_VELOCITY_AFTER_ESCAPEMENT);
        state.release_waiting_for_escapement_cross = false;
    }
    if let Some(available) = state.release_velocity_available_index {
        if sample.index >= available && state.available_features & FEATURE_RELEASE_VELOCITY == 0 {
            state.available_features |= FEATURE_RELEASE_VELOCITY;
            pending.push(NotificationKind::FeatureAvailableReleaseVelocity);
        }
    }
}

fn advance_state(
    state: &mut TrackerState,
    buffer: &NodeReadGuard<'_, KeyPosition>,
    sample: KeyEvent,
    pending: &mut Vec<NotificationKind>,
) {
    match state.current_state {
        KeyState::Unknown => {
            if sample.position >= FIRST_MAX_THRESHOLD {
                let start = find_key_press_start(buffer, sample);
                state.start = Some(start);
                state.current_max = Some(sample);
                state.current_min = Some(start);
                change_state(state, KeyState::PartialPressAwaitingMax, pending);
            }
        }
        KeyState::PartialPressAwaitingMax => {
            if state
                .current_max
                .map(|m| sample.position > m.position)
                .unwrap_or(true)
            {
                state.current_max = Some(sample);
            }
            if sample.position >= PRESS_POSITION {
                change_state(state, KeyState::PressInProgress, pending);
            } else if let Some(max) = state.current_max {
                // A max is established once the key clearly comes back down
                // from it while still in partial-press territory.
                if max.position >= FIRST_MAX_THRESHOLD
                    && sample.position < max.position - MIN_MAX_SPACING_THRESHOLD
                {
                    state.last_min_max_position = max.position;
                    state.current_min = Some(sample);
                    pending.push(NotificationKind::NewMaximum);
                    change_state(state, KeyState::PartialPressFoundMax, pending);
                }
            }
        }
        KeyState::PartialPressFoundMax => {
            if state
                .current_min
                .map(|m| sample.position < m.position)
                .unwrap_or(true)
            {
                state.current_min = Some(sample);
            }
            if sample.position >= PRESS_POSITION {
                change_state(state, KeyState::PressInProgress, pending);
            } else if let Some(min) = state.current_min {
                if sample.position > min.position + MIN_MAX_SPACING_THRESHOLD {
                    state.last_min_max_position = min.position;
                    state.current_max = Some(sample);
                    pending.push(NotificationKind::NewMinimum);
                    change_state(state, KeyState::PartialPressAwaitingMax, pending);
                }
            }
        }
        KeyState::PressInProgress => {
            if state
                .current_max
                .map(|m| sample.position > m.position)
                .unwrap_or(true)
            {
                state.current_max = Some(sample);
            }
            // Down once the key holds above the press region and stops moving
            let velocity = recent_average_velocity(buffer, sample.index);
            if sample.position >= PRESS_POSITION - PRESS_HYSTERESIS
                && velocity.map(|v| v.abs() < START_VELOCITY_THRESHOLD).unwrap_or(false)
            {
                state.press = Some(sample);
                change_state(state, KeyState::Down, pending);
            }
        }
        KeyState::Down => {
            if sample.position < PRESS_POSITION - PRESS_HYSTERESIS {
                let release = find_key_release_start(buffer, sample);
                state.release_begin = Some(release);
                state.release_waiting_for_escapement_cross = true;
                change_state(state, KeyState::ReleaseInProgress, pending);
            }
        }
        KeyState::ReleaseInProgress => {
            if sample.position < RELEASE_FINISH_POSITION {
                state.release_end = Some(sample);
                change_state(state, KeyState::ReleaseFinished, pending);
            }
        }
        KeyState::ReleaseFinished => {}
    }
}

fn change_state(state: &mut TrackerState, new_state: KeyState, pending: &mut Vec<NotificationKind>) {
    debug!(from = ?state.current_state, to = ?new_state, "key state change");
    state.current_state = new_state;
    pending.push(NotificationKind::StateChange);
}

/// Work backwards in the position buffer to pin the true start of a press:
/// the earliest point of (near-)monotonic ascent within a bounded lookback.
fn find_key_press_start(buffer: &NodeReadGuard<'_, KeyPosition>, from: KeyEvent) -> KeyEvent {
    let begin = buffer.begin_index();
    let mut best = from;
    let mut index = from.index;
    let mut steps = 0usize;
    let mut plateau = 0usize;

    while index > begin && steps < SAMPLES_TO_SEARCH_FOR_START_LOCATION {
        let Some(&prev) = buffer.get(index - 1) else {
            break;
        };
        if prev <= best.position {
            if let Some(timestamp) = buffer.timestamp_at(index - 1) {
                best = KeyEvent {
                    index: index - 1,
                    position: prev,
                    timestamp,
                };
            }
            plateau = 0;
        } else {
            // Allow a bounded wiggle past the apparent start
            plateau += 1;
            if plateau > SAMPLES_TO_SEARCH_BEYOND_START_LOCATION {
                break;
            }
        }
        index -= 1;
        steps += 1;
    }
    best
}

/// Find where the release began: the most recent downward departure from the
/// held (down) region within a bounded lookback.
fn find_key_release_start(buffer: &NodeReadGuard<'_, KeyPosition>, from: KeyEvent) -> KeyEvent {
    let threshold = PRESS_POSITION - PRESS_HYSTERESIS;
    let limit = from.index.saturating_sub(SAMPLES_TO_SEARCH_FOR_RELEASE_LOCATION);
    let begin = buffer.begin_index().max(limit);
    let mut index = from.index;
    while index > begin {
        let Some(&pos) = buffer.get(index - 1) else {
            break;
        };
        if pos >= threshold {
            if let Some(timestamp) = buffer.timestamp_at(index - 1) {
                return KeyEvent {
                    index: index - 1,
                    position: pos,
                    timestamp,
                };
            }
        }
        index -= 1;
    }
    from
}

/// Most recent index where the position crossed `threshold` (upward when
/// `rising`, downward otherwise), scanning back from `end`.
fn find_most_recent_crossing(
    buffer: &NodeReadGuard<'_, KeyPosition>,
    threshold: KeyPosition,
    rising: bool,
    end: usize,
) -> Option<usize> {
    let begin = buffer.begin_index();
    let mut index = end.min(buffer.end_index());
    while index > begin + 1 {
        index -= 1;
        let (&here, &before) = (buffer.get(index)?, buffer.get(index - 1)?);
        let crossed = if rising {
            before < threshold && here >= threshold
        } else {
            before > threshold && here <= threshold
        };
        if crossed {
            return Some(index);
        }
    }
    None
}

/// Average velocity over `samples` first differences ending at `index`.
fn velocity_around(
    buffer: &NodeReadGuard<'_, KeyPosition>,
    index: usize,
    samples: usize,
) -> Option<(Timestamp, KeyVelocity)> {
    let span = samples.max(1);
    let last = (index + span / 2).min(buffer.end_index() - 1);
    let first = last.checked_sub(span)?;
    if first < buffer.begin_index() {
        return None;
    }
    let p0 = *buffer.get(first)?;
    let p1 = *buffer.get(last)?;
    let t0 = buffer.timestamp_at(first)?;
    let t1 = buffer.timestamp_at(last)?;
    let dt = delta_secs(t1.delta_since(t0));
    if dt <= 0.0 {
        return None;
    }
    Some((buffer.timestamp_at(index)?, (p1 - p0) / dt))
}

fn recent_average_velocity(
    buffer: &NodeReadGuard<'_, KeyPosition>,
    index: usize,
) -> Option<KeyVelocity> {
    let first = index.checked_sub(SAMPLES_TO_AVERAGE_FOR_START_VELOCITY)?;
    if first < buffer.begin_index() {
        return None;
    }
    let p0 = *buffer.get(first)?;
    let p1 = *buffer.get(index)?;
    let t0 = buffer.timestamp_at(first)?;
    let t1 = buffer.timestamp_at(index)?;
    let dt = delta_secs(t1.delta_since(t0));
    if dt <= 0.0 {
        return None;
    }
    Some((p1 - p0) / dt)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed a synthetic trace sampled at 1 kHz.
    fn feed(buffer: &Arc<Node<KeyPosition>>, samples: &[KeyPosition], start_ms: u64) {
        for (i, &pos) in samples.iter().enumerate() {
            buffer.insert(pos, Timestamp::from_millis(start_ms + i as u64));
        }
    }

    fn ramp(from: KeyPosition, to: KeyPosition, n: usize) -> Vec<KeyPosition> {
        (0..n)
            .map(|i| from + (to - from) * i as KeyPosition / (n - 1) as KeyPosition)
            .collect()
    }

    fn tracked_states(tracker: &KeyPositionTracker) -> Vec<KeyState> {
        let node = tracker.node();
        let guard = node.read();
        let mut states = Vec::new();
        for index in guard.begin_index()..guard.end_index() {
            let n = guard.get(index).unwrap();
            if n.kind == NotificationKind::StateChange {
                states.push(n.state);
            }
        }
        states
    }

    #[test]
    fn full_press_emits_states_in_order_without_regression() {
        let buffer: Arc<Node<KeyPosition>> = Node::with_capacity(1024);
        let tracker = KeyPositionTracker::new(64, buffer.clone());
        tracker.engage();

        // Rest, fast 50 ms press to full depth, hold, release to rest
        feed(&buffer, &vec![0.0; 20], 0);
        feed(&buffer, &ramp(0.0, 1.0, 50), 20);
        feed(&buffer, &vec![1.0; 30], 70);
        feed(&buffer, &ramp(1.0, 0.0, 60), 100);
        feed(&buffer, &vec![0.0; 10], 160);

        let states = tracked_states(&tracker);
        let expected = [
            KeyState::PartialPressAwaitingMax,
            KeyState::PressInProgress,
            KeyState::Down,
            KeyState::ReleaseInProgress,
            KeyState::ReleaseFinished,
        ];
        assert_eq!(states, expected);
    }

    #[test]
    fn press_velocity_positive_and_release_velocity_negative() {
        let buffer: Arc<Node<KeyPosition>> = Node::with_capacity(1024);
        let tracker = KeyPositionTracker::new(64, buffer.clone());
        tracker.engage();

        feed(&buffer, &vec![0.0; 10], 0);
        feed(&buffer, &ramp(0.0, 1.0, 50), 10);
        feed(&buffer, &vec![1.0; 20], 60);

        let (_, press_velocity) = tracker.press_velocity().expect("press velocity");
        assert!(press_velocity > 0.0, "got {press_velocity}");
        assert!(tracker.available_features() & FEATURE_PRESS_VELOCITY != 0);

        feed(&buffer, &ramp(1.0, 0.0, 80), 80);
        feed(&buffer, &vec![0.0; 10], 160);
        let (_, release_velocity) = tracker.release_velocity().expect("release velocity");
        assert!(release_velocity < 0.0, "got {release_velocity}");
        assert!(tracker.available_features() & FEATURE_RELEASE_VELOCITY != 0);
    }

    #[test]
    fn press_velocity_feature_announced_promptly_after_escapement() {
        let buffer: Arc<Node<KeyPosition>> = Node::with_capacity(1024);
        let tracker = KeyPositionTracker::new(64, buffer.clone());
        tracker.engage();

        let trace = ramp(0.0, 1.0, 50);
        let crossing = trace
            .iter()
            .position(|&p| p >= DEFAULT_POSITION_FOR_PRESS_VELOCITY)
            .unwrap();

        feed(&buffer, &trace[..=crossing].to_vec(), 0);
        assert_eq!(tracker.available_features() & FEATURE_PRESS_VELOCITY, 0);

        // One more sample past the escapement makes the feature available
        for extra in 0..SAMPLES_NEEDED_FOR_PRESS_VELOCITY_AFTER_ESCAPEMENT {
            buffer.insert(
                trace[crossing + 1 + extra],
                Timestamp::from_millis((crossing + 1 + extra) as u64),
            );
        }
        assert!(tracker.available_features() & FEATURE_PRESS_VELOCITY != 0);
    }

    #[test]
    fn partial_press_pattern_finds_max_then_min() {
        let buffer: Arc<Node<KeyPosition>> = Node::with_capacity(1024);
        let tracker = KeyPositionTracker::new(64, buffer.clone());
        tracker.engage();

        feed(&buffer, &vec![0.0; 5], 0);
        feed(&buffer, &ramp(0.0, 0.4, 30), 5); // up to a partial press
        feed(&buffer, &ramp(0.4, 0.2, 20), 35); // back down
        feed(&buffer, &ramp(0.2, 0.5, 20), 55); // up again

        let states = tracked_states(&tracker);
        assert_eq!(
            states,
            vec![
                KeyState::PartialPressAwaitingMax,
                KeyState::PartialPressFoundMax,
                KeyState::PartialPressAwaitingMax,
            ]
        );
        assert!(tracker.current_max().is_some());
        assert!(tracker.current_min().is_some());
    }

    #[test]
    fn noisy_press_still_orders_states_correctly() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(0x5EED);

        let buffer: Arc<Node<KeyPosition>> = Node::with_capacity(1024);
        let tracker = KeyPositionTracker::new(64, buffer.clone());
        tracker.engage();

        let mut trace: Vec<KeyPosition> = vec![0.0; 20];
        trace.extend(ramp(0.0, 1.0, 60));
        trace.extend(vec![1.0; 30]);
        trace.extend(ramp(1.0, 0.0, 60));
        trace.extend(vec![0.0; 10]);
        for sample in trace.iter_mut() {
            *sample = (*sample + rng.gen_range(-0.004..0.004)).clamp(-0.01, 1.01);
        }
        feed(&buffer, &trace, 0);

        // Sensor noise may add partial-press alternation early on, but the
        // press sequence itself must appear exactly once, in order, with no
        // regression after the press begins
        let states = tracked_states(&tracker);
        let index_of = |wanted: KeyState| {
            states
                .iter()
                .position(|s| *s == wanted)
                .unwrap_or_else(|| panic!("missing state {wanted:?} in {states:?}"))
        };
        let press = index_of(KeyState::PressInProgress);
        let down = index_of(KeyState::Down);
        let release = index_of(KeyState::ReleaseInProgress);
        let finished = index_of(KeyState::ReleaseFinished);
        assert!(press < down && down < release && release < finished);
        assert!(
            states[press..].windows(2).all(|pair| pair[0] <= pair[1]),
            "state regression after press: {states:?}"
        );
        assert_eq!(states.last(), Some(&KeyState::ReleaseFinished));
    }

    #[test]
    fn disengage_clears_all_state() {
        let buffer: Arc<Node<KeyPosition>> = Node::with_capacity(1024);
        let tracker = KeyPositionTracker::new(64, buffer.clone());
        tracker.engage();

        feed(&buffer, &ramp(0.0, 1.0, 50), 0);
        assert_ne!(tracker.current_state(), KeyState::Unknown);

        tracker.disengage();
        assert_eq!(tracker.current_state(), KeyState::Unknown);
        assert!(!tracker.engaged());
        assert!(tracker.node().is_empty());

        // No further updates while disengaged
        feed(&buffer, &ramp(0.0, 1.0, 50), 100);
        assert_eq!(tracker.current_state(), KeyState::Unknown);
    }

    #[test]
    fn percussive_strike_scores_higher_than_smooth_press() {
        let press_buffer: Arc<Node<KeyPosition>> = Node::with_capacity(1024);
        let press_tracker = KeyPositionTracker::new(64, press_buffer.clone());
        press_tracker.engage();
        feed(&press_buffer, &vec![0.0; 5], 0);
        feed(&press_buffer, &ramp(0.0, 1.0, 200), 5); // slow, smooth press
        feed(&press_buffer, &vec![1.0; 10], 205);

        let strike_buffer: Arc<Node<KeyPosition>> = Node::with_capacity(1024);
        let strike_tracker = KeyPositionTracker::new(64, strike_buffer.clone());
        strike_tracker.engage();
        feed(&strike_buffer, &vec![0.0; 5], 0);
        // Sharp spike at the start, then settling into the press
        feed(&strike_buffer, &ramp(0.0, 0.35, 8), 5);
        feed(&strike_buffer, &ramp(0.35, 0.3, 6), 13);
        feed(&strike_buffer, &ramp(0.3, 1.0, 40), 19);
        feed(&strike_buffer, &vec![1.0; 10], 59);

        let smooth = press_tracker.press_percussiveness().expect("smooth");
        let struck = strike_tracker.press_percussiveness().expect("struck");
        assert!(
            struck.percussiveness > smooth.percussiveness,
            "struck {} <= smooth {}",
            struck.percussiveness,
            smooth.percussiveness
        );
        assert!(struck.velocity_spike_maximum.velocity > 0.0);
    }
}
