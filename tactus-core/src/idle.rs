// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Idle/active classification of a key from recent position statistics
//!
//! Active keys get the full position tracker run over their samples, so
//! noticing that a key is sitting still saves most of the per-key work. The
//! detector watches a running sum of the last few samples (via an
//! [`Accumulator`]) and the recent mean-absolute deviation, with hysteresis
//! in both directions: a resting key needs sustained elevation of the mean
//! to wake, and an active key needs a run of consecutive flat samples to go
//! back to sleep.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::filter::Accumulator;
use crate::node::Node;
use crate::trigger::{SourceId, TriggerListener};
use crate::types::{KeyPosition, Timestamp};

/// Number of samples in the idle-detection window.
pub const IDLE_NUM_SAMPLES: usize = 10;

/// Position below which a key is assumed to be staying idle.
pub const DEFAULT_IDLE_POSITION_THRESHOLD: KeyPosition = 0.05;

/// Mean-absolute-deviation below which a sample run counts as flat.
pub const DEFAULT_IDLE_ACTIVITY_THRESHOLD: KeyPosition = 0.02;

/// Consecutive flat samples needed to return to idle.
pub const DEFAULT_IDLE_COUNTER_THRESHOLD: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    Idle,
    Active,
    Unknown,
}

struct DetectorState {
    idle_state: IdleState,
    frames_without_activity: usize,
    idle_position_threshold: KeyPosition,
    activity_threshold: KeyPosition,
    counter_threshold: usize,
}

/// Classifies a key as idle or active from its continuous position buffer.
///
/// State transitions insert a sample into the detector's own node so
/// listeners observe them with timestamps.
pub struct KeyIdleDetector {
    output: Arc<Node<IdleState>>,
    key_buffer: Arc<Node<KeyPosition>>,
    accumulator: Arc<Accumulator>,
    state: Mutex<DetectorState>,
}

impl KeyIdleDetector {
    pub fn new(
        capacity: usize,
        key_buffer: Arc<Node<KeyPosition>>,
        position_threshold: KeyPosition,
        activity_threshold: KeyPosition,
        counter_threshold: usize,
    ) -> Arc<Self> {
        let accumulator = Accumulator::new(IDLE_NUM_SAMPLES + 1, IDLE_NUM_SAMPLES, key_buffer.clone());
        let detector = Arc::new(KeyIdleDetector {
            output: Node::with_capacity(capacity),
            key_buffer,
            accumulator: accumulator.clone(),
            state: Mutex::new(DetectorState {
                idle_state: IdleState::Unknown,
                frames_without_activity: 0,
                idle_position_threshold: position_threshold,
                activity_threshold,
                counter_threshold,
            }),
        });
        accumulator
            .node()
            .subscribe(&(detector.clone() as Arc<dyn TriggerListener>));
        detector
    }

    /// Node carrying idle/active transitions.
    pub fn node(&self) -> &Arc<Node<IdleState>> {
        &self.output
    }

    pub fn idle_state(&self) -> IdleState {
        self.state.lock().unwrap().idle_state
    }

    pub fn activity_threshold(&self) -> KeyPosition {
        self.state.lock().unwrap().activity_threshold
    }

    pub fn set_activity_threshold(&self, threshold: KeyPosition) {
        self.state.lock().unwrap().activity_threshold = threshold;
    }

    pub fn position_threshold(&self) -> KeyPosition {
        self.state.lock().unwrap().idle_position_threshold
    }

    pub fn set_position_threshold(&self, threshold: KeyPosition) {
        self.state.lock().unwrap().idle_position_threshold = threshold;
    }

    /// Clear history and return to the unknown state.
    pub fn clear(&self) {
        self.output.clear();
        self.accumulator.clear();
        let mut state = self.state.lock().unwrap();
        state.idle_state = IdleState::Unknown;
        state.frames_without_activity = 0;
    }

    fn mean_absolute_deviation(&self, mean: KeyPosition) -> KeyPosition {
        let buffer = self.key_buffer.read();
        let end = buffer.end_index();
        let start = end.saturating_sub(IDLE_NUM_SAMPLES).max(buffer.begin_index());
        let mut deviation = 0.0;
        let mut count = 0usize;
        for index in start..end {
            if let Some(pos) = buffer.get(index) {
                deviation += (pos - mean).abs();
                count += 1;
            }
        }
        if count == 0 {
            0.0
        } else {
            deviation / count as KeyPosition
        }
    }
}

impl TriggerListener for KeyIdleDetector {
    fn trigger_received(&self, source: SourceId, timestamp: Timestamp) {
        if source != self.accumulator.node().source_id() {
            return;
        }
        let Some(current_position) = self.key_buffer.latest() else {
            return;
        };
        let Some((count, sum)) = self.accumulator.latest() else {
            return;
        };
        if count < IDLE_NUM_SAMPLES {
            return;
        }
        let average = sum / count as KeyPosition;

        let transition = {
            let mut state = self.state.lock().unwrap();
            match state.idle_state {
                IdleState::Idle => {
                    // Stay idle while the key sits near rest
                    if current_position < state.idle_position_threshold {
                        None
                    } else if average < state.idle_position_threshold * 2.0 {
                        None
                    } else {
                        state.idle_state = IdleState::Active;
                        Some(IdleState::Active)
                    }
                }
                IdleState::Active | IdleState::Unknown => {
                    if average >= state.idle_position_threshold * 2.0 {
                        state.frames_without_activity = 0;
                        None
                    } else {
                        let deviation = self.mean_absolute_deviation(average);
                        if deviation < state.activity_threshold {
                            state.frames_without_activity += 1;
                            if state.frames_without_activity >= state.counter_threshold {
                                state.idle_state = IdleState::Idle;
                                Some(IdleState::Idle)
                            } else {
                                None
                            }
                        } else {
                            state.frames_without_activity = 0;
                            None
                        }
                    }
                }
            }
        };

        if let Some(new_state) = transition {
            debug!(?new_state, at = timestamp.micros(), "idle detector transition");
            self.output.insert(new_state, timestamp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector_with_buffer() -> (Arc<Node<KeyPosition>>, Arc<KeyIdleDetector>) {
        let buffer: Arc<Node<KeyPosition>> = Node::with_capacity(256);
        let detector = KeyIdleDetector::new(
            16,
            buffer.clone(),
            DEFAULT_IDLE_POSITION_THRESHOLD,
            DEFAULT_IDLE_ACTIVITY_THRESHOLD,
            DEFAULT_IDLE_COUNTER_THRESHOLD,
        );
        (buffer, detector)
    }

    #[test]
    fn flat_key_latches_idle() {
        let (buffer, detector) = detector_with_buffer();
        for i in 0..40u64 {
            buffer.insert(0.0, Timestamp::from_millis(i));
        }
        assert_eq!(detector.idle_state(), IdleState::Idle);
        assert_eq!(detector.node().latest(), Some(IdleState::Idle));
    }

    #[test]
    fn sustained_press_goes_active() {
        let (buffer, detector) = detector_with_buffer();
        for i in 0..40u64 {
            buffer.insert(0.0, Timestamp::from_millis(i));
        }
        for i in 40..60u64 {
            buffer.insert(0.5, Timestamp::from_millis(i));
        }
        assert_eq!(detector.idle_state(), IdleState::Active);
    }

    #[test]
    fn returning_to_rest_requires_hysteresis() {
        let (buffer, detector) = detector_with_buffer();
        for i in 0..40u64 {
            buffer.insert(0.0, Timestamp::from_millis(i));
        }
        for i in 40..60u64 {
            buffer.insert(0.5, Timestamp::from_millis(i));
        }
        assert_eq!(detector.idle_state(), IdleState::Active);

        // A couple of flat samples near rest are not enough...
        for i in 60..65u64 {
            buffer.insert(0.0, Timestamp::from_millis(i));
        }
        assert_eq!(detector.idle_state(), IdleState::Active);

        // ...but a sustained flat run is
        for i in 65..140u64 {
            buffer.insert(0.0, Timestamp::from_millis(i));
        }
        assert_eq!(detector.idle_state(), IdleState::Idle);
    }
}
