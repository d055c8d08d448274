// Copyright 2025 Amiable
// SPDX-License-Identifier: MIT

//! Derived-signal nodes: running sums and IIR filters
//!
//! Both types in this module are nodes that compute their output from an
//! upstream [`Node`]. The [`Accumulator`] keeps a running sum of the last N
//! input samples without looking at timestamps (cheap enough for per-sample
//! idle detection). The [`IirFilterNode`] runs an Nth-order IIR filter over
//! upstream data, either automatically on every new sample or on demand with
//! bounded catch-up.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};

use crate::node::Node;
use crate::trigger::{SourceId, TriggerListener};
use crate::types::Timestamp;

/// Running sum of the last N points of a signal.
///
/// The output pairs are `(effective_count, sum)`: during startup, before N
/// samples have arrived, `effective_count` reports how many samples are
/// actually included, so consumers can handle the transient without
/// timestamps.
pub struct Accumulator {
    output: Arc<Node<(usize, f64)>>,
    input: Arc<Node<f64>>,
    window: usize,
    samples: Mutex<VecDeque<f64>>,
}

impl Accumulator {
    /// Create an accumulator over `input` summing the last `window` samples,
    /// with `capacity` output history. Subscribes itself to the input.
    pub fn new(capacity: usize, window: usize, input: Arc<Node<f64>>) -> Arc<Self> {
        let acc = Arc::new(Accumulator {
            output: Node::with_capacity(capacity),
            input: input.clone(),
            window: window.max(1),
            samples: Mutex::new(VecDeque::with_capacity(window + 1)),
        });
        input.subscribe(&(acc.clone() as Arc<dyn TriggerListener>));
        acc
    }

    pub fn node(&self) -> &Arc<Node<(usize, f64)>> {
        &self.output
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn latest(&self) -> Option<(usize, f64)> {
        self.output.latest()
    }

    pub fn clear(&self) {
        self.output.clear();
        self.samples.lock().unwrap().clear();
    }
}

impl TriggerListener for Accumulator {
    fn trigger_received(&self, source: SourceId, timestamp: Timestamp) {
        if source != self.input.source_id() {
            return;
        }
        let Some(sample) = self.input.latest() else {
            return;
        };

        let pair = {
            let mut samples = self.samples.lock().unwrap();
            samples.push_back(sample);
            let (prev_count, prev_sum) = self.output.latest().unwrap_or((0, 0.0));
            if samples.len() > self.window {
                let oldest = samples.pop_front().unwrap_or(0.0);
                (prev_count.min(self.window), prev_sum + sample - oldest)
            } else {
                (prev_count + 1, prev_sum + sample)
            }
        };
        self.output.insert(pair, timestamp);
    }
}

struct IirState {
    b: Vec<f64>,
    a: Vec<f64>,
    input_history: VecDeque<f64>,
    output_history: VecDeque<f64>,
    last_input_index: usize,
    auto_calculate: bool,
}

impl IirState {
    fn clear_history(&mut self) {
        self.input_history.clear();
        self.output_history.clear();
        for _ in 0..self.b.len() {
            self.input_history.push_back(0.0);
        }
        for _ in 0..self.a.len() {
            self.output_history.push_back(0.0);
        }
    }

    /// One step of the difference equation
    /// `y = sum(b_i * x[n-i]) - sum(a_j * y[n-j])`.
    fn step(&mut self, sample: f64) -> f64 {
        if self.b.is_empty() {
            // Pass through when no coefficients present
            return sample;
        }
        let mut result = self.b[0] * sample;
        for (coeff, x) in self.b.iter().skip(1).zip(self.input_history.iter().rev()) {
            result += coeff * x;
        }
        for (coeff, y) in self.a.iter().zip(self.output_history.iter().rev()) {
            result -= coeff * y;
        }
        self.input_history.push_back(sample);
        if self.input_history.len() > self.b.len() {
            self.input_history.pop_front();
        }
        self.output_history.push_back(result);
        if self.output_history.len() > self.a.len().max(1) {
            self.output_history.pop_front();
        }
        result
    }
}

/// IIR filter over incoming node data.
///
/// Timestamps are not consulted, so the input is assumed regularly sampled.
/// Two operating modes:
/// - auto: subscribe to the input and filter each new sample as it arrives;
/// - on demand: [`IirFilterNode::calculate`] catches up from the last
///   processed input index, restarting from zeroed history if more than the
///   requested lookback has elapsed.
pub struct IirFilterNode {
    output: Arc<Node<f64>>,
    input: Arc<Node<f64>>,
    state: Mutex<IirState>,
}

impl IirFilterNode {
    pub fn new(capacity: usize, input: Arc<Node<f64>>) -> Arc<Self> {
        Arc::new(IirFilterNode {
            output: Node::with_capacity(capacity),
            input,
            state: Mutex::new(IirState {
                b: Vec::new(),
                a: Vec::new(),
                input_history: VecDeque::new(),
                output_history: VecDeque::new(),
                last_input_index: 0,
                auto_calculate: false,
            }),
        })
    }

    /// The filtered output node.
    pub fn node(&self) -> &Arc<Node<f64>> {
        &self.output
    }

    /// Set feed-forward (`b`) and feed-back (`a`) coefficients. History
    /// buffers are resized to the coefficient lengths; `clear_history`
    /// zeroes them (always done when lengths change).
    pub fn set_coefficients(&self, b: Vec<f64>, a: Vec<f64>, clear_history: bool) {
        if b.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let lengths_changed = b.len() != state.b.len() || a.len() != state.a.len();
        state.b = b;
        state.a = a;
        if clear_history || lengths_changed {
            state.clear_history();
        }
    }

    /// Switch automatic per-sample filtering on or off. Switching on first
    /// brings the output up to date (bounded by `max_lookback` samples) and
    /// then subscribes to the input.
    pub fn set_auto_calculate(self: &Arc<Self>, auto: bool, max_lookback: Option<usize>) {
        let was_auto = {
            let state = self.state.lock().unwrap();
            state.auto_calculate
        };
        if was_auto && !auto {
            let weak = Arc::downgrade(&(self.clone() as Arc<dyn TriggerListener>));
            self.input.unsubscribe(&weak);
        } else if !was_auto && auto {
            self.calculate(max_lookback);
            self.input.subscribe(&(self.clone() as Arc<dyn TriggerListener>));
        }
        self.state.lock().unwrap().auto_calculate = auto;
    }

    /// Bring the output up to date with any unseen input, returning the most
    /// recent output value. If more than `max_lookback` samples have elapsed
    /// since the last calculation, history is zeroed and catch-up restarts
    /// `max_lookback` samples before the present.
    pub fn calculate(&self, max_lookback: Option<usize>) -> Option<f64> {
        loop {
            let (sample, timestamp) = {
                let mut state = self.state.lock().unwrap();
                let input = self.input.read();
                let begin = input.begin_index();
                let end = input.end_index();

                if let Some(lookback) = max_lookback {
                    if end > 0 && state.last_input_index + lookback + 1 < end {
                        state.clear_history();
                        state.last_input_index = (end - 1 - lookback).max(begin);
                    }
                }
                if state.last_input_index < begin {
                    // More samples gone by than are now available
                    state.clear_history();
                    state.last_input_index = begin;
                }
                if state.last_input_index >= end {
                    break;
                }
                let index = state.last_input_index;
                let sample = *input.get(index)?;
                let timestamp = input.timestamp_at(index)?;
                state.last_input_index += 1;
                let result = state.step(sample);
                (result, timestamp)
            };
            self.output.insert(sample, timestamp);
        }
        self.output.latest()
    }

    /// Reset output and history.
    pub fn clear(&self) {
        self.output.clear();
        let mut state = self.state.lock().unwrap();
        state.clear_history();
        state.last_input_index = 0;
    }
}

impl TriggerListener for IirFilterNode {
    fn trigger_received(&self, source: SourceId, timestamp: Timestamp) {
        if source != self.input.source_id() {
            return;
        }
        let result = {
            let mut state = self.state.lock().unwrap();
            if !state.auto_calculate {
                return;
            }
            let Some(sample) = self.input.latest() else {
                return;
            };
            state.last_input_index = self.input.end_index();
            state.step(sample)
        };
        self.output.insert(result, timestamp);
    }
}

// Filter design helpers. Coefficients follow the bilinear-transform biquad
// forms with omega = tan(pi * fc / fs); the returned vectors are (b, a) with
// a[0] implied as 1.

pub fn design_first_order_lowpass(cutoff: f64, sample_rate: f64) -> (Vec<f64>, Vec<f64>) {
    let omega = (PI * cutoff / sample_rate).tan();
    let n = 1.0 / (1.0 + omega);
    (vec![omega * n, omega * n], vec![(omega - 1.0) * n])
}

pub fn design_first_order_highpass(cutoff: f64, sample_rate: f64) -> (Vec<f64>, Vec<f64>) {
    let omega = (PI * cutoff / sample_rate).tan();
    let n = 1.0 / (1.0 + omega);
    (vec![n, -n], vec![(omega - 1.0) * n])
}

pub fn design_second_order_lowpass(cutoff: f64, q: f64, sample_rate: f64) -> (Vec<f64>, Vec<f64>) {
    let omega = (PI * cutoff / sample_rate).tan();
    let n = 1.0 / (omega * omega + omega / q + 1.0);
    let b0 = n * omega * omega;
    (
        vec![b0, 2.0 * b0, b0],
        vec![
            2.0 * n * (omega * omega - 1.0),
            n * (omega * omega - omega / q + 1.0),
        ],
    )
}

pub fn design_second_order_highpass(cutoff: f64, q: f64, sample_rate: f64) -> (Vec<f64>, Vec<f64>) {
    let omega = (PI * cutoff / sample_rate).tan();
    let n = 1.0 / (omega * omega + omega / q + 1.0);
    (
        vec![n, -2.0 * n, n],
        vec![
            2.0 * n * (omega * omega - 1.0),
            n * (omega * omega - omega / q + 1.0),
        ],
    )
}

pub fn design_second_order_bandpass(cutoff: f64, q: f64, sample_rate: f64) -> (Vec<f64>, Vec<f64>) {
    let omega = (PI * cutoff / sample_rate).tan();
    let n = 1.0 / (omega * omega + omega / q + 1.0);
    let b0 = n * omega / q;
    (
        vec![b0, 0.0, -b0],
        vec![
            2.0 * n * (omega * omega - 1.0),
            n * (omega * omega - omega / q + 1.0),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_reports_effective_count_and_sum() {
        let input: Arc<Node<f64>> = Node::with_capacity(32);
        let acc = Accumulator::new(32, 3, input.clone());

        input.insert(1.0, Timestamp::from_millis(0));
        assert_eq!(acc.latest(), Some((1, 1.0)));
        input.insert(2.0, Timestamp::from_millis(1));
        assert_eq!(acc.latest(), Some((2, 3.0)));
        input.insert(3.0, Timestamp::from_millis(2));
        assert_eq!(acc.latest(), Some((3, 6.0)));
        // Window full: the oldest sample drops out of the sum
        input.insert(4.0, Timestamp::from_millis(3));
        assert_eq!(acc.latest(), Some((3, 9.0)));
    }

    #[test]
    fn lowpass_design_has_unity_dc_gain() {
        let (b, a) = design_second_order_lowpass(15.0, 0.707, 1000.0);
        let gain: f64 = b.iter().sum::<f64>() / (1.0 + a.iter().sum::<f64>());
        assert!((gain - 1.0).abs() < 1e-9, "DC gain {gain}");
    }

    #[test]
    fn bandpass_design_rejects_dc() {
        let (b, _a) = design_second_order_bandpass(9.0, 0.707, 200.0);
        // b0 + b1 + b2 == 0 means zero response at DC
        assert!(b.iter().sum::<f64>().abs() < 1e-12);
    }

    #[test]
    fn filter_without_coefficients_passes_through() {
        let input: Arc<Node<f64>> = Node::with_capacity(16);
        let filter = IirFilterNode::new(16, input.clone());
        filter.set_auto_calculate(true, None);

        input.insert(0.5, Timestamp::from_millis(0));
        assert_eq!(filter.node().latest(), Some(0.5));
    }

    #[test]
    fn on_demand_calculate_catches_up() {
        let input: Arc<Node<f64>> = Node::with_capacity(64);
        let filter = IirFilterNode::new(64, input.clone());
        let (b, a) = design_first_order_lowpass(20.0, 1000.0);
        filter.set_coefficients(b, a, true);

        for i in 0..10u64 {
            input.insert(1.0, Timestamp::from_millis(i));
        }
        let out = filter.calculate(None).unwrap();
        assert_eq!(filter.node().len(), 10);
        assert!(out > 0.0 && out <= 1.0 + 1e-9);

        // A long gap with a bounded lookback restarts from fresh history
        for i in 10..200u64 {
            input.insert(0.0, Timestamp::from_millis(i));
        }
        filter.calculate(Some(5));
        // Only the lookback window was processed after the reset
        assert!(filter.node().len() <= 10 + 6);
    }
}
