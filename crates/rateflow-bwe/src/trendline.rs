//! Delay gradient estimation.
//!
//! Accumulates inter-group one-way delay variations, smooths them, and fits
//! a least-squares line over a bounded history. The slope of that line is
//! the delay trend: positive means queuing delay is building (congestion),
//! negative means queues are draining. The scaled trend is handed to the
//! embedded [`AdaptiveThresholdDetector`] for classification.

use std::collections::VecDeque;

use tracing::trace;

use crate::{
    config::{DetectorOptions, TrendlineOptions},
    detector::AdaptiveThresholdDetector,
    types::CongestionState,
};

/// Cap on the delta counter so the modified-trend factor saturates.
const DELTA_COUNTER_MAX: u32 = 1000;

/// Deltas required before any non-Normal state is possible. Keeps a single
/// noisy sample from triggering a false overuse signal.
const MIN_NUM_DELTAS: u32 = 2;

#[derive(Clone, Debug)]
pub struct DelayGradientEstimator {
    window_size: usize,
    smoothing_coef: f64,
    threshold_gain: f64,
    detector: AdaptiveThresholdDetector,
    num_of_deltas: u32,
    first_arrival_time_ms: Option<i64>,
    accumulated_delay_ms: f64,
    smoothed_delay_ms: f64,
    /// `(arrival_time - first_arrival_time, smoothed_delay)` pairs, oldest
    /// first. Bounded by `window_size`.
    history: VecDeque<(f64, f64)>,
    prev_trend: f64,
    prev_modified_trend: f64,
}

impl DelayGradientEstimator {
    pub fn new(opts: TrendlineOptions, detector_opts: DetectorOptions) -> Self {
        Self {
            window_size: opts.window_size.max(2),
            smoothing_coef: opts.smoothing_coef.clamp(0.0, 1.0),
            threshold_gain: opts.threshold_gain,
            detector: AdaptiveThresholdDetector::new(detector_opts),
            num_of_deltas: 0,
            first_arrival_time_ms: None,
            accumulated_delay_ms: 0.0,
            smoothed_delay_ms: 0.0,
            history: VecDeque::with_capacity(opts.window_size.max(2)),
            prev_trend: 0.0,
            prev_modified_trend: 0.0,
        }
    }

    /// Feed the deltas between two consecutive packet groups.
    ///
    /// When `calculated_deltas` is false (skipped or reordered group) the
    /// regression is left untouched and the last known state stands.
    pub fn update(
        &mut self,
        recv_delta_ms: f64,
        send_delta_ms: f64,
        _send_time_ms: i64,
        arrival_time_ms: i64,
        calculated_deltas: bool,
    ) {
        if !calculated_deltas {
            return;
        }
        let delta_ms = recv_delta_ms - send_delta_ms;
        self.num_of_deltas = (self.num_of_deltas + 1).min(DELTA_COUNTER_MAX);
        let first_arrival = *self.first_arrival_time_ms.get_or_insert(arrival_time_ms);

        self.accumulated_delay_ms += delta_ms;
        self.smoothed_delay_ms = self.smoothing_coef * self.smoothed_delay_ms
            + (1.0 - self.smoothing_coef) * self.accumulated_delay_ms;

        if self.history.len() == self.window_size {
            self.history.pop_front();
        }
        self.history.push_back((
            (arrival_time_ms - first_arrival) as f64,
            self.smoothed_delay_ms,
        ));

        let mut trend = self.prev_trend;
        if self.history.len() == self.window_size {
            // The trend can be seen as an estimate of
            // (send_rate - capacity) / capacity.
            if let Some(slope) = linear_fit_slope(&self.history) {
                trend = slope;
            }
        }
        self.prev_trend = trend;
        trace!(
            trend,
            accumulated_delay_ms = self.accumulated_delay_ms,
            history_len = self.history.len(),
            "delay gradient update"
        );

        if self.num_of_deltas < MIN_NUM_DELTAS {
            return;
        }
        let modified_trend = trend
            * self.num_of_deltas.min(self.window_size as u32) as f64
            * self.threshold_gain;
        self.prev_modified_trend = modified_trend;
        self.detector
            .detect(modified_trend, send_delta_ms, arrival_time_ms);
    }

    pub fn state(&self) -> CongestionState {
        self.detector.state()
    }

    /// Latest gain-scaled trend value, exposed for diagnostics.
    pub fn modified_trend(&self) -> f64 {
        self.prev_modified_trend
    }

    /// Current detector threshold, exposed for diagnostics.
    pub fn threshold(&self) -> f64 {
        self.detector.threshold()
    }

    /// Discard all accumulated history, e.g. on stream restart.
    pub fn reset(&mut self) {
        self.detector.reset();
        self.num_of_deltas = 0;
        self.first_arrival_time_ms = None;
        self.accumulated_delay_ms = 0.0;
        self.smoothed_delay_ms = 0.0;
        self.history.clear();
        self.prev_trend = 0.0;
        self.prev_modified_trend = 0.0;
    }
}

/// Ordinary least-squares slope over `(x, y)` pairs. `None` when all x
/// values coincide.
fn linear_fit_slope(points: &VecDeque<(f64, f64)>) -> Option<f64> {
    let n = points.len() as f64;
    let avg_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let avg_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let numerator: f64 = points
        .iter()
        .map(|(x, y)| (x - avg_x) * (y - avg_y))
        .sum();
    let denominator: f64 = points.iter().map(|(x, _)| (x - avg_x) * (x - avg_x)).sum();
    if denominator == 0.0 {
        None
    } else {
        Some(numerator / denominator)
    }
}
