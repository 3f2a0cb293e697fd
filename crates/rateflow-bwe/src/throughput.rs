//! Acknowledged-throughput estimation.
//!
//! Accumulates acked bytes over a sliding window and folds each completed
//! window's rate sample into a running Bayesian belief. Samples far from the
//! current belief are given less weight, as they are more likely caused by
//! delay spikes than by a real capacity change; with a low symmetry cap a
//! downward sample moves the belief by a larger fraction of its error than
//! an upward one, so a real capacity loss is tracked quickly.

use tracing::trace;

use crate::config::ThroughputOptions;

/// Bounds for the steady-state window length.
const MIN_WINDOW_MS: i64 = 150;
const MAX_WINDOW_MS: i64 = 1000;

/// Process noise added to the belief variance on every completed window,
/// modelling that the real rate drifts between windows.
const PROCESS_NOISE: f64 = 5.0;

/// Variance seeded alongside the very first window sample.
const INITIAL_VARIANCE: f64 = 50.0;

/// Variance bump applied by [`ThroughputEstimator::expect_fast_rate_change`].
const FAST_CHANGE_VARIANCE: f64 = 200.0;

#[derive(Clone, Debug)]
pub struct ThroughputEstimator {
    initial_window_ms: i64,
    window_ms: i64,
    uncertainty_scale: f64,
    uncertainty_symmetry_cap_kbps: f64,
    estimate_floor_kbps: f64,
    sum_bytes: i64,
    current_window_ms: i64,
    prev_time_ms: Option<i64>,
    estimate_kbps: Option<f64>,
    estimate_var: f64,
    discarded_samples: u64,
}

impl ThroughputEstimator {
    pub fn new(opts: ThroughputOptions) -> Self {
        Self {
            initial_window_ms: opts.initial_window_ms.clamp(MIN_WINDOW_MS, MAX_WINDOW_MS),
            window_ms: opts.window_ms.clamp(MIN_WINDOW_MS, MAX_WINDOW_MS),
            uncertainty_scale: opts.uncertainty_scale,
            uncertainty_symmetry_cap_kbps: opts.uncertainty_symmetry_cap_kbps.max(0.0),
            estimate_floor_kbps: opts.estimate_floor_kbps.max(0.0),
            sum_bytes: 0,
            current_window_ms: 0,
            prev_time_ms: None,
            estimate_kbps: None,
            estimate_var: INITIAL_VARIANCE,
            discarded_samples: 0,
        }
    }

    /// Account `bytes` acked at `now_ms`.
    ///
    /// Invalid samples (negative byte counts, clock moving backwards) are
    /// discarded and counted; a single bad sample must not destabilize the
    /// session.
    pub fn update(&mut self, now_ms: i64, bytes: i64) {
        if bytes < 0 {
            self.discarded_samples += 1;
            trace!(now_ms, bytes, "discarding negative ack sample");
            return;
        }
        if let Some(prev) = self.prev_time_ms {
            if now_ms < prev {
                self.discarded_samples += 1;
                trace!(now_ms, prev, "discarding non-monotonic ack sample");
                return;
            }
        }
        // A larger window is used until the first sample exists, giving a
        // more stable seed for the belief.
        let rate_window_ms = if self.estimate_kbps.is_none() {
            self.initial_window_ms
        } else {
            self.window_ms
        };
        let Some(sample_kbps) = self.update_window(now_ms, bytes, rate_window_ms) else {
            return;
        };
        let Some(estimate_kbps) = self.estimate_kbps else {
            // The very first sample initializes the belief directly.
            self.estimate_kbps = Some(sample_kbps);
            return;
        };

        // Sample uncertainty grows with the relative distance from the
        // current belief. With a low symmetry cap, increases carry more
        // uncertainty than decreases.
        let sample_uncertainty = self.uncertainty_scale * (estimate_kbps - sample_kbps).abs()
            / (estimate_kbps + sample_kbps.min(self.uncertainty_symmetry_cap_kbps));
        let sample_var = sample_uncertainty * sample_uncertainty;

        let pred_var = self.estimate_var + PROCESS_NOISE;
        let blended =
            (sample_var * estimate_kbps + pred_var * sample_kbps) / (sample_var + pred_var);
        self.estimate_kbps = Some(blended.max(self.estimate_floor_kbps));
        self.estimate_var = sample_var * pred_var / (sample_var + pred_var);
        trace!(
            sample_kbps,
            estimate_kbps = blended,
            variance = self.estimate_var,
            "throughput window complete"
        );
    }

    /// Blended estimate in bits per second. Unset until the first window
    /// completes; callers must not treat unset as zero bandwidth.
    pub fn bitrate_bps(&self) -> Option<u32> {
        self.estimate_kbps.map(|kbps| (kbps * 1000.0) as u32)
    }

    /// Raw rate of the in-progress window, without Bayesian smoothing.
    pub fn peek_bps(&self) -> Option<u32> {
        if self.current_window_ms > 0 {
            Some((self.sum_bytes * 8000 / self.current_window_ms) as u32)
        } else {
            None
        }
    }

    /// Inflate the belief variance so the next windows are trusted more.
    ///
    /// Called after a deliberate probe or an encoder reconfiguration, when
    /// clinging to the stale belief would be wrong.
    pub fn expect_fast_rate_change(&mut self) {
        self.estimate_var += FAST_CHANGE_VARIANCE;
    }

    /// Count of samples discarded as invalid, for diagnostics.
    pub fn discarded_samples(&self) -> u64 {
        self.discarded_samples
    }

    pub fn reset(&mut self) {
        self.sum_bytes = 0;
        self.current_window_ms = 0;
        self.prev_time_ms = None;
        self.estimate_kbps = None;
        self.estimate_var = INITIAL_VARIANCE;
        self.discarded_samples = 0;
    }

    /// Advance the window; returns the completed window's rate in kbps when
    /// one full window has elapsed.
    fn update_window(&mut self, now_ms: i64, bytes: i64, rate_window_ms: i64) -> Option<f64> {
        if let Some(prev) = self.prev_time_ms {
            self.current_window_ms += now_ms - prev;
            // Nothing received for over a full window: the accumulated sum
            // is stale. Keep only the in-window remainder of the gap.
            if now_ms - prev > rate_window_ms {
                self.sum_bytes = 0;
                self.current_window_ms %= rate_window_ms;
            }
        }
        self.prev_time_ms = Some(now_ms);
        let mut sample_kbps = None;
        if self.current_window_ms >= rate_window_ms {
            sample_kbps = Some(8.0 * self.sum_bytes as f64 / rate_window_ms as f64);
            self.current_window_ms -= rate_window_ms;
            self.sum_bytes = 0;
        }
        self.sum_bytes += bytes;
        sample_kbps
    }
}
