//! Estimator configuration.
//!
//! Every knob is an explicit struct field with a documented default; there is
//! no ambient global lookup backing any estimator instance. A flat string
//! key/value overlay is supported for callers that carry tuning in
//! deployment config: unknown keys and unparsable values are ignored,
//! out-of-range values are clamped by the consuming estimator.

use tracing::warn;

/// Configuration for the delay gradient (trendline) estimator.
#[derive(Clone, Copy, Debug)]
pub struct TrendlineOptions {
    /// Number of `(arrival_time, smoothed_delay)` points the regression is
    /// fit over. Older points are evicted FIFO.
    pub window_size: usize,
    /// Exponential smoothing coefficient applied to the accumulated delay
    /// before it enters the regression history.
    pub smoothing_coef: f64,
    /// Gain applied to the fitted slope before threshold comparison.
    pub threshold_gain: f64,
}

impl Default for TrendlineOptions {
    fn default() -> Self {
        Self {
            window_size: 20,
            smoothing_coef: 0.9,
            threshold_gain: 4.0,
        }
    }
}

/// Configuration for the adaptive overuse threshold.
///
/// `k_up` and `k_down` are deliberately asymmetric: the threshold rises
/// quickly while the trend exceeds it and falls back slowly afterwards.
#[derive(Clone, Copy, Debug)]
pub struct DetectorOptions {
    /// Adaptation gain while `|trend|` is above the threshold.
    pub k_up: f64,
    /// Adaptation gain while `|trend|` is below the threshold.
    pub k_down: f64,
    /// Sustained above-threshold time required before overuse is signalled,
    /// in milliseconds. Empirically tuned; tunable, not structural.
    pub overuse_time_threshold_ms: f64,
    /// Starting threshold value.
    pub initial_threshold: f64,
    /// Lower clamp for the adaptive threshold.
    pub threshold_min: f64,
    /// Upper clamp for the adaptive threshold.
    pub threshold_max: f64,
    /// Trend excursions more than this far beyond the threshold do not
    /// adapt it, so a single latency spike cannot desensitize the detector.
    pub max_adapt_offset: f64,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            k_up: 0.01,
            k_down: 0.00018,
            overuse_time_threshold_ms: 100.0,
            initial_threshold: 12.5,
            threshold_min: 6.0,
            threshold_max: 600.0,
            max_adapt_offset: 15.0,
        }
    }
}

/// Configuration for the acknowledged-throughput estimator.
#[derive(Clone, Copy, Debug)]
pub struct ThroughputOptions {
    /// Window length used until the first estimate exists. A longer initial
    /// window gives a more stable seed for the belief.
    pub initial_window_ms: i64,
    /// Steady-state window length. Clamped to `[150, 1000]`.
    pub window_ms: i64,
    /// Scale applied to the relative estimate/sample error when deriving
    /// the sample uncertainty.
    pub uncertainty_scale: f64,
    /// Cap (in kbps) on the sample's contribution to the uncertainty
    /// denominator. Zero keeps downward corrections more trusted than
    /// upward ones; raising the cap approaches symmetry.
    pub uncertainty_symmetry_cap_kbps: f64,
    /// Lower clamp (in kbps) for the blended estimate.
    pub estimate_floor_kbps: f64,
}

impl Default for ThroughputOptions {
    fn default() -> Self {
        Self {
            initial_window_ms: 500,
            window_ms: 150,
            uncertainty_scale: 10.0,
            uncertainty_symmetry_cap_kbps: 0.0,
            estimate_floor_kbps: 0.0,
        }
    }
}

/// Combined configuration for the bandwidth-estimation side.
#[derive(Clone, Copy, Debug, Default)]
pub struct BweOptions {
    pub trendline: TrendlineOptions,
    pub detector: DetectorOptions,
    pub throughput: ThroughputOptions,
}

impl BweOptions {
    /// Apply a flat key/value overlay on top of the current values.
    ///
    /// Unrecognized keys are ignored (with a warning), as are values that do
    /// not parse; partial configuration is never an error.
    pub fn apply_overrides<'a, I>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in pairs {
            match key {
                "window_size" => apply(value, &mut self.trendline.window_size),
                "smoothing_coef" => apply(value, &mut self.trendline.smoothing_coef),
                "threshold_gain" => apply(value, &mut self.trendline.threshold_gain),
                "k_up" => apply(value, &mut self.detector.k_up),
                "k_down" => apply(value, &mut self.detector.k_down),
                "overuse_time_threshold_ms" => {
                    apply(value, &mut self.detector.overuse_time_threshold_ms)
                }
                "initial_threshold" => apply(value, &mut self.detector.initial_threshold),
                "threshold_min" => apply(value, &mut self.detector.threshold_min),
                "threshold_max" => apply(value, &mut self.detector.threshold_max),
                "max_adapt_offset" => apply(value, &mut self.detector.max_adapt_offset),
                "initial_window_ms" => apply(value, &mut self.throughput.initial_window_ms),
                "window_ms" => apply(value, &mut self.throughput.window_ms),
                "scale" => apply(value, &mut self.throughput.uncertainty_scale),
                "symmetry_cap" => {
                    apply(value, &mut self.throughput.uncertainty_symmetry_cap_kbps)
                }
                "floor" => apply(value, &mut self.throughput.estimate_floor_kbps),
                _ => warn!(key, "ignoring unknown bwe config key"),
            }
        }
    }
}

fn apply<T: std::str::FromStr>(value: &str, slot: &mut T) {
    match value.parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(value, "ignoring unparsable bwe config value"),
    }
}
