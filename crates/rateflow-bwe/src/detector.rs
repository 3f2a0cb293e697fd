//! Adaptive-threshold overuse detection.
//!
//! Compares the (gain-scaled) delay trend against a self-tuning threshold.
//! Overuse is only signalled once the trend has stayed above the threshold
//! for a sustained period without decreasing; underuse has no such dwell
//! time. The threshold itself chases `|trend|` with asymmetric gains so the
//! detector desensitizes quickly under sustained congestion and re-trusts
//! the network slowly afterwards.

use tracing::debug;

use crate::{config::DetectorOptions, types::CongestionState};

/// Cap on the elapsed time used for one threshold adaptation step, so a long
/// silent gap cannot slam the threshold in a single call.
const MAX_ADAPT_STEP_MS: i64 = 100;

#[derive(Clone, Debug)]
pub struct AdaptiveThresholdDetector {
    opts: DetectorOptions,
    threshold: f64,
    last_update_ms: Option<i64>,
    prev_trend: f64,
    time_over_using_ms: f64,
    overuse_counter: u32,
    state: CongestionState,
}

impl AdaptiveThresholdDetector {
    pub fn new(opts: DetectorOptions) -> Self {
        Self {
            opts,
            threshold: opts.initial_threshold,
            last_update_ms: None,
            prev_trend: 0.0,
            time_over_using_ms: 0.0,
            overuse_counter: 0,
            state: CongestionState::Normal,
        }
    }

    /// Classify the network state given the latest trend value.
    ///
    /// `trend` is the modified (gain-scaled) slope from the trendline fit,
    /// `ts_delta_ms` the send-time delta of the group that produced it and
    /// `now_ms` the group's arrival time.
    pub fn detect(&mut self, trend: f64, ts_delta_ms: f64, now_ms: i64) -> CongestionState {
        let prev_state = self.state;
        if trend > self.threshold {
            if self.time_over_using_ms == 0.0 {
                // Initialize the dwell timer to half a delta, the midpoint
                // guess of when the trend actually crossed.
                self.time_over_using_ms = ts_delta_ms / 2.0;
            } else {
                self.time_over_using_ms += ts_delta_ms;
            }
            self.overuse_counter += 1;
            if self.time_over_using_ms > self.opts.overuse_time_threshold_ms
                && self.overuse_counter > 1
                && trend >= self.prev_trend
            {
                self.time_over_using_ms = 0.0;
                self.overuse_counter = 0;
                self.state = CongestionState::Overusing;
            }
        } else if trend < -self.threshold {
            self.time_over_using_ms = 0.0;
            self.overuse_counter = 0;
            self.state = CongestionState::Underusing;
        } else {
            self.time_over_using_ms = 0.0;
            self.overuse_counter = 0;
            self.state = CongestionState::Normal;
        }
        self.prev_trend = trend;
        self.adapt_threshold(trend, now_ms);
        if self.state != prev_state {
            debug!(
                ?prev_state,
                state = ?self.state,
                trend,
                threshold = self.threshold,
                "congestion state transition"
            );
        }
        self.state
    }

    pub fn state(&self) -> CongestionState {
        self.state
    }

    /// Current adaptive threshold, exposed for diagnostics.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.opts);
    }

    fn adapt_threshold(&mut self, trend: f64, now_ms: i64) {
        let last = *self.last_update_ms.get_or_insert(now_ms);
        if trend.abs() > self.threshold + self.opts.max_adapt_offset {
            // A spike this far out is more likely a sudden capacity drop
            // than a sensitivity problem; do not chase it.
            self.last_update_ms = Some(now_ms);
            return;
        }
        let k = if trend.abs() < self.threshold {
            self.opts.k_down
        } else {
            self.opts.k_up
        };
        let elapsed_ms = (now_ms - last).clamp(0, MAX_ADAPT_STEP_MS) as f64;
        self.threshold += k * (trend.abs() - self.threshold) * elapsed_ms;
        self.threshold = self
            .threshold
            .clamp(self.opts.threshold_min, self.opts.threshold_max);
        self.last_update_ms = Some(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> AdaptiveThresholdDetector {
        AdaptiveThresholdDetector::new(DetectorOptions::default())
    }

    #[test]
    fn starts_normal() {
        assert_eq!(detector().state(), CongestionState::Normal);
    }

    #[test]
    fn overuse_requires_sustained_dwell_time() {
        let mut det = detector();
        // Trend of 30 is beyond threshold + max_adapt_offset, so the
        // threshold holds still and the trend stays strictly above it.
        let ts_delta = 20.0;
        let mut accumulated = 0.0;
        let mut now_ms = 0;
        loop {
            let state = det.detect(30.0, ts_delta, now_ms);
            accumulated += if accumulated == 0.0 {
                ts_delta / 2.0
            } else {
                ts_delta
            };
            if state == CongestionState::Overusing {
                break;
            }
            assert!(
                accumulated <= 100.0 + ts_delta,
                "overuse must not fire before 100ms of dwell, got {accumulated}ms"
            );
            now_ms += 20;
            assert!(now_ms < 1000, "overuse never fired");
        }
        assert!(accumulated > 100.0);
    }

    #[test]
    fn single_spike_does_not_overuse() {
        let mut det = detector();
        assert_eq!(det.detect(30.0, 20.0, 0), CongestionState::Normal);
        // Back under the threshold: dwell timer must restart from scratch.
        assert_eq!(det.detect(1.0, 20.0, 20), CongestionState::Normal);
        assert_eq!(det.detect(30.0, 20.0, 40), CongestionState::Normal);
    }

    #[test]
    fn decreasing_trend_postpones_overuse() {
        let mut det = detector();
        let mut now_ms = 0;
        // Plenty of dwell time, but each sample is lower than the last.
        for trend in [40.0, 39.0, 38.0, 37.0, 36.0, 35.0, 34.0, 33.0] {
            assert_eq!(det.detect(trend, 40.0, now_ms), CongestionState::Normal);
            now_ms += 40;
        }
        // First non-decreasing sample with dwell already accumulated.
        assert_eq!(det.detect(33.0, 40.0, now_ms), CongestionState::Overusing);
    }

    #[test]
    fn underuse_has_no_dwell_requirement() {
        let mut det = detector();
        assert_eq!(det.detect(-30.0, 20.0, 0), CongestionState::Underusing);
        assert_eq!(det.detect(-1.0, 20.0, 20), CongestionState::Normal);
    }

    #[test]
    fn overuse_clears_once_trend_drops() {
        let mut det = detector();
        let mut now_ms = 0;
        for _ in 0..10 {
            det.detect(30.0, 20.0, now_ms);
            now_ms += 20;
        }
        assert_eq!(det.state(), CongestionState::Overusing);
        assert_eq!(det.detect(0.0, 20.0, now_ms), CongestionState::Normal);
    }

    #[test]
    fn threshold_rises_while_trend_above_and_falls_below() {
        let mut det = detector();
        let start = det.threshold();

        // 20 is above the initial threshold (12.5) but within the adapt
        // window (12.5 + 15), so the threshold chases it upwards.
        let mut prev = start;
        let mut now_ms = 0;
        for _ in 0..10 {
            det.detect(20.0, 20.0, now_ms);
            assert!(det.threshold() >= prev);
            prev = det.threshold();
            now_ms += 20;
        }
        assert!(det.threshold() > start);

        // Once the trend sits below the threshold it decays, slowly.
        let peak = det.threshold();
        for _ in 0..10 {
            det.detect(1.0, 20.0, now_ms);
            assert!(det.threshold() <= peak);
            now_ms += 20;
        }
        assert!(det.threshold() < peak);
    }

    #[test]
    fn rise_gain_outpaces_decay_gain() {
        // Equal |trend - threshold| gap and equal elapsed time on fresh
        // detectors; the k_up step must dominate the k_down step.
        let mut up = detector();
        up.detect(0.0, 20.0, 0); // pin last_update_ms
        let before_up = up.threshold();
        up.detect(before_up + 5.0, 20.0, 100);
        let rise = up.threshold() - before_up;

        let mut down = detector();
        down.detect(0.0, 20.0, 0);
        let before_down = down.threshold();
        down.detect(before_down - 5.0, 20.0, 100);
        let fall = before_down - down.threshold();

        assert!(rise > 0.0);
        assert!(fall > 0.0);
        assert!(rise > fall * 10.0);
    }

    #[test]
    fn threshold_clamped_to_bounds() {
        let mut det = detector();
        let opts = DetectorOptions::default();
        let mut now_ms = 0;
        for _ in 0..500 {
            det.detect(0.0, 20.0, now_ms);
            now_ms += 100;
        }
        assert_eq!(det.threshold(), opts.threshold_min);
    }

    #[test]
    fn spikes_beyond_adapt_offset_do_not_move_threshold() {
        let mut det = detector();
        let before = det.threshold();
        det.detect(500.0, 20.0, 0);
        det.detect(500.0, 20.0, 100);
        assert_eq!(det.threshold(), before);
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut det = detector();
        let mut now_ms = 0;
        for _ in 0..10 {
            det.detect(30.0, 20.0, now_ms);
            now_ms += 20;
        }
        det.reset();
        assert_eq!(det.state(), CongestionState::Normal);
        assert_eq!(det.threshold(), DetectorOptions::default().initial_threshold);
    }
}
