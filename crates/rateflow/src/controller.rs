//! Target bitrate control.
//!
//! Composes the delay gradient estimator, the acknowledged-throughput
//! estimator, and the frame dropper into a single sender-side controller.
//! The target bitrate follows an additive-increase/multiplicative-decrease
//! rule driven by the congestion classification: back off to a fraction of
//! the acked throughput on overuse, hold while queues drain, and probe
//! upwards otherwise.

#[cfg(test)]
use mockall::automock;
use tracing::debug;

use rateflow_bwe::{
    ArrivalSample, BweOptions, CongestionState, DelayDeltaPair, DelayGradientEstimator,
    ThroughputEstimator,
};
use rateflow_dropper::{FrameDropper, FrameDropperOptions};

/// Source of the acknowledged-throughput estimate.
///
/// Allows testing `RateController` with mock estimators.
#[cfg_attr(test, automock)]
pub trait ThroughputSource {
    /// Feed bytes acknowledged (or received) at `now_ms`.
    fn on_bytes(&mut self, now_ms: i64, bytes: i64);

    /// Current estimate in bits per second, `None` until warm-up completes.
    fn bitrate_bps(&self) -> Option<u32>;

    /// Widen the estimator's uncertainty ahead of an expected rate jump.
    fn expect_fast_rate_change(&mut self);

    /// Discard accumulated history.
    fn reset(&mut self);
}

impl ThroughputSource for ThroughputEstimator {
    fn on_bytes(&mut self, now_ms: i64, bytes: i64) {
        self.update(now_ms, bytes);
    }

    fn bitrate_bps(&self) -> Option<u32> {
        ThroughputEstimator::bitrate_bps(self)
    }

    fn expect_fast_rate_change(&mut self) {
        ThroughputEstimator::expect_fast_rate_change(self);
    }

    fn reset(&mut self) {
        ThroughputEstimator::reset(self);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RateControllerOptions {
    pub bwe: BweOptions,
    pub dropper: FrameDropperOptions,
    /// Target bitrate before any feedback arrives.
    pub start_bitrate_kbps: f64,
    pub min_bitrate_kbps: f64,
    pub max_bitrate_kbps: f64,
    /// Nominal encoder frame rate, used for per-frame budgets and bucket
    /// leaks.
    pub frame_rate_fps: u32,
    /// Fraction of the acked throughput the target backs off to on overuse.
    pub backoff_factor: f64,
    /// Round-trip estimate used to size the near-capacity additive increase.
    pub rtt_ms: i64,
}

impl Default for RateControllerOptions {
    fn default() -> Self {
        Self {
            bwe: BweOptions::default(),
            dropper: FrameDropperOptions::default(),
            start_bitrate_kbps: 300.0,
            min_bitrate_kbps: 10.0,
            max_bitrate_kbps: 30_000.0,
            frame_rate_fps: 30,
            backoff_factor: 0.85,
            rtt_ms: 200,
        }
    }
}

/// Rate allocation hint handed to the encoder.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateAllocation {
    pub target_bitrate_kbps: f64,
    /// Suggested budget for a single frame, in kilobits.
    pub frame_budget_kbits: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RateState {
    Hold,
    Increase,
    Decrease,
}

/// Minimum multiplicative step, in kbps, so the probe never stalls.
const MIN_INCREASE_KBPS: f64 = 1.0;
/// Floor on the near-capacity additive rate, in kbps per second.
const MIN_NEAR_MAX_INCREASE_KBPS_PER_SEC: f64 = 4.0;
/// Nominal payload size used to derive the per-packet additive step.
const PACKET_SIZE_BYTES: f64 = 1200.0;
/// Headroom the acked throughput grants the target: `1.5 * acked + 10 kbps`.
const ACKED_RATE_HEADROOM: f64 = 1.5;
const ACKED_RATE_SLACK_KBPS: f64 = 10.0;
/// Acked throughput this far above the recorded link capacity invalidates
/// the capacity estimate.
const LINK_CAPACITY_RESET_FACTOR: f64 = 1.25;

pub struct RateController<T: ThroughputSource = ThroughputEstimator> {
    opts: RateControllerOptions,
    delay: DelayGradientEstimator,
    throughput: T,
    dropper: FrameDropper,
    prev_group: Option<ArrivalSample>,
    target_kbps: f64,
    rate_state: RateState,
    last_change_ms: i64,
    /// Acked throughput recorded at the last backoff; the increase switches
    /// from multiplicative to additive as the target approaches it.
    link_capacity_kbps: Option<f64>,
    started: bool,
}

impl RateController<ThroughputEstimator> {
    pub fn new(opts: RateControllerOptions) -> Self {
        let throughput = ThroughputEstimator::new(opts.bwe.throughput);
        Self::with_throughput(opts, throughput)
    }
}

impl<T: ThroughputSource> RateController<T> {
    pub fn with_throughput(opts: RateControllerOptions, throughput: T) -> Self {
        let mut dropper = FrameDropper::new(opts.dropper);
        dropper.set_rates(opts.start_bitrate_kbps as f32, opts.frame_rate_fps as f32);
        Self {
            opts,
            delay: DelayGradientEstimator::new(opts.bwe.trendline, opts.bwe.detector),
            throughput,
            dropper,
            prev_group: None,
            target_kbps: opts.start_bitrate_kbps,
            rate_state: RateState::Hold,
            last_change_ms: 0,
            link_capacity_kbps: None,
            started: false,
        }
    }

    /// Feed one packet group and refresh the target bitrate.
    pub fn on_arrival(&mut self, sample: ArrivalSample) {
        if let Some(prev) = self.prev_group {
            let deltas = DelayDeltaPair::between(&prev, &sample);
            self.delay.update(
                deltas.recv_delta_ms,
                deltas.send_delta_ms,
                sample.send_time_ms,
                sample.arrival_time_ms,
                deltas.calculated_deltas,
            );
        }
        self.prev_group = Some(sample);
        self.started = true;
        self.update_target(sample.arrival_time_ms);
    }

    /// Feed acknowledged bytes into the throughput estimator.
    pub fn on_ack(&mut self, now_ms: i64, bytes: i64) {
        self.throughput.on_bytes(now_ms, bytes);
    }

    /// Charge one encoded frame to the admission bucket.
    pub fn on_frame_encoded(&mut self, size_bytes: usize, is_key_frame: bool) {
        self.dropper.fill(size_bytes, is_key_frame);
    }

    /// Drain one frame interval from the admission bucket. Call once per
    /// expected frame interval.
    pub fn on_frame_interval(&mut self) {
        self.dropper.leak(self.opts.frame_rate_fps);
    }

    /// Whether the current candidate frame should be dropped to hold the
    /// target. Call once per candidate frame.
    pub fn drop_frame(&mut self) -> bool {
        self.dropper.drop_frame()
    }

    /// Hint that the available rate is about to change abruptly, e.g. on a
    /// network handover.
    pub fn expect_fast_rate_change(&mut self) {
        self.throughput.expect_fast_rate_change();
    }

    /// Current target, `None` before the first packet group is processed.
    pub fn target_bitrate_kbps(&self) -> Option<f64> {
        self.started.then_some(self.target_kbps)
    }

    pub fn congestion_state(&self) -> CongestionState {
        self.delay.state()
    }

    /// Acked throughput estimate in bits per second, if warmed up.
    pub fn throughput_bps(&self) -> Option<u32> {
        self.throughput.bitrate_bps()
    }

    /// Target plus a per-frame budget at the nominal frame rate.
    pub fn allocation(&self) -> RateAllocation {
        RateAllocation {
            target_bitrate_kbps: self.target_kbps,
            frame_budget_kbits: self.target_kbps / f64::from(self.opts.frame_rate_fps),
        }
    }

    /// Discard all accumulated history, e.g. on stream restart.
    pub fn reset(&mut self) {
        self.delay.reset();
        self.throughput.reset();
        self.dropper.reset();
        self.dropper
            .set_rates(self.opts.start_bitrate_kbps as f32, self.opts.frame_rate_fps as f32);
        self.prev_group = None;
        self.target_kbps = self.opts.start_bitrate_kbps;
        self.rate_state = RateState::Hold;
        self.last_change_ms = 0;
        self.link_capacity_kbps = None;
        self.started = false;
    }

    fn update_target(&mut self, now_ms: i64) {
        match self.delay.state() {
            CongestionState::Normal => {
                if self.rate_state == RateState::Hold {
                    self.last_change_ms = now_ms;
                    self.rate_state = RateState::Increase;
                }
            }
            CongestionState::Overusing => {
                self.rate_state = RateState::Decrease;
            }
            CongestionState::Underusing => {
                self.rate_state = RateState::Hold;
            }
        }

        let acked_kbps = self
            .throughput
            .bitrate_bps()
            .map(|bps| f64::from(bps) / 1000.0);

        match self.rate_state {
            RateState::Hold => {}
            RateState::Increase => {
                // A throughput reading well above the recorded capacity
                // means the link changed; forget the estimate and resume
                // multiplicative probing.
                if let (Some(acked), Some(cap)) = (acked_kbps, self.link_capacity_kbps) {
                    if acked > LINK_CAPACITY_RESET_FACTOR * cap {
                        self.link_capacity_kbps = None;
                    }
                }
                let elapsed_secs =
                    ((now_ms - self.last_change_ms).max(0) as f64 / 1000.0).min(1.0);
                let near_capacity = self
                    .link_capacity_kbps
                    .is_some_and(|cap| self.target_kbps >= 0.9 * cap);
                let step_kbps = if near_capacity {
                    self.near_max_increase_kbps_per_sec() * elapsed_secs
                } else {
                    let alpha = 1.08_f64.powf(elapsed_secs);
                    (self.target_kbps * (alpha - 1.0)).max(MIN_INCREASE_KBPS * elapsed_secs)
                };
                let mut new_target = self.target_kbps + step_kbps;
                if let Some(acked) = acked_kbps {
                    new_target = new_target.min(ACKED_RATE_HEADROOM * acked + ACKED_RATE_SLACK_KBPS);
                }
                self.set_target(new_target, now_ms);
            }
            RateState::Decrease => {
                let new_target = match acked_kbps {
                    Some(acked) => {
                        self.link_capacity_kbps = Some(acked);
                        self.target_kbps.min(self.opts.backoff_factor * acked)
                    }
                    None => self.opts.backoff_factor * self.target_kbps,
                };
                debug!(
                    target_kbps = new_target,
                    acked_kbps, "backing off on overuse"
                );
                self.set_target(new_target, now_ms);
                self.rate_state = RateState::Hold;
            }
        }

        self.dropper
            .set_rates(self.target_kbps as f32, self.opts.frame_rate_fps as f32);
    }

    fn set_target(&mut self, target_kbps: f64, now_ms: i64) {
        self.target_kbps =
            target_kbps.clamp(self.opts.min_bitrate_kbps, self.opts.max_bitrate_kbps);
        self.last_change_ms = now_ms;
    }

    /// Additive probe rate used close to the last known link capacity: one
    /// nominal packet per response time, floored so progress never stalls.
    fn near_max_increase_kbps_per_sec(&self) -> f64 {
        let bits_per_frame = self.target_kbps * 1000.0 / f64::from(self.opts.frame_rate_fps);
        let packets_per_frame = (bits_per_frame / (8.0 * PACKET_SIZE_BYTES)).ceil().max(1.0);
        let avg_packet_size_bits = bits_per_frame / packets_per_frame;
        let response_time_secs = 2.0 * (self.opts.rtt_ms as f64 + 100.0) / 1000.0;
        (avg_packet_size_bits / response_time_secs / 1000.0)
            .max(MIN_NEAR_MAX_INCREASE_KBPS_PER_SEC)
    }
}

#[cfg(test)]
mod tests {
    use rateflow_bwe::CongestionState;
    use rstest::rstest;

    use super::*;

    /// Feed `count` packet groups with the given send spacing and per-group
    /// queue growth, starting from the `(send_ms, arrival_ms)` clock pair.
    /// Returns the advanced clocks so feeds can be chained.
    fn feed_arrivals(
        controller: &mut RateController<MockThroughputSource>,
        count: usize,
        send_delta_ms: i64,
        queue_growth_ms: i64,
        clocks: (i64, i64),
    ) -> (i64, i64) {
        let (mut send, mut arrival) = clocks;
        for _ in 0..count {
            send += send_delta_ms;
            arrival += send_delta_ms + queue_growth_ms;
            controller.on_arrival(ArrivalSample {
                send_time_ms: send,
                arrival_time_ms: arrival,
                group_size_bytes: 1200,
            });
        }
        (send, arrival)
    }

    fn mock_with_rate(bps: Option<u32>) -> MockThroughputSource {
        let mut mock = MockThroughputSource::new();
        mock.expect_bitrate_bps().return_const(bps);
        mock
    }

    #[test]
    fn no_target_before_first_group() {
        let controller = RateController::new(RateControllerOptions::default());
        assert_eq!(controller.target_bitrate_kbps(), None);
    }

    #[test]
    fn stable_network_grows_the_target() {
        let mut controller = RateController::with_throughput(
            RateControllerOptions::default(),
            mock_with_rate(Some(1_000_000)),
        );
        feed_arrivals(&mut controller, 60, 20, 0, (0, 0));
        assert_eq!(controller.congestion_state(), CongestionState::Normal);
        let target = controller.target_bitrate_kbps().unwrap();
        assert!(target > RateControllerOptions::default().start_bitrate_kbps);
    }

    #[rstest]
    #[case(300_000, 255.0)]
    #[case(200_000, 170.0)]
    fn overuse_backs_off_to_fraction_of_acked_rate(
        #[case] acked_bps: u32,
        #[case] expected_kbps: f64,
    ) {
        let mut controller = RateController::with_throughput(
            RateControllerOptions::default(),
            mock_with_rate(Some(acked_bps)),
        );
        feed_arrivals(&mut controller, 40, 20, 10, (0, 0));
        assert_eq!(controller.congestion_state(), CongestionState::Overusing);
        let target = controller.target_bitrate_kbps().unwrap();
        assert!((target - expected_kbps).abs() < 1e-9);
    }

    #[test]
    fn underuse_holds_the_target() {
        let mut controller = RateController::with_throughput(
            RateControllerOptions::default(),
            mock_with_rate(Some(1_000_000)),
        );
        let clocks = feed_arrivals(&mut controller, 40, 20, -10, (0, 0));
        assert_eq!(controller.congestion_state(), CongestionState::Underusing);
        let held = controller.target_bitrate_kbps().unwrap();

        feed_arrivals(&mut controller, 10, 20, -10, clocks);
        assert_eq!(controller.congestion_state(), CongestionState::Underusing);
        assert_eq!(controller.target_bitrate_kbps().unwrap(), held);
    }

    #[test]
    fn increase_is_bounded_by_acked_rate() {
        let mut controller = RateController::with_throughput(
            RateControllerOptions::default(),
            mock_with_rate(Some(100_000)),
        );
        feed_arrivals(&mut controller, 500, 20, 0, (0, 0));
        let target = controller.target_bitrate_kbps().unwrap();
        assert!(target <= 1.5 * 100.0 + 10.0 + 1e-9);
    }

    #[test]
    fn target_clamped_to_configured_bounds() {
        let opts = RateControllerOptions {
            max_bitrate_kbps: 400.0,
            ..RateControllerOptions::default()
        };
        let mut controller =
            RateController::with_throughput(opts, mock_with_rate(Some(10_000_000)));
        feed_arrivals(&mut controller, 2000, 20, 0, (0, 0));
        assert_eq!(controller.target_bitrate_kbps().unwrap(), 400.0);
    }

    #[test]
    fn recovery_after_backoff_probes_upwards_again() {
        let mut controller = RateController::with_throughput(
            RateControllerOptions::default(),
            mock_with_rate(Some(300_000)),
        );
        let clocks = feed_arrivals(&mut controller, 40, 20, 10, (0, 0));
        let backed_off = controller.target_bitrate_kbps().unwrap();

        feed_arrivals(&mut controller, 200, 20, 0, clocks);
        assert_eq!(controller.congestion_state(), CongestionState::Normal);
        assert!(controller.target_bitrate_kbps().unwrap() > backed_off);
    }

    #[test]
    fn allocation_budget_matches_frame_rate() {
        let mut controller = RateController::with_throughput(
            RateControllerOptions::default(),
            mock_with_rate(Some(1_000_000)),
        );
        feed_arrivals(&mut controller, 10, 20, 0, (0, 0));
        let allocation = controller.allocation();
        assert!(
            (allocation.frame_budget_kbits - allocation.target_bitrate_kbps / 30.0).abs() < 1e-9
        );
    }

    #[test]
    fn acks_are_forwarded_to_the_throughput_source() {
        let mut mock = MockThroughputSource::new();
        mock.expect_on_bytes()
            .withf(|now_ms, bytes| *now_ms == 25 && *bytes == 1200)
            .times(1)
            .return_const(());
        let mut controller =
            RateController::with_throughput(RateControllerOptions::default(), mock);
        controller.on_ack(25, 1200);
    }

    #[test]
    fn fast_rate_change_hint_is_forwarded() {
        let mut mock = MockThroughputSource::new();
        mock.expect_expect_fast_rate_change().times(1).return_const(());
        let mut controller =
            RateController::with_throughput(RateControllerOptions::default(), mock);
        controller.expect_fast_rate_change();
    }

    #[test]
    fn reset_restores_the_start_bitrate() {
        let mut mock = mock_with_rate(Some(1_000_000));
        mock.expect_reset().times(1).return_const(());
        let mut controller =
            RateController::with_throughput(RateControllerOptions::default(), mock);
        feed_arrivals(&mut controller, 60, 20, 0, (0, 0));
        assert!(
            controller.target_bitrate_kbps().unwrap()
                > RateControllerOptions::default().start_bitrate_kbps
        );

        controller.reset();
        assert_eq!(controller.target_bitrate_kbps(), None);
        assert_eq!(controller.congestion_state(), CongestionState::Normal);
    }

    #[test]
    fn oversized_frames_are_eventually_dropped() {
        let mut controller = RateController::with_throughput(
            RateControllerOptions::default(),
            mock_with_rate(Some(300_000)),
        );
        feed_arrivals(&mut controller, 10, 20, 0, (0, 0));

        // Frames four times the per-frame budget overwhelm the bucket.
        let budget_bytes = (controller.allocation().frame_budget_kbits * 1000.0 / 8.0) as usize;
        let mut dropped = false;
        controller.on_frame_encoded(budget_bytes, false);
        controller.on_frame_interval();
        for _ in 0..120 {
            controller.on_frame_encoded(budget_bytes * 4, false);
            controller.on_frame_interval();
            if controller.drop_frame() {
                dropped = true;
                break;
            }
        }
        assert!(dropped);
    }
}
