//! Leaky-bucket frame admission.
//!
//! Tracks queued-but-unsent kilobits against the encoder's target bitrate
//! and answers, per candidate frame, whether it should be dropped to keep
//! the stream inside its budget. Key frames and oversized delta frames are
//! not charged to the bucket at once; their cost is spread over the
//! following leak intervals so a single large frame cannot force a run of
//! drops on the small frames behind it.

use tracing::debug;

use crate::filter::ExpFilter;

const DEFAULT_TARGET_BITRATE_KBPS: f32 = 300.0;
const DEFAULT_INCOMING_FRAME_RATE_FPS: f32 = 30.0;

const FRAME_SIZE_ALPHA: f32 = 0.9;
const KEY_FRAME_RATIO_ALPHA: f32 = 0.99;
/// Seed ratio: one key frame every ten seconds at 30 fps.
const KEY_FRAME_RATIO_SEED: f32 = 1.0 / 300.0;
const DROP_RATIO_ALPHA: f32 = 0.9;
const DROP_RATIO_FAST_ALPHA: f32 = 0.8;
const DROP_RATIO_MAX: f32 = 0.96;

/// Lower bound on the number of leaks a large frame is spread over.
const MIN_SPREAD_FRAMES: f32 = 5.0;

/// Tuning knobs for [`FrameDropper`]. The defaults match the behavior the
/// bucket model was validated with; change them only with measurements in
/// hand.
#[derive(Clone, Copy, Debug)]
pub struct FrameDropperOptions {
    /// Bucket capacity expressed in seconds of target bitrate.
    pub bucket_window_secs: f32,
    /// Hard cap on the accumulator, in seconds of target bitrate.
    pub accumulator_cap_secs: f32,
    /// A delta frame larger than this factor times the running average is
    /// treated as large and spread like a key frame.
    pub large_frame_delta_factor: f32,
    /// Longest run of consecutive drops, in seconds at the incoming frame
    /// rate, before a frame is force-accepted.
    pub max_drop_duration_secs: f32,
}

impl Default for FrameDropperOptions {
    fn default() -> Self {
        Self {
            bucket_window_secs: 0.5,
            accumulator_cap_secs: 3.0,
            large_frame_delta_factor: 3.0,
            max_drop_duration_secs: 4.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FrameDropper {
    opts: FrameDropperOptions,
    key_frame_ratio: ExpFilter,
    delta_frame_size_avg_kbits: ExpFilter,
    drop_ratio: ExpFilter,
    /// Leaks left before a spread-out large frame is fully accumulated.
    large_frame_accumulation_count: u32,
    large_frame_accumulation_chunk_size: f32,
    large_frame_accumulation_spread: f32,
    accumulator: f32,
    accumulator_max: f32,
    target_bitrate_kbps: f32,
    incoming_frame_rate: f32,
    drop_next: bool,
    drop_count: u32,
    was_below_max: bool,
    enabled: bool,
}

impl FrameDropper {
    pub fn new(opts: FrameDropperOptions) -> Self {
        let mut dropper = Self {
            opts,
            key_frame_ratio: ExpFilter::new(KEY_FRAME_RATIO_ALPHA),
            delta_frame_size_avg_kbits: ExpFilter::new(FRAME_SIZE_ALPHA),
            drop_ratio: ExpFilter::with_max(DROP_RATIO_ALPHA, DROP_RATIO_MAX),
            large_frame_accumulation_count: 0,
            large_frame_accumulation_chunk_size: 0.0,
            large_frame_accumulation_spread: 0.0,
            accumulator: 0.0,
            accumulator_max: 0.0,
            target_bitrate_kbps: 0.0,
            incoming_frame_rate: 0.0,
            drop_next: false,
            drop_count: 0,
            was_below_max: true,
            enabled: true,
        };
        dropper.reset();
        dropper
    }

    /// Restore the initial state, keeping the configured options and the
    /// enabled flag.
    pub fn reset(&mut self) {
        self.key_frame_ratio.reset(KEY_FRAME_RATIO_ALPHA);
        self.key_frame_ratio.apply(1.0, KEY_FRAME_RATIO_SEED);
        self.delta_frame_size_avg_kbits.reset(FRAME_SIZE_ALPHA);
        self.drop_ratio.reset(DROP_RATIO_ALPHA);

        self.accumulator = 0.0;
        self.accumulator_max = DEFAULT_TARGET_BITRATE_KBPS * self.opts.bucket_window_secs;
        self.target_bitrate_kbps = DEFAULT_TARGET_BITRATE_KBPS;
        self.incoming_frame_rate = DEFAULT_INCOMING_FRAME_RATE_FPS;

        self.large_frame_accumulation_count = 0;
        self.large_frame_accumulation_chunk_size = 0.0;
        self.large_frame_accumulation_spread = 0.5 * DEFAULT_INCOMING_FRAME_RATE_FPS;

        self.drop_next = false;
        self.drop_count = 0;
        self.was_below_max = true;
    }

    /// Pass-through mode: when disabled, `drop_frame` always answers false
    /// and `fill`/`leak` are no-ops.
    pub fn enable(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Update the bitrate budget and the camera frame rate.
    pub fn set_rates(&mut self, target_bitrate_kbps: f32, incoming_frame_rate_fps: f32) {
        self.accumulator_max = target_bitrate_kbps * self.opts.bucket_window_secs;
        if self.target_bitrate_kbps > 0.0
            && target_bitrate_kbps < self.target_bitrate_kbps
            && self.accumulator > self.accumulator_max
        {
            // Rescale the fill level so a shrinking budget does not turn
            // into an instant drop burst.
            self.accumulator *= target_bitrate_kbps / self.target_bitrate_kbps;
        }
        self.target_bitrate_kbps = target_bitrate_kbps;
        self.incoming_frame_rate = incoming_frame_rate_fps;
    }

    /// Charge one encoded frame to the bucket.
    ///
    /// Key frames, and delta frames larger than
    /// [`FrameDropperOptions::large_frame_delta_factor`] times the running
    /// average, are handed to the spreading machinery instead of being
    /// accumulated in full.
    pub fn fill(&mut self, frame_size_bytes: usize, is_key_frame: bool) {
        if !self.enabled {
            return;
        }
        let mut frame_size_kbits = 8.0 * frame_size_bytes as f32 / 1000.0;
        if is_key_frame {
            self.key_frame_ratio.apply(1.0, 1.0);
            if self.large_frame_accumulation_count == 0 {
                // Spread over the observed key frame interval when key
                // frames come more often than the default spread.
                let ratio = self.key_frame_ratio.filtered().unwrap_or(0.0);
                let spread = if ratio > 1e-5 && 1.0 / ratio < self.large_frame_accumulation_spread
                {
                    1.0 / ratio
                } else {
                    self.large_frame_accumulation_spread
                };
                self.begin_large_frame_accumulation(frame_size_kbits, spread);
                frame_size_kbits = 0.0;
            }
        } else {
            let avg = self.delta_frame_size_avg_kbits.filtered();
            let is_large = avg
                .map(|avg| frame_size_kbits > self.opts.large_frame_delta_factor * avg)
                .unwrap_or(false);
            if is_large && self.large_frame_accumulation_count == 0 {
                self.begin_large_frame_accumulation(
                    frame_size_kbits,
                    self.large_frame_accumulation_spread,
                );
                frame_size_kbits = 0.0;
            } else {
                self.delta_frame_size_avg_kbits.apply(1.0, frame_size_kbits);
            }
            self.key_frame_ratio.apply(1.0, 0.0);
        }
        self.accumulator += frame_size_kbits;
        self.cap_accumulator();
    }

    /// Drain one frame interval's worth of budget from the bucket. Call once
    /// per expected frame interval.
    pub fn leak(&mut self, input_frame_rate_fps: u32) {
        if !self.enabled || input_frame_rate_fps < 1 || self.target_bitrate_kbps <= 0.0 {
            return;
        }
        self.large_frame_accumulation_spread =
            (0.5 * input_frame_rate_fps as f32).max(MIN_SPREAD_FRAMES);
        if self.large_frame_accumulation_count > 0 {
            self.accumulator += self.large_frame_accumulation_chunk_size;
            self.large_frame_accumulation_count -= 1;
        }
        self.accumulator -= self.target_bitrate_kbps / input_frame_rate_fps as f32;
        if self.accumulator < 0.0 {
            self.accumulator = 0.0;
        }
    }

    /// Answer whether the current candidate frame should be dropped. Must be
    /// called once per candidate frame.
    pub fn drop_frame(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        if self.drop_next {
            // A previous overflow latched this drop; dropping frees no
            // queued bytes, so it fires even if the bucket has drained.
            self.drop_next = false;
            self.drop_count += 1;
            self.record_drop_decision(true);
            return true;
        }
        if self.accumulator > self.accumulator_max {
            let max_consecutive =
                (self.incoming_frame_rate * self.opts.max_drop_duration_secs).max(1.0) as u32;
            if self.drop_count >= max_consecutive {
                // Bound on consecutive drops reached; force-accept one
                // frame to keep the stream alive.
                debug!(
                    accumulator = self.accumulator,
                    accumulator_max = self.accumulator_max,
                    max_consecutive,
                    "consecutive drop bound hit, forcing a frame through"
                );
                self.drop_count = 0;
                self.record_drop_decision(false);
                return false;
            }
            if self.was_below_max {
                self.drop_next = true;
                debug!(
                    accumulator = self.accumulator,
                    accumulator_max = self.accumulator_max,
                    "bucket overflow, dropping"
                );
            }
            self.was_below_max = false;
            self.drop_count += 1;
            self.record_drop_decision(true);
            return true;
        }
        self.was_below_max = true;
        self.drop_count = 0;
        self.record_drop_decision(false);
        false
    }

    /// Current bucket fill level in kilobits, exposed for diagnostics.
    pub fn accumulator_kbits(&self) -> f32 {
        self.accumulator
    }

    /// Moving average of the recent drop decisions, exposed for diagnostics.
    pub fn drop_ratio(&self) -> f32 {
        self.drop_ratio.filtered().unwrap_or(0.0)
    }

    fn begin_large_frame_accumulation(&mut self, frame_size_kbits: f32, spread: f32) {
        let count = (spread + 0.5) as u32;
        self.large_frame_accumulation_count = count.max(1);
        self.large_frame_accumulation_chunk_size =
            frame_size_kbits / self.large_frame_accumulation_count as f32;
    }

    fn record_drop_decision(&mut self, dropped: bool) {
        // React faster while far above capacity.
        if self.accumulator > 1.3 * self.accumulator_max {
            self.drop_ratio.update_base(DROP_RATIO_FAST_ALPHA);
        } else {
            self.drop_ratio.update_base(DROP_RATIO_ALPHA);
        }
        self.drop_ratio.apply(1.0, if dropped { 1.0 } else { 0.0 });
    }

    fn cap_accumulator(&mut self) {
        let cap = self.target_bitrate_kbps * self.opts.accumulator_cap_secs;
        if self.accumulator > cap {
            self.accumulator = cap;
        }
    }
}

impl Default for FrameDropper {
    fn default() -> Self {
        Self::new(FrameDropperOptions::default())
    }
}
