//! Sender-side congestion control for real-time media.
//!
//! Ties the delay-based bandwidth estimation of `rateflow-bwe` and the
//! frame admission of `rateflow-dropper` into one control surface:
//!
//! - [`RateController`] — single-threaded composition: feed packet groups
//!   and acks, read back a target bitrate, a congestion state, and
//!   per-frame drop decisions.
//! - [`ControlWorker`] / [`ControlHandle`] — the same controller behind a
//!   bounded channel for deployments that keep rate control on its own
//!   thread.

#![forbid(unsafe_code)]

mod controller;
mod worker;

pub use controller::{RateAllocation, RateController, RateControllerOptions, ThroughputSource};
pub use rateflow_bwe::{
    ArrivalSample, BweOptions, CongestionState, DelayDeltaPair, DelayGradientEstimator,
    DetectorOptions, ThroughputEstimator, ThroughputOptions, TrendlineOptions,
};
pub use rateflow_dropper::{FrameDropper, FrameDropperOptions};
pub use worker::{ControlEvent, ControlHandle, ControlWorker, RateSnapshot, WorkerError, channel};
