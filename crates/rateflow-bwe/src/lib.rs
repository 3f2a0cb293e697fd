//! Delay-based bandwidth estimation for real-time media senders.
//!
//! This crate is the measurement side of the rate-shaping pipeline. It turns
//! packet-group arrival timing into a congestion classification and acked
//! byte counts into a throughput estimate:
//!
//! - [`DelayGradientEstimator`] fits a trend line to smoothed one-way delay
//!   variations and classifies the network as Normal / Overusing /
//!   Underusing through an embedded [`AdaptiveThresholdDetector`].
//! - [`ThroughputEstimator`] maintains a sliding byte window and folds each
//!   window's rate into a Bayesian belief with explicit uncertainty.
//!
//! Everything here is a pure, single-owner computation over small fixed-size
//! state: no I/O, no clocks, no shared mutation. Invalid inputs are
//! discarded and insufficient data is reported as `None`, never as an error
//! (a single bad sample must not destabilize a live session).

#![forbid(unsafe_code)]

mod config;
mod detector;
mod throughput;
mod trendline;
mod types;

pub use config::{BweOptions, DetectorOptions, ThroughputOptions, TrendlineOptions};
pub use detector::AdaptiveThresholdDetector;
pub use throughput::ThroughputEstimator;
pub use trendline::DelayGradientEstimator;
pub use types::{ArrivalSample, CongestionState, DelayDeltaPair};
