//! Encoder-side frame admission for rate-limited video.
//!
//! When the encoder overshoots its bitrate budget the only lever left on
//! the sender is to not transmit some frames at all. [`FrameDropper`] keeps
//! a leaky bucket of queued kilobits and answers, per candidate frame,
//! whether it should be dropped.

#![forbid(unsafe_code)]

mod dropper;
mod filter;

pub use dropper::{FrameDropper, FrameDropperOptions};
pub use filter::ExpFilter;
