//! Message-passing ownership of a [`RateController`].
//!
//! Every estimator instance has exactly one owner. When the control loop
//! lives on its own thread, collaborators submit events through a bounded
//! channel instead of sharing the controller; the worker applies them in
//! order and answers frame ticks with a rate snapshot.

use kanal::{Receiver, Sender};
use thiserror::Error;
use tracing::trace;

use rateflow_bwe::{ArrivalSample, CongestionState};

use crate::controller::{RateController, RateControllerOptions};

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker thread is gone or the channel was closed.
    #[error("rate control worker disconnected")]
    Disconnected,
}

/// Inputs accepted by the control worker, applied in submission order.
#[derive(Clone, Copy, Debug)]
pub enum ControlEvent {
    /// One packet group from the pacing/grouping module.
    Arrival(ArrivalSample),
    /// Acknowledged bytes for throughput estimation.
    Ack { now_ms: i64, bytes: i64 },
    /// One frame returned by the encoder.
    EncodedFrame { size_bytes: usize, is_key_frame: bool },
    /// One expected frame interval elapsed; answered with a [`RateSnapshot`].
    FrameTick,
    /// Hint that the available rate is about to change abruptly.
    ExpectFastRateChange,
    /// Discard all accumulated history.
    Reset,
    Shutdown,
}

/// Controller outputs published once per frame tick.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateSnapshot {
    pub state: CongestionState,
    pub target_bitrate_kbps: Option<f64>,
    pub throughput_bps: Option<u32>,
    /// Whether the frame due at this tick should be dropped.
    pub drop_frame: bool,
}

/// Caller-side handle; cheap to clone and share across producer threads.
#[derive(Clone)]
pub struct ControlHandle {
    event_tx: Sender<ControlEvent>,
    snapshot_rx: Receiver<RateSnapshot>,
}

impl ControlHandle {
    /// Submit one event without waiting for its effect.
    pub fn submit(&self, event: ControlEvent) -> Result<(), WorkerError> {
        self.event_tx
            .send(event)
            .map_err(|_| WorkerError::Disconnected)
    }

    /// Advance one frame interval and wait for the resulting snapshot.
    pub fn frame_tick(&self) -> Result<RateSnapshot, WorkerError> {
        self.submit(ControlEvent::FrameTick)?;
        self.snapshot_rx
            .recv()
            .map_err(|_| WorkerError::Disconnected)
    }

    pub fn shutdown(&self) -> Result<(), WorkerError> {
        self.submit(ControlEvent::Shutdown)
    }
}

/// Owns the controller and applies submitted events on its own thread.
pub struct ControlWorker {
    controller: RateController,
    event_rx: Receiver<ControlEvent>,
    snapshot_tx: Sender<RateSnapshot>,
}

impl ControlWorker {
    /// Run the blocking event loop. Call from a dedicated thread.
    pub fn run(mut self) {
        trace!("rate control worker started");
        while let Ok(event) = self.event_rx.recv() {
            match event {
                ControlEvent::Arrival(sample) => self.controller.on_arrival(sample),
                ControlEvent::Ack { now_ms, bytes } => self.controller.on_ack(now_ms, bytes),
                ControlEvent::EncodedFrame {
                    size_bytes,
                    is_key_frame,
                } => self.controller.on_frame_encoded(size_bytes, is_key_frame),
                ControlEvent::FrameTick => {
                    self.controller.on_frame_interval();
                    let snapshot = RateSnapshot {
                        state: self.controller.congestion_state(),
                        target_bitrate_kbps: self.controller.target_bitrate_kbps(),
                        throughput_bps: self.controller.throughput_bps(),
                        drop_frame: self.controller.drop_frame(),
                    };
                    if self.snapshot_tx.send(snapshot).is_err() {
                        trace!("snapshot channel closed, stopping");
                        break;
                    }
                }
                ControlEvent::ExpectFastRateChange => self.controller.expect_fast_rate_change(),
                ControlEvent::Reset => self.controller.reset(),
                ControlEvent::Shutdown => break,
            }
        }
        trace!("rate control worker stopped");
    }
}

/// Build a handle/worker pair with bounded channels of `capacity` events.
pub fn channel(opts: RateControllerOptions, capacity: usize) -> (ControlHandle, ControlWorker) {
    let (event_tx, event_rx) = kanal::bounded(capacity);
    let (snapshot_tx, snapshot_rx) = kanal::bounded(capacity);
    let handle = ControlHandle {
        event_tx,
        snapshot_rx,
    };
    let worker = ControlWorker {
        controller: RateController::new(opts),
        event_rx,
        snapshot_tx,
    };
    (handle, worker)
}
