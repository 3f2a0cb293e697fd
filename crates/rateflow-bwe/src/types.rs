/// Classification of current network utilization relative to available
/// capacity.
///
/// Produced by the delay gradient estimator after every update. `Overusing`
/// means queuing delay is growing (the sender is pushing more than the path
/// drains), `Underusing` means queues are clearing faster than expected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CongestionState {
    #[default]
    Normal,
    Underusing,
    Overusing,
}

/// One aggregated packet group as reported by the packet-grouping collaborator.
///
/// Groups correspond to send bursts; timestamps are milliseconds on the
/// sender and receiver clocks respectively. Consumed exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArrivalSample {
    pub send_time_ms: i64,
    pub arrival_time_ms: i64,
    pub group_size_bytes: i64,
}

/// Send/receive time deltas between two consecutive packet groups.
///
/// `calculated_deltas` is false when the deltas could not be derived, e.g.
/// because a group was skipped or arrived out of order. Such pairs still
/// flow through the estimator but do not contribute to the regression.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DelayDeltaPair {
    pub recv_delta_ms: f64,
    pub send_delta_ms: f64,
    pub calculated_deltas: bool,
}

impl DelayDeltaPair {
    /// Derive the delta pair from two consecutive arrival samples.
    ///
    /// A non-increasing send time means the groups were reordered (or the
    /// same group was reported twice); the pair is then marked as not
    /// calculated and carries zero deltas.
    pub fn between(prev: &ArrivalSample, current: &ArrivalSample) -> Self {
        if current.send_time_ms <= prev.send_time_ms {
            return Self {
                recv_delta_ms: 0.0,
                send_delta_ms: 0.0,
                calculated_deltas: false,
            };
        }
        Self {
            recv_delta_ms: (current.arrival_time_ms - prev.arrival_time_ms) as f64,
            send_delta_ms: (current.send_time_ms - prev.send_time_ms) as f64,
            calculated_deltas: true,
        }
    }
}
