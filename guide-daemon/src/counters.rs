//! Process telemetry. Not part of the wire protocol; logged periodically
//! and folded into the `CLIENTS` diagnostic reply's neighborhood so an
//! operator watching the socket can see the loop is making progress.

#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub frames_acquired: u64,
    pub camera_timeouts: u64,
    pub commands_accepted: u64,
    pub commands_rejected: u64,
}
