use crate::sid::Sid;

/// Fatal conditions that make a channel or a whole device session unusable.
///
/// Setup APIs return `anyhow::Result`; errors in this enum are wrapped into `anyhow::Error` so
///  callers that need to react to a specific category can `downcast_ref::<TransportError>()`.
///  Routine conditions (timeouts, sequence gaps, late commands, underflows) are *not* represented
///  here - they are reported through metadata.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("expected {what} compatibility number {expected}, but the device reports {actual}. Please update the firmware and FPGA images (or the host library) so that they match")]
    VersionMismatch {
        what: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("no {resource} left for stream {sid}: all {capacity} are allocated. Close unused streamers or reduce the number of channels")]
    ResourceExhausted {
        resource: &'static str,
        sid: Sid,
        capacity: usize,
    },

    #[error("the device is claimed by another process (claim token {token:#010x}). Close the other application or wait {stale_after_secs}s for the claim to become stale")]
    ClaimConflict {
        token: u32,
        stale_after_secs: u64,
    },

    #[error("device not responding: {operation} failed after {attempts} attempts. Check the network / PCIe connection and the device's power")]
    DeviceNotResponding {
        operation: String,
        attempts: usize,
    },

    #[error("the device did not acknowledge the routing entry for {sid} (wrote {expected:#010x}, read back {actual:#010x}). Check the interface configuration")]
    RoutingNotAcknowledged {
        sid: Sid,
        expected: u32,
        actual: u32,
    },

    #[error("TX flow control stalled: {stalls} timeouts in a row without an acknowledgement from the device, {in_flight} packets in flight. Check that the device is running and its flow control responses reach the host")]
    FlowControlStalled {
        in_flight: u32,
        stalls: u32,
    },

    #[error("DMA channels are still active from a previous session. Wait a moment and retry, or reset the device")]
    DmaBusy,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
