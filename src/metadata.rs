//! Per-call metadata of streamers and async device events.
//!
//! Routine device conditions (late commands, broken chains, overflows, underflows) are reported
//!  here as codes rather than as errors - they are expected in normal operation.

use std::fmt::{Display, Formatter};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use crate::time_spec::TimeSpec;

#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default, TryFromPrimitive, IntoPrimitive)]
pub enum RxErrorCode {
    #[default]
    None = 0x0,
    /// no packet arrived within the timeout
    Timeout = 0x1,
    /// a stream command was issued with a time in the past
    LateCommand = 0x2,
    /// a chained stream command did not arrive in time
    BrokenChain = 0x4,
    /// the host did not keep up, and packets were dropped
    Overflow = 0x8,
    /// the channels of a multi-channel streamer could not be time aligned
    Alignment = 0xC,
    /// a packet could not be parsed
    BadPacket = 0xF,
}

impl RxErrorCode {
    /// Decode the code of an in-band error packet. Unknown codes are reported as bad packets.
    pub fn from_wire(word: u32) -> RxErrorCode {
        RxErrorCode::try_from_primitive(word & 0xff).unwrap_or(RxErrorCode::BadPacket)
    }
}

impl Display for RxErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RxErrorCode::None => "no error",
            RxErrorCode::Timeout => "timeout",
            RxErrorCode::LateCommand => "late command",
            RxErrorCode::BrokenChain => "broken chain",
            RxErrorCode::Overflow => "overflow",
            RxErrorCode::Alignment => "alignment",
            RxErrorCode::BadPacket => "bad packet",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RxMetadata {
    pub has_time_spec: bool,
    /// time of the first sample returned
    pub time_spec: TimeSpec,
    /// the wire packet has samples left that did not fit into the caller's buffer
    pub more_fragments: bool,
    /// offset in samples of the returned data inside its wire packet
    pub fragment_offset: usize,
    pub start_of_burst: bool,
    pub end_of_burst: bool,
    pub error_code: RxErrorCode,
    /// with an overflow: set if packets were lost (as opposed to the device stopping)
    pub out_of_sequence: bool,
}

impl RxMetadata {
    pub fn reset(&mut self) {
        *self = RxMetadata::default();
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TxMetadata {
    pub has_time_spec: bool,
    /// transmit the first sample at this time rather than immediately
    pub time_spec: TimeSpec,
    pub start_of_burst: bool,
    pub end_of_burst: bool,
}

/// Event codes of async messages. These are bit values, but devices report one at a time;
///  a value outside the known set is kept as `Other` rather than dropped.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
pub enum EventCode {
    BurstAck = 0x01,
    Underflow = 0x02,
    SeqError = 0x04,
    TimeError = 0x08,
    UnderflowInPacket = 0x10,
    SeqErrorInBurst = 0x20,
    UserPayload = 0x40,
    #[num_enum(catch_all)]
    Other(u8),
}

impl EventCode {
    /// the classic one-letter console marker for error events
    pub fn marker(&self) -> Option<&'static str> {
        match self {
            EventCode::Underflow | EventCode::UnderflowInPacket => Some("U"),
            EventCode::SeqError | EventCode::SeqErrorInBurst => Some("S"),
            EventCode::TimeError => Some("L"),
            _ => None,
        }
    }
}

/// An asynchronous event reported by the device for a TX stream
#[derive(Clone, Debug, PartialEq)]
pub struct AsyncMetadata {
    pub channel: usize,
    pub has_time_spec: bool,
    pub time_spec: TimeSpec,
    pub event_code: EventCode,
    /// vendor specific payload, valid for [EventCode::UserPayload]
    pub user_payload: [u32; 4],
}

impl AsyncMetadata {
    pub fn new(channel: usize, event_code: EventCode) -> AsyncMetadata {
        AsyncMetadata {
            channel,
            has_time_spec: false,
            time_spec: TimeSpec::ZERO,
            event_code,
            user_payload: [0; 4],
        }
    }
}
