use bitflags::bitflags;
use crate::error::TransportError;
use crate::time_spec::TimeSpec;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StreamMode {
    StartContinuous,
    StopContinuous,
    /// stream `num_samps` samples, then stop
    NumSampsAndDone,
    /// stream `num_samps` samples, and expect another command to be chained seamlessly
    NumSampsAndMore,
}

/// A command starting or stopping a channel's RX data flow
#[derive(Clone, Debug, PartialEq)]
pub struct StreamCmd {
    pub mode: StreamMode,
    pub num_samps: u64,
    /// start as soon as possible rather than at `time_spec`
    pub stream_now: bool,
    pub time_spec: TimeSpec,
}

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    struct CmdFlags: u32 {
        const STREAM_NOW = 1 << 31;
        const CHAIN      = 1 << 30;
        const RELOAD     = 1 << 29;
        const STOP       = 1 << 28;
    }
}

impl StreamCmd {
    pub const MAX_NUM_SAMPS: u64 = 0x0fff_ffff;

    pub fn new(mode: StreamMode) -> StreamCmd {
        StreamCmd {
            mode,
            num_samps: 0,
            stream_now: true,
            time_spec: TimeSpec::ZERO,
        }
    }

    pub fn num_samps(mode: StreamMode, num_samps: u64) -> StreamCmd {
        StreamCmd {
            num_samps,
            ..StreamCmd::new(mode)
        }
    }

    pub fn at(mut self, time_spec: TimeSpec) -> StreamCmd {
        self.stream_now = false;
        self.time_spec = time_spec;
        self
    }

    /// Encode as the device's three command words: flags and sample count, then the start time
    ///  in ticks (upper and lower 32 bits).
    pub fn encode(&self, tick_rate: f64) -> anyhow::Result<[u32; 3]> {
        if self.num_samps > Self::MAX_NUM_SAMPS {
            return Err(TransportError::InvalidArgument(format!(
                "a stream command can request at most {} samples, got {}. Split the request into several commands", Self::MAX_NUM_SAMPS, self.num_samps)).into());
        }

        let (flags, with_samps) = match self.mode {
            StreamMode::StartContinuous => (CmdFlags::CHAIN, false),
            StreamMode::StopContinuous => (CmdFlags::STOP, false),
            StreamMode::NumSampsAndDone => (CmdFlags::empty(), true),
            StreamMode::NumSampsAndMore => (CmdFlags::CHAIN, true),
        };
        let mut flags = flags;
        if self.stream_now {
            flags |= CmdFlags::STREAM_NOW;
        }

        let samps = match (with_samps, self.mode) {
            (true, _) => self.num_samps as u32,
            (false, StreamMode::StopContinuous) => 0,
            (false, _) => 1,
        };

        let ticks = if self.stream_now { 0 } else { self.time_spec.to_ticks(tick_rate) };
        Ok([flags.bits() | samps, (ticks >> 32) as u32, ticks as u32])
    }
}
