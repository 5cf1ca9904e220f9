//! The application-facing API: [rx::RxStreamer] and [tx::TxStreamer] move samples between
//!  application buffers and the device, one transport pair per channel.
//!
//! A streamer is bound to a fixed set of channels for its lifetime. `recv()` / `send()` take
//!  `&self` but serialize internally: one call in flight per streamer is the expected usage.
//!  Sample rates and the tick rate can change while a streamer is alive; the device session
//!  pushes changes through [StreamerHandle].

pub mod rx;
pub mod tx;

use crate::config::StreamOptions;
use crate::convert::OtwFormat;
use crate::packet::HeaderCodec;
use crate::time_spec::TimeSpec;
use crate::xport::BothXports;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StreamRates {
    /// device clock rate, i.e. the unit of header timestamps
    pub tick_rate: f64,
    pub samp_rate: f64,
}

impl StreamRates {
    /// time of the sample `offset` samples after a packet timestamped `tsf`
    pub fn time_at(&self, tsf: u64, offset: usize) -> TimeSpec {
        TimeSpec::from_ticks(tsf, self.tick_rate) + TimeSpec::from_secs_f64(offset as f64 / self.samp_rate)
    }

    /// tick count of the sample `offset` samples after a packet timestamped `tsf`
    ///
    /// The offset is converted through `f64`, which is exact up to 2^53 ticks. Rates are
    ///  expected to be positive: a negative or NaN tick offset counts as 0, and the result
    ///  saturates at `u64::MAX` instead of wrapping.
    pub fn ticks_at(&self, tsf: u64, offset: usize) -> u64 {
        // float to int casts saturate
        tsf.saturating_add((offset as f64 * self.tick_rate / self.samp_rate).round() as u64)
    }
}

/// Framing parameters shared by all channels of a streamer
#[derive(Clone, Debug)]
pub struct StreamerSetup {
    pub codec: HeaderCodec,
    pub otw_format: OtwFormat,
    pub rates: StreamRates,
    pub options: StreamOptions,
}

/// One channel of a streamer: the device channel index and its transports
#[derive(Clone, Debug)]
pub struct StreamChannel {
    pub channel: usize,
    pub xports: BothXports,
}

/// What a device session may do with a streamer the application owns
pub trait StreamerHandle: Send + Sync {
    fn channels(&self) -> Vec<usize>;
    fn set_tick_rate(&self, tick_rate: f64);
    fn set_samp_rate(&self, samp_rate: f64);
}
