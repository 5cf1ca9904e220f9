//! Transport factories turn a stream's SID and purpose into a connected [BothXports], allocating
//!  the medium's resources (DMA channels, network interfaces and routing entries) on the way.
//!
//! Allocations are recorded in a [registry::TransportRegistry] owned by the factory, so asking
//!  twice for the same SID yields the same transports. Everything is released when the device
//!  session shuts the factory down.

pub mod eth;
pub mod pcie;
pub mod registry;

use async_trait::async_trait;
use crate::config::TransportArgs;
use crate::sid::Sid;
use crate::xport::{BothXports, XportPurpose};

#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    /// `sid` is the SID of packets the host sends; the returned transports receive packets
    ///  with the reversed SID
    async fn make_transport(&self, sid: Sid, purpose: XportPurpose, args: &TransportArgs) -> anyhow::Result<BothXports>;

    /// the transport arguments this medium works best with
    fn default_args(&self) -> TransportArgs;

    /// release all transports handed out so far
    async fn shutdown(&self);
}

/// Assigns SIDs to a session's streams: the host's address and the device's address, with fixed
///  endpoints for control and async messages and one endpoint per data channel and direction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SidFramer {
    pub host_addr: u8,
    pub device_addr: u8,
}

impl SidFramer {
    pub const CTRL_ENDPOINT: u8 = 0x00;
    pub const ASYNC_ENDPOINT: u8 = 0x01;
    pub const RX_DATA_BASE: u8 = 0x10;
    pub const TX_DATA_BASE: u8 = 0x20;

    pub fn new(host_addr: u8, device_addr: u8) -> SidFramer {
        SidFramer { host_addr, device_addr }
    }

    /// The SID of packets the host sends for the given purpose and channel. Ctrl and async
    ///  message streams ignore the channel.
    pub fn send_sid(&self, purpose: XportPurpose, channel: usize) -> Sid {
        let endpoint = match purpose {
            XportPurpose::Ctrl => Self::CTRL_ENDPOINT,
            XportPurpose::AsyncMsg => Self::ASYNC_ENDPOINT,
            XportPurpose::RxData => Self::RX_DATA_BASE + channel as u8,
            XportPurpose::TxData => Self::TX_DATA_BASE + channel as u8,
        };
        Sid::new(self.host_addr, endpoint, self.device_addr, endpoint)
    }
}
