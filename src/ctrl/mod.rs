//! Low-rate register access to the device, and what builds on it directly: the compat check at
//!  session setup and the device [claim](claim::Claimer).

pub mod claim;
pub mod fw_ctrl;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::{debug, error};
use crate::error::TransportError;

/// Register map of the firmware / FPGA control space
pub mod regs {
    /// readback: major compat number in bits 31:16, minor in bits 15:0
    pub const COMPAT_NUM: u32 = 0x0000;

    pub const CLAIM_TOKEN: u32 = 0x0010;
    /// unix seconds of the most recent claim refresh
    pub const CLAIM_TIME: u32 = 0x0014;

    /// readback: one bit per DMA channel that is still active
    pub const DMA_STATUS: u32 = 0x0020;
    /// writing 0 disables all DMA FIFOs on the device side
    pub const DMA_FIFO_CTRL: u32 = 0x0024;

    /// one entry per destination endpoint: the interface returning packets are forwarded to
    pub const ROUTING_TABLE_BASE: u32 = 0x1000;

    pub const RADIO_BASE: u32 = 0x8000;
    pub const RADIO_STRIDE: u32 = 0x0100;

    pub fn routing_entry(dst_endpoint: u8) -> u32 {
        ROUTING_TABLE_BASE + dst_endpoint as u32 * 4
    }

    pub fn radio(channel: usize, offset: u32) -> u32 {
        RADIO_BASE + channel as u32 * RADIO_STRIDE + offset * 4
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegisterIface: Send + Sync + 'static {
    async fn peek32(&self, addr: u32) -> anyhow::Result<u32>;
    async fn poke32(&self, addr: u32, data: u32) -> anyhow::Result<()>;
    /// a 64 bit register: the lower half at `addr`, the upper half at `addr + 4`
    async fn peek64(&self, addr: u32) -> anyhow::Result<u64>;
}

/// Verify that the device's FPGA image speaks the protocol this host code expects, returning
///  the device's full compat number. A major mismatch is fatal: header layouts and register maps
///  would silently disagree.
pub async fn check_fpga_compat(iface: &dyn RegisterIface, expected_major: u32) -> anyhow::Result<u32> {
    let compat = iface.peek32(regs::COMPAT_NUM).await?;
    let major = compat >> 16;
    if major != expected_major {
        error!("FPGA compat number mismatch: expected {}, device reports {}.{}", expected_major, major, compat & 0xffff);
        return Err(TransportError::VersionMismatch {
            what: "FPGA",
            expected: expected_major,
            actual: major,
        }.into());
    }
    debug!("FPGA compat number {}.{}", major, compat & 0xffff);
    Ok(compat)
}
