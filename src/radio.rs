//! The per-radio control collaborator: clock and time, stream commands, and the device side of
//!  flow control. Streamers and the device session only talk to radios through [RadioCtrl].

use std::sync::{Arc, Mutex};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::debug;
use crate::ctrl::{regs, RegisterIface};
use crate::sid::Sid;
use crate::stream_cmd::StreamCmd;
use crate::time_spec::TimeSpec;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RadioCtrl: Send + Sync + 'static {
    fn tick_rate(&self) -> f64;
    fn set_tick_rate(&self, tick_rate: f64);

    async fn get_time_now(&self) -> anyhow::Result<TimeSpec>;
    async fn set_time_next_pps(&self, time: TimeSpec) -> anyhow::Result<()>;

    async fn issue_stream_cmd(&self, channel: usize, cmd: &StreamCmd) -> anyhow::Result<()>;

    /// Configure the device to send RX data on `sid` with a window of `window_packets`, expecting
    ///  an ACK from the host every `ack_every` packets
    async fn setup_rx_flow_control(&self, channel: usize, sid: Sid, window_packets: usize, ack_every: usize) -> anyhow::Result<()>;
    /// Configure the device to report consumed TX packets on `sid` every `response_every` packets
    async fn setup_tx_flow_control(&self, channel: usize, sid: Sid, response_every: usize) -> anyhow::Result<()>;
}

/// per-radio register offsets, in 32 bit words relative to the radio's base
mod offsets {
    pub const TIME_NOW_LO: u32 = 0x00;
    pub const TIME_NEXT_HI: u32 = 0x02;
    pub const TIME_NEXT_LO: u32 = 0x03;
    pub const TIME_CTRL: u32 = 0x04;

    pub const RX_CMD: u32 = 0x10;
    pub const RX_CMD_TIME_HI: u32 = 0x11;
    /// writing the lower time word issues the command
    pub const RX_CMD_TIME_LO: u32 = 0x12;

    pub const RX_SID: u32 = 0x18;
    pub const RX_FC_WINDOW: u32 = 0x19;
    pub const RX_FC_ACK_EVERY: u32 = 0x1a;
    pub const RX_FC_ENABLE: u32 = 0x1b;

    pub const TX_SID: u32 = 0x20;
    pub const TX_FC_RESPONSE_EVERY: u32 = 0x21;
    pub const TX_FC_ENABLE: u32 = 0x22;
}

const TIME_CTRL_LATCH_NEXT_PPS: u32 = 1 << 1;

/// [RadioCtrl] on top of plain register access
pub struct RegisterRadioCtrl {
    iface: Arc<dyn RegisterIface>,
    tick_rate: Mutex<f64>,
}

impl RegisterRadioCtrl {
    pub fn new(iface: Arc<dyn RegisterIface>, tick_rate: f64) -> RegisterRadioCtrl {
        RegisterRadioCtrl {
            iface,
            tick_rate: Mutex::new(tick_rate),
        }
    }
}

#[async_trait]
impl RadioCtrl for RegisterRadioCtrl {
    fn tick_rate(&self) -> f64 {
        *self.tick_rate.lock().unwrap()
    }

    fn set_tick_rate(&self, tick_rate: f64) {
        *self.tick_rate.lock().unwrap() = tick_rate;
    }

    async fn get_time_now(&self) -> anyhow::Result<TimeSpec> {
        let ticks = self.iface.peek64(regs::radio(0, offsets::TIME_NOW_LO)).await?;
        Ok(TimeSpec::from_ticks(ticks, self.tick_rate()))
    }

    async fn set_time_next_pps(&self, time: TimeSpec) -> anyhow::Result<()> {
        let ticks = time.to_ticks(self.tick_rate());
        self.iface.poke32(regs::radio(0, offsets::TIME_NEXT_HI), (ticks >> 32) as u32).await?;
        self.iface.poke32(regs::radio(0, offsets::TIME_NEXT_LO), ticks as u32).await?;
        self.iface.poke32(regs::radio(0, offsets::TIME_CTRL), TIME_CTRL_LATCH_NEXT_PPS).await
    }

    async fn issue_stream_cmd(&self, channel: usize, cmd: &StreamCmd) -> anyhow::Result<()> {
        let [cmd_word, time_hi, time_lo] = cmd.encode(self.tick_rate())?;
        debug!("stream command {:?} on channel {}", cmd.mode, channel);

        self.iface.poke32(regs::radio(channel, offsets::RX_CMD), cmd_word).await?;
        self.iface.poke32(regs::radio(channel, offsets::RX_CMD_TIME_HI), time_hi).await?;
        self.iface.poke32(regs::radio(channel, offsets::RX_CMD_TIME_LO), time_lo).await
    }

    async fn setup_rx_flow_control(&self, channel: usize, sid: Sid, window_packets: usize, ack_every: usize) -> anyhow::Result<()> {
        self.iface.poke32(regs::radio(channel, offsets::RX_SID), sid.to_raw()).await?;
        self.iface.poke32(regs::radio(channel, offsets::RX_FC_WINDOW), window_packets as u32).await?;
        self.iface.poke32(regs::radio(channel, offsets::RX_FC_ACK_EVERY), ack_every as u32).await?;
        self.iface.poke32(regs::radio(channel, offsets::RX_FC_ENABLE), 1).await
    }

    async fn setup_tx_flow_control(&self, channel: usize, sid: Sid, response_every: usize) -> anyhow::Result<()> {
        self.iface.poke32(regs::radio(channel, offsets::TX_SID), sid.to_raw()).await?;
        self.iface.poke32(regs::radio(channel, offsets::TX_FC_RESPONSE_EVERY), response_every as u32).await?;
        self.iface.poke32(regs::radio(channel, offsets::TX_FC_ENABLE), 1).await
    }
}
