//! Streaming data plane for software defined radio devices.
//!
//! Samples travel between host and device in CHDR or VRT packets over a zero-copy transport
//!  (UDP, PCIe DMA, USB or in-process memory). On top of that, this crate provides
//!  credit-based flow control in both directions, RX and TX streamers converting between wire
//!  and host sample formats, async device messages, and a [session](session::DeviceSession)
//!  tying a claimed device's transports and streamers together.

pub mod async_msg;
pub mod buffers;
pub mod config;
pub mod convert;
pub mod ctrl;
pub mod error;
pub mod factory;
pub mod flow_control;
pub mod metadata;
pub mod packet;
pub mod radio;
pub mod safe_converter;
pub mod session;
pub mod sid;
pub mod stream_cmd;
pub mod streamer;
pub mod time_spec;
pub mod util;
pub mod xport;
