use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use async_trait::async_trait;
use bitflags::bitflags;
use bytes::BufMut;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use crate::ctrl::RegisterIface;
use crate::error::TransportError;
use crate::packet::Endianness;
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::xport::ZeroCopyTransport;

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    struct FwFlags: u32 {
        /// request: please reply. reply: request was executed
        const ACK    = 0x0000_0001;
        const ERROR  = 0x0000_0002;

        const ECHO   = 0x0001_0000;
        const PEEK32 = 0x0002_0000;
        const POKE32 = 0x0004_0000;
    }
}

/// Request / reply layout, five 32 bit words in network byte order:
///
/// ```ascii
/// id (protocol version << 16 | product id), flags, sequence, address, data
/// ```
const PACKET_LEN: usize = 20;
const PROTOCOL_VERSION: u32 = 1;
const ENDIANNESS: Endianness = Endianness::Big;

#[derive(Debug, Eq, PartialEq)]
struct FwPacket {
    id: u32,
    flags: FwFlags,
    sequence: u32,
    addr: u32,
    data: u32,
}

impl FwPacket {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_word32(self.id, ENDIANNESS);
        buf.put_word32(self.flags.bits(), ENDIANNESS);
        buf.put_word32(self.sequence, ENDIANNESS);
        buf.put_word32(self.addr, ENDIANNESS);
        buf.put_word32(self.data, ENDIANNESS);
    }

    fn deser(mut buf: &[u8]) -> anyhow::Result<FwPacket> {
        if buf.len() != PACKET_LEN {
            bail!("firmware reply has {} bytes, expected {}", buf.len(), PACKET_LEN);
        }
        Ok(FwPacket {
            id: buf.try_get_word32(ENDIANNESS)?,
            flags: FwFlags::from_bits_retain(buf.try_get_word32(ENDIANNESS)?),
            sequence: buf.try_get_word32(ENDIANNESS)?,
            addr: buf.try_get_word32(ENDIANNESS)?,
            data: buf.try_get_word32(ENDIANNESS)?,
        })
    }
}

/// Register access through the firmware's request / reply protocol, over any transport.
///
/// Each request is retried up to `retries` times, each attempt waiting `timeout` for the reply.
///  Replies to earlier (timed out) requests are flushed before a request is sent, and a reply
///  must echo the request's sequence number and address to be accepted.
pub struct FwCtrlClient {
    xport: Arc<dyn ZeroCopyTransport>,
    product_id: u16,
    retries: usize,
    timeout: Duration,
    /// next sequence number - the lock serializes requests
    sequence: Mutex<u32>,
}

impl FwCtrlClient {
    pub fn new(xport: Arc<dyn ZeroCopyTransport>, product_id: u16, retries: usize, timeout: Duration) -> FwCtrlClient {
        FwCtrlClient {
            xport,
            product_id,
            retries: retries.max(1),
            timeout,
            sequence: Mutex::new(rand::random()),
        }
    }

    async fn request(&self, cmd: FwFlags, addr: u32, data: u32) -> anyhow::Result<u32> {
        let mut sequence = self.sequence.lock().await;

        for attempt in 1..=self.retries {
            let request = FwPacket {
                id: (PROTOCOL_VERSION << 16) | self.product_id as u32,
                flags: FwFlags::ACK | cmd,
                sequence: *sequence,
                addr,
                data,
            };
            *sequence = sequence.wrapping_add(1);

            match self.try_request(&request).await {
                Ok(data) => return Ok(data),
                Err(e) => warn!("firmware {} of {:#x} failed (attempt {} of {}): {}", Self::cmd_name(cmd), addr, attempt, self.retries, e),
            }
        }

        Err(TransportError::DeviceNotResponding {
            operation: format!("{} {:#x}", Self::cmd_name(cmd), addr),
            attempts: self.retries,
        }.into())
    }

    fn cmd_name(cmd: FwFlags) -> &'static str {
        if cmd.contains(FwFlags::PEEK32) { "peek32" }
        else if cmd.contains(FwFlags::POKE32) { "poke32" }
        else { "echo" }
    }

    async fn try_request(&self, request: &FwPacket) -> anyhow::Result<u32> {
        self.flush().await;

        let Some(mut buf) = self.xport.get_send_buff(self.timeout).await else {
            bail!("no send buffer");
        };
        request.ser(buf.buf_mut());
        buf.commit(PACKET_LEN).await?;

        let Some(reply) = self.xport.get_recv_buff(self.timeout).await else {
            bail!("reply timed out");
        };
        let reply = FwPacket::deser(reply.as_ref())?;
        trace!("firmware reply {:?}", reply);

        if reply.flags.contains(FwFlags::ERROR) {
            bail!("device reported an error");
        }
        if !reply.flags.contains(FwFlags::ACK) || !reply.flags.contains(request.flags - FwFlags::ACK) {
            bail!("reply flags {:?} do not acknowledge {:?}", reply.flags, request.flags);
        }
        if reply.sequence != request.sequence || reply.addr != request.addr {
            bail!("reply for sequence {} / address {:#x} does not match the request", reply.sequence, reply.addr);
        }
        Ok(reply.data)
    }

    /// discard replies that arrived after their request timed out
    async fn flush(&self) {
        let mut num_flushed = 0;
        while self.xport.get_recv_buff(Duration::ZERO).await.is_some() {
            num_flushed += 1;
        }
        if num_flushed > 0 {
            debug!("flushed {} stale firmware replies", num_flushed);
        }
    }

    /// Check that the firmware responds at all
    pub async fn echo(&self) -> anyhow::Result<()> {
        self.request(FwFlags::ECHO, 0, 0).await.map(|_| ())
    }
}

#[async_trait]
impl RegisterIface for FwCtrlClient {
    async fn peek32(&self, addr: u32) -> anyhow::Result<u32> {
        self.request(FwFlags::PEEK32, addr, 0).await
    }

    async fn poke32(&self, addr: u32, data: u32) -> anyhow::Result<()> {
        self.request(FwFlags::POKE32, addr, data).await.map(|_| ())
    }

    async fn peek64(&self, addr: u32) -> anyhow::Result<u64> {
        let lo = self.peek32(addr).await? as u64;
        let hi = self.peek32(addr + 4).await? as u64;
        Ok((hi << 32) | lo)
    }
}
