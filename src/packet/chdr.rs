//! The CHDR header:
//!
//! ```ascii
//! 63:62  packet type: 00 data, 01 flow control, 10 command, 11 response
//! 61     has time: a 64 bit timestamp follows the header
//! 60     end of burst (data packets) / error (responses)
//! 59:48  sequence number (12 bits, wrapping)
//! 47:32  packet length in bytes, including header and timestamp
//! 31:0   SID
//! ```
//!
//! The header is two 32 bit items (bits 63:32 first), optionally followed by the timestamp.

use anyhow::{anyhow, bail};
use bytes::BufMut;
use crate::packet::{Endianness, IfPacketInfo, PacketType};
use crate::safe_converter::SafeCast;
use crate::sid::Sid;
use crate::util::buf_ext::{BufExt, BufMutExt};

pub const MAX_HEADER_LEN: usize = 16;

pub const SEQ_MODULUS: u16 = 4096;
pub const SEQ_MASK: u16 = SEQ_MODULUS - 1;

const TYPE_DATA: u32 = 0b00;
const TYPE_FC: u32 = 0b01;
const TYPE_CMD: u32 = 0b10;
const TYPE_RESP: u32 = 0b11;

const FLAG_HAS_TIME: u32 = 1 << 29;
const FLAG_EOB_OR_ERROR: u32 = 1 << 28;

pub fn pack(info: &mut IfPacketInfo, buf: &mut impl BufMut, endianness: Endianness) -> anyhow::Result<usize> {
    let sid = info.sid.ok_or_else(|| anyhow!("CHDR packets require a SID"))?;
    if info.tsi.is_some() || info.class_id.is_some() || info.trailer.is_some() {
        bail!("CHDR packets have no integer timestamp, class id or trailer");
    }

    let (packet_type, flag) = match info.packet_type {
        PacketType::Data => (TYPE_DATA, info.eob),
        PacketType::FlowControl => (TYPE_FC, false),
        PacketType::Command => (TYPE_CMD, false),
        PacketType::Response => (TYPE_RESP, false),
        PacketType::Error => (TYPE_RESP, true),
        other => bail!("packet type {:?} can not be represented in CHDR", other),
    };

    let header_len = if info.tsf.is_some() { 16 } else { 8 };
    let packet_len = header_len + info.num_payload_bytes;
    let Ok(packet_len_u16) = u16::try_from(packet_len) else {
        bail!("CHDR packet length {} exceeds the 16 bit length field", packet_len);
    };
    if buf.remaining_mut() < header_len {
        bail!("buffer too small for CHDR header");
    }

    let mut upper = (packet_type << 30)
        | (((info.packet_count & SEQ_MASK) as u32) << 16)
        | packet_len_u16 as u32;
    if info.tsf.is_some() {
        upper |= FLAG_HAS_TIME;
    }
    if flag {
        upper |= FLAG_EOB_OR_ERROR;
    }

    buf.put_word32(upper, endianness);
    buf.put_word32(sid.to_raw(), endianness);
    if let Some(tsf) = info.tsf {
        buf.put_word32((tsf >> 32) as u32, endianness);
        buf.put_word32(tsf as u32, endianness);
    }

    info.num_header_words32 = header_len / 4;
    info.num_packet_words32 = packet_len.div_ceil(4);
    Ok(header_len)
}

pub fn unpack(frame: &[u8], endianness: Endianness) -> anyhow::Result<IfPacketInfo> {
    let mut buf = frame;
    let upper = buf.try_get_word32(endianness)?;
    let sid = Sid::from_raw(buf.try_get_word32(endianness)?);

    let has_time = upper & FLAG_HAS_TIME != 0;
    let flag = upper & FLAG_EOB_OR_ERROR != 0;
    let packet_count = ((upper >> 16) as u16) & SEQ_MASK;
    let packet_len: usize = (upper as u16).safe_cast();

    let tsf = if has_time {
        let hi = buf.try_get_word32(endianness)? as u64;
        let lo = buf.try_get_word32(endianness)? as u64;
        Some((hi << 32) | lo)
    }
    else {
        None
    };
    let header_len = if has_time { 16 } else { 8 };

    if packet_len < header_len {
        bail!("CHDR packet length {} is shorter than its header", packet_len);
    }
    if packet_len > frame.len() {
        bail!("CHDR packet length {} exceeds the received frame of {} bytes", packet_len, frame.len());
    }

    let packet_type = match upper >> 30 {
        TYPE_DATA => PacketType::Data,
        TYPE_FC => PacketType::FlowControl,
        TYPE_CMD => PacketType::Command,
        _ if flag => PacketType::Error,
        _ => PacketType::Response,
    };

    Ok(IfPacketInfo {
        packet_type,
        sid: Some(sid),
        packet_count,
        tsi: None,
        tsf,
        class_id: None,
        trailer: None,
        sob: false,
        eob: packet_type == PacketType::Data && flag,
        num_payload_bytes: packet_len - header_len,
        num_header_words32: header_len / 4,
        num_packet_words32: packet_len.div_ceil(4),
    })
}

pub fn extract_sid(frame: &[u8], endianness: Endianness) -> Option<Sid> {
    let mut buf = frame.get(4..8)?;
    buf.try_get_word32(endianness).ok().map(Sid::from_raw)
}
