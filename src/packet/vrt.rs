//! The VITA-49 IF data header as used by the older product lines.
//!
//! ```ascii
//! header word:
//!   31:28  packet type: 0 IF data, 1 IF data with SID, 2 ext data, 3 ext data with SID, 4 context
//!   27     class id present
//!   26     trailer present
//!   25     start of burst
//!   24     end of burst
//!   23:22  integer timestamp kind (0 = none)
//!   21:20  fractional timestamp kind (0 = none)
//!   19:16  packet count (4 bits, wrapping)
//!   15:0   packet size in 32 bit words, including header and trailer
//! [stream id]           1 word
//! [class id]            2 words
//! [integer timestamp]   1 word
//! [fractional timestamp] 2 words
//! payload
//! [trailer]             1 word
//! ```
//!
//! Payload length is a whole number of 32 bit words.

use anyhow::{anyhow, bail};
use bytes::BufMut;
use crate::packet::{Endianness, IfPacketInfo, PacketType};
use crate::safe_converter::SafeCast;
use crate::sid::Sid;
use crate::util::buf_ext::{BufExt, BufMutExt};

pub const MAX_HEADER_LEN: usize = 7 * 4;

const FLAG_CLASS_ID: u32 = 1 << 27;
const FLAG_TRAILER: u32 = 1 << 26;
const FLAG_SOB: u32 = 1 << 25;
const FLAG_EOB: u32 = 1 << 24;
const TSI_OTHER: u32 = 0b11 << 22;
const TSF_SAMPLE_COUNT: u32 = 0b01 << 20;

const VRT_TYPE_IF: u32 = 0x0;
const VRT_TYPE_IF_SID: u32 = 0x1;
const VRT_TYPE_EXT: u32 = 0x2;
const VRT_TYPE_EXT_SID: u32 = 0x3;
const VRT_TYPE_CONTEXT: u32 = 0x4;

pub fn pack(info: &mut IfPacketInfo, buf: &mut impl BufMut, endianness: Endianness) -> anyhow::Result<usize> {
    let vrt_type = match (info.packet_type, info.sid.is_some()) {
        (PacketType::Data, false) => VRT_TYPE_IF,
        (PacketType::Data, true) => VRT_TYPE_IF_SID,
        (PacketType::Extension, false) => VRT_TYPE_EXT,
        (PacketType::Extension, true) => VRT_TYPE_EXT_SID,
        (PacketType::Context, true) => VRT_TYPE_CONTEXT,
        (PacketType::Context, false) => bail!("VRT context packets require a stream id"),
        (other, _) => bail!("packet type {:?} can not be represented in VRT", other),
    };

    let header_words = 1
        + info.sid.map_or(0, |_| 1)
        + info.class_id.map_or(0, |_| 2)
        + info.tsi.map_or(0, |_| 1)
        + info.tsf.map_or(0, |_| 2);
    let packet_words = header_words + info.num_payload_words32() + info.trailer.map_or(0, |_| 1);
    let Ok(packet_words_u16) = u16::try_from(packet_words) else {
        bail!("VRT packet of {} words exceeds the 16 bit size field", packet_words);
    };
    if buf.remaining_mut() < header_words * 4 {
        bail!("buffer too small for VRT header");
    }

    let mut header = (vrt_type << 28)
        | (((info.packet_count & 0xf) as u32) << 16)
        | packet_words_u16 as u32;
    if info.class_id.is_some() { header |= FLAG_CLASS_ID; }
    if info.trailer.is_some() { header |= FLAG_TRAILER; }
    if info.sob { header |= FLAG_SOB; }
    if info.eob { header |= FLAG_EOB; }
    if info.tsi.is_some() { header |= TSI_OTHER; }
    if info.tsf.is_some() { header |= TSF_SAMPLE_COUNT; }

    buf.put_word32(header, endianness);
    if let Some(sid) = info.sid {
        buf.put_word32(sid.to_raw(), endianness);
    }
    if let Some(class_id) = info.class_id {
        buf.put_word64(class_id, endianness);
    }
    if let Some(tsi) = info.tsi {
        buf.put_word32(tsi, endianness);
    }
    if let Some(tsf) = info.tsf {
        buf.put_word32((tsf >> 32) as u32, endianness);
        buf.put_word32(tsf as u32, endianness);
    }

    info.num_header_words32 = header_words;
    info.num_packet_words32 = packet_words;
    Ok(header_words * 4)
}

/// Write the trailer word after the payload. This is separate from [pack] because the trailer
///  follows the payload.
pub fn pack_trailer(info: &IfPacketInfo, buf: &mut impl BufMut, endianness: Endianness) {
    if let Some(trailer) = info.trailer {
        buf.put_word32(trailer, endianness);
    }
}

pub fn unpack(frame: &[u8], endianness: Endianness) -> anyhow::Result<IfPacketInfo> {
    let mut buf = frame;
    let header = buf.try_get_word32(endianness)?;

    let vrt_type = header >> 28;
    let (packet_type, has_sid) = match vrt_type {
        VRT_TYPE_IF => (PacketType::Data, false),
        VRT_TYPE_IF_SID => (PacketType::Data, true),
        VRT_TYPE_EXT => (PacketType::Extension, false),
        VRT_TYPE_EXT_SID => (PacketType::Extension, true),
        VRT_TYPE_CONTEXT => (PacketType::Context, true),
        other => bail!("unsupported VRT packet type {:#x}", other),
    };

    let sid = if has_sid { Some(Sid::from_raw(buf.try_get_word32(endianness)?)) } else { None };
    let class_id = if header & FLAG_CLASS_ID != 0 { Some(buf.try_get_word64(endianness)?) } else { None };
    let tsi = if header & (0b11 << 22) != 0 { Some(buf.try_get_word32(endianness)?) } else { None };
    let tsf = if header & (0b11 << 20) != 0 {
        let hi = buf.try_get_word32(endianness)? as u64;
        let lo = buf.try_get_word32(endianness)? as u64;
        Some((hi << 32) | lo)
    }
    else {
        None
    };

    let header_words = (frame.len() - buf.len()) / 4;
    let packet_words: usize = (header as u16).safe_cast();
    let has_trailer = header & FLAG_TRAILER != 0;
    let trailer_words = if has_trailer { 1 } else { 0 };

    if packet_words < header_words + trailer_words {
        bail!("VRT packet size of {} words is shorter than its header", packet_words);
    }
    if packet_words * 4 > frame.len() {
        bail!("VRT packet size of {} words exceeds the received frame of {} bytes", packet_words, frame.len());
    }

    let payload_words = packet_words - header_words - trailer_words;
    let trailer = if has_trailer {
        let offs = (packet_words - 1) * 4;
        let mut t = frame.get(offs..offs + 4).ok_or_else(|| anyhow!("truncated VRT trailer"))?;
        Some(t.try_get_word32(endianness)?)
    }
    else {
        None
    };

    Ok(IfPacketInfo {
        packet_type,
        sid,
        packet_count: ((header >> 16) & 0xf) as u16,
        tsi,
        tsf,
        class_id,
        trailer,
        sob: header & FLAG_SOB != 0,
        eob: header & FLAG_EOB != 0,
        num_payload_bytes: payload_words * 4,
        num_header_words32: header_words,
        num_packet_words32: packet_words,
    })
}

pub fn extract_sid(frame: &[u8], endianness: Endianness) -> Option<Sid> {
    let mut buf = frame;
    let header = buf.try_get_word32(endianness).ok()?;
    match header >> 28 {
        VRT_TYPE_IF_SID | VRT_TYPE_EXT_SID | VRT_TYPE_CONTEXT => buf.try_get_word32(endianness).ok().map(Sid::from_raw),
        _ => None,
    }
}
