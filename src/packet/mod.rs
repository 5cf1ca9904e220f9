//! Wire packet headers.
//!
//! Two header formats are supported: the compressed CHDR header used by the generation 3
//!  devices ([chdr]) and the VITA-49 IF header used by the older product lines ([vrt]). Both are
//!  packed to / unpacked from raw frame bytes with an explicitly chosen [Endianness] - PCIe
//!  transports are little endian, Ethernet and USB are big endian. The codec never guesses.
//!
//! Both formats are organized in 32 bit items, and a 64 bit value is always transferred as its
//!  upper 32 bit item followed by its lower 32 bit item.

pub mod chdr;
pub mod vrt;

use bytes::BufMut;
use crate::sid::Sid;

/// Byte order of the 32 bit items on the wire
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Endianness {
    Big,
    Little,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum HeaderFormat {
    Chdr,
    Vrt,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PacketType {
    Data,
    FlowControl,
    Command,
    Response,
    /// a response with the error flag set
    Error,
    /// VITA-49 extension data
    Extension,
    /// VITA-49 context packet
    Context,
}

/// The decoded header of one packet.
///
/// `num_payload_bytes` is the number of bytes following the header (excluding a VRT trailer).
///  `num_header_words32` and `num_packet_words32` are derived by [HeaderCodec::pack] and
///  [HeaderCodec::unpack] and need not be filled in by callers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IfPacketInfo {
    pub packet_type: PacketType,
    pub sid: Option<Sid>,
    /// 12 bit sequence number for CHDR, 4 bit packet count for VRT
    pub packet_count: u16,
    pub tsi: Option<u32>,
    pub tsf: Option<u64>,
    pub class_id: Option<u64>,
    pub trailer: Option<u32>,
    pub sob: bool,
    pub eob: bool,
    pub num_payload_bytes: usize,
    pub num_header_words32: usize,
    pub num_packet_words32: usize,
}

impl IfPacketInfo {
    pub fn new(packet_type: PacketType, sid: Sid) -> IfPacketInfo {
        IfPacketInfo {
            packet_type,
            sid: Some(sid),
            packet_count: 0,
            tsi: None,
            tsf: None,
            class_id: None,
            trailer: None,
            sob: false,
            eob: false,
            num_payload_bytes: 0,
            num_header_words32: 0,
            num_packet_words32: 0,
        }
    }

    pub fn data(sid: Sid) -> IfPacketInfo {
        IfPacketInfo::new(PacketType::Data, sid)
    }

    pub fn num_payload_words32(&self) -> usize {
        self.num_payload_bytes.div_ceil(4)
    }

    pub fn header_len_bytes(&self) -> usize {
        self.num_header_words32 * 4
    }
}

/// Header format plus byte order - the complete description of how one transport frames its
///  packets.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct HeaderCodec {
    pub format: HeaderFormat,
    pub endianness: Endianness,
}

impl HeaderCodec {
    pub const fn chdr(endianness: Endianness) -> HeaderCodec {
        HeaderCodec { format: HeaderFormat::Chdr, endianness }
    }

    pub const fn vrt(endianness: Endianness) -> HeaderCodec {
        HeaderCodec { format: HeaderFormat::Vrt, endianness }
    }

    /// Write the header for `info` to `buf`, returning the header length in bytes. The payload is
    ///  expected to follow immediately.
    pub fn pack(&self, info: &mut IfPacketInfo, buf: &mut impl BufMut) -> anyhow::Result<usize> {
        match self.format {
            HeaderFormat::Chdr => chdr::pack(info, buf, self.endianness),
            HeaderFormat::Vrt => vrt::pack(info, buf, self.endianness),
        }
    }

    /// Decode the header at the start of a received frame. The packet length from the header is
    ///  checked against the frame's length.
    pub fn unpack(&self, frame: &[u8]) -> anyhow::Result<IfPacketInfo> {
        match self.format {
            HeaderFormat::Chdr => chdr::unpack(frame, self.endianness),
            HeaderFormat::Vrt => vrt::unpack(frame, self.endianness),
        }
    }

    /// the maximum header length in bytes, i.e. the most that a packet's header can take away
    ///  from a frame's capacity
    pub fn max_header_len(&self) -> usize {
        match self.format {
            HeaderFormat::Chdr => chdr::MAX_HEADER_LEN,
            HeaderFormat::Vrt => vrt::MAX_HEADER_LEN,
        }
    }

    /// Extract the SID from a frame without decoding the rest of the header
    pub fn extract_sid(&self, frame: &[u8]) -> Option<Sid> {
        match self.format {
            HeaderFormat::Chdr => chdr::extract_sid(frame, self.endianness),
            HeaderFormat::Vrt => vrt::extract_sid(frame, self.endianness),
        }
    }
}
