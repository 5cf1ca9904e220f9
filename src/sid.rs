use std::fmt::{Debug, Display, Formatter};

/// A stream identifier: the 32 bit address pair of one logical point-to-point packet flow.
///
/// ```ascii
/// 31      24 23      16 15       8 7        0
/// | src addr | src endp | dst addr | dst endp |
/// ```
///
/// The upper half is the source address, the lower half is the destination address. A
///  [reversed](Sid::reversed) SID identifies the return path of a flow.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Sid(u32);

impl Sid {
    pub const fn from_raw(raw: u32) -> Sid {
        Sid(raw)
    }

    pub fn new(src_addr: u8, src_endpoint: u8, dst_addr: u8, dst_endpoint: u8) -> Sid {
        Sid(u32::from_be_bytes([src_addr, src_endpoint, dst_addr, dst_endpoint]))
    }

    pub const fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn src_addr(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn src_endpoint(&self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn dst_addr(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn dst_endpoint(&self) -> u8 {
        self.0 as u8
    }

    /// source address and endpoint as a 16 bit value
    pub fn src(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// destination address and endpoint as a 16 bit value
    pub fn dst(&self) -> u16 {
        self.0 as u16
    }

    pub fn with_src(&self, src: u16) -> Sid {
        Sid(((src as u32) << 16) | (self.0 & 0xffff))
    }

    pub fn with_dst(&self, dst: u16) -> Sid {
        Sid((self.0 & 0xffff_0000) | dst as u32)
    }

    pub fn reversed(&self) -> Sid {
        Sid(self.0.rotate_left(16))
    }
}

impl Display for Sid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}:{:02X}>{:02X}:{:02X}", self.src_addr(), self.src_endpoint(), self.dst_addr(), self.dst_endpoint())
    }
}

impl Debug for Sid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SID[{}]", self)
    }
}

impl From<u32> for Sid {
    fn from(raw: u32) -> Self {
        Sid(raw)
    }
}
