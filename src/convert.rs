//! Conversion between over-the-wire sample formats and the sample types applications work with.
//!
//! Wire samples are packed into 32 bit items that are transferred in the transport's
//!  endianness:
//!
//! * `sc16`: one sample per item, I in bits 31:16, Q in bits 15:0
//! * `sc8`: two samples per item, the first in bits 15:0 (I in 15:8, Q in 7:0) and the second
//!   in bits 31:16
//! * `sc12`: four samples in three items, 12 bit I/Q values packed back to back starting at the
//!   most significant bit. Devices only produce this format, so it is supported for RX only.

use anyhow::bail;
use bytes::BufMut;
use crate::error::TransportError;
use crate::packet::Endianness;
use crate::util::buf_ext::{BufExt, BufMutExt};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum OtwFormat {
    Sc16,
    Sc8,
    Sc12,
}

impl OtwFormat {
    /// number of bytes in a group of samples that can be decoded on its own, and the number of
    ///  samples in it
    fn group(&self) -> (usize, usize) {
        match self {
            OtwFormat::Sc16 => (4, 1),
            OtwFormat::Sc8 => (4, 2),
            OtwFormat::Sc12 => (12, 4),
        }
    }

    /// the number of complete samples in a payload of `num_bytes`
    pub fn num_samps(&self, num_bytes: usize) -> usize {
        let (group_bytes, group_samps) = self.group();
        num_bytes / group_bytes * group_samps
    }

    /// the number of payload bytes needed for `num_samps`, padded to whole 32 bit items
    pub fn num_bytes(&self, num_samps: usize) -> usize {
        let (group_bytes, group_samps) = self.group();
        num_samps.div_ceil(group_samps) * group_bytes
    }

    pub fn is_tx_capable(&self) -> bool {
        !matches!(self, OtwFormat::Sc12)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CpuFormat {
    Sc16,
    Fc32,
}

/// complex sample with 16 bit integer components
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Sc16 {
    pub re: i16,
    pub im: i16,
}

/// complex sample with float components, full scale is +/- 1.0
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Fc32 {
    pub re: f32,
    pub im: f32,
}

/// A sample type that applications can stream. Conversion goes through 16 bit I/Q, the widest
///  wire resolution.
pub trait CpuSample: Copy + Default + Send + Sync + 'static {
    const FORMAT: CpuFormat;

    fn from_iq16(i: i16, q: i16) -> Self;
    fn to_iq16(&self) -> (i16, i16);
}

impl CpuSample for Sc16 {
    const FORMAT: CpuFormat = CpuFormat::Sc16;

    fn from_iq16(i: i16, q: i16) -> Self {
        Sc16 { re: i, im: q }
    }

    fn to_iq16(&self) -> (i16, i16) {
        (self.re, self.im)
    }
}

impl Fc32 {
    const SCALE: f32 = 32768.0;

    fn to_i16(value: f32) -> i16 {
        (value * Self::SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
    }
}

impl CpuSample for Fc32 {
    const FORMAT: CpuFormat = CpuFormat::Fc32;

    fn from_iq16(i: i16, q: i16) -> Self {
        Fc32 {
            re: i as f32 / Self::SCALE,
            im: q as f32 / Self::SCALE,
        }
    }

    fn to_iq16(&self) -> (i16, i16) {
        (Fc32::to_i16(self.re), Fc32::to_i16(self.im))
    }
}

/// Converts the payload of one stream's packets
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Converter {
    pub otw: OtwFormat,
    pub endianness: Endianness,
}

impl Converter {
    pub fn new(otw: OtwFormat, endianness: Endianness) -> Converter {
        Converter { otw, endianness }
    }

    /// Convert the wire samples `first_samp .. first_samp + out.len()` of `payload` into `out`
    pub fn unpack<S: CpuSample>(&self, payload: &[u8], first_samp: usize, out: &mut [S]) -> anyhow::Result<()> {
        if first_samp + out.len() > self.otw.num_samps(payload.len()) {
            bail!("payload of {} bytes does not hold samples {}..{}", payload.len(), first_samp, first_samp + out.len());
        }

        match self.otw {
            OtwFormat::Sc16 => {
                let mut buf = &payload[first_samp * 4..];
                for s in out.iter_mut() {
                    let item = buf.try_get_word32(self.endianness)?;
                    *s = S::from_iq16((item >> 16) as i16, item as i16);
                }
            }
            OtwFormat::Sc8 => {
                for (n, s) in out.iter_mut().enumerate() {
                    let idx = first_samp + n;
                    let mut buf = &payload[idx / 2 * 4..];
                    let item = buf.try_get_word32(self.endianness)?;
                    let half = if idx % 2 == 0 { item as u16 } else { (item >> 16) as u16 };
                    *s = S::from_iq16(((half >> 8) as i8 as i16) << 8, (half as u8 as i8 as i16) << 8);
                }
            }
            OtwFormat::Sc12 => {
                for (n, s) in out.iter_mut().enumerate() {
                    let idx = first_samp + n;
                    let (i, q) = self.unpack_sc12(&payload[idx / 4 * 12..], idx % 4)?;
                    *s = S::from_iq16(i, q);
                }
            }
        }
        Ok(())
    }

    /// sample `which` (0..4) of the 12 byte group at the start of `group`
    fn unpack_sc12(&self, group: &[u8], which: usize) -> anyhow::Result<(i16, i16)> {
        let mut buf = group;
        let w0 = buf.try_get_word32(self.endianness)? as u128;
        let w1 = buf.try_get_word32(self.endianness)? as u128;
        let w2 = buf.try_get_word32(self.endianness)? as u128;
        let bits = (w0 << 64) | (w1 << 32) | w2;

        // 96 bits: i0 q0 i1 q1 i2 q2 i3 q3, 12 bits each, starting at bit 95
        let i_shift = 96 - 12 * (2 * which + 1);
        let q_shift = i_shift - 12;
        let i12 = ((bits >> i_shift) & 0xfff) as u16;
        let q12 = ((bits >> q_shift) & 0xfff) as u16;
        // sign extending to 16 bits and scaling to full range are the same shift
        Ok(((i12 << 4) as i16, (q12 << 4) as i16))
    }

    /// Write `samps` as wire samples, returning the number of bytes written. The payload is
    ///  padded to whole 32 bit items.
    pub fn pack<S: CpuSample>(&self, samps: &[S], buf: &mut impl BufMut) -> anyhow::Result<usize> {
        let num_bytes = self.otw.num_bytes(samps.len());
        if buf.remaining_mut() < num_bytes {
            bail!("buffer too small for {} samples", samps.len());
        }

        match self.otw {
            OtwFormat::Sc16 => {
                for s in samps {
                    let (i, q) = s.to_iq16();
                    buf.put_word32(((i as u16 as u32) << 16) | q as u16 as u32, self.endianness);
                }
            }
            OtwFormat::Sc8 => {
                for pair in samps.chunks(2) {
                    let lo = Self::to_sc8(&pair[0]);
                    let hi = pair.get(1).map(Self::to_sc8).unwrap_or(0);
                    buf.put_word32(((hi as u32) << 16) | lo as u32, self.endianness);
                }
            }
            OtwFormat::Sc12 => {
                return Err(TransportError::InvalidArgument("sc12 is a receive-only wire format".to_string()).into());
            }
        }
        Ok(num_bytes)
    }

    fn to_sc8<S: CpuSample>(s: &S) -> u16 {
        let (i, q) = s.to_iq16();
        let narrow = |v: i16| ((v as i32 + 0x80).clamp(i16::MIN as i32, i16::MAX as i32) >> 8) as i8 as u8;
        ((narrow(i) as u16) << 8) | narrow(q) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::sc16(OtwFormat::Sc16, 1456, 364)]
    #[case::sc8(OtwFormat::Sc8, 1456, 728)]
    #[case::sc12(OtwFormat::Sc12, 1452, 484)]
    #[case::sc12_partial_group(OtwFormat::Sc12, 1456, 484)]
    fn test_num_samps(#[case] otw: OtwFormat, #[case] bytes: usize, #[case] samps: usize) {
        assert_eq!(otw.num_samps(bytes), samps);
    }

    #[rstest]
    #[case::sc16(OtwFormat::Sc16, 3, 12)]
    #[case::sc8_padded(OtwFormat::Sc8, 3, 8)]
    #[case::sc12_padded(OtwFormat::Sc12, 5, 24)]
    fn test_num_bytes(#[case] otw: OtwFormat, #[case] samps: usize, #[case] bytes: usize) {
        assert_eq!(otw.num_bytes(samps), bytes);
    }

    #[rstest]
    #[case::big(Endianness::Big, vec![0x12, 0x34, 0xff, 0xfe])]
    #[case::little(Endianness::Little, vec![0xfe, 0xff, 0x34, 0x12])]
    fn test_sc16_layout(#[case] endianness: Endianness, #[case] expected: Vec<u8>) {
        let conv = Converter::new(OtwFormat::Sc16, endianness);
        let mut buf = Vec::new();
        assert_eq!(conv.pack(&[Sc16 { re: 0x1234, im: -2 }], &mut buf).unwrap(), 4);
        assert_eq!(buf, expected);

        let mut out = [Sc16::default()];
        conv.unpack(&buf, 0, &mut out).unwrap();
        assert_eq!(out[0], Sc16 { re: 0x1234, im: -2 });
    }

    #[test]
    fn test_fc32_scaling() {
        let conv = Converter::new(OtwFormat::Sc16, Endianness::Big);
        let samps = [Fc32 { re: 0.5, im: -1.0 }, Fc32 { re: 2.0, im: 0.0 }];
        let mut buf = Vec::new();
        conv.pack(&samps, &mut buf).unwrap();

        let mut out = [Fc32::default(); 2];
        conv.unpack(&buf, 0, &mut out).unwrap();
        assert_eq!(out[0], Fc32 { re: 0.5, im: -1.0 });
        // clipped to full scale
        assert_eq!(out[1], Fc32 { re: 32767.0 / 32768.0, im: 0.0 });
    }

    #[test]
    fn test_sc8() {
        let conv = Converter::new(OtwFormat::Sc8, Endianness::Little);
        let samps = [Sc16 { re: 0x0100, im: -0x0200 }, Sc16 { re: 0x7f00, im: 0 }, Sc16 { re: -0x8000, im: 0x0300 }];
        let mut buf = Vec::new();
        assert_eq!(conv.pack(&samps, &mut buf).unwrap(), 8);
        assert_eq!(&buf[..4], &[0xfe, 0x01, 0x00, 0x7f]);

        let mut out = [Sc16::default(); 2];
        conv.unpack(&buf, 1, &mut out).unwrap();
        assert_eq!(out, [samps[1], samps[2]]);
    }

    #[test]
    fn test_sc12_unpack() {
        // i0=0x123 q0=0x456 i1=0x789 q1=0xabc i2=0x001 q2=0xfff i3=0x800 q3=0x7ff
        let words: [u32; 3] = [0x1234_5678, 0x9abc_001f, 0xff80_07ff];
        let mut payload = Vec::new();
        for w in words {
            payload.put_word32(w, Endianness::Big);
        }

        let conv = Converter::new(OtwFormat::Sc12, Endianness::Big);
        let mut out = [Sc16::default(); 4];
        conv.unpack(&payload, 0, &mut out).unwrap();
        assert_eq!(out, [
            Sc16 { re: 0x1230, im: 0x4560 },
            Sc16 { re: 0x7890u16 as i16, im: 0xabc0u16 as i16 },
            Sc16 { re: 0x0010, im: -0x0010 },
            Sc16 { re: i16::MIN, im: 0x7ff0 },
        ]);

        let mut third = [Sc16::default()];
        conv.unpack(&payload, 2, &mut third).unwrap();
        assert_eq!(third[0], out[2]);
    }

    #[test]
    fn test_sc12_is_rx_only() {
        let conv = Converter::new(OtwFormat::Sc12, Endianness::Big);
        let mut buf = Vec::new();
        assert!(conv.pack(&[Sc16::default()], &mut buf).is_err());
        assert!(!OtwFormat::Sc12.is_tx_capable());
    }

    #[test]
    fn test_unpack_out_of_range() {
        let conv = Converter::new(OtwFormat::Sc16, Endianness::Big);
        let mut out = [Sc16::default(); 2];
        assert!(conv.unpack(&[0; 4], 0, &mut out).is_err());
    }
}
