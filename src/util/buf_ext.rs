use anyhow::anyhow;
use crate::packet::Endianness;


macro_rules! get_try_impl {
    ($try_getter: ident, $ty:ty, $getter_be: ident, $getter_le: ident) => {
        fn $try_getter(&mut self, endianness: Endianness) -> anyhow::Result<$ty> {
            if self.remaining() < size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(match endianness {
                Endianness::Big => self.$getter_be(),
                Endianness::Little => self.$getter_le(),
            })
        }
    }
}

macro_rules! put_impl {
    ($putter: ident, $ty:ty, $putter_be: ident, $putter_le: ident) => {
        fn $putter(&mut self, value: $ty, endianness: Endianness) {
            match endianness {
                Endianness::Big => self.$putter_be(value),
                Endianness::Little => self.$putter_le(value),
            }
        }
    }
}

/// Reading the 32 and 64 bit items of the wire formats with a byte order that is chosen per
///  transport at runtime
pub trait BufExt: bytes::Buf {
    get_try_impl!(try_get_word32, u32, get_u32, get_u32_le);
    get_try_impl!(try_get_word64, u64, get_u64, get_u64_le);
}

pub trait BufMutExt: bytes::BufMut {
    put_impl!(put_word32, u32, put_u32, put_u32_le);
    put_impl!(put_word64, u64, put_u64, put_u64_le);
}

impl <T: bytes::Buf> BufExt for T {
}

impl <T: bytes::BufMut> BufMutExt for T {
}
