//! Per-stream flow control.
//!
//! Both directions count packets in 12 bit CHDR sequence numbers on the wire, but keep unwrapped
//!  32 bit counters internally so window arithmetic never has to deal with wraparound.
//!
//! * [rx::RxFlowControl] checks incoming sequence numbers and reports consumed packets upstream
//!   so the device can advance its send window
//! * [tx::TxFlowControl] limits the number of packets in flight to the device's buffer capacity,
//!   replenished by the device's acknowledgements

pub mod rx;
pub mod tx;

use crate::packet::chdr::SEQ_MODULUS;

/// Unwrap a 12 bit sequence number to the 32 bit counter closest *after* `last`, i.e. the value
///  with the same low 12 bits that is in `last..last + 4096`.
pub fn unwrap_seq_after(last: u32, seq: u16) -> u32 {
    let modulus = SEQ_MODULUS as u32;
    let delta = (seq as u32).wrapping_sub(last) & (modulus - 1);
    last.wrapping_add(delta)
}

/// Unwrap a 12 bit sequence number to the 32 bit counter closest *before or at* `upper`
pub fn unwrap_seq_before(upper: u32, seq: u16) -> u32 {
    let modulus = SEQ_MODULUS as u32;
    let delta = upper.wrapping_sub(seq as u32) & (modulus - 1);
    upper.wrapping_sub(delta)
}
