//! pcap-NG block encoding
//!
//! Host-endian (little-endian on every supported target) per the pcapng
//! convention: readers use the byte-order magic to adapt. Timestamps are
//! written with nanosecond resolution (`if_tsresol = 9`).

use crate::CaptureDirection;

pub const BLOCK_SHB: u32 = 0x0A0D_0D0A;
pub const BLOCK_IDB: u32 = 0x0000_0001;
pub const BLOCK_EPB: u32 = 0x0000_0006;
pub const BYTE_ORDER_MAGIC: u32 = 0x1A2B_3C4D;

const LINKTYPE_ETHERNET: u16 = 1;
const OPT_ENDOFOPT: u16 = 0;
const OPT_IF_NAME: u16 = 2;
const OPT_IF_TSRESOL: u16 = 9;
const OPT_EPB_FLAGS: u16 = 2;
const EPB_FLAG_INBOUND: u32 = 0b01;
const EPB_FLAG_OUTBOUND: u32 = 0b10;

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn push_option(buf: &mut Vec<u8>, code: u16, value: &[u8]) {
    push_u16(buf, code);
    push_u16(buf, value.len() as u16);
    buf.extend_from_slice(value);
    pad4(buf);
}

/// Write `body` as a complete block with type and both length fields.
fn push_block(buf: &mut Vec<u8>, block_type: u32, body: &[u8]) {
    debug_assert_eq!(body.len() % 4, 0);
    let total_len = (body.len() + 12) as u32;
    push_u32(buf, block_type);
    push_u32(buf, total_len);
    buf.extend_from_slice(body);
    push_u32(buf, total_len);
}

/// Section Header Block: one per file.
pub fn encode_shb(buf: &mut Vec<u8>) {
    let mut body = Vec::with_capacity(16);
    push_u32(&mut body, BYTE_ORDER_MAGIC);
    push_u16(&mut body, 1); // major
    push_u16(&mut body, 0); // minor
    body.extend_from_slice(&u64::MAX.to_le_bytes()); // section length unknown
    push_block(buf, BLOCK_SHB, &body);
}

/// Interface Description Block: one per emulated interface.
pub fn encode_idb(buf: &mut Vec<u8>, name: &str, snaplen: u32) {
    let mut body = Vec::with_capacity(32 + name.len());
    push_u16(&mut body, LINKTYPE_ETHERNET);
    push_u16(&mut body, 0); // reserved
    push_u32(&mut body, snaplen);
    push_option(&mut body, OPT_IF_NAME, name.as_bytes());
    push_option(&mut body, OPT_IF_TSRESOL, &[9]);
    push_option(&mut body, OPT_ENDOFOPT, &[]);
    push_block(buf, BLOCK_IDB, &body);
}

/// Enhanced Packet Block carrying one tapped frame. `offset_ns` is the
/// monotonic timestamp relative to the per-file epoch.
pub fn encode_epb(
    buf: &mut Vec<u8>,
    iface_index: u32,
    offset_ns: u64,
    frame: &[u8],
    direction: CaptureDirection,
) {
    let flags = match direction {
        CaptureDirection::Inbound => EPB_FLAG_INBOUND,
        CaptureDirection::Outbound => EPB_FLAG_OUTBOUND,
    };
    let mut body = Vec::with_capacity(32 + frame.len());
    push_u32(&mut body, iface_index);
    push_u32(&mut body, (offset_ns >> 32) as u32);
    push_u32(&mut body, offset_ns as u32);
    push_u32(&mut body, frame.len() as u32);
    push_u32(&mut body, frame.len() as u32);
    body.extend_from_slice(frame);
    pad4(&mut body);
    push_option(&mut body, OPT_EPB_FLAGS, &flags.to_le_bytes());
    push_option(&mut body, OPT_ENDOFOPT, &[]);
    push_block(buf, BLOCK_EPB, &body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_four_byte_aligned() {
        let mut buf = Vec::new();
        encode_shb(&mut buf);
        encode_idb(&mut buf, "veth0", 2048);
        encode_epb(&mut buf, 0, 12345, &[0u8; 61], CaptureDirection::Inbound);
        assert_eq!(buf.len() % 4, 0);
    }

    #[test]
    fn epb_splits_timestamp_words() {
        let mut buf = Vec::new();
        let offset = (7u64 << 32) | 99;
        encode_epb(&mut buf, 3, offset, &[1, 2, 3, 4], CaptureDirection::Outbound);
        let body = &buf[8..];
        assert_eq!(u32::from_le_bytes(body[0..4].try_into().unwrap()), 3);
        assert_eq!(u32::from_le_bytes(body[4..8].try_into().unwrap()), 7);
        assert_eq!(u32::from_le_bytes(body[8..12].try_into().unwrap()), 99);
    }

    #[test]
    fn idb_name_is_padded() {
        let mut buf = Vec::new();
        encode_idb(&mut buf, "abc", 128);
        assert_eq!(buf.len() % 4, 0);
        let total = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
        assert_eq!(total, buf.len());
    }
}
