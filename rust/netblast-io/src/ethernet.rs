//! Outer Ethernet/VLAN codec
//!
//! The engine validates only the outer header; everything behind the
//! final ethertype belongs to the protocol layer. Kernels configured to
//! strip the outer VLAN tag report it out-of-band in the slot header, so
//! the decoded view supports re-installing a stripped tag.

use netblast_stream::bytes::{read_be_uint, write_be_uint};
use netblast_timer::Timestamp;
use thiserror::Error;

pub const ETH_HEADER_LEN: usize = 14;
pub const VLAN_TAG_LEN: usize = 4;
pub const ETH_TYPE_VLAN: u16 = 0x8100;
pub const ETH_TYPE_QINQ: u16 = 0x88A8;
pub const ETH_TYPE_QINQ_LEGACY: u16 = 0x9100;
pub const VLAN_ID_MASK: u16 = 0x0FFF;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame of {0} bytes is shorter than an Ethernet header")]
    Truncated(usize),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncodeError {
    #[error("buffer of {have} bytes cannot hold a {need} byte frame")]
    BufferTooSmall { have: usize, need: usize },
}

/// A single 802.1Q tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlanTag {
    pub id: u16,
    pub pcp: u8,
    pub tpid: u16,
}

impl VlanTag {
    fn tci(&self) -> u16 {
        (u16::from(self.pcp) << 13) | (self.id & VLAN_ID_MASK)
    }
}

fn is_vlan_tpid(tpid: u16) -> bool {
    matches!(tpid, ETH_TYPE_VLAN | ETH_TYPE_QINQ | ETH_TYPE_QINQ_LEGACY)
}

fn is_qinq_tpid(tpid: u16) -> bool {
    matches!(tpid, ETH_TYPE_QINQ | ETH_TYPE_QINQ_LEGACY)
}

/// Decoded outer header of a received frame.
#[derive(Debug, Clone)]
pub struct EthernetView<'a> {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub vlan_outer: Option<VlanTag>,
    pub vlan_inner: Option<VlanTag>,
    pub qinq: bool,
    pub ethertype: u16,
    pub payload: &'a [u8],
    /// Stamped by the I/O job, shared by all frames of one tick.
    pub timestamp: Timestamp,
}

impl<'a> EthernetView<'a> {
    /// Re-install a tag the kernel stripped from the wire frame. The
    /// decoded outer tag, if it differs, was really the inner one.
    pub fn merge_stripped_tag(&mut self, tci: u16, tpid: u16) {
        let id = tci & VLAN_ID_MASK;
        if id == 0 {
            return;
        }
        if let Some(outer) = self.vlan_outer {
            if outer.id == id {
                return;
            }
        }
        self.vlan_inner = self.vlan_outer;
        self.vlan_outer = Some(VlanTag {
            id,
            pcp: (tci >> 13) as u8,
            tpid,
        });
        if is_qinq_tpid(tpid) {
            self.qinq = true;
        }
    }
}

/// Parse the outer Ethernet header with up to two VLAN tags.
pub fn decode(frame: &[u8], timestamp: Timestamp) -> Result<EthernetView<'_>, DecodeError> {
    if frame.len() < ETH_HEADER_LEN {
        return Err(DecodeError::Truncated(frame.len()));
    }
    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&frame[0..6]);
    src.copy_from_slice(&frame[6..12]);

    let mut offset = 12;
    let mut ethertype = read_be_uint(&frame[offset..offset + 2]) as u16;
    offset += 2;

    let mut vlan_outer = None;
    let mut vlan_inner = None;
    let mut qinq = false;
    for slot in [&mut vlan_outer, &mut vlan_inner] {
        if !is_vlan_tpid(ethertype) {
            break;
        }
        if frame.len() < offset + VLAN_TAG_LEN {
            return Err(DecodeError::Truncated(frame.len()));
        }
        let tci = read_be_uint(&frame[offset..offset + 2]) as u16;
        *slot = Some(VlanTag {
            id: tci & VLAN_ID_MASK,
            pcp: (tci >> 13) as u8,
            tpid: ethertype,
        });
        offset += 2;
        ethertype = read_be_uint(&frame[offset..offset + 2]) as u16;
        offset += 2;
    }
    if let Some(outer) = vlan_outer {
        if vlan_inner.is_some() && is_qinq_tpid(outer.tpid) {
            qinq = true;
        }
    }

    Ok(EthernetView {
        dst,
        src,
        vlan_outer,
        vlan_inner,
        qinq,
        ethertype,
        payload: &frame[offset..],
        timestamp,
    })
}

/// Build a frame from its parts; returns the total length.
pub fn encode(
    dst: &[u8; 6],
    src: &[u8; 6],
    tags: &[VlanTag],
    ethertype: u16,
    payload: &[u8],
    out: &mut [u8],
) -> Result<usize, EncodeError> {
    let need = ETH_HEADER_LEN + tags.len() * VLAN_TAG_LEN + payload.len();
    if out.len() < need {
        return Err(EncodeError::BufferTooSmall {
            have: out.len(),
            need,
        });
    }
    out[0..6].copy_from_slice(dst);
    out[6..12].copy_from_slice(src);
    let mut offset = 12;
    for tag in tags {
        write_be_uint(&mut out[offset..offset + 2], u64::from(tag.tpid));
        write_be_uint(&mut out[offset + 2..offset + 4], u64::from(tag.tci()));
        offset += VLAN_TAG_LEN;
    }
    write_be_uint(&mut out[offset..offset + 2], u64::from(ethertype));
    offset += 2;
    out[offset..offset + payload.len()].copy_from_slice(payload);
    Ok(need)
}
