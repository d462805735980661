//! Simulated kernel ring
//!
//! Heap-backed ring whose kernel side is driven explicitly: tests and
//! benchmarks place ingress frames and complete egress slots the way the
//! kernel would, observing the same status-word handoff contract as the
//! mapped ring.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::RingResult;
use crate::ring::{
    Direction, RingGeometry, RingHandle, RingMemory, SimShared, SlotHeader, PAYLOAD_OFFSET,
    STATUS_KERNEL, STATUS_SEND_REQUEST, STATUS_USER,
};

/// The kernel side of a sim ring.
pub struct SimKernel {
    mem: Arc<RingMemory>,
    geometry: RingGeometry,
    shared: Arc<SimShared>,
    cursor: usize,
}

impl SimKernel {
    /// Build a ring handle plus its kernel counterpart.
    pub fn ring(direction: Direction, geometry: RingGeometry) -> RingResult<(RingHandle, SimKernel)> {
        let (handle, mem, shared) = RingHandle::sim_parts(direction, geometry)?;
        Ok((
            handle,
            SimKernel {
                mem,
                geometry,
                shared,
                cursor: 0,
            },
        ))
    }

    fn hdr(&self, idx: usize) -> *mut SlotHeader {
        unsafe { self.mem.as_ptr().add(idx * self.geometry.frame_size).cast() }
    }

    fn payload(&self, idx: usize) -> *mut u8 {
        unsafe {
            self.mem
                .as_ptr()
                .add(idx * self.geometry.frame_size + PAYLOAD_OFFSET)
        }
    }

    /// Deliver one ingress frame into the next kernel-owned slot; false
    /// when the ring is full (the user has not released it yet).
    pub fn push_frame(&mut self, frame: &[u8], vlan_tci: u16, vlan_tpid: u16) -> bool {
        debug_assert!(frame.len() <= self.geometry.payload_capacity());
        let idx = self.cursor;
        let hdr = self.hdr(idx);
        unsafe {
            if (*hdr).status.load(Ordering::Acquire) != STATUS_KERNEL {
                return false;
            }
            std::ptr::copy_nonoverlapping(frame.as_ptr(), self.payload(idx), frame.len());
            (*hdr).len = frame.len() as u32;
            (*hdr).snaplen = frame.len() as u32;
            (*hdr).mac_offset = PAYLOAD_OFFSET as u16;
            (*hdr).vlan_tci = vlan_tci;
            (*hdr).vlan_tpid = vlan_tpid;
            (*hdr).status.store(STATUS_USER, Ordering::Release);
        }
        self.cursor = (idx + 1) & (self.geometry.frame_count - 1);
        true
    }

    /// Transmit every SEND_REQUEST slot in order, returning the frames
    /// and handing the slots back to the user.
    pub fn complete_tx(&mut self) -> Vec<Vec<u8>> {
        let mut sent = Vec::new();
        loop {
            let idx = self.cursor;
            let hdr = self.hdr(idx);
            unsafe {
                if (*hdr).status.load(Ordering::Acquire) != STATUS_SEND_REQUEST {
                    break;
                }
                let len = (*hdr).len as usize;
                let mut frame = vec![0u8; len];
                std::ptr::copy_nonoverlapping(self.payload(idx), frame.as_mut_ptr(), len);
                sent.push(frame);
                (*hdr).status.store(STATUS_USER, Ordering::Release);
            }
            self.cursor = (idx + 1) & (self.geometry.frame_count - 1);
        }
        sent
    }

    /// Count of slots awaiting kernel pickup.
    pub fn pending_tx(&self) -> usize {
        (0..self.geometry.frame_count)
            .filter(|idx| unsafe {
                (*self.hdr(*idx)).status.load(Ordering::Acquire) == STATUS_SEND_REQUEST
            })
            .count()
    }

    /// Make the next kernel notification fail (EAGAIN-style).
    pub fn set_fail_notify(&self, fail: bool) {
        self.shared.fail_notify.store(fail, Ordering::Release);
    }
}
