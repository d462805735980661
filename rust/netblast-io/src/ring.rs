//! Kernel-shared frame ring
//!
//! A contiguous region of `frame_count * frame_size` bytes, each slot
//! starting with a fixed header followed by the frame at `mac_offset`.
//! Slot ownership is a status word: `USER` (readable after RX / free to
//! fill on TX), kernel-owned (zero), or `SEND_REQUEST` (filled, awaiting
//! kernel pickup). The user cursor never advances past a kernel-owned
//! slot; handoffs are release stores observed with acquire loads so the
//! kernel sees `len` before the status flip.
//!
//! Three backings share one claim/commit surface: the AF_PACKET
//! TPACKET_V2 mmap ring, a heap staging ring drained through per-frame
//! `send(2)` (raw-socket mode), and a heap ring whose kernel side is
//! driven by the test suite (`sim` feature).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{RingOpenError, RingResult};

// Socket options not exported by the libc crate.
const PACKET_RX_RING: libc::c_int = 5;
const PACKET_VERSION: libc::c_int = 10;
const PACKET_TX_RING: libc::c_int = 13;

/// Slot is owned by the kernel (awaiting a packet, or transmitting).
pub const STATUS_KERNEL: u32 = 0;
/// Slot is owned by user space.
pub const STATUS_USER: u32 = 1 << 0;
/// Kernel has queued the slot for copy (kernel-side transitional state).
pub const STATUS_KERNEL_COPY: u32 = 1 << 1;
/// User filled the slot; kernel picks it up on the next notify.
pub const STATUS_SEND_REQUEST: u32 = 1 << 2;

/// Frame data starts here within each slot; keeps payloads 16-aligned.
pub const PAYLOAD_OFFSET: usize = 32;

/// Per-slot header at the start of every frame slot.
#[repr(C)]
pub struct SlotHeader {
    pub status: AtomicU32,
    pub len: u32,
    pub snaplen: u32,
    pub mac_offset: u16,
    pub net_offset: u16,
    pub sec: u32,
    pub nsec: u32,
    pub vlan_tci: u16,
    pub vlan_tpid: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

/// Ring dimensions. Both must be powers of two so cursor advancement is a
/// mask.
#[derive(Debug, Clone, Copy)]
pub struct RingGeometry {
    pub frame_size: usize,
    pub frame_count: usize,
}

impl RingGeometry {
    pub fn validate(&self) -> RingResult<()> {
        if !self.frame_size.is_power_of_two() || self.frame_size < PAYLOAD_OFFSET + 64 {
            return Err(RingOpenError::InvalidGeometry(format!(
                "frame_size {} must be a power of two holding a minimal frame",
                self.frame_size
            )));
        }
        if self.frame_count == 0 || !self.frame_count.is_power_of_two() {
            return Err(RingOpenError::InvalidGeometry(format!(
                "frame_count {} must be a nonzero power of two",
                self.frame_count
            )));
        }
        Ok(())
    }

    pub fn map_len(&self) -> usize {
        self.frame_size * self.frame_count
    }

    /// Frame bytes available behind the slot header.
    pub fn payload_capacity(&self) -> usize {
        self.frame_size - PAYLOAD_OFFSET
    }
}

/// Per-ring accumulators. Monotonically non-decreasing; shared so they
/// stay observable while a worker owns the ring.
#[derive(Debug, Default)]
pub struct RingStats {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    pub unknown: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub io_errors: AtomicU64,
    pub no_buffer: AtomicU64,
    pub polled: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct RingStatsSnapshot {
    pub packets: u64,
    pub bytes: u64,
    pub unknown: u64,
    pub protocol_errors: u64,
    pub io_errors: u64,
    pub no_buffer: u64,
    pub polled: u64,
}

impl RingStats {
    pub fn snapshot(&self) -> RingStatsSnapshot {
        RingStatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            no_buffer: self.no_buffer.load(Ordering::Relaxed),
            polled: self.polled.load(Ordering::Relaxed),
        }
    }
}

/// The mapped or heap-allocated slot region. Shared with the kernel (or
/// the sim kernel); released exactly once on drop.
pub(crate) struct RingMemory {
    base: NonNull<u8>,
    len: usize,
    mmapped: bool,
}

// The region is shared with the kernel by construction; slot handoff is
// mediated by the atomic status word.
unsafe impl Send for RingMemory {}
unsafe impl Sync for RingMemory {}

impl RingMemory {
    fn heap(len: usize) -> Self {
        let layout = Layout::from_size_align(len, 64).expect("ring layout");
        let base = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(base).expect("ring allocation");
        RingMemory {
            base,
            len,
            mmapped: false,
        }
    }

    fn mmap(fd: &OwnedFd, len: usize) -> io::Result<Self> {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_NORESERVE,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(RingMemory {
            base: NonNull::new(base as *mut u8).expect("mmap base"),
            len,
            mmapped: true,
        })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}

impl Drop for RingMemory {
    fn drop(&mut self) {
        unsafe {
            if self.mmapped {
                libc::munmap(self.base.as_ptr().cast(), self.len);
            } else {
                let layout = Layout::from_size_align(self.len, 64).expect("ring layout");
                dealloc(self.base.as_ptr(), layout);
            }
        }
    }
}

#[cfg(feature = "sim")]
#[derive(Debug, Default)]
pub(crate) struct SimShared {
    pub(crate) fail_notify: std::sync::atomic::AtomicBool,
}

enum Backend {
    SharedRing {
        fd: OwnedFd,
    },
    RawSocket {
        fd: OwnedFd,
        kernel_cursor: usize,
    },
    #[cfg(feature = "sim")]
    Sim { shared: Arc<SimShared> },
}

/// A received frame. The view borrows the ring; it cannot outlive the
/// claim and must be dropped before `rx_release`.
pub struct RxFrame<'a> {
    pub data: &'a [u8],
    pub vlan_tci: u16,
    pub vlan_tpid: u16,
}

/// Per-direction handle over one mapped ring.
pub struct RingHandle {
    direction: Direction,
    geometry: RingGeometry,
    mem: Arc<RingMemory>,
    backend: Backend,
    cursor: usize,
    queued: usize,
    stats: Arc<RingStats>,
}

impl RingHandle {
    /// Open an AF_PACKET TPACKET_V2 ring bound to `iface`.
    pub fn open(iface: &str, direction: Direction, geometry: RingGeometry) -> RingResult<Self> {
        geometry.validate()?;
        let fd = open_packet_socket(iface)?;
        setup_ring_option(&fd, iface, direction, geometry)?;
        let mem =
            RingMemory::mmap(&fd, geometry.map_len()).map_err(|source| RingOpenError::Map {
                iface: iface.to_string(),
                source,
            })?;
        bind_to_interface(&fd, iface)?;
        let mut handle = RingHandle {
            direction,
            geometry,
            mem: Arc::new(mem),
            backend: Backend::SharedRing { fd },
            cursor: 0,
            queued: 0,
            stats: Arc::new(RingStats::default()),
        };
        handle.init_slots();
        Ok(handle)
    }

    /// Open a raw packet socket with a heap staging ring (no kernel
    /// mapping; frames cross via per-frame syscalls).
    pub fn open_raw(iface: &str, direction: Direction, geometry: RingGeometry) -> RingResult<Self> {
        geometry.validate()?;
        let fd = open_packet_socket(iface)?;
        set_nonblocking(&fd).map_err(RingOpenError::Socket)?;
        bind_to_interface(&fd, iface)?;
        let mut handle = RingHandle {
            direction,
            geometry,
            mem: Arc::new(RingMemory::heap(geometry.map_len())),
            backend: Backend::RawSocket {
                fd,
                kernel_cursor: 0,
            },
            cursor: 0,
            queued: 0,
            stats: Arc::new(RingStats::default()),
        };
        handle.init_slots();
        Ok(handle)
    }

    #[cfg(feature = "sim")]
    pub(crate) fn sim_parts(
        direction: Direction,
        geometry: RingGeometry,
    ) -> RingResult<(Self, Arc<RingMemory>, Arc<SimShared>)> {
        geometry.validate()?;
        let mem = Arc::new(RingMemory::heap(geometry.map_len()));
        let shared = Arc::new(SimShared::default());
        let mut handle = RingHandle {
            direction,
            geometry,
            mem: mem.clone(),
            backend: Backend::Sim {
                shared: shared.clone(),
            },
            cursor: 0,
            queued: 0,
            stats: Arc::new(RingStats::default()),
        };
        handle.init_slots();
        Ok((handle, mem, shared))
    }

    /// TX slots start free for the user, RX slots kernel-owned.
    fn init_slots(&mut self) {
        for idx in 0..self.geometry.frame_count {
            let hdr = self.hdr_ptr(idx);
            unsafe {
                (*hdr).mac_offset = PAYLOAD_OFFSET as u16;
                (*hdr).net_offset = (PAYLOAD_OFFSET + 14) as u16;
                (*hdr).snaplen = self.geometry.payload_capacity() as u32;
                let status = match self.direction {
                    Direction::Ingress => STATUS_KERNEL,
                    Direction::Egress => STATUS_USER,
                };
                (*hdr).status.store(status, Ordering::Release);
            }
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn queued(&self) -> usize {
        self.queued
    }

    pub fn stats(&self) -> &Arc<RingStats> {
        &self.stats
    }

    fn mask(&self) -> usize {
        self.geometry.frame_count - 1
    }

    fn slot_ptr(&self, idx: usize) -> *mut u8 {
        debug_assert!(idx < self.geometry.frame_count);
        unsafe { self.mem.as_ptr().add(idx * self.geometry.frame_size) }
    }

    fn hdr_ptr(&self, idx: usize) -> *mut SlotHeader {
        self.slot_ptr(idx).cast()
    }

    fn status(&self, idx: usize) -> &AtomicU32 {
        unsafe { &(*self.hdr_ptr(idx)).status }
    }

    /// Pull frames the raw socket has pending into free slots. A no-op
    /// for mapped rings, where the kernel fills slots directly.
    pub fn rx_fill(&mut self) {
        let Backend::RawSocket { fd, kernel_cursor } = &mut self.backend else {
            return;
        };
        debug_assert_eq!(self.direction, Direction::Ingress);
        let mask = self.geometry.frame_count - 1;
        let capacity = self.geometry.payload_capacity();
        loop {
            let idx = *kernel_cursor;
            let hdr = unsafe { &*(self.mem.as_ptr().add(idx * self.geometry.frame_size) as *const SlotHeader) };
            if hdr.status.load(Ordering::Acquire) != STATUS_KERNEL {
                break;
            }
            let data = unsafe {
                self.mem
                    .as_ptr()
                    .add(idx * self.geometry.frame_size + PAYLOAD_OFFSET)
            };
            let n = unsafe {
                libc::recv(
                    fd.as_raw_fd(),
                    data.cast(),
                    capacity,
                    libc::MSG_DONTWAIT | libc::MSG_TRUNC,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %err, "raw socket recv failed");
                }
                break;
            }
            let hdr = unsafe {
                &mut *(self.mem.as_ptr().add(idx * self.geometry.frame_size) as *mut SlotHeader)
            };
            hdr.len = (n as usize).min(capacity) as u32;
            hdr.vlan_tci = 0;
            hdr.vlan_tpid = 0;
            hdr.status.store(STATUS_USER, Ordering::Release);
            *kernel_cursor = (idx + 1) & mask;
        }
    }

    /// Whether the current RX slot is ready for the user.
    pub fn rx_ready(&self) -> bool {
        self.status(self.cursor).load(Ordering::Acquire) & STATUS_USER != 0
    }

    /// Claim the current slot if the kernel handed it over.
    pub fn rx_claim(&self) -> Option<RxFrame<'_>> {
        debug_assert_eq!(self.direction, Direction::Ingress);
        if !self.rx_ready() {
            return None;
        }
        let hdr = unsafe { &*self.hdr_ptr(self.cursor) };
        let mac = (hdr.mac_offset as usize).min(self.geometry.frame_size);
        let len = (hdr.len as usize).min(self.geometry.frame_size - mac);
        let data = unsafe { std::slice::from_raw_parts(self.slot_ptr(self.cursor).add(mac), len) };
        Some(RxFrame {
            data,
            vlan_tci: hdr.vlan_tci,
            vlan_tpid: hdr.vlan_tpid,
        })
    }

    /// Return the current slot to the kernel and advance.
    pub fn rx_release(&mut self) {
        debug_assert_eq!(self.direction, Direction::Ingress);
        self.status(self.cursor)
            .store(STATUS_KERNEL, Ordering::Release);
        self.cursor = (self.cursor + 1) & self.mask();
    }

    /// Whether the current TX slot is free to fill.
    pub fn tx_ready(&self) -> bool {
        self.status(self.cursor).load(Ordering::Acquire) == STATUS_USER
    }

    /// Reserve the current slot for writing. The slice covers the whole
    /// payload region; commit with the actual frame length.
    pub fn tx_reserve(&mut self) -> Option<&mut [u8]> {
        debug_assert_eq!(self.direction, Direction::Egress);
        if !self.tx_ready() {
            return None;
        }
        let data = unsafe {
            std::slice::from_raw_parts_mut(
                self.slot_ptr(self.cursor).add(PAYLOAD_OFFSET),
                self.geometry.payload_capacity(),
            )
        };
        Some(data)
    }

    /// Publish the reserved slot: length first, then the status flip with
    /// release ordering so the kernel observes a complete frame.
    pub fn tx_commit(&mut self, len: usize) {
        debug_assert_eq!(self.direction, Direction::Egress);
        debug_assert!(len <= self.geometry.payload_capacity());
        let hdr = self.hdr_ptr(self.cursor);
        unsafe {
            (*hdr).len = len as u32;
            (*hdr).snaplen = len as u32;
            (*hdr).mac_offset = PAYLOAD_OFFSET as u16;
            (*hdr).status.store(STATUS_SEND_REQUEST, Ordering::Release);
        }
        self.cursor = (self.cursor + 1) & self.mask();
        self.queued += 1;
        debug_assert!(self.queued <= self.geometry.frame_count);
    }

    /// Non-blocking poll to nudge the kernel; counted, never waited on.
    pub fn poll(&mut self, events: i16) {
        self.stats.polled.fetch_add(1, Ordering::Relaxed);
        let fd = match &self.backend {
            Backend::SharedRing { fd } => fd,
            Backend::RawSocket { fd, .. } => fd,
            #[cfg(feature = "sim")]
            Backend::Sim { .. } => return,
        };
        let mut pollset = libc::pollfd {
            fd: fd.as_raw_fd(),
            events,
            revents: 0,
        };
        if unsafe { libc::poll(&mut pollset, 1, 0) } == -1 {
            tracing::warn!(error = %io::Error::last_os_error(), "poll failed");
        }
    }

    /// Hand all SEND_REQUEST slots to the kernel in one notification. On
    /// failure `queued` is retained and the next tick retries; the cursor
    /// is never rewound, since retransmission of handed-over slots is the
    /// kernel's call.
    pub fn notify_kernel(&mut self) {
        if self.queued == 0 {
            return;
        }
        if matches!(self.backend, Backend::RawSocket { .. }) {
            self.raw_drain();
            return;
        }
        match &self.backend {
            Backend::SharedRing { fd } => {
                let rc = unsafe {
                    libc::sendto(
                        fd.as_raw_fd(),
                        std::ptr::null(),
                        0,
                        0,
                        std::ptr::null(),
                        0,
                    )
                };
                if rc < 0 {
                    self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        error = %io::Error::last_os_error(),
                        queued = self.queued,
                        "kernel notify failed; retrying next tick"
                    );
                } else {
                    self.queued = 0;
                }
            }
            Backend::RawSocket { .. } => {}
            #[cfg(feature = "sim")]
            Backend::Sim { shared } => {
                if shared
                    .fail_notify
                    .load(std::sync::atomic::Ordering::Acquire)
                {
                    self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.queued = 0;
                }
            }
        }
    }

    /// Raw-socket notify: walk SEND_REQUEST slots and send each frame.
    fn raw_drain(&mut self) {
        let Backend::RawSocket { fd, kernel_cursor } = &mut self.backend else {
            return;
        };
        let mask = self.geometry.frame_count - 1;
        while self.queued > 0 {
            let idx = *kernel_cursor;
            let hdr = unsafe {
                &*(self.mem.as_ptr().add(idx * self.geometry.frame_size) as *const SlotHeader)
            };
            if hdr.status.load(Ordering::Acquire) != STATUS_SEND_REQUEST {
                break;
            }
            let len = hdr.len as usize;
            let data = unsafe {
                self.mem
                    .as_ptr()
                    .add(idx * self.geometry.frame_size + PAYLOAD_OFFSET)
            };
            let rc = unsafe { libc::send(fd.as_raw_fd(), data.cast(), len, libc::MSG_DONTWAIT) };
            if rc < 0 {
                self.stats.io_errors.fetch_add(1, Ordering::Relaxed);
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    tracing::warn!(error = %err, "raw socket send failed");
                }
                break;
            }
            hdr.status.store(STATUS_USER, Ordering::Release);
            *kernel_cursor = (idx + 1) & mask;
            self.queued -= 1;
        }
    }
}

fn open_packet_socket(iface: &str) -> RingResult<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW,
            (libc::ETH_P_ALL as u16).to_be() as i32,
        )
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => RingOpenError::Permission(iface.to_string()),
            _ => RingOpenError::Socket(err),
        });
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn interface_index(iface: &str) -> RingResult<u32> {
    let name = std::ffi::CString::new(iface)
        .map_err(|_| RingOpenError::UnknownInterface(iface.to_string()))?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(RingOpenError::UnknownInterface(iface.to_string()));
    }
    Ok(index)
}

fn bind_to_interface(fd: &OwnedFd, iface: &str) -> RingResult<()> {
    let index = interface_index(iface)?;
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
    addr.sll_ifindex = index as i32;
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(RingOpenError::Bind {
            iface: iface.to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn setup_ring_option(
    fd: &OwnedFd,
    iface: &str,
    direction: Direction,
    geometry: RingGeometry,
) -> RingResult<()> {
    let version: libc::c_int = 1; // TPACKET_V2
    setsockopt(fd, libc::SOL_PACKET, PACKET_VERSION, &version).map_err(|source| {
        RingOpenError::RingSetup {
            iface: iface.to_string(),
            source,
        }
    })?;
    #[repr(C)]
    struct TpacketReq {
        tp_block_size: u32,
        tp_block_nr: u32,
        tp_frame_size: u32,
        tp_frame_nr: u32,
    }
    let req = TpacketReq {
        tp_block_size: geometry.map_len() as u32,
        tp_block_nr: 1,
        tp_frame_size: geometry.frame_size as u32,
        tp_frame_nr: geometry.frame_count as u32,
    };
    let option = match direction {
        Direction::Ingress => PACKET_RX_RING,
        Direction::Egress => PACKET_TX_RING,
    };
    setsockopt(fd, libc::SOL_PACKET, option, &req).map_err(|source| RingOpenError::RingSetup {
        iface: iface.to_string(),
        source,
    })
}

fn setsockopt<T>(fd: &OwnedFd, level: libc::c_int, name: libc::c_int, value: &T) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
