//! Control TX queue
//!
//! Single-producer/single-consumer ring of pre-built control frames. The
//! protocol stack (main thread) writes; the egress job, possibly a
//! worker thread, reads. This is the only lock-free structure crossing
//! threads: publication is a release store on the write index, observed
//! with an acquire load; slot release mirrors that on the read index.
//!
//! Overflow is not an error: the frame is dropped, the drop counted, and
//! producers are expected to tolerate it.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Fixed slot payload size; control frames never exceed one MTU.
pub const TXQ_BUFFER_LEN: usize = 2048;

struct Slot {
    len: usize,
    packet: [u8; TXQ_BUFFER_LEN],
}

struct Shared {
    slots: Box<[UnsafeCell<Slot>]>,
    mask: usize,
    /// Frames published; owned by the producer, read by the consumer.
    write_idx: AtomicUsize,
    /// Frames consumed; owned by the consumer, read by the producer.
    read_idx: AtomicUsize,
    dropped: AtomicU64,
}

// One producer half and one consumer half exist per queue; each index is
// stored by exactly one side. See split construction below.
unsafe impl Sync for Shared {}
unsafe impl Send for Shared {}

impl Shared {
    fn len(&self) -> usize {
        self.write_idx
            .load(Ordering::Acquire)
            .wrapping_sub(self.read_idx.load(Ordering::Acquire))
    }
}

/// Build a queue of `capacity` slots (power of two) and split it into its
/// two halves.
pub fn control_txq(capacity: usize) -> (TxqProducer, TxqConsumer) {
    assert!(
        capacity.is_power_of_two() && capacity > 0,
        "txq capacity must be a nonzero power of two"
    );
    let slots = (0..capacity)
        .map(|_| {
            UnsafeCell::new(Slot {
                len: 0,
                packet: [0u8; TXQ_BUFFER_LEN],
            })
        })
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let shared = Arc::new(Shared {
        slots,
        mask: capacity - 1,
        write_idx: AtomicUsize::new(0),
        read_idx: AtomicUsize::new(0),
        dropped: AtomicU64::new(0),
    });
    (
        TxqProducer {
            shared: shared.clone(),
        },
        TxqConsumer { shared },
    )
}

/// Producer half; owned by the protocol stack.
pub struct TxqProducer {
    shared: Arc<Shared>,
}

impl TxqProducer {
    /// Reserve the next slot for writing, or count a drop when full.
    pub fn write_slot(&mut self) -> Option<TxqWriter<'_>> {
        let write = self.shared.write_idx.load(Ordering::Relaxed);
        let read = self.shared.read_idx.load(Ordering::Acquire);
        if write.wrapping_sub(read) > self.shared.mask {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(TxqWriter {
            shared: &self.shared,
            index: write,
        })
    }

    /// Copy a complete frame in; false when the queue was full or the
    /// frame oversized.
    pub fn push(&mut self, frame: &[u8]) -> bool {
        if frame.len() > TXQ_BUFFER_LEN {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let Some(mut writer) = self.write_slot() else {
            return false;
        };
        writer.buf()[..frame.len()].copy_from_slice(frame);
        writer.commit(frame.len());
        true
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// A reserved, not yet published slot.
pub struct TxqWriter<'a> {
    shared: &'a Arc<Shared>,
    index: usize,
}

impl TxqWriter<'_> {
    pub fn buf(&mut self) -> &mut [u8] {
        let slot = self.shared.slots[self.index & self.shared.mask].get();
        unsafe { &mut (*slot).packet }
    }

    /// Publish the slot. The release store pairs with the consumer's
    /// acquire load so the payload happens-before its observation.
    pub fn commit(self, len: usize) {
        debug_assert!(len <= TXQ_BUFFER_LEN);
        let slot = self.shared.slots[self.index & self.shared.mask].get();
        unsafe { (*slot).len = len };
        self.shared
            .write_idx
            .store(self.index.wrapping_add(1), Ordering::Release);
    }
}

/// Consumer half; owned by the egress job.
pub struct TxqConsumer {
    shared: Arc<Shared>,
}

impl TxqConsumer {
    /// Peek the next readable frame without releasing it.
    pub fn read_slot(&self) -> Option<&[u8]> {
        let read = self.shared.read_idx.load(Ordering::Relaxed);
        let write = self.shared.write_idx.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        let slot = self.shared.slots[read & self.shared.mask].get();
        let slot = unsafe { &*slot };
        Some(&slot.packet[..slot.len])
    }

    /// Release the frame returned by the last `read_slot`.
    pub fn read_next(&mut self) {
        let read = self.shared.read_idx.load(Ordering::Relaxed);
        debug_assert_ne!(read, self.shared.write_idx.load(Ordering::Acquire));
        self.shared
            .read_idx
            .store(read.wrapping_add(1), Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
