//! TX scheduler
//!
//! Two-phase egress: control frames from the SPSC queue first, then
//! rate-limited stream traffic. Control and stream frames share one
//! per-tick budget (`stream_burst`), so a burst of control traffic
//! shrinks the stream share of the same tick. A single kernel
//! notification covers everything committed in the tick.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use netblast_capture::CaptureDirection;
use netblast_stream::StreamTable;
use netblast_timer::Timestamp;

use crate::dispatch::CaptureTap;
use crate::ring::{Direction, RingHandle};
use crate::txq::TxqConsumer;

pub struct TxIo {
    ring: RingHandle,
    txq: TxqConsumer,
    streams: StreamTable,
    stream_burst: u32,
    iface: Arc<str>,
    capture: Option<CaptureTap>,
    timestamp: Timestamp,
}

impl TxIo {
    pub fn new(
        ring: RingHandle,
        txq: TxqConsumer,
        streams: StreamTable,
        stream_burst: u32,
        iface: Arc<str>,
        capture: Option<CaptureTap>,
    ) -> Self {
        debug_assert_eq!(ring.direction(), Direction::Egress);
        TxIo {
            ring,
            txq,
            streams,
            stream_burst,
            iface,
            capture,
            timestamp: Timestamp::default(),
        }
    }

    pub fn ring(&self) -> &RingHandle {
        &self.ring
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn streams(&self) -> &StreamTable {
        &self.streams
    }

    pub fn txq(&self) -> &TxqConsumer {
        &self.txq
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// One egress tick; returns the number of frames committed.
    pub fn run(&mut self, ts: Timestamp) -> usize {
        self.streams.refill_all(ts);
        self.timestamp = ts;

        let mut sent = 0u32;
        let mut ctrl = true;
        let mut tapped = false;
        loop {
            // Phase B is bounded by the shared per-tick budget.
            if !ctrl && sent >= self.stream_burst {
                break;
            }
            let Some(buf) = self.ring.tx_reserve() else {
                self.ring.stats().no_buffer.fetch_add(1, Ordering::Relaxed);
                self.ring.poll(libc::POLLOUT);
                break;
            };

            let len;
            let mut is_stream = false;
            if ctrl {
                match self.txq.read_slot() {
                    Some(packet) => {
                        len = packet.len();
                        buf[..len].copy_from_slice(packet);
                    }
                    None => {
                        // Control queue drained; hand the reserved slot
                        // to phase B.
                        ctrl = false;
                        continue;
                    }
                }
            } else {
                match self.streams.next_eligible(ts) {
                    Some(stream) => {
                        len = stream.materialize(buf, ts);
                        is_stream = true;
                    }
                    None => break,
                }
            }

            if let Some(tap) = &self.capture {
                if !is_stream || tap.include_streams() {
                    tap.push(ts, &buf[..len], CaptureDirection::Outbound);
                    tapped = true;
                }
            }

            self.ring.tx_commit(len);
            if ctrl {
                self.txq.read_next();
            }
            let stats = self.ring.stats();
            stats.packets.fetch_add(1, Ordering::Relaxed);
            stats.bytes.fetch_add(len as u64, Ordering::Relaxed);
            sent += 1;
        }

        if tapped {
            if let Some(tap) = &self.capture {
                tap.flush();
            }
        }
        self.ring.notify_kernel();
        sent as usize
    }
}
