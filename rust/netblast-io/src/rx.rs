//! RX dispatcher
//!
//! One routine serves both execution modes: the main-thread driver calls
//! `run` from a timer job with the tick timestamp, the worker driver
//! calls it in a loop with its own clock reads. Frames are claimed from
//! the ring, validated at the outer Ethernet layer, stamped, handed to
//! the protocol dispatcher and tapped to capture, then released back to
//! the kernel. The capture buffer is flushed once per job, after the
//! claim loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use netblast_capture::CaptureDirection;
use netblast_timer::Timestamp;

use crate::dispatch::{CaptureTap, DeliverResult, PacketSink};
use crate::ethernet;
use crate::ring::{Direction, RingHandle};

pub struct RxIo {
    ring: RingHandle,
    iface: Arc<str>,
    capture: Option<CaptureTap>,
    /// Stamped once per job; every frame of the job shares it.
    timestamp: Timestamp,
}

impl RxIo {
    pub fn new(ring: RingHandle, iface: Arc<str>, capture: Option<CaptureTap>) -> Self {
        debug_assert_eq!(ring.direction(), Direction::Ingress);
        RxIo {
            ring,
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

    /// Stamp shared by every frame of the last productive job.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Drain all ready slots; returns the number of frames processed.
    /// With nothing pending the kernel is nudged with a non-blocking
    /// poll and the job returns immediately; it never spins.
    pub fn run(&mut self, sink: &dyn PacketSink, ts: Timestamp) -> usize {
        self.ring.rx_fill();
        if !self.ring.rx_ready() {
            self.ring.poll(libc::POLLIN);
            return 0;
        }
        self.timestamp = ts;

        let mut processed = 0usize;
        let mut tapped = false;
        loop {
            let Some(frame) = self.ring.rx_claim() else {
                break;
            };
            let stats = self.ring.stats();
            stats.packets.fetch_add(1, Ordering::Relaxed);
            stats.bytes.fetch_add(frame.data.len() as u64, Ordering::Relaxed);

            let mut synthetic = false;
            match ethernet::decode(frame.data, ts) {
                Ok(mut eth) => {
                    eth.merge_stripped_tag(frame.vlan_tci, frame.vlan_tpid);
                    match sink.deliver(&self.iface, &eth) {
                        DeliverResult::Control => {}
                        DeliverResult::StreamEcho => synthetic = true,
                        DeliverResult::Unknown => {
                            stats.unknown.fetch_add(1, Ordering::Relaxed);
                        }
                        DeliverResult::Error => {
                            stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Err(err) => {
                    stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(iface = %self.iface, %err, "outer header rejected");
                }
            }

            if let Some(tap) = &self.capture {
                if !synthetic || tap.include_streams() {
                    tap.push(ts, frame.data, CaptureDirection::Inbound);
                    tapped = true;
                }
            }

            drop(frame);
            self.ring.rx_release();
            processed += 1;
        }

        if tapped {
            if let Some(tap) = &self.capture {
                tap.flush();
            }
        }
        processed
    }
}
