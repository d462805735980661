//! Protocol-layer boundary and capture tap
//!
//! The engine validates the outer Ethernet header and hands the decoded
//! view upward; everything beyond that is the protocol stack's business.
//! The verdict steers the ring counters and tells the capture tap whether
//! the frame is an echo of our own generated streams.

use std::sync::Arc;

use netblast_capture::{CaptureDirection, CaptureSink};
use netblast_timer::Timestamp;

use crate::ethernet::EthernetView;

/// Outcome of delivering one frame to the protocol dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverResult {
    /// Control-plane traffic, accepted.
    Control,
    /// An echo of a locally generated stream frame.
    StreamEcho,
    /// No decoder claimed the ethertype.
    Unknown,
    /// A decoder claimed it and failed.
    Error,
}

/// Upstream interface to the protocol decoders. Implementations own
/// their synchronization: worker-mode rings deliver from their own
/// threads.
pub trait PacketSink: Send + Sync {
    fn deliver(&self, iface: &str, eth: &EthernetView<'_>) -> DeliverResult;
}

/// A sink that claims nothing; useful as a default and in tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl PacketSink for NullSink {
    fn deliver(&self, _iface: &str, _eth: &EthernetView<'_>) -> DeliverResult {
        DeliverResult::Unknown
    }
}

/// Per-interface handle into the process-wide capture pipeline.
#[derive(Clone)]
pub struct CaptureTap {
    sink: Arc<CaptureSink>,
    iface_index: u32,
    include_streams: bool,
}

impl CaptureTap {
    pub fn new(sink: Arc<CaptureSink>, iface_index: u32, include_streams: bool) -> Self {
        CaptureTap {
            sink,
            iface_index,
            include_streams,
        }
    }

    pub fn include_streams(&self) -> bool {
        self.include_streams
    }

    pub fn push(&self, ts: Timestamp, frame: &[u8], direction: CaptureDirection) {
        self.sink.push(ts, frame, self.iface_index, direction);
    }

    /// Flush at job boundaries only; failures are logged downstream and
    /// never propagate into the data path.
    pub fn flush(&self) {
        self.sink.flush();
    }
}
