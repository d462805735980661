//! Stream table
//!
//! All streams bound to one egress ring, in insertion order. Selection is
//! a rotating scan: at most one full loop per call, the cursor advancing
//! past the admitted stream so saturated fleets are served round-robin.

use netblast_timer::Timestamp;

use crate::stream::Stream;

#[derive(Debug, Default)]
pub struct StreamTable {
    streams: Vec<Stream>,
    cursor: usize,
}

impl StreamTable {
    pub fn new() -> Self {
        StreamTable::default()
    }

    pub fn push(&mut self, stream: Stream) {
        self.streams.push(stream);
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stream> {
        self.streams.iter()
    }

    /// Batch refill at the start of an egress tick; amortizes the clock
    /// read across the whole fleet.
    pub fn refill_all(&mut self, now: Timestamp) {
        for stream in &mut self.streams {
            stream.bucket_mut().refill(now);
        }
    }

    /// The first stream from the cursor whose bucket admits one packet.
    /// The token is consumed; the cursor moves past the returned stream.
    pub fn next_eligible(&mut self, now: Timestamp) -> Option<&mut Stream> {
        let n = self.streams.len();
        if n == 0 {
            return None;
        }
        let mut admitted = None;
        for i in 0..n {
            let idx = (self.cursor + i) % n;
            if self.streams[idx].admit(now) {
                admitted = Some(idx);
                break;
            }
        }
        let idx = admitted?;
        self.cursor = (idx + 1) % n;
        Some(&mut self.streams[idx])
    }
}
