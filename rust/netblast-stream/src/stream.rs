//! Stream definition and frame materialization
//!
//! A stream owns an immutable template frame. Materializing a packet
//! copies the template into the reserved ring slot and applies the
//! per-packet mutations: a big-endian 64-bit sequence number, the
//! monotonic tick timestamp (for latency measurement on the receive
//! side), and an incremental checksum fix-up covering exactly the mutated
//! regions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use netblast_timer::Timestamp;

use crate::bucket::TokenBucket;
use crate::bytes::{incremental_update, read_be_uint, write_be_uint};

pub type StreamResult<T> = Result<T, StreamError>;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("stream {0}: template is empty")]
    EmptyTemplate(String),

    #[error("stream {name}: {field} offset {offset} (+{width}) exceeds template of {len} bytes")]
    OffsetOutOfRange {
        name: String,
        field: &'static str,
        offset: usize,
        width: usize,
        len: usize,
    },

    #[error("stream {name}: {field} offset {offset} is not 16-bit aligned")]
    UnalignedOffset {
        name: String,
        field: &'static str,
        offset: usize,
    },

    #[error("stream {name}: checksum field overlaps a mutated region")]
    ChecksumOverlap { name: String },

    #[error("stream {name}: sequence and timestamp regions overlap")]
    MutationOverlap { name: String },
}

/// Where the materializer writes into each packet. All offsets are
/// relative to the start of the frame and must be 16-bit aligned so the
/// checksum fix-up operates on whole words.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MutationDescriptor {
    /// 8 bytes, big-endian sequence number.
    pub seq_offset: Option<usize>,
    /// 8 bytes: seconds (u32) then nanoseconds (u32), big-endian.
    pub timestamp_offset: Option<usize>,
    /// 2 bytes: ones-complement checksum covering the mutated fields.
    pub checksum_offset: Option<usize>,
}

impl MutationDescriptor {
    fn validate(&self, name: &str, template_len: usize) -> StreamResult<()> {
        let fields = [
            ("seq", self.seq_offset, 8usize),
            ("timestamp", self.timestamp_offset, 8),
            ("checksum", self.checksum_offset, 2),
        ];
        for (field, offset, width) in fields {
            let Some(offset) = offset else { continue };
            if offset % 2 != 0 {
                return Err(StreamError::UnalignedOffset {
                    name: name.to_string(),
                    field,
                    offset,
                });
            }
            if offset + width > template_len {
                return Err(StreamError::OffsetOutOfRange {
                    name: name.to_string(),
                    field,
                    offset,
                    width,
                    len: template_len,
                });
            }
        }
        if let (Some(seq), Some(ts)) = (self.seq_offset, self.timestamp_offset) {
            if seq < ts + 8 && ts < seq + 8 {
                return Err(StreamError::MutationOverlap {
                    name: name.to_string(),
                });
            }
        }
        if let Some(ck) = self.checksum_offset {
            for mutated in [self.seq_offset, self.timestamp_offset].into_iter().flatten() {
                if ck < mutated + 8 && mutated < ck + 2 {
                    return Err(StreamError::ChecksumOverlap {
                        name: name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Per-stream accumulators, exported with the ring counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StreamStats {
    pub packets: u64,
    pub bytes: u64,
}

/// A configured synthetic flow bound to one egress ring.
#[derive(Debug)]
pub struct Stream {
    name: String,
    template: Box<[u8]>,
    mutation: MutationDescriptor,
    bucket: TokenBucket,
    seq: u64,
    stats: StreamStats,
}

impl Stream {
    pub fn new(
        name: impl Into<String>,
        template: Vec<u8>,
        rate_pps: f64,
        burst: u32,
        mutation: MutationDescriptor,
        now: Timestamp,
    ) -> StreamResult<Self> {
        let name = name.into();
        if template.is_empty() {
            return Err(StreamError::EmptyTemplate(name));
        }
        mutation.validate(&name, template.len())?;
        Ok(Stream {
            name,
            template: template.into_boxed_slice(),
            mutation,
            bucket: TokenBucket::new(rate_pps, burst, now),
            seq: 0,
            stats: StreamStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frame_len(&self) -> usize {
        self.template.len()
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn bucket_mut(&mut self) -> &mut TokenBucket {
        &mut self.bucket
    }

    /// Admit one packet against the token bucket.
    pub fn admit(&mut self, now: Timestamp) -> bool {
        self.bucket.consume(1.0, now)
    }

    /// Write the next packet of this stream into `buf` and return its
    /// length. `buf` must hold at least `frame_len()` bytes.
    pub fn materialize(&mut self, buf: &mut [u8], ts: Timestamp) -> usize {
        let len = self.template.len();
        let frame = &mut buf[..len];
        frame.copy_from_slice(&self.template);

        let mut checksum = self
            .mutation
            .checksum_offset
            .map(|off| read_be_uint(&self.template[off..off + 2]) as u16);

        if let Some(off) = self.mutation.seq_offset {
            write_be_uint(&mut frame[off..off + 8], self.seq);
            if let Some(ck) = checksum.as_mut() {
                *ck = incremental_update(*ck, &self.template[off..off + 8], &frame[off..off + 8]);
            }
        }
        if let Some(off) = self.mutation.timestamp_offset {
            write_be_uint(&mut frame[off..off + 4], ts.sec() as u32 as u64);
            write_be_uint(&mut frame[off + 4..off + 8], ts.nsec() as u64);
            if let Some(ck) = checksum.as_mut() {
                *ck = incremental_update(*ck, &self.template[off..off + 8], &frame[off..off + 8]);
            }
        }
        if let (Some(off), Some(ck)) = (self.mutation.checksum_offset, checksum) {
            write_be_uint(&mut frame[off..off + 2], ck as u64);
        }

        self.seq = self.seq.wrapping_add(1);
        self.stats.packets += 1;
        self.stats.bytes += len as u64;
        len
    }
}
