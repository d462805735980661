// netblast-capture: pcap-NG capture pipeline
//
// One capture file per process: a Section Header Block, one Interface
// Description Block per emulated interface, and an Enhanced Packet Block
// per tapped frame. Frames are appended to an in-memory buffer on the hot
// path and flushed to disk at job boundaries only. The writer is shared
// by every I/O job, serialized by a single mutex; flush failures are
// logged and counted, never propagated into the data path.

pub mod pcapng;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

use netblast_timer::Timestamp;

use crate::pcapng::{encode_epb, encode_idb, encode_shb};

pub type CaptureResult<T> = Result<T, CaptureError>;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("create capture file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Direction flag recorded in each packet block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureDirection {
    Inbound,
    Outbound,
}

struct Writer {
    out: BufWriter<File>,
    /// Job-boundary buffer; EPBs accumulate here between flushes.
    buf: Vec<u8>,
    interfaces: u32,
    flush_failures: u64,
    path: PathBuf,
}

/// Process-wide capture sink.
pub struct CaptureSink {
    /// Monotonic epoch of this file; packet timestamps are offsets.
    epoch: Timestamp,
    writer: Mutex<Writer>,
}

impl CaptureSink {
    /// Create the capture file and write the section header.
    pub fn create(path: &Path) -> CaptureResult<Self> {
        let file = File::create(path).map_err(|source| CaptureError::Create {
            path: path.to_path_buf(),
            source,
        })?;
        let mut buf = Vec::with_capacity(64 * 1024);
        encode_shb(&mut buf);
        Ok(CaptureSink {
            epoch: Timestamp::now(),
            writer: Mutex::new(Writer {
                out: BufWriter::new(file),
                buf,
                interfaces: 0,
                flush_failures: 0,
                path: path.to_path_buf(),
            }),
        })
    }

    /// Register an emulated interface; the returned index tags its
    /// packet blocks.
    pub fn add_interface(&self, name: &str, snaplen: u32) -> u32 {
        let mut writer = self.writer.lock();
        let index = writer.interfaces;
        writer.interfaces += 1;
        encode_idb(&mut writer.buf, name, snaplen);
        tracing::debug!(interface = name, index, "capture interface registered");
        index
    }

    /// Append one frame. Buffered; visible in the file after the next
    /// flush.
    pub fn push(
        &self,
        ts: Timestamp,
        frame: &[u8],
        iface_index: u32,
        direction: CaptureDirection,
    ) {
        let offset_ns = ts.as_nanos().saturating_sub(self.epoch.as_nanos());
        let mut writer = self.writer.lock();
        encode_epb(&mut writer.buf, iface_index, offset_ns, frame, direction);
    }

    /// Write the buffer out. Called at job boundaries; a failing flush
    /// keeps the engine running.
    pub fn flush(&self) {
        let mut writer = self.writer.lock();
        if writer.buf.is_empty() {
            return;
        }
        let Writer {
            out,
            buf,
            flush_failures,
            path,
            ..
        } = &mut *writer;
        let result = out.write_all(buf).and_then(|_| out.flush());
        buf.clear();
        if let Err(err) = result {
            *flush_failures += 1;
            tracing::error!(path = %path.display(), error = %err, "capture flush failed");
        }
    }

    pub fn flush_failures(&self) -> u64 {
        self.writer.lock().flush_failures
    }

    pub fn epoch(&self) -> Timestamp {
        self.epoch
    }
}
