//! Error types for ring and interface bring-up
//!
//! Fatal conditions only: everything transient (no buffer, empty poll,
//! queue overflow, EAGAIN) is a counter, not an error.

use std::io;

use thiserror::Error;

pub type RingResult<T> = Result<T, RingOpenError>;

#[derive(Error, Debug)]
pub enum RingOpenError {
    #[error("packet socket: {0}")]
    Socket(#[source] io::Error),

    #[error("no such interface: {0}")]
    UnknownInterface(String),

    #[error("bind to {iface}: {source}")]
    Bind {
        iface: String,
        #[source]
        source: io::Error,
    },

    #[error("ring option on {iface}: {source}")]
    RingSetup {
        iface: String,
        #[source]
        source: io::Error,
    },

    #[error("map ring for {iface}: {source}")]
    Map {
        iface: String,
        #[source]
        source: io::Error,
    },

    #[error("permission denied opening {0} (CAP_NET_RAW required)")]
    Permission(String),

    #[error("invalid ring geometry: {0}")]
    InvalidGeometry(String),

    #[error("spawn worker for {iface}: {source}")]
    Worker {
        iface: String,
        #[source]
        source: io::Error,
    },

    #[error("io mode {0} is not supported by this build")]
    Unsupported(&'static str),
}
