//! Interface lifecycle
//!
//! An interface owns one ring per direction plus the control queue
//! producer. Bring-up opens the rings for the configured mode, registers
//! capture, and wires the RX/TX jobs either onto the caller's timer root
//! (shared-ring, raw-socket) or onto dedicated workers (worker-thread).
//! Teardown cancels timers, joins workers, flushes capture and releases
//! the mapped memory; every exit path unmaps exactly once.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use netblast_capture::CaptureSink;
use netblast_stream::{StreamStats, StreamTable};
use netblast_timer::{TimerHandle, TimerRoot};

use crate::dispatch::{CaptureTap, PacketSink};
use crate::error::{RingOpenError, RingResult};
use crate::ring::{Direction, RingGeometry, RingHandle, RingStats, RingStatsSnapshot};
use crate::rx::RxIo;
use crate::tx::TxIo;
use crate::txq::{control_txq, TxqProducer};
use crate::worker::{RxWorker, TxWorker};

/// How frames cross between user space and the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IoMode {
    SharedRing,
    WorkerThread,
    RawSocket,
    UserSpaceDriver,
}

impl Default for IoMode {
    fn default() -> Self {
        IoMode::SharedRing
    }
}

fn default_interval_ns() -> u64 {
    1_000_000
}

fn default_stream_burst() -> u32 {
    32
}

fn default_frame_size() -> usize {
    2048
}

fn default_frame_count() -> usize {
    4096
}

fn default_txq_capacity() -> usize {
    256
}

/// Per-link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    pub name: String,
    #[serde(default)]
    pub mode: IoMode,
    #[serde(default = "default_interval_ns")]
    pub rx_interval_ns: u64,
    #[serde(default = "default_interval_ns")]
    pub tx_interval_ns: u64,
    #[serde(default = "default_stream_burst")]
    pub stream_burst: u32,
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    #[serde(default = "default_frame_count")]
    pub frame_count: usize,
    #[serde(default = "default_txq_capacity")]
    pub txq_capacity: usize,
}

impl LinkConfig {
    pub fn geometry(&self) -> RingGeometry {
        RingGeometry {
            frame_size: self.frame_size,
            frame_count: self.frame_count,
        }
    }
}

/// Capture wiring handed to bring-up.
#[derive(Clone)]
pub struct CaptureRegistration {
    pub sink: Arc<CaptureSink>,
    pub include_streams: bool,
}

#[derive(Debug, Serialize)]
pub struct StreamReport {
    pub name: String,
    pub stats: StreamStats,
}

/// Final counters of a torn-down interface.
#[derive(Debug, Serialize)]
pub struct InterfaceReport {
    pub name: String,
    pub mode: IoMode,
    pub rx: RingStatsSnapshot,
    pub tx: RingStatsSnapshot,
    pub streams: Vec<StreamReport>,
    pub control_dropped: u64,
}

/// A brought-up emulated interface.
pub struct Interface {
    name: Arc<str>,
    mode: IoMode,
    rx_job: Option<Rc<RefCell<RxIo>>>,
    tx_job: Option<Rc<RefCell<TxIo>>>,
    rx_timer: Option<TimerHandle>,
    tx_timer: Option<TimerHandle>,
    rx_worker: Option<RxWorker>,
    tx_worker: Option<TxWorker>,
    txq: TxqProducer,
    rx_stats: Arc<RingStats>,
    tx_stats: Arc<RingStats>,
    capture: Option<Arc<CaptureSink>>,
}

impl Interface {
    /// Open both rings and start the I/O jobs.
    pub fn up(
        config: &LinkConfig,
        streams: StreamTable,
        sink: Arc<dyn PacketSink>,
        capture: Option<CaptureRegistration>,
        root: &mut TimerRoot,
    ) -> RingResult<Interface> {
        let geometry = config.geometry();
        let (rx_ring, tx_ring) = match config.mode {
            IoMode::SharedRing | IoMode::WorkerThread => (
                RingHandle::open(&config.name, Direction::Ingress, geometry)?,
                RingHandle::open(&config.name, Direction::Egress, geometry)?,
            ),
            IoMode::RawSocket => (
                RingHandle::open_raw(&config.name, Direction::Ingress, geometry)?,
                RingHandle::open_raw(&config.name, Direction::Egress, geometry)?,
            ),
            IoMode::UserSpaceDriver => {
                return Err(RingOpenError::Unsupported("user-space-driver"))
            }
        };
        Self::assemble(config, rx_ring, tx_ring, streams, sink, capture, root)
    }

    /// Bring-up over already-opened rings; shared by `up` and the sim
    /// harness.
    pub fn assemble(
        config: &LinkConfig,
        rx_ring: RingHandle,
        tx_ring: RingHandle,
        streams: StreamTable,
        sink: Arc<dyn PacketSink>,
        capture: Option<CaptureRegistration>,
        root: &mut TimerRoot,
    ) -> RingResult<Interface> {
        let name: Arc<str> = Arc::from(config.name.as_str());
        let capture_sink = capture.as_ref().map(|reg| reg.sink.clone());
        let tap = capture.map(|reg| {
            let index = reg
                .sink
                .add_interface(&config.name, config.geometry().payload_capacity() as u32);
            CaptureTap::new(reg.sink, index, reg.include_streams)
        });

        let rx_stats = rx_ring.stats().clone();
        let tx_stats = tx_ring.stats().clone();
        let (txq_producer, txq_consumer) = control_txq(config.txq_capacity);

        let rx_io = RxIo::new(rx_ring, name.clone(), tap.clone());
        let tx_io = TxIo::new(
            tx_ring,
            txq_consumer,
            streams,
            config.stream_burst,
            name.clone(),
            tap,
        );

        let mut interface = Interface {
            name: name.clone(),
            mode: config.mode,
            rx_job: None,
            tx_job: None,
            rx_timer: None,
            tx_timer: None,
            rx_worker: None,
            tx_worker: None,
            txq: txq_producer,
            rx_stats,
            tx_stats,
            capture: capture_sink,
        };

        match config.mode {
            IoMode::WorkerThread => {
                interface.rx_worker = Some(RxWorker::spawn(rx_io, sink).map_err(|source| {
                    RingOpenError::Worker {
                        iface: config.name.clone(),
                        source,
                    }
                })?);
                interface.tx_worker = Some(
                    TxWorker::spawn(tx_io, Duration::from_nanos(config.tx_interval_ns)).map_err(
                        |source| RingOpenError::Worker {
                            iface: config.name.clone(),
                            source,
                        },
                    )?,
                );
            }
            _ => {
                let rx_job = Rc::new(RefCell::new(rx_io));
                let tx_job = Rc::new(RefCell::new(tx_io));
                let job = rx_job.clone();
                let job_sink = sink;
                interface.rx_timer = Some(root.add_periodic(
                    &format!("{name} rx"),
                    Duration::ZERO,
                    Duration::from_nanos(config.rx_interval_ns),
                    move |ts| {
                        job.borrow_mut().run(&*job_sink, ts);
                    },
                ));
                let job = tx_job.clone();
                interface.tx_timer = Some(root.add_periodic(
                    &format!("{name} tx"),
                    Duration::ZERO,
                    Duration::from_nanos(config.tx_interval_ns),
                    move |ts| {
                        job.borrow_mut().run(ts);
                    },
                ));
                interface.rx_job = Some(rx_job);
                interface.tx_job = Some(tx_job);
            }
        }

        tracing::info!(iface = %name, mode = ?config.mode, "interface up");
        Ok(interface)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> IoMode {
        self.mode
    }

    /// Producer half of the control queue; the protocol stack publishes
    /// pre-built frames here.
    pub fn txq(&mut self) -> &mut TxqProducer {
        &mut self.txq
    }

    pub fn rx_stats(&self) -> RingStatsSnapshot {
        self.rx_stats.snapshot()
    }

    pub fn tx_stats(&self) -> RingStatsSnapshot {
        self.tx_stats.snapshot()
    }

    /// Stop jobs, join workers, flush capture and release the rings.
    pub fn down(mut self, root: &mut TimerRoot) -> InterfaceReport {
        if let Some(handle) = self.rx_timer.take() {
            root.cancel(handle);
        }
        if let Some(handle) = self.tx_timer.take() {
            root.cancel(handle);
        }

        let mut streams = Vec::new();
        if let Some(worker) = self.rx_worker.take() {
            drop(worker.stop());
        }
        if let Some(worker) = self.tx_worker.take() {
            let tx = worker.stop();
            collect_stream_reports(&tx, &mut streams);
        }
        if let Some(job) = self.rx_job.take() {
            // Cancelling the timer dropped the closure's clone.
            drop(Rc::try_unwrap(job).ok().expect("rx job released"));
        }
        if let Some(job) = self.tx_job.take() {
            let tx = Rc::try_unwrap(job).ok().expect("tx job released").into_inner();
            collect_stream_reports(&tx, &mut streams);
        }
        if let Some(capture) = &self.capture {
            capture.flush();
        }
        tracing::info!(iface = %self.name, "interface down");

        InterfaceReport {
            name: self.name.to_string(),
            mode: self.mode,
            rx: self.rx_stats.snapshot(),
            tx: self.tx_stats.snapshot(),
            streams,
            control_dropped: self.txq.dropped(),
        }
    }
}

fn collect_stream_reports(tx: &TxIo, out: &mut Vec<StreamReport>) {
    for stream in tx.streams().iter() {
        out.push(StreamReport {
            name: stream.name().to_string(),
            stats: stream.stats(),
        });
    }
}
