//! End-to-end engine scenarios over the simulated kernel ring
//!
//! The sim kernel plays the kernel side of the slot-status handoff, so
//! these tests exercise the full claim/dispatch/schedule/commit/notify
//! path without a packet socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netblast_io::ethernet::{self, ETH_TYPE_QINQ, ETH_TYPE_VLAN};
use netblast_io::sim::SimKernel;
use netblast_io::{
    control_txq, CaptureRegistration, DeliverResult, Direction, EthernetView, Interface, IoMode,
    LinkConfig, PacketSink, RingGeometry, RxIo, TxIo, VlanTag,
};
use netblast_stream::{MutationDescriptor, Stream, StreamTable};
use netblast_timer::{Timestamp, TimerRoot};

const DST: [u8; 6] = [0x02, 0, 0, 0, 0, 0x10];
const SRC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x20];

fn geometry(frame_count: usize) -> RingGeometry {
    RingGeometry {
        frame_size: 2048,
        frame_count,
    }
}

fn at(ns: u64) -> Timestamp {
    Timestamp::from_nanos(ns)
}

/// Builds an untagged IPv4 frame of exactly `total_len` bytes.
fn frame_of_len(total_len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; total_len];
    let payload = vec![0x5au8; total_len - ethernet::ETH_HEADER_LEN];
    let len = ethernet::encode(&DST, &SRC, &[], 0x0800, &payload, &mut buf).unwrap();
    assert_eq!(len, total_len);
    buf
}

#[derive(Debug, Clone)]
struct Seen {
    vlan_outer: Option<VlanTag>,
    vlan_inner: Option<VlanTag>,
    qinq: bool,
    ethertype: u16,
    timestamp: Timestamp,
}

/// Records every delivered header; verdict is fixed at construction.
struct RecordingSink {
    verdict: DeliverResult,
    seen: Mutex<Vec<Seen>>,
}

impl RecordingSink {
    fn new(verdict: DeliverResult) -> Arc<Self> {
        Arc::new(RecordingSink {
            verdict,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

impl PacketSink for RecordingSink {
    fn deliver(&self, _iface: &str, eth: &EthernetView<'_>) -> DeliverResult {
        self.seen.lock().unwrap().push(Seen {
            vlan_outer: eth.vlan_outer,
            vlan_inner: eth.vlan_inner,
            qinq: eth.qinq,
            ethertype: eth.ethertype,
            timestamp: eth.timestamp,
        });
        self.verdict
    }
}

fn stream(name: &str, rate_pps: f64, burst: u32, template_len: usize) -> Stream {
    let mut template = vec![0xbbu8; template_len];
    let len = ethernet::encode(
        &DST,
        &SRC,
        &[],
        0x0800,
        &vec![0xbbu8; template_len - ethernet::ETH_HEADER_LEN],
        &mut template,
    )
    .unwrap();
    assert_eq!(len, template_len);
    Stream::new(
        name,
        template,
        rate_pps,
        burst,
        MutationDescriptor {
            seq_offset: Some(16),
            ..Default::default()
        },
        at(0),
    )
    .unwrap()
}

/// Scenario: baseline RX. Three frames with a kernel-stripped VLAN tag
/// arrive; all are delivered with the tag re-installed and the counters
/// match.
#[test]
fn baseline_rx_delivers_and_counts() {
    let (ring, mut kernel) = SimKernel::ring(Direction::Ingress, geometry(8)).unwrap();
    for len in [64usize, 128, 1500] {
        assert!(kernel.push_frame(&frame_of_len(len), 100, ETH_TYPE_VLAN));
    }
    let sink = RecordingSink::new(DeliverResult::Control);
    let mut rx = RxIo::new(ring, Arc::from("sim0"), None);

    let tick = at(5_000_000);
    let processed = rx.run(&*sink, tick);

    assert_eq!(processed, 3);
    let stats = rx.ring().stats().snapshot();
    assert_eq!(stats.packets, 3);
    assert_eq!(stats.bytes, 1692);
    assert_eq!(stats.unknown, 0);
    assert_eq!(stats.protocol_errors, 0);
    assert_eq!(rx.ring().cursor(), 3);

    let seen = sink.seen();
    assert_eq!(seen.len(), 3);
    for frame in &seen {
        assert_eq!(frame.vlan_outer.map(|t| t.id), Some(100));
        assert_eq!(frame.timestamp, tick);
    }
}

/// Scenario: empty ring. The job polls the kernel once and returns
/// without spinning.
#[test]
fn empty_rx_polls_and_returns() {
    let (ring, _kernel) = SimKernel::ring(Direction::Ingress, geometry(4)).unwrap();
    let sink = RecordingSink::new(DeliverResult::Control);
    let mut rx = RxIo::new(ring, Arc::from("sim0"), None);
    assert_eq!(rx.run(&*sink, at(0)), 0);
    assert_eq!(rx.ring().stats().snapshot().polled, 1);
    assert_eq!(rx.ring().stats().snapshot().packets, 0);
}

/// Unknown and undecodable frames are counted without stopping the
/// claim loop.
#[test]
fn rx_counts_unknown_and_errors() {
    let (ring, mut kernel) = SimKernel::ring(Direction::Ingress, geometry(8)).unwrap();
    assert!(kernel.push_frame(&frame_of_len(64), 0, 0));
    assert!(kernel.push_frame(&[0u8; 8], 0, 0)); // truncated
    assert!(kernel.push_frame(&frame_of_len(64), 0, 0));
    let sink = RecordingSink::new(DeliverResult::Unknown);
    let mut rx = RxIo::new(ring, Arc::from("sim0"), None);
    assert_eq!(rx.run(&*sink, at(0)), 3);
    let stats = rx.ring().stats().snapshot();
    assert_eq!(stats.packets, 3);
    assert_eq!(stats.unknown, 2);
    assert_eq!(stats.protocol_errors, 1);
}

/// Scenario: control priority. Five queued control frames leave the
/// ring first; streams fill the remainder of the shared per-tick
/// budget.
#[test]
fn control_frames_precede_streams_in_one_tick() {
    let (ring, mut kernel) = SimKernel::ring(Direction::Egress, geometry(64)).unwrap();
    let (mut producer, consumer) = control_txq(16);
    for tag in 0u8..5 {
        let mut frame = frame_of_len(60);
        frame[14] = 0xc0 | tag; // marks control payloads
        assert!(producer.push(&frame));
    }
    let mut table = StreamTable::new();
    table.push(stream("s0", 10_000.0, 32, 64));

    let mut tx = TxIo::new(ring, consumer, table, 32, Arc::from("sim0"), None);
    let sent = tx.run(at(0));
    assert_eq!(sent, 32);

    let frames = kernel.complete_tx();
    assert_eq!(frames.len(), 32);
    for (tag, frame) in frames.iter().take(5).enumerate() {
        assert_eq!(frame.len(), 60);
        assert_eq!(frame[14], 0xc0 | tag as u8);
    }
    for (i, frame) in frames.iter().skip(5).enumerate() {
        assert_eq!(frame.len(), 64);
        // Stream sequence numbers prove FIFO order within the tick.
        let seq = u64::from_be_bytes(frame[16..24].try_into().unwrap());
        assert_eq!(seq, i as u64);
    }
    assert_eq!(tx.ring().queued(), 0);
}

/// Scenario: backpressure. A ring full of SEND_REQUEST slots produces
/// nothing but still notifies the kernel and clears `queued`.
#[test]
fn full_ring_notifies_and_resets_queued() {
    let (ring, mut kernel) = SimKernel::ring(Direction::Egress, geometry(4)).unwrap();
    let (_producer, consumer) = control_txq(4);
    let mut table = StreamTable::new();
    table.push(stream("s0", 1_000_000.0, 32, 64));
    let mut tx = TxIo::new(ring, consumer, table, 32, Arc::from("sim0"), None);

    kernel.set_fail_notify(true);
    assert_eq!(tx.run(at(0)), 4); // fills the ring, notify fails
    assert_eq!(tx.ring().queued(), 4);
    assert_eq!(tx.ring().stats().snapshot().io_errors, 1);

    kernel.set_fail_notify(false);
    let before = tx.ring().stats().snapshot();
    assert_eq!(tx.run(at(1_000_000)), 0);
    let after = tx.ring().stats().snapshot();
    assert_eq!(after.no_buffer, before.no_buffer + 1);
    assert_eq!(after.packets, before.packets);
    assert_eq!(tx.ring().queued(), 0);
    assert_eq!(kernel.pending_tx(), 4);
}

/// Scenario: token starvation. Two half-replenished streams with a
/// one-packet burst each transmit exactly once despite ample ring
/// space.
#[test]
fn starved_streams_send_one_packet_each() {
    let (ring, mut kernel) = SimKernel::ring(Direction::Egress, geometry(128)).unwrap();
    let (_producer, consumer) = control_txq(4);
    let mut table = StreamTable::new();
    table.push(stream("a", 5_000.0, 1, 64));
    table.push(stream("b", 5_000.0, 1, 64));
    let mut tx = TxIo::new(ring, consumer, table, 100, Arc::from("sim0"), None);

    // 100us after bucket creation: ~0.5 tokens accrued on top of the
    // initial balance, capped by the one-packet burst.
    let sent = tx.run(at(100_000));
    assert_eq!(sent, 2);
    assert_eq!(kernel.complete_tx().len(), 2);
    for stream in tx.streams().iter() {
        assert_eq!(stream.stats().packets, 1);
    }
}

/// Scenario: QinQ strip. The kernel strips outer 200/0x88A8; the
/// delivered header restores it above the decoded 100.
#[test]
fn qinq_stripped_tag_is_restored() {
    let (ring, mut kernel) = SimKernel::ring(Direction::Ingress, geometry(4)).unwrap();
    let tag = VlanTag {
        id: 100,
        pcp: 0,
        tpid: ETH_TYPE_VLAN,
    };
    let mut buf = vec![0u8; 64];
    let len = ethernet::encode(&DST, &SRC, &[tag], 0x0800, &[0u8; 40], &mut buf).unwrap();
    buf.truncate(len);
    assert!(kernel.push_frame(&buf, 200, ETH_TYPE_QINQ));

    let sink = RecordingSink::new(DeliverResult::Control);
    let mut rx = RxIo::new(ring, Arc::from("sim0"), None);
    assert_eq!(rx.run(&*sink, at(0)), 1);

    let seen = sink.seen();
    assert_eq!(seen[0].vlan_outer.map(|t| t.id), Some(200));
    assert_eq!(seen[0].vlan_inner.map(|t| t.id), Some(100));
    assert!(seen[0].qinq);
    assert_eq!(seen[0].ethertype, 0x0800);
}

/// A full main-thread tick: the timer root fires RX and TX jobs that
/// share one tick timestamp and move frames both ways.
#[test]
fn timer_driven_interface_moves_frames() {
    let config = LinkConfig {
        name: "sim0".to_string(),
        mode: IoMode::SharedRing,
        rx_interval_ns: 1_000_000,
        tx_interval_ns: 1_000_000,
        stream_burst: 8,
        frame_size: 2048,
        frame_count: 16,
        txq_capacity: 16,
    };
    let (rx_ring, mut rx_kernel) = SimKernel::ring(Direction::Ingress, config.geometry()).unwrap();
    let (tx_ring, mut tx_kernel) = SimKernel::ring(Direction::Egress, config.geometry()).unwrap();
    let sink = RecordingSink::new(DeliverResult::Control);
    let mut root = TimerRoot::new();
    let mut table = StreamTable::new();
    table.push(stream("s0", 1_000.0, 2, 64));

    let mut iface = Interface::assemble(
        &config,
        rx_ring,
        tx_ring,
        table,
        sink.clone(),
        None,
        &mut root,
    )
    .unwrap();

    assert!(rx_kernel.push_frame(&frame_of_len(64), 0, 0));
    assert!(iface.txq().push(&frame_of_len(72)));
    root.tick_at(Timestamp::now() + Duration::from_millis(2));

    assert_eq!(iface.rx_stats().packets, 1);
    assert!(iface.tx_stats().packets >= 1);
    let frames = tx_kernel.complete_tx();
    assert_eq!(frames[0].len(), 72); // control before streams
    assert_eq!(sink.seen().len(), 1);

    let report = iface.down(&mut root);
    assert_eq!(report.name, "sim0");
    assert_eq!(report.rx.packets, 1);
    assert_eq!(report.control_dropped, 0);
    assert_eq!(root.armed(), 0);
}

/// Scenario: teardown. Workers observe the cleared active flag within
/// one sleep period, rings come home, and the capture buffer reaches
/// the file.
#[test]
fn worker_teardown_joins_and_flushes_capture() {
    let dir = tempfile::tempdir().unwrap();
    let pcap_path = dir.path().join("teardown.pcapng");
    let capture = Arc::new(netblast_capture::CaptureSink::create(&pcap_path).unwrap());

    let config = LinkConfig {
        name: "sim0".to_string(),
        mode: IoMode::WorkerThread,
        rx_interval_ns: 1_000_000,
        tx_interval_ns: 1_000_000,
        stream_burst: 4,
        frame_size: 2048,
        frame_count: 16,
        txq_capacity: 16,
    };
    let (rx_ring, mut rx_kernel) = SimKernel::ring(Direction::Ingress, config.geometry()).unwrap();
    let (tx_ring, mut tx_kernel) = SimKernel::ring(Direction::Egress, config.geometry()).unwrap();
    let sink = RecordingSink::new(DeliverResult::Control);
    let mut root = TimerRoot::new();

    let mut iface = Interface::assemble(
        &config,
        rx_ring,
        tx_ring,
        StreamTable::new(),
        sink.clone(),
        Some(CaptureRegistration {
            sink: capture.clone(),
            include_streams: false,
        }),
        &mut root,
    )
    .unwrap();

    assert!(rx_kernel.push_frame(&frame_of_len(64), 0, 0));
    assert!(iface.txq().push(&frame_of_len(60)));

    // Let the workers pick both up; the kernel side completes TX as the
    // frames appear.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    let mut sent = Vec::new();
    while sent.is_empty() && std::time::Instant::now() < deadline {
        sent.extend(tx_kernel.complete_tx());
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].len(), 60);

    let started = std::time::Instant::now();
    let report = iface.down(&mut root);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(report.rx.packets, 1);
    assert_eq!(report.tx.packets, 1);
    assert_eq!(capture.flush_failures(), 0);

    // Both tapped frames survived into the file.
    let data = std::fs::read(&pcap_path).unwrap();
    let epb_count = count_blocks(&data, 0x0000_0006);
    assert_eq!(epb_count, 2);
}

fn count_blocks(data: &[u8], wanted: u32) -> usize {
    let mut count = 0;
    let mut at = 0;
    while at + 8 <= data.len() {
        let block_type = u32::from_le_bytes(data[at..at + 4].try_into().unwrap());
        let total_len = u32::from_le_bytes(data[at + 4..at + 8].try_into().unwrap()) as usize;
        if total_len < 12 || at + total_len > data.len() {
            break;
        }
        if block_type == wanted {
            count += 1;
        }
        at += total_len;
    }
    count
}

/// The shared stats handles stay observable while a worker owns the
/// ring.
#[test]
fn worker_stats_visible_from_main_thread() {
    let config = LinkConfig {
        name: "sim1".to_string(),
        mode: IoMode::WorkerThread,
        rx_interval_ns: 1_000_000,
        tx_interval_ns: 1_000_000,
        stream_burst: 4,
        frame_size: 2048,
        frame_count: 8,
        txq_capacity: 8,
    };
    let (rx_ring, mut rx_kernel) = SimKernel::ring(Direction::Ingress, config.geometry()).unwrap();
    let (tx_ring, _tx_kernel) = SimKernel::ring(Direction::Egress, config.geometry()).unwrap();
    let sink = RecordingSink::new(DeliverResult::Control);
    let mut root = TimerRoot::new();
    let iface = Interface::assemble(
        &config,
        rx_ring,
        tx_ring,
        StreamTable::new(),
        sink,
        None,
        &mut root,
    )
    .unwrap();

    assert!(rx_kernel.push_frame(&frame_of_len(64), 0, 0));
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    let observed = AtomicBool::new(false);
    while std::time::Instant::now() < deadline {
        if iface.rx_stats().packets == 1 {
            observed.store(true, Ordering::Relaxed);
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(observed.load(Ordering::Relaxed));
    iface.down(&mut root);
}
