// netblast-io: packet I/O engine
//
// Frames move between user space and the link through a kernel-shared
// circular ring. A cooperative timer drives per-interface RX and TX jobs;
// egress interleaves prioritized control frames with rate-limited stream
// traffic. The same inner loops run on the main thread (timer jobs) or on
// dedicated worker threads (per-ring drivers).

pub mod dispatch;
pub mod error;
pub mod ethernet;
pub mod interface;
pub mod ring;
pub mod rx;
pub mod tx;
pub mod txq;
pub mod worker;

#[cfg(feature = "sim")]
pub mod sim;

pub use dispatch::{CaptureTap, DeliverResult, NullSink, PacketSink};
pub use error::{RingOpenError, RingResult};
pub use ethernet::{EthernetView, VlanTag};
pub use interface::{
    CaptureRegistration, Interface, InterfaceReport, IoMode, LinkConfig, StreamReport,
};
pub use ring::{Direction, RingGeometry, RingHandle, RingStats, RingStatsSnapshot};
pub use rx::RxIo;
pub use tx::TxIo;
pub use txq::{control_txq, TxqConsumer, TxqProducer};
