//! Default protocol dispatcher
//!
//! The real subscriber and IGP decoders live behind the `PacketSink`
//! boundary. This stand-in classifies the well-known control ethertypes
//! so the engine's counters and capture filtering behave, and logs what
//! it sees at trace level.

use std::sync::atomic::{AtomicU64, Ordering};

use netblast_io::{DeliverResult, EthernetView, PacketSink};

const ETH_TYPE_IPV4: u16 = 0x0800;
const ETH_TYPE_ARP: u16 = 0x0806;
const ETH_TYPE_IPV6: u16 = 0x86DD;
const ETH_TYPE_PPPOE_DISCOVERY: u16 = 0x8863;
const ETH_TYPE_PPPOE_SESSION: u16 = 0x8864;
const ETH_TYPE_SLOW_PROTOCOLS: u16 = 0x8809;
const ETH_TYPE_EAPOL: u16 = 0x888E;
const ETH_TYPE_LLDP: u16 = 0x88CC;

/// Counts and classifies by outer ethertype.
#[derive(Debug, Default)]
pub struct EtherTypeSink {
    delivered: AtomicU64,
    ignored: AtomicU64,
}

impl EtherTypeSink {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }
}

impl PacketSink for EtherTypeSink {
    fn deliver(&self, iface: &str, eth: &EthernetView<'_>) -> DeliverResult {
        match eth.ethertype {
            ETH_TYPE_IPV4 | ETH_TYPE_ARP | ETH_TYPE_IPV6 | ETH_TYPE_PPPOE_DISCOVERY
            | ETH_TYPE_PPPOE_SESSION | ETH_TYPE_SLOW_PROTOCOLS | ETH_TYPE_EAPOL
            | ETH_TYPE_LLDP => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    iface,
                    ethertype = eth.ethertype,
                    vlan = eth.vlan_outer.map(|t| t.id),
                    len = eth.payload.len(),
                    "control frame"
                );
                DeliverResult::Control
            }
            other => {
                self.ignored.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(iface, ethertype = other, "unknown ethertype");
                DeliverResult::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netblast_io::ethernet;
    use netblast_timer::Timestamp;

    fn deliver(sink: &EtherTypeSink, ethertype: u16) -> DeliverResult {
        let mut buf = [0u8; 64];
        let len = ethernet::encode(
            &[0xff; 6],
            &[0x02, 0, 0, 0, 0, 1],
            &[],
            ethertype,
            &[0u8; 20],
            &mut buf,
        )
        .unwrap();
        let view = ethernet::decode(&buf[..len], Timestamp::from_nanos(0)).unwrap();
        sink.deliver("veth0", &view)
    }

    #[test]
    fn known_control_types_are_accepted() {
        let sink = EtherTypeSink::default();
        for ethertype in [0x0800, 0x0806, 0x86DD, 0x8863, 0x8864, 0x8809, 0x888E, 0x88CC] {
            assert_eq!(deliver(&sink, ethertype), DeliverResult::Control);
        }
        assert_eq!(sink.delivered(), 8);
    }

    #[test]
    fn unknown_types_are_reported() {
        let sink = EtherTypeSink::default();
        assert_eq!(deliver(&sink, 0x1234), DeliverResult::Unknown);
        assert_eq!(sink.ignored(), 1);
        assert_eq!(sink.delivered(), 0);
    }
}
