//! Builds Ethernet+IPv4+UDP frames for outbound replication traffic.

use std::net::Ipv4Addr;

use crate::arp::ArpCache;
use crate::destination::Destination;
use crate::net::checksum::{fold_checksum, ones_complement_sum};

const ETH_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Total non-payload framing overhead this builder writes.
pub const FRAME_OVERHEAD: usize = ETH_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN;

const ETHERTYPE_IPV4: u16 = 0x0800;

/// IPv4 identification field. Constant because the replicator never fragments, so uniqueness
/// across packets is not required.
const IPV4_ID: u16 = 12345;
const IPV4_TTL: u8 = 64;
const IPV4_PROTO_UDP: u8 = 17;

/// Fallback source MAC when the interface's own address cannot be read from sysfs.
const FALLBACK_SRC_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

/// Builds replication frames for one interface/listen-port pair. Holds only the identity
/// inputs an outbound frame needs (source MAC/IP, listen port) and a reference to the ARP
/// cache used to resolve each destination's MAC; no other mutable state.
pub struct PacketBuilder<'a> {
    src_mac: [u8; 6],
    src_ip: Ipv4Addr,
    listen_port: u16,
    arp: &'a ArpCache,
}

impl<'a> PacketBuilder<'a> {
    pub fn new(src_mac: Option<[u8; 6]>, src_ip: Ipv4Addr, listen_port: u16, arp: &'a ArpCache) -> Self {
        PacketBuilder {
            src_mac: src_mac.unwrap_or(FALLBACK_SRC_MAC),
            src_ip,
            listen_port,
            arp,
        }
    }

    /// Write one Ethernet+IPv4+UDP frame carrying `payload` to `dst` into `out`, returning the
    /// total frame length. Returns `0` if `out` is too small to hold the frame, in which case the
    /// caller should skip this destination rather than truncate.
    pub fn build(&self, dst: &Destination, payload: &[u8], out: &mut [u8]) -> usize {
        let total_len = FRAME_OVERHEAD + payload.len();
        if out.len() < total_len {
            return 0;
        }

        let dst_mac = self.arp.resolve(dst.ipv4);

        out[0..6].copy_from_slice(&dst_mac);
        out[6..12].copy_from_slice(&self.src_mac);
        out[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        let ip_total_len = (IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len()) as u16;
        let ip = &mut out[ETH_HEADER_LEN..ETH_HEADER_LEN + IPV4_HEADER_LEN];
        ip[0] = 0x45; // version 4, IHL 5
        ip[1] = 0; // TOS
        ip[2..4].copy_from_slice(&ip_total_len.to_be_bytes());
        ip[4..6].copy_from_slice(&IPV4_ID.to_be_bytes());
        ip[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags/fragment offset
        ip[8] = IPV4_TTL;
        ip[9] = IPV4_PROTO_UDP;
        ip[10..12].copy_from_slice(&0u16.to_be_bytes()); // checksum, filled below
        ip[12..16].copy_from_slice(&self.src_ip.octets());
        ip[16..20].copy_from_slice(&dst.ipv4.octets());

        let ip_checksum = fold_checksum(ones_complement_sum(ip));
        out[ETH_HEADER_LEN + 10..ETH_HEADER_LEN + 12].copy_from_slice(&ip_checksum.to_be_bytes());

        let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
        let udp_start = ETH_HEADER_LEN + IPV4_HEADER_LEN;
        let udp = &mut out[udp_start..udp_start + UDP_HEADER_LEN];
        udp[0..2].copy_from_slice(&self.listen_port.to_be_bytes());
        udp[2..4].copy_from_slice(&dst.port.to_be_bytes());
        udp[4..6].copy_from_slice(&udp_len.to_be_bytes());
        udp[6..8].copy_from_slice(&0u16.to_be_bytes()); // checksum, 0 is legal for IPv4/UDP

        let payload_start = udp_start + UDP_HEADER_LEN;
        out[payload_start..payload_start + payload.len()].copy_from_slice(payload);

        total_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn arp_stub_iface() -> u32 {
        // Loopback's ifindex is always 1; queries against it return no neighbours, so `resolve`
        // falls back to broadcast deterministically without needing real ARP state.
        1
    }

    #[test]
    fn s1_round_trip_single_destination() {
        let arp = ArpCache::new(arp_stub_iface());
        let builder = PacketBuilder::new(
            Some([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0x01]),
            Ipv4Addr::new(10, 0, 0, 71),
            9000,
            &arp,
        );
        let dst = Destination::new(Ipv4Addr::new(10, 0, 0, 34), 9001);
        let payload = b"hello";
        let mut out = [0u8; 64];

        let n = builder.build(&dst, payload, &mut out);
        assert_eq!(n, FRAME_OVERHEAD + payload.len());

        assert_eq!(&out[6..12], &[0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0x01]);
        assert_eq!(&out[12..14], &ETHERTYPE_IPV4.to_be_bytes());

        let ip = &out[14..34];
        assert_eq!(ip[8], 64); // TTL
        assert_eq!(ip[9], 17); // proto
        assert_eq!(&ip[12..16], &[10, 0, 0, 71]);
        assert_eq!(&ip[16..20], &[10, 0, 0, 34]);
        assert_eq!(fold_checksum(ones_complement_sum(ip)), 0xFFFF);

        let udp = &out[34..42];
        assert_eq!(u16::from_be_bytes([udp[0], udp[1]]), 9000);
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), 9001);
        assert_eq!(u16::from_be_bytes([udp[4], udp[5]]), 13);

        assert_eq!(&out[42..47], b"hello");
    }

    #[test]
    fn too_small_buffer_returns_zero() {
        let arp = ArpCache::new(arp_stub_iface());
        let builder = PacketBuilder::new(None, Ipv4Addr::new(10, 0, 0, 71), 9000, &arp);
        let dst = Destination::new(Ipv4Addr::new(10, 0, 0, 34), 9001);
        let mut out = [0u8; 10];
        assert_eq!(builder.build(&dst, b"hello", &mut out), 0);
    }

    #[test]
    fn fallback_src_mac_used_when_none_given() {
        let arp = ArpCache::new(arp_stub_iface());
        let builder = PacketBuilder::new(None, Ipv4Addr::new(10, 0, 0, 71), 9000, &arp);
        let dst = Destination::new(Ipv4Addr::new(10, 0, 0, 34), 9001);
        let mut out = [0u8; 64];
        builder.build(&dst, b"x", &mut out);
        assert_eq!(&out[6..12], &FALLBACK_SRC_MAC);
    }

    #[test]
    fn s2_fan_out_two_destinations_in_order() {
        use crate::destination::DestinationSet;

        let arp = ArpCache::new(arp_stub_iface());
        let builder = PacketBuilder::new(None, Ipv4Addr::new(10, 0, 0, 71), 9000, &arp);

        let set = DestinationSet::new();
        set.insert(Destination::new(Ipv4Addr::new(10, 0, 0, 35), 9001));
        set.insert(Destination::new(Ipv4Addr::new(10, 0, 0, 34), 9001));
        let destinations = set.snapshot();
        assert_eq!(destinations.len(), 2);

        let payload = vec![0xABu8; 1000];
        let mut frames = Vec::new();
        for dst in &destinations {
            let mut out = vec![0u8; FRAME_OVERHEAD + payload.len()];
            let n = builder.build(dst, &payload, &mut out);
            assert_eq!(n, out.len());
            frames.push(out);
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][FRAME_OVERHEAD..], &payload[..]);
        assert_eq!(&frames[1][FRAME_OVERHEAD..], &payload[..]);
        // Lexicographic order: .34 before .35.
        assert_eq!(&frames[0][14 + 16..14 + 20], &[10, 0, 0, 34]);
        assert_eq!(&frames[1][14 + 16..14 + 20], &[10, 0, 0, 35]);
    }

    proptest::proptest! {
        /// Property 3: the synthesised frame's UDP payload equals the input payload byte-for-byte,
        /// for any destination and any payload.
        #[test]
        fn payload_round_trips(
            a in 0u8..=255,
            port in 1u16..=65535,
            payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256),
        ) {
            let arp = ArpCache::new(arp_stub_iface());
            let builder = PacketBuilder::new(
                Some([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0x01]),
                Ipv4Addr::new(10, 0, 0, 71),
                9000,
                &arp,
            );
            let dst = Destination::new(Ipv4Addr::new(10, 0, 0, a), port);
            let mut out = vec![0u8; FRAME_OVERHEAD + payload.len()];

            let n = builder.build(&dst, &payload, &mut out);
            proptest::prop_assert_eq!(n, out.len());
            proptest::prop_assert_eq!(&out[FRAME_OVERHEAD..], &payload[..]);

            let ip = &out[14..34];
            proptest::prop_assert_eq!(fold_checksum(ones_complement_sum(ip)), 0xFFFF);
        }
    }
}
