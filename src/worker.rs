//! The per-queue data-plane loop: receive, validate, fan out, recycle, reclaim.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::destination::{DestinationSet, ThreadLocalDestCache};
use crate::net::PacketBuilder;
use crate::stats::QueueStats;
use crate::xdp_socket::XdpSocket;

const ETH_HEADER_LEN: usize = 14;
const IPV4_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const MIN_FRAME_LEN: usize = ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN + UDP_HEADER_LEN;
const ETHERTYPE_IPV4: u16 = 0x0800;
const IP_PROTO_UDP: u8 = 17;

/// Receive batch size per loop iteration; chosen to match one cache-line-friendly sweep of the
/// descriptor array without growing `pending_recycle`'s allocation unreasonably.
const RECEIVE_BATCH: usize = 64;

/// Retries (with a short sleep) the drain loop gives outstanding completions on shutdown.
const SHUTDOWN_DRAIN_RETRIES: u32 = 10;
const SHUTDOWN_DRAIN_SLEEP: std::time::Duration = std::time::Duration::from_millis(1);

/// One worker owns one [`XdpSocket`] for the lifetime of the run loop and fans every validated
/// inbound datagram out to the current destination snapshot.
pub struct Worker<'a> {
    queue_id: u32,
    socket: XdpSocket,
    destinations: &'a DestinationSet,
    builder: PacketBuilder<'a>,
    stats: Arc<QueueStats>,
    running: Arc<AtomicBool>,
    refresh_timeout: std::time::Duration,
}

impl<'a> Worker<'a> {
    pub fn new(
        queue_id: u32,
        socket: XdpSocket,
        destinations: &'a DestinationSet,
        builder: PacketBuilder<'a>,
        stats: Arc<QueueStats>,
        running: Arc<AtomicBool>,
        refresh_timeout: std::time::Duration,
    ) -> Self {
        Worker {
            queue_id,
            socket,
            destinations,
            builder,
            stats,
            running,
            refresh_timeout,
        }
    }

    /// Pin this thread to core `queue_id + 1` (core 0 is reserved for interrupts) and run until
    /// `running` clears.
    pub fn run(mut self) {
        if let Some(cores) = core_affinity::get_core_ids() {
            let target = (self.queue_id + 1) as usize;
            if let Some(core) = cores.into_iter().find(|c| c.id == target) {
                core_affinity::set_for_current(core);
            } else {
                debug!("queue {}: no core {target} to pin to, running unpinned", self.queue_id);
            }
        }

        let mut cache = ThreadLocalDestCache::with_timeout(self.destinations, self.refresh_timeout);
        let mut recv_buf = [(0u64, 0u32); RECEIVE_BATCH];
        let mut tx_scratch = vec![0u8; self.socket.umem().frame_size() as usize];
        let mut payload_buf = vec![0u8; self.socket.umem().frame_size() as usize];

        while self.running.load(Ordering::Relaxed) {
            let n = self.socket.receive(&mut recv_buf);
            if n == 0 {
                std::hint::spin_loop();
                self.socket.recycle_frames();
                self.socket.poll_tx_completions();
                continue;
            }

            for &(addr, len) in &recv_buf[..n] {
                self.process_one(addr, len, &mut cache, &mut tx_scratch, &mut payload_buf);
            }

            self.socket.recycle_frames();
            self.socket.poll_tx_completions();
        }

        for _ in 0..SHUTDOWN_DRAIN_RETRIES {
            self.socket.poll_tx_completions();
            if self.socket.outstanding_tx() == 0 {
                break;
            }
            std::thread::sleep(SHUTDOWN_DRAIN_SLEEP);
        }
        info!("queue {}: worker stopped", self.queue_id);
    }

    fn process_one(
        &mut self,
        addr: u64,
        len: u32,
        cache: &mut ThreadLocalDestCache<'_>,
        tx_scratch: &mut [u8],
        payload_buf: &mut Vec<u8>,
    ) {
        let len = len as usize;

        // Copy the validated payload out of the UMEM frame into an owned buffer before fanning
        // out: the frame is borrowed from `self.socket`, and `send_one` below needs `&mut
        // self.socket`, so the borrow can't outlive this block.
        let payload_len = {
            let frame = unsafe { self.socket.frame_mut(addr, len) };
            match validate_and_extract_payload(frame) {
                Some(payload) => {
                    payload_buf[..payload.len()].copy_from_slice(payload);
                    payload.len()
                }
                None => {
                    self.stats.packets_dropped_invalid.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        };
        let payload = &payload_buf[..payload_len];

        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_received.fetch_add(len as u64, Ordering::Relaxed);

        let destinations = cache.get();
        for dst in destinations {
            let tx_batch = self.socket.tx_batch();
            if self.socket.outstanding_tx() > self.socket.umem().tx_frames().saturating_sub(tx_batch) {
                self.stats.backpressure_events.fetch_add(1, Ordering::Relaxed);
                self.socket.request_driver_poll();
                continue;
            }

            let built = self.builder.build(dst, payload, tx_scratch);
            if built == 0 {
                self.stats.packets_dropped_invalid.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let frame_nb = self.socket.umem().next_tx_frame();
            let frame_addr = u64::from(frame_nb) * u64::from(self.socket.umem().frame_size());
            let tx_frame = unsafe { self.socket.frame_mut(frame_addr, built) };
            tx_frame.copy_from_slice(&tx_scratch[..built]);

            if self.socket.send_one(frame_addr, built as u32) {
                self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_sent.fetch_add(built as u64, Ordering::Relaxed);
            } else {
                self.stats.backpressure_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Validate an inbound frame's Ethernet/IPv4/UDP headers in place and return its UDP payload.
fn validate_and_extract_payload(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < MIN_FRAME_LEN {
        return None;
    }

    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype != ETHERTYPE_IPV4 {
        return None;
    }

    let ip = &frame[ETH_HEADER_LEN..];
    let ihl = (ip[0] & 0x0F) as usize * 4;
    if ihl < IPV4_MIN_HEADER_LEN || ETH_HEADER_LEN + ihl + UDP_HEADER_LEN > frame.len() {
        return None;
    }
    if ip[9] != IP_PROTO_UDP {
        return None;
    }

    let udp_start = ETH_HEADER_LEN + ihl;
    let udp = &frame[udp_start..];
    let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
    if udp_len < UDP_HEADER_LEN || udp_start + udp_len > frame.len() {
        return None;
    }

    Some(&frame[udp_start + UDP_HEADER_LEN..udp_start + udp_len])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_udp_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; MIN_FRAME_LEN + payload.len()];
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame[14] = 0x45;
        frame[14 + 9] = IP_PROTO_UDP;
        let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
        frame[14 + 20 + 4..14 + 20 + 6].copy_from_slice(&udp_len.to_be_bytes());
        frame[14 + 20 + UDP_HEADER_LEN..].copy_from_slice(payload);
        frame
    }

    #[test]
    fn valid_udp_frame_yields_payload() {
        let frame = build_udp_frame(b"hello");
        assert_eq!(validate_and_extract_payload(&frame), Some(&b"hello"[..]));
    }

    #[test]
    fn too_short_frame_rejected() {
        let frame = vec![0u8; 10];
        assert_eq!(validate_and_extract_payload(&frame), None);
    }

    #[test]
    fn wrong_ethertype_rejected() {
        let mut frame = build_udp_frame(b"hi");
        frame[12..14].copy_from_slice(&0x86ddu16.to_be_bytes());
        assert_eq!(validate_and_extract_payload(&frame), None);
    }

    #[test]
    fn wrong_proto_rejected() {
        let mut frame = build_udp_frame(b"hi");
        frame[14 + 9] = 6; // TCP
        assert_eq!(validate_and_extract_payload(&frame), None);
    }

    #[test]
    fn truncated_udp_length_rejected() {
        let mut frame = build_udp_frame(b"hi");
        frame[14 + 20 + 4..14 + 20 + 6].copy_from_slice(&255u16.to_be_bytes());
        assert_eq!(validate_and_extract_payload(&frame), None);
    }
}
