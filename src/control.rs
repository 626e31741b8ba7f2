//! Single-threaded UDP control plane: add/remove/list destinations over a small binary protocol.

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::destination::{Destination, DestinationSet};

const CMD_ADD: u8 = 0x01;
const CMD_REMOVE: u8 = 0x02;
const CMD_LIST: u8 = 0x03;

const REQUEST_BODY_LEN: usize = 6; // 4-byte IPv4 + 2-byte port, network order
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ControlEndpoint<'a> {
    socket: UdpSocket,
    destinations: &'a DestinationSet,
    running: Arc<AtomicBool>,
}

impl<'a> ControlEndpoint<'a> {
    pub fn bind(port: u16, destinations: &'a DestinationSet, running: Arc<AtomicBool>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        socket.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
        Ok(ControlEndpoint {
            socket,
            destinations,
            running,
        })
    }

    /// Serve requests until `running` clears. Each `recv_from` call times out after
    /// [`RECEIVE_TIMEOUT`] so the flag is re-checked at least once a second.
    pub fn run(&self) {
        info!("control endpoint listening on {:?}", self.socket.local_addr());

        let mut buf = [0u8; 1 + REQUEST_BODY_LEN];
        while self.running.load(Ordering::Relaxed) {
            let (n, peer) = match self.socket.recv_from(&mut buf) {
                Ok(got) => got,
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(err) => {
                    warn!("control endpoint recv error: {err}");
                    continue;
                }
            };

            if let Some(reply) = self.handle(&buf[..n]) {
                if let Err(err) = self.socket.send_to(&reply, peer) {
                    warn!("control endpoint reply to {peer} failed: {err}");
                }
            }
        }
        info!("control endpoint stopped");
    }

    fn handle(&self, request: &[u8]) -> Option<Vec<u8>> {
        let (&cmd, body) = request.split_first()?;
        match cmd {
            CMD_ADD => {
                let dst = parse_destination(body)?;
                let ok = self.destinations.insert(dst);
                Some(vec![ok as u8])
            }
            CMD_REMOVE => {
                let dst = parse_destination(body)?;
                let ok = self.destinations.remove(dst);
                Some(vec![ok as u8])
            }
            CMD_LIST => {
                let snapshot = self.destinations.snapshot();
                let mut reply = Vec::with_capacity(1 + snapshot.len() * REQUEST_BODY_LEN);
                reply.push(snapshot.len() as u8);
                for dst in &snapshot {
                    reply.extend_from_slice(&dst.ipv4.octets());
                    reply.extend_from_slice(&dst.port.to_be_bytes());
                }
                Some(reply)
            }
            _ => None,
        }
    }
}

fn parse_destination(body: &[u8]) -> Option<Destination> {
    if body.len() != REQUEST_BODY_LEN {
        return None;
    }
    let ipv4 = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
    let port = u16::from_be_bytes([body[4], body[5]]);
    Some(Destination::new(ipv4, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn endpoint(set: &DestinationSet) -> ControlEndpoint<'_> {
        ControlEndpoint::bind(0, set, Arc::new(AtomicBool::new(true))).unwrap()
    }

    #[test]
    fn add_then_list_round_trips() {
        let set = DestinationSet::new();
        let ep = endpoint(&set);

        let add_req = [CMD_ADD, 10, 0, 0, 34, 0x23, 0x29];
        let reply = ep.handle(&add_req).unwrap();
        assert_eq!(reply, vec![1]);

        let list_reply = ep.handle(&[CMD_LIST]).unwrap();
        assert_eq!(list_reply, vec![1, 10, 0, 0, 34, 0x23, 0x29]);
    }

    #[test]
    fn s5_list_two_destinations_exact_bytes() {
        let set = DestinationSet::new();
        let ep = endpoint(&set);

        ep.handle(&[CMD_ADD, 10, 0, 0, 34, 0x23, 0x29]);
        ep.handle(&[CMD_ADD, 10, 0, 0, 35, 0x23, 0x2a]);

        let reply = ep.handle(&[CMD_LIST]).unwrap();
        assert_eq!(
            reply,
            vec![0x02, 0x0a, 0x00, 0x00, 0x22, 0x23, 0x29, 0x0a, 0x00, 0x00, 0x23, 0x23, 0x2a]
        );
    }

    #[test]
    fn remove_unknown_destination_reports_failure() {
        let set = DestinationSet::new();
        let ep = endpoint(&set);
        let reply = ep.handle(&[CMD_REMOVE, 10, 0, 0, 34, 0x23, 0x29]).unwrap();
        assert_eq!(reply, vec![0]);
    }

    #[test]
    fn unknown_command_is_ignored() {
        let set = DestinationSet::new();
        let ep = endpoint(&set);
        assert!(ep.handle(&[0xff]).is_none());
    }

    #[test]
    fn short_body_is_ignored() {
        let set = DestinationSet::new();
        let ep = endpoint(&set);
        assert!(ep.handle(&[CMD_ADD, 10, 0, 0]).is_none());
    }
}
