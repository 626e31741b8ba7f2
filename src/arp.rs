//! Read-through view over the kernel's neighbour (ARP) table.
//!
//! `ArpCache` holds no private state of its own: every lookup issues a fresh `RTM_GETNEIGH`
//! netlink query scoped to one interface, which is acceptable because destinations change far
//! less often than packets arrive. This mirrors the `NETLINK_ROUTE` mechanism used elsewhere in
//! the corpus for neighbour/route resolution rather than parsing the legacy `/proc/net/arp` text
//! table.

use std::collections::HashSet;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Mutex;

use libc::{
    nlattr, nlmsghdr, recv, send, socket, AF_INET, AF_NETLINK, NDA_DST, NDA_LLADDR, NETLINK_ROUTE,
    NLMSG_DONE, NLMSG_ERROR, NLM_F_DUMP, NLM_F_REQUEST, RTM_GETNEIGH, RTM_NEWNEIGH, SOCK_RAW,
};
use log::warn;

/// Ethernet broadcast address, the fallback destination for any IPv4 this cache cannot resolve.
pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

const NLMSG_ALIGNTO: usize = 4;

#[repr(C)]
#[allow(non_camel_case_types)]
struct ndmsg {
    ndm_family: u8,
    _ndm_pad1: u8,
    _ndm_pad2: u16,
    ndm_ifindex: i32,
    ndm_state: u16,
    _ndm_flags: u8,
    _ndm_type: u8,
}

#[repr(C)]
struct NeighRequest {
    header: nlmsghdr,
    ndm: ndmsg,
}

/// Resolves destination IPv4 addresses to Ethernet MACs via the kernel's neighbour table.
///
/// Scoped to a single interface at construction, so every query only considers neighbours
/// reachable through that NIC. Logs a warning (at most once per missing address, to keep the hot
/// path from flooding the log under sustained back-pressure) and returns [`BROADCAST_MAC`] when
/// a destination has no resolved entry.
pub struct ArpCache {
    ifindex: u32,
    warned: Mutex<HashSet<Ipv4Addr>>,
}

impl ArpCache {
    pub fn new(ifindex: u32) -> Self {
        ArpCache {
            ifindex,
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// Resolve `ip` to a MAC, falling back to broadcast and logging on any miss.
    pub fn resolve(&self, ip: Ipv4Addr) -> [u8; 6] {
        match self.query(ip) {
            Ok(Some(mac)) => mac,
            Ok(None) => {
                self.warn_once(ip, "no ARP entry for destination, using broadcast");
                BROADCAST_MAC
            }
            Err(err) => {
                self.warn_once(ip, &format!("ARP query failed ({err}), using broadcast"));
                BROADCAST_MAC
            }
        }
    }

    fn warn_once(&self, ip: Ipv4Addr, message: &str) {
        let mut warned = self.warned.lock().unwrap();
        if warned.insert(ip) {
            warn!("{ip}: {message}");
        }
    }

    fn query(&self, ip: Ipv4Addr) -> std::io::Result<Option<[u8; 6]>> {
        let sock = Self::open_socket()?;

        let mut req = unsafe { mem::zeroed::<NeighRequest>() };
        let nlmsg_len = mem::size_of::<nlmsghdr>() + mem::size_of::<ndmsg>();
        req.header = nlmsghdr {
            nlmsg_len: nlmsg_len as u32,
            nlmsg_flags: (NLM_F_REQUEST | NLM_F_DUMP) as u16,
            nlmsg_type: RTM_GETNEIGH,
            nlmsg_pid: 0,
            nlmsg_seq: 1,
        };
        req.ndm.ndm_family = AF_INET as u8;
        req.ndm.ndm_ifindex = self.ifindex as i32;

        let req_bytes = unsafe {
            std::slice::from_raw_parts(
                (&req as *const NeighRequest) as *const u8,
                req.header.nlmsg_len as usize,
            )
        };
        if unsafe { send(sock.as_raw_fd(), req_bytes.as_ptr() as *const _, req_bytes.len(), 0) } < 0
        {
            return Err(std::io::Error::last_os_error());
        }

        let target = ip.octets();
        let mut buf = [0u8; 8 * 1024];
        let mut multipart = true;
        while multipart {
            multipart = false;
            let len = unsafe {
                recv(
                    sock.as_raw_fd(),
                    buf.as_mut_ptr() as *mut _,
                    buf.len(),
                    0,
                )
            };
            if len < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if len == 0 {
                break;
            }

            let mut offset = 0usize;
            let len = len as usize;
            while offset + mem::size_of::<nlmsghdr>() <= len {
                let header = unsafe {
                    std::ptr::read_unaligned(buf[offset..].as_ptr() as *const nlmsghdr)
                };
                let msg_len = header.nlmsg_len as usize;
                if msg_len < mem::size_of::<nlmsghdr>() || offset + msg_len > len {
                    break;
                }

                multipart = header.nlmsg_flags & libc::NLM_F_MULTI as u16 != 0;
                match header.nlmsg_type as i32 {
                    NLMSG_DONE => return Ok(None),
                    NLMSG_ERROR => return Ok(None),
                    t if t == RTM_NEWNEIGH as i32 => {
                        let data_off = offset + align_to(mem::size_of::<nlmsghdr>());
                        if let Some(mac) = parse_newneigh(&buf[data_off..offset + msg_len], &target)
                        {
                            return Ok(Some(mac));
                        }
                    }
                    _ => {}
                }

                offset += align_to(msg_len);
            }
        }

        Ok(None)
    }

    fn open_socket() -> std::io::Result<OwnedFd> {
        let fd = unsafe { socket(AF_NETLINK, SOCK_RAW, NETLINK_ROUTE) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

fn parse_newneigh(data: &[u8], target: &[u8; 4]) -> Option<[u8; 6]> {
    if data.len() < mem::size_of::<ndmsg>() {
        return None;
    }
    let attrs = &data[mem::size_of::<ndmsg>()..];

    let mut dst = None;
    let mut lladdr = None;
    let mut offset = 0usize;
    while offset + mem::size_of::<nlattr>() <= attrs.len() {
        let attr =
            unsafe { std::ptr::read_unaligned(attrs[offset..].as_ptr() as *const nlattr) };
        let attr_len = attr.nla_len as usize;
        if attr_len < mem::size_of::<nlattr>() || offset + attr_len > attrs.len() {
            break;
        }
        let payload = &attrs[offset + mem::size_of::<nlattr>()..offset + attr_len];
        match attr.nla_type & libc::NLA_TYPE_MASK as u16 {
            t if t == NDA_DST => dst = Some(payload),
            t if t == NDA_LLADDR => lladdr = Some(payload),
            _ => {}
        }
        offset += align_to(attr_len);
    }

    if dst? != target.as_slice() {
        return None;
    }
    let lladdr = lladdr?;
    if lladdr.len() < 6 {
        return None;
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&lladdr[..6]);
    Some(mac)
}

const fn align_to(v: usize) -> usize {
    (v + (NLMSG_ALIGNTO - 1)) & !(NLMSG_ALIGNTO - 1)
}
