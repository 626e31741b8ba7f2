use std::ffi::CStr;
use std::io;

use super::{IfCtx, IfInfo, SocketFd, SocketMmapOffsets};
use crate::xdp::{XdpMmapOffsets, XdpMmapOffsetsV1, XdpStatistics, XdpStatisticsV2};
use crate::{Errno, LastErrno};

impl IfInfo {
    /// Create an info referring to no device, to be overwritten with [`Self::from_name`].
    pub fn invalid() -> Self {
        IfInfo {
            ctx: IfCtx {
                ifindex: 0,
                queue_id: 0,
                netnscookie: 0,
            },
            ifname: [0; libc::IFNAMSIZ],
        }
    }

    /// Resolve an interface by name, e.g. `enp8s0`.
    pub fn from_name(&mut self, st: &CStr) -> Result<(), Errno> {
        let bytes = st.to_bytes_with_nul();
        if bytes.len() > self.ifname.len() {
            return Err(Errno(libc::EINVAL));
        }

        let bytes = unsafe { &*(bytes as *const _ as *const [libc::c_char]) };
        let index = unsafe { libc::if_nametoindex(st.as_ptr()) };
        if index == 0 {
            return Err(LastErrno)?;
        }

        self.ctx.ifindex = index;
        self.ctx.queue_id = 0;
        self.ctx.netnscookie = 0;
        self.ifname[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Resolve an interface by kernel index. See [`Self::from_name`].
    pub fn from_ifindex(&mut self, index: libc::c_uint) -> Result<(), Errno> {
        let mut name = [0 as libc::c_char; libc::IFNAMSIZ];
        let ret = unsafe { libc::if_indextoname(index, name.as_mut_ptr()) };
        if ret.is_null() {
            return Err(LastErrno)?;
        }
        self.ctx.ifindex = index;
        self.ifname = name;
        Ok(())
    }

    /// Configure the queue this socket will bind to. Not validated until `bind`.
    pub fn set_queue(&mut self, queue_id: u32) {
        self.ctx.queue_id = queue_id;
    }

    fn name(&self) -> String {
        let bytes: Vec<u8> = self.ifname.iter().take_while(|&&b| b != 0).map(|&b| b as u8).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// The interface's hardware address, read from `/sys/class/net/<if>/address`.
    pub fn mac_addr(&self) -> io::Result<[u8; 6]> {
        let path = format!("/sys/class/net/{}/address", self.name());
        let contents = std::fs::read_to_string(path)?;
        let contents = contents.trim();
        let mut mac = [0u8; 6];
        for (i, part) in contents.split(':').enumerate().take(6) {
            mac[i] = u8::from_str_radix(part, 16)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed MAC address"))?;
        }
        Ok(mac)
    }

    /// The interface's first configured IPv4 address, via `getifaddrs`.
    pub fn ipv4_addr(&self) -> io::Result<std::net::Ipv4Addr> {
        let mut head: *mut libc::ifaddrs = core::ptr::null_mut();
        if unsafe { libc::getifaddrs(&mut head) } != 0 {
            return Err(io::Error::last_os_error());
        }

        struct Guard(*mut libc::ifaddrs);
        impl Drop for Guard {
            fn drop(&mut self) {
                unsafe { libc::freeifaddrs(self.0) };
            }
        }
        let _guard = Guard(head);

        let want = self.name();
        let mut cursor = head;
        while !cursor.is_null() {
            let entry = unsafe { &*cursor };
            if !entry.ifa_name.is_null() {
                let name = unsafe { CStr::from_ptr(entry.ifa_name) }.to_string_lossy();
                if name == want && !entry.ifa_addr.is_null() {
                    let family = unsafe { (*entry.ifa_addr).sa_family };
                    if family as i32 == libc::AF_INET {
                        let sockaddr = entry.ifa_addr as *const libc::sockaddr_in;
                        let addr = unsafe { (*sockaddr).sin_addr.s_addr };
                        return Ok(std::net::Ipv4Addr::from(u32::from_be(addr)));
                    }
                }
            }
            cursor = entry.ifa_next;
        }

        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "interface has no IPv4 address",
        ))
    }
}

impl SocketMmapOffsets {
    const OPT_V1: libc::socklen_t = core::mem::size_of::<XdpMmapOffsetsV1>() as libc::socklen_t;
    const OPT_LATEST: libc::socklen_t = core::mem::size_of::<XdpMmapOffsets>() as libc::socklen_t;

    pub(crate) fn new(sock: &SocketFd) -> Result<Self, Errno> {
        SocketMmapOffsets::try_from(sock)
    }
}

impl Default for SocketMmapOffsets {
    fn default() -> Self {
        SocketMmapOffsets {
            inner: XdpMmapOffsets::default(),
        }
    }
}

impl TryFrom<&SocketFd> for SocketMmapOffsets {
    type Error = Errno;

    fn try_from(sock: &SocketFd) -> Result<Self, Self::Error> {
        use crate::xdp::{XdpRingOffsets, XdpRingOffsetsV1};

        fn fixup_v1(v1: XdpRingOffsetsV1) -> XdpRingOffsets {
            XdpRingOffsets {
                producer: v1.producer,
                consumer: v1.consumer,
                desc: v1.desc,
                flags: v1.consumer + core::mem::size_of::<u32>() as u64,
            }
        }

        union Offsets {
            v1: XdpMmapOffsetsV1,
            latest: XdpMmapOffsets,
            init: (),
        }

        let mut this = Self::default();
        let off = Offsets { init: () };

        match sock.get_opt(super::SOL_XDP, super::Umem::XDP_MMAP_OFFSETS, &off)? {
            Self::OPT_V1 => {
                let v1 = unsafe { off.v1 };
                this.inner = XdpMmapOffsets {
                    rx: fixup_v1(v1.rx),
                    tx: fixup_v1(v1.tx),
                    fr: fixup_v1(v1.fr),
                    cr: fixup_v1(v1.cr),
                };
                Ok(this)
            }
            Self::OPT_LATEST => {
                this.inner = unsafe { off.latest };
                Ok(this)
            }
            _ => Err(Errno(-libc::EINVAL)),
        }
    }
}

impl TryFrom<&SocketFd> for XdpStatistics {
    type Error = Errno;

    fn try_from(sock: &SocketFd) -> Result<Self, Self::Error> {
        let this = Self::default();
        sock.get_opt(super::SOL_XDP, super::Umem::XDP_STATISTICS, &this)?;
        Ok(this)
    }
}

impl TryFrom<&SocketFd> for XdpStatisticsV2 {
    type Error = Errno;

    fn try_from(sock: &SocketFd) -> Result<Self, Self::Error> {
        let this = Self::default();
        sock.get_opt(super::SOL_XDP, super::Umem::XDP_STATISTICS, &this)?;
        Ok(this)
    }
}
