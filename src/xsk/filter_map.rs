//! Minimal client for the kernel's `BPF_MAP_TYPE_XSKMAP`, the map the in-kernel packet filter
//! (external to this crate, see the control wire protocol docs) uses to find which socket a
//! redirected frame belongs to. We only ever update or delete single elements of an
//! already-pinned map, so this wraps the raw `bpf()` syscall rather than pulling in a full eBPF
//! loader crate.

use std::ffi::CString;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::{Errno, LastErrno};

const BPF_MAP_LOOKUP_ELEM: u64 = 1;
const BPF_MAP_UPDATE_ELEM: u64 = 2;
const BPF_MAP_DELETE_ELEM: u64 = 3;
const BPF_OBJ_GET: u64 = 7;

/// Number of queue-id keys scanned by [`FilterMap::remove_fd`] when looking for stale entries to
/// clean up on socket close. The filter redirects by RX queue, so the number of live keys is
/// bounded by the NIC's queue count; 256 comfortably covers any multi-queue NIC in practice.
const SCAN_KEYS: u32 = 256;

#[repr(C)]
union BpfAttrMapElem {
    map_fd: u32,
    parts: MapElemParts,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct MapElemParts {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value_or_next_key: u64,
    flags: u64,
}

#[repr(C)]
struct BpfAttrObjGet {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

/// A handle to a pinned `xsks_map`, keyed by RX queue id, valued by socket file descriptor.
pub struct FilterMap {
    fd: libc::c_int,
}

impl FilterMap {
    /// Open a map pinned at `path` in bpffs (e.g. `/sys/fs/bpf/xdp_replicator/xsks_map`).
    pub fn open(path: &Path) -> Result<Self, Errno> {
        let cpath = CString::new(path.as_os_str().to_string_lossy().as_bytes())
            .map_err(|_| Errno(libc::EINVAL))?;

        let attr = BpfAttrObjGet {
            pathname: cpath.as_ptr() as u64,
            bpf_fd: 0,
            file_flags: 0,
        };

        let ret = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                BPF_OBJ_GET,
                &attr as *const _ as u64,
                core::mem::size_of_val(&attr),
            )
        };

        if ret < 0 {
            return Err(LastErrno)?;
        }
        Ok(FilterMap { fd: ret as libc::c_int })
    }

    /// Install `sock_fd` as the destination for frames on `queue_id`.
    pub fn update(&self, queue_id: u32, sock_fd: libc::c_int) -> Result<(), Errno> {
        let key = queue_id;
        let value: i32 = sock_fd;
        let attr = BpfAttrMapElem {
            parts: MapElemParts {
                map_fd: self.fd as u32,
                _pad: 0,
                key: (&key) as *const u32 as u64,
                value_or_next_key: (&value) as *const i32 as u64,
                flags: 0,
            },
        };

        let ret = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                BPF_MAP_UPDATE_ELEM,
                &attr as *const _ as u64,
                core::mem::size_of::<MapElemParts>(),
            )
        };

        if ret < 0 {
            return Err(LastErrno)?;
        }
        Ok(())
    }

    fn lookup(&self, queue_id: u32) -> Option<i32> {
        let key = queue_id;
        let mut value: i32 = -1;
        let attr = BpfAttrMapElem {
            parts: MapElemParts {
                map_fd: self.fd as u32,
                _pad: 0,
                key: (&key) as *const u32 as u64,
                value_or_next_key: (&mut value) as *mut i32 as u64,
                flags: 0,
            },
        };

        let ret = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                BPF_MAP_LOOKUP_ELEM,
                &attr as *const _ as u64,
                core::mem::size_of::<MapElemParts>(),
            )
        };

        if ret < 0 {
            None
        } else {
            Some(value)
        }
    }

    fn delete(&self, queue_id: u32) {
        let key = queue_id;
        let attr = BpfAttrMapElem {
            parts: MapElemParts {
                map_fd: self.fd as u32,
                _pad: 0,
                key: (&key) as *const u32 as u64,
                value_or_next_key: 0,
                flags: 0,
            },
        };

        let _ = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                BPF_MAP_DELETE_ELEM,
                &attr as *const _ as u64,
                core::mem::size_of::<MapElemParts>(),
            )
        };
    }

    /// Scan the first [`SCAN_KEYS`] queue ids and delete any entry whose value matches `sock_fd`.
    /// Used on socket close, where we know the fd but not necessarily which queue it occupies.
    pub fn remove_fd(&self, sock_fd: libc::c_int) {
        for queue_id in 0..SCAN_KEYS {
            if self.lookup(queue_id) == Some(sock_fd) {
                self.delete(queue_id);
            }
        }
    }
}

impl Drop for FilterMap {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Wire layout of the config map's single value: the destination the in-kernel filter matches
/// against, fields in network byte order.
#[repr(C)]
#[derive(Clone, Copy)]
struct FilterConfig {
    target_ip: u32,
    target_port: u16,
    _pad: u16,
}

/// A handle to a pinned one-element config map, keyed by `0`, holding the filter's match target.
pub struct ConfigMap {
    fd: libc::c_int,
}

impl ConfigMap {
    /// Open a map pinned at `path` in bpffs (e.g. `/sys/fs/bpf/xdp_replicator/config_map`).
    pub fn open(path: &Path) -> Result<Self, Errno> {
        let cpath = CString::new(path.as_os_str().to_string_lossy().as_bytes())
            .map_err(|_| Errno(libc::EINVAL))?;

        let attr = BpfAttrObjGet {
            pathname: cpath.as_ptr() as u64,
            bpf_fd: 0,
            file_flags: 0,
        };

        let ret = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                BPF_OBJ_GET,
                &attr as *const _ as u64,
                core::mem::size_of_val(&attr),
            )
        };

        if ret < 0 {
            return Err(LastErrno)?;
        }
        Ok(ConfigMap { fd: ret as libc::c_int })
    }

    /// Write `target_ip:target_port` to key `0`, converting both to network byte order.
    pub fn write(&self, target_ip: Ipv4Addr, target_port: u16) -> Result<(), Errno> {
        let key: u32 = 0;
        let value = FilterConfig {
            target_ip: u32::from(target_ip).to_be(),
            target_port: target_port.to_be(),
            _pad: 0,
        };
        let attr = BpfAttrMapElem {
            parts: MapElemParts {
                map_fd: self.fd as u32,
                _pad: 0,
                key: (&key) as *const u32 as u64,
                value_or_next_key: (&value) as *const FilterConfig as u64,
                flags: 0,
            },
        };

        let ret = unsafe {
            libc::syscall(
                libc::SYS_bpf,
                BPF_MAP_UPDATE_ELEM,
                &attr as *const _ as u64,
                core::mem::size_of::<MapElemParts>(),
            )
        };

        if ret < 0 {
            return Err(LastErrno)?;
        }
        Ok(())
    }
}

impl Drop for ConfigMap {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
