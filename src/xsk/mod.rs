//! Thin wrapper over the kernel's AF_XDP socket and ring interface.
//!
//! This module intentionally mirrors the shape of the upstream `xdpilone` crate: a `Socket` is a
//! bare AF_XDP file descriptor bound to an interface/queue, a `Umem` is the registered memory
//! region backing its rings, and a `DeviceQueue`/`RingRx`/`RingTx` are the mapped ring views. The
//! one deliberate deviation from upstream is that [`Umem`] here never shares its file descriptor
//! with another queue: the replicator's ownership model gives each NIC queue (and so each worker
//! thread) its own private `Umem`, so the cross-socket `XDP_SHARED_UMEM` bookkeeping upstream
//! carries is unnecessary and has been dropped.

use std::collections::BTreeSet;
use std::sync::Arc;

use spin::RwLock;

use crate::xdp::{XdpMmapOffsets, XdpStatistics, XdpStatisticsV2};
use crate::Errno;

mod filter_map;
mod iface;
mod ring;
mod socket;
mod umem;
mod user;

pub use filter_map::{ConfigMap, FilterMap};
pub use ring::{Ring, RingCons, RingProd};
pub use user::{ReadComplete, ReadRx, WriteFill, WriteTx};

/// Socket-level option namespace for XDP, as used with `setsockopt`/`getsockopt`.
pub(crate) const SOL_XDP: libc::c_int = 283;

/// An index to a buffer within a ring.
///
/// Not a raw offset: callers must mask it with a ring's size to obtain a slot, and the kernel
/// silently wraps it in 32-bit space. See upstream `xdpilone::BufIdx` for the full rationale; we
/// keep the same representation so the ring math below reads identically.
#[repr(transparent)]
#[derive(Debug, Copy, Clone)]
pub struct BufIdx(pub u32);

/// Identifies one (interface, queue, network namespace) tuple, used to prevent a `Umem` from
/// wiring a fill/completion pair onto the same device queue twice.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct IfCtx {
    pub ifindex: u32,
    pub queue_id: u32,
    pub netnscookie: u64,
}

/// Resolved identity of a network interface: its kernel index, its queue, and its name.
#[derive(Debug, Copy, Clone)]
pub struct IfInfo {
    pub(crate) ctx: IfCtx,
    pub(crate) ifname: [libc::c_char; libc::IFNAMSIZ],
}

pub(crate) struct SocketFd(pub libc::c_int);

/// An AF_XDP socket bound to (not yet: see [`Umem::bind`]) one interface and queue.
pub struct Socket {
    pub(crate) fd: Arc<SocketFd>,
    pub(crate) info: Arc<IfInfo>,
}

/// Configuration for the receive and transmit rings of a single socket.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub rx_size: Option<core::num::NonZeroU32>,
    pub tx_size: Option<core::num::NonZeroU32>,
    pub bind_flags: u16,
}

/// Configuration for a [`Umem`]'s registered memory and its fill/completion rings.
#[derive(Debug, Clone)]
pub struct UmemConfig {
    pub fill_size: u32,
    pub complete_size: u32,
    pub frame_size: u32,
    pub headroom: u32,
    pub flags: u32,
    /// Number of frames, starting at offset 0, reserved for outbound (TX) traffic.
    pub tx_frames: u32,
    /// Number of frames, starting right after the TX range, reserved for inbound (RX) traffic.
    pub rx_frames: u32,
}

pub(crate) struct SocketMmapOffsets {
    pub(crate) inner: XdpMmapOffsets,
}

/// The registered memory region and fill/completion rings shared by one socket's queues.
pub struct Umem {
    pub(crate) umem_area: core::ptr::NonNull<[u8]>,
    pub(crate) config: UmemConfig,
    pub(crate) fd: Arc<SocketFd>,
    pub(crate) devices: DeviceControl,
    /// Fetch-add cursor handed out by `next_tx_frame`.
    pub(crate) tx_cursor: std::sync::atomic::AtomicU32,
    /// Present when this `Umem` allocated (and therefore must unmap) its own backing memory, as
    /// opposed to being handed a caller-owned mapping via `Umem::new`.
    pub(crate) owned_area: Option<umem::MmapArea>,
}

/// Safety: the umem area is never aliased mutably outside of kernel-synchronized ring slots.
unsafe impl Send for Umem {}
unsafe impl Sync for Umem {}

pub(crate) trait ControlSet: Send + Sync {
    fn insert(&self, ctx: IfCtx) -> bool;
    fn contains(&self, ctx: &IfCtx) -> bool;
    fn remove(&self, ctx: &IfCtx);
}

#[derive(Clone)]
pub(crate) struct DeviceControl {
    inner: Arc<SpinLockedControlSet>,
}

#[derive(Default)]
struct SpinLockedControlSet {
    inner: RwLock<BTreeSet<IfCtx>>,
}

impl ControlSet for SpinLockedControlSet {
    fn insert(&self, ctx: IfCtx) -> bool {
        self.inner.write().insert(ctx)
    }

    fn contains(&self, ctx: &IfCtx) -> bool {
        self.inner.read().contains(ctx)
    }

    fn remove(&self, ctx: &IfCtx) {
        self.inner.write().remove(ctx);
    }
}

impl std::ops::Deref for DeviceControl {
    type Target = dyn ControlSet;
    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl Default for DeviceControl {
    fn default() -> Self {
        DeviceControl {
            inner: Arc::new(SpinLockedControlSet::default()),
        }
    }
}

/// Mapped fill+completion rings for one device queue, the shared liveness requirement of a
/// `Umem`'s queue.
pub struct DeviceQueue {
    pub(crate) fcq: DeviceRings,
    pub(crate) socket: Socket,
    pub(crate) devices: DeviceControl,
}

pub(crate) struct DeviceRings {
    pub(crate) map: SocketMmapOffsets,
    pub(crate) cons: RingCons,
    pub(crate) prod: RingProd,
}

/// A socket that has had its ring sizes configured but not yet been bound and mapped.
pub struct RxTx {
    pub(crate) socket: Socket,
    pub(crate) config: Arc<SocketConfig>,
    pub(crate) map: SocketMmapOffsets,
}

/// The mapped receive ring of a bound socket.
pub struct RingRx {
    pub(crate) fd: Arc<SocketFd>,
    pub(crate) ring: RingCons,
}

/// The mapped transmit ring of a bound socket.
pub struct RingTx {
    pub(crate) fd: Arc<SocketFd>,
    pub(crate) ring: RingProd,
}

pub(crate) fn ptr_len(ptr: *mut [u8]) -> usize {
    // Safety: the fat pointer metadata is a plain length, no deref happens here.
    unsafe { (*(ptr as *const [u8])).len() }
}

impl Default for UmemConfig {
    fn default() -> Self {
        UmemConfig {
            fill_size: 1 << 12,
            complete_size: 1 << 12,
            frame_size: 1 << 12,
            headroom: 0,
            flags: 0,
            tx_frames: 1 << 11,
            rx_frames: 1 << 11,
        }
    }
}

impl IfInfo {
    /// Get the `ifindex`, numeric ID of the interface in the kernel, for the identified interface.
    pub fn ifindex(&self) -> u32 {
        self.ctx.ifindex
    }

    /// Get the queue ID previously set with `set_queue`.
    pub fn queue_id(&self) -> u32 {
        self.ctx.queue_id
    }
}

impl XdpStatistics {
    pub(crate) fn new(sock: &SocketFd) -> Result<Self, Errno> {
        XdpStatistics::try_from(sock)
    }
}

impl XdpStatisticsV2 {
    pub(crate) fn new(sock: &SocketFd) -> Result<Self, Errno> {
        XdpStatisticsV2::try_from(sock)
    }
}
