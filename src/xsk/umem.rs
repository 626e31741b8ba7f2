use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::xdp::{SockAddrXdp, XdpUmemReg};
use crate::xsk::{
    ptr_len, DeviceControl, DeviceQueue, DeviceRings, IfCtx, RingCons, RingProd, RxTx, Socket,
    SocketConfig, SocketFd, SocketMmapOffsets, Umem, UmemConfig,
};
use crate::Errno;

/// Owns a memory-mapped, memory-locked region allocated by [`Umem::alloc`]; unmaps on drop.
pub(crate) struct MmapArea(core::ptr::NonNull<[u8]>);

// Safety: the area is shared only with the kernel through the ring protocol, never aliased
// mutably from more than one thread at a time by this crate's own code.
unsafe impl Send for MmapArea {}
unsafe impl Sync for MmapArea {}

impl Drop for MmapArea {
    fn drop(&mut self) {
        let len = ptr_len(self.0.as_ptr());
        unsafe { libc::munmap(self.0.as_ptr() as *mut _, len) };
    }
}

impl Umem {
    /* Socket options for XDP */
    pub(crate) const XDP_MMAP_OFFSETS: libc::c_int = 1;
    pub(crate) const XDP_RX_RING: libc::c_int = 2;
    pub(crate) const XDP_TX_RING: libc::c_int = 3;
    pub(crate) const XDP_UMEM_REG: libc::c_int = 4;
    pub(crate) const XDP_UMEM_FILL_RING: libc::c_int = 5;
    pub(crate) const XDP_UMEM_COMPLETION_RING: libc::c_int = 6;
    pub(crate) const XDP_STATISTICS: libc::c_int = 7;
    pub(crate) const XDP_OPTIONS: libc::c_int = 8;

    /// Register a new Umem over `area`.
    ///
    /// # Safety
    ///
    /// `area` must be valid for `config.frame_size * (config.tx_frames + config.rx_frames)` bytes
    /// and must outlive the returned `Umem`.
    pub unsafe fn new(config: UmemConfig, area: core::ptr::NonNull<[u8]>) -> Result<Umem, Errno> {
        fn is_page_aligned(area: core::ptr::NonNull<[u8]>) -> bool {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            (area.as_ptr() as *mut u8 as usize & (page_size - 1)) == 0
        }

        debug_assert!(is_page_aligned(area), "umem area must be page-aligned");

        let umem = Umem {
            config,
            fd: Arc::new(SocketFd::new()?),
            umem_area: area,
            devices: DeviceControl::default(),
            tx_cursor: AtomicU32::new(0),
            owned_area: None,
        };

        Self::configure(&umem)?;
        Ok(umem)
    }

    /// Allocate a fresh, page-aligned, huge-page-hinted, memory-locked backing region and
    /// register it as a Umem. This is the path a standalone worker uses; `Umem::new` remains
    /// available for callers that already own a suitable mapping (e.g. a static buffer).
    ///
    /// The region is partitioned `[0, tx_frames)` then `[tx_frames, tx_frames+rx_frames)`, in
    /// units of `frame_size` bytes, matching the fixed TX/RX split the rest of this crate assumes.
    pub fn alloc(config: UmemConfig) -> Result<Umem, Errno> {
        let frame_count = config.tx_frames as usize + config.rx_frames as usize;
        let len = frame_count * config.frame_size as usize;

        // Try huge pages first; most kernels silently fall back without MAP_HUGETLB if the
        // system has none reserved, but some reject the flag outright, so retry without it.
        let mut mmap = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };

        if mmap == libc::MAP_FAILED {
            mmap = unsafe {
                libc::mmap(
                    core::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
        }

        if mmap == libc::MAP_FAILED {
            return Err(Errno::new());
        }

        unsafe { libc::madvise(mmap, len, libc::MADV_HUGEPAGE) };

        if unsafe { libc::mlock(mmap, len) } != 0 {
            let err = Errno::new();
            unsafe { libc::munmap(mmap, len) };
            return Err(err);
        }

        let slice = core::ptr::slice_from_raw_parts_mut(mmap as *mut u8, len);
        let area = unsafe { core::ptr::NonNull::new_unchecked(slice) };

        let mut umem = unsafe { Self::new(config, area) }?;
        umem.owned_area = Some(MmapArea(area));
        Ok(umem)
    }

    fn configure(this: &Umem) -> Result<(), Errno> {
        let mr = XdpUmemReg {
            addr: this.umem_area.as_ptr() as *mut u8 as u64,
            len: ptr_len(this.umem_area.as_ptr()) as u64,
            chunk_size: this.config.frame_size,
            headroom: this.config.headroom,
            flags: this.config.flags,
            tx_metadata_len: 0,
        };

        let err = unsafe {
            libc::setsockopt(
                this.fd.0,
                super::SOL_XDP,
                Self::XDP_UMEM_REG,
                (&mr) as *const _ as *const libc::c_void,
                core::mem::size_of_val(&mr) as libc::socklen_t,
            )
        };

        if err != 0 {
            return Err(Errno::new());
        }
        Ok(())
    }

    /// Returns the next TX frame *number* in `[0, tx_frames)`. Multiply by `frame_size` to obtain
    /// a byte offset into the Umem. Wrapping is intentional: by the time the counter laps, the
    /// caller's own in-flight accounting (`XdpSocket::outstanding_tx`) must have bounded reuse.
    pub fn next_tx_frame(&self) -> u32 {
        let prev = self.tx_cursor.fetch_add(1, Ordering::Relaxed);
        prev % self.config.tx_frames
    }

    /// Byte offset of RX frame `i` (`i` in `[0, rx_frames)`).
    pub fn rx_frame_addr(&self, i: u32) -> u64 {
        rx_frame_addr_of(self.config.tx_frames, self.config.frame_size, i)
    }

    pub fn frame_size(&self) -> u32 {
        self.config.frame_size
    }

    pub fn tx_frames(&self) -> u32 {
        self.config.tx_frames
    }

    pub fn rx_frames(&self) -> u32 {
        self.config.rx_frames
    }

    /// Raw pointer to the start of the Umem area, for writing frame contents.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.umem_area.as_ptr() as *mut u8
    }

    /// Wire the fill and completion rings of this Umem to `interface`'s device queue.
    pub fn fq_cq(&self, interface: &Socket) -> Result<DeviceQueue, Errno> {
        if !self.devices.insert(interface.info.ctx) {
            return Err(Errno(libc::EINVAL));
        }

        struct DropGuard<'a>(&'a IfCtx, &'a DeviceControl);
        impl Drop for DropGuard<'_> {
            fn drop(&mut self) {
                self.1.remove(self.0);
            }
        }
        let guard = DropGuard(&interface.info.ctx, &self.devices);

        let sock = &*interface.fd;
        Self::configure_cq(sock, &self.config)?;
        let map = SocketMmapOffsets::new(sock)?;

        let prod = unsafe { RingProd::fill(sock, &map, self.config.fill_size) }.map_err(Errno)?;
        let cons = unsafe { RingCons::comp(sock, &map, self.config.complete_size) }.map_err(Errno)?;

        let device = DeviceQueue {
            fcq: DeviceRings { map, cons, prod },
            socket: Socket {
                info: interface.info.clone(),
                fd: interface.fd.clone(),
            },
            devices: self.devices.clone(),
        };

        core::mem::forget(guard);
        Ok(device)
    }

    /// Configure the rx/tx ring sizes for `interface`, ready for `bind`.
    pub fn rx_tx(&self, interface: &Socket, config: &SocketConfig) -> Result<RxTx, Errno> {
        let sock = &*interface.fd;
        Self::configure_rt(sock, config)?;
        let map = SocketMmapOffsets::new(sock)?;

        Ok(RxTx {
            socket: Socket {
                info: interface.info.clone(),
                fd: interface.fd.clone(),
            },
            config: Arc::new(config.clone()),
            map,
        })
    }

    /// Bind the socket behind `rxtx` to its configured interface and queue.
    pub fn bind(&self, rxtx: &RxTx) -> Result<(), Errno> {
        let sxdp = SockAddrXdp {
            ifindex: rxtx.socket.info.ctx.ifindex,
            queue_id: rxtx.socket.info.ctx.queue_id,
            flags: rxtx.config.bind_flags,
            ..SockAddrXdp::default()
        };

        let ret = unsafe {
            libc::bind(
                rxtx.socket.fd.0,
                (&sxdp) as *const _ as *const libc::sockaddr,
                core::mem::size_of_val(&sxdp) as libc::socklen_t,
            )
        };

        if ret != 0 {
            return Err(Errno::new());
        }
        Ok(())
    }

    pub(crate) fn configure_cq(fd: &SocketFd, config: &UmemConfig) -> Result<(), Errno> {
        let set = |opt, val: &u32| unsafe {
            libc::setsockopt(
                fd.0,
                super::SOL_XDP,
                opt,
                val as *const _ as *const libc::c_void,
                core::mem::size_of_val(val) as libc::socklen_t,
            )
        };

        if set(Self::XDP_UMEM_COMPLETION_RING, &config.complete_size) != 0 {
            return Err(Errno::new());
        }
        if set(Self::XDP_UMEM_FILL_RING, &config.fill_size) != 0 {
            return Err(Errno::new());
        }
        Ok(())
    }

    pub(crate) fn configure_rt(fd: &SocketFd, config: &SocketConfig) -> Result<(), Errno> {
        if let Some(num) = config.rx_size {
            let num = num.get();
            if unsafe {
                libc::setsockopt(
                    fd.0,
                    super::SOL_XDP,
                    Self::XDP_RX_RING,
                    (&num) as *const _ as *const libc::c_void,
                    core::mem::size_of_val(&num) as libc::socklen_t,
                )
            } != 0
            {
                return Err(Errno::new());
            }
        }

        if let Some(num) = config.tx_size {
            let num = num.get();
            if unsafe {
                libc::setsockopt(
                    fd.0,
                    super::SOL_XDP,
                    Self::XDP_TX_RING,
                    (&num) as *const _ as *const libc::c_void,
                    core::mem::size_of_val(&num) as libc::socklen_t,
                )
            } != 0
            {
                return Err(Errno::new());
            }
        }

        Ok(())
    }
}

/// Byte offset of RX frame `i`, given the TX/RX partition of the frame range. Factored out of
/// [`Umem::rx_frame_addr`] as a pure function so the RX-range containment invariant can be
/// property-tested without allocating a real Umem.
fn rx_frame_addr_of(tx_frames: u32, frame_size: u32, i: u32) -> u64 {
    u64::from(tx_frames + i) * u64::from(frame_size)
}

#[cfg(test)]
mod frame_range_tests {
    use super::rx_frame_addr_of;

    #[test]
    fn rx_frame_zero_starts_right_after_tx_range() {
        assert_eq!(rx_frame_addr_of(2048, 4096, 0), 2048 * 4096);
    }

    proptest::proptest! {
        /// Property 1 (partitioning half): every RX frame address falls at or beyond the end of
        /// the TX range, and is frame-size aligned, for any TX/RX split and frame size.
        #[test]
        fn rx_addr_is_within_rx_range(
            tx_frames in 1u32..4096,
            rx_frames in 1u32..4096,
            frame_size in 1u32..=4096u32,
            i in 0u32..4096,
        ) {
            let i = i % rx_frames;
            let addr = rx_frame_addr_of(tx_frames, frame_size, i);
            let tx_range_end = u64::from(tx_frames) * u64::from(frame_size);
            proptest::prop_assert!(addr >= tx_range_end);
            proptest::prop_assert_eq!(addr % u64::from(frame_size), 0);
        }
    }
}
