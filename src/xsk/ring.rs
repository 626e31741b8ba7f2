use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::xdp::{XdpDesc, XdpRingOffsets};
use crate::xsk::{ptr_len, BufIdx, SocketFd, SocketMmapOffsets};

/// Shared layout of a single producer/consumer ring, as mmap'd from the kernel.
#[derive(Debug)]
pub struct Ring {
    /// Our own view of the producer head, may lag the mmap'd value.
    cached_producer: u32,
    /// Our own view of the consumer head, may lag the mmap'd value.
    cached_consumer: u32,
    mask: u32,
    size: u32,
    producer: &'static AtomicU32,
    consumer: &'static AtomicU32,
    ring: NonNull<core::ffi::c_void>,
    flags: NonNull<u32>,
}

/// A producer ring: user space owns the write head, the kernel the read tail.
#[derive(Debug)]
pub struct RingProd {
    inner: Ring,
    mmap_addr: NonNull<[u8]>,
}

/// A consumer ring: the kernel owns the write head, user space the read tail.
#[derive(Debug)]
pub struct RingCons {
    inner: Ring,
    mmap_addr: NonNull<[u8]>,
}

// Safety: these types are only ever handed to the one thread owning the enclosing socket; the
// pointed-to memory is kernel-shared but access patterns obey the producer/consumer contract.
unsafe impl Send for RingProd {}
unsafe impl Send for RingCons {}

impl Ring {
    const XDP_PGOFF_RX_RING: libc::off_t = 0;
    const XDP_PGOFF_TX_RING: libc::off_t = 0x8000_0000;
    const XDP_UMEM_PGOFF_FILL_RING: libc::off_t = 0x1_0000_0000;
    const XDP_UMEM_PGOFF_COMPLETION_RING: libc::off_t = 0x1_8000_0000;

    /// # Safety
    ///
    /// The caller must ensure `tx_map` outlives the constructed ring and that the offsets were
    /// returned by the kernel for this very mapping.
    unsafe fn new(tx_map: NonNull<u8>, off: &XdpRingOffsets, count: u32) -> Self {
        debug_assert!(count.is_power_of_two());
        let base: *mut u8 = tx_map.as_ptr();
        let trust_offset = |off: u64| NonNull::new_unchecked(base.offset(off as isize));

        let producer = trust_offset(off.producer).cast().as_ref();
        let consumer = trust_offset(off.consumer).cast().as_ref();
        let ring = trust_offset(off.desc).cast();
        let flags = trust_offset(off.flags).cast();

        Ring {
            mask: count - 1,
            size: count,
            producer,
            consumer,
            ring,
            flags,
            cached_producer: producer.load(Ordering::Relaxed),
            cached_consumer: consumer.load(Ordering::Relaxed),
        }
    }

    unsafe fn map(
        fd: &SocketFd,
        off: &XdpRingOffsets,
        count: u32,
        entry_size: u64,
        mmap_offset: libc::off_t,
    ) -> Result<(Self, NonNull<[u8]>), libc::c_int> {
        let len = (off.desc + u64::from(count) * entry_size) as usize;

        let mmap = libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd.0,
            mmap_offset,
        );

        if mmap == libc::MAP_FAILED {
            return Err(*libc::__errno_location());
        }

        let mmap_addr = core::ptr::slice_from_raw_parts_mut(mmap as *mut u8, len);
        let mmap_addr = NonNull::new_unchecked(mmap_addr);

        Ok((Ring::new(mmap_addr.cast(), off, count), mmap_addr))
    }

    fn check_flags(&self) -> u32 {
        unsafe { self.flags.as_ref() }.load(Ordering::Relaxed)
    }
}

impl RingProd {
    pub(crate) unsafe fn fill(
        fd: &SocketFd,
        off: &SocketMmapOffsets,
        count: u32,
    ) -> Result<Self, libc::c_int> {
        let (inner, mmap_addr) = Ring::map(
            fd,
            &off.inner.fr,
            count,
            core::mem::size_of::<u64>() as u64,
            Ring::XDP_UMEM_PGOFF_FILL_RING,
        )?;
        Ok(RingProd { inner, mmap_addr })
    }

    pub(crate) unsafe fn tx(
        fd: &SocketFd,
        off: &SocketMmapOffsets,
        count: u32,
    ) -> Result<Self, libc::c_int> {
        let (inner, mmap_addr) = Ring::map(
            fd,
            &off.inner.tx,
            count,
            core::mem::size_of::<XdpDesc>() as u64,
            Ring::XDP_PGOFF_TX_RING,
        )?;
        Ok(RingProd { inner, mmap_addr })
    }

    pub(crate) unsafe fn fill_addr(&self, idx: BufIdx) -> NonNull<u64> {
        let offset = (idx.0 & self.inner.mask) as isize;
        NonNull::new_unchecked(self.inner.ring.cast::<u64>().as_ptr().offset(offset))
    }

    pub(crate) unsafe fn tx_desc(&self, idx: BufIdx) -> NonNull<XdpDesc> {
        let offset = (idx.0 & self.inner.mask) as isize;
        NonNull::new_unchecked(self.inner.ring.cast::<XdpDesc>().as_ptr().offset(offset))
    }

    /// Number of free entries, at least `nb` if available, refreshing the cached consumer head
    /// only when the cheap local estimate says there isn't enough room.
    pub fn count_free(&mut self, nb: u32) -> u32 {
        let free_entries = self.inner.cached_consumer.wrapping_sub(self.inner.cached_producer);
        if free_entries >= nb {
            return free_entries;
        }

        self.inner.cached_consumer = self.inner.consumer.load(Ordering::Acquire);
        self.inner.cached_consumer += self.inner.size;
        self.inner.cached_consumer - self.inner.cached_producer
    }

    /// Reserve up to `nb` slots for writing, without yet exposing them to the kernel.
    pub fn reserve(&mut self, nb: u32, idx: &mut BufIdx) -> u32 {
        if self.count_free(nb) < nb {
            return 0;
        }
        *idx = BufIdx(self.inner.cached_producer);
        self.inner.cached_producer += nb;
        nb
    }

    /// Roll back a previous `reserve` (or a partial commit of one).
    pub fn cancel(&mut self, nb: u32) {
        self.inner.cached_producer = self.inner.cached_producer.wrapping_sub(nb);
    }

    /// Publish `nb` previously reserved entries to the kernel.
    pub fn submit(&mut self, nb: u32) {
        let cur = self.inner.producer.load(Ordering::Relaxed);
        self.inner.producer.store(cur.wrapping_add(nb), Ordering::Release);
    }

    pub(crate) fn check_flags(&self) -> u32 {
        self.inner.check_flags()
    }
}

impl RingCons {
    pub(crate) unsafe fn comp(
        fd: &SocketFd,
        off: &SocketMmapOffsets,
        count: u32,
    ) -> Result<Self, libc::c_int> {
        let (inner, mmap_addr) = Ring::map(
            fd,
            &off.inner.cr,
            count,
            core::mem::size_of::<u64>() as u64,
            Ring::XDP_UMEM_PGOFF_COMPLETION_RING,
        )?;
        Ok(RingCons { inner, mmap_addr })
    }

    pub(crate) unsafe fn rx(
        fd: &SocketFd,
        off: &SocketMmapOffsets,
        count: u32,
    ) -> Result<Self, libc::c_int> {
        let (inner, mmap_addr) = Ring::map(
            fd,
            &off.inner.rx,
            count,
            core::mem::size_of::<XdpDesc>() as u64,
            Ring::XDP_PGOFF_RX_RING,
        )?;
        Ok(RingCons { inner, mmap_addr })
    }

    pub(crate) unsafe fn comp_addr(&self, idx: BufIdx) -> NonNull<u64> {
        let offset = (idx.0 & self.inner.mask) as isize;
        NonNull::new_unchecked(self.inner.ring.cast::<u64>().as_ptr().offset(offset))
    }

    pub(crate) unsafe fn rx_desc(&self, idx: BufIdx) -> NonNull<XdpDesc> {
        let offset = (idx.0 & self.inner.mask) as isize;
        NonNull::new_unchecked(self.inner.ring.cast::<XdpDesc>().as_ptr().offset(offset))
    }

    pub fn count_available(&mut self, nb: u32) -> u32 {
        let mut available = self.inner.cached_producer.wrapping_sub(self.inner.cached_consumer);
        if available == 0 {
            self.inner.cached_producer = self.inner.producer.load(Ordering::Acquire);
            available = self.inner.cached_producer.wrapping_sub(self.inner.cached_consumer);
        }
        available.min(nb)
    }

    pub fn peek(&mut self, nb: u32, idx: &mut BufIdx) -> u32 {
        let count = self.count_available(nb);
        if count == 0 {
            return 0;
        }
        *idx = BufIdx(self.inner.cached_consumer);
        self.inner.cached_consumer += count;
        count
    }

    pub fn cancel(&mut self, nb: u32) {
        self.inner.cached_consumer = self.inner.cached_consumer.wrapping_sub(nb);
    }

    pub fn release(&mut self, nb: u32) {
        let cur = self.inner.consumer.load(Ordering::Relaxed);
        self.inner.consumer.store(cur.wrapping_add(nb), Ordering::Release);
    }

    pub(crate) fn check_flags(&self) -> u32 {
        self.inner.check_flags()
    }
}

impl Drop for RingProd {
    fn drop(&mut self) {
        let len = ptr_len(self.mmap_addr.as_ptr());
        unsafe { libc::munmap(self.mmap_addr.as_ptr() as *mut _, len) };
    }
}

impl Drop for RingCons {
    fn drop(&mut self) {
        let len = ptr_len(self.mmap_addr.as_ptr());
        unsafe { libc::munmap(self.mmap_addr.as_ptr() as *mut _, len) };
    }
}
