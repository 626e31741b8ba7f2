use crate::xdp::XdpDesc;
use crate::xsk::{BufIdx, DeviceQueue, RingCons, RingProd, RingRx, RingTx, RxTx};

impl DeviceQueue {
    /// Add some buffers to the fill ring.
    pub fn fill(&mut self, n: u32) -> WriteFill<'_> {
        WriteFill {
            idx: BufIdxIter::reserve(&mut self.fcq.prod, n),
            queue: &mut self.fcq.prod,
        }
    }

    /// Reap some buffers from the completion ring.
    pub fn complete(&mut self, n: u32) -> ReadComplete<'_> {
        ReadComplete {
            idx: BufIdxIter::peek(&mut self.fcq.cons, n),
            queue: &mut self.fcq.cons,
        }
    }

    pub fn available(&self) -> u32 {
        self.fcq.cons.count_available(u32::MAX)
    }

    pub fn as_raw_fd(&self) -> libc::c_int {
        self.socket.fd.0
    }

    pub fn needs_wakeup(&self) -> bool {
        self.fcq.prod.check_flags() & XDP_RING_NEED_WAKEUP != 0
    }

    /// Poll the fill queue's descriptor to nudge a stalled driver.
    pub fn wake(&mut self) {
        let mut poll = libc::pollfd {
            fd: self.socket.fd.0,
            events: 0,
            revents: 0,
        };
        let _ = unsafe { libc::poll(&mut poll as *mut _, 1, 0) };
    }
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        self.devices.remove(&self.socket.info.ctx);
    }
}

const XDP_RING_NEED_WAKEUP: u32 = 1 << 0;

impl RxTx {
    /// Map the receive ring after binding. Returns an error if no `rx_size` was configured.
    pub fn map_rx(&self) -> Result<RingRx, crate::Errno> {
        if self.config.rx_size.is_none() {
            return Err(crate::Errno(libc::EINVAL));
        }
        let ring = unsafe { RingCons::rx(&self.socket.fd, &self.map, self.config.rx_size.unwrap().get()) }
            .map_err(crate::Errno)?;
        Ok(RingRx {
            fd: self.socket.fd.clone(),
            ring,
        })
    }

    /// Map the transmit ring after binding. Returns an error if no `tx_size` was configured.
    pub fn map_tx(&self) -> Result<RingTx, crate::Errno> {
        if self.config.tx_size.is_none() {
            return Err(crate::Errno(libc::EINVAL));
        }
        let ring = unsafe { RingProd::tx(&self.socket.fd, &self.map, self.config.tx_size.unwrap().get()) }
            .map_err(crate::Errno)?;
        Ok(RingTx {
            fd: self.socket.fd.clone(),
            ring,
        })
    }

    pub fn as_raw_fd(&self) -> libc::c_int {
        self.socket.fd.0
    }
}

impl RingRx {
    /// Receive some buffers. Returns an iterator-like reader over the descriptors.
    pub fn receive(&mut self, n: u32) -> ReadRx<'_> {
        ReadRx {
            idx: BufIdxIter::peek(&mut self.ring, n),
            queue: &mut self.ring,
        }
    }

    pub fn available(&self) -> u32 {
        self.ring.count_available(u32::MAX)
    }

    pub fn as_raw_fd(&self) -> libc::c_int {
        self.fd.0
    }
}

impl RingTx {
    /// Reserve buffers for transmission; returns a proxy to fill descriptors and commit.
    pub fn transmit(&mut self, n: u32) -> WriteTx<'_> {
        WriteTx {
            idx: BufIdxIter::reserve(&mut self.ring, n),
            queue: &mut self.ring,
        }
    }

    pub fn pending(&self) -> u32 {
        self.ring.count_free(0)
    }

    pub fn needs_wakeup(&self) -> bool {
        self.ring.check_flags() & XDP_RING_NEED_WAKEUP != 0
    }

    /// Send a zero-length datagram with `MSG_DONTWAIT` to wake up the transmit queue.
    pub fn wake(&self) {
        let _ = unsafe {
            libc::sendto(
                self.fd.0,
                core::ptr::null_mut(),
                0,
                libc::MSG_DONTWAIT,
                core::ptr::null_mut(),
                0,
            )
        };
    }

    pub fn as_raw_fd(&self) -> libc::c_int {
        self.fd.0
    }
}

struct BufIdxIter {
    base: BufIdx,
    buffers: u32,
    remain: u32,
}

/// A writer to a fill queue. See [`DeviceQueue::fill`].
pub struct WriteFill<'queue> {
    idx: BufIdxIter,
    queue: &'queue mut RingProd,
}

/// A reader from a completion queue. See [`DeviceQueue::complete`].
pub struct ReadComplete<'queue> {
    idx: BufIdxIter,
    queue: &'queue mut RingCons,
}

/// A writer to a transmit queue. See [`RingTx::transmit`].
pub struct WriteTx<'queue> {
    idx: BufIdxIter,
    queue: &'queue mut RingProd,
}

/// A reader from a receive queue. See [`RingRx::receive`].
pub struct ReadRx<'queue> {
    idx: BufIdxIter,
    queue: &'queue mut RingCons,
}

impl Iterator for BufIdxIter {
    type Item = BufIdx;
    fn next(&mut self) -> Option<BufIdx> {
        let next = self.remain.checked_sub(1)?;
        self.remain = next;
        let ret = self.base;
        self.base.0 = self.base.0.wrapping_add(1);
        Some(ret)
    }
}

impl BufIdxIter {
    fn peek(queue: &mut RingCons, n: u32) -> Self {
        let mut this = BufIdxIter {
            buffers: 0,
            remain: 0,
            base: BufIdx(0),
        };
        this.buffers = queue.peek(n, &mut this.base);
        this.remain = this.buffers;
        this
    }

    fn reserve(queue: &mut RingProd, n: u32) -> Self {
        let mut this = BufIdxIter {
            buffers: 0,
            remain: 0,
            base: BufIdx(0),
        };
        this.buffers = queue.reserve(n, &mut this.base);
        this.remain = this.buffers;
        this
    }

    fn commit_prod(&mut self, queue: &mut RingProd) {
        if self.buffers > 0 {
            let count = self.buffers - self.remain;
            queue.submit(count);
            self.buffers -= count;
            self.base.0 += count;
        }
    }

    fn release_cons(&mut self, queue: &mut RingCons) {
        if self.buffers > 0 {
            let count = self.buffers - self.remain;
            queue.release(count);
            self.buffers -= count;
            self.base.0 += count;
        }
    }
}

impl WriteFill<'_> {
    pub fn capacity(&self) -> u32 {
        self.idx.buffers
    }

    pub fn insert_once(&mut self, addr: u64) -> u32 {
        self.insert(core::iter::once(addr))
    }

    pub fn insert(&mut self, it: impl Iterator<Item = u64>) -> u32 {
        let mut n = 0;
        for (item, bufidx) in it.zip(self.idx.by_ref()) {
            n += 1;
            unsafe { *self.queue.fill_addr(bufidx).as_ptr() = item };
        }
        n
    }

    pub fn commit(&mut self) {
        self.idx.commit_prod(self.queue)
    }
}

impl Drop for WriteFill<'_> {
    fn drop(&mut self) {
        if self.idx.buffers != 0 {
            self.queue.cancel(self.idx.buffers)
        }
    }
}

impl ReadComplete<'_> {
    pub fn capacity(&self) -> u32 {
        self.idx.buffers
    }

    pub fn read(&mut self) -> Option<u64> {
        let bufidx = self.idx.next()?;
        Some(unsafe { *self.queue.comp_addr(bufidx).as_ptr() })
    }

    pub fn release(&mut self) {
        self.idx.release_cons(self.queue)
    }
}

impl Drop for ReadComplete<'_> {
    fn drop(&mut self) {
        if self.idx.buffers != 0 {
            self.queue.cancel(self.idx.buffers)
        }
    }
}

impl WriteTx<'_> {
    pub fn capacity(&self) -> u32 {
        self.idx.buffers
    }

    pub fn insert_once(&mut self, desc: XdpDesc) -> u32 {
        self.insert(core::iter::once(desc))
    }

    pub fn insert(&mut self, it: impl Iterator<Item = XdpDesc>) -> u32 {
        let mut n = 0;
        for (item, bufidx) in it.zip(self.idx.by_ref()) {
            n += 1;
            unsafe { *self.queue.tx_desc(bufidx).as_ptr() = item };
        }
        n
    }

    pub fn commit(&mut self) {
        self.idx.commit_prod(self.queue);
    }
}

impl Drop for WriteTx<'_> {
    fn drop(&mut self) {
        if self.idx.buffers != 0 {
            self.queue.cancel(self.idx.buffers)
        }
    }
}

impl ReadRx<'_> {
    pub fn capacity(&self) -> u32 {
        self.idx.buffers
    }

    pub fn read(&mut self) -> Option<XdpDesc> {
        let bufidx = self.idx.next()?;
        Some(unsafe { *self.queue.rx_desc(bufidx).as_ptr() })
    }

    pub fn release(&mut self) {
        self.idx.release_cons(self.queue)
    }
}

impl Drop for ReadRx<'_> {
    fn drop(&mut self) {
        if self.idx.buffers != 0 {
            self.queue.cancel(self.idx.buffers)
        }
    }
}
