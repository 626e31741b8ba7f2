//! The per-queue [`XdpSocket`]: one kernel-bypass socket bound to one NIC queue, coupling a
//! [`Umem`] and its rings together behind the operations a worker needs (receive, recycle,
//! reserve/submit TX, reclaim completions), per the staged construction and batching rules of
//! the packet replicator's data plane.

use std::num::NonZeroU32;
use std::path::Path;

use log::{debug, warn};

use crate::xdp::XdpDesc;
use crate::xsk::{
    DeviceQueue, FilterMap, IfInfo, RingRx, RingTx, RxTx, Socket, SocketConfig, Umem, UmemConfig,
};
use crate::Errno;

/// Default number of completions batched before a `poll_tx_completions` call actually releases
/// them back to the ring. Releasing on every single send collapses throughput on tested NIC
/// drivers. Overridable per socket via [`XdpSocketConfig::tx_batch`].
pub const DEFAULT_TX_BATCH: u32 = 64;

/// Retries (with a short sleep between each) `XdpSocket::drop` gives outstanding TX completions
/// to land before giving up and closing anyway.
const CLOSE_DRAIN_RETRIES: u32 = 10;
const CLOSE_DRAIN_SLEEP: std::time::Duration = std::time::Duration::from_millis(1);

/// How an `XdpSocket` exchanges frames with the NIC driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    SkbCopy,
    DriverCopy,
    Hw,
    ZeroCopy,
}

impl Mode {
    fn bind_flags(self) -> u16 {
        // Mirrors the kernel uapi `XDP_{COPY,ZEROCOPY}` bind flags; `SkbCopy`/`Hw` pass no
        // explicit mode flag and let the driver pick its default path.
        const XDP_COPY: u16 = 1 << 1;
        const XDP_ZEROCOPY: u16 = 1 << 2;
        const XDP_USE_NEED_WAKEUP: u16 = 1 << 3;

        let mode_bit = match self {
            Mode::SkbCopy | Mode::Hw => 0,
            Mode::DriverCopy => XDP_COPY,
            Mode::ZeroCopy => XDP_ZEROCOPY,
        };
        mode_bit | XDP_USE_NEED_WAKEUP
    }
}

/// Construction parameters for one [`XdpSocket`], mapping directly onto SPEC_FULL.md §4.2/4.3.
pub struct XdpSocketConfig {
    pub frame_size: u32,
    pub tx_frames: u32,
    pub rx_frames: u32,
    pub headroom: u32,
    pub rx_ring_size: u32,
    pub tx_ring_size: u32,
    pub fill_ring_size: u32,
    pub completion_ring_size: u32,
    pub mode: Mode,
    pub tx_batch: u32,
}

/// A kernel-bypass socket bound to one NIC queue, with its own private `Umem`.
pub struct XdpSocket {
    queue_id: u32,
    umem: Umem,
    device: DeviceQueue,
    rx: RingRx,
    tx: RingTx,
    pending_recycle: Vec<u64>,
    cached_completions: u32,
    outstanding_tx: u32,
    tx_batch: u32,
    filter_map: Option<FilterMap>,
}

impl XdpSocket {
    /// Stage 1-5 of construction: open the socket, register the Umem, wire fill/completion and
    /// rx/tx rings, bind, and perform the initial fill-ring population. `filter_map_path`, if
    /// given, is where the in-kernel packet filter's `xsks_map` is pinned (bpffs); when absent,
    /// `register_filter_slot` is skipped and a warning is logged, since the filter will then never
    /// redirect traffic to this socket.
    pub fn new(
        mut interface: IfInfo,
        queue_id: u32,
        config: XdpSocketConfig,
        filter_map_path: Option<&Path>,
    ) -> Result<Self, Errno> {
        interface.set_queue(queue_id);

        let socket = Socket::new(&interface)?;

        let umem_config = UmemConfig {
            fill_size: config.fill_ring_size,
            complete_size: config.completion_ring_size,
            frame_size: config.frame_size,
            headroom: config.headroom,
            flags: 0,
            tx_frames: config.tx_frames,
            rx_frames: config.rx_frames,
        };
        let umem = Umem::alloc(umem_config)?;

        let device = umem.fq_cq(&socket)?;

        let socket_config = SocketConfig {
            rx_size: NonZeroU32::new(config.rx_ring_size),
            tx_size: NonZeroU32::new(config.tx_ring_size),
            bind_flags: config.mode.bind_flags(),
        };
        let rxtx: RxTx = umem.rx_tx(&socket, &socket_config)?;
        umem.bind(&rxtx)?;

        let rx = rxtx.map_rx()?;
        let tx = rxtx.map_tx()?;

        let filter_map = match filter_map_path {
            Some(path) => match FilterMap::open(path) {
                Ok(map) => {
                    map.update(queue_id, device.as_raw_fd())?;
                    Some(map)
                }
                Err(err) => {
                    warn!("could not open filter map at {}: {err}", path.display());
                    None
                }
            },
            None => {
                warn!("no filter map configured; the in-kernel filter will not redirect to this socket");
                None
            }
        };

        let tx_batch = if config.tx_batch == 0 {
            DEFAULT_TX_BATCH
        } else {
            config.tx_batch
        };

        let mut this = XdpSocket {
            queue_id,
            umem,
            device,
            rx,
            tx,
            pending_recycle: Vec::with_capacity(config.rx_ring_size as usize),
            cached_completions: 0,
            outstanding_tx: 0,
            tx_batch,
            filter_map,
        };

        this.initial_fill();
        Ok(this)
    }

    fn initial_fill(&mut self) {
        let rx_frames = self.umem.rx_frames();
        let mut writer = self.device.fill(rx_frames);
        let umem = &self.umem;
        writer.insert((0..rx_frames).map(|i| umem.rx_frame_addr(i)));
        writer.commit();
    }

    pub fn queue_id(&self) -> u32 {
        self.queue_id
    }

    pub fn umem(&self) -> &Umem {
        &self.umem
    }

    /// Raw pointer to frame `addr`'s first byte, for building or reading packet contents.
    ///
    /// # Safety
    /// `addr` must be a frame offset previously handed out by this socket's `Umem` (TX) or
    /// received from `receive` (RX), and the caller must not alias the frame with concurrent
    /// kernel access (i.e. it must not currently be posted to the fill/tx ring).
    pub unsafe fn frame_mut(&self, addr: u64, len: usize) -> &mut [u8] {
        let ptr = self.umem.as_mut_ptr().add(addr as usize);
        core::slice::from_raw_parts_mut(ptr, len)
    }

    /// Receive up to `out.len()` descriptors as `(addr, len)` pairs. Every returned address is
    /// queued for re-posting to the fill ring on the next `recycle_frames` call.
    pub fn receive(&mut self, out: &mut [(u64, u32)]) -> usize {
        let mut reader = self.rx.receive(out.len() as u32);
        let mut n = 0;
        while let Some(desc) = reader.read() {
            out[n] = (desc.addr, desc.len);
            self.pending_recycle.push(desc.addr);
            n += 1;
        }
        reader.release();

        if n == 0 && self.device.needs_wakeup() {
            self.device.wake();
        }
        n
    }

    /// Re-post every address collected by `receive` since the last call back to the fill ring.
    pub fn recycle_frames(&mut self) {
        if self.pending_recycle.is_empty() {
            return;
        }

        let mut writer = self.device.fill(self.pending_recycle.len() as u32);
        let taken = writer.insert(self.pending_recycle.iter().copied());
        writer.commit();
        self.pending_recycle.drain(..taken as usize);
    }

    /// Enqueue one frame of `len` bytes at UMEM offset `addr` for transmission. Returns `false`
    /// under back-pressure (outstanding TX too close to `tx_frames`, or the ring itself is full),
    /// in which case the caller should count a dropped/back-pressure event and move on.
    pub fn send_one(&mut self, addr: u64, len: u32) -> bool {
        if !budget::admits(self.outstanding_tx, self.umem.tx_frames(), self.tx_batch) {
            self.request_driver_poll();
            return false;
        }

        let mut writer = self.tx.transmit(1);
        let desc = XdpDesc {
            addr,
            len,
            options: 0,
        };
        let sent = writer.insert_once(desc);
        writer.commit();

        if sent == 1 {
            self.outstanding_tx += 1;
            self.request_driver_poll();
            true
        } else {
            self.request_driver_poll();
            false
        }
    }

    /// Reclaim completed TX frames in batches of `tx_batch`; smaller dribbles are cheap to miss
    /// a cycle, since the next call picks them back up.
    pub fn poll_tx_completions(&mut self) {
        let mut reader = self.device.complete(u32::MAX);
        let mut reaped = 0;
        while reader.read().is_some() {
            reaped += 1;
        }
        reader.release();

        self.cached_completions += reaped;
        let (outstanding, cached) =
            budget::reclaim(self.outstanding_tx, self.cached_completions, self.tx_batch);
        self.outstanding_tx = outstanding;
        self.cached_completions = cached;
    }

    /// Issue a non-blocking wakeup syscall if the TX ring's `NEED_WAKEUP` flag is set.
    pub fn request_driver_poll(&mut self) {
        if self.tx.needs_wakeup() {
            self.tx.wake();
        }
    }

    pub fn outstanding_tx(&self) -> u32 {
        self.outstanding_tx
    }

    pub fn tx_batch(&self) -> u32 {
        self.tx_batch
    }
}

/// Pure TX back-pressure accounting, factored out of [`XdpSocket`] so the
/// `outstanding_tx <= tx_frames` invariant can be property-tested without a live ring.
mod budget {
    /// Whether one more in-flight frame is admissible given `tx_frames` total TX-range capacity
    /// and a `tx_batch`-sized safety margin held back for the next reclaim.
    pub fn admits(outstanding: u32, tx_frames: u32, tx_batch: u32) -> bool {
        outstanding <= tx_frames.saturating_sub(tx_batch)
    }

    /// Apply a batch of `cached_completions` reclaimed frames to `outstanding`, only once the
    /// batch reaches `tx_batch`. Returns the new `(outstanding, cached_completions)` pair.
    pub fn reclaim(outstanding: u32, cached_completions: u32, tx_batch: u32) -> (u32, u32) {
        if cached_completions >= tx_batch {
            (outstanding.saturating_sub(cached_completions), 0)
        } else {
            (outstanding, cached_completions)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn admits_up_to_margin() {
            assert!(admits(1984, 2048, 64));
            assert!(!admits(1985, 2048, 64));
        }

        #[test]
        fn reclaim_applies_only_at_batch_size() {
            assert_eq!(reclaim(100, 10, 64), (100, 10));
            assert_eq!(reclaim(100, 64, 64), (36, 0));
            assert_eq!(reclaim(50, 64, 64), (0, 0));
        }

        /// S6: with tx_frames=2048 and tx_batch=64, sends are refused once 2048 - 64 = 1984
        /// frames are outstanding, and resume being admitted once completions are reclaimed.
        #[test]
        fn s6_back_pressure_then_recovery() {
            let tx_frames = 2048;
            let tx_batch = 64;
            let mut outstanding = 0u32;
            let mut refused = 0u32;

            for _ in 0..2048 {
                if admits(outstanding, tx_frames, tx_batch) {
                    outstanding += 1;
                } else {
                    refused += 1;
                }
            }
            assert_eq!(outstanding, 1984);
            assert_eq!(refused, 2048 - 1984);

            // Further sends are refused outright.
            assert!(!admits(outstanding, tx_frames, tx_batch));

            // Completions land; once a full batch reclaims, sends are admitted again.
            let (new_outstanding, new_cached) = reclaim(outstanding, tx_batch, tx_batch);
            outstanding = new_outstanding;
            let _ = new_cached;
            assert!(admits(outstanding, tx_frames, tx_batch));
        }

        #[derive(Debug, Clone, Copy)]
        enum Event {
            Send,
            Complete,
        }

        fn event_strategy() -> impl proptest::strategy::Strategy<Value = Event> {
            use proptest::prelude::*;
            prop_oneof![Just(Event::Send), Just(Event::Complete)]
        }

        proptest::proptest! {
            /// Property 2: for any sequence of sends and completions, outstanding_tx never
            /// exceeds tx_frames.
            #[test]
            fn outstanding_never_exceeds_tx_frames(
                events in proptest::collection::vec(event_strategy(), 0..500),
                tx_frames in 1u32..4096,
                tx_batch in 1u32..256,
            ) {
                let mut outstanding = 0u32;
                let mut cached = 0u32;
                for event in events {
                    match event {
                        Event::Send => {
                            if admits(outstanding, tx_frames, tx_batch) {
                                outstanding += 1;
                            }
                        }
                        Event::Complete => {
                            cached += 1;
                            let (new_outstanding, new_cached) = reclaim(outstanding, cached, tx_batch);
                            outstanding = new_outstanding;
                            cached = new_cached;
                        }
                    }
                    proptest::prop_assert!(outstanding <= tx_frames);
                }
            }
        }
    }
}

impl Drop for XdpSocket {
    fn drop(&mut self) {
        for _ in 0..CLOSE_DRAIN_RETRIES {
            self.poll_tx_completions();
            if self.outstanding_tx == 0 {
                break;
            }
            std::thread::sleep(CLOSE_DRAIN_SLEEP);
        }

        if let Some(map) = &self.filter_map {
            map.remove_fd(self.device.as_raw_fd());
        }

        debug!(
            "closing xdp socket on queue {} with {} frames still outstanding",
            self.queue_id, self.outstanding_tx
        );
    }
}
