//! Kernel-bypass UDP packet replicator.
//!
//! The [`xsk`] module wraps the raw AF_XDP socket/ring kernel interface; [`net`] builds and
//! checksums the Ethernet/IPv4/UDP frames that travel through it; [`destination`], [`worker`] and
//! [`control`] implement the replication data plane and its control channel; [`arp`], [`config`],
//! [`error`] and [`stats`] are the surrounding plumbing a running service needs.

pub mod arp;
pub mod config;
pub mod control;
pub mod destination;
pub mod error;
pub mod net;
pub mod stats;
pub mod worker;
/// Bindings for XDP (kernel-interface).
pub mod xdp;
pub mod xdp_socket;
pub mod xsk;

pub(crate) struct LastErrno;
pub struct Errno(pub libc::c_int);

impl From<LastErrno> for Errno {
    fn from(LastErrno: LastErrno) -> Self {
        Errno::new()
    }
}

impl Errno {
    pub(crate) fn new() -> Self {
        Errno(unsafe { *libc::__errno_location() })
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = unsafe { libc::strerror(self.0) };
        let cstr = unsafe { std::ffi::CStr::from_ptr(st) };
        write!(f, "{}", cstr.to_string_lossy())
    }
}

impl std::fmt::Debug for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Errno({}: {})", self.0, self)
    }
}

impl std::error::Error for Errno {}
