//! Setup-time error taxonomy. Hot-path code never returns these; it records a metric instead.

use thiserror::Error;

use crate::Errno;

#[derive(Debug, Error)]
pub enum ReplicatorError {
    #[error("unknown network interface {iface:?}: {source}")]
    UnknownInterface {
        iface: String,
        #[source]
        source: Errno,
    },

    #[error("interface {iface:?} has no IPv4 address: {source}")]
    Ipv4AddressUnavailable {
        iface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid listen address {addr:?}: {source}")]
    InvalidListenAddress {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("ring size {requested} is not a power of two")]
    RingSizeNotPowerOfTwo { requested: u32 },

    #[error("failed to raise RLIMIT_MEMLOCK: {source}")]
    MemlockLimit {
        #[source]
        source: Errno,
    },

    #[error("failed to open AF_XDP socket on queue {queue_id}: {source}")]
    SocketOpen {
        queue_id: u32,
        #[source]
        source: Errno,
    },

    #[error("failed to open control socket on {addr}: {source}")]
    ControlBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write filter config map at {path}: {source}")]
    ConfigMapWrite {
        path: String,
        #[source]
        source: Errno,
    },
}
