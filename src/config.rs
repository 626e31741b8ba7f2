//! CLI surface and resolved runtime configuration.
//!
//! Split in two steps, mirroring the teacher's own `examples/flood.rs` split between argument
//! parsing and interface resolution: [`Args`] is the raw `clap` surface; [`Config::from_args`]
//! resolves it (interface lookup, MAC/IPv4 discovery, `RLIMIT_MEMLOCK`) into the single struct
//! every other component is constructed from.

use std::ffi::CString;
use std::net::Ipv4Addr;

use clap::Parser;

use crate::error::ReplicatorError;
use crate::xdp_socket::Mode;
use crate::xsk::IfInfo;
use crate::Errno;

#[derive(Parser, Debug)]
#[command(name = "replicator", about = "Kernel-bypass UDP packet replicator")]
pub struct Args {
    /// Network interface to bind to, e.g. `eth0`.
    pub interface: String,

    /// IPv4 address the in-kernel filter matches as the replicated traffic's destination.
    pub listen_ip: String,

    /// UDP port the in-kernel filter matches as the replicated traffic's destination.
    pub listen_port: u16,

    /// Literal `zero_copy` to request zero-copy mode; any other value (or omission) uses
    /// driver-copy. Falls back to driver-copy silently if the driver refuses zero-copy.
    pub zero_copy: Option<String>,

    /// Number of NIC queues (and worker threads) to bind.
    #[arg(long, default_value_t = 4)]
    pub queues: u32,

    #[arg(long = "rx-ring-size", default_value_t = 2048)]
    pub rx_ring_size: u32,

    #[arg(long = "tx-ring-size", default_value_t = 2048)]
    pub tx_ring_size: u32,

    #[arg(long = "fill-ring-size", default_value_t = 4096)]
    pub fill_ring_size: u32,

    #[arg(long = "completion-ring-size", default_value_t = 4096)]
    pub completion_ring_size: u32,

    #[arg(long = "frame-size", default_value_t = 4096)]
    pub frame_size: u32,

    #[arg(long = "tx-frames", default_value_t = 2048)]
    pub tx_frames: u32,

    #[arg(long = "rx-frames", default_value_t = 2048)]
    pub rx_frames: u32,

    #[arg(long = "tx-batch", default_value_t = 64)]
    pub tx_batch: u32,

    #[arg(long = "refresh-timeout-ms", default_value_t = 100)]
    pub refresh_timeout_ms: u64,

    #[arg(long = "control-port", default_value_t = 12345)]
    pub control_port: u16,

    /// Path to the pinned `xsks_map` the in-kernel filter redirects into.
    #[arg(long = "filter-map")]
    pub filter_map: Option<std::path::PathBuf>,

    /// Path to the pinned config map the in-kernel filter reads its match target from.
    #[arg(long = "config-map")]
    pub config_map: Option<std::path::PathBuf>,

    #[arg(long = "stats-interval-ms", default_value_t = 1000)]
    pub stats_interval_ms: u64,
}

/// Resolved, validated configuration shared by every component.
pub struct Config {
    pub interface: IfInfo,
    pub interface_name: String,
    pub src_mac: Option<[u8; 6]>,
    pub src_ip: Ipv4Addr,
    pub listen_ip: Ipv4Addr,
    pub listen_port: u16,
    pub mode: Mode,
    pub queues: u32,
    pub rx_ring_size: u32,
    pub tx_ring_size: u32,
    pub fill_ring_size: u32,
    pub completion_ring_size: u32,
    pub frame_size: u32,
    pub tx_frames: u32,
    pub rx_frames: u32,
    pub tx_batch: u32,
    pub refresh_timeout: std::time::Duration,
    pub control_port: u16,
    pub filter_map: Option<std::path::PathBuf>,
    pub config_map: Option<std::path::PathBuf>,
    pub stats_interval: std::time::Duration,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ReplicatorError> {
        let mut interface = IfInfo::invalid();
        let cname = CString::new(args.interface.clone()).map_err(|_| ReplicatorError::UnknownInterface {
            iface: args.interface.clone(),
            source: Errno(libc::EINVAL),
        })?;
        interface
            .from_name(&cname)
            .map_err(|source| ReplicatorError::UnknownInterface {
                iface: args.interface.clone(),
                source,
            })?;

        let src_mac = interface.mac_addr().ok();
        let src_ip = interface
            .ipv4_addr()
            .map_err(|source| ReplicatorError::Ipv4AddressUnavailable {
                iface: args.interface.clone(),
                source,
            })?;

        let listen_ip: Ipv4Addr =
            args.listen_ip
                .parse()
                .map_err(|source| ReplicatorError::InvalidListenAddress {
                    addr: args.listen_ip.clone(),
                    source,
                })?;

        for (name, size) in [
            ("rx-ring-size", args.rx_ring_size),
            ("tx-ring-size", args.tx_ring_size),
            ("fill-ring-size", args.fill_ring_size),
            ("completion-ring-size", args.completion_ring_size),
            ("frame-size", args.frame_size),
        ] {
            if !size.is_power_of_two() {
                let _ = name;
                return Err(ReplicatorError::RingSizeNotPowerOfTwo { requested: size });
            }
        }

        raise_memlock_limit()?;

        let mode = match args.zero_copy.as_deref() {
            Some("zero_copy") => Mode::ZeroCopy,
            _ => Mode::DriverCopy,
        };

        Ok(Config {
            interface,
            interface_name: args.interface,
            src_mac,
            src_ip,
            listen_ip,
            listen_port: args.listen_port,
            mode,
            queues: args.queues,
            rx_ring_size: args.rx_ring_size,
            tx_ring_size: args.tx_ring_size,
            fill_ring_size: args.fill_ring_size,
            completion_ring_size: args.completion_ring_size,
            frame_size: args.frame_size,
            tx_frames: args.tx_frames,
            rx_frames: args.rx_frames,
            tx_batch: args.tx_batch,
            refresh_timeout: std::time::Duration::from_millis(args.refresh_timeout_ms),
            control_port: args.control_port,
            filter_map: args.filter_map,
            config_map: args.config_map,
            stats_interval: std::time::Duration::from_millis(args.stats_interval_ms),
        })
    }
}

fn raise_memlock_limit() -> Result<(), ReplicatorError> {
    let limit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) };
    if ret != 0 {
        return Err(ReplicatorError::MemlockLimit { source: Errno::new() });
    }
    Ok(())
}
