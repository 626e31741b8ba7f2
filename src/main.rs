//! Binary entry point: parse arguments, resolve configuration, install the in-kernel filter's
//! config map, spawn one worker per queue plus the control and statistics threads, and shut down
//! cleanly on `SIGINT`/`SIGTERM`.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use xdp_replicator::arp::ArpCache;
use xdp_replicator::config::{Args, Config};
use xdp_replicator::control::ControlEndpoint;
use xdp_replicator::destination::DestinationSet;
use xdp_replicator::error::ReplicatorError;
use xdp_replicator::net::PacketBuilder;
use xdp_replicator::stats::Stats;
use xdp_replicator::worker::Worker;
use xdp_replicator::xdp_socket::{XdpSocket, XdpSocketConfig};
use xdp_replicator::xsk::ConfigMap;
use xdp_replicator::Errno;

fn main() {
    env_logger::init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<(), ReplicatorError> {
    let config = Config::from_args(args)?;

    let running = Arc::new(AtomicBool::new(true));
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&running)).expect("registering signal handler");
    }

    info!(
        "starting on {} ({}:{}) with {} queue(s)",
        config.interface_name, config.listen_ip, config.listen_port, config.queues
    );

    if let Some(path) = &config.config_map {
        let map = ConfigMap::open(path).map_err(|source| ReplicatorError::ConfigMapWrite {
            path: path.display().to_string(),
            source,
        })?;
        map.write(config.listen_ip, config.listen_port)
            .map_err(|source| ReplicatorError::ConfigMapWrite {
                path: path.display().to_string(),
                source,
            })?;
    }

    let destinations = DestinationSet::new();
    let arp = ArpCache::new(config.interface.ifindex());
    let stats = Arc::new(Stats::new(config.queues as usize));

    // Open every queue's socket up front: a bind failure on any queue is a startup-time
    // resource/configuration error and aborts the whole process, per the error taxonomy.
    let mut sockets = Vec::with_capacity(config.queues as usize);
    for queue_id in 0..config.queues {
        let queue_config = XdpSocketConfig {
            frame_size: config.frame_size,
            tx_frames: config.tx_frames,
            rx_frames: config.rx_frames,
            headroom: 0,
            rx_ring_size: config.rx_ring_size,
            tx_ring_size: config.tx_ring_size,
            fill_ring_size: config.fill_ring_size,
            completion_ring_size: config.completion_ring_size,
            mode: config.mode,
            tx_batch: config.tx_batch,
        };

        let socket = XdpSocket::new(
            config.interface,
            queue_id,
            queue_config,
            config.filter_map.as_deref(),
        )
        .map_err(|source: Errno| ReplicatorError::SocketOpen { queue_id, source })?;
        sockets.push(socket);
    }

    let control = ControlEndpoint::bind(config.control_port, &destinations, Arc::clone(&running))
        .map_err(|source| ReplicatorError::ControlBind {
            addr: format!("0.0.0.0:{}", config.control_port),
            source,
        })?;

    std::thread::scope(|scope| {
        scope.spawn(move || control.run());

        let reporter_stats = Arc::clone(&stats);
        let reporter_running = Arc::clone(&running);
        scope.spawn(move || {
            let handle = reporter_stats.spawn_reporter(reporter_running, config.stats_interval);
            let _ = handle.join();
        });

        for (queue_id, socket) in sockets.into_iter().enumerate() {
            let queue_id = queue_id as u32;
            let worker_destinations = &destinations;
            let worker_builder =
                PacketBuilder::new(config.src_mac, config.src_ip, config.listen_port, &arp);
            let worker_stats = stats.queue(queue_id as usize);
            let worker_running = Arc::clone(&running);
            let worker_refresh_timeout = config.refresh_timeout;

            scope.spawn(move || {
                let worker = Worker::new(
                    queue_id,
                    socket,
                    worker_destinations,
                    worker_builder,
                    worker_stats,
                    worker_running,
                    worker_refresh_timeout,
                );
                worker.run();
            });
        }
    });

    Ok(())
}
