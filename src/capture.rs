// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capture coordination: BPF filter construction, the force-bind protocol,
//! and start/stop of a per-connection packet-capture worker (spec §4.5).
//!
//! The capture session itself is modeled as a trait object (spec §9,
//! "Capture session opacity") so the event-tracking core does not depend on
//! any particular packet-capture library; `PcapCaptureBackend` is the
//! concrete implementation used in production, backed by `pcap`.

use crate::error::{CaptureError, ForceBindError};
use crate::event::Address;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::Duration;

/// Kernel ephemeral port range used for force-bind probing (spec §4.5;
/// matches `/proc/sys/net/ipv4/ip_local_port_range` on a stock Linux host,
/// as noted in `original_source/tcp_events.c`).
pub const MIN_EPHEMERAL_PORT: u16 = 32768;
pub const MAX_EPHEMERAL_PORT: u16 = 60999;

/// An in-flight capture session. Stopping it signals the worker and blocks
/// until it has joined (spec §4.5, §5 "Cancellation/timeouts").
pub trait CaptureHandle: Send {
    /// `linger` is advisory: implementations may use it to let in-flight
    /// packets drain before breaking the capture loop, but must not block
    /// indefinitely on it.
    fn stop(self: Box<Self>, linger: Duration);
}

/// Opens a live capture, installs a filter, and begins dumping to a pcap
/// file in a background worker (spec §6.1 "Capture primitive").
pub trait CaptureBackend: Send + Sync {
    fn start(&self, filter: &str, output_path: &Path) -> Result<Box<dyn CaptureHandle>, CaptureError>;
}

/// Builds `host <peer_ip> and port <peer_port>[ and port <local_port>]`
/// (spec §4.5 "Goal").
pub fn build_filter(peer: &Address, local_port: Option<u16>) -> String {
    let mut filter = format!("host {} and port {}", peer.ip, peer.port);
    if let Some(port) = local_port {
        filter.push_str(&format!(" and port {port}"));
    }
    filter
}

/// Probes the kernel ephemeral port range and binds `fd` to the first
/// available port using the wildcard address matching `peer_family`
/// (spec §4.5 steps 2-3; family selection grounded in
/// `original_source/tcp_events.c`'s `force_bind(fd, con, IPV6)`).
pub fn force_bind(fd: RawFd, peer_family: IpAddr) -> Result<SocketAddr, ForceBindError> {
    use nix::sys::socket::{bind, SockaddrIn, SockaddrIn6};

    for port in MIN_EPHEMERAL_PORT..=MAX_EPHEMERAL_PORT {
        let result = match peer_family {
            IpAddr::V6(_) => {
                let addr = SockaddrIn6::from(std::net::SocketAddrV6::new(
                    Ipv6Addr::UNSPECIFIED,
                    port,
                    0,
                    0,
                ));
                bind(fd, &addr)
            }
            IpAddr::V4(_) => {
                let addr = SockaddrIn::from(std::net::SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
                bind(fd, &addr)
            }
        };
        match result {
            Ok(()) => {
                let bound = match peer_family {
                    IpAddr::V6(_) => {
                        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
                    }
                    IpAddr::V4(_) => {
                        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
                    }
                };
                return Ok(bound);
            }
            Err(nix::Error::EADDRINUSE) => continue,
            Err(e) => return Err(ForceBindError::Unexpected(e)),
        }
    }
    Err(ForceBindError::Exhausted(MIN_EPHEMERAL_PORT, MAX_EPHEMERAL_PORT))
}

#[cfg(feature = "capture")]
pub use pcap_backend::PcapCaptureBackend;

#[cfg(feature = "capture")]
mod pcap_backend {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    /// Default `CaptureBackend`, backed by libpcap via the `pcap` crate.
    /// Device resolution follows spec §6.1: `NETSPY_DEV` env var, else the
    /// system default (`pcap::Device::lookup`).
    pub struct PcapCaptureBackend;

    impl PcapCaptureBackend {
        fn resolve_device(&self) -> Result<pcap::Device, CaptureError> {
            if let Ok(name) = std::env::var("NETSPY_DEV") {
                return pcap::Device::list()
                    .map_err(|e| CaptureError::OpenFailed(e.to_string()))?
                    .into_iter()
                    .find(|d| d.name == name)
                    .ok_or(CaptureError::NoDevice);
            }
            pcap::Device::lookup()
                .map_err(|e| CaptureError::OpenFailed(e.to_string()))?
                .ok_or(CaptureError::NoDevice)
        }
    }

    impl CaptureBackend for PcapCaptureBackend {
        fn start(
            &self,
            filter: &str,
            output_path: &Path,
        ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
            let device = self.resolve_device()?;
            let mut capture = pcap::Capture::from_device(device)
                .map_err(|e| CaptureError::OpenFailed(e.to_string()))?
                .timeout(200)
                .open()
                .map_err(|e| CaptureError::OpenFailed(e.to_string()))?;
            capture
                .filter(filter, true)
                .map_err(|e| CaptureError::FilterFailed(e.to_string()))?;
            let mut savefile = capture
                .savefile(output_path)
                .map_err(|e| CaptureError::DumpOpenFailed(e.to_string()))?;

            let stop = Arc::new(AtomicBool::new(false));
            let worker_stop = stop.clone();
            let worker = thread::Builder::new()
                .name("netspy-capture".into())
                .spawn(move || {
                    tracing::info!(target: "netspy_core::capture", "capture thread started");
                    loop {
                        if worker_stop.load(Ordering::SeqCst) {
                            break;
                        }
                        match capture.next_packet() {
                            Ok(packet) => savefile.write(&packet),
                            Err(pcap::Error::TimeoutExpired) => continue,
                            Err(e) => {
                                tracing::warn!(
                                    target: "netspy_core::capture",
                                    error = %e,
                                    "pcap loop terminated unexpectedly"
                                );
                                break;
                            }
                        }
                    }
                    tracing::info!(target: "netspy_core::capture", "capture ended");
                })?;

            Ok(Box::new(PcapHandle {
                stop,
                worker: Some(worker),
            }))
        }
    }

    struct PcapHandle {
        stop: Arc<AtomicBool>,
        worker: Option<thread::JoinHandle<()>>,
    }

    impl CaptureHandle for PcapHandle {
        fn stop(mut self: Box<Self>, linger: Duration) {
            // Cap the advisory linger so a pathological RTT sample can't
            // wedge shutdown indefinitely.
            thread::sleep(linger.min(Duration::from_secs(2)));
            self.stop.store(true, Ordering::SeqCst);
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }
}
