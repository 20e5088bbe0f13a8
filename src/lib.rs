// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `netspy-core` is the TCP event-tracking engine behind a per-process
//! socket-interposition tracer: a concurrent, file-descriptor-indexed
//! connection registry, a tagged event model with incremental JSON
//! flushing, a packet-capture coordinator, a kernel-`TCP_INFO` sampling
//! policy, and a fork-safe lifecycle controller.
//!
//! This crate does not itself interpose on socket syscalls; it is the
//! state machine a syscall-interposition layer drives by calling the
//! `record_*` functions with each syscall's arguments, return value, and
//! errno, in the order the traced process made the calls.

pub mod capture;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod json_sink;
pub mod lifecycle;
pub mod logging;
pub mod record;
pub mod registry;
pub mod sampling;

pub use capture::{CaptureBackend, CaptureHandle};
pub use config::{Configuration, LogLevel};
pub use connection::Connection;
pub use event::{AddressResolver, Event, EventKind, EventPayload, NoopResolver};
pub use record::{
    close_all_open_connections, init, query_tcp_info, record_bind, record_close, record_connect,
    record_listen, record_read, record_readv, record_recv, record_recvfrom, record_recvmsg,
    record_send, record_sendmsg, record_sendto, record_setsockopt, record_shutdown,
    record_socket, record_tcp_info, record_write, record_writev, reset_after_fork, shutdown_all,
    start_capture,
};

#[cfg(feature = "capture")]
pub use capture::PcapCaptureBackend;
