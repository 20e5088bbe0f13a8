// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The engine's public entry points: one per recordable syscall, plus the
//! capture-coordinator and lifecycle entry points.
//!
//! Grounded in `original_source/tcp_events.c`'s `tcp_ev_*` functions: each
//! one locks the connection, builds its event from the syscall's
//! arguments/return value/errno, appends it, and (per spec §7) never lets
//! an internal error escape — failures are logged and the call degrades to
//! a no-op for that one event.

use crate::capture::{self, CaptureBackend};
use crate::config::Configuration;
use crate::connection::Connection;
use crate::event::{
    make_event, Address, EventPayload, IovecSummary, MsgHdrDescriptor, RecvFlags, SendFlags,
    TcpInfo,
};
use crate::json_sink;
use crate::lifecycle::{self, LIFECYCLE};
use crate::sampling;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn describe_errno(errno_raw: i32) -> Option<String> {
    if errno_raw == 0 {
        None
    } else {
        Some(errno::Errno(errno_raw).to_string())
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// What the caller must do once the connection's lock is released: flush
/// was already performed under the lock (it's local I/O), but the
/// `TCP_INFO` refresh needs a syscall on `fd` and must happen lock-free
/// (spec §4.6).
struct PostEventActions {
    sample_tcp_info: bool,
}

fn post_event(conn: &mut Connection, config: &Configuration, kind_is_tcp_info: bool) -> PostEventActions {
    if sampling::should_flush_json(conn, config) {
        if let Err(e) = json_sink::flush(conn, false) {
            tracing::warn!(connection_id = conn.id, error = %e, "json flush failed");
        }
    }
    let sample_tcp_info =
        !kind_is_tcp_info && sampling::should_sample_tcp_info(conn, config, now_micros());
    PostEventActions { sample_tcp_info }
}

fn with_connection<R>(fd: RawFd, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
    let handle = LIFECYCLE.registry().acquire(fd)?;
    let mut conn = handle.lock().unwrap();
    Some(f(&mut conn))
}

/// Queries the kernel's current `TCP_INFO` for `fd` (spec §6 "Kernel").
pub fn query_tcp_info(fd: RawFd) -> std::io::Result<TcpInfo> {
    use std::mem;
    let mut info: libc::tcp_info = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::tcp_info>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(TcpInfo {
        state: info.tcpi_state,
        rtt_us: info.tcpi_rtt,
        rttvar_us: info.tcpi_rttvar,
        snd_cwnd: info.tcpi_snd_cwnd,
        total_retrans: info.tcpi_total_retrans,
    })
}

/// If `post.sample_tcp_info`, queries and records a fresh `TCP_INFO`
/// sample. Must run with no lock held on `fd`'s connection.
fn follow_up_tcp_info(fd: RawFd, post: PostEventActions) {
    if !post.sample_tcp_info {
        return;
    }
    match query_tcp_info(fd) {
        Ok(info) => record_tcp_info(fd, 0, 0, info),
        Err(e) => {
            let errno_raw = e.raw_os_error().unwrap_or(0);
            record_tcp_info(fd, -1, errno_raw, TcpInfo::default());
        }
    }
}

fn connection_directory(id: u64) -> Option<PathBuf> {
    lifecycle::LIFECYCLE.logs_dir().map(|dir| dir.join(id.to_string()))
}

/// Records a `socket()` call. Must run before any other `record_*` call
/// on `fd` (spec §4.7 "close-on-stale"): if `fd` is already present, a
/// synthetic close is recorded first, since the traced process almost
/// certainly just reused a descriptor after a missed `close`/`dup2`.
pub fn record_socket(fd: RawFd, domain: i32, sock_type: i32, protocol: i32) {
    if let Err(e) = LIFECYCLE.init() {
        tracing::error!(error = %e, "lifecycle init failed");
    }

    if LIFECYCLE.registry().present(fd) {
        record_close(fd, 0, 0, true);
    }

    let id = LIFECYCLE.next_connection_id();
    let directory = connection_directory(id);
    if let Some(dir) = &directory {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!(connection_id = id, error = %e, "failed to create connection directory");
        }
    }
    let mut conn = Connection::new(id, directory);

    const SOCK_TYPE_MASK: i32 = 0b1111;
    let event = make_event(
        EventPayload::Socket {
            domain,
            sock_type: sock_type & SOCK_TYPE_MASK,
            protocol,
            sock_cloexec: sock_type & libc::SOCK_CLOEXEC != 0,
            sock_nonblock: sock_type & libc::SOCK_NONBLOCK != 0,
        },
        fd as i64,
        None,
        0,
    );
    conn.append(event);

    if let Err(e) = LIFECYCLE.registry().put(fd, conn) {
        tracing::error!(fd, error = %e, "failed to register new connection");
    }
}

pub fn record_bind(fd: RawFd, return_value: i32, errno_raw: i32, addr: SocketAddr) {
    let errno_description = describe_errno(errno_raw);
    let config = LIFECYCLE.config();
    let post = with_connection(fd, |conn| {
        let force_bind = conn.force_bind;
        let event = make_event(
            EventPayload::Bind {
                address: Address::from_raw(addr),
                force_bind,
            },
            return_value as i64,
            errno_description,
            conn.events_count,
        );
        conn.append(event);
        if return_value == 0 {
            conn.mark_bound(addr);
        }
        config.as_ref().map(|c| post_event(conn, c, false))
    });
    if let Some(Some(post)) = post {
        follow_up_tcp_info(fd, post);
    }
}

pub fn record_connect(fd: RawFd, return_value: i32, errno_raw: i32, addr: SocketAddr) {
    let errno_description = describe_errno(errno_raw);
    let config = LIFECYCLE.config();
    let post = with_connection(fd, |conn| {
        let event = make_event(
            EventPayload::Connect {
                address: Address::from_raw(addr),
            },
            return_value as i64,
            errno_description,
            conn.events_count,
        );
        conn.append(event);
        config.as_ref().map(|c| post_event(conn, c, false))
    });
    if let Some(Some(post)) = post {
        follow_up_tcp_info(fd, post);
    }
}

/// Prepares packet capture for an upcoming `connect()` (spec §4.5 "Goal").
/// Must be called by the interposition layer before the real `connect()`
/// syscall so the capture filter is installed before the handshake's
/// first packet. If the socket is not yet bound, force-binds it first,
/// synthesizing the resulting `record_bind` event (spec §4.5 steps 2-3).
pub fn start_capture(fd: RawFd, peer_addr: SocketAddr, backend: &dyn CaptureBackend) {
    let already_bound = with_connection(fd, |conn| conn.bound);
    let Some(already_bound) = already_bound else {
        tracing::error!(fd, "start_capture called on unknown connection");
        return;
    };

    if !already_bound {
        with_connection(fd, |conn| conn.force_bind = true);
        match capture::force_bind(fd, peer_addr.ip()) {
            Ok(bound) => record_bind(fd, 0, 0, bound),
            Err(e) => {
                tracing::warn!(fd, error = %e, "force-bind failed, capture filter will be destination-only");
                record_bind(fd, -1, libc::EADDRINUSE, peer_addr);
            }
        }
    }

    let outcome = with_connection(fd, |conn| {
        let directory = conn.directory.clone();
        let local_port = conn.bound_addr.map(|a| a.port());
        (directory, local_port)
    });
    let Some((directory, local_port)) = outcome else {
        return;
    };
    let Some(directory) = directory else {
        tracing::warn!(fd, "no on-disk directory, skipping capture");
        return;
    };

    let filter = capture::build_filter(&Address::from_raw(peer_addr), local_port);
    let output_path = directory.join("capture.pcap");
    match backend.start(&filter, &output_path) {
        Ok(handle) => {
            with_connection(fd, |conn| conn.capture_session = Some(handle));
        }
        Err(e) => {
            tracing::warn!(fd, error = %e, "capture start failed, continuing without packet capture");
        }
    }
}

pub fn record_shutdown(fd: RawFd, return_value: i32, errno_raw: i32, how: i32) {
    let errno_description = describe_errno(errno_raw);
    let config = LIFECYCLE.config();
    let post = with_connection(fd, |conn| {
        let event = make_event(
            EventPayload::Shutdown {
                shut_rd: how == libc::SHUT_RD || how == libc::SHUT_RDWR,
                shut_wr: how == libc::SHUT_WR || how == libc::SHUT_RDWR,
            },
            return_value as i64,
            errno_description,
            conn.events_count,
        );
        conn.append(event);
        config.as_ref().map(|c| post_event(conn, c, false))
    });
    if let Some(Some(post)) = post {
        follow_up_tcp_info(fd, post);
    }
}

pub fn record_listen(fd: RawFd, return_value: i32, errno_raw: i32, backlog: i32) {
    let errno_description = describe_errno(errno_raw);
    let config = LIFECYCLE.config();
    let post = with_connection(fd, |conn| {
        let event = make_event(
            EventPayload::Listen { backlog },
            return_value as i64,
            errno_description,
            conn.events_count,
        );
        conn.append(event);
        config.as_ref().map(|c| post_event(conn, c, false))
    });
    if let Some(Some(post)) = post {
        follow_up_tcp_info(fd, post);
    }
}

/// Records a `setsockopt()` call. Resolves spec Open Question O3: the
/// original looks up `level`'s protocol name with `getprotobynumber(ev->level)`
/// *before* `ev->level` has been assigned, using whatever stack garbage was
/// in the freshly allocated event. Here `level` is in hand as a parameter
/// from the start, so the lookup always happens after, and always sees the
/// real value.
pub fn record_setsockopt(fd: RawFd, return_value: i32, errno_raw: i32, level: i32, optname: i32) {
    let errno_description = describe_errno(errno_raw);
    let level_str = protocol_name(level);
    let optname_str = sockopt_name(level, optname);
    let config = LIFECYCLE.config();
    let post = with_connection(fd, |conn| {
        let event = make_event(
            EventPayload::Setsockopt {
                level,
                level_str: level_str.clone(),
                optname,
                optname_str: optname_str.clone(),
            },
            return_value as i64,
            errno_description,
            conn.events_count,
        );
        conn.append(event);
        config.as_ref().map(|c| post_event(conn, c, false))
    });
    if let Some(Some(post)) = post {
        follow_up_tcp_info(fd, post);
    }
}

fn protocol_name(level: i32) -> Option<String> {
    let proto = unsafe { libc::getprotobynumber(level) };
    if proto.is_null() {
        return None;
    }
    let name = unsafe { std::ffi::CStr::from_ptr((*proto).p_name) };
    Some(name.to_string_lossy().into_owned())
}

/// `getsockopt`/`setsockopt` option names have no portable reverse lookup
/// in libc; only the handful of `SOL_SOCKET` names commonly seen in
/// traced traffic are resolved, matching the scope of the original's
/// `alloc_sock_optname_str` table.
fn sockopt_name(level: i32, optname: i32) -> Option<String> {
    if level != libc::SOL_SOCKET {
        return None;
    }
    let name = match optname {
        libc::SO_REUSEADDR => "SO_REUSEADDR",
        libc::SO_KEEPALIVE => "SO_KEEPALIVE",
        libc::SO_BROADCAST => "SO_BROADCAST",
        libc::SO_LINGER => "SO_LINGER",
        libc::SO_RCVBUF => "SO_RCVBUF",
        libc::SO_SNDBUF => "SO_SNDBUF",
        libc::SO_RCVTIMEO => "SO_RCVTIMEO",
        libc::SO_SNDTIMEO => "SO_SNDTIMEO",
        _ => return None,
    };
    Some(name.to_string())
}

pub fn record_send(fd: RawFd, return_value: i64, errno_raw: i32, bytes: usize, flags: i32) {
    let errno_description = describe_errno(errno_raw);
    let config = LIFECYCLE.config();
    let post = with_connection(fd, |conn| {
        conn.credit_sent(bytes);
        let event = make_event(
            EventPayload::Send {
                bytes,
                flags: SendFlags::from_bits(flags),
            },
            return_value,
            errno_description,
            conn.events_count,
        );
        conn.append(event);
        config.as_ref().map(|c| post_event(conn, c, false))
    });
    if let Some(Some(post)) = post {
        follow_up_tcp_info(fd, post);
    }
}

pub fn record_recv(fd: RawFd, return_value: i64, errno_raw: i32, bytes: usize, flags: i32) {
    let errno_description = describe_errno(errno_raw);
    let config = LIFECYCLE.config();
    let post = with_connection(fd, |conn| {
        conn.credit_received(bytes);
        let event = make_event(
            EventPayload::Recv {
                bytes,
                flags: RecvFlags::from_bits(flags),
            },
            return_value,
            errno_description,
            conn.events_count,
        );
        conn.append(event);
        config.as_ref().map(|c| post_event(conn, c, false))
    });
    if let Some(Some(post)) = post {
        follow_up_tcp_info(fd, post);
    }
}

pub fn record_sendto(
    fd: RawFd,
    return_value: i64,
    errno_raw: i32,
    bytes: usize,
    flags: i32,
    addr: SocketAddr,
) {
    let errno_description = describe_errno(errno_raw);
    let config = LIFECYCLE.config();
    let post = with_connection(fd, |conn| {
        conn.credit_sent(bytes);
        let event = make_event(
            EventPayload::Sendto {
                bytes,
                flags: SendFlags::from_bits(flags),
                address: Address::from_raw(addr),
            },
            return_value,
            errno_description,
            conn.events_count,
        );
        conn.append(event);
        config.as_ref().map(|c| post_event(conn, c, false))
    });
    if let Some(Some(post)) = post {
        follow_up_tcp_info(fd, post);
    }
}

pub fn record_recvfrom(
    fd: RawFd,
    return_value: i64,
    errno_raw: i32,
    bytes: usize,
    flags: i32,
    addr: SocketAddr,
) {
    let errno_description = describe_errno(errno_raw);
    let config = LIFECYCLE.config();
    let post = with_connection(fd, |conn| {
        conn.credit_received(bytes);
        let event = make_event(
            EventPayload::Recvfrom {
                bytes,
                flags: RecvFlags::from_bits(flags),
                address: Address::from_raw(addr),
            },
            return_value,
            errno_description,
            conn.events_count,
        );
        conn.append(event);
        config.as_ref().map(|c| post_event(conn, c, false))
    });
    if let Some(Some(post)) = post {
        follow_up_tcp_info(fd, post);
    }
}

pub fn record_sendmsg(
    fd: RawFd,
    return_value: i64,
    errno_raw: i32,
    address: Option<SocketAddr>,
    has_control_data: bool,
    iovec_lengths: &[usize],
    flags: i32,
) {
    let errno_description = describe_errno(errno_raw);
    let config = LIFECYCLE.config();
    let iovec = IovecSummary::from_lengths(iovec_lengths);
    let bytes = iovec.total_bytes();
    let post = with_connection(fd, |conn| {
        conn.credit_sent(bytes);
        let event = make_event(
            EventPayload::Sendmsg {
                flags: SendFlags::from_bits(flags),
                msghdr: MsgHdrDescriptor {
                    address: address.map(Address::from_raw),
                    control_data: has_control_data,
                    iovec: iovec.clone(),
                },
            },
            return_value,
            errno_description,
            conn.events_count,
        );
        conn.append(event);
        config.as_ref().map(|c| post_event(conn, c, false))
    });
    if let Some(Some(post)) = post {
        follow_up_tcp_info(fd, post);
    }
}

pub fn record_recvmsg(
    fd: RawFd,
    return_value: i64,
    errno_raw: i32,
    address: Option<SocketAddr>,
    has_control_data: bool,
    iovec_lengths: &[usize],
    flags: i32,
) {
    let errno_description = describe_errno(errno_raw);
    let config = LIFECYCLE.config();
    let iovec = IovecSummary::from_lengths(iovec_lengths);
    let bytes = iovec.total_bytes();
    let post = with_connection(fd, |conn| {
        conn.credit_received(bytes);
        let event = make_event(
            EventPayload::Recvmsg {
                flags: RecvFlags::from_bits(flags),
                msghdr: MsgHdrDescriptor {
                    address: address.map(Address::from_raw),
                    control_data: has_control_data,
                    iovec: iovec.clone(),
                },
            },
            return_value,
            errno_description,
            conn.events_count,
        );
        conn.append(event);
        config.as_ref().map(|c| post_event(conn, c, false))
    });
    if let Some(Some(post)) = post {
        follow_up_tcp_info(fd, post);
    }
}

pub fn record_write(fd: RawFd, return_value: i64, errno_raw: i32, bytes: usize) {
    let errno_description = describe_errno(errno_raw);
    let config = LIFECYCLE.config();
    let post = with_connection(fd, |conn| {
        conn.credit_sent(bytes);
        let event = make_event(
            EventPayload::Write { bytes },
            return_value,
            errno_description,
            conn.events_count,
        );
        conn.append(event);
        config.as_ref().map(|c| post_event(conn, c, false))
    });
    if let Some(Some(post)) = post {
        follow_up_tcp_info(fd, post);
    }
}

pub fn record_read(fd: RawFd, return_value: i64, errno_raw: i32, bytes: usize) {
    let errno_description = describe_errno(errno_raw);
    let config = LIFECYCLE.config();
    let post = with_connection(fd, |conn| {
        conn.credit_received(bytes);
        let event = make_event(
            EventPayload::Read { bytes },
            return_value,
            errno_description,
            conn.events_count,
        );
        conn.append(event);
        config.as_ref().map(|c| post_event(conn, c, false))
    });
    if let Some(Some(post)) = post {
        follow_up_tcp_info(fd, post);
    }
}

pub fn record_writev(fd: RawFd, return_value: i64, errno_raw: i32, iovec_lengths: &[usize]) {
    let errno_description = describe_errno(errno_raw);
    let config = LIFECYCLE.config();
    let iovec = IovecSummary::from_lengths(iovec_lengths);
    let bytes = iovec.total_bytes();
    let post = with_connection(fd, |conn| {
        conn.credit_sent(bytes);
        let event = make_event(
            EventPayload::Writev { iovec: iovec.clone() },
            return_value,
            errno_description,
            conn.events_count,
        );
        conn.append(event);
        config.as_ref().map(|c| post_event(conn, c, false))
    });
    if let Some(Some(post)) = post {
        follow_up_tcp_info(fd, post);
    }
}

pub fn record_readv(fd: RawFd, return_value: i64, errno_raw: i32, iovec_lengths: &[usize]) {
    let errno_description = describe_errno(errno_raw);
    let config = LIFECYCLE.config();
    let iovec = IovecSummary::from_lengths(iovec_lengths);
    let bytes = iovec.total_bytes();
    let post = with_connection(fd, |conn| {
        conn.credit_received(bytes);
        let event = make_event(
            EventPayload::Readv { iovec: iovec.clone() },
            return_value,
            errno_description,
            conn.events_count,
        );
        conn.append(event);
        config.as_ref().map(|c| post_event(conn, c, false))
    });
    if let Some(Some(post)) = post {
        follow_up_tcp_info(fd, post);
    }
}

/// Records a `TCP_INFO` sample, either from a direct kernel query
/// triggered by sampling policy (see `follow_up_tcp_info`) or synthesized
/// by a caller that already has one in hand.
///
/// Like every other `record_*` entry, this may itself land on a JSON flush
/// boundary (`TCP_EV_POSTLUDE` runs `should_dump_json` for the tcp_info
/// event too), so it consults `post_event` the same way; passing
/// `kind_is_tcp_info = true` suppresses the tcp_info-sampling follow-up that
/// would otherwise recurse into sampling itself.
pub fn record_tcp_info(fd: RawFd, return_value: i32, errno_raw: i32, info: TcpInfo) {
    let errno_description = describe_errno(errno_raw);
    let now = now_micros();
    let config = LIFECYCLE.config();
    with_connection(fd, |conn| {
        let event = make_event(
            EventPayload::TcpInfo { info },
            return_value as i64,
            errno_description,
            conn.events_count,
        );
        conn.append(event);
        if return_value == 0 {
            conn.record_tcp_info_sample(info.rtt_us, now);
        }
        if let Some(c) = config.as_ref() {
            post_event(conn, c, true);
        }
    });
}

/// Records a `close()` call and removes the connection from the registry,
/// flushing its final JSON and stopping any in-flight capture (spec §4.7
/// "close-all" and `original_source/tcp_events.c`'s `tcp_ev_close`).
///
/// `detected` is true when this close was synthesized by `record_socket`'s
/// close-on-stale handling rather than reported by the traced process.
pub fn record_close(fd: RawFd, return_value: i32, errno_raw: i32, detected: bool) {
    let errno_description = describe_errno(errno_raw);
    let Some(mut connection) = LIFECYCLE.registry().take(fd) else {
        tracing::warn!(fd, "record_close called on unknown connection");
        return;
    };
    let event = make_event(
        EventPayload::Close { detected },
        return_value as i64,
        errno_description,
        connection.events_count,
    );
    connection.append(event);
    lifecycle::close_connection(&mut connection);
}

/// Re-exported lifecycle entry points; see `lifecycle::Lifecycle`.
pub fn init() {
    if let Err(e) = LIFECYCLE.init() {
        tracing::error!(error = %e, "lifecycle init failed");
    }
}

pub fn reset_after_fork() {
    LIFECYCLE.reset_after_fork();
}

pub fn close_all_open_connections() {
    LIFECYCLE.close_all_open_connections();
}

pub fn shutdown_all() {
    lifecycle::shutdown_all();
}
