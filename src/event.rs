// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The tagged event record: common header plus a per-kind payload.
//!
//! Mirrors the variant-by-enum-tag shape of `tcp_events.c`'s
//! `alloc_event`/`free_event` pair, replacing the inheritance-by-prefix-struct
//! pattern (`TcpEvSocket`, `TcpEvBind`, ...) with a single sum type (spec §9).

use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

/// One of the 18 recordable syscall kinds, in the order given in spec §6.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Socket,
    Bind,
    Connect,
    Shutdown,
    Listen,
    Setsockopt,
    Send,
    Recv,
    Sendto,
    Recvfrom,
    Sendmsg,
    Recvmsg,
    Write,
    Read,
    Close,
    Writev,
    Readv,
    TcpInfo,
}

impl EventKind {
    /// Success predicate table from spec §4.2.
    fn is_success(self, return_value: i64) -> bool {
        match self {
            EventKind::Socket => return_value != 0,
            EventKind::Close => return_value == 0,
            _ => return_value != -1,
        }
    }
}

/// Wall-clock timestamp with microsecond resolution, matching the original's
/// `fill_timeval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timestamp {
    pub secs: i64,
    pub micros: i64,
}

impl Timestamp {
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            secs: d.as_secs() as i64,
            micros: d.subsec_micros() as i64,
        }
    }
}

/// A socket address plus its derived textual forms (spec §3 "Address").
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Address {
    pub raw: SocketAddr,
    pub ip: String,
    pub port: u16,
    pub hostname: Option<String>,
    pub service: Option<String>,
}

impl Address {
    /// Builds an Address from a raw socket address. `hostname`/`service`
    /// are left unresolved; callers that have an `AddressResolver` should
    /// fill them in with `resolve`.
    pub fn from_raw(raw: SocketAddr) -> Self {
        Address {
            ip: raw.ip().to_string(),
            port: raw.port(),
            raw,
            hostname: None,
            service: None,
        }
    }

    /// Fills `hostname`/`service` using `resolver` (spec §6.1 "Address
    /// stringifier"). The engine itself never calls this; it is exposed for
    /// the out-of-scope presentation layer that wants resolved names
    /// without this crate taking on a DNS dependency.
    pub fn resolve(mut self, resolver: &dyn AddressResolver) -> Self {
        self.hostname = resolver.hostname(self.ip_addr());
        self.service = resolver.service(self.port);
        self
    }

    pub fn with_resolved(mut self, hostname: Option<String>, service: Option<String>) -> Self {
        self.hostname = hostname;
        self.service = service;
        self
    }

    pub fn ip_addr(&self) -> IpAddr {
        self.raw.ip()
    }
}

/// External "address stringifier" collaborator (spec §6.1): resolves an IP
/// to a hostname and a port to a service name. Out of scope for this crate
/// to implement (it would pull in a DNS/`/etc/services` dependency this
/// engine has no other use for); `NoopResolver` is the default that keeps
/// `hostname`/`service` unresolved.
pub trait AddressResolver: Send + Sync {
    fn hostname(&self, ip: IpAddr) -> Option<String>;
    fn service(&self, port: u16) -> Option<String>;
}

/// Default resolver: never resolves anything. Matches the "core assumes a
/// sink" pattern used for the logger collaborator (spec §6.1).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResolver;

impl AddressResolver for NoopResolver {
    fn hostname(&self, _ip: IpAddr) -> Option<String> {
        None
    }

    fn service(&self, _port: u16) -> Option<String> {
        None
    }
}

/// send()/sendto()/sendmsg() flag bitset (spec §3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SendFlags {
    pub msg_confirm: bool,
    pub msg_dontroute: bool,
    pub msg_dontwait: bool,
    pub msg_eor: bool,
    pub msg_more: bool,
    pub msg_nosignal: bool,
    pub msg_oob: bool,
}

impl SendFlags {
    pub fn from_bits(flags: i32) -> Self {
        SendFlags {
            msg_confirm: flags & libc::MSG_CONFIRM != 0,
            msg_dontroute: flags & libc::MSG_DONTROUTE != 0,
            msg_dontwait: flags & libc::MSG_DONTWAIT != 0,
            msg_eor: flags & libc::MSG_EOR != 0,
            msg_more: flags & libc::MSG_MORE != 0,
            msg_nosignal: flags & libc::MSG_NOSIGNAL != 0,
            msg_oob: flags & libc::MSG_OOB != 0,
        }
    }
}

/// recv()/recvfrom()/recvmsg() flag bitset (spec §3).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecvFlags {
    pub msg_cmsg_cloexec: bool,
    pub msg_dontwait: bool,
    pub msg_errqueue: bool,
    pub msg_oob: bool,
    pub msg_peek: bool,
    pub msg_trunc: bool,
    pub msg_waitall: bool,
}

impl RecvFlags {
    pub fn from_bits(flags: i32) -> Self {
        RecvFlags {
            msg_cmsg_cloexec: flags & libc::MSG_CMSG_CLOEXEC != 0,
            msg_dontwait: flags & libc::MSG_DONTWAIT != 0,
            msg_errqueue: flags & libc::MSG_ERRQUEUE != 0,
            msg_oob: flags & libc::MSG_OOB != 0,
            msg_peek: flags & libc::MSG_PEEK != 0,
            msg_trunc: flags & libc::MSG_TRUNC != 0,
            msg_waitall: flags & libc::MSG_WAITALL != 0,
        }
    }
}

/// Count of buffers plus per-buffer byte lengths (spec §3 "Iovec summary").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IovecSummary {
    pub iovec_sizes: Vec<usize>,
}

impl IovecSummary {
    pub fn from_lengths(lengths: &[usize]) -> Self {
        IovecSummary {
            iovec_sizes: lengths.to_vec(),
        }
    }

    pub fn count(&self) -> usize {
        self.iovec_sizes.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.iovec_sizes.iter().sum()
    }
}

/// sendmsg()/recvmsg() ancillary descriptor (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MsgHdrDescriptor {
    pub address: Option<Address>,
    pub control_data: bool,
    pub iovec: IovecSummary,
}

/// Kernel `TCP_INFO` snapshot, copied by value (resolves spec Open Question
/// O2: the original copies a pointer's bytes, which this crate treats as a
/// bug and corrects).
///
/// Fields stop at `total_retrans`: `libc::tcp_info` does not expose the
/// later `tcpi_bytes_acked`/`tcpi_bytes_received` fields on this target, the
/// same boundary the pack's other `libc::tcp_info` consumer respects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TcpInfo {
    pub state: u8,
    pub rtt_us: u32,
    pub rttvar_us: u32,
    pub snd_cwnd: u32,
    pub total_retrans: u32,
}

/// Per-variant payload (spec §3 "Variant payloads").
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind_detail")]
pub enum EventPayload {
    Socket {
        domain: i32,
        #[serde(rename = "type")]
        sock_type: i32,
        protocol: i32,
        sock_cloexec: bool,
        sock_nonblock: bool,
    },
    Bind {
        address: Address,
        force_bind: bool,
    },
    Connect {
        address: Address,
    },
    Shutdown {
        shut_rd: bool,
        shut_wr: bool,
    },
    Listen {
        backlog: i32,
    },
    Setsockopt {
        level: i32,
        level_str: Option<String>,
        optname: i32,
        optname_str: Option<String>,
    },
    Send {
        bytes: usize,
        flags: SendFlags,
    },
    Recv {
        bytes: usize,
        flags: RecvFlags,
    },
    Sendto {
        bytes: usize,
        flags: SendFlags,
        address: Address,
    },
    Recvfrom {
        bytes: usize,
        flags: RecvFlags,
        address: Address,
    },
    Sendmsg {
        flags: SendFlags,
        msghdr: MsgHdrDescriptor,
    },
    Recvmsg {
        flags: RecvFlags,
        msghdr: MsgHdrDescriptor,
    },
    Write {
        bytes: usize,
    },
    Read {
        bytes: usize,
    },
    Writev {
        iovec: IovecSummary,
    },
    Readv {
        iovec: IovecSummary,
    },
    Close {
        detected: bool,
    },
    TcpInfo {
        info: TcpInfo,
    },
}

impl EventPayload {
    fn kind(&self) -> EventKind {
        match self {
            EventPayload::Socket { .. } => EventKind::Socket,
            EventPayload::Bind { .. } => EventKind::Bind,
            EventPayload::Connect { .. } => EventKind::Connect,
            EventPayload::Shutdown { .. } => EventKind::Shutdown,
            EventPayload::Listen { .. } => EventKind::Listen,
            EventPayload::Setsockopt { .. } => EventKind::Setsockopt,
            EventPayload::Send { .. } => EventKind::Send,
            EventPayload::Recv { .. } => EventKind::Recv,
            EventPayload::Sendto { .. } => EventKind::Sendto,
            EventPayload::Recvfrom { .. } => EventKind::Recvfrom,
            EventPayload::Sendmsg { .. } => EventKind::Sendmsg,
            EventPayload::Recvmsg { .. } => EventKind::Recvmsg,
            EventPayload::Write { .. } => EventKind::Write,
            EventPayload::Read { .. } => EventKind::Read,
            EventPayload::Writev { .. } => EventKind::Writev,
            EventPayload::Readv { .. } => EventKind::Readv,
            EventPayload::Close { .. } => EventKind::Close,
            EventPayload::TcpInfo { .. } => EventKind::TcpInfo,
        }
    }
}

/// One recorded syscall occurrence on a connection (spec §3 "Event").
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: u64,
    pub timestamp: Timestamp,
    pub kind: EventKind,
    pub return_value: i64,
    pub success: bool,
    pub error_str: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Builds an event. `id` is assigned by the caller (`Connection::append`
/// overwrites it with `events_count`, matching the original's
/// `ev->id = id` assignment happening at allocation time); this constructor
/// accepts it directly so call sites that already know their id (e.g.
/// `record_socket`'s synthetic first event) don't need a placeholder.
///
/// `error_str` is filled in from `errno_description` iff the event is not a
/// success, per spec §3.
pub fn make_event(
    payload: EventPayload,
    return_value: i64,
    errno_description: Option<String>,
    id: u64,
) -> Event {
    let kind = payload.kind();
    let success = kind.is_success(return_value);
    Event {
        id,
        timestamp: Timestamp::now(),
        kind,
        return_value,
        success,
        error_str: if success { None } else { errno_description },
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_success_iff_nonzero_return() {
        let ev = make_event(
            EventPayload::Socket {
                domain: libc::AF_INET,
                sock_type: libc::SOCK_STREAM,
                protocol: 0,
                sock_cloexec: false,
                sock_nonblock: false,
            },
            0,
            Some("EMFILE".into()),
            0,
        );
        assert!(!ev.success);
        assert_eq!(ev.error_str.as_deref(), Some("EMFILE"));

        let ev = make_event(
            EventPayload::Socket {
                domain: libc::AF_INET,
                sock_type: libc::SOCK_STREAM,
                protocol: 0,
                sock_cloexec: false,
                sock_nonblock: false,
            },
            4,
            None,
            0,
        );
        assert!(ev.success);
        assert!(ev.error_str.is_none());
    }

    #[test]
    fn close_success_iff_zero_return() {
        let ev = make_event(EventPayload::Close { detected: false }, 0, None, 1);
        assert!(ev.success);
        let ev = make_event(
            EventPayload::Close { detected: false },
            -1,
            Some("EBADF".into()),
            1,
        );
        assert!(!ev.success);
    }

    #[test]
    fn other_kinds_success_iff_not_negative_one() {
        let ev = make_event(EventPayload::Listen { backlog: 128 }, 0, None, 0);
        assert!(ev.success);
        let ev = make_event(
            EventPayload::Listen { backlog: 128 },
            -1,
            Some("EADDRINUSE".into()),
            0,
        );
        assert!(!ev.success);
    }

    #[test]
    fn send_flags_from_bits() {
        let flags = SendFlags::from_bits(libc::MSG_DONTWAIT | libc::MSG_MORE);
        assert!(flags.msg_dontwait);
        assert!(flags.msg_more);
        assert!(!flags.msg_oob);
    }

    #[test]
    fn recv_flags_from_bits() {
        let flags = RecvFlags::from_bits(libc::MSG_PEEK | libc::MSG_TRUNC);
        assert!(flags.msg_peek);
        assert!(flags.msg_trunc);
        assert!(!flags.msg_waitall);
    }

    #[test]
    fn iovec_summary_totals_bytes() {
        let iov = IovecSummary::from_lengths(&[10, 20, 5]);
        assert_eq!(iov.count(), 3);
        assert_eq!(iov.total_bytes(), 35);
    }

    #[test]
    fn noop_resolver_resolves_nothing() {
        let addr = Address::from_raw("127.0.0.1:80".parse().unwrap()).resolve(&NoopResolver);
        assert!(addr.hostname.is_none());
        assert!(addr.service.is_none());
    }

    #[test]
    fn event_serializes_as_json_object() {
        let ev = make_event(
            EventPayload::Write { bytes: 42 },
            42,
            None,
            7,
        );
        let json = serde_json::to_string(&ev).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["kind"], "write");
        assert_eq!(value["bytes"], 42);
    }
}
