// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The per-fd aggregate: events, byte counters, bind state, capture handle,
//! on-disk directory, and dump-progress cursors (spec §3 "Connection").

use crate::capture::CaptureHandle;
use crate::event::Event;
use std::net::SocketAddr;
use std::path::PathBuf;

/// One logical TCP endpoint instance tracked by the engine.
///
/// All fields are mutated only while the owning `Registry` slot's lock is
/// held (spec §5): `Connection` itself does no internal locking.
pub struct Connection {
    /// Process-unique, monotonically increasing id assigned at creation.
    pub id: u64,
    /// Absolute path of this connection's on-disk directory.
    pub directory: Option<PathBuf>,
    /// Events appended in occurrence order since the last drain.
    pub events: Vec<Event>,
    /// Total events ever appended; survives drains.
    pub events_count: u64,
    /// `events_count` at the last JSON drain.
    pub last_json_dump_evcount: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_info_dump_bytes: u64,
    pub last_info_dump_micros: i64,
    /// Last observed smoothed RTT, in microseconds.
    pub rtt: u32,
    pub bound: bool,
    pub bound_addr: Option<SocketAddr>,
    /// Set by `start_capture`'s force-bind probe before it calls
    /// `record_bind` itself, so that `record_bind` event carries
    /// `force_bind = true` (spec §9, "Relock-across-bind" design note: an
    /// explicit flag is clearer than relying on lock-release timing).
    pub force_bind: bool,
    pub capture_session: Option<Box<dyn CaptureHandle>>,
}

impl Connection {
    pub fn new(id: u64, directory: Option<PathBuf>) -> Self {
        Connection {
            id,
            directory,
            events: Vec::new(),
            events_count: 0,
            last_json_dump_evcount: 0,
            bytes_sent: 0,
            bytes_received: 0,
            last_info_dump_bytes: 0,
            last_info_dump_micros: 0,
            rtt: 0,
            bound: false,
            bound_addr: None,
            force_bind: false,
            capture_session: None,
        }
    }

    /// Appends `event` to the tail, assigning it the next sequence id and
    /// incrementing `events_count` (spec §4.3).
    pub fn append(&mut self, mut event: Event) {
        event.id = self.events_count;
        self.events_count += 1;
        self.events.push(event);
    }

    /// Credits sent bytes using the semantic payload size, not the syscall
    /// return value (spec §4.3 rationale: counters reflect attempted
    /// transfer volume, driving sampling thresholds even on partial
    /// failure).
    pub fn credit_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    pub fn credit_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }

    pub fn record_tcp_info_sample(&mut self, rtt_us: u32, now_micros: i64) {
        self.last_info_dump_bytes = self.bytes_sent + self.bytes_received;
        self.last_info_dump_micros = now_micros;
        self.rtt = rtt_us;
    }

    pub fn mark_bound(&mut self, addr: SocketAddr) {
        self.bound = true;
        self.bound_addr = Some(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{make_event, EventPayload};

    #[test]
    fn append_assigns_sequential_ids() {
        let mut con = Connection::new(0, None);
        con.append(make_event(
            EventPayload::Listen { backlog: 1 },
            0,
            None,
            999,
        ));
        con.append(make_event(
            EventPayload::Listen { backlog: 2 },
            0,
            None,
            999,
        ));
        assert_eq!(con.events[0].id, 0);
        assert_eq!(con.events[1].id, 1);
        assert_eq!(con.events_count, 2);
    }

    #[test]
    fn byte_counters_are_monotonic_across_partial_failures() {
        let mut con = Connection::new(0, None);
        con.credit_sent(100);
        con.credit_sent(50);
        assert_eq!(con.bytes_sent, 150);
        con.credit_received(30);
        assert_eq!(con.bytes_received, 30);
    }

    #[test]
    fn tcp_info_sample_updates_cursors_and_rtt() {
        let mut con = Connection::new(0, None);
        con.credit_sent(600);
        con.record_tcp_info_sample(12_345, 1_000_000);
        assert_eq!(con.last_info_dump_bytes, 600);
        assert_eq!(con.last_info_dump_micros, 1_000_000);
        assert_eq!(con.rtt, 12_345);
    }
}
