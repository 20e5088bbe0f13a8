// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Incremental JSON sink: each connection's directory holds a single file
//! whose closed form is a top-level JSON array of event objects, built up
//! by successive append-mode writes (spec §4.4).

use crate::connection::Connection;
use crate::error::JsonSinkError;
use std::fs::OpenOptions;
use std::io::Write;

pub const EVENTS_FILE_NAME: &str = "events.json";

/// Drains `connection`'s buffered events into its `events.json`, appending.
///
/// Resolves spec Open Question O1 in favor of "drop": the in-memory buffer
/// is always released up front, before any I/O is attempted, so a
/// persistent write failure cannot grow the buffer without bound. This
/// matches the observed behavior of the original implementation, made
/// explicit rather than left as an accident of control flow.
///
/// `final_flush` must be true exactly once per connection, at close (spec
/// §4.4); passing it more than once would emit more than one closing `]`
/// and is a caller bug, not something this function guards against.
pub fn flush(connection: &mut Connection, final_flush: bool) -> Result<(), JsonSinkError> {
    let drained: Vec<_> = connection.events.drain(..).collect();
    let total = connection.events_count;
    connection.last_json_dump_evcount = total;

    let dir = connection
        .directory
        .as_ref()
        .ok_or(JsonSinkError::NoDirectory)?;
    let path = dir.join(EVENTS_FILE_NAME);
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    for event in drained {
        if event.id == 0 {
            file.write_all(b"[\n")?;
        }
        let json = serde_json::to_string(&event)?;
        file.write_all(json.as_bytes())?;
        if final_flush && event.id + 1 == total {
            file.write_all(b"\n")?;
        } else {
            file.write_all(b",\n")?;
        }
    }

    if final_flush {
        file.write_all(b"]")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{make_event, EventPayload};
    use std::fs;

    fn read_events_file(connection: &Connection) -> String {
        let path = connection.directory.as_ref().unwrap().join(EVENTS_FILE_NAME);
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn socket_then_close_yields_two_element_array() {
        let tmp = tempfile::tempdir().unwrap();
        let mut con = Connection::new(0, Some(tmp.path().to_path_buf()));
        con.append(make_event(
            EventPayload::Socket {
                domain: libc::AF_INET,
                sock_type: libc::SOCK_STREAM,
                protocol: 0,
                sock_cloexec: false,
                sock_nonblock: false,
            },
            7,
            None,
            999,
        ));
        con.append(make_event(EventPayload::Close { detected: false }, 0, None, 999));

        flush(&mut con, true).unwrap();

        let contents = read_events_file(&con);
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        let array = value.as_array().unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(array[0]["kind"], "socket");
        assert_eq!(array[1]["kind"], "close");
    }

    #[test]
    fn non_final_flush_leaves_file_without_closing_bracket() {
        let tmp = tempfile::tempdir().unwrap();
        let mut con = Connection::new(0, Some(tmp.path().to_path_buf()));
        con.append(make_event(
            EventPayload::Socket {
                domain: libc::AF_INET,
                sock_type: libc::SOCK_STREAM,
                protocol: 0,
                sock_cloexec: false,
                sock_nonblock: false,
            },
            7,
            None,
            999,
        ));
        con.append(make_event(
            EventPayload::Bind {
                address: crate::event::Address::from_raw(
                    "127.0.0.1:80".parse().unwrap(),
                ),
                force_bind: false,
            },
            0,
            None,
            999,
        ));
        flush(&mut con, false).unwrap();

        let contents = read_events_file(&con);
        assert!(contents.starts_with("[\n"));
        assert!(!contents.trim_end().ends_with(']'));
        assert!(serde_json::from_str::<serde_json::Value>(&contents).is_err());

        con.append(make_event(
            EventPayload::Connect {
                address: crate::event::Address::from_raw(
                    "127.0.0.1:80".parse().unwrap(),
                ),
            },
            0,
            None,
            999,
        ));
        con.append(make_event(EventPayload::Close { detected: false }, 0, None, 999));
        flush(&mut con, true).unwrap();

        let contents = read_events_file(&con);
        let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 4);
    }

    #[test]
    fn flush_drains_buffer_even_when_directory_missing() {
        let mut con = Connection::new(0, None);
        con.append(make_event(EventPayload::Listen { backlog: 1 }, 0, None, 999));
        let err = flush(&mut con, true).unwrap_err();
        assert!(matches!(err, JsonSinkError::NoDirectory));
        assert!(con.events.is_empty());
        assert_eq!(con.last_json_dump_evcount, 1);
    }

    #[test]
    fn buffered_events_are_exactly_unflushed_range() {
        let tmp = tempfile::tempdir().unwrap();
        let mut con = Connection::new(0, Some(tmp.path().to_path_buf()));
        for _ in 0..3 {
            con.append(make_event(EventPayload::Listen { backlog: 1 }, 0, None, 999));
        }
        flush(&mut con, false).unwrap();
        assert!(con.events.is_empty());
        assert_eq!(con.last_json_dump_evcount, con.events_count);

        con.append(make_event(EventPayload::Listen { backlog: 2 }, 0, None, 999));
        assert_eq!(con.events.len(), 1);
        assert_eq!(con.events[0].id, 3);
    }
}
