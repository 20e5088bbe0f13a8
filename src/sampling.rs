// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decides when to sample kernel `TCP_INFO` and when to flush JSON
//! (spec §4.6).

use crate::config::Configuration;
use crate::connection::Connection;

/// True iff both configured lower bounds pass. A zero threshold means "no
/// lower bound", i.e. that axis is ignored (spec §4.6, §8 boundary case).
pub fn should_sample_tcp_info(connection: &Connection, config: &Configuration, now_micros: i64) -> bool {
    if config.tcp_info_time_threshold_us > 0 {
        let elapsed = now_micros - connection.last_info_dump_micros;
        if elapsed < config.tcp_info_time_threshold_us {
            return false;
        }
    }
    if config.bytes_threshold > 0 {
        let elapsed_bytes =
            (connection.bytes_sent + connection.bytes_received) as i64 - connection.last_info_dump_bytes as i64;
        if elapsed_bytes < config.bytes_threshold {
            return false;
        }
    }
    true
}

pub fn should_flush_json(connection: &Connection, config: &Configuration) -> bool {
    connection.events_count - connection.last_json_dump_evcount >= config.json_flush_every_events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    fn config_with(bytes_threshold: i64, time_threshold_us: i64, flush_every: u64) -> Configuration {
        let mut config = Configuration::default_for_tests();
        config.bytes_threshold = bytes_threshold;
        config.tcp_info_time_threshold_us = time_threshold_us;
        config.json_flush_every_events = flush_every;
        config
    }

    #[test]
    fn zero_thresholds_sample_on_every_event() {
        let config = config_with(0, 0, 1000);
        let con = Connection::new(0, None);
        assert!(should_sample_tcp_info(&con, &config, 123));
    }

    #[test]
    fn bytes_threshold_blocks_until_enough_bytes_transferred() {
        let config = config_with(1000, 0, 1000);
        let mut con = Connection::new(0, None);
        con.credit_sent(600);
        assert!(!should_sample_tcp_info(&con, &config, 0));
        con.credit_sent(600);
        assert!(should_sample_tcp_info(&con, &config, 0));
    }

    #[test]
    fn time_threshold_blocks_until_enough_time_elapsed() {
        let config = config_with(0, 5_000, 1000);
        let mut con = Connection::new(0, None);
        con.last_info_dump_micros = 10_000;
        assert!(!should_sample_tcp_info(&con, &config, 12_000));
        assert!(should_sample_tcp_info(&con, &config, 16_000));
    }

    #[test]
    fn flush_every_one_event_triggers_every_time() {
        let config = config_with(0, 0, 1);
        let mut con = Connection::new(0, None);
        con.append(crate::event::make_event(
            crate::event::EventPayload::Listen { backlog: 1 },
            0,
            None,
            0,
        ));
        assert!(should_flush_json(&con, &config));
    }

    #[test]
    fn flush_boundary_exact_count() {
        let config = config_with(0, 0, 2);
        let mut con = Connection::new(0, None);
        con.append(crate::event::make_event(
            crate::event::EventPayload::Listen { backlog: 1 },
            0,
            None,
            0,
        ));
        assert!(!should_flush_json(&con, &config));
        con.append(crate::event::make_event(
            crate::event::EventPayload::Listen { backlog: 1 },
            0,
            None,
            0,
        ));
        assert!(should_flush_json(&con, &config));
    }
}
