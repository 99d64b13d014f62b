use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Running counters of one sluice
#[derive(Debug, Default)]
pub struct SluiceStats {
    raw_received: AtomicU64,
    records_received: AtomicU64,
    reconnects: AtomicU64,
    parse_failures: AtomicU64,
    decode_failures: AtomicU64,
}

impl SluiceStats {
    pub fn add_raw(&self, bytes: usize) {
        self.raw_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_records(&self, records: usize) {
        self.records_received
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn add_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_parse_failure(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            raw_received: self.raw_received.load(Ordering::Relaxed),
            records_received: self.records_received.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SluiceStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Bytes read off the wire
    pub raw_received: u64,
    pub records_received: u64,
    pub reconnects: u64,
    pub parse_failures: u64,
    pub decode_failures: u64,
}

/// Render one row per sluice as a fixed-width table
pub fn format_report<'a>(rows: impl IntoIterator<Item = (&'a str, StatsSnapshot)>) -> String {
    let rows: Vec<_> = rows.into_iter().collect();
    let url_width = rows
        .iter()
        .map(|(url, _)| url.len())
        .max()
        .unwrap_or(0)
        .max("url".len());

    let mut out = format!(
        "{:<url_width$}  {:>12}  {:>16}  {:>10}  {:>14}  {:>15}\n",
        "url",
        "raw_received",
        "records_received",
        "reconnects",
        "parse_failures",
        "decode_failures",
    );
    for (url, stats) in rows {
        let _ = writeln!(
            out,
            "{:<url_width$}  {:>12}  {:>16}  {:>10}  {:>14}  {:>15}",
            url,
            stats.raw_received,
            stats.records_received,
            stats.reconnects,
            stats.parse_failures,
            stats.decode_failures,
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = SluiceStats::default();
        stats.add_raw(100);
        stats.add_raw(23);
        stats.add_records(3);
        stats.add_reconnect();
        stats.add_parse_failure();
        stats.add_decode_failure();
        stats.add_decode_failure();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                raw_received: 123,
                records_received: 3,
                reconnects: 1,
                parse_failures: 1,
                decode_failures: 2,
            }
        );
    }

    #[test]
    fn test_report_has_header_and_rows() {
        let stats = StatsSnapshot {
            records_received: 42,
            ..Default::default()
        };
        let report = format_report([("http://oak:8080/logs/a", stats)]);
        let lines: Vec<&str> = report.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("url"));
        assert!(lines[0].ends_with("decode_failures"));
        assert!(lines[1].starts_with("http://oak:8080/logs/a"));
        assert!(lines[1].contains("42"));
    }
}
