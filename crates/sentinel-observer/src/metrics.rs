//! Derivation of usable metrics from raw runtime stats.
//!
//! CPU and memory become percentages; network and disk counters are
//! cumulative, so per-sample rates come from deltas against the previous
//! sample. A counter reset (container restart) makes a delta negative for
//! one sample; that negative rate is emitted as-is so the discontinuity is
//! visible downstream.

use bollard::models::ContainerStatsResponse;
use std::time::Instant;

/// Point-in-time totals extracted from one stats snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsTotals {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub network_rx: f64,
    pub network_tx: f64,
    pub disk_read: f64,
    pub disk_write: f64,
}

/// Bytes/second rates derived from two consecutive samples.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rates {
    pub network_rx: f64,
    pub network_tx: f64,
    pub disk_read: f64,
    pub disk_write: f64,
}

/// Reduce a raw stats response to totals. Absent fields read as zero; a
/// zero system-CPU delta yields 0% rather than NaN.
pub fn parse_stats(stats: &ContainerStatsResponse) -> StatsTotals {
    let mut totals = StatsTotals::default();

    let cpu_usage = stats.cpu_stats.as_ref().and_then(|s| s.cpu_usage.as_ref());
    let precpu_usage = stats.precpu_stats.as_ref().and_then(|s| s.cpu_usage.as_ref());

    let total_usage = cpu_usage.and_then(|u| u.total_usage).unwrap_or(0);
    let prev_usage = precpu_usage.and_then(|u| u.total_usage).unwrap_or(0);
    let cpu_delta = total_usage as f64 - prev_usage as f64;

    let system_current = stats
        .cpu_stats
        .as_ref()
        .and_then(|s| s.system_cpu_usage)
        .unwrap_or(0);
    let system_prev = stats
        .precpu_stats
        .as_ref()
        .and_then(|s| s.system_cpu_usage)
        .unwrap_or(0);
    let system_delta = system_current as f64 - system_prev as f64;

    let cores = cpu_usage
        .and_then(|u| u.percpu_usage.as_ref().map(Vec::len))
        .filter(|&len| len > 0)
        .map(|len| len as f64)
        .or_else(|| {
            stats
                .cpu_stats
                .as_ref()
                .and_then(|s| s.online_cpus)
                .map(f64::from)
        })
        .unwrap_or(0.0);

    if system_delta > 0.0 && cpu_delta >= 0.0 {
        totals.cpu_percent = (cpu_delta / system_delta) * cores * 100.0;
    }

    if let Some(memory) = stats.memory_stats.as_ref() {
        let usage = memory.usage.unwrap_or(0) as f64;
        let cache = memory
            .stats
            .as_ref()
            .and_then(|s| s.get("cache"))
            .copied()
            .unwrap_or(0) as f64;
        let limit = memory.limit.unwrap_or(0) as f64;
        if limit > 0.0 {
            totals.memory_percent = ((usage - cache) / limit) * 100.0;
        }
    }

    if let Some(networks) = stats.networks.as_ref() {
        for interface in networks.values() {
            totals.network_rx += interface.rx_bytes.unwrap_or(0) as f64;
            totals.network_tx += interface.tx_bytes.unwrap_or(0) as f64;
        }
    }

    if let Some(blkio) = stats.blkio_stats.as_ref() {
        if let Some(entries) = blkio.io_service_bytes_recursive.as_ref() {
            for entry in entries {
                let value = entry.value.unwrap_or(0) as f64;
                match entry.op.as_deref().map(str::to_ascii_lowercase).as_deref() {
                    Some("read") => totals.disk_read += value,
                    Some("write") => totals.disk_write += value,
                    _ => {}
                }
            }
        }
    }

    totals
}

/// Previous-sample cache for one container's sampler.
#[derive(Debug, Default)]
pub struct RateTracker {
    previous: Option<(StatsTotals, Instant)>,
}

impl RateTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rates since the previous sample; zero on the first sample or when no
    /// wall-clock time has passed.
    pub fn update(&mut self, totals: StatsTotals, now: Instant) -> Rates {
        let rates = match self.previous {
            Some((prev, at)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    Rates {
                        network_rx: (totals.network_rx - prev.network_rx) / elapsed,
                        network_tx: (totals.network_tx - prev.network_tx) / elapsed,
                        disk_read: (totals.disk_read - prev.disk_read) / elapsed,
                        disk_write: (totals.disk_write - prev.disk_write) / elapsed,
                    }
                } else {
                    Rates::default()
                }
            }
            None => Rates::default(),
        };
        self.previous = Some((totals, now));
        rates
    }
}

/// Round to two decimals for the wire, matching the dashboard's precision.
#[must_use]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn stats_from_json(value: serde_json::Value) -> ContainerStatsResponse {
        serde_json::from_value(value).expect("valid stats payload")
    }

    #[test]
    fn test_cpu_percent_from_deltas() {
        let stats = stats_from_json(serde_json::json!({
            "cpu_stats": {
                "cpu_usage": {"total_usage": 400_000_000u64, "percpu_usage": [1u64, 2, 3, 4]},
                "system_cpu_usage": 2_000_000_000u64
            },
            "precpu_stats": {
                "cpu_usage": {"total_usage": 200_000_000u64},
                "system_cpu_usage": 1_000_000_000u64
            }
        }));
        let totals = parse_stats(&stats);
        // (0.2e9 / 1e9) * 4 cores * 100
        assert!((totals.cpu_percent - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_system_delta_yields_zero_not_nan() {
        let stats = stats_from_json(serde_json::json!({
            "cpu_stats": {
                "cpu_usage": {"total_usage": 400u64, "percpu_usage": [1u64, 2]},
                "system_cpu_usage": 1_000u64
            },
            "precpu_stats": {
                "cpu_usage": {"total_usage": 200u64},
                "system_cpu_usage": 1_000u64
            }
        }));
        let totals = parse_stats(&stats);
        assert_eq!(totals.cpu_percent, 0.0);
        assert!(totals.cpu_percent.is_finite());
    }

    #[test]
    fn test_memory_percent_subtracts_cache() {
        let stats = stats_from_json(serde_json::json!({
            "memory_stats": {
                "usage": 600u64,
                "limit": 1000u64,
                "stats": {"cache": 100u64}
            }
        }));
        let totals = parse_stats(&stats);
        assert!((totals.memory_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_network_and_disk_totals_sum_across_sources() {
        let stats = stats_from_json(serde_json::json!({
            "networks": {
                "eth0": {"rx_bytes": 1000u64, "tx_bytes": 500u64},
                "eth1": {"rx_bytes": 200u64, "tx_bytes": 100u64}
            },
            "blkio_stats": {
                "io_service_bytes_recursive": [
                    {"major": 8u64, "minor": 0u64, "op": "Read", "value": 4096u64},
                    {"major": 8u64, "minor": 0u64, "op": "Write", "value": 1024u64},
                    {"major": 8u64, "minor": 0u64, "op": "Sync", "value": 9999u64}
                ]
            }
        }));
        let totals = parse_stats(&stats);
        assert_eq!(totals.network_rx, 1200.0);
        assert_eq!(totals.network_tx, 600.0);
        assert_eq!(totals.disk_read, 4096.0);
        assert_eq!(totals.disk_write, 1024.0);
    }

    #[test]
    fn test_rates_are_deltas_over_wall_clock() {
        let mut tracker = RateTracker::new();
        let t0 = Instant::now();

        let first = tracker.update(
            StatsTotals {
                network_rx: 1000.0,
                ..StatsTotals::default()
            },
            t0,
        );
        assert_eq!(first, Rates::default());

        let second = tracker.update(
            StatsTotals {
                network_rx: 3000.0,
                ..StatsTotals::default()
            },
            t0 + Duration::from_secs(2),
        );
        assert!((second.network_rx - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn test_counter_reset_produces_negative_rate() {
        let mut tracker = RateTracker::new();
        let t0 = Instant::now();
        tracker.update(
            StatsTotals {
                network_rx: 10_000.0,
                disk_write: 5_000.0,
                ..StatsTotals::default()
            },
            t0,
        );
        let rates = tracker.update(
            StatsTotals {
                network_rx: 100.0,
                disk_write: 50.0,
                ..StatsTotals::default()
            },
            t0 + Duration::from_secs(5),
        );
        // The counters went backwards; the rate must reflect that rather
        // than being clamped to zero.
        assert!(rates.network_rx < 0.0);
        assert!(rates.disk_write < 0.0);
    }

    #[test]
    fn test_round2() {
        assert!((round2(12.345_678) - 12.35).abs() < 1e-9);
        assert!((round2(-3.141_5) - (-3.14)).abs() < 1e-9);
    }
}
