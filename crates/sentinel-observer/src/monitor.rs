//! Per-container monitoring: one log pump and one metrics sampler.
//!
//! The pump and the sampler live in a single task (so cancelling the monitor
//! cancels both) and the monitor only ends when the container is gone or the
//! log stream fails hard. A container that merely stops keeps its sampler:
//! samples with a non-running status are part of the story the dashboard
//! tells.

use crate::buffer::LogBuffer;
use crate::docker::{ContainerInfo, DockerError};
use crate::metrics::{parse_stats, round2, RateTracker};
use crate::ObserverInner;
use futures::StreamExt;
use sentinel_types::{ContainerState, ContainerStats, IncidentContext, LogEntry, SentinelEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Metrics sampling cadence.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// How many recent lines each anomaly check sees.
const RECENT_LOGS_COUNT: usize = 200;

/// Drives the N-lines-or-T-seconds anomaly check schedule for one log pump.
pub(crate) struct CheckTrigger {
    lines_per_check: usize,
    interval: Duration,
    lines_since_check: usize,
    last_check: Instant,
}

impl CheckTrigger {
    pub(crate) fn new(lines_per_check: usize, interval: Duration, now: Instant) -> Self {
        Self {
            lines_per_check: lines_per_check.max(1),
            interval,
            lines_since_check: 0,
            last_check: now,
        }
    }

    /// Record one ingested line; true when a check should fire now.
    pub(crate) fn on_line(&mut self, now: Instant) -> bool {
        self.lines_since_check += 1;
        if self.lines_since_check >= self.lines_per_check
            || now.duration_since(self.last_check) >= self.interval
        {
            self.lines_since_check = 0;
            self.last_check = now;
            true
        } else {
            false
        }
    }
}

/// Run both halves of a container monitor until the container disappears
/// (`Ok`) or the log stream fails hard (`Err`, caller restarts).
pub(crate) async fn run_monitor(
    inner: &Arc<ObserverInner>,
    info: &ContainerInfo,
) -> Result<(), DockerError> {
    let buffer = inner.state.buffer_for(&info.name);

    let mut log_fut = std::pin::pin!(log_pump(inner, info, &buffer));
    let mut sampler_fut = std::pin::pin!(stats_sampler(inner, info));

    tokio::select! {
        result = &mut sampler_fut => result,
        result = &mut log_fut => match result {
            // The log stream ending is normal for a stopped container; keep
            // sampling until the container is actually gone.
            Ok(()) => {
                debug!(service = %info.service, "log stream ended, sampler continues");
                sampler_fut.await
            }
            Err(err) => Err(err),
        },
    }
}

async fn log_pump(
    inner: &Arc<ObserverInner>,
    info: &ContainerInfo,
    buffer: &Arc<LogBuffer>,
) -> Result<(), DockerError> {
    let mut stream = inner.docker.log_stream(&info.id);
    let mut trigger = CheckTrigger::new(
        inner.settings.log_lines_per_check,
        inner.settings.log_check_interval,
        Instant::now(),
    );

    info!(service = %info.service, "streaming container logs");

    while let Some(item) = stream.next().await {
        let text = item?;
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            let timestamp = sentinel_types::utc_now();
            buffer.push(LogEntry {
                timestamp: timestamp.clone(),
                line: line.to_string(),
            });
            inner
                .bus
                .publish(SentinelEvent::Log {
                    container: info.service.clone(),
                    timestamp,
                    message: line.to_string(),
                })
                .await;

            if trigger.on_line(Instant::now()) {
                check_for_anomalies(inner, info, buffer).await;
            }
        }
    }

    Ok(())
}

/// Classify the recent buffer; escalate qualifying verdicts with full
/// context. Awaited inline from the pump, so a container in active incident
/// handling is not re-checked concurrently with itself.
async fn check_for_anomalies(
    inner: &Arc<ObserverInner>,
    info: &ContainerInfo,
    buffer: &Arc<LogBuffer>,
) {
    let recent = buffer.tail(RECENT_LOGS_COUNT);
    let chunk: String = recent
        .iter()
        .map(|entry| entry.line.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if chunk.trim().is_empty() {
        return;
    }

    // Fresh runtime facts make the classifier meaningfully better at
    // separating crash loops from transient noise.
    let fresh = inner.docker.inspect(&info.id).await.ok();
    let context = fresh.as_ref().map(|details| {
        serde_json::json!({
            "status": details.status,
            "health": details.health,
            "restarts": details.restarts,
            "exit_code": details.exit_code,
        })
    });

    let verdict = inner
        .detector
        .detect_anomaly(&chunk, &info.service, context.as_ref())
        .await;

    if !verdict.should_escalate() {
        return;
    }

    warn!(
        service = %info.service,
        severity = %verdict.severity,
        "critical anomaly detected, escalating"
    );

    let details = match fresh {
        Some(details) => details,
        None => match inner.docker.inspect(&info.id).await {
            Ok(details) => details,
            Err(err) => {
                error!(service = %info.service, error = %err, "cannot gather incident context");
                return;
            }
        },
    };

    let context = IncidentContext {
        container_id: details.id.clone(),
        container_name: details.name.clone(),
        service: info.service.clone(),
        all_logs: buffer.joined(),
        environment: details.env.clone(),
        stats: ContainerStats {
            status: details.status.clone(),
            restarts: details.restarts,
            created: details.created.clone(),
            exit_code: details.exit_code,
        },
    };

    inner.sink.handle_anomaly(context, verdict).await;
}

async fn stats_sampler(
    inner: &Arc<ObserverInner>,
    info: &ContainerInfo,
) -> Result<(), DockerError> {
    let mut tracker = RateTracker::new();

    loop {
        match inner.docker.stats_once(&info.id).await {
            Ok(raw) => {
                let totals = parse_stats(&raw);

                let (status, restarts) = match inner.docker.inspect(&info.id).await {
                    Ok(fresh) => (fresh.status, fresh.restarts),
                    Err(DockerError::NotFound) => {
                        publish_offline(inner, info).await;
                        return Ok(());
                    }
                    Err(err) => {
                        warn!(service = %info.service, error = %err, "failed to refresh container");
                        ("unknown".to_string(), None)
                    }
                };

                let rates = tracker.update(totals, Instant::now());
                let sample = ContainerState {
                    id: info.id.clone(),
                    name: info.name.clone(),
                    service: info.service.clone(),
                    status,
                    restarts,
                    cpu: round2(totals.cpu_percent),
                    memory: round2(totals.memory_percent),
                    network_rx: round2(rates.network_rx),
                    network_tx: round2(rates.network_tx),
                    disk_read: round2(rates.disk_read),
                    disk_write: round2(rates.disk_write),
                    timestamp: sentinel_types::utc_now(),
                };

                inner.state.upsert_container(sample.clone());
                inner
                    .bus
                    .publish(SentinelEvent::ContainerUpdate { container: sample })
                    .await;
            }
            Err(DockerError::NotFound) => {
                publish_offline(inner, info).await;
                return Ok(());
            }
            Err(err) => {
                warn!(service = %info.service, error = %err, "error fetching stats");
            }
        }

        tokio::time::sleep(STATS_INTERVAL).await;
    }
}

/// Terminal sample for a container the runtime no longer knows about.
async fn publish_offline(inner: &Arc<ObserverInner>, info: &ContainerInfo) {
    info!(service = %info.service, "container disappeared, ending monitor");
    let sample = ContainerState::placeholder(
        info.id.clone(),
        info.name.clone(),
        info.service.clone(),
        "offline",
        None,
        sentinel_types::utc_now(),
    );
    inner.state.upsert_container(sample.clone());
    inner
        .bus
        .publish(SentinelEvent::ContainerUpdate { container: sample })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_fires_every_n_lines_when_fast() {
        let t0 = Instant::now();
        let mut trigger = CheckTrigger::new(3, Duration::from_secs(5), t0);
        // Lines arrive instantly: only the line count can fire the check.
        assert!(!trigger.on_line(t0));
        assert!(!trigger.on_line(t0));
        assert!(trigger.on_line(t0));
        // Counter reset: the next burst needs three lines again.
        assert!(!trigger.on_line(t0));
        assert!(!trigger.on_line(t0));
        assert!(trigger.on_line(t0));
    }

    #[test]
    fn test_trigger_fires_on_interval_when_slow() {
        let t0 = Instant::now();
        let mut trigger = CheckTrigger::new(100, Duration::from_secs(5), t0);
        assert!(!trigger.on_line(t0 + Duration::from_secs(1)));
        assert!(!trigger.on_line(t0 + Duration::from_secs(4)));
        // Five seconds since the last check: fires despite the line count.
        assert!(trigger.on_line(t0 + Duration::from_secs(5)));
        // Interval clock restarts from the check that just fired.
        assert!(!trigger.on_line(t0 + Duration::from_secs(6)));
        assert!(trigger.on_line(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_trigger_line_count_floor_is_one() {
        let t0 = Instant::now();
        let mut trigger = CheckTrigger::new(0, Duration::from_secs(5), t0);
        assert!(trigger.on_line(t0));
    }
}
