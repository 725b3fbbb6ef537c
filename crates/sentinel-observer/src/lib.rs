//! Container observer: discovery, lifecycle tracking, log streaming, and
//! metrics sampling.
//!
//! Containers opt in with the `sre-sentinel.monitor=true` label. Each one
//! gets a monitor task (log pump + metrics sampler) that survives restarts,
//! publishes everything it sees on the bus, and escalates qualifying anomaly
//! verdicts through the [`AnomalySink`] handed in at construction. The
//! observer never fails the process: a dead monitor is logged and restarted,
//! and the runtime event stream reconnects with bounded backoff.

mod buffer;
mod docker;
mod metrics;
mod monitor;

pub use buffer::{LogBuffer, DEFAULT_LOG_BUFFER_CAPACITY};
pub use docker::{ContainerInfo, DockerClient, DockerError, MONITOR_LABEL, SERVICE_LABEL};

use async_trait::async_trait;
use futures::StreamExt;
use sentinel_ai::AnomalyDetector;
use sentinel_bus::EventBus;
use sentinel_config::ObserverSettings;
use sentinel_types::{AnomalyVerdict, ContainerState, IncidentContext, SentinelEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Backoff after a runtime-level error on the event stream.
const EVENT_ERROR_DELAY: Duration = Duration::from_secs(5);
/// Backoff after the event stream ends unexpectedly.
const EVENT_RESTART_DELAY: Duration = Duration::from_secs(10);
/// Pause before restarting a monitor that died with an error.
const MONITOR_RESTART_DELAY: Duration = Duration::from_secs(10);

/// Where qualifying anomalies go. The incident pipeline implements this in
/// the binary; the observer never needs to know what happens downstream.
#[async_trait]
pub trait AnomalySink: Send + Sync {
    async fn handle_anomaly(&self, context: IncidentContext, verdict: AnomalyVerdict);
}

/// Shared observer state: the latest sample per container and the bounded
/// log buffer per container name. Readers get snapshot copies.
pub struct ObserverState {
    containers: RwLock<HashMap<String, ContainerState>>,
    buffers: RwLock<HashMap<String, Arc<LogBuffer>>>,
}

impl ObserverState {
    fn new() -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Current samples, ordered by service name for stable output.
    pub fn snapshot_containers(&self) -> Vec<ContainerState> {
        let containers = self.containers.read().expect("container map poisoned");
        let mut snapshot: Vec<ContainerState> = containers.values().cloned().collect();
        snapshot.sort_by(|a, b| a.service.cmp(&b.service).then_with(|| a.id.cmp(&b.id)));
        snapshot
    }

    pub(crate) fn buffer_for(&self, name: &str) -> Arc<LogBuffer> {
        if let Some(buffer) = self.buffers.read().expect("buffer map poisoned").get(name) {
            return Arc::clone(buffer);
        }
        let mut buffers = self.buffers.write().expect("buffer map poisoned");
        Arc::clone(buffers.entry(name.to_string()).or_default())
    }

    pub(crate) fn upsert_container(&self, sample: ContainerState) {
        self.containers
            .write()
            .expect("container map poisoned")
            .insert(sample.id.clone(), sample);
    }

    fn remove_container(&self, id: &str) -> Option<ContainerState> {
        self.containers
            .write()
            .expect("container map poisoned")
            .remove(id)
    }

    fn drop_buffer(&self, name: &str) {
        self.buffers
            .write()
            .expect("buffer map poisoned")
            .remove(name);
    }
}

pub(crate) struct ObserverInner {
    pub(crate) docker: DockerClient,
    pub(crate) bus: Arc<dyn EventBus>,
    pub(crate) detector: AnomalyDetector,
    pub(crate) sink: Arc<dyn AnomalySink>,
    pub(crate) settings: ObserverSettings,
    pub(crate) state: Arc<ObserverState>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// The observer itself. `run` drives discovery and the runtime event loop
/// until cancelled.
pub struct Observer {
    inner: Arc<ObserverInner>,
}

impl Observer {
    pub fn new(
        docker: DockerClient,
        bus: Arc<dyn EventBus>,
        detector: AnomalyDetector,
        sink: Arc<dyn AnomalySink>,
        settings: ObserverSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                docker,
                bus,
                detector,
                sink,
                settings,
                state: Arc::new(ObserverState::new()),
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Handle for snapshot readers (the telemetry surface).
    pub fn state(&self) -> Arc<ObserverState> {
        Arc::clone(&self.inner.state)
    }

    /// Discover labeled containers, then follow runtime events forever.
    /// Reconnects on stream failure; returns only on cancellation.
    pub async fn run(&self) {
        match self.inner.docker.monitored_container_ids().await {
            Ok(ids) if ids.is_empty() => {
                info!(
                    label = MONITOR_LABEL,
                    "no labeled containers found, waiting for events"
                );
            }
            Ok(ids) => {
                info!(count = ids.len(), "found existing containers to monitor");
                for id in ids {
                    self.start_monitoring(&id).await;
                }
            }
            Err(err) => {
                error!(error = %err, "failed to list containers at startup");
            }
        }

        loop {
            info!("connecting to container event stream");
            let mut stream = self.inner.docker.event_stream();

            loop {
                match stream.next().await {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(err)) => {
                        error!(error = %err, "container event stream error, reconnecting");
                        tokio::time::sleep(EVENT_ERROR_DELAY).await;
                        break;
                    }
                    None => {
                        warn!("container event stream ended, reconnecting");
                        tokio::time::sleep(EVENT_RESTART_DELAY).await;
                        break;
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: bollard::models::EventMessage) {
        let action = event.action.clone().unwrap_or_default();
        let Some(id) = event.actor.and_then(|actor| actor.id) else {
            return;
        };

        match action.as_str() {
            "start" => self.start_monitoring(&id).await,
            "stop" | "die" | "kill" | "pause" => {
                debug!(container = %docker::short_id(&id), action = %action, "container lifecycle event");
                self.reap_finished();
            }
            "destroy" => self.stop_monitoring(&id),
            "restart" => {
                info!(container = %docker::short_id(&id), "container restarted");
                self.start_monitoring(&id).await;
            }
            _ => {}
        }
    }

    /// Begin monitoring a container unless a live monitor already exists.
    async fn start_monitoring(&self, id: &str) {
        {
            let tasks = self.inner.tasks.lock().expect("task map poisoned");
            if tasks.get(id).is_some_and(|task| !task.is_finished()) {
                return;
            }
        }

        let info = match self.inner.docker.inspect(id).await {
            Ok(info) => info,
            Err(DockerError::NotFound) => {
                warn!(container = %docker::short_id(id), "container already removed");
                return;
            }
            Err(err) => {
                error!(container = %docker::short_id(id), error = %err, "failed to inspect container");
                return;
            }
        };

        info!(service = %info.service, container = %docker::short_id(id), "starting monitoring");

        let inner = Arc::clone(&self.inner);
        let task_id = id.to_string();
        let handle = tokio::spawn(async move {
            supervise_monitor(inner, task_id).await;
        });

        self.inner
            .tasks
            .lock()
            .expect("task map poisoned")
            .insert(id.to_string(), handle);
    }

    /// Cancel a container's monitor and drop its state.
    fn stop_monitoring(&self, id: &str) {
        if let Some(task) = self
            .inner
            .tasks
            .lock()
            .expect("task map poisoned")
            .remove(id)
        {
            task.abort();
            info!(container = %docker::short_id(id), "container destroyed, stopped monitoring");
        }
        if let Some(removed) = self.inner.state.remove_container(id) {
            self.inner.state.drop_buffer(&removed.name);
        }
    }

    fn reap_finished(&self) {
        self.inner
            .tasks
            .lock()
            .expect("task map poisoned")
            .retain(|_, task| !task.is_finished());
    }
}

/// Keep one container's monitor alive: publish its initial state, run the
/// monitor, and restart it after failures until the container disappears.
async fn supervise_monitor(inner: Arc<ObserverInner>, id: String) {
    loop {
        let info = match inner.docker.inspect(&id).await {
            Ok(info) => info,
            Err(DockerError::NotFound) => {
                debug!(container = %docker::short_id(&id), "container no longer exists");
                break;
            }
            Err(err) => {
                error!(container = %docker::short_id(&id), error = %err, "inspect failed, retrying");
                tokio::time::sleep(MONITOR_RESTART_DELAY).await;
                continue;
            }
        };

        publish_initial_state(&inner, &info).await;

        match monitor::run_monitor(&inner, &info).await {
            Ok(()) => break,
            Err(err) => {
                error!(
                    service = %info.service,
                    error = %err,
                    delay_secs = MONITOR_RESTART_DELAY.as_secs(),
                    "monitor failed, restarting"
                );
                tokio::time::sleep(MONITOR_RESTART_DELAY).await;
            }
        }
    }

    inner.state.remove_container(&id);
}

/// First `container_update` for a fresh monitor: zero metrics, live status.
async fn publish_initial_state(inner: &Arc<ObserverInner>, info: &ContainerInfo) {
    let sample = ContainerState::placeholder(
        info.id.clone(),
        info.name.clone(),
        info.service.clone(),
        info.status.clone(),
        info.restarts,
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

    fn sample(id: &str, service: &str) -> ContainerState {
        ContainerState::placeholder(
            id,
            format!("{service}-1"),
            service,
            "running",
            Some(0),
            sentinel_types::utc_now(),
        )
    }

    #[test]
    fn test_snapshot_is_sorted_and_copied() {
        let state = ObserverState::new();
        state.upsert_container(sample("bbb", "web"));
        state.upsert_container(sample("aaa", "api"));

        let snapshot = state.snapshot_containers();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].service, "api");
        assert_eq!(snapshot[1].service, "web");

        // Mutating after the snapshot does not affect the copy.
        state.remove_container("aaa");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(state.snapshot_containers().len(), 1);
    }

    #[test]
    fn test_buffer_for_reuses_instances() {
        let state = ObserverState::new();
        let first = state.buffer_for("api-1");
        first.push(sentinel_types::LogEntry {
            timestamp: sentinel_types::utc_now(),
            line: "hello".into(),
        });
        let second = state.buffer_for("api-1");
        assert_eq!(second.len(), 1);

        state.drop_buffer("api-1");
        let third = state.buffer_for("api-1");
        assert!(third.is_empty());
    }

    #[test]
    fn test_upsert_replaces_by_container_id() {
        let state = ObserverState::new();
        state.upsert_container(sample("aaa", "api"));
        let mut updated = sample("aaa", "api");
        updated.status = "exited".into();
        state.upsert_container(updated);

        let snapshot = state.snapshot_containers();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, "exited");
    }
}
