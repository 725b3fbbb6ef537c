//! All bollard calls live here, behind one small client.
//!
//! The rest of the crate deals in [`ContainerInfo`] snapshots and plain
//! streams; if the runtime API shifts, this is the only file that notices.

use bollard::models::{ContainerStatsResponse, EventMessage};
use bollard::query_parameters::{
    EventsOptionsBuilder, ListContainersOptionsBuilder, LogsOptionsBuilder, StatsOptionsBuilder,
};
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use thiserror::Error;

/// Containers opt into monitoring with this label.
pub const MONITOR_LABEL: &str = "sre-sentinel.monitor=true";

/// Optional label overriding the displayed service name.
pub const SERVICE_LABEL: &str = "sre-sentinel.service";

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("container not found")]
    NotFound,
    #[error("docker api error: {0}")]
    Api(#[from] bollard::errors::Error),
}

impl DockerError {
    fn from_bollard(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => Self::NotFound,
            other => Self::Api(other),
        }
    }
}

/// Everything the observer wants to know about one container, extracted
/// from an inspect call.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub service: String,
    pub status: String,
    pub health: String,
    pub restarts: Option<i64>,
    pub created: String,
    pub exit_code: Option<i64>,
    pub env: HashMap<String, String>,
}

/// Thin handle over the Docker daemon. Cheap to clone.
#[derive(Clone)]
pub struct DockerClient {
    inner: Docker,
}

impl DockerClient {
    /// Connect using the platform's local daemon defaults (unix socket or
    /// named pipe).
    pub fn connect() -> Result<Self, DockerError> {
        let inner = Docker::connect_with_local_defaults().map_err(DockerError::from_bollard)?;
        Ok(Self { inner })
    }

    /// Ids of all containers carrying the monitor label.
    pub async fn monitored_container_ids(&self) -> Result<Vec<String>, DockerError> {
        let filters = HashMap::from([("label".to_string(), vec![MONITOR_LABEL.to_string()])]);
        let options = ListContainersOptionsBuilder::default()
            .filters(&filters)
            .build();
        let summaries = self
            .inner
            .list_containers(Some(options))
            .await
            .map_err(DockerError::from_bollard)?;
        Ok(summaries
            .into_iter()
            .filter_map(|summary| summary.id)
            .collect())
    }

    /// Inspect one container into a [`ContainerInfo`] snapshot.
    pub async fn inspect(&self, id: &str) -> Result<ContainerInfo, DockerError> {
        let details = self
            .inner
            .inspect_container(id, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
            .map_err(DockerError::from_bollard)?;

        let name = details
            .name
            .as_deref()
            .map(|name| name.trim_start_matches('/').to_string())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| short_id(id));

        let labels = details
            .config
            .as_ref()
            .and_then(|config| config.labels.clone())
            .unwrap_or_default();
        let service = labels
            .get(SERVICE_LABEL)
            .cloned()
            .unwrap_or_else(|| name.clone());

        let mut env = HashMap::new();
        if let Some(raw_env) = details.config.as_ref().and_then(|config| config.env.as_ref()) {
            for item in raw_env {
                if let Some((key, value)) = item.split_once('=') {
                    env.insert(key.to_string(), value.to_string());
                }
            }
        }

        let state = details.state.as_ref();
        let status = state
            .and_then(|state| state.status.as_ref())
            .map_or_else(|| "unknown".to_string(), ToString::to_string);
        let health = state
            .and_then(|state| state.health.as_ref())
            .and_then(|health| health.status.as_ref())
            .map_or_else(|| "unknown".to_string(), ToString::to_string);
        let exit_code = state.and_then(|state| state.exit_code);

        Ok(ContainerInfo {
            id: details.id.unwrap_or_else(|| id.to_string()),
            name,
            service,
            status,
            health,
            restarts: details.restart_count,
            created: details.created.unwrap_or_default(),
            exit_code,
            env,
        })
    }

    /// Live container-event stream, filtered to labeled containers.
    pub fn event_stream(&self) -> BoxStream<'static, Result<EventMessage, DockerError>> {
        let filters = HashMap::from([
            ("type".to_string(), vec!["container".to_string()]),
            ("label".to_string(), vec![MONITOR_LABEL.to_string()]),
        ]);
        let options = EventsOptionsBuilder::default().filters(&filters).build();
        self.inner
            .events(Some(options))
            .map(|item| item.map_err(DockerError::from_bollard))
            .boxed()
    }

    /// Follow a container's stdout/stderr. Replays buffered history first,
    /// which seeds the log buffer with context from before we attached.
    pub fn log_stream(&self, id: &str) -> BoxStream<'static, Result<String, DockerError>> {
        let options = LogsOptionsBuilder::default()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .build();
        self.inner
            .logs(id, Some(options))
            .map(|item| {
                item.map(|output| {
                    String::from_utf8_lossy(&output.into_bytes())
                        .trim_end()
                        .to_string()
                })
                .map_err(DockerError::from_bollard)
            })
            .boxed()
    }

    /// One stats snapshot (no streaming).
    pub async fn stats_once(&self, id: &str) -> Result<ContainerStatsResponse, DockerError> {
        let options = StatsOptionsBuilder::default()
            .stream(false)
            .one_shot(false)
            .build();
        let mut stream = self.inner.stats(id, Some(options));
        match stream.next().await {
            Some(result) => result.map_err(DockerError::from_bollard),
            None => Err(DockerError::NotFound),
        }
    }

    /// Current status string for a container, by id or name.
    pub async fn container_status(&self, id_or_name: &str) -> Result<String, DockerError> {
        Ok(self.inspect(id_or_name).await?.status)
    }
}

/// Docker-style short id for log lines.
#[must_use]
pub fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}
