//! Incident pipeline: detection hand-off through narration.
//!
//! One call to [`IncidentPipeline::handle_anomaly`] drives the whole state
//! machine: open the incident, gather and redact context, retrieve the tool
//! catalog, diagnose, preflight the gateway, execute the suggested fixes in
//! model order, verify recovery, and narrate the outcome. Every stage
//! boundary publishes an event, and an incident's status only ever moves
//! `analyzing -> resolved | unresolved`.
//!
//! Incidents for different services run concurrently; fix execution against
//! the same target is serialized through a keyed mutex.

use async_trait::async_trait;
use sentinel_ai::{redact, AnalysisRequest, AnomalyDetector, RootCauseAnalyzer};
use sentinel_bus::EventBus;
use sentinel_gateway::{McpGateway, MAX_HEALTH_WAIT};
use sentinel_types::{
    AnomalyVerdict, Incident, IncidentContext, IncidentStatus, SentinelEvent,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

/// Resolution notes used when the gateway preflight fails.
pub const GATEWAY_UNHEALTHY_NOTES: &str = "MCP Gateway health check failed";

/// Live container status check at verification time. Implemented over the
/// runtime client in the binary; the pipeline itself stays runtime-free.
#[async_trait]
pub trait ContainerProbe: Send + Sync {
    /// Current status string (`running`, `exited`, ...), or `None` when the
    /// container cannot be found.
    async fn container_status(&self, name: &str) -> Option<String>;
}

/// The incident state machine and its append-only incident log.
pub struct IncidentPipeline {
    bus: Arc<dyn EventBus>,
    detector: Arc<AnomalyDetector>,
    analyzer: RootCauseAnalyzer,
    gateway: Arc<McpGateway>,
    probe: Arc<dyn ContainerProbe>,
    incidents: RwLock<Vec<Incident>>,
    target_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    compose_path: Option<PathBuf>,
    compose_cache: OnceCell<Option<String>>,
    health_wait: Duration,
}

impl IncidentPipeline {
    pub fn new(
        bus: Arc<dyn EventBus>,
        detector: Arc<AnomalyDetector>,
        analyzer: RootCauseAnalyzer,
        gateway: Arc<McpGateway>,
        probe: Arc<dyn ContainerProbe>,
        compose_path: Option<PathBuf>,
    ) -> Self {
        Self {
            bus,
            detector,
            analyzer,
            gateway,
            probe,
            incidents: RwLock::new(Vec::new()),
            target_locks: Mutex::new(HashMap::new()),
            compose_path,
            compose_cache: OnceCell::new(),
            health_wait: MAX_HEALTH_WAIT,
        }
    }

    /// Shrink the post-fix health polling budget (tests).
    #[must_use]
    pub fn with_health_wait(mut self, health_wait: Duration) -> Self {
        self.health_wait = health_wait;
        self
    }

    /// Copy of the incident log, oldest first.
    pub fn snapshot_incidents(&self) -> Vec<Incident> {
        self.incidents.read().expect("incident log poisoned").clone()
    }

    /// Drive one escalated anomaly through the full pipeline.
    pub async fn handle_anomaly(&self, context: IncidentContext, verdict: AnomalyVerdict) {
        // Stage 1: open.
        let incident_id = sentinel_types::incident_id();
        let anomaly_summary = verdict.summary.clone();
        info!(incident = %incident_id, service = %context.service, "incident opened");

        let incident = Incident::open(
            incident_id.clone(),
            context.service.clone(),
            sentinel_types::utc_now(),
            verdict,
        );
        self.incidents
            .write()
            .expect("incident log poisoned")
            .push(incident.clone());
        self.bus.publish(SentinelEvent::Incident { incident }).await;

        // Stage 2: context. Logs, env, and stats arrive with the hand-off;
        // the compose descriptor is read once and cached for the process.
        let docker_compose = self.read_compose().await;

        // Stage 3: tool catalog. Best effort here; the preflight decides
        // whether remediation can actually run.
        if !self.gateway.is_initialized().await {
            if let Err(err) = self.gateway.initialize().await {
                warn!(incident = %incident_id, error = %err, "gateway unavailable for tool catalog");
            }
        }
        let available_tools = self.gateway.tool_catalog().await;

        // Stage 4: diagnose.
        let env_names: Vec<String> = context.environment.keys().cloned().collect();
        let sensitive = self
            .detector
            .classify_sensitive_env_vars(&env_names, Some(&context.environment))
            .await;
        let environment = redact::redact_env(&context.environment, &sensitive);

        let request = AnalysisRequest {
            anomaly_summary,
            container_name: context.container_name.clone(),
            full_logs: context.all_logs.clone(),
            docker_compose,
            environment,
            container_stats: context.stats.clone(),
            available_tools,
        };

        let analysis = match self.analyzer.analyze_root_cause(&request).await {
            Ok(analysis) => analysis,
            Err(err) => {
                error!(incident = %incident_id, error = %err, "root cause analysis failed");
                self.update_and_publish(&incident_id, |incident| {
                    set_terminal_status(incident, IncidentStatus::Unresolved);
                    incident.resolution_notes = Some(format!("Root cause analysis failed: {err}"));
                })
                .await;
                return;
            }
        };

        info!(
            incident = %incident_id,
            confidence = analysis.confidence,
            fixes = analysis.suggested_fixes.len(),
            "analysis attached"
        );
        self.update_and_publish(&incident_id, |incident| {
            incident.analysis = Some(analysis.clone());
        })
        .await;

        // Stage 5: preflight.
        if !self.gateway.verify_gateway_health().await {
            warn!(incident = %incident_id, "gateway preflight failed, skipping fixes");
            self.update_and_publish(&incident_id, |incident| {
                set_terminal_status(incident, IncidentStatus::Unresolved);
                incident.resolution_notes = Some(GATEWAY_UNHEALTHY_NOTES.to_string());
            })
            .await;
            return;
        }

        // Stage 6: remediate, in the model's order, serialized per target.
        let fixes = analysis.suggested_fixes.clone();
        let results = {
            let lock = self.target_lock(&context.container_name);
            let _guard = lock.lock().await;
            let mut results = Vec::with_capacity(fixes.len());
            for fix in &fixes {
                let result = self.gateway.execute_fix(fix).await;
                if result.success {
                    info!(incident = %incident_id, action = %fix.action, "fix applied");
                } else {
                    warn!(
                        incident = %incident_id,
                        action = %fix.action,
                        error = result.error.as_deref().unwrap_or("unknown"),
                        "fix failed"
                    );
                }
                results.push(result);
            }
            results
        };

        self.update_and_publish(&incident_id, |incident| {
            incident.fixes = results.clone();
        })
        .await;

        // Stage 7: verify. All three clauses must hold to resolve.
        let health_ok = self
            .gateway
            .verify_container_health(&context.container_name, self.health_wait)
            .await;

        let mut failed_critical: Vec<String> = Vec::new();
        for (fix, result) in fixes.iter().zip(&results) {
            if fix.is_critical() && !result.success {
                let reason = result
                    .error
                    .as_deref()
                    .or(result.message.as_deref())
                    .unwrap_or("unknown error");
                failed_critical.push(format!("{} ({reason})", fix.action));
            }
        }
        let critical_ok = failed_critical.is_empty();

        let live_status = self.probe.container_status(&context.container_name).await;
        let running = live_status.as_deref() == Some("running");

        if health_ok && critical_ok && running {
            info!(incident = %incident_id, "incident resolved");
            self.update_and_publish(&incident_id, |incident| {
                set_terminal_status(incident, IncidentStatus::Resolved);
                incident.resolved_at = Some(sentinel_types::utc_now());
            })
            .await;
        } else {
            let mut notes = Vec::new();
            if !critical_ok {
                notes.push(format!("Critical fix failed: {}", failed_critical.join(", ")));
            }
            if !running {
                notes.push(format!(
                    "Container is not running (status: {})",
                    live_status.as_deref().unwrap_or("unknown")
                ));
            }
            if !health_ok {
                notes.push(format!(
                    "Health check did not pass within {}s",
                    self.health_wait.as_secs()
                ));
            }
            warn!(incident = %incident_id, notes = %notes.join("; "), "incident unresolved");
            self.update_and_publish(&incident_id, |incident| {
                set_terminal_status(incident, IncidentStatus::Unresolved);
                incident.resolution_notes = Some(notes.join("; "));
            })
            .await;
        }

        // Stage 8: narrate. Never changes resolution accounting.
        let explanation = self.analyzer.explain_for_humans(&analysis).await;
        self.update_and_publish(&incident_id, |incident| {
            incident.explanation = Some(explanation.clone());
        })
        .await;
    }

    /// Apply a mutation to the incident record and publish the new state.
    async fn update_and_publish(&self, incident_id: &str, apply: impl FnOnce(&mut Incident)) {
        let updated = {
            let mut incidents = self.incidents.write().expect("incident log poisoned");
            let Some(incident) = incidents.iter_mut().find(|i| i.id == incident_id) else {
                return;
            };
            apply(incident);
            incident.clone()
        };
        self.bus
            .publish(SentinelEvent::IncidentUpdate { incident: updated })
            .await;
    }

    fn target_lock(&self, target: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.target_locks.lock().expect("target locks poisoned");
        Arc::clone(
            locks
                .entry(target.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    async fn read_compose(&self) -> Option<String> {
        self.compose_cache
            .get_or_init(|| async {
                let path = self.compose_path.as_ref()?;
                match tokio::fs::read_to_string(path).await {
                    Ok(contents) => Some(contents),
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "compose descriptor unreadable");
                        None
                    }
                }
            })
            .await
            .clone()
    }
}

/// Status moves out of `analyzing` exactly once.
fn set_terminal_status(incident: &mut Incident, status: IncidentStatus) {
    if incident.status == IncidentStatus::Analyzing {
        incident.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_types::{AnomalySeverity, AnomalyType};

    fn incident() -> Incident {
        Incident::open(
            "INC-20250101-000000".into(),
            "api".into(),
            sentinel_types::utc_now(),
            AnomalyVerdict {
                is_anomaly: true,
                confidence: 0.9,
                anomaly_type: AnomalyType::Error,
                severity: AnomalySeverity::High,
                summary: "boom".into(),
            },
        )
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        let mut record = incident();
        set_terminal_status(&mut record, IncidentStatus::Resolved);
        assert_eq!(record.status, IncidentStatus::Resolved);

        // A later failure clause cannot downgrade a terminal status.
        set_terminal_status(&mut record, IncidentStatus::Unresolved);
        assert_eq!(record.status, IncidentStatus::Resolved);
    }

    #[test]
    fn test_unresolved_is_also_terminal() {
        let mut record = incident();
        set_terminal_status(&mut record, IncidentStatus::Unresolved);
        set_terminal_status(&mut record, IncidentStatus::Resolved);
        assert_eq!(record.status, IncidentStatus::Unresolved);
    }
}
