//! Tagged event envelopes published on the bus and forwarded to WebSocket
//! subscribers. Field names are wire-stable; dashboards switch on `type`.

use crate::domain::{ContainerState, Incident};
use serde::{Deserialize, Serialize};

/// Every event the system emits. Serializes with an inline `"type"` tag:
///
/// ```json
/// {"type":"log","container":"api","timestamp":"...","message":"..."}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SentinelEvent {
    /// First frame on every WebSocket connection: the current world.
    Bootstrap {
        containers: Vec<ContainerState>,
        incidents: Vec<Incident>,
    },
    /// A fresh metrics sample or lifecycle change for one container.
    ContainerUpdate { container: ContainerState },
    /// One ingested log line.
    Log {
        container: String,
        timestamp: String,
        message: String,
    },
    /// A new incident has been opened.
    Incident { incident: Incident },
    /// An existing incident changed (analysis attached, fixes ran, status
    /// moved, narration added).
    IncidentUpdate { incident: Incident },
}

impl SentinelEvent {
    /// The wire tag, handy for log lines and tests.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bootstrap { .. } => "bootstrap",
            Self::ContainerUpdate { .. } => "container_update",
            Self::Log { .. } => "log",
            Self::Incident { .. } => "incident",
            Self::IncidentUpdate { .. } => "incident_update",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AnomalySeverity, AnomalyType, AnomalyVerdict, IncidentStatus};

    fn sample_container() -> ContainerState {
        ContainerState {
            id: "abc123".into(),
            name: "demo-api".into(),
            service: "api".into(),
            status: "running".into(),
            restarts: Some(0),
            cpu: 12.5,
            memory: 40.2,
            network_rx: 1024.0,
            network_tx: 2048.0,
            disk_read: 0.0,
            disk_write: 512.0,
            timestamp: "2025-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn test_log_event_wire_shape() {
        let event = SentinelEvent::Log {
            container: "api".into(),
            timestamp: "2025-01-01T00:00:00Z".into(),
            message: "ERROR boom".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["container"], "api");
        assert_eq!(value["message"], "ERROR boom");
    }

    #[test]
    fn test_container_update_round_trip() {
        let event = SentinelEvent::ContainerUpdate {
            container: sample_container(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: SentinelEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.kind(), "container_update");
    }

    #[test]
    fn test_incident_event_round_trip() {
        let incident = Incident {
            id: "INC-20250101-000000".into(),
            service: "api".into(),
            detected_at: "2025-01-01T00:00:00Z".into(),
            anomaly: AnomalyVerdict {
                is_anomaly: true,
                confidence: 0.95,
                anomaly_type: AnomalyType::Crash,
                severity: AnomalySeverity::Critical,
                summary: "repeated connection failures".into(),
            },
            status: IncidentStatus::Analyzing,
            analysis: None,
            fixes: Vec::new(),
            resolved_at: None,
            explanation: None,
            resolution_notes: None,
        };
        let event = SentinelEvent::Incident { incident };
        let json = serde_json::to_string(&event).unwrap();
        let back: SentinelEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["incident"]["status"], "analyzing");
        assert_eq!(value["incident"]["anomaly"]["severity"], "critical");
    }

    #[test]
    fn test_container_sample_wire_field_names() {
        let value = serde_json::to_value(sample_container()).unwrap();
        for field in [
            "id",
            "name",
            "service",
            "status",
            "restarts",
            "cpu",
            "memory",
            "network_rx",
            "network_tx",
            "disk_read",
            "disk_write",
            "timestamp",
        ] {
            assert!(value.get(field).is_some(), "missing field {field}");
        }
    }

    #[test]
    fn test_bootstrap_lists_snapshot_contents() {
        let event = SentinelEvent::Bootstrap {
            containers: vec![sample_container(), sample_container()],
            incidents: Vec::new(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "bootstrap");
        assert_eq!(value["containers"].as_array().unwrap().len(), 2);
        assert_eq!(value["incidents"].as_array().unwrap().len(), 0);
    }
}
