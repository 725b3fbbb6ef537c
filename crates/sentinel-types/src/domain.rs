//! Domain model: verdicts, fixes, analyses, container state, incidents.
//!
//! Deserialization here is the validation boundary for model output. Enum
//! values are matched case-insensitively and normalized to lowercase; unknown
//! values are errors. Fix priorities reject JSON booleans outright.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Kinds of anomalies the fast classifier can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyType {
    Crash,
    Error,
    Warning,
    Performance,
    None,
}

impl AnomalyType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crash => "crash",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Performance => "performance",
            Self::None => "none",
        }
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "crash" => Ok(Self::Crash),
            "error" => Ok(Self::Error),
            "warning" => Ok(Self::Warning),
            "performance" => Ok(Self::Performance),
            "none" => Ok(Self::None),
            other => Err(format!("unknown anomaly type: {other:?}")),
        }
    }
}

impl<'de> Deserialize<'de> for AnomalyType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Severity ladder for anomaly verdicts. Only `High` and `Critical` escalate
/// into incidents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AnomalySeverity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Whether a verdict with this severity wakes the incident pipeline.
    #[must_use]
    pub fn is_escalating(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl fmt::Display for AnomalySeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalySeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {other:?}")),
        }
    }
}

impl<'de> Deserialize<'de> for AnomalySeverity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Incident life-cycle status. Transitions are monotonic:
/// `analyzing` moves to exactly one of `resolved` or `unresolved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Analyzing,
    Resolved,
    Unresolved,
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Analyzing => "analyzing",
            Self::Resolved => "resolved",
            Self::Unresolved => "unresolved",
        };
        f.write_str(s)
    }
}

/// Structured verdict from the fast log classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyVerdict {
    pub is_anomaly: bool,
    /// Classifier confidence in `[0, 1]`.
    pub confidence: f64,
    pub anomaly_type: AnomalyType,
    pub severity: AnomalySeverity,
    /// One-sentence description of what was seen.
    pub summary: String,
}

impl AnomalyVerdict {
    /// The verdict used when classification itself failed: a benign
    /// non-event carrying the failure reason in its summary.
    #[must_use]
    pub fn benign(reason: &str) -> Self {
        Self {
            is_anomaly: false,
            confidence: 0.0,
            anomaly_type: AnomalyType::None,
            severity: AnomalySeverity::Low,
            summary: format!("Error analyzing logs: {reason}"),
        }
    }

    /// True when this verdict should open an incident.
    #[must_use]
    pub fn should_escalate(&self) -> bool {
        self.is_anomaly && self.severity.is_escalating()
    }
}

/// A single remediation suggested by the deep analyzer.
///
/// `action` names a gateway tool; the catalog is discovered at runtime, so
/// this is a free string validated against the live tool list at execution
/// time, not an enum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixAction {
    pub action: String,
    /// Container or service the fix applies to.
    pub target: String,
    /// Opaque argument payload; executed fixes try to parse this as a JSON
    /// object of tool arguments.
    pub details: String,
    /// 1 (most urgent) to 5. Priorities 1-2 are critical for resolution
    /// accounting.
    #[serde(deserialize_with = "deserialize_priority")]
    pub priority: u8,
}

impl FixAction {
    /// Critical fixes must succeed for an incident to resolve.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.priority <= 2
    }
}

/// Models occasionally emit `true`/`false` or fractional numbers where a
/// priority belongs. Booleans are rejected; numbers are truncated the way
/// the rest of the pipeline rounds model output.
fn deserialize_priority<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    struct PriorityVisitor;

    impl Visitor<'_> for PriorityVisitor {
        type Value = u8;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an integer priority")
        }

        fn visit_bool<E: de::Error>(self, _: bool) -> Result<u8, E> {
            Err(E::custom("priority cannot be a boolean"))
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<u8, E> {
            u8::try_from(value).map_err(|_| E::custom(format!("priority {value} out of range")))
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<u8, E> {
            u8::try_from(value).map_err(|_| E::custom(format!("priority {value} out of range")))
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<u8, E> {
            if value.is_finite() && (0.0..=255.0).contains(&value) {
                Ok(value as u8)
            } else {
                Err(E::custom(format!("priority {value} out of range")))
            }
        }
    }

    deserializer.deserialize_any(PriorityVisitor)
}

/// Outcome of one fix invocation against the gateway.
///
/// `success` is true only when the gateway returned an explicit positive
/// result; transport failures, policy refusals, and unknown tools are all
/// structured failures.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FixExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Status string reported by the tool itself, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Raw tool result document, for operators digging into a fix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl FixExecutionResult {
    #[must_use]
    pub fn failure(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            success: false,
            message: Some(reason.clone()),
            error: Some(reason),
            ..Self::default()
        }
    }
}

/// Root-cause analysis returned by the deep analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCauseAnalysis {
    pub root_cause: String,
    /// The analyzer's step-by-step reasoning.
    pub explanation: String,
    pub affected_components: Vec<String>,
    pub suggested_fixes: Vec<FixAction>,
    /// Analyzer confidence in `[0, 1]`.
    pub confidence: f64,
    /// How to keep this from happening again.
    pub prevention: String,
}

/// One observed sample of a monitored container.
///
/// Rates are bytes/second computed from deltas of cumulative counters. A
/// counter reset (container restart) produces a negative rate for one sample;
/// that is emitted as-is rather than clamped, so dashboards can see the
/// discontinuity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    pub id: String,
    pub name: String,
    pub service: String,
    pub status: String,
    pub restarts: Option<i64>,
    pub cpu: f64,
    pub memory: f64,
    pub network_rx: f64,
    pub network_tx: f64,
    pub disk_read: f64,
    pub disk_write: f64,
    pub timestamp: String,
}

impl ContainerState {
    /// A zeroed sample for a container we have identified but not yet
    /// measured, or one that has gone away (`status = "offline"`).
    #[must_use]
    pub fn placeholder(
        id: impl Into<String>,
        name: impl Into<String>,
        service: impl Into<String>,
        status: impl Into<String>,
        restarts: Option<i64>,
        timestamp: String,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            service: service.into(),
            status: status.into(),
            restarts,
            cpu: 0.0,
            memory: 0.0,
            network_rx: 0.0,
            network_tx: 0.0,
            disk_read: 0.0,
            disk_write: 0.0,
            timestamp,
        }
    }
}

/// Container facts snapshotted when an incident opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub status: String,
    pub restarts: Option<i64>,
    pub created: String,
    pub exit_code: Option<i64>,
}

/// One buffered log line, timestamped at ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub line: String,
}

/// Everything the pipeline needs to diagnose an incident, gathered by the
/// observer at escalation time. The environment map is raw here; redaction
/// happens before any of it reaches a prompt.
#[derive(Debug, Clone)]
pub struct IncidentContext {
    pub container_id: String,
    pub container_name: String,
    pub service: String,
    /// Full buffered log history, newline-joined.
    pub all_logs: String,
    pub environment: HashMap<String, String>,
    pub stats: ContainerStats,
}

/// Append-only record of one escalation, from detection through narration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub service: String,
    pub detected_at: String,
    pub anomaly: AnomalyVerdict,
    pub status: IncidentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<RootCauseAnalysis>,
    #[serde(default)]
    pub fixes: Vec<FixExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,
}

impl Incident {
    #[must_use]
    pub fn open(id: String, service: String, detected_at: String, anomaly: AnomalyVerdict) -> Self {
        Self {
            id,
            service,
            detected_at,
            anomaly,
            status: IncidentStatus::Analyzing,
            analysis: None,
            fixes: Vec::new(),
            resolved_at: None,
            explanation: None,
            resolution_notes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_normalizes_case() {
        let sev: AnomalySeverity = serde_json::from_str("\"CRITICAL\"").unwrap();
        assert_eq!(sev, AnomalySeverity::Critical);
        let sev: AnomalySeverity = serde_json::from_str("\" High \"").unwrap();
        assert_eq!(sev, AnomalySeverity::High);
        assert_eq!(serde_json::to_string(&sev).unwrap(), "\"high\"");
    }

    #[test]
    fn test_unknown_severity_is_an_error() {
        let result: Result<AnomalySeverity, _> = serde_json::from_str("\"fatal\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_anomaly_type_normalizes_case() {
        let kind: AnomalyType = serde_json::from_str("\"Crash\"").unwrap();
        assert_eq!(kind, AnomalyType::Crash);
        let result: Result<AnomalyType, _> = serde_json::from_str("\"meltdown\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_priority_rejects_boolean() {
        let raw = r#"{"action":"restart_container","target":"db","details":"{}","priority":true}"#;
        let result: Result<FixAction, _> = serde_json::from_str(raw);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("boolean"), "unexpected error: {err}");
    }

    #[test]
    fn test_priority_accepts_integral_forms() {
        let raw = r#"{"action":"restart_container","target":"db","details":"{}","priority":2}"#;
        let fix: FixAction = serde_json::from_str(raw).unwrap();
        assert_eq!(fix.priority, 2);
        assert!(fix.is_critical());

        let raw = r#"{"action":"scale","target":"db","details":"{}","priority":3.0}"#;
        let fix: FixAction = serde_json::from_str(raw).unwrap();
        assert_eq!(fix.priority, 3);
        assert!(!fix.is_critical());
    }

    #[test]
    fn test_escalation_requires_anomaly_and_high_severity() {
        let mut verdict = AnomalyVerdict {
            is_anomaly: true,
            confidence: 0.9,
            anomaly_type: AnomalyType::Crash,
            severity: AnomalySeverity::Critical,
            summary: "db down".into(),
        };
        assert!(verdict.should_escalate());

        verdict.severity = AnomalySeverity::Medium;
        assert!(!verdict.should_escalate());

        verdict.severity = AnomalySeverity::High;
        verdict.is_anomaly = false;
        assert!(!verdict.should_escalate());
    }

    #[test]
    fn test_benign_verdict_carries_reason() {
        let verdict = AnomalyVerdict::benign("connection reset");
        assert!(!verdict.is_anomaly);
        assert_eq!(verdict.severity, AnomalySeverity::Low);
        assert!(verdict.summary.contains("connection reset"));
        assert!(!verdict.should_escalate());
    }

    #[test]
    fn test_root_cause_analysis_round_trip() {
        let analysis = RootCauseAnalysis {
            root_cause: "wrong password in DATABASE_URL".into(),
            explanation: "api retries exhausted".into(),
            affected_components: vec!["api".into(), "postgres".into()],
            suggested_fixes: vec![FixAction {
                action: "restart_container".into(),
                target: "postgres".into(),
                details: r#"{"container_name":"postgres"}"#.into(),
                priority: 1,
            }],
            confidence: 0.85,
            prevention: "validate credentials at deploy time".into(),
        };
        let json = serde_json::to_string(&analysis).unwrap();
        let back: RootCauseAnalysis = serde_json::from_str(&json).unwrap();
        assert_eq!(back, analysis);
    }

    #[test]
    fn test_analysis_missing_field_is_an_error() {
        let raw = r#"{"root_cause":"x","explanation":"y","affected_components":[],"confidence":0.5,"prevention":""}"#;
        let result: Result<RootCauseAnalysis, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn test_incident_open_defaults() {
        let incident = Incident::open(
            "INC-20250101-000000".into(),
            "api".into(),
            "2025-01-01T00:00:00Z".into(),
            AnomalyVerdict::benign("n/a"),
        );
        assert_eq!(incident.status, IncidentStatus::Analyzing);
        assert!(incident.fixes.is_empty());
        assert!(incident.resolved_at.is_none());
    }
}
