//! Shared domain types for SRE Sentinel.
//!
//! Everything that crosses a component boundary lives here: anomaly verdicts
//! from the fast classifier, root-cause analyses from the deep analyzer, fix
//! actions and their execution results, container samples, incident records,
//! and the tagged event envelopes published on the bus.
//!
//! Model output is untrusted: the enums in this crate normalize case on the
//! way in and reject values outside their closed sets, so downstream code
//! never traffics in free-form severity or status strings.

mod domain;
mod event;

pub use domain::{
    AnomalySeverity, AnomalyType, AnomalyVerdict, ContainerState, ContainerStats, FixAction,
    FixExecutionResult, Incident, IncidentContext, IncidentStatus, LogEntry, RootCauseAnalysis,
};
pub use event::SentinelEvent;

use chrono::{SecondsFormat, Utc};

/// Current UTC time as an ISO-8601 string, the only timestamp format that
/// appears on the wire.
#[must_use]
pub fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Incident ids are derived from the detection instant: `INC-<yyyymmdd-HHMMSS>`.
#[must_use]
pub fn incident_id() -> String {
    format!("INC-{}", Utc::now().format("%Y%m%d-%H%M%S"))
}
