//! Model clients and secret redaction.
//!
//! Two adapters share one chat-completion transport: a fast classifier that
//! turns log chunks into [`AnomalyVerdict`](sentinel_types::AnomalyVerdict)s
//! and degrades to a benign verdict when the model is unreachable, and a
//! deep analyzer that produces full root-cause analyses and surfaces its
//! failures to the caller. Environment variables are classified and redacted
//! here before any of their values can reach a prompt.

mod analyzer;
mod client;
mod detector;
pub mod redact;

pub use analyzer::{AnalysisRequest, RootCauseAnalyzer, FALLBACK_EXPLANATION};
pub use client::{ChatMessage, ChatOptions, ModelClient, ModelError};
pub use detector::AnomalyDetector;
