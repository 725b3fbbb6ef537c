//! Fast anomaly classification over log chunks.
//!
//! The detector is called inline from every container's log pump, so it is
//! deliberately forgiving: any failure to get a usable verdict out of the
//! model becomes a benign non-event and monitoring continues. It also hosts
//! the model-assisted secret classifier used before prompts are assembled,
//! which degrades to the pattern tier in [`crate::redact`].

use crate::client::{ChatMessage, ChatOptions, ModelClient, ModelError};
use crate::redact;
use sentinel_types::AnomalyVerdict;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

const DETECT_TEMPERATURE: f64 = 0.1;
const DETECT_MAX_TOKENS: u32 = 300;
const CLASSIFY_TEMPERATURE: f64 = 0.0;
const CLASSIFY_MAX_TOKENS: u32 = 500;

/// Route fast-path calls to Cerebras hardware when OpenRouter has it.
const PROVIDER_ORDER: &str = "Cerebras";

const DETECT_SYSTEM_PROMPT: &str = r#"You are an expert SRE analyzing container logs for anomalies.
Respond ONLY with a JSON object in this format:
{
    "is_anomaly": true/false,
    "confidence": 0.0-1.0,
    "anomaly_type": "crash|error|warning|performance|none",
    "severity": "low|medium|high|critical",
    "summary": "one-sentence description"
}

Common anomaly patterns:
- Crashes: "FATAL", "segmentation fault", "killed", "OOM", "heap out of memory", "JavaScript heap out of memory"
- Errors: "ERROR", "Exception", "failed to", "connection refused"
- Performance: "timeout", "slow query", "high latency", "memory leak"
- Warnings: "deprecated", "retry", "fallback"

Severity guidelines:
- CRITICAL: "FATAL", "OOM", "heap out of memory", "segmentation fault", container crashes
- HIGH: Multiple repeated errors, connection failures, service unavailable, "memory leak"
- MEDIUM: Single errors, timeouts, performance degradation
- LOW: Warnings, deprecation notices, single failed requests
"#;

const CLASSIFY_SYSTEM_PROMPT: &str = r#"You are a security expert analyzing environment variable names.
Classify which environment variable names likely contain sensitive information (passwords, API keys, tokens, secrets, credentials, etc.).

Respond ONLY with a JSON object in this format:
{
    "sensitive_keys": ["KEY_NAME_1", "KEY_NAME_2"]
}

Include a key in "sensitive_keys" if it likely contains:
- Passwords or credentials
- API keys or tokens
- Database connection strings with embedded passwords
- Private keys or certificates
- OAuth secrets
- Encryption keys

Common patterns to flag as sensitive:
- Contains: "key", "secret", "password", "token", "auth", "credential", "private", "cert"
- Database URLs that may embed passwords: "DATABASE_URL", "DB_URL", "MONGO_URL", "REDIS_URL"
- Cloud provider credentials: "AWS_", "GCP_", "AZURE_"
- Third-party API keys: "*_API_KEY", "*_TOKEN", "*_SECRET"

DO NOT flag safe configuration like:
- "NODE_ENV", "PORT", "LOG_LEVEL", "TIMEOUT", "MAX_CONNECTIONS", "DEBUG"
- "HOSTNAME", "PATH", "HOME", "USER", "LANG"
"#;

/// Fast log classifier backed by the small model.
pub struct AnomalyDetector {
    client: Arc<ModelClient>,
    model: String,
}

impl AnomalyDetector {
    pub fn new(client: Arc<ModelClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    fn options(&self, temperature: f64, max_tokens: u32) -> ChatOptions {
        ChatOptions {
            model: self.model.clone(),
            temperature,
            max_tokens,
            json_mode: true,
            provider_order: vec![PROVIDER_ORDER.to_string()],
        }
    }

    /// Classify a chunk of recent logs. Never fails: a model that cannot be
    /// reached or understood yields a benign verdict whose summary carries
    /// the reason.
    pub async fn detect_anomaly(
        &self,
        log_chunk: &str,
        service_name: &str,
        context: Option<&Value>,
    ) -> AnomalyVerdict {
        let context_block = context
            .map(|ctx| {
                format!(
                    "\n\nAdditional context:\n{}",
                    serde_json::to_string_pretty(ctx).unwrap_or_default()
                )
            })
            .unwrap_or_default();

        let user_prompt = format!(
            "Service: {service_name}\n\nRecent logs (last 100 lines):\n```\n{log_chunk}\n```{context_block}\n\nAnalyze for anomalies. Respond with JSON only."
        );

        let messages = [
            ChatMessage {
                role: "system",
                content: DETECT_SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user",
                content: user_prompt,
            },
        ];

        debug!(service = service_name, chars = log_chunk.len(), "classifying log chunk");

        let verdict = match self
            .client
            .chat(&messages, &self.options(DETECT_TEMPERATURE, DETECT_MAX_TOKENS))
            .await
        {
            Ok(content) => match parse_verdict(&content) {
                Ok(verdict) => verdict,
                Err(err) => {
                    warn!(service = service_name, error = %err, "unusable classifier response");
                    AnomalyVerdict::benign(&err.to_string())
                }
            },
            Err(err) => {
                warn!(service = service_name, error = %err, "anomaly classification failed");
                AnomalyVerdict::benign(&err.to_string())
            }
        };

        if verdict.is_anomaly {
            info!(
                service = service_name,
                anomaly_type = %verdict.anomaly_type,
                severity = %verdict.severity,
                confidence = verdict.confidence,
                "anomaly detected"
            );
        }

        verdict
    }

    /// Model-assisted secret classification with the pattern tier as a
    /// fallback. Returns the set of env var names to redact. Never fails.
    pub async fn classify_sensitive_env_vars(
        &self,
        names: &[String],
        values: Option<&HashMap<String, String>>,
    ) -> HashSet<String> {
        if names.is_empty() {
            return HashSet::new();
        }

        let listed: String = names
            .iter()
            .map(|name| format!("- {name}\n"))
            .collect();
        let user_prompt = format!(
            "Classify these environment variable names as sensitive or safe:\n\n{listed}\nRespond with JSON only."
        );

        let messages = [
            ChatMessage {
                role: "system",
                content: CLASSIFY_SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user",
                content: user_prompt,
            },
        ];

        match self
            .client
            .chat(&messages, &self.options(CLASSIFY_TEMPERATURE, CLASSIFY_MAX_TOKENS))
            .await
        {
            Ok(content) => match parse_sensitive_keys(&content) {
                Some(keys) => {
                    debug!(flagged = keys.len(), total = names.len(), "classified env vars");
                    keys
                }
                None => {
                    warn!("unusable env classification response, using pattern fallback");
                    redact::fallback_secret_detection(names, values)
                }
            },
            Err(err) => {
                warn!(error = %err, "env classification failed, using pattern fallback");
                redact::fallback_secret_detection(names, values)
            }
        }
    }
}

fn parse_verdict(content: &str) -> Result<AnomalyVerdict, ModelError> {
    serde_json::from_str(content).map_err(|err| ModelError::Malformed(err.to_string()))
}

/// `{"sensitive_keys": [...]}` with every entry a string, or nothing.
fn parse_sensitive_keys(content: &str) -> Option<HashSet<String>> {
    let value: Value = serde_json::from_str(content).ok()?;
    let entries = value.get("sensitive_keys")?.as_array()?;
    let mut keys = HashSet::with_capacity(entries.len());
    for entry in entries {
        keys.insert(entry.as_str()?.to_string());
    }
    Some(keys)
}
