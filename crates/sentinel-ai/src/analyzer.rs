//! Deep root-cause analysis over the full incident context.
//!
//! Unlike the fast classifier, failures here surface to the pipeline: an
//! incident whose diagnosis failed is marked unresolved with the error on
//! record, which is more honest than a fabricated analysis.

use crate::client::{ChatMessage, ChatOptions, ModelClient, ModelError};
use sentinel_types::{ContainerStats, RootCauseAnalysis};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const ANALYZE_TEMPERATURE: f64 = 0.2;
const ANALYZE_MAX_TOKENS: u32 = 2000;
const EXPLAIN_TEMPERATURE: f64 = 0.7;
const EXPLAIN_MAX_TOKENS: u32 = 500;

/// Returned when narration fails; never blocks incident accounting.
pub const FALLBACK_EXPLANATION: &str = "Unable to generate human-friendly explanation";

const ANALYZE_SYSTEM_PROMPT: &str = r#"You are a world-class Site Reliability Engineer with deep expertise in:
- Container orchestration (Docker, Kubernetes)
- Database systems (PostgreSQL, MySQL, Redis)
- Application debugging (Node.js, Python, Java, Go)
- Network troubleshooting
- Performance optimization

Given comprehensive system context, perform root cause analysis and provide actionable fixes.
Suggested fixes must use the remediation tools listed in the context, by exact name.

Respond ONLY with a JSON object in this format:
{
    "root_cause": "detailed explanation of the underlying issue",
    "explanation": "step-by-step reasoning of how you arrived at this conclusion",
    "affected_components": ["component1", "component2"],
    "suggested_fixes": [
        {
            "action": "tool_name",
            "target": "container_name",
            "details": "JSON object of tool arguments, as a string",
            "priority": 1-5
        }
    ],
    "confidence": 0.0-1.0,
    "prevention": "how to prevent this issue in the future"
}"#;

const HUMAN_SUMMARY_PROMPT: &str = r#"Convert this technical root cause analysis into a simple, natural language explanation
that a non-technical stakeholder can understand.

Technical Analysis:
{analysis}

Write two short paragraphs that cover:
1. What broke
2. Why it broke
3. What is being done to fix it
4. How long remediation is expected to take
"#;

/// Everything the analyzer gets to see. The environment map must already be
/// redacted; this type deliberately takes the rendered form.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub anomaly_summary: String,
    pub container_name: String,
    pub full_logs: String,
    pub docker_compose: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub container_stats: ContainerStats,
    /// Rendered tool catalog from the gateway.
    pub available_tools: String,
}

/// Long-context analyzer backed by the large model.
pub struct RootCauseAnalyzer {
    client: Arc<ModelClient>,
    model: String,
}

impl RootCauseAnalyzer {
    pub fn new(client: Arc<ModelClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Diagnose the incident. Errors (after the transport's retry budget)
    /// propagate to the caller.
    pub async fn analyze_root_cause(
        &self,
        request: &AnalysisRequest,
    ) -> Result<RootCauseAnalysis, ModelError> {
        let context = build_context(request);
        debug!(
            chars = context.len(),
            container = %request.container_name,
            "running root cause analysis"
        );

        let messages = [
            ChatMessage {
                role: "system",
                content: ANALYZE_SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user",
                content: format!(
                    "Analyze this production incident and provide root cause + fixes:\n\n{context}\n\nYour analysis:"
                ),
            },
        ];

        let options = ChatOptions {
            model: self.model.clone(),
            temperature: ANALYZE_TEMPERATURE,
            max_tokens: ANALYZE_MAX_TOKENS,
            json_mode: true,
            provider_order: Vec::new(),
        };

        let content = self.client.chat(&messages, &options).await?;
        let analysis: RootCauseAnalysis = serde_json::from_str(&content)
            .map_err(|err| ModelError::Malformed(err.to_string()))?;

        info!(
            confidence = analysis.confidence,
            fixes = analysis.suggested_fixes.len(),
            "root cause analysis complete"
        );
        Ok(analysis)
    }

    /// Narrate the analysis for stakeholders. Failures collapse to a fixed
    /// fallback string; narration never changes incident state.
    pub async fn explain_for_humans(&self, analysis: &RootCauseAnalysis) -> String {
        let analysis_json = match serde_json::to_string_pretty(analysis) {
            Ok(json) => json,
            Err(_) => return FALLBACK_EXPLANATION.to_string(),
        };

        let messages = [ChatMessage {
            role: "user",
            content: HUMAN_SUMMARY_PROMPT.replace("{analysis}", &analysis_json),
        }];

        let options = ChatOptions {
            model: self.model.clone(),
            temperature: EXPLAIN_TEMPERATURE,
            max_tokens: EXPLAIN_MAX_TOKENS,
            json_mode: false,
            provider_order: Vec::new(),
        };

        match self.client.chat(&messages, &options).await {
            Ok(content) => content,
            Err(err) => {
                warn!(error = %err, "failed to generate human explanation");
                FALLBACK_EXPLANATION.to_string()
            }
        }
    }
}

/// Assemble the analyzer's context document: anomaly first, then state,
/// configuration, the remediation catalog, and finally the full log history.
fn build_context(request: &AnalysisRequest) -> String {
    let mut sections = vec![format!(
        "# Anomaly Detected\n{}\n\n# Container\n{}",
        request.anomaly_summary, request.container_name
    )];

    sections.push(format!(
        "\n# Container Stats\n{}",
        serde_json::to_string_pretty(&request.container_stats).unwrap_or_default()
    ));

    if !request.environment.is_empty() {
        sections.push(format!(
            "\n# Environment Variables\n{}",
            serde_json::to_string_pretty(&request.environment).unwrap_or_default()
        ));
    }

    if let Some(compose) = &request.docker_compose {
        sections.push(format!(
            "\n# Docker Compose Configuration\n```yaml\n{compose}\n```"
        ));
    }

    if !request.available_tools.is_empty() {
        sections.push(format!(
            "\n# Available Remediation Tools\n{}",
            request.available_tools
        ));
    }

    sections.push(format!(
        "\n# Complete Log History ({} characters)\n```\n{}\n```",
        request.full_logs.len(),
        request.full_logs
    ));

    sections.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_config::ModelSettings;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn analyzer(base_url: String) -> RootCauseAnalyzer {
        let settings = ModelSettings {
            api_key: "sk-or-test".into(),
            base_url,
            fast_model: "fast".into(),
            deep_model: "deep".into(),
        };
        RootCauseAnalyzer::new(Arc::new(ModelClient::new(&settings)), "deep")
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest {
            anomaly_summary: "repeated connection failures".into(),
            container_name: "demo-postgres".into(),
            full_logs: "ERROR Connection to postgres failed\nFATAL Unable to connect".into(),
            docker_compose: Some("services:\n  postgres:\n    image: postgres:15".into()),
            environment: BTreeMap::from([
                ("DATABASE_URL".to_string(), "postgresql://u:***REDACTED***@h/db".to_string()),
                ("PORT".to_string(), "5432".to_string()),
            ]),
            container_stats: ContainerStats {
                status: "exited".into(),
                restarts: Some(3),
                created: "2025-01-01T00:00:00Z".into(),
                exit_code: Some(1),
            },
            available_tools: "- restart_container: Restart a container".into(),
        }
    }

    fn analysis_json() -> serde_json::Value {
        serde_json::json!({
            "root_cause": "postgres is down",
            "explanation": "logs show refused connections",
            "affected_components": ["postgres", "api"],
            "suggested_fixes": [{
                "action": "restart_container",
                "target": "demo-postgres",
                "details": "{\"container_name\":\"demo-postgres\"}",
                "priority": 1
            }],
            "confidence": 0.9,
            "prevention": "add a healthcheck"
        })
    }

    #[tokio::test]
    async fn test_analysis_parses_model_output() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": analysis_json().to_string()}}]
            })))
            .mount(&server)
            .await;

        let analysis = analyzer(server.uri()).analyze_root_cause(&request()).await.unwrap();
        assert_eq!(analysis.root_cause, "postgres is down");
        assert_eq!(analysis.suggested_fixes.len(), 1);
        assert_eq!(analysis.suggested_fixes[0].action, "restart_container");
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_surfaces_transport_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = analyzer(server.uri()).analyze_root_cause(&request()).await.unwrap_err();
        assert!(matches!(err, ModelError::Status { status: 502, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explanation_falls_back_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let analysis: RootCauseAnalysis = serde_json::from_value(analysis_json()).unwrap();
        let explanation = analyzer(server.uri()).explain_for_humans(&analysis).await;
        assert_eq!(explanation, FALLBACK_EXPLANATION);
    }

    #[test]
    fn test_context_contains_redacted_env_and_tools() {
        let context = build_context(&request());
        assert!(context.contains("# Anomaly Detected"));
        assert!(context.contains("***REDACTED***"));
        assert!(!context.contains("postgresql://u:p@"));
        assert!(context.contains("# Available Remediation Tools"));
        assert!(context.contains("restart_container"));
        assert!(context.contains("# Complete Log History"));
    }
}
