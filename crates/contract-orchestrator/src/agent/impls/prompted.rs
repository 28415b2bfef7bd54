//! Prompt-render / complete / parse pipeline shared by the built-in agents.

use super::CompletionBackend;
use crate::agent::{Agent, AgentError, UnitInput, UnitKind, UnitOutput};
use async_trait::async_trait;
use minijinja::Environment;
use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use tracing::debug;

static JSON_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```\s*(?:json|JSON)?\s*\n(.*?)\n?\s*```").expect("fence pattern is valid")
});

/// Extracts the JSON object from a model reply.
///
/// Prefers a fenced code block; otherwise returns the first balanced
/// `{...}` object, ignoring braces inside string literals.
pub fn extract_json(text: &str) -> Result<String, AgentError> {
    if let Some(captures) = JSON_FENCE.captures(text)
        && let Some(body) = captures.get(1)
    {
        let body = body.as_str().trim();
        if body.starts_with('{') {
            return Ok(body.to_string());
        }
    }

    first_balanced_object(text)
        .map(str::to_string)
        .ok_or_else(|| AgentError::ParseError("no JSON object found in reply".to_string()))
}

fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Agent that renders a prompt template, calls a backend and parses the reply.
///
/// `required_fields` lists the unit-specific keys that must be present in
/// the parsed reply; a reply missing one is a [`AgentError::ParseError`].
#[derive(Clone)]
pub struct PromptedAgent {
    unit: UnitKind,
    expertise: &'static str,
    template: &'static str,
    required_fields: &'static [&'static str],
    backend: Arc<dyn CompletionBackend>,
}

impl PromptedAgent {
    /// Creates a new prompted agent.
    pub fn new(
        unit: UnitKind,
        expertise: &'static str,
        template: &'static str,
        required_fields: &'static [&'static str],
        backend: Arc<dyn CompletionBackend>,
    ) -> Self {
        Self {
            unit,
            expertise,
            template,
            required_fields,
            backend,
        }
    }

    /// Renders the prompt for `input`.
    ///
    /// Structured fields are pretty-printed JSON in the template context;
    /// string fields are passed through unchanged.
    pub fn render_prompt(&self, input: &UnitInput) -> Result<String, AgentError> {
        let mut context: BTreeMap<&str, String> = BTreeMap::new();
        for (key, value) in input.as_map() {
            let rendered = match value {
                JsonValue::String(s) => s.clone(),
                other => serde_json::to_string_pretty(other)?,
            };
            context.insert(key.as_str(), rendered);
        }

        let env = Environment::new();
        let template = env
            .template_from_str(self.template)
            .map_err(|e| AgentError::TemplateError(e.to_string()))?;
        template
            .render(&context)
            .map_err(|e| AgentError::TemplateError(e.to_string()))
    }

    /// Parses a raw model reply into a unit output.
    pub fn parse_reply(&self, reply: &str) -> Result<UnitOutput, AgentError> {
        let json = extract_json(reply)?;
        let mut object: Map<String, JsonValue> = serde_json::from_str(&json)
            .map_err(|e| AgentError::ParseError(format!("{}: {}", self.unit, e)))?;

        for field in self.required_fields {
            if !object.contains_key(*field) {
                return Err(AgentError::ParseError(format!(
                    "{} reply is missing `{}`",
                    self.unit, field
                )));
            }
        }

        object
            .entry("success".to_string())
            .or_insert(JsonValue::Bool(true));

        serde_json::from_value(JsonValue::Object(object))
            .map_err(|e| AgentError::ParseError(format!("{}: {}", self.unit, e)))
    }
}

#[async_trait]
impl Agent for PromptedAgent {
    fn unit(&self) -> UnitKind {
        self.unit
    }

    fn expertise(&self) -> &str {
        self.expertise
    }

    async fn execute(&self, input: UnitInput) -> Result<UnitOutput, AgentError> {
        let prompt = self.render_prompt(&input)?;
        debug!(unit = %self.unit, prompt_len = prompt.len(), "Sending unit prompt");
        let reply = self.backend.complete(prompt).await?;
        self.parse_reply(&reply)
    }

    async fn health_probe(&self) -> Result<(), AgentError> {
        self.backend.ping().await
    }

    fn name(&self) -> String {
        format!("PromptedAgent({})", self.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct CannedBackend(&'static str);

    #[async_trait]
    impl CompletionBackend for CannedBackend {
        async fn complete(&self, _prompt: String) -> Result<String, AgentError> {
            Ok(self.0.to_string())
        }
    }

    fn agent(reply: &'static str) -> PromptedAgent {
        PromptedAgent::new(
            UnitKind::RiskAssessor,
            "risk",
            "Assess:\n{{ analysis_results }}",
            &["overall_risk_score"],
            Arc::new(CannedBackend(reply)),
        )
    }

    #[test]
    fn test_extract_json_from_fenced_block() {
        let reply = "Here you go:\n```json\n{\"a\": 1}\n```\nThanks";
        assert_eq!(extract_json(reply).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn test_extract_json_first_balanced_object_ignores_braces_in_strings() {
        let reply = r#"Result: {"note": "use {braces} carefully", "n": {"x": 2}} trailing }"#;
        assert_eq!(
            extract_json(reply).unwrap(),
            r#"{"note": "use {braces} carefully", "n": {"x": 2}}"#
        );
    }

    #[test]
    fn test_extract_json_without_object_fails() {
        assert!(matches!(
            extract_json("no structured data here"),
            Err(AgentError::ParseError(_))
        ));
    }

    #[test]
    fn test_render_prompt_pretty_prints_structured_fields() {
        let input = UnitInput::new().with("analysis_results", json!({"clauses": []}));
        let prompt = agent("{}").render_prompt(&input).unwrap();
        assert!(prompt.starts_with("Assess:\n{"));
        assert!(prompt.contains("\"clauses\": []"));
    }

    #[test]
    fn test_parse_reply_defaults_success_and_checks_required_fields() {
        let output = agent("").parse_reply(r#"{"overall_risk_score": 4.0}"#).unwrap();
        assert!(output.success);
        assert_eq!(output.field("overall_risk_score"), Some(&json!(4.0)));

        let err = agent("").parse_reply(r#"{"risky_clauses": []}"#).unwrap_err();
        assert!(err.to_string().contains("overall_risk_score"));
    }

    #[tokio::test]
    async fn test_execute_runs_full_pipeline() {
        let agent = agent("```json\n{\"overall_risk_score\": 7.5, \"confidence_score\": 0.8}\n```");
        let output = agent
            .execute(UnitInput::new().with("analysis_results", json!({})))
            .await
            .unwrap();

        assert_eq!(output.confidence_score, Some(0.8));
        assert!(!output.fallback_used);
    }
}
