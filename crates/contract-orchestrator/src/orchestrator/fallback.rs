//! Deterministic rule-based substitutes for unit outputs.
//!
//! Used when a unit is unavailable, errors, or times out, and by graceful
//! degradation. Every rule is a pure function of its input: no clock, no
//! randomness, no I/O. Every output carries `fallback_used: true`.

use crate::agent::{UnitInput, UnitKind, UnitOutput};
use serde_json::{Value as JsonValue, json};

const ANALYZER_CONFIDENCE: f64 = 0.6;
const MAX_FALLBACK_CLAUSES: usize = 10;
const MAX_FALLBACK_REDLINES: usize = 5;
const RISK_RETENTION_THRESHOLD: f64 = 5.0;
const MAX_CLAUSE_TEXT_CHARS: usize = 500;

/// Line keyword to clause type, checked in order; the first match wins.
const CLAUSE_KEYWORDS: &[(&str, &str)] = &[
    ("liability", "liability"),
    ("termination", "termination"),
    ("payment", "payment_terms"),
    ("confidential", "confidentiality"),
];

/// Risk keyword to score; a clause takes its highest matching score.
const RISK_KEYWORDS: &[(&str, f64)] = &[
    ("unlimited", 9.0),
    ("indemnification", 8.5),
    ("liability", 8.0),
    ("damages", 7.5),
    ("penalty", 7.0),
    ("termination", 6.0),
];

/// Produces fallback outputs for every unit kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackEngine;

impl FallbackEngine {
    pub fn new() -> Self {
        Self
    }

    /// Fallback output for `unit` given the same input the unit would have received.
    pub fn fallback(&self, unit: UnitKind, input: &UnitInput) -> UnitOutput {
        let output = match unit {
            UnitKind::Analyzer => self.analyze(input.document_text().unwrap_or_default()),
            UnitKind::RiskAssessor => self.assess_risk(input.get(UnitKind::Analyzer.output_key())),
            UnitKind::PrecedentResearcher => self.research_precedents(),
            UnitKind::Negotiator => self.negotiate(input.get(UnitKind::RiskAssessor.output_key())),
            UnitKind::Communicator => self.communicate(),
        };
        output.as_fallback()
    }

    /// Keyword scan of the document text, one clause per matching line.
    pub fn analyze(&self, document_text: &str) -> UnitOutput {
        let mut clauses: Vec<JsonValue> = document_text
            .lines()
            .enumerate()
            .filter_map(|(index, line)| {
                let lowered = line.to_lowercase();
                CLAUSE_KEYWORDS
                    .iter()
                    .find(|(keyword, _)| lowered.contains(keyword))
                    .map(|(_, clause_type)| {
                        json!({
                            "clause_type": clause_type,
                            "text": truncate(line.trim()),
                            "line_number": index + 1,
                            "confidence": ANALYZER_CONFIDENCE,
                        })
                    })
            })
            .take(MAX_FALLBACK_CLAUSES)
            .collect();

        if clauses.is_empty() {
            clauses.push(json!({
                "clause_type": "general",
                "text": truncate(document_text.trim()),
                "line_number": 1,
                "confidence": ANALYZER_CONFIDENCE,
            }));
        }

        let sections = document_text.lines().filter(|l| !l.trim().is_empty()).count();
        UnitOutput::success()
            .with_field("clauses", JsonValue::Array(clauses))
            .with_field(
                "document_structure",
                json!({
                    "document_type": "contract",
                    "sections": sections,
                    "method": "keyword_scan",
                }),
            )
            .with_confidence(ANALYZER_CONFIDENCE)
    }

    /// Keyword scoring of the upstream clauses.
    pub fn assess_risk(&self, analysis: Option<&JsonValue>) -> UnitOutput {
        let risky_clauses: Vec<JsonValue> = clauses_of(analysis, "clauses")
            .iter()
            .filter_map(|clause| {
                let text = clause.get("text").and_then(JsonValue::as_str).unwrap_or_default();
                let lowered = text.to_lowercase();
                let (keyword, score) = RISK_KEYWORDS
                    .iter()
                    .filter(|(keyword, _)| lowered.contains(keyword))
                    .max_by(|a, b| a.1.total_cmp(&b.1))?;
                let clause_type = clause
                    .get("clause_type")
                    .cloned()
                    .unwrap_or_else(|| JsonValue::from("general"));
                (*score >= RISK_RETENTION_THRESHOLD).then(|| {
                    json!({
                        "clause_type": clause_type,
                        "text": text,
                        "risk_score": score,
                        "risk_level": if *score >= 7.0 { "high" } else { "medium" },
                        "reason": format!("Contains high-risk term \"{keyword}\""),
                    })
                })
            })
            .collect();

        let overall = if risky_clauses.is_empty() {
            0.0
        } else {
            risky_clauses
                .iter()
                .filter_map(|c| c["risk_score"].as_f64())
                .sum::<f64>()
                / risky_clauses.len() as f64
        };

        UnitOutput::success()
            .with_field("risky_clauses", JsonValue::Array(risky_clauses))
            .with_field("overall_risk_score", json!(overall))
            .with_confidence(0.5)
    }

    /// Two canned precedent templates.
    pub fn research_precedents(&self) -> UnitOutput {
        UnitOutput::success()
            .with_field(
                "precedents",
                json!([
                    {
                        "category": "liability",
                        "title": "Mutual limitation of liability",
                        "summary": "Courts commonly enforce liability caps tied to fees paid under the agreement when both parties negotiated the cap.",
                        "relevance": 0.5,
                        "source": "fallback_template",
                    },
                    {
                        "category": "termination",
                        "title": "Termination for convenience with notice",
                        "summary": "Termination clauses are generally upheld when the notice period and post-termination obligations are stated explicitly.",
                        "relevance": 0.5,
                        "source": "fallback_template",
                    },
                ]),
            )
            .with_confidence(0.5)
    }

    /// One generic redline per risky clause, at most five.
    pub fn negotiate(&self, risk: Option<&JsonValue>) -> UnitOutput {
        let redlines: Vec<JsonValue> = clauses_of(risk, "risky_clauses")
            .iter()
            .take(MAX_FALLBACK_REDLINES)
            .map(|clause| {
                let clause_type = clause
                    .get("clause_type")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("general");
                json!({
                    "clause_type": clause_type,
                    "original_text": clause.get("text").cloned().unwrap_or(JsonValue::from("")),
                    "suggested_change": format!(
                        "Add limitation and clarification language to the {} clause.",
                        clause_type.replace('_', " ")
                    ),
                    "rationale": "Reduces exposure from broad or ambiguous obligations.",
                })
            })
            .collect();

        UnitOutput::success()
            .with_field("redlines", JsonValue::Array(redlines))
            .with_field(
                "negotiation_strategy",
                json!("Prioritize caps on liability and clear termination rights before commercial terms."),
            )
            .with_confidence(0.5)
    }

    /// Fixed client email and next steps.
    pub fn communicate(&self) -> UnitOutput {
        UnitOutput::success()
            .with_field(
                "email_draft",
                json!({
                    "subject": "Contract review summary",
                    "body": "We have completed an initial review of the contract and identified clauses that may need attention. A detailed review is recommended before signing.",
                }),
            )
            .with_field(
                "next_steps",
                json!([
                    "Review the flagged clauses with legal counsel",
                    "Prepare proposed redlines for the counterparty",
                    "Schedule a negotiation call",
                ]),
            )
            .with_confidence(0.5)
    }
}

fn clauses_of<'a>(upstream: Option<&'a JsonValue>, key: &str) -> &'a [JsonValue] {
    upstream
        .and_then(|value| value.get(key))
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn truncate(text: &str) -> String {
    text.chars().take(MAX_CLAUSE_TEXT_CHARS).collect()
}
