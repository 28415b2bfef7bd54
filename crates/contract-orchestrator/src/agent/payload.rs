//! Input and output payloads exchanged between the orchestrator and unit agents.
//!
//! A unit receives a [`UnitInput`]: a structured map holding exactly the
//! upstream outputs it depends on (plus the document for the analyzer). It
//! returns a [`UnitOutput`]: the common status envelope with unit-specific
//! fields flattened alongside.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;

/// Key holding the contract text in the analyzer's input.
pub const DOCUMENT_TEXT_KEY: &str = "document_text";
/// Key holding the original filename in the analyzer's input.
pub const FILENAME_KEY: &str = "filename";

/// Structured input handed to a unit.
///
/// Uses `Arc` internally so retries and fallbacks can share one copy.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UnitInput {
    inner: Arc<Map<String, JsonValue>>,
}

impl UnitInput {
    /// Creates an empty input.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the analyzer's input from the submitted document.
    pub fn document(document_text: impl Into<String>, filename: impl Into<String>) -> Self {
        Self::new()
            .with(DOCUMENT_TEXT_KEY, JsonValue::String(document_text.into()))
            .with(FILENAME_KEY, JsonValue::String(filename.into()))
    }

    /// Returns a copy of this input with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        Arc::make_mut(&mut self.inner).insert(key.into(), value);
        self
    }

    /// Looks up a field.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.inner.get(key)
    }

    /// Returns true if the field is present.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// The document text, if this is the analyzer's input.
    pub fn document_text(&self) -> Option<&str> {
        self.get(DOCUMENT_TEXT_KEY).and_then(JsonValue::as_str)
    }

    /// Field names, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.inner.keys()
    }

    /// Borrow the whole map, e.g. as a template rendering context.
    pub fn as_map(&self) -> &Map<String, JsonValue> {
        &self.inner
    }
}

impl From<Map<String, JsonValue>> for UnitInput {
    fn from(map: Map<String, JsonValue>) -> Self {
        Self {
            inner: Arc::new(map),
        }
    }
}

/// Output envelope every unit returns.
///
/// `success` is the unit's own verdict on its result; a unit that returns
/// `success: false` without erroring is classified as degraded rather than
/// failed. Unit-specific fields (clauses, risk scores, redlines, ...) live in
/// `data` and are flattened into the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutput {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub fallback_used: bool,
    #[serde(flatten)]
    pub data: Map<String, JsonValue>,
}

impl UnitOutput {
    /// A successful output with no unit-specific fields yet.
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
            confidence_score: None,
            fallback_used: false,
            data: Map::new(),
        }
    }

    /// An unsuccessful output carrying an error description.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            confidence_score: None,
            fallback_used: false,
            data: Map::new(),
        }
    }

    /// Adds a unit-specific field.
    pub fn with_field(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Sets the confidence score.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence_score = Some(confidence);
        self
    }

    /// Marks the output as produced by a fallback rule.
    pub fn as_fallback(mut self) -> Self {
        self.fallback_used = true;
        self
    }

    /// Looks up a unit-specific field.
    pub fn field(&self, key: &str) -> Option<&JsonValue> {
        self.data.get(key)
    }

    /// Serializes the envelope and its fields into a single JSON object.
    pub fn to_value(&self) -> JsonValue {
        let mut map = self.data.clone();
        map.insert("success".to_string(), JsonValue::Bool(self.success));
        map.insert("fallback_used".to_string(), JsonValue::Bool(self.fallback_used));
        if let Some(error) = &self.error {
            map.insert("error".to_string(), JsonValue::String(error.clone()));
        }
        if let Some(confidence) = self.confidence_score
            && let Some(number) = serde_json::Number::from_f64(confidence)
        {
            map.insert("confidence_score".to_string(), JsonValue::Number(number));
        }
        JsonValue::Object(map)
    }
}
