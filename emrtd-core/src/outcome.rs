//! Final validation outcome delivered by the RESULT message.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Result of a server-side authentication check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckResult {
    /// Check passed.
    Success,
    /// Check ran and failed.
    Failed,
    /// Check could not run (chip lacks the capability).
    Unavailable,
}

/// Structured validation result.
///
/// Immutable once constructed: fields are only readable through accessors.
/// Document fields the connector does not interpret are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    #[serde(default)]
    passive_authentication: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    passive_authentication_details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chip_authentication_result: Option<CheckResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    active_authentication_result: Option<CheckResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
    #[serde(flatten)]
    document: Map<String, Value>,
}

impl ValidationOutcome {
    /// Whether passive authentication verified the data groups.
    pub fn passive_authentication(&self) -> bool {
        self.passive_authentication
    }

    /// Server-provided passive authentication details.
    pub fn passive_authentication_details(&self) -> Option<&Value> {
        self.passive_authentication_details.as_ref()
    }

    /// Chip authentication result, if reported.
    pub fn chip_authentication_result(&self) -> Option<CheckResult> {
        self.chip_authentication_result
    }

    /// Active authentication result, if reported.
    pub fn active_authentication_result(&self) -> Option<CheckResult> {
        self.active_authentication_result
    }

    /// Errors reported by the server.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Any other document field (e.g. `mrzInfo`, `facePhoto`).
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.document.get(name)
    }

    /// All uninterpreted document fields.
    pub fn document(&self) -> &Map<String, Value> {
        &self.document
    }

    /// Passive authentication succeeded and no genuineness check failed.
    pub fn is_valid(&self) -> bool {
        self.passive_authentication
            && self.chip_authentication_result != Some(CheckResult::Failed)
            && self.active_authentication_result != Some(CheckResult::Failed)
    }

    /// Serialize back to the server's JSON shape.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
