//! Inbound change messages and dead-letter envelopes

use ccn_common::TenantRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Message priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Inbound change notification request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMessage {
    #[serde(default)]
    pub change_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub customer_codes: Vec<String>,
    #[serde(default)]
    pub template_id: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Why a message was rejected before processing
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("malformed message body: {0}")]
    Malformed(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("duplicate tenant in customerCodes: {0}")]
    DuplicateTenant(String),

    #[error("tenant {tenant} failed isolation checks: {rules}")]
    IsolationViolation { tenant: String, rules: String },
}

impl ChangeMessage {
    pub fn parse(body: &str) -> Result<Self, MessageError> {
        serde_json::from_str(body).map_err(|e| MessageError::Malformed(e.to_string()))
    }

    /// Required fields present and every tenant registered
    pub fn validate(&self, registry: &TenantRegistry) -> Result<(), MessageError> {
        if self.change_id.trim().is_empty() {
            return Err(MessageError::MissingField("changeId"));
        }
        if self.title.trim().is_empty() {
            return Err(MessageError::MissingField("title"));
        }
        if self.template_id.trim().is_empty() {
            return Err(MessageError::MissingField("templateId"));
        }
        if self.customer_codes.is_empty() {
            return Err(MessageError::MissingField("customerCodes"));
        }

        let mut seen = std::collections::HashSet::new();
        for code in &self.customer_codes {
            if !registry.contains(code) {
                return Err(MessageError::UnknownTenant(code.clone()));
            }
            if !seen.insert(code.as_str()) {
                return Err(MessageError::DuplicateTenant(code.clone()));
            }
        }
        Ok(())
    }

    /// Initiator recorded on the execution
    pub fn initiator(&self) -> &str {
        if self.created_by.is_empty() {
            "unknown"
        } else {
            &self.created_by
        }
    }
}

/// Body sent to the dead-letter queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEnvelope {
    pub original_message: String,
    pub error: String,
    pub timestamp: String,
    pub processor: String,
}

impl DeadLetterEnvelope {
    pub fn new(original_message: &str, error: &str, processor: &str) -> Self {
        Self {
            original_message: original_message.to_string(),
            error: error.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            processor: processor.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccn_common::tenant::fixtures;

    #[test]
    fn test_parse_minimal_message() {
        let msg = ChangeMessage::parse(
            r#"{"changeId":"chg-1","title":"t","customerCodes":["acme"],"templateId":"x"}"#,
        )
        .unwrap();
        assert_eq!(msg.change_id, "chg-1");
        assert_eq!(msg.priority, Priority::Normal);
        assert_eq!(msg.initiator(), "unknown");
        assert!(msg.metadata.is_empty());
        assert!(msg.validate(&fixtures::registry()).is_ok());
    }

    #[test]
    fn test_parse_full_message() {
        let msg = ChangeMessage::parse(
            r#"{
                "changeId": "chg-2",
                "title": "DB maintenance",
                "description": "Failover drill",
                "customerCodes": ["acme", "globex"],
                "templateId": "maintenance",
                "priority": "high",
                "createdBy": "alice",
                "createdAt": "2026-01-05T10:00:00Z",
                "metadata": {"window": "2h"}
            }"#,
        )
        .unwrap();
        assert_eq!(msg.priority, Priority::High);
        assert_eq!(msg.initiator(), "alice");
        assert!(msg.created_at.is_some());
        assert_eq!(msg.metadata["window"], "2h");
    }

    #[test]
    fn test_malformed_body() {
        assert!(matches!(ChangeMessage::parse("not json"), Err(MessageError::Malformed(_))));
        assert!(matches!(
            ChangeMessage::parse(r#"{"customerCodes": "acme"}"#),
            Err(MessageError::Malformed(_))
        ));
    }

    #[test]
    fn test_validation_failures() {
        let registry = fixtures::registry();
        let base = r#"{"changeId":"chg-1","title":"t","customerCodes":["acme"],"templateId":"x"}"#;
        let mut msg = ChangeMessage::parse(base).unwrap();

        msg.change_id.clear();
        assert_eq!(msg.validate(&registry), Err(MessageError::MissingField("changeId")));

        let mut msg = ChangeMessage::parse(base).unwrap();
        msg.template_id = "  ".into();
        assert_eq!(msg.validate(&registry), Err(MessageError::MissingField("templateId")));

        let mut msg = ChangeMessage::parse(base).unwrap();
        msg.customer_codes.clear();
        assert_eq!(msg.validate(&registry), Err(MessageError::MissingField("customerCodes")));

        let mut msg = ChangeMessage::parse(base).unwrap();
        msg.customer_codes = vec!["unknown".into()];
        assert_eq!(msg.validate(&registry), Err(MessageError::UnknownTenant("unknown".into())));

        let mut msg = ChangeMessage::parse(base).unwrap();
        msg.customer_codes = vec!["acme".into(), "acme".into()];
        assert_eq!(msg.validate(&registry), Err(MessageError::DuplicateTenant("acme".into())));
    }

    #[test]
    fn test_dead_letter_envelope_shape() {
        let envelope = DeadLetterEnvelope::new("{bad", "malformed message body", "ccn-pipeline");
        let json: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(json["originalMessage"], "{bad");
        assert_eq!(json["processor"], "ccn-pipeline");
        let ts = json["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }
}
