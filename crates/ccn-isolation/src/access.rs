//! Cross-tenant access attempts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of access being attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Read,
    Write,
    Send,
    AssumeRole,
    List,
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Send => "send",
            Self::AssumeRole => "assume_role",
            Self::List => "list",
        };
        f.write_str(name)
    }
}

/// One tenant context touching a resource
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessAttempt {
    pub source_tenant: String,
    pub target_tenant: String,
    pub access_type: AccessType,
    pub resource: String,
    pub blocked: bool,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl AccessAttempt {
    pub fn is_cross_tenant(&self) -> bool {
        self.source_tenant != self.target_tenant
    }
}
