//! Tenant Accounts and Registry

use crate::error::TenantError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

/// Maximum tenant code length
pub const MAX_TENANT_CODE_LEN: usize = 20;

fn tenant_code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9-]+$").expect("static regex"))
}

fn account_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d{12}$").expect("static regex"))
}

/// Service a tenant role is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Notification dispatch (email)
    Notification,
    /// Queue access
    Queue,
    /// Object storage access
    Storage,
}

impl ServiceKind {
    /// All supported services
    pub const ALL: [ServiceKind; 3] = [Self::Notification, Self::Queue, Self::Storage];

    /// Stable wire name, used in cache keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notification => "notification",
            Self::Queue => "queue",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = TenantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notification" => Ok(Self::Notification),
            "queue" => Ok(Self::Queue),
            "storage" => Ok(Self::Storage),
            other => Err(TenantError::UnsupportedService(other.to_string())),
        }
    }
}

/// Per-service role ARNs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRoles {
    pub notification_role_arn: String,
    pub queue_role_arn: String,
    pub storage_role_arn: String,
}

impl ServiceRoles {
    /// Role ARN for a service
    pub fn for_service(&self, service: ServiceKind) -> &str {
        match service {
            ServiceKind::Notification => &self.notification_role_arn,
            ServiceKind::Queue => &self.queue_role_arn,
            ServiceKind::Storage => &self.storage_role_arn,
        }
    }

    /// Iterate (service, role ARN) pairs
    pub fn iter(&self) -> impl Iterator<Item = (ServiceKind, &str)> {
        ServiceKind::ALL.into_iter().map(move |s| (s, self.for_service(s)))
    }
}

/// Resource identifiers owned by a tenant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TenantResources {
    pub notification_queue_url: Option<String>,
    pub bucket: Option<String>,
    pub sender_identity: Option<String>,
    pub topic_arns: Vec<String>,
}

impl TenantResources {
    /// Every configured identifier, labelled by field
    pub fn identifiers(&self) -> Vec<(&'static str, &str)> {
        let mut ids = Vec::new();
        if let Some(url) = &self.notification_queue_url {
            ids.push(("notificationQueueUrl", url.as_str()));
        }
        if let Some(bucket) = &self.bucket {
            ids.push(("bucket", bucket.as_str()));
        }
        if let Some(sender) = &self.sender_identity {
            ids.push(("senderIdentity", sender.as_str()));
        }
        for arn in &self.topic_arns {
            ids.push(("topicArn", arn.as_str()));
        }
        ids
    }
}

/// A tenant account. Immutable once loaded into the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantAccount {
    /// Unique lowercase code (alphanumeric + hyphen, ≤20 chars)
    pub code: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Cloud account id (12 digits)
    pub account_id: String,
    /// Home region
    pub region: String,
    /// Per-service role ARNs
    pub roles: ServiceRoles,
    /// Environment tag (prod, staging, ...)
    #[serde(default = "default_environment")]
    pub environment: String,
    /// External id passed on role assumption
    #[serde(default)]
    pub external_id: Option<String>,
    /// Owned resource identifiers
    #[serde(default)]
    pub resources: TenantResources,
    /// Notification recipients
    #[serde(default)]
    pub contacts: Vec<String>,
}

fn default_environment() -> String {
    "prod".into()
}

impl TenantAccount {
    /// Role ARN for a service
    pub fn role_arn(&self, service: ServiceKind) -> &str {
        self.roles.for_service(service)
    }

    /// Check code and account id format
    pub fn validate(&self) -> Result<(), TenantError> {
        if !is_valid_tenant_code(&self.code) {
            return Err(TenantError::InvalidTenant {
                code: self.code.clone(),
                reason: format!(
                    "code must be 1-{} chars of lowercase alphanumerics and hyphens",
                    MAX_TENANT_CODE_LEN
                ),
            });
        }
        if !account_id_pattern().is_match(&self.account_id) {
            return Err(TenantError::InvalidTenant {
                code: self.code.clone(),
                reason: format!("account id {:?} is not 12 digits", self.account_id),
            });
        }
        if self.region.trim().is_empty() {
            return Err(TenantError::InvalidTenant {
                code: self.code.clone(),
                reason: "region is empty".into(),
            });
        }
        Ok(())
    }
}

/// Tenant code format check
pub fn is_valid_tenant_code(code: &str) -> bool {
    !code.is_empty() && code.len() <= MAX_TENANT_CODE_LEN && tenant_code_pattern().is_match(code)
}

/// Build a cache key `<tenant>:<service>`
pub fn cache_key(tenant: &str, service: ServiceKind) -> String {
    format!("{}:{}", tenant, service.as_str())
}

/// Read-only tenant registry
#[derive(Debug, Clone, Default)]
pub struct TenantRegistry {
    tenants: BTreeMap<String, Arc<TenantAccount>>,
}

impl TenantRegistry {
    /// Build from accounts, rejecting invalid and duplicate entries
    pub fn new(accounts: Vec<TenantAccount>) -> Result<Self, TenantError> {
        let mut tenants = BTreeMap::new();
        for account in accounts {
            account.validate()?;
            if tenants.contains_key(&account.code) {
                return Err(TenantError::DuplicateTenant(account.code));
            }
            tenants.insert(account.code.clone(), Arc::new(account));
        }
        tracing::info!(tenants = tenants.len(), "Tenant registry loaded");
        Ok(Self { tenants })
    }

    /// Load a JSON array of tenant accounts
    pub fn from_json(json: &str) -> Result<Self, TenantError> {
        let accounts: Vec<TenantAccount> =
            serde_json::from_str(json).map_err(|e| TenantError::Load(e.to_string()))?;
        Self::new(accounts)
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TenantError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| TenantError::Load(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    /// Lookup tenant
    pub fn get(&self, code: &str) -> Option<Arc<TenantAccount>> {
        self.tenants.get(code).cloned()
    }

    /// Lookup tenant or fail with `UnknownTenant`
    pub fn require(&self, code: &str) -> Result<Arc<TenantAccount>, TenantError> {
        self.get(code)
            .ok_or_else(|| TenantError::UnknownTenant(code.to_string()))
    }

    /// Is the code registered
    pub fn contains(&self, code: &str) -> bool {
        self.tenants.contains_key(code)
    }

    /// Registered codes, sorted
    pub fn codes(&self) -> Vec<String> {
        self.tenants.keys().cloned().collect()
    }

    /// Iterate tenants
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TenantAccount>> {
        self.tenants.values()
    }

    /// Number of tenants
    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    /// Empty registry
    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

/// Test fixtures shared by downstream crates
#[doc(hidden)]
pub mod fixtures {
    use super::*;

    /// A well-formed tenant in `account_id`
    pub fn tenant(code: &str, account_id: &str) -> TenantAccount {
        TenantAccount {
            code: code.into(),
            name: code.to_uppercase(),
            account_id: account_id.into(),
            region: "us-east-1".into(),
            roles: ServiceRoles {
                notification_role_arn: format!("arn:aws:iam::{}:role/ccn-notification", account_id),
                queue_role_arn: format!("arn:aws:iam::{}:role/ccn-queue", account_id),
                storage_role_arn: format!("arn:aws:iam::{}:role/ccn-storage", account_id),
            },
            environment: "prod".into(),
            external_id: None,
            resources: TenantResources {
                notification_queue_url: Some(format!(
                    "https://sqs.us-east-1.amazonaws.com/{}/{}-notifications",
                    account_id, code
                )),
                bucket: Some(format!("{}-change-archive", code)),
                sender_identity: Some(format!("notify@{}.example.com", code)),
                topic_arns: vec![],
            },
            contacts: vec![format!("ops@{}.example.com", code)],
        }
    }

    /// Registry with `acme` (111111111111) and `globex` (222222222222)
    pub fn registry() -> TenantRegistry {
        TenantRegistry::new(vec![
            tenant("acme", "111111111111"),
            tenant("globex", "222222222222"),
        ])
        .expect("fixture registry")
    }
}
