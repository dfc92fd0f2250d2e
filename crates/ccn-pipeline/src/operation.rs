//! Tenant operations
//!
//! A [`TenantOperation`] is the work performed in one tenant's account for
//! one change message. The shipped operation builds a [`Notification`] and
//! hands it to a [`NotificationSender`]; rendering and delivering the email
//! itself happens downstream of the tenant's notification queue.

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sqs::config::{Credentials, Region};
use ccn_common::{Classify, ErrorCategory, ServiceKind, TenantAccount};
use ccn_credentials::ScopedClientConfig;
use ccn_isolation::AccessType;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use thiserror::Error;

use crate::message::{ChangeMessage, Priority};
use crate::queue::QueueError;
use crate::sqs::map_sdk_error;

const PROVIDER_NAME: &str = "ccn-tenant-scope";

/// Tenant operation failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperationError {
    /// Input the operation can never accept
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("tenant {tenant} has no {resource} configured")]
    MissingResource { tenant: String, resource: &'static str },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("failed to encode notification: {0}")]
    Encoding(String),
}

impl Classify for OperationError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Rejected(_) | Self::MissingResource { .. } | Self::Encoding(_) => ErrorCategory::Validation,
            Self::Queue(e) => e.category(),
        }
    }
}

/// Work performed inside one tenant's account
#[async_trait]
pub trait TenantOperation: Send + Sync {
    fn name(&self) -> &'static str;

    /// Service whose role the operation runs under
    fn service(&self) -> ServiceKind;

    /// Tenant resources the operation touches. Each is checked against the
    /// isolation policy before [`execute`](Self::execute) runs.
    fn resources<'a>(&self, _tenant: &'a TenantAccount) -> Vec<(AccessType, &'a str)> {
        Vec::new()
    }

    /// Perform the work, returning the downstream identifier if there is one
    async fn execute(&self, change: &ChangeMessage, scope: &ScopedClientConfig) -> Result<Option<String>, OperationError>;
}

/// Notification handed to the tenant's delivery channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub change_id: String,
    pub tenant_code: String,
    pub template_id: String,
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
    pub sender: Option<String>,
    pub priority: Priority,
    pub metadata: Map<String, Value>,
}

impl Notification {
    pub fn for_tenant(change: &ChangeMessage, tenant: &TenantAccount) -> Result<Self, OperationError> {
        if tenant.contacts.is_empty() {
            return Err(OperationError::MissingResource {
                tenant: tenant.code.clone(),
                resource: "contacts",
            });
        }

        let subject = match change.priority {
            Priority::High | Priority::Critical => format!("[URGENT] {}", change.title),
            _ => change.title.clone(),
        };

        Ok(Self {
            change_id: change.change_id.clone(),
            tenant_code: tenant.code.clone(),
            template_id: change.template_id.clone(),
            subject,
            body: change.description.clone(),
            recipients: tenant.contacts.clone(),
            sender: tenant.resources.sender_identity.clone(),
            priority: change.priority,
            metadata: change.metadata.clone(),
        })
    }
}

/// Delivers a notification using tenant-scoped credentials
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Returns the message id assigned by the delivery channel
    async fn send(&self, scope: &ScopedClientConfig, notification: &Notification) -> Result<String, OperationError>;
}

/// Builds a notification per tenant and sends it
pub struct NotificationOperation {
    sender: std::sync::Arc<dyn NotificationSender>,
}

impl NotificationOperation {
    pub fn new(sender: std::sync::Arc<dyn NotificationSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl TenantOperation for NotificationOperation {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn service(&self) -> ServiceKind {
        ServiceKind::Notification
    }

    fn resources<'a>(&self, tenant: &'a TenantAccount) -> Vec<(AccessType, &'a str)> {
        tenant
            .resources
            .notification_queue_url
            .as_deref()
            .map(|url| vec![(AccessType::Send, url)])
            .unwrap_or_default()
    }

    async fn execute(&self, change: &ChangeMessage, scope: &ScopedClientConfig) -> Result<Option<String>, OperationError> {
        let notification = Notification::for_tenant(change, &scope.tenant)?;
        let message_id = self.sender.send(scope, &notification).await?;
        tracing::debug!(
            tenant = %scope.tenant.code,
            change_id = %change.change_id,
            message_id = %message_id,
            recipients = notification.recipients.len(),
            "Notification dispatched"
        );
        Ok(Some(message_id))
    }
}

/// Sends the notification JSON to the tenant's own notification queue,
/// acting as the tenant's scoped role
#[derive(Clone)]
pub struct SqsNotificationSender {
    sdk_config: SdkConfig,
}

impl SqsNotificationSender {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            sdk_config: sdk_config.clone(),
        }
    }

    fn scoped_client(&self, scope: &ScopedClientConfig) -> aws_sdk_sqs::Client {
        let credentials = &scope.credentials;
        let provider = Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key().to_string(),
            Some(credentials.session_token().to_string()),
            Some(credentials.expiration.into()),
            PROVIDER_NAME,
        );
        let config = aws_sdk_sqs::config::Builder::from(&self.sdk_config)
            .credentials_provider(provider)
            .region(Region::new(scope.region.clone()))
            .build();
        aws_sdk_sqs::Client::from_conf(config)
    }
}

#[async_trait]
impl NotificationSender for SqsNotificationSender {
    async fn send(&self, scope: &ScopedClientConfig, notification: &Notification) -> Result<String, OperationError> {
        let queue_url = scope
            .tenant
            .resources
            .notification_queue_url
            .as_deref()
            .ok_or_else(|| OperationError::MissingResource {
                tenant: scope.tenant.code.clone(),
                resource: "notification queue",
            })?;
        let body = serde_json::to_string(notification).map_err(|e| OperationError::Encoding(e.to_string()))?;

        let output = self
            .scoped_client(scope)
            .send_message()
            .queue_url(queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(output.message_id().unwrap_or_default().to_string())
    }
}

impl fmt::Debug for SqsNotificationSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsNotificationSender")
            .field("region", &self.sdk_config.region())
            .finish()
    }
}

/// In-memory sender (for testing and development)
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(String, Notification)>>,
    scripted: Mutex<HashMap<String, VecDeque<OperationError>>>,
    always_failing: Mutex<HashMap<String, OperationError>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next sends for `tenant` with `errors`, in order
    pub fn script_failures(&self, tenant: &str, errors: Vec<OperationError>) {
        self.scripted
            .lock()
            .entry(tenant.to_string())
            .or_default()
            .extend(errors);
    }

    /// Fail every send for `tenant`
    pub fn always_fail(&self, tenant: &str, error: OperationError) {
        self.always_failing.lock().insert(tenant.to_string(), error);
    }

    /// Successful sends as (role ARN used, notification)
    pub fn sent(&self) -> Vec<(String, Notification)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, tenant: &str) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|(_, n)| n.tenant_code == tenant)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn attempts(&self, tenant: &str) -> u32 {
        self.attempts.lock().get(tenant).copied().unwrap_or(0)
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, scope: &ScopedClientConfig, notification: &Notification) -> Result<String, OperationError> {
        let tenant = notification.tenant_code.as_str();
        *self.attempts.lock().entry(tenant.to_string()).or_insert(0) += 1;

        if let Some(error) = self.always_failing.lock().get(tenant) {
            return Err(error.clone());
        }
        let scripted = self.scripted.lock().get_mut(tenant).and_then(VecDeque::pop_front);
        if let Some(error) = scripted {
            return Err(error);
        }

        let mut sent = self.sent.lock();
        sent.push((scope.credentials.role_arn.clone(), notification.clone()));
        Ok(format!("msg-{}", sent.len()))
    }
}
