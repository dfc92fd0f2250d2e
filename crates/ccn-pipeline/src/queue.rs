//! Queue collaborators

use async_trait::async_trait;
use ccn_common::{Classify, ErrorCategory};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

/// A received message, owned until deleted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub receive_count: u32,
}

/// Queue errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue throttled: {0}")]
    Throttled(String),

    #[error("queue request timed out")]
    Timeout,

    #[error("queue transport error: {0}")]
    Transport(String),

    #[error("queue access denied: {0}")]
    Denied(String),

    #[error("queue not found: {0}")]
    NotFound(String),

    #[error("unknown receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("queue error {code}: {message}")]
    Service { code: String, message: String },
}

impl Classify for QueueError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::Throttled(_) => ErrorCategory::Throttling,
            Self::Timeout => ErrorCategory::Timeout,
            Self::Transport(_) => ErrorCategory::Network,
            Self::Denied(_) => ErrorCategory::PermissionDenied,
            Self::NotFound(_) | Self::InvalidReceipt(_) => ErrorCategory::Validation,
            Self::Service { .. } => ErrorCategory::Internal,
        }
    }
}

/// Source queue
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Long-poll for up to `max_messages`, waiting at most `wait`
    async fn receive(&self, max_messages: u32, wait: Duration) -> Result<Vec<QueueMessage>, QueueError>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Approximate visible message count
    async fn depth(&self) -> Result<u64, QueueError>;
}

/// Dead-letter destination
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn send(&self, body: &str) -> Result<(), QueueError>;
}

#[derive(Debug, Default)]
struct InMemoryState {
    visible: VecDeque<QueueMessage>,
    in_flight: HashMap<String, QueueMessage>,
    deleted: Vec<String>,
    next_id: u64,
    receipts: u64,
}

/// In-memory queue (for testing and development).
///
/// Received messages move to an in-flight set until deleted or released
/// back with [`InMemoryQueue::release_in_flight`].
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<InMemoryState>,
    arrivals: Notify,
    receive_calls: AtomicU64,
    scripted_failures: Mutex<VecDeque<QueueError>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a body, returning its message id
    pub fn push(&self, body: impl Into<String>) -> String {
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            let id = format!("msg-{}", state.next_id);
            state.visible.push_back(QueueMessage {
                message_id: id.clone(),
                receipt_handle: String::new(),
                body: body.into(),
                receive_count: 0,
            });
            id
        };
        self.arrivals.notify_waiters();
        id
    }

    /// Fail the next receive with `error`
    pub fn fail_next_receive(&self, error: QueueError) {
        self.scripted_failures.lock().push_back(error);
    }

    /// Make in-flight messages visible again, as a visibility timeout would
    pub fn release_in_flight(&self) -> usize {
        let mut state = self.state.lock();
        let released: Vec<QueueMessage> = state.in_flight.drain().map(|(_, m)| m).collect();
        let count = released.len();
        state.visible.extend(released);
        drop(state);
        if count > 0 {
            self.arrivals.notify_waiters();
        }
        count
    }

    pub fn visible_len(&self) -> usize {
        self.state.lock().visible.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Message ids deleted so far, in order
    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    pub fn receive_calls(&self) -> u64 {
        self.receive_calls.load(Ordering::Relaxed)
    }

    fn take(&self, max_messages: u32) -> Vec<QueueMessage> {
        let mut state = self.state.lock();
        let mut taken = Vec::new();
        while taken.len() < max_messages as usize {
            let Some(mut message) = state.visible.pop_front() else {
                break;
            };
            state.receipts += 1;
            message.receipt_handle = format!("{}#{}", message.message_id, state.receipts);
            message.receive_count += 1;
            state.in_flight.insert(message.receipt_handle.clone(), message.clone());
            taken.push(message);
        }
        taken
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn receive(&self, max_messages: u32, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        self.receive_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(error) = self.scripted_failures.lock().pop_front() {
            return Err(error);
        }

        let arrived = self.arrivals.notified();
        let taken = self.take(max_messages);
        if !taken.is_empty() || wait.is_zero() {
            return Ok(taken);
        }
        let _ = tokio::time::timeout(wait, arrived).await;
        Ok(self.take(max_messages))
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let message = state
            .in_flight
            .remove(receipt_handle)
            .ok_or_else(|| QueueError::InvalidReceipt(receipt_handle.to_string()))?;
        state.deleted.push(message.message_id);
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().visible.len() as u64)
    }
}

/// In-memory dead-letter queue (for testing and development)
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterQueue {
    messages: Mutex<Vec<String>>,
    fail_sends: std::sync::atomic::AtomicBool,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Make every send fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl DeadLetterQueue for InMemoryDeadLetterQueue {
    async fn send(&self, body: &str) -> Result<(), QueueError> {
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(QueueError::Transport("dead-letter queue unavailable".into()));
        }
        self.messages.lock().push(body.to_string());
        Ok(())
    }
}
