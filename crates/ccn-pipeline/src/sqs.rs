//! SQS-backed queue adapters

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sqs::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use std::fmt;
use std::time::Duration;

use crate::queue::{DeadLetterQueue, QueueClient, QueueError, QueueMessage};

/// SQS caps a single receive at 10 messages and a long poll at 20 s
const MAX_RECEIVE_BATCH: u32 = 10;
const MAX_WAIT_SECS: u64 = 20;

/// Primary queue on SQS
#[derive(Clone)]
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    visibility_timeout: Option<Duration>,
}

impl SqsQueue {
    pub fn new(sdk_config: &SdkConfig, queue_url: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_sqs::Client::new(sdk_config),
            queue_url: queue_url.into(),
            visibility_timeout: None,
        }
    }

    /// Override the queue's default visibility timeout on receive
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

#[async_trait]
impl QueueClient for SqsQueue {
    async fn receive(&self, max_messages: u32, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.clamp(1, MAX_RECEIVE_BATCH) as i32)
            .wait_time_seconds(wait.as_secs().min(MAX_WAIT_SECS) as i32)
            .set_visibility_timeout(self.visibility_timeout.map(|t| t.as_secs() as i32))
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(map_sdk_error)?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|message| {
                let receipt_handle = message.receipt_handle()?.to_string();
                let receive_count = message
                    .attributes()
                    .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                    .and_then(|count| count.parse().ok())
                    .unwrap_or(1);
                Some(QueueMessage {
                    message_id: message.message_id().unwrap_or_default().to_string(),
                    receipt_handle,
                    body: message.body().unwrap_or_default().to_string(),
                    receive_count,
                })
            })
            .collect();
        Ok(messages)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(map_sdk_error)?;

        output
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|count| count.parse().ok())
            .ok_or_else(|| QueueError::Service {
                code: "MissingAttribute".into(),
                message: "ApproximateNumberOfMessages not returned".into(),
            })
    }
}

impl fmt::Debug for SqsQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsQueue").field("queue_url", &self.queue_url).finish()
    }
}

/// Dead-letter destination on SQS
#[derive(Clone)]
pub struct SqsDeadLetterQueue {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsDeadLetterQueue {
    pub fn new(sdk_config: &SdkConfig, queue_url: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_sqs::Client::new(sdk_config),
            queue_url: queue_url.into(),
        }
    }
}

#[async_trait]
impl DeadLetterQueue for SqsDeadLetterQueue {
    async fn send(&self, body: &str) -> Result<(), QueueError> {
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }
}

impl fmt::Debug for SqsDeadLetterQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsDeadLetterQueue")
            .field("queue_url", &self.queue_url)
            .finish()
    }
}

/// Map an SDK failure onto the queue taxonomy by error code
pub(crate) fn map_sdk_error<E, R>(err: SdkError<E, R>) -> QueueError
where
    E: ProvideErrorMetadata,
    R: fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) => QueueError::Timeout,
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => QueueError::Transport(err.to_string()),
        SdkError::ServiceError(service) => {
            let inner = service.err();
            classify_code(inner.code().unwrap_or("Unknown"), inner.message().unwrap_or_default())
        }
        _ => QueueError::Transport(err.to_string()),
    }
}

fn classify_code(code: &str, message: &str) -> QueueError {
    let detail = format!("{}: {}", code, message);
    match code {
        "AccessDenied" | "AccessDeniedException" | "InvalidClientTokenId" | "ExpiredToken"
        | "KmsAccessDenied" => QueueError::Denied(detail),
        "RequestThrottled" | "ThrottlingException" | "Throttling" | "KmsThrottled" => {
            QueueError::Throttled(detail)
        }
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => QueueError::NotFound(detail),
        "ReceiptHandleIsInvalid" | "InvalidIdFormat" => QueueError::InvalidReceipt(detail),
        "ServiceUnavailable" | "InternalError" | "InternalFailure" => QueueError::Transport(detail),
        _ => QueueError::Service {
            code: code.to_string(),
            message: message.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccn_common::{Classify, ErrorCategory};

    #[test]
    fn test_error_code_mapping() {
        assert!(matches!(classify_code("AccessDenied", "no"), QueueError::Denied(_)));
        assert!(classify_code("RequestThrottled", "slow").is_retryable());
        assert!(classify_code("ServiceUnavailable", "later").is_retryable());
        assert_eq!(
            classify_code("QueueDoesNotExist", "gone").category(),
            ErrorCategory::Validation
        );
        assert!(matches!(
            classify_code("OverLimit", "too many"),
            QueueError::Service { code, .. } if code == "OverLimit"
        ));
    }
}
