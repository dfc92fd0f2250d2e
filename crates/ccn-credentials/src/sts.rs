//! STS-backed identity exchange

use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_sts::config::{Credentials, Region};
use aws_sdk_sts::error::{ProvideErrorMetadata, SdkError};
use chrono::{DateTime, Utc};
use std::fmt;

use crate::exchange::{AssumeRoleRequest, ExchangeError, IdentityExchange, IssuedCredentials};
use crate::model::{CallerIdentity, ScopedCredentials};

const PROVIDER_NAME: &str = "ccn-scoped";

/// AWS STS exchange
#[derive(Clone)]
pub struct StsExchange {
    client: aws_sdk_sts::Client,
    sdk_config: SdkConfig,
}

impl StsExchange {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_sts::Client::new(sdk_config),
            sdk_config: sdk_config.clone(),
        }
    }

    /// Load the default provider chain, optionally pinning the region
    pub async fn from_env(region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let sdk_config = loader.load().await;
        Self::new(&sdk_config)
    }

    /// Client acting as the scoped credentials, not the process identity
    fn scoped_client(&self, credentials: &ScopedCredentials) -> aws_sdk_sts::Client {
        let provider = Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key().to_string(),
            Some(credentials.session_token().to_string()),
            Some(credentials.expiration.into()),
            PROVIDER_NAME,
        );
        let config = aws_sdk_sts::config::Builder::from(&self.sdk_config)
            .credentials_provider(provider)
            .region(Region::new(credentials.region.clone()))
            .build();
        aws_sdk_sts::Client::from_conf(config)
    }
}

#[async_trait]
impl IdentityExchange for StsExchange {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<IssuedCredentials, ExchangeError> {
        let output = self
            .client
            .assume_role()
            .role_arn(&request.role_arn)
            .role_session_name(&request.session_name)
            .duration_seconds(request.duration.as_secs().min(i32::MAX as u64) as i32)
            .set_external_id(request.external_id.clone())
            .send()
            .await
            .map_err(map_sdk_error)?;

        let credentials = output
            .credentials()
            .ok_or_else(|| ExchangeError::Malformed("AssumeRole returned no credentials".into()))?;

        let expiration = credentials.expiration();
        let expiration = DateTime::<Utc>::from_timestamp(expiration.secs(), expiration.subsec_nanos())
            .ok_or_else(|| ExchangeError::Malformed(format!("expiration out of range: {}", expiration)))?;

        Ok(IssuedCredentials {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().to_string(),
            expiration,
        })
    }

    async fn caller_identity(&self, credentials: &ScopedCredentials) -> Result<CallerIdentity, ExchangeError> {
        let output = self
            .scoped_client(credentials)
            .get_caller_identity()
            .send()
            .await
            .map_err(map_sdk_error)?;

        let account = output
            .account()
            .ok_or_else(|| ExchangeError::Malformed("GetCallerIdentity returned no account".into()))?;

        Ok(CallerIdentity {
            account: account.to_string(),
            arn: output.arn().unwrap_or_default().to_string(),
            user_id: output.user_id().unwrap_or_default().to_string(),
        })
    }
}

/// Map an SDK failure onto the exchange taxonomy by error code
fn map_sdk_error<E, R>(err: SdkError<E, R>) -> ExchangeError
where
    E: ProvideErrorMetadata,
    R: fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) => ExchangeError::Timeout,
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => ExchangeError::Transport(err.to_string()),
        SdkError::ServiceError(service) => {
            let inner = service.err();
            classify_code(
                inner.code().unwrap_or("Unknown"),
                inner.message().unwrap_or_default(),
            )
        }
        _ => ExchangeError::Transport(err.to_string()),
    }
}

fn classify_code(code: &str, message: &str) -> ExchangeError {
    match code {
        "AccessDenied" | "AccessDeniedException" | "ExpiredTokenException" | "ExpiredToken"
        | "InvalidClientTokenId" | "RegionDisabledException" => {
            ExchangeError::Denied(format!("{}: {}", code, message))
        }
        "Throttling" | "ThrottlingException" | "RequestLimitExceeded" => {
            ExchangeError::Throttled(format!("{}: {}", code, message))
        }
        "ServiceUnavailable" | "InternalFailure" | "IDPCommunicationError" => {
            ExchangeError::Transport(format!("{}: {}", code, message))
        }
        _ => ExchangeError::Rejected {
            code: code.to_string(),
            message: message.to_string(),
        },
    }
}

impl fmt::Debug for StsExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StsExchange")
            .field("region", &self.sdk_config.region())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccn_common::Classify;

    #[test]
    fn test_error_code_mapping() {
        assert!(matches!(classify_code("AccessDenied", "no"), ExchangeError::Denied(_)));
        assert!(matches!(
            classify_code("ExpiredTokenException", "expired"),
            ExchangeError::Denied(_)
        ));
        assert!(classify_code("Throttling", "rate exceeded").is_retryable());
        assert!(classify_code("IDPCommunicationError", "idp").is_retryable());
        assert!(matches!(
            classify_code("MalformedPolicyDocument", "bad"),
            ExchangeError::Rejected { code, .. } if code == "MalformedPolicyDocument"
        ));
    }
}
