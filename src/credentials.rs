//! Peer-account credential loading
//!
//! The two sides of a transfer live in different trust domains. One side
//! uses the default AWS credential chain; the other (the "peer") loads
//! static credentials from the environment or from an encrypted SSM
//! parameter holding a JSON document:
//! `{"aws_access_key_id": ..., "aws_secret_access_key": ..., "region": ...}`.

use aws_credential_types::Credentials;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

/// Errors while resolving peer credentials
#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("SSM error: {0}")]
    Ssm(String),

    #[error("parameter {0} has no value")]
    EmptyParameter(String),

    #[error("malformed credential document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("missing environment variables {0}")]
    MissingEnvironment(&'static str),
}

/// Static credentials for the peer trust domain
#[derive(Debug, Clone, Deserialize)]
pub struct PeerCredentials {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub region: String,
}

impl PeerCredentials {
    /// Convert into SDK credentials.
    pub fn to_sdk(&self) -> Credentials {
        Credentials::new(
            &self.aws_access_key_id,
            &self.aws_secret_access_key,
            None,
            None,
            "s3_shuttle-peer",
        )
    }

    /// Read credentials from `SHUTTLE_PEER_*` environment variables.
    pub fn from_env() -> Result<Self, CredentialsError> {
        let aws_access_key_id = std::env::var("SHUTTLE_PEER_ACCESS_KEY_ID").map_err(|_| {
            CredentialsError::MissingEnvironment(
                "SHUTTLE_PEER_ACCESS_KEY_ID / SHUTTLE_PEER_SECRET_ACCESS_KEY",
            )
        })?;
        let aws_secret_access_key =
            std::env::var("SHUTTLE_PEER_SECRET_ACCESS_KEY").map_err(|_| {
                CredentialsError::MissingEnvironment(
                    "SHUTTLE_PEER_ACCESS_KEY_ID / SHUTTLE_PEER_SECRET_ACCESS_KEY",
                )
            })?;
        let region =
            std::env::var("SHUTTLE_PEER_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        Ok(Self {
            aws_access_key_id,
            aws_secret_access_key,
            region,
        })
    }

    /// Fetch and decrypt the credential document from an SSM parameter.
    pub async fn from_ssm(
        client: &aws_sdk_ssm::Client,
        parameter_name: &str,
    ) -> Result<Self, CredentialsError> {
        let response = client
            .get_parameter()
            .name(parameter_name)
            .with_decryption(true)
            .send()
            .await
            .map_err(|e| CredentialsError::Ssm(format!("get_parameter failed: {e}")))?;

        let value = response
            .parameter
            .and_then(|p| p.value)
            .ok_or_else(|| CredentialsError::EmptyParameter(parameter_name.to_string()))?;

        let creds: PeerCredentials = serde_json::from_str(&value)?;
        info!(parameter_name, region = %creds.region, "loaded peer credentials from SSM");
        Ok(creds)
    }
}
