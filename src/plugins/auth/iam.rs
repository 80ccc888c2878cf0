//! `iam` authentication plugin
//!
//! The client logs in with its AWS access key id as the user name and the
//! secret access key as a cleartext password. The pair is checked by
//! calling IAM `GetUser` with it as the request credentials; on success
//! the gateway logs in to the upstream with its own service account.
//! `InvalidClientTokenId` and `SignatureDoesNotMatch` mean a bad pair;
//! any other IAM failure is a plugin error.
//!
//! The secret travels in cleartext, so the plugin refuses sessions that
//! did not negotiate SSL.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_sdk_iam::config::Credentials;
use aws_sdk_iam::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_types::region::Region;
use serde::Deserialize;
use zeroize::Zeroizing;

use super::default_port;
use crate::error::{GatewayError, Result};
use crate::plugins::AuthPlugin;
use crate::server::{PasswordMethod, Session};

const DEFAULT_REGION: &str = "us-east-1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// IAM error codes meaning the key pair itself was refused
const REJECTED_KEY_CODES: &[&str] = &["InvalidClientTokenId", "SignatureDoesNotMatch"];

/// Config for the `iam` plugin
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IamAuthConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Upstream service-account user
    pub db: String,

    /// Upstream service-account password
    pub password: String,

    #[serde(default)]
    pub region: Option<String>,

    /// IAM endpoint override
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Allowed databases; empty allows all
    #[serde(default)]
    pub databases: Vec<String>,
}

/// Checks an access-key pair.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// `Ok(false)` when the identity provider rejects the pair.
    async fn verify(&self, access_key_id: &str, secret_access_key: &str) -> Result<bool>;
}

/// [`IdentityVerifier`] backed by AWS IAM `GetUser`.
pub struct AwsIamVerifier {
    endpoint: Option<String>,
    region: Region,
}

impl AwsIamVerifier {
    pub fn new(endpoint: Option<&str>, region: Option<&str>) -> Result<Self> {
        if let Some(endpoint) = endpoint {
            let scheme_ok = endpoint
                .split_once("://")
                .is_some_and(|(scheme, rest)| {
                    matches!(scheme, "http" | "https") && !rest.is_empty()
                });
            if !scheme_ok {
                return Err(GatewayError::Config(format!(
                    "invalid IAM endpoint {}: expected an http(s) URL",
                    endpoint
                )));
            }
        }

        Ok(Self {
            endpoint: endpoint.map(str::to_string),
            region: Region::new(region.unwrap_or(DEFAULT_REGION).to_string()),
        })
    }

    async fn client(&self, access_key_id: &str, secret_access_key: &str) -> aws_sdk_iam::Client {
        let credentials = Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "pggateway",
        );
        let mut config_loader = aws_config::defaults(BehaviorVersion::latest())
            .region(self.region.clone())
            .credentials_provider(credentials)
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(REQUEST_TIMEOUT)
                    .build(),
            );
        if let Some(endpoint) = &self.endpoint {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        let sdk_config = config_loader.load().await;
        aws_sdk_iam::Client::new(&sdk_config)
    }
}

#[async_trait]
impl IdentityVerifier for AwsIamVerifier {
    async fn verify(&self, access_key_id: &str, secret_access_key: &str) -> Result<bool> {
        let client = self.client(access_key_id, secret_access_key).await;

        match client.get_user().send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                let code = err.as_service_error().and_then(|e| e.code());
                if code.is_some_and(|code| REJECTED_KEY_CODES.contains(&code)) {
                    debug!("IAM rejected access key {}: {:?}", access_key_id, code);
                    return Ok(false);
                }
                Err(GatewayError::Plugin(format!(
                    "IAM GetUser failed: {}",
                    DisplayErrorContext(&err)
                )))
            }
        }
    }
}

/// IAM-delegated login.
pub struct IamAuth {
    config: IamAuthConfig,
    verifier: Box<dyn IdentityVerifier>,
}

impl IamAuth {
    pub fn new(config: IamAuthConfig) -> Result<Self> {
        let verifier = AwsIamVerifier::new(config.endpoint.as_deref(), config.region.as_deref())?;
        Ok(Self::with_verifier(config, Box::new(verifier)))
    }

    /// Use a custom identity check instead of AWS.
    pub fn with_verifier(config: IamAuthConfig, verifier: Box<dyn IdentityVerifier>) -> Self {
        Self { config, verifier }
    }
}

#[async_trait]
impl AuthPlugin for IamAuth {
    async fn authenticate(&self, session: &mut Session) -> Result<bool> {
        if !session.is_ssl() {
            return Err(GatewayError::Auth("IAM auth requires an SSL session".into()));
        }

        let (_, password) = session.get_user_password(PasswordMethod::Cleartext).await?;
        let secret = Zeroizing::new(String::from_utf8_lossy(password.password()).into_owned());

        let access_key_id = session.user().to_string();
        if !self.verifier.verify(&access_key_id, &secret).await? {
            return Ok(false);
        }

        session.dial_to_s(&self.config.host, self.config.port).await?;
        session
            .auth_on_server(&self.config.db, &self.config.password)
            .await?;
        Ok(true)
    }

    fn allowed_databases(&self, _user: &str) -> &[String] {
        &self.config.databases
    }
}
