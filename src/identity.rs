//! Device identity and security-token plumbing
//!
//! A [`DeviceIdentity`] names one device (or one module on a device) on one
//! broker host and carries the credential used to authenticate it. The
//! credential is a [`TokenProvider`]: either a pre-signed static token or
//! something that mints fresh tokens on demand. The refresher only ever
//! sees the provider, never raw key material.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Default TLS port for the broker endpoint.
pub const DEFAULT_SECURE_PORT: u16 = 5671;

/// Failure minting a token. Providers wrap whatever their signing backend
/// reports; the refresher treats any provider failure as an authorization
/// problem.
pub type TokenProviderError = Box<dyn std::error::Error + Send + Sync>;

/// A security token together with its expiry instant.
#[derive(Clone, PartialEq, Eq)]
pub struct SecurityToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl SecurityToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// The raw token string, as handed to the control channel.
    pub fn value(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Remaining lifetime measured from `now`, zero if already expired.
    pub fn lifetime_from(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

// Token material stays out of debug output and logs.
impl fmt::Debug for SecurityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityToken")
            .field("token", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of security tokens for one identity.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Mint a token scoped to `audience`.
    async fn issue_token(&self, audience: &str) -> Result<SecurityToken, TokenProviderError>;
}

/// Provider wrapping one pre-signed token. Every issue call returns the
/// same token; once it expires the identity cannot be re-authenticated.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: SecurityToken,
}

impl StaticTokenProvider {
    pub fn new(token: SecurityToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn issue_token(&self, _audience: &str) -> Result<SecurityToken, TokenProviderError> {
        Ok(self.token.clone())
    }
}

/// Immutable identity of one device (or module) on one broker host.
///
/// Built once at client startup and cloned cheaply wherever the transport
/// needs it; the token provider is shared behind an [`Arc`].
#[derive(Clone)]
pub struct DeviceIdentity {
    host_name: String,
    device_id: String,
    module_id: Option<String>,
    audience: String,
    provider: Arc<dyn TokenProvider>,
}

impl DeviceIdentity {
    /// Identity for a device client.
    pub fn for_device(
        host_name: impl Into<String>,
        device_id: impl Into<String>,
        provider: Arc<dyn TokenProvider>,
    ) -> Self {
        let host_name = host_name.into();
        Self {
            audience: host_name.clone(),
            host_name,
            device_id: device_id.into(),
            module_id: None,
            provider,
        }
    }

    /// Identity for a module client on a device.
    pub fn for_module(
        host_name: impl Into<String>,
        device_id: impl Into<String>,
        module_id: impl Into<String>,
        provider: Arc<dyn TokenProvider>,
    ) -> Self {
        let host_name = host_name.into();
        Self {
            audience: host_name.clone(),
            host_name,
            device_id: device_id.into(),
            module_id: Some(module_id.into()),
            provider,
        }
    }

    /// Override the token audience. The default audience is the host name;
    /// narrower scoping (e.g. a single device resource) goes through here.
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn module_id(&self) -> Option<&str> {
        self.module_id.as_deref()
    }

    /// Audience string tokens are scoped to.
    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn token_provider(&self) -> &Arc<dyn TokenProvider> {
        &self.provider
    }

    /// Broker endpoint this identity connects to, always TLS on the
    /// default secure port.
    pub fn endpoint(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!(
            "amqps://{}:{}",
            self.host_name, DEFAULT_SECURE_PORT
        ))
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .field("module_id", &self.module_id)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn static_provider(expires_at: DateTime<Utc>) -> Arc<dyn TokenProvider> {
        Arc::new(StaticTokenProvider::new(SecurityToken::new(
            "SharedAccessSignature sig=abc",
            expires_at,
        )))
    }

    #[test]
    fn test_device_identity_defaults() {
        let expires = Utc::now() + chrono::Duration::hours(1);
        let identity =
            DeviceIdentity::for_device("contoso.example.net", "device-1", static_provider(expires));

        assert_eq!(identity.host_name(), "contoso.example.net");
        assert_eq!(identity.device_id(), "device-1");
        assert_eq!(identity.module_id(), None);
        assert_eq!(identity.audience(), "contoso.example.net");
    }

    #[test]
    fn test_module_identity_and_audience_override() {
        let expires = Utc::now() + chrono::Duration::hours(1);
        let identity = DeviceIdentity::for_module(
            "contoso.example.net",
            "device-1",
            "probe",
            static_provider(expires),
        )
        .with_audience("contoso.example.net/devices/device-1/modules/probe");

        assert_eq!(identity.module_id(), Some("probe"));
        assert_eq!(
            identity.audience(),
            "contoso.example.net/devices/device-1/modules/probe"
        );
    }

    #[test]
    fn test_endpoint_uses_default_secure_port() {
        let expires = Utc::now() + chrono::Duration::hours(1);
        let identity =
            DeviceIdentity::for_device("contoso.example.net", "device-1", static_provider(expires));

        let endpoint = identity.endpoint().unwrap();
        assert_eq!(endpoint.scheme(), "amqps");
        assert_eq!(endpoint.host_str(), Some("contoso.example.net"));
        assert_eq!(endpoint.port(), Some(5671));
    }

    #[test]
    fn test_token_lifetime_math() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let token = SecurityToken::new("tok", now + chrono::Duration::seconds(3600));

        assert_eq!(token.lifetime_from(now), Duration::from_secs(3600));
        assert!(!token.is_expired_at(now));

        let later = now + chrono::Duration::seconds(3601);
        assert!(token.is_expired_at(later));
        assert_eq!(token.lifetime_from(later), Duration::ZERO);
    }

    #[test]
    fn test_token_debug_redacts_value() {
        let token = SecurityToken::new("SharedAccessSignature sig=supersecret", Utc::now());
        let debug = format!("{token:?}");

        assert!(!debug.contains("supersecret"));
        assert!(debug.contains("***"));
    }

    #[tokio::test]
    async fn test_static_provider_returns_same_token() {
        // Arrange
        let expires = Utc::now() + chrono::Duration::hours(1);
        let provider = StaticTokenProvider::new(SecurityToken::new("tok-static", expires));

        // Act
        let first = provider.issue_token("contoso.example.net").await.unwrap();
        let second = provider.issue_token("contoso.example.net").await.unwrap();

        // Assert
        assert_eq!(first.value(), "tok-static");
        assert_eq!(first, second);
    }
}
