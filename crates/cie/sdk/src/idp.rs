//! Identity provider seam of the authentication flow
//!
//! The card produces a signature over the service URL; turning it into a session is the job
//! of the national identity provider. The SDK only needs the redirect URL back, so the
//! exchange is hidden behind [`IdentityProvider`].

use std::fmt::Debug;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tracing::debug;
use url::Url;

use crate::error::ProtocolError;

/// Login endpoint relative to the IdP base URL
pub const LOGIN_PATH: &str = "Authn/SSL/Login2";

/// Errors reported by an identity provider
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdpError {
    /// The provider considers the user certificate expired
    #[error("User certificate expired")]
    CertificateExpired,

    /// The provider considers the user certificate revoked
    #[error("User certificate revoked")]
    CertificateRevoked,

    /// The provider could not be reached
    #[error("Network error: {0}")]
    Network(String),

    /// The provider answered with something unusable
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<IdpError> for ProtocolError {
    fn from(error: IdpError) -> Self {
        match error {
            IdpError::CertificateExpired => Self::CertificateExpired,
            IdpError::CertificateRevoked => Self::CertificateRevoked,
            other => Self::NetworkAuthError(other.to_string()),
        }
    }
}

/// Everything the provider needs to accept a signed assertion
#[derive(Debug, Clone, Copy)]
pub struct AuthenticationRequest<'a> {
    /// Service URL the user is logging into
    pub url: &'a Url,
    /// Card signature over the DigestInfo of `url`
    pub signature: &'a [u8],
    /// DER user certificate that verifies `signature`
    pub certificate: &'a [u8],
    /// Base URL of the identity provider
    pub idp_url: &'a Url,
}

/// Exchanges a signed assertion for the URL the caller continues with
pub trait IdentityProvider: Send + Sync + Debug {
    /// Submit the assertion and return the redirect URL
    fn authenticate(&self, request: &AuthenticationRequest<'_>) -> Result<String, IdpError>;
}

/// Provider that composes the login redirect locally
///
/// The resulting URL carries the original query of the service URL followed by the
/// signature as an unpadded base64url `assertion` parameter.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedirectIdentityProvider;

impl IdentityProvider for RedirectIdentityProvider {
    fn authenticate(&self, request: &AuthenticationRequest<'_>) -> Result<String, IdpError> {
        let mut redirect =
            login_url(request.idp_url).map_err(|e| IdpError::InvalidResponse(e.to_string()))?;

        let assertion = URL_SAFE_NO_PAD.encode(request.signature);
        let query = match request.url.query() {
            Some(query) if !query.is_empty() => format!("{query}&assertion={assertion}"),
            _ => format!("assertion={assertion}"),
        };
        redirect.set_query(Some(&query));

        debug!(host = ?redirect.host_str(), "Composed IdP redirect");
        Ok(redirect.into())
    }
}

/// [`LOGIN_PATH`] under `base`, keeping its last path segment
fn login_url(base: &Url) -> Result<Url, url::ParseError> {
    if base.path().ends_with('/') {
        return base.join(LOGIN_PATH);
    }
    let mut base = base.clone();
    let path = format!("{}/", base.path());
    base.set_path(&path);
    base.join(LOGIN_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_url() {
        let idp = Url::parse("https://idserver.servizicie.interno.gov.it/idp/").unwrap();
        let url = Url::parse("https://service.example/login?session=abc&lang=it").unwrap();
        let request = AuthenticationRequest {
            url: &url,
            signature: &[0xFB, 0xFF, 0x00],
            certificate: &[],
            idp_url: &idp,
        };

        let redirect = RedirectIdentityProvider.authenticate(&request).unwrap();
        assert_eq!(
            redirect,
            "https://idserver.servizicie.interno.gov.it/idp/Authn/SSL/Login2?session=abc&lang=it&assertion=-_8A"
        );
    }

    #[test]
    fn test_redirect_without_query() {
        let idp = Url::parse("http://localhost:8080/idp/").unwrap();
        let url = Url::parse("https://service.example/").unwrap();
        let request = AuthenticationRequest {
            url: &url,
            signature: &[0x01],
            certificate: &[],
            idp_url: &idp,
        };

        let redirect = RedirectIdentityProvider.authenticate(&request).unwrap();
        assert_eq!(redirect, "http://localhost:8080/idp/Authn/SSL/Login2?assertion=AQ");
    }

    #[test]
    fn test_login_url_keeps_base_path() {
        for base in ["https://idp.example/idp", "https://idp.example/idp/"] {
            let login = login_url(&Url::parse(base).unwrap()).unwrap();
            assert_eq!(login.as_str(), "https://idp.example/idp/Authn/SSL/Login2", "{base}");
        }
        let root = login_url(&Url::parse("https://idp.example").unwrap()).unwrap();
        assert_eq!(root.as_str(), "https://idp.example/Authn/SSL/Login2");
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            ProtocolError::from(IdpError::CertificateRevoked),
            ProtocolError::CertificateRevoked
        );
        assert_eq!(
            ProtocolError::from(IdpError::Network("refused".into())).name(),
            "AUTHENTICATION_ERROR"
        );
    }
}
