//! Reader configuration
//!
//! Values are layered with `figment`: built-in defaults, then `~/.cie/cie.toml` (or an explicit
//! file), then `CIE_`-prefixed environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use rsa::{BigUint, RsaPublicKey};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::certificate::TrustStore;
use crate::session::SessionOptions;
use crate::validation::{ValidationError, validate_url};

/// Default identity provider base URL
pub const DEFAULT_IDP_URL: &str = "https://idserver.servizicie.interno.gov.it/idp/";

/// Default operation timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Default connector poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No home directory to look for the default file in
    #[error("home directory not found")]
    HomeNotFound,

    /// A provider failed or a value has the wrong type
    #[error(transparent)]
    Extract(#[from] Box<figment::Error>),

    /// A trust anchor entry is not usable
    #[error("invalid trust anchor {reference}: {reason}")]
    InvalidAnchor {
        /// Reference as written in the configuration
        reference: String,
        /// What is wrong with it
        reason: String,
    },

    /// A revocation entry is not hex
    #[error("invalid revocation entry {0}")]
    InvalidRevoked(String),

    /// The identity provider URL is not usable
    #[error("invalid idp_url: {0}")]
    InvalidIdpUrl(#[from] ValidationError),
}

/// RSA key trusted to sign chip certificates, hex encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustAnchorConfig {
    /// Certification authority reference
    pub reference: String,
    /// Big-endian modulus
    pub modulus: String,
    /// Big-endian public exponent
    pub exponent: String,
}

/// Reader configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CieConfig {
    /// Identity provider base URL
    pub idp_url: String,
    /// Operation timeout in milliseconds
    pub timeout_ms: u64,
    /// Connector poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Keys that sign chip certificates
    pub trust_anchors: Vec<TrustAnchorConfig>,
    /// Revoked holder references and certificate serial numbers, hex encoded
    pub revoked: Vec<String>,
}

impl Default for CieConfig {
    fn default() -> Self {
        Self {
            idp_url: DEFAULT_IDP_URL.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            trust_anchors: Vec::new(),
            revoked: Vec::new(),
        }
    }
}

/// Base config directory, `~/.cie`
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    std::env::home_dir()
        .map(|home| home.join(".cie"))
        .ok_or(ConfigError::HomeNotFound)
}

impl CieConfig {
    fn figment(file: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("CIE_"))
    }

    /// Load from `~/.cie/cie.toml` and the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(config_dir()?.join("cie.toml"))
    }

    /// Load from an explicit file and the environment
    ///
    /// A missing file is not an error, defaults and environment still apply.
    pub fn load_from(file: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(Self::figment(file.as_ref()).extract().map_err(Box::new)?)
    }

    /// Parsed identity provider base URL
    pub fn idp_url(&self) -> Result<Url, ConfigError> {
        Ok(validate_url(&self.idp_url)?)
    }

    /// Timing parameters for a session
    pub const fn session_options(&self) -> SessionOptions {
        SessionOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    /// Build the trust store used to verify chip and user certificates
    pub fn trust_store(&self) -> Result<TrustStore, ConfigError> {
        let mut store = TrustStore::new();

        for anchor in &self.trust_anchors {
            let invalid = |reason: String| ConfigError::InvalidAnchor {
                reference: anchor.reference.clone(),
                reason,
            };
            let reference = hex::decode(&anchor.reference).map_err(|e| invalid(e.to_string()))?;
            let modulus = hex::decode(&anchor.modulus).map_err(|e| invalid(e.to_string()))?;
            let exponent = hex::decode(&anchor.exponent).map_err(|e| invalid(e.to_string()))?;
            let key = RsaPublicKey::new(
                BigUint::from_bytes_be(&modulus),
                BigUint::from_bytes_be(&exponent),
            )
            .map_err(|e| invalid(e.to_string()))?;
            store.add_anchor(reference, key);
        }

        for entry in &self.revoked {
            let reference =
                hex::decode(entry).map_err(|_| ConfigError::InvalidRevoked(entry.clone()))?;
            store.revoke(reference);
        }

        Ok(store)
    }
}
