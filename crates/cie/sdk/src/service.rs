//! Fire-and-report reader service
//!
//! [`CieReader`] owns the connector and runs one operation at a time on a worker thread.
//! `start_*` validates the inputs, refuses when another operation is running and returns a
//! receiver of [`Event`]s: progress in order, then exactly one success or error.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cie_apdu_core::CardConnector;
use crossbeam_channel::{Receiver, unbounded};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use url::Url;
use zeroize::Zeroizing;

use crate::cancel::CancellationToken;
use crate::certificate::TrustStore;
use crate::config::{CieConfig, ConfigError};
use crate::error::{ProtocolError, Result};
use crate::events::Event;
use crate::flows::{self, FlowContext, Operation};
use crate::idp::{IdentityProvider, RedirectIdentityProvider};
use crate::reader::PinVerifier;
use crate::result::ReadResult;
use crate::session::SessionOptions;
use crate::validation::validate_url;

/// Everything a worker needs, cloned per operation
#[derive(Debug)]
struct Shared<C> {
    connector: Arc<Mutex<C>>,
    trust: Arc<TrustStore>,
    pin_verifier: Arc<PinVerifier>,
    identity_provider: Arc<dyn IdentityProvider>,
    active: Arc<Mutex<Option<CancellationToken>>>,
}

// Manual impl, the connector itself is shared rather than cloned
impl<C> Clone for Shared<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            trust: Arc::clone(&self.trust),
            pin_verifier: Arc::clone(&self.pin_verifier),
            identity_provider: Arc::clone(&self.identity_provider),
            active: Arc::clone(&self.active),
        }
    }
}

/// CIE reader exposing every operation
#[derive(Debug)]
pub struct CieReader<C> {
    shared: Shared<C>,
    idp_url: RwLock<Url>,
    options: SessionOptions,
}

impl<C: CardConnector + 'static> CieReader<C> {
    /// Create a reader from a connector and a configuration
    pub fn new(connector: C, config: &CieConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            shared: Shared {
                connector: Arc::new(Mutex::new(connector)),
                trust: Arc::new(config.trust_store()?),
                pin_verifier: Arc::new(PinVerifier::new()),
                identity_provider: Arc::new(RedirectIdentityProvider),
                active: Arc::new(Mutex::new(None)),
            },
            idp_url: RwLock::new(config.idp_url()?),
            options: config.session_options(),
        })
    }

    /// Replace the trust store
    pub fn with_trust_store(mut self, trust: TrustStore) -> Self {
        self.shared.trust = Arc::new(trust);
        self
    }

    /// Replace the identity provider
    pub fn with_identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.shared.identity_provider = provider;
        self
    }

    /// Identity provider base URL used by the next authentication
    pub fn idp_url(&self) -> Url {
        self.idp_url.read().clone()
    }

    /// Override the identity provider base URL
    pub fn set_custom_idp_url(&self, url: &str) -> Result<()> {
        let url = validate_url(url)?;
        info!(%url, "Custom IdP URL set");
        *self.idp_url.write() = url;
        Ok(())
    }

    /// Whether an operation is running
    pub fn is_busy(&self) -> bool {
        self.shared.active.lock().is_some()
    }

    /// Cancel the running operation, if any
    ///
    /// Idempotent: with nothing running, or once cancelled, further calls do nothing.
    pub fn stop_reading(&self) {
        if let Some(token) = self.shared.active.lock().as_ref() {
            if !token.is_cancelled() {
                info!("Stop requested");
            }
            token.cancel();
        }
    }

    /// Start reading the ATR and card profile
    pub fn start_reading_attributes(&self, timeout: Option<Duration>) -> Result<Receiver<Event>> {
        self.start(Operation::ReadAttributes, timeout)
    }

    /// Start the PIN authentication for `url`
    pub fn start_reading(&self, pin: &str, url: &str, timeout: Option<Duration>) -> Result<Receiver<Event>> {
        self.start(authenticate_operation(pin, url)?, timeout)
    }

    /// Start the internal authentication over `challenge`
    pub fn start_internal_authentication(
        &self,
        challenge: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Receiver<Event>> {
        let operation = Operation::InternalAuthentication {
            challenge: challenge.to_vec(),
        };
        self.start(operation, timeout)
    }

    /// Start the eMRTD reading with PACE
    pub fn start_mrtd_reading(&self, can: &str, timeout: Option<Duration>) -> Result<Receiver<Event>> {
        let operation = Operation::Mrtd {
            can: Zeroizing::new(can.to_owned()),
        };
        self.start(operation, timeout)
    }

    /// Start the eMRTD reading followed by the internal authentication
    pub fn start_internal_auth_and_mrtd_reading(
        &self,
        can: &str,
        challenge: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Receiver<Event>> {
        let operation = Operation::InternalAuthAndMrtd {
            can: Zeroizing::new(can.to_owned()),
            challenge: challenge.to_vec(),
        };
        self.start(operation, timeout)
    }

    /// Start reading the holder details of the user certificate
    pub fn start_reading_certificate(&self, pin: &str, timeout: Option<Duration>) -> Result<Receiver<Event>> {
        let operation = Operation::ReadCertificate {
            pin: Zeroizing::new(pin.to_owned()),
        };
        self.start(operation, timeout)
    }

    /// Run `operation` on a worker thread
    pub fn start(&self, operation: Operation, timeout: Option<Duration>) -> Result<Receiver<Event>> {
        operation.validate()?;
        let token = self.acquire()?;
        let (sink, events) = unbounded();
        let shared = self.shared.clone();
        let idp_url = self.idp_url();
        let options = self.session_options(timeout);

        let release = shared.active.clone();
        let spawned = thread::Builder::new()
            .name("cie-operation".into())
            .spawn(move || {
                let mut connector = shared.connector.lock();
                let context = FlowContext {
                    trust: &shared.trust,
                    pin_verifier: &shared.pin_verifier,
                    identity_provider: shared.identity_provider.as_ref(),
                    idp_url: &idp_url,
                };
                let _ = flows::run_then(
                    &operation,
                    &mut *connector,
                    &context,
                    options,
                    token,
                    Some(sink),
                    || release_active(&shared.active),
                );
            });

        match spawned {
            Ok(_) => Ok(events),
            Err(e) => {
                release_active(&release);
                Err(ProtocolError::generic(format!("Cannot start worker thread: {e}")))
            }
        }
    }

    /// Run `operation` on the calling thread
    pub fn read(&self, operation: Operation, timeout: Option<Duration>) -> Result<ReadResult> {
        operation.validate()?;
        let token = self.acquire()?;
        let idp_url = self.idp_url();
        let mut connector = self.shared.connector.lock();
        let context = FlowContext {
            trust: &self.shared.trust,
            pin_verifier: &self.shared.pin_verifier,
            identity_provider: self.shared.identity_provider.as_ref(),
            idp_url: &idp_url,
        };
        flows::run_then(
            &operation,
            &mut *connector,
            &context,
            self.session_options(timeout),
            token,
            None,
            || release_active(&self.shared.active),
        )
    }

    /// Blocking [`CieReader::start_reading_attributes`]
    pub fn read_attributes(&self, timeout: Option<Duration>) -> Result<ReadResult> {
        self.read(Operation::ReadAttributes, timeout)
    }

    /// Blocking [`CieReader::start_reading`]
    pub fn read_authentication(&self, pin: &str, url: &str, timeout: Option<Duration>) -> Result<ReadResult> {
        self.read(authenticate_operation(pin, url)?, timeout)
    }

    fn acquire(&self) -> Result<CancellationToken> {
        let mut active = self.shared.active.lock();
        if active.is_some() {
            debug!("Refusing concurrent operation");
            return Err(ProtocolError::AlreadyInProgress);
        }
        let token = CancellationToken::new();
        *active = Some(token.clone());
        Ok(token)
    }

    fn session_options(&self, timeout: Option<Duration>) -> SessionOptions {
        SessionOptions {
            timeout: timeout.unwrap_or(self.options.timeout),
            ..self.options
        }
    }
}

fn authenticate_operation(pin: &str, url: &str) -> Result<Operation> {
    Ok(Operation::Authenticate {
        pin: Zeroizing::new(pin.to_owned()),
        url: validate_url(url)?,
    })
}

fn release_active(active: &Mutex<Option<CancellationToken>>) {
    active.lock().take();
}
