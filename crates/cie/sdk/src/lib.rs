//! Protocol core for the Italian electronic identity card (CIE)
//!
//! The crate drives a CIE over any [`cie_apdu_core::CardTransport`]: it classifies the card
//! from its ATR, authenticates the chip with Diffie-Hellman or PACE, wraps every later
//! exchange in ICAO 9303 secure messaging and reads the CIE and eMRTD files.
//!
//! ## Layers
//!
//! - [`session`]: one connection per operation, with deadline and cancellation
//! - [`secure_messaging`], [`chip_auth`], [`pace`]: secure channel establishment
//! - [`reader`]: file reading, PIN verification and on-card signatures
//! - [`flows`]: the orchestrators, reporting progress through [`events::Sequencer`]
//! - [`service`]: [`CieReader`], the fire-and-report front end
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]

pub mod atr;
pub mod cancel;
pub mod certificate;
pub mod chip_auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod flows;
pub mod idp;
pub mod pace;
pub mod reader;
pub mod result;
pub mod secure_messaging;
pub mod service;
pub mod session;
pub mod user_certificate;
pub mod validation;

mod tlv;

pub use atr::{CardProfile, classify};
pub use cancel::CancellationToken;
pub use certificate::{CvCertificate, CvDate, TrustStore};
pub use config::{CieConfig, ConfigError};
pub use error::{ProtocolError, Result};
pub use events::{ErrorEvent, Event, OperationKind, ProtocolStep, Sequencer};
pub use flows::{FlowContext, Operation};
pub use idp::{IdentityProvider, IdpError, RedirectIdentityProvider};
pub use reader::PinVerifier;
pub use result::{
    AttributesResult, AuthenticationResult, CertificateResult, InternalAuthAndMrtdResult,
    InternalAuthResult, MrtdResult, ReadResult,
};
pub use secure_messaging::{SecureChannelContext, SmCipher};
pub use service::CieReader;
pub use session::{Session, SessionOptions, SessionState};
pub use validation::ValidationError;
