//! Orchestrators composing the protocol building blocks into complete operations
//!
//! Every operation runs on its own [`Session`]: connect, authenticate, read, then exactly one
//! terminal event through the session's [`Sequencer`]. The step order of each flow follows
//! the table of its [`OperationKind`], so progress only moves forward.

use std::fmt;
use std::time::SystemTime;

use cie_apdu_core::CardConnector;
use crossbeam_channel::Sender;
use rsa::Pkcs1v15Sign;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use url::Url;
use zeroize::Zeroizing;

use crate::atr;
use crate::cancel::CancellationToken;
use crate::certificate::TrustStore;
use crate::chip_auth::{self, verify_internal_signature};
use crate::error::{ProtocolError, Result};
use crate::events::{Event, OperationKind, ProtocolStep, Sequencer};
use crate::idp::{AuthenticationRequest, IdentityProvider};
use crate::pace;
use crate::reader::{self, PinVerifier};
use crate::result::{
    AttributesResult, AuthenticationResult, InternalAuthAndMrtdResult, InternalAuthResult,
    MrtdResult, ReadResult,
};
use crate::session::{Session, SessionOptions, SessionState};
use crate::user_certificate::UserCertificate;
use crate::validation::{ValidationResult, validate_can, validate_challenge, validate_pin};

/// One operation with its inputs
#[derive(Clone)]
pub enum Operation {
    /// Read EF.ATR and classify the card
    ReadAttributes,
    /// Sign the service URL with the user key and obtain the IdP redirect
    Authenticate {
        /// Eight digit PIN
        pin: Zeroizing<String>,
        /// Service URL
        url: Url,
    },
    /// Have the chip sign a caller challenge and read the CIE data bundle
    InternalAuthentication {
        /// Challenge bytes
        challenge: Vec<u8>,
    },
    /// Read the eMRTD data groups under PACE
    Mrtd {
        /// Card access number
        can: Zeroizing<String>,
    },
    /// eMRTD reading followed by the internal authentication
    InternalAuthAndMrtd {
        /// Card access number
        can: Zeroizing<String>,
        /// Challenge bytes
        challenge: Vec<u8>,
    },
    /// Read the holder details of the user certificate
    ReadCertificate {
        /// Eight digit PIN
        pin: Zeroizing<String>,
    },
}

impl Operation {
    /// Step table of this operation
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::ReadAttributes => OperationKind::Attributes,
            Self::Authenticate { .. } => OperationKind::Authentication,
            Self::InternalAuthentication { .. } => OperationKind::InternalAuthentication,
            Self::Mrtd { .. } => OperationKind::Mrtd,
            Self::InternalAuthAndMrtd { .. } => OperationKind::InternalAuthAndMrtd,
            Self::ReadCertificate { .. } => OperationKind::Certificate,
        }
    }

    /// Local checks of the inputs, nothing is sent to the card
    pub fn validate(&self) -> ValidationResult<()> {
        match self {
            Self::ReadAttributes => Ok(()),
            Self::Authenticate { pin, .. } | Self::ReadCertificate { pin } => validate_pin(pin),
            Self::InternalAuthentication { challenge } => validate_challenge(challenge),
            Self::Mrtd { can } => validate_can(can),
            Self::InternalAuthAndMrtd { can, challenge } => {
                validate_can(can)?;
                validate_challenge(challenge)
            }
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // PIN and CAN stay out of logs
        match self {
            Self::ReadAttributes => f.write_str("ReadAttributes"),
            Self::Authenticate { url, .. } => {
                f.debug_struct("Authenticate").field("url", &url.as_str()).finish_non_exhaustive()
            }
            Self::InternalAuthentication { challenge } => f
                .debug_struct("InternalAuthentication")
                .field("challenge_len", &challenge.len())
                .finish(),
            Self::Mrtd { .. } => f.debug_struct("Mrtd").finish_non_exhaustive(),
            Self::InternalAuthAndMrtd { challenge, .. } => f
                .debug_struct("InternalAuthAndMrtd")
                .field("challenge_len", &challenge.len())
                .finish_non_exhaustive(),
            Self::ReadCertificate { .. } => f.debug_struct("ReadCertificate").finish_non_exhaustive(),
        }
    }
}

/// Shared collaborators of the flows
#[derive(Debug, Clone, Copy)]
pub struct FlowContext<'a> {
    /// Anchors and revocations for chip and user certificates
    pub trust: &'a TrustStore,
    /// PIN verification with blocked card memory
    pub pin_verifier: &'a PinVerifier,
    /// Receives the signed assertion of the authentication flow
    pub identity_provider: &'a dyn IdentityProvider,
    /// Identity provider base URL
    pub idp_url: &'a Url,
}

/// Run `operation` to completion on a card obtained from `connector`
///
/// Progress and the terminal event go to `sink` when present. The outcome is also returned,
/// so blocking callers can ignore the events.
pub fn run<C: CardConnector>(
    operation: &Operation,
    connector: &mut C,
    context: &FlowContext<'_>,
    options: SessionOptions,
    token: CancellationToken,
    sink: Option<Sender<Event>>,
) -> Result<ReadResult> {
    run_then(operation, connector, context, options, token, sink, || {})
}

/// [`run`], calling `before_finish` once the card is released and before the terminal event
#[instrument(skip_all, fields(kind = %operation.kind()))]
pub(crate) fn run_then<C: CardConnector, F: FnOnce()>(
    operation: &Operation,
    connector: &mut C,
    context: &FlowContext<'_>,
    options: SessionOptions,
    token: CancellationToken,
    sink: Option<Sender<Event>>,
    before_finish: F,
) -> Result<ReadResult> {
    let mut session = Session::new(options, token, Sequencer::new(operation.kind(), sink));
    info!(?operation, "Operation started");

    let outcome = operation
        .validate()
        .map_err(ProtocolError::from)
        .and_then(|()| session.connect(connector))
        .and_then(|()| execute(operation, &mut session, context));

    let outcome = match outcome {
        Ok(result) => session.complete().map(|()| result),
        Err(error) => Err(session.fail(error)),
    };
    before_finish();
    session.sequencer_mut().finish(&outcome);

    match &outcome {
        Ok(result) => info!(event = result.event_name(), "Operation succeeded"),
        Err(error) => warn!(event = error.name(), %error, "Operation failed"),
    }
    outcome
}

fn execute(operation: &Operation, session: &mut Session, context: &FlowContext<'_>) -> Result<ReadResult> {
    match operation {
        Operation::ReadAttributes => read_attributes(session).map(ReadResult::Attributes),
        Operation::Authenticate { pin, url } => {
            authenticate(session, context, pin, url).map(ReadResult::Authentication)
        }
        Operation::InternalAuthentication { challenge } => {
            internal_authentication(session, context, challenge).map(ReadResult::InternalAuth)
        }
        Operation::Mrtd { can } => mrtd_reading(session, context, can).map(ReadResult::Mrtd),
        Operation::InternalAuthAndMrtd { can, challenge } => {
            internal_auth_and_mrtd(session, context, can, challenge)
                .map(ReadResult::InternalAuthAndMrtd)
        }
        Operation::ReadCertificate { pin } => {
            read_certificate(session, context, pin).map(ReadResult::Certificate)
        }
    }
}

/// EF.ATR and the card profile
pub fn read_attributes(session: &mut Session) -> Result<AttributesResult> {
    session.transition(SessionState::Reading)?;
    session.emit(ProtocolStep::SelectIas);
    let status = reader::select_application(session, reader::AID_IAS)?;
    if !status.is_success() {
        warn!(%status, "IAS application missing");
        return Err(ProtocolError::NotACard);
    }
    reader::select_root(session)?;
    let atr = reader::read_file(session, reader::FID_ATR)?;

    session.emit(ProtocolStep::CardTypeDetected);
    let card_profile = atr::classify(&atr);
    session.set_card_profile(card_profile);
    debug!(%card_profile, "Card classified");
    Ok(AttributesResult { atr, card_profile })
}

/// Chip authentication, PIN and user certificate, shared by two flows
fn unlock_user_certificate(
    session: &mut Session,
    context: &FlowContext<'_>,
    pin: &str,
) -> Result<(Vec<u8>, UserCertificate)> {
    chip_auth::establish_chip_auth(session, context.trust, SystemTime::now())?;
    session.transition(SessionState::Reading)?;

    let serial = reader::read_file(session, reader::FID_SERIAL)?;
    context.pin_verifier.verify_pin(session, &serial, pin)?;
    let der = reader::read_file(session, reader::FID_USER_CERTIFICATE)?;

    session.emit(ProtocolStep::CheckCertificate);
    let certificate = UserCertificate::from_der(&der)?;
    certificate.check(context.trust, SystemTime::now())?;
    Ok((serial, certificate))
}

/// Sign the service URL on the card and exchange it for the IdP redirect
pub fn authenticate(
    session: &mut Session,
    context: &FlowContext<'_>,
    pin: &str,
    url: &Url,
) -> Result<AuthenticationResult> {
    let (_, certificate) = unlock_user_certificate(session, context, pin)?;

    let digest = Sha256::digest(url.as_str().as_bytes());
    let signature = reader::sign(session, &reader::sha256_digest_info(&digest))?;

    session.emit(ProtocolStep::VerifySignature);
    certificate
        .public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
        .map_err(|_| {
            warn!("Card signature does not verify with the user certificate");
            ProtocolError::generic("Signature verification failed")
        })?;

    session.emit(ProtocolStep::BuildAssertion);
    let request = AuthenticationRequest {
        url,
        signature: &signature,
        certificate: &certificate.der,
        idp_url: context.idp_url,
    };
    session.emit(ProtocolStep::IdpRequest);
    let redirect_url = context.identity_provider.authenticate(&request)?;
    session.emit(ProtocolStep::IdpResponse);
    Ok(AuthenticationResult { redirect_url })
}

/// Chip-signed challenge plus NIS and SOD, the chip key file comes from `public_key_file`
fn internal_auth_bundle(
    session: &mut Session,
    public_key_file: Vec<u8>,
    challenge: &[u8],
) -> Result<InternalAuthResult> {
    let key = chip_auth::parse_public_key_file(&public_key_file)?;
    session.emit(ProtocolStep::SignChallenge);
    let signed_challenge = reader::internal_authenticate(session, challenge)?;
    verify_internal_signature(&key, challenge, &signed_challenge)?;

    let nis = reader::read_file(session, reader::FID_NIS)?;
    let sod = reader::read_file(session, reader::FID_SOD)?;
    Ok(InternalAuthResult {
        nis,
        public_key: public_key_file,
        sod,
        signed_challenge,
    })
}

/// Chip authentication followed by a signature over the caller challenge
pub fn internal_authentication(
    session: &mut Session,
    context: &FlowContext<'_>,
    challenge: &[u8],
) -> Result<InternalAuthResult> {
    let chip = chip_auth::establish_chip_auth(session, context.trust, SystemTime::now())?;
    session.transition(SessionState::Reading)?;
    internal_auth_bundle(session, chip.public_key_file, challenge)
}

/// PACE, chip certificate, then DG1, DG11 and the SOD of the eMRTD application
pub fn mrtd_reading(session: &mut Session, context: &FlowContext<'_>, can: &str) -> Result<MrtdResult> {
    pace::establish_pace(session, can, context.trust, SystemTime::now())?;
    session.transition(SessionState::Reading)?;

    session.emit(ProtocolStep::SelectMrtd);
    let status = reader::select_application(session, reader::AID_MRTD)?;
    if !status.is_success() {
        return Err(ProtocolError::status("Select eMRTD application", status));
    }
    let dg1 = reader::read_file(session, reader::FID_DG1)?;
    let dg11 = reader::read_file(session, reader::FID_DG11)?;
    let sod = reader::read_file(session, reader::FID_MRTD_SOD)?;
    Ok(MrtdResult { dg1, dg11, sod })
}

/// eMRTD reading, then the internal authentication on the same PACE channel
pub fn internal_auth_and_mrtd(
    session: &mut Session,
    context: &FlowContext<'_>,
    can: &str,
    challenge: &[u8],
) -> Result<InternalAuthAndMrtdResult> {
    let mrtd_data = mrtd_reading(session, context, can)?;

    session.emit(ProtocolStep::SelectCie);
    let status = reader::select_application(session, reader::AID_CIE)?;
    if !status.is_success() {
        return Err(ProtocolError::status("Select CIE application", status));
    }
    // NIS first, as in the step table, then the key file
    let nis = reader::read_file(session, reader::FID_NIS)?;
    let public_key_file = reader::read_file(session, reader::FID_INT_AUTH_KEY)?;
    let key = chip_auth::parse_public_key_file(&public_key_file)?;

    session.emit(ProtocolStep::SignChallenge);
    let signed_challenge = reader::internal_authenticate(session, challenge)?;
    verify_internal_signature(&key, challenge, &signed_challenge)?;
    let sod = reader::read_file(session, reader::FID_SOD)?;

    Ok(InternalAuthAndMrtdResult {
        nis_data: InternalAuthResult {
            nis,
            public_key: public_key_file,
            sod,
            signed_challenge,
        },
        mrtd_data,
    })
}

/// Holder details of the user certificate, unlocked with the PIN
pub fn read_certificate(
    session: &mut Session,
    context: &FlowContext<'_>,
    pin: &str,
) -> Result<crate::result::CertificateResult> {
    let (serial, certificate) = unlock_user_certificate(session, context, pin)?;
    let doc_serial_number = String::from_utf8(serial)
        .ok()
        .map(|s| s.trim_end_matches('\0').to_owned());
    Ok(certificate.to_result(doc_serial_number))
}
