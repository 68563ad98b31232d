//! Protocol steps, progress tables and the events delivered to observers
//!
//! Every operation kind owns an ordered step table. A step's numerators are its positions in
//! the table, the denominator is the table length. Steps that appear more than once (file
//! selection and reading, mostly) resolve to the first position after the last one reported,
//! so progress never moves backwards.

use crossbeam_channel::Sender;
use derive_more::Display;
use tracing::{debug, trace};

use crate::error::{ProtocolError, Result};
use crate::result::ReadResult;

/// Named protocol step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ProtocolStep {
    /// A card was presented
    #[display("ON_TAG_DISCOVERED")]
    TagDiscovered,
    /// Link to the card established
    #[display("CONNECTED")]
    Connected,
    /// IAS application selected
    #[display("SELECT_IAS")]
    SelectIas,
    /// CIE application selected
    #[display("SELECT_CIE")]
    SelectCie,
    /// Master file selected
    #[display("SELECT_ROOT")]
    SelectRoot,
    /// Elementary file selected
    #[display("SELECT_FOR_READ_FILE")]
    SelectForReadFile,
    /// Elementary file read
    #[display("READ_FILE")]
    ReadFile,
    /// ATR classified
    #[display("CARD_TYPE_DETECTED")]
    CardTypeDetected,
    /// DH generator read
    #[display("DH_INIT_GET_G")]
    GetDhGenerator,
    /// DH prime read
    #[display("DH_INIT_GET_P")]
    GetDhPrime,
    /// DH group order read
    #[display("DH_INIT_GET_Q")]
    GetDhOrder,
    /// Key agreement algorithm set
    #[display("SET_MSE")]
    SetDhParameters,
    /// Ephemeral DH keys exchanged
    #[display("DH_KEY_EXCHANGE")]
    DhKeyExchange,
    /// Secure messaging keys derived
    #[display("DERIVE_SESSION_KEYS")]
    DeriveSessionKeys,
    /// Chip CV certificate verified
    #[display("VERIFY_CHIP_CERTIFICATE")]
    VerifyChipCertificate,
    /// Terminal challenge generated
    #[display("GENERATE_CHALLENGE")]
    GenerateChallenge,
    /// Chip answered the internal authentication
    #[display("CHIP_INTERNAL_AUTHENTICATION")]
    ChipInternalAuth,
    /// Chip signature verified
    #[display("VERIFY_CHIP_SIGNATURE")]
    VerifyChipSignature,
    /// PIN verified
    #[display("VERIFY_PIN")]
    VerifyPin,
    /// User certificate checked
    #[display("CHECK_CERTIFICATE")]
    CheckCertificate,
    /// Signature key selected
    #[display("SET_SIGNATURE_KEY")]
    SetSignatureKey,
    /// Digest signed by the card
    #[display("SIGN")]
    Sign,
    /// Card signature verified
    #[display("VERIFY_SIGNATURE")]
    VerifySignature,
    /// Assertion built
    #[display("BUILD_ASSERTION")]
    BuildAssertion,
    /// Assertion handed to the identity provider
    #[display("IDP_REQUEST")]
    IdpRequest,
    /// Identity provider answered
    #[display("IDP_RESPONSE")]
    IdpResponse,
    /// Caller challenge signed
    #[display("SIGN_CHALLENGE")]
    SignChallenge,
    /// PACE protocol set
    #[display("PACE_SET_MSE")]
    PaceSetup,
    /// Encrypted nonce decrypted
    #[display("PACE_GET_NONCE")]
    PaceNonce,
    /// Generator mapped
    #[display("PACE_MAP_NONCE")]
    PaceMapping,
    /// Ephemeral EC keys exchanged
    #[display("PACE_KEY_AGREEMENT")]
    PaceKeyAgreement,
    /// Authentication tokens exchanged
    #[display("PACE_MUTUAL_AUTHENTICATION")]
    PaceMutualAuth,
    /// eMRTD application selected
    #[display("SELECT_MRTD")]
    SelectMrtd,
}

use ProtocolStep::*;

/// Steps of the DH chip authentication, shared by every flow that runs it
const CHIP_AUTH: [ProtocolStep; 14] = [
    GetDhGenerator,
    GetDhPrime,
    GetDhOrder,
    SelectForReadFile,
    ReadFile,
    SetDhParameters,
    DhKeyExchange,
    DeriveSessionKeys,
    SelectForReadFile,
    ReadFile,
    VerifyChipCertificate,
    GenerateChallenge,
    ChipInternalAuth,
    VerifyChipSignature,
];

const ATTRIBUTES_STEPS: &[ProtocolStep] = &[
    TagDiscovered,
    Connected,
    SelectIas,
    SelectRoot,
    SelectForReadFile,
    ReadFile,
    CardTypeDetected,
];

const AUTHENTICATION_STEPS: &[ProtocolStep] = &concat_steps::<30>(&[
    &[TagDiscovered, Connected, SelectIas, SelectCie],
    &CHIP_AUTH,
    &[
        SelectForReadFile,
        ReadFile,
        VerifyPin,
        SelectForReadFile,
        ReadFile,
        CheckCertificate,
        SetSignatureKey,
        Sign,
        VerifySignature,
        BuildAssertion,
        IdpRequest,
        IdpResponse,
    ],
]);

const INTERNAL_AUTH_STEPS: &[ProtocolStep] = &concat_steps::<23>(&[
    &[TagDiscovered, Connected, SelectIas, SelectCie],
    &CHIP_AUTH,
    &[SignChallenge, SelectForReadFile, ReadFile, SelectForReadFile, ReadFile],
]);

const MRTD: [ProtocolStep; 16] = [
    PaceSetup,
    PaceNonce,
    PaceMapping,
    PaceKeyAgreement,
    PaceMutualAuth,
    SelectCie,
    SelectForReadFile,
    ReadFile,
    VerifyChipCertificate,
    SelectMrtd,
    SelectForReadFile,
    ReadFile,
    SelectForReadFile,
    ReadFile,
    SelectForReadFile,
    ReadFile,
];

const MRTD_STEPS: &[ProtocolStep] =
    &concat_steps::<18>(&[&[TagDiscovered, Connected], &MRTD]);

const INTERNAL_AUTH_AND_MRTD_STEPS: &[ProtocolStep] = &concat_steps::<26>(&[
    &[TagDiscovered, Connected],
    &MRTD,
    &[
        SelectCie,
        SelectForReadFile,
        ReadFile,
        SelectForReadFile,
        ReadFile,
        SignChallenge,
        SelectForReadFile,
        ReadFile,
    ],
]);

const CERTIFICATE_STEPS: &[ProtocolStep] = &concat_steps::<24>(&[
    &[TagDiscovered, Connected, SelectIas, SelectCie],
    &CHIP_AUTH,
    &[
        SelectForReadFile,
        ReadFile,
        VerifyPin,
        SelectForReadFile,
        ReadFile,
        CheckCertificate,
    ],
]);

const fn concat_steps<const N: usize>(parts: &[&[ProtocolStep]]) -> [ProtocolStep; N] {
    let mut out = [TagDiscovered; N];
    let mut n = 0;
    let mut i = 0;
    while i < parts.len() {
        let mut j = 0;
        while j < parts[i].len() {
            out[n] = parts[i][j];
            n += 1;
            j += 1;
        }
        i += 1;
    }
    assert!(n == N, "step table length mismatch");
    out
}

/// Kind of top-level operation, selecting the step table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum OperationKind {
    /// ATR reading and classification
    #[display("attributes")]
    Attributes,
    /// PIN authentication towards the identity provider
    #[display("authentication")]
    Authentication,
    /// Challenge signature with NIS, public key and SOD
    #[display("internal-authentication")]
    InternalAuthentication,
    /// PACE protected eMRTD reading
    #[display("mrtd")]
    Mrtd,
    /// eMRTD reading followed by internal authentication
    #[display("internal-authentication-mrtd")]
    InternalAuthAndMrtd,
    /// User certificate reading
    #[display("certificate")]
    Certificate,
}

impl OperationKind {
    /// Ordered step table
    pub const fn steps(self) -> &'static [ProtocolStep] {
        match self {
            Self::Attributes => ATTRIBUTES_STEPS,
            Self::Authentication => AUTHENTICATION_STEPS,
            Self::InternalAuthentication => INTERNAL_AUTH_STEPS,
            Self::Mrtd => MRTD_STEPS,
            Self::InternalAuthAndMrtd => INTERNAL_AUTH_AND_MRTD_STEPS,
            Self::Certificate => CERTIFICATE_STEPS,
        }
    }

    /// Progress denominator
    pub const fn total_steps(self) -> usize {
        self.steps().len()
    }

    /// First numerator of `step` strictly greater than `after`
    pub fn numerator_after(self, step: ProtocolStep, after: usize) -> Option<usize> {
        self.steps()
            .iter()
            .enumerate()
            .skip(after)
            .find_map(|(index, candidate)| (*candidate == step).then_some(index + 1))
    }
}

/// Failure payload of the terminal error event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    /// Bridge event name, e.g. `WRONG_PIN`
    pub name: &'static str,
    /// Human readable message
    pub message: String,
    /// Remaining PIN attempts for `WRONG_PIN`
    pub attempts_left: Option<u8>,
}

impl From<&ProtocolError> for ErrorEvent {
    fn from(error: &ProtocolError) -> Self {
        Self {
            name: error.name(),
            message: error.to_string(),
            attempts_left: error.attempts_left(),
        }
    }
}

/// Event delivered on an operation's channel
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A protocol step was reached
    Progress {
        /// Step reached
        step: ProtocolStep,
        /// Fraction in `0.0..=1.0`, non-decreasing within one operation
        progress: f32,
    },
    /// Terminal success
    Success(ReadResult),
    /// Terminal failure
    Error(ErrorEvent),
}

impl Event {
    /// Whether this event ends the operation
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

/// Emits progress for one operation and guarantees a single terminal event
#[derive(Debug)]
pub struct Sequencer {
    kind: OperationKind,
    last: usize,
    sink: Option<Sender<Event>>,
    finished: bool,
}

impl Sequencer {
    /// Create a sequencer, `sink` receives the events when present
    pub const fn new(kind: OperationKind, sink: Option<Sender<Event>>) -> Self {
        Self {
            kind,
            last: 0,
            sink,
            finished: false,
        }
    }

    /// Operation kind
    pub const fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Last reported progress
    pub fn progress(&self) -> f32 {
        self.last as f32 / self.kind.total_steps() as f32
    }

    /// Report `step`, returning the progress sent
    pub fn emit(&mut self, step: ProtocolStep) -> f32 {
        match self.kind.numerator_after(step, self.last) {
            Some(numerator) => self.last = numerator,
            None => trace!(%step, kind = %self.kind, "Step has no later position, keeping progress"),
        }
        let progress = self.progress();
        debug!(%step, progress, "Protocol step");
        if !self.finished {
            self.send(Event::Progress { step, progress });
        }
        progress
    }

    /// Send the terminal event for `outcome`
    ///
    /// Returns `false` without sending anything when a terminal event was already sent.
    pub fn finish(&mut self, outcome: &Result<ReadResult>) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        let event = match outcome {
            Ok(result) => Event::Success(result.clone()),
            Err(error) => Event::Error(error.into()),
        };
        self.send(event);
        true
    }

    /// Whether the terminal event was sent
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    fn send(&self, event: Event) {
        if let Some(sink) = &self.sink {
            // A dropped receiver only means nobody listens anymore
            let _ = sink.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_table_sizes() {
        assert_eq!(OperationKind::Attributes.total_steps(), 7);
        assert_eq!(OperationKind::Authentication.total_steps(), 30);
        assert_eq!(OperationKind::InternalAuthentication.total_steps(), 23);
        assert_eq!(OperationKind::Mrtd.total_steps(), 18);
        assert_eq!(OperationKind::InternalAuthAndMrtd.total_steps(), 26);
        assert_eq!(OperationKind::Certificate.total_steps(), 24);
    }

    #[test]
    fn test_repeated_step_advances() {
        let (tx, rx) = unbounded();
        let mut seq = Sequencer::new(OperationKind::Authentication, Some(tx));
        seq.emit(TagDiscovered);
        seq.emit(Connected);
        seq.emit(SelectForReadFile);
        seq.emit(ReadFile);
        seq.emit(SelectForReadFile);
        assert_eq!(seq.last, 13);

        let progress: Vec<f32> = rx
            .try_iter()
            .map(|event| match event {
                Event::Progress { progress, .. } => progress,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(progress.len(), 5);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_unknown_step_keeps_last_value() {
        let mut seq = Sequencer::new(OperationKind::Attributes, None);
        seq.emit(TagDiscovered);
        let before = seq.emit(SelectRoot);
        assert_eq!(seq.emit(PaceNonce), before);
        // TagDiscovered only occurs before the current position
        assert_eq!(seq.emit(TagDiscovered), before);
        assert_eq!(seq.emit(CardTypeDetected), 1.0);
    }

    #[test]
    fn test_single_terminal_event() {
        let (tx, rx) = unbounded();
        let mut seq = Sequencer::new(OperationKind::Attributes, Some(tx));
        assert!(seq.finish(&Err(ProtocolError::TagLost)));
        assert!(!seq.finish(&Err(ProtocolError::CancelledByUser)));
        seq.emit(Connected);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        let Event::Error(error) = &events[0] else {
            panic!("expected an error event");
        };
        assert_eq!(error.name, "TAG_LOST");
        assert!(seq.is_finished());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(TagDiscovered.to_string(), "ON_TAG_DISCOVERED");
        assert_eq!(DhKeyExchange.to_string(), "DH_KEY_EXCHANGE");
    }
}
