//! Transport session owning the link to one card for one operation
//!
//! The transport lives on a dedicated link thread. [`Session::transceive`] hands the command
//! over and waits on the response together with the cancellation signal and the operation
//! deadline, so a stop request or an elapsed timeout aborts promptly even when the card never
//! answers. Any transport failure moves the session to [`SessionState::Failed`] and drops the
//! link; a failed or completed session rejects every further exchange.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use cie_apdu_core::{CardConnector, CardTransport, Command, Response, TransportError};
use crossbeam_channel::{Receiver, Sender, at, bounded, select};
use derive_more::Display;
use tracing::{debug, info, trace, warn};

use crate::atr::CardProfile;
use crate::cancel::CancellationToken;
use crate::error::{ProtocolError, Result};
use crate::events::{ProtocolStep, Sequencer};
use crate::secure_messaging::SecureChannelContext;

/// Default operation timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default card polling slice
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lifecycle state of a session
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not connected yet
    Idle,
    /// Waiting for a card
    Connecting,
    /// Link established
    Connected,
    /// Key agreement or PIN verification running
    Authenticating,
    /// Secure messaging active
    SecureChannelEstablished,
    /// Reading files
    Reading,
    /// Operation succeeded, terminal
    Completed,
    /// Operation failed, terminal
    Failed,
}

impl SessionState {
    /// Whether no further transition is possible
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `next` is a legal successor of this state
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionState::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Idle, Connecting)
            | (Connecting, Connected)
            | (Connected, Authenticating | Reading)
            | (Authenticating, SecureChannelEstablished)
            | (SecureChannelEstablished, Reading)
            | (Reading, Completed) => true,
            (current, next) => current as u8 == next as u8,
        }
    }
}

/// Timing parameters of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Deadline measured from the start of [`Session::connect`]
    pub timeout: Duration,
    /// Longest single wait on the connector
    pub poll_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

type LinkResponse = std::result::Result<Bytes, TransportError>;

/// Channels to the thread holding the transport
///
/// Dropping the link closes `requests`. The worker then leaves its loop, at the latest once
/// a transmit still blocked in the driver returns, and drops the transport on its way out.
/// It is never joined, so a session ending on a timeout does not wait for a stalled card.
#[derive(Debug)]
struct Link {
    requests: Sender<Bytes>,
    responses: Receiver<LinkResponse>,
    _worker: JoinHandle<()>,
}

impl Link {
    fn spawn<T: CardTransport + 'static>(mut transport: T) -> Result<Self> {
        let (requests, incoming) = bounded::<Bytes>(1);
        let (outgoing, responses) = bounded::<LinkResponse>(1);
        let worker = thread::Builder::new()
            .name("cie-link".into())
            .spawn(move || {
                for command in incoming {
                    let response = transport.transmit_raw(&command);
                    if outgoing.send(response).is_err() {
                        break;
                    }
                }
                drop(transport);
                trace!("Link thread finished, transport released");
            })
            .map_err(|e| ProtocolError::generic(format!("Cannot start link thread: {e}")))?;
        Ok(Self {
            requests,
            responses,
            _worker: worker,
        })
    }
}

/// Live connection to one card for the duration of one operation
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    options: SessionOptions,
    deadline: Option<Instant>,
    profile: Option<CardProfile>,
    link: Option<Link>,
    channel: Option<SecureChannelContext>,
    token: CancellationToken,
    sequencer: Sequencer,
}

impl Session {
    /// Create an idle session
    pub const fn new(options: SessionOptions, token: CancellationToken, sequencer: Sequencer) -> Self {
        Self {
            state: SessionState::Idle,
            options,
            deadline: None,
            profile: None,
            link: None,
            channel: None,
            token,
            sequencer,
        }
    }

    /// Current state
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Deadline of the operation, set by [`Session::connect`]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Card profile, once classified
    pub const fn card_profile(&self) -> Option<CardProfile> {
        self.profile
    }

    /// Record the classified card profile
    pub fn set_card_profile(&mut self, profile: CardProfile) {
        self.profile = Some(profile);
    }

    /// Cancellation token observed by this session
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Sequencer reporting this session's progress
    pub fn sequencer_mut(&mut self) -> &mut Sequencer {
        &mut self.sequencer
    }

    /// Report a protocol step
    pub fn emit(&mut self, step: ProtocolStep) {
        self.sequencer.emit(step);
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ProtocolError::generic(format!(
                "Invalid session transition {} -> {next}",
                self.state
            )));
        }
        if self.state != next {
            debug!(from = %self.state, to = %next, "Session state");
            self.state = next;
        }
        Ok(())
    }

    /// Wait for a card on `connector` and open the link
    ///
    /// The deadline starts here. The connector is polled in slices of the poll interval so
    /// cancellation is noticed between slices.
    pub fn connect<C: CardConnector>(&mut self, connector: &mut C) -> Result<()> {
        self.transition(SessionState::Connecting)?;
        let deadline = Instant::now() + self.options.timeout;
        self.deadline = Some(deadline);
        info!(timeout_ms = self.options.timeout.as_millis() as u64, "Waiting for a card");

        let transport = loop {
            if self.token.is_cancelled() {
                return Err(self.fail(ProtocolError::CancelledByUser));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.fail(ProtocolError::Timeout));
            }
            match connector.poll(remaining.min(self.options.poll_interval)) {
                Ok(Some(transport)) => break transport,
                Ok(None) => {}
                Err(e) => return Err(self.fail(e.into())),
            }
        };
        self.emit(ProtocolStep::TagDiscovered);

        let link = match Link::spawn(transport) {
            Ok(link) => link,
            Err(e) => return Err(self.fail(e)),
        };
        self.link = Some(link);
        self.transition(SessionState::Connected)?;
        self.emit(ProtocolStep::Connected);
        Ok(())
    }

    /// Exchange one plain command with the card
    pub fn transceive(&mut self, command: &Command) -> Result<Response> {
        if self.state.is_terminal() {
            return Err(ProtocolError::generic(format!("Session is {}", self.state)));
        }
        if self.token.is_cancelled() {
            return Err(self.fail(ProtocolError::CancelledByUser));
        }
        let Some(link) = &self.link else {
            return Err(self.fail(ProtocolError::TagLost));
        };
        let deadline = self.deadline.unwrap_or_else(|| Instant::now() + self.options.timeout);
        if Instant::now() >= deadline {
            return Err(self.fail(ProtocolError::Timeout));
        }

        if link.requests.send(command.to_bytes()).is_err() {
            return Err(self.fail(ProtocolError::TagLost));
        }
        let outcome = select! {
            recv(link.responses) -> msg => match msg {
                Ok(Ok(raw)) => Response::from_bytes(&raw)
                    .map_err(|e| ProtocolError::apdu(e.to_string())),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(ProtocolError::TagLost),
            },
            recv(self.token.signal()) -> _ => Err(ProtocolError::CancelledByUser),
            recv(at(deadline)) -> _ => Err(ProtocolError::Timeout),
        };
        outcome.map_err(|e| self.fail(e))
    }

    /// Exchange a command, protected when a secure channel is established
    pub fn send(&mut self, command: &Command) -> Result<Response> {
        let Some(mut channel) = self.channel.take() else {
            return self.transceive(command);
        };
        let result = channel
            .protect(command)
            .and_then(|protected| self.transceive(&protected))
            .and_then(|response| channel.unprotect(&response));
        match result {
            Ok(response) => {
                self.channel = Some(channel);
                Ok(response)
            }
            // The channel is dropped, and zeroized, with the failure
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Install the secure channel used by [`Session::send`]
    pub fn set_secure_channel(&mut self, channel: SecureChannelContext) -> Result<()> {
        if self.state != SessionState::SecureChannelEstablished {
            self.transition(SessionState::SecureChannelEstablished)?;
        }
        self.channel = Some(channel);
        Ok(())
    }

    /// Established secure channel, if any
    pub const fn secure_channel(&self) -> Option<&SecureChannelContext> {
        self.channel.as_ref()
    }

    pub(crate) fn secure_channel_mut(&mut self) -> Option<&mut SecureChannelContext> {
        self.channel.as_mut()
    }

    /// Mark the operation as successful
    pub fn complete(&mut self) -> Result<()> {
        if self.state != SessionState::Reading {
            self.transition(SessionState::Reading)?;
        }
        self.transition(SessionState::Completed)?;
        self.disconnect();
        Ok(())
    }

    /// Record `error` as the end of this session and return it
    pub fn fail(&mut self, error: ProtocolError) -> ProtocolError {
        if !self.state.is_terminal() {
            warn!(state = %self.state, %error, "Session failed");
            self.state = SessionState::Failed;
        }
        self.disconnect();
        error
    }

    /// Drop the link and the secure channel; idempotent
    pub fn disconnect(&mut self) {
        self.channel = None;
        if self.link.take().is_some() {
            debug!("Link closed");
        }
        if !self.state.is_terminal() && self.state != SessionState::Idle {
            self.state = SessionState::Failed;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::{Event, OperationKind};
    use crossbeam_channel::unbounded;
    use std::collections::VecDeque;

    /// Transport answering from a script, optionally stalling
    #[derive(Debug)]
    pub(crate) struct ScriptedTransport {
        pub(crate) responses: VecDeque<LinkResponse>,
        pub(crate) delay: Duration,
    }

    impl CardTransport for ScriptedTransport {
        fn do_transmit_raw(&mut self, _command: &[u8]) -> LinkResponse {
            thread::sleep(self.delay);
            self.responses
                .pop_front()
                .unwrap_or(Err(TransportError::CardRemoved))
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn reset(&mut self) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    /// Connector presenting the card after a number of empty polls
    #[derive(Debug)]
    pub(crate) struct ScriptedConnector {
        pub(crate) empty_polls: usize,
        pub(crate) card: Option<ScriptedTransport>,
    }

    impl CardConnector for ScriptedConnector {
        type Transport = ScriptedTransport;

        fn poll(&mut self, timeout: Duration) -> std::result::Result<Option<ScriptedTransport>, TransportError> {
            if self.empty_polls > 0 {
                self.empty_polls -= 1;
                thread::sleep(timeout);
                return Ok(None);
            }
            Ok(self.card.take())
        }
    }

    fn connector(responses: Vec<&'static [u8]>, delay: Duration) -> ScriptedConnector {
        ScriptedConnector {
            empty_polls: 0,
            card: Some(ScriptedTransport {
                responses: responses.into_iter().map(|r| Ok(Bytes::from_static(r))).collect(),
                delay,
            }),
        }
    }

    fn session(timeout_ms: u64) -> (Session, crossbeam_channel::Receiver<Event>) {
        let (tx, rx) = unbounded();
        let options = SessionOptions {
            timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(10),
        };
        let session = Session::new(
            options,
            CancellationToken::new(),
            Sequencer::new(OperationKind::Attributes, Some(tx)),
        );
        (session, rx)
    }

    #[test]
    fn test_connect_and_transceive() {
        let (mut session, rx) = session(1000);
        let mut connector = connector(vec![&[0x90, 0x00]], Duration::ZERO);
        session.connect(&mut connector).unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        let response = session.transceive(&Command::new(0x00, 0xA4, 0x00, 0x00)).unwrap();
        assert!(response.is_success());
        assert_eq!(rx.try_iter().count(), 2);

        session.complete().unwrap();
        assert_eq!(session.state(), SessionState::Completed);
        assert!(session.transceive(&Command::new(0x00, 0xA4, 0x00, 0x00)).is_err());
    }

    #[test]
    fn test_transceive_timeout_fails_session() {
        let (mut session, _rx) = session(100);
        let mut connector = connector(vec![&[0x90, 0x00]], Duration::from_secs(2));
        session.connect(&mut connector).unwrap();

        let started = Instant::now();
        let err = session.transceive(&Command::new(0x00, 0xB0, 0x00, 0x00)).unwrap_err();
        assert_eq!(err, ProtocolError::Timeout);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.transceive(&Command::new(0x00, 0xB0, 0x00, 0x00)).is_err());
    }

    /// Transport that stalls on every exchange and reports when it is dropped
    #[derive(Debug)]
    struct StallingTransport {
        stall: Duration,
        released: crossbeam_channel::Sender<()>,
    }

    impl CardTransport for StallingTransport {
        fn do_transmit_raw(&mut self, _command: &[u8]) -> LinkResponse {
            thread::sleep(self.stall);
            Ok(Bytes::from_static(&[0x90, 0x00]))
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn reset(&mut self) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    impl Drop for StallingTransport {
        fn drop(&mut self) {
            let _ = self.released.send(());
        }
    }

    #[derive(Debug)]
    struct StallingConnector(Option<StallingTransport>);

    impl CardConnector for StallingConnector {
        type Transport = StallingTransport;

        fn poll(&mut self, _timeout: Duration) -> std::result::Result<Option<StallingTransport>, TransportError> {
            Ok(self.0.take())
        }
    }

    #[test]
    fn test_stalled_link_released_after_timeout() {
        let (released, on_release) = unbounded();
        let (mut session, _rx) = session(50);
        let mut connector = StallingConnector(Some(StallingTransport {
            stall: Duration::from_millis(300),
            released,
        }));
        session.connect(&mut connector).unwrap();

        let err = session.transceive(&Command::new(0x00, 0xB0, 0x00, 0x00)).unwrap_err();
        assert_eq!(err, ProtocolError::Timeout);
        assert!(on_release.try_recv().is_err());
        on_release.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_idle_link_released_on_complete() {
        let (released, on_release) = unbounded();
        let (mut session, _rx) = session(1000);
        let mut connector = StallingConnector(Some(StallingTransport {
            stall: Duration::ZERO,
            released,
        }));
        session.connect(&mut connector).unwrap();
        session.transceive(&Command::new(0x00, 0xA4, 0x00, 0x00)).unwrap();

        session.complete().unwrap();
        on_release.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_cancel_interrupts_exchange() {
        let (mut session, _rx) = session(5000);
        let mut connector = connector(vec![&[0x90, 0x00]], Duration::from_secs(2));
        session.connect(&mut connector).unwrap();

        let token = session.token().clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        });
        let err = session.transceive(&Command::new(0x00, 0xB0, 0x00, 0x00)).unwrap_err();
        canceller.join().unwrap();
        assert_eq!(err, ProtocolError::CancelledByUser);
    }

    #[test]
    fn test_connect_times_out_without_card() {
        let (mut session, _rx) = session(50);
        let mut connector = ScriptedConnector {
            empty_polls: usize::MAX,
            card: None,
        };
        assert_eq!(session.connect(&mut connector), Err(ProtocolError::Timeout));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_removed_card_is_tag_lost() {
        let (mut session, _rx) = session(1000);
        let mut connector = connector(vec![], Duration::ZERO);
        session.connect(&mut connector).unwrap();
        assert_eq!(
            session.transceive(&Command::new(0x00, 0xB0, 0x00, 0x00)),
            Err(ProtocolError::TagLost)
        );
    }

    #[test]
    fn test_state_machine() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Authenticating));
        assert!(Reading.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Idle));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Reading));

        let (mut session, _rx) = session(10);
        session.disconnect();
        session.disconnect();
        assert_eq!(session.state(), Idle);
    }
}
