//! Transport traits for APDU communication with cards
//!
//! A [`CardConnector`] waits for a card to be presented and hands out a [`CardTransport`]
//! bound to it. The transport moves raw bytes and knows nothing about secure channels.

pub mod error;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
pub use error::TransportError;
use tracing::{debug, trace};

use crate::{Command, Error, Response};

/// Trait for basic card transports
///
/// A transport is responsible for sending and receiving raw APDU bytes.
pub trait CardTransport: Send + fmt::Debug {
    /// Send raw APDU bytes to card and return response bytes
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        trace!(command = %hex::encode(command), "Transmitting raw command");
        let result = self.do_transmit_raw(command);
        match &result {
            Ok(response) => {
                trace!(response = %hex::encode(response), "Received raw response");
            }
            Err(e) => {
                debug!(error = ?e, "Transport error during transmission");
            }
        }
        result
    }

    /// Send a command and parse the response
    fn transmit(&mut self, command: &Command) -> Result<Response, Error> {
        let raw = self.transmit_raw(&command.to_bytes())?;
        Ok(Response::from_bytes(&raw)?)
    }

    /// Internal implementation of transmit_raw
    ///
    /// Concrete implementations override this one, [`CardTransport::transmit_raw`] adds logging.
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError>;

    /// Check if the transport is connected to a physical card
    fn is_connected(&self) -> bool;

    /// Reset the transport connection
    fn reset(&mut self) -> Result<(), TransportError>;
}

/// Source of card connections
///
/// `poll` blocks for at most `timeout` waiting for a card. `Ok(None)` means no card showed up
/// within that slice, which lets callers interleave cancellation checks.
pub trait CardConnector: Send + fmt::Debug {
    /// Transport handed out once a card is present
    type Transport: CardTransport + 'static;

    /// Wait up to `timeout` for a card and connect to it
    fn poll(&mut self, timeout: Duration) -> Result<Option<Self::Transport>, TransportError>;
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct MockTransport {
    pub(crate) responses: Vec<Bytes>,
    pub(crate) commands: Vec<Bytes>,
    pub(crate) connected: bool,
}

#[cfg(test)]
impl MockTransport {
    pub(crate) const fn new(responses: Vec<Bytes>) -> Self {
        Self {
            responses,
            commands: Vec::new(),
            connected: true,
        }
    }
}

#[cfg(test)]
impl CardTransport for MockTransport {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        if !self.connected {
            return Err(TransportError::CardRemoved);
        }
        self.commands.push(Bytes::copy_from_slice(command));
        if self.responses.is_empty() {
            return Err(TransportError::Transmission);
        }
        Ok(self.responses.remove(0))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        self.commands.clear();
        Ok(())
    }
}
