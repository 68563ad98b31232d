//! Card presence monitor built on `SCardGetStatusChange`

use std::collections::HashMap;
use std::ffi::CString;
use std::time::Duration;

use pcsc::{Context, ReaderState, Scope, State};
use tracing::{debug, trace};

use crate::error::PcscError;
use crate::event::CardEvent;
use crate::reader::card_present;

/// Monitor for card insertion and removal
///
/// The monitor remembers the last state it saw per reader so that repeated calls to
/// [`PcscMonitor::wait_for_card_events`] block until something actually changes.
pub struct PcscMonitor {
    context: Context,
    known: HashMap<CString, (State, Vec<u8>)>,
}

impl std::fmt::Debug for PcscMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcscMonitor")
            .field("readers", &self.known.len())
            .finish()
    }
}

impl PcscMonitor {
    pub(crate) fn new(context: Context) -> Self {
        Self {
            context,
            known: HashMap::new(),
        }
    }

    /// Create a new monitor with a dedicated context
    pub fn create() -> Result<Self, PcscError> {
        Ok(Self::new(Context::establish(Scope::User)?))
    }

    /// Wait up to `timeout` for card events
    ///
    /// A card already present the first time a reader is seen is reported as inserted.
    /// An elapsed timeout yields an empty list rather than an error.
    pub fn wait_for_card_events(&mut self, timeout: Duration) -> Result<Vec<CardEvent>, PcscError> {
        let readers = match self.context.list_readers_owned() {
            Ok(readers) => readers,
            Err(pcsc::Error::NoReadersAvailable) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        self.known.retain(|name, _| readers.contains(name));

        let mut reader_states = vec![ReaderState::new(pcsc::PNP_NOTIFICATION(), State::UNAWARE)];
        for reader in readers {
            let current = self
                .known
                .get(&reader)
                .map_or(State::UNAWARE, |(state, _)| *state);
            reader_states.push(ReaderState::new(reader, current));
        }

        match self.context.get_status_change(Some(timeout), &mut reader_states) {
            Ok(()) => {}
            Err(pcsc::Error::Timeout) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let mut events = Vec::new();
        for rs in reader_states.iter().skip(1) {
            let name = rs.name().to_owned();
            let state = rs.event_state() - State::CHANGED;
            let was_present = self
                .known
                .get(&name)
                .is_some_and(|(prev, _)| card_present(*prev));
            let reader = name.to_string_lossy().into_owned();
            trace!(reader = %reader, state = ?state, "Reader state");

            if card_present(state) {
                let atr = rs.atr().to_vec();
                let changed = self.known.get(&name).is_none_or(|(_, prev)| *prev != atr);
                if !was_present || changed {
                    debug!(reader = %reader, "Card inserted");
                    events.push(CardEvent::Inserted {
                        reader,
                        atr: atr.clone(),
                    });
                }
                self.known.insert(name, (state, atr));
            } else {
                if was_present {
                    debug!(reader = %reader, "Card removed");
                    events.push(CardEvent::Removed { reader });
                }
                self.known.insert(name, (state, Vec::new()));
            }
        }

        Ok(events)
    }
}
