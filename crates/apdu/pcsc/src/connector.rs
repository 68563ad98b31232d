//! [`CardConnector`] that waits for a card on a PC/SC reader

use std::time::Duration;

use cie_apdu_core::{CardConnector, TransportError};
use tracing::{debug, info};

use crate::config::PcscConfig;
use crate::event::CardEvent;
use crate::manager::PcscDeviceManager;
use crate::monitor::PcscMonitor;
use crate::transport::PcscTransport;

/// Hands out a [`PcscTransport`] once a card shows up
#[derive(Debug)]
pub struct PcscConnector {
    manager: PcscDeviceManager,
    monitor: PcscMonitor,
    reader: Option<String>,
    config: PcscConfig,
}

impl PcscConnector {
    pub(crate) fn new(
        manager: PcscDeviceManager,
        reader: Option<String>,
        config: PcscConfig,
    ) -> Self {
        let monitor = manager.monitor();
        Self {
            manager,
            monitor,
            reader,
            config,
        }
    }

    fn wanted(&self, reader: &str) -> bool {
        self.reader.as_deref().is_none_or(|wanted| wanted == reader)
    }
}

impl CardConnector for PcscConnector {
    type Transport = PcscTransport;

    fn poll(&mut self, timeout: Duration) -> Result<Option<PcscTransport>, TransportError> {
        let events = self.monitor.wait_for_card_events(timeout)?;
        for event in events {
            let CardEvent::Inserted { reader, atr } = event else {
                continue;
            };
            if !self.wanted(&reader) {
                debug!(reader = %reader, "Ignoring card on other reader");
                continue;
            }
            info!(reader = %reader, atr_len = atr.len(), "Card detected");
            let transport = self.manager.open_reader_with_config(&reader, self.config)?;
            return Ok(Some(transport));
        }
        Ok(None)
    }
}
