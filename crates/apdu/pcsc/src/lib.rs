//! PC/SC transport implementation for APDU operations
//!
//! This crate implements the `CardTransport` and `CardConnector` traits from
//! `cie-apdu-core` on top of the PC/SC API, so contact readers and PC/SC capable NFC readers
//! can drive the CIE protocol.
//!
//! # Examples
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use cie_apdu_core::prelude::*;
//! use cie_apdu_transport_pcsc::PcscDeviceManager;
//!
//! let manager = PcscDeviceManager::new()?;
//! let readers = manager.list_readers()?;
//! let Some(reader) = readers.iter().find(|r| r.has_card()) else {
//!     println!("No card present");
//!     return Ok(());
//! };
//!
//! let mut transport = manager.open_reader(reader.name())?;
//! let select_ias = Command::new_with_data(
//!     0x00, 0xA4, 0x04, 0x0C,
//!     vec![0xA0, 0x00, 0x00, 0x00, 0x30, 0x80, 0x00, 0x00, 0x00, 0x09, 0x81, 0x60, 0x01],
//! );
//! let response = transport.transmit(&select_ias)?;
//! println!("SELECT IAS: {}", response.status());
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![warn(missing_docs)]

mod config;
mod connector;
mod error;
mod event;
mod manager;
mod monitor;
mod reader;
mod transport;

pub use config::{PcscConfig, ShareMode};
pub use connector::PcscConnector;
pub use error::PcscError;
pub use event::CardEvent;
pub use manager::PcscDeviceManager;
pub use monitor::PcscMonitor;
pub use reader::PcscReader;
pub use transport::PcscTransport;

pub use pcsc::Protocols;
