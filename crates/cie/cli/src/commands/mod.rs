//! Subcommands and their handlers

mod output;

use std::time::Duration;

use cie_apdu_transport_pcsc::PcscConnector;
use cie_sdk::{CieReader, Event};
use clap::Subcommand;
use tracing::{debug, info};

use crate::utils::{Encoding, decode_challenge};

/// Define subcommands for the CLI
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// List available readers
    List,

    /// Read the ATR and detect the card profile
    Attributes,

    /// Authenticate with the PIN and print the IdP redirect URL
    Authenticate {
        /// 8 digit PIN
        #[arg(required = true)]
        pin: String,

        /// Service provider URL the assertion is bound to
        #[arg(required = true)]
        url: String,
    },

    /// Have the chip sign a challenge with its internal authentication key
    InternalAuth {
        /// Challenge, as hex or base64
        #[arg(required = true)]
        challenge: String,
    },

    /// Read DG1, DG11 and the SOD over PACE
    Mrtd {
        /// 6 digit card access number printed on the card
        #[arg(required = true)]
        can: String,
    },

    /// Read the eMRTD data, then run the internal authentication
    InternalAuthMrtd {
        /// 6 digit card access number printed on the card
        #[arg(required = true)]
        can: String,

        /// Challenge, as hex or base64
        #[arg(required = true)]
        challenge: String,
    },

    /// Print the holder details of the authentication certificate
    Certificate {
        /// 8 digit PIN
        #[arg(required = true)]
        pin: String,
    },
}

/// Start the operation behind `command` and print its outcome
pub(crate) fn run(
    cie: &CieReader<PcscConnector>,
    command: Commands,
    timeout: Option<Duration>,
    encoding: Encoding,
) -> eyre::Result<()> {
    let events = match command {
        Commands::List => return Ok(()),
        Commands::Attributes => cie.start_reading_attributes(timeout)?,
        Commands::Authenticate { pin, url } => cie.start_reading(&pin, &url, timeout)?,
        Commands::InternalAuth { challenge } => {
            let challenge = decode_challenge(&challenge)?;
            cie.start_internal_authentication(&challenge, timeout)?
        }
        Commands::Mrtd { can } => cie.start_mrtd_reading(&can, timeout)?,
        Commands::InternalAuthMrtd { can, challenge } => {
            let challenge = decode_challenge(&challenge)?;
            cie.start_internal_auth_and_mrtd_reading(&can, &challenge, timeout)?
        }
        Commands::Certificate { pin } => cie.start_reading_certificate(&pin, timeout)?,
    };

    for event in events.iter() {
        match event {
            Event::Progress { step, progress } => {
                info!("{:>3.0}% {step}", progress * 100.0);
            }
            Event::Success(result) => {
                debug!(event = result.event_name(), "Operation succeeded");
                output::print_result(&result, encoding);
                return Ok(());
            }
            Event::Error(error) => {
                eyre::bail!("{}: {}", error.name, error.message);
            }
        }
    }

    eyre::bail!("Operation ended without a result")
}
