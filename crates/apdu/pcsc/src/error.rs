//! Error types for PC/SC transport

use cie_apdu_core::TransportError;

/// PC/SC-specific errors
#[derive(Debug, thiserror::Error)]
pub enum PcscError {
    /// PC/SC error
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    /// No readers available
    #[error("No readers available")]
    NoReadersAvailable,

    /// Reader not found
    #[error("Reader not found: {0}")]
    ReaderNotFound(String),

    /// No card present in reader
    #[error("No card present in reader: {0}")]
    NoCard(String),
}

impl From<PcscError> for TransportError {
    fn from(error: PcscError) -> Self {
        match error {
            PcscError::Pcsc(
                pcsc::Error::RemovedCard | pcsc::Error::ResetCard | pcsc::Error::NoSmartcard,
            )
            | PcscError::NoCard(_) => Self::CardRemoved,
            PcscError::Pcsc(pcsc::Error::Timeout) => Self::Timeout,
            PcscError::Pcsc(pcsc::Error::Cancelled) => Self::Cancelled,
            PcscError::Pcsc(pcsc::Error::InsufficientBuffer) => Self::BufferTooSmall,
            PcscError::Pcsc(
                pcsc::Error::NoService | pcsc::Error::ServiceStopped | pcsc::Error::NoReadersAvailable,
            )
            | PcscError::NoReadersAvailable
            | PcscError::ReaderNotFound(_) => Self::Device,
            PcscError::Pcsc(e) => Self::Other(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_to_transport_error() {
        let removed: TransportError = PcscError::Pcsc(pcsc::Error::RemovedCard).into();
        assert_eq!(removed, TransportError::CardRemoved);

        let timeout: TransportError = PcscError::Pcsc(pcsc::Error::Timeout).into();
        assert_eq!(timeout, TransportError::Timeout);

        let missing: TransportError = PcscError::ReaderNotFound("ACS".into()).into();
        assert_eq!(missing, TransportError::Device);
    }
}
