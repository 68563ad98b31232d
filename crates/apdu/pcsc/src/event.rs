//! Card presence events reported by the monitor

/// Card insertion or removal in a reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardEvent {
    /// A card entered the field or was inserted
    Inserted {
        /// Reader name
        reader: String,
        /// ATR reported by the reader
        atr: Vec<u8>,
    },
    /// The card left the reader
    Removed {
        /// Reader name
        reader: String,
    },
}

impl CardEvent {
    /// Name of the reader the event belongs to
    pub fn reader(&self) -> &str {
        match self {
            Self::Inserted { reader, .. } | Self::Removed { reader } => reader,
        }
    }
}
