//! Utility functions for APDU response handling

use tracing::debug;

use crate::response::error::ResponseError;
use crate::response::status::StatusWord;

/// Split raw response bytes into status word and payload
///
/// # Errors
/// Returns [`ResponseError::Incomplete`] when fewer than two bytes are present.
pub fn extract_status_and_payload(data: &[u8]) -> Result<(StatusWord, &[u8]), ResponseError> {
    let Some((payload, sw)) = data.split_last_chunk::<2>() else {
        debug!("Response too short: {} bytes", data.len());
        return Err(ResponseError::Incomplete);
    };
    Ok((StatusWord::new(sw[0], sw[1]), payload))
}
