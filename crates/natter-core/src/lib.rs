//! natter-core: shared protocol library for natter.
//!
//! Provides the wire messages, the length-prefixed frame codec, the error
//! taxonomy and the endpoint-side relay loop used by both clients.

pub mod codec;
pub mod error;
pub mod messages;
pub mod relay;

// Re-export commonly used items at crate root.
pub use codec::{frame_decode, frame_encode, read_frame, write_frame, FrameDecoder, FrameReader, DEFAULT_MAX_FRAME_LEN};
pub use error::{NatterError, NatterResult};
pub use messages::{CloseReason, Message, MsgType, SessionId, PROTOCOL_VERSION};
pub use relay::{relay_session, RelayOutcome, RelayTimings};

/// Longest accepted peer name, in bytes.
pub const MAX_NAME_LEN: usize = 64;

/// Check a peer name: non-empty, at most [`MAX_NAME_LEN`] bytes, no control
/// characters.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".into());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("name longer than {MAX_NAME_LEN} bytes"));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err("name contains control characters".into());
    }
    Ok(())
}
