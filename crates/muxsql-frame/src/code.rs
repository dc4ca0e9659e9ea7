//! Stable numeric error codes carried by RESET and GOAWAY frames.
//!
//! Clients match on these values; they must never change.

/// Connection could not be opened or authenticated.
pub const HANDSHAKE_FAILED: u32 = 1004;

/// Engine or subprocess failure, or an unanticipated internal error.
pub const INTERNAL: u32 = 2000;

/// The message is not valid for the stream's current state.
pub const UNEXPECTED_MESSAGE: u32 = 2001;

/// The authenticated access key may not perform this request.
pub const AUTHORIZATION: u32 = 2002;

/// The operation is not offered over this channel.
pub const UNSUPPORTED: u32 = 2003;

/// Returns a human-readable name for an error code.
pub fn name(code: u32) -> &'static str {
    match code {
        HANDSHAKE_FAILED => "HANDSHAKE_FAILED",
        INTERNAL => "INTERNAL",
        UNEXPECTED_MESSAGE => "UNEXPECTED_MESSAGE",
        AUTHORIZATION => "AUTHORIZATION",
        UNSUPPORTED => "UNSUPPORTED",
        _ => "UNKNOWN",
    }
}

/// Returns true if the code terminates the whole connection rather than one stream.
pub fn is_connection_fatal(code: u32) -> bool {
    (1000..2000).contains(&code)
}
