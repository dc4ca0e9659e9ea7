/// Errors that can occur in connection and stream operations.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] muxsql_frame::FrameError),

    /// Transport-level I/O error.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake failed; the code and message were sent to the client.
    #[error("handshake failed ({code}): {message}")]
    HandshakeFailed { code: u32, message: String },

    /// The peer did not send anything in time.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Peer disconnected or the connection writer is gone.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// The stream is closed; nothing more can be sent on it.
    #[error("stream {0} is closed")]
    StreamClosed(u32),
}

pub type Result<T> = std::result::Result<T, MuxError>;
