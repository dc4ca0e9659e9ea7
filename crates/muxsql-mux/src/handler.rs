use muxsql_frame::{code, Message};

use crate::stream::Stream;

/// Receives the decoded messages of one stream.
///
/// A handler is called from a blocking thread, one message at a time per
/// connection, and may reply through the [`Stream`] directly.
pub trait StreamHandler: Send {
    /// Handle one message. Returning `Err` closes the stream with the error's code.
    fn handle_message(
        &mut self,
        message: Message,
        stream: &Stream,
    ) -> Result<Transition, HandlerError>;

    /// Release resources; called once when the stream closes while this
    /// handler is installed.
    fn close(&mut self) {}
}

/// What the connection does with the handler after a message.
pub enum Transition {
    /// Keep the current handler.
    Stay,
    /// Route the stream's later messages to a new handler.
    Replace(Box<dyn StreamHandler>),
}

/// Error returned by a handler; becomes a RESET on the stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Sent to the client as-is.
    #[error("{message} ({code})")]
    Revealable { code: u32, message: String },

    /// Logged; the client only sees a generic internal error.
    #[error("internal: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn revealable(code: u32, message: impl Into<String>) -> Self {
        HandlerError::Revealable {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        HandlerError::Internal(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::revealable(code::UNEXPECTED_MESSAGE, message)
    }

    /// The `(code, message)` pair the client sees.
    pub fn client_view(&self) -> (u32, &str) {
        match self {
            HandlerError::Revealable { code, message } => (*code, message),
            HandlerError::Internal(_) => (code::INTERNAL, "Internal error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_are_not_revealed() {
        let err = HandlerError::internal("engine socket /var/run/x refused");
        assert_eq!(err.client_view(), (code::INTERNAL, "Internal error"));
    }

    #[test]
    fn revealable_errors_pass_through() {
        let err = HandlerError::revealable(code::AUTHORIZATION, "Authorization error");
        assert_eq!(err.client_view(), (2002, "Authorization error"));
        assert_eq!(
            HandlerError::unexpected("unexpected message").client_view().0,
            code::UNEXPECTED_MESSAGE
        );
    }
}
