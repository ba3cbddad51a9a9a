//! Error taxonomy for the capture session
//!
//! Only `Permission` and a terminal `Transport` error surface to the caller
//! as blocking failures. Malformed tool calls are acked with an error status
//! and the conversation continues; decode failures are logged and dropped
//! unless they become systemic.

/// Errors that can occur during a capture session
#[derive(Debug, Clone)]
pub enum SessionError {
    /// Microphone access denied or no input device available
    Permission(String),
    /// Underlying connection failed to open or dropped mid-session
    Transport(String),
    /// A received audio chunk failed to decode
    Decode(String),
    /// A tool call was missing required fields or had a non-positive amount
    MalformedToolCall(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Permission(e) => {
                write!(f, "Microphone unavailable: {}", e)
            }
            SessionError::Transport(e) => {
                write!(f, "Session transport failed: {}", e)
            }
            SessionError::Decode(e) => {
                write!(f, "Failed to decode audio chunk: {}", e)
            }
            SessionError::MalformedToolCall(e) => {
                write!(f, "Malformed tool call: {}", e)
            }
        }
    }
}

impl std::error::Error for SessionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let err = SessionError::Permission("access denied".to_string());
        assert!(err.to_string().contains("access denied"));

        let err = SessionError::Transport("connection reset".to_string());
        assert!(err.to_string().contains("connection reset"));

        let err = SessionError::MalformedToolCall("amount must be positive".to_string());
        assert!(err.to_string().contains("amount"));
    }
}
