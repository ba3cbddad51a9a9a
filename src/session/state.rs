//! Session state machine
//!
//! Exactly one state is active at a time; the controller is the single
//! writer. Terminal states are sticky: once `Finished` or `Error` is
//! reached, no further transition is accepted.

/// Lifecycle state of a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session open
    Idle,
    /// Transport and microphone are being brought up
    Connecting,
    /// Streaming microphone audio, waiting on the agent
    Listening,
    /// At least one scheduled playback buffer has not yet finished
    Speaking,
    /// A tool-call batch is being validated and acked
    Processing,
    /// Session ended (remote close, finish, or explicit close)
    Finished,
    /// Terminal failure (permission or transport)
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Listening => "listening",
            SessionState::Speaking => "speaking",
            SessionState::Processing => "processing",
            SessionState::Finished => "finished",
            SessionState::Error => "error",
        }
    }

    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Error)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Finished.is_terminal());
        assert!(SessionState::Error.is_terminal());
        assert!(!SessionState::Idle.is_terminal());
        assert!(!SessionState::Listening.is_terminal());
        assert!(!SessionState::Speaking.is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(SessionState::Speaking.to_string(), "speaking");
        assert_eq!(SessionState::Connecting.to_string(), "connecting");
    }
}
