use thiserror::Error;

/// Failures surfaced by the session, repository and controller layers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JournalError {
    /// No session token, or the token has expired.
    #[error("Not logged in")]
    Unauthenticated,

    /// Transport failure, including timeouts.
    #[error("Failed to connect to backend: {0}")]
    Unreachable(String),

    /// The server answered with a non-2xx status.
    #[error("Request rejected ({status}): {detail}")]
    RequestRejected { status: u16, detail: String },

    /// The entry no longer exists on the server.
    #[error("Entry not found")]
    NotFound,

    /// Client-side checks failed before any request was sent.
    #[error("{0}")]
    ValidationFailed(String),

    /// A 2xx body that could not be decoded.
    #[error("Unexpected response from backend: {0}")]
    Malformed(String),

    #[error("Session storage error: {0}")]
    Storage(String),
}

impl JournalError {
    pub fn validation(msg: impl Into<String>) -> Self {
        JournalError::ValidationFailed(msg.into())
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            JournalError::RequestRejected { status, .. } => Some(*status),
            JournalError::Unauthenticated => Some(401),
            JournalError::NotFound => Some(404),
            _ => None,
        }
    }

    /// 402/403 on a feedback request means the free allowance is used up.
    pub fn is_payment_required(&self) -> bool {
        matches!(self.status(), Some(402) | Some(403))
    }

    /// The text shown in the controller's error line.
    pub fn message(&self) -> String {
        match self {
            JournalError::RequestRejected { detail, .. } if !detail.trim().is_empty() => {
                detail.clone()
            }
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for JournalError {
    fn from(e: std::io::Error) -> Self {
        JournalError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_message_prefers_server_detail() {
        let err = JournalError::RequestRejected {
            status: 400,
            detail: "Email already registered".to_string(),
        };
        assert_eq!(err.message(), "Email already registered");

        let blank = JournalError::RequestRejected {
            status: 500,
            detail: " ".to_string(),
        };
        assert_eq!(blank.message(), "Request rejected (500):  ");
    }

    #[test]
    fn payment_required_statuses() {
        let forbidden = JournalError::RequestRejected {
            status: 403,
            detail: "limit".to_string(),
        };
        let payment = JournalError::RequestRejected {
            status: 402,
            detail: "limit".to_string(),
        };
        assert!(forbidden.is_payment_required());
        assert!(payment.is_payment_required());
        assert!(!JournalError::NotFound.is_payment_required());
        assert!(!JournalError::Unreachable("timeout".into()).is_payment_required());
    }
}
