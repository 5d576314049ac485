//! Relay Error Types

use thiserror::Error;

/// Errors surfaced by the relay core
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listening socket could not be created
    #[error("failed to bind listening address '{addr}': {reason}")]
    Bind { addr: String, reason: String },

    /// An outbound connection could not be initiated
    #[error("failed to initiate connection to '{target}': {reason}")]
    ConnectInitiation { target: String, reason: String },

    /// Identity lookup or switch failed
    #[error("failed to drop privileges to '{user}': {reason}")]
    PrivilegeDrop { user: String, reason: String },

    /// Operation called in the wrong lifecycle state
    #[error("invalid manager state: {0}")]
    InvalidState(String),
}

impl RelayError {
    pub(crate) fn bind(addr: impl Into<String>, reason: impl ToString) -> Self {
        RelayError::Bind {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn connect(target: impl Into<String>, reason: impl ToString) -> Self {
        RelayError::ConnectInitiation {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn privilege(user: impl Into<String>, reason: impl ToString) -> Self {
        RelayError::PrivilegeDrop {
            user: user.into(),
            reason: reason.to_string(),
        }
    }
}
