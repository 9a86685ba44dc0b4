//! Error types delivered to password-change callbacks.

use crate::backend::SpawnError;

/// Why the backend refused the new password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    TooShort,
    TooSimple,
    TooSimilar,
    RecentlyUsed,
    MissingCharacterClass,
    Unchanged,
    NotEnoughDistinct,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::TooShort => "The new password is too short",
            Self::TooSimple => "The new password is too simple",
            Self::TooSimilar => "The old and new passwords are too similar",
            Self::RecentlyUsed => "The new password has already been used recently",
            Self::MissingCharacterClass => {
                "The new password must contain numeric or special characters"
            }
            Self::Unchanged => "The old and new passwords are the same",
            Self::NotEnoughDistinct => {
                "The new password does not contain enough different characters"
            }
        };
        f.write_str(msg)
    }
}

/// Outcome of a failed authentication or password change.
#[derive(thiserror::Error, Debug)]
pub enum PasswdError {
    /// The current password was wrong or PAM refused authentication.
    #[error("Authentication failed")]
    AuthFailed,
    /// The new password does not satisfy the backend's policy.
    #[error("{0}")]
    Rejected(RejectionReason),
    /// The password was changed elsewhere after this session authenticated.
    #[error("Your password has been changed since you initially authenticated")]
    ReauthRequired,
    /// The backend could not be started.
    #[error("Backend error: {0}")]
    Backend(#[from] SpawnError),
    /// Backend output that matched no known message. The text is kept for diagnostics.
    #[error("Unknown error: {0}")]
    Unknown(String),
    /// The backend went away before reporting an outcome.
    #[error("passwd exited before reporting a result")]
    Incomplete,
}

impl PasswdError {
    /// The rejection reason, if this is a policy rejection.
    #[must_use]
    pub fn rejection(&self) -> Option<RejectionReason> {
        match self {
            Self::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Result delivered to completion callbacks.
pub type PasswdResult = Result<(), PasswdError>;
