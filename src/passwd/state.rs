//! Backend conversation states.

/// Where the `passwd` conversation currently stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PasswdState {
    /// Nothing has been classified since the last reset.
    #[default]
    None,
    /// The backend is asking for the current password.
    AwaitingAuth,
    /// The backend is asking for the new password.
    AwaitingNew,
    /// The backend is asking for the new password again.
    AwaitingRetype,
    /// The change succeeded but the backend may not have exited yet.
    Done,
    /// The backend reported an error but may not have exited yet.
    Error,
}
