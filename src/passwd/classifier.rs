//! Trigger tables for recognising `passwd` prompts and verdicts.
//!
//! Matching is plain case-sensitive substring containment over everything the
//! backend has printed since the last state transition. The backend speaks
//! natural language, so these tables are inherently fragile: a different
//! `passwd` version or an unforced locale can change the wording and silently
//! break classification. Keep the keyword lists and their order as they are.

use super::error::{PasswdError, RejectionReason};

/// Tail of every password prompt (`Password: `, `New password: `, ...).
pub const PASSWORD_PROMPT: &str = "assword: ";

/// Markers that the first prompt already asks for the new password.
pub const NEW_PASSWORD_MARKERS: &[&str] = &["new", "New"];

/// Keywords that end authentication unsuccessfully.
pub const AUTH_FAILURE_TRIGGERS: &[&str] = &["failure", "wrong", "error"];

/// Keyword announcing a completed change.
pub const SUCCESS_TRIGGER: &str = "successfully";

/// Everything that ends the retype phase, success included.
pub const RETYPE_TRIGGERS: &[&str] = &[
    SUCCESS_TRIGGER,
    "short",
    "longer",
    "palindrome",
    "dictionary",
    "simple",
    "simplistic",
    "similar",
    "case",
    "different",
    "wrapped",
    "recovered",
    "recent",
    "unchanged",
    "match",
    "1 numeric or special",
    "failure",
    "DIFFERENT",
    "BAD PASSWORD",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Unknown,
    Rejected(RejectionReason),
    ReauthRequired,
}

/// Rejection keywords in priority order. The first rule with a hit wins.
const REJECTION_RULES: &[(&[&str], Classification)] = &[
    (&["recovered"], Classification::Unknown),
    (
        &["short", "longer"],
        Classification::Rejected(RejectionReason::TooShort),
    ),
    (
        &["palindrome", "simple", "simplistic", "dictionary"],
        Classification::Rejected(RejectionReason::TooSimple),
    ),
    (
        &["similar", "different", "case", "wrapped"],
        Classification::Rejected(RejectionReason::TooSimilar),
    ),
    (
        &["recent"],
        Classification::Rejected(RejectionReason::RecentlyUsed),
    ),
    (
        &["1 numeric or special"],
        Classification::Rejected(RejectionReason::MissingCharacterClass),
    ),
    (
        &["unchanged", "match"],
        Classification::Rejected(RejectionReason::Unchanged),
    ),
    (&["failure"], Classification::ReauthRequired),
    (
        &["DIFFERENT", "BAD PASSWORD"],
        Classification::Rejected(RejectionReason::NotEnoughDistinct),
    ),
];

/// Result of classifying output while authenticating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    /// The backend moved on to the next password prompt.
    Accepted,
    /// The backend printed a failure keyword.
    Failed,
}

/// Result of classifying output after the retyped password was sent.
#[derive(Debug)]
pub enum RetypeVerdict {
    Changed,
    Refused(PasswdError),
}

/// Returns true if any needle occurs in `haystack`.
#[must_use]
pub fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    !haystack.is_empty() && needles.iter().any(|needle| haystack.contains(needle))
}

/// Returns true if `output` holds a password prompt.
#[must_use]
pub fn is_password_prompt(output: &str) -> bool {
    output.contains(PASSWORD_PROMPT)
}

/// Returns true if a prompt in `output` asks straight for the new password.
#[must_use]
pub fn asks_for_new_password(output: &str) -> bool {
    contains_any(output, NEW_PASSWORD_MARKERS)
}

/// Classify output seen while the current password is being checked.
#[must_use]
pub fn classify_auth(output: &str) -> Option<AuthVerdict> {
    if contains_any(output, AUTH_FAILURE_TRIGGERS) {
        Some(AuthVerdict::Failed)
    } else if is_password_prompt(output) {
        Some(AuthVerdict::Accepted)
    } else {
        None
    }
}

/// Classify output seen after the retyped new password was sent.
#[must_use]
pub fn classify_retype(output: &str) -> Option<RetypeVerdict> {
    if !contains_any(output, RETYPE_TRIGGERS) {
        return None;
    }
    if output.contains(SUCCESS_TRIGGER) {
        return Some(RetypeVerdict::Changed);
    }
    Some(RetypeVerdict::Refused(classify_rejection(output)))
}

/// Map refusal text to an error using the rejection table.
#[must_use]
pub fn classify_rejection(output: &str) -> PasswdError {
    let hit = REJECTION_RULES
        .iter()
        .find(|(keywords, _)| contains_any(output, keywords))
        .map_or(Classification::Unknown, |(_, class)| *class);

    match hit {
        Classification::Rejected(reason) => PasswdError::Rejected(reason),
        Classification::ReauthRequired => PasswdError::ReauthRequired,
        Classification::Unknown => PasswdError::Unknown(output.trim().to_string()),
    }
}
