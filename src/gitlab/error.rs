//! Error taxonomy for the GitLab client.
//!
//! Callers need to distinguish three things: errors worth retrying at the
//! call site (transient upstream trouble), errors that must surface
//! immediately (authorization), and merge preconditions the state machine
//! wants to reason about (`MergeRefused`). Everything else is a plain
//! failure with the server's detail attached.

use thiserror::Error;

/// Why the platform refused an `accept` call.
///
/// These are precondition failures, not transport problems, and are never
/// retried inside the client. The job state machine decides what each one
/// means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeRefusal {
    /// The merge request head moved since we last pushed.
    ShaMismatch,
    /// The platform considers the MR unmergeable (conflicts, draft, …).
    NotMergeable,
    /// The project requires a green pipeline and the platform doesn't see
    /// one yet.
    PipelineNotSuccess,
    /// Some other 4xx precondition, with the server's message.
    Other(String),
}

impl std::fmt::Display for MergeRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShaMismatch => write!(f, "the merge request head moved"),
            Self::NotMergeable => write!(f, "the merge request is not mergeable"),
            Self::PipelineNotSuccess => write!(f, "the pipeline has not succeeded"),
            Self::Other(detail) => write!(f, "{detail}"),
        }
    }
}

/// Errors surfaced by the platform client.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// 401/403 — never retried. Carries the request path for diagnostics.
    #[error("unauthorized for {0}")]
    Unauthorized(String),

    /// Network trouble, 5xx, or 429 past the retry budget.
    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),

    /// 404 on a resource the caller asked for by id.
    #[error("not found: {0}")]
    NotFound(String),

    /// A merge precondition failed on `accept`.
    #[error("merge refused: {0}")]
    MergeRefused(MergeRefusal),

    /// The platform answered but the body didn't parse as expected.
    #[error("malformed response from {path}: {detail}")]
    Malformed { path: String, detail: String },

    /// Any other non-success status.
    #[error("request to {path} failed with status {status}: {detail}")]
    Status {
        path: String,
        status: u16,
        detail: String,
    },
}

impl ApiError {
    /// Whether a job seeing this error should requeue rather than reject.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientUpstream(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_the_only_requeueable_kind() {
        assert!(ApiError::TransientUpstream("reset".into()).is_transient());
        assert!(!ApiError::Unauthorized("/user".into()).is_transient());
        assert!(!ApiError::MergeRefused(MergeRefusal::ShaMismatch).is_transient());
    }

    #[test]
    fn refusal_display_is_human_readable() {
        assert_eq!(
            MergeRefusal::ShaMismatch.to_string(),
            "the merge request head moved"
        );
        assert_eq!(
            MergeRefusal::Other("branch diverged".into()).to_string(),
            "branch diverged"
        );
    }
}
