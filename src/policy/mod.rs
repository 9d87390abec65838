//! Merge eligibility policy.
//!
//! Pure predicates over a freshly fetched merge request. The checks run
//! in a fixed order and the first failing one decides the verdict; the
//! job applies the side effects (comment, unassign) afterwards. Nothing
//! in here talks to the platform or to git.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::embargo::EmbargoSet;
use crate::gitlab::{Approvals, Branch, MergeRequest, MrState, Project, User};

/// Cool-down applied when a time-window embargo defers an MR.
const EMBARGO_RETRY_DELAY: Duration = Duration::from_secs(300);

/// What the policy decides about one merge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Eligible; proceed to the branch update.
    Ok,
    /// Not a candidate at all — drop silently, no comment, no unassign.
    Skip { reason: &'static str },
    /// Reject with a comment and unassign.
    RejectTerminal { reason: String },
    /// Not now; try again after the delay. No comment.
    Requeue { reason: String, delay: Duration },
}

/// Everything the policy looks at besides the MR itself.
pub struct PolicyContext<'a> {
    pub bot: &'a User,
    pub project: &'a Project,
    pub approvals: &'a Approvals,
    /// Target branch record when the platform exposes it.
    pub target_branch: Option<&'a Branch>,
    /// Whether the chosen update strategy pushes to the repository.
    pub needs_push: bool,
    pub embargo: &'a EmbargoSet,
    pub now: DateTime<Utc>,
}

/// Evaluate the ordered eligibility checks for one freshly fetched MR.
pub fn evaluate(mr: &MergeRequest, ctx: &PolicyContext<'_>) -> Verdict {
    if mr.state != MrState::Opened {
        return Verdict::Skip { reason: "not open" };
    }

    if mr.work_in_progress {
        return Verdict::RejectTerminal {
            reason: "it is a draft".to_string(),
        };
    }

    if !mr.is_assigned_to(ctx.bot) {
        return Verdict::Skip {
            reason: "no longer assigned",
        };
    }

    if mr.author_id == ctx.bot.id {
        return Verdict::RejectTerminal {
            reason: "I don't merge my own merge requests".to_string(),
        };
    }

    if ctx.approvals.approvals_left > 0 {
        let left = ctx.approvals.approvals_left;
        return Verdict::RejectTerminal {
            reason: format!(
                "it still needs {left} approval{}",
                if left == 1 { "" } else { "s" }
            ),
        };
    }

    if ctx.needs_push
        && let Some(branch) = ctx.target_branch
        && branch.protected
        && !branch.can_push
    {
        return Verdict::RejectTerminal {
            reason: format!(
                "I am not allowed to push to protected branch {}",
                branch.name
            ),
        };
    }

    if ctx.project.only_allow_merge_if_all_discussions_are_resolved
        && !mr.blocking_discussions_resolved
    {
        return Verdict::RejectTerminal {
            reason: "it has unresolved discussions".to_string(),
        };
    }

    if let Some(reason) = ctx.embargo.branch_embargo(&mr.target_branch) {
        return Verdict::RejectTerminal { reason };
    }
    if let Some(reason) = ctx.embargo.window_embargo(ctx.now) {
        return Verdict::Requeue {
            reason,
            delay: EMBARGO_RETRY_DELAY,
        };
    }

    Verdict::Ok
}
