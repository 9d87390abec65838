//! Single merge-request job.
//!
//! One job drives one MR through fetch → validate → branch update →
//! wait-for-rebase → wait-for-CI → merge → confirm. Every decision is
//! made on freshly fetched platform state, never on the snapshot the
//! scheduler handed over. The job returns exactly one [`JobOutcome`];
//! no lower-level error escapes to the project loop.
//!
//! Side effects on the way out: a terminal rejection posts exactly one
//! comment and unassigns the bot; a requeue or cancellation touches
//! nothing.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{BotConfig, SkippedCi};
use crate::embargo::EmbargoSet;
use crate::gitlab::{
    AcceptOptions, ApiError, Approvals, MergeMethod, MergeRefusal, MergeRequest, MrState,
    Pipeline, PipelineStatus, Platform, Project, User,
};
use crate::policy::{self, PolicyContext, Verdict};
use crate::shutdown::ShutdownFlag;
use crate::trailers::{self, Trailer, TrailerError};
use crate::worktree::{GitError, PushMode, Worktree};

const COMMENT_PREFIX: &str = "I couldn't merge this:";
const REASON_MAX_CHARS: usize = 400;
const POLL_SLEEP: Duration = Duration::from_secs(5);
const REFUSAL_RETRY_DELAY: Duration = Duration::from_secs(5);
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(120);

/// The only thing a job reports back to its project loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Merged,
    /// Commented and unassigned; the MR is no longer a candidate.
    RejectTerminal { reason: String },
    /// Still a candidate; retry after the delay (or the loop's default
    /// cool-down when `delay` is `None`). No comment was posted.
    Requeue {
        reason: String,
        delay: Option<Duration>,
    },
    /// Shutdown, reassignment, or a vanished MR. Silent.
    Cancelled,
}

/// Shared collaborators handed to every job of a bot run.
pub struct JobContext<'a> {
    pub platform: &'a dyn Platform,
    pub worktree: &'a Mutex<Worktree>,
    pub config: &'a BotConfig,
    pub bot: &'a User,
    pub embargo: &'a EmbargoSet,
    pub shutdown: &'a ShutdownFlag,
}

/// Early exit from the state machine with a decided outcome.
pub(crate) struct Halt(pub(crate) JobOutcome);

type Step<T> = Result<T, Halt>;

impl From<ApiError> for Halt {
    fn from(error: ApiError) -> Self {
        let outcome = match error {
            ApiError::TransientUpstream(detail) => JobOutcome::Requeue {
                reason: detail,
                delay: None,
            },
            // The project loop's own listing will hit the same wall and
            // disable the project; nothing useful to do inside a job.
            ApiError::Unauthorized(path) => JobOutcome::Requeue {
                reason: format!("unauthorized for {path}"),
                delay: None,
            },
            // The MR (or something it references) is gone; no mutation
            // is possible or wanted.
            ApiError::NotFound(_) => JobOutcome::Cancelled,
            ApiError::MergeRefused(refusal) => JobOutcome::RejectTerminal {
                reason: refusal.to_string(),
            },
            other @ (ApiError::Malformed { .. } | ApiError::Status { .. }) => JobOutcome::Requeue {
                reason: other.to_string(),
                delay: None,
            },
        };
        Halt(outcome)
    }
}

impl From<GitError> for Halt {
    fn from(error: GitError) -> Self {
        let outcome = match error {
            GitError::RebaseConflict { .. } => JobOutcome::RejectTerminal {
                reason: "it needs a manual rebase onto the target branch".to_string(),
            },
            GitError::PushRejected { detail } => JobOutcome::RejectTerminal {
                reason: format!("the push was rejected ({detail})"),
            },
            GitError::RemoteMoved { detail } => JobOutcome::Requeue {
                reason: detail,
                delay: None,
            },
            other @ (GitError::CommandFailed { .. } | GitError::Spawn(_)) => JobOutcome::Requeue {
                reason: other.to_string(),
                delay: None,
            },
        };
        Halt(outcome)
    }
}

impl From<TrailerError> for Halt {
    fn from(error: TrailerError) -> Self {
        let outcome = match error {
            // A hidden approver email is the reviewer's to fix.
            TrailerError::MissingEmail { .. } => JobOutcome::RejectTerminal {
                reason: error.to_string(),
            },
            // Local git trouble is not the MR's fault.
            TrailerError::Rewrite { .. } | TrailerError::Spawn(_) => JobOutcome::Requeue {
                reason: error.to_string(),
                delay: None,
            },
        };
        Halt(outcome)
    }
}

/// How the source branch is brought up to date before merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateStrategy {
    /// No branch mutation; the platform merges (and rebases if its
    /// method demands it).
    PlatformMerge,
    /// Ask the platform to rebase, then merge.
    RemoteRebase,
    /// Rebase in the local worktree and push with a lease.
    LocalRebase,
}

impl UpdateStrategy {
    fn choose(project: &Project, config: &BotConfig) -> Self {
        if config.use_merge_strategy || project.merge_method == MergeMethod::Merge {
            Self::PlatformMerge
        } else if config.rebase_remotely {
            Self::RemoteRebase
        } else {
            Self::LocalRebase
        }
    }

    fn pushes(self) -> bool {
        self == Self::LocalRebase
    }
}

pub struct MergeJob<'a> {
    ctx: &'a JobContext<'a>,
    project_id: u64,
    mr_iid: u64,
}

impl<'a> MergeJob<'a> {
    pub fn new(ctx: &'a JobContext<'a>, project_id: u64, mr_iid: u64) -> Self {
        Self {
            ctx,
            project_id,
            mr_iid,
        }
    }

    /// Drive the MR to a terminal outcome, applying rejection side
    /// effects before returning.
    pub fn run(&self) -> JobOutcome {
        let outcome = match self.execute() {
            Ok(outcome) => outcome,
            Err(Halt(outcome)) => outcome,
        };
        match &outcome {
            JobOutcome::Merged => {
                info!(mr = self.mr_iid, "merged");
            }
            JobOutcome::RejectTerminal { reason } => {
                info!(mr = self.mr_iid, reason = %reason, "rejecting");
                self.leave_rejection_note(reason);
            }
            JobOutcome::Requeue { reason, .. } => {
                debug!(mr = self.mr_iid, reason = %reason, "requeueing");
            }
            JobOutcome::Cancelled => {
                debug!(mr = self.mr_iid, "cancelled");
            }
        }
        outcome
    }

    fn execute(&self) -> Step<JobOutcome> {
        self.check_cancelled()?;

        // Never trust the scheduler's snapshot.
        let project = self.ctx.platform.get_project(self.project_id)?;
        let mr = self.ctx.platform.get_mr(self.project_id, self.mr_iid)?;
        let approvals = self.ctx.platform.get_approvals(self.project_id, self.mr_iid)?;

        let strategy = UpdateStrategy::choose(&project, self.ctx.config);
        let target_branch = self
            .ctx
            .platform
            .get_branch(project.id, &mr.target_branch)?;
        let verdict = policy::evaluate(
            &mr,
            &PolicyContext {
                bot: self.ctx.bot,
                project: &project,
                approvals: &approvals,
                target_branch: target_branch.as_ref(),
                needs_push: strategy.pushes(),
                embargo: self.ctx.embargo,
                now: Utc::now(),
            },
        );
        match verdict {
            Verdict::Ok => {}
            Verdict::Skip { reason } => {
                debug!(mr = mr.iid, reason, "not a candidate");
                return Ok(JobOutcome::Cancelled);
            }
            Verdict::RejectTerminal { reason } => {
                return Ok(JobOutcome::RejectTerminal { reason });
            }
            Verdict::Requeue { reason, delay } => {
                return Ok(JobOutcome::Requeue {
                    reason,
                    delay: Some(delay),
                });
            }
        }

        let previous_head = mr.sha.clone();
        let expected_head = match strategy {
            UpdateStrategy::PlatformMerge => mr.sha.clone(),
            UpdateStrategy::RemoteRebase => self.remote_rebase(&mr)?,
            UpdateStrategy::LocalRebase => self.local_rebase(&project, &mr, &approvals)?,
        };

        if strategy.pushes() {
            self.wait_until_platform_sees(&expected_head)?;

            // Our own push may have reset approvals; give reviewers the
            // configured grace instead of rejecting.
            if expected_head != previous_head {
                let after = self.ctx.platform.get_approvals(project.id, mr.iid)?;
                if after.approvals_left > 0 {
                    return Ok(JobOutcome::Requeue {
                        reason: "the rebase reset approvals".to_string(),
                        delay: Some(self.ctx.config.approval_reset_timeout),
                    });
                }
            }
        }

        if self.ci_required(&project) {
            self.wait_for_ci(&project, &expected_head)?;
        }

        self.accept_with_retries(&project, &expected_head)?;
        self.confirm_merged(&project, &expected_head)
    }

    /// Fetch both sides, rebase, rewrite trailers, push with a lease.
    /// Holds the worktree lock for the whole mutation, never across the
    /// polling that follows.
    fn local_rebase(
        &self,
        project: &Project,
        mr: &MergeRequest,
        approvals: &Approvals,
    ) -> Step<String> {
        let additions = self.trailer_additions(mr, approvals)?;
        let source_project = if mr.source_project() == project.id {
            project.clone()
        } else {
            self.ctx.platform.get_project(mr.source_project())?
        };
        let use_https = self.ctx.config.use_https;

        let worktree = self
            .ctx
            .worktree
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let result = (|| -> Step<String> {
            let target_sha = worktree.fetch(project.repo_url(use_https), &mr.target_branch)?;
            let source_sha =
                worktree.fetch(source_project.repo_url(use_https), &mr.source_branch)?;
            if source_sha != mr.sha {
                // Someone pushed between our read and the fetch.
                return Err(Halt(JobOutcome::Requeue {
                    reason: "the source branch moved while validating".to_string(),
                    delay: None,
                }));
            }

            let new_head = worktree.rebase(&source_sha, &target_sha, &additions)?;
            if new_head != source_sha {
                worktree.push(
                    source_project.repo_url(use_https),
                    &new_head,
                    &mr.source_branch,
                    PushMode::ForceWithLease {
                        expected: &source_sha,
                    },
                )?;
            }
            Ok(new_head)
        })();
        worktree.restore_clean();
        result
    }

    /// Platform-side rebase; returns the resulting head.
    fn remote_rebase(&self, mr: &MergeRequest) -> Step<String> {
        self.ctx.platform.start_rebase(self.project_id, mr.iid)?;

        let deadline = Instant::now() + self.ctx.config.rebase_timeout;
        loop {
            self.poll_sleep(deadline, "the platform rebase did not finish in time")?;
            let status = self.ctx.platform.rebase_status(self.project_id, mr.iid)?;
            if let Some(error) = status.merge_error {
                return Err(Halt(JobOutcome::RejectTerminal {
                    reason: format!("the platform could not rebase it ({error})"),
                }));
            }
            if !status.rebase_in_progress {
                let fresh = self.ctx.platform.get_mr(self.project_id, mr.iid)?;
                return Ok(fresh.sha);
            }
        }
    }

    /// Poll until the platform reports the pushed head.
    fn wait_until_platform_sees(&self, head: &str) -> Step<()> {
        let deadline = Instant::now() + self.ctx.config.rebase_timeout;
        loop {
            let fresh = self.ctx.platform.get_mr(self.project_id, self.mr_iid)?;
            if !fresh.is_assigned_to(self.ctx.bot) {
                return Err(Halt(JobOutcome::Cancelled));
            }
            if fresh.sha == head && !fresh.rebase_in_progress {
                return Ok(());
            }
            self.poll_sleep(deadline, "the platform did not pick up the push in time")?;
        }
    }

    /// Poll pipelines for `head` until one is conclusive. Newest
    /// pipeline wins.
    fn wait_for_ci(&self, project: &Project, head: &str) -> Step<()> {
        let deadline = Instant::now() + self.ctx.config.ci_timeout;
        loop {
            let pipelines = self.ctx.platform.list_pipelines(project.id, head)?;
            if let Some(pipeline) = newest_pipeline(&pipelines) {
                match pipeline.status {
                    PipelineStatus::Success => return Ok(()),
                    PipelineStatus::Failed | PipelineStatus::Canceled => {
                        return Err(Halt(JobOutcome::RejectTerminal {
                            reason: format!("CI failed: {}", pipeline.web_url),
                        }));
                    }
                    PipelineStatus::Skipped | PipelineStatus::Manual => {
                        match self.ctx.config.treat_skipped_as {
                            SkippedCi::Success => return Ok(()),
                            SkippedCi::Failure => {
                                return Err(Halt(JobOutcome::RejectTerminal {
                                    reason: format!(
                                        "CI was {}",
                                        if pipeline.status == PipelineStatus::Manual {
                                            "left waiting on a manual stage"
                                        } else {
                                            "skipped"
                                        }
                                    ),
                                }));
                            }
                            SkippedCi::Wait => {}
                        }
                    }
                    PipelineStatus::Created
                    | PipelineStatus::Pending
                    | PipelineStatus::Running => {}
                }
            }

            if Instant::now() >= deadline {
                if self.ctx.config.ci_timeout_is_fatal {
                    return Err(Halt(JobOutcome::RejectTerminal {
                        reason: "CI did not finish in time".to_string(),
                    }));
                }
                return Err(Halt(JobOutcome::Requeue {
                    reason: "CI did not finish in time".to_string(),
                    delay: None,
                }));
            }
            self.poll_sleep(deadline, "CI did not finish in time")?;
        }
    }

    /// Conditional merge, tolerating a bounded number of eventual-
    /// consistency refusals.
    fn accept_with_retries(&self, project: &Project, head: &str) -> Step<()> {
        let mut refusals = 0u32;
        loop {
            self.check_cancelled()?;

            // Linearization point: decide on fresh state only.
            let fresh = self.ctx.platform.get_mr(project.id, self.mr_iid)?;
            if !fresh.is_assigned_to(self.ctx.bot) {
                return Err(Halt(JobOutcome::Cancelled));
            }
            if fresh.state == MrState::Merged {
                return Ok(());
            }
            if fresh.sha != head {
                return Err(Halt(JobOutcome::Requeue {
                    reason: "the merge request moved underneath us".to_string(),
                    delay: None,
                }));
            }

            let options = AcceptOptions {
                sha: head.to_string(),
                squash: fresh.squash,
                squash_commit_message: None,
                should_remove_source_branch: fresh.force_remove_source_branch
                    || project.remove_source_branch_after_merge,
                merge_when_pipeline_succeeds: false,
            };
            match self.ctx.platform.accept_mr(project.id, self.mr_iid, &options) {
                Ok(()) => return Ok(()),
                Err(ApiError::MergeRefused(MergeRefusal::ShaMismatch)) => {
                    return Err(Halt(JobOutcome::Requeue {
                        reason: "the merge request moved underneath us".to_string(),
                        delay: None,
                    }));
                }
                Err(ApiError::MergeRefused(
                    refusal @ (MergeRefusal::NotMergeable | MergeRefusal::PipelineNotSuccess),
                )) => {
                    // The platform can briefly disagree with itself right
                    // after a push; give it a few chances.
                    refusals += 1;
                    if refusals > self.ctx.config.refusal_retries {
                        return Err(Halt(JobOutcome::RejectTerminal {
                            reason: refusal.to_string(),
                        }));
                    }
                    debug!(mr = self.mr_iid, attempt = refusals, %refusal, "merge refused");
                    let delay = REFUSAL_RETRY_DELAY.min(self.ctx.config.poll_interval);
                    if !self.ctx.shutdown.sleep(delay) {
                        return Err(Halt(JobOutcome::Cancelled));
                    }
                }
                Err(ApiError::MergeRefused(MergeRefusal::Other(detail))) => {
                    return Err(Halt(JobOutcome::RejectTerminal { reason: detail }));
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// Poll until the platform reports the MR merged.
    fn confirm_merged(&self, project: &Project, head: &str) -> Step<JobOutcome> {
        let deadline = Instant::now() + CONFIRM_TIMEOUT;
        loop {
            let fresh = self.ctx.platform.get_mr(project.id, self.mr_iid)?;
            match fresh.state {
                MrState::Merged => {
                    self.verify_source_branch_removal(project, &fresh);
                    debug!(mr = self.mr_iid, head, "merge confirmed");
                    return Ok(JobOutcome::Merged);
                }
                MrState::Closed => {
                    return Err(Halt(JobOutcome::RejectTerminal {
                        reason: "it was closed without being merged".to_string(),
                    }));
                }
                MrState::Opened | MrState::Locked => {
                    self.poll_sleep(deadline, "the merge did not confirm in time")?;
                }
            }
        }
    }

    /// The merge succeeded either way; a surviving source branch is only
    /// worth a warning.
    fn verify_source_branch_removal(&self, project: &Project, mr: &MergeRequest) {
        let wanted = mr.force_remove_source_branch || project.remove_source_branch_after_merge;
        if !wanted {
            return;
        }
        if let Ok(Some(_)) = self
            .ctx
            .platform
            .get_branch(mr.source_project(), &mr.source_branch)
        {
            warn!(
                mr = mr.iid,
                branch = %mr.source_branch,
                "source branch still exists after merge"
            );
        }
    }

    fn trailer_additions(&self, mr: &MergeRequest, approvals: &Approvals) -> Step<Vec<Trailer>> {
        trailer_additions_for(self.ctx, mr, approvals)
    }

    fn ci_required(&self, project: &Project) -> bool {
        // Stricter side wins when bot config and project settings
        // disagree.
        self.ctx.config.require_successful_ci || project.only_allow_merge_if_pipeline_succeeds
    }

    /// One bounded poll-loop sleep; halts on shutdown or deadline.
    fn poll_sleep(&self, deadline: Instant, timeout_reason: &str) -> Step<()> {
        if Instant::now() >= deadline {
            return Err(Halt(JobOutcome::Requeue {
                reason: timeout_reason.to_string(),
                delay: None,
            }));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !self.ctx.shutdown.sleep(remaining.min(POLL_SLEEP)) {
            return Err(Halt(JobOutcome::Cancelled));
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Step<()> {
        if self.ctx.shutdown.is_triggered() {
            return Err(Halt(JobOutcome::Cancelled));
        }
        Ok(())
    }

    /// Post the single rejection comment and unassign. Best-effort: a
    /// failure here is logged, never escalated.
    fn leave_rejection_note(&self, reason: &str) {
        post_rejection(self.ctx, self.project_id, self.mr_iid, reason);
    }
}

/// The trailers a branch update should stamp onto rebased commits, per
/// config. A missing approver email is a hard, named failure.
pub(crate) fn trailer_additions_for(
    ctx: &JobContext<'_>,
    mr: &MergeRequest,
    approvals: &Approvals,
) -> Result<Vec<Trailer>, Halt> {
    let config = ctx.config;
    let mut additions = Vec::new();
    if config.add_reviewers {
        let approvers = if config.impersonate_approvers {
            // Admin view exposes emails that profile privacy hides.
            let mut resolved = Vec::with_capacity(approvals.approved_by.len());
            for approver in &approvals.approved_by {
                resolved.push(ctx.platform.get_user(approver.id)?);
            }
            resolved
        } else {
            approvals.approved_by.clone()
        };
        additions.extend(trailers::reviewed_by(&approvers)?);
    }
    if config.add_tested {
        additions.push(trailers::tested_by(ctx.bot)?);
    }
    if config.add_part_of {
        additions.push(trailers::part_of(&mr.web_url));
    }
    Ok(additions)
}

/// Exactly-one comment plus unassignment for a terminal rejection.
/// Best-effort: failures are logged, never escalated.
pub(crate) fn post_rejection(ctx: &JobContext<'_>, project_id: u64, mr_iid: u64, reason: &str) {
    let text = rejection_comment(reason);
    match ctx.platform.get_mr(project_id, mr_iid) {
        Ok(fresh) => {
            if let Err(error) = ctx.platform.comment(project_id, mr_iid, &text) {
                warn!(mr = mr_iid, error = %error, "failed to post rejection comment");
            }
            if let Err(error) = ctx.platform.unassign(&fresh, ctx.bot) {
                warn!(mr = mr_iid, error = %error, "failed to unassign");
            }
        }
        Err(error) => {
            warn!(mr = mr_iid, error = %error, "failed to re-read MR for rejection");
        }
    }
}

/// Most recently created pipeline for a sha.
fn newest_pipeline(pipelines: &[Pipeline]) -> Option<&Pipeline> {
    pipelines.iter().max_by_key(|pipeline| pipeline.id)
}

/// Single-paragraph plain-text comment, bounded even when the reason
/// embeds subprocess output.
fn rejection_comment(reason: &str) -> String {
    let mut reason = reason.trim().trim_end_matches('.').to_string();
    if reason.chars().count() > REASON_MAX_CHARS {
        reason = reason.chars().take(REASON_MAX_CHARS).collect();
        reason.push('…');
    }
    format!("{COMMENT_PREFIX} {reason}.")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::{MergeOrder, SkippedCi};
    use crate::gitlab::fake::{FakePlatform, FakeState};
    use crate::gitlab::{Approvals, PipelineStatus, User};
    use crate::testutil::{GitFixture, bot_user, fixture_mr, fixture_project};

    use super::*;

    fn test_config() -> BotConfig {
        BotConfig {
            gitlab_url: "https://gitlab.example.com".to_string(),
            auth_token: "token".to_string(),
            ssh_key_file: None,
            use_https: false,
            project_regexp: None,
            worktree_dir: None,
            max_in_flight_requests: 8,
            merge_order: MergeOrder::AssignedAt,
            add_tested: false,
            add_reviewers: false,
            add_part_of: false,
            impersonate_approvers: false,
            use_merge_strategy: false,
            rebase_remotely: false,
            batch: false,
            batch_size: 4,
            approval_reset_timeout: Duration::from_millis(50),
            refusal_retries: 2,
            ci_timeout: Duration::from_millis(200),
            ci_timeout_is_fatal: false,
            require_successful_ci: true,
            treat_skipped_as: SkippedCi::Wait,
            poll_interval: Duration::from_millis(10),
            idle_interval: Duration::from_millis(10),
            rebase_timeout: Duration::from_millis(200),
            embargo: Vec::new(),
        }
    }

    struct Harness {
        fixture: GitFixture,
        platform: FakePlatform,
        config: BotConfig,
        worktree: Mutex<Worktree>,
        bot: User,
        embargo: EmbargoSet,
        shutdown: ShutdownFlag,
    }

    impl Harness {
        /// Remote with the base branch advanced past the point `feat/a`
        /// forked from, so a real rebase and push happen; MR iid 7 is
        /// assigned to the bot and CI is green by default.
        fn new() -> Option<Self> {
            let fixture = GitFixture::new()?;
            let a1 = fixture.seed_commit("feat/a", "a.txt", "a\n", "add a");
            let base = fixture.base_branch.clone();
            fixture.seed_commit(&base, "base.txt", "more\n", "advance base");

            let project = fixture_project(1, &fixture.remote_url());
            let mr = fixture_mr(7, 1, "feat/a", &fixture.base_branch, &a1);
            let mut state = FakeState::default();
            state.projects.push(project);
            state.mrs.push(mr);
            state.mirror_remote = Some(fixture.remote.clone());
            state.auto_pipeline = Some((
                PipelineStatus::Success,
                "https://ci.example.com/1".to_string(),
            ));
            state.approvals.insert(
                (1, 7),
                Approvals {
                    approvals_left: 0,
                    approved_by: Vec::new(),
                },
            );

            let bot = bot_user();
            let worktree_dir = fixture.tmp.path().join("bot-worktree");
            let worktree = Worktree::init(&worktree_dir, None, &bot).unwrap();

            Some(Self {
                fixture,
                platform: FakePlatform::new(state),
                config: test_config(),
                worktree: Mutex::new(worktree),
                bot,
                embargo: EmbargoSet::default(),
                shutdown: ShutdownFlag::new(),
            })
        }

        fn run_job(&self) -> JobOutcome {
            let ctx = JobContext {
                platform: &self.platform,
                worktree: &self.worktree,
                config: &self.config,
                bot: &self.bot,
                embargo: &self.embargo,
                shutdown: &self.shutdown,
            };
            MergeJob::new(&ctx, 1, 7).run()
        }
    }

    #[test]
    fn clean_fast_forward_merge() {
        let Some(harness) = Harness::new() else {
            return;
        };
        let m0 = harness.fixture.remote_tip(&harness.fixture.base_branch);

        let outcome = harness.run_job();
        assert_eq!(outcome, JobOutcome::Merged);

        // The accept was pinned to the sha we pushed, and the target
        // advanced to a descendant of its old tip.
        let state = harness.platform.state.lock().unwrap();
        assert_eq!(state.accepts.len(), 1);
        let (iid, pinned) = state.accepts[0].clone();
        assert_eq!(iid, 7);
        drop(state);

        let target_tip = harness.fixture.remote_tip(&harness.fixture.base_branch);
        assert_eq!(target_tip, pinned);
        let worktree = harness.worktree.lock().unwrap();
        assert!(worktree.is_ancestor(&m0, &target_tip).unwrap());
        assert!(harness.platform.comments_for(7).is_empty());
    }

    #[test]
    fn sha_mismatch_on_accept_requeues_without_comment() {
        let Some(harness) = Harness::new() else {
            return;
        };
        harness
            .platform
            .state
            .lock()
            .unwrap()
            .accept_script
            .push_back(Err(ApiError::MergeRefused(MergeRefusal::ShaMismatch)));

        let outcome = harness.run_job();
        assert!(matches!(outcome, JobOutcome::Requeue { .. }));
        assert!(harness.platform.comments_for(7).is_empty());
        // Still assigned: requeue keeps the MR a candidate.
        assert!(harness.platform.mr(7).assignee_ids.contains(&42));
    }

    #[test]
    fn ci_failure_rejects_with_pipeline_url() {
        let Some(harness) = Harness::new() else {
            return;
        };
        harness.platform.state.lock().unwrap().auto_pipeline = Some((
            PipelineStatus::Failed,
            "https://ci.example.com/fail/42".to_string(),
        ));

        let outcome = harness.run_job();
        assert!(matches!(outcome, JobOutcome::RejectTerminal { .. }));

        let comments = harness.platform.comments_for(7);
        assert_eq!(comments.len(), 1);
        assert_eq!(
            comments[0],
            "I couldn't merge this: CI failed: https://ci.example.com/fail/42."
        );
        assert!(harness.platform.mr(7).assignee_ids.is_empty());
    }

    #[test]
    fn draft_is_rejected_before_any_git_work() {
        let Some(harness) = Harness::new() else {
            return;
        };
        let feature_tip = harness.fixture.remote_tip("feat/a");
        harness.platform.state.lock().unwrap().mrs[0].work_in_progress = true;

        let outcome = harness.run_job();
        assert_eq!(
            outcome,
            JobOutcome::RejectTerminal {
                reason: "it is a draft".to_string()
            }
        );
        let comments = harness.platform.comments_for(7);
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0], "I couldn't merge this: it is a draft.");
        assert!(harness.platform.mr(7).assignee_ids.is_empty());
        // No rebase was attempted.
        assert_eq!(harness.fixture.remote_tip("feat/a"), feature_tip);
    }

    #[test]
    fn reassignment_after_push_cancels_without_merge_or_comment() {
        let Some(harness) = Harness::new() else {
            return;
        };
        // Initial fetch and the first wait poll see the assignment; the
        // pre-accept refresh does not.
        harness
            .platform
            .state
            .lock()
            .unwrap()
            .drop_assignment_after_gets = Some(2);

        let outcome = harness.run_job();
        assert_eq!(outcome, JobOutcome::Cancelled);
        let state = harness.platform.state.lock().unwrap();
        assert!(state.accepts.is_empty());
        assert!(state.comments.is_empty());
    }

    #[test]
    fn pending_ci_requeues_and_is_idempotent() {
        let Some(harness) = Harness::new() else {
            return;
        };
        harness.platform.state.lock().unwrap().auto_pipeline = Some((
            PipelineStatus::Running,
            "https://ci.example.com/run".to_string(),
        ));

        let first = harness.run_job();
        assert!(matches!(first, JobOutcome::Requeue { .. }));
        let tip_after_first = harness.fixture.remote_tip("feat/a");

        // Nothing changed on the platform; a second run must not push
        // again or say anything.
        let second = harness.run_job();
        assert!(matches!(second, JobOutcome::Requeue { .. }));
        assert_eq!(harness.fixture.remote_tip("feat/a"), tip_after_first);
        assert!(harness.platform.comments_for(7).is_empty());
        let state = harness.platform.state.lock().unwrap();
        assert!(state.accepts.is_empty());
    }

    #[test]
    fn repeated_refusals_become_terminal() {
        let Some(harness) = Harness::new() else {
            return;
        };
        {
            let mut state = harness.platform.state.lock().unwrap();
            for _ in 0..5 {
                state
                    .accept_script
                    .push_back(Err(ApiError::MergeRefused(MergeRefusal::NotMergeable)));
            }
        }

        let outcome = harness.run_job();
        assert_eq!(
            outcome,
            JobOutcome::RejectTerminal {
                reason: "the merge request is not mergeable".to_string()
            }
        );
        let comments = harness.platform.comments_for(7);
        assert_eq!(comments.len(), 1);
    }

    #[test]
    fn trailers_are_pushed_with_the_rebase() {
        let Some(mut harness) = Harness::new() else {
            return;
        };
        harness.config.add_tested = true;

        let outcome = harness.run_job();
        assert_eq!(outcome, JobOutcome::Merged);

        let target_tip = harness.fixture.remote_tip(&harness.fixture.base_branch);
        let worktree = harness.worktree.lock().unwrap();
        let message = worktree.commit_message(&target_tip).unwrap();
        assert!(message.contains("Tested-by: Merganser Bot <bot@example.com>"));
    }

    #[test]
    fn add_reviewers_without_email_is_an_explicit_rejection() {
        let Some(mut harness) = Harness::new() else {
            return;
        };
        harness.config.add_reviewers = true;
        harness.platform.state.lock().unwrap().approvals.insert(
            (1, 7),
            Approvals {
                approvals_left: 0,
                approved_by: vec![User {
                    id: 8,
                    username: "shy".to_string(),
                    name: "Shy Reviewer".to_string(),
                    email: None,
                }],
            },
        );

        let outcome = harness.run_job();
        match outcome {
            JobOutcome::RejectTerminal { reason } => assert!(reason.contains("shy")),
            other => panic!("expected terminal rejection, got {other:?}"),
        }
    }

    #[test]
    fn rejection_comment_is_bounded_and_well_formed() {
        assert_eq!(
            rejection_comment("CI failed: https://x"),
            "I couldn't merge this: CI failed: https://x."
        );
        let long = "x".repeat(1000);
        let comment = rejection_comment(&long);
        assert!(comment.chars().count() < 450);
        assert!(comment.ends_with('.'));
    }

    #[test]
    fn newest_pipeline_wins() {
        let pipelines: Vec<Pipeline> = vec![
            serde_json::from_value(serde_json::json!({
                "id": 3, "sha": "s", "ref": "main", "status": "failed"
            }))
            .unwrap(),
            serde_json::from_value(serde_json::json!({
                "id": 9, "sha": "s", "ref": "main", "status": "success"
            }))
            .unwrap(),
        ];
        assert_eq!(newest_pipeline(&pipelines).unwrap().id, 9);
        let none: Vec<Pipeline> = Vec::new();
        assert!(newest_pipeline(&none).is_none());
    }
}
