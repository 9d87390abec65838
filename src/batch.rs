//! Speculative batch merges.
//!
//! Several MRs targeting the same branch are pre-merged onto an
//! ephemeral `merganser/batch/<target>` branch so one CI run validates
//! them together. On green CI the source branches are fast-forwarded to
//! their rebased shas and accepted in order; on red CI the batch bisects
//! by halves. A candidate whose rebase conflicts is rejected exactly
//! like a single job would reject it; everything else that cannot
//! proceed is requeued silently.
//!
//! The target branch is never pushed by the batch: every target
//! advancement happens through the platform's conditional accept, so a
//! racing writer surfaces as a sha mismatch and the batch requeues.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::gitlab::{
    AcceptOptions, ApiError, MergeRequest, MrState, PipelineStatus, Project,
};
use crate::job::{JobContext, post_rejection, trailer_additions_for};
use crate::policy::{self, PolicyContext, Verdict};
use crate::worktree::{GitError, PushMode};

const BATCH_BRANCH_PREFIX: &str = "merganser/batch/";
const POLL_SLEEP: Duration = Duration::from_secs(5);

/// What happened to each batch candidate.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub merged: Vec<u64>,
    pub rejected: Vec<u64>,
    pub requeued: Vec<u64>,
}

impl BatchSummary {
    fn requeue_all(mut self, iids: impl IntoIterator<Item = u64>) -> Self {
        self.requeued.extend(iids);
        self
    }
}

/// One included candidate after speculative rebase.
struct Included {
    mr: MergeRequest,
    /// Head of the candidate's chain on the ephemeral branch.
    new_head: String,
    /// Source tip before the rebase, for the lease on the final push.
    old_head: String,
}

enum CiVerdict {
    Green,
    Red { url: String },
    TimedOut,
}

pub struct BatchJob<'a> {
    ctx: &'a JobContext<'a>,
    project_id: u64,
    iids: Vec<u64>,
}

impl<'a> BatchJob<'a> {
    pub fn new(ctx: &'a JobContext<'a>, project_id: u64, iids: Vec<u64>) -> Self {
        Self {
            ctx,
            project_id,
            iids,
        }
    }

    /// Drive the batch to completion, bisecting on CI failure.
    pub fn run(&self) -> BatchSummary {
        let mut summary = BatchSummary::default();
        let mut candidates = self.iids.clone();
        candidates.sort_unstable();
        candidates.truncate(self.ctx.config.batch_size);

        while !candidates.is_empty() {
            if self.ctx.shutdown.is_triggered() {
                return summary.requeue_all(candidates);
            }

            match self.attempt(&candidates, &mut summary) {
                Attempt::Done => return summary,
                Attempt::RequeueAll => {
                    retain_unsettled(&mut candidates, &summary);
                    return summary.requeue_all(candidates);
                }
                Attempt::Bisect => {
                    // Leading half gets another CI run; trailing half
                    // waits for a later tick. Candidates the attempt
                    // already settled (validation rejects, conflicts)
                    // are out of the game.
                    retain_unsettled(&mut candidates, &summary);
                    let keep = candidates.len() / 2;
                    summary.requeued.extend(candidates.split_off(keep));
                    if candidates.is_empty() {
                        return summary;
                    }
                }
            }
        }
        summary
    }

    /// One speculative pass over `iids`. Mutates `summary` for
    /// candidates that reached a terminal state.
    fn attempt(&self, iids: &[u64], summary: &mut BatchSummary) -> Attempt {
        let project = match self.ctx.platform.get_project(self.project_id) {
            Ok(project) => project,
            Err(error) => {
                warn!(error = %error, "batch could not read project");
                return Attempt::RequeueAll;
            }
        };

        let Some((target, eligible)) = self.validate_candidates(&project, iids, summary) else {
            return Attempt::Done;
        };
        let batch_branch = format!("{BATCH_BRANCH_PREFIX}{target}");
        self.sweep_stale_branches();

        // Rebase every candidate onto the growing ephemeral branch while
        // holding the worktree; conflicts drop the candidate, the rest
        // shift down. The batch branch is pushed before the lock is
        // released.
        let use_https = self.ctx.config.use_https;
        let repo_url = project.repo_url(use_https).to_string();
        let worktree = self
            .ctx
            .worktree
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut included: Vec<Included> = Vec::new();
        let mut conflicted: Vec<(u64, String)> = Vec::new();
        let base_tip = match worktree.fetch(&repo_url, &target) {
            Ok(tip) => tip,
            Err(error) => {
                warn!(error = %error, "batch could not fetch target");
                worktree.restore_clean();
                return Attempt::RequeueAll;
            }
        };
        let mut batch_tip = base_tip.clone();

        for candidate in &eligible {
            let additions =
                match trailer_additions_for(self.ctx, &candidate.mr, &candidate.approvals) {
                    Ok(additions) => additions,
                    Err(halt) => {
                        if let crate::job::JobOutcome::RejectTerminal { reason } = halt.0 {
                            conflicted.push((candidate.mr.iid, reason));
                        } else {
                            summary.requeued.push(candidate.mr.iid);
                        }
                        continue;
                    }
                };

            let outcome = worktree
                .fetch(&candidate.source_repo_url, &candidate.mr.source_branch)
                .and_then(|source_sha| {
                    worktree
                        .rebase(&source_sha, &batch_tip, &additions)
                        .map(|new_head| (source_sha, new_head))
                });
            match outcome {
                Ok((old_head, new_head)) => {
                    batch_tip = new_head.clone();
                    included.push(Included {
                        mr: candidate.mr.clone(),
                        new_head,
                        old_head,
                    });
                }
                Err(GitError::RebaseConflict { .. }) => {
                    conflicted.push((
                        candidate.mr.iid,
                        "it conflicts with another merge in flight; it needs a manual rebase"
                            .to_string(),
                    ));
                }
                Err(error) => {
                    debug!(mr = candidate.mr.iid, error = %error, "batch rebase trouble");
                    summary.requeued.push(candidate.mr.iid);
                }
            }
        }

        let push_result = if included.is_empty() {
            Ok(())
        } else {
            worktree.push(&repo_url, &batch_tip, &batch_branch, PushMode::Force)
        };
        worktree.restore_clean();
        drop(worktree);

        // Deferred platform mutations, outside the git lock.
        for (iid, reason) in &conflicted {
            summary.rejected.push(*iid);
            post_rejection(self.ctx, self.project_id, *iid, reason);
        }

        if included.is_empty() {
            self.delete_stale_branch(&batch_branch);
            return Attempt::Done;
        }
        if let Err(error) = push_result {
            warn!(error = %error, "batch branch push failed");
            summary
                .requeued
                .extend(included.iter().map(|included| included.mr.iid));
            return Attempt::Done;
        }

        info!(
            target = %target,
            size = included.len(),
            tip = %batch_tip,
            "batch pushed, waiting for CI"
        );
        let verdict = self.wait_for_batch_ci(&project, &batch_tip);
        let result = match verdict {
            CiVerdict::Green => {
                self.merge_included(&project, &base_tip, &target, &included, summary)
            }
            CiVerdict::Red { url } => {
                if included.len() == 1 {
                    let iid = included[0].mr.iid;
                    summary.rejected.push(iid);
                    post_rejection(
                        self.ctx,
                        self.project_id,
                        iid,
                        &format!("CI failed: {url}"),
                    );
                    Attempt::Done
                } else {
                    Attempt::Bisect
                }
            }
            CiVerdict::TimedOut => {
                summary
                    .requeued
                    .extend(included.iter().map(|included| included.mr.iid));
                Attempt::Done
            }
        };
        self.delete_stale_branch(&batch_branch);
        result
    }

    /// Re-validate candidates on fresh state; returns the common target
    /// and the survivors in iid order. `None` when nothing is left.
    fn validate_candidates(
        &self,
        project: &Project,
        iids: &[u64],
        summary: &mut BatchSummary,
    ) -> Option<(String, Vec<Candidate>)> {
        let mut target: Option<String> = None;
        let mut eligible = Vec::new();

        for &iid in iids {
            let fresh = match self.ctx.platform.get_mr(self.project_id, iid) {
                Ok(fresh) => fresh,
                Err(ApiError::NotFound(_)) => continue,
                Err(error) => {
                    debug!(mr = iid, error = %error, "batch validation read failed");
                    summary.requeued.push(iid);
                    continue;
                }
            };
            let approvals = match self.ctx.platform.get_approvals(self.project_id, iid) {
                Ok(approvals) => approvals,
                Err(error) => {
                    debug!(mr = iid, error = %error, "batch approvals read failed");
                    summary.requeued.push(iid);
                    continue;
                }
            };
            let target_branch = self
                .ctx
                .platform
                .get_branch(project.id, &fresh.target_branch)
                .ok()
                .flatten();

            let verdict = policy::evaluate(
                &fresh,
                &PolicyContext {
                    bot: self.ctx.bot,
                    project,
                    approvals: &approvals,
                    target_branch: target_branch.as_ref(),
                    needs_push: true,
                    embargo: self.ctx.embargo,
                    now: Utc::now(),
                },
            );
            match verdict {
                Verdict::Ok => {}
                Verdict::Skip { .. } => continue,
                Verdict::RejectTerminal { reason } => {
                    summary.rejected.push(iid);
                    post_rejection(self.ctx, self.project_id, iid, &reason);
                    continue;
                }
                Verdict::Requeue { .. } => {
                    summary.requeued.push(iid);
                    continue;
                }
            }

            // All batch members must share one target.
            match &target {
                None => target = Some(fresh.target_branch.clone()),
                Some(existing) if *existing == fresh.target_branch => {}
                Some(_) => {
                    summary.requeued.push(iid);
                    continue;
                }
            }

            let source_repo_url = if fresh.source_project() == project.id {
                project.repo_url(self.ctx.config.use_https).to_string()
            } else {
                match self.ctx.platform.get_project(fresh.source_project()) {
                    Ok(source_project) => source_project
                        .repo_url(self.ctx.config.use_https)
                        .to_string(),
                    Err(error) => {
                        debug!(mr = iid, error = %error, "batch source project read failed");
                        summary.requeued.push(iid);
                        continue;
                    }
                }
            };
            eligible.push(Candidate {
                mr: fresh,
                approvals,
                source_repo_url,
            });
        }

        let target = target?;
        if eligible.is_empty() {
            return None;
        }
        eligible.sort_by_key(|candidate| candidate.mr.iid);
        Some((target, eligible))
    }

    /// Fast-forward each source branch to its batched sha and accept, in
    /// order. Any failure stops the batch and requeues the rest.
    fn merge_included(
        &self,
        project: &Project,
        base_tip: &str,
        target: &str,
        included: &[Included],
        summary: &mut BatchSummary,
    ) -> Attempt {
        // If anyone else advanced the target since the batch was built,
        // the speculative chains no longer apply.
        {
            let worktree = self
                .ctx
                .worktree
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let current = worktree.fetch(project.repo_url(self.ctx.config.use_https), target);
            worktree.restore_clean();
            match current {
                Ok(tip) if tip == base_tip => {}
                Ok(_) | Err(_) => {
                    debug!(target, "target moved during batch CI");
                    summary
                        .requeued
                        .extend(included.iter().map(|included| included.mr.iid));
                    return Attempt::Done;
                }
            }
        }

        for (index, item) in included.iter().enumerate() {
            if self.ctx.shutdown.is_triggered() {
                summary
                    .requeued
                    .extend(included[index..].iter().map(|included| included.mr.iid));
                return Attempt::Done;
            }
            match self.merge_one(project, item) {
                Ok(()) => summary.merged.push(item.mr.iid),
                Err(error) => {
                    debug!(mr = item.mr.iid, error = %error, "batch accept failed");
                    summary
                        .requeued
                        .extend(included[index..].iter().map(|included| included.mr.iid));
                    return Attempt::Done;
                }
            }
        }
        Attempt::Done
    }

    fn merge_one(&self, project: &Project, item: &Included) -> Result<(), String> {
        let use_https = self.ctx.config.use_https;
        let source_url = if item.mr.source_project() == project.id {
            project.repo_url(use_https).to_string()
        } else {
            self.ctx
                .platform
                .get_project(item.mr.source_project())
                .map_err(|error| error.to_string())?
                .repo_url(use_https)
                .to_string()
        };

        {
            let worktree = self
                .ctx
                .worktree
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let pushed = worktree.push(
                &source_url,
                &item.new_head,
                &item.mr.source_branch,
                PushMode::ForceWithLease {
                    expected: &item.old_head,
                },
            );
            worktree.restore_clean();
            pushed.map_err(|error| error.to_string())?;
        }

        // The platform must observe the push before a pinned accept can
        // succeed.
        let deadline = Instant::now() + self.ctx.config.rebase_timeout;
        loop {
            let fresh = self
                .ctx
                .platform
                .get_mr(self.project_id, item.mr.iid)
                .map_err(|error| error.to_string())?;
            if !fresh.is_assigned_to(self.ctx.bot) {
                return Err("reassigned during batch".to_string());
            }
            if fresh.state == MrState::Merged {
                return Ok(());
            }
            if fresh.sha == item.new_head {
                break;
            }
            if Instant::now() >= deadline {
                return Err("platform did not pick up the batch push".to_string());
            }
            if !self.ctx.shutdown.sleep(poll_slice(deadline)) {
                return Err("shutdown".to_string());
            }
        }

        let options = AcceptOptions {
            sha: item.new_head.clone(),
            squash: item.mr.squash,
            squash_commit_message: None,
            should_remove_source_branch: item.mr.force_remove_source_branch
                || project.remove_source_branch_after_merge,
            merge_when_pipeline_succeeds: false,
        };
        self.ctx
            .platform
            .accept_mr(self.project_id, item.mr.iid, &options)
            .map_err(|error| error.to_string())
    }

    /// One CI wait for the whole batch tip.
    fn wait_for_batch_ci(&self, project: &Project, tip: &str) -> CiVerdict {
        let deadline = Instant::now() + self.ctx.config.ci_timeout;
        loop {
            let pipelines = match self.ctx.platform.list_pipelines(project.id, tip) {
                Ok(pipelines) => pipelines,
                Err(error) => {
                    debug!(error = %error, "batch pipeline read failed");
                    return CiVerdict::TimedOut;
                }
            };
            if let Some(pipeline) = pipelines.iter().max_by_key(|pipeline| pipeline.id) {
                match pipeline.status {
                    PipelineStatus::Success => return CiVerdict::Green,
                    PipelineStatus::Failed | PipelineStatus::Canceled => {
                        return CiVerdict::Red {
                            url: pipeline.web_url.clone(),
                        };
                    }
                    _ => {}
                }
            }
            if Instant::now() >= deadline {
                return CiVerdict::TimedOut;
            }
            if !self.ctx.shutdown.sleep(poll_slice(deadline)) {
                return CiVerdict::TimedOut;
            }
        }
    }

    /// Remove leftover ephemeral branches from an earlier crashed run.
    /// Best-effort.
    fn sweep_stale_branches(&self) {
        let stale = self
            .ctx
            .platform
            .list_branches(self.project_id, BATCH_BRANCH_PREFIX)
            .unwrap_or_default();
        for branch in stale {
            self.delete_stale_branch(&branch.name);
        }
    }

    /// Remove one ephemeral branch, platform-side. Best-effort.
    fn delete_stale_branch(&self, name: &str) {
        match self.ctx.platform.delete_branch(self.project_id, name) {
            Ok(()) | Err(ApiError::NotFound(_)) => {}
            Err(error) => debug!(branch = name, error = %error, "stale batch branch cleanup"),
        }
    }
}

enum Attempt {
    /// This pass settled every remaining candidate.
    Done,
    /// Could not make progress; everything left is requeued.
    RequeueAll,
    /// CI failed for a multi-candidate batch; retry with the leading
    /// half.
    Bisect,
}

struct Candidate {
    mr: MergeRequest,
    approvals: crate::gitlab::Approvals,
    source_repo_url: String,
}

/// Drop candidates the summary already accounts for.
fn retain_unsettled(candidates: &mut Vec<u64>, summary: &BatchSummary) {
    candidates.retain(|iid| {
        !summary.merged.contains(iid)
            && !summary.rejected.contains(iid)
            && !summary.requeued.contains(iid)
    });
}

fn poll_slice(deadline: Instant) -> Duration {
    deadline
        .saturating_duration_since(Instant::now())
        .min(POLL_SLEEP)
}
