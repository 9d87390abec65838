//! Per-project scheduling.
//!
//! One logical worker per project. Each tick lists the MRs assigned to
//! the bot, skips those still cooling down, and drives exactly one job
//! (or one batch) to completion before sleeping. Requeued MRs get an
//! exponential per-MR cool-down so a racing platform can't make the bot
//! hot-loop on the same candidate.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::batch::BatchJob;
use crate::config::MergeOrder;
use crate::gitlab::{ApiError, MergeRequest, Project};
use crate::job::{JobContext, JobOutcome, MergeJob};

const COOLDOWN_BASE: Duration = Duration::from_secs(30);
const COOLDOWN_CAP: Duration = Duration::from_secs(300);

/// Why a project loop stopped.
#[derive(Debug)]
pub enum LoopExit {
    /// Clean shutdown signal.
    Shutdown,
    /// The project is no longer workable (authorization revoked,
    /// project gone). Do not restart.
    Disabled { reason: String },
    /// Upstream trouble; the supervisor may restart with backoff.
    Crashed { reason: String },
}

/// Per-MR cool-down bookkeeping: exponential, capped, cleared on any
/// terminal outcome.
pub struct CooldownTracker {
    base: Duration,
    cap: Duration,
    entries: HashMap<u64, CooldownEntry>,
}

struct CooldownEntry {
    until: Instant,
    strikes: u32,
}

impl CooldownTracker {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            entries: HashMap::new(),
        }
    }

    /// Record a requeue. An explicit delay (e.g. approval-reset grace)
    /// overrides the exponential schedule without advancing it.
    pub fn note(&mut self, iid: u64, explicit: Option<Duration>) {
        let entry = self.entries.entry(iid).or_insert(CooldownEntry {
            until: Instant::now(),
            strikes: 0,
        });
        let delay = match explicit {
            Some(delay) => delay.min(self.cap),
            None => {
                entry.strikes = entry.strikes.saturating_add(1);
                let factor = 2u32.saturating_pow(entry.strikes.saturating_sub(1).min(16));
                (self.base.saturating_mul(factor)).min(self.cap)
            }
        };
        entry.until = Instant::now() + delay;
    }

    pub fn clear(&mut self, iid: u64) {
        self.entries.remove(&iid);
    }

    pub fn is_cooling(&self, iid: u64, now: Instant) -> bool {
        self.entries
            .get(&iid)
            .is_some_and(|entry| entry.until > now)
    }

    /// Forget MRs that are no longer assigned at all.
    pub fn prune(&mut self, listed: &[u64]) {
        self.entries.retain(|iid, _| listed.contains(iid));
    }
}

enum Tick {
    Worked,
    Idle,
}

pub struct ProjectLoop<'a> {
    ctx: &'a JobContext<'a>,
    project: Project,
    cooldowns: CooldownTracker,
}

impl<'a> ProjectLoop<'a> {
    pub fn new(ctx: &'a JobContext<'a>, project: Project) -> Self {
        Self {
            ctx,
            project,
            cooldowns: CooldownTracker::new(COOLDOWN_BASE, COOLDOWN_CAP),
        }
    }

    /// Tick until shutdown or a disabling error.
    pub fn run(&mut self) -> LoopExit {
        info!(project = %self.project.path_with_namespace, "project loop started");
        loop {
            if self.ctx.shutdown.is_triggered() {
                return LoopExit::Shutdown;
            }

            let sleep = match self.tick() {
                Ok(Tick::Worked) => self.ctx.config.poll_interval,
                Ok(Tick::Idle) => self.ctx.config.idle_interval,
                Err(exit) => return exit,
            };
            if !self.ctx.shutdown.sleep(sleep) {
                return LoopExit::Shutdown;
            }
        }
    }

    fn tick(&mut self) -> Result<Tick, LoopExit> {
        let mut assigned = self
            .ctx
            .platform
            .list_assigned_mrs(self.project.id, self.ctx.bot.id)
            .map_err(|error| classify_list_error(&self.project, error))?;
        order_candidates(&mut assigned, self.ctx.config.merge_order);

        let listed: Vec<u64> = assigned.iter().map(|mr| mr.iid).collect();
        self.cooldowns.prune(&listed);

        let now = Instant::now();
        let ready: Vec<&MergeRequest> = assigned
            .iter()
            .filter(|mr| !self.cooldowns.is_cooling(mr.iid, now))
            .collect();
        let Some(first) = ready.first() else {
            return Ok(Tick::Idle);
        };

        let batch_group: Vec<u64> = ready
            .iter()
            .filter(|mr| mr.target_branch == first.target_branch)
            .map(|mr| mr.iid)
            .collect();

        if self.ctx.config.batch && batch_group.len() > 1 {
            debug!(
                project = %self.project.path_with_namespace,
                size = batch_group.len(),
                "running batch"
            );
            let summary = BatchJob::new(self.ctx, self.project.id, batch_group).run();
            for iid in &summary.merged {
                self.cooldowns.clear(*iid);
            }
            for iid in &summary.rejected {
                self.cooldowns.clear(*iid);
            }
            for iid in &summary.requeued {
                self.cooldowns.note(*iid, None);
            }
        } else {
            let iid = first.iid;
            debug!(project = %self.project.path_with_namespace, mr = iid, "running job");
            match MergeJob::new(self.ctx, self.project.id, iid).run() {
                JobOutcome::Merged | JobOutcome::Cancelled => self.cooldowns.clear(iid),
                JobOutcome::RejectTerminal { .. } => self.cooldowns.clear(iid),
                JobOutcome::Requeue { delay, .. } => self.cooldowns.note(iid, delay),
            }
        }
        Ok(Tick::Worked)
    }
}

/// In-place candidate ordering per the configured merge order.
///
/// `assigned_at`: the platform does not expose assignment timestamps, so
/// iid order (FIFO by creation of the MR) is the stable proxy.
/// `created_at`: explicit creation timestamps, oldest first.
fn order_candidates(mrs: &mut [MergeRequest], order: MergeOrder) {
    match order {
        MergeOrder::AssignedAt => mrs.sort_by_key(|mr| mr.iid),
        MergeOrder::CreatedAt => {
            mrs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.iid.cmp(&b.iid)));
        }
    }
}

fn classify_list_error(project: &Project, error: ApiError) -> LoopExit {
    match error {
        ApiError::Unauthorized(_) => {
            warn!(
                project = %project.path_with_namespace,
                "authorization revoked; disabling project loop"
            );
            LoopExit::Disabled {
                reason: "authorization revoked".to_string(),
            }
        }
        ApiError::NotFound(_) => LoopExit::Disabled {
            reason: "project no longer exists".to_string(),
        },
        other => LoopExit::Crashed {
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::config::{BotConfig, SkippedCi};
    use crate::embargo::EmbargoSet;
    use crate::gitlab::fake::{FakePlatform, FakeState};
    use crate::gitlab::{Approvals, User};
    use crate::shutdown::ShutdownFlag;
    use crate::testutil::{GitFixture, bot_user, fixture_mr, fixture_project};
    use crate::worktree::Worktree;

    use super::*;

    #[test]
    fn cooldown_grows_exponentially_and_caps() {
        let mut tracker =
            CooldownTracker::new(Duration::from_millis(100), Duration::from_millis(350));
        let start = Instant::now();

        tracker.note(7, None);
        assert!(tracker.is_cooling(7, start));
        assert!(!tracker.is_cooling(7, start + Duration::from_millis(150)));

        // Second strike doubles, third hits the cap.
        tracker.note(7, None);
        assert!(tracker.is_cooling(7, Instant::now() + Duration::from_millis(150)));
        tracker.note(7, None);
        tracker.note(7, None);
        assert!(!tracker.is_cooling(7, Instant::now() + Duration::from_millis(400)));
    }

    #[test]
    fn explicit_delay_overrides_schedule() {
        let mut tracker = CooldownTracker::new(Duration::from_secs(30), Duration::from_secs(300));
        tracker.note(4, Some(Duration::from_millis(10)));
        assert!(!tracker.is_cooling(4, Instant::now() + Duration::from_millis(50)));
    }

    #[test]
    fn clear_and_prune_forget_entries() {
        let mut tracker = CooldownTracker::new(Duration::from_secs(30), Duration::from_secs(300));
        tracker.note(1, None);
        tracker.note(2, None);
        tracker.clear(1);
        assert!(!tracker.is_cooling(1, Instant::now()));
        tracker.prune(&[]);
        assert!(!tracker.is_cooling(2, Instant::now()));
    }

    #[test]
    fn created_at_order_sorts_by_timestamp() {
        let mut older = fixture_mr(9, 1, "s9", "main", "x");
        older.created_at = Some("2026-01-01T00:00:00Z".parse().unwrap());
        let mut newer = fixture_mr(3, 1, "s3", "main", "y");
        newer.created_at = Some("2026-02-01T00:00:00Z".parse().unwrap());

        let mut mrs = vec![newer, older];
        order_candidates(&mut mrs, MergeOrder::CreatedAt);
        assert_eq!(mrs[0].iid, 9);

        order_candidates(&mut mrs, MergeOrder::AssignedAt);
        assert_eq!(mrs[0].iid, 3);
    }

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
        platform: FakePlatform,
        config: BotConfig,
        worktree: Mutex<Worktree>,
        bot: User,
        embargo: EmbargoSet,
        shutdown: ShutdownFlag,
        project: Project,
        _fixture: GitFixture,
    }

    impl Harness {
        fn new() -> Option<Self> {
            let fixture = GitFixture::new()?;
            let project = fixture_project(1, &fixture.remote_url());
            let state = FakeState {
                projects: vec![project.clone()],
                ..FakeState::default()
            };
            let bot = bot_user();
            let worktree_dir = fixture.tmp.path().join("bot-worktree");
            let worktree = Worktree::init(&worktree_dir, None, &bot).unwrap();
            Some(Self {
                platform: FakePlatform::new(state),
                config: test_config(),
                worktree: Mutex::new(worktree),
                bot,
                embargo: EmbargoSet::default(),
                shutdown: ShutdownFlag::new(),
                project,
                _fixture: fixture,
            })
        }

        fn with_draft_mr(self) -> Self {
            {
                let mut state = self.platform.state.lock().unwrap();
                let mut mr = fixture_mr(3, 1, "feat/x", "main", "abc");
                mr.work_in_progress = true;
                state.mrs.push(mr);
                state.approvals.insert(
                    (1, 3),
                    Approvals {
                        approvals_left: 0,
                        approved_by: Vec::new(),
                    },
                );
            }
            self
        }

        fn ctx(&self) -> JobContext<'_> {
            JobContext {
                platform: &self.platform,
                worktree: &self.worktree,
                config: &self.config,
                bot: &self.bot,
                embargo: &self.embargo,
                shutdown: &self.shutdown,
            }
        }
    }

    #[test]
    fn tick_with_no_candidates_is_idle() {
        let Some(harness) = Harness::new() else {
            return;
        };
        let ctx = harness.ctx();
        let mut project_loop = ProjectLoop::new(&ctx, harness.project.clone());
        assert!(matches!(project_loop.tick(), Ok(Tick::Idle)));
    }

    #[test]
    fn tick_drives_one_job_to_completion() {
        let Some(harness) = Harness::new() else {
            return;
        };
        let harness = harness.with_draft_mr();
        let ctx = harness.ctx();
        let mut project_loop = ProjectLoop::new(&ctx, harness.project.clone());

        assert!(matches!(project_loop.tick(), Ok(Tick::Worked)));
        // The draft was rejected and unassigned; the next tick is idle.
        assert_eq!(harness.platform.comments_for(3).len(), 1);
        assert!(matches!(project_loop.tick(), Ok(Tick::Idle)));
    }

    #[test]
    fn unauthorized_listing_disables_the_loop() {
        let Some(harness) = Harness::new() else {
            return;
        };
        harness
            .platform
            .state
            .lock()
            .unwrap()
            .list_script
            .push_back(ApiError::Unauthorized("/projects/1/merge_requests".into()));
        let ctx = harness.ctx();
        let mut project_loop = ProjectLoop::new(&ctx, harness.project.clone());
        assert!(matches!(
            project_loop.tick(),
            Err(LoopExit::Disabled { .. })
        ));
    }

    #[test]
    fn transient_listing_failure_crashes_for_restart() {
        let Some(harness) = Harness::new() else {
            return;
        };
        harness
            .platform
            .state
            .lock()
            .unwrap()
            .list_script
            .push_back(ApiError::TransientUpstream("connection reset".into()));
        let ctx = harness.ctx();
        let mut project_loop = ProjectLoop::new(&ctx, harness.project.clone());
        assert!(matches!(project_loop.tick(), Err(LoopExit::Crashed { .. })));
    }

    #[test]
    fn run_returns_shutdown_when_flag_is_set() {
        let Some(harness) = Harness::new() else {
            return;
        };
        harness.shutdown.trigger();
        let ctx = harness.ctx();
        let mut project_loop = ProjectLoop::new(&ctx, harness.project.clone());
        assert!(matches!(project_loop.run(), LoopExit::Shutdown));
    }

    #[test]
    fn requeued_mr_is_skipped_while_cooling() {
        let Some(harness) = Harness::new() else {
            return;
        };
        {
            // An MR whose head doesn't exist in the repo: the job fails
            // to fetch and requeues.
            let mut state = harness.platform.state.lock().unwrap();
            state
                .mrs
                .push(fixture_mr(5, 1, "missing-branch", "main", "nope"));
            state.approvals.insert(
                (1, 5),
                Approvals {
                    approvals_left: 0,
                    approved_by: Vec::new(),
                },
            );
        }
        let ctx = harness.ctx();
        let mut project_loop = ProjectLoop::new(&ctx, harness.project.clone());

        assert!(matches!(project_loop.tick(), Ok(Tick::Worked)));
        // Cooling down now, so the follow-up tick has nothing to do.
        assert!(matches!(project_loop.tick(), Ok(Tick::Idle)));
        assert!(harness.platform.comments_for(5).is_empty());
    }
}
