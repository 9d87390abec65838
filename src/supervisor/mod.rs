//! Top-level bot supervision.
//!
//! Startup resolves the bot identity, prepares the shared worktree, and
//! discovers the projects the bot can see (optionally filtered by
//! regex). Each project gets one thread running its project loop; a
//! loop that crashes on upstream trouble is restarted with exponential
//! backoff, a loop that loses authorization is disabled for the rest of
//! the run. A shutdown signal stops every loop at its next blocking
//! point.
//!
//! Anything that fails before the loops start (bad token, unknown bot
//! user, unwritable worktree, bad regex) is fatal and bubbles up as an
//! error so the process exits non-zero.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{info, warn};

use crate::config::BotConfig;
use crate::embargo::EmbargoSet;
use crate::gitlab::{Platform, Project, User};
use crate::job::JobContext;
use crate::scheduler::{LoopExit, ProjectLoop};
use crate::shutdown::ShutdownFlag;
use crate::worktree::Worktree;

const RESTART_BACKOFF_BASE: Duration = Duration::from_secs(5);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Run the bot until shutdown. Blocking; returns once every project
/// loop has stopped.
pub fn run(config: BotConfig, platform: &dyn Platform, shutdown: &ShutdownFlag) -> Result<()> {
    let bot = platform
        .current_user()
        .context("could not resolve the bot user; is the auth token valid?")?;
    info!(bot = %bot.username, id = bot.id, "authenticated");

    let embargo = EmbargoSet::parse(&config.embargo)?;
    let worktree_dir = config
        .worktree_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("merganser-worktree"));
    let worktree = Worktree::init(&worktree_dir, config.ssh_key_file.as_deref(), &bot)
        .with_context(|| format!("could not prepare worktree at {}", worktree_dir.display()))?;
    let worktree = Mutex::new(worktree);

    let filter = config
        .project_regexp
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("bad project-regexp")?;
    let projects = platform
        .list_accessible_projects()
        .context("could not list accessible projects")?;
    let projects = filter_projects(projects, filter.as_ref());
    if projects.is_empty() {
        warn!("no projects to serve; waiting for shutdown");
    }
    info!(count = projects.len(), "serving projects");

    let bot = Arc::new(bot);
    std::thread::scope(|scope| {
        for project in projects {
            let bot = Arc::clone(&bot);
            let config = &config;
            let worktree = &worktree;
            let embargo = &embargo;
            scope.spawn(move || {
                supervise_project(platform, worktree, config, &bot, embargo, shutdown, project);
            });
        }
    });

    info!("all project loops stopped");
    Ok(())
}

/// Keep one project loop alive until shutdown or a disabling condition.
fn supervise_project(
    platform: &dyn Platform,
    worktree: &Mutex<Worktree>,
    config: &BotConfig,
    bot: &User,
    embargo: &EmbargoSet,
    shutdown: &ShutdownFlag,
    project: Project,
) {
    let ctx = JobContext {
        platform,
        worktree,
        config,
        bot,
        embargo,
        shutdown,
    };
    let mut backoff = RESTART_BACKOFF_BASE;
    loop {
        let mut project_loop = ProjectLoop::new(&ctx, project.clone());
        match project_loop.run() {
            LoopExit::Shutdown => return,
            LoopExit::Disabled { reason } => {
                warn!(
                    project = %project.path_with_namespace,
                    reason = %reason,
                    "project loop disabled"
                );
                return;
            }
            LoopExit::Crashed { reason } => {
                warn!(
                    project = %project.path_with_namespace,
                    reason = %reason,
                    delay_secs = backoff.as_secs(),
                    "project loop crashed; restarting"
                );
                if !shutdown.sleep(backoff) {
                    return;
                }
                backoff = (backoff * 2).min(RESTART_BACKOFF_CAP);
            }
        }
    }
}

fn filter_projects(projects: Vec<Project>, filter: Option<&Regex>) -> Vec<Project> {
    projects
        .into_iter()
        .filter(|project| {
            filter
                .map(|regex| regex.is_match(&project.path_with_namespace))
                .unwrap_or(true)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::gitlab::fake::{FakePlatform, FakeState};
    use crate::testutil::fixture_project;

    use super::*;

    fn named_project(id: u64, path: &str) -> Project {
        let mut project = fixture_project(id, "file:///tmp/none");
        project.path_with_namespace = path.to_string();
        project
    }

    #[test]
    fn project_filter_matches_namespace_paths() {
        let projects = vec![
            named_project(1, "team/app"),
            named_project(2, "team/tools"),
            named_project(3, "other/app"),
        ];
        let regex = Regex::new("^team/").unwrap();
        let kept = filter_projects(projects, Some(&regex));
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|p| p.path_with_namespace.starts_with("team/")));
    }

    #[test]
    fn no_filter_keeps_everything() {
        let projects = vec![named_project(1, "a/b"), named_project(2, "c/d")];
        assert_eq!(filter_projects(projects, None).len(), 2);
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|output| output.status.success())
    }

    fn base_config(tmp: &tempfile::TempDir) -> BotConfig {
        BotConfig {
            gitlab_url: "https://gitlab.example.com".to_string(),
            auth_token: "token".to_string(),
            ssh_key_file: None,
            use_https: true,
            project_regexp: None,
            worktree_dir: Some(tmp.path().join("worktree")),
            max_in_flight_requests: 8,
            merge_order: crate::config::MergeOrder::AssignedAt,
            add_tested: false,
            add_reviewers: false,
            add_part_of: false,
            impersonate_approvers: false,
            use_merge_strategy: false,
            rebase_remotely: false,
            batch: false,
            batch_size: 4,
            approval_reset_timeout: Duration::from_secs(1),
            refusal_retries: 2,
            ci_timeout: Duration::from_secs(1),
            ci_timeout_is_fatal: false,
            require_successful_ci: true,
            treat_skipped_as: crate::config::SkippedCi::Wait,
            poll_interval: Duration::from_millis(10),
            idle_interval: Duration::from_millis(10),
            rebase_timeout: Duration::from_secs(1),
            embargo: Vec::new(),
        }
    }

    #[test]
    fn run_with_no_projects_returns_cleanly() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(FakeState::default());
        let shutdown = ShutdownFlag::new();

        // No projects are visible, so run() starts no loops and returns.
        let result = run(base_config(&tmp), &platform, &shutdown);
        assert!(result.is_ok());
    }

    #[test]
    fn bad_project_regexp_is_fatal() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let platform = FakePlatform::new(FakeState::default());
        let shutdown = ShutdownFlag::new();
        let config = BotConfig {
            project_regexp: Some("[".to_string()),
            ..base_config(&tmp)
        };
        let error = run(config, &platform, &shutdown).unwrap_err();
        assert!(error.to_string().contains("project-regexp"));
    }
}
