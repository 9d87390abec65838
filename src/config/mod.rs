use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::cli::{Cli, MergeOrderArg};

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".merganser";

/// Order in which a project's assigned MRs are attempted.
#[derive(Debug, Default, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeOrder {
    /// Hand-off order; approximated by iid since the platform does not
    /// expose assignment timestamps.
    #[default]
    AssignedAt,
    CreatedAt,
}

/// What a skipped or manual pipeline stage counts as.
#[derive(Debug, Default, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SkippedCi {
    Success,
    Failure,
    /// Keep polling; the CI timeout decides.
    #[default]
    Wait,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BotSection {
    #[serde(default)]
    pub gitlab_url: Option<String>,
    #[serde(default)]
    pub auth_token_file: Option<PathBuf>,
    #[serde(default)]
    pub ssh_key_file: Option<PathBuf>,
    #[serde(default)]
    pub use_https: bool,
    #[serde(default)]
    pub project_regexp: Option<String>,
    #[serde(default)]
    pub worktree_dir: Option<PathBuf>,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_requests: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MergeSection {
    #[serde(default)]
    pub order: MergeOrder,
    #[serde(default)]
    pub add_tested: bool,
    #[serde(default)]
    pub add_reviewers: bool,
    #[serde(default)]
    pub add_part_of: bool,
    #[serde(default)]
    pub impersonate_approvers: bool,
    #[serde(default)]
    pub use_merge_strategy: bool,
    #[serde(default)]
    pub rebase_remotely: bool,
    #[serde(default)]
    pub batch: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_approval_reset_timeout_secs")]
    pub approval_reset_timeout_secs: u64,
    #[serde(default = "default_refusal_retries")]
    pub refusal_retries: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CiSection {
    #[serde(default = "default_ci_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub timeout_is_fatal: bool,
    #[serde(default = "default_require_successful")]
    pub require_successful: bool,
    #[serde(default)]
    pub treat_skipped_as: SkippedCi,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScheduleSection {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_idle_interval_secs")]
    pub idle_interval_secs: u64,
    #[serde(default = "default_rebase_timeout_secs")]
    pub rebase_timeout_secs: u64,
    #[serde(default)]
    pub embargo: Vec<String>,
}

fn default_max_in_flight() -> usize {
    8
}

fn default_batch_size() -> usize {
    4
}

fn default_approval_reset_timeout_secs() -> u64 {
    60
}

fn default_refusal_retries() -> u32 {
    3
}

fn default_ci_timeout_secs() -> u64 {
    900
}

fn default_require_successful() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_idle_interval_secs() -> u64 {
    60
}

fn default_rebase_timeout_secs() -> u64 {
    60
}

impl Default for BotSection {
    fn default() -> Self {
        Self {
            gitlab_url: None,
            auth_token_file: None,
            ssh_key_file: None,
            use_https: false,
            project_regexp: None,
            worktree_dir: None,
            max_in_flight_requests: default_max_in_flight(),
        }
    }
}

impl Default for MergeSection {
    fn default() -> Self {
        Self {
            order: MergeOrder::default(),
            add_tested: false,
            add_reviewers: false,
            add_part_of: false,
            impersonate_approvers: false,
            use_merge_strategy: false,
            rebase_remotely: false,
            batch: false,
            batch_size: default_batch_size(),
            approval_reset_timeout_secs: default_approval_reset_timeout_secs(),
            refusal_retries: default_refusal_retries(),
        }
    }
}

impl Default for CiSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_ci_timeout_secs(),
            timeout_is_fatal: false,
            require_successful: default_require_successful(),
            treat_skipped_as: SkippedCi::default(),
        }
    }
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            idle_interval_secs: default_idle_interval_secs(),
            rebase_timeout_secs: default_rebase_timeout_secs(),
            embargo: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct FileConfig {
    #[serde(default)]
    pub bot: BotSection,
    #[serde(default)]
    pub merge: MergeSection,
    #[serde(default)]
    pub ci: CiSection,
    #[serde(default)]
    pub schedule: ScheduleSection,
}

impl FileConfig {
    /// Load the config file: explicit path if given, otherwise search
    /// upward from `start` for `.merganser/config.toml`. Missing file is
    /// not an error; defaults apply.
    pub fn load(explicit: Option<&Path>, start: &Path) -> Result<(Self, Option<PathBuf>)> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Self::find_config_file(start),
        };
        if let Some(path) = path {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: FileConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((FileConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

/// Immutable, fully-resolved configuration. Built once at startup and
/// shared by reference; jobs never see anything mutable.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub gitlab_url: String,
    pub auth_token: String,
    pub ssh_key_file: Option<PathBuf>,
    pub use_https: bool,
    pub project_regexp: Option<String>,
    pub worktree_dir: Option<PathBuf>,
    pub max_in_flight_requests: usize,

    pub merge_order: MergeOrder,
    pub add_tested: bool,
    pub add_reviewers: bool,
    pub add_part_of: bool,
    pub impersonate_approvers: bool,
    pub use_merge_strategy: bool,
    pub rebase_remotely: bool,
    pub batch: bool,
    pub batch_size: usize,
    pub approval_reset_timeout: Duration,
    pub refusal_retries: u32,

    pub ci_timeout: Duration,
    pub ci_timeout_is_fatal: bool,
    pub require_successful_ci: bool,
    pub treat_skipped_as: SkippedCi,

    pub poll_interval: Duration,
    pub idle_interval: Duration,
    pub rebase_timeout: Duration,
    pub embargo: Vec<String>,
}

impl BotConfig {
    /// Merge flags (and their environment fallbacks, which clap already
    /// applied) over the file layer, then validate what a run cannot do
    /// without.
    pub fn resolve(cli: &Cli, file: FileConfig) -> Result<Self> {
        let auth_token = resolve_token(cli, &file)?;

        let Some(gitlab_url) = cli
            .gitlab_url
            .clone()
            .or_else(|| file.bot.gitlab_url.clone())
        else {
            bail!("gitlab-url is required (flag, MERGANSER_GITLAB_URL, or config file)");
        };
        let gitlab_url = gitlab_url.trim_end_matches('/').to_string();

        let use_https = cli.use_https || file.bot.use_https;
        let ssh_key_file = cli
            .ssh_key_file
            .clone()
            .or_else(|| file.bot.ssh_key_file.clone());
        if !use_https {
            let Some(key) = &ssh_key_file else {
                bail!("ssh-key-file is required unless use-https is set");
            };
            if !key.is_file() {
                bail!("ssh key file {} does not exist", key.display());
            }
        }

        let merge_order = match cli.merge_order {
            Some(MergeOrderArg::AssignedAt) => MergeOrder::AssignedAt,
            Some(MergeOrderArg::CreatedAt) => MergeOrder::CreatedAt,
            None => file.merge.order,
        };

        let mut embargo = file.schedule.embargo.clone();
        embargo.extend(cli.embargo.iter().cloned());

        Ok(Self {
            gitlab_url,
            auth_token,
            ssh_key_file,
            use_https,
            project_regexp: cli
                .project_regexp
                .clone()
                .or_else(|| file.bot.project_regexp.clone()),
            worktree_dir: cli
                .worktree_dir
                .clone()
                .or_else(|| file.bot.worktree_dir.clone()),
            max_in_flight_requests: file.bot.max_in_flight_requests,

            merge_order,
            add_tested: cli.add_tested || file.merge.add_tested,
            add_reviewers: cli.add_reviewers || file.merge.add_reviewers,
            add_part_of: cli.add_part_of || file.merge.add_part_of,
            impersonate_approvers: cli.impersonate_approvers || file.merge.impersonate_approvers,
            use_merge_strategy: cli.use_merge_strategy || file.merge.use_merge_strategy,
            rebase_remotely: cli.rebase_remotely || file.merge.rebase_remotely,
            batch: cli.batch || file.merge.batch,
            batch_size: file.merge.batch_size.max(1),
            approval_reset_timeout: Duration::from_secs(
                cli.approval_reset_timeout
                    .unwrap_or(file.merge.approval_reset_timeout_secs),
            ),
            refusal_retries: file.merge.refusal_retries,

            ci_timeout: Duration::from_secs(cli.ci_timeout.unwrap_or(file.ci.timeout_secs)),
            ci_timeout_is_fatal: file.ci.timeout_is_fatal,
            require_successful_ci: file.ci.require_successful,
            treat_skipped_as: file.ci.treat_skipped_as,

            poll_interval: Duration::from_secs(file.schedule.poll_interval_secs),
            idle_interval: Duration::from_secs(file.schedule.idle_interval_secs),
            rebase_timeout: Duration::from_secs(file.schedule.rebase_timeout_secs),
            embargo,
        })
    }
}

fn resolve_token(cli: &Cli, file: &FileConfig) -> Result<String> {
    if let Some(token) = &cli.auth_token {
        return Ok(token.trim().to_string());
    }
    let token_file = cli
        .auth_token_file
        .clone()
        .or_else(|| file.bot.auth_token_file.clone());
    if let Some(path) = token_file {
        let token = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read auth token from {}", path.display()))?;
        let token = token.trim().to_string();
        if token.is_empty() {
            bail!("auth token file {} is empty", path.display());
        }
        return Ok(token);
    }
    bail!("auth-token or auth-token-file is required");
}
