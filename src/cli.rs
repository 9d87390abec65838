use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Command-line surface. Every option can also come from a
/// `MERGANSER_*` environment variable or the config file; flags win.
#[derive(Parser, Debug)]
#[command(
    name = "merganser",
    about = "Merge-request automation bot for self-hosted GitLab",
    version
)]
pub struct Cli {
    /// Path to the config file (default: search upward for
    /// .merganser/config.toml)
    #[arg(long, env = "MERGANSER_CONFIG")]
    pub config: Option<PathBuf>,

    /// API token for the platform
    #[arg(long, env = "MERGANSER_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// File containing the API token
    #[arg(long, env = "MERGANSER_AUTH_TOKEN_FILE")]
    pub auth_token_file: Option<PathBuf>,

    /// SSH identity used for git pushes (required unless --use-https)
    #[arg(long, env = "MERGANSER_SSH_KEY_FILE")]
    pub ssh_key_file: Option<PathBuf>,

    /// Push over HTTPS instead of SSH
    #[arg(long, env = "MERGANSER_USE_HTTPS")]
    pub use_https: bool,

    /// Base URL of the platform, e.g. https://gitlab.example.com
    #[arg(long, env = "MERGANSER_GITLAB_URL")]
    pub gitlab_url: Option<String>,

    /// Only serve projects whose path matches this regex
    #[arg(long, env = "MERGANSER_PROJECT_REGEXP")]
    pub project_regexp: Option<String>,

    /// Order in which assigned MRs are attempted
    #[arg(long, value_enum, env = "MERGANSER_MERGE_ORDER")]
    pub merge_order: Option<MergeOrderArg>,

    /// Append Tested-by trailers while rebasing
    #[arg(long, env = "MERGANSER_ADD_TESTED")]
    pub add_tested: bool,

    /// Append Reviewed-by trailers (fails if an approver hides their email)
    #[arg(long, env = "MERGANSER_ADD_REVIEWERS")]
    pub add_reviewers: bool,

    /// Append a Part-of trailer pointing at the merge request
    #[arg(long, env = "MERGANSER_ADD_PART_OF")]
    pub add_part_of: bool,

    /// Resolve approver identities through the admin users API
    #[arg(long, env = "MERGANSER_IMPERSONATE_APPROVERS")]
    pub impersonate_approvers: bool,

    /// Seconds to wait before retrying after a push reset approvals
    #[arg(long, env = "MERGANSER_APPROVAL_RESET_TIMEOUT")]
    pub approval_reset_timeout: Option<u64>,

    /// Embargo entry: 'branch=<regex>' or '<cron>;<duration>' (repeatable)
    #[arg(long, env = "MERGANSER_EMBARGO")]
    pub embargo: Vec<String>,

    /// Seconds to wait for CI per merge request
    #[arg(long, env = "MERGANSER_CI_TIMEOUT")]
    pub ci_timeout: Option<u64>,

    /// Merge platform-side even on fast-forward-capable projects
    #[arg(long, env = "MERGANSER_USE_MERGE_STRATEGY")]
    pub use_merge_strategy: bool,

    /// Speculatively pre-merge several MRs behind one CI run
    #[arg(long, env = "MERGANSER_BATCH")]
    pub batch: bool,

    /// Rebase through the platform instead of the local worktree
    #[arg(long, env = "MERGANSER_REBASE_REMOTELY")]
    pub rebase_remotely: bool,

    /// Directory for the bot's git worktree
    #[arg(long, env = "MERGANSER_WORKTREE_DIR")]
    pub worktree_dir: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MergeOrderArg {
    #[value(name = "assigned_at")]
    AssignedAt,
    #[value(name = "created_at")]
    CreatedAt,
}
