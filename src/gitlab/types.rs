//! Typed views of the platform entities the bot reads and writes.
//!
//! Only the fields the merge pipeline actually consults are modeled;
//! everything else in the platform's JSON is ignored on deserialize. All
//! ids are the platform's stable integer ids.

use serde::{Deserialize, Serialize};

/// A platform account. The bot itself runs as one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    pub name: String,
    /// Public email. Absent unless the user chose to expose one.
    #[serde(default)]
    pub email: Option<String>,
}

/// How a project integrates merge requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    /// Merge commit created platform-side.
    Merge,
    /// Rebase first, then merge commit.
    RebaseMerge,
    /// Fast-forward only; the source must sit directly on the target tip.
    Ff,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: u64,
    pub path_with_namespace: String,
    #[serde(default = "default_branch_name")]
    pub default_branch: String,
    pub merge_method: MergeMethod,
    #[serde(default)]
    pub only_allow_merge_if_pipeline_succeeds: bool,
    #[serde(default)]
    pub only_allow_merge_if_all_discussions_are_resolved: bool,
    #[serde(default)]
    pub ssh_url_to_repo: String,
    #[serde(default)]
    pub http_url_to_repo: String,
    /// Whether the project forces source-branch removal on merge.
    #[serde(default)]
    pub remove_source_branch_after_merge: bool,
}

fn default_branch_name() -> String {
    "master".to_string()
}

impl Project {
    /// The remote URL jobs should push over, per transport choice.
    pub fn repo_url(&self, use_https: bool) -> &str {
        if use_https {
            &self.http_url_to_repo
        } else {
            &self.ssh_url_to_repo
        }
    }
}

/// Lifecycle state of a merge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MrState {
    Opened,
    Merged,
    Closed,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: u64,
    /// Project-scoped id; all human-facing references use this.
    pub iid: u64,
    pub project_id: u64,
    /// The project the source branch lives in (differs for fork MRs).
    #[serde(default)]
    pub source_project_id: Option<u64>,
    pub source_branch: String,
    pub target_branch: String,
    /// Head commit of the source branch as the platform last saw it.
    pub sha: String,
    pub state: MrState,
    #[serde(default)]
    pub work_in_progress: bool,
    #[serde(default)]
    pub assignee_ids: Vec<u64>,
    pub author_id: u64,
    #[serde(default)]
    pub squash: bool,
    #[serde(default)]
    pub web_url: String,
    #[serde(default)]
    pub blocking_discussions_resolved: bool,
    #[serde(default)]
    pub rebase_in_progress: bool,
    /// Set when the author or a reviewer asked for source-branch removal.
    #[serde(default)]
    pub force_remove_source_branch: bool,
    #[serde(default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl MergeRequest {
    pub fn is_assigned_to(&self, user: &User) -> bool {
        self.assignee_ids.contains(&user.id)
    }

    /// Project id to push the updated source branch to.
    pub fn source_project(&self) -> u64 {
        self.source_project_id.unwrap_or(self.project_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSignature {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    #[serde(default)]
    pub parent_shas: Vec<String>,
    pub message: String,
    pub author: CommitSignature,
    pub committer: CommitSignature,
}

/// Pipeline status as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Created,
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
    Manual,
}

impl PipelineStatus {
    /// Whether the platform will not change this status on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Canceled | Self::Skipped | Self::Manual
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: u64,
    pub sha: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub status: PipelineStatus,
    #[serde(default)]
    pub web_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approvals {
    #[serde(default)]
    pub approvals_left: u32,
    #[serde(default)]
    pub approved_by: Vec<User>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    #[serde(default)]
    pub protected: bool,
    /// Whether the authenticated user may push to this branch.
    #[serde(default = "default_can_push")]
    pub can_push: bool,
}

fn default_can_push() -> bool {
    true
}

/// In-flight state of a platform-side rebase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebaseStatus {
    #[serde(default)]
    pub rebase_in_progress: bool,
    #[serde(default)]
    pub merge_error: Option<String>,
}

/// Parameters for the conditional merge call.
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    /// The head sha the merge is conditional on. Mandatory: an accept
    /// without sha pinning could merge commits the bot never validated.
    pub sha: String,
    pub squash: bool,
    pub squash_commit_message: Option<String>,
    pub should_remove_source_branch: bool,
    pub merge_when_pipeline_succeeds: bool,
}
