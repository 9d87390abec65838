//! Capability traits over the platform API and the HTTP-backed client.
//!
//! The merge pipeline only ever sees these traits, so tests substitute an
//! in-memory fake and the state machine stays oblivious to the transport.
//! The traits are grouped by capability; [`Platform`] bundles them for
//! call sites that need the full surface.

use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::error::{ApiError, MergeRefusal};
use super::http::{Transport, TransportConfig};
use super::types::{
    AcceptOptions, Approvals, Branch, Commit, MergeRequest, Pipeline, Project, RebaseStatus, User,
};

pub trait Users: Send + Sync {
    /// The account the bot is authenticated as.
    fn current_user(&self) -> Result<User, ApiError>;

    fn user_by_username(&self, username: &str) -> Result<Option<User>, ApiError>;

    /// Full user record by id. With admin credentials this exposes the
    /// email even when the user keeps it private, which is what approver
    /// impersonation relies on.
    fn get_user(&self, id: u64) -> Result<User, ApiError>;
}

pub trait Projects: Send + Sync {
    /// Projects the authenticated user is a member of.
    fn list_accessible_projects(&self) -> Result<Vec<Project>, ApiError>;

    fn get_project(&self, id: u64) -> Result<Project, ApiError>;
}

pub trait MergeRequests: Send + Sync {
    /// Open MRs on the project currently assigned to `user_id`.
    fn list_assigned_mrs(
        &self,
        project_id: u64,
        user_id: u64,
    ) -> Result<Vec<MergeRequest>, ApiError>;

    /// Fresh read of one MR, including platform-rebase progress.
    fn get_mr(&self, project_id: u64, iid: u64) -> Result<MergeRequest, ApiError>;

    fn get_approvals(&self, project_id: u64, iid: u64) -> Result<Approvals, ApiError>;

    /// Conditional merge. Precondition failures come back as
    /// [`ApiError::MergeRefused`] and are never retried here.
    fn accept_mr(
        &self,
        project_id: u64,
        iid: u64,
        options: &AcceptOptions,
    ) -> Result<(), ApiError>;

    fn comment(&self, project_id: u64, iid: u64, text: &str) -> Result<(), ApiError>;

    /// Remove one assignee, leaving any others in place.
    fn unassign(&self, mr: &MergeRequest, user: &User) -> Result<(), ApiError>;

    /// Ask the platform to rebase the MR onto its target.
    fn start_rebase(&self, project_id: u64, iid: u64) -> Result<(), ApiError>;

    fn rebase_status(&self, project_id: u64, iid: u64) -> Result<RebaseStatus, ApiError>;
}

pub trait Pipelines: Send + Sync {
    /// All pipelines for a commit, any order; callers pick the newest.
    fn list_pipelines(&self, project_id: u64, sha: &str) -> Result<Vec<Pipeline>, ApiError>;
}

pub trait Repository: Send + Sync {
    fn get_commit(&self, project_id: u64, sha: &str) -> Result<Commit, ApiError>;

    /// `None` when the branch does not exist.
    fn get_branch(&self, project_id: u64, name: &str) -> Result<Option<Branch>, ApiError>;

    /// Branches whose name starts with `prefix`.
    fn list_branches(&self, project_id: u64, prefix: &str) -> Result<Vec<Branch>, ApiError>;

    fn delete_branch(&self, project_id: u64, name: &str) -> Result<(), ApiError>;
}

/// The full platform surface the merge pipeline runs against.
pub trait Platform: Users + Projects + MergeRequests + Pipelines + Repository {}

impl<T: Users + Projects + MergeRequests + Pipelines + Repository> Platform for T {}

/// HTTP-backed client for a real platform instance.
pub struct GitLabClient {
    transport: Transport,
}

impl GitLabClient {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            transport: Transport::new(config),
        }
    }

    pub fn base_url(&self) -> &str {
        self.transport.base_url()
    }

    fn parse<T: DeserializeOwned>(path: &str, value: Value) -> Result<T, ApiError> {
        serde_json::from_value(value).map_err(|error| ApiError::Malformed {
            path: path.to_string(),
            detail: error.to_string(),
        })
    }
}

impl Users for GitLabClient {
    fn current_user(&self) -> Result<User, ApiError> {
        let path = "/user";
        Self::parse(path, self.transport.get(path, &[])?)
    }

    fn user_by_username(&self, username: &str) -> Result<Option<User>, ApiError> {
        let path = "/users";
        let matches: Vec<User> =
            Self::parse(path, Value::Array(self.transport.get_paged(
                path,
                &[("username", username)],
            )?))?;
        Ok(matches.into_iter().find(|user| user.username == username))
    }

    fn get_user(&self, id: u64) -> Result<User, ApiError> {
        let path = format!("/users/{id}");
        Self::parse(&path, self.transport.get(&path, &[])?)
    }
}

impl Projects for GitLabClient {
    fn list_accessible_projects(&self) -> Result<Vec<Project>, ApiError> {
        let path = "/projects";
        let items = self
            .transport
            .get_paged(path, &[("membership", "true"), ("archived", "false")])?;
        Self::parse(path, Value::Array(items))
    }

    fn get_project(&self, id: u64) -> Result<Project, ApiError> {
        let path = format!("/projects/{id}");
        Self::parse(&path, self.transport.get(&path, &[])?)
    }
}

impl MergeRequests for GitLabClient {
    fn list_assigned_mrs(
        &self,
        project_id: u64,
        user_id: u64,
    ) -> Result<Vec<MergeRequest>, ApiError> {
        let path = format!("/projects/{project_id}/merge_requests");
        let assignee = user_id.to_string();
        let items = self.transport.get_paged(
            &path,
            &[
                ("state", "opened"),
                ("assignee_id", assignee.as_str()),
                ("sort", "asc"),
            ],
        )?;
        Self::parse(&path, Value::Array(items))
    }

    fn get_mr(&self, project_id: u64, iid: u64) -> Result<MergeRequest, ApiError> {
        let path = format!("/projects/{project_id}/merge_requests/{iid}");
        Self::parse(
            &path,
            self.transport
                .get(&path, &[("include_rebase_in_progress", "true")])?,
        )
    }

    fn get_approvals(&self, project_id: u64, iid: u64) -> Result<Approvals, ApiError> {
        let path = format!("/projects/{project_id}/merge_requests/{iid}/approvals");
        Self::parse(&path, self.transport.get(&path, &[])?)
    }

    fn accept_mr(
        &self,
        project_id: u64,
        iid: u64,
        options: &AcceptOptions,
    ) -> Result<(), ApiError> {
        let path = format!("/projects/{project_id}/merge_requests/{iid}/merge");
        let mut body = json!({
            "sha": options.sha,
            "squash": options.squash,
            "should_remove_source_branch": options.should_remove_source_branch,
            "merge_when_pipeline_succeeds": options.merge_when_pipeline_succeeds,
        });
        if let Some(message) = &options.squash_commit_message {
            body["squash_commit_message"] = Value::String(message.clone());
        }

        match self.transport.put(&path, body) {
            Ok(_) => Ok(()),
            Err(error) => Err(classify_accept_error(error)),
        }
    }

    fn comment(&self, project_id: u64, iid: u64, text: &str) -> Result<(), ApiError> {
        let path = format!("/projects/{project_id}/merge_requests/{iid}/notes");
        self.transport.post(&path, json!({ "body": text }))?;
        Ok(())
    }

    fn unassign(&self, mr: &MergeRequest, user: &User) -> Result<(), ApiError> {
        let path = format!("/projects/{}/merge_requests/{}", mr.project_id, mr.iid);
        let remaining: Vec<u64> = mr
            .assignee_ids
            .iter()
            .copied()
            .filter(|id| *id != user.id)
            .collect();
        self.transport
            .put(&path, json!({ "assignee_ids": remaining }))?;
        Ok(())
    }

    fn start_rebase(&self, project_id: u64, iid: u64) -> Result<(), ApiError> {
        let path = format!("/projects/{project_id}/merge_requests/{iid}/rebase");
        self.transport.put(&path, json!({}))?;
        Ok(())
    }

    fn rebase_status(&self, project_id: u64, iid: u64) -> Result<RebaseStatus, ApiError> {
        let path = format!("/projects/{project_id}/merge_requests/{iid}");
        Self::parse(
            &path,
            self.transport
                .get(&path, &[("include_rebase_in_progress", "true")])?,
        )
    }
}

impl Pipelines for GitLabClient {
    fn list_pipelines(&self, project_id: u64, sha: &str) -> Result<Vec<Pipeline>, ApiError> {
        let path = format!("/projects/{project_id}/pipelines");
        let items = self.transport.get_paged(&path, &[("sha", sha)])?;
        Self::parse(&path, Value::Array(items))
    }
}

impl Repository for GitLabClient {
    fn get_commit(&self, project_id: u64, sha: &str) -> Result<Commit, ApiError> {
        let path = format!("/projects/{project_id}/repository/commits/{sha}");
        Self::parse(&path, self.transport.get(&path, &[])?)
    }

    fn get_branch(&self, project_id: u64, name: &str) -> Result<Option<Branch>, ApiError> {
        let encoded = urlencoding::encode(name);
        let path = format!("/projects/{project_id}/repository/branches/{encoded}");
        match self.transport.get(&path, &[]) {
            Ok(value) => Ok(Some(Self::parse(&path, value)?)),
            Err(ApiError::NotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn list_branches(&self, project_id: u64, prefix: &str) -> Result<Vec<Branch>, ApiError> {
        let path = format!("/projects/{project_id}/repository/branches");
        // The platform matches substrings; narrow to a true prefix here.
        let items = self.transport.get_paged(&path, &[("search", prefix)])?;
        let branches: Vec<Branch> = Self::parse(&path, Value::Array(items))?;
        Ok(branches
            .into_iter()
            .filter(|branch| branch.name.starts_with(prefix))
            .collect())
    }

    fn delete_branch(&self, project_id: u64, name: &str) -> Result<(), ApiError> {
        let encoded = urlencoding::encode(name);
        let path = format!("/projects/{project_id}/repository/branches/{encoded}");
        self.transport.delete(&path)
    }
}

/// Map an `accept` failure status onto the refusal taxonomy.
///
/// The platform signals sha drift with 409, and "cannot be merged right
/// now" with 405/406; a body mentioning the pipeline narrows the latter.
fn classify_accept_error(error: ApiError) -> ApiError {
    let ApiError::Status {
        status,
        detail,
        path,
    } = error
    else {
        return error;
    };

    match status {
        409 => ApiError::MergeRefused(MergeRefusal::ShaMismatch),
        405 | 406 => {
            if detail.to_lowercase().contains("pipeline") {
                ApiError::MergeRefused(MergeRefusal::PipelineNotSuccess)
            } else {
                ApiError::MergeRefused(MergeRefusal::NotMergeable)
            }
        }
        401..=499 => ApiError::MergeRefused(MergeRefusal::Other(if detail.is_empty() {
            format!("status {status}")
        } else {
            detail
        })),
        _ => ApiError::Status {
            status,
            detail,
            path,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(status: u16, detail: &str) -> ApiError {
        ApiError::Status {
            path: "/projects/1/merge_requests/2/merge".to_string(),
            status,
            detail: detail.to_string(),
        }
    }

    #[test]
    fn accept_409_is_sha_mismatch() {
        let classified = classify_accept_error(status_error(409, "SHA does not match HEAD"));
        assert!(matches!(
            classified,
            ApiError::MergeRefused(MergeRefusal::ShaMismatch)
        ));
    }

    #[test]
    fn accept_405_mentioning_pipeline_is_pipeline_refusal() {
        let classified = classify_accept_error(status_error(405, "Pipeline must succeed"));
        assert!(matches!(
            classified,
            ApiError::MergeRefused(MergeRefusal::PipelineNotSuccess)
        ));
    }

    #[test]
    fn accept_406_without_pipeline_detail_is_not_mergeable() {
        let classified = classify_accept_error(status_error(406, "Branch cannot be merged"));
        assert!(matches!(
            classified,
            ApiError::MergeRefused(MergeRefusal::NotMergeable)
        ));
    }

    #[test]
    fn accept_422_keeps_the_server_detail() {
        let classified = classify_accept_error(status_error(422, "squash not allowed"));
        match classified {
            ApiError::MergeRefused(MergeRefusal::Other(detail)) => {
                assert_eq!(detail, "squash not allowed");
            }
            other => panic!("expected Other refusal, got {other:?}"),
        }
    }

    #[test]
    fn non_status_errors_pass_through() {
        let original = ApiError::TransientUpstream("reset".to_string());
        assert!(classify_accept_error(original).is_transient());
    }
}
