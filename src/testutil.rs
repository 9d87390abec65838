//! Shared fixtures for unit tests: a real git "remote" built in a
//! tempdir, plus builders for platform entities. Compiled only for
//! tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::gitlab::{MergeRequest, Project, User};

pub(crate) fn git(repo: &Path, args: &[&str]) -> Output {
    Command::new("git")
        .current_dir(repo)
        .args(args)
        .env("GIT_AUTHOR_NAME", "Fixture")
        .env("GIT_AUTHOR_EMAIL", "fixture@example.com")
        .env("GIT_COMMITTER_NAME", "Fixture")
        .env("GIT_COMMITTER_EMAIL", "fixture@example.com")
        .output()
        .unwrap()
}

pub(crate) struct GitFixture {
    pub tmp: tempfile::TempDir,
    /// Bare repository standing in for the platform's remote.
    pub remote: PathBuf,
    /// Seed clone used to manufacture history.
    pub seed: PathBuf,
    pub base_branch: String,
}

impl GitFixture {
    /// Build a bare "remote" with one commit on the default branch.
    /// Returns `None` when git is unavailable so tests skip gracefully.
    pub fn new() -> Option<Self> {
        let version = Command::new("git").arg("--version").output().ok()?;
        if !version.status.success() {
            return None;
        }

        let tmp = tempfile::tempdir().ok()?;
        let remote = tmp.path().join("remote.git");
        let seed = tmp.path().join("seed");
        if !git(tmp.path(), &["init", "-q", "--bare", "remote.git"])
            .status
            .success()
        {
            return None;
        }
        if !git(tmp.path(), &["init", "-q", "seed"]).status.success() {
            return None;
        }
        let _ = git(&seed, &["config", "user.name", "Fixture"]);
        let _ = git(&seed, &["config", "user.email", "fixture@example.com"]);
        fs::write(seed.join("README.md"), "base\n").ok()?;
        let _ = git(&seed, &["add", "README.md"]);
        let _ = git(&seed, &["commit", "-q", "-m", "init"]);
        let base_branch =
            String::from_utf8_lossy(&git(&seed, &["branch", "--show-current"]).stdout)
                .trim()
                .to_string();
        if base_branch.is_empty() {
            return None;
        }
        let remote_s = remote.to_string_lossy().to_string();
        let _ = git(&seed, &["push", "-q", remote_s.as_str(), base_branch.as_str()]);
        Some(Self {
            tmp,
            remote,
            seed,
            base_branch,
        })
    }

    pub fn remote_url(&self) -> String {
        self.remote.to_string_lossy().to_string()
    }

    /// Commit to `branch` in the seed clone (creating it off the base
    /// branch if needed) and push it to the remote. Returns the new sha.
    pub fn seed_commit(&self, branch: &str, file: &str, content: &str, message: &str) -> String {
        let seed = &self.seed;
        let exists = git(seed, &["rev-parse", "--verify", branch]).status.success();
        if exists {
            assert!(git(seed, &["switch", "-q", branch]).status.success());
        } else {
            assert!(git(seed, &["switch", "-q", "-c", branch]).status.success());
        }
        fs::write(seed.join(file), content).unwrap();
        assert!(git(seed, &["add", file]).status.success());
        assert!(git(seed, &["commit", "-q", "-m", message]).status.success());
        let remote = self.remote_url();
        assert!(
            git(seed, &["push", "-q", "--force", remote.as_str(), branch])
                .status
                .success()
        );
        let sha = self.seed_head();
        assert!(
            git(seed, &["switch", "-q", self.base_branch.as_str()])
                .status
                .success()
        );
        sha
    }

    fn seed_head(&self) -> String {
        String::from_utf8_lossy(&git(&self.seed, &["rev-parse", "HEAD"]).stdout)
            .trim()
            .to_string()
    }

    /// Tip of `branch` as recorded in the bare remote.
    pub fn remote_tip(&self, branch: &str) -> String {
        let reference = format!("refs/heads/{branch}");
        String::from_utf8_lossy(&git(&self.remote, &["rev-parse", reference.as_str()]).stdout)
            .trim()
            .to_string()
    }
}

pub(crate) fn bot_user() -> User {
    User {
        id: 42,
        username: "merganser".to_string(),
        name: "Merganser Bot".to_string(),
        email: Some("bot@example.com".to_string()),
    }
}

pub(crate) fn fixture_project(id: u64, repo_url: &str) -> Project {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "path_with_namespace": "team/app",
        "default_branch": "main",
        "merge_method": "ff",
        "ssh_url_to_repo": repo_url,
        "http_url_to_repo": repo_url,
    }))
    .unwrap()
}

pub(crate) fn fixture_mr(
    iid: u64,
    project_id: u64,
    source_branch: &str,
    target_branch: &str,
    sha: &str,
) -> MergeRequest {
    serde_json::from_value(serde_json::json!({
        "id": 1000 + iid,
        "iid": iid,
        "project_id": project_id,
        "source_branch": source_branch,
        "target_branch": target_branch,
        "sha": sha,
        "state": "opened",
        "author_id": 9,
        "assignee_ids": [42],
        "blocking_discussions_resolved": true,
        "web_url": format!("https://gitlab.example.com/team/app/-/merge_requests/{iid}"),
    }))
    .unwrap()
}
