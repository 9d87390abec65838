//! Local git working copy for branch surgery.
//!
//! One long-lived clone serves every job in the bot run; callers hold it
//! behind a mutex so only one job mutates it at a time. Remotes are not
//! configured — every fetch and push names the repository URL directly,
//! which lets a single directory serve all projects.
//!
//! Every git subprocess that fails is converted into a typed error
//! carrying the command and its stderr; nothing fails silently. All
//! mutating entry points leave the directory clean on error.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use thiserror::Error;
use tracing::debug;

use crate::gitlab::User;
use crate::trailers::{self, Trailer};

#[derive(Debug, Error)]
pub enum GitError {
    /// The rebase stopped on conflicting hunks. The worktree has already
    /// been aborted back to a clean state.
    #[error("rebase conflict: {detail}")]
    RebaseConflict { detail: String },

    /// A conditional push found the remote ref somewhere unexpected.
    #[error("remote ref moved: {detail}")]
    RemoteMoved { detail: String },

    /// The remote refused the push for a non-race reason (protected
    /// branch, hook, permissions).
    #[error("push rejected: {detail}")]
    PushRejected { detail: String },

    #[error("git {command} failed: {detail}")]
    CommandFailed { command: String, detail: String },

    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),
}

/// How a push may move the remote ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode<'a> {
    /// Strict ancestor extension only; anything else is [`GitError::RemoteMoved`].
    FastForward,
    /// Replace the ref, but only if the remote still points at `expected`.
    ForceWithLease { expected: &'a str },
    /// Replace the ref unconditionally. Only for ephemeral scratch branches.
    Force,
}

pub struct Worktree {
    root: PathBuf,
    env: Vec<(String, String)>,
}

impl Worktree {
    /// Initialize an empty repository at `root`, creating it if needed.
    ///
    /// `committer` becomes the git identity for rewritten commits; the
    /// optional SSH key is wired through `GIT_SSH_COMMAND` for pushes.
    pub fn init(
        root: &Path,
        ssh_key_file: Option<&Path>,
        committer: &User,
    ) -> Result<Self, GitError> {
        std::fs::create_dir_all(root)?;

        let mut env = vec![("GIT_EDITOR".to_string(), ":".to_string())];
        if let Some(key) = ssh_key_file {
            env.push((
                "GIT_SSH_COMMAND".to_string(),
                format!(
                    "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
                    key.display()
                ),
            ));
        }

        let worktree = Self {
            root: root.to_path_buf(),
            env,
        };
        if !root.join(".git").exists() {
            worktree.git_ok(["init", "-q"], "init")?;
        }
        worktree.git_ok(["config", "user.name", committer.name.as_str()], "config")?;
        let email = committer.email.as_deref().unwrap_or("bot@invalid");
        worktree.git_ok(["config", "user.email", email], "config")?;
        worktree.git_ok(["config", "commit.gpgsign", "false"], "config")?;
        Ok(worktree)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fetch one branch from `remote_url` and return its tip sha.
    pub fn fetch(&self, remote_url: &str, branch: &str) -> Result<String, GitError> {
        debug!(remote = remote_url, branch, "fetching");
        self.git_ok(["fetch", "-q", remote_url, branch], "fetch")?;
        self.rev_parse("FETCH_HEAD")
    }

    /// Rebase `source_sha` onto `onto_sha`, optionally rewriting each new
    /// commit's message to carry `trailer_additions`.
    ///
    /// Returns the new head sha. When the source already sits on the
    /// target and the trailers are already present, the returned sha
    /// equals `source_sha`. On conflict the rebase is aborted before the
    /// error is returned.
    pub fn rebase(
        &self,
        source_sha: &str,
        onto_sha: &str,
        trailer_additions: &[Trailer],
    ) -> Result<String, GitError> {
        self.git_ok(["checkout", "-q", "--detach", source_sha], "checkout")?;

        let rebase = self.run_git(["rebase", onto_sha])?;
        if !rebase.status.success() {
            let detail = output_detail(&rebase);
            let _ = self.run_git(["rebase", "--abort"]);
            self.restore_clean();
            if is_conflict(&detail) {
                return Err(GitError::RebaseConflict { detail });
            }
            return Err(GitError::CommandFailed {
                command: format!("rebase {onto_sha}"),
                detail,
            });
        }

        if trailer_additions.is_empty() {
            return self.rev_parse("HEAD");
        }
        self.rewrite_range_trailers(onto_sha, trailer_additions)
    }

    /// Push `local_sha` to `refs/heads/<remote_branch>` on `remote_url`.
    pub fn push(
        &self,
        remote_url: &str,
        local_sha: &str,
        remote_branch: &str,
        mode: PushMode<'_>,
    ) -> Result<(), GitError> {
        let refspec = format!("{local_sha}:refs/heads/{remote_branch}");
        let lease;
        let mut args: Vec<&str> = vec!["push", "-q"];
        match mode {
            PushMode::FastForward => {}
            PushMode::ForceWithLease { expected } => {
                lease = format!("--force-with-lease=refs/heads/{remote_branch}:{expected}");
                args.push(&lease);
            }
            PushMode::Force => args.push("--force"),
        }
        args.push(remote_url);
        args.push(&refspec);

        debug!(remote = remote_url, branch = remote_branch, ?mode, "pushing");
        let output = self.run_git(args)?;
        if output.status.success() {
            return Ok(());
        }

        let detail = output_detail(&output);
        if is_remote_moved(&detail) {
            return Err(GitError::RemoteMoved { detail });
        }
        Err(GitError::PushRejected { detail })
    }

    /// Whether `ancestor` is an ancestor of (or equal to) `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        let output = self.run_git(["merge-base", "--is-ancestor", ancestor, descendant])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(GitError::CommandFailed {
                command: "merge-base --is-ancestor".to_string(),
                detail: output_detail(&output),
            }),
        }
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String, GitError> {
        let output = self.git_ok(["rev-parse", rev], "rev-parse")?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn commit_message(&self, sha: &str) -> Result<String, GitError> {
        let output = self.git_ok(["log", "-1", "--format=%B", sha], "log")?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Return the directory to a quiet state after a job, succeeding or
    /// not. Safe to call when nothing is in progress.
    pub fn restore_clean(&self) {
        let _ = self.run_git(["cherry-pick", "--abort"]);
        let _ = self.run_git(["rebase", "--abort"]);
        let _ = self.run_git(["reset", "--hard", "-q"]);
        let _ = self.run_git(["clean", "-fd", "-q"]);
    }

    /// Rewrite messages of every commit in `base_sha..HEAD` to include
    /// `additions`, preserving authorship.
    ///
    /// Commits whose message already carries all additions are kept
    /// untouched; when that holds for the whole range the head sha does
    /// not change at all.
    fn rewrite_range_trailers(
        &self,
        base_sha: &str,
        additions: &[Trailer],
    ) -> Result<String, GitError> {
        let head = self.rev_parse("HEAD")?;
        let range = format!("{base_sha}..HEAD");
        let output = self.git_ok(["rev-list", "--reverse", range.as_str()], "rev-list")?;
        let shas: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if shas.is_empty() {
            return Ok(head);
        }

        let mut rewrites = Vec::with_capacity(shas.len());
        for sha in &shas {
            let message = self.commit_message(sha)?;
            let rewritten = trailers::rewrite_message(&message, additions).map_err(|error| {
                GitError::CommandFailed {
                    command: "interpret-trailers".to_string(),
                    detail: error.to_string(),
                }
            })?;
            let changed = message.trim_end() != rewritten.trim_end();
            rewrites.push((sha.clone(), rewritten, changed));
        }

        let Some(first_changed) = rewrites.iter().position(|(_, _, changed)| *changed) else {
            return Ok(head);
        };

        let restart = if first_changed == 0 {
            base_sha
        } else {
            shas[first_changed - 1].as_str()
        };
        self.git_ok(["checkout", "-q", "--detach", restart], "checkout")?;

        for (sha, rewritten, changed) in &rewrites[first_changed..] {
            let pick = self.run_git(["cherry-pick", "--allow-empty", sha.as_str()]);
            match pick {
                Ok(output) if output.status.success() => {}
                Ok(output) => {
                    let detail = output_detail(&output);
                    self.restore_clean();
                    return Err(GitError::CommandFailed {
                        command: format!("cherry-pick {sha}"),
                        detail,
                    });
                }
                Err(error) => {
                    self.restore_clean();
                    return Err(error);
                }
            }
            if *changed {
                self.git_ok(
                    ["commit", "-q", "--amend", "--allow-empty", "-m", rewritten.as_str()],
                    "commit --amend",
                )?;
            }
        }
        self.rev_parse("HEAD")
    }

    fn run_git<I, S>(&self, args: I) -> Result<Output, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new("git");
        command.current_dir(&self.root).args(args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        Ok(command.output()?)
    }

    fn git_ok<I, S>(&self, args: I, what: &str) -> Result<Output, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run_git(args)?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: what.to_string(),
                detail: output_detail(&output),
            });
        }
        Ok(output)
    }
}

/// Best human-readable detail from a git subprocess.
fn output_detail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !stdout.is_empty() {
        return stdout;
    }
    "unknown git error".to_string()
}

fn is_conflict(detail: &str) -> bool {
    detail.contains("CONFLICT")
        || detail.contains("could not apply")
        || detail.contains("Resolve all conflicts manually")
}

fn is_remote_moved(detail: &str) -> bool {
    detail.contains("stale info")
        || detail.contains("non-fast-forward")
        || detail.contains("fetch first")
        || detail.contains("cannot lock ref")
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use crate::testutil::{GitFixture, bot_user, git};

    use super::*;

    fn open_worktree(fixture: &GitFixture) -> Worktree {
        let dir = fixture.tmp.path().join("worktree");
        Worktree::init(&dir, None, &bot_user()).unwrap()
    }

    #[test]
    fn fetch_returns_remote_tip() {
        let Some(fixture) = GitFixture::new() else {
            return;
        };
        let worktree = open_worktree(&fixture);

        let sha = worktree
            .fetch(&fixture.remote_url(), &fixture.base_branch)
            .unwrap();
        assert_eq!(sha, fixture.remote_tip(&fixture.base_branch));
    }

    #[test]
    fn rebase_moves_source_onto_target_tip() {
        let Some(fixture) = GitFixture::new() else {
            return;
        };
        fixture.seed_commit("feat-a", "a.txt", "a\n", "add a");
        let base = fixture.base_branch.clone();
        fixture.seed_commit(&base, "base.txt", "more\n", "advance base");

        let worktree = open_worktree(&fixture);
        let remote = fixture.remote_url();
        let source = worktree.fetch(&remote, "feat-a").unwrap();
        let target = worktree.fetch(&remote, &fixture.base_branch).unwrap();

        let new_head = worktree.rebase(&source, &target, &[]).unwrap();
        assert_ne!(new_head, source);
        assert!(worktree.is_ancestor(&target, &new_head).unwrap());
    }

    #[test]
    fn rebase_conflict_surfaces_and_leaves_worktree_clean() {
        let Some(fixture) = GitFixture::new() else {
            return;
        };
        fixture.seed_commit("feat-b", "shared.txt", "branch side\n", "branch edit");
        let base = fixture.base_branch.clone();
        fixture.seed_commit(&base, "shared.txt", "base side\n", "base edit");

        let worktree = open_worktree(&fixture);
        let remote = fixture.remote_url();
        let source = worktree.fetch(&remote, "feat-b").unwrap();
        let target = worktree.fetch(&remote, &fixture.base_branch).unwrap();

        let error = worktree.rebase(&source, &target, &[]).unwrap_err();
        assert!(matches!(error, GitError::RebaseConflict { .. }));
        // No rebase left in progress.
        let status = git(worktree.root(), &["status", "--porcelain"]);
        assert_eq!(String::from_utf8_lossy(&status.stdout).trim(), "");
    }

    #[test]
    fn trailer_rewrite_annotates_each_new_commit() {
        let Some(fixture) = GitFixture::new() else {
            return;
        };
        fixture.seed_commit("feat-c", "c.txt", "c\n", "add c");

        let worktree = open_worktree(&fixture);
        let remote = fixture.remote_url();
        let source = worktree.fetch(&remote, "feat-c").unwrap();
        let target = worktree.fetch(&remote, &fixture.base_branch).unwrap();

        let additions = vec![Trailer::new("Tested-by", "Merganser Bot <bot@example.com>")];
        let new_head = worktree.rebase(&source, &target, &additions).unwrap();
        let message = worktree.commit_message(&new_head).unwrap();
        assert!(message.contains("Tested-by: Merganser Bot <bot@example.com>"));
    }

    #[test]
    fn trailer_rewrite_is_a_noop_when_already_present() {
        let Some(fixture) = GitFixture::new() else {
            return;
        };
        fixture.seed_commit(
            "feat-d",
            "d.txt",
            "d\n",
            "add d\n\nTested-by: Merganser Bot <bot@example.com>",
        );

        let worktree = open_worktree(&fixture);
        let remote = fixture.remote_url();
        let source = worktree.fetch(&remote, "feat-d").unwrap();
        let target = worktree.fetch(&remote, &fixture.base_branch).unwrap();

        let additions = vec![Trailer::new("Tested-by", "Merganser Bot <bot@example.com>")];
        let new_head = worktree.rebase(&source, &target, &additions).unwrap();
        // Source already sits on the target tip and carries the trailer:
        // nothing should be rewritten.
        assert_eq!(new_head, source);
    }

    #[test]
    fn force_with_lease_detects_remote_movement() {
        let Some(fixture) = GitFixture::new() else {
            return;
        };
        fixture.seed_commit("feat-e", "e.txt", "e\n", "add e");

        let worktree = open_worktree(&fixture);
        let remote = fixture.remote_url();
        let old_tip = worktree.fetch(&remote, "feat-e").unwrap();

        // Another writer moves the branch under us.
        fixture.seed_commit("feat-e", "e.txt", "someone else\n", "rewrite e");

        let target = worktree.fetch(&remote, &fixture.base_branch).unwrap();
        let rebased = worktree.rebase(&old_tip, &target, &[]).unwrap();
        let error = worktree
            .push(
                &remote,
                &rebased,
                "feat-e",
                PushMode::ForceWithLease { expected: &old_tip },
            )
            .unwrap_err();
        assert!(matches!(error, GitError::RemoteMoved { .. }));
    }

    #[test]
    fn fast_forward_push_advances_remote() {
        let Some(fixture) = GitFixture::new() else {
            return;
        };
        fixture.seed_commit("feat-f", "f.txt", "f\n", "add f");

        let worktree = open_worktree(&fixture);
        let remote = fixture.remote_url();
        let feature = worktree.fetch(&remote, "feat-f").unwrap();
        let base = worktree.fetch(&remote, &fixture.base_branch).unwrap();
        let rebased = worktree.rebase(&feature, &base, &[]).unwrap();

        worktree
            .push(&remote, &rebased, &fixture.base_branch, PushMode::FastForward)
            .unwrap();
        let new_tip = fixture.remote_tip(&fixture.base_branch);
        assert_eq!(new_tip, rebased);
        assert!(worktree.is_ancestor(&base, &new_tip).unwrap());
    }

    #[test]
    fn non_fast_forward_push_is_remote_moved() {
        let Some(fixture) = GitFixture::new() else {
            return;
        };
        let base = fixture.base_branch.clone();
        fixture.seed_commit(&base, "g.txt", "g\n", "advance base");

        let worktree = open_worktree(&fixture);
        let remote = fixture.remote_url();
        let tip = worktree.fetch(&remote, &fixture.base_branch).unwrap();
        let parent = worktree.rev_parse(&format!("{tip}~1")).unwrap();

        let error = worktree
            .push(&remote, &parent, &fixture.base_branch, PushMode::FastForward)
            .unwrap_err();
        assert!(matches!(error, GitError::RemoteMoved { .. }));
    }

    #[test]
    fn git_failures_carry_stderr_detail() {
        let version = Command::new("git").arg("--version").output();
        if version.map(|v| !v.status.success()).unwrap_or(true) {
            return;
        }
        let Some(fixture) = GitFixture::new() else {
            return;
        };
        let worktree = open_worktree(&fixture);
        let error = worktree.fetch(&fixture.remote_url(), "no-such-branch").unwrap_err();
        match error {
            GitError::CommandFailed { command, detail } => {
                assert_eq!(command, "fetch");
                assert!(!detail.is_empty());
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }
}
