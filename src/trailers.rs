//! Commit-message trailer rewriting.
//!
//! Rebasing with attribution enabled rewrites each commit message to carry
//! `Reviewed-by:` / `Tested-by:` / `Part-of:` trailers. Rather than parse
//! trailer blocks by hand, the message is piped through
//! `git interpret-trailers`, which knows the real block rules (existing
//! trailers and sign-offs preserved, prose paragraphs left alone).
//! Additions are sorted and de-duplicated before they are passed, and
//! `--if-exists addIfDifferent` makes the rewrite idempotent — which keeps
//! rebases of already-annotated commits sha-stable.

use std::io::Write;
use std::process::{Command, Stdio};

use thiserror::Error;

use crate::gitlab::User;

#[derive(Debug, Error)]
pub enum TrailerError {
    /// Attribution needs an address to point at; a missing one is an
    /// explicit failure, never a silent fallback.
    #[error("approver {username} has no public email")]
    MissingEmail { username: String },

    #[error("git interpret-trailers failed: {detail}")]
    Rewrite { detail: String },

    #[error("failed to run git interpret-trailers: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Trailer {
    pub key: String,
    pub value: String,
}

impl Trailer {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    fn render(&self) -> String {
        format!("{}: {}", self.key, self.value)
    }
}

/// `Reviewed-by` trailers for each approver, sorted by name.
pub fn reviewed_by(approvers: &[User]) -> Result<Vec<Trailer>, TrailerError> {
    let mut trailers = Vec::with_capacity(approvers.len());
    for approver in approvers {
        let email = approver
            .email
            .as_deref()
            .filter(|email| !email.is_empty())
            .ok_or_else(|| TrailerError::MissingEmail {
                username: approver.username.clone(),
            })?;
        trailers.push(Trailer::new(
            "Reviewed-by",
            format!("{} <{}>", approver.name, email),
        ));
    }
    trailers.sort();
    Ok(trailers)
}

/// `Tested-by` trailer for the bot account.
pub fn tested_by(bot: &User) -> Result<Trailer, TrailerError> {
    let email = bot
        .email
        .as_deref()
        .filter(|email| !email.is_empty())
        .ok_or_else(|| TrailerError::MissingEmail {
            username: bot.username.clone(),
        })?;
    Ok(Trailer::new("Tested-by", format!("{} <{}>", bot.name, email)))
}

/// `Part-of` trailer pointing back at the merge request.
pub fn part_of(mr_url: &str) -> Trailer {
    Trailer::new("Part-of", format!("<{mr_url}>"))
}

/// Rewrite `message` through `git interpret-trailers`, appending any of
/// `additions` not already present.
///
/// Additions are appended sorted and de-duplicated; key comparison is
/// git's (case-insensitive), value comparison exact. Re-applying the
/// same additions returns the message unchanged.
pub fn rewrite_message(message: &str, additions: &[Trailer]) -> Result<String, TrailerError> {
    if additions.is_empty() || message.trim().is_empty() {
        return Ok(message.to_string());
    }

    let mut wanted: Vec<&Trailer> = additions.iter().collect();
    wanted.sort();
    wanted.dedup();

    let mut command = Command::new("git");
    command.args([
        "interpret-trailers",
        "--no-divider",
        "--where",
        "end",
        "--if-exists",
        "addIfDifferent",
    ]);
    for trailer in wanted {
        command.arg("--trailer").arg(trailer.render());
    }

    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    child
        .stdin
        .take()
        .ok_or_else(|| TrailerError::Rewrite {
            detail: "no stdin handle".to_string(),
        })?
        .write_all(message.as_bytes())?;
    let output = child.wait_with_output()?;

    if !output.status.success() {
        let detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(TrailerError::Rewrite {
            detail: if detail.is_empty() {
                "unknown git error".to_string()
            } else {
                detail
            },
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
