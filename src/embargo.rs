//! Merge embargoes.
//!
//! Two kinds of embargo keep the bot's hands off a merge request:
//! - branch embargoes: a regex on the target branch name
//!   (`branch=release/.*`),
//! - time windows: a cron expression plus a duration
//!   (`0 0 22 * * Fri *;8h` — every Friday 22:00 for eight hours).
//!
//! Both come from the `embargo` option and are evaluated during
//! validation, so an embargoed MR is refused before any branch is touched.

use std::str::FromStr;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use regex::Regex;

const BRANCH_PREFIX: &str = "branch=";

pub struct EmbargoWindow {
    schedule: Schedule,
    duration: Duration,
    source: String,
}

#[derive(Default)]
pub struct EmbargoSet {
    branches: Vec<Regex>,
    windows: Vec<EmbargoWindow>,
}

impl EmbargoSet {
    /// Parse embargo entries from config.
    ///
    /// Each entry is either `branch=<regex>` or `<cron>;<duration>` with a
    /// duration like `45m`, `8h` or `2d`. Regexes match anywhere in the
    /// branch name; anchor explicitly for exact matches.
    pub fn parse(entries: &[String]) -> Result<Self> {
        let mut set = Self::default();
        for entry in entries {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if let Some(pattern) = entry.strip_prefix(BRANCH_PREFIX) {
                let regex = Regex::new(pattern)
                    .with_context(|| format!("bad embargo branch pattern '{pattern}'"))?;
                set.branches.push(regex);
                continue;
            }

            let Some((expression, duration_text)) = entry.rsplit_once(';') else {
                bail!(
                    "bad embargo entry '{entry}': expected 'branch=<regex>' or '<cron>;<duration>'"
                );
            };
            let schedule = Schedule::from_str(expression.trim())
                .with_context(|| format!("bad embargo cron expression '{expression}'"))?;
            let duration = parse_duration(duration_text.trim())
                .with_context(|| format!("bad embargo duration '{duration_text}'"))?;
            set.windows.push(EmbargoWindow {
                schedule,
                duration,
                source: entry.to_string(),
            });
        }
        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty() && self.windows.is_empty()
    }

    /// Permanent embargo on `branch`, if its name matches a pattern.
    pub fn branch_embargo(&self, branch: &str) -> Option<String> {
        self.branches
            .iter()
            .find(|regex| regex.is_match(branch))
            .map(|_| format!("target branch {branch} is embargoed"))
    }

    /// Time-window embargo active at `now`, if any.
    pub fn window_embargo(&self, now: DateTime<Utc>) -> Option<String> {
        for window in &self.windows {
            let lookback = now - window.duration;
            let active = window
                .schedule
                .after(&lookback)
                .take_while(|fire| *fire <= now)
                .any(|fire| fire + window.duration > now);
            if active {
                return Some(format!("merges are embargoed ({})", window.source));
            }
        }
        None
    }

    /// The active embargo for `branch` at `now`, if any, as a
    /// human-readable reason.
    pub fn active_embargo(&self, branch: &str, now: DateTime<Utc>) -> Option<String> {
        self.branch_embargo(branch)
            .or_else(|| self.window_embargo(now))
    }
}

fn parse_duration(text: &str) -> Result<Duration> {
    if text.len() < 2 {
        bail!("too short");
    }
    let (amount, unit) = text.split_at(text.len() - 1);
    let amount: i64 = amount.parse().context("not a number")?;
    let duration = match unit {
        "s" => Duration::seconds(amount),
        "m" => Duration::minutes(amount),
        "h" => Duration::hours(amount),
        "d" => Duration::days(amount),
        other => bail!("unknown unit '{other}' (expected s/m/h/d)"),
    };
    if duration <= Duration::zero() {
        bail!("duration must be positive");
    }
    Ok(duration)
}
