//! Owner-Update Parser.
//!
//! Turns a free-text agent reply into structured per-task updates. The
//! expected reply is zero or more segments separated by a `---` line, each
//! segment a run of `key: value` lines:
//!
//! ```text
//! task_title: Fix bug
//! status: in progress
//! next_step: add regression test
//! blockers: none
//! ---
//! task_title: Ship release
//! status: blocked
//! blockers: waiting on review
//! ```
//!
//! Parsing is lossy and total: unknown keys and lines without a colon are
//! dropped, segments with no recognised key disappear, and no input makes
//! it fail.

use serde::{Deserialize, Serialize};

/// Segment separator.
const DELIMITER: &str = "---";

/// Blocker values that mean "nothing is blocking".
const NO_BLOCKER_VALUES: [&str; 4] = ["none", "n/a", "na", "no"];

/// One parsed segment. Only keys present in the reply are `Some`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blockers: Option<String>,
}

impl OwnerUpdate {
    fn is_empty(&self) -> bool {
        self.task_title.is_none()
            && self.current_task.is_none()
            && self.status.is_none()
            && self.next_step.is_none()
            && self.blockers.is_none()
    }

    /// Case-insensitive exact match on `task_title`.
    pub fn matches_title(&self, title: &str) -> bool {
        self.task_title
            .as_deref()
            .is_some_and(|t| t.to_lowercase() == title.to_lowercase())
    }

    /// True when `blockers` carries a real blocker rather than an empty value
    /// or one of `none`, `n/a`, `na`, `no`.
    pub fn is_blocked(&self) -> bool {
        match self.blockers.as_deref().map(str::trim) {
            None | Some("") => false,
            Some(b) => !NO_BLOCKER_VALUES.contains(&b.to_lowercase().as_str()),
        }
    }

    fn set(&mut self, key: &str, value: String) {
        match key.to_lowercase().as_str() {
            "task_title" => self.task_title = Some(value),
            "current_task" => self.current_task = Some(value),
            "status" => self.status = Some(value),
            "next_step" => self.next_step = Some(value),
            "blockers" => self.blockers = Some(value),
            _ => {}
        }
    }
}

/// Parse an agent reply into per-task updates, in input order.
pub fn parse_owner_updates(text: &str) -> Vec<OwnerUpdate> {
    let mut updates = Vec::new();
    let mut current = OwnerUpdate::default();

    for line in text.lines() {
        let line = line.trim();
        if line == DELIMITER {
            if !current.is_empty() {
                updates.push(std::mem::take(&mut current));
            }
            current = OwnerUpdate::default();
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        current.set(key.trim(), value.trim().to_string());
    }

    if !current.is_empty() {
        updates.push(current);
    }
    updates
}

/// Render the reply format requested from an owner, one block per task.
pub fn reply_template<'a>(titles: impl IntoIterator<Item = &'a str>) -> String {
    titles
        .into_iter()
        .map(|title| {
            format!(
                "task_title: {}\ncurrent_task: <what you are doing>\nstatus: <short status>\nnext_step: <next concrete step>\nblockers: <blockers or none>",
                title
            )
        })
        .collect::<Vec<_>>()
        .join(&format!("\n{}\n", DELIMITER))
}
