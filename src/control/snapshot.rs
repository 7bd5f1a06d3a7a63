//! Task/Agent Snapshot Reader.

use std::collections::HashMap;

use anyhow::Result;

use super::db::ControlDb;
use super::models::{Agent, Task};

/// Active tasks plus every agent, indexed by id. Read-only.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// DOING and BLOCKED tasks: status ascending, priority descending, most
    /// recently updated first.
    pub tasks: Vec<Task>,
    pub agents: HashMap<String, Agent>,
}

impl Snapshot {
    pub fn take(db: &ControlDb, workspace_id: Option<&str>) -> Result<Self> {
        let tasks = db.list_active_tasks(workspace_id)?;
        let agents = db
            .list_agents(None)?
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect();
        Ok(Self { tasks, agents })
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn agent(&self, id: &str) -> Option<&Agent> {
        self.agents.get(id)
    }

    /// Display name of a task's owner, `Unassigned` when it has none or the
    /// owner id does not resolve.
    pub fn owner_name(&self, task: &Task) -> &str {
        task.owner_agent_id
            .as_deref()
            .and_then(|id| self.agent(id))
            .map(|a| a.name.as_str())
            .unwrap_or("Unassigned")
    }

    /// One line per task: `[STATUS] Title (prio N) — owner: Name`.
    pub fn render(&self) -> String {
        self.tasks
            .iter()
            .map(|t| {
                format!(
                    "[{}] {} (prio {}) — owner: {}",
                    t.status,
                    t.title,
                    t.priority,
                    self.owner_name(t)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Split active tasks into unassigned ones and per-owner batches. Owner
    /// batches keep first-appearance order so processing is deterministic.
    pub fn partition(&self) -> (Vec<&Task>, Vec<(String, Vec<&Task>)>) {
        let mut unassigned = Vec::new();
        let mut owners: Vec<(String, Vec<&Task>)> = Vec::new();
        for task in &self.tasks {
            match task.owner_agent_id.as_deref() {
                None => unassigned.push(task),
                Some(owner) => match owners.iter_mut().find(|(id, _)| id == owner) {
                    Some((_, batch)) => batch.push(task),
                    None => owners.push((owner.to_string(), vec![task])),
                },
            }
        }
        (unassigned, owners)
    }
}
