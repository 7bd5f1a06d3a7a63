//! War Room Orchestrator.
//!
//! One run walks every active task's owner through a status round and
//! records the whole exchange as a WAR_ROOM conversation:
//!
//! ```text
//! STARTED → SNAPSHOT_TAKEN ─┬─ EMPTY_EXIT
//!                           └─ PER_OWNER_PROCESSING → DECISION_SYNTHESIZED
//!                                → PERSISTED → NOTIFIED (best-effort) → DONE
//! ```
//!
//! Each step commits on its own; a failure part-way leaves earlier turns and
//! status changes in place. Gateway failures never abort the run: they are
//! written to the transcript as `system` turns (per owner) or onto the run
//! record (notification). Concurrent runs are not serialised against each
//! other, so two runs touching one task race on its status (last write wins).

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::audit::Actor;
use super::db::DbHandle;
use super::gateway::{
    AgentGateway, MessagingGateway, OpenClawClient, PollPolicy, TelegramTarget, notify,
    poll_for_reply,
};
use super::models::*;
use super::parser::{OwnerUpdate, parse_owner_updates, reply_template};
use super::snapshot::Snapshot;
use crate::config::Settings;
use crate::errors::ControlError;

const OBJECTIVE: &str = "War room started. Objective: get a current status from the owner of every DOING or BLOCKED task, agree on task moves, and post one summary.";
const EMPTY_MESSAGE: &str = "No active tasks (DOING or BLOCKED). Nothing to review; closing the war room.";

const POLICY_DECISIONS: [&str; 2] = [
    "Every active task needs exactly one owner; unowned work returns to READY until someone takes it.",
    "Blocked tasks are assumed unblocked after this check-in and move back to DOING unless an owner reports a live blocker.",
];
const FINAL_ANSWER: &str = "War room complete. Owners have reported in; see the decision log for proposed and applied task moves.";

const NEEDS_OWNER: &str = "Needs owner";
const ASSUME_UNBLOCK: &str = "Assume unblock after check";

/// How the best-effort notification ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NotificationOutcome {
    Sent { message_id: Option<String> },
    Failed { error: String },
    /// Empty runs post nothing.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarRoomOutcome {
    pub conversation_id: String,
    /// `None` for an empty run.
    pub run_id: Option<String>,
    pub decision: Option<DecisionDocument>,
    pub notification: NotificationOutcome,
}

/// A configured orchestrator. Cheap to build per run.
#[derive(Clone)]
pub struct WarRoom {
    db: DbHandle,
    agents: Option<Arc<dyn AgentGateway>>,
    messenger: Option<Arc<dyn MessagingGateway>>,
    apply_moves: bool,
    poll: PollPolicy,
    telegram: TelegramTarget,
    workspace_id: Option<String>,
    actor: Actor,
}

impl WarRoom {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            agents: None,
            messenger: None,
            apply_moves: false,
            poll: PollPolicy::default(),
            telegram: TelegramTarget::default(),
            workspace_id: None,
            actor: Actor::war_room(),
        }
    }

    pub fn with_agent_gateway(mut self, gateway: Arc<dyn AgentGateway>) -> Self {
        self.agents = Some(gateway);
        self
    }

    pub fn with_messenger(mut self, messenger: Arc<dyn MessagingGateway>) -> Self {
        self.messenger = Some(messenger);
        self
    }

    pub fn apply_moves(mut self, apply: bool) -> Self {
        self.apply_moves = apply;
        self
    }

    pub fn poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll = policy;
        self
    }

    pub fn telegram(mut self, target: TelegramTarget) -> Self {
        self.telegram = target;
        self
    }

    pub fn scoped_to(mut self, workspace_id: Option<String>) -> Self {
        self.workspace_id = workspace_id;
        self
    }

    /// Build an orchestrator from settings, optionally scoped to a workspace.
    /// A workspace's enabled gateway and Telegram chat take precedence over
    /// the process-wide ones.
    pub async fn configure(db: DbHandle, settings: &Settings, workspace_id: Option<&str>) -> Result<Self> {
        let mut url = settings.openclaw_gateway_url.clone();
        let mut token = settings.openclaw_gateway_token.clone();
        let mut telegram = settings.telegram_target();

        if let Some(ws_id) = workspace_id {
            let id = ws_id.to_string();
            let (workspace, gateway) = db
                .call(move |db| {
                    let Some(ws) = db.get_workspace(&id)? else {
                        return Err(ControlError::WorkspaceNotFound { id }.into());
                    };
                    let gateway = match ws.gateway_id.as_deref() {
                        Some(gid) => db.get_gateway(gid)?,
                        None => None,
                    };
                    Ok((ws, gateway))
                })
                .await?;
            if let Some(gw) = gateway.filter(|g| g.enabled) {
                url = Some(gw.url);
                token = Some(gw.token);
            }
            if workspace.telegram_chat_id.is_some() {
                telegram = TelegramTarget {
                    chat_id: workspace.telegram_chat_id,
                    topic_id: workspace.telegram_topic_id,
                };
            }
        }

        let mut war_room = Self::new(db)
            .apply_moves(settings.apply_war_room_moves)
            .poll_policy(settings.poll_policy())
            .telegram(telegram)
            .scoped_to(workspace_id.map(str::to_string));

        match OpenClawClient::from_parts(url.as_deref(), token.as_deref()) {
            Ok(Some(client)) => {
                let client = Arc::new(client);
                war_room = war_room
                    .with_agent_gateway(client.clone())
                    .with_messenger(client);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to build gateway client; running without one"),
        }
        Ok(war_room)
    }

    /// Run the procedure once. Only store failures are returned as errors;
    /// gateway trouble ends up in the transcript or on the run record.
    pub async fn run(&self) -> Result<WarRoomOutcome> {
        // STARTED
        let workspace_id = self.workspace_id.clone();
        let conversation = self
            .db
            .call(move |db| {
                db.create_conversation(&NewConversation {
                    kind: ConversationType::WarRoom,
                    task_id: None,
                    workspace_id,
                })
            })
            .await?;
        let conversation_id = conversation.id;
        tracing::info!(conversation_id = %conversation_id, apply_moves = self.apply_moves, "War room started");
        self.say(&conversation_id, NewTurn::new(SpeakerType::Chair, OBJECTIVE))
            .await?;

        // SNAPSHOT_TAKEN
        let scope = self.workspace_id.clone();
        let snapshot = self
            .db
            .call(move |db| Snapshot::take(db, scope.as_deref()))
            .await?;

        if snapshot.is_empty() {
            self.say(&conversation_id, NewTurn::new(SpeakerType::Chair, EMPTY_MESSAGE))
                .await?;
            tracing::info!(conversation_id = %conversation_id, "No active tasks; war room closed early");
            return Ok(WarRoomOutcome {
                conversation_id,
                run_id: None,
                decision: None,
                notification: NotificationOutcome::Skipped,
            });
        }

        self.say(
            &conversation_id,
            NewTurn::new(
                SpeakerType::Chair,
                format!("Active task snapshot:\n{}", snapshot.render()),
            ),
        )
        .await?;

        // PER_OWNER_PROCESSING
        let (unassigned, owners) = snapshot.partition();
        for task in unassigned {
            self.say(
                &conversation_id,
                NewTurn::new(
                    SpeakerType::Chair,
                    format!("\"{}\" has no owner. Who takes it?", task.title),
                ),
            )
            .await?;
            self.say(
                &conversation_id,
                NewTurn::new(
                    SpeakerType::System,
                    format!("No agent is assigned to \"{}\"; it stays unassigned this round.", task.title),
                ),
            )
            .await?;
        }

        for (owner_id, tasks) in &owners {
            match snapshot.agent(owner_id) {
                Some(agent) => self.process_owner(&conversation_id, agent, tasks).await?,
                None => {
                    self.say(
                        &conversation_id,
                        NewTurn::new(
                            SpeakerType::System,
                            format!("Owner {} no longer exists; skipped.", owner_id),
                        ),
                    )
                    .await?
                }
            }
        }

        // DECISION_SYNTHESIZED
        let task_ids: Vec<String> = snapshot.tasks.iter().map(|t| t.id.clone()).collect();
        let (proposed, applied) = self.review_moves(task_ids).await?;
        let decision = DecisionDocument {
            decisions: POLICY_DECISIONS.iter().map(|s| s.to_string()).collect(),
            proposed_task_moves: proposed,
            applied_task_moves: applied,
            final_answer_for_telegram: FINAL_ANSWER.to_string(),
        };
        let decision_json = serde_json::to_value(&decision)?;
        self.say(
            &conversation_id,
            NewTurn::new(
                SpeakerType::Chair,
                format!(
                    "Decision:\n```json\n{}\n```",
                    serde_json::to_string_pretty(&decision_json)?
                ),
            )
            .with_tool_events(decision_json),
        )
        .await?;

        // PERSISTED
        let (actor, convo, scope, doc) = (
            self.actor.clone(),
            conversation_id.clone(),
            self.workspace_id.clone(),
            decision.clone(),
        );
        let run = self
            .db
            .call(move |db| db.create_war_room_run(&actor, &convo, scope.as_deref(), &doc))
            .await?;

        // NOTIFIED
        let notification = self.deliver(&run.id, &decision.final_answer_for_telegram).await?;
        tracing::info!(
            conversation_id = %conversation_id,
            run_id = %run.id,
            proposed = decision.proposed_task_moves.len(),
            applied = decision.applied_task_moves.len(),
            "War room finished"
        );

        Ok(WarRoomOutcome {
            conversation_id,
            run_id: Some(run.id),
            decision: Some(decision),
            notification,
        })
    }

    async fn process_owner(&self, conversation_id: &str, agent: &Agent, tasks: &[&Task]) -> Result<()> {
        let listing = tasks
            .iter()
            .map(|t| format!("- [{}] {} (prio {})", t.status, t.title, t.priority))
            .collect::<Vec<_>>()
            .join("\n");
        self.say(
            conversation_id,
            NewTurn::new(
                SpeakerType::Chair,
                format!(
                    "{}, report on your active tasks:\n{}\nReply with one block per task, separated by ---:\n{}",
                    agent.name,
                    listing,
                    reply_template(tasks.iter().map(|t| t.title.as_str()))
                ),
            ),
        )
        .await?;

        let Some(remote_id) = agent.openclaw_agent_id.as_deref().filter(|r| !r.is_empty()) else {
            self.say(
                conversation_id,
                NewTurn::new(
                    SpeakerType::System,
                    format!("{} has no OpenClaw agent linked; using a mocked reply.", agent.name),
                ),
            )
            .await?;
            self.say(
                conversation_id,
                NewTurn::new(SpeakerType::Agent, mocked_reply(tasks)).by(&agent.id),
            )
            .await?;
            return Ok(());
        };

        let Some(gateway) = self.agents.as_deref() else {
            self.say(
                conversation_id,
                NewTurn::new(
                    SpeakerType::System,
                    format!(
                        "{} is linked to OpenClaw agent '{}', but no gateway is configured (OPENCLAW_GATEWAY_URL/TOKEN). Skipped.",
                        agent.name, remote_id
                    ),
                ),
            )
            .await?;
            return Ok(());
        };

        let prompt = build_prompt(agent, tasks);
        let label = format!("war-room:{}", agent.name);
        let reply = match gateway.spawn(&prompt, &label, remote_id).await {
            Ok(session_key) => poll_for_reply(gateway, &session_key, &self.poll).await,
            Err(e) => Err(e),
        };

        match reply {
            Ok(Some(text)) => {
                self.say(
                    conversation_id,
                    NewTurn::new(SpeakerType::Agent, text.clone()).by(&agent.id),
                )
                .await?;
                self.absorb_reply(agent, tasks, &text).await?;
            }
            Ok(None) => {
                self.say(
                    conversation_id,
                    NewTurn::new(
                        SpeakerType::System,
                        format!(
                            "No reply from {} after {} attempts; no changes made.",
                            agent.name, self.poll.max_attempts
                        ),
                    ),
                )
                .await?;
            }
            Err(e) => {
                tracing::warn!(agent_id = %agent.id, error = %e, "Owner update failed");
                self.say(
                    conversation_id,
                    NewTurn::new(
                        SpeakerType::System,
                        format!("Gateway error while asking {}: {}", agent.name, e),
                    ),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Fold a live reply into the owner's work state and, when enabled, into
    /// the statuses of the tasks it names.
    async fn absorb_reply(&self, agent: &Agent, tasks: &[&Task], text: &str) -> Result<()> {
        let updates = parse_owner_updates(text);
        let Some(representative) = representative_task(tasks) else {
            return Ok(());
        };
        let Some(update) = updates
            .iter()
            .find(|u| u.matches_title(&representative.title))
            .or_else(|| updates.first())
        else {
            tracing::debug!(agent_id = %agent.id, "Reply had no parseable updates");
            return Ok(());
        };

        let state = WorkStateUpdate {
            current_task_id: Some(representative.id.clone()),
            status: update.status.clone(),
            next_step: update.next_step.clone(),
            blockers: update.blockers.clone(),
        };
        let (actor, agent_id) = (self.actor.clone(), agent.id.clone());
        self.db
            .call(move |db| db.upsert_work_state(&actor, &agent_id, &state))
            .await?;

        if !self.apply_moves {
            return Ok(());
        }
        for update in &updates {
            let Some(task) = tasks.iter().find(|t| update.matches_title(&t.title)) else {
                continue;
            };
            let (actor, task_id, update) = (self.actor.clone(), task.id.clone(), update.clone());
            self.db
                .call(move |db| {
                    let Some(current) = db.get_task(&task_id)? else {
                        return Ok(());
                    };
                    if let Some(next) = reported_status(current.status, &update) {
                        db.set_task_status(&actor, &task_id, next)?;
                    }
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    /// Propose moves from the tasks' current state and apply them when
    /// enabled. Returns `(proposed, applied)`.
    async fn review_moves(&self, task_ids: Vec<String>) -> Result<(Vec<TaskMove>, Vec<TaskMove>)> {
        let actor = self.actor.clone();
        let apply = self.apply_moves;
        self.db
            .call(move |db| {
                let mut proposed = Vec::new();
                for id in &task_ids {
                    if let Some(task) = db.get_task(id)?
                        && let Some(mv) = propose_move(&task)
                    {
                        proposed.push(mv);
                    }
                }

                let mut applied = Vec::new();
                if apply {
                    for mv in &proposed {
                        let Some(current) = db.get_task(&mv.task_id)? else {
                            continue;
                        };
                        if current.status == TaskStatus::Done {
                            continue;
                        }
                        if db.set_task_status(&actor, &mv.task_id, mv.to)?.is_some() {
                            applied.push(mv.clone());
                        }
                    }
                }
                Ok((proposed, applied))
            })
            .await
    }

    async fn deliver(&self, run_id: &str, text: &str) -> Result<NotificationOutcome> {
        let result = notify(self.messenger.as_deref(), &self.telegram, text).await;
        let (record, outcome) = match result {
            Ok(message_id) => (
                DeliveryRecord {
                    target: self.telegram.chat_id.clone(),
                    thread_id: self.telegram.topic_id.clone(),
                    message_id: message_id.clone(),
                    error: None,
                },
                NotificationOutcome::Sent { message_id },
            ),
            Err(e) => {
                tracing::warn!(run_id, error = %e, "War room notification failed");
                (
                    DeliveryRecord {
                        target: self.telegram.chat_id.clone(),
                        thread_id: self.telegram.topic_id.clone(),
                        message_id: None,
                        error: Some(e.to_string()),
                    },
                    NotificationOutcome::Failed {
                        error: e.to_string(),
                    },
                )
            }
        };
        let run_id = run_id.to_string();
        self.db
            .call(move |db| db.record_delivery(&run_id, &record))
            .await?;
        Ok(outcome)
    }

    async fn say(&self, conversation_id: &str, turn: NewTurn) -> Result<()> {
        let id = conversation_id.to_string();
        self.db.call(move |db| db.append_turn(&id, &turn)).await?;
        Ok(())
    }
}

/// Highest priority wins; ties go to the lexicographically smaller title,
/// then the smaller id.
fn representative_task<'a>(tasks: &[&'a Task]) -> Option<&'a Task> {
    tasks.iter().copied().min_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.title.cmp(&b.title))
            .then_with(|| a.id.cmp(&b.id))
    })
}

/// Status an owner's report implies for a task, or `None` to leave it.
/// DONE is never regressed.
fn reported_status(current: TaskStatus, update: &OwnerUpdate) -> Option<TaskStatus> {
    if current == TaskStatus::Done {
        return None;
    }
    let next = if update.is_blocked() {
        TaskStatus::Blocked
    } else {
        TaskStatus::Doing
    };
    (next != current).then_some(next)
}

fn propose_move(task: &Task) -> Option<TaskMove> {
    let (to, reason) = if task.owner_agent_id.is_none() {
        (TaskStatus::Ready, NEEDS_OWNER)
    } else if task.status == TaskStatus::Blocked {
        (TaskStatus::Doing, ASSUME_UNBLOCK)
    } else {
        return None;
    };
    Some(TaskMove {
        task_id: task.id.clone(),
        from: task.status,
        to,
        reason: reason.to_string(),
    })
}

fn mocked_reply(tasks: &[&Task]) -> String {
    tasks
        .iter()
        .map(|t| {
            format!(
                "task_title: {}\ncurrent_task: {}\nstatus: (mock) no live update\nnext_step: (mock) link an OpenClaw agent for live replies\nblockers: none",
                t.title, t.title
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

fn build_prompt(agent: &Agent, tasks: &[&Task]) -> String {
    let mut prompt = format!(
        "You are {} ({}). The war room needs a status update on your active tasks.\n\nTasks:\n",
        agent.name, agent.role
    );
    for task in tasks {
        prompt.push_str(&format!(
            "- {} [{}, prio {}]\n  {}\n",
            task.title,
            task.status,
            task.priority,
            task.description.as_deref().unwrap_or("(no description)")
        ));
    }
    prompt.push_str("\nReply with exactly one block per task, separated by a line containing only ---, in this format:\n\n");
    prompt.push_str(&reply_template(tasks.iter().map(|t| t.title.as_str())));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::control::db::ControlDb;
    use crate::control::gateway::{GatewayError, HistoryMessage};

    enum Behaviour {
        Reply(&'static str),
        Silent,
        SpawnFails,
    }

    /// Session keys are the remote agent ids.
    #[derive(Default)]
    struct FakeAgents {
        behaviours: HashMap<String, Behaviour>,
        spawned: Mutex<Vec<(String, String)>>,
        on_spawn: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl FakeAgents {
        fn with(mut self, remote_id: &str, behaviour: Behaviour) -> Self {
            self.behaviours.insert(remote_id.to_string(), behaviour);
            self
        }
    }

    #[async_trait]
    impl AgentGateway for FakeAgents {
        async fn spawn(&self, prompt: &str, _label: &str, agent_id: &str) -> Result<String, GatewayError> {
            if let Some(hook) = self.on_spawn.lock().unwrap().take() {
                hook();
            }
            self.spawned
                .lock()
                .unwrap()
                .push((agent_id.to_string(), prompt.to_string()));
            match self.behaviours.get(agent_id) {
                Some(Behaviour::SpawnFails) => Err(GatewayError::Rejected {
                    status: 502,
                    body: "bad gateway".into(),
                }),
                _ => Ok(agent_id.to_string()),
            }
        }

        async fn fetch_history(&self, session_key: &str, _: u32, _: bool) -> Result<Vec<HistoryMessage>, GatewayError> {
            let mut history = vec![HistoryMessage::new("user", "prompt")];
            if let Some(Behaviour::Reply(text)) = self.behaviours.get(session_key) {
                history.push(HistoryMessage::new("assistant", text));
            }
            Ok(history)
        }
    }

    #[derive(Default)]
    struct FakeMessenger {
        fail: bool,
        sent: Mutex<Vec<(String, String, String, Option<String>)>>,
    }

    #[async_trait]
    impl MessagingGateway for FakeMessenger {
        async fn send(&self, channel: &str, target: &str, text: &str, thread_id: Option<&str>) -> Result<Option<String>, GatewayError> {
            if self.fail {
                return Err(GatewayError::ToolFailed {
                    tool: "message".into(),
                    detail: "chat not found".into(),
                });
            }
            self.sent.lock().unwrap().push((
                channel.to_string(),
                target.to_string(),
                text.to_string(),
                thread_id.map(str::to_string),
            ));
            Ok(Some("m-1".into()))
        }
    }

    fn handle() -> DbHandle {
        DbHandle::new(ControlDb::new_in_memory().unwrap())
    }

    fn fast() -> PollPolicy {
        PollPolicy {
            max_attempts: 3,
            interval: Duration::ZERO,
            history_limit: 10,
        }
    }

    fn agent(db: &DbHandle, name: &str, remote: Option<&str>) -> Agent {
        let mut new = NewAgent::named(name, "Engineer");
        new.openclaw_agent_id = remote.map(str::to_string);
        db.lock_sync()
            .unwrap()
            .create_agent(&Actor::operator(), &new)
            .unwrap()
    }

    fn task(db: &DbHandle, title: &str, status: TaskStatus, priority: i64, owner: Option<&Agent>) -> Task {
        db.lock_sync()
            .unwrap()
            .create_task(
                &Actor::operator(),
                &NewTask {
                    title: title.into(),
                    status: Some(status),
                    priority,
                    owner_agent_id: owner.map(|a| a.id.clone()),
                    ..NewTask::default()
                },
            )
            .unwrap()
    }

    fn turns(db: &DbHandle, conversation_id: &str) -> Vec<Turn> {
        db.lock_sync().unwrap().list_turns(conversation_id).unwrap()
    }

    fn status_of(db: &DbHandle, id: &str) -> TaskStatus {
        db.lock_sync().unwrap().get_task(id).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_empty_run_exits_early() {
        let db = handle();
        task(&db, "Someday", TaskStatus::Backlog, 1, None);

        let outcome = WarRoom::new(db.clone()).run().await.unwrap();
        assert!(outcome.run_id.is_none());
        assert_eq!(outcome.notification, NotificationOutcome::Skipped);

        let guard = db.lock_sync().unwrap();
        assert_eq!(guard.count_conversations(ConversationType::WarRoom).unwrap(), 1);
        let turns = guard.list_turns(&outcome.conversation_id).unwrap();
        assert_eq!(turns.len(), 2);
        assert!(turns.iter().all(|t| t.speaker_type == SpeakerType::Chair));
        assert!(guard.list_war_room_runs(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mocked_owner_end_to_end() {
        let db = handle();
        let alice = agent(&db, "Alice", None);
        let bug = task(&db, "Fix bug", TaskStatus::Blocked, 5, Some(&alice));

        let outcome = WarRoom::new(db.clone()).run().await.unwrap();
        let turns = turns(&db, &outcome.conversation_id);
        let speakers: Vec<_> = turns.iter().map(|t| t.speaker_type).collect();
        assert_eq!(
            speakers,
            vec![
                SpeakerType::Chair,
                SpeakerType::Chair,
                SpeakerType::Chair,
                SpeakerType::System,
                SpeakerType::Agent,
                SpeakerType::Chair,
            ]
        );
        assert!(turns[1].content.contains("[BLOCKED] Fix bug (prio 5) — owner: Alice"));
        assert!(turns[2].content.contains("Alice"));
        assert!(turns[3].content.contains("no OpenClaw agent"));
        assert!(turns[4].content.contains("Fix bug"));
        assert_eq!(turns[4].speaker_id.as_deref(), Some(alice.id.as_str()));

        let decision = turns[5].tool_events.clone().unwrap();
        assert_eq!(decision["proposed_task_moves"][0]["taskId"], bug.id.as_str());
        assert_eq!(decision["proposed_task_moves"][0]["from"], "BLOCKED");
        assert_eq!(decision["proposed_task_moves"][0]["to"], "DOING");
        assert!(turns[5].content.contains("\"final_answer_for_telegram\""));

        let run_id = outcome.run_id.unwrap();
        let run = db.lock_sync().unwrap().get_war_room_run(&run_id).unwrap().unwrap();
        assert!(run.decision.applied_task_moves.is_empty());
        assert_eq!(run.decision.proposed_task_moves.len(), 1);
        assert_eq!(run.final_answer, FINAL_ANSWER);
        // Mocked replies never touch state.
        assert_eq!(status_of(&db, &bug.id), TaskStatus::Blocked);
        assert!(db.lock_sync().unwrap().get_work_state(&alice.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unowned_task_moves_to_ready_when_applied() {
        let db = handle();
        let orphan = task(&db, "Orphan", TaskStatus::Doing, 2, None);

        let outcome = WarRoom::new(db.clone()).apply_moves(true).run().await.unwrap();
        let decision = outcome.decision.unwrap();
        assert_eq!(decision.proposed_task_moves.len(), 1);
        assert_eq!(decision.proposed_task_moves[0].to, TaskStatus::Ready);
        assert_eq!(decision.proposed_task_moves[0].reason, "Needs owner");
        assert_eq!(decision.applied_task_moves, decision.proposed_task_moves);
        assert_eq!(status_of(&db, &orphan.id), TaskStatus::Ready);

        let turns = turns(&db, &outcome.conversation_id);
        assert!(turns.iter().any(|t| t.speaker_type == SpeakerType::System
            && t.content.contains("No agent is assigned to \"Orphan\"")));
    }

    #[tokio::test]
    async fn test_live_reply_updates_work_state_only_when_advisory() {
        let db = handle();
        let bob = agent(&db, "Bob", Some("bob-remote"));
        let fix = task(&db, "Fix", TaskStatus::Blocked, 5, Some(&bob));
        let ship = task(&db, "Ship", TaskStatus::Doing, 3, Some(&bob));
        let gateway = Arc::new(FakeAgents::default().with(
            "bob-remote",
            Behaviour::Reply("task_title: ship\nstatus: stuck\nblockers: waiting on review\n---\ntask_title: FIX\nstatus: unblocked\nnext_step: merge\nblockers: none"),
        ));

        let outcome = WarRoom::new(db.clone())
            .with_agent_gateway(gateway.clone())
            .poll_policy(fast())
            .run()
            .await
            .unwrap();

        let spawned = gateway.spawned.lock().unwrap().clone();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].0, "bob-remote");
        assert!(spawned[0].1.contains("Fix") && spawned[0].1.contains("Ship"));

        let state = db.lock_sync().unwrap().get_work_state(&bob.id).unwrap().unwrap();
        assert_eq!(state.current_task_id.as_deref(), Some(fix.id.as_str()));
        assert_eq!(state.status.as_deref(), Some("unblocked"));
        assert_eq!(state.next_step.as_deref(), Some("merge"));
        assert_eq!(state.blockers.as_deref(), Some("none"));

        assert_eq!(status_of(&db, &fix.id), TaskStatus::Blocked);
        assert_eq!(status_of(&db, &ship.id), TaskStatus::Doing);

        let turns = turns(&db, &outcome.conversation_id);
        assert!(turns.iter().any(|t| t.speaker_type == SpeakerType::Agent
            && t.content.starts_with("task_title: ship")));
    }

    #[tokio::test]
    async fn test_live_reply_applies_reported_statuses() {
        let db = handle();
        let bob = agent(&db, "Bob", Some("bob-remote"));
        let fix = task(&db, "Fix", TaskStatus::Blocked, 5, Some(&bob));
        let ship = task(&db, "Ship", TaskStatus::Doing, 3, Some(&bob));
        let gateway = Arc::new(FakeAgents::default().with(
            "bob-remote",
            Behaviour::Reply("task_title: Fix\nblockers: n/a\n---\ntask_title: Ship\nblockers: waiting on review"),
        ));

        let outcome = WarRoom::new(db.clone())
            .with_agent_gateway(gateway)
            .poll_policy(fast())
            .apply_moves(true)
            .run()
            .await
            .unwrap();

        assert_eq!(status_of(&db, &fix.id), TaskStatus::Doing);
        // Reported blocked, then the review pass assumes it unblocked.
        let decision = outcome.decision.unwrap();
        assert_eq!(decision.proposed_task_moves.len(), 1);
        assert_eq!(decision.proposed_task_moves[0].task_id, ship.id);
        assert_eq!(decision.proposed_task_moves[0].from, TaskStatus::Blocked);
        assert_eq!(status_of(&db, &ship.id), TaskStatus::Doing);
    }

    #[tokio::test]
    async fn test_done_is_never_regressed() {
        let db = handle();
        let bob = agent(&db, "Bob", Some("bob-remote"));
        let fix = task(&db, "Fix", TaskStatus::Blocked, 5, Some(&bob));

        let gateway = FakeAgents::default().with("bob-remote", Behaviour::Reply("task_title: Fix\nblockers: none"));
        let (hook_db, hook_id) = (db.clone(), fix.id.clone());
        *gateway.on_spawn.lock().unwrap() = Some(Box::new(move || {
            hook_db
                .lock_sync()
                .unwrap()
                .set_task_status(&Actor::operator(), &hook_id, TaskStatus::Done)
                .unwrap();
        }));

        let outcome = WarRoom::new(db.clone())
            .with_agent_gateway(Arc::new(gateway))
            .poll_policy(fast())
            .apply_moves(true)
            .run()
            .await
            .unwrap();

        assert_eq!(status_of(&db, &fix.id), TaskStatus::Done);
        let decision = outcome.decision.unwrap();
        assert!(decision.proposed_task_moves.is_empty());
        assert!(decision.applied_task_moves.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_reported_without_mutation() {
        let db = handle();
        let bob = agent(&db, "Bob", Some("bob-remote"));
        task(&db, "Fix", TaskStatus::Doing, 5, Some(&bob));
        let gateway = Arc::new(FakeAgents::default().with("bob-remote", Behaviour::Silent));

        let outcome = WarRoom::new(db.clone())
            .with_agent_gateway(gateway)
            .poll_policy(fast())
            .run()
            .await
            .unwrap();

        let turns = turns(&db, &outcome.conversation_id);
        assert!(turns.iter().any(|t| t.speaker_type == SpeakerType::System
            && t.content == "No reply from Bob after 3 attempts; no changes made."));
        assert!(db.lock_sync().unwrap().get_work_state(&bob.id).unwrap().is_none());
        assert!(outcome.run_id.is_some());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_isolated_per_owner() {
        let db = handle();
        let bob = agent(&db, "Bob", Some("bob-remote"));
        let carol = agent(&db, "Carol", Some("carol-remote"));
        task(&db, "Broken", TaskStatus::Blocked, 9, Some(&bob));
        task(&db, "Fine", TaskStatus::Doing, 1, Some(&carol));
        let gateway = Arc::new(
            FakeAgents::default()
                .with("bob-remote", Behaviour::SpawnFails)
                .with("carol-remote", Behaviour::Reply("task_title: Fine\nstatus: on track")),
        );

        let outcome = WarRoom::new(db.clone())
            .with_agent_gateway(gateway)
            .poll_policy(fast())
            .run()
            .await
            .unwrap();

        let turns = turns(&db, &outcome.conversation_id);
        assert!(turns.iter().any(|t| t.speaker_type == SpeakerType::System
            && t.content.contains("Gateway error while asking Bob")
            && t.content.contains("502")));
        let guard = db.lock_sync().unwrap();
        assert!(guard.get_work_state(&bob.id).unwrap().is_none());
        let carol_state = guard.get_work_state(&carol.id).unwrap().unwrap();
        assert_eq!(carol_state.status.as_deref(), Some("on track"));
        assert!(outcome.run_id.is_some());
    }

    #[tokio::test]
    async fn test_linked_agent_without_gateway_is_skipped() {
        let db = handle();
        let bob = agent(&db, "Bob", Some("bob-remote"));
        let fix = task(&db, "Fix", TaskStatus::Blocked, 5, Some(&bob));

        let outcome = WarRoom::new(db.clone()).apply_moves(false).run().await.unwrap();
        let turns = turns(&db, &outcome.conversation_id);
        assert!(turns.iter().any(|t| t.speaker_type == SpeakerType::System
            && t.content.contains("no gateway is configured")));
        assert!(!turns.iter().any(|t| t.speaker_type == SpeakerType::Agent));
        assert_eq!(status_of(&db, &fix.id), TaskStatus::Blocked);
        assert!(outcome.run_id.is_some());
    }

    #[tokio::test]
    async fn test_notification_success_is_recorded() {
        let db = handle();
        task(&db, "Orphan", TaskStatus::Doing, 1, None);
        let messenger = Arc::new(FakeMessenger::default());

        let outcome = WarRoom::new(db.clone())
            .with_messenger(messenger.clone())
            .telegram(TelegramTarget {
                chat_id: Some("-100".into()),
                topic_id: Some("7".into()),
            })
            .run()
            .await
            .unwrap();

        assert_eq!(
            outcome.notification,
            NotificationOutcome::Sent {
                message_id: Some("m-1".into())
            }
        );
        let sent = messenger.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "telegram");
        assert_eq!(sent[0].1, "-100");
        assert_eq!(sent[0].2, FINAL_ANSWER);
        assert_eq!(sent[0].3.as_deref(), Some("7"));

        let run = db
            .lock_sync()
            .unwrap()
            .get_war_room_run(&outcome.run_id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(run.delivery_message_id.as_deref(), Some("m-1"));
        assert_eq!(run.delivery_target.as_deref(), Some("-100"));
        assert!(run.delivery_error.is_none());
    }

    #[tokio::test]
    async fn test_notification_failure_never_fails_the_run() {
        let db = handle();
        task(&db, "Orphan", TaskStatus::Doing, 1, None);

        // Missing destination.
        let outcome = WarRoom::new(db.clone())
            .with_messenger(Arc::new(FakeMessenger::default()))
            .run()
            .await
            .unwrap();
        match &outcome.notification {
            NotificationOutcome::Failed { error } => assert!(error.contains("No delivery target")),
            other => panic!("expected failure, got {:?}", other),
        }

        // Send error.
        let outcome = WarRoom::new(db.clone())
            .with_messenger(Arc::new(FakeMessenger {
                fail: true,
                ..FakeMessenger::default()
            }))
            .telegram(TelegramTarget {
                chat_id: Some("-100".into()),
                topic_id: None,
            })
            .run()
            .await
            .unwrap();
        let run = db
            .lock_sync()
            .unwrap()
            .get_war_room_run(&outcome.run_id.unwrap())
            .unwrap()
            .unwrap();
        assert!(run.delivery_error.unwrap().contains("chat not found"));
        assert!(run.delivery_message_id.is_none());
    }

    #[tokio::test]
    async fn test_run_is_audited_once() {
        let db = handle();
        task(&db, "Orphan", TaskStatus::Doing, 1, None);
        let outcome = WarRoom::new(db.clone()).run().await.unwrap();
        let run_id = outcome.run_id.unwrap();
        let events = db
            .lock_sync()
            .unwrap()
            .list_audit_events(Some(EntityType::WarRoomRun), 100)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entity_id.as_deref(), Some(run_id.as_str()));
        assert_eq!(events[0].action, "war_room.run");
        assert_eq!(events[0].actor, "war-room");
    }

    #[tokio::test]
    async fn test_configure_prefers_workspace_destination() {
        let db = handle();
        let ws = db
            .lock_sync()
            .unwrap()
            .create_workspace(
                &Actor::operator(),
                &NewWorkspace {
                    name: "Labs".into(),
                    telegram_chat_id: Some("-200".into()),
                    telegram_topic_id: Some("3".into()),
                    ..NewWorkspace::default()
                },
            )
            .unwrap();
        let settings = Settings {
            telegram_chat_id: Some("-100".into()),
            ..Settings::default()
        };

        let war_room = WarRoom::configure(db.clone(), &settings, Some(&ws.id)).await.unwrap();
        assert_eq!(war_room.telegram.chat_id.as_deref(), Some("-200"));
        assert_eq!(war_room.telegram.topic_id.as_deref(), Some("3"));
        assert!(war_room.agents.is_none());

        let err = WarRoom::configure(db, &settings, Some("missing")).await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ControlError>(),
            Some(ControlError::WorkspaceNotFound { .. })
        ));
    }

    #[test]
    fn test_representative_task_tie_breaks_on_title() {
        let mk = |id: &str, title: &str, priority: i64| Task {
            id: id.into(),
            title: title.into(),
            description: None,
            status: TaskStatus::Doing,
            priority,
            owner_agent_id: Some("a".into()),
            sort_order: None,
            workspace_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let (a, b, c) = (mk("3", "Zeta", 5), mk("2", "Alpha", 5), mk("1", "Low", 1));
        let tasks = vec![&a, &b, &c];
        assert_eq!(representative_task(&tasks).unwrap().id, "2");
        assert!(representative_task(&[]).is_none());
    }

    #[test]
    fn test_reported_status_rules() {
        let blocked = OwnerUpdate {
            blockers: Some("waiting".into()),
            ..OwnerUpdate::default()
        };
        let clear = OwnerUpdate {
            blockers: Some("None".into()),
            ..OwnerUpdate::default()
        };
        assert_eq!(reported_status(TaskStatus::Doing, &blocked), Some(TaskStatus::Blocked));
        assert_eq!(reported_status(TaskStatus::Blocked, &clear), Some(TaskStatus::Doing));
        assert_eq!(reported_status(TaskStatus::Doing, &clear), None);
        assert_eq!(reported_status(TaskStatus::Done, &blocked), None);
        assert_eq!(reported_status(TaskStatus::Done, &clear), None);
    }
}
