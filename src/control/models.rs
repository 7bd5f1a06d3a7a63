use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

// ── Task ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Backlog,
    Ready,
    Doing,
    Blocked,
    Review,
    Done,
}

impl TaskStatus {
    /// Board column order.
    pub const ALL: [TaskStatus; 6] = [
        Self::Backlog,
        Self::Ready,
        Self::Doing,
        Self::Blocked,
        Self::Review,
        Self::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "BACKLOG",
            Self::Ready => "READY",
            Self::Doing => "DOING",
            Self::Blocked => "BLOCKED",
            Self::Review => "REVIEW",
            Self::Done => "DONE",
        }
    }

    /// Statuses the war room considers "in flight".
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Doing | Self::Blocked)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BACKLOG" => Ok(Self::Backlog),
            "READY" => Ok(Self::Ready),
            "DOING" => Ok(Self::Doing),
            "BLOCKED" => Ok(Self::Blocked),
            "REVIEW" => Ok(Self::Review),
            "DONE" => Ok(Self::Done),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: i64,
    pub owner_agent_id: Option<String>,
    pub sort_order: Option<i64>,
    pub workspace_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub owner_agent_id: Option<String>,
    #[serde(default)]
    pub sort_order: Option<i64>,
    #[serde(default)]
    pub workspace_id: Option<String>,
}

/// Partial update for a task. An absent key leaves the column untouched;
/// for nullable columns an explicit `null` clears it.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub owner_agent_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<Option<String>>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.owner_agent_id.is_none()
            && self.sort_order.is_none()
            && self.workspace_id.is_none()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    pub workspace_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub owner_agent_id: Option<String>,
}

// ── Agent ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    #[default]
    Propose,
    Execute,
}

/// Whether an agent may act on its own or must propose, with per-skill
/// overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPolicy {
    #[serde(default)]
    pub default: PolicyAction,
    #[serde(default)]
    pub by_skill: BTreeMap<String, PolicyAction>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentConstraints {
    #[serde(default)]
    pub forbidden: Vec<String>,
    #[serde(default)]
    pub data_boundaries: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputContract {
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<String>,
}

fn default_required_fields() -> Vec<String> {
    ["current_task", "status", "next_step", "blockers"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for OutputContract {
    fn default() -> Self {
        Self {
            required_fields: default_required_fields(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub role: String,
    pub soul_md: String,
    pub model: Option<String>,
    /// Identity of the agent on the remote execution gateway, if linked.
    pub openclaw_agent_id: Option<String>,
    pub enabled: bool,
    pub skills_allow: Vec<String>,
    pub execution_policy: ExecutionPolicy,
    pub constraints: AgentConstraints,
    pub output_contract: OutputContract,
    pub workspace_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Agent {
    /// `skills_allow` is deny-by-default: a skill not listed is forbidden.
    pub fn is_skill_allowed(&self, skill: &str) -> bool {
        self.skills_allow.iter().any(|s| s == skill)
    }

    /// The action the agent may take with `skill`, or `None` if the skill
    /// is not allowed at all.
    pub fn action_for(&self, skill: &str) -> Option<PolicyAction> {
        if !self.is_skill_allowed(skill) {
            return None;
        }
        Some(
            self.execution_policy
                .by_skill
                .get(skill)
                .copied()
                .unwrap_or(self.execution_policy.default),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAgent {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub soul_md: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub openclaw_agent_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub skills_allow: Vec<String>,
    #[serde(default)]
    pub execution_policy: ExecutionPolicy,
    #[serde(default)]
    pub constraints: AgentConstraints,
    #[serde(default)]
    pub output_contract: OutputContract,
    #[serde(default)]
    pub workspace_id: Option<String>,
}

impl NewAgent {
    pub fn named(name: &str, role: &str) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            soul_md: String::new(),
            model: None,
            openclaw_agent_id: None,
            enabled: true,
            skills_allow: Vec::new(),
            execution_policy: ExecutionPolicy::default(),
            constraints: AgentConstraints::default(),
            output_contract: OutputContract::default(),
            workspace_id: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AgentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soul_md: Option<String>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub model: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub openclaw_agent_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skills_allow: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_policy: Option<ExecutionPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<AgentConstraints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_contract: Option<OutputContract>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<Option<String>>,
}

impl AgentPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.role.is_none()
            && self.soul_md.is_none()
            && self.model.is_none()
            && self.openclaw_agent_id.is_none()
            && self.enabled.is_none()
            && self.skills_allow.is_none()
            && self.execution_policy.is_none()
            && self.constraints.is_none()
            && self.output_contract.is_none()
            && self.workspace_id.is_none()
    }
}

/// Latest self-reported state of an agent. One row per agent, overwritten
/// on every report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentWorkState {
    pub agent_id: String,
    pub current_task_id: Option<String>,
    pub status: Option<String>,
    pub next_step: Option<String>,
    pub blockers: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct WorkStateUpdate {
    #[serde(default)]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub next_step: Option<String>,
    #[serde(default)]
    pub blockers: Option<String>,
}

// ── Workspaces & gateways ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub gateway_id: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_topic_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewWorkspace {
    pub name: String,
    #[serde(default)]
    pub gateway_id: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
    #[serde(default)]
    pub telegram_topic_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorkspacePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub telegram_chat_id: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option", skip_serializing_if = "Option::is_none")]
    pub telegram_topic_id: Option<Option<String>>,
}

impl WorkspacePatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.gateway_id.is_none()
            && self.telegram_chat_id.is_none()
            && self.telegram_topic_id.is_none()
    }
}

/// A registered agent-execution gateway. The token is write-only: it is
/// accepted on input but never serialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Gateway {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing, default)]
    pub token: String,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewGateway {
    pub name: String,
    pub url: String,
    pub token: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl GatewayPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.url.is_none() && self.token.is_none() && self.enabled.is_none()
    }
}

// ── Conversations ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationType {
    Task,
    WarRoom,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "TASK",
            Self::WarRoom => "WAR_ROOM",
        }
    }
}

impl FromStr for ConversationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TASK" => Ok(Self::Task),
            "WAR_ROOM" => Ok(Self::WarRoom),
            _ => Err(format!("Invalid conversation type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerType {
    Chair,
    Agent,
    System,
}

impl SpeakerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chair => "chair",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for SpeakerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpeakerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chair" => Ok(Self::Chair),
            "agent" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid speaker type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConversationType,
    pub task_id: Option<String>,
    pub workspace_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewConversation {
    #[serde(rename = "type")]
    pub kind: ConversationType,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub id: String,
    pub conversation_id: String,
    pub speaker_type: SpeakerType,
    pub speaker_id: Option<String>,
    pub content: String,
    pub tool_events: Option<serde_json::Value>,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTurn {
    pub speaker_type: SpeakerType,
    #[serde(default)]
    pub speaker_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub tool_events: Option<serde_json::Value>,
}

impl NewTurn {
    pub fn new(speaker_type: SpeakerType, content: impl Into<String>) -> Self {
        Self {
            speaker_type,
            speaker_id: None,
            content: content.into(),
            tool_events: None,
        }
    }

    pub fn by(mut self, speaker_id: &str) -> Self {
        self.speaker_id = Some(speaker_id.to_string());
        self
    }

    pub fn with_tool_events(mut self, events: serde_json::Value) -> Self {
        self.tool_events = Some(events);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub turns: Vec<Turn>,
}

// ── War room ──────────────────────────────────────────────────────────

/// A status change the war room proposes or has applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMove {
    #[serde(rename = "taskId")]
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub reason: String,
}

/// The decision document a war room run produces. Its JSON shape is shown
/// verbatim in the transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionDocument {
    pub decisions: Vec<String>,
    pub proposed_task_moves: Vec<TaskMove>,
    pub applied_task_moves: Vec<TaskMove>,
    pub final_answer_for_telegram: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WarRoomRun {
    pub id: String,
    pub conversation_id: String,
    pub workspace_id: Option<String>,
    pub final_answer: String,
    pub decision: DecisionDocument,
    pub delivery_target: Option<String>,
    pub delivery_thread_id: Option<String>,
    pub delivery_message_id: Option<String>,
    pub delivery_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Outcome of the best-effort send, patched onto an already-persisted run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryRecord {
    pub target: Option<String>,
    pub thread_id: Option<String>,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

// ── Audit ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Agent,
    Task,
    Gateway,
    Workspace,
    AgentWorkState,
    WarRoomRun,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Task => "task",
            Self::Gateway => "gateway",
            Self::Workspace => "workspace",
            Self::AgentWorkState => "agent_work_state",
            Self::WarRoomRun => "war_room_run",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Self::Agent),
            "task" => Ok(Self::Task),
            "gateway" => Ok(Self::Gateway),
            "workspace" => Ok(Self::Workspace),
            "agent_work_state" => Ok(Self::AgentWorkState),
            "war_room_run" => Ok(Self::WarRoomRun),
            _ => Err(format!("Invalid entity type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub id: String,
    pub actor: String,
    pub role: String,
    pub action: String,
    pub entity_type: EntityType,
    pub entity_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: String,
}

// ── API view types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardView {
    pub workspace_id: Option<String>,
    pub columns: Vec<ColumnView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnView {
    pub status: TaskStatus,
    pub tasks: Vec<Task>,
}

// ── Serde helpers ─────────────────────────────────────────────────────

/// Distinguishes an absent key (`None`) from an explicit `null`
/// (`Some(None)`). Pair with `#[serde(default)]`.
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_roundtrip() {
        for status in TaskStatus::ALL {
            let parsed: TaskStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("doing".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_task_status_serde_is_uppercase() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Blocked).unwrap(),
            "\"BLOCKED\""
        );
        assert_eq!(
            serde_json::from_str::<TaskStatus>("\"DONE\"").unwrap(),
            TaskStatus::Done
        );
    }

    #[test]
    fn test_only_doing_and_blocked_are_active() {
        let active: Vec<_> = TaskStatus::ALL.iter().filter(|s| s.is_active()).collect();
        assert_eq!(active, vec![&TaskStatus::Doing, &TaskStatus::Blocked]);
    }

    #[test]
    fn test_speaker_type_rejects_unknown_values() {
        assert_eq!("chair".parse::<SpeakerType>().unwrap(), SpeakerType::Chair);
        assert!("chiar".parse::<SpeakerType>().is_err());
        assert!(serde_json::from_str::<SpeakerType>("\"moderator\"").is_err());
    }

    #[test]
    fn test_entity_type_roundtrip() {
        for s in &[
            "agent",
            "task",
            "gateway",
            "workspace",
            "agent_work_state",
            "war_room_run",
        ] {
            let parsed: EntityType = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("project".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_task_patch_distinguishes_null_from_absent() {
        let patch: TaskPatch = serde_json::from_str(r#"{"owner_agent_id": null}"#).unwrap();
        assert_eq!(patch.owner_agent_id, Some(None));
        assert!(patch.title.is_none());

        let patch: TaskPatch = serde_json::from_str(r#"{"title": "x"}"#).unwrap();
        assert_eq!(patch.owner_agent_id, None);
        assert!(!patch.is_empty());

        let patch: TaskPatch = serde_json::from_str("{}").unwrap();
        assert!(patch.is_empty());
    }

    #[test]
    fn test_skills_allow_is_deny_by_default() {
        let mut agent = sample_agent();
        agent.skills_allow = vec!["github".into(), "coolify".into()];
        agent
            .execution_policy
            .by_skill
            .insert("github".into(), PolicyAction::Execute);

        assert_eq!(agent.action_for("github"), Some(PolicyAction::Execute));
        assert_eq!(agent.action_for("coolify"), Some(PolicyAction::Propose));
        assert_eq!(agent.action_for("shell"), None);
        assert!(!agent.is_skill_allowed("shell"));
    }

    #[test]
    fn test_gateway_token_is_never_serialized() {
        let gw = Gateway {
            id: "g1".into(),
            name: "main".into(),
            url: "http://gw".into(),
            token: "secret".into(),
            enabled: true,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let json = serde_json::to_string(&gw).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("token"));
    }

    #[test]
    fn test_decision_document_shape() {
        let doc = DecisionDocument {
            decisions: vec!["a".into()],
            proposed_task_moves: vec![TaskMove {
                task_id: "t1".into(),
                from: TaskStatus::Blocked,
                to: TaskStatus::Doing,
                reason: "Assume unblock after check".into(),
            }],
            applied_task_moves: vec![],
            final_answer_for_telegram: "done".into(),
        };
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["proposed_task_moves"][0]["taskId"], "t1");
        assert_eq!(value["proposed_task_moves"][0]["from"], "BLOCKED");
        assert_eq!(value["proposed_task_moves"][0]["to"], "DOING");

        let back: DecisionDocument = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_new_agent_defaults_from_json() {
        let agent: NewAgent = serde_json::from_str(r#"{"name": "Alice", "role": "Ops"}"#).unwrap();
        assert!(agent.enabled);
        assert!(agent.skills_allow.is_empty());
        assert_eq!(agent.execution_policy.default, PolicyAction::Propose);
        assert_eq!(
            agent.output_contract.required_fields,
            vec!["current_task", "status", "next_step", "blockers"]
        );
    }

    fn sample_agent() -> Agent {
        Agent {
            id: "a1".into(),
            name: "Alice".into(),
            role: "Ops".into(),
            soul_md: String::new(),
            model: None,
            openclaw_agent_id: None,
            enabled: true,
            skills_allow: vec![],
            execution_policy: ExecutionPolicy::default(),
            constraints: AgentConstraints::default(),
            output_contract: OutputContract::default(),
            workspace_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}
