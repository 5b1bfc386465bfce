//! # workshop-core: the shared workshop document
//!
//! One document holds the whole workshop: who joined, the sticky notes and
//! the intents they cluster under, the groups, every flowchart a group
//! designed and the per-group drafts still being assembled.
//!
//! ## Modules
//!
//! - [`update`]: the `T | (T => T)` update primitive every action goes through
//! - [`ops`]: pure field mutations (add note, assign participant, save draft, ...)
//! - [`patch`]: partial documents and the typed field table used to build them
//! - [`stage`]: workshop progression (`NotStarted → InProgress(k) → Completed`)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub mod ops;
pub mod patch;
pub mod stage;
pub mod update;

pub use patch::{DocumentPatch, Field};
pub use stage::{default_stages, StageConfig, WorkshopPhase};
pub use update::{apply_update, Update};

pub type ParticipantId = String;
pub type NoteId = String;
pub type IntentId = String;
pub type GroupId = String;
pub type StepId = String;
pub type FlowchartId = String;

/// Reserved participant name that receives facilitator controls on join.
pub const FACILITATOR_NAME: &str = "Eric";

/// Votes each participant may cast while voting is open.
pub const VOTE_BUDGET: u32 = 3;

/// Generate a fresh opaque id such as `note-3f2a...`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkshopStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    /// Fixed at join time from the name; never recomputed.
    pub is_facilitator: bool,
    #[serde(default)]
    pub group_id: Option<GroupId>,
}

impl Participant {
    /// Build a participant for `name`, or `None` when the name is blank.
    pub fn join(name: &str, facilitator_name: &str) -> Option<Self> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self {
            id: new_id("user"),
            name: trimmed.to_string(),
            is_facilitator: trimmed == facilitator_name,
            group_id: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickyNote {
    pub id: NoteId,
    pub text: String,
    /// `None` = unclassified.
    #[serde(default)]
    pub intent_id: Option<IntentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub id: IntentId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStepActor {
    User,
    Bot,
}

/// How the bot answers in a bot step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    #[default]
    Text,
    Buttons,
    FreeTextInput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStep {
    pub id: StepId,
    pub actor: FlowStepActor,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_type: Option<ResponseType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl FlowStep {
    /// Create a step with a fresh id. Bot-only fields are dropped for user
    /// steps, and options survive only on button responses.
    pub fn new(
        actor: FlowStepActor,
        description: impl Into<String>,
        response_type: Option<ResponseType>,
        options: Vec<String>,
    ) -> Self {
        Self {
            id: new_id("step"),
            actor,
            description: description.into(),
            response_type,
            options,
        }
        .normalized()
    }

    pub fn normalized(mut self) -> Self {
        match self.actor {
            FlowStepActor::User => {
                self.response_type = None;
                self.options.clear();
            }
            FlowStepActor::Bot => {
                let response = self.response_type.unwrap_or_default();
                self.response_type = Some(response);
                if response == ResponseType::Buttons {
                    self.options = self
                        .options
                        .into_iter()
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect();
                } else {
                    self.options.clear();
                }
            }
        }
        self
    }
}

/// Prioritization quadrant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixQuadrant {
    /// Build now (MVP)
    Q1,
    /// Mid/long-term plan
    Q2,
    /// Simple scripted handling
    Q3,
    /// Not now
    Q4,
}

impl MatrixQuadrant {
    pub const ALL: [MatrixQuadrant; 4] = [Self::Q1, Self::Q2, Self::Q3, Self::Q4];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flowchart {
    pub id: FlowchartId,
    pub title: String,
    pub intent_id: IntentId,
    pub group_id: GroupId,
    pub steps: Vec<FlowStep>,
    #[serde(default)]
    pub matrix_position: Option<MatrixQuadrant>,
    #[serde(default)]
    pub votes: u32,
}

/// Title a flowchart gets when saved for an intent.
pub fn flowchart_title(intent_name: &str) -> String {
    format!("{intent_name} - 流程")
}

/// A group's in-progress flowchart.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowchartEditorDraft {
    #[serde(default)]
    pub selected_intent_id: Option<IntentId>,
    #[serde(default)]
    pub current_steps: Vec<FlowStep>,
    /// Set when the draft was loaded from a saved flowchart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editing_flowchart_id: Option<FlowchartId>,
}

impl FlowchartEditorDraft {
    pub fn is_empty(&self) -> bool {
        self.selected_intent_id.is_none()
            && self.current_steps.is_empty()
            && self.editing_flowchart_id.is_none()
    }
}

/// Drafts keyed by group id. A missing entry is an empty draft.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowchartEditor(BTreeMap<GroupId, FlowchartEditorDraft>);

impl FlowchartEditor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get-or-default accessor.
    pub fn draft_for(&self, group_id: &str) -> FlowchartEditorDraft {
        self.0.get(group_id).cloned().unwrap_or_default()
    }

    pub fn get(&self, group_id: &str) -> Option<&FlowchartEditorDraft> {
        self.0.get(group_id)
    }

    pub fn insert(&mut self, group_id: impl Into<GroupId>, draft: FlowchartEditorDraft) {
        self.0.insert(group_id.into(), draft);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The single shared aggregate.
///
/// Missing fields deserialize to empty values so documents written before a
/// field existed still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkshopDocument {
    pub status: WorkshopStatus,
    pub current_stage: u32,
    pub participants: Vec<Participant>,
    pub sticky_notes: Vec<StickyNote>,
    pub intents: Vec<Intent>,
    pub groups: Vec<Group>,
    pub flowcharts: Vec<Flowchart>,
    pub flowchart_editor: FlowchartEditor,
    pub is_voting: bool,
}

impl Default for WorkshopDocument {
    fn default() -> Self {
        Self {
            status: WorkshopStatus::NotStarted,
            current_stage: 1,
            participants: Vec::new(),
            sticky_notes: Vec::new(),
            intents: Vec::new(),
            groups: Vec::new(),
            flowcharts: Vec::new(),
            flowchart_editor: FlowchartEditor::new(),
            is_voting: false,
        }
    }
}

/// The document every fresh workshop starts from: stage 1, not started,
/// three example notes to break the ice.
pub fn initial_document() -> WorkshopDocument {
    let seed = [
        "How do I check my order status?",
        "What is the return policy?",
        "How can I reset my password?",
    ];
    WorkshopDocument {
        sticky_notes: seed
            .iter()
            .enumerate()
            .map(|(i, text)| StickyNote {
                id: format!("note-{}", i + 1),
                text: (*text).to_string(),
                intent_id: None,
            })
            .collect(),
        ..WorkshopDocument::default()
    }
}

impl WorkshopDocument {
    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn intent(&self, id: &str) -> Option<&Intent> {
        self.intents.iter().find(|i| i.id == id)
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn flowchart(&self, id: &str) -> Option<&Flowchart> {
        self.flowcharts.iter().find(|f| f.id == id)
    }

    pub fn unclassified_notes(&self) -> impl Iterator<Item = &StickyNote> {
        self.sticky_notes.iter().filter(|n| n.intent_id.is_none())
    }

    pub fn notes_for_intent<'a>(&'a self, intent_id: &'a str) -> impl Iterator<Item = &'a StickyNote> {
        self.sticky_notes
            .iter()
            .filter(move |n| n.intent_id.as_deref() == Some(intent_id))
    }

    /// Intents with at least one note; only these can be turned into flowcharts.
    pub fn intents_with_notes(&self) -> impl Iterator<Item = &Intent> {
        self.intents.iter().filter(move |i| {
            self.sticky_notes
                .iter()
                .any(|n| n.intent_id.as_deref() == Some(i.id.as_str()))
        })
    }

    pub fn unassigned_participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.group_id.is_none())
    }

    pub fn members_of<'a>(&'a self, group_id: &'a str) -> impl Iterator<Item = &'a Participant> {
        self.participants
            .iter()
            .filter(move |p| p.group_id.as_deref() == Some(group_id))
    }

    pub fn flowcharts_for_group<'a>(&'a self, group_id: &'a str) -> impl Iterator<Item = &'a Flowchart> {
        self.flowcharts.iter().filter(move |f| f.group_id == group_id)
    }

    /// Flowcharts in a quadrant; `None` lists the unplaced ones.
    pub fn flowcharts_in(&self, quadrant: Option<MatrixQuadrant>) -> impl Iterator<Item = &Flowchart> {
        self.flowcharts
            .iter()
            .filter(move |f| f.matrix_position == quadrant)
    }

    /// Most-voted first; ties keep document order.
    pub fn ranked_flowcharts(&self) -> Vec<&Flowchart> {
        let mut ranked: Vec<&Flowchart> = self.flowcharts.iter().collect();
        ranked.sort_by(|a, b| b.votes.cmp(&a.votes));
        ranked
    }

    pub fn total_votes(&self) -> u64 {
        self.flowcharts.iter().map(|f| u64::from(f.votes)).sum()
    }
}
