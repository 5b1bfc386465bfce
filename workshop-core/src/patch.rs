//! Partial documents.
//!
//! A [`DocumentPatch`] names only the top-level fields a write touches, so
//! two writers changing different fields never overwrite each other. Drafts
//! can additionally be written per group key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    Flowchart, FlowchartEditor, FlowchartEditorDraft, GroupId, Group, Intent, Participant,
    StickyNote, WorkshopDocument, WorkshopStatus,
};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkshopStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<Participant>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sticky_notes: Option<Vec<StickyNote>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intents: Option<Vec<Intent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<Group>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flowcharts: Option<Vec<Flowchart>>,
    /// Whole-map replacement, applied before `editor_drafts`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flowchart_editor: Option<FlowchartEditor>,
    /// Single-key draft writes.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub editor_drafts: BTreeMap<GroupId, FlowchartEditorDraft>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_voting: Option<bool>,
}

impl DocumentPatch {
    /// A patch that rewrites every field of `doc`.
    pub fn full(doc: WorkshopDocument) -> Self {
        Self {
            status: Some(doc.status),
            current_stage: Some(doc.current_stage),
            participants: Some(doc.participants),
            sticky_notes: Some(doc.sticky_notes),
            intents: Some(doc.intents),
            groups: Some(doc.groups),
            flowcharts: Some(doc.flowcharts),
            flowchart_editor: Some(doc.flowchart_editor),
            editor_drafts: BTreeMap::new(),
            is_voting: Some(doc.is_voting),
        }
    }

    pub fn draft(group_id: impl Into<GroupId>, draft: FlowchartEditorDraft) -> Self {
        let mut patch = Self::default();
        patch.editor_drafts.insert(group_id.into(), draft);
        patch
    }

    pub fn is_empty(&self) -> bool {
        self.field_names().is_empty()
    }

    /// Names of the touched fields, in document order. Draft keys are listed
    /// as `flowchartEditor.<group>`.
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = [
            ("status", self.status.is_some()),
            ("currentStage", self.current_stage.is_some()),
            ("participants", self.participants.is_some()),
            ("stickyNotes", self.sticky_notes.is_some()),
            ("intents", self.intents.is_some()),
            ("groups", self.groups.is_some()),
            ("flowcharts", self.flowcharts.is_some()),
            ("flowchartEditor", self.flowchart_editor.is_some()),
        ]
        .into_iter()
        .filter(|(_, set)| *set)
        .map(|(name, _)| name.to_string())
        .collect();
        names.extend(self.editor_drafts.keys().map(|g| format!("flowchartEditor.{g}")));
        if self.is_voting.is_some() {
            names.push("isVoting".to_string());
        }
        names
    }

    /// Fold `later` into `self`; fields set in `later` win.
    pub fn merge(&mut self, later: DocumentPatch) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if later.$field.is_some() { self.$field = later.$field; })*
            };
        }
        take!(status, current_stage, participants, sticky_notes, intents, groups, flowcharts, is_voting);
        if let Some(editor) = later.flowchart_editor {
            self.flowchart_editor = Some(editor);
            self.editor_drafts.clear();
        }
        self.editor_drafts.extend(later.editor_drafts);
    }
}

impl WorkshopDocument {
    /// Write every field present in `patch`; everything else stays.
    pub fn apply_patch(&mut self, patch: &DocumentPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(stage) = patch.current_stage {
            self.current_stage = stage;
        }
        if let Some(ref participants) = patch.participants {
            self.participants = participants.clone();
        }
        if let Some(ref notes) = patch.sticky_notes {
            self.sticky_notes = notes.clone();
        }
        if let Some(ref intents) = patch.intents {
            self.intents = intents.clone();
        }
        if let Some(ref groups) = patch.groups {
            self.groups = groups.clone();
        }
        if let Some(ref flowcharts) = patch.flowcharts {
            self.flowcharts = flowcharts.clone();
        }
        if let Some(ref editor) = patch.flowchart_editor {
            self.flowchart_editor = editor.clone();
        }
        for (group_id, draft) in &patch.editor_drafts {
            self.flowchart_editor.insert(group_id.clone(), draft.clone());
        }
        if let Some(voting) = patch.is_voting {
            self.is_voting = voting;
        }
    }

    pub fn patched(&self, patch: &DocumentPatch) -> Self {
        let mut next = self.clone();
        next.apply_patch(patch);
        next
    }
}

/// A typed handle on one top-level field: how to read it from a document and
/// how to turn a new value into a patch.
pub struct Field<T> {
    pub name: &'static str,
    read: fn(&WorkshopDocument) -> &T,
    write: fn(T) -> DocumentPatch,
}

impl<T> Field<T> {
    pub fn read<'a>(&self, doc: &'a WorkshopDocument) -> &'a T {
        (self.read)(doc)
    }

    pub fn patch(&self, value: T) -> DocumentPatch {
        (self.write)(value)
    }
}

pub mod fields {
    use super::*;

    pub const STATUS: Field<WorkshopStatus> = Field {
        name: "status",
        read: |d| &d.status,
        write: |v| DocumentPatch { status: Some(v), ..DocumentPatch::default() },
    };

    pub const CURRENT_STAGE: Field<u32> = Field {
        name: "currentStage",
        read: |d| &d.current_stage,
        write: |v| DocumentPatch { current_stage: Some(v), ..DocumentPatch::default() },
    };

    pub const PARTICIPANTS: Field<Vec<Participant>> = Field {
        name: "participants",
        read: |d| &d.participants,
        write: |v| DocumentPatch { participants: Some(v), ..DocumentPatch::default() },
    };

    pub const STICKY_NOTES: Field<Vec<StickyNote>> = Field {
        name: "stickyNotes",
        read: |d| &d.sticky_notes,
        write: |v| DocumentPatch { sticky_notes: Some(v), ..DocumentPatch::default() },
    };

    pub const INTENTS: Field<Vec<Intent>> = Field {
        name: "intents",
        read: |d| &d.intents,
        write: |v| DocumentPatch { intents: Some(v), ..DocumentPatch::default() },
    };

    pub const GROUPS: Field<Vec<Group>> = Field {
        name: "groups",
        read: |d| &d.groups,
        write: |v| DocumentPatch { groups: Some(v), ..DocumentPatch::default() },
    };

    pub const FLOWCHARTS: Field<Vec<Flowchart>> = Field {
        name: "flowcharts",
        read: |d| &d.flowcharts,
        write: |v| DocumentPatch { flowcharts: Some(v), ..DocumentPatch::default() },
    };

    pub const IS_VOTING: Field<bool> = Field {
        name: "isVoting",
        read: |d| &d.is_voting,
        write: |v| DocumentPatch { is_voting: Some(v), ..DocumentPatch::default() },
    };
}
