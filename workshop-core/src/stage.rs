//! Workshop progression.
//!
//! ```text
//! NotStarted ──start──► InProgress(1) ──advance──► ... ──► InProgress(N)
//!                            ▲   ◄──retreat──                  │
//!                            │                              advance
//!                            └────────── reopen ◄── Completed ◄┘
//! ```
//!
//! Status and stage are separate document fields; every transition here
//! yields the patch that moves them together. Who may trigger a transition
//! is decided by the caller.

use serde::{Deserialize, Serialize};

use crate::patch::DocumentPatch;
use crate::{WorkshopDocument, WorkshopStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    pub id: u32,
    pub title: String,
    pub duration_minutes: u32,
}

impl StageConfig {
    fn new(id: u32, title: &str, duration_minutes: u32) -> Self {
        Self {
            id,
            title: title.to_string(),
            duration_minutes,
        }
    }

    /// The stage entry for `stage`, falling back to the first configured stage.
    pub fn find(stages: &[StageConfig], stage: u32) -> Option<&StageConfig> {
        stages.iter().find(|s| s.id == stage).or_else(|| stages.first())
    }
}

/// The four stages of the workshop.
pub fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig::new(1, "痛點盤點與情境定義", 25),
        StageConfig::new(2, "任務導向流程設計", 35),
        StageConfig::new(3, "方案共識與優先排序", 15),
        StageConfig::new(4, "總結與後續步驟", 10),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkshopPhase {
    NotStarted,
    InProgress(u32),
    Completed,
}

impl WorkshopPhase {
    pub fn of(doc: &WorkshopDocument) -> Self {
        match doc.status {
            WorkshopStatus::NotStarted => WorkshopPhase::NotStarted,
            WorkshopStatus::InProgress => WorkshopPhase::InProgress(doc.current_stage),
            WorkshopStatus::Completed => WorkshopPhase::Completed,
        }
    }

    pub fn is_last_stage(self, stage_count: u32) -> bool {
        matches!(self, WorkshopPhase::InProgress(k) if k >= stage_count)
    }
}

fn status_and_stage(status: WorkshopStatus, stage: Option<u32>) -> DocumentPatch {
    DocumentPatch {
        status: Some(status),
        current_stage: stage,
        ..DocumentPatch::default()
    }
}

/// `NotStarted → InProgress(1)`, once someone has joined.
pub fn start(doc: &WorkshopDocument) -> Option<DocumentPatch> {
    match WorkshopPhase::of(doc) {
        WorkshopPhase::NotStarted if !doc.participants.is_empty() => {
            Some(status_and_stage(WorkshopStatus::InProgress, Some(1)))
        }
        _ => None,
    }
}

/// `InProgress(k) → InProgress(k+1)`, or `Completed` after the last stage.
/// A stage below 1 is repaired to stage 1.
pub fn advance(doc: &WorkshopDocument, stage_count: u32) -> Option<DocumentPatch> {
    match WorkshopPhase::of(doc) {
        WorkshopPhase::InProgress(0) => Some(DocumentPatch {
            current_stage: Some(1),
            ..DocumentPatch::default()
        }),
        WorkshopPhase::InProgress(k) if k < stage_count => Some(DocumentPatch {
            current_stage: Some(k + 1),
            ..DocumentPatch::default()
        }),
        WorkshopPhase::InProgress(_) => Some(status_and_stage(WorkshopStatus::Completed, None)),
        _ => None,
    }
}

/// `InProgress(k) → InProgress(k-1)` for `k > 1`; from `Completed` this is
/// [`reopen`].
pub fn retreat(doc: &WorkshopDocument, stage_count: u32) -> Option<DocumentPatch> {
    match WorkshopPhase::of(doc) {
        WorkshopPhase::InProgress(k) if k > 1 => Some(DocumentPatch {
            current_stage: Some((k - 1).min(stage_count).max(1)),
            ..DocumentPatch::default()
        }),
        WorkshopPhase::Completed => reopen(doc, stage_count),
        _ => None,
    }
}

/// `Completed → InProgress(N)`.
pub fn reopen(doc: &WorkshopDocument, stage_count: u32) -> Option<DocumentPatch> {
    match WorkshopPhase::of(doc) {
        WorkshopPhase::Completed => Some(status_and_stage(
            WorkshopStatus::InProgress,
            Some(stage_count.max(1)),
        )),
        _ => None,
    }
}

/// Jump straight to `stage`; `None` unless it lies in `[1, stage_count]`.
pub fn set_stage(stage: u32, stage_count: u32) -> Option<DocumentPatch> {
    (1..=stage_count).contains(&stage).then(|| DocumentPatch {
        current_stage: Some(stage),
        ..DocumentPatch::default()
    })
}
