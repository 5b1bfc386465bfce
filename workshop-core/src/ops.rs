//! Pure field mutations.
//!
//! Each function takes the current value of one field and returns the next
//! one. Rejected input (blank text, unknown ids, a missing intent) returns
//! the current value unchanged, so callers can detect a no-op by equality.

use crate::{
    flowchart_title, new_id, Flowchart, FlowchartEditorDraft, FlowStep, Group, Intent,
    MatrixQuadrant, Participant, StickyNote,
};

/// Entities addressable by id.
pub trait Identified {
    fn id(&self) -> &str;
}

macro_rules! identified {
    ($($ty:ty),*) => {
        $(impl Identified for $ty {
            fn id(&self) -> &str {
                &self.id
            }
        })*
    };
}

identified!(Participant, StickyNote, Intent, Group, FlowStep, Flowchart);

pub fn append<T: Clone>(items: &[T], item: T) -> Vec<T> {
    let mut next = items.to_vec();
    next.push(item);
    next
}

/// Drop the entity with `id`. Nothing else is touched.
pub fn remove<T: Identified + Clone>(items: &[T], id: &str) -> Vec<T> {
    items.iter().filter(|i| i.id() != id).cloned().collect()
}

fn non_blank(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

// ─── Sticky notes & intents ──────────────────────────────────────────

pub fn new_sticky_note(text: &str) -> Option<StickyNote> {
    non_blank(text).map(|text| StickyNote {
        id: new_id("note"),
        text: text.to_string(),
        intent_id: None,
    })
}

pub fn new_intent(name: &str) -> Option<Intent> {
    non_blank(name).map(|name| Intent {
        id: new_id("intent"),
        name: name.to_string(),
    })
}

/// Move a note under an intent (`None` = back to unclassified).
pub fn classify_note(notes: &[StickyNote], note_id: &str, intent_id: Option<&str>) -> Vec<StickyNote> {
    notes
        .iter()
        .map(|n| {
            if n.id == note_id && n.intent_id.as_deref() != intent_id {
                StickyNote {
                    intent_id: intent_id.map(str::to_string),
                    ..n.clone()
                }
            } else {
                n.clone()
            }
        })
        .collect()
}

// ─── Groups & participants ───────────────────────────────────────────

/// Next group, named after the count at creation time.
pub fn new_group(existing: &[Group]) -> Group {
    Group {
        id: new_id("group"),
        name: format!("Group {}", existing.len() + 1),
    }
}

pub fn assign_participant(
    participants: &[Participant],
    participant_id: &str,
    group_id: Option<&str>,
) -> Vec<Participant> {
    participants
        .iter()
        .map(|p| {
            if p.id == participant_id && p.group_id.as_deref() != group_id {
                Participant {
                    group_id: group_id.map(str::to_string),
                    ..p.clone()
                }
            } else {
                p.clone()
            }
        })
        .collect()
}

// ─── Drafts ──────────────────────────────────────────────────────────

/// Pick the intent a draft is about. Picking a different intent starts
/// over; re-picking the same one keeps the steps.
pub fn select_intent(draft: &FlowchartEditorDraft, intent_id: Option<&str>) -> FlowchartEditorDraft {
    if draft.selected_intent_id.as_deref() == intent_id {
        return draft.clone();
    }
    FlowchartEditorDraft {
        selected_intent_id: intent_id.map(str::to_string),
        current_steps: Vec::new(),
        editing_flowchart_id: None,
    }
}

/// Append a step. Needs a selected intent and a non-blank description.
pub fn add_step(draft: &FlowchartEditorDraft, step: FlowStep) -> FlowchartEditorDraft {
    let Some(description) = non_blank(&step.description) else {
        return draft.clone();
    };
    if draft.selected_intent_id.is_none() {
        return draft.clone();
    }
    let step = FlowStep {
        description: description.to_string(),
        ..step
    }
    .normalized();
    FlowchartEditorDraft {
        current_steps: append(&draft.current_steps, step),
        ..draft.clone()
    }
}

pub fn delete_step(draft: &FlowchartEditorDraft, step_id: &str) -> FlowchartEditorDraft {
    FlowchartEditorDraft {
        current_steps: remove(&draft.current_steps, step_id),
        ..draft.clone()
    }
}

/// Open a saved flowchart for editing.
pub fn load_flowchart(flowchart: &Flowchart) -> FlowchartEditorDraft {
    FlowchartEditorDraft {
        selected_intent_id: Some(flowchart.intent_id.clone()),
        current_steps: flowchart
            .steps
            .iter()
            .cloned()
            .map(FlowStep::normalized)
            .collect(),
        editing_flowchart_id: Some(flowchart.id.clone()),
    }
}

// ─── Flowcharts ──────────────────────────────────────────────────────

/// Turn a group's draft into a flowchart.
///
/// Returns `None` unless an intent is selected and the draft has steps.
/// Editing keeps the flowchart's id, votes and quadrant; a draft whose
/// flowchart no longer exists is saved as a new one.
pub fn save_draft(
    flowcharts: &[Flowchart],
    draft: &FlowchartEditorDraft,
    group_id: &str,
    intents: &[Intent],
) -> Option<Vec<Flowchart>> {
    let intent_id = draft.selected_intent_id.as_deref()?;
    if draft.current_steps.is_empty() {
        return None;
    }
    let intent_name = intents
        .iter()
        .find(|i| i.id == intent_id)
        .map_or("Untitled", |i| i.name.as_str());
    let title = flowchart_title(intent_name);
    let steps: Vec<FlowStep> = draft
        .current_steps
        .iter()
        .cloned()
        .map(FlowStep::normalized)
        .collect();

    let editing = draft
        .editing_flowchart_id
        .as_deref()
        .filter(|id| flowcharts.iter().any(|f| f.id == *id));

    Some(match editing {
        Some(id) => flowcharts
            .iter()
            .map(|f| {
                if f.id == id {
                    Flowchart {
                        title: title.clone(),
                        intent_id: intent_id.to_string(),
                        steps: steps.clone(),
                        ..f.clone()
                    }
                } else {
                    f.clone()
                }
            })
            .collect(),
        None => append(
            flowcharts,
            Flowchart {
                id: new_id("flow"),
                title,
                intent_id: intent_id.to_string(),
                group_id: group_id.to_string(),
                steps,
                matrix_position: None,
                votes: 0,
            },
        ),
    })
}

/// Put a flowchart into a quadrant (`None` = back to unplaced).
pub fn place_flowchart(
    flowcharts: &[Flowchart],
    flowchart_id: &str,
    quadrant: Option<MatrixQuadrant>,
) -> Vec<Flowchart> {
    flowcharts
        .iter()
        .map(|f| {
            if f.id == flowchart_id {
                Flowchart {
                    matrix_position: quadrant,
                    ..f.clone()
                }
            } else {
                f.clone()
            }
        })
        .collect()
}

/// One vote for `flowchart_id`.
pub fn vote(flowcharts: &[Flowchart], flowchart_id: &str) -> Vec<Flowchart> {
    flowcharts
        .iter()
        .map(|f| {
            if f.id == flowchart_id {
                Flowchart {
                    votes: f.votes.saturating_add(1),
                    ..f.clone()
                }
            } else {
                f.clone()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FlowStepActor, ResponseType, FACILITATOR_NAME};

    fn intent(id: &str, name: &str) -> Intent {
        Intent { id: id.into(), name: name.into() }
    }

    fn draft_with(intent_id: &str, descriptions: &[&str]) -> FlowchartEditorDraft {
        descriptions.iter().fold(
            select_intent(&FlowchartEditorDraft::default(), Some(intent_id)),
            |d, desc| add_step(&d, FlowStep::new(FlowStepActor::User, *desc, None, vec![])),
        )
    }

    #[test]
    fn test_blank_note_rejected() {
        assert!(new_sticky_note("  ").is_none());
        let note = new_sticky_note(" Where is my order? ").unwrap();
        assert_eq!(note.text, "Where is my order?");
        assert!(note.intent_id.is_none());
    }

    #[test]
    fn test_classify_and_unclassify() {
        let notes = vec![new_sticky_note("a").unwrap(), new_sticky_note("b").unwrap()];
        let id = notes[0].id.clone();

        let tagged = classify_note(&notes, &id, Some("intent-1"));
        assert_eq!(tagged[0].intent_id.as_deref(), Some("intent-1"));
        assert_eq!(tagged[1], notes[1]);

        let back = classify_note(&tagged, &id, None);
        assert_eq!(back, notes);
    }

    #[test]
    fn test_classify_unknown_note_is_noop() {
        let notes = vec![new_sticky_note("a").unwrap()];
        assert_eq!(classify_note(&notes, "note-missing", Some("i")), notes);
    }

    #[test]
    fn test_remove_does_not_cascade() {
        let notes = vec![
            StickyNote { id: "n1".into(), text: "a".into(), intent_id: Some("i1".into()) },
            StickyNote { id: "n2".into(), text: "b".into(), intent_id: Some("i1".into()) },
        ];
        let next = remove(&notes, "n1");
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].intent_id.as_deref(), Some("i1"));
    }

    #[test]
    fn test_group_names_follow_count() {
        let g1 = new_group(&[]);
        assert_eq!(g1.name, "Group 1");
        let groups = append(&[], g1);
        let g2 = new_group(&groups);
        assert_eq!(g2.name, "Group 2");
    }

    #[test]
    fn test_assign_is_idempotent() {
        let people = vec![
            Participant::join("Eric", FACILITATOR_NAME).unwrap(),
            Participant::join("Ava", FACILITATOR_NAME).unwrap(),
        ];
        let ava = people[1].id.clone();

        let once = assign_participant(&people, &ava, Some("group-1"));
        let twice = assign_participant(&once, &ava, Some("group-1"));
        assert_eq!(once, twice);
        assert_eq!(once[1].group_id.as_deref(), Some("group-1"));
        assert_eq!(once[0], people[0]);
    }

    #[test]
    fn test_select_same_intent_keeps_steps() {
        let draft = draft_with("intent-1", &["hello"]);
        assert_eq!(select_intent(&draft, Some("intent-1")), draft);

        let switched = select_intent(&draft, Some("intent-2"));
        assert!(switched.current_steps.is_empty());
        assert_eq!(switched.selected_intent_id.as_deref(), Some("intent-2"));
    }

    #[test]
    fn test_add_step_requires_intent_and_text() {
        let empty = FlowchartEditorDraft::default();
        let step = FlowStep::new(FlowStepActor::User, "hi", None, vec![]);
        assert_eq!(add_step(&empty, step), empty);

        let draft = select_intent(&empty, Some("intent-1"));
        let blank = FlowStep::new(FlowStepActor::User, "   ", None, vec![]);
        assert_eq!(add_step(&draft, blank), draft);
    }

    #[test]
    fn test_add_step_strips_user_bot_fields() {
        let draft = select_intent(&FlowchartEditorDraft::default(), Some("intent-1"));
        let mut step = FlowStep::new(FlowStepActor::User, " Track it ", None, vec![]);
        step.response_type = Some(ResponseType::Buttons);
        step.options = vec!["a".into()];

        let next = add_step(&draft, step);
        let added = &next.current_steps[0];
        assert_eq!(added.description, "Track it");
        assert!(added.response_type.is_none());
        assert!(added.options.is_empty());
    }

    #[test]
    fn test_save_draft_guards() {
        let intents = vec![intent("intent-1", "Billing")];
        let no_intent = FlowchartEditorDraft::default();
        assert!(save_draft(&[], &no_intent, "g", &intents).is_none());

        let no_steps = select_intent(&no_intent, Some("intent-1"));
        assert!(save_draft(&[], &no_steps, "g", &intents).is_none());
    }

    #[test]
    fn test_save_new_then_edit() {
        let intents = vec![intent("intent-1", "Billing")];
        let draft = draft_with("intent-1", &["I was charged twice", "Let me check"]);

        let saved = save_draft(&[], &draft, "group-1", &intents).unwrap();
        assert_eq!(saved.len(), 1);
        let created = &saved[0];
        assert_eq!(created.title, "Billing - 流程");
        assert_eq!(created.group_id, "group-1");
        assert_eq!(created.votes, 0);
        assert!(created.matrix_position.is_none());

        let voted = place_flowchart(&vote(&saved, &created.id), &created.id, Some(MatrixQuadrant::Q1));

        let editing = load_flowchart(&voted[0]);
        let editing = add_step(
            &editing,
            FlowStep::new(FlowStepActor::Bot, "Refund issued", None, vec![]),
        );
        let edited = save_draft(&voted, &editing, "group-1", &intents).unwrap();
        assert_eq!(edited.len(), 1);
        assert_eq!(edited[0].id, created.id);
        assert_eq!(edited[0].votes, 1);
        assert_eq!(edited[0].matrix_position, Some(MatrixQuadrant::Q1));
        assert_eq!(edited[0].steps.len(), 3);
    }

    #[test]
    fn test_save_edit_of_deleted_flowchart_appends() {
        let intents = vec![intent("intent-1", "Billing")];
        let mut draft = draft_with("intent-1", &["hi"]);
        draft.editing_flowchart_id = Some("flow-gone".into());

        let saved = save_draft(&[], &draft, "group-1", &intents).unwrap();
        assert_eq!(saved.len(), 1);
        assert_ne!(saved[0].id, "flow-gone");
    }

    #[test]
    fn test_untitled_when_intent_missing() {
        let draft = draft_with("intent-x", &["hi"]);
        let saved = save_draft(&[], &draft, "group-1", &[]).unwrap();
        assert_eq!(saved[0].title, "Untitled - 流程");
    }

    #[test]
    fn test_vote_monotonic() {
        let intents = vec![intent("i", "Shipping")];
        let saved = save_draft(&[], &draft_with("i", &["x"]), "g", &intents).unwrap();
        let id = saved[0].id.clone();
        let mut current = saved;
        for expected in 1..=5 {
            current = vote(&current, &id);
            assert_eq!(current[0].votes, expected);
        }
        assert_eq!(vote(&current, "flow-missing"), current);
    }
}
