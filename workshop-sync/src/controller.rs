//! The per-participant view of the shared workshop.
//!
//! A [`WorkshopController`] owns one in-memory [`WorkshopDocument`] and a
//! readiness flag, and exposes the actions presentation code calls. Each
//! action computes the next value of one field against the in-memory
//! document and hands just that field to the store.
//!
//! The store is the only writer of the in-memory document. How soon a
//! change shows up depends on the store:
//!
//! - stores that write immediately (the local file) save on the calling
//!   thread and report the merged document before the action returns.
//! - others (the sync server) are written from a background task; the
//!   change shows up when its snapshot arrives.
//!
//! Writes reach the store in the order actions were called. Rejected input
//! (blank text, unknown ids, out-of-range stages, exhausted votes) is a
//! silent no-op.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use workshop_core::patch::{fields, Field};
use workshop_core::{
    apply_update, default_stages, initial_document, ops, stage, DocumentPatch, Flowchart,
    FlowchartEditorDraft, FlowStep, FlowStepActor, Group, GroupId, Intent, IntentId,
    MatrixQuadrant, NoteId, Participant, ResponseType, StageConfig, StickyNote, Update,
    WorkshopDocument, WorkshopPhase, WorkshopStatus, FACILITATOR_NAME, VOTE_BUDGET,
};

use crate::store::{Subscription, WorkshopStore};

#[derive(Debug, Clone)]
pub struct WorkshopConfig {
    /// Joining under this name grants facilitator controls
    pub facilitator_name: String,
    /// Votes this participant may cast per session
    pub vote_budget: u32,
    pub stages: Vec<StageConfig>,
}

impl Default for WorkshopConfig {
    fn default() -> Self {
        Self {
            facilitator_name: FACILITATOR_NAME.to_string(),
            vote_budget: VOTE_BUDGET,
            stages: default_stages(),
        }
    }
}

impl WorkshopConfig {
    pub fn stage_count(&self) -> u32 {
        self.stages.len() as u32
    }
}

enum WriterCommand {
    Save(DocumentPatch),
    Flush(oneshot::Sender<()>),
}

struct Snapshot {
    document: Arc<WorkshopDocument>,
    ready: bool,
}

pub struct WorkshopController<S: WorkshopStore> {
    store: Arc<S>,
    config: WorkshopConfig,
    /// Save on the calling thread instead of the writer task.
    immediate: bool,
    snapshot: Arc<RwLock<Snapshot>>,
    changes: Arc<watch::Sender<Arc<WorkshopDocument>>>,
    writer: mpsc::UnboundedSender<WriterCommand>,
    subscription: Mutex<Option<Subscription>>,
    votes_cast: AtomicU32,
}

impl<S: WorkshopStore> WorkshopController<S> {
    /// Subscribe to `store` and start the writer task.
    ///
    /// Stores that write immediately are loaded up front, so the
    /// controller is ready when this returns. Otherwise it reports loading
    /// (and shows the initial document) until the first notification.
    pub async fn start(store: S, config: WorkshopConfig) -> Self {
        let store = Arc::new(store);
        let immediate = store.writes_immediately();

        let initial = Arc::new(initial_document());
        let snapshot = Arc::new(RwLock::new(Snapshot {
            document: initial.clone(),
            ready: false,
        }));
        let changes = Arc::new(watch::Sender::new(initial));

        if immediate {
            let doc = Arc::new(store.load().await);
            replace(&snapshot, &changes, doc);
        }

        let subscription = {
            let snapshot = snapshot.clone();
            let changes = changes.clone();
            store.subscribe(Arc::new(move |doc| replace(&snapshot, &changes, doc)))
        };

        let (writer, mut rx) = mpsc::unbounded_channel();
        {
            let store = store.clone();
            tokio::spawn(async move {
                while let Some(cmd) = rx.recv().await {
                    match cmd {
                        WriterCommand::Save(patch) => store.save(patch).await,
                        WriterCommand::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            });
        }

        log::info!(
            "Workshop controller started ({} mode)",
            if immediate { "local" } else { "replicated" }
        );

        Self {
            store,
            config,
            immediate,
            snapshot,
            changes,
            writer,
            subscription: Mutex::new(Some(subscription)),
            votes_cast: AtomicU32::new(0),
        }
    }

    // ─── Observation ──────────────────────────────────────────────────

    /// The current document. Until ready this is the initial document.
    pub fn state(&self) -> Arc<WorkshopDocument> {
        self.read().document.clone()
    }

    pub fn is_loading(&self) -> bool {
        !self.read().ready
    }

    /// Every document the controller adopts, newest last.
    pub fn changes(&self) -> watch::Receiver<Arc<WorkshopDocument>> {
        self.changes.subscribe()
    }

    pub async fn wait_until_ready(&self) {
        let mut rx = self.changes();
        while self.is_loading() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait for the first adopted document that satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Arc<WorkshopDocument>
    where
        F: FnMut(&WorkshopDocument) -> bool,
    {
        let mut rx = self.changes();
        let found = match rx.wait_for(|doc| predicate(doc.as_ref())).await {
            Ok(doc) => doc.clone(),
            Err(_) => self.state(),
        };
        found
    }

    pub fn config(&self) -> &WorkshopConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn phase(&self) -> WorkshopPhase {
        WorkshopPhase::of(&self.state())
    }

    /// Title and duration of the stage currently shown.
    pub fn current_stage(&self) -> Option<&StageConfig> {
        StageConfig::find(&self.config.stages, self.state().current_stage)
    }

    pub fn votes_remaining(&self) -> u32 {
        self.config
            .vote_budget
            .saturating_sub(self.votes_cast.load(Ordering::SeqCst))
    }

    /// Wait until every write issued so far has been handed to the store.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writer.send(WriterCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop receiving documents. Queued writes still go out.
    pub fn shutdown(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
            log::info!("Workshop controller unsubscribed");
        }
    }

    // ─── Field actions ────────────────────────────────────────────────

    /// Join under `name`. Returns the new participant, or `None` for a
    /// blank name.
    pub fn add_participant(&self, name: &str) -> Option<Participant> {
        let participant = Participant::join(name, &self.config.facilitator_name)?;
        let joined = participant.clone();
        self.commit(
            &fields::PARTICIPANTS,
            Update::with(move |ps: &Vec<Participant>| ops::append(ps, joined)),
        );
        log::info!(
            "{} joined{}",
            participant.name,
            if participant.is_facilitator { " as facilitator" } else { "" }
        );
        Some(participant)
    }

    pub fn set_workshop_status(&self, status: impl Into<Update<WorkshopStatus>>) {
        self.commit(&fields::STATUS, status.into());
    }

    /// Values outside `1..=N` are ignored.
    pub fn set_current_stage(&self, stage: impl Into<Update<u32>>) {
        let current = self.state().current_stage;
        let next = apply_update(&current, stage.into());
        if next == current {
            return;
        }
        match stage::set_stage(next, self.config.stage_count()) {
            Some(patch) => self.dispatch(patch),
            None => log::warn!("Ignoring out-of-range stage {next}"),
        }
    }

    pub fn set_sticky_notes(&self, update: impl Into<Update<Vec<StickyNote>>>) {
        self.commit(&fields::STICKY_NOTES, update.into());
    }

    pub fn set_intents(&self, update: impl Into<Update<Vec<Intent>>>) {
        self.commit(&fields::INTENTS, update.into());
    }

    pub fn set_groups(&self, update: impl Into<Update<Vec<Group>>>) {
        self.commit(&fields::GROUPS, update.into());
    }

    pub fn set_flowcharts(&self, update: impl Into<Update<Vec<Flowchart>>>) {
        self.commit(&fields::FLOWCHARTS, update.into());
    }

    pub fn set_is_voting(&self, update: impl Into<Update<bool>>) {
        self.commit(&fields::IS_VOTING, update.into());
    }

    /// `None` takes the participant out of every group. An unknown group
    /// is ignored.
    pub fn assign_participant_to_group(&self, participant_id: &str, group_id: Option<&str>) {
        if let Some(g) = group_id {
            if self.state().group(g).is_none() {
                log::warn!("Ignoring assignment to unknown group {g}");
                return;
            }
        }
        let participant_id = participant_id.to_string();
        let group_id = group_id.map(str::to_string);
        self.commit(
            &fields::PARTICIPANTS,
            Update::with(move |ps: &Vec<Participant>| {
                ops::assign_participant(ps, &participant_id, group_id.as_deref())
            }),
        );
    }

    /// Write one group's draft. Other groups' drafts are not touched.
    pub fn set_flowchart_editor_for_group(
        &self,
        group_id: &str,
        update: impl Into<Update<FlowchartEditorDraft>>,
    ) {
        let current = self.state().flowchart_editor.draft_for(group_id);
        let next = apply_update(&current, update.into());
        if next == current {
            log::trace!("Draft for {group_id} unchanged; skipping write");
            return;
        }
        self.dispatch(DocumentPatch::draft(group_id, next));
    }

    /// Back to the initial document, for everyone. Restores this
    /// participant's votes.
    pub fn reset_workshop(&self) {
        self.votes_cast.store(0, Ordering::SeqCst);
        self.dispatch(DocumentPatch::full(initial_document()));
        log::info!("Workshop reset");
    }

    // ─── Stages ───────────────────────────────────────────────────────

    pub fn start_workshop(&self) {
        self.transition("start", stage::start(&self.state()));
    }

    pub fn advance_stage(&self) {
        let n = self.config.stage_count();
        self.transition("advance", stage::advance(&self.state(), n));
    }

    /// One stage back; from `Completed` this reopens the last stage.
    pub fn previous_stage(&self) {
        let n = self.config.stage_count();
        self.transition("retreat", stage::retreat(&self.state(), n));
    }

    fn transition(&self, name: &str, patch: Option<DocumentPatch>) {
        match patch {
            Some(patch) => self.dispatch(patch),
            None => log::debug!("Ignoring {name} from {:?}", self.phase()),
        }
    }

    // ─── Stage 1: notes and intents ───────────────────────────────────

    pub fn add_sticky_note(&self, text: &str) -> Option<NoteId> {
        let note = ops::new_sticky_note(text)?;
        let id = note.id.clone();
        self.set_sticky_notes(Update::with(move |ns: &Vec<StickyNote>| ops::append(ns, note)));
        Some(id)
    }

    pub fn delete_sticky_note(&self, note_id: &str) {
        let note_id = note_id.to_string();
        self.set_sticky_notes(Update::with(move |ns: &Vec<StickyNote>| ops::remove(ns, &note_id)));
    }

    /// `None` moves the note back to unclassified. An unknown intent is
    /// ignored.
    pub fn classify_sticky_note(&self, note_id: &str, intent_id: Option<&str>) {
        if let Some(i) = intent_id {
            if self.state().intent(i).is_none() {
                log::warn!("Ignoring classification under unknown intent {i}");
                return;
            }
        }
        let note_id = note_id.to_string();
        let intent_id = intent_id.map(str::to_string);
        self.set_sticky_notes(Update::with(move |ns: &Vec<StickyNote>| {
            ops::classify_note(ns, &note_id, intent_id.as_deref())
        }));
    }

    pub fn add_intent(&self, name: &str) -> Option<IntentId> {
        let intent = ops::new_intent(name)?;
        let id = intent.id.clone();
        self.set_intents(Update::with(move |is: &Vec<Intent>| ops::append(is, intent)));
        Some(id)
    }

    // ─── Stage 2: groups and flowcharts ───────────────────────────────

    pub fn add_group(&self) -> GroupId {
        let group = ops::new_group(&self.state().groups);
        let id = group.id.clone();
        self.set_groups(Update::with(move |gs: &Vec<Group>| ops::append(gs, group)));
        id
    }

    pub fn select_intent(&self, group_id: &str, intent_id: Option<&str>) {
        let intent_id = intent_id.map(str::to_string);
        self.set_flowchart_editor_for_group(
            group_id,
            Update::with(move |d: &FlowchartEditorDraft| ops::select_intent(d, intent_id.as_deref())),
        );
    }

    pub fn add_flow_step(
        &self,
        group_id: &str,
        actor: FlowStepActor,
        description: &str,
        response_type: Option<ResponseType>,
        options: Vec<String>,
    ) {
        let step = FlowStep::new(actor, description, response_type, options);
        self.set_flowchart_editor_for_group(
            group_id,
            Update::with(move |d: &FlowchartEditorDraft| ops::add_step(d, step)),
        );
    }

    pub fn delete_flow_step(&self, group_id: &str, step_id: &str) {
        let step_id = step_id.to_string();
        self.set_flowchart_editor_for_group(
            group_id,
            Update::with(move |d: &FlowchartEditorDraft| ops::delete_step(d, &step_id)),
        );
    }

    /// Open one of the group's saved flowcharts in its draft.
    pub fn edit_flowchart(&self, group_id: &str, flowchart_id: &str) {
        let doc = self.state();
        match doc.flowchart(flowchart_id) {
            Some(f) if f.group_id == group_id => {
                self.set_flowchart_editor_for_group(group_id, ops::load_flowchart(f));
            }
            _ => log::warn!("Group {group_id} has no flowchart {flowchart_id}"),
        }
    }

    pub fn clear_draft(&self, group_id: &str) {
        self.set_flowchart_editor_for_group(group_id, FlowchartEditorDraft::default());
    }

    /// Save the group's draft as a flowchart and clear the draft, in one
    /// write. Ignored without a selected intent or steps.
    pub fn save_flowchart(&self, group_id: &str) {
        let doc = self.state();
        let draft = doc.flowchart_editor.draft_for(group_id);
        let Some(flowcharts) = ops::save_draft(&doc.flowcharts, &draft, group_id, &doc.intents)
        else {
            log::debug!("Draft for {group_id} is not ready to save");
            return;
        };
        let mut patch = fields::FLOWCHARTS.patch(flowcharts);
        patch.merge(DocumentPatch::draft(group_id, FlowchartEditorDraft::default()));
        self.dispatch(patch);
    }

    pub fn delete_flowchart(&self, flowchart_id: &str) {
        let flowchart_id = flowchart_id.to_string();
        self.set_flowcharts(Update::with(move |fs: &Vec<Flowchart>| ops::remove(fs, &flowchart_id)));
    }

    // ─── Stage 3: matrix and voting ───────────────────────────────────

    /// Move a flowchart between quadrants. Ignored while voting is open.
    pub fn place_flowchart(&self, flowchart_id: &str, quadrant: Option<MatrixQuadrant>) {
        if self.state().is_voting {
            log::debug!("Ignoring placement while voting");
            return;
        }
        let flowchart_id = flowchart_id.to_string();
        self.set_flowcharts(Update::with(move |fs: &Vec<Flowchart>| {
            ops::place_flowchart(fs, &flowchart_id, quadrant)
        }));
    }

    /// Cast one vote. Returns whether it was accepted: voting must be open,
    /// the flowchart must exist and this participant must have votes left.
    pub fn vote(&self, flowchart_id: &str) -> bool {
        let doc = self.state();
        if !doc.is_voting || doc.flowchart(flowchart_id).is_none() {
            return false;
        }
        let budget = self.config.vote_budget;
        let spent = self
            .votes_cast
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cast| {
                (cast < budget).then_some(cast + 1)
            });
        if spent.is_err() {
            log::debug!("Vote budget exhausted");
            return false;
        }
        let flowchart_id = flowchart_id.to_string();
        self.set_flowcharts(Update::with(move |fs: &Vec<Flowchart>| ops::vote(fs, &flowchart_id)));
        true
    }

    // ─── Plumbing ─────────────────────────────────────────────────────

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Compute a field's next value and write it if it changed.
    fn commit<T: PartialEq>(&self, field: &Field<T>, update: Update<T>) {
        let doc = self.state();
        let current = field.read(&doc);
        let next = apply_update(current, update);
        if &next == current {
            log::trace!("{} unchanged; skipping write", field.name);
            return;
        }
        self.dispatch(field.patch(next));
    }

    fn dispatch(&self, patch: DocumentPatch) {
        if patch.is_empty() {
            return;
        }
        log::debug!("Writing {:?}", patch.field_names());
        if self.immediate {
            self.store.save_now(&patch);
        } else if self.writer.send(WriterCommand::Save(patch)).is_err() {
            log::error!("Writer task stopped; dropping write");
        }
    }
}

/// Adopt `doc` wholesale and mark the controller ready.
fn replace(
    snapshot: &RwLock<Snapshot>,
    changes: &watch::Sender<Arc<WorkshopDocument>>,
    doc: Arc<WorkshopDocument>,
) {
    {
        let mut snap = snapshot.write().unwrap_or_else(|e| e.into_inner());
        snap.document = doc.clone();
        snap.ready = true;
    }
    changes.send_replace(doc);
}

impl<S: WorkshopStore> Drop for WorkshopController<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
