//! An idle-enabled match table.
//!
//! Each stage keeps its own task queue, entry slots and metadata, so stages
//! never contend with each other. Lock order is task queue, then stage state,
//! then the table's notification maps. User callbacks run with no lock held.

use parking_lot::{Mutex, RwLock};
use pipe_mgr_common::IdleConfig;
use pipe_mgr_types::{
    DevId, EntHdl, LockId, LogicalTblId, MatchSpec, PipeBitmap, PipeId, PipeMgrError, PipeResult,
    StageId, TblHdl, ALL_PIPES, MAX_PIPES,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::driver::IdleDriver;
use crate::message::{IdleMsg, DUMP_ENTRIES_PER_MSG, MAX_MSG_INDEX};
use crate::metadata::{IdleEntryMetadata, MetadataStore};
use crate::state::{HitState, IdleEntry, NotifyEvent, NotifyState, PollState};
use crate::task::{IdleTask, StageEvent, TaskQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleMode {
    /// Hardware reports idle/active transitions; software sweeps long TTLs.
    Notify,
    /// The application queries activity gathered from hardware dumps.
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLayout {
    pub stage_id: StageId,
    pub logical_tbl: LogicalTblId,
    pub num_entries: u32,
}

impl StageLayout {
    pub fn new(stage_id: StageId, logical_tbl: LogicalTblId, num_entries: u32) -> Self {
        Self {
            stage_id,
            logical_tbl,
            num_entries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleTableConfig {
    pub dev_id: DevId,
    pub tbl_hdl: TblHdl,
    pub mode: IdleMode,
    /// Symmetric tables address every pipe at once with `ALL_PIPES`.
    pub symmetric: bool,
    pub pipes: PipeBitmap,
    pub stages: Vec<StageLayout>,
    /// Granularity of hardware idle notifications.
    pub notify_period_ms: u32,
    /// Zero processes hardware messages inline instead of on the sweep.
    pub sweep_period_ms: u32,
    pub max_ttl_ms: u32,
}

impl IdleTableConfig {
    pub fn new(dev_id: DevId, tbl_hdl: TblHdl, mode: IdleMode, pipes: PipeBitmap) -> Self {
        Self {
            dev_id,
            tbl_hdl,
            mode,
            symmetric: true,
            pipes,
            stages: Vec::new(),
            notify_period_ms: 1000,
            sweep_period_ms: 100,
            max_ttl_ms: u32::MAX,
        }
    }

    pub fn with_stage(mut self, layout: StageLayout) -> Self {
        self.stages.push(layout);
        self
    }

    pub fn asymmetric(mut self) -> Self {
        self.symmetric = false;
        self
    }

    pub fn with_periods(mut self, notify_period_ms: u32, sweep_period_ms: u32) -> Self {
        self.notify_period_ms = notify_period_ms;
        self.sweep_period_ms = sweep_period_ms;
        self
    }

    /// Takes the sweep period from the device-wide idle configuration.
    pub fn with_idle_config(mut self, config: &IdleConfig) -> Self {
        self.sweep_period_ms = u32::try_from(config.default_sweep_period().as_millis()).unwrap_or(u32::MAX);
        self
    }

    pub fn with_max_ttl(mut self, max_ttl_ms: u32) -> Self {
        self.max_ttl_ms = max_ttl_ms;
        self
    }

    pub fn validate(&self) -> PipeResult<()> {
        if self.pipes.is_empty() || self.pipes.iter().any(|p| p >= MAX_PIPES) {
            return Err(PipeMgrError::invalid_arg(format!(
                "table {:#x} pipes {}",
                self.tbl_hdl, self.pipes
            )));
        }
        if self.stages.is_empty() {
            return Err(PipeMgrError::invalid_arg(format!(
                "table {:#x} has no idle stages",
                self.tbl_hdl
            )));
        }
        let mut seen = BTreeSet::new();
        for layout in &self.stages {
            if !seen.insert(layout.stage_id) {
                return Err(PipeMgrError::invalid_arg(format!("duplicate stage {}", layout.stage_id)));
            }
            if layout.num_entries == 0 || layout.num_entries > MAX_MSG_INDEX {
                return Err(PipeMgrError::invalid_arg(format!(
                    "stage {} entry count {}",
                    layout.stage_id, layout.num_entries
                )));
            }
        }
        if self.mode == IdleMode::Notify {
            if self.notify_period_ms == 0 {
                return Err(PipeMgrError::invalid_arg("notify period of zero"));
            }
            // TTLs beyond one notify period decay in software.
            if self.max_ttl_ms > self.notify_period_ms && self.sweep_period_ms == 0 {
                return Err(PipeMgrError::invalid_arg(format!(
                    "max TTL {}ms exceeds notify period {}ms without a sweep",
                    self.max_ttl_ms, self.notify_period_ms
                )));
            }
        }
        Ok(())
    }
}

/// Parameters of a new entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryAdd {
    pub ent_hdl: EntHdl,
    pub pipe: PipeId,
    pub stage: StageId,
    pub index: u32,
    pub ttl: u32,
    /// Remaining TTL; below `ttl` when the entry was already decaying.
    pub cur_ttl: u32,
    pub poll_state: PollState,
    pub match_spec: Option<MatchSpec>,
}

impl EntryAdd {
    pub fn new(ent_hdl: EntHdl, pipe: PipeId, stage: StageId, index: u32, ttl: u32) -> Self {
        Self {
            ent_hdl,
            pipe,
            stage,
            index,
            ttl,
            cur_ttl: ttl,
            poll_state: PollState::Active,
            match_spec: None,
        }
    }

    pub fn with_cur_ttl(mut self, cur_ttl: u32) -> Self {
        self.cur_ttl = cur_ttl;
        self
    }

    pub fn with_poll_state(mut self, poll_state: PollState) -> Self {
        self.poll_state = poll_state;
        self
    }

    pub fn with_match_spec(mut self, match_spec: MatchSpec) -> Self {
        self.match_spec = Some(match_spec);
        self
    }
}

/// Delivered to the application when an entry ages out or becomes active
/// again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleNotification {
    pub dev_id: DevId,
    pub tbl_hdl: TblHdl,
    pub ent_hdl: EntHdl,
    pub hit_state: HitState,
    pub match_spec: Option<MatchSpec>,
}

pub type IdleCallback = Arc<dyn Fn(&IdleNotification) + Send + Sync>;

/// Handles last reported to the application, and the match specs handed
/// back with notifications.
#[derive(Debug, Default)]
struct NotifMaps {
    idle: BTreeSet<EntHdl>,
    active: BTreeSet<EntHdl>,
    match_specs: HashMap<EntHdl, MatchSpec>,
}

impl NotifMaps {
    fn forget(&mut self, ent_hdl: EntHdl) {
        self.idle.remove(&ent_hdl);
        self.active.remove(&ent_hdl);
        self.match_specs.remove(&ent_hdl);
    }
}

type SlotKey = (PipeId, u32);

#[derive(Debug)]
struct StageState {
    /// Entry slots per scope: `ALL_PIPES` for symmetric tables, otherwise
    /// one per pipe.
    scopes: BTreeMap<PipeId, Vec<IdleEntry>>,
    metadata: MetadataStore,
    sweep_candidates: BTreeSet<SlotKey>,
    sweeps: BTreeSet<SlotKey>,
}

#[derive(Debug)]
struct IdleStage {
    layout: StageLayout,
    tlist: Mutex<TaskQueue>,
    state: Mutex<StageState>,
}

fn slot(scopes: &mut BTreeMap<PipeId, Vec<IdleEntry>>, key: SlotKey) -> Option<&mut IdleEntry> {
    scopes.get_mut(&key.0)?.get_mut(key.1 as usize)
}

fn owned_slot(
    scopes: &mut BTreeMap<PipeId, Vec<IdleEntry>>,
    key: SlotKey,
    ent_hdl: EntHdl,
) -> Option<&mut IdleEntry> {
    slot(scopes, key).filter(|e| e.inuse && e.ent_hdl == ent_hdl)
}

/// Snapshot of one occupied slot.
#[derive(Debug, Clone, Serialize)]
pub struct IdleSlotDump {
    pub scope: PipeId,
    pub index: u32,
    pub entry: IdleEntry,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdleStageDump {
    pub stage_id: StageId,
    pub logical_tbl: LogicalTblId,
    pub pending_tasks: usize,
    pub pending_locks: Vec<LockId>,
    pub deferred_events: usize,
    pub metadata_entries: usize,
    pub sweep_candidates: usize,
    pub sweeping: usize,
    pub entries: Vec<IdleSlotDump>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdleTableDump {
    pub dev_id: DevId,
    pub tbl_hdl: TblHdl,
    pub mode: IdleMode,
    pub symmetric: bool,
    pub stages: Vec<IdleStageDump>,
    pub notified_idle: Vec<EntHdl>,
    pub notified_active: Vec<EntHdl>,
}

pub struct IdleTable {
    config: IdleTableConfig,
    driver: Arc<dyn IdleDriver>,
    stages: Vec<IdleStage>,
    notif: Mutex<NotifMaps>,
    callback: RwLock<Option<IdleCallback>>,
    next_lock_id: AtomicU16,
}

impl std::fmt::Debug for IdleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleTable")
            .field("config", &self.config)
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl IdleTable {
    pub fn new(config: IdleTableConfig, driver: Arc<dyn IdleDriver>) -> PipeResult<Self> {
        config.validate()?;
        let stages = config
            .stages
            .iter()
            .map(|layout| {
                let slots = vec![IdleEntry::default(); layout.num_entries as usize];
                let scopes = if config.symmetric {
                    BTreeMap::from([(ALL_PIPES, slots)])
                } else {
                    config.pipes.iter().map(|p| (p, slots.clone())).collect()
                };
                IdleStage {
                    layout: *layout,
                    tlist: Mutex::new(TaskQueue::new()),
                    state: Mutex::new(StageState {
                        scopes,
                        metadata: MetadataStore::new(),
                        sweep_candidates: BTreeSet::new(),
                        sweeps: BTreeSet::new(),
                    }),
                }
            })
            .collect();
        info!(
            dev_id = config.dev_id,
            tbl_hdl = config.tbl_hdl,
            mode = ?config.mode,
            pipes = %config.pipes,
            "Idle table created"
        );
        Ok(Self {
            config,
            driver,
            stages,
            notif: Mutex::new(NotifMaps::default()),
            callback: RwLock::new(None),
            next_lock_id: AtomicU16::new(1),
        })
    }

    pub fn config(&self) -> &IdleTableConfig {
        &self.config
    }

    pub fn tbl_hdl(&self) -> TblHdl {
        self.config.tbl_hdl
    }

    pub fn layouts(&self) -> impl Iterator<Item = &StageLayout> {
        self.stages.iter().map(|s| &s.layout)
    }

    pub fn register_callback(&self, callback: IdleCallback) {
        *self.callback.write() = Some(callback);
    }

    fn inline_processing(&self) -> bool {
        self.config.sweep_period_ms == 0
    }

    fn stage_index(&self, stage: StageId) -> PipeResult<usize> {
        self.stages
            .iter()
            .position(|s| s.layout.stage_id == stage)
            .ok_or_else(|| {
                PipeMgrError::invalid_arg(format!(
                    "stage {} of idle table {:#x}",
                    stage, self.config.tbl_hdl
                ))
            })
    }

    pub(crate) fn stage_index_of(&self, stage: StageId, logical_tbl: LogicalTblId) -> Option<usize> {
        self.stages
            .iter()
            .position(|s| s.layout.stage_id == stage && s.layout.logical_tbl == logical_tbl)
    }

    fn scope_of(&self, pipe: PipeId) -> PipeId {
        if self.config.symmetric {
            ALL_PIPES
        } else {
            pipe
        }
    }

    fn scope_pipes(&self, scope: PipeId) -> PipeBitmap {
        if scope == ALL_PIPES {
            self.config.pipes
        } else {
            PipeBitmap::from_pipes([scope])
        }
    }

    fn check_scope(&self, pipe: PipeId) -> PipeResult<()> {
        let ok = if self.config.symmetric {
            pipe == ALL_PIPES
        } else {
            pipe != ALL_PIPES && self.config.pipes.contains(pipe)
        };
        if !ok {
            return Err(PipeMgrError::invalid_arg(format!(
                "pipe {:#x} for {} idle table {:#x}",
                pipe,
                if self.config.symmetric { "symmetric" } else { "asymmetric" },
                self.config.tbl_hdl
            )));
        }
        Ok(())
    }

    fn check_index(&self, stage_idx: usize, index: u32) -> PipeResult<()> {
        let layout = &self.stages[stage_idx].layout;
        if index >= layout.num_entries {
            return Err(PipeMgrError::invalid_arg(format!(
                "index {} beyond {} entries of stage {}",
                index, layout.num_entries, layout.stage_id
            )));
        }
        Ok(())
    }

    fn check_ttl(&self, ttl: u32) -> PipeResult<()> {
        if ttl > self.config.max_ttl_ms {
            return Err(PipeMgrError::invalid_arg(format!(
                "TTL {}ms above maximum {}ms",
                ttl, self.config.max_ttl_ms
            )));
        }
        Ok(())
    }

    fn require_mode(&self, mode: IdleMode, operation: &str) -> PipeResult<()> {
        if self.config.mode != mode {
            return Err(PipeMgrError::not_supported(format!(
                "{} on {:?}-mode idle table {:#x}",
                operation, self.config.mode, self.config.tbl_hdl
            )));
        }
        Ok(())
    }

    /// Records a new entry. It starts aging once hardware acknowledged the
    /// lock issued after the write.
    #[instrument(skip(self, add), fields(tbl_hdl = self.config.tbl_hdl, ent_hdl = add.ent_hdl))]
    pub fn entry_add(&self, add: EntryAdd) -> PipeResult<()> {
        let stage_idx = self.stage_index(add.stage)?;
        self.check_scope(add.pipe)?;
        self.check_index(stage_idx, add.index)?;
        self.check_ttl(add.ttl)?;

        let stage = &self.stages[stage_idx];
        let mut tlist = stage.tlist.lock();
        let mut state = stage.state.lock();
        for pipe in self.scope_pipes(add.pipe).iter() {
            state
                .metadata
                .add(add.ent_hdl, pipe, add.index, add.ttl, add.cur_ttl.min(add.ttl))?;
        }
        tlist.push(IdleTask::Add {
            pipe: add.pipe,
            add_idx: add.index,
            ent_hdl: add.ent_hdl,
            poll_state: add.poll_state,
        });
        if let Some(spec) = add.match_spec {
            self.notif.lock().match_specs.insert(add.ent_hdl, spec);
        }
        debug!(index = add.index, ttl = add.ttl, "Idle entry add queued");
        Ok(())
    }

    #[instrument(skip(self), fields(tbl_hdl = self.config.tbl_hdl))]
    pub fn entry_delete(&self, ent_hdl: EntHdl, pipe: PipeId, stage: StageId, index: u32) -> PipeResult<()> {
        let stage_idx = self.stage_index(stage)?;
        self.check_scope(pipe)?;
        self.check_index(stage_idx, index)?;

        let stage = &self.stages[stage_idx];
        let mut tlist = stage.tlist.lock();
        let mut state = stage.state.lock();
        for p in self.scope_pipes(pipe).iter() {
            state.metadata.del(ent_hdl, p, index)?;
        }
        tlist.push(IdleTask::Del {
            pipe,
            del_idx: index,
            ent_hdl,
        });
        Ok(())
    }

    #[instrument(skip(self), fields(tbl_hdl = self.config.tbl_hdl))]
    pub fn entry_move(
        &self,
        ent_hdl: EntHdl,
        pipe: PipeId,
        stage: StageId,
        src_idx: u32,
        dest_idx: u32,
    ) -> PipeResult<()> {
        let stage_idx = self.stage_index(stage)?;
        self.check_scope(pipe)?;
        self.check_index(stage_idx, src_idx)?;
        self.check_index(stage_idx, dest_idx)?;

        let stage = &self.stages[stage_idx];
        let mut tlist = stage.tlist.lock();
        let mut state = stage.state.lock();
        for p in self.scope_pipes(pipe).iter() {
            state.metadata.mv(ent_hdl, p, src_idx, dest_idx)?;
        }
        tlist.push(IdleTask::Move {
            pipe,
            src_idx,
            dest_idx,
            ent_hdl,
        });
        Ok(())
    }

    /// Changes an entry's TTL. A TTL of zero idles it without a callback.
    #[instrument(skip(self), fields(tbl_hdl = self.config.tbl_hdl))]
    pub fn entry_update_ttl(&self, ent_hdl: EntHdl, stage: StageId, ttl: u32) -> PipeResult<()> {
        self.check_ttl(ttl)?;
        let stage_idx = self.stage_index(stage)?;
        self.queue_ttl_task(stage_idx, IdleTask::UpdateTtl { ent_hdl }, |md| md.ttl_dirty(ent_hdl, ttl))
    }

    /// Restarts an entry's TTL from its configured value.
    #[instrument(skip(self), fields(tbl_hdl = self.config.tbl_hdl))]
    pub fn entry_reset_ttl(&self, ent_hdl: EntHdl, stage: StageId) -> PipeResult<()> {
        self.require_mode(IdleMode::Notify, "reset TTL")?;
        let stage_idx = self.stage_index(stage)?;
        self.queue_ttl_task(stage_idx, IdleTask::ResetTtl { ent_hdl }, |md| {
            let ttl = md
                .get(ent_hdl)
                .map(|m| m.new_ttl)
                .ok_or_else(|| PipeMgrError::not_found(format!("idle entry {}", ent_hdl)))?;
            md.set_cur_ttl(ent_hdl, ttl)
        })
    }

    fn queue_ttl_task<F>(&self, stage_idx: usize, task: IdleTask, update: F) -> PipeResult<()>
    where
        F: FnOnce(&mut MetadataStore) -> PipeResult<()>,
    {
        let stage = &self.stages[stage_idx];
        let notes = {
            let mut tlist = stage.tlist.lock();
            let mut state = stage.state.lock();
            update(&mut state.metadata)?;
            tlist.push(task);
            if !self.inline_processing() {
                return Ok(());
            }
            let mut hits = Vec::new();
            for task in tlist.drain_ready() {
                self.apply_task(&mut state, task, &mut hits);
            }
            self.notifications(hits)
        };
        self.dispatch(&notes);
        Ok(())
    }

    /// Closes the pending task lists of every stage under a fresh lock id.
    /// Hardware acknowledges it once per pipe and stage.
    pub fn issue_lock(&self) -> LockId {
        let lock_id = self.next_lock_id.fetch_add(1, Ordering::Relaxed);
        for stage in &self.stages {
            stage.tlist.lock().seal_with_lock(lock_id, self.config.pipes);
        }
        debug!(tbl_hdl = self.config.tbl_hdl, lock_id, "Idle lock issued");
        lock_id
    }

    /// Remaining TTL in milliseconds.
    pub fn get_ttl(&self, ent_hdl: EntHdl, stage: StageId) -> PipeResult<u32> {
        self.require_mode(IdleMode::Notify, "get TTL")?;
        Ok(self.entry_mdata_get(ent_hdl, stage)?.cur_ttl)
    }

    /// Copy of an entry's TTLs and locations.
    pub fn entry_mdata_get(&self, ent_hdl: EntHdl, stage: StageId) -> PipeResult<IdleEntryMetadata> {
        let stage_idx = self.stage_index(stage)?;
        self.stages[stage_idx]
            .state
            .lock()
            .metadata
            .get(ent_hdl)
            .ok_or_else(|| PipeMgrError::not_found(format!("idle entry {}", ent_hdl)))
    }

    fn live_slots(&self, md: &IdleEntryMetadata) -> BTreeSet<SlotKey> {
        md.locations()
            .iter()
            .filter(|l| l.index_valid)
            .map(|l| (self.scope_of(l.pipe), l.cur_index))
            .collect()
    }

    /// Poll state of an entry; active if any of its locations is.
    pub fn get_poll_state(&self, ent_hdl: EntHdl, stage: StageId) -> PipeResult<PollState> {
        self.require_mode(IdleMode::Poll, "get poll state")?;
        let stage_idx = self.stage_index(stage)?;
        let mut state = self.stages[stage_idx].state.lock();
        let state = &mut *state;
        let md = state
            .metadata
            .get(ent_hdl)
            .ok_or_else(|| PipeMgrError::not_found(format!("idle entry {}", ent_hdl)))?;
        Ok(self
            .live_slots(&md)
            .into_iter()
            .filter_map(|key| owned_slot(&mut state.scopes, key, ent_hdl).map(|e| e.poll_state))
            .max()
            .unwrap_or_default())
    }

    pub fn set_poll_state(&self, ent_hdl: EntHdl, stage: StageId, poll_state: PollState) -> PipeResult<()> {
        self.require_mode(IdleMode::Poll, "set poll state")?;
        let stage_idx = self.stage_index(stage)?;
        let mut state = self.stages[stage_idx].state.lock();
        let state = &mut *state;
        let md = state
            .metadata
            .get(ent_hdl)
            .ok_or_else(|| PipeMgrError::not_found(format!("idle entry {}", ent_hdl)))?;
        for key in self.live_slots(&md) {
            if let Some(entry) = owned_slot(&mut state.scopes, key, ent_hdl) {
                entry.poll_state = poll_state;
                entry.update_count = 0;
            }
        }
        Ok(())
    }

    /// Asks hardware for fresh activity bits on every pipe and stage.
    #[instrument(skip(self), fields(tbl_hdl = self.config.tbl_hdl))]
    pub fn update_hit_state(&self) -> PipeResult<()> {
        self.require_mode(IdleMode::Poll, "update hit state")?;
        for stage in &self.stages {
            for pipe in self.config.pipes.iter() {
                self.driver.request_dump(
                    self.config.dev_id,
                    self.config.tbl_hdl,
                    pipe,
                    stage.layout.stage_id,
                    stage.layout.logical_tbl,
                )?;
            }
        }
        Ok(())
    }

    pub fn notify_state(&self, ent_hdl: EntHdl, stage: StageId) -> PipeResult<NotifyState> {
        let stage_idx = self.stage_index(stage)?;
        let mut state = self.stages[stage_idx].state.lock();
        let state = &mut *state;
        let md = state
            .metadata
            .get(ent_hdl)
            .ok_or_else(|| PipeMgrError::not_found(format!("idle entry {}", ent_hdl)))?;
        Ok(self
            .live_slots(&md)
            .into_iter()
            .find_map(|key| owned_slot(&mut state.scopes, key, ent_hdl).map(|e| e.notify_state))
            .unwrap_or_default())
    }

    /// Runs one sweep of a stage and returns the number of callbacks made.
    pub fn sweep(&self, stage: StageId) -> PipeResult<usize> {
        let stage_idx = self.stage_index(stage)?;
        Ok(self.tick(stage_idx))
    }

    pub(crate) fn tick(&self, stage_idx: usize) -> usize {
        let notes = self.run_sweep(stage_idx);
        self.dispatch(&notes);
        notes.len()
    }

    /// Hands hardware messages for one pipe to a stage. Returns the
    /// notifications the caller must dispatch once it released its own
    /// ordering locks.
    pub(crate) fn deliver(&self, stage_idx: usize, pipe: PipeId, msgs: Vec<IdleMsg>) -> Vec<IdleNotification> {
        let Some(stage) = self.stages.get(stage_idx) else {
            return Vec::new();
        };
        let mut tlist = stage.tlist.lock();
        if !self.inline_processing() {
            tlist.defer(StageEvent { pipe, msgs });
            return Vec::new();
        }
        let mut state = stage.state.lock();
        let mut hits = Vec::new();
        self.apply_msgs(&mut tlist, &mut state, pipe, msgs, &mut hits);
        self.notifications(hits)
    }

    pub(crate) fn dispatch(&self, notes: &[IdleNotification]) {
        if notes.is_empty() {
            return;
        }
        let Some(callback) = self.callback.read().clone() else {
            debug!(tbl_hdl = self.config.tbl_hdl, count = notes.len(), "No idle callback registered");
            return;
        };
        for note in notes {
            callback(note);
        }
    }

    fn run_sweep(&self, stage_idx: usize) -> Vec<IdleNotification> {
        let Some(stage) = self.stages.get(stage_idx) else {
            return Vec::new();
        };
        let mut tlist = stage.tlist.lock();
        let mut state = stage.state.lock();
        let mut hits = Vec::new();

        for event in tlist.take_deferred() {
            self.apply_msgs(&mut tlist, &mut state, event.pipe, event.msgs, &mut hits);
        }
        for task in tlist.drain_ready() {
            self.apply_task(&mut state, task, &mut hits);
        }

        if self.config.mode == IdleMode::Notify {
            let state = &mut *state;
            for key in std::mem::take(&mut state.sweep_candidates) {
                if let Some(entry) = slot(&mut state.scopes, key) {
                    entry.apply(NotifyEvent::Promote);
                    if entry.notify_state == NotifyState::Sweep {
                        state.sweeps.insert(key);
                    }
                }
            }

            let period = self.config.sweep_period_ms;
            let sweeping: Vec<SlotKey> = state.sweeps.iter().copied().collect();
            for key in sweeping {
                let Some(entry) = slot(&mut state.scopes, key) else {
                    state.sweeps.remove(&key);
                    continue;
                };
                let note = entry.apply(NotifyEvent::SweepTick { period });
                let (ent_hdl, cur_ttl, next) = (entry.ent_hdl, entry.cur_ttl, entry.notify_state);
                if next != NotifyState::Sweep {
                    state.sweeps.remove(&key);
                }
                sync_cur_ttl(&mut state.metadata, ent_hdl, cur_ttl);
                if let Some(hit_state) = note {
                    hits.push((ent_hdl, hit_state));
                }
            }
        }
        self.notifications(hits)
    }

    fn apply_msgs(
        &self,
        tlist: &mut TaskQueue,
        state: &mut StageState,
        pipe: PipeId,
        msgs: Vec<IdleMsg>,
        hits: &mut Vec<(EntHdl, HitState)>,
    ) {
        for msg in msgs {
            match msg {
                IdleMsg::LockAck { lock_id } => {
                    if let Err(e) = tlist.ack_lock(lock_id, pipe) {
                        warn!(tbl_hdl = self.config.tbl_hdl, pipe, lock_id, error = %e, "Unmatched lock ack");
                        continue;
                    }
                    for task in tlist.drain_ready() {
                        self.apply_task(state, task, hits);
                    }
                }
                IdleMsg::Fsm { index, active } => self.apply_fsm(state, pipe, index, active, hits),
                IdleMsg::Dump { base_index, hits: bits } => self.apply_dump(state, pipe, base_index, bits),
            }
        }
    }

    fn apply_fsm(
        &self,
        state: &mut StageState,
        pipe: PipeId,
        index: u32,
        active: bool,
        hits: &mut Vec<(EntHdl, HitState)>,
    ) {
        if self.config.mode != IdleMode::Notify {
            warn!(tbl_hdl = self.config.tbl_hdl, pipe, index, "Idle FSM message on a poll-mode table");
            return;
        }
        let scope = self.scope_of(pipe);
        let key = (scope, index);
        let Some(entry) = slot(&mut state.scopes, key).filter(|e| e.inuse) else {
            debug!(tbl_hdl = self.config.tbl_hdl, pipe, index, "Idle FSM message for an empty slot");
            return;
        };

        let note = if active {
            entry.pipes_idle = PipeBitmap::EMPTY;
            let note = entry.apply(NotifyEvent::HwActive);
            state.sweep_candidates.remove(&key);
            state.sweeps.remove(&key);
            note
        } else {
            entry.pipes_idle.insert(pipe);
            if !entry.pipes_idle.is_superset_of(self.scope_pipes(scope)) {
                return;
            }
            entry.pipes_idle = PipeBitmap::EMPTY;
            let note = entry.apply(NotifyEvent::HwIdle {
                notify_period: self.config.notify_period_ms,
            });
            if entry.notify_state == NotifyState::SweepCandidate {
                state.sweep_candidates.insert(key);
            }
            note
        };
        sync_cur_ttl(&mut state.metadata, entry.ent_hdl, entry.cur_ttl);
        if let Some(hit_state) = note {
            hits.push((entry.ent_hdl, hit_state));
        }
    }

    fn apply_dump(&self, state: &mut StageState, pipe: PipeId, base_index: u32, bits: u8) {
        if self.config.mode != IdleMode::Poll {
            warn!(tbl_hdl = self.config.tbl_hdl, pipe, base_index, "Idle dump message on a notify-mode table");
            return;
        }
        let scope = self.scope_of(pipe);
        let pipe_count = self.scope_pipes(scope).count();
        for i in 0..DUMP_ENTRIES_PER_MSG {
            let Some(index) = base_index.checked_add(i) else {
                break;
            };
            if let Some(entry) = slot(&mut state.scopes, (scope, index)).filter(|e| e.inuse) {
                entry.apply_dump(bits & (1 << i) != 0, pipe_count);
            }
        }
    }

    fn apply_task(&self, state: &mut StageState, task: IdleTask, hits: &mut Vec<(EntHdl, HitState)>) {
        match task {
            IdleTask::Add {
                pipe: scope,
                add_idx,
                ent_hdl,
                poll_state,
            } => {
                let mut outcome = None;
                for pipe in self.scope_pipes(scope).iter() {
                    match state.metadata.activate(ent_hdl, pipe, add_idx) {
                        Ok(o) => outcome = Some(o),
                        Err(e) => warn!(ent_hdl, pipe, add_idx, error = %e, "Idle activation failed"),
                    }
                }
                let Some(outcome) = outcome else {
                    return;
                };
                if !outcome.proceed {
                    debug!(ent_hdl, add_idx, "Delete raced ahead of activation");
                    return;
                }
                let key = (self.scope_of(scope), add_idx);
                let Some(entry) = slot(&mut state.scopes, key) else {
                    return;
                };
                *entry = IdleEntry {
                    ent_hdl,
                    inuse: true,
                    init_ttl: outcome.ttl,
                    cur_ttl: outcome.cur_ttl,
                    poll_state,
                    ..IdleEntry::default()
                };
                if self.config.mode == IdleMode::Notify {
                    entry.apply(NotifyEvent::Add {
                        ttl: outcome.ttl,
                        cur_ttl: outcome.cur_ttl,
                    });
                    if entry.notify_state == NotifyState::SweepCandidate {
                        state.sweep_candidates.insert(key);
                    }
                    sync_cur_ttl(&mut state.metadata, ent_hdl, entry.cur_ttl);
                }
            }
            IdleTask::Del {
                pipe: scope,
                del_idx,
                ent_hdl,
            } => {
                let mut released = false;
                for pipe in self.scope_pipes(scope).iter() {
                    match state.metadata.process_del(ent_hdl, pipe, del_idx) {
                        Ok(gone) => released |= gone.is_some(),
                        Err(e) => warn!(ent_hdl, pipe, del_idx, error = %e, "Idle delete confirmation failed"),
                    }
                }
                let key = (self.scope_of(scope), del_idx);
                if let Some(entry) = owned_slot(&mut state.scopes, key, ent_hdl) {
                    entry.clear();
                    state.sweep_candidates.remove(&key);
                    state.sweeps.remove(&key);
                }
                if released {
                    self.notif.lock().forget(ent_hdl);
                }
            }
            IdleTask::Move {
                pipe: scope,
                src_idx,
                dest_idx,
                ent_hdl,
            } => {
                for pipe in self.scope_pipes(scope).iter() {
                    if let Err(e) = state.metadata.process_move(ent_hdl, pipe, src_idx, dest_idx) {
                        warn!(ent_hdl, pipe, src_idx, dest_idx, error = %e, "Idle move confirmation failed");
                    }
                }
                let scope = self.scope_of(scope);
                let (src, dest) = ((scope, src_idx), (scope, dest_idx));
                let Some(moved) = owned_slot(&mut state.scopes, src, ent_hdl).map(std::mem::take) else {
                    return;
                };
                if let Some(target) = slot(&mut state.scopes, dest) {
                    *target = moved;
                }
                if state.sweep_candidates.remove(&src) {
                    state.sweep_candidates.insert(dest);
                }
                if state.sweeps.remove(&src) {
                    state.sweeps.insert(dest);
                }
            }
            IdleTask::UpdateTtl { ent_hdl } => {
                let Some(md) = state.metadata.get(ent_hdl) else {
                    warn!(ent_hdl, "TTL update for an unknown idle entry");
                    return;
                };
                for key in self.live_slots(&md) {
                    let Some(entry) = owned_slot(&mut state.scopes, key, ent_hdl) else {
                        continue;
                    };
                    if self.config.mode == IdleMode::Poll {
                        entry.init_ttl = md.new_ttl;
                        continue;
                    }
                    if let Some(hit_state) = entry.apply(NotifyEvent::UpdateTtl {
                        ttl: md.new_ttl,
                        cur_ttl: md.cur_ttl,
                    }) {
                        hits.push((ent_hdl, hit_state));
                    }
                    let cur_ttl = entry.cur_ttl;
                    if entry.notify_state == NotifyState::Idle {
                        state.sweep_candidates.remove(&key);
                        state.sweeps.remove(&key);
                    }
                    sync_cur_ttl(&mut state.metadata, ent_hdl, cur_ttl);
                }
            }
            IdleTask::ResetTtl { ent_hdl } => {
                let Some(md) = state.metadata.get(ent_hdl) else {
                    warn!(ent_hdl, "TTL reset for an unknown idle entry");
                    return;
                };
                for key in self.live_slots(&md) {
                    let Some(entry) = owned_slot(&mut state.scopes, key, ent_hdl) else {
                        continue;
                    };
                    entry.pipes_idle = PipeBitmap::EMPTY;
                    entry.apply(NotifyEvent::ResetTtl);
                    let cur_ttl = entry.cur_ttl;
                    if entry.notify_state == NotifyState::Active {
                        state.sweep_candidates.remove(&key);
                        state.sweeps.remove(&key);
                    }
                    sync_cur_ttl(&mut state.metadata, ent_hdl, cur_ttl);
                }
            }
        }
    }

    /// Records what the application is told and attaches match specs.
    fn notifications(&self, hits: Vec<(EntHdl, HitState)>) -> Vec<IdleNotification> {
        if hits.is_empty() {
            return Vec::new();
        }
        let mut maps = self.notif.lock();
        hits.into_iter()
            .map(|(ent_hdl, hit_state)| {
                match hit_state {
                    HitState::Idle => {
                        maps.active.remove(&ent_hdl);
                        maps.idle.insert(ent_hdl);
                    }
                    HitState::Active => {
                        maps.idle.remove(&ent_hdl);
                        maps.active.insert(ent_hdl);
                    }
                }
                IdleNotification {
                    dev_id: self.config.dev_id,
                    tbl_hdl: self.config.tbl_hdl,
                    ent_hdl,
                    hit_state,
                    match_spec: maps.match_specs.get(&ent_hdl).cloned(),
                }
            })
            .collect()
    }

    /// Diagnostic snapshot of every stage.
    pub fn dump(&self) -> IdleTableDump {
        let stages = self
            .stages
            .iter()
            .map(|stage| {
                let tlist = stage.tlist.lock();
                let state = stage.state.lock();
                let entries = state
                    .scopes
                    .iter()
                    .flat_map(|(scope, slots)| {
                        slots.iter().enumerate().filter(|(_, e)| e.inuse).map(|(i, e)| IdleSlotDump {
                            scope: *scope,
                            index: i as u32,
                            entry: e.clone(),
                        })
                    })
                    .collect();
                IdleStageDump {
                    stage_id: stage.layout.stage_id,
                    logical_tbl: stage.layout.logical_tbl,
                    pending_tasks: tlist.pending_tasks(),
                    pending_locks: tlist.pending_locks(),
                    deferred_events: tlist.deferred_len(),
                    metadata_entries: state.metadata.len(),
                    sweep_candidates: state.sweep_candidates.len(),
                    sweeping: state.sweeps.len(),
                    entries,
                }
            })
            .collect();
        let maps = self.notif.lock();
        IdleTableDump {
            dev_id: self.config.dev_id,
            tbl_hdl: self.config.tbl_hdl,
            mode: self.config.mode,
            symmetric: self.config.symmetric,
            stages,
            notified_idle: maps.idle.iter().copied().collect(),
            notified_active: maps.active.iter().copied().collect(),
        }
    }
}

fn sync_cur_ttl(metadata: &mut MetadataStore, ent_hdl: EntHdl, cur_ttl: u32) {
    if let Err(e) = metadata.set_cur_ttl(ent_hdl, cur_ttl) {
        debug!(ent_hdl, error = %e, "No metadata to carry the current TTL");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct NullDriver {
        dumps: Mutex<Vec<(PipeId, StageId)>>,
    }

    impl IdleDriver for NullDriver {
        fn push_free_memory(&self, _: DevId, _: u8, _: u64, _: usize) -> PipeResult<()> {
            Ok(())
        }

        fn request_dump(&self, _: DevId, _: TblHdl, pipe: PipeId, stage: StageId, _: LogicalTblId) -> PipeResult<()> {
            self.dumps.lock().push((pipe, stage));
            Ok(())
        }
    }

    fn notify_table(sweep_period_ms: u32) -> IdleTable {
        let config = IdleTableConfig::new(0, 0x30, IdleMode::Notify, PipeBitmap::first_n(2))
            .with_stage(StageLayout::new(2, 1, 64))
            .with_periods(200, sweep_period_ms)
            .with_max_ttl(if sweep_period_ms == 0 { 200 } else { u32::MAX });
        IdleTable::new(config, Arc::new(NullDriver::default())).unwrap()
    }

    fn ack_all(table: &IdleTable, lock_id: LockId) {
        for pipe in 0..2 {
            table.deliver(0, pipe, vec![IdleMsg::LockAck { lock_id }]);
        }
    }

    #[test]
    fn test_config_validation() {
        let base = IdleTableConfig::new(0, 1, IdleMode::Notify, PipeBitmap::first_n(2));
        assert!(base.clone().validate().is_err());
        let with_stage = base.with_stage(StageLayout::new(0, 0, 16));
        with_stage.validate().unwrap();
        assert!(with_stage.clone().with_periods(100, 0).validate().is_err());
        with_stage.clone().with_periods(100, 0).with_max_ttl(100).validate().unwrap();
        assert!(with_stage.clone().with_stage(StageLayout::new(0, 1, 16)).validate().is_err());
        let mut bad_pipes = with_stage;
        bad_pipes.pipes = PipeBitmap::from_pipes([MAX_PIPES]);
        assert!(bad_pipes.validate().is_err());
    }

    #[test]
    fn test_sweep_period_from_idle_config() {
        let idle = IdleConfig {
            default_sweep_period_ms: 250,
            ..IdleConfig::default()
        };
        let config = IdleTableConfig::new(0, 1, IdleMode::Notify, PipeBitmap::first_n(1)).with_idle_config(&idle);
        assert_eq!(config.sweep_period_ms, 250);
    }

    #[test]
    fn test_scope_and_index_checked() {
        let table = notify_table(100);
        let err = table.entry_add(EntryAdd::new(1, 0, 2, 0, 100)).unwrap_err();
        assert!(matches!(err, PipeMgrError::InvalidArg { .. }));
        assert!(table.entry_add(EntryAdd::new(1, ALL_PIPES, 2, 64, 100)).is_err());
        assert!(table.entry_add(EntryAdd::new(1, ALL_PIPES, 9, 0, 100)).is_err());
        table.entry_add(EntryAdd::new(1, ALL_PIPES, 2, 63, 100)).unwrap();
    }

    #[test]
    fn test_add_waits_for_every_pipe_ack() {
        let table = notify_table(0);
        table.entry_add(EntryAdd::new(5, ALL_PIPES, 2, 3, 200)).unwrap();
        let lock = table.issue_lock();
        table.deliver(0, 0, vec![IdleMsg::LockAck { lock_id: lock }]);
        assert_eq!(table.notify_state(5, 2).unwrap(), NotifyState::Invalid);
        table.deliver(0, 1, vec![IdleMsg::LockAck { lock_id: lock }]);
        assert_eq!(table.notify_state(5, 2).unwrap(), NotifyState::Active);
        assert_eq!(table.entry_mdata_get(5, 2).unwrap().refcount(), 2);
    }

    #[test]
    fn test_symmetric_idle_needs_every_pipe() {
        let table = notify_table(0);
        table.entry_add(EntryAdd::new(5, ALL_PIPES, 2, 3, 200)).unwrap();
        ack_all(&table, table.issue_lock());

        let idle = IdleMsg::Fsm { index: 3, active: false };
        assert!(table.deliver(0, 0, vec![idle]).is_empty());
        let notes = table.deliver(0, 1, vec![idle]);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].hit_state, HitState::Idle);

        let notes = table.deliver(0, 1, vec![IdleMsg::Fsm { index: 3, active: true }]);
        assert_eq!(notes[0].hit_state, HitState::Active);
        assert_eq!(table.dump().notified_active, vec![5]);
    }

    #[test]
    fn test_delete_confirmation_forgets_handle() {
        let table = notify_table(0);
        let spec = MatchSpec::exact(vec![1, 2]);
        table
            .entry_add(EntryAdd::new(5, ALL_PIPES, 2, 3, 200).with_match_spec(spec.clone()))
            .unwrap();
        ack_all(&table, table.issue_lock());
        let notes = table.deliver(0, 0, vec![IdleMsg::Fsm { index: 3, active: false }]);
        assert!(notes.is_empty());
        let notes = table.deliver(0, 1, vec![IdleMsg::Fsm { index: 3, active: false }]);
        assert_eq!(notes[0].match_spec, Some(spec));

        table.entry_delete(5, ALL_PIPES, 2, 3).unwrap();
        assert!(table.entry_mdata_get(5, 2).is_ok());
        ack_all(&table, table.issue_lock());
        assert!(table.entry_mdata_get(5, 2).unwrap_err().is_not_found());
        let dump = table.dump();
        assert!(dump.notified_idle.is_empty());
        assert!(dump.stages[0].entries.is_empty());
    }

    #[test]
    fn test_delete_ahead_of_activation_keeps_slot_empty() {
        let table = notify_table(100);
        let calls = Arc::new(Mutex::new(0usize));
        let sink = calls.clone();
        table.register_callback(Arc::new(move |_: &IdleNotification| *sink.lock() += 1));

        table.entry_add(EntryAdd::new(5, ALL_PIPES, 2, 3, 150)).unwrap();
        let add_lock = table.issue_lock();
        table.entry_delete(5, ALL_PIPES, 2, 3).unwrap();
        let del_lock = table.issue_lock();

        // Only the add is released; the delete already claimed the location.
        ack_all(&table, add_lock);
        for pipe in 0..2 {
            table.deliver(0, pipe, vec![IdleMsg::Fsm { index: 3, active: false }]);
        }
        table.sweep(2).unwrap();
        assert_eq!(table.notify_state(5, 2).unwrap(), NotifyState::Invalid);
        let dump = table.dump();
        assert!(dump.stages[0].entries.is_empty());
        assert_eq!(dump.stages[0].sweep_candidates, 0);
        assert_eq!(dump.stages[0].sweeping, 0);

        ack_all(&table, del_lock);
        table.sweep(2).unwrap();
        assert!(table.entry_mdata_get(5, 2).unwrap_err().is_not_found());
        assert!(table.dump().stages[0].entries.is_empty());
        assert_eq!(*calls.lock(), 0);
    }

    #[test]
    fn test_move_carries_sweep_membership() {
        let table = notify_table(100);
        table
            .entry_add(EntryAdd::new(5, ALL_PIPES, 2, 3, 1000).with_cur_ttl(600))
            .unwrap();
        ack_all(&table, table.issue_lock());
        assert_eq!(table.dump().stages[0].deferred_events, 2);
        // Activated, promoted and swept once in the same tick.
        table.sweep(2).unwrap();
        assert_eq!(table.notify_state(5, 2).unwrap(), NotifyState::Sweep);
        assert_eq!(table.get_ttl(5, 2).unwrap(), 500);

        table.entry_move(5, ALL_PIPES, 2, 3, 9).unwrap();
        ack_all(&table, table.issue_lock());
        table.sweep(2).unwrap();
        let dump = table.dump();
        assert_eq!(dump.stages[0].entries.len(), 1);
        assert_eq!(dump.stages[0].entries[0].index, 9);
        assert_eq!(dump.stages[0].sweeping, 1);
        assert_eq!(table.get_ttl(5, 2).unwrap(), 400);
    }

    #[test]
    fn test_update_ttl_zero_is_silent_idle() {
        let table = notify_table(0);
        table.entry_add(EntryAdd::new(5, ALL_PIPES, 2, 3, 200)).unwrap();
        ack_all(&table, table.issue_lock());
        let calls = Arc::new(Mutex::new(0usize));
        let counter = calls.clone();
        table.register_callback(Arc::new(move |_: &IdleNotification| *counter.lock() += 1));

        table.entry_update_ttl(5, 2, 0).unwrap();
        assert_eq!(table.notify_state(5, 2).unwrap(), NotifyState::Idle);
        assert_eq!(*calls.lock(), 0);

        table.entry_reset_ttl(5, 2).unwrap();
        assert_eq!(table.notify_state(5, 2).unwrap(), NotifyState::Active);
    }

    #[test]
    fn test_poll_operations_rejected_in_notify_mode() {
        let table = notify_table(100);
        assert!(matches!(
            table.update_hit_state().unwrap_err(),
            PipeMgrError::NotSupported { .. }
        ));
        assert!(table.get_poll_state(1, 2).is_err());
    }

    #[test]
    fn test_update_hit_state_requests_every_pipe() {
        let driver = Arc::new(NullDriver::default());
        let config = IdleTableConfig::new(0, 0x31, IdleMode::Poll, PipeBitmap::first_n(2))
            .with_stage(StageLayout::new(1, 0, 8))
            .with_stage(StageLayout::new(4, 0, 8));
        let table = IdleTable::new(config, driver.clone()).unwrap();
        table.update_hit_state().unwrap();
        assert_eq!(*driver.dumps.lock(), vec![(0, 1), (1, 1), (0, 4), (1, 4)]);
        assert!(table.get_ttl(1, 1).is_err());
    }
}
