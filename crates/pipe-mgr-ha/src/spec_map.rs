//! Per-table reconciliation index used during hitless HA.
//!
//! Entries decoded from hardware are ingested with [`SpecMap::new_spec`] (or
//! [`SpecMap::new_adt_spec`] for action-data tables). Each starts in its hash
//! chain and on the delete list. The application then replays its intended
//! entries through [`SpecMap::lookup_spec`], which moves the best candidate
//! to the full-match or modify list, or records a brand-new entry on the add
//! list. [`SpecMap::reconcile`] finally drains every list through the table
//! owner and consumes the map.
//!
//! Entries live in an arena indexed by position; chains and lists hold
//! arena indices. An entry taken out of its chain can never be matched again.

use crate::move_list::{EntryData, MoveList, MoveListNode};
use pipe_mgr_types::{
    ActFnHdl, ActionData, ActionSpec, DevId, EntHdl, MatchKey, MatchSpec, PipeId, PipeMgrError,
    PipeResult, ResourceTag, TblHdl,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::mem;
use tracing::{debug, error, info};

/// Classification of a restored entry against a replayed one.
///
/// Lower rank is a better match. `ActionDataDirty` and `ResourceMismatch`
/// share a rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HaEntryState {
    InvalidMatch,
    FullMatch,
    ActionDataMiss,
    ActionDataDirty,
    ActionHdlDirty,
    ResourceMismatch,
}

impl HaEntryState {
    pub fn rank(&self) -> u8 {
        match self {
            HaEntryState::FullMatch => 0,
            HaEntryState::ActionDataDirty | HaEntryState::ResourceMismatch => 1,
            HaEntryState::ActionHdlDirty => 2,
            HaEntryState::ActionDataMiss => 3,
            HaEntryState::InvalidMatch => 4,
        }
    }

    /// True if the restored entry can be kept (as-is or modified in place).
    pub fn is_reusable(&self) -> bool {
        self.rank() <= HaEntryState::ActionHdlDirty.rank()
    }
}

/// Which reconciliation list an entry sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HaList {
    ToDelete,
    ToAdd,
    ToModify,
    FullMatch,
}

/// Where an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrigin {
    /// Decoded from hardware at the given placement.
    Restored {
        pipe: PipeId,
        logical_idx: Option<u32>,
    },
    /// Created by a replay that matched nothing.
    Replayed,
}

/// State of an action-data entry referenced by a match entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdtEntryState {
    /// Present and matching what was replayed.
    Occupied,
    /// Present but rewritten during this reconciliation.
    Dirty,
    /// Not present.
    Absent,
}

/// Read access to the reconciliation state of an action-data table.
pub trait AdtStateView: Send + Sync {
    fn adt_entry_state(&self, ent_hdl: EntHdl) -> AdtEntryState;
}

impl AdtStateView for HashMap<EntHdl, AdtEntryState> {
    fn adt_entry_state(&self, ent_hdl: EntHdl) -> AdtEntryState {
        self.get(&ent_hdl).copied().unwrap_or(AdtEntryState::Absent)
    }
}

/// Static facts about the table a spec map reconciles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecMapConfig {
    pub dev_id: DevId,
    pub tbl_hdl: TblHdl,
    /// Exact-match table whose index is derived from the key hash. Only these
    /// tables may create entries during reconciliation.
    pub hash_action: bool,
    /// Table owns a directly addressed stateful resource that must always be
    /// rewritten.
    pub direct_stateful: bool,
    /// Full-match entries still need a state refresh because priority or
    /// TTL cannot be recovered from hardware (ternary, ALPM, idle tables).
    pub updates_needed_for_full_match_entries: bool,
}

impl SpecMapConfig {
    pub fn new(dev_id: DevId, tbl_hdl: TblHdl) -> Self {
        Self {
            dev_id,
            tbl_hdl,
            hash_action: false,
            direct_stateful: false,
            updates_needed_for_full_match_entries: false,
        }
    }
}

/// Counts captured when reconciliation starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcReport {
    pub tbl_hdl: TblHdl,
    pub added: usize,
    pub deleted: usize,
    pub modified: usize,
    pub full_match: usize,
}

/// One entry tracked by the spec map.
#[derive(Debug, Clone)]
pub struct HaEntry {
    ent_hdl: EntHdl,
    data: EntryData,
    origin: EntryOrigin,
    state: HaEntryState,
    list: HaList,
    key: SpecKey,
}

impl HaEntry {
    pub fn ent_hdl(&self) -> EntHdl {
        self.ent_hdl
    }

    pub fn data(&self) -> &EntryData {
        &self.data
    }

    pub fn origin(&self) -> EntryOrigin {
        self.origin
    }

    pub fn state(&self) -> HaEntryState {
        self.state
    }

    pub fn list(&self) -> HaList {
        self.list
    }

    /// Move-list node replaying this entry as an add at its own handle.
    pub fn to_add_node(&self) -> MoveListNode {
        let node = MoveListNode::add(self.ent_hdl, self.data.clone());
        match self.origin {
            EntryOrigin::Restored { pipe, logical_idx } => {
                let node = node.with_pipe(pipe);
                match logical_idx {
                    Some(idx) => node.with_logical_idx(idx),
                    None => node,
                }
            }
            EntryOrigin::Replayed => node,
        }
    }
}

/// Owner-supplied operations that turn reconciliation lists into a move list.
pub trait ReconcileOps {
    /// Refreshes software state of an entry already correct in hardware.
    fn entry_update(&mut self, entry: &HaEntry, move_list: &mut MoveList) -> PipeResult<()>;

    fn entry_delete(&mut self, ent_hdl: EntHdl, move_list: &mut MoveList) -> PipeResult<()>;

    /// Places a new entry at the handle chosen during replay, so handle
    /// numbering survives the restart.
    fn entry_place_with_hdl(&mut self, entry: &HaEntry, move_list: &mut MoveList)
        -> PipeResult<()>;

    fn entry_modify(&mut self, entry: &HaEntry, move_list: &mut MoveList) -> PipeResult<()>;
}

/// Canonical hash key of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SpecKey {
    Match(MatchKey),
    Adt {
        data: Vec<u8>,
        act_fn_hdl: ActFnHdl,
        sharable: bool,
    },
}

/// Reconciliation index for one table during an HA session.
pub struct SpecMap {
    config: SpecMapConfig,
    adt_view: Option<Box<dyn AdtStateView>>,
    entries: Vec<Option<HaEntry>>,
    chains: HashMap<SpecKey, Vec<usize>>,
    restored_hdls: HashSet<EntHdl>,
    to_delete: BTreeSet<usize>,
    to_add: Vec<usize>,
    to_modify: Vec<usize>,
    full_match: Vec<usize>,
}

impl SpecMap {
    pub fn new(config: SpecMapConfig) -> Self {
        Self {
            config,
            adt_view: None,
            entries: Vec::new(),
            chains: HashMap::new(),
            restored_hdls: HashSet::new(),
            to_delete: BTreeSet::new(),
            to_add: Vec::new(),
            to_modify: Vec::new(),
            full_match: Vec::new(),
        }
    }

    /// Attaches the view used to judge action-data handle references.
    pub fn with_adt_view(mut self, view: Box<dyn AdtStateView>) -> Self {
        self.adt_view = Some(view);
        self
    }

    pub fn config(&self) -> &SpecMapConfig {
        &self.config
    }

    /// Ingests an entry decoded from hardware.
    pub fn new_spec(&mut self, node: MoveListNode) -> PipeResult<()> {
        let data = node.data.ok_or_else(|| {
            PipeMgrError::invalid_arg(format!("entry {} restored without data", node.ent_hdl))
        })?;
        let match_spec = data.match_spec.as_ref().ok_or_else(|| {
            PipeMgrError::invalid_arg(format!("entry {} restored without match spec", node.ent_hdl))
        })?;
        let key = SpecKey::Match(match_spec.match_key());
        let origin = EntryOrigin::Restored {
            pipe: node.pipe,
            logical_idx: node.logical_idx,
        };
        self.ingest(node.ent_hdl, data, origin, key)
    }

    /// Ingests an action-data entry decoded from hardware.
    ///
    /// Entries that were shared before the restart are keyed as sharable, so
    /// a lookup can find them whether or not they are still shared.
    pub fn new_adt_spec(&mut self, node: MoveListNode, sharable: bool) -> PipeResult<()> {
        let data = node.data.ok_or_else(|| {
            PipeMgrError::invalid_arg(format!("adt entry {} restored without data", node.ent_hdl))
        })?;
        let bytes = match &data.action_spec.data {
            ActionData::Direct(bytes) => bytes.clone(),
            _ => {
                return Err(PipeMgrError::invalid_arg(format!(
                    "adt entry {} must carry direct action data",
                    node.ent_hdl
                )))
            }
        };
        let key = SpecKey::Adt {
            data: bytes,
            act_fn_hdl: data.act_fn_hdl,
            sharable,
        };
        let origin = EntryOrigin::Restored {
            pipe: node.pipe,
            logical_idx: node.logical_idx,
        };
        self.ingest(node.ent_hdl, data, origin, key)
    }

    fn ingest(
        &mut self,
        ent_hdl: EntHdl,
        data: EntryData,
        origin: EntryOrigin,
        key: SpecKey,
    ) -> PipeResult<()> {
        if !self.restored_hdls.insert(ent_hdl) {
            return Err(PipeMgrError::already_exists(format!(
                "tbl {:#x} entry {} already restored",
                self.config.tbl_hdl, ent_hdl
            )));
        }
        let idx = self.alloc(HaEntry {
            ent_hdl,
            data,
            origin,
            state: HaEntryState::InvalidMatch,
            list: HaList::ToDelete,
            key: key.clone(),
        })?;
        self.chains.entry(key).or_default().push(idx);
        self.to_delete.insert(idx);
        Ok(())
    }

    fn alloc(&mut self, entry: HaEntry) -> PipeResult<usize> {
        self.entries.try_reserve(1).map_err(|_| {
            PipeMgrError::no_resources(format!("spec map for tbl {:#x}", self.config.tbl_hdl))
        })?;
        self.entries.push(Some(entry));
        Ok(self.entries.len() - 1)
    }

    /// Matches an application-intended entry against restored entries.
    ///
    /// Returns the handle of the restored entry that will be kept, or
    /// `new_entry_hdl` when a fresh entry was recorded on the add list.
    /// Tables other than hash-action tables cannot discover entries any other
    /// way, so a miss there is `NotSupported`.
    pub fn lookup_spec(
        &mut self,
        match_spec: &MatchSpec,
        action_spec: &ActionSpec,
        act_fn_hdl: ActFnHdl,
        new_entry_hdl: EntHdl,
        ttl: u32,
    ) -> PipeResult<EntHdl> {
        let key = SpecKey::Match(match_spec.match_key());
        let mut best: Option<(usize, HaEntryState)> = None;

        if let Some(chain) = self.chains.get(&key) {
            for &idx in chain {
                let Some(entry) = self.entries[idx].as_ref() else {
                    continue;
                };
                let state = self.classify(&entry.data, action_spec, act_fn_hdl);
                if !state.is_reusable() {
                    continue;
                }
                if best.map_or(true, |(_, b)| state.rank() < b.rank()) {
                    best = Some((idx, state));
                    if state == HaEntryState::FullMatch {
                        break;
                    }
                }
            }
        }

        match best {
            Some((idx, state)) => {
                let list = if state == HaEntryState::FullMatch {
                    HaList::FullMatch
                } else {
                    HaList::ToModify
                };
                self.claim(idx, state, list)?;
                let entry = self.entries[idx]
                    .as_mut()
                    .ok_or_else(|| PipeMgrError::unexpected("claimed entry vanished"))?;
                if let Some(restored) = entry.data.match_spec.as_mut() {
                    restored.priority = match_spec.priority;
                }
                entry.data.action_spec = action_spec.clone();
                entry.data.ttl = ttl;
                debug!(
                    tbl_hdl = self.config.tbl_hdl,
                    ent_hdl = entry.ent_hdl,
                    state = ?state,
                    "Replayed entry matched restored entry"
                );
                Ok(entry.ent_hdl)
            }
            None if self.config.hash_action => {
                let data = EntryData {
                    match_spec: Some(match_spec.clone()),
                    action_spec: action_spec.clone(),
                    act_fn_hdl,
                    ttl,
                };
                self.push_new(new_entry_hdl, data, key)?;
                Ok(new_entry_hdl)
            }
            None => {
                error!(
                    dev_id = self.config.dev_id,
                    tbl_hdl = self.config.tbl_hdl,
                    key = %match_spec.match_key(),
                    "Replayed entry has no restored counterpart and the table cannot place new entries during HA"
                );
                Err(PipeMgrError::not_supported(format!(
                    "adding entries during HA reconciliation of tbl {:#x}",
                    self.config.tbl_hdl
                )))
            }
        }
    }

    /// Matches a replayed action-data entry, sharable key first.
    ///
    /// On a miss the entry is recorded on the add list under `new_entry_hdl`
    /// and `ObjectNotFound` tells the caller it must be freshly placed.
    pub fn lookup_adt_spec(
        &mut self,
        action_spec: &ActionSpec,
        act_fn_hdl: ActFnHdl,
        new_entry_hdl: EntHdl,
    ) -> PipeResult<EntHdl> {
        let bytes = action_spec.direct_data().ok_or_else(|| {
            PipeMgrError::invalid_arg("adt lookup requires direct action data")
        })?;

        for sharable in [true, false] {
            let key = SpecKey::Adt {
                data: bytes.to_vec(),
                act_fn_hdl,
                sharable,
            };
            let first = self.chains.get(&key).and_then(|chain| chain.first().copied());
            if let Some(idx) = first {
                self.claim(idx, HaEntryState::FullMatch, HaList::FullMatch)?;
                let entry = self.entries[idx]
                    .as_ref()
                    .ok_or_else(|| PipeMgrError::unexpected("claimed entry vanished"))?;
                return Ok(entry.ent_hdl);
            }
        }

        let data = EntryData::new(None, action_spec.clone(), act_fn_hdl);
        let key = SpecKey::Adt {
            data: bytes.to_vec(),
            act_fn_hdl,
            sharable: false,
        };
        self.push_new(new_entry_hdl, data, key)?;
        Err(PipeMgrError::not_found(format!(
            "adt entry for act fn {:#x} in tbl {:#x}",
            act_fn_hdl, self.config.tbl_hdl
        )))
    }

    fn push_new(&mut self, ent_hdl: EntHdl, data: EntryData, key: SpecKey) -> PipeResult<()> {
        let idx = self.alloc(HaEntry {
            ent_hdl,
            data,
            origin: EntryOrigin::Replayed,
            state: HaEntryState::InvalidMatch,
            list: HaList::ToAdd,
            key,
        })?;
        self.to_add.push(idx);
        Ok(())
    }

    /// Takes a restored entry off its chain and the delete list and puts it
    /// on `list`.
    fn claim(&mut self, idx: usize, state: HaEntryState, list: HaList) -> PipeResult<()> {
        let entry = self.entries[idx]
            .as_mut()
            .ok_or_else(|| PipeMgrError::unexpected(format!("spec map slot {} empty", idx)))?;
        if entry.list != HaList::ToDelete || !self.to_delete.remove(&idx) {
            debug_assert!(false, "claimed entry {} not on the delete list", entry.ent_hdl);
            return Err(PipeMgrError::unexpected(format!(
                "entry {} not on the delete list",
                entry.ent_hdl
            )));
        }
        if let Some(chain) = self.chains.get_mut(&entry.key) {
            chain.retain(|&i| i != idx);
            if chain.is_empty() {
                self.chains.remove(&entry.key);
            }
        }
        entry.state = state;
        entry.list = list;
        match list {
            HaList::FullMatch => self.full_match.push(idx),
            HaList::ToModify => self.to_modify.push(idx),
            HaList::ToAdd => self.to_add.push(idx),
            HaList::ToDelete => {
                self.to_delete.insert(idx);
            }
        }
        Ok(())
    }

    fn classify(
        &self,
        restored: &EntryData,
        action_spec: &ActionSpec,
        act_fn_hdl: ActFnHdl,
    ) -> HaEntryState {
        if restored.act_fn_hdl != act_fn_hdl {
            return HaEntryState::ActionDataMiss;
        }
        if restored.action_spec.data.kind() != action_spec.data.kind() {
            return HaEntryState::ActionDataMiss;
        }
        match (&restored.action_spec.data, &action_spec.data) {
            (ActionData::Direct(have), ActionData::Direct(want)) => {
                if have != want {
                    return HaEntryState::ActionDataDirty;
                }
            }
            (ActionData::AdtEntry(have), ActionData::AdtEntry(want)) => {
                let adt_state = self
                    .adt_view
                    .as_ref()
                    .map_or(AdtEntryState::Occupied, |v| v.adt_entry_state(*want));
                match adt_state {
                    AdtEntryState::Absent => return HaEntryState::ActionDataMiss,
                    AdtEntryState::Dirty => return HaEntryState::ActionDataDirty,
                    AdtEntryState::Occupied => {}
                }
                if have != want {
                    return HaEntryState::ActionHdlDirty;
                }
            }
            (ActionData::SelectorGroup(have), ActionData::SelectorGroup(want)) => {
                if have != want {
                    return HaEntryState::ActionHdlDirty;
                }
            }
            _ => return HaEntryState::ActionDataMiss,
        }
        if !resources_match(&restored.action_spec, action_spec) {
            return HaEntryState::ActionDataDirty;
        }
        if self.config.direct_stateful {
            return HaEntryState::ResourceMismatch;
        }
        HaEntryState::FullMatch
    }

    pub fn list_len(&self, list: HaList) -> usize {
        match list {
            HaList::ToDelete => self.to_delete.len(),
            HaList::ToAdd => self.to_add.len(),
            HaList::ToModify => self.to_modify.len(),
            HaList::FullMatch => self.full_match.len(),
        }
    }

    /// Number of entries currently owned by the map.
    pub fn live_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Looks up an entry by handle.
    pub fn entry(&self, ent_hdl: EntHdl) -> Option<&HaEntry> {
        self.entries
            .iter()
            .flatten()
            .find(|e| e.ent_hdl == ent_hdl)
    }

    /// Verifies that every live entry sits on exactly one list and that list
    /// agrees with the entry's own record.
    pub fn check_partition(&self) -> PipeResult<()> {
        let mut seen: HashMap<usize, HaList> = HashMap::new();
        let lists = [
            (HaList::ToDelete, self.to_delete.iter().copied().collect::<Vec<_>>()),
            (HaList::ToAdd, self.to_add.clone()),
            (HaList::ToModify, self.to_modify.clone()),
            (HaList::FullMatch, self.full_match.clone()),
        ];
        for (list, members) in lists {
            for idx in members {
                if seen.insert(idx, list).is_some() {
                    return Err(PipeMgrError::unexpected(format!(
                        "spec map slot {} on two lists",
                        idx
                    )));
                }
            }
        }
        for (idx, entry) in self.entries.iter().enumerate() {
            let Some(entry) = entry else { continue };
            match seen.get(&idx) {
                Some(list) if *list == entry.list => {}
                _ => {
                    return Err(PipeMgrError::unexpected(format!(
                        "entry {} membership does not match {:?}",
                        entry.ent_hdl, entry.list
                    )))
                }
            }
        }
        if seen.len() != self.live_entries() {
            return Err(PipeMgrError::unexpected("list member without a live entry"));
        }
        Ok(())
    }

    /// Counts of the reconciliation lists right now.
    pub fn report(&self) -> ReconcReport {
        ReconcReport {
            tbl_hdl: self.config.tbl_hdl,
            added: self.to_add.len(),
            deleted: self.to_delete.len(),
            modified: self.to_modify.len(),
            full_match: self.full_match.len(),
        }
    }

    /// Drains the lists in the order full-match, delete, add, modify and
    /// consumes the map.
    ///
    /// The report is captured before any pass runs. If an owner operation
    /// fails, the remaining lists are skipped, every entry is still freed and
    /// the first error is returned.
    pub fn reconcile(mut self, ops: &mut dyn ReconcileOps) -> (ReconcReport, PipeResult<MoveList>) {
        let report = self.report();
        info!(
            dev_id = self.config.dev_id,
            tbl_hdl = self.config.tbl_hdl,
            added = report.added,
            deleted = report.deleted,
            modified = report.modified,
            full_match = report.full_match,
            "Reconciling table"
        );
        let mut move_list = MoveList::new();
        let result = self.drain(ops, &mut move_list).inspect_err(|e| {
            error!(
                dev_id = self.config.dev_id,
                tbl_hdl = self.config.tbl_hdl,
                error = %e,
                "Reconciliation aborted"
            );
        });
        (report, result.map(|()| move_list))
    }

    fn drain(&mut self, ops: &mut dyn ReconcileOps, move_list: &mut MoveList) -> PipeResult<()> {
        for idx in mem::take(&mut self.full_match) {
            let entry = self.take(idx)?;
            if self.config.updates_needed_for_full_match_entries {
                ops.entry_update(&entry, move_list)?;
            }
        }
        for idx in mem::take(&mut self.to_delete) {
            let entry = self.take(idx)?;
            ops.entry_delete(entry.ent_hdl, move_list)?;
        }
        for idx in mem::take(&mut self.to_add) {
            let entry = self.take(idx)?;
            ops.entry_place_with_hdl(&entry, move_list)?;
        }
        for idx in mem::take(&mut self.to_modify) {
            let entry = self.take(idx)?;
            ops.entry_modify(&entry, move_list)?;
        }
        Ok(())
    }

    fn take(&mut self, idx: usize) -> PipeResult<HaEntry> {
        self.entries
            .get_mut(idx)
            .and_then(Option::take)
            .ok_or_else(|| PipeMgrError::unexpected(format!("spec map slot {} already freed", idx)))
    }
}

/// Compares stats and stateful references. Meter-family resources are
/// skipped: the hardware write path does not preserve every meter bit, so a
/// read-back meter spec never compares reliably.
fn resources_match(restored: &ActionSpec, wanted: &ActionSpec) -> bool {
    let comparable = |spec: &ActionSpec| {
        let mut refs: Vec<_> = spec
            .resources
            .iter()
            .filter(|r| r.tag == ResourceTag::Attached && !r.kind.is_meter_family())
            .map(|r| (r.tbl_hdl, r.index))
            .collect();
        refs.sort_unstable();
        refs
    };
    comparable(restored) == comparable(wanted)
}
