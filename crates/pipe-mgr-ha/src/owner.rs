//! Table-owner dispatch.
//!
//! Each table handle is bound at registration to one [`TableOwner`]
//! implementation. The orchestrator only ever talks to tables through this
//! interface, grouping them by [`RestoreClass`] to honour the producer and
//! consumer ordering between action, selector and match tables.

use crate::move_list::MoveList;
use crate::shadow::{MemRegion, ShadowMemory};
use crate::spec_map::ReconcReport;
use pipe_mgr_types::{
    ActFnHdl, ActionSpec, EntHdl, LogicalTblId, MatchSpec, PipeBitmap, PipeMgrError, PipeResult,
    StageId, TblHdl,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Implementation family of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableOwnerKind {
    ExactMatch,
    Ternary,
    Alpm,
    /// Keyless phase-0 table.
    Phase0,
    Selector,
    ActionData,
    Stateful,
    Meter,
    Mirror,
}

/// Position of a table kind in the HA restore and delta ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RestoreClass {
    Match,
    Selector,
    Action,
    /// Stateful and meter memory, re-downloaded from shadow at push.
    Resource,
    Mirror,
}

impl TableOwnerKind {
    pub fn restore_class(&self) -> RestoreClass {
        match self {
            TableOwnerKind::ExactMatch
            | TableOwnerKind::Ternary
            | TableOwnerKind::Alpm
            | TableOwnerKind::Phase0 => RestoreClass::Match,
            TableOwnerKind::Selector => RestoreClass::Selector,
            TableOwnerKind::ActionData => RestoreClass::Action,
            TableOwnerKind::Stateful | TableOwnerKind::Meter => RestoreClass::Resource,
            TableOwnerKind::Mirror => RestoreClass::Mirror,
        }
    }

    pub fn is_match(&self) -> bool {
        self.restore_class() == RestoreClass::Match
    }
}

impl fmt::Display for TableOwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TableOwnerKind::ExactMatch => "exm",
            TableOwnerKind::Ternary => "tcam",
            TableOwnerKind::Alpm => "alpm",
            TableOwnerKind::Phase0 => "phase0",
            TableOwnerKind::Selector => "selector",
            TableOwnerKind::ActionData => "adt",
            TableOwnerKind::Stateful => "stful",
            TableOwnerKind::Meter => "meter",
            TableOwnerKind::Mirror => "mirror",
        };
        write!(f, "{}", s)
    }
}

/// Static description of a table as laid out on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub tbl_hdl: TblHdl,
    pub name: String,
    pub kind: TableOwnerKind,
    /// Same contents on every pipe of the table's scope.
    pub symmetric: bool,
    pub pipes: PipeBitmap,
    /// Logical tables the table occupies, per stage.
    pub stages: Vec<(StageId, LogicalTblId)>,
    /// Memory read back into shadow during HA.
    pub regions: Vec<MemRegion>,
}

impl TableInfo {
    pub fn new(tbl_hdl: TblHdl, name: impl Into<String>, kind: TableOwnerKind, pipes: PipeBitmap) -> Self {
        Self {
            tbl_hdl,
            name: name.into(),
            kind,
            symmetric: true,
            pipes,
            stages: Vec::new(),
            regions: Vec::new(),
        }
    }

    pub fn with_stage(mut self, stage: StageId, logical_tbl: LogicalTblId) -> Self {
        self.stages.push((stage, logical_tbl));
        self
    }

    pub fn with_region(mut self, region: MemRegion) -> Self {
        self.regions.push(region);
        self
    }
}

/// An entry the application replays after the restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayRequest {
    Match {
        match_spec: MatchSpec,
        action_spec: ActionSpec,
        act_fn_hdl: ActFnHdl,
        new_entry_hdl: EntHdl,
        ttl: u32,
    },
    ActionData {
        action_spec: ActionSpec,
        act_fn_hdl: ActFnHdl,
        new_entry_hdl: EntHdl,
    },
}

/// Outcome of delta computation for one table.
///
/// The report survives a failed reconciliation.
#[derive(Debug)]
pub struct DeltaOutcome {
    pub report: Option<ReconcReport>,
    pub result: PipeResult<MoveList>,
}

impl DeltaOutcome {
    pub fn empty() -> Self {
        Self {
            report: None,
            result: Ok(MoveList::new()),
        }
    }
}

/// HA capability set of one table implementation.
pub trait TableOwner: Send {
    fn kind(&self) -> TableOwnerKind;

    /// Forces one scope per pipe because the table was asymmetric before the
    /// restart.
    fn make_asymmetric(&mut self) -> PipeResult<()>;

    /// Rebuilds hardware-adjacent state from shadow memory. Returns the
    /// restored entries as a move list when `want_move_list` is set.
    fn llp_restore_state(
        &mut self,
        shadow: &ShadowMemory,
        info: &TableInfo,
        want_move_list: bool,
    ) -> PipeResult<Option<MoveList>>;

    /// Rebuilds the application-facing view from the restored entries.
    fn hlp_restore_state(&mut self, move_list: MoveList) -> PipeResult<()>;

    /// Accepts one replayed application entry and returns the handle it
    /// will carry.
    fn replay(&mut self, request: &ReplayRequest) -> PipeResult<EntHdl> {
        let _ = request;
        Err(PipeMgrError::not_supported(format!("replay on {} tables", self.kind())))
    }

    fn compute_delta_changes(&mut self) -> DeltaOutcome;

    /// Programs a move list into hardware.
    fn process_move_list(&mut self, move_list: &MoveList) -> PipeResult<()>;

    /// Writes resource memory back from shadow, starting it over.
    fn redownload_specs(&mut self, shadow: &ShadowMemory, info: &TableInfo) -> PipeResult<()> {
        let _ = (shadow, info);
        Ok(())
    }

    fn cleanup_hlp_ha_state(&mut self);

    fn cleanup_llp_ha_state(&mut self);
}

pub(crate) struct RegisteredTable {
    pub(crate) info: TableInfo,
    pub(crate) owner: Box<dyn TableOwner>,
}

impl fmt::Debug for RegisteredTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTable")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Binds table handles to their owners.
#[derive(Default)]
pub struct OwnerRegistry {
    tables: BTreeMap<TblHdl, RegisteredTable>,
}

impl OwnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, info: TableInfo, owner: Box<dyn TableOwner>) -> PipeResult<()> {
        if info.kind != owner.kind() {
            return Err(PipeMgrError::invalid_arg(format!(
                "table {:#x} declared {} but owner is {}",
                info.tbl_hdl,
                info.kind,
                owner.kind()
            )));
        }
        if self.tables.contains_key(&info.tbl_hdl) {
            return Err(PipeMgrError::already_exists(format!("table {:#x}", info.tbl_hdl)));
        }
        debug!(tbl_hdl = info.tbl_hdl, name = %info.name, kind = %info.kind, "Table owner registered");
        self.tables.insert(info.tbl_hdl, RegisteredTable { info, owner });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn info(&self, tbl_hdl: TblHdl) -> Option<&TableInfo> {
        self.tables.get(&tbl_hdl).map(|t| &t.info)
    }

    pub(crate) fn get_mut(&mut self, tbl_hdl: TblHdl) -> PipeResult<&mut RegisteredTable> {
        self.tables
            .get_mut(&tbl_hdl)
            .ok_or_else(|| PipeMgrError::not_found(format!("table {:#x}", tbl_hdl)))
    }

    /// Handles of every table in `class`, in handle order.
    pub fn tables_of(&self, class: RestoreClass) -> Vec<TblHdl> {
        self.tables
            .values()
            .filter(|t| t.info.kind.restore_class() == class)
            .map(|t| t.info.tbl_hdl)
            .collect()
    }

    /// Handles of every table in `classes`, class by class.
    pub fn ordered(&self, classes: &[RestoreClass]) -> Vec<TblHdl> {
        classes.iter().flat_map(|c| self.tables_of(*c)).collect()
    }

    pub fn infos(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables.values().map(|t| &t.info)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut RegisteredTable> {
        self.tables.values_mut()
    }
}
