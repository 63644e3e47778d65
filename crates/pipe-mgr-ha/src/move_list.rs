//! Move lists: ordered table mutation records.
//!
//! A table owner produces a move list; the orchestrator either plays it
//! against hardware or hands it to the application as a callback.

use pipe_mgr_types::{ActFnHdl, ActionSpec, EntHdl, MatchSpec, PipeId, ALL_PIPES};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MoveOp {
    Add,
    Delete,
    Modify,
    Move,
    /// State-only refresh of an entry that is already correct in hardware.
    Update,
}

/// Match spec, action spec and TTL of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryData {
    /// Absent for action-data table entries.
    pub match_spec: Option<MatchSpec>,
    pub action_spec: ActionSpec,
    pub act_fn_hdl: ActFnHdl,
    pub ttl: u32,
}

impl EntryData {
    pub fn new(match_spec: Option<MatchSpec>, action_spec: ActionSpec, act_fn_hdl: ActFnHdl) -> Self {
        Self {
            match_spec,
            action_spec,
            act_fn_hdl,
            ttl: 0,
        }
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }
}

/// One mutation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveListNode {
    pub op: MoveOp,
    pub ent_hdl: EntHdl,
    pub pipe: PipeId,
    pub data: Option<EntryData>,
    /// Physical placement, when the owner knows it.
    pub logical_idx: Option<u32>,
    /// Destination of a `Move`.
    pub dest_idx: Option<u32>,
}

impl MoveListNode {
    pub fn new(op: MoveOp, ent_hdl: EntHdl) -> Self {
        Self {
            op,
            ent_hdl,
            pipe: ALL_PIPES,
            data: None,
            logical_idx: None,
            dest_idx: None,
        }
    }

    pub fn add(ent_hdl: EntHdl, data: EntryData) -> Self {
        Self::new(MoveOp::Add, ent_hdl).with_data(data)
    }

    pub fn delete(ent_hdl: EntHdl) -> Self {
        Self::new(MoveOp::Delete, ent_hdl)
    }

    pub fn modify(ent_hdl: EntHdl, data: EntryData) -> Self {
        Self::new(MoveOp::Modify, ent_hdl).with_data(data)
    }

    pub fn relocate(ent_hdl: EntHdl, src_idx: u32, dest_idx: u32) -> Self {
        let mut node = Self::new(MoveOp::Move, ent_hdl);
        node.logical_idx = Some(src_idx);
        node.dest_idx = Some(dest_idx);
        node
    }

    pub fn with_data(mut self, data: EntryData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_pipe(mut self, pipe: PipeId) -> Self {
        self.pipe = pipe;
        self
    }

    pub fn with_logical_idx(mut self, idx: u32) -> Self {
        self.logical_idx = Some(idx);
        self
    }
}

/// Ordered mutation records for one table.
pub type MoveList = Vec<MoveListNode>;

/// Per-op counts of a move list, for logging.
pub fn summarize(move_list: &[MoveListNode]) -> MoveListSummary {
    let mut summary = MoveListSummary::default();
    for node in move_list {
        match node.op {
            MoveOp::Add => summary.adds += 1,
            MoveOp::Delete => summary.deletes += 1,
            MoveOp::Modify => summary.modifies += 1,
            MoveOp::Move => summary.moves += 1,
            MoveOp::Update => summary.updates += 1,
        }
    }
    summary
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveListSummary {
    pub adds: usize,
    pub deletes: usize,
    pub modifies: usize,
    pub moves: usize,
    pub updates: usize,
}
