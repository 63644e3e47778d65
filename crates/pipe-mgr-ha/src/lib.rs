//! Hitless HA state reconciliation.
//!
//! After a process restart the table state lives only in hardware. This
//! crate reads it back, rebuilds each table's software view through its
//! [`TableOwner`], matches the application's replayed entries against it in
//! a per-table [`SpecMap`], and produces the minimal add/delete/modify move
//! lists needed to converge without disturbing traffic.
//!
//! # Example
//!
//! ```
//! use pipe_mgr_ha::{MoveListNode, EntryData, HaEntryState, SpecMap, SpecMapConfig};
//! use pipe_mgr_types::{ActionSpec, MatchSpec};
//!
//! let mut map = SpecMap::new(SpecMapConfig::new(0, 1));
//! let restored = EntryData::new(
//!     Some(MatchSpec::exact(vec![0xab]).with_priority(3)),
//!     ActionSpec::direct(vec![1]),
//!     7,
//! );
//! map.new_spec(MoveListNode::add(42, restored)).unwrap();
//!
//! let hdl = map
//!     .lookup_spec(&MatchSpec::exact(vec![0xab]), &ActionSpec::direct(vec![1]), 7, 100, 0)
//!     .unwrap();
//! assert_eq!(hdl, 42);
//! assert_eq!(map.entry(42).unwrap().state(), HaEntryState::FullMatch);
//! ```

pub mod driver;
pub mod move_list;
pub mod orchestrator;
pub mod owner;
pub mod replay_owner;
pub mod shadow;
pub mod spec_map;

pub use driver::{BlockReadCallback, BlockReadCompletion, HaDriver};
pub use move_list::{summarize, EntryData, MoveList, MoveListNode, MoveListSummary, MoveOp};
pub use orchestrator::{DeviceInfo, DeviceMode, HaPhase, HitlessHa, MoveListCallback};
pub use owner::{
    DeltaOutcome, OwnerRegistry, ReplayRequest, RestoreClass, TableInfo, TableOwner,
    TableOwnerKind,
};
pub use replay_owner::{ReplayOwner, ReplayTable};
pub use shadow::{MemRegion, ReadTracker, ShadowMemory, SymmetryMismatch};
pub use spec_map::{
    AdtEntryState, AdtStateView, EntryOrigin, HaEntry, HaEntryState, HaList, ReconcReport,
    ReconcileOps, SpecMap, SpecMapConfig,
};
