//! Common types for the pipeline table manager.
//!
//! - [`ids`]: device, pipe, stage and handle identifiers plus [`PipeBitmap`]
//! - [`spec`]: match and action spec value types
//! - [`error`]: [`PipeStatus`] codes and the [`PipeMgrError`] type

pub mod error;
pub mod ids;
pub mod spec;

pub use error::{PipeMgrError, PipeResult, PipeStatus, PipeStatusExt};
pub use ids::{
    ActFnHdl, DevId, DevTarget, EntHdl, LockId, LogicalTblId, PipeBitmap, PipeId, StageId,
    SubdevId, TblHdl, ALL_PIPES, MAX_PIPES,
};
pub use spec::{
    ActionData, ActionDataKind, ActionSpec, MatchKey, MatchSpec, ResourceKind, ResourceSpec,
    ResourceTag,
};
