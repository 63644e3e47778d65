//! Idle-time tracking for match-action table entries.
//!
//! Every entry carries a TTL. In notify mode hardware reports when an entry
//! stopped (or resumed) being hit, at the granularity of a notify period,
//! and a per-stage software sweep ages longer TTLs the rest of the way. In
//! poll mode hardware dumps raw activity bits and the application queries
//! the result.
//!
//! Table writes that change which entry sits at an index are only applied
//! to the idle state once hardware acknowledged a lock issued after them,
//! so notifications are never attributed to the wrong entry.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use pipe_mgr_idle::{EntryAdd, IdleDriver, IdleMode, IdleTable, IdleTableConfig, NotifyState, StageLayout};
//! use pipe_mgr_types::{PipeBitmap, PipeResult, ALL_PIPES};
//!
//! struct NoHw;
//! impl IdleDriver for NoHw {
//!     fn push_free_memory(&self, _: u16, _: u8, _: u64, _: usize) -> PipeResult<()> { Ok(()) }
//!     fn request_dump(&self, _: u16, _: u32, _: u32, _: u8, _: u8) -> PipeResult<()> { Ok(()) }
//! }
//!
//! let config = IdleTableConfig::new(0, 0x40, IdleMode::Notify, PipeBitmap::first_n(1))
//!     .with_stage(StageLayout::new(0, 0, 128));
//! let table = IdleTable::new(config, Arc::new(NoHw)).unwrap();
//! table.entry_add(EntryAdd::new(1, ALL_PIPES, 0, 5, 3000)).unwrap();
//! assert_eq!(table.notify_state(1, 0).unwrap(), NotifyState::Invalid);
//! ```

pub mod driver;
pub mod message;
pub mod metadata;
pub mod processor;
pub mod state;
pub mod table;
pub mod task;
pub mod timer;

pub use driver::IdleDriver;
pub use message::{decode_buffer, encode_buffer, DrMessage, IdleMsg, DUMP_ENTRIES_PER_MSG};
pub use metadata::{ActivateOutcome, IdleEntryLocation, IdleEntryMetadata, MetadataStore};
pub use processor::IdleProcessor;
pub use state::{transition, HitState, IdleEntry, NotifyEvent, NotifyState, PollState, Transition};
pub use table::{
    EntryAdd, IdleCallback, IdleMode, IdleNotification, IdleSlotDump, IdleStageDump, IdleTable,
    IdleTableConfig, IdleTableDump, StageLayout,
};
pub use task::{IdleTask, StageEvent, TaskList, TaskQueue};
pub use timer::SweepTimer;
