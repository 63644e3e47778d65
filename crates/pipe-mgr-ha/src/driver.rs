//! Hardware access consumed by the HA orchestrator.
//!
//! The register and DMA transport live below this trait. Block reads are
//! asynchronous: the driver invokes the completion on a thread of its own
//! choosing.

use crate::shadow::MemRegion;
use pipe_mgr_types::{DevId, PipeId, PipeResult, StageId};

/// Result of one asynchronous block read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockReadCompletion {
    /// Bytes read, `count` rows of the region width.
    pub data: Vec<u8>,
    /// First row covered by `data`.
    pub offset: u32,
    pub count: u32,
    pub had_error: bool,
}

pub type BlockReadCallback = Box<dyn FnOnce(BlockReadCompletion) + Send>;

pub trait HaDriver: Send + Sync {
    /// Starts an asynchronous read of `region` on one pipe.
    fn issue_block_read(
        &self,
        dev_id: DevId,
        pipe: PipeId,
        region: MemRegion,
        callback: BlockReadCallback,
    ) -> PipeResult<()>;

    /// Reads the scratch register recording which logical tables of a stage
    /// were asymmetric before the restart. Bit `n` is logical table `n`.
    fn read_scratch(&self, dev_id: DevId, pipe: PipeId, stage: StageId) -> PipeResult<u32>;

    fn exit_ha_mode(&self, dev_id: DevId) -> PipeResult<()>;

    fn restore_dma_weighting(&self, dev_id: DevId) -> PipeResult<()>;

    /// Replays the instruction list accumulated by the internal session.
    fn flush_session(&self, dev_id: DevId) -> PipeResult<()>;

    /// Blocks until every outstanding driver operation completed.
    fn drain(&self, dev_id: DevId) -> PipeResult<()>;
}
