//! Hardware access consumed by the idle engine.

use pipe_mgr_types::{DevId, LogicalTblId, PipeId, PipeResult, StageId, SubdevId, TblHdl};

pub trait IdleDriver: Send + Sync {
    /// Hands a notification buffer back to the sub-device's free-memory ring.
    fn push_free_memory(&self, dev_id: DevId, subdev_id: SubdevId, addr: u64, size: usize) -> PipeResult<()>;

    /// Asks hardware to dump the activity bits of one logical table. The
    /// results arrive later as dump messages.
    fn request_dump(
        &self,
        dev_id: DevId,
        tbl_hdl: TblHdl,
        pipe: PipeId,
        stage: StageId,
        logical_tbl: LogicalTblId,
    ) -> PipeResult<()>;
}
