//! Shadow copy of table memory read back during HA, and the barrier that
//! waits for outstanding block reads.

use parking_lot::{Condvar, Mutex};
use pipe_mgr_types::{PipeId, PipeMgrError, PipeResult, TblHdl};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// One contiguous block of table memory: `depth` rows of `width` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemRegion {
    pub addr: u64,
    pub width: u32,
    pub depth: u32,
}

impl MemRegion {
    pub fn new(addr: u64, width: u32, depth: u32) -> Self {
        Self { addr, width, depth }
    }

    pub fn len(&self) -> usize {
        self.width as usize * self.depth as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bytes that differ between a pipe and the first pipe of its profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetryMismatch {
    pub tbl_hdl: TblHdl,
    pub pipe: PipeId,
    pub reference_pipe: PipeId,
    /// Byte offset of the first difference within the region.
    pub offset: usize,
}

/// In-memory mirror of table RAM/TCAM contents, keyed by pipe and region
/// address. Populated from block-read completions.
#[derive(Debug, Default)]
pub struct ShadowMemory {
    regions: Mutex<HashMap<(PipeId, u64), Vec<u8>>>,
}

impl ShadowMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores rows starting at `offset` into a region's shadow.
    pub fn write_rows(
        &self,
        pipe: PipeId,
        region: &MemRegion,
        offset: u32,
        data: &[u8],
    ) -> PipeResult<()> {
        let start = offset as usize * region.width as usize;
        let end = start + data.len();
        if end > region.len() {
            return Err(PipeMgrError::invalid_arg(format!(
                "rows {}..{} outside region {:#x} of {} bytes",
                start,
                end,
                region.addr,
                region.len()
            )));
        }
        let mut regions = self.regions.lock();
        let shadow = regions
            .entry((pipe, region.addr))
            .or_insert_with(|| vec![0; region.len()]);
        shadow[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Copy of a region's shadow, if it was ever read.
    pub fn read(&self, pipe: PipeId, addr: u64) -> Option<Vec<u8>> {
        self.regions.lock().get(&(pipe, addr)).cloned()
    }

    pub fn contains(&self, pipe: PipeId, addr: u64) -> bool {
        self.regions.lock().contains_key(&(pipe, addr))
    }

    /// Offset of the first byte where two pipes' copies of a region differ.
    ///
    /// A region missing on either pipe counts as differing at offset 0.
    pub fn first_difference(&self, pipe: PipeId, reference: PipeId, addr: u64) -> Option<usize> {
        let regions = self.regions.lock();
        match (regions.get(&(pipe, addr)), regions.get(&(reference, addr))) {
            (Some(a), Some(b)) => a
                .iter()
                .zip(b.iter())
                .position(|(x, y)| x != y)
                .or_else(|| (a.len() != b.len()).then(|| a.len().min(b.len()))),
            _ => Some(0),
        }
    }

    pub fn clear(&self) {
        self.regions.lock().clear();
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    pending: usize,
    failed: usize,
}

/// Counts outstanding block reads so the caller can block until all of them
/// completed.
#[derive(Debug, Default)]
pub struct ReadTracker {
    state: Mutex<TrackerState>,
    done: Condvar,
}

impl ReadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) {
        self.state.lock().pending += 1;
    }

    /// Records a finished read. Wakes waiters once nothing is outstanding.
    pub fn complete(&self, had_error: bool) {
        let mut state = self.state.lock();
        if state.pending == 0 {
            warn!("Block read completed with nothing outstanding");
            return;
        }
        state.pending -= 1;
        if had_error {
            state.failed += 1;
        }
        if state.pending == 0 {
            self.done.notify_all();
        }
    }

    /// Withdraws a read that was never issued.
    pub fn cancel(&self) {
        self.complete(false);
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// Blocks until every issued read completed. Fails if any of them
    /// reported an error; the failure count is reset either way.
    pub fn wait(&self) -> PipeResult<()> {
        let mut state = self.state.lock();
        while state.pending > 0 {
            self.done.wait(&mut state);
        }
        let failed = std::mem::take(&mut state.failed);
        if failed > 0 {
            return Err(PipeMgrError::hardware(format!("{} block reads failed", failed)));
        }
        Ok(())
    }
}
