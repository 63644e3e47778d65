//! Periodic software sweep of idle stages.

use pipe_mgr_types::{PipeMgrError, PipeResult, StageId, TblHdl};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::table::IdleTable;

/// Runs one stage's sweep on a fixed period until stopped.
#[derive(Debug)]
pub struct SweepTimer {
    tbl_hdl: TblHdl,
    stage: StageId,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SweepTimer {
    pub(crate) fn spawn(
        runtime: &tokio::runtime::Handle,
        table: Arc<IdleTable>,
        stage_idx: usize,
        stage: StageId,
        period: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let tbl_hdl = table.tbl_hdl();
        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        let callbacks = table.tick(stage_idx);
                        if callbacks > 0 {
                            debug!(tbl_hdl = table.tbl_hdl(), stage, callbacks, "Idle sweep");
                        }
                    }
                }
            }
        });
        Self {
            tbl_hdl,
            stage,
            token,
            handle,
        }
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Stops the timer and waits for an in-flight sweep to finish. Returns
    /// false if the sweep task had panicked.
    pub async fn stop(self) -> bool {
        self.token.cancel();
        match self.handle.await {
            Ok(()) => true,
            Err(e) => {
                error!(tbl_hdl = self.tbl_hdl, stage = self.stage, error = %e, "Idle sweep task failed");
                false
            }
        }
    }
}

impl IdleTable {
    /// Starts one sweep timer per stage on the current tokio runtime. Tables
    /// that process inline have nothing to sweep.
    pub fn start_sweep_timers(self: &Arc<Self>) -> PipeResult<Vec<SweepTimer>> {
        let period_ms = self.config().sweep_period_ms;
        if period_ms == 0 {
            return Ok(Vec::new());
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| PipeMgrError::unexpected(format!("no runtime for idle sweep: {}", e)))?;
        let period = Duration::from_millis(u64::from(period_ms));
        let timers: Vec<_> = self
            .layouts()
            .enumerate()
            .map(|(stage_idx, layout)| {
                SweepTimer::spawn(&runtime, self.clone(), stage_idx, layout.stage_id, period)
            })
            .collect();
        info!(tbl_hdl = self.tbl_hdl(), period_ms, stages = timers.len(), "Idle sweep started");
        Ok(timers)
    }
}
