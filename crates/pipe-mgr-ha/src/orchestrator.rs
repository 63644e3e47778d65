//! Hitless HA orchestrator.
//!
//! Drives one device through warm restart:
//!
//! `Init -> SymmetricityRestored -> HwReadInitiated -> LlpRestored ->
//! HlpRestored -> DeltaComputed -> Pushed`
//!
//! `HlpRestored` is skipped on virtual-device slaves, which only forward the
//! restored move lists to the application. Each phase must be called in
//! order; a failing phase leaves the device where it was and is fatal to its
//! bring-up.

use crate::driver::{BlockReadCallback, BlockReadCompletion, HaDriver};
use crate::move_list::{summarize, MoveList};
use crate::owner::{OwnerRegistry, ReplayRequest, RestoreClass, TableInfo, TableOwner};
use crate::shadow::{MemRegion, ReadTracker, ShadowMemory, SymmetryMismatch};
use crate::spec_map::ReconcReport;
use pipe_mgr_common::{DeviceRegistry, HaConfig, SymmetricReadCheck};
use pipe_mgr_types::{
    DevId, EntHdl, LogicalTblId, PipeBitmap, PipeId, PipeMgrError, PipeResult, StageId, TblHdl,
    MAX_PIPES,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

const LLP_ORDER: [RestoreClass; 4] = [
    RestoreClass::Match,
    RestoreClass::Selector,
    RestoreClass::Action,
    RestoreClass::Resource,
];
const HLP_ORDER: [RestoreClass; 3] = [
    RestoreClass::Action,
    RestoreClass::Selector,
    RestoreClass::Match,
];
const DELTA_ORDER: [RestoreClass; 4] = [
    RestoreClass::Action,
    RestoreClass::Selector,
    RestoreClass::Match,
    RestoreClass::Mirror,
];

/// Delivered once per table during delta computation.
pub type MoveListCallback = Arc<dyn Fn(DevId, TblHdl, &MoveList) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceMode {
    /// Real hardware programmed by this process.
    Physical,
    /// Shares hardware owned by another process; observes, never programs.
    VirtualDevSlave,
    /// Software-only device without readable hardware.
    Virtual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub dev_id: DevId,
    pub mode: DeviceMode,
    pub active_pipes: PipeBitmap,
    pub num_stages: StageId,
    /// Pipes sharing one pipeline profile. Empty means a single profile
    /// spanning every active pipe.
    pub profiles: Vec<PipeBitmap>,
}

impl DeviceInfo {
    pub fn new(dev_id: DevId, mode: DeviceMode, active_pipes: PipeBitmap, num_stages: StageId) -> Self {
        Self {
            dev_id,
            mode,
            active_pipes,
            num_stages,
            profiles: Vec::new(),
        }
    }

    pub fn with_profile(mut self, pipes: PipeBitmap) -> Self {
        self.profiles.push(pipes);
        self
    }

    fn validate(&self) -> PipeResult<()> {
        if self.active_pipes.is_empty() {
            return Err(PipeMgrError::invalid_arg(format!(
                "device {} has no active pipes",
                self.dev_id
            )));
        }
        if self.active_pipes.iter().any(|p| p >= MAX_PIPES) {
            return Err(PipeMgrError::invalid_arg(format!(
                "device {} pipe bitmap {} exceeds {} pipes",
                self.dev_id, self.active_pipes, MAX_PIPES
            )));
        }
        for profile in &self.profiles {
            if !self.active_pipes.is_superset_of(*profile) {
                return Err(PipeMgrError::invalid_arg(format!(
                    "device {} profile {} includes inactive pipes",
                    self.dev_id, profile
                )));
            }
        }
        Ok(())
    }

    fn profile_pipes(&self) -> Vec<PipeBitmap> {
        if self.profiles.is_empty() {
            vec![self.active_pipes]
        } else {
            self.profiles.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HaPhase {
    Init,
    SymmetricityRestored,
    HwReadInitiated,
    LlpRestored,
    HlpRestored,
    DeltaComputed,
    Pushed,
}

impl fmt::Display for HaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HaPhase::Init => "init",
            HaPhase::SymmetricityRestored => "symmetricity-restored",
            HaPhase::HwReadInitiated => "hw-read-initiated",
            HaPhase::LlpRestored => "llp-restored",
            HaPhase::HlpRestored => "hlp-restored",
            HaPhase::DeltaComputed => "delta-computed",
            HaPhase::Pushed => "pushed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy)]
struct CompareJob {
    tbl_hdl: TblHdl,
    pipe: PipeId,
    reference_pipe: PipeId,
    addr: u64,
}

#[derive(Debug, Clone, Copy)]
struct ReadJob {
    pipe: PipeId,
    region: MemRegion,
    compare: Option<CompareJob>,
}

/// HA context of one device.
pub struct HaDevice {
    info: DeviceInfo,
    phase: HaPhase,
    owners: OwnerRegistry,
    shadow: Arc<ShadowMemory>,
    tracker: Arc<ReadTracker>,
    compare_jobs: Vec<CompareJob>,
    llp_move_lists: BTreeMap<TblHdl, MoveList>,
    reports: BTreeMap<TblHdl, ReconcReport>,
    mismatches: Vec<SymmetryMismatch>,
}

impl HaDevice {
    fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            phase: HaPhase::Init,
            owners: OwnerRegistry::new(),
            shadow: Arc::new(ShadowMemory::new()),
            tracker: Arc::new(ReadTracker::new()),
            compare_jobs: Vec::new(),
            llp_move_lists: BTreeMap::new(),
            reports: BTreeMap::new(),
            mismatches: Vec::new(),
        }
    }

    fn expect_phase(&self, expected: HaPhase, operation: &str) -> PipeResult<()> {
        if self.phase != expected {
            return Err(PipeMgrError::unexpected(format!(
                "device {}: {} requires phase {}, device is in {}",
                self.info.dev_id, operation, expected, self.phase
            )));
        }
        Ok(())
    }

    fn advance(&mut self, phase: HaPhase) {
        info!(dev_id = self.info.dev_id, from = %self.phase, to = %phase, "HA phase complete");
        self.phase = phase;
    }

    fn is_slave(&self) -> bool {
        self.info.mode == DeviceMode::VirtualDevSlave
    }

    /// Reads planned for both passes: first pipe of every profile, then the
    /// rest of each profile with a comparison against that first pipe when
    /// the table is symmetric.
    fn plan_reads(&self) -> (Vec<ReadJob>, Vec<ReadJob>) {
        let mut first_pass = Vec::new();
        let mut second_pass = Vec::new();
        for profile in self.info.profile_pipes() {
            for info in self.owners.infos() {
                let pipes = PipeBitmap::from_pipes(profile.iter().filter(|p| info.pipes.contains(*p)));
                let Some(reference_pipe) = pipes.first() else {
                    continue;
                };
                for region in &info.regions {
                    first_pass.push(ReadJob {
                        pipe: reference_pipe,
                        region: *region,
                        compare: None,
                    });
                    for pipe in pipes.iter().filter(|p| *p != reference_pipe) {
                        let compare = info.symmetric.then_some(CompareJob {
                            tbl_hdl: info.tbl_hdl,
                            pipe,
                            reference_pipe,
                            addr: region.addr,
                        });
                        second_pass.push(ReadJob {
                            pipe,
                            region: *region,
                            compare,
                        });
                    }
                }
            }
        }
        (first_pass, second_pass)
    }
}

/// Hitless HA engine for every device of the process.
pub struct HitlessHa {
    config: HaConfig,
    driver: Arc<dyn HaDriver>,
    devices: DeviceRegistry<HaDevice>,
    move_list_cb: Option<MoveListCallback>,
}

impl HitlessHa {
    pub fn new(config: HaConfig, driver: Arc<dyn HaDriver>) -> Self {
        let devices = DeviceRegistry::new("hitless_ha", config.max_devices);
        Self {
            config,
            driver,
            devices,
            move_list_cb: None,
        }
    }

    /// Sets the application callback receiving each table's delta. The
    /// callback runs with the device context locked and must not call back
    /// into this engine for the same device.
    pub fn with_move_list_callback(mut self, cb: MoveListCallback) -> Self {
        self.move_list_cb = Some(cb);
        self
    }

    pub fn add_device(&self, info: DeviceInfo) -> PipeResult<()> {
        info.validate()?;
        let dev_id = info.dev_id;
        self.devices.insert(dev_id, HaDevice::new(info))?;
        Ok(())
    }

    pub fn remove_device(&self, dev_id: DevId) -> PipeResult<()> {
        self.devices.remove(dev_id)?;
        Ok(())
    }

    /// Binds a table to its owner. Only allowed before the HA sequence starts.
    pub fn register_table(
        &self,
        dev_id: DevId,
        info: TableInfo,
        owner: Box<dyn TableOwner>,
    ) -> PipeResult<()> {
        self.devices.with_device(dev_id, |dev| {
            dev.expect_phase(HaPhase::Init, "register_table")?;
            dev.owners.register(info, owner)
        })
    }

    pub fn phase(&self, dev_id: DevId) -> PipeResult<HaPhase> {
        self.devices.with_device(dev_id, |dev| Ok(dev.phase))
    }

    /// Whether a table ended up symmetric after symmetricity was restored.
    pub fn is_symmetric(&self, dev_id: DevId, tbl_hdl: TblHdl) -> PipeResult<bool> {
        self.devices.with_device(dev_id, |dev| {
            dev.owners
                .info(tbl_hdl)
                .map(|i| i.symmetric)
                .ok_or_else(|| PipeMgrError::not_found(format!("table {:#x}", tbl_hdl)))
        })
    }

    /// Counts captured when the table's reconciliation started.
    pub fn reconc_report(&self, dev_id: DevId, tbl_hdl: TblHdl) -> PipeResult<ReconcReport> {
        self.devices.with_device(dev_id, |dev| {
            dev.reports.get(&tbl_hdl).copied().ok_or_else(|| {
                PipeMgrError::not_found(format!("reconciliation report for table {:#x}", tbl_hdl))
            })
        })
    }

    pub fn symmetry_mismatches(&self, dev_id: DevId) -> PipeResult<Vec<SymmetryMismatch>> {
        self.devices.with_device(dev_id, |dev| Ok(dev.mismatches.clone()))
    }

    /// Reads which logical tables were asymmetric before the restart and
    /// forces the affected match tables to one scope per pipe.
    #[instrument(skip(self))]
    pub fn update_symmetricity(&self, dev_id: DevId) -> PipeResult<()> {
        let driver = Arc::clone(&self.driver);
        self.devices.with_device(dev_id, |dev| {
            dev.expect_phase(HaPhase::Init, "update_symmetricity")?;
            if dev.info.mode == DeviceMode::Virtual {
                debug!(dev_id, "Virtual device, symmetricity read skipped");
                dev.advance(HaPhase::SymmetricityRestored);
                return Ok(());
            }

            let mut asymmetric: HashSet<(StageId, LogicalTblId)> = HashSet::new();
            for pipe in dev.info.active_pipes.iter() {
                for stage in 0..dev.info.num_stages {
                    let bits = driver.read_scratch(dev_id, pipe, stage)?;
                    for ltbl in 0..32u8 {
                        if bits & (1u32 << ltbl) != 0 {
                            asymmetric.insert((stage, ltbl));
                        }
                    }
                }
            }

            for tbl in dev.owners.iter_mut() {
                let info = &mut tbl.info;
                if !info.kind.is_match() || !info.symmetric {
                    continue;
                }
                if info.stages.iter().any(|s| asymmetric.contains(s)) {
                    tbl.owner.make_asymmetric()?;
                    info.symmetric = false;
                    info!(dev_id, tbl_hdl = info.tbl_hdl, name = %info.name, "Table restored as asymmetric");
                }
            }
            dev.advance(HaPhase::SymmetricityRestored);
            Ok(())
        })
    }

    /// Issues the asynchronous block reads filling shadow memory.
    #[instrument(skip(self))]
    pub fn initiate_hw_read(&self, dev_id: DevId) -> PipeResult<()> {
        let driver = Arc::clone(&self.driver);
        let check = self.config.symmetric_read_check;
        self.devices.with_device(dev_id, |dev| {
            dev.expect_phase(HaPhase::SymmetricityRestored, "initiate_hw_read")?;
            if dev.info.mode == DeviceMode::Virtual {
                debug!(dev_id, "Virtual device, no hardware to read");
                dev.advance(HaPhase::HwReadInitiated);
                return Ok(());
            }

            let (first_pass, second_pass) = dev.plan_reads();
            info!(
                dev_id,
                first_pass = first_pass.len(),
                second_pass = second_pass.len(),
                "Issuing HA block reads"
            );
            for job in first_pass.iter().chain(second_pass.iter()) {
                issue_read(driver.as_ref(), dev_id, &dev.shadow, &dev.tracker, job.pipe, job.region)?;
                if let Some(compare) = job.compare {
                    if check != SymmetricReadCheck::Off {
                        dev.compare_jobs.push(compare);
                    }
                }
            }
            dev.advance(HaPhase::HwReadInitiated);
            Ok(())
        })
    }

    /// Waits for every block read, checks symmetric pipes and restores LLP
    /// state in match, selector, action order.
    #[instrument(skip(self))]
    pub fn complete_hw_read(&self, dev_id: DevId) -> PipeResult<()> {
        let check = self.config.symmetric_read_check;
        self.devices.with_device(dev_id, |dev| {
            dev.expect_phase(HaPhase::HwReadInitiated, "complete_hw_read")?;
            dev.tracker.wait()?;

            for job in std::mem::take(&mut dev.compare_jobs) {
                if let Some(offset) = dev.shadow.first_difference(job.pipe, job.reference_pipe, job.addr) {
                    let mismatch = SymmetryMismatch {
                        tbl_hdl: job.tbl_hdl,
                        pipe: job.pipe,
                        reference_pipe: job.reference_pipe,
                        offset,
                    };
                    warn!(dev_id, ?mismatch, "Symmetric table differs across pipes");
                    dev.mismatches.push(mismatch);
                }
            }
            if check == SymmetricReadCheck::Fail && !dev.mismatches.is_empty() {
                return Err(PipeMgrError::unexpected(format!(
                    "device {}: {} symmetric regions differ across pipes",
                    dev_id,
                    dev.mismatches.len()
                )));
            }

            for tbl_hdl in dev.owners.ordered(&LLP_ORDER) {
                let tbl = dev.owners.get_mut(tbl_hdl)?;
                let want_move_list = tbl.info.kind.restore_class() != RestoreClass::Resource;
                let restored = tbl
                    .owner
                    .llp_restore_state(&dev.shadow, &tbl.info, want_move_list)?;
                if let Some(move_list) = restored {
                    dev.llp_move_lists.insert(tbl_hdl, move_list);
                }
            }
            dev.advance(HaPhase::LlpRestored);
            Ok(())
        })
    }

    /// Restores HLP state in action, selector, match order.
    #[instrument(skip(self))]
    pub fn restore_hlp(&self, dev_id: DevId) -> PipeResult<()> {
        self.devices.with_device(dev_id, |dev| {
            dev.expect_phase(HaPhase::LlpRestored, "restore_hlp")?;
            if dev.is_slave() {
                return Err(PipeMgrError::not_supported(
                    "HLP restore on a virtual device slave",
                ));
            }
            for tbl_hdl in dev.owners.ordered(&HLP_ORDER) {
                let move_list = dev.llp_move_lists.remove(&tbl_hdl).unwrap_or_default();
                dev.owners
                    .get_mut(tbl_hdl)?
                    .owner
                    .hlp_restore_state(move_list)?;
            }
            dev.advance(HaPhase::HlpRestored);
            Ok(())
        })
    }

    /// Hands one replayed application entry to its table.
    pub fn replay_entry(
        &self,
        dev_id: DevId,
        tbl_hdl: TblHdl,
        request: ReplayRequest,
    ) -> PipeResult<EntHdl> {
        self.devices.with_device(dev_id, |dev| {
            dev.expect_phase(HaPhase::HlpRestored, "replay_entry")?;
            dev.owners.get_mut(tbl_hdl)?.owner.replay(&request)
        })
    }

    /// Computes every table's delta, tells the application and, on physical
    /// devices, programs it.
    ///
    /// A failing table does not stop its siblings; the first error is
    /// returned once every table was visited.
    #[instrument(skip(self))]
    pub fn compute_delta_changes(&self, dev_id: DevId) -> PipeResult<()> {
        let cb = self.move_list_cb.clone();
        self.devices.with_device(dev_id, |dev| {
            if dev.is_slave() {
                dev.expect_phase(HaPhase::LlpRestored, "compute_delta_changes")?;
                for tbl_hdl in dev.owners.ordered(&DELTA_ORDER) {
                    if let (Some(cb), Some(move_list)) = (&cb, dev.llp_move_lists.get(&tbl_hdl)) {
                        cb(dev_id, tbl_hdl, move_list);
                    }
                }
                dev.advance(HaPhase::DeltaComputed);
                return Ok(());
            }

            dev.expect_phase(HaPhase::HlpRestored, "compute_delta_changes")?;
            let program = dev.info.mode == DeviceMode::Physical;
            let mut first_error = None;
            for tbl_hdl in dev.owners.ordered(&DELTA_ORDER) {
                let tbl = dev.owners.get_mut(tbl_hdl)?;
                let outcome = tbl.owner.compute_delta_changes();
                if let Some(report) = outcome.report {
                    dev.reports.insert(tbl_hdl, report);
                }
                let result = outcome.result.and_then(|move_list| {
                    let summary = summarize(&move_list);
                    debug!(dev_id, tbl_hdl, ?summary, "Table delta computed");
                    if let Some(cb) = &cb {
                        cb(dev_id, tbl_hdl, &move_list);
                    }
                    if program {
                        tbl.owner.process_move_list(&move_list)?;
                    }
                    Ok(())
                });
                if let Err(e) = result {
                    error!(dev_id, tbl_hdl, error = %e, "Delta computation failed");
                    first_error.get_or_insert(e);
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
            dev.advance(HaPhase::DeltaComputed);
            Ok(())
        })
    }

    /// Leaves HA mode and replays everything accumulated during it, then
    /// frees all HA state of the device.
    #[instrument(skip(self))]
    pub fn push_delta_changes(&self, dev_id: DevId) -> PipeResult<()> {
        let driver = Arc::clone(&self.driver);
        self.devices.with_device(dev_id, |dev| {
            dev.expect_phase(HaPhase::DeltaComputed, "push_delta_changes")?;
            let physical = dev.info.mode == DeviceMode::Physical;

            driver.exit_ha_mode(dev_id)?;
            if physical {
                driver.restore_dma_weighting(dev_id)?;
            }
            driver.flush_session(dev_id)?;
            if physical {
                // Stateful memory and meters start over from shadow; counters
                // are left as they are.
                for tbl_hdl in dev.owners.tables_of(RestoreClass::Resource) {
                    let tbl = dev.owners.get_mut(tbl_hdl)?;
                    tbl.owner.redownload_specs(&dev.shadow, &tbl.info)?;
                }
            }
            driver.drain(dev_id)?;

            for tbl in dev.owners.iter_mut() {
                tbl.owner.cleanup_hlp_ha_state();
                tbl.owner.cleanup_llp_ha_state();
            }
            dev.llp_move_lists.clear();
            dev.shadow.clear();
            dev.advance(HaPhase::Pushed);
            Ok(())
        })
    }

    /// Runs every phase up to the point where the application replays its
    /// entries.
    pub fn warm_init(&self, dev_id: DevId) -> PipeResult<()> {
        self.update_symmetricity(dev_id)?;
        self.initiate_hw_read(dev_id)?;
        self.complete_hw_read(dev_id)?;
        if !self.is_slave(dev_id)? {
            self.restore_hlp(dev_id)?;
        }
        Ok(())
    }

    /// Finishes warm restart after the replay.
    pub fn warm_init_finish(&self, dev_id: DevId) -> PipeResult<()> {
        self.compute_delta_changes(dev_id)?;
        self.push_delta_changes(dev_id)
    }

    fn is_slave(&self, dev_id: DevId) -> PipeResult<bool> {
        self.devices.with_device(dev_id, |dev| Ok(dev.is_slave()))
    }
}

fn issue_read(
    driver: &dyn HaDriver,
    dev_id: DevId,
    shadow: &Arc<ShadowMemory>,
    tracker: &Arc<ReadTracker>,
    pipe: PipeId,
    region: MemRegion,
) -> PipeResult<()> {
    tracker.begin();
    // Whichever of the completion and the failed issue comes first settles
    // the read; the other must not touch the tracker.
    let settled = Arc::new(AtomicBool::new(false));
    let shadow = Arc::clone(shadow);
    let done = Arc::clone(tracker);
    let fired = Arc::clone(&settled);
    let callback: BlockReadCallback = Box::new(move |completion: BlockReadCompletion| {
        if fired.swap(true, Ordering::AcqRel) {
            warn!(dev_id, pipe, addr = region.addr, "Completion for a block read that failed to issue");
            return;
        }
        let mut had_error = completion.had_error;
        if !had_error {
            if let Err(e) = shadow.write_rows(pipe, &region, completion.offset, &completion.data) {
                error!(dev_id, pipe, addr = region.addr, error = %e, "Block read landed outside its region");
                had_error = true;
            }
        }
        done.complete(had_error);
    });
    driver
        .issue_block_read(dev_id, pipe, region, callback)
        .inspect_err(|_| {
            if !settled.swap(true, Ordering::AcqRel) {
                tracker.cancel();
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Fails every read, optionally completing it first or holding the
    /// completion back.
    enum FailMode {
        Plain,
        CompleteFirst,
        CompleteLater,
    }

    struct FailingDriver {
        mode: FailMode,
        held: Mutex<Vec<BlockReadCallback>>,
    }

    impl FailingDriver {
        fn new(mode: FailMode) -> Self {
            Self {
                mode,
                held: Mutex::new(Vec::new()),
            }
        }
    }

    impl HaDriver for FailingDriver {
        fn issue_block_read(&self, _: DevId, _: PipeId, region: MemRegion, callback: BlockReadCallback) -> PipeResult<()> {
            match self.mode {
                FailMode::Plain => {}
                FailMode::CompleteFirst => callback(BlockReadCompletion {
                    data: vec![0; region.len()],
                    offset: 0,
                    count: region.depth,
                    had_error: false,
                }),
                FailMode::CompleteLater => self.held.lock().push(callback),
            }
            Err(PipeMgrError::hardware("dma queue full"))
        }

        fn read_scratch(&self, _: DevId, _: PipeId, _: StageId) -> PipeResult<u32> {
            Ok(0)
        }

        fn exit_ha_mode(&self, _: DevId) -> PipeResult<()> {
            Ok(())
        }

        fn restore_dma_weighting(&self, _: DevId) -> PipeResult<()> {
            Ok(())
        }

        fn flush_session(&self, _: DevId) -> PipeResult<()> {
            Ok(())
        }

        fn drain(&self, _: DevId) -> PipeResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_issue_settles_read_once() {
        for mode in [FailMode::Plain, FailMode::CompleteFirst, FailMode::CompleteLater] {
            let driver = FailingDriver::new(mode);
            let shadow = Arc::new(ShadowMemory::new());
            let tracker = Arc::new(ReadTracker::new());
            // Another read still in flight.
            tracker.begin();

            let region = MemRegion::new(0x200, 4, 2);
            assert!(issue_read(&driver, 0, &shadow, &tracker, 0, region).is_err());
            assert_eq!(tracker.pending(), 1);

            for callback in driver.held.lock().drain(..) {
                callback(BlockReadCompletion {
                    data: vec![0; 8],
                    offset: 0,
                    count: 2,
                    had_error: false,
                });
            }
            assert_eq!(tracker.pending(), 1);
        }
    }
}
