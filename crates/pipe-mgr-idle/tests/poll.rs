//! Poll-mode activity tracking from hardware dumps.

use parking_lot::Mutex;
use pipe_mgr_idle::{
    EntryAdd, IdleDriver, IdleEntry, IdleMode, IdleTable, IdleTableConfig, PollState, StageLayout,
};
use pipe_mgr_types::{
    DevId, LogicalTblId, PipeBitmap, PipeId, PipeMgrError, PipeResult, StageId, SubdevId, TblHdl,
    ALL_PIPES,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;

const STAGE: StageId = 1;
const LTBL: LogicalTblId = 0;

/// Records dump requests; the test feeds the results back itself.
#[derive(Default)]
struct DumpDriver {
    requests: Mutex<Vec<(PipeId, StageId, LogicalTblId)>>,
}

impl IdleDriver for DumpDriver {
    fn push_free_memory(&self, _: DevId, _: SubdevId, _: u64, _: usize) -> PipeResult<()> {
        Ok(())
    }

    fn request_dump(&self, _: DevId, _: TblHdl, pipe: PipeId, stage: StageId, ltbl: LogicalTblId) -> PipeResult<()> {
        self.requests.lock().push((pipe, stage, ltbl));
        Ok(())
    }
}

mod harness {
    use super::*;
    use pipe_mgr_common::IdleConfig;
    use pipe_mgr_idle::{encode_buffer, DrMessage, IdleMsg, IdleProcessor};
    use pipe_mgr_types::LockId;

    pub struct PollHarness {
        pub table: Arc<IdleTable>,
        pub driver: Arc<DumpDriver>,
        proc: IdleProcessor,
    }

    impl PollHarness {
        pub fn new(config: IdleTableConfig) -> Self {
            let driver = Arc::new(DumpDriver::default());
            let table = Arc::new(IdleTable::new(config, driver.clone()).unwrap());
            let idle_config = IdleConfig {
                dr_buffer_size: 64,
                dr_buffer_count: 1,
                ..IdleConfig::default()
            };
            let proc = IdleProcessor::new(0, idle_config, driver.clone());
            proc.register_table(table.clone()).unwrap();
            proc.prime_free_memory(0, 0).unwrap();
            Self {
                table,
                driver,
                proc,
            }
        }

        fn send(&mut self, msgs: Vec<DrMessage>) {
            // A single-buffer ring reuses the same address every time.
            self.proc.on_completion(0, 0, &encode_buffer(&msgs).unwrap()).unwrap();
        }

        pub fn ack(&mut self, lock_id: LockId, pipes: &[PipeId]) {
            let msgs = pipes
                .iter()
                .map(|p| DrMessage::new(*p, STAGE, LTBL, IdleMsg::LockAck { lock_id }))
                .collect();
            self.send(msgs);
        }

        /// One dump round: `hits[p]` are the activity bits of pipe `p` for
        /// entries `0..8`.
        pub fn dump(&mut self, hits: &[(PipeId, u8)]) {
            let msgs = hits
                .iter()
                .map(|(p, bits)| DrMessage::new(*p, STAGE, LTBL, IdleMsg::Dump { base_index: 0, hits: *bits }))
                .collect();
            self.send(msgs);
        }
    }
}

use harness::PollHarness;

fn poll_config(pipes: u32) -> IdleTableConfig {
    IdleTableConfig::new(0, 0x60, IdleMode::Poll, PipeBitmap::first_n(pipes))
        .with_stage(StageLayout::new(STAGE, LTBL, 16))
        .with_periods(0, 0)
}

#[test]
fn test_symmetric_entry_active_while_any_pipe_hits() {
    let mut h = PollHarness::new(poll_config(2));
    h.table.entry_add(EntryAdd::new(11, ALL_PIPES, STAGE, 3, 0)).unwrap();
    let lock = h.table.issue_lock();
    h.ack(lock, &[0, 1]);

    h.table.update_hit_state().unwrap();
    assert_eq!(h.driver.requests.lock().len(), 2);
    h.dump(&[(0, 1 << 3), (1, 0)]);
    assert_eq!(h.table.get_poll_state(11, STAGE).unwrap(), PollState::Active);

    // Two quiet dumps in a row across the pipes turn it idle.
    h.dump(&[(0, 0)]);
    assert_eq!(h.table.get_poll_state(11, STAGE).unwrap(), PollState::Idle);

    h.dump(&[(1, 1 << 3)]);
    assert_eq!(h.table.get_poll_state(11, STAGE).unwrap(), PollState::Active);
}

#[test]
fn test_asymmetric_poll_state_is_max_over_pipes() {
    let mut h = PollHarness::new(poll_config(2).asymmetric());
    h.table.entry_add(EntryAdd::new(11, 0, STAGE, 2, 0)).unwrap();
    h.table.entry_add(EntryAdd::new(11, 1, STAGE, 5, 0)).unwrap();
    let lock = h.table.issue_lock();
    h.ack(lock, &[0, 1]);
    assert_eq!(h.table.entry_mdata_get(11, STAGE).unwrap().refcount(), 2);

    h.dump(&[(0, 1 << 2), (1, 0)]);
    assert_eq!(h.table.get_poll_state(11, STAGE).unwrap(), PollState::Active);

    h.dump(&[(0, 0)]);
    assert_eq!(h.table.get_poll_state(11, STAGE).unwrap(), PollState::Idle);
}

#[test]
fn test_set_poll_state_overrides_dumps() {
    let mut h = PollHarness::new(poll_config(1));
    h.table
        .entry_add(EntryAdd::new(4, ALL_PIPES, STAGE, 0, 0).with_poll_state(PollState::Idle))
        .unwrap();
    let lock = h.table.issue_lock();
    h.ack(lock, &[0]);
    assert_eq!(h.table.get_poll_state(4, STAGE).unwrap(), PollState::Idle);

    h.table.set_poll_state(4, STAGE, PollState::Active).unwrap();
    assert_eq!(h.table.get_poll_state(4, STAGE).unwrap(), PollState::Active);
    assert!(h.table.get_poll_state(5, STAGE).unwrap_err().is_not_found());
    assert!(matches!(
        h.table.entry_reset_ttl(4, STAGE).unwrap_err(),
        PipeMgrError::NotSupported { .. }
    ));
}

/// Expected state after `dumps`, from an active entry.
fn model(dumps: &[bool], pipe_count: u32) -> PollState {
    let quiet = dumps.iter().rev().take_while(|hit| !**hit).count() as u32;
    if quiet >= pipe_count {
        PollState::Idle
    } else {
        PollState::Active
    }
}

proptest! {
    #[test]
    fn prop_idle_only_after_pipe_count_quiet_dumps(
        dumps in prop::collection::vec(any::<bool>(), 0..24),
        pipe_count in prop::sample::select(vec![1u32, 2, 4]),
    ) {
        let mut entry = IdleEntry { inuse: true, ..IdleEntry::default() };
        for (i, hit) in dumps.iter().enumerate() {
            let state = entry.apply_dump(*hit, pipe_count);
            prop_assert_eq!(state, model(&dumps[..=i], pipe_count));
            if *hit {
                prop_assert_eq!(state, PollState::Active);
            }
        }
    }
}
