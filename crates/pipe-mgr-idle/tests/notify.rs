//! Notify-mode aging driven through the notification processor.

use parking_lot::Mutex;
use pipe_mgr_common::IdleConfig;
use pipe_mgr_idle::{
    encode_buffer, DrMessage, EntryAdd, HitState, IdleDriver, IdleMode, IdleMsg, IdleNotification,
    IdleProcessor, IdleTable, IdleTableConfig, NotifyState, StageLayout,
};
use pipe_mgr_types::{
    DevId, EntHdl, LockId, LogicalTblId, PipeBitmap, PipeId, PipeResult, StageId, SubdevId,
    TblHdl, ALL_PIPES,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const STAGE: StageId = 4;
const LTBL: LogicalTblId = 1;
const RING_BASE: u64 = 0x10_0000;
const BUF_SIZE: usize = 256;

#[derive(Default)]
struct RingDriver {
    recycled: Mutex<Vec<u64>>,
}

impl IdleDriver for RingDriver {
    fn push_free_memory(&self, _: DevId, _: SubdevId, addr: u64, _: usize) -> PipeResult<()> {
        self.recycled.lock().push(addr);
        Ok(())
    }

    fn request_dump(&self, _: DevId, _: TblHdl, _: PipeId, _: StageId, _: LogicalTblId) -> PipeResult<()> {
        Ok(())
    }
}

struct Harness {
    driver: Arc<RingDriver>,
    table: Arc<IdleTable>,
    proc: IdleProcessor,
    calls: Arc<Mutex<Vec<(EntHdl, HitState)>>>,
    next_buf: usize,
}

impl Harness {
    fn new(config: IdleTableConfig) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let driver = Arc::new(RingDriver::default());
        let table = Arc::new(IdleTable::new(config, driver.clone()).unwrap());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        table.register_callback(Arc::new(move |n: &IdleNotification| {
            sink.lock().push((n.ent_hdl, n.hit_state));
        }));

        let idle_config = IdleConfig {
            dr_buffer_size: BUF_SIZE,
            dr_buffer_count: 4,
            ..IdleConfig::default()
        };
        let proc = IdleProcessor::new(0, idle_config, driver.clone());
        proc.register_table(table.clone()).unwrap();
        proc.prime_free_memory(0, RING_BASE).unwrap();
        driver.recycled.lock().clear();
        Self {
            driver,
            table,
            proc,
            calls,
            next_buf: 0,
        }
    }

    fn buffer_addr(i: usize) -> u64 {
        RING_BASE + ((i % 4) * BUF_SIZE) as u64
    }

    fn send(&mut self, msgs: &[DrMessage]) {
        let addr = Self::buffer_addr(self.next_buf);
        self.next_buf += 1;
        self.proc.on_completion(0, addr, &encode_buffer(msgs).unwrap()).unwrap();
    }

    fn ack(&mut self, lock_id: LockId, pipes: &[PipeId]) {
        let msgs: Vec<_> = pipes
            .iter()
            .map(|p| DrMessage::new(*p, STAGE, LTBL, IdleMsg::LockAck { lock_id }))
            .collect();
        self.send(&msgs);
    }

    fn fsm(&mut self, pipe: PipeId, index: u32, active: bool) {
        self.send(&[DrMessage::new(pipe, STAGE, LTBL, IdleMsg::Fsm { index, active })]);
    }

    fn calls(&self) -> Vec<(EntHdl, HitState)> {
        self.calls.lock().clone()
    }
}

fn swept_table(pipes: u32) -> IdleTableConfig {
    IdleTableConfig::new(0, 0x50, IdleMode::Notify, PipeBitmap::first_n(pipes))
        .with_stage(StageLayout::new(STAGE, LTBL, 32))
        .with_periods(200, 100)
}

#[test]
fn test_long_ttl_decays_in_software_and_notifies_once() {
    let mut h = Harness::new(swept_table(1));
    h.table.entry_add(EntryAdd::new(7, ALL_PIPES, STAGE, 4, 1000)).unwrap();
    let lock = h.table.issue_lock();
    h.ack(lock, &[0]);
    h.table.sweep(STAGE).unwrap();
    assert_eq!(h.table.notify_state(7, STAGE).unwrap(), NotifyState::Active);

    h.fsm(0, 4, false);
    // Messages wait for the sweep.
    assert_eq!(h.table.get_ttl(7, STAGE).unwrap(), 1000);

    let mut seen = Vec::new();
    for _ in 0..10 {
        h.table.sweep(STAGE).unwrap();
        seen.push(h.table.get_ttl(7, STAGE).unwrap());
    }
    assert_eq!(seen, vec![700, 600, 500, 400, 300, 200, 100, 0, 0, 0]);
    assert_eq!(h.calls(), vec![(7, HitState::Idle)]);
    assert_eq!(h.table.notify_state(7, STAGE).unwrap(), NotifyState::Idle);
    assert_eq!(*h.driver.recycled.lock(), vec![RING_BASE, RING_BASE + BUF_SIZE as u64]);

    let dump = serde_json::to_value(h.table.dump()).unwrap();
    assert_eq!(dump["notified_idle"], serde_json::json!([7]));
    assert_eq!(dump["stages"][0]["sweeping"], serde_json::json!(0));
}

#[test]
fn test_hit_during_sweep_resets_silently() {
    let mut h = Harness::new(swept_table(1));
    h.table.entry_add(EntryAdd::new(7, ALL_PIPES, STAGE, 4, 1000)).unwrap();
    let lock = h.table.issue_lock();
    h.ack(lock, &[0]);
    h.fsm(0, 4, false);
    h.table.sweep(STAGE).unwrap();
    h.table.sweep(STAGE).unwrap();
    assert_eq!(h.table.get_ttl(7, STAGE).unwrap(), 600);

    h.fsm(0, 4, true);
    h.table.sweep(STAGE).unwrap();
    assert_eq!(h.table.notify_state(7, STAGE).unwrap(), NotifyState::Active);
    assert_eq!(h.table.get_ttl(7, STAGE).unwrap(), 1000);
    assert!(h.calls().is_empty());
}

#[test]
fn test_short_ttl_idles_on_hardware_message() {
    let config = IdleTableConfig::new(0, 0x51, IdleMode::Notify, PipeBitmap::first_n(2))
        .with_stage(StageLayout::new(STAGE, LTBL, 32))
        .with_periods(200, 0)
        .with_max_ttl(200);
    let mut h = Harness::new(config);
    h.table.entry_add(EntryAdd::new(3, ALL_PIPES, STAGE, 0, 150)).unwrap();
    let lock = h.table.issue_lock();
    h.ack(lock, &[0, 1]);

    h.fsm(1, 0, false);
    assert!(h.calls().is_empty());
    h.fsm(0, 0, false);
    assert_eq!(h.calls(), vec![(3, HitState::Idle)]);
    h.fsm(0, 0, true);
    assert_eq!(h.calls(), vec![(3, HitState::Idle), (3, HitState::Active)]);
}

#[test]
fn test_zero_ttl_entry_never_ages() {
    let mut h = Harness::new(swept_table(1));
    h.table.entry_add(EntryAdd::new(9, ALL_PIPES, STAGE, 2, 0)).unwrap();
    let lock = h.table.issue_lock();
    h.ack(lock, &[0]);
    h.fsm(0, 2, false);
    h.fsm(0, 2, true);
    for _ in 0..3 {
        h.table.sweep(STAGE).unwrap();
    }
    assert_eq!(h.table.notify_state(9, STAGE).unwrap(), NotifyState::Disabled);
    assert!(h.calls().is_empty());
}

#[test]
fn test_notification_before_lock_ack_does_not_hit_new_entry() {
    let mut h = Harness::new(swept_table(1));
    h.table.entry_add(EntryAdd::new(7, ALL_PIPES, STAGE, 4, 150)).unwrap();
    let lock = h.table.issue_lock();
    // Hardware still reports on the slot's previous occupant.
    h.fsm(0, 4, false);
    h.ack(lock, &[0]);
    h.table.sweep(STAGE).unwrap();
    assert_eq!(h.table.notify_state(7, STAGE).unwrap(), NotifyState::Active);
    assert!(h.calls().is_empty());
}

#[test]
fn test_buffers_processed_in_ring_order() {
    let config = IdleTableConfig::new(0, 0x52, IdleMode::Notify, PipeBitmap::first_n(1))
        .with_stage(StageLayout::new(STAGE, LTBL, 32))
        .with_periods(200, 0)
        .with_max_ttl(200);
    let h = Harness::new(config);
    h.table.entry_add(EntryAdd::new(5, ALL_PIPES, STAGE, 1, 100)).unwrap();
    let lock = h.table.issue_lock();

    let bufs = [
        vec![DrMessage::new(0, STAGE, LTBL, IdleMsg::LockAck { lock_id: lock })],
        vec![DrMessage::new(0, STAGE, LTBL, IdleMsg::Fsm { index: 1, active: false })],
        vec![DrMessage::new(0, STAGE, LTBL, IdleMsg::Fsm { index: 1, active: true })],
    ];
    let encoded: Vec<Vec<u8>> = bufs.iter().map(|b| encode_buffer(b).unwrap()).collect();

    thread::scope(|s| {
        for i in [2usize, 1, 0] {
            let proc = &h.proc;
            let data = &encoded[i];
            s.spawn(move || {
                proc.on_completion(0, Harness::buffer_addr(i), data).unwrap();
            });
            thread::sleep(Duration::from_millis(20));
        }
    });

    assert_eq!(
        *h.driver.recycled.lock(),
        vec![
            Harness::buffer_addr(0),
            Harness::buffer_addr(1),
            Harness::buffer_addr(2)
        ]
    );
    // Callbacks run after the ordering gate is released, so only the set
    // is fixed.
    let calls = h.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.contains(&(5, HitState::Idle)));
    assert!(calls.contains(&(5, HitState::Active)));
    assert_eq!(h.table.notify_state(5, STAGE).unwrap(), NotifyState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_timer_drives_aging() {
    let mut h = Harness::new(swept_table(1));
    h.table.entry_add(EntryAdd::new(7, ALL_PIPES, STAGE, 4, 1000)).unwrap();
    let lock = h.table.issue_lock();
    h.ack(lock, &[0]);
    h.fsm(0, 4, false);

    let timers = h.table.start_sweep_timers().unwrap();
    assert_eq!(timers.len(), 1);

    tokio::time::sleep(Duration::from_millis(750)).await;
    assert!(h.calls().is_empty());
    assert_eq!(h.table.get_ttl(7, STAGE).unwrap(), 100);

    tokio::time::sleep(Duration::from_millis(850)).await;
    assert_eq!(h.calls(), vec![(7, HitState::Idle)]);

    for timer in timers {
        assert!(timer.stop().await);
    }
    assert_eq!(h.table.dump().stages[0].sweeping, 0);
}
