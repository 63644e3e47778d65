//! Demultiplexes idle notification buffers onto table stages.
//!
//! Buffers are parsed concurrently by whatever driver threads complete them,
//! but are handed to the stages and recycled in the order they sit on the
//! free-memory ring. A buffer that fails to parse is dropped whole and still
//! recycled so the ring keeps moving.

use parking_lot::{Condvar, Mutex, RwLock};
use pipe_mgr_common::IdleConfig;
use pipe_mgr_types::{
    DevId, LogicalTblId, PipeId, PipeMgrError, PipeResult, StageId, SubdevId, TblHdl, MAX_PIPES,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use crate::driver::IdleDriver;
use crate::message::{decode_buffer, DrMessage, IdleMsg};
use crate::table::{IdleNotification, IdleTable};

/// Expected order of buffer completions on one sub-device.
#[derive(Debug, Default)]
struct ArrivalGate {
    ring: Mutex<VecDeque<u64>>,
    turn: Condvar,
}

type TupleKey = (StageId, LogicalTblId, PipeId);

pub struct IdleProcessor {
    dev_id: DevId,
    config: IdleConfig,
    driver: Arc<dyn IdleDriver>,
    tables: RwLock<HashMap<(StageId, LogicalTblId), (Arc<IdleTable>, usize)>>,
    gates: Mutex<HashMap<SubdevId, Arc<ArrivalGate>>>,
}

impl IdleProcessor {
    pub fn new(dev_id: DevId, config: IdleConfig, driver: Arc<dyn IdleDriver>) -> Self {
        Self {
            dev_id,
            config,
            driver,
            tables: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn dev_id(&self) -> DevId {
        self.dev_id
    }

    /// Routes messages for every stage of `table` to it.
    pub fn register_table(&self, table: Arc<IdleTable>) -> PipeResult<()> {
        if table.config().dev_id != self.dev_id {
            return Err(PipeMgrError::invalid_arg(format!(
                "idle table {:#x} belongs to device {}, not {}",
                table.tbl_hdl(),
                table.config().dev_id,
                self.dev_id
            )));
        }
        let mut tables = self.tables.write();
        let keys: Vec<_> = table.layouts().map(|l| (l.stage_id, l.logical_tbl)).collect();
        if let Some(key) = keys.iter().find(|k| tables.contains_key(*k)) {
            return Err(PipeMgrError::already_exists(format!(
                "idle table at stage {} logical table {}",
                key.0, key.1
            )));
        }
        for (stage_idx, key) in keys.into_iter().enumerate() {
            tables.insert(key, (table.clone(), stage_idx));
        }
        info!(dev_id = self.dev_id, tbl_hdl = table.tbl_hdl(), "Idle table registered");
        Ok(())
    }

    pub fn unregister_table(&self, tbl_hdl: TblHdl) -> PipeResult<Arc<IdleTable>> {
        let mut tables = self.tables.write();
        let table = tables
            .values()
            .find(|(t, _)| t.tbl_hdl() == tbl_hdl)
            .map(|(t, _)| t.clone())
            .ok_or_else(|| PipeMgrError::not_found(format!("idle table {:#x}", tbl_hdl)))?;
        tables.retain(|_, (t, _)| t.tbl_hdl() != tbl_hdl);
        Ok(table)
    }

    /// Hands the initial notification buffers of a sub-device to hardware.
    /// Buffer `i` lives at `base_addr + i * dr_buffer_size`.
    #[instrument(skip(self))]
    pub fn prime_free_memory(&self, subdev_id: SubdevId, base_addr: u64) -> PipeResult<Vec<u64>> {
        let mut gates = self.gates.lock();
        if gates.contains_key(&subdev_id) {
            return Err(PipeMgrError::already_exists(format!(
                "notification ring of sub-device {}",
                subdev_id
            )));
        }
        let size = self.config.dr_buffer_size;
        let mut ring = VecDeque::with_capacity(self.config.dr_buffer_count);
        for i in 0..self.config.dr_buffer_count {
            let addr = base_addr + (i * size) as u64;
            self.driver.push_free_memory(self.dev_id, subdev_id, addr, size)?;
            ring.push_back(addr);
        }
        let addrs = ring.iter().copied().collect();
        gates.insert(
            subdev_id,
            Arc::new(ArrivalGate {
                ring: Mutex::new(ring),
                turn: Condvar::new(),
            }),
        );
        Ok(addrs)
    }

    /// Completion of one notification buffer. May be called concurrently
    /// from several threads; blocks until every buffer ahead of this one on
    /// the ring was processed.
    pub fn on_completion(&self, subdev_id: SubdevId, addr: u64, data: &[u8]) -> PipeResult<()> {
        let gate = self
            .gates
            .lock()
            .get(&subdev_id)
            .cloned()
            .ok_or_else(|| PipeMgrError::not_found(format!("notification ring of sub-device {}", subdev_id)))?;

        let groups = self.parse(subdev_id, addr, data);

        let notes = {
            let mut ring = gate.ring.lock();
            if !ring.contains(&addr) {
                return Err(PipeMgrError::invalid_arg(format!(
                    "buffer {:#x} is not on the ring of sub-device {}",
                    addr, subdev_id
                )));
            }
            while ring.front() != Some(&addr) {
                gate.turn.wait(&mut ring);
            }

            let mut notes = Vec::new();
            for (table, stage_idx, pipe, msgs) in groups.unwrap_or_default() {
                let delivered = table.deliver(stage_idx, pipe, msgs);
                if !delivered.is_empty() {
                    notes.push((table, delivered));
                }
            }

            let pushed = self
                .driver
                .push_free_memory(self.dev_id, subdev_id, addr, self.config.dr_buffer_size);
            ring.rotate_left(1);
            gate.turn.notify_all();
            pushed?;
            notes
        };

        for (table, delivered) in notes {
            table.dispatch(&delivered);
        }
        Ok(())
    }

    /// Validates a buffer and groups its messages by pipe, stage and logical
    /// table, keeping their order within a group. `None` drops the buffer.
    #[allow(clippy::type_complexity)]
    fn parse(
        &self,
        subdev_id: SubdevId,
        addr: u64,
        data: &[u8],
    ) -> Option<Vec<(Arc<IdleTable>, usize, PipeId, Vec<IdleMsg>)>> {
        let drop_buffer = |reason: String| {
            error!(
                dev_id = self.dev_id,
                subdev_id,
                addr,
                len = data.len(),
                %reason,
                "Dropping idle notification buffer"
            );
        };
        if data.len() > self.config.dr_buffer_size {
            drop_buffer(format!("larger than {} bytes", self.config.dr_buffer_size));
            return None;
        }
        let msgs = match decode_buffer(data) {
            Ok(msgs) => msgs,
            Err(e) => {
                drop_buffer(e.to_string());
                return None;
            }
        };

        let tables = self.tables.read();
        let mut groups: BTreeMap<TupleKey, Vec<IdleMsg>> = BTreeMap::new();
        for DrMessage {
            pipe,
            stage,
            logical_tbl,
            msg,
        } in msgs
        {
            let Some((table, _)) = tables.get(&(stage, logical_tbl)) else {
                drop_buffer(format!("no idle table at stage {} logical table {}", stage, logical_tbl));
                return None;
            };
            if pipe >= MAX_PIPES || !table.config().pipes.contains(pipe) {
                drop_buffer(format!("pipe {} not used by table {:#x}", pipe, table.tbl_hdl()));
                return None;
            }
            groups.entry((stage, logical_tbl, pipe)).or_default().push(msg);
        }
        debug!(dev_id = self.dev_id, subdev_id, addr, groups = groups.len(), "Idle buffer parsed");

        Some(
            groups
                .into_iter()
                .filter_map(|((stage, logical_tbl, pipe), msgs)| {
                    let (table, stage_idx) = tables.get(&(stage, logical_tbl))?;
                    Some((table.clone(), *stage_idx, pipe, msgs))
                })
                .collect(),
        )
    }
}
