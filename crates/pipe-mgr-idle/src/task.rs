//! Per-stage queue of pending idle tasks, gated by hardware lock
//! acknowledgements.
//!
//! Lists are strictly FIFO. A list sealed with a lock id, and every list
//! behind it, waits until each pipe acknowledged that lock. Index-affecting
//! tasks in the open tail list wait for the next lock as well, since hardware
//! has not confirmed them yet.

use pipe_mgr_types::{EntHdl, LockId, PipeBitmap, PipeId, PipeMgrError, PipeResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::message::IdleMsg;
use crate::state::PollState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdleTask {
    Move {
        pipe: PipeId,
        src_idx: u32,
        dest_idx: u32,
        ent_hdl: EntHdl,
    },
    Del {
        pipe: PipeId,
        del_idx: u32,
        ent_hdl: EntHdl,
    },
    Add {
        pipe: PipeId,
        add_idx: u32,
        ent_hdl: EntHdl,
        poll_state: PollState,
    },
    UpdateTtl {
        ent_hdl: EntHdl,
    },
    ResetTtl {
        ent_hdl: EntHdl,
    },
}

impl IdleTask {
    /// Moves, deletes and adds change which entry occupies an index.
    pub fn affects_index(&self) -> bool {
        matches!(
            self,
            IdleTask::Move { .. } | IdleTask::Del { .. } | IdleTask::Add { .. }
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskList {
    tasks: VecDeque<IdleTask>,
    lock_id: Option<LockId>,
    pending_acks: PipeBitmap,
    sealed: bool,
}

impl TaskList {
    /// A closed list that needs no acknowledgement.
    pub fn closed(tasks: impl IntoIterator<Item = IdleTask>) -> Self {
        Self {
            tasks: tasks.into_iter().collect(),
            sealed: true,
            ..Default::default()
        }
    }

    /// A closed list released by `lock_id` once every pipe in `pipes` acked.
    pub fn locked(tasks: impl IntoIterator<Item = IdleTask>, lock_id: LockId, pipes: PipeBitmap) -> Self {
        Self {
            tasks: tasks.into_iter().collect(),
            lock_id: Some(lock_id),
            pending_acks: pipes,
            sealed: true,
        }
    }

    pub fn lock_id(&self) -> Option<LockId> {
        self.lock_id
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn is_released(&self) -> bool {
        self.sealed && self.pending_acks.is_empty()
    }
}

/// Hardware messages for one pipe of a stage, held until the next sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEvent {
    pub pipe: PipeId,
    pub msgs: Vec<IdleMsg>,
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    lists: VecDeque<TaskList>,
    deferred: VecDeque<StageEvent>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task to the open tail list.
    pub fn push(&mut self, task: IdleTask) {
        match self.lists.back_mut() {
            Some(list) if !list.sealed => list.tasks.push_back(task),
            _ => self.lists.push_back(TaskList {
                tasks: VecDeque::from([task]),
                ..Default::default()
            }),
        }
    }

    pub fn push_list(&mut self, list: TaskList) {
        self.lists.push_back(list);
    }

    /// Closes the open tail list under `lock_id`. An empty list is still
    /// created so the acknowledgement has something to release.
    pub fn seal_with_lock(&mut self, lock_id: LockId, pipes: PipeBitmap) {
        match self.lists.back_mut() {
            Some(list) if !list.sealed => {
                list.lock_id = Some(lock_id);
                list.pending_acks = pipes;
                list.sealed = true;
            }
            _ => self.lists.push_back(TaskList::locked([], lock_id, pipes)),
        }
    }

    /// Records one pipe's acknowledgement of `lock_id`.
    pub fn ack_lock(&mut self, lock_id: LockId, pipe: PipeId) -> PipeResult<()> {
        let list = self
            .lists
            .iter_mut()
            .find(|l| l.lock_id == Some(lock_id) && l.pending_acks.contains(pipe))
            .ok_or_else(|| {
                PipeMgrError::not_found(format!("pending lock {} for pipe {}", lock_id, pipe))
            })?;
        list.pending_acks.remove(pipe);
        Ok(())
    }

    /// Removes every task that may be applied now, in order.
    ///
    /// Stops at the first list still waiting for acknowledgements. From the
    /// open tail list only the prefix before the first index-affecting task
    /// is taken.
    pub fn drain_ready(&mut self) -> Vec<IdleTask> {
        let mut ready = Vec::new();
        while let Some(front) = self.lists.front_mut() {
            if front.is_released() {
                if let Some(list) = self.lists.pop_front() {
                    ready.extend(list.tasks);
                }
                continue;
            }
            if !front.sealed {
                while front.tasks.front().is_some_and(|t| !t.affects_index()) {
                    ready.extend(front.tasks.pop_front());
                }
                if front.tasks.is_empty() {
                    self.lists.pop_front();
                }
            }
            break;
        }
        ready
    }

    pub fn pending_tasks(&self) -> usize {
        self.lists.iter().map(TaskList::len).sum()
    }

    pub fn pending_locks(&self) -> Vec<LockId> {
        self.lists.iter().filter_map(|l| l.lock_id).collect()
    }

    pub fn defer(&mut self, event: StageEvent) {
        self.deferred.push_back(event);
    }

    pub fn take_deferred(&mut self) -> VecDeque<StageEvent> {
        std::mem::take(&mut self.deferred)
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }
}
