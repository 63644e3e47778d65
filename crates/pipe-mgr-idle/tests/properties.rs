//! Invariants of the metadata store and the lock-gated task queue.

use pipe_mgr_idle::{IdleTask, MetadataStore, TaskList, TaskQueue};
use pipe_mgr_types::{LockId, PipeBitmap, PipeId};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum MdOp {
    Add { pipe: PipeId },
    /// Delete and confirm the n-th live location, if any.
    Remove { nth: usize },
}

fn md_ops() -> impl Strategy<Value = Vec<MdOp>> {
    let op = prop_oneof![
        (0u32..4).prop_map(|pipe| MdOp::Add { pipe }),
        (0usize..8).prop_map(|nth| MdOp::Remove { nth }),
    ];
    prop::collection::vec(op, 0..48)
}

fn task(n: u32) -> IdleTask {
    IdleTask::UpdateTtl { ent_hdl: n }
}

/// Shape of a queue: task count per list and whether the list is locked.
fn queue_shape() -> impl Strategy<Value = Vec<(u32, bool)>> {
    prop::collection::vec((0u32..4, any::<bool>()), 1..8)
}

proptest! {
    #[test]
    fn prop_refcount_tracks_locations(ops in md_ops()) {
        const HDL: u32 = 42;
        let mut store = MetadataStore::new();
        let mut next_index = 0u32;
        for op in ops {
            match op {
                MdOp::Add { pipe } => {
                    store.add(HDL, pipe, next_index, 500, 500).unwrap();
                    next_index += 1;
                }
                MdOp::Remove { nth } => {
                    let Some(md) = store.get(HDL) else { continue };
                    let loc = md.locations()[nth % md.locations().len()].clone();
                    store.del(HDL, loc.pipe, loc.dest_index).unwrap();
                    let removed = store.process_del(HDL, loc.pipe, loc.cur_index).unwrap();
                    prop_assert_eq!(removed.is_some(), md.refcount() == 1);
                }
            }
            match store.get(HDL) {
                Some(md) => {
                    prop_assert!(md.refcount() > 0);
                    prop_assert_eq!(md.refcount() as usize, md.locations().len());
                }
                None => prop_assert!(!store.contains(HDL)),
            }
        }
    }

    #[test]
    fn prop_no_task_passes_an_unacked_lock(
        shape in queue_shape(),
        ack_order in any::<u64>(),
    ) {
        let pipes = PipeBitmap::first_n(2);
        let mut queue = TaskQueue::new();
        let mut next_task = 0u32;
        let mut lists: Vec<(Vec<u32>, Option<LockId>)> = Vec::new();
        for (i, (count, locked)) in shape.iter().enumerate() {
            let ids: Vec<u32> = (next_task..next_task + count).collect();
            next_task += count;
            let tasks = ids.iter().map(|n| task(*n));
            let lock = locked.then_some(i as LockId);
            queue.push_list(match lock {
                Some(lock_id) => TaskList::locked(tasks, lock_id, pipes),
                None => TaskList::closed(tasks),
            });
            lists.push((ids, lock));
        }

        // Every (lock, pipe) ack, in a shuffled order.
        let mut acks: Vec<(LockId, PipeId)> = lists
            .iter()
            .filter_map(|(_, lock)| *lock)
            .flat_map(|lock| [(lock, 0), (lock, 1)])
            .collect();
        let mut seed = ack_order;
        for i in (1..acks.len()).rev() {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            acks.swap(i, (seed >> 33) as usize % (i + 1));
        }

        let mut drained: Vec<u32> = queue
            .drain_ready()
            .into_iter()
            .map(|t| match t {
                IdleTask::UpdateTtl { ent_hdl } => ent_hdl,
                other => panic!("unexpected task {:?}", other),
            })
            .collect();
        let mut acked: Vec<(LockId, PipeId)> = Vec::new();
        loop {
            // Released prefix: lists up to the first lock missing an ack.
            let expected: Vec<u32> = lists
                .iter()
                .take_while(|(_, lock)| match lock {
                    Some(l) => acked.contains(&(*l, 0)) && acked.contains(&(*l, 1)),
                    None => true,
                })
                .flat_map(|(ids, _)| ids.iter().copied())
                .collect();
            prop_assert_eq!(&drained, &expected);

            let Some(ack) = acks.pop() else { break };
            queue.ack_lock(ack.0, ack.1).unwrap();
            acked.push(ack);
            drained.extend(queue.drain_ready().into_iter().map(|t| match t {
                IdleTask::UpdateTtl { ent_hdl } => ent_hdl,
                other => panic!("unexpected task {:?}", other),
            }));
        }
        prop_assert_eq!(drained.len() as u32, next_task);
        prop_assert_eq!(queue.pending_tasks(), 0);
    }
}

#[test]
fn test_later_list_waits_for_lock_five() {
    let pipes = PipeBitmap::from_pipes([0]);
    let mut queue = TaskQueue::new();
    queue.push_list(TaskList::closed([task(1)]));
    queue.push_list(TaskList::locked([task(2)], 5, pipes));
    queue.push_list(TaskList::closed([task(3)]));

    assert_eq!(queue.drain_ready(), vec![task(1)]);
    queue.push(task(4));
    assert!(queue.drain_ready().is_empty());
    queue.ack_lock(5, 0).unwrap();
    assert_eq!(queue.drain_ready(), vec![task(2), task(3), task(4)]);
}
