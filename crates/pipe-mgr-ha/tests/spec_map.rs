//! Reconciliation scenarios and properties of the spec map.

use pipe_mgr_ha::{
    EntryData, HaEntry, HaEntryState, HaList, MoveList, MoveListNode, MoveOp, ReconcileOps,
    SpecMap, SpecMapConfig,
};
use pipe_mgr_types::{ActFnHdl, ActionSpec, EntHdl, MatchSpec, PipeMgrError, PipeResult};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn restored_node(ent_hdl: EntHdl, key: u8, priority: u32, act_fn: ActFnHdl, data: u8) -> MoveListNode {
    MoveListNode::add(
        ent_hdl,
        EntryData::new(
            Some(MatchSpec::exact(vec![key]).with_priority(priority)),
            ActionSpec::direct(vec![data]),
            act_fn,
        ),
    )
}

fn config(hash_action: bool) -> SpecMapConfig {
    SpecMapConfig {
        hash_action,
        ..SpecMapConfig::new(0, 0x20)
    }
}

/// Counts owner operations; every entry must be handed out exactly once.
#[derive(Default)]
struct Counter {
    updates: usize,
    deletes: usize,
    adds: usize,
    modifies: usize,
}

impl ReconcileOps for Counter {
    fn entry_update(&mut self, entry: &HaEntry, ml: &mut MoveList) -> PipeResult<()> {
        self.updates += 1;
        ml.push(MoveListNode::new(MoveOp::Update, entry.ent_hdl()));
        Ok(())
    }

    fn entry_delete(&mut self, ent_hdl: EntHdl, ml: &mut MoveList) -> PipeResult<()> {
        self.deletes += 1;
        ml.push(MoveListNode::delete(ent_hdl));
        Ok(())
    }

    fn entry_place_with_hdl(&mut self, entry: &HaEntry, ml: &mut MoveList) -> PipeResult<()> {
        self.adds += 1;
        ml.push(entry.to_add_node());
        Ok(())
    }

    fn entry_modify(&mut self, entry: &HaEntry, ml: &mut MoveList) -> PipeResult<()> {
        self.modifies += 1;
        ml.push(MoveListNode::modify(entry.ent_hdl(), entry.data().clone()));
        Ok(())
    }
}

#[test]
fn test_replay_with_zeroed_priority_is_full_match() {
    let mut map = SpecMap::new(config(false));
    map.new_spec(restored_node(11, 0xab, 3, 4, 0x55)).unwrap();

    let hdl = map
        .lookup_spec(
            &MatchSpec::exact(vec![0xab]).with_priority(0),
            &ActionSpec::direct(vec![0x55]),
            4,
            500,
            0,
        )
        .unwrap();
    assert_eq!(hdl, 11);
    let entry = map.entry(11).unwrap();
    assert_eq!(entry.state(), HaEntryState::FullMatch);
    assert_eq!(entry.list(), HaList::FullMatch);
}

#[test]
fn test_action_function_change_depends_on_table_type() {
    let mut ternary = SpecMap::new(config(false));
    ternary.new_spec(restored_node(11, 0xab, 3, 4, 0x55)).unwrap();
    let err = ternary
        .lookup_spec(&MatchSpec::exact(vec![0xab]), &ActionSpec::direct(vec![0x55]), 5, 500, 0)
        .unwrap_err();
    assert!(matches!(err, PipeMgrError::NotSupported { .. }));

    let mut exm = SpecMap::new(config(true));
    exm.new_spec(restored_node(11, 0xab, 3, 4, 0x55)).unwrap();
    let hdl = exm
        .lookup_spec(&MatchSpec::exact(vec![0xab]), &ActionSpec::direct(vec![0x55]), 5, 500, 0)
        .unwrap();
    assert_eq!(hdl, 500);
    assert_eq!(exm.entry(500).unwrap().list(), HaList::ToAdd);
    // The restored entry is still scheduled for deletion.
    assert_eq!(exm.entry(11).unwrap().list(), HaList::ToDelete);
}

#[test]
fn test_report_counts_and_full_drain() {
    let cfg = SpecMapConfig {
        updates_needed_for_full_match_entries: true,
        ..config(true)
    };
    let mut map = SpecMap::new(cfg);
    for (hdl, key) in [(1, 1), (2, 2), (3, 3), (4, 4)] {
        map.new_spec(restored_node(hdl, key, 0, 1, 0)).unwrap();
    }
    map.lookup_spec(&MatchSpec::exact(vec![1]), &ActionSpec::direct(vec![0]), 1, 100, 0)
        .unwrap();
    map.lookup_spec(&MatchSpec::exact(vec![2]), &ActionSpec::direct(vec![7]), 1, 101, 0)
        .unwrap();
    map.lookup_spec(&MatchSpec::exact(vec![9]), &ActionSpec::direct(vec![0]), 1, 102, 0)
        .unwrap();
    map.lookup_spec(&MatchSpec::exact(vec![8]), &ActionSpec::direct(vec![0]), 1, 103, 0)
        .unwrap();

    let before = map.report();
    assert_eq!(before.added, map.list_len(HaList::ToAdd));
    assert_eq!(before.deleted, map.list_len(HaList::ToDelete));
    assert_eq!(before.modified, map.list_len(HaList::ToModify));
    assert_eq!(before.full_match, map.list_len(HaList::FullMatch));
    let live = map.live_entries();

    let mut ops = Counter::default();
    let (report, result) = map.reconcile(&mut ops);
    assert_eq!(report, before);
    assert_eq!((report.added, report.deleted, report.modified, report.full_match), (2, 2, 1, 1));
    assert_eq!(ops.updates + ops.deletes + ops.adds + ops.modifies, live);
    assert_eq!(result.unwrap().len(), live);

    let json = serde_json::to_value(report).unwrap();
    assert_eq!(json["deleted"], 2);
}

/// Replayed candidates: (act_fn, data) per restored entry sharing one key.
fn candidates() -> impl Strategy<Value = Vec<(ActFnHdl, u8)>> {
    prop::collection::vec((1u32..3, 0u8..3), 1..8)
}

#[derive(Debug, Clone)]
enum Step {
    Restore { key: u8, act_fn: ActFnHdl, data: u8 },
    Replay { key: u8, act_fn: ActFnHdl, data: u8 },
}

fn steps() -> impl Strategy<Value = Vec<Step>> {
    let step = prop_oneof![
        (0u8..4, 1u32..3, 0u8..3).prop_map(|(key, act_fn, data)| Step::Restore { key, act_fn, data }),
        (0u8..4, 1u32..3, 0u8..3).prop_map(|(key, act_fn, data)| Step::Replay { key, act_fn, data }),
    ];
    prop::collection::vec(step, 0..40)
}

proptest! {
    #[test]
    fn prop_lookup_picks_best_candidate(cands in candidates()) {
        let mut map = SpecMap::new(config(true));
        for (i, (act_fn, data)) in cands.iter().enumerate() {
            map.new_spec(restored_node(i as EntHdl + 1, 0xab, 0, *act_fn, *data)).unwrap();
        }

        let hdl = map
            .lookup_spec(&MatchSpec::exact(vec![0xab]), &ActionSpec::direct(vec![0]), 1, 1000, 0)
            .unwrap();

        let full = cands.iter().position(|c| *c == (1, 0));
        let dirty = cands.iter().position(|c| c.0 == 1);
        match (full, dirty) {
            (Some(i), _) => {
                prop_assert_eq!(hdl, i as EntHdl + 1);
                prop_assert_eq!(map.entry(hdl).unwrap().state(), HaEntryState::FullMatch);
            }
            (None, Some(i)) => {
                prop_assert_eq!(hdl, i as EntHdl + 1);
                prop_assert_eq!(map.entry(hdl).unwrap().state(), HaEntryState::ActionDataDirty);
            }
            (None, None) => {
                prop_assert_eq!(hdl, 1000);
                prop_assert_eq!(map.entry(hdl).unwrap().list(), HaList::ToAdd);
            }
        }
    }

    #[test]
    fn prop_every_entry_on_exactly_one_list(steps in steps()) {
        let mut map = SpecMap::new(config(true));
        let mut next_hdl: EntHdl = 1;
        let mut restored = 0usize;
        for step in steps {
            match step {
                Step::Restore { key, act_fn, data } => {
                    map.new_spec(restored_node(next_hdl, key, 0, act_fn, data)).unwrap();
                    restored += 1;
                }
                Step::Replay { key, act_fn, data } => {
                    map.lookup_spec(
                        &MatchSpec::exact(vec![key]),
                        &ActionSpec::direct(vec![data]),
                        act_fn,
                        next_hdl,
                        0,
                    )
                    .unwrap();
                }
            }
            next_hdl += 1;
            prop_assert!(map.check_partition().is_ok());
        }
        let on_lists = map.list_len(HaList::ToDelete)
            + map.list_len(HaList::ToAdd)
            + map.list_len(HaList::ToModify)
            + map.list_len(HaList::FullMatch);
        prop_assert_eq!(on_lists, map.live_entries());
        prop_assert!(map.live_entries() >= restored);
    }
}
