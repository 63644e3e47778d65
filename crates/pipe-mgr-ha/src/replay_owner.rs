//! Replay-based reconciliation for tables whose state is rebuilt by matching
//! application replays against entries decoded from hardware.

use crate::move_list::{MoveList, MoveListNode};
use crate::owner::{DeltaOutcome, ReplayRequest, TableInfo, TableOwner, TableOwnerKind};
use crate::shadow::ShadowMemory;
use crate::spec_map::{AdtStateView, ReconcileOps, SpecMap, SpecMapConfig};
use pipe_mgr_types::{EntHdl, PipeMgrError, PipeResult};
use tracing::{debug, warn};

/// Per-table decoding and programming behind a [`ReplayOwner`].
pub trait ReplayTable: ReconcileOps + Send {
    fn kind(&self) -> TableOwnerKind;

    fn spec_map_config(&self) -> SpecMapConfig;

    /// Decodes the table's shadow memory into one add node per restored
    /// entry, rebuilding the table's own placement state on the way.
    fn decode_llp(&mut self, shadow: &ShadowMemory, info: &TableInfo) -> PipeResult<MoveList>;

    /// Programs a move list into hardware.
    fn program(&mut self, move_list: &MoveList) -> PipeResult<()>;

    fn make_asymmetric(&mut self) -> PipeResult<()> {
        Ok(())
    }

    /// Whether a restored action-data entry was shared before the restart.
    fn is_sharable(&self, node: &MoveListNode) -> bool {
        let _ = node;
        false
    }

    /// View of the action-data table this table references, if any.
    fn adt_view(&self) -> Option<Box<dyn AdtStateView>> {
        None
    }

    fn cleanup_llp(&mut self) {}
}

/// Adapts a [`ReplayTable`] to [`TableOwner`] through a [`SpecMap`].
pub struct ReplayOwner<T> {
    table: T,
    spec_map: Option<SpecMap>,
}

impl<T: ReplayTable> ReplayOwner<T> {
    pub fn new(table: T) -> Self {
        Self {
            table,
            spec_map: None,
        }
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut T {
        &mut self.table
    }

    pub fn spec_map(&self) -> Option<&SpecMap> {
        self.spec_map.as_ref()
    }
}

impl<T: ReplayTable> TableOwner for ReplayOwner<T> {
    fn kind(&self) -> TableOwnerKind {
        self.table.kind()
    }

    fn make_asymmetric(&mut self) -> PipeResult<()> {
        self.table.make_asymmetric()
    }

    fn llp_restore_state(
        &mut self,
        shadow: &ShadowMemory,
        info: &TableInfo,
        want_move_list: bool,
    ) -> PipeResult<Option<MoveList>> {
        let move_list = self.table.decode_llp(shadow, info)?;
        debug!(tbl_hdl = info.tbl_hdl, entries = move_list.len(), "LLP state decoded");
        Ok(want_move_list.then_some(move_list))
    }

    fn hlp_restore_state(&mut self, move_list: MoveList) -> PipeResult<()> {
        let mut map = SpecMap::new(self.table.spec_map_config());
        if let Some(view) = self.table.adt_view() {
            map = map.with_adt_view(view);
        }
        let adt = self.table.kind() == TableOwnerKind::ActionData;
        for node in move_list {
            if adt {
                let sharable = self.table.is_sharable(&node);
                map.new_adt_spec(node, sharable)?;
            } else {
                map.new_spec(node)?;
            }
        }
        self.spec_map = Some(map);
        Ok(())
    }

    fn replay(&mut self, request: &ReplayRequest) -> PipeResult<EntHdl> {
        let map = self.spec_map.as_mut().ok_or_else(|| {
            PipeMgrError::unexpected("replay before HLP state was restored")
        })?;
        match request {
            ReplayRequest::Match {
                match_spec,
                action_spec,
                act_fn_hdl,
                new_entry_hdl,
                ttl,
            } => map.lookup_spec(match_spec, action_spec, *act_fn_hdl, *new_entry_hdl, *ttl),
            ReplayRequest::ActionData {
                action_spec,
                act_fn_hdl,
                new_entry_hdl,
            } => match map.lookup_adt_spec(action_spec, *act_fn_hdl, *new_entry_hdl) {
                // A miss already queued the entry for placement under the
                // caller's handle, which is the handle the caller keeps.
                Err(e) if e.is_not_found() => Ok(*new_entry_hdl),
                other => other,
            },
        }
    }

    fn compute_delta_changes(&mut self) -> DeltaOutcome {
        let Some(map) = self.spec_map.take() else {
            warn!(kind = %self.table.kind(), "No spec map to reconcile");
            return DeltaOutcome::empty();
        };
        let (report, result) = map.reconcile(&mut self.table);
        DeltaOutcome {
            report: Some(report),
            result,
        }
    }

    fn process_move_list(&mut self, move_list: &MoveList) -> PipeResult<()> {
        self.table.program(move_list)
    }

    fn cleanup_hlp_ha_state(&mut self) {
        self.spec_map = None;
    }

    fn cleanup_llp_ha_state(&mut self) {
        self.table.cleanup_llp();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::move_list::EntryData;
    use crate::spec_map::{HaEntry, HaList};
    use pipe_mgr_types::{ActionSpec, PipeBitmap};
    use pretty_assertions::assert_eq;

    struct AdtTable {
        restored: MoveList,
    }

    impl ReconcileOps for AdtTable {
        fn entry_update(&mut self, _: &HaEntry, _: &mut MoveList) -> PipeResult<()> {
            Ok(())
        }

        fn entry_delete(&mut self, ent_hdl: EntHdl, ml: &mut MoveList) -> PipeResult<()> {
            ml.push(MoveListNode::delete(ent_hdl));
            Ok(())
        }

        fn entry_place_with_hdl(&mut self, entry: &HaEntry, ml: &mut MoveList) -> PipeResult<()> {
            ml.push(entry.to_add_node());
            Ok(())
        }

        fn entry_modify(&mut self, _: &HaEntry, _: &mut MoveList) -> PipeResult<()> {
            Ok(())
        }
    }

    impl ReplayTable for AdtTable {
        fn kind(&self) -> TableOwnerKind {
            TableOwnerKind::ActionData
        }

        fn spec_map_config(&self) -> SpecMapConfig {
            SpecMapConfig::new(0, 0x20)
        }

        fn decode_llp(&mut self, _: &ShadowMemory, _: &TableInfo) -> PipeResult<MoveList> {
            Ok(std::mem::take(&mut self.restored))
        }

        fn program(&mut self, _: &MoveList) -> PipeResult<()> {
            Ok(())
        }
    }

    fn adt_request(data: &[u8], new_entry_hdl: EntHdl) -> ReplayRequest {
        ReplayRequest::ActionData {
            action_spec: ActionSpec::direct(data.to_vec()),
            act_fn_hdl: 3,
            new_entry_hdl,
        }
    }

    #[test]
    fn test_adt_replay_miss_keeps_callers_handle() {
        let restored = vec![MoveListNode::add(11, EntryData::new(None, ActionSpec::direct(vec![1, 2]), 3))];
        let mut owner = ReplayOwner::new(AdtTable { restored });
        let info = TableInfo::new(0x20, "adt", TableOwnerKind::ActionData, PipeBitmap::first_n(1));
        let move_list = owner.llp_restore_state(&ShadowMemory::new(), &info, true).unwrap().unwrap();
        owner.hlp_restore_state(move_list).unwrap();

        assert_eq!(owner.replay(&adt_request(&[1, 2], 50)).unwrap(), 11);
        assert_eq!(owner.replay(&adt_request(&[7], 51)).unwrap(), 51);

        let map = owner.spec_map().unwrap();
        assert_eq!(map.entry(51).unwrap().list(), HaList::ToAdd);
        assert_eq!(map.list_len(HaList::ToAdd), 1);
        assert_eq!(map.entry(11).unwrap().list(), HaList::FullMatch);
    }

    #[test]
    fn test_replay_before_hlp_restore_is_unexpected() {
        let mut owner = ReplayOwner::new(AdtTable { restored: Vec::new() });
        let err = owner.replay(&adt_request(&[1], 1)).unwrap_err();
        assert!(matches!(err, PipeMgrError::Unexpected { .. }));
    }
}
