//! Per-stage map from entry handle to the physical locations it occupies.
//!
//! Mutated from the API path (add, delete, move, TTL change) and confirmed
//! from the notification path once hardware applied the change. Readers only
//! ever get copies.

use pipe_mgr_common::{HasRefCount, SyncMap};
use pipe_mgr_types::{EntHdl, PipeId, PipeMgrError, PipeResult};
use serde::{Deserialize, Serialize};

/// One physical slot occupied by an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleEntryLocation {
    pub pipe: PipeId,
    /// Hardware confirmed `cur_index` holds the entry.
    pub index_valid: bool,
    pub cur_index: u32,
    /// Target of an in-flight move, `cur_index` otherwise.
    pub dest_index: u32,
    pub del_in_progress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleEntryMetadata {
    pub new_ttl: u32,
    pub cur_ttl: u32,
    refcount: u32,
    locations: Vec<IdleEntryLocation>,
}

impl IdleEntryMetadata {
    fn new(new_ttl: u32, cur_ttl: u32) -> Self {
        Self {
            new_ttl,
            cur_ttl,
            refcount: 0,
            locations: Vec::new(),
        }
    }

    pub fn locations(&self) -> &[IdleEntryLocation] {
        &self.locations
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }
}

impl HasRefCount for IdleEntryMetadata {
    fn increment_ref(&mut self) -> u32 {
        self.refcount += 1;
        self.refcount
    }

    fn decrement_ref(&mut self) -> Option<u32> {
        self.refcount = self.refcount.checked_sub(1)?;
        Some(self.refcount)
    }

    fn ref_count(&self) -> u32 {
        self.refcount
    }
}

/// TTL values handed back when hardware confirms an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivateOutcome {
    pub ttl: u32,
    pub cur_ttl: u32,
    /// False if a delete raced ahead of the activation; the entry must not
    /// be brought to active state.
    pub proceed: bool,
}

#[derive(Debug, Default)]
pub struct MetadataStore {
    map: SyncMap<EntHdl, IdleEntryMetadata>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, ent_hdl: EntHdl) -> bool {
        self.map.contains_key(&ent_hdl)
    }

    /// Records a not-yet-confirmed location at `index`.
    pub fn add(
        &mut self,
        ent_hdl: EntHdl,
        pipe: PipeId,
        index: u32,
        new_ttl: u32,
        cur_ttl: u32,
    ) -> PipeResult<()> {
        let md = self
            .map
            .get_or_insert_with(ent_hdl, || IdleEntryMetadata::new(new_ttl, cur_ttl));
        md.locations.try_reserve(1).map_err(|_| {
            PipeMgrError::no_resources(format!("idle location for entry {}", ent_hdl))
        })?;
        md.locations.push(IdleEntryLocation {
            pipe,
            index_valid: false,
            cur_index: index,
            dest_index: index,
            del_in_progress: false,
        });
        md.increment_ref();
        Ok(())
    }

    /// Marks the location headed for `index` as being deleted. Removal waits
    /// for the hardware confirmation.
    pub fn del(&mut self, ent_hdl: EntHdl, pipe: PipeId, index: u32) -> PipeResult<()> {
        let md = self.get_mut(ent_hdl)?;
        let loc = md
            .locations
            .iter_mut()
            .find(|l| l.pipe == pipe && l.dest_index == index && !l.del_in_progress)
            .ok_or_else(|| location_not_found(ent_hdl, pipe, index))?;
        loc.del_in_progress = true;
        Ok(())
    }

    /// Starts moving the location currently at `src` to `dest`.
    pub fn mv(&mut self, ent_hdl: EntHdl, pipe: PipeId, src: u32, dest: u32) -> PipeResult<()> {
        let md = self.get_mut(ent_hdl)?;
        let pos = md
            .locations
            .iter()
            .position(|l| l.pipe == pipe && l.cur_index == src && l.dest_index == src)
            // A move chained onto one hardware has not confirmed yet.
            .or_else(|| {
                md.locations
                    .iter()
                    .position(|l| l.pipe == pipe && l.dest_index == src)
            })
            .ok_or_else(|| location_not_found(ent_hdl, pipe, src))?;
        let loc = &mut md.locations[pos];
        if loc.del_in_progress {
            return Err(PipeMgrError::unexpected(format!(
                "move of entry {} from {} while its delete is in progress",
                ent_hdl, src
            )));
        }
        loc.dest_index = dest;
        Ok(())
    }

    /// Records a TTL change. The current TTL follows only if the entry has
    /// not started decaying from its previous TTL.
    pub fn ttl_dirty(&mut self, ent_hdl: EntHdl, new_ttl: u32) -> PipeResult<()> {
        let md = self.get_mut(ent_hdl)?;
        if md.cur_ttl == md.new_ttl {
            md.cur_ttl = new_ttl;
        }
        md.new_ttl = new_ttl;
        Ok(())
    }

    pub fn set_cur_ttl(&mut self, ent_hdl: EntHdl, cur_ttl: u32) -> PipeResult<()> {
        self.get_mut(ent_hdl)?.cur_ttl = cur_ttl;
        Ok(())
    }

    /// Hardware confirmed `index` is live. Matches on the current index
    /// whether or not the location was valid yet.
    pub fn activate(&mut self, ent_hdl: EntHdl, pipe: PipeId, index: u32) -> PipeResult<ActivateOutcome> {
        let md = self.get_mut(ent_hdl)?;
        let (ttl, cur_ttl) = (md.new_ttl, md.cur_ttl);
        let loc = md
            .locations
            .iter_mut()
            .find(|l| l.pipe == pipe && l.cur_index == index)
            .ok_or_else(|| location_not_found(ent_hdl, pipe, index))?;
        loc.index_valid = true;
        Ok(ActivateOutcome {
            ttl,
            cur_ttl,
            proceed: !loc.del_in_progress,
        })
    }

    /// Hardware confirmed a move.
    pub fn process_move(&mut self, ent_hdl: EntHdl, pipe: PipeId, src: u32, dest: u32) -> PipeResult<()> {
        let md = self.get_mut(ent_hdl)?;
        let loc = md
            .locations
            .iter_mut()
            .find(|l| l.pipe == pipe && l.cur_index == src && l.index_valid)
            .ok_or_else(|| location_not_found(ent_hdl, pipe, src))?;
        loc.cur_index = dest;
        Ok(())
    }

    /// Hardware confirmed a delete. Returns the metadata if that was the
    /// entry's last location.
    pub fn process_del(
        &mut self,
        ent_hdl: EntHdl,
        pipe: PipeId,
        index: u32,
    ) -> PipeResult<Option<IdleEntryMetadata>> {
        let md = self.get_mut(ent_hdl)?;
        let pos = md
            .locations
            .iter()
            .position(|l| l.pipe == pipe && l.cur_index == index && l.del_in_progress)
            .ok_or_else(|| location_not_found(ent_hdl, pipe, index))?;
        md.locations.remove(pos);
        self.map.release(&ent_hdl)
    }

    /// Deep copy of an entry's metadata.
    pub fn get(&self, ent_hdl: EntHdl) -> Option<IdleEntryMetadata> {
        self.map.get(&ent_hdl).cloned()
    }

    pub fn handles(&self) -> Vec<EntHdl> {
        let mut hdls: Vec<_> = self.map.keys().copied().collect();
        hdls.sort_unstable();
        hdls
    }

    fn get_mut(&mut self, ent_hdl: EntHdl) -> PipeResult<&mut IdleEntryMetadata> {
        self.map
            .get_mut(&ent_hdl)
            .ok_or_else(|| PipeMgrError::not_found(format!("idle metadata for entry {}", ent_hdl)))
    }
}

fn location_not_found(ent_hdl: EntHdl, pipe: PipeId, index: u32) -> PipeMgrError {
    PipeMgrError::not_found(format!(
        "location of entry {} at pipe {} index {}",
        ent_hdl, pipe, index
    ))
}
