//! Match and action spec value types.
//!
//! A spec describes one table entry: the key it matches on and the action
//! payload it carries. Specs are plain owned values; whoever holds one owns
//! its bytes.

use crate::ids::{EntHdl, TblHdl};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Match key of a table entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchSpec {
    /// Key bytes.
    pub key: Vec<u8>,
    /// Mask bytes, same length as `key`.
    pub mask: Vec<u8>,
    /// Entry priority (ternary/ALPM tables; zero otherwise).
    pub priority: u32,
    /// Valid/version bits stamped by the placement layer.
    pub version_bits: u8,
}

impl MatchSpec {
    pub fn new(key: Vec<u8>, mask: Vec<u8>) -> Self {
        Self {
            key,
            mask,
            priority: 0,
            version_bits: 0,
        }
    }

    /// Exact-match spec: every mask bit set.
    pub fn exact(key: Vec<u8>) -> Self {
        let mask = vec![0xff; key.len()];
        Self::new(key, mask)
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_version_bits(mut self, version_bits: u8) -> Self {
        self.version_bits = version_bits;
        self
    }

    /// The canonical identity of this spec, priority and version excluded.
    pub fn match_key(&self) -> MatchKey {
        MatchKey {
            key: self.key.clone(),
            mask: self.mask.clone(),
        }
    }
}

/// Canonical match identity: raw key and mask bytes only.
///
/// Two match specs that differ only in priority or version bits have the
/// same `MatchKey`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatchKey {
    pub key: Vec<u8>,
    pub mask: Vec<u8>,
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.key {
            write!(f, "{:02x}", b)?;
        }
        f.write_str("/")?;
        for b in &self.mask {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Kind of resource attached to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Stats,
    Meter,
    Lpf,
    Wred,
    Stateful,
}

impl ResourceKind {
    /// Meter, LPF and WRED share the meter ALU and its write path.
    pub fn is_meter_family(&self) -> bool {
        matches!(self, ResourceKind::Meter | ResourceKind::Lpf | ResourceKind::Wred)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceTag {
    Attached,
    Detached,
    NoChange,
}

/// Reference from an entry to an indirect resource table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub tbl_hdl: TblHdl,
    pub kind: ResourceKind,
    pub index: u32,
    pub tag: ResourceTag,
}

impl ResourceSpec {
    pub fn attached(tbl_hdl: TblHdl, kind: ResourceKind, index: u32) -> Self {
        Self {
            tbl_hdl,
            kind,
            index,
            tag: ResourceTag::Attached,
        }
    }
}

/// Which form the action payload takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionDataKind {
    Direct,
    AdtEntry,
    SelectorGroup,
}

/// Action payload of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionData {
    /// Immediate action data bytes.
    Direct(Vec<u8>),
    /// Reference to an action-data table entry.
    AdtEntry(EntHdl),
    /// Reference to a selector group.
    SelectorGroup(u32),
}

impl ActionData {
    pub fn kind(&self) -> ActionDataKind {
        match self {
            ActionData::Direct(_) => ActionDataKind::Direct,
            ActionData::AdtEntry(_) => ActionDataKind::AdtEntry,
            ActionData::SelectorGroup(_) => ActionDataKind::SelectorGroup,
        }
    }
}

/// Action payload plus attached resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionSpec {
    pub data: ActionData,
    pub resources: Vec<ResourceSpec>,
}

impl ActionSpec {
    pub fn direct(data: Vec<u8>) -> Self {
        Self {
            data: ActionData::Direct(data),
            resources: Vec::new(),
        }
    }

    pub fn adt_entry(adt_ent_hdl: EntHdl) -> Self {
        Self {
            data: ActionData::AdtEntry(adt_ent_hdl),
            resources: Vec::new(),
        }
    }

    pub fn selector_group(grp_hdl: u32) -> Self {
        Self {
            data: ActionData::SelectorGroup(grp_hdl),
            resources: Vec::new(),
        }
    }

    pub fn with_resource(mut self, resource: ResourceSpec) -> Self {
        self.resources.push(resource);
        self
    }

    /// Direct action data bytes, if the payload is immediate.
    pub fn direct_data(&self) -> Option<&[u8]> {
        match &self.data {
            ActionData::Direct(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn resource(&self, tbl_hdl: TblHdl) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| r.tbl_hdl == tbl_hdl)
    }
}
