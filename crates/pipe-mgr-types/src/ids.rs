//! Device, pipe and table identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type DevId = u16;
pub type SubdevId = u8;
pub type PipeId = u32;
pub type StageId = u8;
pub type LogicalTblId = u8;
pub type TblHdl = u32;
pub type EntHdl = u32;
pub type ActFnHdl = u32;
pub type LockId = u16;

/// Pipe id meaning "every pipe in the table's scope".
pub const ALL_PIPES: PipeId = 0xFFFF;

/// Maximum pipes a single device exposes.
pub const MAX_PIPES: PipeId = 8;

/// A set of pipes, one bit per pipe.
///
/// # Examples
///
/// ```
/// use pipe_mgr_types::PipeBitmap;
///
/// let pipes = PipeBitmap::from_pipes([0, 2]);
/// assert!(pipes.contains(2));
/// assert_eq!(pipes.first(), Some(0));
/// assert_eq!(pipes.iter().collect::<Vec<_>>(), vec![0, 2]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PipeBitmap(u32);

impl PipeBitmap {
    pub const EMPTY: PipeBitmap = PipeBitmap(0);

    /// Bitmap holding pipes `0..count`.
    pub const fn first_n(count: PipeId) -> Self {
        if count >= 32 {
            PipeBitmap(u32::MAX)
        } else {
            PipeBitmap((1u32 << count) - 1)
        }
    }

    pub fn from_pipes(pipes: impl IntoIterator<Item = PipeId>) -> Self {
        let mut bmp = PipeBitmap::EMPTY;
        for pipe in pipes {
            bmp.insert(pipe);
        }
        bmp
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub fn insert(&mut self, pipe: PipeId) {
        if pipe < 32 {
            self.0 |= 1 << pipe;
        }
    }

    pub fn remove(&mut self, pipe: PipeId) {
        if pipe < 32 {
            self.0 &= !(1 << pipe);
        }
    }

    pub fn contains(&self, pipe: PipeId) -> bool {
        pipe < 32 && self.0 & (1 << pipe) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest pipe in the set.
    pub fn first(&self) -> Option<PipeId> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros())
        }
    }

    pub fn is_superset_of(&self, other: PipeBitmap) -> bool {
        self.0 & other.0 == other.0
    }

    /// Iterates pipes in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = PipeId> + '_ {
        (0..32).filter(move |p| self.contains(*p))
    }
}

impl fmt::Display for PipeBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Device plus pipe scope an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevTarget {
    pub dev_id: DevId,
    pub pipe: PipeId,
}

impl DevTarget {
    pub fn new(dev_id: DevId, pipe: PipeId) -> Self {
        Self { dev_id, pipe }
    }

    pub fn all_pipes(dev_id: DevId) -> Self {
        Self::new(dev_id, ALL_PIPES)
    }

    pub fn is_all_pipes(&self) -> bool {
        self.pipe == ALL_PIPES
    }
}

impl fmt::Display for DevTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all_pipes() {
            write!(f, "dev {} pipe all", self.dev_id)
        } else {
            write!(f, "dev {} pipe {}", self.dev_id, self.pipe)
        }
    }
}
