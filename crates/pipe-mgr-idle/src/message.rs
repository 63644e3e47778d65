//! Idle notification messages carried in descriptor-ring buffers.
//!
//! Every message is one little-endian 64-bit word:
//!
//! | bits  | field                                   |
//! |-------|-----------------------------------------|
//! | 0-1   | type (0 fsm, 1 lock ack, 2 dump)        |
//! | 2-4   | pipe                                    |
//! | 5-9   | stage                                   |
//! | 10-13 | logical table                           |
//! | 14-33 | fsm: entry index; dump: base index      |
//! | 34    | fsm: entry went active (else idle)      |
//! | 34-41 | dump: activity bits for 8 entries       |
//! | 14-29 | lock ack: lock id                       |

use pipe_mgr_common::DR_MSG_SIZE;
use pipe_mgr_types::{LockId, LogicalTblId, PipeId, PipeMgrError, PipeResult, StageId};
use serde::{Deserialize, Serialize};

const TYPE_FSM: u64 = 0;
const TYPE_LOCK_ACK: u64 = 1;
const TYPE_DUMP: u64 = 2;

const PIPE_SHIFT: u32 = 2;
const PIPE_BITS: u32 = 3;
const STAGE_SHIFT: u32 = 5;
const STAGE_BITS: u32 = 5;
const LTBL_SHIFT: u32 = 10;
const LTBL_BITS: u32 = 4;
const INDEX_SHIFT: u32 = 14;
const INDEX_BITS: u32 = 20;
const ACTIVE_SHIFT: u32 = 34;
const HITS_SHIFT: u32 = 34;

/// Entries covered by one dump message.
pub const DUMP_ENTRIES_PER_MSG: u32 = 8;

/// Largest index a message can carry.
pub const MAX_MSG_INDEX: u32 = (1 << INDEX_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdleMsg {
    /// Hardware state machine moved an entry to idle or active.
    Fsm { index: u32, active: bool },
    LockAck { lock_id: LockId },
    /// Raw activity bits; bit `i` covers `base_index + i`.
    Dump { base_index: u32, hits: u8 },
}

/// A message together with the table it addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DrMessage {
    pub pipe: PipeId,
    pub stage: StageId,
    pub logical_tbl: LogicalTblId,
    pub msg: IdleMsg,
}

impl DrMessage {
    pub fn new(pipe: PipeId, stage: StageId, logical_tbl: LogicalTblId, msg: IdleMsg) -> Self {
        Self {
            pipe,
            stage,
            logical_tbl,
            msg,
        }
    }

    pub fn encode(&self) -> PipeResult<u64> {
        check_field("pipe", u64::from(self.pipe), PIPE_BITS)?;
        check_field("stage", u64::from(self.stage), STAGE_BITS)?;
        check_field("logical table", u64::from(self.logical_tbl), LTBL_BITS)?;

        let header = (u64::from(self.pipe) << PIPE_SHIFT)
            | (u64::from(self.stage) << STAGE_SHIFT)
            | (u64::from(self.logical_tbl) << LTBL_SHIFT);
        let word = match self.msg {
            IdleMsg::Fsm { index, active } => {
                check_field("index", u64::from(index), INDEX_BITS)?;
                TYPE_FSM | (u64::from(index) << INDEX_SHIFT) | (u64::from(active) << ACTIVE_SHIFT)
            }
            IdleMsg::LockAck { lock_id } => TYPE_LOCK_ACK | (u64::from(lock_id) << INDEX_SHIFT),
            IdleMsg::Dump { base_index, hits } => {
                check_field("index", u64::from(base_index), INDEX_BITS)?;
                TYPE_DUMP | (u64::from(base_index) << INDEX_SHIFT) | (u64::from(hits) << HITS_SHIFT)
            }
        };
        Ok(word | header)
    }

    pub fn decode(word: u64) -> PipeResult<Self> {
        let pipe = field(word, PIPE_SHIFT, PIPE_BITS) as PipeId;
        let stage = field(word, STAGE_SHIFT, STAGE_BITS) as StageId;
        let logical_tbl = field(word, LTBL_SHIFT, LTBL_BITS) as LogicalTblId;
        let msg = match word & 0x3 {
            TYPE_FSM => IdleMsg::Fsm {
                index: field(word, INDEX_SHIFT, INDEX_BITS) as u32,
                active: field(word, ACTIVE_SHIFT, 1) == 1,
            },
            TYPE_LOCK_ACK => IdleMsg::LockAck {
                lock_id: field(word, INDEX_SHIFT, 16) as LockId,
            },
            TYPE_DUMP => IdleMsg::Dump {
                base_index: field(word, INDEX_SHIFT, INDEX_BITS) as u32,
                hits: field(word, HITS_SHIFT, 8) as u8,
            },
            other => {
                return Err(PipeMgrError::invalid_arg(format!(
                    "idle message type {} in word {:#018x}",
                    other, word
                )))
            }
        };
        Ok(Self::new(pipe, stage, logical_tbl, msg))
    }
}

fn field(word: u64, shift: u32, bits: u32) -> u64 {
    (word >> shift) & ((1u64 << bits) - 1)
}

fn check_field(name: &str, value: u64, bits: u32) -> PipeResult<()> {
    if value >> bits != 0 {
        return Err(PipeMgrError::invalid_arg(format!(
            "{} {} does not fit in {} bits",
            name, value, bits
        )));
    }
    Ok(())
}

/// Decodes a whole notification buffer. Any bad word fails the buffer.
pub fn decode_buffer(data: &[u8]) -> PipeResult<Vec<DrMessage>> {
    if data.len() % DR_MSG_SIZE != 0 {
        return Err(PipeMgrError::invalid_arg(format!(
            "notification buffer of {} bytes is not a multiple of {}",
            data.len(),
            DR_MSG_SIZE
        )));
    }
    data.chunks_exact(DR_MSG_SIZE)
        .map(|chunk| {
            let mut word = [0u8; DR_MSG_SIZE];
            word.copy_from_slice(chunk);
            DrMessage::decode(u64::from_le_bytes(word))
        })
        .collect()
}

pub fn encode_buffer(msgs: &[DrMessage]) -> PipeResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(msgs.len() * DR_MSG_SIZE);
    for msg in msgs {
        buf.extend_from_slice(&msg.encode()?.to_le_bytes());
    }
    Ok(buf)
}
