use serde::{Deserialize, Serialize};

use crate::error::{ContextLostReason, ErrorCode};

/// Snapshot of the command buffer as seen by the client.
///
/// `generation` increases on every query so the client can tell a fresh
/// snapshot from a cached one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Ring capacity in entries.
    pub num_entries: i32,
    pub get_offset: i32,
    pub put_offset: i32,
    /// Last token set by the command stream.
    pub token: i32,
    pub error: ErrorCode,
    pub context_lost_reason: ContextLostReason,
    pub generation: u32,
}

impl State {
    /// True when the consumer has caught up with everything flushed so far.
    pub fn is_drained(&self) -> bool {
        self.get_offset == self.put_offset
    }
}
