//! Replay a recorded command stream through an in-process service.
//!
//! The input is a flat sequence of little-endian `u32` entries, laid out
//! exactly as it would sit in the ring starting at offset 0.

use std::io::{self, Read};

use gpucmd_client::{CommandBufferHelper, HelperError};
use gpucmd_protocol::{CommandBufferEntry, State, ENTRY_SIZE};
use gpucmd_service::{
    CommandBuffer, CommandBufferService, CommonDecoder, GpuScheduler, ServiceConfig,
    ServiceStatsSnapshot,
};
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_RING_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("entry stream is {0} bytes, not a whole number of entries")]
    PartialEntry(usize),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Helper(#[from] HelperError),
}

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub entries: usize,
    pub state: State,
    pub stats: ServiceStatsSnapshot,
}

pub fn read_entries(mut reader: impl Read) -> Result<Vec<CommandBufferEntry>, ReplayError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    if bytes.len() % ENTRY_SIZE != 0 {
        return Err(ReplayError::PartialEntry(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(ENTRY_SIZE)
        .map(|c| CommandBufferEntry::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Copy `entries` into a fresh ring of `ring_size` bytes, flush and drain.
///
/// A command stream error is part of the report, not a replay failure.
pub fn replay_entries(
    entries: &[CommandBufferEntry],
    config: &ServiceConfig,
    ring_size: usize,
) -> Result<ReplayReport, ReplayError> {
    let scheduler = GpuScheduler::new(CommandBufferService::new(config), CommonDecoder::new(config));
    let mut helper = CommandBufferHelper::new(scheduler);
    helper.initialize(ring_size)?;
    helper.write(entries)?;

    match helper.finish() {
        Ok(()) => {}
        Err(HelperError::CommandBuffer(error)) => {
            tracing::info!(?error, "command stream stopped with an error");
        }
        Err(err) => return Err(err.into()),
    }

    let scheduler = helper.command_buffer_mut();
    let state = scheduler.get_state();
    let stats = scheduler.service().stats().snapshot();
    Ok(ReplayReport {
        entries: entries.len(),
        state,
        stats,
    })
}
