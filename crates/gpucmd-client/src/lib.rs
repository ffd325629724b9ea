//! Producer side of the command buffer.
//!
//! [`CommandBufferHelper`] owns a ring allocated through any [`CommandBuffer`],
//! appends encoded commands at its put offset and flushes them to the service.
//! The ring never wraps: when it fills up the helper waits for the service to
//! drain and rebinds the same buffer, which restarts both offsets at zero.

use gpucmd_protocol::{entries_to_bytes, CommandBufferEntry, CommandWriter, ErrorCode, State, ENTRY_SIZE};
use gpucmd_service::{CommandBuffer, ServiceError};
use gpucmd_shm::ShmError;
use thiserror::Error;

/// Polls of the service state before [`HelperError::Stalled`] is reported.
pub const DEFAULT_MAX_POLLS: usize = 10_000;

/// Entries taken by `SetBucketDataImmediate` before its payload.
const IMMEDIATE_OVERHEAD_ENTRIES: usize = 4;

#[derive(Debug, Error)]
pub enum HelperError {
    #[error("ring buffer of {size} bytes cannot hold a single entry")]
    RingTooSmall { size: usize },

    #[error("failed to allocate a {size}-byte ring buffer")]
    RingAllocationFailed { size: usize },

    #[error("helper has no ring buffer; call initialize first")]
    NotInitialized,

    #[error("command of {entries} entries does not fit a {capacity}-entry ring")]
    CommandTooLarge { entries: usize, capacity: usize },

    #[error("command buffer reported {0:?}")]
    CommandBuffer(ErrorCode),

    #[error("service made no progress after {polls} polls")]
    Stalled { polls: usize },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Shm(#[from] ShmError),
}

#[derive(Debug)]
pub struct CommandBufferHelper<C> {
    command_buffer: C,
    ring_buffer_id: i32,
    total_entries: usize,
    put: usize,
    token: i32,
    last_state: State,
    max_polls: usize,
}

impl<C: CommandBuffer> CommandBufferHelper<C> {
    pub fn new(command_buffer: C) -> Self {
        Self {
            command_buffer,
            ring_buffer_id: -1,
            total_entries: 0,
            put: 0,
            token: 0,
            last_state: State::default(),
            max_polls: DEFAULT_MAX_POLLS,
        }
    }

    /// Allocate a ring of `ring_buffer_size` bytes and bind it as the get buffer.
    pub fn initialize(&mut self, ring_buffer_size: usize) -> Result<(), HelperError> {
        let total_entries = ring_buffer_size / ENTRY_SIZE;
        if total_entries == 0 {
            return Err(HelperError::RingTooSmall {
                size: ring_buffer_size,
            });
        }
        let id = self
            .command_buffer
            .create_transfer_buffer(ring_buffer_size, -1);
        if id < 0 {
            return Err(HelperError::RingAllocationFailed {
                size: ring_buffer_size,
            });
        }
        self.command_buffer.set_get_buffer(id)?;

        self.ring_buffer_id = id;
        self.total_entries = total_entries;
        self.put = 0;
        let state = self.command_buffer.get_state();
        self.update_state(state);
        tracing::debug!(id, total_entries, "command buffer helper initialized");
        Ok(())
    }

    pub fn command_buffer(&self) -> &C {
        &self.command_buffer
    }

    pub fn command_buffer_mut(&mut self) -> &mut C {
        &mut self.command_buffer
    }

    pub fn into_inner(self) -> C {
        self.command_buffer
    }

    pub fn ring_buffer_id(&self) -> i32 {
        self.ring_buffer_id
    }

    pub fn total_entries(&self) -> usize {
        self.total_entries
    }

    /// Offset (in entries) where the next command will be written.
    pub fn put(&self) -> usize {
        self.put
    }

    /// Newest state observed from the service.
    pub fn last_state(&self) -> State {
        self.last_state
    }

    pub fn set_max_polls(&mut self, max_polls: usize) {
        self.max_polls = max_polls.max(1);
    }

    /// Copy `entries` into the ring at the put offset without flushing.
    ///
    /// Restarts the ring first if the entries do not fit after `put`.
    pub fn write(&mut self, entries: &[CommandBufferEntry]) -> Result<(), HelperError> {
        if self.ring_buffer_id < 0 {
            return Err(HelperError::NotInitialized);
        }
        if entries.is_empty() {
            return Ok(());
        }
        if entries.len() > self.total_entries {
            return Err(HelperError::CommandTooLarge {
                entries: entries.len(),
                capacity: self.total_entries,
            });
        }
        if self.put + entries.len() > self.total_entries {
            self.restart_ring()?;
        }

        let ring = self
            .command_buffer
            .get_transfer_buffer(self.ring_buffer_id)
            .ok_or(HelperError::NotInitialized)?;
        ring.write(self.put * ENTRY_SIZE, &entries_to_bytes(entries))?;
        self.put += entries.len();
        Ok(())
    }

    pub fn write_commands(&mut self, writer: &CommandWriter) -> Result<(), HelperError> {
        self.write(writer.as_entries())
    }

    /// Publish everything written so far.
    pub fn flush(&mut self) {
        self.command_buffer.flush(self.put_offset());
    }

    /// Flush and poll until the service has consumed everything.
    pub fn finish(&mut self) -> Result<(), HelperError> {
        let put = self.put_offset();
        for _ in 0..self.max_polls {
            let state = self
                .command_buffer
                .flush_sync(put, self.last_state.get_offset);
            self.update_state(state);
            if self.last_state.error.is_error() {
                return Err(HelperError::CommandBuffer(self.last_state.error));
            }
            if self.last_state.get_offset == put {
                return Ok(());
            }
        }
        Err(HelperError::Stalled {
            polls: self.max_polls,
        })
    }

    /// Append a `SetToken` with the next token value and return it.
    pub fn insert_token(&mut self) -> Result<i32, HelperError> {
        let token = self.token.wrapping_add(1) & i32::MAX;
        let mut writer = CommandWriter::new();
        writer.set_token(token);
        self.write_commands(&writer)?;
        self.token = token;
        Ok(token)
    }

    /// Whether the service has executed the `SetToken` for `token`.
    pub fn has_token_passed(&self, token: i32) -> bool {
        token > self.token || token <= self.last_state.token
    }

    /// Poll until the service has passed `token`.
    ///
    /// Tokens that were never issued (or belong to a previous wrap) count as
    /// passed.
    pub fn wait_for_token(&mut self, token: i32) -> Result<(), HelperError> {
        if token < 0 || self.has_token_passed(token) {
            return Ok(());
        }
        let put = self.put_offset();
        for _ in 0..self.max_polls {
            let state = self
                .command_buffer
                .flush_sync(put, self.last_state.get_offset);
            self.update_state(state);
            if self.last_state.error.is_error() {
                return Err(HelperError::CommandBuffer(self.last_state.error));
            }
            if self.has_token_passed(token) {
                return Ok(());
            }
        }
        Err(HelperError::Stalled {
            polls: self.max_polls,
        })
    }

    pub fn set_bucket_size(&mut self, bucket_id: u32, size: u32) -> Result<(), HelperError> {
        let mut writer = CommandWriter::new();
        writer.set_bucket_size(bucket_id, size);
        self.write_commands(&writer)
    }

    pub fn set_bucket_data(
        &mut self,
        bucket_id: u32,
        offset: u32,
        size: u32,
        shared_memory_id: i32,
        shared_memory_offset: u32,
    ) -> Result<(), HelperError> {
        let mut writer = CommandWriter::new();
        writer.set_bucket_data(bucket_id, offset, size, shared_memory_id, shared_memory_offset);
        self.write_commands(&writer)
    }

    /// Stage `data` inline, split into as many commands as the ring requires.
    pub fn set_bucket_data_immediate(
        &mut self,
        bucket_id: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<(), HelperError> {
        let max_chunk = self
            .total_entries
            .checked_sub(IMMEDIATE_OVERHEAD_ENTRIES)
            .filter(|&n| n > 0)
            .map(|n| n * ENTRY_SIZE)
            .ok_or(HelperError::CommandTooLarge {
                entries: IMMEDIATE_OVERHEAD_ENTRIES + 1,
                capacity: self.total_entries,
            })?;

        let mut chunk_offset = offset;
        for chunk in data.chunks(max_chunk) {
            let mut writer = CommandWriter::new();
            writer.set_bucket_data_immediate(bucket_id, chunk_offset, chunk);
            self.write_commands(&writer)?;
            chunk_offset = chunk_offset.wrapping_add(chunk.len() as u32);
        }
        Ok(())
    }

    /// Size the bucket for `s` plus terminator and upload it; `None` empties it.
    pub fn put_bucket_string(&mut self, bucket_id: u32, s: Option<&str>) -> Result<(), HelperError> {
        let Some(s) = s else {
            return self.set_bucket_size(bucket_id, 0);
        };
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        let size = u32::try_from(bytes.len()).map_err(|_| HelperError::CommandTooLarge {
            entries: bytes.len() / ENTRY_SIZE,
            capacity: self.total_entries,
        })?;
        self.set_bucket_size(bucket_id, size)?;
        self.set_bucket_data_immediate(bucket_id, 0, &bytes)
    }

    pub fn get_bucket_size(
        &mut self,
        bucket_id: u32,
        shared_memory_id: i32,
        shared_memory_offset: u32,
    ) -> Result<(), HelperError> {
        let mut writer = CommandWriter::new();
        writer.get_bucket_size(bucket_id, shared_memory_id, shared_memory_offset);
        self.write_commands(&writer)
    }

    pub fn get_bucket_data(
        &mut self,
        bucket_id: u32,
        offset: u32,
        size: u32,
        shared_memory_id: i32,
        shared_memory_offset: u32,
    ) -> Result<(), HelperError> {
        let mut writer = CommandWriter::new();
        writer.get_bucket_data(bucket_id, offset, size, shared_memory_id, shared_memory_offset);
        self.write_commands(&writer)
    }

    fn put_offset(&self) -> i32 {
        // total_entries came from an i32 num_entries-sized ring.
        i32::try_from(self.put).unwrap_or(i32::MAX)
    }

    fn restart_ring(&mut self) -> Result<(), HelperError> {
        self.finish()?;
        self.command_buffer.set_get_buffer(self.ring_buffer_id)?;
        self.put = 0;
        tracing::debug!(id = self.ring_buffer_id, "ring restarted");
        Ok(())
    }

    /// Keep `state` unless it is older than what was already observed.
    fn update_state(&mut self, state: State) {
        if state.generation.wrapping_sub(self.last_state.generation) < 0x8000_0000 {
            self.last_state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpucmd_service::{CommandBufferService, CommonDecoder, GpuScheduler, ServiceConfig};
    use pretty_assertions::assert_eq;

    fn helper(ring_size: usize) -> CommandBufferHelper<GpuScheduler<CommonDecoder>> {
        let config = ServiceConfig::default();
        let scheduler = GpuScheduler::new(
            CommandBufferService::new(&config),
            CommonDecoder::new(&config),
        );
        let mut helper = CommandBufferHelper::new(scheduler);
        helper.initialize(ring_size).unwrap();
        helper
    }

    #[test]
    fn initialize_binds_a_ring() {
        let helper = helper(64);
        assert_eq!(helper.ring_buffer_id(), 1);
        assert_eq!(helper.total_entries(), 16);
        assert_eq!(helper.last_state().num_entries, 16);
    }

    #[test]
    fn initialize_rejects_tiny_rings() {
        let config = ServiceConfig::default();
        let mut helper = CommandBufferHelper::new(CommandBufferService::new(&config));
        assert!(matches!(
            helper.initialize(3),
            Err(HelperError::RingTooSmall { size: 3 })
        ));
        assert!(matches!(
            helper.write(&[CommandBufferEntry::default()]),
            Err(HelperError::NotInitialized)
        ));
    }

    #[test]
    fn tokens_pass_after_finish() {
        let mut helper = helper(256);
        let first = helper.insert_token().unwrap();
        let second = helper.insert_token().unwrap();
        assert_eq!((first, second), (1, 2));
        assert!(!helper.has_token_passed(second));

        helper.flush();
        helper.wait_for_token(second).unwrap();
        assert!(helper.has_token_passed(first));
        assert_eq!(helper.last_state().token, 2);
    }

    #[test]
    fn ring_restarts_when_full() {
        let mut helper = helper(32);
        for _ in 0..3 {
            helper.insert_token().unwrap();
        }
        assert_eq!(helper.put(), 6);
        // The fourth token fills the ring exactly; the fifth starts over at 0.
        for _ in 0..3 {
            helper.insert_token().unwrap();
        }
        assert_eq!(helper.put(), 4);
        assert_eq!(helper.last_state().token, 4);
        helper.finish().unwrap();
        assert_eq!(helper.last_state().token, 6);
        assert_eq!(helper.last_state().get_offset, 4);
    }

    #[test]
    fn oversize_writes_are_rejected() {
        let mut helper = helper(16);
        let entries = vec![CommandBufferEntry::default(); 5];
        assert!(matches!(
            helper.write(&entries),
            Err(HelperError::CommandTooLarge {
                entries: 5,
                capacity: 4
            })
        ));
    }

    #[test]
    fn service_errors_surface_from_finish() {
        let mut helper = helper(64);
        let mut writer = CommandWriter::new();
        writer.jump(500);
        helper.write_commands(&writer).unwrap();
        assert!(matches!(
            helper.finish(),
            Err(HelperError::CommandBuffer(ErrorCode::InvalidArguments))
        ));
    }

    #[test]
    fn bucket_string_is_chunked_to_fit_the_ring() {
        let mut helper = helper(32);
        let text = "a string longer than one ring's worth of immediate data";
        helper.put_bucket_string(3, Some(text)).unwrap();
        helper.finish().unwrap();

        let scheduler = helper.command_buffer();
        assert_eq!(
            scheduler.decoder().buckets().get_as_string(3).as_deref(),
            Some(text)
        );
    }

    #[test]
    fn stale_states_are_ignored() {
        let mut helper = helper(64);
        let fresh = helper.last_state();
        let stale = State {
            token: 99,
            generation: fresh.generation.wrapping_sub(1),
            ..fresh
        };
        helper.update_state(stale);
        assert_eq!(helper.last_state(), fresh);
    }
}
