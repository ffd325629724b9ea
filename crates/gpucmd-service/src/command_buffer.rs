use std::fmt;
use std::sync::Arc;

use gpucmd_protocol::{ContextLostReason, ErrorCode, State, ENTRY_SIZE};
use gpucmd_shm::SharedMemory;

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::stats::ServiceStats;
use crate::transfer_buffer::{TransferBuffer, TransferBufferTable};

/// Client-facing command buffer interface.
///
/// Transfer buffer creation reports failure as `-1`, matching the handle
/// space clients see on the wire.
pub trait CommandBuffer {
    /// Snapshot the current state. Every call yields a new `generation`.
    fn get_state(&mut self) -> State;

    /// Publish `put_offset` as the end of the valid command region.
    fn flush(&mut self, put_offset: i32);

    /// [`flush`](Self::flush), then return a fresh snapshot.
    fn flush_sync(&mut self, put_offset: i32, last_known_get: i32) -> State;

    /// Bind transfer buffer `id` as the command ring.
    fn set_get_buffer(&mut self, id: i32) -> Result<(), ServiceError>;

    /// Allocate a new shared transfer buffer; `-1` on failure.
    fn create_transfer_buffer(&mut self, size: usize, id_request: i32) -> i32;

    /// Register `size` bytes of caller-provided shared memory; `-1` on failure.
    fn register_transfer_buffer(
        &mut self,
        shared_memory: &SharedMemory,
        size: usize,
        id_request: i32,
    ) -> i32;

    fn destroy_transfer_buffer(&mut self, id: i32);

    fn get_transfer_buffer(&self, id: i32) -> Option<&TransferBuffer>;

    fn set_token(&mut self, token: i32);

    fn set_parse_error(&mut self, error: ErrorCode);

    fn set_context_lost_reason(&mut self, reason: ContextLostReason);
}

type Callback = Box<dyn FnMut()>;
type GetBufferCallback = Box<dyn FnMut(i32)>;

/// Tracks the ring's get/put offsets, the sticky error and all registered
/// transfer buffers.
///
/// The ring is linear: once bound, `put_offset` may range over
/// `[0, num_entries]` and the consumer never wraps on its own.
pub struct CommandBufferService {
    transfer_buffers: TransferBufferTable,
    ring_buffer_id: i32,
    num_entries: i32,
    get_offset: i32,
    put_offset: i32,
    token: i32,
    error: ErrorCode,
    context_lost_reason: ContextLostReason,
    generation: u32,
    put_offset_change_callback: Option<Callback>,
    get_buffer_change_callback: Option<GetBufferCallback>,
    parse_error_callback: Option<Callback>,
    max_commands_per_flush: usize,
    stats: Arc<ServiceStats>,
}

impl CommandBufferService {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            transfer_buffers: TransferBufferTable::new(config.max_id_request),
            ring_buffer_id: -1,
            num_entries: 0,
            get_offset: 0,
            put_offset: 0,
            token: 0,
            error: ErrorCode::NoError,
            context_lost_reason: ContextLostReason::Unknown,
            generation: 0,
            put_offset_change_callback: None,
            get_buffer_change_callback: None,
            parse_error_callback: None,
            max_commands_per_flush: config.max_commands_per_flush.max(1),
            stats: Arc::new(ServiceStats::new()),
        }
    }

    /// Current state without bumping the generation counter.
    pub fn last_state(&self) -> State {
        State {
            num_entries: self.num_entries,
            get_offset: self.get_offset,
            put_offset: self.put_offset,
            token: self.token,
            error: self.error,
            context_lost_reason: self.context_lost_reason,
            generation: self.generation,
        }
    }

    pub fn put_offset(&self) -> i32 {
        self.put_offset
    }

    pub fn get_offset(&self) -> i32 {
        self.get_offset
    }

    pub fn num_entries(&self) -> i32 {
        self.num_entries
    }

    pub fn error(&self) -> ErrorCode {
        self.error
    }

    /// Id of the bound ring, or `-1`.
    pub fn ring_buffer_id(&self) -> i32 {
        self.ring_buffer_id
    }

    pub fn ring_buffer(&self) -> Option<&TransferBuffer> {
        self.transfer_buffers.get(self.ring_buffer_id)
    }

    /// How many commands a consumer should run per flush before yielding.
    pub fn max_commands_per_flush(&self) -> usize {
        self.max_commands_per_flush
    }

    pub fn stats(&self) -> &Arc<ServiceStats> {
        &self.stats
    }

    /// Record how far the consumer has got. `offset` may equal `num_entries`.
    pub fn set_get_offset(&mut self, offset: i32) -> Result<(), ServiceError> {
        if !(0..=self.num_entries).contains(&offset) {
            return Err(ServiceError::GetOffsetOutOfRange {
                offset,
                num_entries: self.num_entries,
            });
        }
        self.get_offset = offset;
        Ok(())
    }

    /// Called after every accepted flush.
    pub fn set_put_offset_change_callback(&mut self, callback: impl FnMut() + 'static) {
        self.put_offset_change_callback = Some(Box::new(callback));
    }

    /// Called with the new ring id after every successful rebind.
    pub fn set_get_buffer_change_callback(&mut self, callback: impl FnMut(i32) + 'static) {
        self.get_buffer_change_callback = Some(Box::new(callback));
    }

    /// Called once when the first error of an episode is recorded.
    pub fn set_parse_error_callback(&mut self, callback: impl FnMut() + 'static) {
        self.parse_error_callback = Some(Box::new(callback));
    }

    fn unbind_ring(&mut self) {
        self.ring_buffer_id = -1;
        self.num_entries = 0;
        self.get_offset = 0;
        self.put_offset = 0;
    }
}

impl CommandBuffer for CommandBufferService {
    fn get_state(&mut self) -> State {
        self.generation = self.generation.wrapping_add(1);
        self.last_state()
    }

    fn flush(&mut self, put_offset: i32) {
        self.stats.inc_flushes();
        if !(0..=self.num_entries).contains(&put_offset) {
            tracing::warn!(
                put_offset,
                num_entries = self.num_entries,
                "flush put offset out of bounds"
            );
            self.set_parse_error(ErrorCode::OutOfBounds);
            return;
        }

        self.put_offset = put_offset;
        if let Some(callback) = self.put_offset_change_callback.as_mut() {
            callback();
        }
    }

    fn flush_sync(&mut self, put_offset: i32, _last_known_get: i32) -> State {
        self.flush(put_offset);
        self.get_state()
    }

    fn set_get_buffer(&mut self, id: i32) -> Result<(), ServiceError> {
        // Once the stream has failed its pending commands are dead.
        if !self.error.is_error() && self.get_offset != self.put_offset {
            return Err(ServiceError::RingNotEmpty {
                get_offset: self.get_offset,
                put_offset: self.put_offset,
            });
        }
        let size = self
            .transfer_buffers
            .get(id)
            .ok_or(ServiceError::UnknownTransferBuffer(id))?
            .size();

        self.ring_buffer_id = id;
        self.num_entries = i32::try_from(size / ENTRY_SIZE).unwrap_or(i32::MAX);
        self.get_offset = 0;
        self.put_offset = 0;
        self.error = ErrorCode::NoError;
        self.context_lost_reason = ContextLostReason::Unknown;
        tracing::debug!(id, num_entries = self.num_entries, "bound get buffer");

        if let Some(callback) = self.get_buffer_change_callback.as_mut() {
            callback(id);
        }
        Ok(())
    }

    fn create_transfer_buffer(&mut self, size: usize, id_request: i32) -> i32 {
        match self.transfer_buffers.create(size, id_request) {
            Ok(id) => {
                self.stats.inc_transfer_buffers_registered();
                id
            }
            Err(err) => {
                tracing::warn!(size, id_request, %err, "failed to create transfer buffer");
                -1
            }
        }
    }

    fn register_transfer_buffer(
        &mut self,
        shared_memory: &SharedMemory,
        size: usize,
        id_request: i32,
    ) -> i32 {
        match self.transfer_buffers.register(shared_memory, size, id_request) {
            Ok(id) => {
                self.stats.inc_transfer_buffers_registered();
                id
            }
            Err(err) => {
                tracing::warn!(size, id_request, %err, "failed to register transfer buffer");
                -1
            }
        }
    }

    fn destroy_transfer_buffer(&mut self, id: i32) {
        if !self.transfer_buffers.destroy(id) {
            return;
        }
        self.stats.inc_transfer_buffers_destroyed();
        if id == self.ring_buffer_id {
            tracing::debug!(id, "destroyed the bound get buffer");
            self.unbind_ring();
        }
    }

    fn get_transfer_buffer(&self, id: i32) -> Option<&TransferBuffer> {
        self.transfer_buffers.get(id)
    }

    fn set_token(&mut self, token: i32) {
        self.token = token;
    }

    fn set_parse_error(&mut self, error: ErrorCode) {
        if self.error.is_error() || !error.is_error() {
            return;
        }
        self.error = error;
        self.stats.inc_parse_errors();
        tracing::warn!(?error, "command buffer entered error state");
        if let Some(callback) = self.parse_error_callback.as_mut() {
            callback();
        }
    }

    fn set_context_lost_reason(&mut self, reason: ContextLostReason) {
        if self.context_lost_reason == ContextLostReason::Unknown {
            self.context_lost_reason = reason;
        }
    }
}

impl fmt::Debug for CommandBufferService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBufferService")
            .field("ring_buffer_id", &self.ring_buffer_id)
            .field("state", &self.last_state())
            .field("transfer_buffers", &self.transfer_buffers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::Cell;
    use std::rc::Rc;

    fn service() -> CommandBufferService {
        CommandBufferService::new(&ServiceConfig::default())
    }

    fn counter() -> (Rc<Cell<u32>>, impl FnMut() + 'static) {
        let count = Rc::new(Cell::new(0));
        let handle = count.clone();
        (count, move || handle.set(handle.get() + 1))
    }

    #[test]
    fn fresh_service_has_empty_state() {
        let mut service = service();
        let state = service.get_state();
        assert_eq!(
            state,
            State {
                num_entries: 0,
                get_offset: 0,
                put_offset: 0,
                token: 0,
                error: ErrorCode::NoError,
                context_lost_reason: ContextLostReason::Unknown,
                generation: 1,
            }
        );
        assert!(service.ring_buffer().is_none());
        assert_eq!(service.ring_buffer_id(), -1);
    }

    #[test]
    fn every_get_state_bumps_generation() {
        let mut service = service();
        let a = service.get_state().generation;
        let b = service.get_state().generation;
        let c = service.get_state().generation;
        assert!(a < b && b < c);
        assert_eq!(service.last_state().generation, c);
    }

    #[test]
    fn set_get_buffer_sizes_ring_in_entries() {
        let mut service = service();
        let (changes, callback) = {
            let seen = Rc::new(Cell::new(0));
            let handle = seen.clone();
            (seen, move |id: i32| handle.set(id))
        };
        service.set_get_buffer_change_callback(callback);

        let id = service.create_transfer_buffer(1024, -1);
        assert_eq!(id, 1);
        service.set_get_buffer(id).unwrap();

        let state = service.get_state();
        assert_eq!(state.num_entries, 256);
        assert_eq!(state.get_offset, 0);
        assert_eq!(state.put_offset, 0);
        assert_eq!(changes.get(), 1);
    }

    #[test]
    fn set_get_buffer_rejects_unknown_id_and_pending_work() {
        let mut service = service();
        assert_eq!(
            service.set_get_buffer(9),
            Err(ServiceError::UnknownTransferBuffer(9))
        );

        let id = service.create_transfer_buffer(64, -1);
        service.set_get_buffer(id).unwrap();
        service.flush(4);
        assert_eq!(
            service.set_get_buffer(id),
            Err(ServiceError::RingNotEmpty {
                get_offset: 0,
                put_offset: 4
            })
        );

        service.set_get_offset(4).unwrap();
        service.set_get_buffer(id).unwrap();
        assert_eq!(service.put_offset(), 0);
    }

    #[test]
    fn flush_accepts_the_full_range() {
        let mut service = service();
        let (flushes, callback) = counter();
        service.set_put_offset_change_callback(callback);

        let id = service.create_transfer_buffer(64, -1);
        service.set_get_buffer(id).unwrap();
        service.flush(0);
        service.flush(16);
        assert_eq!(service.put_offset(), 16);
        assert_eq!(service.error(), ErrorCode::NoError);
        assert_eq!(flushes.get(), 2);
    }

    #[test]
    fn out_of_bounds_flush_is_sticky_and_keeps_put() {
        let mut service = service();
        let (flushes, put_callback) = counter();
        let (errors, error_callback) = counter();
        service.set_put_offset_change_callback(put_callback);
        service.set_parse_error_callback(error_callback);

        let id = service.create_transfer_buffer(64, -1);
        service.set_get_buffer(id).unwrap();
        service.flush(3);
        service.flush(17);
        assert_eq!(service.put_offset(), 3);
        assert_eq!(service.error(), ErrorCode::OutOfBounds);

        service.flush(-1);
        assert_eq!(service.put_offset(), 3);
        assert_eq!(flushes.get(), 1);
        assert_eq!(errors.get(), 1);
    }

    #[test]
    fn flush_without_ring_only_accepts_zero() {
        let mut service = service();
        service.flush(0);
        assert_eq!(service.error(), ErrorCode::NoError);
        service.flush(1);
        assert_eq!(service.error(), ErrorCode::OutOfBounds);
    }

    #[test]
    fn first_parse_error_wins() {
        let mut service = service();
        let (errors, callback) = counter();
        service.set_parse_error_callback(callback);

        service.set_parse_error(ErrorCode::NoError);
        assert_eq!(errors.get(), 0);
        service.set_parse_error(ErrorCode::InvalidArguments);
        service.set_parse_error(ErrorCode::UnknownCommand);
        assert_eq!(service.error(), ErrorCode::InvalidArguments);
        assert_eq!(errors.get(), 1);
    }

    #[test]
    fn rebinding_clears_the_error() {
        let mut service = service();
        let id = service.create_transfer_buffer(64, -1);
        service.set_get_buffer(id).unwrap();
        service.set_parse_error(ErrorCode::GenericError);
        service.set_get_buffer(id).unwrap();
        assert_eq!(service.error(), ErrorCode::NoError);
    }

    #[test]
    fn failed_stream_can_be_rebound_with_work_pending() {
        let mut service = service();
        let ring = service.create_transfer_buffer(64, -1);
        service.set_get_buffer(ring).unwrap();
        service.flush(1);
        service.set_parse_error(ErrorCode::InvalidArguments);

        let fresh = service.create_transfer_buffer(64, -1);
        service.set_get_buffer(fresh).unwrap();
        let state = service.get_state();
        assert_eq!(state.error, ErrorCode::NoError);
        assert_eq!(state.get_offset, 0);
        assert_eq!(state.put_offset, 0);
        assert_eq!(service.ring_buffer_id(), fresh);
    }

    #[test]
    fn rebinding_starts_a_new_context_lost_episode() {
        let mut service = service();
        let id = service.create_transfer_buffer(64, -1);
        service.set_get_buffer(id).unwrap();
        service.set_context_lost_reason(ContextLostReason::Guilty);
        service.set_parse_error(ErrorCode::GenericError);

        service.set_get_buffer(id).unwrap();
        assert_eq!(
            service.get_state().context_lost_reason,
            ContextLostReason::Unknown
        );

        service.set_context_lost_reason(ContextLostReason::Innocent);
        service.set_parse_error(ErrorCode::OutOfBounds);
        let state = service.get_state();
        assert_eq!(state.error, ErrorCode::OutOfBounds);
        assert_eq!(state.context_lost_reason, ContextLostReason::Innocent);
    }

    #[test]
    fn first_context_lost_reason_wins() {
        let mut service = service();
        service.set_context_lost_reason(ContextLostReason::Unknown);
        service.set_context_lost_reason(ContextLostReason::Innocent);
        service.set_context_lost_reason(ContextLostReason::Guilty);
        assert_eq!(
            service.get_state().context_lost_reason,
            ContextLostReason::Innocent
        );
    }

    #[test]
    fn destroying_the_ring_unbinds_it() {
        let mut service = service();
        let id = service.create_transfer_buffer(64, -1);
        service.set_get_buffer(id).unwrap();
        service.flush(8);
        service.set_get_offset(8).unwrap();

        service.destroy_transfer_buffer(id);
        let state = service.get_state();
        assert_eq!(state.num_entries, 0);
        assert_eq!(state.put_offset, 0);
        assert_eq!(state.get_offset, 0);
        assert_eq!(service.ring_buffer_id(), -1);
        assert!(service.get_transfer_buffer(id).is_none());
    }

    #[test]
    fn set_get_offset_is_range_checked() {
        let mut service = service();
        let id = service.create_transfer_buffer(16, -1);
        service.set_get_buffer(id).unwrap();
        service.set_get_offset(4).unwrap();
        assert_eq!(
            service.set_get_offset(5),
            Err(ServiceError::GetOffsetOutOfRange {
                offset: 5,
                num_entries: 4
            })
        );
        assert_eq!(service.get_offset(), 4);
    }

    #[test]
    fn transfer_buffer_failures_return_minus_one() {
        let mut service = service();
        assert_eq!(service.create_transfer_buffer(0, -1), -1);
        assert_eq!(service.create_transfer_buffer(16, 0), -1);
        assert_eq!(service.create_transfer_buffer(16, 101), -1);

        let shm = SharedMemory::create_anonymous(16).unwrap();
        assert_eq!(service.register_transfer_buffer(&shm, 32, -1), -1);
        assert_eq!(service.register_transfer_buffer(&shm, 16, 4), 4);
        assert_eq!(service.stats().snapshot().transfer_buffers_registered, 1);
    }
}
