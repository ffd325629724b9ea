use gpucmd_protocol::{ContextLostReason, ErrorCode, State};
use gpucmd_shm::SharedMemory;

use crate::command_buffer::{CommandBuffer, CommandBufferService};
use crate::decoder::AsyncApi;
use crate::error::ServiceError;
use crate::parser::CommandParser;
use crate::transfer_buffer::TransferBuffer;

/// Runs the decoder over the ring whenever the client flushes.
///
/// Owns the service so it can be handed to a client as a [`CommandBuffer`]:
/// every accepted flush drains the ring synchronously before returning.
#[derive(Debug)]
pub struct GpuScheduler<D> {
    service: CommandBufferService,
    parser: CommandParser,
    decoder: D,
}

impl<D: AsyncApi> GpuScheduler<D> {
    pub fn new(service: CommandBufferService, decoder: D) -> Self {
        let parser = CommandParser::new(service.num_entries());
        Self {
            service,
            parser,
            decoder,
        }
    }

    pub fn service(&self) -> &CommandBufferService {
        &self.service
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut D {
        &mut self.decoder
    }

    pub fn into_parts(self) -> (CommandBufferService, D) {
        (self.service, self.decoder)
    }

    /// Drain the commands between the parser's get and the service's put.
    ///
    /// Does nothing once an error is sticky. At most
    /// `max_commands_per_flush` commands run per call; a later flush resumes
    /// from the published get. A failing command escalates to the command
    /// buffer; otherwise the consumer's progress is published.
    pub fn put_changed(&mut self) {
        if self.service.error().is_error() {
            return;
        }
        self.parser.set_put(self.service.put_offset());

        let budget = self.service.max_commands_per_flush();
        let result = self
            .parser
            .process_commands(&mut self.service, &mut self.decoder, budget);
        if let Err(err) = result {
            self.service
                .set_context_lost_reason(self.decoder.context_lost_reason());
            self.service.set_parse_error(ErrorCode::from(err));
            return;
        }
        if !self.parser.is_empty() {
            tracing::debug!(
                budget,
                get = self.parser.get(),
                put = self.parser.put(),
                "command budget exhausted, yielding"
            );
        }

        if let Err(err) = self.service.set_get_offset(self.parser.get()) {
            tracing::error!(%err, "parser finished outside the ring");
            self.service.set_parse_error(ErrorCode::OutOfBounds);
        }
    }
}

impl<D: AsyncApi> CommandBuffer for GpuScheduler<D> {
    fn get_state(&mut self) -> State {
        self.service.get_state()
    }

    fn flush(&mut self, put_offset: i32) {
        self.service.flush(put_offset);
        self.put_changed();
    }

    fn flush_sync(&mut self, put_offset: i32, _last_known_get: i32) -> State {
        self.flush(put_offset);
        self.service.get_state()
    }

    fn set_get_buffer(&mut self, id: i32) -> Result<(), ServiceError> {
        self.service.set_get_buffer(id)?;
        self.parser.reset(self.service.num_entries());
        self.decoder.reset_stream_state();
        Ok(())
    }

    fn create_transfer_buffer(&mut self, size: usize, id_request: i32) -> i32 {
        self.service.create_transfer_buffer(size, id_request)
    }

    fn register_transfer_buffer(
        &mut self,
        shared_memory: &SharedMemory,
        size: usize,
        id_request: i32,
    ) -> i32 {
        self.service
            .register_transfer_buffer(shared_memory, size, id_request)
    }

    fn destroy_transfer_buffer(&mut self, id: i32) {
        let was_ring = id == self.service.ring_buffer_id();
        self.service.destroy_transfer_buffer(id);
        if was_ring {
            self.parser.reset(0);
            self.decoder.reset_stream_state();
        }
    }

    fn get_transfer_buffer(&self, id: i32) -> Option<&TransferBuffer> {
        self.service.get_transfer_buffer(id)
    }

    fn set_token(&mut self, token: i32) {
        self.service.set_token(token);
    }

    fn set_parse_error(&mut self, error: ErrorCode) {
        self.service.set_parse_error(error);
    }

    fn set_context_lost_reason(&mut self, reason: ContextLostReason) {
        self.service.set_context_lost_reason(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::decoder::{CommandEngine, CommonDecoder};
    use gpucmd_protocol::{
        entries_to_bytes, CommandBufferEntry, CommandError, CommandWriter, LAST_COMMON_ID,
    };
    use pretty_assertions::assert_eq;
    use std::cell::Cell;
    use std::rc::Rc;

    fn scheduler<D: AsyncApi>(decoder: D, ring_size: usize) -> (GpuScheduler<D>, i32) {
        scheduler_with(&ServiceConfig::default(), decoder, ring_size)
    }

    fn scheduler_with<D: AsyncApi>(
        config: &ServiceConfig,
        decoder: D,
        ring_size: usize,
    ) -> (GpuScheduler<D>, i32) {
        let mut scheduler = GpuScheduler::new(CommandBufferService::new(config), decoder);
        let ring = scheduler.create_transfer_buffer(ring_size, -1);
        scheduler.set_get_buffer(ring).unwrap();
        (scheduler, ring)
    }

    fn write_at<D: AsyncApi>(
        scheduler: &GpuScheduler<D>,
        ring: i32,
        entry_offset: usize,
        writer: &CommandWriter,
    ) -> i32 {
        scheduler
            .get_transfer_buffer(ring)
            .unwrap()
            .write(entry_offset * 4, &entries_to_bytes(writer.as_entries()))
            .unwrap();
        (entry_offset + writer.len()) as i32
    }

    /// Decoder that owns id `LAST_COMMON_ID + 1` and blames itself on errors.
    #[derive(Default)]
    struct EmbeddingDecoder {
        common: CommonDecoder,
        custom_calls: u32,
    }

    impl AsyncApi for EmbeddingDecoder {
        fn do_command(
            &mut self,
            engine: &mut dyn CommandEngine,
            command: u32,
            arg_count: u32,
            cmd_data: &[CommandBufferEntry],
        ) -> Result<(), CommandError> {
            if command <= LAST_COMMON_ID {
                return self
                    .common
                    .do_common_command(engine, command, arg_count, cmd_data);
            }
            if command == LAST_COMMON_ID + 1 {
                self.custom_calls += 1;
                return Ok(());
            }
            Err(CommandError::UnknownCommand)
        }

        fn command_name(&self, command: u32) -> &'static str {
            if command == LAST_COMMON_ID + 1 {
                "Custom"
            } else {
                self.common.command_name(command)
            }
        }

        fn context_lost_reason(&self) -> ContextLostReason {
            ContextLostReason::Guilty
        }
    }

    #[test]
    fn flush_drains_and_publishes_get() {
        let (mut scheduler, ring) = scheduler(CommonDecoder::default(), 256);
        let mut writer = CommandWriter::new();
        writer.set_token(11);
        writer.noop(0);
        let put = write_at(&scheduler, ring, 0, &writer);

        let state = scheduler.flush_sync(put, 0);
        assert_eq!(state.get_offset, put);
        assert_eq!(state.put_offset, put);
        assert_eq!(state.token, 11);
        assert_eq!(state.error, ErrorCode::NoError);

        // A second batch continues where the first stopped.
        let mut writer = CommandWriter::new();
        writer.set_token(12);
        let put = write_at(&scheduler, ring, put as usize, &writer);
        let state = scheduler.flush_sync(put, state.get_offset);
        assert_eq!(state.get_offset, 5);
        assert_eq!(state.token, 12);
        assert_eq!(scheduler.service().stats().snapshot().commands_processed, 3);
    }

    #[test]
    fn command_error_becomes_sticky() {
        let (mut scheduler, ring) = scheduler(CommonDecoder::default(), 64);
        let errors = Rc::new(Cell::new(0));
        let seen = errors.clone();
        scheduler
            .service
            .set_parse_error_callback(move || seen.set(seen.get() + 1));

        let mut writer = CommandWriter::new();
        writer.set_bucket_size(1, 4);
        writer.jump(1000);
        writer.set_token(5);
        let put = write_at(&scheduler, ring, 0, &writer);
        let state = scheduler.flush_sync(put, 0);
        assert_eq!(state.error, ErrorCode::InvalidArguments);
        assert_eq!(state.token, 0);
        assert_eq!(state.context_lost_reason, ContextLostReason::Unknown);
        assert!(scheduler.decoder().get_bucket(1).is_some());

        // Further work is ignored until the ring is rebound.
        scheduler.flush(put);
        assert_eq!(scheduler.get_state().token, 0);
        assert_eq!(errors.get(), 1);
    }

    #[test]
    fn rebinding_recovers_from_an_error() {
        let (mut scheduler, ring) = scheduler(EmbeddingDecoder::default(), 64);
        let mut writer = CommandWriter::new();
        writer.raw(LAST_COMMON_ID + 2, &[]);
        writer.set_token(1);
        let put = write_at(&scheduler, ring, 0, &writer);
        let state = scheduler.flush_sync(put, 0);
        assert_eq!(state.error, ErrorCode::UnknownCommand);
        assert_eq!(state.context_lost_reason, ContextLostReason::Guilty);
        assert_eq!(state.get_offset, 0);

        // Unprocessed work does not block rebinding a failed stream.
        let fresh = scheduler.create_transfer_buffer(64, -1);
        scheduler.set_get_buffer(fresh).unwrap();
        let state = scheduler.get_state();
        assert_eq!(state.error, ErrorCode::NoError);
        assert_eq!(state.context_lost_reason, ContextLostReason::Unknown);

        let mut writer = CommandWriter::new();
        writer.set_token(3);
        let put = write_at(&scheduler, fresh, 0, &writer);
        let state = scheduler.flush_sync(put, 0);
        assert_eq!(state.error, ErrorCode::NoError);
        assert_eq!(state.token, 3);
        assert_eq!(state.get_offset, put);
    }

    #[test]
    fn failed_ring_can_be_rebound_in_place() {
        let (mut scheduler, ring) = scheduler(CommonDecoder::default(), 64);
        let mut writer = CommandWriter::new();
        writer.return_();
        let put = write_at(&scheduler, ring, 0, &writer);
        assert_eq!(
            scheduler.flush_sync(put, 0).error,
            ErrorCode::InvalidArguments
        );

        scheduler.set_get_buffer(ring).unwrap();
        let mut writer = CommandWriter::new();
        writer.set_token(8);
        let put = write_at(&scheduler, ring, 0, &writer);
        let state = scheduler.flush_sync(put, 0);
        assert_eq!(state.error, ErrorCode::NoError);
        assert_eq!(state.token, 8);
    }

    #[test]
    fn self_jump_yields_after_the_command_budget() {
        let config = ServiceConfig {
            max_commands_per_flush: 16,
            ..ServiceConfig::default()
        };
        let (mut scheduler, ring) = scheduler_with(&config, CommonDecoder::new(&config), 64);
        let mut writer = CommandWriter::new();
        writer.jump(0);
        let put = write_at(&scheduler, ring, 0, &writer);

        let state = scheduler.flush_sync(put, 0);
        assert_eq!(state.error, ErrorCode::NoError);
        assert_eq!(state.get_offset, 0);
        assert_eq!(state.put_offset, put);
        assert_eq!(scheduler.service().stats().snapshot().commands_processed, 16);

        scheduler.flush(put);
        assert_eq!(scheduler.service().stats().snapshot().commands_processed, 32);
    }

    #[test]
    fn later_flushes_resume_a_long_batch() {
        let config = ServiceConfig {
            max_commands_per_flush: 4,
            ..ServiceConfig::default()
        };
        let (mut scheduler, ring) = scheduler_with(&config, CommonDecoder::new(&config), 128);
        let mut writer = CommandWriter::new();
        for token in 1..=10 {
            writer.set_token(token);
        }
        let put = write_at(&scheduler, ring, 0, &writer);

        let state = scheduler.flush_sync(put, 0);
        assert_eq!((state.get_offset, state.token), (8, 4));
        let state = scheduler.flush_sync(put, state.get_offset);
        assert_eq!((state.get_offset, state.token), (16, 8));
        let state = scheduler.flush_sync(put, state.get_offset);
        assert_eq!((state.get_offset, state.token), (20, 10));
        assert_eq!(state.error, ErrorCode::NoError);
    }

    #[test]
    fn embedding_decoder_extends_the_command_set() {
        let (mut scheduler, ring) = scheduler(EmbeddingDecoder::default(), 64);
        let mut writer = CommandWriter::new();
        writer.raw(LAST_COMMON_ID + 1, &[CommandBufferEntry::from_u32(1)]);
        writer.set_token(4);
        writer.raw(LAST_COMMON_ID + 2, &[]);
        let put = write_at(&scheduler, ring, 0, &writer);

        let state = scheduler.flush_sync(put, 0);
        assert_eq!(scheduler.decoder().custom_calls, 1);
        assert_eq!(state.token, 4);
        assert_eq!(state.error, ErrorCode::UnknownCommand);
        assert_eq!(state.context_lost_reason, ContextLostReason::Guilty);
    }

    #[test]
    fn rebinding_resets_the_call_stack() {
        let (mut scheduler, ring) = scheduler(CommonDecoder::default(), 64);
        let mut writer = CommandWriter::new();
        writer.call(2);
        writer.noop(0);
        let put = write_at(&scheduler, ring, 0, &writer);
        let state = scheduler.flush_sync(put, 0);
        assert_eq!(state.get_offset, 3);
        assert_eq!(scheduler.decoder().call_stack_depth(), 1);

        scheduler.set_get_buffer(ring).unwrap();
        assert_eq!(scheduler.decoder().call_stack_depth(), 0);
        assert_eq!(scheduler.get_state().get_offset, 0);
    }

    #[test]
    fn drained_to_the_end_of_the_ring() {
        let (mut scheduler, ring) = scheduler(CommonDecoder::default(), 16);
        let mut writer = CommandWriter::new();
        writer.noop(3);
        let put = write_at(&scheduler, ring, 0, &writer);
        assert_eq!(put, 4);

        let state = scheduler.flush_sync(put, 0);
        assert_eq!(state.get_offset, 4);
        assert_eq!(state.num_entries, 4);
        assert_eq!(state.error, ErrorCode::NoError);
    }

    #[test]
    fn destroying_the_ring_stops_processing() {
        let (mut scheduler, ring) = scheduler(CommonDecoder::default(), 64);
        scheduler.destroy_transfer_buffer(ring);
        assert_eq!(scheduler.get_state().num_entries, 0);

        scheduler.flush(0);
        assert_eq!(scheduler.get_state().error, ErrorCode::NoError);
        scheduler.flush(1);
        assert_eq!(scheduler.get_state().error, ErrorCode::OutOfBounds);
    }
}
