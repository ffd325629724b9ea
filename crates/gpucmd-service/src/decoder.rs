use gpucmd_protocol::{
    CommandBufferEntry, CommandError, CommonCommand, CommonCommandId, ContextLostReason,
    LAST_COMMON_ID,
};

use crate::bucket::{Bucket, BucketStore};
use crate::config::ServiceConfig;
use crate::transfer_buffer::TransferBuffer;

/// What a decoder may touch while executing a command.
///
/// Offsets are in entries. [`get_get_offset`](Self::get_get_offset) is the
/// offset of the command currently being executed.
pub trait CommandEngine {
    fn get_shared_memory_buffer(&self, shm_id: i32) -> Option<&TransferBuffer>;

    fn set_token(&mut self, token: i32);

    fn get_get_offset(&self) -> i32;

    /// Reposition the consumer. Returns `false` if `offset` does not address
    /// an entry of the ring.
    fn set_get_offset(&mut self, offset: i32) -> bool;
}

/// A command handler driven by [`CommandParser`](crate::CommandParser).
pub trait AsyncApi {
    /// Execute one command. `cmd_data` holds the `arg_count` entries that
    /// follow the header.
    fn do_command(
        &mut self,
        engine: &mut dyn CommandEngine,
        command: u32,
        arg_count: u32,
        cmd_data: &[CommandBufferEntry],
    ) -> Result<(), CommandError>;

    fn command_name(&self, command: u32) -> &'static str;

    /// Reason reported alongside an escalated command error.
    fn context_lost_reason(&self) -> ContextLostReason {
        ContextLostReason::Unknown
    }

    /// The ring was rebound; positions saved against the old ring are void.
    fn reset_stream_state(&mut self) {}
}

/// Executes the common command set and owns the buckets and call stack.
///
/// Embedding decoders forward ids up to [`LAST_COMMON_ID`] here.
#[derive(Debug)]
pub struct CommonDecoder {
    buckets: BucketStore,
    call_stack: Vec<i32>,
    max_stack_depth: usize,
    max_bucket_size: usize,
    trace_commands: bool,
}

impl Default for CommonDecoder {
    fn default() -> Self {
        Self::new(&ServiceConfig::default())
    }
}

impl CommonDecoder {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            buckets: BucketStore::new(),
            call_stack: Vec::new(),
            max_stack_depth: config.max_call_stack_depth,
            max_bucket_size: config.max_bucket_size,
            trace_commands: config.trace_commands,
        }
    }

    pub fn buckets(&self) -> &BucketStore {
        &self.buckets
    }

    pub fn buckets_mut(&mut self) -> &mut BucketStore {
        &mut self.buckets
    }

    /// Existing bucket only; see [`create_bucket`](Self::create_bucket).
    pub fn get_bucket(&self, bucket_id: u32) -> Option<&Bucket> {
        self.buckets.get(bucket_id)
    }

    pub fn create_bucket(&mut self, bucket_id: u32) -> &mut Bucket {
        self.buckets.create(bucket_id)
    }

    pub fn call_stack_depth(&self) -> usize {
        self.call_stack.len()
    }

    /// Validate and execute a common command.
    ///
    /// Errors are local to the command; nothing is mutated when the argument
    /// count is rejected.
    pub fn do_common_command(
        &mut self,
        engine: &mut dyn CommandEngine,
        command: u32,
        arg_count: u32,
        cmd_data: &[CommandBufferEntry],
    ) -> Result<(), CommandError> {
        let args = usize::try_from(arg_count)
            .ok()
            .and_then(|n| cmd_data.get(..n))
            .ok_or(CommandError::InvalidArguments)?;
        let cmd = CommonCommand::decode(command, args)?;

        if self.trace_commands {
            tracing::trace!(
                command = cmd.id().name(),
                arg_count,
                get_offset = engine.get_get_offset(),
                "common command"
            );
        }

        match cmd {
            CommonCommand::Noop => Ok(()),
            CommonCommand::SetToken { token } => {
                engine.set_token(token);
                Ok(())
            }
            CommonCommand::Jump { offset } => jump(engine, offset),
            CommonCommand::JumpRelative { offset } => {
                let target = engine
                    .get_get_offset()
                    .checked_add(offset)
                    .ok_or(CommandError::InvalidArguments)?;
                jump(engine, target)
            }
            CommonCommand::Call { offset } => self.call(engine, arg_count, offset),
            CommonCommand::CallRelative { offset } => {
                let target = engine
                    .get_get_offset()
                    .checked_add(offset)
                    .ok_or(CommandError::InvalidArguments)?;
                self.call(engine, arg_count, target)
            }
            CommonCommand::Return => {
                let return_address = self.call_stack.pop().ok_or(CommandError::InvalidArguments)?;
                jump(engine, return_address)
            }
            CommonCommand::SetBucketSize { bucket_id, size } => {
                let size = usize::try_from(size).map_err(|_| CommandError::InvalidArguments)?;
                if size > self.max_bucket_size {
                    tracing::debug!(
                        bucket_id,
                        size,
                        max = self.max_bucket_size,
                        "bucket too large"
                    );
                    return Err(CommandError::InvalidArguments);
                }
                self.buckets.set_size(bucket_id, size).map_err(|err| {
                    tracing::warn!(bucket_id, size, %err, "bucket allocation failed");
                    CommandError::GenericError
                })
            }
            CommonCommand::SetBucketData {
                bucket_id,
                offset,
                size,
                shared_memory_id,
                shared_memory_offset,
            } => {
                let (buffer, src_offset) =
                    shared_memory(engine, shared_memory_id, shared_memory_offset, size)?;
                let bucket = self
                    .buckets
                    .get_mut(bucket_id)
                    .ok_or(CommandError::InvalidArguments)?;
                let mut data = vec![0u8; size as usize];
                buffer
                    .read(src_offset, &mut data)
                    .map_err(|_| CommandError::InvalidArguments)?;
                write_bucket(bucket, &data, offset)
            }
            CommonCommand::SetBucketDataImmediate {
                bucket_id,
                offset,
                size,
                data,
            } => {
                let data = data
                    .get(..size as usize)
                    .ok_or(CommandError::InvalidArguments)?;
                let bucket = self
                    .buckets
                    .get_mut(bucket_id)
                    .ok_or(CommandError::InvalidArguments)?;
                write_bucket(bucket, data, offset)
            }
            CommonCommand::GetBucketSize {
                bucket_id,
                shared_memory_id,
                shared_memory_offset,
            } => {
                let (buffer, dst_offset) =
                    shared_memory(engine, shared_memory_id, shared_memory_offset, 4)?;
                let result = read_result_slot(buffer, dst_offset, 4)?;
                if result.iter().any(|&b| b != 0) {
                    return Err(CommandError::InvalidArguments);
                }
                let bucket = self
                    .buckets
                    .get(bucket_id)
                    .ok_or(CommandError::InvalidArguments)?;
                let size = u32::try_from(bucket.size()).map_err(|_| CommandError::InvalidArguments)?;
                buffer
                    .write_u32(dst_offset, size)
                    .map_err(|_| CommandError::InvalidArguments)
            }
            CommonCommand::GetBucketData {
                bucket_id,
                offset,
                size,
                shared_memory_id,
                shared_memory_offset,
            } => {
                let (buffer, dst_offset) =
                    shared_memory(engine, shared_memory_id, shared_memory_offset, size)?;
                let bucket = self
                    .buckets
                    .get(bucket_id)
                    .ok_or(CommandError::InvalidArguments)?;
                let src = bucket
                    .get_data(offset as usize, size as usize)
                    .ok_or(CommandError::InvalidArguments)?;
                let result = read_result_slot(buffer, dst_offset, src.len())?;
                if result.iter().any(|&b| b != 0) {
                    return Err(CommandError::InvalidArguments);
                }
                buffer
                    .write(dst_offset, src)
                    .map_err(|_| CommandError::InvalidArguments)
            }
        }
    }

    fn call(
        &mut self,
        engine: &mut dyn CommandEngine,
        arg_count: u32,
        target: i32,
    ) -> Result<(), CommandError> {
        if self.call_stack.len() >= self.max_stack_depth {
            tracing::debug!(depth = self.call_stack.len(), "call stack full");
            return Err(CommandError::InvalidArguments);
        }
        let command_size = i32::try_from(arg_count)
            .ok()
            .and_then(|n| n.checked_add(1))
            .ok_or(CommandError::InvalidArguments)?;
        let return_address = engine
            .get_get_offset()
            .checked_add(command_size)
            .ok_or(CommandError::InvalidArguments)?;
        jump(engine, target)?;
        self.call_stack.push(return_address);
        Ok(())
    }
}

impl AsyncApi for CommonDecoder {
    fn do_command(
        &mut self,
        engine: &mut dyn CommandEngine,
        command: u32,
        arg_count: u32,
        cmd_data: &[CommandBufferEntry],
    ) -> Result<(), CommandError> {
        if command > LAST_COMMON_ID {
            return Err(CommandError::UnknownCommand);
        }
        self.do_common_command(engine, command, arg_count, cmd_data)
    }

    fn command_name(&self, command: u32) -> &'static str {
        CommonCommandId::from_u32(command).map_or("unknown", CommonCommandId::name)
    }

    fn reset_stream_state(&mut self) {
        self.call_stack.clear();
    }
}

fn jump(engine: &mut dyn CommandEngine, target: i32) -> Result<(), CommandError> {
    if engine.set_get_offset(target) {
        Ok(())
    } else {
        Err(CommandError::InvalidArguments)
    }
}

/// Resolve `[offset, offset + size)` inside transfer buffer `shm_id`.
fn shared_memory<'e>(
    engine: &'e dyn CommandEngine,
    shm_id: i32,
    offset: u32,
    size: u32,
) -> Result<(&'e TransferBuffer, usize), CommandError> {
    let buffer = engine
        .get_shared_memory_buffer(shm_id)
        .ok_or(CommandError::InvalidArguments)?;
    let offset = offset as usize;
    if !buffer.contains(offset, size as usize) {
        return Err(CommandError::InvalidArguments);
    }
    Ok((buffer, offset))
}

/// Current contents of a client-provided result slot.
fn read_result_slot(
    buffer: &TransferBuffer,
    offset: usize,
    len: usize,
) -> Result<Vec<u8>, CommandError> {
    let mut slot = vec![0u8; len];
    buffer
        .read(offset, &mut slot)
        .map_err(|_| CommandError::InvalidArguments)?;
    Ok(slot)
}

fn write_bucket(bucket: &mut Bucket, data: &[u8], offset: u32) -> Result<(), CommandError> {
    if bucket.set_data(data, offset as usize) {
        Ok(())
    } else {
        Err(CommandError::InvalidArguments)
    }
}
