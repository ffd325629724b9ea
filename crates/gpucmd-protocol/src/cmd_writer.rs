//! Command stream builder for the common command set.
//!
//! Intended for clients, tests and tooling that need to emit canonical entry
//! sequences (correct header sizes and entry padding for immediate payloads).

use crate::common_cmds::CommonCommandId;
use crate::entry::{CommandBufferEntry, CommandHeader, ENTRY_SIZE};

fn entries_for_bytes(len: usize) -> usize {
    len.div_ceil(ENTRY_SIZE)
}

#[derive(Debug, Default, Clone)]
pub struct CommandWriter {
    entries: Vec<CommandBufferEntry>,
}

impl CommandWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Length of the stream in entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn as_entries(&self) -> &[CommandBufferEntry] {
        &self.entries
    }

    pub fn finish(self) -> Vec<CommandBufferEntry> {
        self.entries
    }

    /// Append an arbitrary command; used for ids owned by an embedding decoder.
    pub fn raw(&mut self, command: u32, args: &[CommandBufferEntry]) {
        let arg_count = u32::try_from(args.len()).unwrap_or(u32::MAX);
        let header = CommandHeader::for_args(command, arg_count)
            .expect("command id or size does not fit the command header");
        self.entries.push(header.to_entry());
        self.entries.extend_from_slice(args);
    }

    fn common(&mut self, id: CommonCommandId, args: &[u32]) {
        let args: Vec<CommandBufferEntry> =
            args.iter().copied().map(CommandBufferEntry::from_u32).collect();
        self.raw(id as u32, &args);
    }

    /// A no-op spanning `skip_count + 1` entries.
    pub fn noop(&mut self, skip_count: u32) {
        let args = vec![CommandBufferEntry::default(); skip_count as usize];
        self.raw(CommonCommandId::Noop as u32, &args);
    }

    pub fn set_token(&mut self, token: i32) {
        self.common(CommonCommandId::SetToken, &[token as u32]);
    }

    pub fn jump(&mut self, offset: i32) {
        self.common(CommonCommandId::Jump, &[offset as u32]);
    }

    pub fn jump_relative(&mut self, offset: i32) {
        self.common(CommonCommandId::JumpRelative, &[offset as u32]);
    }

    pub fn call(&mut self, offset: i32) {
        self.common(CommonCommandId::Call, &[offset as u32]);
    }

    pub fn call_relative(&mut self, offset: i32) {
        self.common(CommonCommandId::CallRelative, &[offset as u32]);
    }

    pub fn return_(&mut self) {
        self.common(CommonCommandId::Return, &[]);
    }

    pub fn set_bucket_size(&mut self, bucket_id: u32, size: u32) {
        self.common(CommonCommandId::SetBucketSize, &[bucket_id, size]);
    }

    pub fn set_bucket_data(
        &mut self,
        bucket_id: u32,
        offset: u32,
        size: u32,
        shared_memory_id: i32,
        shared_memory_offset: u32,
    ) {
        self.common(
            CommonCommandId::SetBucketData,
            &[bucket_id, offset, size, shared_memory_id as u32, shared_memory_offset],
        );
    }

    /// Appends `data` inline after the fixed arguments, zero-padded to a whole entry.
    pub fn set_bucket_data_immediate(&mut self, bucket_id: u32, offset: u32, data: &[u8]) {
        let size = u32::try_from(data.len()).expect("immediate payload too large");
        let mut args = vec![
            CommandBufferEntry::from_u32(bucket_id),
            CommandBufferEntry::from_u32(offset),
            CommandBufferEntry::from_u32(size),
        ];
        args.reserve(entries_for_bytes(data.len()));
        for chunk in data.chunks(ENTRY_SIZE) {
            let mut word = [0u8; ENTRY_SIZE];
            word[..chunk.len()].copy_from_slice(chunk);
            args.push(CommandBufferEntry::from_le_bytes(word));
        }
        self.raw(CommonCommandId::SetBucketDataImmediate as u32, &args);
    }

    pub fn get_bucket_size(&mut self, bucket_id: u32, shared_memory_id: i32, shared_memory_offset: u32) {
        self.common(
            CommonCommandId::GetBucketSize,
            &[bucket_id, shared_memory_id as u32, shared_memory_offset],
        );
    }

    pub fn get_bucket_data(
        &mut self,
        bucket_id: u32,
        offset: u32,
        size: u32,
        shared_memory_id: i32,
        shared_memory_offset: u32,
    ) {
        self.common(
            CommonCommandId::GetBucketData,
            &[bucket_id, offset, size, shared_memory_id as u32, shared_memory_offset],
        );
    }
}
