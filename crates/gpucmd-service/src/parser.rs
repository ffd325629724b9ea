use gpucmd_protocol::{CommandBufferEntry, CommandError, CommandHeader};

use crate::command_buffer::{CommandBuffer, CommandBufferService};
use crate::decoder::{AsyncApi, CommandEngine};
use crate::transfer_buffer::TransferBuffer;

/// Walks the bound ring from `get` towards `put`, one command at a time.
///
/// Each command is copied out of shared memory before it is validated, so the
/// producer cannot change a command after its header was checked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandParser {
    get: i32,
    put: i32,
    num_entries: i32,
}

impl CommandParser {
    pub fn new(num_entries: i32) -> Self {
        Self {
            get: 0,
            put: 0,
            num_entries,
        }
    }

    /// Start over on a freshly bound ring.
    pub fn reset(&mut self, num_entries: i32) {
        *self = Self::new(num_entries);
    }

    pub fn get(&self) -> i32 {
        self.get
    }

    pub fn put(&self) -> i32 {
        self.put
    }

    pub fn set_put(&mut self, put: i32) {
        self.put = put;
    }

    pub fn is_empty(&self) -> bool {
        self.get == self.put
    }

    /// Execute the command at `get`.
    ///
    /// `get` moves past the command even if the handler fails, unless the
    /// handler repositioned it.
    pub fn process_command(
        &mut self,
        service: &mut CommandBufferService,
        handler: &mut dyn AsyncApi,
    ) -> Result<(), CommandError> {
        if self.is_empty() {
            return Ok(());
        }
        let start = self.get;
        if !(0..self.num_entries).contains(&start) {
            return Err(CommandError::OutOfBounds);
        }

        let ring = service.ring_buffer().ok_or(CommandError::OutOfBounds)?;
        let cmd = read_command(ring, start, self.num_entries)?;

        let end = start + cmd.header.size() as i32;
        let mut engine = ParserEngine {
            service,
            current: start,
            get: start,
            jumped: false,
            num_entries: self.num_entries,
        };
        let result = handler.do_command(
            &mut engine,
            cmd.header.command(),
            cmd.header.arg_count(),
            &cmd.args,
        );
        self.get = if engine.jumped { engine.get } else { end };

        if let Err(err) = &result {
            tracing::debug!(
                command = handler.command_name(cmd.header.command()),
                offset = start,
                %err,
                "command failed"
            );
        }
        result
    }

    /// Process commands until `get == put` or one fails.
    pub fn process_all_commands(
        &mut self,
        service: &mut CommandBufferService,
        handler: &mut dyn AsyncApi,
    ) -> Result<(), CommandError> {
        while !self.is_empty() {
            self.process_command(service, handler)?;
            service.stats().inc_commands_processed();
        }
        Ok(())
    }

    /// Process at most `budget` commands, stopping early at `put` or on the
    /// first failure. Returns the number of commands that ran.
    pub fn process_commands(
        &mut self,
        service: &mut CommandBufferService,
        handler: &mut dyn AsyncApi,
        budget: usize,
    ) -> Result<usize, CommandError> {
        let mut processed = 0;
        while processed < budget && !self.is_empty() {
            self.process_command(service, handler)?;
            service.stats().inc_commands_processed();
            processed += 1;
        }
        Ok(processed)
    }
}

struct CopiedCommand {
    header: CommandHeader,
    args: Vec<CommandBufferEntry>,
}

fn read_command(
    ring: &TransferBuffer,
    start: i32,
    num_entries: i32,
) -> Result<CopiedCommand, CommandError> {
    let first = start as usize;
    let header_entry = ring
        .read_entries(first, 1)
        .map_err(|_| CommandError::OutOfBounds)?;
    let header = CommandHeader::from_entry(header_entry[0]);
    if header.size() == 0 {
        return Err(CommandError::InvalidSize);
    }
    if i64::from(start) + i64::from(header.size()) > i64::from(num_entries) {
        return Err(CommandError::OutOfBounds);
    }
    let args = ring
        .read_entries(first + 1, header.arg_count() as usize)
        .map_err(|_| CommandError::OutOfBounds)?;
    Ok(CopiedCommand { header, args })
}

/// [`CommandEngine`] over the service while the parser owns `get`.
struct ParserEngine<'a> {
    service: &'a mut CommandBufferService,
    current: i32,
    get: i32,
    jumped: bool,
    num_entries: i32,
}

impl CommandEngine for ParserEngine<'_> {
    fn get_shared_memory_buffer(&self, shm_id: i32) -> Option<&TransferBuffer> {
        self.service.get_transfer_buffer(shm_id)
    }

    fn set_token(&mut self, token: i32) {
        self.service.set_token(token);
    }

    fn get_get_offset(&self) -> i32 {
        if self.jumped {
            self.get
        } else {
            self.current
        }
    }

    fn set_get_offset(&mut self, offset: i32) -> bool {
        if !(0..self.num_entries).contains(&offset) {
            return false;
        }
        self.get = offset;
        self.jumped = true;
        true
    }
}
