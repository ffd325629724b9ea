//! Wire format shared by command-buffer clients and the service.
//!
//! A command stream is a sequence of fixed-width [`CommandBufferEntry`] values.
//! Every command starts with a [`CommandHeader`] entry followed by its argument
//! entries; "immediate" commands append raw payload bytes padded to a whole
//! number of entries.

pub mod cmd_writer;
pub mod common_cmds;
pub mod entry;
pub mod error;
pub mod state;

pub use cmd_writer::CommandWriter;
pub use common_cmds::{ArgFlags, CommandInfo, CommonCommand, CommonCommandId, LAST_COMMON_ID};
pub use entry::{entries_to_bytes, CommandBufferEntry, CommandHeader, ENTRY_SIZE};
pub use error::{CommandError, ContextLostReason, ErrorCode};
pub use state::State;
