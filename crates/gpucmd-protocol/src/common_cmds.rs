//! Common command set understood by every decoder.
//!
//! Ids `0..=LAST_COMMON_ID` are reserved for housekeeping commands (tokens,
//! jumps, call/return and bucket staging). Decoders that embed the common
//! decoder allocate their own ids above [`LAST_COMMON_ID`].

use crate::entry::{entries_to_bytes, CommandBufferEntry, ENTRY_SIZE};
use crate::error::CommandError;

/// Argument-count policy of a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgFlags {
    /// Exactly `arg_count` argument entries.
    Fixed,
    /// At least `arg_count` argument entries; the rest is immediate data.
    AtLeastN,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandInfo {
    pub arg_flags: ArgFlags,
    pub arg_count: u32,
}

impl CommandInfo {
    const fn fixed(arg_count: u32) -> Self {
        Self {
            arg_flags: ArgFlags::Fixed,
            arg_count,
        }
    }

    const fn at_least(arg_count: u32) -> Self {
        Self {
            arg_flags: ArgFlags::AtLeastN,
            arg_count,
        }
    }

    /// Validate `actual` argument entries against this policy and return the
    /// number of trailing immediate-data bytes.
    pub fn immediate_data_size(&self, actual: u32) -> Result<u32, CommandError> {
        let ok = match self.arg_flags {
            ArgFlags::Fixed => actual == self.arg_count,
            ArgFlags::AtLeastN => actual >= self.arg_count,
        };
        if !ok {
            return Err(CommandError::InvalidArguments);
        }
        (actual - self.arg_count)
            .checked_mul(ENTRY_SIZE as u32)
            .ok_or(CommandError::InvalidArguments)
    }
}

pub const LAST_COMMON_ID: u32 = CommonCommandId::GetBucketData as u32;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommonCommandId {
    Noop = 0,
    SetToken = 1,
    Jump = 2,
    JumpRelative = 3,
    Call = 4,
    CallRelative = 5,
    Return = 6,
    SetBucketSize = 7,
    SetBucketData = 8,
    SetBucketDataImmediate = 9,
    GetBucketSize = 10,
    GetBucketData = 11,
}

impl CommonCommandId {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Noop),
            1 => Some(Self::SetToken),
            2 => Some(Self::Jump),
            3 => Some(Self::JumpRelative),
            4 => Some(Self::Call),
            5 => Some(Self::CallRelative),
            6 => Some(Self::Return),
            7 => Some(Self::SetBucketSize),
            8 => Some(Self::SetBucketData),
            9 => Some(Self::SetBucketDataImmediate),
            10 => Some(Self::GetBucketSize),
            11 => Some(Self::GetBucketData),
            _ => None,
        }
    }

    pub const fn info(self) -> CommandInfo {
        match self {
            Self::Noop => CommandInfo::at_least(0),
            Self::SetToken => CommandInfo::fixed(1),
            Self::Jump => CommandInfo::fixed(1),
            Self::JumpRelative => CommandInfo::fixed(1),
            Self::Call => CommandInfo::fixed(1),
            Self::CallRelative => CommandInfo::fixed(1),
            Self::Return => CommandInfo::fixed(0),
            Self::SetBucketSize => CommandInfo::fixed(2),
            Self::SetBucketData => CommandInfo::fixed(5),
            Self::SetBucketDataImmediate => CommandInfo::at_least(3),
            Self::GetBucketSize => CommandInfo::fixed(3),
            Self::GetBucketData => CommandInfo::fixed(5),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Noop => "Noop",
            Self::SetToken => "SetToken",
            Self::Jump => "Jump",
            Self::JumpRelative => "JumpRelative",
            Self::Call => "Call",
            Self::CallRelative => "CallRelative",
            Self::Return => "Return",
            Self::SetBucketSize => "SetBucketSize",
            Self::SetBucketData => "SetBucketData",
            Self::SetBucketDataImmediate => "SetBucketDataImmediate",
            Self::GetBucketSize => "GetBucketSize",
            Self::GetBucketData => "GetBucketData",
        }
    }
}

/// A decoded common command.
///
/// Decoding copies every field out of the argument entries, so later writes to
/// shared memory cannot change a command after it was validated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommonCommand {
    /// Skips its (ignored) argument entries.
    Noop,
    SetToken {
        token: i32,
    },
    Jump {
        offset: i32,
    },
    JumpRelative {
        offset: i32,
    },
    Call {
        offset: i32,
    },
    CallRelative {
        offset: i32,
    },
    Return,
    SetBucketSize {
        bucket_id: u32,
        size: u32,
    },
    SetBucketData {
        bucket_id: u32,
        offset: u32,
        size: u32,
        shared_memory_id: i32,
        shared_memory_offset: u32,
    },
    SetBucketDataImmediate {
        bucket_id: u32,
        offset: u32,
        size: u32,
        /// Trailing immediate bytes (a whole number of entries).
        data: Vec<u8>,
    },
    GetBucketSize {
        bucket_id: u32,
        shared_memory_id: i32,
        shared_memory_offset: u32,
    },
    GetBucketData {
        bucket_id: u32,
        offset: u32,
        size: u32,
        shared_memory_id: i32,
        shared_memory_offset: u32,
    },
}

impl CommonCommand {
    /// Decode command `command` from its argument entries (header excluded).
    ///
    /// Ids outside the common range are [`CommandError::UnknownCommand`]; an
    /// argument count violating the command's [`CommandInfo`] is
    /// [`CommandError::InvalidArguments`].
    pub fn decode(command: u32, args: &[CommandBufferEntry]) -> Result<Self, CommandError> {
        let id = CommonCommandId::from_u32(command).ok_or(CommandError::UnknownCommand)?;
        let arg_count = u32::try_from(args.len()).map_err(|_| CommandError::InvalidArguments)?;
        id.info().immediate_data_size(arg_count)?;

        let u = |i: usize| args[i].as_u32();
        let s = |i: usize| args[i].as_i32();

        Ok(match id {
            CommonCommandId::Noop => Self::Noop,
            CommonCommandId::SetToken => Self::SetToken { token: s(0) },
            CommonCommandId::Jump => Self::Jump { offset: s(0) },
            CommonCommandId::JumpRelative => Self::JumpRelative { offset: s(0) },
            CommonCommandId::Call => Self::Call { offset: s(0) },
            CommonCommandId::CallRelative => Self::CallRelative { offset: s(0) },
            CommonCommandId::Return => Self::Return,
            CommonCommandId::SetBucketSize => Self::SetBucketSize {
                bucket_id: u(0),
                size: u(1),
            },
            CommonCommandId::SetBucketData => Self::SetBucketData {
                bucket_id: u(0),
                offset: u(1),
                size: u(2),
                shared_memory_id: s(3),
                shared_memory_offset: u(4),
            },
            CommonCommandId::SetBucketDataImmediate => Self::SetBucketDataImmediate {
                bucket_id: u(0),
                offset: u(1),
                size: u(2),
                data: entries_to_bytes(&args[3..]),
            },
            CommonCommandId::GetBucketSize => Self::GetBucketSize {
                bucket_id: u(0),
                shared_memory_id: s(1),
                shared_memory_offset: u(2),
            },
            CommonCommandId::GetBucketData => Self::GetBucketData {
                bucket_id: u(0),
                offset: u(1),
                size: u(2),
                shared_memory_id: s(3),
                shared_memory_offset: u(4),
            },
        })
    }

    pub fn id(&self) -> CommonCommandId {
        match self {
            Self::Noop => CommonCommandId::Noop,
            Self::SetToken { .. } => CommonCommandId::SetToken,
            Self::Jump { .. } => CommonCommandId::Jump,
            Self::JumpRelative { .. } => CommonCommandId::JumpRelative,
            Self::Call { .. } => CommonCommandId::Call,
            Self::CallRelative { .. } => CommonCommandId::CallRelative,
            Self::Return => CommonCommandId::Return,
            Self::SetBucketSize { .. } => CommonCommandId::SetBucketSize,
            Self::SetBucketData { .. } => CommonCommandId::SetBucketData,
            Self::SetBucketDataImmediate { .. } => CommonCommandId::SetBucketDataImmediate,
            Self::GetBucketSize { .. } => CommonCommandId::GetBucketSize,
            Self::GetBucketData { .. } => CommonCommandId::GetBucketData,
        }
    }
}
