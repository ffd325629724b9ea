use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error code carried in [`State::error`](crate::State::error).
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[default]
    NoError = 0,
    InvalidSize = 1,
    OutOfBounds = 2,
    UnknownCommand = 3,
    InvalidArguments = 4,
    LostContext = 5,
    GenericError = 6,
}

impl ErrorCode {
    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::NoError),
            1 => Some(Self::InvalidSize),
            2 => Some(Self::OutOfBounds),
            3 => Some(Self::UnknownCommand),
            4 => Some(Self::InvalidArguments),
            5 => Some(Self::LostContext),
            6 => Some(Self::GenericError),
            _ => None,
        }
    }

    pub const fn is_error(self) -> bool {
        !matches!(self, Self::NoError)
    }
}

/// Error returned by a single command decode/dispatch.
///
/// These are local to the command that produced them; the scheduler decides
/// whether to make them sticky on the command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("command header has an invalid size")]
    InvalidSize,
    #[error("command or offset out of bounds")]
    OutOfBounds,
    #[error("unknown command id")]
    UnknownCommand,
    #[error("invalid command arguments")]
    InvalidArguments,
    #[error("context lost")]
    LostContext,
    #[error("generic command error")]
    GenericError,
}

impl From<CommandError> for ErrorCode {
    fn from(value: CommandError) -> Self {
        match value {
            CommandError::InvalidSize => ErrorCode::InvalidSize,
            CommandError::OutOfBounds => ErrorCode::OutOfBounds,
            CommandError::UnknownCommand => ErrorCode::UnknownCommand,
            CommandError::InvalidArguments => ErrorCode::InvalidArguments,
            CommandError::LostContext => ErrorCode::LostContext,
            CommandError::GenericError => ErrorCode::GenericError,
        }
    }
}

/// Why a context was lost, as reported to the client.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextLostReason {
    /// This context caused the loss.
    Guilty = 0,
    /// Another context caused the loss.
    Innocent = 1,
    #[default]
    Unknown = 2,
}
