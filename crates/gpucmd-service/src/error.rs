use thiserror::Error;

/// Misuse of the service API itself, as opposed to a malformed command stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("transfer buffer {0} is not registered")]
    UnknownTransferBuffer(i32),

    #[error("cannot rebind the get buffer while commands are pending (get={get_offset} put={put_offset})")]
    RingNotEmpty { get_offset: i32, put_offset: i32 },

    #[error("get offset {offset} out of range for {num_entries} entries")]
    GetOffsetOutOfRange { offset: i32, num_entries: i32 },
}
