//! Service side of the GPU command buffer.
//!
//! - [`TransferBufferTable`]: integer handles for shared-memory buffers.
//! - [`CommandBufferService`]: get/put offset protocol over the bound ring,
//!   sticky errors and state snapshots (see [`CommandBuffer`]).
//! - [`BucketStore`]: variable-length staging data addressed by bucket id.
//! - [`CommonDecoder`]: validated dispatch of the common command set.
//! - [`CommandParser`] and [`GpuScheduler`]: drain the ring after each flush and
//!   escalate command errors to the command buffer.

mod bucket;
mod command_buffer;
mod config;
mod decoder;
mod error;
mod parser;
mod scheduler;
mod stats;
mod transfer_buffer;

pub use bucket::{Bucket, BucketStore};
pub use command_buffer::{CommandBuffer, CommandBufferService};
pub use config::{
    ConfigError, ServiceConfig, DEFAULT_MAX_BUCKET_SIZE, DEFAULT_MAX_COMMANDS_PER_FLUSH,
    DEFAULT_MAX_ID_REQUEST, MAX_ID_REQUEST_LIMIT, MAX_STACK_DEPTH,
};
pub use decoder::{AsyncApi, CommandEngine, CommonDecoder};
pub use error::ServiceError;
pub use parser::CommandParser;
pub use scheduler::GpuScheduler;
pub use stats::{ServiceStats, ServiceStatsSnapshot};
pub use transfer_buffer::{TransferBuffer, TransferBufferError, TransferBufferTable};
