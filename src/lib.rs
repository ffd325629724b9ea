//! GPU command buffer: a shared-memory command ring between an untrusted client
//! and a service that validates and executes the commands.
//!
//! This crate re-exports the workspace members:
//!
//! - [`protocol`]: entry and header encoding, the common command set, states.
//! - [`shm`]: shared memory segments and the handles used to transfer them.
//! - [`service`]: transfer buffer table, command buffer service, buckets,
//!   decoder, parser and scheduler.
//! - [`client`]: the producer-side command buffer helper.

pub use gpucmd_client as client;
pub use gpucmd_protocol as protocol;
pub use gpucmd_service as service;
pub use gpucmd_shm as shm;

pub use gpucmd_client::{CommandBufferHelper, HelperError};
pub use gpucmd_protocol::{CommandBufferEntry, CommandWriter, ContextLostReason, ErrorCode, State};
pub use gpucmd_service::{
    CommandBuffer, CommandBufferService, CommonDecoder, GpuScheduler, ServiceConfig,
};
