use std::collections::BTreeSet;

use gpucmd_protocol::{CommandBufferEntry, ENTRY_SIZE};
use gpucmd_shm::{SharedMapping, SharedMemory, SharedMemoryHandle, ShmError};
use thiserror::Error;

use crate::config::MAX_ID_REQUEST_LIMIT;

#[derive(Debug, Error)]
pub enum TransferBufferError {
    #[error("transfer buffer id request {requested} outside [-1, {max}]")]
    InvalidIdRequest { requested: i32, max: i32 },

    #[error("transfer buffer id {0} is already in use")]
    IdInUse(i32),

    #[error("transfer buffer id space exhausted")]
    IdsExhausted,

    #[error(transparent)]
    Shm(#[from] ShmError),
}

/// A registered shared-memory buffer as seen by the service.
#[derive(Debug)]
pub struct TransferBuffer {
    mapping: SharedMapping,
}

impl TransferBuffer {
    pub fn new(mapping: SharedMapping) -> Self {
        Self { mapping }
    }

    pub fn size(&self) -> usize {
        self.mapping.size()
    }

    /// Whether `[offset, offset + len)` lies inside the buffer.
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        self.mapping.contains(offset, len)
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), ShmError> {
        self.mapping.read(offset, dst)
    }

    pub fn write(&self, offset: usize, src: &[u8]) -> Result<(), ShmError> {
        self.mapping.write(offset, src)
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, ShmError> {
        self.mapping.read_u32(offset)
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), ShmError> {
        self.mapping.write_u32(offset, value)
    }

    /// Number of whole command buffer entries that fit in the buffer.
    pub fn num_entries(&self) -> usize {
        self.size() / ENTRY_SIZE
    }

    /// Copy `count` entries starting at entry index `first`.
    pub fn read_entries(
        &self,
        first: usize,
        count: usize,
    ) -> Result<Vec<CommandBufferEntry>, ShmError> {
        let out_of_bounds = || ShmError::OutOfBounds {
            offset: first.saturating_mul(ENTRY_SIZE),
            len: count.saturating_mul(ENTRY_SIZE),
            size: self.size(),
        };
        let offset = first.checked_mul(ENTRY_SIZE).ok_or_else(out_of_bounds)?;
        let len = count.checked_mul(ENTRY_SIZE).ok_or_else(out_of_bounds)?;
        if !self.contains(offset, len) {
            return Err(out_of_bounds());
        }

        let mut bytes = vec![0u8; len];
        self.read(offset, &mut bytes)?;
        Ok(bytes
            .chunks_exact(ENTRY_SIZE)
            .map(|chunk| CommandBufferEntry::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }
}

/// Maps small positive integer handles to transfer buffers.
///
/// Slot 0 is never used so that a zero handle is always invalid. Freed ids
/// are reused lowest-first, and trailing empty slots are trimmed on destroy.
#[derive(Debug)]
pub struct TransferBufferTable {
    slots: Vec<Option<TransferBuffer>>,
    free_ids: BTreeSet<i32>,
    max_id_request: i32,
}

impl TransferBufferTable {
    /// `max_id_request` is capped at [`MAX_ID_REQUEST_LIMIT`].
    pub fn new(max_id_request: i32) -> Self {
        Self {
            slots: vec![None],
            free_ids: BTreeSet::new(),
            max_id_request: max_id_request.min(MAX_ID_REQUEST_LIMIT),
        }
    }

    /// Allocate fresh shared memory of `size` bytes and register it.
    pub fn create(&mut self, size: usize, id_request: i32) -> Result<i32, TransferBufferError> {
        self.check_id_request(id_request)?;
        let shared_memory = SharedMemory::create_anonymous(size)?;
        self.register_handle(shared_memory.share()?, size, id_request)
    }

    /// Register `size` bytes of an existing shared memory segment.
    ///
    /// The segment's handle is duplicated; the caller keeps its own mapping.
    pub fn register(
        &mut self,
        shared_memory: &SharedMemory,
        size: usize,
        id_request: i32,
    ) -> Result<i32, TransferBufferError> {
        self.check_id_request(id_request)?;
        self.register_handle(shared_memory.share()?, size, id_request)
    }

    /// Map a handle received from another context and register the mapping.
    pub fn register_handle(
        &mut self,
        handle: SharedMemoryHandle,
        size: usize,
        id_request: i32,
    ) -> Result<i32, TransferBufferError> {
        self.check_id_request(id_request)?;
        let mapping = handle.map(size)?;
        let id = self.claim_id(id_request)?;
        let slot = usize::try_from(id).map_err(|_| TransferBufferError::IdsExhausted)?;
        self.slots[slot] = Some(TransferBuffer::new(mapping));
        tracing::debug!(id, size, "registered transfer buffer");
        Ok(id)
    }

    /// Remove the buffer registered under `id`. Returns whether one was registered.
    pub fn destroy(&mut self, id: i32) -> bool {
        let Some(slot) = self.slot_index(id) else {
            return false;
        };
        if self.slots[slot].take().is_none() {
            return false;
        }
        self.free_ids.insert(id);

        while self.slots.len() > 1 && matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
            let trimmed = self.slots.len() as i32;
            self.free_ids.remove(&trimmed);
        }
        tracing::debug!(id, "destroyed transfer buffer");
        true
    }

    pub fn get(&self, id: i32) -> Option<&TransferBuffer> {
        self.slots[self.slot_index(id)?].as_ref()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_id_request(&self, id_request: i32) -> Result<(), TransferBufferError> {
        if id_request != -1 && !(1..=self.max_id_request).contains(&id_request) {
            return Err(TransferBufferError::InvalidIdRequest {
                requested: id_request,
                max: self.max_id_request,
            });
        }
        if id_request > 0 && self.get(id_request).is_some() {
            return Err(TransferBufferError::IdInUse(id_request));
        }
        Ok(())
    }

    fn slot_index(&self, id: i32) -> Option<usize> {
        let slot = usize::try_from(id).ok()?;
        (slot > 0 && slot < self.slots.len()).then_some(slot)
    }

    fn claim_id(&mut self, id_request: i32) -> Result<i32, TransferBufferError> {
        if id_request == -1 {
            if let Some(id) = self.free_ids.pop_first() {
                return Ok(id);
            }
            let id = i32::try_from(self.slots.len()).map_err(|_| TransferBufferError::IdsExhausted)?;
            self.slots.push(None);
            return Ok(id);
        }

        let requested = id_request as usize;
        if requested < self.slots.len() {
            self.free_ids.remove(&id_request);
        } else {
            let first_new = self.slots.len() as i32;
            self.free_ids.extend(first_new..id_request);
            self.slots.resize_with(requested + 1, || None);
        }
        Ok(id_request)
    }
}
