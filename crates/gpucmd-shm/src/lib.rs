//! File-backed shared memory for transfer buffers.
//!
//! The creating side owns a [`SharedMemory`]. Handing the memory to another
//! process context is an explicit capability transfer: [`SharedMemory::share`]
//! duplicates the OS handle into an owned [`SharedMemoryHandle`], and
//! [`SharedMemoryHandle::map`] consumes that handle to produce a
//! [`SharedMapping`] whose lifetime is independent of the creator. Dropping the
//! creator does not invalidate mappings made from shared handles.
//!
//! Both sides see the same bytes. Access goes through bounds-checked copies
//! because the other party may write the region at any time.

use std::fs::File;
use std::io;

use memmap2::{MmapOptions, MmapRaw};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared memory size must be > 0")]
    ZeroSize,

    #[error("mapping size {requested} exceeds backing object size {available}")]
    SizeExceedsBackingObject { requested: u64, available: u64 },

    #[error("access out of bounds: offset={offset} len={len} size={size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("shared memory io error: {0}")]
    Io(#[from] io::Error),
}

/// Mapped byte range with bounds-checked copy access.
struct Region {
    map: MmapRaw,
    len: usize,
}

impl Region {
    fn map(file: &File, len: usize) -> Result<Self, ShmError> {
        if len == 0 {
            return Err(ShmError::ZeroSize);
        }
        let available = file.metadata()?.len();
        if len as u64 > available {
            return Err(ShmError::SizeExceedsBackingObject {
                requested: len as u64,
                available,
            });
        }
        let map = MmapOptions::new().len(len).map_raw(file)?;
        Ok(Self { map, len })
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), ShmError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(ShmError::OutOfBounds {
                offset,
                len,
                size: self.len,
            }),
        }
    }

    fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), ShmError> {
        self.check(offset, dst.len())?;
        // SAFETY: the range was bounds-checked against the live mapping and `dst` is a
        // distinct, caller-owned buffer.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.map.as_ptr().add(offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    fn write(&self, offset: usize, src: &[u8]) -> Result<(), ShmError> {
        self.check(offset, src.len())?;
        // SAFETY: as in `read`; the mapping is writable (PROT_READ | PROT_WRITE).
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.map.as_mut_ptr().add(offset),
                src.len(),
            );
        }
        Ok(())
    }
}

macro_rules! region_accessors {
    ($ty:ty) => {
        impl $ty {
            /// Size of the mapping in bytes.
            pub fn size(&self) -> usize {
                self.region.len
            }

            /// True if `[offset, offset + len)` lies inside the mapping.
            pub fn contains(&self, offset: usize, len: usize) -> bool {
                self.region.check(offset, len).is_ok()
            }

            pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), ShmError> {
                self.region.read(offset, dst)
            }

            pub fn write(&self, offset: usize, src: &[u8]) -> Result<(), ShmError> {
                self.region.write(offset, src)
            }

            pub fn read_u32(&self, offset: usize) -> Result<u32, ShmError> {
                let mut buf = [0u8; 4];
                self.region.read(offset, &mut buf)?;
                Ok(u32::from_le_bytes(buf))
            }

            pub fn write_u32(&self, offset: usize, v: u32) -> Result<(), ShmError> {
                self.region.write(offset, &v.to_le_bytes())
            }
        }
    };
}

/// Shared memory owned by the side that created it.
pub struct SharedMemory {
    file: File,
    region: Region,
}

impl SharedMemory {
    /// Create an anonymous, zero-filled segment of `size` bytes.
    pub fn create_anonymous(size: usize) -> Result<Self, ShmError> {
        if size == 0 {
            return Err(ShmError::ZeroSize);
        }
        let file = tempfile::tempfile()?;
        file.set_len(size as u64)?;
        let region = Region::map(&file, size)?;
        tracing::trace!(size, "created anonymous shared memory");
        Ok(Self { file, region })
    }

    /// Duplicate the underlying handle for transfer to another context.
    pub fn share(&self) -> Result<SharedMemoryHandle, ShmError> {
        Ok(SharedMemoryHandle {
            file: self.file.try_clone()?,
        })
    }
}

region_accessors!(SharedMemory);

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("size", &self.region.len)
            .finish_non_exhaustive()
    }
}

/// An owned, not-yet-mapped handle to shared memory.
#[derive(Debug)]
pub struct SharedMemoryHandle {
    file: File,
}

impl SharedMemoryHandle {
    /// Wrap an already-duplicated OS handle (e.g. one received over IPC).
    pub fn from_file(file: File) -> Self {
        Self { file }
    }

    pub fn try_clone(&self) -> Result<Self, ShmError> {
        Ok(Self {
            file: self.file.try_clone()?,
        })
    }

    /// Map `size` bytes of the memory, consuming the handle.
    ///
    /// Fails if `size` is zero or larger than the backing object.
    pub fn map(self, size: usize) -> Result<SharedMapping, ShmError> {
        let region = Region::map(&self.file, size)?;
        Ok(SharedMapping {
            _file: self.file,
            region,
        })
    }
}

/// A mapping owned by the receiving side of a capability transfer.
pub struct SharedMapping {
    _file: File,
    region: Region,
}

region_accessors!(SharedMapping);

impl std::fmt::Debug for SharedMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMapping")
            .field("size", &self.region.len)
            .finish_non_exhaustive()
    }
}
