//! Fixed-width command entries and the packed command header.

use core::fmt;

/// Size of one [`CommandBufferEntry`] in bytes.
pub const ENTRY_SIZE: usize = 4;

/// One 32-bit slot of the command stream.
///
/// Entries are reinterpreted as `u32`, `i32` or `f32` depending on the command
/// argument they carry. Multi-byte values are little-endian in shared memory.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CommandBufferEntry(u32);

impl CommandBufferEntry {
    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn from_i32(v: i32) -> Self {
        Self(v as u32)
    }

    pub fn from_f32(v: f32) -> Self {
        Self(v.to_bits())
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_i32(self) -> i32 {
        self.0 as i32
    }

    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.0)
    }

    pub const fn to_le_bytes(self) -> [u8; ENTRY_SIZE] {
        self.0.to_le_bytes()
    }

    pub const fn from_le_bytes(bytes: [u8; ENTRY_SIZE]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}

impl fmt::Debug for CommandBufferEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Flatten entries into their little-endian byte representation.
pub fn entries_to_bytes(entries: &[CommandBufferEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * ENTRY_SIZE);
    for entry in entries {
        out.extend_from_slice(&entry.to_le_bytes());
    }
    out
}

/// Packed command header.
///
/// Layout (one `u32`):
/// - bits `0..21`: command size in entries, including the header itself
/// - bits `21..32`: command id
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandHeader {
    size: u32,
    command: u32,
}

impl CommandHeader {
    pub const SIZE_BITS: u32 = 21;
    pub const COMMAND_BITS: u32 = 11;
    /// Largest representable command size, in entries.
    pub const MAX_SIZE: u32 = (1 << Self::SIZE_BITS) - 1;
    /// Largest representable command id.
    pub const MAX_COMMAND: u32 = (1 << Self::COMMAND_BITS) - 1;

    /// Returns `None` if either field does not fit its bit range.
    pub const fn new(command: u32, size: u32) -> Option<Self> {
        if command > Self::MAX_COMMAND || size > Self::MAX_SIZE {
            return None;
        }
        Some(Self { size, command })
    }

    /// Header for a command made of the header plus `arg_count` argument entries.
    pub const fn for_args(command: u32, arg_count: u32) -> Option<Self> {
        match arg_count.checked_add(1) {
            Some(size) => Self::new(command, size),
            None => None,
        }
    }

    pub const fn from_entry(entry: CommandBufferEntry) -> Self {
        let v = entry.as_u32();
        Self {
            size: v & Self::MAX_SIZE,
            command: v >> Self::SIZE_BITS,
        }
    }

    pub const fn to_entry(self) -> CommandBufferEntry {
        CommandBufferEntry::from_u32((self.command << Self::SIZE_BITS) | self.size)
    }

    /// Total size in entries, header included.
    pub const fn size(self) -> u32 {
        self.size
    }

    pub const fn command(self) -> u32 {
        self.command
    }

    /// Number of entries following the header. Zero for a malformed size-0 header.
    pub const fn arg_count(self) -> u32 {
        self.size.saturating_sub(1)
    }
}
