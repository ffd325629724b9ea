use std::borrow::Cow;
use std::collections::{HashMap, TryReserveError};

/// A growable byte buffer used to stage variable-length command data.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bucket {
    data: Vec<u8>,
}

impl Bucket {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Resize to exactly `size` bytes. A size change discards the old
    /// contents and zero-fills; setting the current size is a no-op.
    pub fn set_size(&mut self, size: usize) -> Result<(), TryReserveError> {
        if size == self.data.len() {
            return Ok(());
        }
        let mut data = Vec::new();
        data.try_reserve_exact(size)?;
        data.resize(size, 0);
        self.data = data;
        Ok(())
    }

    /// Borrow `size` bytes at `offset`, or `None` if the range is not inside
    /// the bucket.
    pub fn get_data(&self, offset: usize, size: usize) -> Option<&[u8]> {
        let end = offset.checked_add(size)?;
        self.data.get(offset..end)
    }

    /// Copy `src` into the bucket at `offset`. Fails without writing anything
    /// if the range does not fit.
    pub fn set_data(&mut self, src: &[u8], offset: usize) -> bool {
        let Some(end) = offset.checked_add(src.len()) else {
            return false;
        };
        match self.data.get_mut(offset..end) {
            Some(dst) => {
                dst.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    /// Store `s` followed by a NUL terminator. `None` empties the bucket.
    pub fn set_from_string(&mut self, s: Option<&str>) {
        self.data.clear();
        if let Some(s) = s {
            self.data.reserve_exact(s.len() + 1);
            self.data.extend_from_slice(s.as_bytes());
            self.data.push(0);
        }
    }

    /// Contents without the trailing terminator; `None` for an empty bucket.
    pub fn get_as_string(&self) -> Option<Cow<'_, str>> {
        let (_terminator, bytes) = self.data.split_last()?;
        Some(String::from_utf8_lossy(bytes))
    }
}

/// Buckets addressed by client-chosen ids.
#[derive(Debug, Default)]
pub struct BucketStore {
    buckets: HashMap<u32, Bucket>,
}

impl BucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an existing bucket; never creates one.
    pub fn get(&self, bucket_id: u32) -> Option<&Bucket> {
        self.buckets.get(&bucket_id)
    }

    pub fn get_mut(&mut self, bucket_id: u32) -> Option<&mut Bucket> {
        self.buckets.get_mut(&bucket_id)
    }

    /// Return the bucket, creating an empty one if needed.
    pub fn create(&mut self, bucket_id: u32) -> &mut Bucket {
        self.buckets.entry(bucket_id).or_default()
    }

    pub fn set_size(&mut self, bucket_id: u32, size: usize) -> Result<(), TryReserveError> {
        self.create(bucket_id).set_size(size)
    }

    /// Fails if the bucket does not exist or the range does not fit.
    pub fn set_data(&mut self, bucket_id: u32, src: &[u8], offset: usize) -> bool {
        self.get_mut(bucket_id)
            .is_some_and(|bucket| bucket.set_data(src, offset))
    }

    pub fn get_data(&self, bucket_id: u32, offset: usize, size: usize) -> Option<&[u8]> {
        self.get(bucket_id)?.get_data(offset, size)
    }

    pub fn set_from_string(&mut self, bucket_id: u32, s: Option<&str>) {
        self.create(bucket_id).set_from_string(s);
    }

    pub fn get_as_string(&self, bucket_id: u32) -> Option<Cow<'_, str>> {
        self.get(bucket_id)?.get_as_string()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
