use core::str;

use derivative::Derivative;
use sha2::{Digest, Sha256};
use static_assertions::const_assert_eq;
use subtle::ConstantTimeEq;

use crate::storage::Storage;
use crate::{read_u32_le, read_u64_le, PartfsError, PartfsResult};

/// Archive header common to both entry flavors: magic, entry count,
/// name table size, reserved word
pub(crate) const HEADER_SIZE: usize = 0x10;

/// Scratch chunk for streaming a hashed region through the digest.
/// Bounds memory use when hash targets are large; do not remove the
/// chunking, only the chunk size may grow.
const HASH_BUFFER_SIZE: usize = 0x200;

/// Capability over the two on-disk entry records.
///
/// The flat and hashed archives share one filesystem core; the record
/// layout, magic bytes and read path live behind this trait, so the
/// hashed logic is monomorphized out of flat-archive reads entirely.
pub trait PartitionEntry: Sized {
    /// Magic bytes introducing an archive of this flavor
    const MAGIC: [u8; 4];
    /// On-disk record size
    const SIZE: usize;

    fn parse(raw: &[u8]) -> Self;
    fn offset(&self) -> u64;
    fn size(&self) -> u64;
    fn name_offset(&self) -> u32;

    /// Reads `buf.len()` bytes of file content starting at file-relative
    /// `offset`. `entry_start` is the absolute storage offset of the
    /// file's first byte; the caller has already clamped `buf` to the
    /// entry size.
    fn read_data<S: Storage>(
        &self,
        storage: &S,
        entry_start: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> PartfsResult<()>;
}

/// 24-byte entry record of a flat `PFS0` archive
/// <https://switchbrew.org/wiki/NCA#PFS0>
#[derive(Debug, Clone, Copy)]
pub struct StandardEntry {
    offset: u64,
    size: u64,
    name_offset: u32,
}

const_assert_eq!(StandardEntry::SIZE, 0x18);

impl PartitionEntry for StandardEntry {
    const MAGIC: [u8; 4] = *b"PFS0";
    const SIZE: usize = 0x18;

    fn parse(raw: &[u8]) -> Self {
        Self {
            offset: read_u64_le(raw, 0),
            size: read_u64_le(raw, 8),
            name_offset: read_u32_le(raw, 16),
        }
    }
    fn offset(&self) -> u64 {
        self.offset
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn name_offset(&self) -> u32 {
        self.name_offset
    }

    fn read_data<S: Storage>(
        &self,
        storage: &S,
        entry_start: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> PartfsResult<()> {
        let read_offset = entry_start.checked_add(offset).ok_or(PartfsError::OutOfRange)?;
        storage.read(read_offset, buf)
    }
}

/// 64-byte entry record of a hashed `HFS0` archive. A declared region of
/// the file, starting at `hash_target_offset`, must match the recorded
/// SHA-256 digest before any overlapping read is released.
#[derive(Derivative, Clone, Copy)]
#[derivative(Debug)]
pub struct Sha256Entry {
    offset: u64,
    size: u64,
    name_offset: u32,
    hash_target_size: u32,
    hash_target_offset: u64,
    #[derivative(Debug = "ignore")]
    hash: [u8; 0x20],
}

const_assert_eq!(Sha256Entry::SIZE, 0x40);

impl Sha256Entry {
    /// Streams the whole hashed region through the digest in fixed-size
    /// chunks, copying the slice that overlaps the requested range into
    /// `buf` as it passes by.
    fn read_within_hash<S: Storage>(
        &self,
        storage: &S,
        entry_start: u64,
        read_offset: u64,
        buf: &mut [u8],
        generator: &mut Sha256,
    ) -> PartfsResult<()> {
        let mut chunk = [0u8; HASH_BUFFER_SIZE];
        let mut remaining_hash = u64::from(self.hash_target_size);
        let mut hash_offset = entry_start
            .checked_add(self.hash_target_offset)
            .ok_or(PartfsError::OutOfRange)?;
        let mut remaining = buf.len();
        let mut copied = 0usize;

        while remaining_hash > 0 {
            let cur = usize::try_from(remaining_hash.min(HASH_BUFFER_SIZE as u64))
                .map_err(|_| PartfsError::OutOfRange)?;
            storage.read(hash_offset, &mut chunk[..cur])?;
            generator.update(&chunk[..cur]);

            if read_offset <= hash_offset + cur as u64 && remaining > 0 {
                let skip = usize::try_from(read_offset.saturating_sub(hash_offset))
                    .map_err(|_| PartfsError::OutOfRange)?;
                if skip < cur {
                    let copy = (cur - skip).min(remaining);
                    buf[copied..copied + copy].copy_from_slice(&chunk[skip..skip + copy]);
                    remaining -= copy;
                    copied += copy;
                }
            }

            remaining_hash -= cur as u64;
            hash_offset += cur as u64;
        }
        Ok(())
    }

    fn read_hashed<S: Storage>(
        &self,
        storage: &S,
        entry_start: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> PartfsResult<()> {
        let read_end = offset + buf.len() as u64;
        let hash_start = self.hash_target_offset;

        // Only hash-from-start targets are supported.
        if hash_start != 0 {
            return Err(PartfsError::InvalidSha256PartitionHashTarget);
        }
        let hash_end = hash_start
            .checked_add(u64::from(self.hash_target_size))
            .ok_or(PartfsError::InvalidSha256PartitionHashTarget)?;
        if hash_end > self.size {
            return Err(PartfsError::InvalidSha256PartitionHashTarget);
        }

        let read_offset = entry_start.checked_add(offset).ok_or(PartfsError::OutOfRange)?;

        let hash_in_read = offset <= hash_start && hash_end <= read_end;
        let read_in_hash = hash_start <= offset && read_end <= hash_end;
        if !hash_in_read && !read_in_hash {
            return Err(PartfsError::InvalidSha256PartitionHashTarget);
        }

        let mut generator = Sha256::new();
        if hash_in_read {
            // The whole hashed region sits inside the request.
            storage.read(read_offset, buf)?;
            let skip = usize::try_from(hash_start - offset).map_err(|_| PartfsError::OutOfRange)?;
            generator.update(&buf[skip..skip + self.hash_target_size as usize]);
        } else {
            self.read_within_hash(storage, entry_start, read_offset, buf, &mut generator)?;
        }

        let digest = generator.finalize();
        if bool::from(digest.as_slice().ct_eq(&self.hash)) {
            Ok(())
        } else {
            Err(PartfsError::Sha256PartitionHashVerificationFailed)
        }
    }
}

impl PartitionEntry for Sha256Entry {
    const MAGIC: [u8; 4] = *b"HFS0";
    const SIZE: usize = 0x40;

    fn parse(raw: &[u8]) -> Self {
        let mut hash = [0u8; 0x20];
        hash.copy_from_slice(&raw[0x20..0x40]);
        Self {
            offset: read_u64_le(raw, 0),
            size: read_u64_le(raw, 8),
            name_offset: read_u32_le(raw, 16),
            hash_target_size: read_u32_le(raw, 20),
            hash_target_offset: read_u64_le(raw, 24),
            hash,
        }
    }
    fn offset(&self) -> u64 {
        self.offset
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn name_offset(&self) -> u32 {
        self.name_offset
    }

    fn read_data<S: Storage>(
        &self,
        storage: &S,
        entry_start: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> PartfsResult<()> {
        let read_end = offset + buf.len() as u64;
        let hash_start = self.hash_target_offset;
        let hash_end = hash_start.saturating_add(u64::from(self.hash_target_size));

        // Disjoint reads skip the digest entirely; this is the hot case.
        if read_end <= hash_start || hash_end <= offset {
            let read_offset = entry_start.checked_add(offset).ok_or(PartfsError::OutOfRange)?;
            return storage.read(read_offset, buf);
        }

        // No byte leaves this function unverified: any failure past this
        // point clears the destination.
        match self.read_hashed(storage, entry_start, offset, buf) {
            Ok(()) => Ok(()),
            Err(err) => {
                buf.fill(0);
                Err(err)
            }
        }
    }
}

/// Parsed header, entry table and name pool of a partition archive.
///
/// Entries are immutable once parsed; file data begins at
/// [`get_meta_data_size`](Self::get_meta_data_size) within the storage.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct PartitionFileSystemMeta<E: PartitionEntry> {
    entries: Vec<E>,
    #[derivative(Debug = "ignore")]
    name_table: Vec<u8>,
    meta_data_size: u64,
}

impl<E: PartitionEntry> PartitionFileSystemMeta<E> {
    /// Parses the archive metadata from the head of `storage`
    pub fn initialize<S: Storage>(storage: &S) -> PartfsResult<Self> {
        let storage_size = storage.size()?;

        let mut header = [0u8; HEADER_SIZE];
        read_meta(storage, 0, &mut header)?;
        if header[..4] != E::MAGIC {
            return Err(PartfsError::InvalidPartitionFileSystem);
        }
        let entry_count = read_u32_le(&header, 4) as usize;
        let name_table_size = read_u32_le(&header, 8) as usize;

        let table_size = entry_count
            .checked_mul(E::SIZE)
            .ok_or(PartfsError::InvalidPartitionFileSystem)?;
        let body_size = table_size
            .checked_add(name_table_size)
            .ok_or(PartfsError::InvalidPartitionFileSystem)?;
        let meta_data_size = (HEADER_SIZE as u64)
            .checked_add(body_size as u64)
            .ok_or(PartfsError::InvalidPartitionFileSystem)?;
        if meta_data_size > storage_size {
            return Err(PartfsError::InvalidPartitionFileSystem);
        }

        let mut body = Vec::new();
        body.try_reserve_exact(body_size)
            .map_err(|_| PartfsError::AllocationFailureA)?;
        body.resize(body_size, 0);
        read_meta(storage, HEADER_SIZE as u64, &mut body)?;
        let name_table = body.split_off(table_size);

        let mut entries = Vec::new();
        entries
            .try_reserve_exact(entry_count)
            .map_err(|_| PartfsError::AllocationFailureA)?;
        let data_size = storage_size - meta_data_size;
        for raw in body.chunks_exact(E::SIZE) {
            let entry = E::parse(raw);
            let end = entry
                .offset()
                .checked_add(entry.size())
                .ok_or(PartfsError::InvalidPartitionFileSystem)?;
            if end > data_size || (entry.name_offset() as usize) >= name_table_size {
                return Err(PartfsError::InvalidPartitionFileSystem);
            }
            entries.push(entry);
        }

        Ok(Self {
            entries,
            name_table,
            meta_data_size,
        })
    }

    /// Linear scan over the entry table; archives are flat and small
    #[must_use]
    pub fn get_entry_index(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| self.name_bytes_at(e.name_offset()) == Some(name.as_bytes()))
    }

    #[must_use]
    pub fn get_entry(&self, index: usize) -> Option<&E> {
        self.entries.get(index)
    }

    pub fn get_entry_name(&self, index: usize) -> PartfsResult<&str> {
        let entry = self.entries.get(index).ok_or(PartfsError::OutOfRange)?;
        let bytes = self
            .name_bytes_at(entry.name_offset())
            .ok_or(PartfsError::InvalidPartitionFileSystem)?;
        str::from_utf8(bytes).map_err(|_| PartfsError::InvalidPartitionFileSystem)
    }

    #[must_use]
    pub fn get_entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Byte count of header, entry table and name pool; file data begins
    /// at this storage offset
    #[must_use]
    pub fn get_meta_data_size(&self) -> u64 {
        self.meta_data_size
    }

    fn name_bytes_at(&self, name_offset: u32) -> Option<&[u8]> {
        let rest = self.name_table.get(name_offset as usize..)?;
        let nul = rest.iter().position(|&b| b == 0)?;
        Some(&rest[..nul])
    }
}

/// Storage truncation while parsing metadata means a malformed image,
/// not a caller range error.
fn read_meta<S: Storage>(storage: &S, offset: u64, buf: &mut [u8]) -> PartfsResult<()> {
    storage.read(offset, buf).map_err(|err| match err {
        PartfsError::OutOfRange => PartfsError::InvalidPartitionFileSystem,
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::{PartitionEntry, PartitionFileSystemMeta, StandardEntry};
    use crate::storage::MemStorage;
    use crate::PartfsError;

    fn header(magic: &[u8; 4], entry_count: u32, name_table_size: u32) -> Vec<u8> {
        let mut image = Vec::new();
        image.extend_from_slice(magic);
        image.extend_from_slice(&entry_count.to_le_bytes());
        image.extend_from_slice(&name_table_size.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image
    }

    #[test]
    fn rejects_bad_magic() {
        let storage = MemStorage::new(header(b"QFS0", 0, 0));
        assert_eq!(
            PartitionFileSystemMeta::<StandardEntry>::initialize(&storage).unwrap_err(),
            PartfsError::InvalidPartitionFileSystem,
        );
    }

    #[test]
    fn rejects_truncated_image() {
        let storage = MemStorage::new(b"PFS0\x01".to_vec());
        assert_eq!(
            PartitionFileSystemMeta::<StandardEntry>::initialize(&storage).unwrap_err(),
            PartfsError::InvalidPartitionFileSystem,
        );

        // Header claims more entries than the image holds.
        let storage = MemStorage::new(header(b"PFS0", 4, 0));
        assert_eq!(
            PartitionFileSystemMeta::<StandardEntry>::initialize(&storage).unwrap_err(),
            PartfsError::InvalidPartitionFileSystem,
        );
    }

    #[test]
    fn rejects_entry_past_data_region() {
        let mut image = header(b"PFS0", 1, 8);
        image.extend_from_slice(&4u64.to_le_bytes()); // offset
        image.extend_from_slice(&16u64.to_le_bytes()); // size, past the 8-byte data region
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(b"HELLO\0\0\0");
        image.extend_from_slice(&[0u8; 8]);
        let storage = MemStorage::new(image);
        assert_eq!(
            PartitionFileSystemMeta::<StandardEntry>::initialize(&storage).unwrap_err(),
            PartfsError::InvalidPartitionFileSystem,
        );
    }

    #[test]
    fn parses_entry_and_name_pool() {
        let mut image = header(b"PFS0", 1, 8);
        image.extend_from_slice(&0u64.to_le_bytes());
        image.extend_from_slice(&5u64.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(b"HELLO\0\0\0");
        image.extend_from_slice(b"world");
        let storage = MemStorage::new(image);

        let meta = PartitionFileSystemMeta::<StandardEntry>::initialize(&storage).unwrap();
        assert_eq!(meta.get_entry_count(), 1);
        assert_eq!(meta.get_meta_data_size(), 0x10 + 0x18 + 8);
        assert_eq!(meta.get_entry_index("HELLO"), Some(0));
        assert_eq!(meta.get_entry_index("HELL"), None);
        assert_eq!(meta.get_entry_name(0).unwrap(), "HELLO");
        let entry = meta.get_entry(0).unwrap();
        assert_eq!((entry.offset(), entry.size()), (0, 5));
    }
}
