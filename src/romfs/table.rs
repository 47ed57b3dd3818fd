//! Persistent path index of a ROM image.
//!
//! The table lives at the head of the image as four contiguous blobs:
//! directory buckets, directory entries, file buckets and file entries.
//! Buckets are `u32` heads of chains keyed by `(parent, name)`; entries
//! are variable-length records carrying their link fields, an inline name
//! and, for files, the data location. `u32::MAX` is the nil reference in
//! every link field. Record ids are byte offsets into their blob; the
//! root directory is the record at offset 0.

use crate::fs::{self, DirectoryEntry, DirectoryEntryType};
use crate::storage::Storage;
use crate::{read_u32_le, read_u64_le, PartfsError, PartfsResult};

use static_assertions::const_assert_eq;

pub(crate) const HEADER_SIZE: usize = 0x50;
const_assert_eq!(HEADER_SIZE, 8 * 10);

/// Nil link
const NIL: u32 = u32::MAX;

/// Fixed part of a directory entry record: parent, sibling, first child
/// directory, first child file, bucket chain link, name length
const DIR_ENTRY_BASE: usize = 0x18;
/// Fixed part of a file entry record: parent, sibling, data offset,
/// data size, bucket chain link, name length
const FILE_ENTRY_BASE: usize = 0x20;

const ROOT_DIRECTORY: u32 = 0;

/// Bucket hash over `(parent, name)`: the parent id scaled by 37, then
/// FNV-1a folded over the name bytes. This choice is frozen; images and
/// lookups must agree on it.
pub(crate) fn entry_hash(parent: u32, name: &[u8]) -> u32 {
    let mut hash = parent.wrapping_mul(37);
    for &b in name {
        hash = (hash ^ u32::from(b)).wrapping_mul(0x0100_0193);
    }
    hash
}

#[derive(Debug, Clone, Copy)]
struct Region {
    offset: u64,
    size: u64,
}

#[derive(Debug, Clone, Copy)]
struct TableHeader {
    dir_buckets: Region,
    dir_entries: Region,
    file_buckets: Region,
    file_entries: Region,
    file_data_offset: u64,
}

impl TableHeader {
    fn parse<S: Storage>(storage: &S) -> PartfsResult<Self> {
        let mut raw = [0u8; HEADER_SIZE];
        read_table(storage, 0, &mut raw)?;
        if read_u64_le(&raw, 0) != HEADER_SIZE as u64 {
            return Err(PartfsError::InvalidPartitionFileSystem);
        }
        let region = |at: usize| Region {
            offset: read_u64_le(&raw, at),
            size: read_u64_le(&raw, at + 8),
        };
        Ok(Self {
            dir_buckets: region(8),
            dir_entries: region(24),
            file_buckets: region(40),
            file_entries: region(56),
            file_data_offset: read_u64_le(&raw, 72),
        })
    }

    fn working_memory_size(&self) -> PartfsResult<u64> {
        self.dir_buckets
            .size
            .checked_add(self.dir_entries.size)
            .and_then(|v| v.checked_add(self.file_buckets.size))
            .and_then(|v| v.checked_add(self.file_entries.size))
            .ok_or(PartfsError::InvalidPartitionFileSystem)
    }
}

/// Location of a file's content within the image data region
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    /// Offset relative to the start of the file data region
    pub data_offset: u64,
    pub data_size: u64,
}

/// Enumeration cursor of an opened directory
#[derive(Debug, Clone, Copy)]
pub struct FindPosition {
    pub(crate) next_dir: u32,
    pub(crate) next_file: u32,
}

impl FindPosition {
    /// Drops the entry kinds the open mode did not request
    pub(crate) fn filtered(mut self, directories: bool, files: bool) -> Self {
        if !directories {
            self.next_dir = NIL;
        }
        if !files {
            self.next_file = NIL;
        }
        self
    }
}

struct RomDirectoryEntry<'a> {
    parent: u32,
    sibling: u32,
    child: u32,
    file: u32,
    next: u32,
    name: &'a [u8],
}

struct RomFileEntry<'a> {
    parent: u32,
    sibling: u32,
    data_offset: u64,
    data_size: u64,
    next: u32,
    name: &'a [u8],
}

/// In-memory copy of the four table blobs, plus the data region offset.
///
/// The blobs are bounded by
/// [`Self::get_required_working_memory_size`]; everything else in the
/// image is file content read on demand.
pub struct HierarchicalRomFileTable {
    dir_buckets: Vec<u32>,
    dir_entries: Vec<u8>,
    file_buckets: Vec<u32>,
    file_entries: Vec<u8>,
    file_data_offset: u64,
}

impl HierarchicalRomFileTable {
    /// Bytes of working memory needed to hold the four table blobs of the
    /// image in `storage`
    pub fn get_required_working_memory_size<S: Storage>(storage: &S) -> PartfsResult<u64> {
        TableHeader::parse(storage)?.working_memory_size()
    }

    pub fn initialize<S: Storage>(storage: &S) -> PartfsResult<Self> {
        let header = TableHeader::parse(storage)?;
        let storage_size = storage.size()?;
        let end_of_blobs = [
            header.dir_buckets,
            header.dir_entries,
            header.file_buckets,
            header.file_entries,
        ]
        .iter()
        .try_fold(HEADER_SIZE as u64, |acc, region| {
            let end = region
                .offset
                .checked_add(region.size)
                .ok_or(PartfsError::InvalidPartitionFileSystem)?;
            if region.offset < HEADER_SIZE as u64 || end > storage_size {
                return Err(PartfsError::InvalidPartitionFileSystem);
            }
            Ok(acc.max(end))
        })?;
        if header.file_data_offset < end_of_blobs || header.file_data_offset > storage_size {
            return Err(PartfsError::InvalidPartitionFileSystem);
        }

        // Entry records are padded to word alignment, so the blobs are too.
        if header.dir_entries.size % 4 != 0 || header.file_entries.size % 4 != 0 {
            return Err(PartfsError::InvalidPartitionFileSystem);
        }

        let dir_buckets = read_bucket_blob(storage, header.dir_buckets)?;
        let dir_entries = read_entry_blob(storage, header.dir_entries)?;
        let file_buckets = read_bucket_blob(storage, header.file_buckets)?;
        let file_entries = read_entry_blob(storage, header.file_entries)?;

        let table = Self {
            dir_buckets,
            dir_entries,
            file_buckets,
            file_entries,
            file_data_offset: header.file_data_offset,
        };
        // The root record must exist and be self-parented.
        let root = table.dir_entry(ROOT_DIRECTORY)?;
        if root.parent != ROOT_DIRECTORY {
            return Err(PartfsError::InvalidPartitionFileSystem);
        }
        Ok(table)
    }

    /// Absolute storage offset at which file content begins
    #[must_use]
    pub fn file_data_offset(&self) -> u64 {
        self.file_data_offset
    }

    pub fn get_entry_type(&self, path: &str) -> PartfsResult<DirectoryEntryType> {
        let (parent, name) = self.walk_to_parent(path)?;
        if name.is_empty() {
            return Ok(DirectoryEntryType::Directory);
        }
        if self.find_directory_entry(parent, name.as_bytes())?.is_some() {
            return Ok(DirectoryEntryType::Directory);
        }
        if self.find_file_entry(parent, name.as_bytes())?.is_some() {
            return Ok(DirectoryEntryType::File);
        }
        Err(PartfsError::PathNotFound)
    }

    pub fn open_file(&self, path: &str) -> PartfsResult<FileInfo> {
        let (parent, name) = self.walk_to_parent(path)?;
        if name.is_empty() {
            return Err(PartfsError::PathNotFound);
        }
        let id = self
            .find_file_entry(parent, name.as_bytes())?
            .ok_or(PartfsError::PathNotFound)?;
        let entry = self.file_entry(id)?;
        Ok(FileInfo {
            data_offset: entry.data_offset,
            data_size: entry.data_size,
        })
    }

    pub fn open_directory(&self, path: &str) -> PartfsResult<FindPosition> {
        let (parent, name) = self.walk_to_parent(path)?;
        // An empty final component ("/", or a trailing separator) names
        // the directory already walked.
        let id = if name.is_empty() {
            parent
        } else {
            self.find_directory_entry(parent, name.as_bytes())?
                .ok_or(PartfsError::PathNotFound)?
        };
        let entry = self.dir_entry(id)?;
        Ok(FindPosition {
            next_dir: entry.child,
            next_file: entry.file,
        })
    }

    /// Emits the next batch of children: directories first, then files,
    /// both in insertion order. The cursor advances so repeated calls
    /// stream the listing exactly once.
    pub fn read_directory(
        &self,
        position: &mut FindPosition,
        entries: &mut [DirectoryEntry],
    ) -> PartfsResult<usize> {
        let mut count = 0;
        while count < entries.len() && position.next_dir != NIL {
            let entry = self.dir_entry(position.next_dir)?;
            entries[count] = DirectoryEntry::new(DirectoryEntryType::Directory, 0, entry.name);
            position.next_dir = entry.sibling;
            count += 1;
        }
        while count < entries.len() && position.next_file != NIL {
            let entry = self.file_entry(position.next_file)?;
            entries[count] =
                DirectoryEntry::new(DirectoryEntryType::File, entry.data_size, entry.name);
            position.next_file = entry.sibling;
            count += 1;
        }
        Ok(count)
    }

    /// Children reachable from `position`, without advancing it
    pub fn count_entries(&self, mut position: FindPosition) -> PartfsResult<u64> {
        let mut count = 0u64;
        let mut steps = self.max_dir_chain();
        while position.next_dir != NIL {
            steps = steps.checked_sub(1).ok_or(PartfsError::InvalidPartitionFileSystem)?;
            position.next_dir = self.dir_entry(position.next_dir)?.sibling;
            count += 1;
        }
        let mut steps = self.max_file_chain();
        while position.next_file != NIL {
            steps = steps.checked_sub(1).ok_or(PartfsError::InvalidPartitionFileSystem)?;
            position.next_file = self.file_entry(position.next_file)?.sibling;
            count += 1;
        }
        Ok(count)
    }

    fn walk_to_parent<'p>(&self, path: &'p str) -> PartfsResult<(u32, &'p str)> {
        fs::check_path_format(path)?;
        let rel = &path[1..];
        match rel.rsplit_once('/') {
            None => Ok((ROOT_DIRECTORY, rel)),
            Some((dirs, last)) => {
                let mut dir = ROOT_DIRECTORY;
                for component in dirs.split('/') {
                    dir = self
                        .find_directory_entry(dir, component.as_bytes())?
                        .ok_or(PartfsError::PathNotFound)?;
                }
                Ok((dir, last))
            }
        }
    }

    fn find_directory_entry(&self, parent: u32, name: &[u8]) -> PartfsResult<Option<u32>> {
        if self.dir_buckets.is_empty() {
            return Ok(None);
        }
        let bucket = entry_hash(parent, name) as usize % self.dir_buckets.len();
        let mut id = self.dir_buckets[bucket];
        let mut steps = self.max_dir_chain();
        while id != NIL {
            steps = steps.checked_sub(1).ok_or(PartfsError::InvalidPartitionFileSystem)?;
            let entry = self.dir_entry(id)?;
            if entry.parent == parent && entry.name == name {
                return Ok(Some(id));
            }
            id = entry.next;
        }
        Ok(None)
    }

    fn find_file_entry(&self, parent: u32, name: &[u8]) -> PartfsResult<Option<u32>> {
        if self.file_buckets.is_empty() {
            return Ok(None);
        }
        let bucket = entry_hash(parent, name) as usize % self.file_buckets.len();
        let mut id = self.file_buckets[bucket];
        let mut steps = self.max_file_chain();
        while id != NIL {
            steps = steps.checked_sub(1).ok_or(PartfsError::InvalidPartitionFileSystem)?;
            let entry = self.file_entry(id)?;
            if entry.parent == parent && entry.name == name {
                return Ok(Some(id));
            }
            id = entry.next;
        }
        Ok(None)
    }

    fn dir_entry(&self, id: u32) -> PartfsResult<RomDirectoryEntry<'_>> {
        let base = id as usize;
        let raw = self
            .dir_entries
            .get(base..base + DIR_ENTRY_BASE)
            .ok_or(PartfsError::InvalidPartitionFileSystem)?;
        let name_len = read_u32_le(raw, 20) as usize;
        // The record, padding included, must fit its blob.
        let name = self
            .dir_entries
            .get(base + DIR_ENTRY_BASE..base + DIR_ENTRY_BASE + padded_name_len(name_len))
            .map(|padded| &padded[..name_len])
            .ok_or(PartfsError::InvalidPartitionFileSystem)?;
        Ok(RomDirectoryEntry {
            parent: read_u32_le(raw, 0),
            sibling: read_u32_le(raw, 4),
            child: read_u32_le(raw, 8),
            file: read_u32_le(raw, 12),
            next: read_u32_le(raw, 16),
            name,
        })
    }

    fn file_entry(&self, id: u32) -> PartfsResult<RomFileEntry<'_>> {
        let base = id as usize;
        let raw = self
            .file_entries
            .get(base..base + FILE_ENTRY_BASE)
            .ok_or(PartfsError::InvalidPartitionFileSystem)?;
        let name_len = read_u32_le(raw, 28) as usize;
        let name = self
            .file_entries
            .get(base + FILE_ENTRY_BASE..base + FILE_ENTRY_BASE + padded_name_len(name_len))
            .map(|padded| &padded[..name_len])
            .ok_or(PartfsError::InvalidPartitionFileSystem)?;
        Ok(RomFileEntry {
            parent: read_u32_le(raw, 0),
            sibling: read_u32_le(raw, 4),
            data_offset: read_u64_le(raw, 8),
            data_size: read_u64_le(raw, 16),
            next: read_u32_le(raw, 24),
            name,
        })
    }

    /// Upper bounds on chain walks; a longer chain means a cycle in a
    /// corrupt image.
    fn max_dir_chain(&self) -> usize {
        self.dir_entries.len() / DIR_ENTRY_BASE + 1
    }
    fn max_file_chain(&self) -> usize {
        self.file_entries.len() / FILE_ENTRY_BASE + 1
    }
}

fn read_bucket_blob<S: Storage>(storage: &S, region: Region) -> PartfsResult<Vec<u32>> {
    if region.size % 4 != 0 {
        return Err(PartfsError::InvalidPartitionFileSystem);
    }
    let raw = read_entry_blob(storage, region)?;
    let mut buckets = Vec::new();
    buckets
        .try_reserve_exact(raw.len() / 4)
        .map_err(|_| PartfsError::AllocationFailureA)?;
    buckets.extend(raw.chunks_exact(4).map(|c| read_u32_le(c, 0)));
    Ok(buckets)
}

fn read_entry_blob<S: Storage>(storage: &S, region: Region) -> PartfsResult<Vec<u8>> {
    let size = usize::try_from(region.size).map_err(|_| PartfsError::InvalidPartitionFileSystem)?;
    let mut blob = Vec::new();
    blob.try_reserve_exact(size)
        .map_err(|_| PartfsError::AllocationFailureA)?;
    blob.resize(size, 0);
    read_table(storage, region.offset, &mut blob)?;
    Ok(blob)
}

/// Truncation while reading the table means a malformed image
fn read_table<S: Storage>(storage: &S, offset: u64, buf: &mut [u8]) -> PartfsResult<()> {
    storage.read(offset, buf).map_err(|err| match err {
        PartfsError::OutOfRange => PartfsError::InvalidPartitionFileSystem,
        other => other,
    })
}

/// Record sizes are padded to word alignment
pub(crate) fn padded_name_len(name_len: usize) -> usize {
    crate::align_up(name_len as u64, 4) as usize
}

#[cfg(test)]
mod tests {
    use super::{entry_hash, padded_name_len};

    #[test]
    fn hash_mixes_parent_and_name() {
        assert_eq!(entry_hash(0, b""), 0);
        assert_ne!(entry_hash(0, b"a"), entry_hash(0, b"b"));
        assert_ne!(entry_hash(0, b"a"), entry_hash(24, b"a"));
        // FNV-1a over a single byte, seeded with parent * 37.
        assert_eq!(entry_hash(0, b"a"), (0u32 ^ u32::from(b'a')).wrapping_mul(16_777_619));
    }

    #[test]
    fn names_pad_to_word_alignment() {
        assert_eq!(padded_name_len(0), 0);
        assert_eq!(padded_name_len(1), 4);
        assert_eq!(padded_name_len(4), 4);
        assert_eq!(padded_name_len(5), 8);
    }
}
