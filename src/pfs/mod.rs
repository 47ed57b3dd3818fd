//! Flat partition archive filesystems.
//!
//! A `PFS0` image is a flat list of named files packed behind a small
//! metadata block; `HFS0` is the same layout with a SHA-256 digest over a
//! declared region of each file. Both are exposed through the read-only
//! [`FileSystem`] contract; every mutation fails with a dedicated error.

pub mod meta;

use crate::fs::{
    self, Directory, DirectoryEntry, DirectoryEntryType, File, FileSystem, OpenDirectoryMode,
    OpenMode,
};
use crate::storage::{OperationId, Storage};
use crate::{PartfsError, PartfsResult};

pub use meta::{PartitionEntry, PartitionFileSystemMeta, Sha256Entry, StandardEntry};

/// Flat archive without content hashes
pub type PartitionFileSystem<S> = PartitionFileSystemCore<StandardEntry, S>;
/// Archive whose entries carry a SHA-256 digest over a declared region
pub type Sha256PartitionFileSystem<S> = PartitionFileSystemCore<Sha256Entry, S>;

struct Bound<E: PartitionEntry, S: Storage> {
    meta: PartitionFileSystemMeta<E>,
    storage: S,
}

/// Filesystem over a flat partition archive, generic over the entry
/// flavor and the backing storage.
///
/// An instance starts unbound; [`initialize`](Self::initialize) parses the
/// metadata and binds the storage. Handles borrow the filesystem, so the
/// image outlives every open file and directory.
pub struct PartitionFileSystemCore<E: PartitionEntry, S: Storage> {
    state: Option<Bound<E, S>>,
}

impl<E: PartitionEntry, S: Storage> PartitionFileSystemCore<E, S> {
    #[must_use]
    pub fn new() -> Self {
        Self { state: None }
    }

    /// Parses the archive metadata and binds `storage`. A bound instance
    /// rejects a second call.
    pub fn initialize(&mut self, storage: S) -> PartfsResult<()> {
        if self.state.is_some() {
            return Err(PartfsError::PreconditionViolation);
        }
        let meta = PartitionFileSystemMeta::initialize(&storage)?;
        self.state = Some(Bound { meta, storage });
        Ok(())
    }

    /// Binds pre-parsed metadata and `storage` without re-reading the header
    pub fn initialize_with_meta(
        &mut self,
        meta: PartitionFileSystemMeta<E>,
        storage: S,
    ) -> PartfsResult<()> {
        if self.state.is_some() {
            return Err(PartfsError::PreconditionViolation);
        }
        self.state = Some(Bound { meta, storage });
        Ok(())
    }

    fn bound(&self) -> PartfsResult<&Bound<E, S>> {
        self.state.as_ref().ok_or(PartfsError::PreconditionViolation)
    }

    pub fn get_entry_type(&self, path: &str) -> PartfsResult<DirectoryEntryType> {
        let bound = self.bound()?;
        fs::check_path_format(path)?;
        if path == fs::ROOT_PATH {
            return Ok(DirectoryEntryType::Directory);
        }
        if bound.meta.get_entry_index(&path[1..]).is_some() {
            Ok(DirectoryEntryType::File)
        } else {
            Err(PartfsError::PathNotFound)
        }
    }

    /// Opens `path` for reading. Write modes are accepted here; the
    /// archive is immutable, so the write itself is what fails.
    pub fn open_file(&self, path: &str, mode: OpenMode) -> PartfsResult<PartitionFile<'_, E, S>> {
        let bound = self.bound()?;
        fs::check_path_format(path)?;
        let index = bound
            .meta
            .get_entry_index(&path[1..])
            .ok_or(PartfsError::PathNotFound)?;
        let entry = bound.meta.get_entry(index).ok_or(PartfsError::PathNotFound)?;
        Ok(PartitionFile {
            parent: bound,
            entry,
            mode,
        })
    }

    /// Opens the root listing; the archive is flat, so `"/"` is the only
    /// directory.
    pub fn open_directory(
        &self,
        path: &str,
        mode: OpenDirectoryMode,
    ) -> PartfsResult<PartitionDirectory<'_, E, S>> {
        let bound = self.bound()?;
        fs::check_path_format(path)?;
        if path != fs::ROOT_PATH {
            return Err(PartfsError::PathNotFound);
        }
        Ok(PartitionDirectory {
            parent: bound,
            mode,
            index: 0,
        })
    }

    /// Absolute storage offset of the first byte of `path`
    pub fn get_file_base_offset(&self, path: &str) -> PartfsResult<u64> {
        let bound = self.bound()?;
        fs::check_path_format(path)?;
        let index = bound
            .meta
            .get_entry_index(&path[1..])
            .ok_or(PartfsError::PathNotFound)?;
        let entry = bound.meta.get_entry(index).ok_or(PartfsError::PathNotFound)?;
        Ok(bound.meta.get_meta_data_size() + entry.offset())
    }
}

impl<E: PartitionEntry, S: Storage> Default for PartitionFileSystemCore<E, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: PartitionEntry, S: Storage> FileSystem for PartitionFileSystemCore<E, S> {
    fn get_entry_type(&self, path: &str) -> PartfsResult<DirectoryEntryType> {
        PartitionFileSystemCore::get_entry_type(self, path)
    }

    fn open_file(&self, path: &str, mode: OpenMode) -> PartfsResult<Box<dyn File + '_>> {
        Ok(Box::new(PartitionFileSystemCore::open_file(self, path, mode)?))
    }

    fn open_directory(
        &self,
        path: &str,
        mode: OpenDirectoryMode,
    ) -> PartfsResult<Box<dyn Directory + '_>> {
        Ok(Box::new(PartitionFileSystemCore::open_directory(self, path, mode)?))
    }

    fn create_file(&mut self, _path: &str, _size: u64) -> PartfsResult<()> {
        Err(PartfsError::UnsupportedOperationInPartitionFileSystemA)
    }
    fn delete_file(&mut self, _path: &str) -> PartfsResult<()> {
        Err(PartfsError::UnsupportedOperationInPartitionFileSystemA)
    }
    fn create_directory(&mut self, _path: &str) -> PartfsResult<()> {
        Err(PartfsError::UnsupportedOperationInPartitionFileSystemA)
    }
    fn delete_directory(&mut self, _path: &str) -> PartfsResult<()> {
        Err(PartfsError::UnsupportedOperationInPartitionFileSystemA)
    }
    fn delete_directory_recursively(&mut self, _path: &str) -> PartfsResult<()> {
        Err(PartfsError::UnsupportedOperationInPartitionFileSystemA)
    }
    fn clean_directory_recursively(&mut self, _path: &str) -> PartfsResult<()> {
        Err(PartfsError::UnsupportedOperationInPartitionFileSystemA)
    }
    fn rename_file(&mut self, _old_path: &str, _new_path: &str) -> PartfsResult<()> {
        Err(PartfsError::UnsupportedOperationInPartitionFileSystemA)
    }
    fn rename_directory(&mut self, _old_path: &str, _new_path: &str) -> PartfsResult<()> {
        Err(PartfsError::UnsupportedOperationInPartitionFileSystemA)
    }

    fn commit(&mut self) -> PartfsResult<()> {
        Ok(())
    }
    fn commit_provisionally(&mut self, _counter: i64) -> PartfsResult<()> {
        Err(PartfsError::UnsupportedOperationInPartitionFileSystemB)
    }

    fn get_free_space_size(&self, _path: &str) -> PartfsResult<u64> {
        Err(PartfsError::UnsupportedOperationInPartitionFileSystemB)
    }
    fn get_total_space_size(&self, _path: &str) -> PartfsResult<u64> {
        Err(PartfsError::UnsupportedOperationInPartitionFileSystemB)
    }
}

/// Handle to one archived file
pub struct PartitionFile<'fs, E: PartitionEntry, S: Storage> {
    parent: &'fs Bound<E, S>,
    entry: &'fs E,
    mode: OpenMode,
}

impl<E: PartitionEntry, S: Storage> File for PartitionFile<'_, E, S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> PartfsResult<usize> {
        let read_size = fs::dry_read(self.mode, offset, self.entry.size(), buf.len())?;
        let entry_start = self
            .parent
            .meta
            .get_meta_data_size()
            .checked_add(self.entry.offset())
            .ok_or(PartfsError::OutOfRange)?;
        self.entry
            .read_data(&self.parent.storage, entry_start, offset, &mut buf[..read_size])?;
        Ok(read_size)
    }

    fn get_size(&self) -> PartfsResult<u64> {
        Ok(self.entry.size())
    }

    fn flush(&mut self) -> PartfsResult<()> {
        if !self.mode.contains(OpenMode::WRITE) {
            return Ok(());
        }
        self.parent.storage.flush()
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> PartfsResult<()> {
        // Appending is never possible; everything else is rejected too,
        // once the mode and arguments have been checked.
        fs::check_write_permitted(self.mode)?;
        fs::check_entry_range(offset, buf.len() as u64, self.entry.size())?;
        Err(PartfsError::UnsupportedOperationInPartitionFileA)
    }

    fn set_size(&mut self, _size: u64) -> PartfsResult<()> {
        fs::check_write_permitted(self.mode)?;
        Err(PartfsError::UnsupportedOperationInPartitionFileA)
    }

    fn operate_range(&self, op: OperationId, offset: u64, size: u64) -> PartfsResult<()> {
        match op {
            OperationId::Invalidate => {
                if !self.mode.contains(OpenMode::READ) {
                    return Err(PartfsError::ReadNotPermitted);
                }
                if self.mode.contains(OpenMode::WRITE) {
                    return Err(PartfsError::UnsupportedOperationInPartitionFileB);
                }
            }
            OperationId::QueryRange => {}
            _ => return Err(PartfsError::UnsupportedOperationInPartitionFileB),
        }

        fs::check_entry_range(offset, size, self.entry.size())?;
        let base = self.parent.meta.get_meta_data_size() + self.entry.offset();
        self.parent.storage.operate_range(op, base + offset, size)
    }
}

/// Cursor over the root listing
pub struct PartitionDirectory<'fs, E: PartitionEntry, S: Storage> {
    parent: &'fs Bound<E, S>,
    mode: OpenDirectoryMode,
    index: usize,
}

impl<E: PartitionEntry, S: Storage> Directory for PartitionDirectory<'_, E, S> {
    fn read(&mut self, entries: &mut [DirectoryEntry]) -> PartfsResult<usize> {
        // There are no subdirectories.
        if !self.mode.contains(OpenDirectoryMode::FILE) {
            return Ok(0);
        }

        let meta = &self.parent.meta;
        let count = entries.len().min(meta.get_entry_count() - self.index);
        for slot in entries[..count].iter_mut() {
            let entry = meta.get_entry(self.index).ok_or(PartfsError::OutOfRange)?;
            let name = meta.get_entry_name(self.index)?;
            *slot = DirectoryEntry::new(DirectoryEntryType::File, entry.size(), name.as_bytes());
            self.index += 1;
        }
        Ok(count)
    }

    fn get_entry_count(&self) -> PartfsResult<u64> {
        if self.mode.contains(OpenDirectoryMode::FILE) {
            Ok(self.parent.meta.get_entry_count() as u64)
        } else {
            Ok(0)
        }
    }
}
