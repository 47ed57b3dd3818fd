//! Hierarchical read-only ROM filesystem.
//!
//! A ROM image carries a persistent path table at its head (see
//! [`table`]) and raw file content behind it. The filesystem resolves
//! absolute paths through the table and serves bounded reads from the
//! shared storage; like the partition archives, every mutation fails
//! with a dedicated error.

pub mod table;

use crate::fs::{
    self, Directory, DirectoryEntry, DirectoryEntryType, File, FileSystem, OpenDirectoryMode,
    OpenMode,
};
use crate::storage::{OperationId, Storage};
use crate::{PartfsError, PartfsResult};

pub use table::{FileInfo, FindPosition, HierarchicalRomFileTable};

struct RomBound<S: Storage> {
    table: HierarchicalRomFileTable,
    storage: S,
}

/// Filesystem over a ROM image
pub struct RomFsFileSystem<S: Storage> {
    state: Option<RomBound<S>>,
}

impl<S: Storage> RomFsFileSystem<S> {
    #[must_use]
    pub fn new() -> Self {
        Self { state: None }
    }

    /// Working memory needed to buffer the image's path table
    pub fn get_required_working_memory_size(storage: &S) -> PartfsResult<u64> {
        HierarchicalRomFileTable::get_required_working_memory_size(storage)
    }

    /// Buffers the path table and binds `storage`. A bound instance
    /// rejects a second call.
    pub fn initialize(&mut self, storage: S) -> PartfsResult<()> {
        if self.state.is_some() {
            return Err(PartfsError::PreconditionViolation);
        }
        let table = HierarchicalRomFileTable::initialize(&storage)?;
        self.state = Some(RomBound { table, storage });
        Ok(())
    }

    fn bound(&self) -> PartfsResult<&RomBound<S>> {
        self.state.as_ref().ok_or(PartfsError::PreconditionViolation)
    }

    pub fn get_entry_type(&self, path: &str) -> PartfsResult<DirectoryEntryType> {
        self.bound()?.table.get_entry_type(path)
    }

    /// Opens `path` for reading; write modes defer their failure to the
    /// write call, as for the partition archives.
    pub fn open_file(&self, path: &str, mode: OpenMode) -> PartfsResult<RomFsFile<'_, S>> {
        let bound = self.bound()?;
        let info = bound.table.open_file(path)?;
        Ok(RomFsFile {
            parent: bound,
            info,
            mode,
        })
    }

    pub fn open_directory(
        &self,
        path: &str,
        mode: OpenDirectoryMode,
    ) -> PartfsResult<RomFsDirectory<'_, S>> {
        let bound = self.bound()?;
        let start = bound.table.open_directory(path)?.filtered(
            mode.contains(OpenDirectoryMode::DIRECTORY),
            mode.contains(OpenDirectoryMode::FILE),
        );
        Ok(RomFsDirectory {
            parent: bound,
            start,
            position: start,
        })
    }

    /// Absolute storage offset of the first content byte of `path`
    pub fn get_file_base_offset(&self, path: &str) -> PartfsResult<u64> {
        let bound = self.bound()?;
        let info = bound.table.open_file(path)?;
        bound
            .table
            .file_data_offset()
            .checked_add(info.data_offset)
            .ok_or(PartfsError::OutOfRange)
    }

    /// The image never carries provisional state to discard
    pub fn rollback(&mut self) -> PartfsResult<()> {
        Ok(())
    }
}

impl<S: Storage> Default for RomFsFileSystem<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Storage> FileSystem for RomFsFileSystem<S> {
    fn get_entry_type(&self, path: &str) -> PartfsResult<DirectoryEntryType> {
        RomFsFileSystem::get_entry_type(self, path)
    }

    fn open_file(&self, path: &str, mode: OpenMode) -> PartfsResult<Box<dyn File + '_>> {
        Ok(Box::new(RomFsFileSystem::open_file(self, path, mode)?))
    }

    fn open_directory(
        &self,
        path: &str,
        mode: OpenDirectoryMode,
    ) -> PartfsResult<Box<dyn Directory + '_>> {
        Ok(Box::new(RomFsFileSystem::open_directory(self, path, mode)?))
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
        Ok(0)
    }
    fn get_total_space_size(&self, _path: &str) -> PartfsResult<u64> {
        Ok(0)
    }
}

/// Handle to one file of the ROM image
pub struct RomFsFile<'fs, S: Storage> {
    parent: &'fs RomBound<S>,
    info: FileInfo,
    mode: OpenMode,
}

impl<S: Storage> RomFsFile<'_, S> {
    fn content_base(&self) -> PartfsResult<u64> {
        self.parent
            .table
            .file_data_offset()
            .checked_add(self.info.data_offset)
            .ok_or(PartfsError::OutOfRange)
    }
}

impl<S: Storage> File for RomFsFile<'_, S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> PartfsResult<usize> {
        let read_size = fs::dry_read(self.mode, offset, self.info.data_size, buf.len())?;
        let read_offset = self
            .content_base()?
            .checked_add(offset)
            .ok_or(PartfsError::OutOfRange)?;
        self.parent.storage.read(read_offset, &mut buf[..read_size])?;
        Ok(read_size)
    }

    fn get_size(&self) -> PartfsResult<u64> {
        Ok(self.info.data_size)
    }

    fn flush(&mut self) -> PartfsResult<()> {
        if !self.mode.contains(OpenMode::WRITE) {
            return Ok(());
        }
        self.parent.storage.flush()
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> PartfsResult<()> {
        fs::check_write_permitted(self.mode)?;
        fs::check_entry_range(offset, buf.len() as u64, self.info.data_size)?;
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

        fs::check_entry_range(offset, size, self.info.data_size)?;
        let base = self.content_base()?;
        self.parent.storage.operate_range(op, base + offset, size)
    }
}

/// Cursor over one directory's children
pub struct RomFsDirectory<'fs, S: Storage> {
    parent: &'fs RomBound<S>,
    start: FindPosition,
    position: FindPosition,
}

impl<S: Storage> Directory for RomFsDirectory<'_, S> {
    fn read(&mut self, entries: &mut [DirectoryEntry]) -> PartfsResult<usize> {
        self.parent.table.read_directory(&mut self.position, entries)
    }

    fn get_entry_count(&self) -> PartfsResult<u64> {
        self.parent.table.count_entries(self.start)
    }
}
