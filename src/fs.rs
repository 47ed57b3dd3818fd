use bitflags::bitflags;

use crate::storage::OperationId;
use crate::string::SizedCString;
use crate::{PartfsError, PartfsResult};

/// Longest directory-entry name, terminator excluded
pub const ENTRY_NAME_LENGTH_MAX: usize = 0x300;

pub(crate) const ROOT_PATH: &str = "/";
pub(crate) const PATH_SEPARATOR: u8 = b'/';

bitflags! {
    /// Mode bits accepted by `open_file`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const ALLOW_APPEND = 0x4;
    }

    /// Entry kinds requested from an opened directory
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenDirectoryMode: u32 {
        const DIRECTORY = 0x1;
        const FILE = 0x2;
        const ALL = Self::DIRECTORY.bits() | Self::FILE.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryEntryType {
    Directory,
    File,
}

/// One record emitted by [`Directory::read`]
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub entry_type: DirectoryEntryType,
    pub file_size: u64,
    pub name: SizedCString<{ ENTRY_NAME_LENGTH_MAX + 1 }>,
}

impl DirectoryEntry {
    pub(crate) fn new(entry_type: DirectoryEntryType, file_size: u64, name: &[u8]) -> Self {
        Self {
            entry_type,
            file_size,
            name: SizedCString::new_truncated(name),
        }
    }
}

impl Default for DirectoryEntry {
    fn default() -> Self {
        Self::new(DirectoryEntryType::File, 0, b"")
    }
}

/// An opened file: bounded reads against the backing storage
pub trait File {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes read. Reads past the end of the file return 0.
    fn read(&self, offset: u64, buf: &mut [u8]) -> PartfsResult<usize>;
    fn get_size(&self) -> PartfsResult<u64>;
    fn flush(&mut self) -> PartfsResult<()>;
    fn write(&mut self, offset: u64, buf: &[u8]) -> PartfsResult<()>;
    fn set_size(&mut self, size: u64) -> PartfsResult<()>;
    fn operate_range(&self, op: OperationId, offset: u64, size: u64) -> PartfsResult<()>;
}

/// An opened directory: a stateful cursor over its children
pub trait Directory {
    /// Fills `entries` with the next batch of children, returning how many
    /// were emitted. A cursor that has streamed the whole listing emits 0.
    fn read(&mut self, entries: &mut [DirectoryEntry]) -> PartfsResult<usize>;
    fn get_entry_count(&self) -> PartfsResult<u64>;
}

/// Path-based access to an archive image.
///
/// All paths are absolute and begin with `'/'`. The mutating half of the
/// interface exists so read-only archives can fail it with a dedicated
/// error rather than a type hole.
pub trait FileSystem {
    fn get_entry_type(&self, path: &str) -> PartfsResult<DirectoryEntryType>;
    fn open_file(&self, path: &str, mode: OpenMode) -> PartfsResult<Box<dyn File + '_>>;
    fn open_directory(
        &self,
        path: &str,
        mode: OpenDirectoryMode,
    ) -> PartfsResult<Box<dyn Directory + '_>>;

    fn create_file(&mut self, path: &str, size: u64) -> PartfsResult<()>;
    fn delete_file(&mut self, path: &str) -> PartfsResult<()>;
    fn create_directory(&mut self, path: &str) -> PartfsResult<()>;
    fn delete_directory(&mut self, path: &str) -> PartfsResult<()>;
    fn delete_directory_recursively(&mut self, path: &str) -> PartfsResult<()>;
    fn clean_directory_recursively(&mut self, path: &str) -> PartfsResult<()>;
    fn rename_file(&mut self, old_path: &str, new_path: &str) -> PartfsResult<()>;
    fn rename_directory(&mut self, old_path: &str, new_path: &str) -> PartfsResult<()>;

    fn commit(&mut self) -> PartfsResult<()>;
    fn commit_provisionally(&mut self, counter: i64) -> PartfsResult<()>;

    fn get_free_space_size(&self, path: &str) -> PartfsResult<u64>;
    fn get_total_space_size(&self, path: &str) -> PartfsResult<u64>;
}

/// Every public path must be absolute
pub(crate) fn check_path_format(path: &str) -> PartfsResult<()> {
    if path.as_bytes().first() == Some(&PATH_SEPARATOR) {
        Ok(())
    } else {
        Err(PartfsError::InvalidPathFormat)
    }
}

/// Clamps a read request against the open mode and the entry size.
/// Returns the effective byte count.
pub(crate) fn dry_read(
    mode: OpenMode,
    offset: u64,
    entry_size: u64,
    buf_len: usize,
) -> PartfsResult<usize> {
    if !mode.contains(OpenMode::READ) {
        return Err(PartfsError::ReadNotPermitted);
    }
    if offset > entry_size {
        return Err(PartfsError::OutOfRange);
    }
    let readable = entry_size - offset;
    Ok(buf_len.min(usize::try_from(readable).unwrap_or(usize::MAX)))
}

/// Mutating file calls require a handle opened with write permission
pub(crate) fn check_write_permitted(mode: OpenMode) -> PartfsResult<()> {
    if !mode.contains(OpenMode::WRITE) {
        return Err(PartfsError::UnsupportedOperationInPartitionFileB);
    }
    Ok(())
}

/// Validates an `operate_range`/`write` interval against the entry size
pub(crate) fn check_entry_range(offset: u64, size: u64, entry_size: u64) -> PartfsResult<()> {
    if offset > entry_size {
        return Err(PartfsError::OutOfRange);
    }
    let end = offset.checked_add(size).ok_or(PartfsError::InvalidSize)?;
    if end > entry_size {
        return Err(PartfsError::InvalidSize);
    }
    Ok(())
}
