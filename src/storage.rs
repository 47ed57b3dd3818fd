use std::rc::Rc;
use std::sync::Arc;

use crate::{PartfsError, PartfsResult};

/// Maintenance operation forwarded through [`Storage::operate_range`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationId {
    FillZero,
    DestroySignature,
    Invalidate,
    QueryRange,
}

/// Random-access byte image backing an archive filesystem.
///
/// The image is treated as immutable for the lifetime of any filesystem
/// bound to it. `read` either fills the whole buffer or fails; partial
/// reads do not exist at this layer.
pub trait Storage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> PartfsResult<()>;
    fn size(&self) -> PartfsResult<u64>;
    fn flush(&self) -> PartfsResult<()> {
        Ok(())
    }
    fn operate_range(&self, op: OperationId, offset: u64, size: u64) -> PartfsResult<()> {
        let end = offset.checked_add(size).ok_or(PartfsError::InvalidSize)?;
        if end > self.size()? {
            return Err(PartfsError::InvalidSize);
        }
        match op {
            OperationId::Invalidate | OperationId::QueryRange => Ok(()),
            _ => Err(PartfsError::UnsupportedOperationInPartitionFileB),
        }
    }
}

/// In-memory [`Storage`] over an owned byte vector
#[derive(Debug, Clone)]
pub struct MemStorage {
    data: Vec<u8>,
}

impl MemStorage {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl Storage for MemStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> PartfsResult<()> {
        let offset = usize::try_from(offset).map_err(|_| PartfsError::OutOfRange)?;
        let end = offset.checked_add(buf.len()).ok_or(PartfsError::OutOfRange)?;
        let src = self.data.get(offset..end).ok_or(PartfsError::OutOfRange)?;
        buf.copy_from_slice(src);
        Ok(())
    }
    fn size(&self) -> PartfsResult<u64> {
        Ok(self.data.len() as u64)
    }
}

impl<'a, S: Storage + ?Sized> Storage for &'a S {
    fn read(&self, offset: u64, buf: &mut [u8]) -> PartfsResult<()> {
        (**self).read(offset, buf)
    }
    fn size(&self) -> PartfsResult<u64> {
        (**self).size()
    }
    fn flush(&self) -> PartfsResult<()> {
        (**self).flush()
    }
    fn operate_range(&self, op: OperationId, offset: u64, size: u64) -> PartfsResult<()> {
        (**self).operate_range(op, offset, size)
    }
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> PartfsResult<()> {
        (**self).read(offset, buf)
    }
    fn size(&self) -> PartfsResult<u64> {
        (**self).size()
    }
    fn flush(&self) -> PartfsResult<()> {
        (**self).flush()
    }
    fn operate_range(&self, op: OperationId, offset: u64, size: u64) -> PartfsResult<()> {
        (**self).operate_range(op, offset, size)
    }
}

impl<S: Storage + ?Sized> Storage for Rc<S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> PartfsResult<()> {
        (**self).read(offset, buf)
    }
    fn size(&self) -> PartfsResult<u64> {
        (**self).size()
    }
    fn flush(&self) -> PartfsResult<()> {
        (**self).flush()
    }
    fn operate_range(&self, op: OperationId, offset: u64, size: u64) -> PartfsResult<()> {
        (**self).operate_range(op, offset, size)
    }
}

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn read(&self, offset: u64, buf: &mut [u8]) -> PartfsResult<()> {
        (**self).read(offset, buf)
    }
    fn size(&self) -> PartfsResult<u64> {
        (**self).size()
    }
    fn flush(&self) -> PartfsResult<()> {
        (**self).flush()
    }
    fn operate_range(&self, op: OperationId, offset: u64, size: u64) -> PartfsResult<()> {
        (**self).operate_range(op, offset, size)
    }
}

#[cfg(test)]
mod tests {
    use super::{MemStorage, OperationId, Storage};
    use crate::PartfsError;

    #[test]
    fn read_fills_or_fails() {
        let storage = MemStorage::new(vec![1, 2, 3, 4]);
        let mut buf = [0u8; 2];
        storage.read(1, &mut buf).unwrap();
        assert_eq!(buf, [2, 3]);
        assert_eq!(storage.read(3, &mut buf), Err(PartfsError::OutOfRange));
        assert_eq!(storage.read(u64::MAX, &mut buf), Err(PartfsError::OutOfRange));
    }

    #[test]
    fn operate_range_rejects_mutations() {
        let storage = MemStorage::new(vec![0; 16]);
        storage.operate_range(OperationId::Invalidate, 0, 16).unwrap();
        storage.operate_range(OperationId::QueryRange, 8, 8).unwrap();
        assert_eq!(
            storage.operate_range(OperationId::FillZero, 0, 4),
            Err(PartfsError::UnsupportedOperationInPartitionFileB),
        );
        assert_eq!(
            storage.operate_range(OperationId::QueryRange, 8, 9),
            Err(PartfsError::InvalidSize),
        );
    }

    #[test]
    fn shared_storage_reads_through() {
        let storage = std::sync::Arc::new(MemStorage::new(vec![9; 8]));
        let mut buf = [0u8; 8];
        storage.read(0, &mut buf).unwrap();
        assert_eq!(buf, [9; 8]);
        assert_eq!(storage.size().unwrap(), 8);
    }
}
