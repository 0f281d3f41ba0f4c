//! Host-side device memory.

use crate::device::{BufferHandle, HostRegion, MemFlags};
use crate::dtype::SharedBytes;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;

/// A buffer of the host driver.
///
/// Either owns its own storage (copy semantics) or is a window onto host
/// storage it shares with a [`crate::HostArray`] (host-pointer semantics).
#[derive(Debug)]
pub struct HostBuffer {
    storage: SharedBytes,
    offset: usize,
    len: usize,
    flags: MemFlags,
}

impl HostBuffer {
    /// Allocate `len` bytes, aliasing or copying `host` according to `flags`.
    pub fn allocate(flags: MemFlags, len: usize, host: Option<HostRegion>) -> Result<Self> {
        match host {
            Some(region) if region.len < len => Err(Error::argument(format!(
                "host region of {} bytes cannot back a buffer of {} bytes",
                region.len, len
            ))),
            Some(region) if flags.uses_host_ptr() => Ok(Self {
                storage: region.storage,
                offset: region.offset,
                len,
                flags,
            }),
            Some(region) => {
                let bytes = region.storage.read()[region.offset..region.offset + len].to_vec();
                Ok(Self::owned(bytes, flags))
            }
            None => Ok(Self::owned(vec![0u8; len], flags)),
        }
    }

    fn owned(bytes: Vec<u8>, flags: MemFlags) -> Self {
        let len = bytes.len();
        Self {
            storage: Arc::new(RwLock::new(bytes)),
            offset: 0,
            len,
            flags,
        }
    }

    /// Whether this buffer is a window onto `storage`.
    pub fn aliases(&self, storage: &SharedBytes) -> bool {
        Arc::ptr_eq(&self.storage, storage)
    }

    /// Copy `len` bytes out, starting at byte `offset`.
    pub fn load_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len)?;
        let start = self.offset + offset;
        Ok(self.storage.read()[start..start + len].to_vec())
    }

    /// Overwrite bytes starting at byte `offset`.
    pub fn store_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_range(offset, bytes.len())?;
        let start = self.offset + offset;
        self.storage.write()[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy `dst.len` bytes starting at `offset` into `dst`.
    pub fn read_into(&self, offset: usize, dst: &HostRegion) -> Result<()> {
        self.check_range(offset, dst.len)?;
        let src_start = self.offset + offset;
        if Arc::ptr_eq(&self.storage, &dst.storage) {
            if src_start != dst.offset {
                self.storage
                    .write()
                    .copy_within(src_start..src_start + dst.len, dst.offset);
            }
            return Ok(());
        }
        let src = self.storage.read();
        let mut target = dst.storage.write();
        target[dst.offset..dst.offset + dst.len]
            .copy_from_slice(&src[src_start..src_start + dst.len]);
        Ok(())
    }

    /// Copy all of `src` into this buffer starting at `offset`.
    pub fn write_from(&self, offset: usize, src: &HostRegion) -> Result<()> {
        self.check_range(offset, src.len)?;
        let dst_start = self.offset + offset;
        if Arc::ptr_eq(&self.storage, &src.storage) {
            if dst_start != src.offset {
                self.storage
                    .write()
                    .copy_within(src.offset..src.offset + src.len, dst_start);
            }
            return Ok(());
        }
        let source = src.storage.read();
        let mut target = self.storage.write();
        target[dst_start..dst_start + src.len]
            .copy_from_slice(&source[src.offset..src.offset + src.len]);
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.len {
            return Err(Error::execution(format!(
                "access of {} bytes at offset {} is out of bounds for a buffer of {} bytes",
                len, offset, self.len
            )));
        }
        Ok(())
    }
}

impl BufferHandle for HostBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn flags(&self) -> MemFlags {
        self.flags
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HostPtrMode, MemAccess};

    fn region(bytes: Vec<u8>, offset: usize, len: usize) -> HostRegion {
        HostRegion {
            storage: Arc::new(RwLock::new(bytes)),
            offset,
            len,
        }
    }

    #[test]
    fn test_use_host_ptr_aliases() {
        let host = region(vec![1, 2, 3, 4], 1, 2);
        let flags = MemFlags::new(MemAccess::ReadWrite, HostPtrMode::UseHostPtr);
        let buf = HostBuffer::allocate(flags, 2, Some(host.clone())).unwrap();

        assert!(buf.aliases(&host.storage));
        buf.store_bytes(0, &[9, 9]).unwrap();
        assert_eq!(*host.storage.read(), vec![1, 9, 9, 4]);
    }

    #[test]
    fn test_copy_host_ptr_is_independent() {
        let host = region(vec![1, 2, 3, 4], 2, 2);
        let flags = MemFlags::new(MemAccess::ReadWrite, HostPtrMode::CopyHostPtr);
        let buf = HostBuffer::allocate(flags, 2, Some(host.clone())).unwrap();

        assert!(!buf.aliases(&host.storage));
        assert_eq!(buf.load_bytes(0, 2).unwrap(), vec![3, 4]);
        buf.store_bytes(0, &[7, 7]).unwrap();
        assert_eq!(*host.storage.read(), vec![1, 2, 3, 4]);

        buf.read_into(0, &host).unwrap();
        assert_eq!(*host.storage.read(), vec![1, 2, 7, 7]);
    }

    #[test]
    fn test_bounds() {
        let flags = MemFlags::new(MemAccess::ReadOnly, HostPtrMode::CopyHostPtr);
        let buf = HostBuffer::allocate(flags, 4, None).unwrap();
        assert!(buf.load_bytes(2, 4).is_err());
        assert!(HostBuffer::allocate(flags, 8, Some(region(vec![0; 4], 0, 4))).is_err());
    }
}
