// Block device adapter. Fixed-size block reads and writes against a
// backing store, with bounded retry of transient I/O errors.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Result, SfsError};
use crate::layout::BLOCK_SIZE;

/// How many times a failing block I/O is retried before giving up.
const IO_RETRIES: u32 = 10;

/// A fixed-block-size backing store.
///
/// Implementations only need to move one block at a time; retry and
/// bounds policy live in [`Device`].
pub trait BlockDevice: Send + Sync {
    fn nblocks(&self) -> u32;
    fn read_block(&self, block: u32, data: &mut [u8]) -> Result<()>;
    fn write_block(&self, block: u32, data: &[u8]) -> Result<()>;
}

/// Retry wrapper around a [`BlockDevice`].
pub struct Device {
    inner: Arc<dyn BlockDevice>,
}

impl Device {
    pub fn new(inner: Arc<dyn BlockDevice>) -> Device {
        Device { inner }
    }

    pub fn nblocks(&self) -> u32 {
        self.inner.nblocks()
    }

    pub fn read_block(&self, block: u32, data: &mut [u8]) -> Result<()> {
        self.retrying(block, "read", |dev| dev.read_block(block, data))
    }

    pub fn write_block(&self, block: u32, data: &[u8]) -> Result<()> {
        self.retrying(block, "write", |dev| dev.write_block(block, data))
    }

    fn retrying<F>(&self, block: u32, what: &str, mut op: F) -> Result<()>
    where
        F: FnMut(&dyn BlockDevice) -> Result<()>,
    {
        assert!(block < self.inner.nblocks(), "device: block {block} out of range");
        let mut tries = 0;
        loop {
            match op(self.inner.as_ref()) {
                Ok(()) => return Ok(()),
                Err(SfsError::Io(e)) => {
                    tries += 1;
                    if tries == 1 {
                        warn!(block, error = %e, "block {what} I/O error, retrying");
                    }
                    if tries >= IO_RETRIES {
                        warn!(block, "block {what} I/O error, giving up after {tries} retries");
                        return Err(SfsError::Io(e));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Device backed by a host file. One block per `BLOCK_SIZE` bytes.
pub struct FileDevice {
    file: Mutex<File>,
    nblocks: u32,
}

impl FileDevice {
    /// Open an existing image file; its length determines the block count.
    pub fn open(path: &Path) -> Result<FileDevice> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let nblocks = (len / BLOCK_SIZE as u64) as u32;
        Ok(FileDevice {
            file: Mutex::new(file),
            nblocks,
        })
    }

    /// Create a zero-filled image file of `nblocks` blocks.
    pub fn create(path: &Path, nblocks: u32) -> Result<FileDevice> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(nblocks as u64 * BLOCK_SIZE as u64)?;
        Ok(FileDevice {
            file: Mutex::new(file),
            nblocks,
        })
    }
}

impl BlockDevice for FileDevice {
    fn nblocks(&self) -> u32 {
        self.nblocks
    }

    fn read_block(&self, block: u32, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), BLOCK_SIZE);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(block as u64 * BLOCK_SIZE as u64))?;
        file.read_exact(data)?;
        Ok(())
    }

    fn write_block(&self, block: u32, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), BLOCK_SIZE);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(block as u64 * BLOCK_SIZE as u64))?;
        file.write_all(data)?;
        Ok(())
    }
}

/// In-memory device. Cheap to share between a "crashed" volume and its
/// remount, which is what the recovery tests do.
pub struct MemDevice {
    blocks: Mutex<Vec<u8>>,
    nblocks: u32,
}

impl MemDevice {
    pub fn new(nblocks: u32) -> MemDevice {
        MemDevice {
            blocks: Mutex::new(vec![0u8; nblocks as usize * BLOCK_SIZE]),
            nblocks,
        }
    }

    /// Raw copy of one block, bypassing any cache. For assertions.
    pub fn raw_block(&self, block: u32) -> Vec<u8> {
        assert!(block < self.nblocks);
        let blocks = self.blocks.lock();
        let start = block as usize * BLOCK_SIZE;
        blocks[start..start + BLOCK_SIZE].to_vec()
    }
}

impl BlockDevice for MemDevice {
    fn nblocks(&self) -> u32 {
        self.nblocks
    }

    fn read_block(&self, block: u32, data: &mut [u8]) -> Result<()> {
        assert_eq!(data.len(), BLOCK_SIZE);
        let blocks = self.blocks.lock();
        let start = block as usize * BLOCK_SIZE;
        data.copy_from_slice(&blocks[start..start + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&self, block: u32, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), BLOCK_SIZE);
        let mut blocks = self.blocks.lock();
        let start = block as usize * BLOCK_SIZE;
        blocks[start..start + BLOCK_SIZE].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn mem_device_roundtrip() {
        let dev = Device::new(Arc::new(MemDevice::new(8)));
        let data = [0xabu8; BLOCK_SIZE];
        dev.write_block(3, &data).unwrap();
        let mut back = [0u8; BLOCK_SIZE];
        dev.read_block(3, &mut back).unwrap();
        assert_eq!(back[0], 0xab);
        assert_eq!(back[BLOCK_SIZE - 1], 0xab);
    }

    #[test]
    fn file_device_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.img");
        let dev = FileDevice::create(&path, 16).unwrap();
        let data = [0x5au8; BLOCK_SIZE];
        dev.write_block(7, &data).unwrap();
        drop(dev);

        let dev = FileDevice::open(&path).unwrap();
        assert_eq!(dev.nblocks(), 16);
        let mut back = [0u8; BLOCK_SIZE];
        dev.read_block(7, &mut back).unwrap();
        assert_eq!(back[100], 0x5a);
    }

    /// Fails every call until `failures` is exhausted.
    struct FlakyDevice {
        inner: MemDevice,
        failures: AtomicU32,
    }

    impl BlockDevice for FlakyDevice {
        fn nblocks(&self) -> u32 {
            self.inner.nblocks()
        }

        fn read_block(&self, block: u32, data: &mut [u8]) -> Result<()> {
            self.inner.read_block(block, data)
        }

        fn write_block(&self, block: u32, data: &[u8]) -> Result<()> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            }).is_ok()
            {
                return Err(SfsError::Io(std::io::Error::other("transient")));
            }
            self.inner.write_block(block, data)
        }
    }

    #[test]
    fn transient_errors_are_retried() {
        let dev = Device::new(Arc::new(FlakyDevice {
            inner: MemDevice::new(4),
            failures: AtomicU32::new(3),
        }));
        let data = [1u8; BLOCK_SIZE];
        dev.write_block(0, &data).unwrap();
    }

    #[test]
    fn persistent_errors_surface() {
        let dev = Device::new(Arc::new(FlakyDevice {
            inner: MemDevice::new(4),
            failures: AtomicU32::new(1000),
        }));
        let data = [1u8; BLOCK_SIZE];
        assert!(matches!(dev.write_block(0, &data), Err(SfsError::Io(_))));
    }
}
