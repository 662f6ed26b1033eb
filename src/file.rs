// File-level I/O plumbing.
//
// A request splits into a leading partial block, a run of whole blocks,
// and a trailing partial block. Partial writes read-modify-write;
// whole-block writes take a buffer without reading. Reads clamp to the
// file size, and a hole (block 0 from the mapper) reads as zeros.
// Writes past EOF grow the file but do not fill holes.
//
// The metadata primitive at the bottom handles small objects (directory
// entries) that never cross a block boundary.

use crate::error::Result;
use crate::inode::{DinodeHandle, Vnode};
use crate::layout::BLOCK_SIZE;
use crate::volume::SfsVolume;

/// Byte cursor over a caller's buffer, read side.
struct ReadCursor<'a> {
    pos: u32,
    out: &'a mut [u8],
    done: usize,
}

impl ReadCursor<'_> {
    fn resid(&self) -> usize {
        self.out.len() - self.done
    }

    fn take(&mut self, src: &[u8]) {
        self.out[self.done..self.done + src.len()].copy_from_slice(src);
        self.done += src.len();
        self.pos += src.len() as u32;
    }

    fn take_zeros(&mut self, len: usize) {
        self.out[self.done..self.done + len].fill(0);
        self.done += len;
        self.pos += len as u32;
    }
}

/// Byte cursor over a caller's buffer, write side.
struct WriteCursor<'a> {
    pos: u32,
    data: &'a [u8],
    done: usize,
}

impl WriteCursor<'_> {
    fn resid(&self) -> usize {
        self.data.len() - self.done
    }

    fn give(&mut self, len: usize) -> &[u8] {
        let chunk = &self.data[self.done..self.done + len];
        self.done += len;
        self.pos += len as u32;
        chunk
    }
}

impl SfsVolume {
    /// Read part of one block.
    fn partial_read(
        &self,
        vn: &Vnode,
        handle: &DinodeHandle,
        cur: &mut ReadCursor<'_>,
        skipstart: usize,
        len: usize,
    ) -> Result<()> {
        debug_assert!(skipstart + len <= BLOCK_SIZE);
        let fileblock = cur.pos / BLOCK_SIZE as u32;
        let diskblock = self.bmap(vn, handle, fileblock, false, false)?;
        if diskblock == 0 {
            // A hole; it reads as zeros.
            cur.take_zeros(len);
            return Ok(());
        }
        let buf = self.cache.read(diskblock)?;
        let data = buf.map();
        cur.take(&data[skipstart..skipstart + len]);
        Ok(())
    }

    /// Write part of one block: read-modify-write.
    fn partial_write(
        &self,
        vn: &Vnode,
        handle: &DinodeHandle,
        cur: &mut WriteCursor<'_>,
        skipstart: usize,
        len: usize,
    ) -> Result<()> {
        debug_assert!(skipstart + len <= BLOCK_SIZE);
        let fileblock = cur.pos / BLOCK_SIZE as u32;
        let diskblock = self.bmap(vn, handle, fileblock, true, false)?;
        debug_assert_ne!(diskblock, 0);

        let buf = self.cache.read(diskblock)?;
        {
            let chunk = cur.give(len);
            let mut data = buf.map_mut();
            data[skipstart..skipstart + len].copy_from_slice(chunk);
        }
        self.journal_user_write(&buf)?;
        buf.mark_dirty();
        Ok(())
    }

    /// Read one whole block.
    fn block_read(
        &self,
        vn: &Vnode,
        handle: &DinodeHandle,
        cur: &mut ReadCursor<'_>,
    ) -> Result<()> {
        let fileblock = cur.pos / BLOCK_SIZE as u32;
        let diskblock = self.bmap(vn, handle, fileblock, false, false)?;
        if diskblock == 0 {
            cur.take_zeros(BLOCK_SIZE);
            return Ok(());
        }
        let buf = self.cache.read(diskblock)?;
        let data = buf.map();
        cur.take(&data[..]);
        Ok(())
    }

    /// Write one whole block. No read: the entire block is replaced.
    fn block_write(
        &self,
        vn: &Vnode,
        handle: &DinodeHandle,
        cur: &mut WriteCursor<'_>,
    ) -> Result<()> {
        let fileblock = cur.pos / BLOCK_SIZE as u32;
        let diskblock = self.bmap(vn, handle, fileblock, true, false)?;
        debug_assert_ne!(diskblock, 0);

        let buf = self.cache.get(diskblock)?;
        {
            let chunk = cur.give(BLOCK_SIZE);
            buf.map_mut().copy_from_slice(chunk);
        }
        buf.mark_valid();
        self.journal_user_write(&buf)?;
        buf.mark_dirty();
        Ok(())
    }

    /// Read up to `out.len()` bytes at `pos`. Returns the byte count,
    /// clamped at EOF.
    pub(crate) fn file_read(
        &self,
        vn: &Vnode,
        handle: &DinodeHandle,
        pos: u32,
        out: &mut [u8],
    ) -> Result<usize> {
        let size = handle.dinode().size;
        if pos >= size {
            return Ok(0);
        }
        let want = (out.len() as u64).min((size - pos) as u64) as usize;
        let mut cur = ReadCursor {
            pos,
            out: &mut out[..want],
            done: 0,
        };

        // Leading partial block.
        let blkoff = (cur.pos as usize) % BLOCK_SIZE;
        if blkoff != 0 {
            let len = (BLOCK_SIZE - blkoff).min(cur.resid());
            self.partial_read(vn, handle, &mut cur, blkoff, len)?;
        }

        // Whole blocks.
        while cur.resid() >= BLOCK_SIZE {
            debug_assert_eq!(cur.pos as usize % BLOCK_SIZE, 0);
            self.block_read(vn, handle, &mut cur)?;
        }

        // Trailing partial block.
        let tail = cur.resid();
        if tail > 0 {
            self.partial_read(vn, handle, &mut cur, 0, tail)?;
        }

        Ok(cur.done)
    }

    /// Write `data` at `pos`, growing the file as needed. Returns the
    /// byte count written; on error after a partial transfer, the count
    /// so far comes back instead of the error.
    pub(crate) fn file_write(
        &self,
        vn: &Vnode,
        handle: &DinodeHandle,
        pos: u32,
        data: &[u8],
    ) -> Result<usize> {
        let mut cur = WriteCursor { pos, data, done: 0 };

        let result = (|| -> Result<()> {
            // Leading partial block.
            let blkoff = (cur.pos as usize) % BLOCK_SIZE;
            if blkoff != 0 {
                let len = (BLOCK_SIZE - blkoff).min(cur.resid());
                self.partial_write(vn, handle, &mut cur, blkoff, len)?;
            }

            // Whole blocks.
            while cur.resid() >= BLOCK_SIZE {
                debug_assert_eq!(cur.pos as usize % BLOCK_SIZE, 0);
                self.block_write(vn, handle, &mut cur)?;
            }

            // Trailing partial block.
            let tail = cur.resid();
            if tail > 0 {
                self.partial_write(vn, handle, &mut cur, 0, tail)?;
            }
            Ok(())
        })();

        // If we wrote anything past the old EOF, grow the file.
        if cur.done > 0 && cur.pos > handle.dinode().size {
            handle.set_size(self, cur.pos)?;
        }

        match result {
            Ok(()) => Ok(cur.done),
            Err(_) if cur.done > 0 => Ok(cur.done),
            Err(e) => Err(e),
        }
    }

    /// Metadata I/O: read or write a small region that fits inside one
    /// block and does not cross a block boundary.
    pub(crate) fn meta_read(
        &self,
        vn: &Vnode,
        handle: &DinodeHandle,
        pos: u32,
        out: &mut [u8],
    ) -> Result<()> {
        let vnblock = pos / BLOCK_SIZE as u32;
        let blockoffset = (pos as usize) % BLOCK_SIZE;
        debug_assert!(blockoffset + out.len() <= BLOCK_SIZE);

        let diskblock = self.bmap(vn, handle, vnblock, false, true)?;
        if diskblock == 0 {
            // Sparse; reads as zeros.
            out.fill(0);
            return Ok(());
        }
        let buf = self.cache.read(diskblock)?;
        let data = buf.map();
        out.copy_from_slice(&data[blockoffset..blockoffset + out.len()]);
        Ok(())
    }

    /// Metadata write; journaled as a single update record, growing the
    /// object if the write extends it.
    pub(crate) fn meta_write(
        &self,
        vn: &Vnode,
        handle: &DinodeHandle,
        pos: u32,
        data: &[u8],
    ) -> Result<()> {
        let vnblock = pos / BLOCK_SIZE as u32;
        let blockoffset = (pos as usize) % BLOCK_SIZE;
        debug_assert!(blockoffset + data.len() <= BLOCK_SIZE);

        let diskblock = self.bmap(vn, handle, vnblock, true, true)?;
        debug_assert_ne!(diskblock, 0);

        let buf = self.cache.read(diskblock)?;
        self.meta_patch(&buf, blockoffset, data)?;
        drop(buf);

        let endpos = pos + data.len() as u32;
        if endpos > handle.dinode().size {
            handle.set_size(self, endpos)?;
        }
        Ok(())
    }
}
