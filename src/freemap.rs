// Free block bitmap. One bit per block in the volume, persisted as a
// packed run of blocks starting at FREEMAP_START. The in-memory copy is
// authoritative during operation; a dirty flag drives write-back. Not
// kept in the buffer cache.

use parking_lot::{Mutex, MutexGuard};

use crate::buffer::BufferGuard;
use crate::error::{Result, SfsError};
use crate::journal::record::Record;
use crate::layout::{freemap_bits, BLOCK_SIZE};
use crate::volume::SfsVolume;

pub struct Freemap {
    inner: Mutex<FreemapInner>,
}

pub struct FreemapInner {
    /// Packed bitmap, `freemap_bits(nblocks) / 8` bytes.
    bits: Vec<u8>,
    dirty: bool,
}

impl FreemapInner {
    pub fn is_set(&self, block: u32) -> bool {
        let byte = (block / 8) as usize;
        let mask = 1u8 << (block % 8);
        self.bits[byte] & mask != 0
    }

    pub fn mark(&mut self, block: u32) {
        let byte = (block / 8) as usize;
        let mask = 1u8 << (block % 8);
        assert_eq!(self.bits[byte] & mask, 0, "freemap: block {block} already in use");
        self.bits[byte] |= mask;
        self.dirty = true;
    }

    pub fn unmark(&mut self, block: u32) {
        let byte = (block / 8) as usize;
        let mask = 1u8 << (block % 8);
        assert_ne!(self.bits[byte] & mask, 0, "freemap: block {block} already free");
        self.bits[byte] &= !mask;
        self.dirty = true;
    }

    /// Set a bit only if clear, clear only if set. Recovery replays may
    /// see updates that already happened; those are silently absorbed.
    pub fn force(&mut self, block: u32, used: bool) {
        if used != self.is_set(block) {
            if used {
                self.mark(block);
            } else {
                self.unmark(block);
            }
        }
    }

    /// Find and claim any clear bit.
    pub fn alloc(&mut self) -> Result<u32> {
        let found = self.bits.iter().enumerate().find_map(|(byte, b)| {
            (*b != 0xff).then(|| byte as u32 * 8 + b.trailing_ones())
        });
        match found {
            Some(block) => {
                self.mark(block);
                Ok(block)
            }
            None => Err(SfsError::NoSpace),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// One on-disk block's worth of bitmap bytes.
    pub fn block_data(&self, index: u32) -> &[u8] {
        let start = index as usize * BLOCK_SIZE;
        &self.bits[start..start + BLOCK_SIZE]
    }
}

impl Freemap {
    /// Build from the on-disk bitmap image.
    pub fn from_bits(bits: Vec<u8>, nblocks: u32) -> Freemap {
        assert_eq!(bits.len() as u32 * 8, freemap_bits(nblocks));
        Freemap {
            inner: Mutex::new(FreemapInner { bits, dirty: false }),
        }
    }

    /// Lock the bitmap explicitly. Operations that allocate or free many
    /// blocks (truncate) hold this across the whole run.
    pub fn lock(&self) -> MutexGuard<'_, FreemapInner> {
        self.inner.lock()
    }

    pub fn bused(&self, block: u32) -> bool {
        self.inner.lock().is_set(block)
    }
}

impl SfsVolume {
    /// Allocate a block: claim a freemap bit and journal the capture.
    /// The caller is responsible for clearing the block's contents
    /// (usually through `clearblock`).
    pub(crate) fn balloc(&self) -> Result<u32> {
        let block = self.freemap.lock().alloc()?;
        if block >= self.sb.nblocks {
            panic!("balloc: invalid block {block}");
        }

        if let Err(e) = self
            .txs
            .emit(&self.jphys, |txid| Record::FreemapCapture { txid, block })
        {
            self.freemap.lock().unmark(block);
            return Err(e);
        }
        Ok(block)
    }

    /// Zero out a freshly allocated block in the cache. With `journal`
    /// set, the zeroing is recorded as metadata updates so recovery can
    /// reconstruct the block's initial state; user data blocks skip
    /// that and are covered by their own write records.
    pub(crate) fn clearblock(&self, block: u32, journal: bool) -> Result<BufferGuard> {
        let buf = self.cache.get(block)?;
        if journal {
            buf.mark_valid();
            self.journal_block_zero(&buf)?;
        } else {
            buf.map_mut().fill(0);
            buf.mark_valid();
            buf.mark_dirty();
        }
        Ok(buf)
    }

    /// Free a block, journaling the release. Callers should invalidate
    /// any buffer they have for the block first.
    pub(crate) fn bfree(&self, block: u32) -> Result<()> {
        let mut fm = self.freemap.lock();
        self.bfree_prelocked(&mut fm, block)
    }

    /// Free a block when the freemap is already locked (truncate holds
    /// it across the whole discard).
    pub(crate) fn bfree_prelocked(&self, fm: &mut FreemapInner, block: u32) -> Result<()> {
        self.txs
            .emit(&self.jphys, |txid| Record::FreemapRelease { txid, block })?;
        fm.unmark(block);
        Ok(())
    }

    /// Check if a block is in use.
    pub fn block_is_used(&self, block: u32) -> bool {
        if block >= self.sb.nblocks {
            panic!("bused called on out of range block {block}");
        }
        self.freemap.bused(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::freemap_blocks;

    fn empty_map(nblocks: u32) -> Freemap {
        let bytes = (freemap_bits(nblocks) / 8) as usize;
        Freemap::from_bits(vec![0u8; bytes], nblocks)
    }

    #[test]
    fn alloc_finds_lowest_free_bit() {
        let fm = empty_map(200);
        let mut g = fm.lock();
        g.mark(0);
        g.mark(1);
        assert_eq!(g.alloc().unwrap(), 2);
        assert_eq!(g.alloc().unwrap(), 3);
        assert!(g.is_set(2));
        assert!(g.is_dirty());
    }

    #[test]
    fn unmark_frees_for_realloc() {
        let fm = empty_map(200);
        let mut g = fm.lock();
        let a = g.alloc().unwrap();
        let b = g.alloc().unwrap();
        g.unmark(a);
        assert!(!g.is_set(a));
        assert_eq!(g.alloc().unwrap(), a);
        assert!(g.is_set(b));
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let fm = empty_map(16);
        let mut g = fm.lock();
        // The bitmap rounds up to a whole block of bits; fill it all.
        for i in 0..freemap_bits(16) {
            g.mark(i);
        }
        assert!(matches!(g.alloc(), Err(SfsError::NoSpace)));
    }

    #[test]
    fn force_is_idempotent() {
        let fm = empty_map(200);
        let mut g = fm.lock();
        g.force(42, true);
        g.force(42, true);
        assert!(g.is_set(42));
        g.force(42, false);
        g.force(42, false);
        assert!(!g.is_set(42));
    }

    #[test]
    fn block_data_covers_whole_bitmap() {
        let fm = empty_map(5000);
        assert_eq!(freemap_blocks(5000), 2);
        let mut g = fm.lock();
        g.mark(4999);
        assert_eq!(g.block_data(1).len(), BLOCK_SIZE);
        let byte = (4999 / 8) as usize - BLOCK_SIZE;
        assert_ne!(g.block_data(1)[byte], 0);
    }
}
