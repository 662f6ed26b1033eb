// Block mapping: translation from file block numbers to disk block
// numbers through the direct and indirect pointer tree, allocation on
// demand, and the region-discard engine behind truncate.
//
// A file block number decomposes into a subtree reference (indirection
// level plus index within the inode) and an offset within that subtree.
// The discard walk keeps an explicit array of per-layer states instead
// of recursing; within each subtree the scan runs in lexicographic
// position order so lower file blocks go first and the per-layer
// has-nonzero flag stays correct.

use crate::buffer::BufferGuard;
use crate::error::{Result, SfsError};
use crate::freemap::FreemapInner;
use crate::inode::{DinodeHandle, Vnode};
use crate::layout::{dinode_field, DB_PER_IDB, NDIRECT};
use crate::volume::SfsVolume;

/// Which of the inode's pointer subtrees a file block lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SubtreeRef {
    /// Indirection level, 0 (direct) through 3 (triple indirect).
    pub level: usize,
    /// Index among the inode's pointers at that level.
    pub num: usize,
}

impl SubtreeRef {
    /// Byte offset of the referenced pointer inside the inode block.
    fn inode_offset(&self) -> usize {
        match self.level {
            0 => dinode_field::direct(self.num),
            1 => dinode_field::INDIRECT,
            2 => dinode_field::DINDIRECT,
            3 => dinode_field::TINDIRECT,
            _ => panic!("invalid indirection level {}", self.level),
        }
    }
}

const ENTRIES: usize = DB_PER_IDB;

/// File blocks mapped by one pointer at each indirection level.
const BLOCKS_EACH: [u32; 4] = [
    1,
    ENTRIES as u32,
    (ENTRIES * ENTRIES) as u32,
    (ENTRIES * ENTRIES * ENTRIES) as u32,
];

/// Pointers the inode has at each indirection level.
const POINTERS: [usize; 4] = [NDIRECT, 1, 1, 1];

/// Decompose a file block number into its subtree and the block offset
/// within that subtree. Fails with FileTooBig past the last subtree.
pub(crate) fn get_indirection(fileblock: u32) -> Result<(SubtreeRef, u32)> {
    let mut fb = fileblock;
    for level in 0..4 {
        let max = POINTERS[level] as u32 * BLOCKS_EACH[level];
        if fb < max {
            return Ok((
                SubtreeRef {
                    level,
                    num: (fb / BLOCKS_EACH[level]) as usize,
                },
                fb % BLOCKS_EACH[level],
            ));
        }
        fb -= max;
    }
    Err(SfsError::FileTooBig)
}

/// An entity holding block pointers: either one of the inode's subtree
/// slots or an indirect block.
enum BlockObj<'a> {
    Inode {
        handle: &'a DinodeHandle,
        subtree: SubtreeRef,
    },
    IdBlock {
        buf: &'a BufferGuard,
    },
}

fn idb_entry(buf: &BufferGuard, index: usize) -> u32 {
    debug_assert!(index < ENTRIES);
    let data = buf.map();
    u32::from_le_bytes(data[index * 4..index * 4 + 4].try_into().unwrap())
}

impl BlockObj<'_> {
    /// The block pointer at the given offset. (Offset must be zero for
    /// an inode object; the subtree reference picks the slot.)
    fn get(&self, offset: usize) -> u32 {
        match self {
            BlockObj::Inode { handle, subtree } => {
                debug_assert_eq!(offset, 0);
                let dino = handle.dinode();
                match subtree.level {
                    0 => dino.direct[subtree.num],
                    1 => dino.indirect,
                    2 => dino.dindirect,
                    3 => dino.tindirect,
                    _ => unreachable!(),
                }
            }
            BlockObj::IdBlock { buf } => idb_entry(buf, offset),
        }
    }

    /// Change the block pointer at the given offset, journaled.
    fn set(&self, vol: &SfsVolume, offset: usize, newval: u32) -> Result<()> {
        match self {
            BlockObj::Inode { handle, subtree } => {
                debug_assert_eq!(offset, 0);
                handle.set_block_ptr(vol, subtree.inode_offset(), newval)
            }
            BlockObj::IdBlock { buf } => {
                vol.meta_patch(buf, offset * 4, &newval.to_le_bytes())
            }
        }
    }
}

impl SfsVolume {
    /// Return the pointer in a block slot, allocating a block into it
    /// if necessary.
    fn bmap_get(
        &self,
        bo: &BlockObj<'_>,
        offset: usize,
        doalloc: bool,
        metadata: bool,
    ) -> Result<u32> {
        let block = bo.get(offset);
        if block == 0 && doalloc {
            let newblock = self.balloc()?;
            if let Err(e) = self.clearblock(newblock, metadata) {
                let _ = self.bfree(newblock);
                return Err(e);
            }
            bo.set(self, offset, newblock)?;
            return Ok(newblock);
        }
        Ok(block)
    }

    /// Walk one of the inode's subtrees down to the leaf. Intermediate
    /// levels are always metadata; `leaf_metadata` says whether the
    /// leaf block itself holds metadata (directory content) or user
    /// data, which decides how its initialization is journaled.
    fn bmap_subtree(
        &self,
        inodeobj: &BlockObj<'_>,
        indir: usize,
        mut offset: u32,
        doalloc: bool,
        leaf_metadata: bool,
    ) -> Result<u32> {
        let mut block = self.bmap_get(
            inodeobj,
            0,
            doalloc,
            if indir == 0 { leaf_metadata } else { true },
        )?;

        let mut indir = indir;
        while indir > 0 {
            if block == 0 {
                debug_assert!(!doalloc);
                return Ok(0);
            }

            let per_entry = BLOCKS_EACH[indir - 1];
            let idoff = (offset / per_entry) as usize;
            offset %= per_entry;

            let idbuf = self.cache.read(block)?;
            let idobj = BlockObj::IdBlock { buf: &idbuf };
            block = self.bmap_get(
                &idobj,
                idoff,
                doalloc,
                if indir == 1 { leaf_metadata } else { true },
            )?;
            drop(idbuf);

            indir -= 1;
        }
        Ok(block)
    }

    /// Look up the disk block for a logical file block. With `doalloc`,
    /// missing blocks (and missing indirect blocks on the way) are
    /// allocated; without it, a hole comes back as block 0.
    ///
    /// Requires the vnode lock and a loaded inode handle.
    pub(crate) fn bmap(
        &self,
        vn: &Vnode,
        handle: &DinodeHandle,
        fileblock: u32,
        doalloc: bool,
        leaf_metadata: bool,
    ) -> Result<u32> {
        let (subtree, offset) = get_indirection(fileblock)?;
        let inodeobj = BlockObj::Inode { handle, subtree };
        let block = self.bmap_subtree(&inodeobj, subtree.level, offset, doalloc, leaf_metadata)?;

        if block != 0 && !self.freemap.bused(block) {
            panic!(
                "data block {} (block {} of file {}) marked free",
                block,
                fileblock,
                vn.ino()
            );
        }
        Ok(block)
    }
}

////////////////////////////////////////////////////////////
// truncate

/// Intersection of [astart, aend) and [bstart, bend); empty -> None.
fn intersect_range(astart: u32, aend: u32, bstart: u32, bend: u32) -> Option<(u32, u32)> {
    debug_assert!(astart <= aend && bstart <= bend);
    if astart == aend || bstart == bend || aend <= bstart || bend <= astart {
        return None;
    }
    Some((astart.max(bstart), aend.min(bend)))
}

/// Per-layer state for the discard walk. Entry zeroing goes through
/// journaled patches, which mark the underlying buffer dirty on the
/// spot, so no separate modified flag is needed.
struct LayerState {
    block: u32,
    buf: Option<BufferGuard>,
    pos: usize,
    hasnonzero: bool,
}

impl LayerState {
    fn empty() -> LayerState {
        LayerState {
            block: 0,
            buf: None,
            pos: 0,
            hasnonzero: false,
        }
    }
}

/// File-block range (relative to the subtree root) mapped by the entry
/// currently under the scan at `layer`. Positions of the layers above
/// contribute; unused layers sit at position zero.
fn entry_span(layers: &[LayerState; 4], layer: usize) -> (u32, u32) {
    let e = ENTRIES as u32;
    let p3 = layers[3].pos as u32;
    let p2 = layers[2].pos as u32;
    let p1 = layers[1].pos as u32;
    match layer {
        3 => {
            let lo = e * e * p3;
            (lo, lo + e * e)
        }
        2 => {
            let lo = e * e * p3 + e * p2;
            (lo, lo + e)
        }
        1 => {
            let lo = e * e * p3 + e * p2 + p1;
            (lo, lo + 1)
        }
        _ => panic!("invalid discard layer {layer}"),
    }
}

impl SfsVolume {
    /// Discard from one of the inode's subtrees. `start` and `end` are
    /// file block numbers relative to the beginning of the subtree.
    /// The freemap is already locked by the caller.
    fn discard_subtree(
        &self,
        fm: &mut FreemapInner,
        handle: &DinodeHandle,
        subtree: SubtreeRef,
        indir: usize,
        start: u32,
        end: u32,
    ) -> Result<()> {
        let root = BlockObj::Inode { handle, subtree }.get(0);
        if root == 0 {
            return Ok(());
        }

        let mut layers: [LayerState; 4] = [
            LayerState::empty(),
            LayerState::empty(),
            LayerState::empty(),
            LayerState::empty(),
        ];
        layers[indir].block = root;
        layers[indir].buf = Some(self.cache.read(root)?);

        let mut level = indir;
        loop {
            if layers[level].pos >= ENTRIES {
                // This indirect block is fully scanned; wrap it up.
                let freed = !layers[level].hasnonzero;
                let block = layers[level].block;
                let buf = layers[level].buf.take().expect("discard layer lost its buffer");
                if freed {
                    // The whole indirect block is empty now; free it.
                    self.bfree_prelocked(fm, block)?;
                    buf.release_invalidate();
                } else {
                    drop(buf);
                }

                if level == indir {
                    if freed {
                        handle.set_block_ptr(self, subtree.inode_offset(), 0)?;
                    }
                    return Ok(());
                }

                let parent = level + 1;
                if freed {
                    let pbuf = layers[parent].buf.as_ref().unwrap();
                    self.meta_patch(pbuf, layers[parent].pos * 4, &0u32.to_le_bytes())?;
                } else {
                    // The child survives, so the parent entry stays.
                    layers[parent].hasnonzero = true;
                }
                layers[parent].pos += 1;
                level = parent;
                continue;
            }

            let pos = layers[level].pos;
            let child = idb_entry(layers[level].buf.as_ref().unwrap(), pos);
            let (lo, hi) = entry_span(&layers, level);

            if intersect_range(lo, hi, start, end).is_none() {
                // Not in the discard range; but remember if we see any
                // nonzero entries in here.
                if child != 0 {
                    layers[level].hasnonzero = true;
                }
                layers[level].pos += 1;
                continue;
            }
            if child == 0 {
                layers[level].pos += 1;
                continue;
            }

            if level == 1 {
                // Leaf entry: zero the pointer and free the data block.
                let buf = layers[level].buf.as_ref().unwrap();
                self.meta_patch(buf, pos * 4, &0u32.to_le_bytes())?;
                self.cache.drop_block(child);
                self.bfree_prelocked(fm, child)?;
                layers[level].pos += 1;
                continue;
            }

            // Descend into the child indirect block.
            layers[level - 1] = LayerState {
                block: child,
                buf: Some(self.cache.read(child)?),
                pos: 0,
                hasnonzero: false,
            };
            level -= 1;
        }
    }

    /// Discard all blocks in the file block range [start, end).
    /// The freemap stays locked for the whole discard.
    fn discard(
        &self,
        fm: &mut FreemapInner,
        handle: &DinodeHandle,
        start: u32,
        end: u32,
    ) -> Result<()> {
        // Direct blocks first.
        let dino = handle.dinode();
        for i in 0..NDIRECT {
            let block = dino.direct[i];
            if (i as u32) >= start && (i as u32) < end && block != 0 {
                self.cache.drop_block(block);
                self.bfree_prelocked(fm, block)?;
                handle.set_block_ptr(self, dinode_field::direct(i), 0)?;
            }
        }

        // Then each indirect subtree that overlaps the range.
        let mut lo = NDIRECT as u32;
        for level in 1..4usize {
            let hi = lo + BLOCKS_EACH[level];
            if let Some((substart, subend)) = intersect_range(lo, hi, start, end) {
                let subtree = SubtreeRef { level, num: 0 };
                self.discard_subtree(fm, handle, subtree, level, substart - lo, subend - lo)?;
            }
            lo = hi;
        }

        Ok(())
    }

    /// Truncate a file (or directory) to the given length, discarding
    /// file blocks past the new end.
    ///
    /// Requires the vnode lock and a loaded inode handle.
    pub(crate) fn itrunc_loaded(
        &self,
        _vn: &Vnode,
        handle: &DinodeHandle,
        newlen: u32,
    ) -> Result<()> {
        let oldlen = handle.dinode().size;
        let oldblocks = oldlen.div_ceil(crate::layout::BLOCK_SIZE as u32);
        let newblocks = newlen.div_ceil(crate::layout::BLOCK_SIZE as u32);

        // The freemap stays locked for the whole truncate.
        let mut fm = self.freemap.lock();

        if newblocks < oldblocks {
            self.discard(&mut fm, handle, newblocks, oldblocks)?;
        }

        handle.set_size(self, newlen)?;
        drop(fm);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indirection_decomposition() {
        // Direct blocks.
        let (st, off) = get_indirection(0).unwrap();
        assert_eq!((st.level, st.num, off), (0, 0, 0));
        let (st, off) = get_indirection(14).unwrap();
        assert_eq!((st.level, st.num, off), (0, 14, 0));

        // First indirect block.
        let (st, off) = get_indirection(15).unwrap();
        assert_eq!((st.level, st.num, off), (1, 0, 0));
        let (st, off) = get_indirection(15 + 127).unwrap();
        assert_eq!((st.level, st.num, off), (1, 0, 127));

        // Double indirect.
        let (st, off) = get_indirection(15 + 128).unwrap();
        assert_eq!((st.level, st.num, off), (2, 0, 0));
        let (st, off) = get_indirection(15 + 128 + 128 * 128 - 1).unwrap();
        assert_eq!((st.level, st.num, off), (2, 0, 128 * 128 - 1));

        // Triple indirect.
        let (st, off) = get_indirection(15 + 128 + 128 * 128).unwrap();
        assert_eq!((st.level, st.num, off), (3, 0, 0));
    }

    #[test]
    fn indirection_rejects_oversize() {
        let max = 15 + 128 + 128 * 128 + 128 * 128 * 128;
        assert!(get_indirection(max - 1).is_ok());
        assert!(matches!(get_indirection(max), Err(SfsError::FileTooBig)));
    }

    #[test]
    fn subtree_inode_offsets() {
        assert_eq!(SubtreeRef { level: 0, num: 3 }.inode_offset(), 8 + 12);
        assert_eq!(SubtreeRef { level: 1, num: 0 }.inode_offset(), dinode_field::INDIRECT);
        assert_eq!(SubtreeRef { level: 3, num: 0 }.inode_offset(), dinode_field::TINDIRECT);
    }

    #[test]
    fn range_intersection() {
        assert_eq!(intersect_range(0, 10, 5, 15), Some((5, 10)));
        assert_eq!(intersect_range(5, 15, 0, 10), Some((5, 10)));
        assert_eq!(intersect_range(0, 5, 5, 10), None);
        assert_eq!(intersect_range(0, 0, 0, 10), None);
        assert_eq!(intersect_range(3, 4, 0, 100), Some((3, 4)));
    }
}
