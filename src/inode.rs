// Inode-level operations and vnode lifecycle.
//
// A vnode is the in-memory handle for an inode. Vnodes are created
// lazily on lookup and live in the per-volume table; when the last
// outside reference drops, the vnode is reclaimed, and if the on-disk
// link count is zero at that point the inode's storage is released.
//
// The inode block itself is accessed through a scoped DinodeHandle that
// holds the buffer for the duration of the operation; field updates go
// through journaled patches.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::buffer::BufferGuard;
use crate::error::{Result, SfsError};
use crate::layout::{dinode_field, Dinode, FileType, ROOTDIR_INO, TYPE_INVAL};
use crate::volume::SfsVolume;

pub struct Vnode {
    ino: u32,
    typ: FileType,
    /// The vnode lock: held across every operation that reads or
    /// mutates the file.
    pub(crate) lock: Mutex<()>,
}

impl Vnode {
    pub(crate) fn new(ino: u32, typ: FileType) -> Arc<Vnode> {
        Arc::new(Vnode {
            ino,
            typ,
            lock: Mutex::new(()),
        })
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn file_type(&self) -> FileType {
        self.typ
    }
}

/// A counted reference to a vnode. Dropping the last one reclaims the
/// inode (and releases its storage if no links remain on disk).
pub struct VnodeRef {
    pub(crate) vol: Arc<SfsVolume>,
    pub(crate) vn: Arc<Vnode>,
}

impl VnodeRef {
    pub fn ino(&self) -> u32 {
        self.vn.ino
    }

    pub fn file_type(&self) -> FileType {
        self.vn.typ
    }
}

impl Clone for VnodeRef {
    fn clone(&self) -> VnodeRef {
        VnodeRef {
            vol: Arc::clone(&self.vol),
            vn: Arc::clone(&self.vn),
        }
    }
}

impl Drop for VnodeRef {
    fn drop(&mut self) {
        self.vol.vnode_release(&self.vn);
    }
}

/// Scoped access to an on-disk inode. Holds the inode block's buffer;
/// the handle is created once per operation and dropped when the
/// operation finishes.
pub(crate) struct DinodeHandle {
    buf: BufferGuard,
}

impl DinodeHandle {
    pub fn dinode(&self) -> Dinode {
        Dinode::decode(&self.buf.map())
    }

    pub fn buf(&self) -> &BufferGuard {
        &self.buf
    }

    pub fn set_size(&self, vol: &SfsVolume, size: u32) -> Result<()> {
        vol.meta_patch(&self.buf, dinode_field::SIZE, &size.to_le_bytes())
    }

    pub fn set_type(&self, vol: &SfsVolume, typ: u16) -> Result<()> {
        vol.meta_patch(&self.buf, dinode_field::TYPE, &typ.to_le_bytes())
    }

    pub fn set_linkcount(&self, vol: &SfsVolume, linkcount: u16) -> Result<()> {
        vol.meta_patch(&self.buf, dinode_field::LINKCOUNT, &linkcount.to_le_bytes())
    }

    /// Patch one of the inode's block pointers by its byte offset
    /// (direct slot, indirect, double, or triple).
    pub fn set_block_ptr(&self, vol: &SfsVolume, offset: usize, block: u32) -> Result<()> {
        debug_assert!(
            offset >= dinode_field::DIRECT && offset <= dinode_field::TINDIRECT && offset % 4 == 0
        );
        vol.meta_patch(&self.buf, offset, &block.to_le_bytes())
    }
}

impl SfsVolume {
    /// Load the on-disk inode for a vnode. Requires the vnode lock.
    pub(crate) fn dinode_load(&self, vn: &Vnode) -> Result<DinodeHandle> {
        let buf = self.cache.read(vn.ino)?;
        Ok(DinodeHandle { buf })
    }

    /// Load an inode into memory as a vnode, or dig up one that's
    /// already resident. `forcetype` is set only when creating a new
    /// object, whose freshly zeroed inode block still reads as invalid.
    pub(crate) fn loadvnode(
        self: &Arc<Self>,
        ino: u32,
        forcetype: Option<FileType>,
    ) -> Result<VnodeRef> {
        let mut table = self.vnodes.lock();

        for vn in table.iter() {
            // Every inode in memory must be in an allocated block.
            if !self.freemap.bused(vn.ino) {
                panic!("found inode {} in unallocated block", vn.ino);
            }
            if vn.ino == ino {
                assert!(forcetype.is_none(), "forcetype on a resident vnode");
                return Ok(VnodeRef {
                    vol: Arc::clone(self),
                    vn: Arc::clone(vn),
                });
            }
        }

        // Not resident; load it. Holding the table lock means nobody
        // else can be loading the same inode concurrently.
        if !self.freemap.bused(ino) {
            panic!("tried to load inode {ino} from unallocated block");
        }

        let buf = self.cache.read(ino)?;
        let mut dino = Dinode::decode(&buf.map());

        let typ = match forcetype {
            Some(ft) => {
                assert_eq!(dino.typ, TYPE_INVAL);
                let handle = DinodeHandle { buf };
                handle.set_type(self, ft.to_raw())?;
                dino.typ = ft.to_raw();
                ft
            }
            None => match FileType::from_raw(dino.typ) {
                Some(ft) => ft,
                None => panic!("loadvnode: invalid inode type (inode {ino}, type {})", dino.typ),
            },
        };

        let vn = Vnode::new(ino, typ);
        table.push(Arc::clone(&vn));
        Ok(VnodeRef {
            vol: Arc::clone(self),
            vn,
        })
    }

    /// Create a new filesystem object and hand back its vnode. The new
    /// inode block is allocated, zeroed, and typed under the caller's
    /// transaction; the link count starts at zero.
    pub(crate) fn makeobj(self: &Arc<Self>, typ: FileType) -> Result<VnodeRef> {
        // Each inode is a block and the inode number is the block
        // number, so just allocate a block.
        let ino = self.balloc()?;
        if let Err(e) = self.clearblock(ino, true) {
            let _ = self.bfree(ino);
            return Err(e);
        }

        match self.loadvnode(ino, Some(typ)) {
            Ok(vn) => Ok(vn),
            Err(e) => {
                self.cache.drop_block(ino);
                let _ = self.bfree(ino);
                Err(e)
            }
        }
    }

    /// Vnode for the root of the filesystem.
    pub fn root(self: &Arc<Self>) -> Result<VnodeRef> {
        let reservation = self.cache.reserve();
        let vn = self.loadvnode(ROOTDIR_INO, None)?;
        if vn.file_type() != FileType::Dir {
            drop(reservation);
            return Err(SfsError::InvalidFormat(format!(
                "root directory is not a directory (type {:?})",
                vn.file_type()
            )));
        }
        drop(reservation);
        Ok(vn)
    }

    /// Called as each VnodeRef drops; reclaims the vnode when the table
    /// holds the only other reference.
    pub(crate) fn vnode_release(self: &Arc<Self>, vn: &Arc<Vnode>) {
        let _vlock = vn.lock.lock();
        let mut table = self.vnodes.lock();

        // Two references left means the dropping one plus the table's.
        if Arc::strong_count(vn) > 2 {
            return;
        }

        if let Err(e) = self.reclaim(vn) {
            // Nothing useful to do with the error here; the graveyard
            // sweep at next mount picks up anything left behind.
            warn!(ino = vn.ino, error = %e, "reclaim failed");
        }

        let ix = table
            .iter()
            .position(|v| Arc::ptr_eq(v, vn))
            .unwrap_or_else(|| panic!("reclaim: vnode {} not in vnode table", vn.ino));
        table.swap_remove(ix);
    }

    /// If there are no on-disk references to the file either, erase it.
    /// Runs under the vnode lock and the vnode table lock.
    fn reclaim(self: &Arc<Self>, vn: &Arc<Vnode>) -> Result<()> {
        // We might be inside another operation that already holds a
        // reservation, or called from a bare drop.
        let reservation = if self.cache.has_reservation() {
            None
        } else {
            Some(self.cache.reserve())
        };
        let had_tx = self.txs.has_current();

        let handle = self.dinode_load(vn)?;
        let linkcount = handle.dinode().linkcount;
        let result = if linkcount == 0 {
            match self.itrunc_loaded(vn, &handle, 0) {
                Ok(()) => {
                    drop(handle);
                    // Discard the inode block and its storage.
                    self.cache.drop_block(vn.ino);
                    self.bfree(vn.ino)
                        .and_then(|()| self.graveyard_remove(vn.ino))
                }
                Err(e) => {
                    drop(handle);
                    Err(e)
                }
            }
        } else {
            drop(handle);
            Ok(())
        };

        if !had_tx && self.txs.has_current() {
            self.txs.commit(&self.jphys)?;
        }

        drop(reservation);
        result
    }
}
