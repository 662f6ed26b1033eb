// The graveyard: a hidden directory recording inodes whose link count
// dropped to zero while still open. Reclaim removes the entry once the
// storage is actually released; anything still listed at mount time is
// an orphan from a crash and gets swept.
//
// Graveyard entries are named by the decimal inode number. The
// graveyard inode is accessed through a private vnode that never enters
// the vnode table, serialized by its own lock.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::inode::Vnode;
use crate::layout::{FileType, GRAVEYARD_INO, NOINO};
use crate::volume::SfsVolume;

impl SfsVolume {
    /// A private vnode for the graveyard directory. Only used under
    /// the graveyard lock.
    fn graveyard_vnode(&self) -> Arc<Vnode> {
        Vnode::new(GRAVEYARD_INO, FileType::Dir)
    }

    /// Record an inode whose on-disk link count just hit zero.
    pub(crate) fn graveyard_add(&self, ino: u32) -> Result<()> {
        let _gl = self.graveyard_lock.lock();
        let graveyard = self.graveyard_vnode();
        let _vl = graveyard.lock.lock();
        let handle = self.dinode_load(&graveyard)?;

        let name = ino.to_string();
        self.dir_link(&graveyard, &handle, &name, ino)?;
        Ok(())
    }

    /// Drop an inode's graveyard entry after its storage is released.
    /// Quietly does nothing if there is no entry; creation unwinding
    /// reclaims inodes that never went through remove.
    pub(crate) fn graveyard_remove(&self, ino: u32) -> Result<()> {
        let _gl = self.graveyard_lock.lock();
        let graveyard = self.graveyard_vnode();
        let _vl = graveyard.lock.lock();
        let handle = self.dinode_load(&graveyard)?;

        let name = ino.to_string();
        let (found, _) = self.dir_findname(&graveyard, &handle, &name)?;
        if let Some((entry_ino, slot)) = found {
            assert_eq!(entry_ino, ino);
            self.dir_unlink(&graveyard, &handle, slot)?;
        }
        Ok(())
    }

    /// Sweep the graveyard at mount time: every listed inode is an
    /// orphan whose storage was never released. Truncate it, free its
    /// inode block, and clear the entry, one committed transaction per
    /// orphan.
    pub(crate) fn graveyard_flush(self: &Arc<Self>) -> Result<()> {
        let _gl = self.graveyard_lock.lock();
        let graveyard = self.graveyard_vnode();
        let _vl = graveyard.lock.lock();
        let handle = self.dinode_load(&graveyard)?;

        let nentries = self.dir_nentries(&handle);
        for slot in 0..nentries {
            let entry = self.readdir_slot(&graveyard, &handle, slot)?;
            if entry.ino == NOINO {
                continue;
            }
            info!(ino = entry.ino, "sweeping orphaned inode");

            if let Err(e) = self.reap_orphan(entry.ino) {
                warn!(ino = entry.ino, error = %e, "orphan sweep failed");
                let _ = self.commit_tx();
                continue;
            }

            self.dir_unlink(&graveyard, &handle, slot)?;
            self.commit_tx()?;
        }
        Ok(())
    }

    /// Release an orphan's storage: truncate to zero and free the
    /// inode block.
    fn reap_orphan(self: &Arc<Self>, ino: u32) -> Result<()> {
        let orphan = Vnode::new(ino, FileType::File);
        let _vl = orphan.lock.lock();
        let handle = self.dinode_load(&orphan)?;
        self.itrunc_loaded(&orphan, &handle, 0)?;
        drop(handle);
        self.cache.drop_block(ino);
        self.bfree(ino)?;
        Ok(())
    }
}
