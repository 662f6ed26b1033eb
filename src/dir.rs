// Directory entry routines, built on the metadata I/O primitive. The
// volume has a single flat namespace under the root directory (plus the
// graveyard, which reuses these routines for its own entries).

use std::sync::Arc;

use crate::error::{Result, SfsError};
use crate::inode::{DinodeHandle, Vnode, VnodeRef};
use crate::layout::{Direntry, DIRENTRY_SIZE, NOINO};
use crate::volume::SfsVolume;

impl SfsVolume {
    /// Read the directory entry in the given slot.
    pub(crate) fn readdir_slot(
        &self,
        vn: &Vnode,
        handle: &DinodeHandle,
        slot: usize,
    ) -> Result<Direntry> {
        let mut raw = [0u8; DIRENTRY_SIZE];
        self.meta_read(vn, handle, (slot * DIRENTRY_SIZE) as u32, &mut raw)?;
        Ok(Direntry::decode(&raw))
    }

    /// Write the directory entry in the given slot, extending the
    /// directory if the slot is one past the end.
    pub(crate) fn writedir_slot(
        &self,
        vn: &Vnode,
        handle: &DinodeHandle,
        slot: usize,
        entry: &Direntry,
    ) -> Result<()> {
        debug_assert!(slot <= self.dir_nentries(handle));
        self.meta_write(vn, handle, (slot * DIRENTRY_SIZE) as u32, &entry.encode())
    }

    /// Number of entry slots the directory currently holds.
    pub(crate) fn dir_nentries(&self, handle: &DinodeHandle) -> usize {
        let size = handle.dinode().size as usize;
        if size % DIRENTRY_SIZE != 0 {
            panic!("directory has illegal size {size}");
        }
        size / DIRENTRY_SIZE
    }

    /// Look for a name. Returns the entry's inode and slot if found,
    /// and independently the first empty slot seen, if any.
    pub(crate) fn dir_findname(
        &self,
        vn: &Vnode,
        handle: &DinodeHandle,
        name: &str,
    ) -> Result<(Option<(u32, usize)>, Option<usize>)> {
        let nentries = self.dir_nentries(handle);
        let mut emptyslot = None;
        for slot in 0..nentries {
            let entry = self.readdir_slot(vn, handle, slot)?;
            if entry.ino == NOINO {
                if emptyslot.is_none() {
                    emptyslot = Some(slot);
                }
            } else if entry.name == name {
                return Ok((Some((entry.ino, slot)), emptyslot));
            }
        }
        Ok((None, emptyslot))
    }

    /// Create a directory entry binding `name` to `ino`, reusing an
    /// empty slot if one exists. Returns the slot used.
    pub(crate) fn dir_link(
        &self,
        vn: &Vnode,
        handle: &DinodeHandle,
        name: &str,
        ino: u32,
    ) -> Result<usize> {
        let (found, emptyslot) = self.dir_findname(vn, handle, name)?;
        if found.is_some() {
            return Err(SfsError::Exists);
        }
        let slot = emptyslot.unwrap_or_else(|| self.dir_nentries(handle));
        let entry = Direntry::new(ino, name)?;
        self.writedir_slot(vn, handle, slot, &entry)?;
        Ok(slot)
    }

    /// Erase the entry in the given slot.
    pub(crate) fn dir_unlink(&self, vn: &Vnode, handle: &DinodeHandle, slot: usize) -> Result<()> {
        self.writedir_slot(vn, handle, slot, &Direntry::free())
    }

    /// Check that a directory holds nothing but "." and "..".
    #[allow(dead_code)]
    pub(crate) fn dir_checkempty(&self, vn: &Vnode, handle: &DinodeHandle) -> Result<bool> {
        let nentries = self.dir_nentries(handle);
        for slot in 0..nentries {
            let entry = self.readdir_slot(vn, handle, slot)?;
            if entry.ino != NOINO && entry.name != "." && entry.name != ".." {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Look up a name and hand back a vnode for it, plus the slot the
    /// entry occupies. The directory must be locked.
    pub(crate) fn lookonce(
        self: &Arc<Self>,
        vn: &Vnode,
        handle: &DinodeHandle,
        name: &str,
    ) -> Result<(VnodeRef, usize)> {
        let (found, _) = self.dir_findname(vn, handle, name)?;
        match found {
            Some((ino, slot)) => {
                let target = self.loadvnode(ino, None)?;
                Ok((target, slot))
            }
            None => Err(SfsError::NoSuchFile),
        }
    }
}
