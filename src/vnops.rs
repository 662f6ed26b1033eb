// File-level operations: create, lookup, read, write, truncate,
// remove, rename, link, stat.
//
// Locking protocol:
//    vnode locks        before  vnode table lock
//    vnode locks        before  buffer locks / journal lock
//    vnode table lock   before  freemap lock
//    buffer lock        before  freemap lock
//    directory lock     before  the lock of a file inside it
//
// Every mutating operation reserves buffers up front, runs under the
// vnode lock, appends its records before dirtying cache pages, and
// commits its transaction on the way out, including on the error paths
// that unwound their own changes.

use std::sync::Arc;

use crate::error::{Result, SfsError};
use crate::inode::VnodeRef;
use crate::layout::{FileType, NAME_LEN};
use crate::volume::{FileStat, SfsVolume};

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(SfsError::NoSuchFile);
    }
    if name.len() >= NAME_LEN {
        return Err(SfsError::NameTooLong);
    }
    Ok(())
}

impl SfsVolume {
    /// Look up a name in a directory.
    pub fn lookup(self: &Arc<Self>, dir: &VnodeRef, name: &str) -> Result<VnodeRef> {
        if dir.file_type() != FileType::Dir {
            return Err(SfsError::NotADirectory);
        }
        check_name(name)?;

        let _dl = dir.vn.lock.lock();
        let reservation = self.cache.reserve();
        let handle = self.dinode_load(&dir.vn)?;
        let (target, _slot) = self.lookonce(&dir.vn, &handle, name)?;
        drop(handle);
        drop(reservation);
        Ok(target)
    }

    /// List a directory's live entries.
    pub fn read_dir(self: &Arc<Self>, dir: &VnodeRef) -> Result<Vec<(String, u32)>> {
        if dir.file_type() != FileType::Dir {
            return Err(SfsError::NotADirectory);
        }
        let _dl = dir.vn.lock.lock();
        let reservation = self.cache.reserve();
        let handle = self.dinode_load(&dir.vn)?;
        let mut out = Vec::new();
        for slot in 0..self.dir_nentries(&handle) {
            let entry = self.readdir_slot(&dir.vn, &handle, slot)?;
            if entry.ino != crate::layout::NOINO {
                out.push((entry.name, entry.ino));
            }
        }
        drop(handle);
        drop(reservation);
        Ok(out)
    }

    /// Create a file. With `excl`, an existing file of the same name is
    /// an error; otherwise it is simply opened.
    pub fn create(self: &Arc<Self>, dir: &VnodeRef, name: &str, excl: bool) -> Result<VnodeRef> {
        if dir.file_type() != FileType::Dir {
            return Err(SfsError::NotADirectory);
        }
        check_name(name)?;

        let _dl = dir.vn.lock.lock();
        let reservation = self.cache.reserve();
        let handle = self.dinode_load(&dir.vn)?;

        // Look up the name first.
        let (found, _) = self.dir_findname(&dir.vn, &handle, name)?;
        if let Some((ino, _slot)) = found {
            if excl {
                return Err(SfsError::Exists);
            }
            // Already there; hand back its vnode.
            let existing = self.loadvnode(ino, None)?;
            return Ok(existing);
        }

        // Didn't exist; create it. The new vnode needs no lock of its
        // own: nobody can reach it except through this directory, which
        // is locked.
        let result = (|| {
            let newguy = self.makeobj(FileType::File)?;
            let new_handle = self.dinode_load(&newguy.vn)?;

            self.dir_link(&dir.vn, &handle, name, newguy.ino())?;
            new_handle.set_linkcount(self, 1)?;
            Ok(newguy)
        })();

        drop(handle);
        let commit = self.commit_tx();
        drop(reservation);
        commit?;
        result
    }

    /// Read from a file at a byte offset. Returns the number of bytes
    /// read, clamped at end of file.
    pub fn read_at(self: &Arc<Self>, file: &VnodeRef, pos: u32, out: &mut [u8]) -> Result<usize> {
        if file.file_type() != FileType::File {
            return Err(SfsError::IsADirectory);
        }
        let _fl = file.vn.lock.lock();
        let reservation = self.cache.reserve();
        let handle = self.dinode_load(&file.vn)?;
        let n = self.file_read(&file.vn, &handle, pos, out)?;
        drop(handle);
        drop(reservation);
        Ok(n)
    }

    /// Write to a file at a byte offset, growing it as needed. Returns
    /// the number of bytes written.
    pub fn write_at(self: &Arc<Self>, file: &VnodeRef, pos: u32, data: &[u8]) -> Result<usize> {
        if file.file_type() != FileType::File {
            return Err(SfsError::IsADirectory);
        }
        let _fl = file.vn.lock.lock();
        let reservation = self.cache.reserve();
        let handle = self.dinode_load(&file.vn)?;
        let result = self.file_write(&file.vn, &handle, pos, data);
        drop(handle);
        let commit = self.commit_tx();
        drop(reservation);
        commit?;
        result
    }

    /// Truncate a file to the given length.
    pub fn truncate(self: &Arc<Self>, file: &VnodeRef, len: u32) -> Result<()> {
        if file.file_type() != FileType::File {
            return Err(SfsError::IsADirectory);
        }
        let _fl = file.vn.lock.lock();
        let reservation = self.cache.reserve();
        let handle = self.dinode_load(&file.vn)?;
        let result = self.itrunc_loaded(&file.vn, &handle, len);
        drop(handle);
        let commit = self.commit_tx();
        drop(reservation);
        commit?;
        result
    }

    /// File metadata.
    pub fn stat(self: &Arc<Self>, file: &VnodeRef) -> Result<FileStat> {
        let _fl = file.vn.lock.lock();
        let reservation = self.cache.reserve();
        let handle = self.dinode_load(&file.vn)?;
        let dino = handle.dinode();
        drop(handle);
        drop(reservation);
        Ok(FileStat {
            size: dino.size,
            file_type: file.file_type(),
            linkcount: dino.linkcount,
        })
    }

    /// Delete a name. The file's storage goes away when its link count
    /// is zero and the last reference drops; if it is still open at
    /// that point, the graveyard keeps track of it meanwhile.
    pub fn remove(self: &Arc<Self>, dir: &VnodeRef, name: &str) -> Result<()> {
        if dir.file_type() != FileType::Dir {
            return Err(SfsError::NotADirectory);
        }
        // Refuse these before locking anything.
        if name == "." || name == ".." {
            return Err(SfsError::IsADirectory);
        }
        check_name(name)?;

        let _dl = dir.vn.lock.lock();
        let reservation = self.cache.reserve();
        let handle = self.dinode_load(&dir.vn)?;

        let (victim, slot) = self.lookonce(&dir.vn, &handle, name)?;
        if victim.file_type() == FileType::Dir {
            // No subdirectories, so the only directories a name can
            // reach are the root's own dot entries, handled above; a
            // directory here means a corrupted volume.
            return Err(SfsError::IsADirectory);
        }

        let result = (|| {
            let _vl = victim.vn.lock.lock();
            let victim_handle = self.dinode_load(&victim.vn)?;
            let linkcount = victim_handle.dinode().linkcount;
            assert!(linkcount > 0);

            self.dir_unlink(&dir.vn, &handle, slot)?;
            victim_handle.set_linkcount(self, linkcount - 1)?;

            if linkcount - 1 == 0 {
                self.graveyard_add(victim.ino())?;
            }
            Ok(())
        })();

        drop(handle);
        let commit = self.commit_tx();
        // The victim reference drops here, after its lock is released
        // and the transaction is committed; if it was the last one, the
        // storage is reclaimed now.
        drop(victim);
        drop(reservation);
        commit?;
        result
    }

    /// Make a hard link to a file. Directories can't be hard-linked.
    pub fn link(self: &Arc<Self>, dir: &VnodeRef, name: &str, file: &VnodeRef) -> Result<()> {
        if dir.file_type() != FileType::Dir {
            return Err(SfsError::NotADirectory);
        }
        if file.file_type() == FileType::Dir {
            return Err(SfsError::IsADirectory);
        }
        check_name(name)?;
        assert!(!Arc::ptr_eq(&dir.vn, &file.vn));

        let reservation = self.cache.reserve();
        // Directory first, then the file inside it.
        let _dl = dir.vn.lock.lock();
        let _fl = file.vn.lock.lock();

        let result = (|| {
            let dir_handle = self.dinode_load(&dir.vn)?;
            let file_handle = self.dinode_load(&file.vn)?;

            self.dir_link(&dir.vn, &dir_handle, name, file.ino())?;
            let linkcount = file_handle.dinode().linkcount;
            file_handle.set_linkcount(self, linkcount + 1)?;
            Ok(())
        })();

        let commit = self.commit_tx();
        drop(reservation);
        commit?;
        result
    }

    /// Rename a file within the root directory: link the new name, then
    /// unlink the old slot.
    pub fn rename(self: &Arc<Self>, dir: &VnodeRef, from: &str, to: &str) -> Result<()> {
        if dir.file_type() != FileType::Dir {
            return Err(SfsError::NotADirectory);
        }
        if from == "." || from == ".." || to == "." || to == ".." {
            return Err(SfsError::IsADirectory);
        }
        check_name(from)?;
        check_name(to)?;

        let _rl = self.rename_lock.lock();
        let _dl = dir.vn.lock.lock();
        let reservation = self.cache.reserve();
        let handle = self.dinode_load(&dir.vn)?;

        let (target, oldslot) = self.lookonce(&dir.vn, &handle, from)?;

        let result = (|| {
            let _tl = target.vn.lock.lock();
            let target_handle = self.dinode_load(&target.vn)?;
            let linkcount = target_handle.dinode().linkcount;
            assert!(linkcount > 0);
            assert_eq!(target.file_type(), FileType::File);

            // Link under the new name first so the file is never
            // nameless; then retire the old entry.
            let newslot = self.dir_link(&dir.vn, &handle, to, target.ino())?;
            target_handle.set_linkcount(self, linkcount + 1)?;

            if let Err(e) = self.dir_unlink(&dir.vn, &handle, oldslot) {
                // Unwind the new link. If even that fails, the
                // directory can't be put back together.
                if let Err(e2) = self.dir_unlink(&dir.vn, &handle, newslot) {
                    panic!("rename: cannot recover: {e} while cleaning up: {e2}");
                }
                target_handle.set_linkcount(self, linkcount)?;
                return Err(e);
            }
            target_handle.set_linkcount(self, linkcount)?;
            Ok(())
        })();

        drop(handle);
        let commit = self.commit_tx();
        drop(target);
        drop(reservation);
        commit?;
        result
    }
}
