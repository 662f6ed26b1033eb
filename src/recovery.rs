// Client-level crash recovery.
//
// Three passes over the journal between the recovered tail and head:
// a forward pass collecting the committed transaction set, a forward
// pass redoing every record, and a reverse pass undoing records of
// transactions that never committed. Afterwards the cache, freemap, and
// superblock are flushed synchronously so the disk reflects a
// consistent state before the journal goes live again.
//
// Journal I/O errors here are fatal: the journal must be readable to
// maintain consistency. Malformed records surface as invalid-format so
// mount can refuse the volume.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::error::{Result, SfsError};
use crate::journal::record::{self, Record, TxId, REC_TX_COMMIT};
use crate::journal::Jiter;
use crate::volume::SfsVolume;

/// Journal reads must succeed; anything else recovery can't help.
fn check_journal_io<T>(result: Result<T>) -> Result<T> {
    match result {
        Err(SfsError::Io(e)) => panic!("I/O error reading the journal during recovery: {e}"),
        other => other,
    }
}

impl SfsVolume {
    /// Pass 1 (forward): the set of transaction ids with commit
    /// records.
    fn collect_committed(&self) -> Result<HashSet<TxId>> {
        let mut committed = HashSet::new();
        let mut ji = check_journal_io(Jiter::forward(&self.jphys))?;
        while !ji.done() {
            if ji.record_type() == REC_TX_COMMIT {
                let rec = Record::decode(ji.record_type(), ji.record())?;
                committed.insert(rec.txid());
            }
            check_journal_io(ji.next())?;
        }
        Ok(committed)
    }

    /// Pass 2 (forward): redo every record.
    fn redo_records(&self) -> Result<usize> {
        let mut count = 0;
        let mut ji = check_journal_io(Jiter::forward(&self.jphys))?;
        while !ji.done() {
            let rec = Record::decode(ji.record_type(), ji.record())?;
            debug!(lsn = ji.lsn(), ?rec, "redo");
            record::redo(&rec, &self.cache, &self.freemap);
            count += 1;
            check_journal_io(ji.next())?;
        }
        Ok(count)
    }

    /// Pass 3 (reverse): undo every record of an uncommitted
    /// transaction.
    fn undo_uncommitted(&self, committed: &HashSet<TxId>) -> Result<usize> {
        let mut count = 0;
        let mut ji = check_journal_io(Jiter::backward(&self.jphys))?;
        while !ji.done() {
            let rec = Record::decode(ji.record_type(), ji.record())?;
            if !committed.contains(&rec.txid()) {
                debug!(lsn = ji.lsn(), ?rec, "undo");
                record::undo(&rec, &self.cache, &self.freemap);
                count += 1;
            }
            check_journal_io(ji.prev())?;
        }
        Ok(count)
    }

    /// Run client recovery. Called at mount with the journal in reader
    /// mode, after container recovery.
    pub(crate) fn recover(&self) -> Result<()> {
        let reservation = self.cache.reserve();

        let committed = self.collect_committed()?;
        let redone = self.redo_records()?;
        let undone = self.undo_uncommitted(&committed)?;
        info!(
            committed = committed.len(),
            redone, undone, "journal replay complete"
        );

        // Push the recovered state out synchronously.
        if let Err(e) = self.cache.sync_all() {
            panic!("flushing buffers during recovery: {e}");
        }
        if let Err(e) = self.sync_freemap() {
            panic!("flushing freemap during recovery: {e}");
        }
        if let Err(e) = self.sync_superblock() {
            panic!("flushing superblock during recovery: {e}");
        }

        drop(reservation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::device::{BlockDevice, MemDevice};
    use crate::error::SfsError;
    use crate::journal::record::Record;
    use crate::layout::{Dinode, Direntry, DIRENTRY_SIZE, FREEMAP_START, ROOTDIR_INO};
    use crate::volume::{MountOptions, SfsVolume};

    fn quiet_options() -> MountOptions {
        MountOptions {
            run_syncer: false,
            run_checkpointer: false,
            ..Default::default()
        }
    }

    fn fresh_volume(nblocks: u32, jblocks: u32) -> (Arc<SfsVolume>, Arc<MemDevice>) {
        let mem = Arc::new(MemDevice::new(nblocks));
        SfsVolume::format(
            Arc::clone(&mem) as Arc<dyn BlockDevice>,
            "crashvol",
            Some(jblocks),
        )
        .unwrap();
        let vol =
            SfsVolume::mount(Arc::clone(&mem) as Arc<dyn BlockDevice>, quiet_options()).unwrap();
        (vol, mem)
    }

    fn remount(mem: &Arc<MemDevice>) -> Arc<SfsVolume> {
        SfsVolume::mount(Arc::clone(mem) as Arc<dyn BlockDevice>, quiet_options()).unwrap()
    }

    fn freemap_bit_on_disk(mem: &MemDevice, block: u32) -> bool {
        let raw = mem.raw_block(FREEMAP_START + block / (crate::layout::BITS_PER_BLOCK));
        let bit = block % crate::layout::BITS_PER_BLOCK;
        raw[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }

    /// Crash between commit and data write-back: the journal is
    /// durable, the metadata buffers and the freemap are not. Recovery
    /// must redo the committed transaction.
    #[test]
    fn committed_transaction_is_redone_after_crash() {
        let (vol, mem) = fresh_volume(200, 40);
        let root = vol.root().unwrap();
        let d = vol.create(&root, "d", true).unwrap();
        let ino = d.ino();

        vol.flush_journal().unwrap();
        drop(d);
        drop(root);
        // Crash: nothing but the journal reached the disk.
        drop(vol);
        assert!(!freemap_bit_on_disk(&mem, ino));

        let vol = remount(&mem);
        let root = vol.root().unwrap();
        let d = vol.lookup(&root, "d").unwrap();
        assert_eq!(d.ino(), ino);
        assert!(vol.block_is_used(ino));
        let st = vol.stat(&d).unwrap();
        assert_eq!(st.size, 0);
        assert_eq!(st.linkcount, 1);

        // Recovery flushed the reconciled freemap synchronously.
        assert!(freemap_bit_on_disk(&mem, ino));

        // A second crash and remount finds nothing left to replay and
        // the same state.
        drop(d);
        drop(root);
        drop(vol);
        let vol = remount(&mem);
        let root = vol.root().unwrap();
        let d = vol.lookup(&root, "d").unwrap();
        assert_eq!(d.ino(), ino);
        drop(d);
        drop(root);
        vol.unmount().unwrap();
    }

    /// Crash before commit: pass 1 sees no commit for the transaction,
    /// so pass 3 reverses its freemap capture and its directory entry
    /// scribble.
    #[test]
    fn uncommitted_transaction_is_undone_after_crash() {
        let (vol, mem) = fresh_volume(200, 40);
        vol.sync().unwrap();

        let root_dino = Dinode::decode(&mem.raw_block(ROOTDIR_INO));
        let rootdata = root_dino.direct[0];
        let ghost_offset = 2 * DIRENTRY_SIZE;

        {
            let reservation = vol.cache.reserve();
            // Capture a block and scribble a directory entry without
            // ever committing.
            vol.txs
                .emit(&vol.jphys, |txid| Record::FreemapCapture { txid, block: 100 })
                .unwrap();
            vol.freemap.lock().mark(100);

            let buf = vol.cache.read(rootdata).unwrap();
            let ghost = Direntry::new(100, "ghost").unwrap();
            vol.meta_patch(&buf, ghost_offset, &ghost.encode()).unwrap();
            drop(buf);
            drop(reservation);
        }
        vol.flush_journal().unwrap();
        drop(vol);

        let vol = remount(&mem);
        assert!(!vol.block_is_used(100));
        assert!(!freemap_bit_on_disk(&mem, 100));

        // The scribbled entry was rolled back to zeros on disk.
        let raw = mem.raw_block(rootdata);
        assert!(raw[ghost_offset..ghost_offset + DIRENTRY_SIZE]
            .iter()
            .all(|&x| x == 0));

        let root = vol.root().unwrap();
        assert!(matches!(
            vol.lookup(&root, "ghost"),
            Err(SfsError::NoSuchFile)
        ));
        drop(root);
        vol.unmount().unwrap();
    }

    /// An orphan recorded in the graveyard before a crash is swept at
    /// the next mount.
    #[test]
    fn graveyard_sweeps_orphans_at_mount() {
        let (vol, mem) = fresh_volume(200, 40);
        let root = vol.root().unwrap();
        let baseline: usize = (0..200).filter(|&b| vol.block_is_used(b)).count();

        let f = vol.create(&root, "doomed", true).unwrap();
        vol.write_at(&f, 0, &[0x5au8; 1500]).unwrap();
        vol.remove(&root, "doomed").unwrap();

        // The handle is still open, so the storage survives; make the
        // state durable, then crash before the handle drops (which
        // would have released the storage).
        vol.sync().unwrap();
        std::mem::forget(f);
        drop(root);
        drop(vol);

        let vol = remount(&mem);
        // The sweep released the inode and its data blocks; the
        // graveyard directory keeps the data block it grew for the
        // entry.
        let used: usize = (0..200).filter(|&b| vol.block_is_used(b)).count();
        assert_eq!(used, baseline + 1);
        vol.unmount().unwrap();
    }

    /// Two trips around the journal ring with regular checkpoints:
    /// first-LSN bookkeeping stays consistent and the head never rams
    /// the tail.
    #[test]
    fn journal_wraps_without_collision() {
        let (vol, _mem) = fresh_volume(400, 20);
        let root = vol.root().unwrap();
        let data = [0x55u8; 600];

        let mut cycles = 0;
        while vol.jphys.odometer() < 45 {
            let name = format!("w{cycles}");
            let f = vol.create(&root, &name, true).unwrap();
            vol.write_at(&f, 0, &data).unwrap();
            drop(f);
            vol.remove(&root, &name).unwrap();
            vol.sync().unwrap();
            vol.checkpoint();
            cycles += 1;
            assert!(cycles < 500, "journal failed to wrap");
        }

        // The head block's first-LSN entry matches the head state.
        {
            let st = vol.jphys.state.lock();
            let lm = vol.jphys.lsnmap.lock();
            assert_eq!(lm.first_lsns[st.head_jblock as usize], st.head_first_lsn);
        }

        drop(root);
        vol.unmount().unwrap();
    }
}
