// Filesystem-level plumbing: the volume object, mount and unmount,
// format, write-back ordering between the cache and the journal, the
// freemap and superblock write-back, and the background checkpoint
// daemon.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::buffer::{BufferCache, BufferGuard, CacheConfig, CacheIo};
use crate::device::{BlockDevice, Device};
use crate::error::{Result, SfsError};
use crate::freemap::Freemap;
use crate::inode::Vnode;
use crate::journal::jphys::Jphys;
use crate::journal::record::{user_data_checksum, Record, MAX_META_UPDATE_SIZE};
use crate::layout::{
    freemap_blocks, mk_coninfo, Dinode, Direntry, Lsn, Superblock, BLOCK_SIZE, CLASS_CONTAINER,
    CONTAINER_TRIM, DIRENTRY_SIZE, FREEMAP_START, GRAVEYARD_INO, JPHYS_HEADER_SIZE, ROOTDIR_INO,
    SUPER_BLOCK, TYPE_DIR, VOLNAME_SIZE,
};
use crate::transaction::TransactionSet;

/// Mount-time options. The daemons can be turned off for deterministic
/// tests (a dropped volume with no daemons is a faithful crash).
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub cache: CacheConfig,
    pub run_syncer: bool,
    pub run_checkpointer: bool,
    pub checkpoint_interval: Duration,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            cache: CacheConfig::default(),
            run_syncer: true,
            run_checkpointer: true,
            checkpoint_interval: Duration::from_millis(100),
        }
    }
}

/// Results of a stat call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u32,
    pub file_type: crate::layout::FileType,
    pub linkcount: u16,
}

/// The cache's block I/O, with the ordering hooks: journal blocks are
/// flushed in order before any of them is written, and any buffer
/// carrying journaled updates gets the journal flushed up to its
/// highest LSN first (the write-ahead rule).
struct VolumeIo {
    device: Arc<Device>,
    jphys: OnceCell<Arc<Jphys>>,
}

impl CacheIo for VolumeIo {
    fn read_block(&self, block: u32, data: &mut [u8]) -> Result<()> {
        self.device.read_block(block, data)
    }

    fn write_block(&self, block: u32, data: &[u8], lsns: Option<(Lsn, Lsn)>) -> Result<()> {
        if let Some(jphys) = self.jphys.get() {
            if jphys.is_writing() {
                if jphys.block_is_journal(block) {
                    jphys.flush_for_journal_block(block);
                    self.device.write_block(block, data)?;
                    jphys.wrote_journal_block(block);
                    return Ok(());
                }
                if let Some((_, high)) = lsns {
                    jphys.flush_to_lsn(high)?;
                }
            }
        }
        self.device.write_block(block, data)
    }
}

struct Daemons {
    syncer: Option<JoinHandle<()>>,
    checkpointer: Option<JoinHandle<()>>,
}

struct CheckpointCtl {
    stop: Mutex<bool>,
    cv: Condvar,
}

pub struct SfsVolume {
    pub(crate) sb: Superblock,
    pub(crate) super_dirty: Mutex<bool>,
    pub(crate) device: Arc<Device>,
    pub(crate) cache: Arc<BufferCache>,
    pub(crate) freemap: Freemap,
    pub(crate) jphys: Arc<Jphys>,
    pub(crate) txs: Arc<TransactionSet>,
    pub(crate) vnodes: Mutex<Vec<Arc<Vnode>>>,
    pub(crate) graveyard_lock: Mutex<()>,
    pub(crate) rename_lock: Mutex<()>,

    options: MountOptions,
    daemons: Mutex<Daemons>,
    checkpoint_ctl: Arc<CheckpointCtl>,
    unmounted: AtomicBool,
}

impl SfsVolume {
    ////////////////////////////////////////////////////////////
    // format

    /// Write an empty filesystem onto the device: superblock, freemap,
    /// root directory, graveyard, and a journal holding one trim
    /// record.
    pub fn format(
        device: Arc<dyn BlockDevice>,
        volname: &str,
        journal_blocks: Option<u32>,
    ) -> Result<()> {
        let device = Device::new(device);
        let nblocks = device.nblocks();

        if volname.len() >= VOLNAME_SIZE || volname.contains(['\0', ':', '/']) {
            return Err(SfsError::NameTooLong);
        }

        let fmblocks = freemap_blocks(nblocks);
        let journal_start = FREEMAP_START + fmblocks;
        let jblocks = journal_blocks.unwrap_or_else(|| (nblocks / 20).max(2)).max(2);
        let rootdir_data = journal_start + jblocks;
        if rootdir_data + 1 >= nblocks {
            return Err(SfsError::NoSpace);
        }

        // Free block bitmap. The superblock, the inodes of the root
        // directory and the graveyard, the freemap itself, the journal,
        // the root directory's data block, and everything past the end
        // of the volume are permanently in use.
        let fmbits = crate::layout::freemap_bits(nblocks);
        let mut bits = vec![0u8; (fmbits / 8) as usize];
        let mut mark = |block: u32| {
            bits[(block / 8) as usize] |= 1 << (block % 8);
        };
        mark(SUPER_BLOCK);
        mark(ROOTDIR_INO);
        mark(GRAVEYARD_INO);
        for i in 0..fmblocks {
            mark(FREEMAP_START + i);
        }
        for i in 0..jblocks {
            mark(journal_start + i);
        }
        mark(rootdir_data);
        for b in nblocks..fmbits {
            mark(b);
        }

        // Superblock.
        let sb = Superblock {
            nblocks,
            volname: volname.to_owned(),
            journal_start,
            journal_blocks: jblocks,
        };
        device.write_block(SUPER_BLOCK, &sb.encode())?;

        // Freemap.
        for i in 0..fmblocks {
            let start = i as usize * BLOCK_SIZE;
            device.write_block(FREEMAP_START + i, &bits[start..start + BLOCK_SIZE])?;
        }

        // Root directory: inode plus "." and ".." entries.
        let mut root = Dinode::new(TYPE_DIR);
        root.size = (2 * DIRENTRY_SIZE) as u32;
        root.linkcount = 2;
        root.direct[0] = rootdir_data;
        device.write_block(ROOTDIR_INO, &root.encode())?;

        let mut rootdata = [0u8; BLOCK_SIZE];
        let dot = Direntry::new(ROOTDIR_INO, ".")?;
        let dotdot = Direntry::new(ROOTDIR_INO, "..")?;
        rootdata[0..DIRENTRY_SIZE].copy_from_slice(&dot.encode());
        rootdata[DIRENTRY_SIZE..2 * DIRENTRY_SIZE].copy_from_slice(&dotdot.encode());
        device.write_block(rootdir_data, &rootdata)?;

        // Graveyard: an empty directory.
        let mut graveyard = Dinode::new(TYPE_DIR);
        graveyard.linkcount = 1;
        device.write_block(GRAVEYARD_INO, &graveyard.encode())?;

        // Journal: zeros, except a trim record at LSN 1 anchoring
        // recovery on the fresh volume.
        let zero = [0u8; BLOCK_SIZE];
        for i in 1..jblocks {
            device.write_block(journal_start + i, &zero)?;
        }
        let mut first = [0u8; BLOCK_SIZE];
        let reclen = JPHYS_HEADER_SIZE + 8;
        let hdr = mk_coninfo(CLASS_CONTAINER, CONTAINER_TRIM, reclen, 1);
        first[0..8].copy_from_slice(&hdr.to_le_bytes());
        first[8..16].copy_from_slice(&1u64.to_le_bytes());
        device.write_block(journal_start, &first)?;

        Ok(())
    }

    ////////////////////////////////////////////////////////////
    // mount

    /// Mount a volume: validate the superblock, load the freemap, run
    /// container and client recovery, spin up the journal, sweep the
    /// graveyard, trim, and start the background daemons.
    pub fn mount(device: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Arc<SfsVolume>> {
        let device = Arc::new(Device::new(device));

        // Superblock first; everything else depends on it.
        let mut raw = vec![0u8; BLOCK_SIZE];
        device.read_block(SUPER_BLOCK, &mut raw)?;
        let sb = Superblock::decode(&raw)?;

        if sb.journal_blocks >= sb.nblocks {
            warn!("journal takes up whole volume");
        }
        if sb.nblocks > device.nblocks() {
            warn!(
                fs_blocks = sb.nblocks,
                device_blocks = device.nblocks(),
                "filesystem is larger than its device"
            );
        }
        if sb.journal_start + sb.journal_blocks > sb.nblocks || sb.journal_blocks < 2 {
            return Err(SfsError::InvalidFormat("journal lies outside the volume".to_string()));
        }

        let io = Arc::new(VolumeIo {
            device: Arc::clone(&device),
            jphys: OnceCell::new(),
        });
        let cache = BufferCache::new(options.cache.clone(), Arc::clone(&io) as Arc<dyn CacheIo>);

        // Free block bitmap; kept in memory, not in the cache.
        let fmblocks = freemap_blocks(sb.nblocks);
        let mut bits = vec![0u8; fmblocks as usize * BLOCK_SIZE];
        for i in 0..fmblocks {
            let start = i as usize * BLOCK_SIZE;
            device.read_block(FREEMAP_START + i, &mut bits[start..start + BLOCK_SIZE])?;
        }
        let freemap = Freemap::from_bits(bits, sb.nblocks);

        let jphys = Jphys::new(Arc::clone(&cache), sb.journal_start, sb.journal_blocks);
        io.jphys
            .set(Arc::clone(&jphys))
            .unwrap_or_else(|_| unreachable!("journal hook installed twice"));

        let vol = Arc::new(SfsVolume {
            sb,
            super_dirty: Mutex::new(false),
            device,
            cache: Arc::clone(&cache),
            freemap,
            jphys: Arc::clone(&jphys),
            txs: Arc::new(TransactionSet::new()),
            vnodes: Mutex::new(Vec::new()),
            graveyard_lock: Mutex::new(()),
            rename_lock: Mutex::new(()),
            options,
            daemons: Mutex::new(Daemons {
                syncer: None,
                checkpointer: None,
            }),
            checkpoint_ctl: Arc::new(CheckpointCtl {
                stop: Mutex::new(false),
                cv: Condvar::new(),
            }),
            unmounted: AtomicBool::new(false),
        });

        // The journal container pins two fsmanaged buffers (head and
        // next) for the volume's lifetime.
        cache.reserve_fsmanaged(2);

        // Container-level recovery.
        info!(volume = %vol.sb.volname, "loading the journal container");
        if let Err(e) = jphys.loadup() {
            cache.unreserve_fsmanaged(2);
            return Err(e);
        }

        // Client-level recovery.
        jphys.start_reading();
        let recov = vol.recover();
        jphys.stop_reading();
        if let Err(e) = recov {
            cache.unreserve_fsmanaged(2);
            return Err(e);
        }

        // Spin up the journal.
        info!(volume = %vol.sb.volname, "starting journal");
        if let Err(e) = jphys.start_writing() {
            cache.unreserve_fsmanaged(2);
            cache.drop_all();
            return Err(e);
        }

        {
            let reservation = cache.reserve();
            let startup = (|| -> Result<()> {
                // Empty the journal.
                let next = jphys.peek_next_lsn();
                jphys.trim(next);
                jphys.flush_all()?;

                // Empty the graveyard, and empty the journal again.
                vol.graveyard_flush()?;
                let next = jphys.peek_next_lsn();
                jphys.trim(next);
                jphys.flush_all()?;
                Ok(())
            })();
            drop(reservation);
            if let Err(e) = startup {
                jphys.unstart_writing();
                cache.unreserve_fsmanaged(2);
                return Err(e);
            }
        }

        // Background daemons.
        {
            let mut daemons = vol.daemons.lock();
            if vol.options.run_syncer {
                daemons.syncer = Some(cache.spawn_syncer());
            }
            if vol.options.run_checkpointer {
                daemons.checkpointer = Some(vol.spawn_checkpointer());
            }
        }

        info!(volume = %vol.sb.volname, "mounted");
        Ok(vol)
    }

    pub fn volume_name(&self) -> &str {
        &self.sb.volname
    }

    pub fn nblocks(&self) -> u32 {
        self.sb.nblocks
    }

    ////////////////////////////////////////////////////////////
    // journaled update helpers

    /// Journal and apply a metadata byte-range update to a held buffer.
    /// The record goes to the journal before the bytes change in the
    /// cache, and the buffer remembers the LSN so write-back upholds
    /// the write-ahead rule.
    pub(crate) fn meta_patch(&self, buf: &BufferGuard, offset: usize, new: &[u8]) -> Result<()> {
        assert!(new.len() <= MAX_META_UPDATE_SIZE);
        assert!(offset + new.len() <= BLOCK_SIZE);

        let old = buf.map()[offset..offset + new.len()].to_vec();
        if old == new {
            return Ok(());
        }
        let block = buf.block();
        let newvec = new.to_vec();
        let lsn = self.txs.emit(&self.jphys, move |txid| Record::MetaUpdate {
            txid,
            block,
            pos: offset as u32,
            old,
            new: newvec,
        })?;

        buf.map_mut()[offset..offset + new.len()].copy_from_slice(new);
        buf.note_lsn(lsn);
        buf.mark_dirty();
        Ok(())
    }

    /// Journal and apply the zeroing of a freshly allocated metadata
    /// block. Unlike `meta_patch` this never skips: the block's on-disk
    /// content is arbitrary, so recovery must be able to reconstruct
    /// the zero state before replaying later updates into the block.
    pub(crate) fn journal_block_zero(&self, buf: &BufferGuard) -> Result<()> {
        let block = buf.block();
        let zeroes = vec![0u8; MAX_META_UPDATE_SIZE];
        for chunk in 0..(BLOCK_SIZE / MAX_META_UPDATE_SIZE) {
            let offset = chunk * MAX_META_UPDATE_SIZE;
            let old = buf.map()[offset..offset + MAX_META_UPDATE_SIZE].to_vec();
            let newvec = zeroes.clone();
            let lsn = self.txs.emit(&self.jphys, move |txid| Record::MetaUpdate {
                txid,
                block,
                pos: offset as u32,
                old,
                new: newvec,
            })?;
            buf.note_lsn(lsn);
        }
        buf.map_mut().fill(0);
        buf.mark_dirty();
        Ok(())
    }

    /// Journal a user data block write. Called after the new data is in
    /// the buffer and before it is marked dirty; the record carries a
    /// checksum of the block's resulting contents.
    pub(crate) fn journal_user_write(&self, buf: &BufferGuard) -> Result<()> {
        let checksum = user_data_checksum(&buf.map());
        let block = buf.block();
        let lsn = self.txs.emit(&self.jphys, move |txid| Record::UserBlockWrite {
            txid,
            block,
            checksum,
        })?;
        buf.note_lsn(lsn);
        Ok(())
    }

    /// Commit the calling thread's transaction, if any. Every operation
    /// ends with this, including failed ones that unwound their own
    /// changes.
    pub(crate) fn commit_tx(&self) -> Result<()> {
        self.txs.commit(&self.jphys)
    }

    ////////////////////////////////////////////////////////////
    // sync

    /// Write the free block bitmap if it has changed. Writes all bitmap
    /// blocks in order; the on-disk image may go stale again right
    /// after, which recovery tolerates by reconciling from the journal.
    pub(crate) fn sync_freemap(&self) -> Result<()> {
        let mut fm = self.freemap.lock();
        if fm.is_dirty() {
            for i in 0..freemap_blocks(self.sb.nblocks) {
                self.device.write_block(FREEMAP_START + i, fm.block_data(i))?;
            }
            fm.clear_dirty();
        }
        Ok(())
    }

    pub(crate) fn sync_superblock(&self) -> Result<()> {
        let mut dirty = self.super_dirty.lock();
        if *dirty {
            self.device.write_block(SUPER_BLOCK, &self.sb.encode())?;
            *dirty = false;
        }
        Ok(())
    }

    /// Flush everything: journal first, then the cache, the freemap,
    /// and the superblock.
    pub fn sync(&self) -> Result<()> {
        if self.jphys.is_writing() {
            self.jphys.flush_all()?;
        }
        self.cache.sync_all()?;
        self.sync_freemap()?;
        self.sync_superblock()?;
        Ok(())
    }

    /// Flush the journal only. Crash tests use this to make the log
    /// durable while leaving data blocks unwritten.
    pub fn flush_journal(&self) -> Result<()> {
        self.jphys.flush_all()
    }

    /// One checkpoint pass: reap durable transactions, trim the tail.
    pub fn checkpoint(&self) {
        self.txs.checkpoint(&self.jphys, &self.cache);
    }

    fn spawn_checkpointer(self: &Arc<Self>) -> JoinHandle<()> {
        let ctl = Arc::clone(&self.checkpoint_ctl);
        let txs = Arc::clone(&self.txs);
        let jphys = Arc::clone(&self.jphys);
        let cache = Arc::clone(&self.cache);
        let interval = self.options.checkpoint_interval;
        std::thread::Builder::new()
            .name("sfs-checkpoint".into())
            .spawn(move || {
                let mut stop = ctl.stop.lock();
                loop {
                    if *stop {
                        // One final checkpoint on the way out.
                        drop(stop);
                        txs.checkpoint(&jphys, &cache);
                        return;
                    }
                    drop(stop);
                    txs.checkpoint(&jphys, &cache);
                    stop = ctl.stop.lock();
                    if !*stop {
                        let _ = ctl.cv.wait_for(&mut stop, interval);
                    }
                }
            })
            .expect("spawning checkpoint daemon failed")
    }

    fn stop_daemons(&self) {
        let mut daemons = self.daemons.lock();
        if let Some(handle) = daemons.checkpointer.take() {
            *self.checkpoint_ctl.stop.lock() = true;
            self.checkpoint_ctl.cv.notify_all();
            let _ = handle.join();
        }
        if let Some(handle) = daemons.syncer.take() {
            self.cache.stop_syncer(handle);
        }
    }

    ////////////////////////////////////////////////////////////
    // unmount

    /// Unmount: refuse while any file is in use, then checkpoint,
    /// flush, stop the journal, and drop every buffer.
    pub fn unmount(&self) -> Result<()> {
        {
            let vnodes = self.vnodes.lock();
            if !vnodes.is_empty() {
                return Err(SfsError::Busy);
            }
        }

        self.stop_daemons();

        // Checkpoint while the dirty state still exists so the trim
        // lands, then flush everything; reaping the rest must not
        // append any more records, or the head would be mid-block when
        // the journal shuts down.
        self.checkpoint();
        self.sync()?;
        let _ = self.txs.reap(&self.cache);

        self.jphys.stop_writing();
        self.cache.unreserve_fsmanaged(2);

        debug_assert_eq!(self.txs.live_transactions(), 0);

        // All buffers should be clean now; drop them.
        self.cache.drop_all();
        self.unmounted.store(true, Ordering::Release);
        info!(volume = %self.sb.volname, "unmounted");
        Ok(())
    }
}

impl Drop for SfsVolume {
    fn drop(&mut self) {
        // An un-unmounted drop is a crash: stop the daemons but write
        // nothing.
        if !self.unmounted.load(Ordering::Acquire) {
            self.stop_daemons();
            debug!(volume = %self.sb.volname, "volume dropped without unmount");
        }
    }
}
