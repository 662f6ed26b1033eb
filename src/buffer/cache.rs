// Buffer cache.
//
// Physically indexed block->buffer map with busy/valid/dirty/fsmanaged
// flags, an LRU-ordered attached table, an age-ordered dirty table, and a
// detached pool. The ordered tables carry holes and are compacted lazily;
// generation counters let in-progress sweeps notice compaction and
// restart. Admission is reservation-based: a thread reserves a fixed
// count of buffers per operation up front, which is what makes "every
// admitted operation can complete" hold.
//
// The cache mutex is dropped across all I/O (the buffer's busy bit
// protects it meanwhile), because writing a block out can reenter the
// cache through the filesystem's ordered-journal hook.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::warn;

use crate::error::{Result, SfsError};
use crate::layout::{Lsn, BLOCK_SIZE};

/// Number of buffers reserved for each file system operation.
pub const RESERVE_BUFFERS: usize = 8;

/// Illegal table index.
const INVALID_INDEX: usize = usize::MAX;

/// Factors for the lazy-compaction thresholds.
const ATTACHED_THRESH_NUM: usize = 3;
const ATTACHED_THRESH_DENOM: usize = 2;
const DIRTY_THRESH_NUM: usize = 5;
const DIRTY_THRESH_DENOM: usize = 4;

std::thread_local! {
    static DID_RESERVE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Block I/O done on the cache's behalf. The filesystem's implementation
/// enforces journal ordering and the WAL rule before touching the device.
pub trait CacheIo: Send + Sync {
    fn read_block(&self, block: u32, data: &mut [u8]) -> Result<()>;
    /// `lsns` carries the (lowest, highest) client-update LSNs recorded
    /// in the buffer since it was last clean, if any.
    fn write_block(&self, block: u32, data: &[u8], lsns: Option<(Lsn, Lsn)>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Hard cap on the number of buffers.
    pub max_buffers: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig { max_buffers: 128 }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub total_gets: u64,
    pub valid_gets: u64,
    pub read_gets: u64,
    pub total_writeouts: u64,
    pub total_evictions: u64,
    pub dirty_evictions: u64,
}

/// One buffer. All fields are guarded by the cache mutex except `data`,
/// which is guarded by the busy protocol (its own mutex is uncontended
/// and exists to let holders work on the bytes with the cache unlocked).
struct Buf {
    block: u32,
    data: Arc<Mutex<Box<[u8]>>>,

    attached: bool,
    busy: bool,
    valid: bool,
    dirty: bool,
    fsmanaged: bool,
    holder: Option<ThreadId>,

    table_index: usize,
    dirty_index: usize,
    dirty_epoch: u64,
    dirty_at: Instant,

    /// Lowest/highest client-update LSN landed in this buffer since it
    /// was last clean; 0 = none.
    low_lsn: Lsn,
    high_lsn: Lsn,
}

impl Buf {
    fn new() -> Buf {
        Buf {
            block: 0,
            data: Arc::new(Mutex::new(vec![0u8; BLOCK_SIZE].into_boxed_slice())),
            attached: false,
            busy: false,
            valid: false,
            dirty: false,
            fsmanaged: false,
            holder: None,
            table_index: INVALID_INDEX,
            dirty_index: INVALID_INDEX,
            dirty_epoch: 0,
            dirty_at: Instant::now(),
            low_lsn: 0,
            high_lsn: 0,
        }
    }
}

pub(crate) struct CacheInner {
    bufs: Vec<Buf>,
    hash: HashMap<u32, usize>,

    /// LRU-ordered table of attached buffers, with holes.
    attached: Vec<Option<usize>>,
    attached_first: usize,
    attached_count: usize,
    pub(crate) attached_gen: u64,

    /// Table of dirty buffers ordered by first-dirtied time, with holes.
    dirty: Vec<Option<usize>>,
    dirty_first: usize,
    pub(crate) dirty_count: usize,
    pub(crate) dirty_gen: u64,

    /// Unattached buffers, unordered.
    detached: Vec<usize>,

    dirty_epoch: u64,
    num_reserved: usize,
    busy_count: usize,

    pub(crate) syncer_under_load: bool,
    pub(crate) syncer_needs_help: bool,

    stats: CacheStats,
}

pub struct BufferCache {
    pub(crate) inner: Mutex<CacheInner>,
    pub(crate) busy_cv: Condvar,
    reserve_cv: Condvar,
    pub(crate) syncer_cv: Condvar,
    max_buffers: usize,
    attached_thresh: usize,
    dirty_thresh: usize,
    io: Arc<dyn CacheIo>,
    pub(crate) shutdown: std::sync::atomic::AtomicBool,
}

impl BufferCache {
    pub fn new(config: CacheConfig, io: Arc<dyn CacheIo>) -> Arc<BufferCache> {
        assert!(config.max_buffers >= 2 * RESERVE_BUFFERS);
        Arc::new(BufferCache {
            inner: Mutex::new(CacheInner {
                bufs: Vec::new(),
                hash: HashMap::new(),
                attached: Vec::new(),
                attached_first: 0,
                attached_count: 0,
                attached_gen: 0,
                dirty: Vec::new(),
                dirty_first: 0,
                dirty_count: 0,
                dirty_gen: 0,
                detached: Vec::new(),
                dirty_epoch: 0,
                num_reserved: 0,
                busy_count: 0,
                syncer_under_load: false,
                syncer_needs_help: false,
                stats: CacheStats::default(),
            }),
            busy_cv: Condvar::new(),
            reserve_cv: Condvar::new(),
            syncer_cv: Condvar::new(),
            max_buffers: config.max_buffers,
            attached_thresh: config.max_buffers * ATTACHED_THRESH_NUM / ATTACHED_THRESH_DENOM,
            dirty_thresh: config.max_buffers * DIRTY_THRESH_NUM / DIRTY_THRESH_DENOM,
            io,
            shutdown: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    ////////////////////////////////////////////////////////////
    // reservation

    /// Claim the right to use RESERVE_BUFFERS buffers. Blocks until the
    /// claim fits under the cap. One reservation per thread; releasing is
    /// the returned guard's drop.
    pub fn reserve(self: &Arc<Self>) -> Reservation {
        assert!(
            !DID_RESERVE.with(|c| c.get()),
            "buffer reservations must be done up front, all at once"
        );
        let mut g = self.inner.lock();
        while g.num_reserved + RESERVE_BUFFERS > self.max_buffers {
            self.reserve_cv.wait(&mut g);
        }
        g.num_reserved += RESERVE_BUFFERS;
        DID_RESERVE.with(|c| c.set(true));
        Reservation {
            cache: Arc::clone(self),
        }
    }

    /// Whether the calling thread already holds a reservation.
    pub fn has_reservation(&self) -> bool {
        DID_RESERVE.with(|c| c.get())
    }

    fn unreserve(&self) {
        let mut g = self.inner.lock();
        assert!(DID_RESERVE.with(|c| c.get()));
        assert!(RESERVE_BUFFERS <= g.num_reserved);
        DID_RESERVE.with(|c| c.set(false));
        g.num_reserved -= RESERVE_BUFFERS;
        self.reserve_cv.notify_all();
    }

    /// Reserve buffers on behalf of the filesystem itself (journal
    /// heads). Not tied to a thread.
    pub fn reserve_fsmanaged(&self, count: usize) {
        let mut g = self.inner.lock();
        while g.num_reserved + count > self.max_buffers {
            self.reserve_cv.wait(&mut g);
        }
        g.num_reserved += count;
    }

    pub fn unreserve_fsmanaged(&self, count: usize) {
        let mut g = self.inner.lock();
        assert!(count <= g.num_reserved);
        g.num_reserved -= count;
        self.reserve_cv.notify_all();
    }

    ////////////////////////////////////////////////////////////
    // table maintenance

    fn compact_attached(g: &mut CacheInner) {
        let mut j = g.attached_first;
        for i in g.attached_first..g.attached.len() {
            if let Some(id) = g.attached[i] {
                if j < i {
                    debug_assert_eq!(g.bufs[id].table_index, i);
                    g.bufs[id].table_index = j;
                    g.attached[j] = Some(id);
                }
                j += 1;
            }
        }
        g.attached.truncate(j);
        g.attached_first = j;
        debug_assert_eq!(g.attached_count, g.attached.iter().flatten().count());
        g.attached_gen = g.attached_gen.wrapping_add(1);
    }

    fn compact_dirty(g: &mut CacheInner) {
        let mut j = g.dirty_first;
        for i in g.dirty_first..g.dirty.len() {
            if let Some(id) = g.dirty[i] {
                if j < i {
                    debug_assert_eq!(g.bufs[id].dirty_index, i);
                    g.bufs[id].dirty_index = j;
                    g.dirty[j] = Some(id);
                }
                j += 1;
            }
        }
        g.dirty.truncate(j);
        g.dirty_first = j;
        g.dirty_gen = g.dirty_gen.wrapping_add(1);
    }

    fn insert_attached(&self, g: &mut CacheInner, id: usize) {
        debug_assert!(g.bufs[id].attached);
        debug_assert_eq!(g.bufs[id].table_index, INVALID_INDEX);
        if g.attached.len() >= self.attached_thresh {
            Self::compact_attached(g);
        }
        g.bufs[id].table_index = g.attached.len();
        g.attached.push(Some(id));
        g.attached_count += 1;
    }

    fn remove_attached(g: &mut CacheInner, id: usize, expect_busy: bool) {
        debug_assert!(g.bufs[id].attached);
        debug_assert_eq!(g.bufs[id].busy, expect_busy);
        let ix = g.bufs[id].table_index;
        debug_assert_eq!(g.attached[ix], Some(id));
        g.attached[ix] = None;
        g.bufs[id].table_index = INVALID_INDEX;
        if ix < g.attached_first {
            g.attached_first = ix;
        }
        g.attached_count -= 1;
    }

    fn insert_dirty(&self, g: &mut CacheInner, id: usize) {
        debug_assert!(g.bufs[id].attached);
        debug_assert!(g.bufs[id].busy);
        debug_assert_eq!(g.bufs[id].dirty_index, INVALID_INDEX);
        if g.dirty.len() >= self.dirty_thresh {
            Self::compact_dirty(g);
        }
        g.bufs[id].dirty_index = g.dirty.len();
        g.dirty.push(Some(id));
    }

    fn remove_dirty(g: &mut CacheInner, id: usize) {
        let ix = g.bufs[id].dirty_index;
        debug_assert_eq!(g.dirty[ix], Some(id));
        g.dirty[ix] = None;
        g.bufs[id].dirty_index = INVALID_INDEX;
        if ix < g.dirty_first {
            g.dirty_first = ix;
        }
    }

    ////////////////////////////////////////////////////////////
    // busy protocol

    /// Mark a buffer busy, waiting if necessary. Fails with StaleBuffer
    /// if the buffer got detached (or detached and reattached elsewhere)
    /// while we slept; callers redo the lookup.
    fn mark_busy(&self, g: &mut MutexGuard<'_, CacheInner>, id: usize) -> Result<()> {
        let block = g.bufs[id].block;
        debug_assert!(g.bufs[id].holder != Some(std::thread::current().id()));
        while g.bufs[id].busy {
            if !g.bufs[id].attached || g.bufs[id].block != block {
                return Err(SfsError::StaleBuffer);
            }
            self.busy_cv.wait(g);
        }
        if !g.bufs[id].attached || g.bufs[id].block != block {
            return Err(SfsError::StaleBuffer);
        }
        let b = &mut g.bufs[id];
        b.busy = true;
        assert!(!b.fsmanaged);
        b.holder = Some(std::thread::current().id());
        g.busy_count += 1;
        Ok(())
    }

    fn unmark_busy(&self, g: &mut CacheInner, id: usize) {
        let b = &mut g.bufs[id];
        assert!(b.busy);
        b.busy = false;
        if b.fsmanaged {
            b.fsmanaged = false;
        } else {
            debug_assert_eq!(b.holder, Some(std::thread::current().id()));
        }
        b.holder = None;
        g.busy_count -= 1;
        self.busy_cv.notify_all();
    }

    ////////////////////////////////////////////////////////////
    // I/O

    /// Disk to buffer. Drops the cache lock across the read; the busy
    /// bit keeps the buffer ours.
    fn readin(&self, g: &mut MutexGuard<'_, CacheInner>, id: usize) -> Result<()> {
        debug_assert!(g.bufs[id].attached && g.bufs[id].busy);
        if g.bufs[id].valid {
            return Ok(());
        }
        let block = g.bufs[id].block;
        let data = Arc::clone(&g.bufs[id].data);
        let io = Arc::clone(&self.io);
        let result = MutexGuard::unlocked(g, || {
            let mut d = data.lock();
            io.read_block(block, &mut d)
        });
        if result.is_ok() {
            g.bufs[id].valid = true;
        }
        result
    }

    /// Buffer to disk. Requires the buffer busy. A failed write leaves
    /// the buffer dirty and attached.
    fn writeout_internal(&self, g: &mut MutexGuard<'_, CacheInner>, id: usize) -> Result<()> {
        debug_assert!(g.bufs[id].attached && g.bufs[id].valid && g.bufs[id].busy);
        if !g.bufs[id].dirty {
            return Ok(());
        }
        g.stats.total_writeouts += 1;
        let block = g.bufs[id].block;
        let data = Arc::clone(&g.bufs[id].data);
        let lsns = match (g.bufs[id].low_lsn, g.bufs[id].high_lsn) {
            (0, _) => None,
            (lo, hi) => Some((lo, hi)),
        };
        let io = Arc::clone(&self.io);
        let result = MutexGuard::unlocked(g, || {
            let d = data.lock();
            io.write_block(block, &d, lsns)
        });
        if result.is_ok() {
            let b = &mut g.bufs[id];
            b.dirty = false;
            b.low_lsn = 0;
            b.high_lsn = 0;
            g.dirty_count -= 1;
            Self::remove_dirty(g, id);
        }
        result
    }

    /// Write out a buffer we do not hold, for syncing. fsmanaged buffers
    /// succeed without doing anything and stay dirty. Distinguishes
    /// StaleBuffer (buffer vanished while we waited; nothing to do) from
    /// real write errors.
    pub(crate) fn buffer_sync(&self, g: &mut MutexGuard<'_, CacheInner>, id: usize) -> Result<()> {
        debug_assert!(g.bufs[id].valid && g.bufs[id].dirty);
        if g.bufs[id].fsmanaged {
            debug_assert!(g.bufs[id].busy);
            return Ok(());
        }
        self.mark_busy(g, id)?;
        debug_assert!(g.bufs[id].valid);
        if !g.bufs[id].dirty {
            // Someone else wrote it out while we were waiting.
            self.unmark_busy(g, id);
            return Ok(());
        }
        let result = self.writeout_internal(g, id);
        debug_assert!(!matches!(result, Err(SfsError::StaleBuffer)));
        self.unmark_busy(g, id);
        result
    }

    ////////////////////////////////////////////////////////////
    // get/release

    /// Clean a buffer out for reuse: detach it from its key. Does not
    /// put it on the detached pool; the caller does that if desired.
    fn clean(&self, g: &mut CacheInner, id: usize) {
        debug_assert!(!g.bufs[id].busy);
        Self::remove_attached(g, id, false);
        g.bufs[id].valid = false;
        if g.bufs[id].dirty {
            g.bufs[id].dirty = false;
            g.bufs[id].low_lsn = 0;
            g.bufs[id].high_lsn = 0;
            g.dirty_count -= 1;
            Self::remove_dirty(g, id);
        }
        let b = &mut g.bufs[id];
        debug_assert!(b.attached);
        g.hash.remove(&b.block);
        b.attached = false;
        b.block = 0;
        self.busy_cv.notify_all();
    }

    /// Pick a victim from the LRU table, write it out if dirty, and hand
    /// it back detached.
    fn evict(&self, g: &mut MutexGuard<'_, CacheInner>) -> Result<usize> {
        'tryagain: loop {
            let num = g.attached.len();
            let mut chosen: Option<usize> = None;
            let mut first_dirty: Option<usize> = None;
            for i in 0..num {
                if i >= num / 2 && first_dirty.is_some() {
                    // Avoid preferring very recent clean buffers to
                    // older dirty buffers.
                    break;
                }
                let id = match g.attached[i] {
                    Some(id) => id,
                    None => continue,
                };
                if g.bufs[id].busy {
                    continue;
                }
                // fsmanaged buffers are always busy
                debug_assert!(!g.bufs[id].fsmanaged);
                if g.bufs[id].dirty {
                    if first_dirty.is_none() {
                        first_dirty = Some(id);
                    }
                    continue;
                }
                chosen = Some(id);
                break;
            }
            let id = match chosen.or(first_dirty) {
                Some(id) => id,
                None => {
                    warn!("buffer eviction found no targets");
                    return Err(SfsError::OutOfMemory("buffer cache exhausted".into()));
                }
            };

            g.stats.total_evictions += 1;
            if g.bufs[id].dirty {
                g.stats.dirty_evictions += 1;
                debug_assert!(!g.bufs[id].busy);
                // The lock may be released inside; it wasn't busy, so it
                // can't have disappeared.
                if let Err(e) = self.buffer_sync(g, id) {
                    debug_assert!(!matches!(e, SfsError::StaleBuffer));
                    warn!(error = %e, "buffer eviction writeback failed");
                    // Send it to the recent end and pick another victim.
                    Self::remove_attached(g, id, false);
                    self.insert_attached(g, id);
                    continue 'tryagain;
                }
            }
            debug_assert!(!g.bufs[id].dirty);
            self.clean(g, id);
            return Ok(id);
        }
    }

    fn get_internal(
        &self,
        g: &mut MutexGuard<'_, CacheInner>,
        block: u32,
        fsmanaged: bool,
    ) -> Result<usize> {
        if !fsmanaged {
            assert!(
                DID_RESERVE.with(|c| c.get()),
                "buffer_get without a reservation"
            );
            if g.syncer_needs_help {
                self.sync_one_old_buffer(g);
            }
        }
        g.stats.total_gets += 1;

        loop {
            if let Some(&id) = g.hash.get(&block) {
                match self.mark_busy(g, id) {
                    Ok(()) => {}
                    Err(SfsError::StaleBuffer) => continue,
                    Err(e) => return Err(e),
                }
                g.stats.valid_gets += 1;
                Self::remove_attached(g, id, true);
                // move to the tail (recent end) of the LRU table
                self.insert_attached(g, id);
                if fsmanaged {
                    g.bufs[id].fsmanaged = true;
                }
                return Ok(id);
            }

            let id = match g.detached.pop() {
                Some(id) => {
                    g.bufs[id].table_index = INVALID_INDEX;
                    id
                }
                None if g.bufs.len() < self.max_buffers => {
                    let id = g.bufs.len();
                    g.bufs.push(Buf::new());
                    id
                }
                None => self.evict(g)?,
            };

            // Eviction can release the lock while writing the victim
            // out, so the block may have been attached by someone else
            // meanwhile; if so, park our buffer and go find theirs.
            if g.hash.contains_key(&block) {
                g.bufs[id].table_index = g.detached.len();
                g.detached.push(id);
                continue;
            }

            // Attach to the new key.
            {
                let b = &mut g.bufs[id];
                debug_assert!(!b.busy && !b.attached && !b.valid);
                b.attached = true;
                b.block = block;
                b.busy = true;
                b.holder = Some(std::thread::current().id());
                b.table_index = INVALID_INDEX;
            }
            g.hash.insert(block, id);
            g.busy_count += 1;
            self.insert_attached(g, id);
            if fsmanaged {
                g.bufs[id].fsmanaged = true;
            }
            return Ok(id);
        }
    }

    fn make_guard(self: &Arc<Self>, g: &CacheInner, id: usize) -> BufferGuard {
        BufferGuard {
            cache: Arc::clone(self),
            id,
            block: g.bufs[id].block,
            data: Arc::clone(&g.bufs[id].data),
            released: false,
        }
    }

    /// Find a buffer for the given block if one exists, otherwise attach
    /// one without reading it in. The buffer comes back held (busy).
    pub fn get(self: &Arc<Self>, block: u32) -> Result<BufferGuard> {
        let mut g = self.inner.lock();
        let id = self.get_internal(&mut g, block, false)?;
        Ok(self.make_guard(&g, id))
    }

    /// Same as get but reads the block in if the buffer isn't valid.
    pub fn read(self: &Arc<Self>, block: u32) -> Result<BufferGuard> {
        let mut g = self.inner.lock();
        let id = self.get_internal(&mut g, block, false)?;
        if !g.bufs[id].valid {
            g.stats.read_gets += 1;
            if let Err(e) = self.readin(&mut g, id) {
                self.release_internal(&mut g, id);
                return Err(e);
            }
        }
        Ok(self.make_guard(&g, id))
    }

    /// The fsmanaged variant of get: the resulting buffer is managed by
    /// the filesystem and skipped by the syncer until released.
    pub fn get_fsmanaged(self: &Arc<Self>, block: u32) -> Result<BufferGuard> {
        let mut g = self.inner.lock();
        let id = self.get_internal(&mut g, block, true)?;
        Ok(self.make_guard(&g, id))
    }

    fn release_internal(&self, g: &mut MutexGuard<'_, CacheInner>, id: usize) {
        if !g.bufs[id].fsmanaged {
            // Buffers must be released while still reserved.
            debug_assert!(DID_RESERVE.with(|c| c.get()));
        }
        self.unmark_busy(g, id);
        if !g.bufs[id].valid {
            self.clean(g, id);
            g.bufs[id].table_index = g.detached.len();
            g.detached.push(id);
        } else {
            // move to the recent end of the LRU table
            Self::remove_attached(g, id, false);
            self.insert_attached(g, id);
        }
    }

    fn release(&self, id: usize, invalidate: bool) {
        let mut g = self.inner.lock();
        if invalidate {
            g.bufs[id].valid = false;
        }
        self.release_internal(&mut g, id);
    }

    pub(crate) fn mark_dirty_id(&self, id: usize) {
        let mut g = self.inner.lock();
        assert!(g.bufs[id].busy && g.bufs[id].valid);
        if g.bufs[id].dirty {
            return;
        }
        g.bufs[id].dirty = true;
        g.bufs[id].dirty_epoch = g.dirty_epoch;
        g.bufs[id].dirty_at = Instant::now();
        self.insert_dirty(&mut g, id);
        g.dirty_count += 1;
    }

    pub(crate) fn mark_valid_id(&self, id: usize) {
        let mut g = self.inner.lock();
        assert!(g.bufs[id].busy);
        g.bufs[id].valid = true;
    }

    pub(crate) fn is_dirty_id(&self, id: usize) -> bool {
        let g = self.inner.lock();
        assert!(g.bufs[id].busy && g.bufs[id].valid);
        g.bufs[id].dirty
    }

    pub(crate) fn note_lsn_id(&self, id: usize, lsn: Lsn) {
        let mut g = self.inner.lock();
        assert!(g.bufs[id].busy);
        let b = &mut g.bufs[id];
        if b.low_lsn == 0 || lsn < b.low_lsn {
            b.low_lsn = lsn;
        }
        if lsn > b.high_lsn {
            b.high_lsn = lsn;
        }
    }

    ////////////////////////////////////////////////////////////
    // keyed shortcuts

    /// Write out any existing buffer for the block if it's dirty;
    /// otherwise do nothing. Explicitly writes fsmanaged-released
    /// journal buffers too, which is what the journal flush path needs.
    pub fn flush_block(&self, block: u32) -> Result<()> {
        let mut g = self.inner.lock();
        let id = match g.hash.get(&block) {
            Some(&id) => id,
            None => return Ok(()),
        };
        debug_assert!(g.bufs[id].valid);
        if !g.bufs[id].dirty {
            return Ok(());
        }
        match self.mark_busy(&mut g, id) {
            Ok(()) => {}
            // Buffer disappeared; no longer needs writing.
            Err(SfsError::StaleBuffer) => return Ok(()),
            Err(e) => return Err(e),
        }
        if !g.bufs[id].dirty {
            // Someone else wrote it out.
            self.unmark_busy(&mut g, id);
            return Ok(());
        }
        debug_assert_eq!(g.bufs[id].block, block);
        let result = self.writeout_internal(&mut g, id);
        debug_assert!(!matches!(result, Err(SfsError::StaleBuffer)));
        self.unmark_busy(&mut g, id);
        result
    }

    /// Invalidate and drop any existing buffer for the block.
    pub fn drop_block(&self, block: u32) {
        let mut g = self.inner.lock();
        let id = match g.hash.get(&block) {
            Some(&id) => id,
            None => return,
        };
        // The buffer might be getting synced; wait for that, then let it
        // go again. We hold the lock, so nobody else can take it before
        // we finish.
        match self.mark_busy(&mut g, id) {
            Ok(()) => {}
            Err(SfsError::StaleBuffer) => return,
            Err(_) => unreachable!(),
        }
        self.unmark_busy(&mut g, id);
        if g.bufs[id].dirty {
            g.bufs[id].dirty = false;
            g.bufs[id].low_lsn = 0;
            g.bufs[id].high_lsn = 0;
            g.dirty_count -= 1;
            Self::remove_dirty(&mut g, id);
        }
        g.bufs[id].valid = false;
        self.clean(&mut g, id);
        g.bufs[id].table_index = g.detached.len();
        g.detached.push(id);
    }

    ////////////////////////////////////////////////////////////
    // bulk operations

    /// Write out every buffer dirtied before this call. Restarts if the
    /// dirty table is compacted underneath the sweep.
    pub fn sync_all(&self) -> Result<()> {
        let mut g = self.inner.lock();
        let my_epoch = g.dirty_epoch;
        g.dirty_epoch = g.dirty_epoch.checked_add(1).expect("dirty epoch wrapped");
        let mut my_gen = g.dirty_gen;

        let mut i = 0;
        while i < g.dirty.len() {
            let id = match g.dirty[i] {
                Some(id) => id,
                None => {
                    i += 1;
                    continue;
                }
            };
            if g.bufs[id].dirty_epoch > my_epoch {
                // Dirtied after we started; everything further on is
                // newer still.
                break;
            }
            if g.bufs[id].fsmanaged {
                i += 1;
                continue;
            }
            debug_assert!(g.bufs[id].valid && g.bufs[id].dirty);
            match self.buffer_sync(&mut g, id) {
                Ok(()) => {}
                Err(SfsError::StaleBuffer) => {
                    // Invalidated or evicted while we waited; no longer
                    // needs syncing.
                }
                Err(e) => return Err(e),
            }
            i += 1;
            if my_gen != g.dirty_gen {
                // The table was compacted; restart the sweep.
                i = 0;
                my_gen = g.dirty_gen;
            }
        }
        Ok(())
    }

    /// The minimum low-LSN across all dirty buffers, or Lsn::MAX if no
    /// dirty buffer carries one. Drives transaction reaping and trim.
    pub fn min_dirty_low_lsn(&self) -> Lsn {
        let g = self.inner.lock();
        let mut min = Lsn::MAX;
        for slot in &g.dirty {
            if let Some(id) = slot {
                let lo = g.bufs[*id].low_lsn;
                if lo != 0 && lo < min {
                    min = lo;
                }
            }
        }
        min
    }

    /// Invalidate and detach every buffer. For unmount, after a sync;
    /// panics on a dirty or busy buffer because nothing should be using
    /// the volume any more.
    pub fn drop_all(&self) {
        let mut g = self.inner.lock();
        debug_assert_eq!(g.busy_count, 0);
        let mut my_gen = g.attached_gen;
        let mut i = 0;
        while i < g.attached.len() {
            let id = match g.attached[i] {
                Some(id) => id,
                None => {
                    i += 1;
                    continue;
                }
            };
            debug_assert!(g.bufs[id].valid);
            if g.bufs[id].dirty {
                panic!("drop_all: buffer for block {} did not get synced", g.bufs[id].block);
            }
            if g.bufs[id].busy {
                panic!("drop_all: buffer for block {} is busy", g.bufs[id].block);
            }
            self.clean(&mut g, id);
            g.bufs[id].table_index = g.detached.len();
            g.detached.push(id);
            i += 1;
            if my_gen != g.attached_gen {
                i = 0;
                my_gen = g.attached_gen;
            }
        }
    }

    /// Write out one buffer from the dirty table. Called from the get
    /// path while the syncer is signalling for help. Busy buffers are
    /// skipped: syncing those might deadlock.
    fn sync_one_old_buffer(&self, g: &mut MutexGuard<'_, CacheInner>) {
        for i in 0..g.dirty.len() {
            let id = match g.dirty[i] {
                Some(id) => id,
                None => continue,
            };
            if g.bufs[id].fsmanaged || g.bufs[id].busy {
                continue;
            }
            debug_assert!(g.bufs[id].dirty);
            if let Err(e) = self.buffer_sync(g, id) {
                // wasn't busy -> didn't wait -> can't disappear
                debug_assert!(!matches!(e, SfsError::StaleBuffer));
                // let the syncer deal with it
            }
            break;
        }
    }

    ////////////////////////////////////////////////////////////
    // syncer support (the sweeps themselves live in syncer.rs)

    pub(crate) fn max_buffers(&self) -> usize {
        self.max_buffers
    }

    pub(crate) fn total_buffers(&self, g: &CacheInner) -> usize {
        g.bufs.len()
    }

    pub(crate) fn dirty_table<'a>(&self, g: &'a CacheInner) -> &'a [Option<usize>] {
        &g.dirty
    }

    pub(crate) fn attached_table<'a>(&self, g: &'a CacheInner) -> &'a [Option<usize>] {
        &g.attached
    }

    pub(crate) fn buf_is_dirty(&self, g: &CacheInner, id: usize) -> bool {
        g.bufs[id].dirty
    }

    pub(crate) fn buf_is_fsmanaged(&self, g: &CacheInner, id: usize) -> bool {
        g.bufs[id].fsmanaged
    }

    pub(crate) fn buf_block(&self, g: &CacheInner, id: usize) -> u32 {
        g.bufs[id].block
    }

    pub(crate) fn buf_dirty_at(&self, g: &CacheInner, id: usize) -> Instant {
        g.bufs[id].dirty_at
    }
}

/// A held buffer. The data mapping is valid until release; dropping the
/// guard releases the buffer back to the cache.
pub struct BufferGuard {
    cache: Arc<BufferCache>,
    id: usize,
    block: u32,
    data: Arc<Mutex<Box<[u8]>>>,
    released: bool,
}

impl BufferGuard {
    pub fn block(&self) -> u32 {
        self.block
    }

    /// Map the buffer's bytes for reading.
    pub fn map(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock()
    }

    /// Map the buffer's bytes for writing. Call mark_dirty afterwards.
    pub fn map_mut(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock()
    }

    pub fn mark_dirty(&self) {
        self.cache.mark_dirty_id(self.id);
    }

    pub fn mark_valid(&self) {
        self.cache.mark_valid_id(self.id);
    }

    pub fn is_dirty(&self) -> bool {
        self.cache.is_dirty_id(self.id)
    }

    /// Record that a journaled update with this LSN landed in the
    /// buffer. The cache flushes the journal that far before writing the
    /// buffer out.
    pub fn note_lsn(&self, lsn: Lsn) {
        self.cache.note_lsn_id(self.id, lsn);
    }

    /// Release and invalidate: the buffer's contents are not worth
    /// keeping (freed block, dropped journal block).
    pub fn release_invalidate(mut self) {
        self.released = true;
        self.cache.release(self.id, true);
    }
}

impl Drop for BufferGuard {
    fn drop(&mut self) {
        if !self.released {
            self.cache.release(self.id, false);
        }
    }
}

/// Guard for a per-operation buffer reservation.
pub struct Reservation {
    cache: Arc<BufferCache>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.cache.unreserve();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, MemDevice};

    struct RawIo {
        device: Device,
    }

    impl CacheIo for RawIo {
        fn read_block(&self, block: u32, data: &mut [u8]) -> Result<()> {
            self.device.read_block(block, data)
        }

        fn write_block(&self, block: u32, data: &[u8], _lsns: Option<(Lsn, Lsn)>) -> Result<()> {
            self.device.write_block(block, data)
        }
    }

    fn test_cache(nblocks: u32, max_buffers: usize) -> (Arc<BufferCache>, Arc<MemDevice>) {
        let mem = Arc::new(MemDevice::new(nblocks));
        let io = Arc::new(RawIo {
            device: Device::new(Arc::clone(&mem) as Arc<dyn crate::device::BlockDevice>),
        });
        let cache = BufferCache::new(CacheConfig { max_buffers }, io);
        (cache, mem)
    }

    #[test]
    fn get_write_release_read_back() {
        let (cache, _mem) = test_cache(64, 16);
        let res = cache.reserve();
        {
            let buf = cache.get(5).unwrap();
            buf.map_mut().fill(0x17);
            buf.mark_valid();
            buf.mark_dirty();
        }
        {
            let buf = cache.read(5).unwrap();
            assert_eq!(buf.map()[0], 0x17);
            assert!(buf.is_dirty());
        }
        drop(res);
    }

    #[test]
    fn sync_all_writes_dirty_buffers_through() {
        let (cache, mem) = test_cache(64, 16);
        let res = cache.reserve();
        {
            let buf = cache.get(9).unwrap();
            buf.map_mut().fill(0x42);
            buf.mark_valid();
            buf.mark_dirty();
        }
        assert_eq!(mem.raw_block(9)[0], 0);
        cache.sync_all().unwrap();
        assert_eq!(mem.raw_block(9)[0], 0x42);
        {
            let buf = cache.read(9).unwrap();
            assert!(!buf.is_dirty());
        }
        drop(res);
    }

    #[test]
    fn eviction_reuses_buffers_and_preserves_contents() {
        let (cache, _mem) = test_cache(256, 16);
        let res = cache.reserve();
        for block in 0..64u32 {
            let buf = cache.get(block).unwrap();
            buf.map_mut().fill(block as u8);
            buf.mark_valid();
            buf.mark_dirty();
        }
        // Everything was written out on eviction; read a few back.
        for block in [0u32, 17, 63] {
            let buf = cache.read(block).unwrap();
            assert_eq!(buf.map()[10], block as u8);
        }
        let stats = cache.stats();
        assert!(stats.total_evictions > 0);
        drop(res);
    }

    #[test]
    fn drop_block_discards_dirty_contents() {
        let (cache, mem) = test_cache(64, 16);
        let res = cache.reserve();
        {
            let buf = cache.get(3).unwrap();
            buf.map_mut().fill(0x99);
            buf.mark_valid();
            buf.mark_dirty();
        }
        cache.drop_block(3);
        cache.sync_all().unwrap();
        assert_eq!(mem.raw_block(3)[0], 0);
        drop(res);
    }

    #[test]
    fn min_dirty_low_lsn_tracks_noted_lsns() {
        let (cache, _mem) = test_cache(64, 16);
        let res = cache.reserve();
        assert_eq!(cache.min_dirty_low_lsn(), Lsn::MAX);
        {
            let buf = cache.get(1).unwrap();
            buf.map_mut().fill(1);
            buf.mark_valid();
            buf.note_lsn(12);
            buf.note_lsn(9);
            buf.note_lsn(30);
            buf.mark_dirty();
        }
        {
            let buf = cache.get(2).unwrap();
            buf.map_mut().fill(2);
            buf.mark_valid();
            buf.note_lsn(20);
            buf.mark_dirty();
        }
        assert_eq!(cache.min_dirty_low_lsn(), 9);
        cache.sync_all().unwrap();
        assert_eq!(cache.min_dirty_low_lsn(), Lsn::MAX);
        drop(res);
    }

    #[test]
    fn release_invalidate_detaches() {
        let (cache, _mem) = test_cache(64, 16);
        let res = cache.reserve();
        {
            let buf = cache.get(7).unwrap();
            buf.map_mut().fill(0x7);
            buf.mark_valid();
            buf.release_invalidate();
        }
        {
            // A fresh get must not find the invalidated buffer.
            let g = cache.inner.lock();
            assert!(g.hash.get(&7).is_none());
        }
        drop(res);
    }

    #[test]
    fn concurrent_readers_serialize_on_busy() {
        let (cache, _mem) = test_cache(64, 16);
        let res = cache.reserve();
        {
            let buf = cache.get(11).unwrap();
            buf.map_mut().fill(0xaa);
            buf.mark_valid();
            buf.mark_dirty();
        }
        drop(res);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                let res = cache.reserve();
                for _ in 0..50 {
                    let buf = cache.read(11).unwrap();
                    assert_eq!(buf.map()[0], 0xaa);
                }
                drop(res);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
