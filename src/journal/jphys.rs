// Physical journal container.
//
// Manages the circular on-disk log: appending records into the current
// head block, padding and rotating at block boundaries, flushing blocks
// to disk strictly in order, and trimming the tail. The container knows
// nothing about record contents beyond the packed header.
//
// The in-memory head is (head_jblock, head_byte). The on-disk head is
// the start of oldest_jblock, because that's the oldest journal block
// not yet written. The in-memory tail is tracked so head advancement
// can detect a collision.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::buffer::{BufferCache, BufferGuard};
use crate::error::Result;
use crate::layout::{
    mk_coninfo, Lsn, BLOCK_SIZE, CLASS_CLIENT, CLASS_CONTAINER, CONTAINER_PAD, CONTAINER_TRIM,
    JPHYS_HEADER_SIZE,
};

/// Journal position: block index into the journal plus byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JPosition {
    pub jblock: u32,
    pub offset: usize,
}

pub(crate) struct JphysState {
    pub head_buf: Option<BufferGuard>,
    pub next_buf: Option<BufferGuard>,
    /// The thread that rotated the head owns the obligation to refill
    /// next_buf; nobody else may try concurrently.
    pub getting_next: Option<ThreadId>,

    pub head_jblock: u32,
    pub head_byte: usize,
    pub head_first_lsn: Lsn,

    pub next_lsn: Lsn,

    /// Journal blocks consumed since mount (or since last cleared).
    pub odometer: u32,

    /// Recovery-time positions; valid after loadup, not updated later.
    pub recov_tailpos: JPosition,
    pub recov_headpos: JPosition,
}

pub(crate) struct LsnMap {
    /// First LSN in each journal block, or 0 if that block isn't in
    /// memory.
    pub first_lsns: Vec<Lsn>,
    /// Oldest journal block not yet written to disk.
    pub oldest_jblock: u32,
    /// Journal block and LSN of the in-memory tail.
    pub mem_tail_jblock: u32,
    pub mem_tail_lsn: Lsn,
}

pub struct Jphys {
    cache: Arc<BufferCache>,
    journal_start: u32,
    journal_blocks: u32,

    pub(crate) state: Mutex<JphysState>,
    next_cv: Condvar,
    pub(crate) lsnmap: Mutex<LsnMap>,

    phys_recovered: AtomicBool,
    reader_mode: AtomicBool,
    writer_mode: AtomicBool,
}

impl Jphys {
    pub fn new(cache: Arc<BufferCache>, journal_start: u32, journal_blocks: u32) -> Arc<Jphys> {
        assert!(journal_blocks >= 2);
        Arc::new(Jphys {
            cache,
            journal_start,
            journal_blocks,
            state: Mutex::new(JphysState {
                head_buf: None,
                next_buf: None,
                getting_next: None,
                head_jblock: 0,
                head_byte: 0,
                head_first_lsn: 0,
                next_lsn: 0,
                odometer: 0,
                recov_tailpos: JPosition::default(),
                recov_headpos: JPosition::default(),
            }),
            next_cv: Condvar::new(),
            lsnmap: Mutex::new(LsnMap {
                first_lsns: vec![0; journal_blocks as usize],
                oldest_jblock: 0,
                mem_tail_jblock: 0,
                mem_tail_lsn: 0,
            }),
            phys_recovered: AtomicBool::new(false),
            reader_mode: AtomicBool::new(false),
            writer_mode: AtomicBool::new(false),
        })
    }

    pub(crate) fn cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    pub fn journal_start(&self) -> u32 {
        self.journal_start
    }

    pub fn journal_blocks(&self) -> u32 {
        self.journal_blocks
    }

    /// Check if a disk block number is in the journal.
    pub fn block_is_journal(&self, block: u32) -> bool {
        block >= self.journal_start && block < self.journal_start + self.journal_blocks
    }

    pub fn is_writing(&self) -> bool {
        self.writer_mode.load(Ordering::Acquire)
    }

    fn jblock_to_disk(&self, jblock: u32) -> u32 {
        debug_assert!(jblock < self.journal_blocks);
        self.journal_start + jblock
    }

    ////////////////////////////////////////////////////////////
    // writer interface

    /// Move to the next journal block, if the head block is full. This
    /// swaps next_buf in for head_buf and records that the calling
    /// thread will replace next_buf later: we can't fetch a buffer here
    /// because eviction inside the fetch might itself need to append.
    fn advance_head(&self, st: &mut JphysState) {
        if st.head_byte < BLOCK_SIZE {
            return;
        }
        // Must not have run off the end.
        assert_eq!(st.head_byte, BLOCK_SIZE);

        {
            let lm = self.lsnmap.lock();
            assert_eq!(lm.first_lsns[st.head_jblock as usize], st.head_first_lsn);
        }

        // Release the old head; it's now a normal dirty buffer whose
        // write-back goes through the ordered journal flush.
        let old = st.head_buf.take().expect("journal head missing");
        drop(old);

        st.head_jblock += 1;
        if st.head_jblock == self.journal_blocks {
            st.head_jblock = 0;
        }
        st.head_byte = 0;
        st.head_first_lsn = st.next_lsn;

        // Take next_buf and promise to replace it.
        let next = st
            .next_buf
            .take()
            .expect("journal head block full while already getting the next one");
        assert!(st.getting_next.is_none());
        next.mark_valid();
        st.head_buf = Some(next);
        st.getting_next = Some(std::thread::current().id());

        let mut lm = self.lsnmap.lock();
        if st.head_jblock == lm.mem_tail_jblock {
            panic!("journal head overran journal tail");
        }
        lm.first_lsns[st.head_jblock as usize] = st.head_first_lsn;
        drop(lm);

        st.odometer += 1;
    }

    /// Fetch the next journal head buffer. Releases the journal lock
    /// while working: buffer_get can trigger an eviction that appends a
    /// journal record, which must be able to get back in here.
    fn get_next_buf(&self, st: &mut MutexGuard<'_, JphysState>) {
        let mut next_jblock = st.head_jblock + 1;
        if next_jblock == self.journal_blocks {
            next_jblock = 0;
        }
        let disk_block = self.jblock_to_disk(next_jblock);
        let cache = Arc::clone(&self.cache);
        let buf = MutexGuard::unlocked(st, || match cache.get_fsmanaged(disk_block) {
            Ok(buf) => buf,
            // If we can't get a journal buffer there is no way to keep
            // operating; the head would fill up with nowhere to go.
            Err(e) => panic!("turning over journal: {e}"),
        });
        buf.mark_valid();
        st.next_buf = Some(buf);
        st.getting_next = None;
        self.next_cv.notify_all();
    }

    /// Copy bytes into the journal head and advance.
    fn put_journal(&self, st: &mut JphysState, lsn: Lsn, bytes: &[u8]) {
        assert!(st.head_byte + bytes.len() <= BLOCK_SIZE);
        assert!(lsn >= st.head_first_lsn);
        {
            let head = st.head_buf.as_ref().expect("journal head missing");
            let mut data = head.map_mut();
            data[st.head_byte..st.head_byte + bytes.len()].copy_from_slice(bytes);
            head.mark_dirty();
        }
        st.head_byte += bytes.len();
        self.advance_head(st);
    }

    /// Write a pad record covering the rest of the head block, then
    /// rotate. If fewer bytes remain than a header, the padding is
    /// implicit and nothing is written.
    fn pad_journal(&self, st: &mut JphysState) {
        assert!(st.head_byte < BLOCK_SIZE);
        let mut len = BLOCK_SIZE - st.head_byte;
        if len >= JPHYS_HEADER_SIZE {
            let lsn = st.next_lsn;
            st.next_lsn += 1;
            let hdr = mk_coninfo(CLASS_CONTAINER, CONTAINER_PAD, len, lsn);
            self.put_journal(st, lsn, &hdr.to_le_bytes());
            len -= JPHYS_HEADER_SIZE;
        }
        st.head_byte += len;
        self.advance_head(st);
    }

    /// Wait until next_buf is present, unless this thread is the one
    /// responsible for fetching it (in which case it's here recursively
    /// and must not wait for itself).
    fn wait_for_next_buf(&self, st: &mut MutexGuard<'_, JphysState>) -> bool {
        let already_getting = st.next_buf.is_none()
            && st.getting_next == Some(std::thread::current().id());
        if !already_getting {
            while st.next_buf.is_none() {
                assert!(st.getting_next != Some(std::thread::current().id()));
                self.next_cv.wait(st);
            }
        }
        already_getting
    }

    /// Append one record to the journal. Handles the header, padding,
    /// and block rotation. Does not fail: if the container can't get a
    /// journal buffer it panics, as there's no way to continue.
    fn append_internal(&self, class: u8, typ: u8, payload: &[u8]) -> Lsn {
        assert!(payload.len() % 2 == 0);
        let total_len = payload.len() + JPHYS_HEADER_SIZE;
        assert!(typ < 128);
        // Record length lives in an 8-bit field of 2-octet units.
        assert!(total_len <= 2 * 0xff);

        let mut st = self.state.lock();

        // If the head is turning over, wait until it finishes.
        let already_getting = self.wait_for_next_buf(&mut st);

        if st.head_byte + total_len > BLOCK_SIZE {
            assert!(
                !already_getting,
                "journal head block full while already getting the next one"
            );
            self.pad_journal(&mut st);
            // We just turned the head over, so we must be responsible
            // for fetching the next head buffer.
            assert!(st.next_buf.is_none());
            assert_eq!(st.getting_next, Some(std::thread::current().id()));
        }

        let lsn = st.next_lsn;
        st.next_lsn += 1;
        let hdr = mk_coninfo(class, typ, total_len, lsn);
        self.put_journal(&mut st, lsn, &hdr.to_le_bytes());
        self.put_journal(&mut st, lsn, payload);

        // If we turned over the head buffer, get a new next_buf, unless
        // we're already doing so up the call stack. This drops the lock
        // while working, so it comes after everything that needs to be
        // atomic.
        if !already_getting {
            if st.next_buf.is_none() && st.getting_next == Some(std::thread::current().id()) {
                self.get_next_buf(&mut st);
            }
            assert!(st.next_buf.is_some());
        }

        lsn
    }

    /// Append a client record. Only valid in writer mode.
    pub fn append(&self, typ: u8, payload: &[u8]) -> Lsn {
        assert!(self.is_writing());
        self.append_internal(CLASS_CLIENT, typ, payload)
    }

    ////////////////////////////////////////////////////////////
    // flushing

    /// Write out journal blocks from the oldest unwritten one up to but
    /// not including `end_jblock`. The map lock is dropped across each
    /// write so the device path can call back in to record completion.
    fn flush_upto_jblock(&self, lm: &mut MutexGuard<'_, LsnMap>, end_jblock: u32) {
        assert!(self.is_writing());
        let mut myjblock = lm.oldest_jblock;
        loop {
            if myjblock == end_jblock {
                break;
            }
            // If the block we're looking at is the oldest unwritten
            // block, write it; otherwise someone else got there first
            // and we just catch up. oldest_jblock never moves backwards.
            if myjblock == lm.oldest_jblock {
                let disk_block = self.jblock_to_disk(myjblock);
                let cache = Arc::clone(&self.cache);
                MutexGuard::unlocked(lm, || {
                    // flush_block is idempotent, so concurrent flushers
                    // are harmless; the block is written once and
                    // wrote_journal_block fires once.
                    if let Err(e) = cache.flush_block(disk_block) {
                        panic!("writing journal buffer: {e}");
                    }
                    // The buffer's contents are not needed any more.
                    cache.drop_block(disk_block);
                });
            }
            myjblock += 1;
            if myjblock >= self.journal_blocks {
                myjblock = 0;
            }
        }
    }

    /// Make sure the journal records up to and including `lsn` are on
    /// disk. If the LSN is still in the in-memory head block, the head
    /// is padded out and rotated first.
    pub fn flush_to_lsn(&self, lsn: Lsn) -> Result<()> {
        if lsn == 0 {
            // Reasonable during recovery; nothing to do.
            return Ok(());
        }

        let mut st = self.state.lock();
        assert!(lsn < st.next_lsn);

        if lsn >= st.head_first_lsn && st.head_byte > 0 {
            // The target is in the current head; pad and rotate so the
            // head block becomes flushable.
            let already_getting = self.wait_for_next_buf(&mut st);
            assert!(!already_getting, "journal flush from inside head turnover");
            self.pad_journal(&mut st);
            if st.next_buf.is_none() && st.getting_next == Some(std::thread::current().id()) {
                self.get_next_buf(&mut st);
            }
        }

        // If someone advances the head further while we work, we don't
        // care; grab the current values and let go.
        let head_jblock = st.head_jblock;
        let head_first_lsn = st.head_first_lsn;
        drop(st);

        let mut lm = self.lsnmap.lock();
        let mut jblock = lm.oldest_jblock;
        loop {
            if lsn < lm.first_lsns[jblock as usize] {
                break;
            }
            // cannot reach the head
            assert_ne!(jblock, head_jblock);
            jblock += 1;
            if jblock >= self.journal_blocks {
                jblock = 0;
            }
        }
        self.flush_upto_jblock(&mut lm, jblock);
        assert!(lsn < head_first_lsn);
        Ok(())
    }

    /// Flush every journal block older than the named one. Called by
    /// the write-back hook before any journal block goes to disk, which
    /// is what keeps the on-disk journal in order.
    pub fn flush_for_journal_block(&self, disk_block: u32) {
        let jblock = disk_block - self.journal_start;
        assert!(jblock < self.journal_blocks);
        let mut lm = self.lsnmap.lock();
        self.flush_upto_jblock(&mut lm, jblock);
    }

    /// Flush the whole journal.
    pub fn flush_all(&self) -> Result<()> {
        let next_lsn = self.state.lock().next_lsn;
        if next_lsn == 0 {
            return Ok(());
        }
        self.flush_to_lsn(next_lsn - 1)
    }

    /// Record that a journal block made it to disk. The write-back hook
    /// calls this after the device write.
    pub fn wrote_journal_block(&self, disk_block: u32) {
        let jblock = disk_block - self.journal_start;
        assert!(jblock < self.journal_blocks);
        let mut lm = self.lsnmap.lock();
        assert_eq!(jblock, lm.oldest_jblock);
        lm.oldest_jblock += 1;
        if lm.oldest_jblock >= self.journal_blocks {
            lm.oldest_jblock = 0;
        }
    }

    ////////////////////////////////////////////////////////////
    // checkpoint interface

    /// The current next-LSN. More records may be added before the caller
    /// looks at it, so the safe uses are limited; it's meant as a trim
    /// target when nothing else constrains the tail.
    pub fn peek_next_lsn(&self) -> Lsn {
        self.state.lock().next_lsn
    }

    /// Trim the journal: the given LSN stays, everything before it is
    /// discarded and will not be seen by recovery.
    pub fn trim(&self, tail_lsn: Lsn) {
        assert!(self.is_writing());
        self.append_internal(CLASS_CONTAINER, CONTAINER_TRIM, &tail_lsn.to_le_bytes());

        let mut lm = self.lsnmap.lock();
        lm.mem_tail_lsn = 0;
        let n = self.journal_blocks as usize;
        for i in 0..n {
            let here = lm.first_lsns[i];
            let next = lm.first_lsns[(i + 1) % n];
            if tail_lsn >= here && (i + 1 == n || tail_lsn < next || here > next) {
                lm.mem_tail_jblock = i as u32;
                lm.mem_tail_lsn = tail_lsn;
                break;
            }
        }
        assert_ne!(lm.mem_tail_lsn, 0, "trim target not in the lsn map");
    }

    /// LSN of the in-memory tail (the newest trim target).
    pub fn mem_tail_lsn(&self) -> Lsn {
        self.lsnmap.lock().mem_tail_lsn
    }

    pub fn odometer(&self) -> u32 {
        assert!(self.is_writing());
        self.state.lock().odometer
    }

    pub fn clear_odometer(&self) {
        assert!(self.is_writing());
        self.state.lock().odometer = 0;
    }

    ////////////////////////////////////////////////////////////
    // startup, shutdown, and mode transitions

    pub(crate) fn set_recovered_positions(
        &self,
        headpos: JPosition,
        head_lsn: Lsn,
        tailpos: JPosition,
        tail_lsn: Lsn,
    ) {
        let mut st = self.state.lock();
        st.recov_headpos = headpos;
        st.recov_tailpos = tailpos;
        st.head_jblock = headpos.jblock;
        st.head_byte = headpos.offset;
        st.head_first_lsn = head_lsn;
        st.next_lsn = head_lsn;
        drop(st);

        let mut lm = self.lsnmap.lock();
        lm.mem_tail_jblock = tailpos.jblock;
        lm.mem_tail_lsn = tail_lsn;
        drop(lm);

        self.phys_recovered.store(true, Ordering::Release);
    }

    pub(crate) fn recovered_positions(&self) -> (JPosition, JPosition) {
        let st = self.state.lock();
        (st.recov_tailpos, st.recov_headpos)
    }

    pub(crate) fn save_first_lsn(&self, jblock: u32, lsn: Lsn) {
        if lsn == 0 {
            return;
        }
        let mut lm = self.lsnmap.lock();
        let slot = &mut lm.first_lsns[jblock as usize];
        if *slot == 0 || lsn < *slot {
            *slot = lsn;
        }
    }

    pub fn start_reading(&self) {
        assert!(self.phys_recovered.load(Ordering::Acquire));
        assert!(!self.reader_mode.load(Ordering::Acquire));
        self.reader_mode.store(true, Ordering::Release);
    }

    pub fn stop_reading(&self) {
        assert!(self.reader_mode.load(Ordering::Acquire));
        self.reader_mode.store(false, Ordering::Release);
    }

    pub fn is_reading(&self) -> bool {
        self.reader_mode.load(Ordering::Acquire)
    }

    /// Enable writer mode: pin the head block and the next one as
    /// fsmanaged buffers so sync never tries to write them out from
    /// under us, and seed the LSN map.
    pub fn start_writing(&self) -> Result<()> {
        assert!(self.phys_recovered.load(Ordering::Acquire));
        assert!(!self.is_writing());

        let mut st = self.state.lock();
        let head = self.cache.get_fsmanaged(self.jblock_to_disk(st.head_jblock))?;
        head.mark_valid();

        let mut next_jblock = st.head_jblock + 1;
        if next_jblock == self.journal_blocks {
            next_jblock = 0;
        }
        let next = match self.cache.get_fsmanaged(self.jblock_to_disk(next_jblock)) {
            Ok(next) => next,
            Err(e) => {
                head.release_invalidate();
                return Err(e);
            }
        };
        next.mark_valid();

        // Container recovery leaves the head block-aligned, so the new
        // head block starts fresh.
        assert_eq!(st.head_byte, 0);

        st.head_buf = Some(head);
        st.next_buf = Some(next);

        let mut lm = self.lsnmap.lock();
        lm.first_lsns[st.head_jblock as usize] = st.head_first_lsn;
        lm.oldest_jblock = st.head_jblock;
        drop(lm);
        drop(st);

        self.writer_mode.store(true, Ordering::Release);
        Ok(())
    }

    /// Turn off writer mode before going live (mount failure path).
    pub fn unstart_writing(&self) {
        assert!(self.is_writing() || self.phys_recovered.load(Ordering::Acquire));
        let mut st = self.state.lock();
        if let Some(b) = st.head_buf.take() {
            b.release_invalidate();
        }
        if let Some(b) = st.next_buf.take() {
            b.release_invalidate();
        }
        drop(st);
        self.writer_mode.store(false, Ordering::Release);
    }

    /// Turn off writer mode at unmount. The caller must have
    /// checkpointed and flushed; the assertions check that it did.
    pub fn stop_writing(&self) {
        let mut st = self.state.lock();
        assert!(self.is_writing());

        // We should have just checkpointed and flushed; there should
        // not be pending journal records.
        assert_eq!(st.head_byte, 0);

        let head = st.head_buf.take().expect("journal head missing");
        assert!(!head.is_dirty());
        head.release_invalidate();

        let next = st.next_buf.take().expect("journal next buffer missing");
        assert!(st.getting_next.is_none());
        assert!(!next.is_dirty());
        next.release_invalidate();

        drop(st);
        self.writer_mode.store(false, Ordering::Release);
    }
}
