// Transactions.
//
// A bounded per-volume table of transaction slots. A thread gets a
// transaction implicitly the first time it emits a record and keeps it
// until commit. The checkpoint pass reaps committed transactions whose
// side effects are all durable, then trims the journal tail.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::buffer::BufferCache;
use crate::error::{Result, SfsError};
use crate::journal::jphys::Jphys;
use crate::journal::record::{Record, TxId};
use crate::layout::Lsn;

/// Size of the transaction table.
pub const MAX_TRANSACTIONS: usize = 64;

static NEXT_SET_TAG: AtomicUsize = AtomicUsize::new(1);

std::thread_local! {
    /// The current transaction of this thread: (set tag, slot, txid).
    static CURRENT_TX: Cell<Option<(usize, usize, TxId)>> = const { Cell::new(None) };
}

struct TxSlot {
    id: TxId,
    lowest_lsn: Lsn,
    highest_lsn: Lsn,
    committed: bool,
    busy: bool,
}

struct TxTable {
    slots: Vec<Option<TxSlot>>,
    /// Journal txids are a monotone counter, never a slot index: slot
    /// indices recycle within one journal epoch and would alias in the
    /// log. Starts at 1 so 0 never appears in a record.
    id_counter: TxId,
}

pub struct TransactionSet {
    tag: usize,
    inner: Mutex<TxTable>,
}

impl TransactionSet {
    pub fn new() -> TransactionSet {
        TransactionSet {
            tag: NEXT_SET_TAG.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(TxTable {
                slots: (0..MAX_TRANSACTIONS).map(|_| None).collect(),
                id_counter: 1,
            }),
        }
    }

    /// Whether the calling thread has an open transaction on this set.
    pub fn has_current(&self) -> bool {
        matches!(CURRENT_TX.with(|c| c.get()), Some((tag, _, _)) if tag == self.tag)
    }

    fn current(&self) -> Option<(usize, TxId)> {
        match CURRENT_TX.with(|c| c.get()) {
            Some((tag, slot, id)) if tag == self.tag => Some((slot, id)),
            _ => None,
        }
    }

    /// Allocate a slot and make it the thread's current transaction,
    /// emitting the begin record.
    fn begin(&self, jphys: &Jphys) -> Result<(usize, TxId)> {
        let (slot, id) = {
            let mut table = self.inner.lock();
            let slot = table
                .slots
                .iter()
                .position(|s| s.is_none())
                .ok_or_else(|| SfsError::OutOfMemory("transaction table full".to_string()))?;
            let id = table.id_counter;
            table.id_counter += 1;
            table.slots[slot] = Some(TxSlot {
                id,
                lowest_lsn: 0,
                highest_lsn: 0,
                committed: false,
                busy: false,
            });
            (slot, id)
        };
        CURRENT_TX.with(|c| c.set(Some((self.tag, slot, id))));

        let begin = Record::TxBegin { txid: id };
        let lsn = jphys.append(begin.type_code(), &begin.encode());
        self.note_lsn(slot, id, lsn);
        Ok((slot, id))
    }

    fn note_lsn(&self, slot: usize, id: TxId, lsn: Lsn) {
        let mut table = self.inner.lock();
        let tx = table.slots[slot]
            .as_mut()
            .filter(|tx| tx.id == id)
            .expect("transaction vanished from its slot");
        if tx.lowest_lsn == 0 {
            tx.lowest_lsn = lsn;
        }
        tx.highest_lsn = lsn;
    }

    fn set_busy(&self, slot: usize, id: TxId, busy: bool) {
        let mut table = self.inner.lock();
        if let Some(tx) = table.slots[slot].as_mut().filter(|tx| tx.id == id) {
            tx.busy = busy;
        }
    }

    /// Append a record under the calling thread's transaction, creating
    /// one if needed. The closure gets the txid and builds the record.
    pub fn emit<F>(&self, jphys: &Jphys, build: F) -> Result<Lsn>
    where
        F: FnOnce(TxId) -> Record,
    {
        let (slot, id) = match self.current() {
            Some(cur) => cur,
            None => self.begin(jphys)?,
        };
        self.set_busy(slot, id, true);
        let record = build(id);
        debug_assert_eq!(record.txid(), id);
        let lsn = jphys.append(record.type_code(), &record.encode());
        self.note_lsn(slot, id, lsn);
        self.set_busy(slot, id, false);
        Ok(lsn)
    }

    /// Commit the calling thread's transaction, if it has one. Emits
    /// the commit record and detaches the transaction from the thread;
    /// the slot lives on until the checkpoint pass reaps it.
    pub fn commit(&self, jphys: &Jphys) -> Result<()> {
        let (slot, id) = match self.current() {
            Some(cur) => cur,
            None => return Ok(()),
        };
        let commit = Record::TxCommit { txid: id };
        let lsn = jphys.append(commit.type_code(), &commit.encode());
        self.note_lsn(slot, id, lsn);
        {
            let mut table = self.inner.lock();
            let tx = table.slots[slot]
                .as_mut()
                .filter(|tx| tx.id == id)
                .expect("committing a transaction not in its slot");
            tx.committed = true;
        }
        CURRENT_TX.with(|c| c.set(None));
        Ok(())
    }

    /// Reap committed transactions whose side effects are all durable:
    /// committed, and highest LSN strictly below the minimum low-LSN of
    /// the dirty buffers. Returns the minimum low-LSN among live
    /// uncommitted transactions.
    pub(crate) fn reap(&self, cache: &Arc<BufferCache>) -> (Lsn, Lsn) {
        let min_buf_lsn = cache.min_dirty_low_lsn();

        let mut min_tx_lsn = Lsn::MAX;
        let mut table = self.inner.lock();
        for slot in table.slots.iter_mut() {
            let tx = match slot {
                Some(tx) => tx,
                None => continue,
            };
            if tx.committed && !tx.busy && tx.highest_lsn < min_buf_lsn {
                // All side effects are on disk; reap by this slot, not
                // by looking the id up again.
                *slot = None;
            } else if !tx.committed && tx.lowest_lsn != 0 && tx.lowest_lsn < min_tx_lsn {
                min_tx_lsn = tx.lowest_lsn;
            }
        }
        (min_buf_lsn, min_tx_lsn)
    }

    /// One checkpoint pass: reap durable transactions, then trim the
    /// journal to the oldest LSN still needed by a dirty buffer or a
    /// live uncommitted transaction. With nothing in flight at all, the
    /// tail advances to the present so the log keeps getting reclaimed.
    pub fn checkpoint(&self, jphys: &Jphys, cache: &Arc<BufferCache>) {
        let (min_buf_lsn, min_tx_lsn) = self.reap(cache);

        let tail = min_buf_lsn.min(min_tx_lsn);
        if tail != Lsn::MAX {
            debug!(tail, "checkpoint trim");
            jphys.trim(tail);
        } else {
            let next = jphys.peek_next_lsn();
            if next > jphys.mem_tail_lsn() + 1 {
                debug!(tail = next, "checkpoint trim to present");
                jphys.trim(next);
            }
        }
    }

    /// Count of live slots; unmount sanity checking.
    pub fn live_transactions(&self) -> usize {
        self.inner.lock().slots.iter().flatten().count()
    }
}

impl Default for TransactionSet {
    fn default() -> Self {
        TransactionSet::new()
    }
}
