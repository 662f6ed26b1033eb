// Journal iterator and container-level recovery.
//
// The iterator walks records between a tail position and a head
// position, in either direction, reading journal blocks through the
// buffer cache. Container recovery locates the on-disk head and tail:
// scan forward until the LSN sequence decreases (or an all-zero block
// turns up at a block boundary), fall back to a backward scan for a
// trim record, then pin down the physical position of the tail LSN.

use tracing::debug;

use crate::buffer::BufferGuard;
use crate::error::{Result, SfsError};
use crate::layout::{
    coninfo_class, coninfo_len, coninfo_lsn, coninfo_type, Lsn, BLOCK_SIZE, CLASS_CONTAINER,
    CONTAINER_INVALID, CONTAINER_PAD, CONTAINER_TRIM, JPHYS_HEADER_SIZE,
};

use super::jphys::{JPosition, Jphys};

pub struct Jiter<'a> {
    jphys: &'a Jphys,

    /// Iteration bounds: tailpos is the oldest record covered, headpos
    /// one past the newest. Equal positions cover the whole journal.
    headpos: JPosition,
    tailpos: JPosition,

    pos: JPosition,

    /// True once the record under the iterator has been parsed.
    read: bool,
    /// True when we've bumped into either end.
    done: bool,
    /// True to show container-level records too.
    seeall: bool,

    buf: Option<BufferGuard>,

    class: u8,
    typ: u8,
    len: usize,
    lsn: Lsn,
    payload: Vec<u8>,
}

impl<'a> Jiter<'a> {
    pub(crate) fn new(jphys: &'a Jphys, tailpos: JPosition, headpos: JPosition, seeall: bool) -> Jiter<'a> {
        Jiter {
            jphys,
            headpos,
            tailpos,
            pos: tailpos,
            read: false,
            done: false,
            seeall,
            buf: None,
            class: CLASS_CONTAINER,
            typ: CONTAINER_INVALID,
            len: 0,
            lsn: 0,
            payload: Vec::new(),
        }
    }

    /// Forward iterator over client records, from the recovered tail to
    /// the recovered head.
    pub fn forward(jphys: &'a Jphys) -> Result<Jiter<'a>> {
        assert!(jphys.is_reading());
        let (tailpos, headpos) = jphys.recovered_positions();
        let mut ji = Jiter::new(jphys, tailpos, headpos, false);
        ji.seek_tail()?;
        Ok(ji)
    }

    /// Backward iterator over client records, from the recovered head to
    /// the recovered tail.
    pub fn backward(jphys: &'a Jphys) -> Result<Jiter<'a>> {
        assert!(jphys.is_reading());
        let (tailpos, headpos) = jphys.recovered_positions();
        let mut ji = Jiter::new(jphys, tailpos, headpos, false);
        ji.seek_head()?;
        Ok(ji)
    }

    pub fn done(&self) -> bool {
        self.done
    }

    pub fn pos(&self) -> JPosition {
        self.pos
    }

    pub fn jblock(&self) -> u32 {
        self.pos.jblock
    }

    pub fn blockoffset(&self) -> usize {
        self.pos.offset
    }

    pub fn class(&self) -> u8 {
        debug_assert!(!self.done && self.read);
        self.class
    }

    pub fn record_type(&self) -> u8 {
        debug_assert!(!self.done && self.read);
        self.typ
    }

    /// LSN of the current record. Might be 0 for still-zeroed slots;
    /// zero LSNs are ignored for ordering purposes.
    pub fn lsn(&self) -> Lsn {
        debug_assert!(!self.done && self.read);
        self.lsn
    }

    /// The current record's payload, without the header.
    pub fn record(&self) -> &[u8] {
        debug_assert!(!self.done && self.read);
        &self.payload
    }

    fn getbuf(&mut self) -> Result<()> {
        if self.buf.is_some() {
            return Ok(());
        }
        let block = self.jphys.journal_start() + self.pos.jblock;
        self.buf = Some(self.jphys.cache().read(block)?);
        Ok(())
    }

    fn release_buf(&mut self) {
        self.buf = None;
    }

    /// Parse the record under the iterator.
    pub fn read_record(&mut self) -> Result<()> {
        assert!(!self.done);
        if self.read {
            return Ok(());
        }
        self.getbuf()?;
        let pos = self.pos;
        let (class, typ, len, lsn, payload) = {
            let buf = self.buf.as_ref().unwrap();
            let data = buf.map();
            assert!(pos.offset + JPHYS_HEADER_SIZE <= BLOCK_SIZE);
            let ci = u64::from_le_bytes(
                data[pos.offset..pos.offset + JPHYS_HEADER_SIZE].try_into().unwrap(),
            );
            if ci == 0 {
                // An empty slot reads as implicit padding.
                (CLASS_CONTAINER, CONTAINER_PAD, JPHYS_HEADER_SIZE, 0, Vec::new())
            } else {
                let len = coninfo_len(ci);
                if len < JPHYS_HEADER_SIZE {
                    return Err(SfsError::InvalidFormat(format!(
                        "runt journal record, length {}, jblock {} offset {}",
                        len, pos.jblock, pos.offset
                    )));
                }
                if pos.offset + len > BLOCK_SIZE {
                    return Err(SfsError::InvalidFormat(format!(
                        "journal record runs off end of block, jblock {} offset {}",
                        pos.jblock, pos.offset
                    )));
                }
                let start = pos.offset + JPHYS_HEADER_SIZE;
                let end = pos.offset + len;
                (
                    coninfo_class(ci),
                    coninfo_type(ci),
                    len,
                    coninfo_lsn(ci),
                    data[start..end].to_vec(),
                )
            }
        };

        self.class = class;
        self.typ = typ;
        self.len = len;
        self.lsn = lsn;
        self.payload = payload;
        self.read = true;

        if self.class == CLASS_CONTAINER && self.typ == CONTAINER_INVALID {
            return Err(SfsError::InvalidFormat(format!(
                "invalid entry in journal, jblock {} offset {}",
                pos.jblock, pos.offset
            )));
        }

        Ok(())
    }

    /// Move to the next record. The next position is computed before
    /// touching the iterator so that reaching the end leaves the
    /// position well defined.
    fn one_next(&mut self) -> Result<()> {
        assert!(self.read);
        let mut pos = self.pos;
        let mut changebuf = false;

        pos.offset += self.len;
        assert!(pos.offset <= BLOCK_SIZE);

        if pos.offset + JPHYS_HEADER_SIZE > BLOCK_SIZE {
            // No room for another header; the rest of the block is
            // waste space.
            pos.offset = BLOCK_SIZE;
        }
        if pos.offset == BLOCK_SIZE {
            pos.offset = 0;
            pos.jblock += 1;
            if pos.jblock == self.jphys.journal_blocks() {
                pos.jblock = 0;
            }
            changebuf = true;
        }

        if pos == self.headpos {
            self.done = true;
            return Ok(());
        }

        self.read = false;
        self.pos = pos;
        if changebuf {
            self.release_buf();
        }
        self.done = false;

        self.read_record()
    }

    /// Move to the next record, skipping container records unless the
    /// iterator shows all.
    pub fn next(&mut self) -> Result<()> {
        loop {
            self.one_next()?;
            if self.done || self.seeall || self.class != CLASS_CONTAINER {
                return Ok(());
            }
        }
    }

    /// The guts of moving backward one record: flip through the block
    /// from the front to find the record preceding the current one.
    fn one_prev(&mut self) -> Result<()> {
        assert!(self.pos.offset < BLOCK_SIZE);

        if self.pos.offset == 0 {
            self.pos.offset = BLOCK_SIZE;
            if self.pos.jblock == 0 {
                self.pos.jblock = self.jphys.journal_blocks();
            }
            self.pos.jblock -= 1;
            self.release_buf();
        }

        self.getbuf()?;
        let buf = self.buf.as_ref().unwrap();
        let data = buf.map();

        let mut offset = 0;
        let mut prevoffset = 0;
        assert!(self.pos.offset > 0);
        while offset < self.pos.offset {
            if offset + JPHYS_HEADER_SIZE > BLOCK_SIZE {
                // Waste space at the end of the block; ignore it.
                break;
            }
            prevoffset = offset;
            let ci = u64::from_le_bytes(data[offset..offset + JPHYS_HEADER_SIZE].try_into().unwrap());
            let mut len = coninfo_len(ci);
            if len == 0 {
                assert_eq!(ci, 0);
                len = JPHYS_HEADER_SIZE;
            }
            offset += len;
        }
        drop(data);
        self.pos.offset = prevoffset;
        self.read = false;
        self.done = false;

        self.read_record()
    }

    /// Move backward, skipping container records if necessary. Omits
    /// the initial done test so it can move back across the head/tail
    /// boundary when seeking to the head end.
    fn do_prev(&mut self) -> Result<()> {
        loop {
            self.one_prev()?;
            if self.seeall || self.class != CLASS_CONTAINER {
                return Ok(());
            }
            if self.pos == self.tailpos {
                self.done = true;
                return Ok(());
            }
        }
    }

    /// Move to the previous record.
    pub fn prev(&mut self) -> Result<()> {
        if self.pos == self.tailpos {
            self.done = true;
            return Ok(());
        }
        self.do_prev()
    }

    /// Seek onto the newest record, for scanning backward.
    pub fn seek_head(&mut self) -> Result<()> {
        self.pos = self.headpos;
        self.done = false;
        self.read = false;
        self.release_buf();
        self.do_prev()
    }

    /// Seek onto the oldest record, for scanning forward.
    pub fn seek_tail(&mut self) -> Result<()> {
        self.pos = self.tailpos;
        self.done = false;
        self.read = false;
        self.release_buf();
        self.read_record()?;
        if !self.seeall && self.class == CLASS_CONTAINER {
            self.next()?;
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////
// container-level recovery

/// Parse a trim record's payload.
fn parse_trim(ji: &Jiter<'_>) -> Result<Lsn> {
    let rec = ji.record();
    if rec.len() != 8 {
        return Err(SfsError::InvalidFormat(format!(
            "wrong size trim record, jblock {} offset {}",
            ji.jblock(),
            ji.blockoffset()
        )));
    }
    Ok(Lsn::from_le_bytes(rec.try_into().unwrap()))
}

/// Scan forward from the physical beginning looking for the head: the
/// point where the LSN sequence strictly decreases, or an all-zero
/// block. Remembers first-LSN-per-block along the way, and the tail LSN
/// of the newest trim record seen.
fn scan_for_head(
    jphys: &Jphys,
    tailsearchpos: &mut JPosition,
    taillsn: &mut Lsn,
) -> Result<(JPosition, Lsn)> {
    let startpos = JPosition::default();
    let mut ji = Jiter::new(jphys, startpos, startpos, true);
    ji.seek_tail()?;

    let mut first = true;
    let mut firstlsn: Lsn = 0;
    let mut prevlsn: Lsn = 0;
    *taillsn = 0;

    while !ji.done() {
        ji.read_record()?;
        jphys.save_first_lsn(ji.jblock(), ji.lsn());

        let class = ji.class();
        let typ = ji.record_type();
        let thislsn = ji.lsn();
        debug!(
            jblock = ji.jblock(),
            offset = ji.blockoffset(),
            lsn = thislsn,
            class,
            typ,
            "container scan"
        );

        if thislsn == 0 {
            if ji.blockoffset() == 0 {
                // A block of all zeros: never written, so the head is
                // here, and it's block-aligned.
                return Ok((ji.pos(), prevlsn + 1));
            }
            // Implicit padding inside a block; not part of the LSN
            // sequence.
            ji.next()?;
            continue;
        }

        if first {
            firstlsn = thislsn;
            first = false;
        }

        if prevlsn != 0 && thislsn < prevlsn {
            // Found the head.
            if ji.blockoffset() != 0 {
                return Err(SfsError::InvalidFormat(format!(
                    "journal head within block, jblock {} offset {}",
                    ji.jblock(),
                    ji.blockoffset()
                )));
            }
            return Ok((ji.pos(), prevlsn + 1));
        }

        if class == CLASS_CONTAINER && typ == CONTAINER_TRIM {
            let jt = parse_trim(&ji)?;
            // The tail search should include the trim record, so
            // advance the iterator now and take the position after it.
            ji.next()?;
            if jt < firstlsn {
                *tailsearchpos = JPosition::default();
            } else {
                *tailsearchpos = ji.pos();
            }
            *taillsn = jt;
        } else {
            ji.next()?;
        }

        prevlsn = thislsn;
    }

    // No head found; it must align exactly with the rollover point.
    Ok((JPosition::default(), prevlsn + 1))
}

/// Scan backward from the physical end for a trim record. Only needed
/// when the forward scan saw none before the head.
fn scan_for_trim(jphys: &Jphys, tailsearchpos: &mut JPosition) -> Result<Lsn> {
    let startpos = JPosition::default();
    let mut ji = Jiter::new(jphys, startpos, startpos, true);
    ji.seek_head()?;

    while !ji.done() {
        ji.read_record()?;
        jphys.save_first_lsn(ji.jblock(), ji.lsn());

        if ji.class() == CLASS_CONTAINER && ji.record_type() == CONTAINER_TRIM {
            let jt = parse_trim(&ji)?;
            *tailsearchpos = ji.pos();
            return Ok(jt);
        }

        ji.prev()?;
    }

    Err(SfsError::InvalidFormat("no trim record found".to_string()))
}

/// Scan backward from the search position to the record whose LSN is
/// the tail LSN, and return its physical position.
fn scan_for_tail(jphys: &Jphys, tailsearchpos: JPosition, taillsn: Lsn) -> Result<JPosition> {
    let mut ji = Jiter::new(jphys, tailsearchpos, tailsearchpos, true);
    ji.seek_head()?;

    while !ji.done() {
        ji.read_record()?;
        jphys.save_first_lsn(ji.jblock(), ji.lsn());

        if ji.lsn() == taillsn {
            return Ok(ji.pos());
        }

        ji.prev()?;
    }

    Err(SfsError::InvalidFormat(format!(
        "tail LSN {taillsn} not found -- overwritten?"
    )))
}

impl Jphys {
    /// Load up the container: recovery for the container-level state.
    /// Locates head and tail and seeds the LSN map.
    pub fn loadup(&self) -> Result<()> {
        let reservation = self.cache().reserve();

        debug!("scanning to find the journal head");
        let mut tailsearchpos = JPosition::default();
        let mut taillsn: Lsn = 0;
        let (headpos, headlsn) = scan_for_head(self, &mut tailsearchpos, &mut taillsn)?;
        debug!(jblock = headpos.jblock, offset = headpos.offset, lsn = headlsn, "head");
        assert_ne!(headlsn, 0);

        if taillsn == 0 {
            debug!("scanning to find a trim record");
            taillsn = scan_for_trim(self, &mut tailsearchpos)?;
        }
        assert_ne!(taillsn, 0);

        debug!(lsn = taillsn, "scanning to find the tail position");
        let tailpos = scan_for_tail(self, tailsearchpos, taillsn)?;
        debug!(jblock = tailpos.jblock, offset = tailpos.offset, lsn = taillsn, "tail");

        // The head position must be block-aligned.
        assert_eq!(headpos.offset, 0);

        self.set_recovered_positions(headpos, headlsn, tailpos, taillsn);

        drop(reservation);
        Ok(())
    }
}
