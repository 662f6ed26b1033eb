// Client record schema.
//
// Six record types, each carrying the issuing transaction id. Records
// are serialized into the fixed on-disk format directly (the journal
// container only sees bytes) and applied during recovery through the
// redo/undo pair below.

use std::sync::Arc;

use crate::buffer::BufferCache;
use crate::error::{Result, SfsError};
use crate::freemap::Freemap;

/// Largest byte range a single metadata update may cover.
pub const MAX_META_UPDATE_SIZE: usize = 128;

/// Client record type codes (7-bit space; 0 is never used).
pub const REC_TX_BEGIN: u8 = 1;
pub const REC_TX_COMMIT: u8 = 2;
pub const REC_FREEMAP_CAPTURE: u8 = 3;
pub const REC_FREEMAP_RELEASE: u8 = 4;
pub const REC_META_UPDATE: u8 = 5;
pub const REC_USER_BLOCK_WRITE: u8 = 6;

pub type TxId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    TxBegin {
        txid: TxId,
    },
    TxCommit {
        txid: TxId,
    },
    FreemapCapture {
        txid: TxId,
        block: u32,
    },
    FreemapRelease {
        txid: TxId,
        block: u32,
    },
    MetaUpdate {
        txid: TxId,
        block: u32,
        pos: u32,
        old: Vec<u8>,
        new: Vec<u8>,
    },
    UserBlockWrite {
        txid: TxId,
        block: u32,
        checksum: u32,
    },
}

impl Record {
    pub fn txid(&self) -> TxId {
        match *self {
            Record::TxBegin { txid }
            | Record::TxCommit { txid }
            | Record::FreemapCapture { txid, .. }
            | Record::FreemapRelease { txid, .. }
            | Record::MetaUpdate { txid, .. }
            | Record::UserBlockWrite { txid, .. } => txid,
        }
    }

    pub fn type_code(&self) -> u8 {
        match self {
            Record::TxBegin { .. } => REC_TX_BEGIN,
            Record::TxCommit { .. } => REC_TX_COMMIT,
            Record::FreemapCapture { .. } => REC_FREEMAP_CAPTURE,
            Record::FreemapRelease { .. } => REC_FREEMAP_RELEASE,
            Record::MetaUpdate { .. } => REC_META_UPDATE,
            Record::UserBlockWrite { .. } => REC_USER_BLOCK_WRITE,
        }
    }

    /// Serialize the payload (everything after the container header).
    /// Always an even number of bytes, as the container requires.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.txid().to_le_bytes());
        match self {
            Record::TxBegin { .. } | Record::TxCommit { .. } => {}
            Record::FreemapCapture { block, .. } | Record::FreemapRelease { block, .. } => {
                out.extend_from_slice(&block.to_le_bytes());
            }
            Record::MetaUpdate {
                block, pos, old, new, ..
            } => {
                assert_eq!(old.len(), new.len());
                assert!(old.len() <= MAX_META_UPDATE_SIZE);
                out.extend_from_slice(&block.to_le_bytes());
                out.extend_from_slice(&pos.to_le_bytes());
                out.extend_from_slice(&(old.len() as u32).to_le_bytes());
                out.extend_from_slice(old);
                out.extend_from_slice(new);
            }
            Record::UserBlockWrite {
                block, checksum, ..
            } => {
                out.extend_from_slice(&block.to_le_bytes());
                out.extend_from_slice(&checksum.to_le_bytes());
            }
        }
        debug_assert!(out.len() % 2 == 0);
        out
    }

    /// Deserialize a record payload given its type code.
    pub fn decode(typ: u8, payload: &[u8]) -> Result<Record> {
        fn get_u32(payload: &[u8], at: usize) -> Result<u32> {
            payload
                .get(at..at + 4)
                .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                .ok_or_else(|| SfsError::InvalidFormat("truncated journal record".to_string()))
        }

        let txid = get_u32(payload, 0)?;
        match typ {
            REC_TX_BEGIN => Ok(Record::TxBegin { txid }),
            REC_TX_COMMIT => Ok(Record::TxCommit { txid }),
            REC_FREEMAP_CAPTURE => Ok(Record::FreemapCapture {
                txid,
                block: get_u32(payload, 4)?,
            }),
            REC_FREEMAP_RELEASE => Ok(Record::FreemapRelease {
                txid,
                block: get_u32(payload, 4)?,
            }),
            REC_META_UPDATE => {
                let block = get_u32(payload, 4)?;
                let pos = get_u32(payload, 8)?;
                let len = get_u32(payload, 12)? as usize;
                if len > MAX_META_UPDATE_SIZE || payload.len() < 16 + 2 * len {
                    return Err(SfsError::InvalidFormat(
                        "malformed metadata update record".to_string(),
                    ));
                }
                Ok(Record::MetaUpdate {
                    txid,
                    block,
                    pos,
                    old: payload[16..16 + len].to_vec(),
                    new: payload[16 + len..16 + 2 * len].to_vec(),
                })
            }
            REC_USER_BLOCK_WRITE => Ok(Record::UserBlockWrite {
                txid,
                block: get_u32(payload, 4)?,
                checksum: get_u32(payload, 8)?,
            }),
            _ => Err(SfsError::InvalidFormat(format!(
                "unknown client record type {typ}"
            ))),
        }
    }
}

/// Checksum for user data blocks: two rolling 16-bit sums with modulus
/// 2^16 - 1 over all bytes of the block.
pub fn user_data_checksum(data: &[u8]) -> u32 {
    let mask = (1u32 << 16) - 1;
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    for &b in data {
        sum1 = (sum1 + b as u32) % mask;
        sum2 = (sum2 + sum1) % mask;
    }
    (sum2 << 16) | sum1
}

fn apply_meta(cache: &Arc<BufferCache>, block: u32, pos: u32, bytes: &[u8]) {
    let buf = cache
        .read(block)
        .unwrap_or_else(|e| panic!("recovery: reading metadata block {block}: {e}"));
    {
        let mut data = buf.map_mut();
        let pos = pos as usize;
        data[pos..pos + bytes.len()].copy_from_slice(bytes);
    }
    buf.mark_dirty();
}

fn redo_user_block_write(cache: &Arc<BufferCache>, block: u32, checksum: u32) {
    let buf = cache
        .read(block)
        .unwrap_or_else(|e| panic!("recovery: reading user data block {block}: {e}"));
    let stale = {
        let data = buf.map();
        user_data_checksum(&data) == checksum
    };
    if stale {
        buf.map_mut().fill(0);
        buf.mark_dirty();
    }
}

/// Apply a record forward.
pub fn redo(record: &Record, cache: &Arc<BufferCache>, freemap: &Freemap) {
    match record {
        Record::FreemapCapture { block, .. } => {
            freemap.lock().force(*block, true);
        }
        Record::FreemapRelease { block, .. } => {
            freemap.lock().force(*block, false);
        }
        Record::MetaUpdate {
            block, pos, new, ..
        } => {
            apply_meta(cache, *block, *pos, new);
        }
        Record::UserBlockWrite {
            block, checksum, ..
        } => {
            redo_user_block_write(cache, *block, *checksum);
        }
        Record::TxBegin { .. } | Record::TxCommit { .. } => {}
    }
}

/// Apply a record backward.
pub fn undo(record: &Record, cache: &Arc<BufferCache>, freemap: &Freemap) {
    match record {
        Record::FreemapCapture { block, .. } => {
            freemap.lock().force(*block, false);
        }
        Record::FreemapRelease { block, .. } => {
            freemap.lock().force(*block, true);
        }
        Record::MetaUpdate {
            block, pos, old, ..
        } => {
            apply_meta(cache, *block, *pos, old);
        }
        Record::UserBlockWrite { .. } | Record::TxBegin { .. } | Record::TxCommit { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{CacheConfig, CacheIo};
    use crate::device::{BlockDevice, Device, MemDevice};
    use crate::layout::{freemap_bits, Lsn, BLOCK_SIZE};

    #[test]
    fn roundtrip_all_types() {
        let records = vec![
            Record::TxBegin { txid: 7 },
            Record::TxCommit { txid: 7 },
            Record::FreemapCapture { txid: 7, block: 42 },
            Record::FreemapRelease { txid: 8, block: 43 },
            Record::MetaUpdate {
                txid: 9,
                block: 5,
                pos: 100,
                old: vec![1, 2, 3, 4],
                new: vec![5, 6, 7, 8],
            },
            Record::UserBlockWrite {
                txid: 10,
                block: 77,
                checksum: 0xdeadbeef,
            },
        ];
        for rec in records {
            let bytes = rec.encode();
            assert_eq!(bytes.len() % 2, 0);
            let back = Record::decode(rec.type_code(), &bytes).unwrap();
            assert_eq!(back, rec);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Record::decode(REC_META_UPDATE, &[0; 4]).is_err());
        assert!(Record::decode(99, &[0; 8]).is_err());
        // Length field claiming more than the payload holds.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&64u32.to_le_bytes());
        assert!(Record::decode(REC_META_UPDATE, &bytes).is_err());
    }

    #[test]
    fn checksum_is_order_sensitive() {
        let a = user_data_checksum(&[1, 2, 3]);
        let b = user_data_checksum(&[3, 2, 1]);
        assert_ne!(a, b);
        assert_eq!(user_data_checksum(&[]), 0);
        assert_eq!(user_data_checksum(&[0u8; BLOCK_SIZE]), 0);
    }

    struct RawIo {
        device: Device,
    }

    impl CacheIo for RawIo {
        fn read_block(&self, block: u32, data: &mut [u8]) -> crate::error::Result<()> {
            self.device.read_block(block, data)
        }

        fn write_block(
            &self,
            block: u32,
            data: &[u8],
            _lsns: Option<(Lsn, Lsn)>,
        ) -> crate::error::Result<()> {
            self.device.write_block(block, data)
        }
    }

    fn harness() -> (Arc<BufferCache>, Freemap) {
        let mem = Arc::new(MemDevice::new(64));
        let io = Arc::new(RawIo {
            device: Device::new(mem as Arc<dyn BlockDevice>),
        });
        let cache = BufferCache::new(CacheConfig { max_buffers: 16 }, io);
        let bytes = (freemap_bits(64) / 8) as usize;
        let freemap = Freemap::from_bits(vec![0u8; bytes], 64);
        (cache, freemap)
    }

    #[test]
    fn meta_update_redo_and_undo_patch_bytes() {
        let (cache, freemap) = harness();
        let res = cache.reserve();
        let rec = Record::MetaUpdate {
            txid: 1,
            block: 10,
            pos: 20,
            old: vec![0, 0],
            new: vec![0xca, 0xfe],
        };
        redo(&rec, &cache, &freemap);
        {
            let buf = cache.read(10).unwrap();
            assert_eq!(&buf.map()[20..22], &[0xca, 0xfe]);
        }
        undo(&rec, &cache, &freemap);
        {
            let buf = cache.read(10).unwrap();
            assert_eq!(&buf.map()[20..22], &[0, 0]);
        }
        drop(res);
    }

    #[test]
    fn freemap_records_flip_bits_both_ways() {
        let (cache, freemap) = harness();
        let rec = Record::FreemapCapture { txid: 1, block: 9 };
        redo(&rec, &cache, &freemap);
        assert!(freemap.bused(9));
        undo(&rec, &cache, &freemap);
        assert!(!freemap.bused(9));
        // Redoing twice must not panic.
        redo(&rec, &cache, &freemap);
        redo(&rec, &cache, &freemap);
        assert!(freemap.bused(9));
    }

    #[test]
    fn user_block_redo_zeroes_only_on_checksum_match() {
        let (cache, freemap) = harness();
        let res = cache.reserve();
        let payload = vec![0x11u8; BLOCK_SIZE];
        {
            let buf = cache.get(30).unwrap();
            buf.map_mut().copy_from_slice(&payload);
            buf.mark_valid();
            buf.mark_dirty();
        }
        let matching = Record::UserBlockWrite {
            txid: 2,
            block: 30,
            checksum: user_data_checksum(&payload),
        };
        let mismatching = Record::UserBlockWrite {
            txid: 2,
            block: 30,
            checksum: 12345,
        };
        redo(&mismatching, &cache, &freemap);
        {
            let buf = cache.read(30).unwrap();
            assert_eq!(buf.map()[0], 0x11);
        }
        redo(&matching, &cache, &freemap);
        {
            let buf = cache.read(30).unwrap();
            assert_eq!(buf.map()[0], 0);
        }
        drop(res);
    }
}
