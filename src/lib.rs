// RustySFS - write-ahead-logged block filesystem engine.
//
// The crate is layered from the bottom up: a block device adapter, a
// buffer cache with reservation-based admission and a background
// syncer, a bitmap block allocator, the indirect-block file layout, a
// circular physical journal with LSN-ordered write-back, typed journal
// records with per-thread transactions and a checkpoint daemon, and a
// three-pass recovery driver that runs once at mount.

pub mod bmap;
pub mod buffer;
pub mod device;
pub mod dir;
pub mod error;
pub mod file;
pub mod freemap;
pub mod graveyard;
pub mod inode;
pub mod journal;
pub mod layout;
pub mod recovery;
pub mod transaction;
pub mod vnops;
pub mod volume;

pub use buffer::{CacheConfig, CacheStats};
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use error::{Result, SfsError};
pub use inode::VnodeRef;
pub use layout::FileType;
pub use volume::{FileStat, MountOptions, SfsVolume};
