pub mod cache;
pub mod syncer;

pub use cache::{BufferCache, BufferGuard, CacheConfig, CacheIo, CacheStats, Reservation};
