//! In-process projections of active positions and their pnl.

mod active;
mod pnl;
mod tier1;

pub use active::{ActivePositionCache, CacheEntry};
pub use pnl::PnlCache;
pub use tier1::InMemoryTier1;
