//! [`PositionStore`](algo_trade_core::PositionStore) implementations.

mod memory;
mod postgres;

pub use memory::MemoryPositionStore;
pub use postgres::PgPositionStore;
