pub mod config;
pub mod config_loader;
pub mod config_watcher;
pub mod events;
pub mod pnl;
pub mod position;
pub mod traits;

pub use config::{
    AppConfig, ConfigError, DatabaseConfig, MonitorConfig, RiskConfig, RuleToggles,
    SessionConfig, UnderlyingThresholds,
};
pub use config_loader::ConfigLoader;
pub use config_watcher::ConfigWatcher;
pub use events::{
    MarketTick, OrderPurpose, OrderStatus, OrderUpdate, PositionEvent, UnderlyingSignal,
};
pub use pnl::{PnlSnapshot, PnlSource};
pub use position::{
    ExitRecord, ExitTransition, InstrumentKey, NewPosition, OptionRight, Position, PositionError,
    PositionStatus, Side,
};
pub use traits::{ExitGateway, ExitOrder, MarketFeed, PnlTier1Store, PositionStore, SubmitOutcome};
