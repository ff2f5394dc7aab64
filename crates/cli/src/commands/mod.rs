pub mod check_config;
pub mod positions;
pub mod run;

pub use check_config::run_check_config;
pub use positions::{run_positions, PositionsArgs};
pub use run::{run_engine, RunArgs};

use algo_trade_core::{AppConfig, ConfigLoader};
use anyhow::Result;

/// Loads `path`, with the `profile` overlay when one is given.
pub(crate) fn load_config(path: &str, profile: Option<&str>) -> Result<AppConfig> {
    match profile {
        Some(profile) => ConfigLoader::load_with_profile(path, profile),
        None => ConfigLoader::load(path),
    }
}
