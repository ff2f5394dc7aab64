//! positions CLI command.
//!
//! Lists the active positions held in PostgreSQL, the same rows the engine
//! bootstraps from.

use algo_trade_core::{Position, PositionStore};
use algo_trade_options_manager::store::PgPositionStore;
use anyhow::{anyhow, Result};
use clap::Args;

use super::load_config;

/// Arguments for the positions command.
#[derive(Args, Debug, Clone)]
pub struct PositionsArgs {
    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: String,

    /// Database connection URL (overrides `database.url` from the config)
    #[arg(long, env = "DATABASE_URL")]
    pub db_url: Option<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

/// Runs the positions command.
///
/// # Errors
/// Returns an error if no database is configured or the query fails.
pub async fn run_positions(args: PositionsArgs) -> Result<()> {
    let config = load_config(&args.config, None)?;
    let db_url = args
        .db_url
        .or(config.database.url)
        .ok_or_else(|| anyhow!("no database configured: set database.url or DATABASE_URL"))?;

    let store = PgPositionStore::connect(&db_url, config.database.max_connections).await?;
    let mut positions = store.active_positions().await?;
    positions.sort_by_key(|p| p.id);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&positions)?);
        return Ok(());
    }

    if positions.is_empty() {
        println!("No active positions");
        return Ok(());
    }

    println!(
        "{:>6}  {:<22} {:<5} {:>6} {:>10} {:>9} {:>9}  {}",
        "ID", "INSTRUMENT", "SIDE", "QTY", "ENTRY", "PNL %", "PEAK %", "ENTERED"
    );
    for position in &positions {
        println!("{}", format_row(position));
    }
    println!("\n{} active position(s)", positions.len());
    Ok(())
}

fn format_row(p: &Position) -> String {
    let pnl = p
        .last_pnl
        .as_ref()
        .map_or_else(|| "-".to_string(), |s| s.pnl_pct.round_dp(2).to_string());
    let entered = p
        .entered_at
        .map_or_else(|| "-".to_string(), |t| t.format("%H:%M:%S").to_string());
    let mode = if p.paper { " (paper)" } else { "" };
    format!(
        "{:>6}  {:<22} {:<5} {:>6} {:>10} {:>9} {:>9}  {}{}",
        p.id,
        p.instrument.to_string(),
        p.side.as_str(),
        p.quantity,
        p.entry_price,
        pnl,
        p.peak_pnl_pct.round_dp(2),
        entered,
        mode
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use algo_trade_core::{InstrumentKey, NewPosition};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn row_shows_missing_pnl_as_dash() {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 4, 0, 0).unwrap();
        let new = NewPosition::long(InstrumentKey::new("NSE_FNO", "43251"), dec!(120.5), 75);
        let mut position = Position::pending(7, new, at).unwrap();
        position.activate(None, at).unwrap();

        let row = format_row(&position);
        assert!(row.contains("NSE_FNO"));
        assert!(row.contains("120.5"));
        assert!(row.contains(" - "));
        assert!(row.ends_with("04:00:00"));
    }
}
