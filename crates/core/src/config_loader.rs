use crate::config::AppConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration from a TOML file, then `APP_`-prefixed environment
    /// overrides (nested keys split on `__`, e.g. `APP_RISK__SL_PCT=25`).
    ///
    /// Missing files fall back to defaults; the result is validated.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or the merged config is invalid.
    pub fn load(path: &str) -> Result<AppConfig> {
        Self::extract(Figment::new().merge(Toml::file(path)))
    }

    /// Loads `path` with a profile overlay (`Config.toml` + `Config.<profile>.toml`).
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be parsed or the result is invalid.
    pub fn load_with_profile(path: &str, profile: &str) -> Result<AppConfig> {
        let overlay = match path.rsplit_once('.') {
            Some((stem, ext)) => format!("{stem}.{profile}.{ext}"),
            None => format!("{path}.{profile}"),
        };
        Self::extract(
            Figment::new()
                .merge(Toml::file(path))
                .merge(Toml::file(overlay)),
        )
    }

    fn extract(figment: Figment) -> Result<AppConfig> {
        let config: AppConfig = figment
            .merge(Env::prefixed("APP_").split("__"))
            .extract()
            .context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::io::Write;

    #[test]
    fn loads_partial_file_over_defaults() {
        let dir = std::env::temp_dir().join(format!("cfg-loader-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("Config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[risk]\nsl_pct = 2.0\ntime_exit_cutoff = \"14:45:00\"\n\n[monitor]\npoll_interval_ms = 250"
        )
        .unwrap();

        let config = ConfigLoader::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.risk.sl_pct, Decimal::from(2));
        assert_eq!(config.risk.tp_pct, Decimal::from(60));
        assert_eq!(config.monitor.poll_interval_ms, 250);
        assert_eq!(config.risk.time_exit_cutoff.to_string(), "14:45:00");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = ConfigLoader::load("/nonexistent/Config.toml").unwrap();
        assert_eq!(config.monitor.reconcile_interval_secs, 5);
    }
}
