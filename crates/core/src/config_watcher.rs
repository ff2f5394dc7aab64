use crate::config::AppConfig;
use crate::config_loader::ConfigLoader;
use anyhow::Result;
use notify::{Event, RecursiveMode, Watcher};
use std::path::Path;
use tokio::sync::watch;

pub struct ConfigWatcher {
    tx: watch::Sender<AppConfig>,
}

impl ConfigWatcher {
    /// Creates a new configuration watcher with an initial configuration.
    ///
    /// Returns a tuple of the watcher and a receiver for configuration updates.
    #[must_use]
    pub fn new(initial_config: AppConfig) -> (Self, watch::Receiver<AppConfig>) {
        let (tx, rx) = watch::channel(initial_config);
        (Self { tx }, rx)
    }

    /// Another receiver on the same configuration stream.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AppConfig> {
        self.tx.subscribe()
    }

    /// Replaces the published config if it validates. Returns whether it was published.
    pub fn publish(&self, config: AppConfig) -> bool {
        match config.validate() {
            Ok(()) => {
                self.tx.send_replace(config);
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Rejected config update, keeping previous");
                false
            }
        }
    }

    /// Watches the configuration file for changes and broadcasts updates.
    ///
    /// Invalid edits are logged and ignored; readers keep the last good config.
    ///
    /// # Errors
    ///
    /// Returns an error if file watching cannot be initiated or if the watcher task fails.
    pub async fn watch(&self, config_path: &str) -> Result<()> {
        let tx = self.tx.clone();
        let config_path = config_path.to_string();

        tokio::task::spawn_blocking(move || {
            let (notify_tx, notify_rx) = std::sync::mpsc::channel();

            let mut watcher = notify::recommended_watcher(move |res: Result<Event, _>| {
                if let Ok(event) = res {
                    let _ = notify_tx.send(event);
                }
            })?;

            watcher.watch(Path::new(&config_path), RecursiveMode::NonRecursive)?;

            for event in notify_rx {
                if event.kind.is_modify() {
                    tracing::info!(path = %config_path, "Config file changed, reloading");
                    match ConfigLoader::load(&config_path) {
                        Ok(new_config) => {
                            tx.send_replace(new_config);
                            tracing::info!("Config reloaded");
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to reload config, keeping previous");
                        }
                    }
                }
            }

            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn publish_rejects_invalid_config() {
        let (watcher, rx) = ConfigWatcher::new(AppConfig::default());

        let mut bad = AppConfig::default();
        bad.risk.sl_pct = Decimal::ZERO;
        assert!(!watcher.publish(bad));
        assert_eq!(rx.borrow().risk.sl_pct, Decimal::from(30));

        let mut good = AppConfig::default();
        good.risk.sl_pct = Decimal::from(25);
        assert!(watcher.publish(good));
        assert_eq!(rx.borrow().risk.sl_pct, Decimal::from(25));
    }
}
