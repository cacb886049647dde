//! Contains the worker configuration.
//!
//! The configuration is a YAML file (**config/settings.yml** unless specified otherwise). The
//! file can be observed for changes via [watch](watch). Each user of the config should then
//! attach itself to the [Config::notifier](Config::notifier) and re-process the config once a
//! change message is received. The [Receiver](crate::protocol::receiver::Receiver) does this to
//! rebuild its cache policy.
//!
//! Note that the **Config** itself can be kept around. However, a [Handle](Handle) obtained via
//! **Config::current()** should not be stored, as it will not be updated once a new config has
//! been loaded.
//!
//! # Examples
//!
//! ```
//! # use courier::config::Config;
//! let config = Config::new("settings.yml");
//! config.load_from_string("
//! queue:
//!     max_concurrent: 8
//! ", None).unwrap();
//!
//! assert_eq!(config.current().query("queue.max_concurrent").as_i64(), Some(8));
//! assert_eq!(config.current().query("queue.unknown").is_badvalue(), true);
//! ```
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use yaml_rust::{Yaml, YamlLoader};

/// Determines how often the config file is checked for changes.
const CHANGE_MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// Provides access to the worker configuration.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(Yaml, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// Internally this is simply the receiver of a broadcast. The actual message being broadcast
/// can and should be ignored. All that matters is, once a message has been received, the config
/// was changed and needs to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
pub struct Handle {
    config: Arc<(Yaml, Option<SystemTime>)>,
}

impl Config {
    /// Creates a new config reading the given file.
    ///
    /// Note that this neither loads the file nor installs a change listener.
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new((Yaml::Null, None))),
            tx,
        }
    }

    /// Returns the name of the underlying file.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Reads the underlying file.
    ///
    /// A missing file isn't an error, the worker simply runs with its defaults.
    pub async fn load(&self) -> anyhow::Result<()> {
        let last_modified = match self.last_modified().await {
            Some(last_modified) => last_modified,
            None => {
                log::info!(
                    "Config file {} doesn't exist - using defaults.",
                    &self.filename
                );
                return Ok(());
            }
        };

        log::info!("Loading config file {}...", &self.filename);
        let data = tokio::fs::read_to_string(&self.filename)
            .await
            .map_err(|error| {
                anyhow::anyhow!("Cannot load config file {}: {}", &self.filename, error)
            })?;

        self.load_from_string(data.as_str(), Some(last_modified))
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// An invalid document is rejected and the previous config remains active.
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let mut docs = YamlLoader::load_from_str(data).map_err(|error| {
            anyhow::anyhow!("Cannot parse config file {}: {}", &self.filename, error)
        })?;

        let doc = if docs.is_empty() {
            Yaml::Null
        } else {
            docs.swap_remove(0)
        };

        self.config.store(Arc::new((doc, last_modified)));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.send(());

        Ok(())
    }
}

impl Handle {
    /// Provides access to the root of the currently loaded configuration.
    pub fn config(&self) -> &Yaml {
        &self.config.0
    }

    /// Resolves a path like "cache.ttl" against the loaded configuration.
    ///
    /// Yields **Yaml::BadValue** if any part of the path is missing.
    pub fn query(&self, path: impl AsRef<str>) -> &Yaml {
        path.as_ref()
            .split('.')
            .filter(|key| !key.is_empty())
            .fold(self.config(), |yaml, key| &yaml[key])
    }
}

/// Periodically checks the config file and reloads it once it has been modified.
///
/// The monitor stops once the given token is cancelled. Note that this only checks the
/// "last modified" date of the file. It is the duty of each config user to gracefully handle
/// partial config changes.
pub fn watch(config: Arc<Config>, shutdown: CancellationToken) {
    let _ = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(CHANGE_MONITOR_INTERVAL) => {}
            }

            let last_modified = config.last_modified().await;
            let last_loaded = config.config.load().1;

            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => log::info!("Worker configuration was re-loaded."),
                    Err(error) => log::error!("Failed to re-load the configuration: {}", error),
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use std::time::SystemTime;

    #[test]
    fn ensure_config_update_works() {
        crate::testing::test_async(async {
            let config = Config::new("unused.yml");
            config
                .load_from_string("cache:\n  ttl: 42", Some(SystemTime::now()))
                .unwrap();

            let mut change_notifier = config.notifier();

            // A malformed config is rejected and doesn't replace the current one...
            assert_eq!(
                config
                    .load_from_string("cache: 'invalid", Some(SystemTime::now()))
                    .is_err(),
                true
            );
            assert_eq!(config.current().query("cache.ttl").as_i64(), Some(42));

            config
                .load_from_string("cache:\n  ttl: 4242", Some(SystemTime::now()))
                .unwrap();
            assert_eq!(change_notifier.recv().await.is_ok(), true);
            assert_eq!(config.current().query("cache.ttl").as_i64(), Some(4242));
        });
    }

    #[test]
    fn missing_files_are_no_error() {
        crate::testing::test_async(async {
            let config = Config::new("does/not/exist/settings.yml");
            assert_eq!(config.load().await.is_ok(), true);
            assert_eq!(config.current().config().is_null(), true);
            assert_eq!(config.current().query("queue").is_badvalue(), true);
        });
    }
}
