//! Provides a builder which can be used to setup and start a worker.
//!
//! The worker runs on a dedicated thread with a single threaded tokio runtime of its own. It hosts
//! the [Receiver](crate::protocol::receiver::Receiver), the
//! [RequestQueue](crate::queue::RequestQueue) and the given [Transport](crate::request::Transport).
//! The caller only ever talks to it via the [Interface](crate::protocol::interface::Interface)
//! which is handed out by the resulting [Worker](Worker).
//!
//! # Example
//! ```no_run
//! # use courier::builder::Builder;
//! # use courier::request::transport_fn;
//! # use std::sync::Arc;
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = transport_fn(|url, _| async move { Ok(serde_json::json!(url)) });
//!
//!     let worker = Builder::new()
//!         .enable_logging()
//!         .config_file("config/settings.yml")
//!         .spawn(Arc::new(transport))
//!         .await?;
//!
//!     let fish = worker.interface().add_request("/fish", None).response().await?;
//!     println!("{:?}", fish);
//!
//!     worker.join().await
//! }
//! ```
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio_util::sync::CancellationToken;

use crate::cache::mem::MemCache;
use crate::cache::policy::CachePolicy;
use crate::cache::rules::CachePolicyConfig;
use crate::cache::{create_store, CacheEntry, KeyValueCache};
use crate::config::Config;
use crate::protocol::channel::duplex;
use crate::protocol::interface::Interface;
use crate::protocol::receiver::Receiver;
use crate::queue::{RequestQueue, DEFAULT_MAX_CONCURRENT};
use crate::request::Transport;
use crate::{init_logging, COURIER_REVISION, COURIER_VERSION};

/// Collects the settings of a worker before it is started.
///
/// Everything which isn't specified explicitly is read from the config file (if one is given)
/// or falls back to its default.
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    config_file: Option<String>,
    max_concurrent: Option<usize>,
    policy: Option<CachePolicyConfig>,
    store: Option<Arc<dyn KeyValueCache<CacheEntry>>>,
}

impl Builder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Builder::default()
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// Using this, we properly initialize **simplelog** to log to stdout.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Loads the settings from the given YAML file.
    ///
    /// The file is monitored and the cache policy is rebuilt once it changes, unless a policy
    /// is specified explicitly via [policy()](Builder::policy). A missing file is no error.
    pub fn config_file(mut self, file: impl Into<String>) -> Self {
        self.config_file = Some(file.into());
        self
    }

    /// Specifies the maximal number of requests being performed at the same time.
    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = Some(max_concurrent);
        self
    }

    /// Specifies the cache policy to use instead of the one in the config.
    pub fn policy(mut self, policy: CachePolicyConfig) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Specifies the store to use instead of the one in the config.
    pub fn store(mut self, store: Arc<dyn KeyValueCache<CacheEntry>>) -> Self {
        self.store = Some(store);
        self
    }

    /// Starts a worker which uses the given transport to perform requests.
    ///
    /// # Errors
    /// Fails if the config file or any of the given settings is invalid, or if the worker
    /// thread cannot be started.
    pub async fn spawn(self, transport: Arc<dyn Transport>) -> anyhow::Result<Worker> {
        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "||. COURIER (v {} - rev {}) running on {} core(s) in {} CPU(s)",
            COURIER_VERSION,
            COURIER_REVISION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        let config = match &self.config_file {
            Some(file) => {
                let config = Arc::new(Config::new(file));
                config.load().await?;
                Some(config)
            }
            None => None,
        };

        let max_concurrent = match (self.max_concurrent, &config) {
            (Some(max_concurrent), _) => max_concurrent,
            (None, Some(config)) => max_concurrent_from_config(config)?,
            (None, None) => DEFAULT_MAX_CONCURRENT,
        };

        let store = match (self.store, &config) {
            (Some(store), _) => store,
            (None, Some(config)) => create_store(&config.current())?,
            (None, None) => Arc::new(MemCache::<CacheEntry>::new()),
        };

        // An explicit policy is never replaced by the one in the config...
        let watched_config = match self.policy {
            Some(_) => None,
            None => config.clone(),
        };
        let rules = match (self.policy, &config) {
            (Some(policy), _) => policy,
            (None, Some(config)) => CachePolicyConfig::from_yaml(config.current().query("cache"))?,
            (None, None) => CachePolicyConfig::new(),
        };
        let policy = Arc::new(CachePolicy::new(rules, store)?);

        let (caller, port) = duplex();
        let interface = Interface::new(caller);
        let shutdown = CancellationToken::new();

        let thread = {
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("courier-worker".to_owned())
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(error) => {
                            log::error!("Failed to start the runtime of the worker: {}", error);
                            return;
                        }
                    };

                    runtime.block_on(async move {
                        let queue = RequestQueue::with_max_concurrent(transport, max_concurrent);
                        let mut receiver = Receiver::new(port, policy, queue);
                        if let Some(config) = watched_config {
                            crate::config::watch(config.clone(), shutdown.clone());
                            receiver = receiver.watch(config);
                        }

                        log::info!(
                            "The worker is up and running ({} concurrent requests)...",
                            max_concurrent
                        );
                        receiver.event_loop(shutdown).await;
                        log::info!("The worker has been stopped.");
                    });
                })?
        };

        Ok(Worker {
            interface,
            shutdown,
            thread: Some(thread),
        })
    }
}

fn max_concurrent_from_config(config: &Config) -> anyhow::Result<usize> {
    let handle = config.current();
    let value = handle.query("queue.max_concurrent");
    if value.is_badvalue() {
        return Ok(DEFAULT_MAX_CONCURRENT);
    }

    match value.as_i64() {
        Some(max_concurrent) if max_concurrent > 0 => Ok(max_concurrent as usize),
        _ => Err(anyhow::anyhow!(
            "Invalid queue.max_concurrent: {:?} - A positive integer is required.",
            value
        )),
    }
}

/// Represents a running worker.
///
/// Dropping the worker terminates it, without waiting for it to stop.
pub struct Worker {
    interface: Interface,
    shutdown: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Provides the interface used to send requests to this worker.
    ///
    /// The interface can be cloned and handed to as many callers as needed.
    pub fn interface(&self) -> &Interface {
        &self.interface
    }

    /// Determines if the worker hasn't been asked to stop yet.
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Asks the worker to stop.
    ///
    /// All requests which are still pending are cancelled and their callers receive a
    /// [Disconnected](crate::protocol::interface::RequestError::Disconnected) error.
    pub fn terminate(&self) {
        self.shutdown.cancel();
    }

    /// Terminates the worker and waits until its thread has stopped.
    pub async fn join(mut self) -> anyhow::Result<()> {
        self.terminate();

        if let Some(thread) = self.thread.take() {
            tokio::task::spawn_blocking(move || thread.join())
                .await?
                .map_err(|_| anyhow::anyhow!("The worker thread panicked."))?;
        }

        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
