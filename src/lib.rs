//! Courier is a library which arbitrates all requests an application sends to its backend.
//!
//! # Introduction
//! Applications built around a UI tend to fire the same requests over and over again. Several
//! widgets ask for the same resource at the same time, a user navigates back and forth and every
//! view reloads its data. **Courier** sits between these callers and the network and makes sure
//! that only the requests which are really required leave the process.
//!
//! All callers talk to an [Interface](protocol::interface::Interface), which forwards each
//! request as an [Envelope](protocol::Envelope) to a worker. The worker runs in a thread of its
//! own and never shares any memory with the caller. Instead, both sides exchange JSON frames via
//! a [channel](protocol::channel). Each call is correlated by an id and answered by a sequence of
//! notifications.
//!
//! # Features
//! * **Deduplication**: Concurrent **GET** requests for the same URL are coalesced into a single
//!   network request, whose result is shared by all callers. See [RequestQueue](queue::RequestQueue).
//! * **Concurrency limits**: At most a given number of requests (4 by default) are in flight at
//!   any time. All others wait in the order in which they were issued.
//! * **Caching**: Responses are cached using a configurable time to live. Writes automatically
//!   invalidate all entries which depend on the modified resource. See [CachePolicy](cache::policy::CachePolicy).
//! * **Cancellation**: Callers can abandon a request at any time. Once no caller is interested in
//!   a request anymore, the underlying [Transport](request::Transport) is cancelled.
//! * **Reload-aware config facility**: The cache rules are read from a YAML file which is
//!   monitored for changes. Therefore no restart is required to change a TTL.
//!
//! # Examples
//! A short example on how to start a worker can be found here [Builder](builder::Builder).
//! A complete program which performs HTTP requests can be found in **courier-io**.
#![deny(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
#![warn(missing_docs, unused_results)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod builder;
pub mod cache;
pub mod config;
pub mod fmt;
pub mod protocol;
pub mod queue;
pub mod request;

/// Contains the version of the Courier library.
pub const COURIER_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the Courier build being used.
pub const COURIER_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// worker, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned join handle to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate courier;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
