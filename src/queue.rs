//! Provides the request queue which arbitrates all calls to the [Transport](Transport).
//!
//! The queue is an actor which exclusively owns its pipeline. Each call to
//! [RequestQueue::queue](RequestQueue::queue) sends a command to the actor and receives a ticket
//! in return. The ticket contains a shared outcome which resolves once the transport delivered
//! its result.
//!
//! The queue enforces two things:
//! * At most **max_concurrent** requests are performed at the same time. All others wait in the
//!   order in which they arrived.
//! * Concurrent **GET** requests for the same URL are deduplicated. As long as a request is
//!   pending, all further callers attach themselves to it and receive the very same result. Once
//!   the request delivered its result, the next call will once again hit the transport. Any
//!   other method is never deduplicated.
//!
//! # Cancellation
//!
//! A caller cancels its request by simply dropping the future returned by **queue**. Once all
//! callers attached to a request are gone, the request is cancelled. If it is still waiting, it
//! is skipped. If it is already running, the future returned by the transport is dropped, which
//! aborts the underlying network call. In both cases its slot is freed right away.
//!
//! # Examples
//!
//! ```
//! # use courier::queue::RequestQueue;
//! # use courier::request::{transport_fn, RequestOptions};
//! # use std::sync::Arc;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let queue = RequestQueue::with_max_concurrent(
//!     Arc::new(transport_fn(|url, options| async move {
//!         Ok(serde_json::json!(format!("{} {}", options.method(), url)))
//!     })),
//!     2,
//! );
//!
//! let response = queue.queue("/fish", RequestOptions::default()).await.unwrap();
//! assert_eq!(response, "GET /fish");
//! # }
//! ```
use std::collections::{HashMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::request::{Method, RequestOptions, Transport};
use crate::spawn;

/// Determines how many requests are performed concurrently unless specified otherwise.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Describes why a queued request didn't yield a value.
#[derive(Clone, Debug)]
pub enum TransportError {
    /// The transport reported an error. This is shared by all callers attached to the request.
    Failed(Arc<anyhow::Error>),

    /// The request has been cancelled as all of its callers went away.
    Cancelled,

    /// The actor of the queue is no longer running.
    QueueClosed,
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Failed(error) => write!(f, "{:#}", error),
            TransportError::Cancelled => write!(f, "The request has been cancelled."),
            TransportError::QueueClosed => write!(f, "The request queue has been shut down."),
        }
    }
}

impl std::error::Error for TransportError {}

type Outcome = Result<Value, TransportError>;
type SharedOutcome = Shared<BoxFuture<'static, Outcome>>;

enum Command {
    Queue {
        url: String,
        options: RequestOptions,
        callback: oneshot::Sender<Ticket>,
    },
}

/// Handed out to each caller. As long as one ticket of a request is alive, it won't be cancelled.
struct Ticket {
    outcome: SharedOutcome,
    attachment: Arc<DropGuard>,
}

impl Ticket {
    async fn wait(self) -> Outcome {
        let Ticket {
            outcome,
            attachment,
        } = self;

        let result = outcome.await;
        std::mem::drop(attachment);

        result
    }
}

struct Job {
    token: Uuid,
    url: String,
    options: RequestOptions,
    cancel: CancellationToken,
    callback: oneshot::Sender<Outcome>,
}

/// A pending GET request other callers can attach to.
struct InFlight {
    token: Uuid,
    outcome: SharedOutcome,
    attachment: Weak<DropGuard>,
}

/// Reported by an execution once the transport is done (or has been cancelled).
struct Settlement {
    token: Uuid,
    url: String,
    outcome: Option<Outcome>,
}

/// Provides a handle to the request queue actor.
///
/// This handle can be cloned and shared freely. The actor stops once all handles are dropped
/// and all pending requests are done.
#[derive(Clone)]
pub struct RequestQueue {
    commands: mpsc::Sender<Command>,
}

impl RequestQueue {
    /// Creates a queue which performs up to [DEFAULT_MAX_CONCURRENT](DEFAULT_MAX_CONCURRENT)
    /// requests concurrently.
    ///
    /// Note that this spawns the actor and therefore has to be called within a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        RequestQueue::with_max_concurrent(transport, DEFAULT_MAX_CONCURRENT)
    }

    /// Creates a queue which performs up to **max_concurrent** requests concurrently.
    ///
    /// A limit of zero is treated as one.
    pub fn with_max_concurrent(transport: Arc<dyn Transport>, max_concurrent: usize) -> Self {
        let (commands, endpoint) = mpsc::channel(1024);
        let (settlements, settlements_endpoint) = mpsc::unbounded_channel();

        let pipeline = Pipeline {
            transport,
            max_concurrent: max_concurrent.max(1),
            running: HashMap::new(),
            waiting: VecDeque::new(),
            in_flight: HashMap::new(),
            settlements,
        };
        spawn!(pipeline.event_loop(endpoint, settlements_endpoint));

        RequestQueue { commands }
    }

    /// Performs the given request once a slot is available and returns its result.
    ///
    /// If a GET request for the same URL is already pending, its result is shared instead of
    /// performing another call.
    pub async fn queue(&self, url: &str, options: RequestOptions) -> Result<Value, TransportError> {
        let (callback, ticket) = oneshot::channel();
        self.commands
            .send(Command::Queue {
                url: url.to_owned(),
                options,
                callback,
            })
            .await
            .map_err(|_| TransportError::QueueClosed)?;

        let ticket = ticket.await.map_err(|_| TransportError::QueueClosed)?;
        ticket.wait().await
    }
}

struct Pipeline {
    transport: Arc<dyn Transport>,
    max_concurrent: usize,
    running: HashMap<Uuid, oneshot::Sender<Outcome>>,
    waiting: VecDeque<Job>,
    in_flight: HashMap<String, InFlight>,
    settlements: mpsc::UnboundedSender<Settlement>,
}

impl Pipeline {
    async fn event_loop(
        mut self,
        mut endpoint: mpsc::Receiver<Command>,
        mut settlements: mpsc::UnboundedReceiver<Settlement>,
    ) {
        let mut closed = false;

        loop {
            tokio::select! {
                command = endpoint.recv(), if !closed => match command {
                    Some(Command::Queue { url, options, callback }) => {
                        self.enqueue(url, options, callback)
                    }
                    None => closed = true,
                },
                Some(settlement) = settlements.recv() => self.settle(settlement),
            }

            if closed && self.running.is_empty() && self.waiting.is_empty() {
                log::debug!("All request queue handles are gone - stopping the actor...");
                return;
            }
        }
    }

    fn enqueue(&mut self, url: String, options: RequestOptions, callback: oneshot::Sender<Ticket>) {
        let deduplicate = options.method() == Method::Get;

        if deduplicate {
            if let Some(in_flight) = self.in_flight.get(&url) {
                if let Some(attachment) = in_flight.attachment.upgrade() {
                    log::debug!("Attaching to the pending request for {}...", url);
                    let _ = callback.send(Ticket {
                        outcome: in_flight.outcome.clone(),
                        attachment,
                    });
                    return;
                }
            }
        }

        let token = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let attachment = Arc::new(cancel.clone().drop_guard());
        let (settle, result) = oneshot::channel();
        let outcome = async move { result.await.unwrap_or(Err(TransportError::QueueClosed)) }
            .boxed()
            .shared();

        if deduplicate {
            let _ = self.in_flight.insert(
                url.clone(),
                InFlight {
                    token,
                    outcome: outcome.clone(),
                    attachment: Arc::downgrade(&attachment),
                },
            );
        }

        self.waiting.push_back(Job {
            token,
            url,
            options,
            cancel,
            callback: settle,
        });

        // If the caller is already gone, dropping the ticket cancels the job right away...
        let _ = callback.send(Ticket {
            outcome,
            attachment,
        });

        self.admit();
    }

    fn admit(&mut self) {
        while self.running.len() < self.max_concurrent {
            let job = match self.waiting.pop_front() {
                Some(job) => job,
                None => return,
            };

            if job.cancel.is_cancelled() {
                log::debug!("Skipping the cancelled request for {}...", job.url);
                self.forget(&job.url, job.token);
                continue;
            }

            self.start(job);
        }
    }

    fn start(&mut self, job: Job) {
        let Job {
            token,
            url,
            options,
            cancel,
            callback,
        } = job;

        log::debug!(
            "Performing {} {} ({} of {} slots used)...",
            options.method(),
            url,
            self.running.len() + 1,
            self.max_concurrent
        );
        let _ = self.running.insert(token, callback);

        let transport = self.transport.clone();
        let settlements = self.settlements.clone();
        spawn!(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                result = transport.perform(&url, &options) => {
                    Some(result.map_err(|error| TransportError::Failed(Arc::new(error))))
                }
            };

            let _ = settlements.send(Settlement {
                token,
                url,
                outcome,
            });
        });
    }

    fn settle(&mut self, settlement: Settlement) {
        let Settlement {
            token,
            url,
            outcome,
        } = settlement;

        // The dedup window closes with the first (and only) result of an execution...
        self.forget(&url, token);

        match self.running.remove(&token) {
            Some(callback) => {
                if outcome.is_none() {
                    log::debug!("The request for {} has been cancelled...", url);
                }
                let _ = callback.send(outcome.unwrap_or(Err(TransportError::Cancelled)));
            }
            None => log::error!("Received a result for an unknown request: {}", url),
        }

        self.admit();
    }

    fn forget(&mut self, url: &str, token: Uuid) {
        if self
            .in_flight
            .get(url)
            .map(|in_flight| in_flight.token == token)
            .unwrap_or(false)
        {
            let _ = self.in_flight.remove(url);
        }
    }
}
