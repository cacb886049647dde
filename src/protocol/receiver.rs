//! Provides the worker side of the protocol.
//!
//! The [Receiver](Receiver) reads envelopes from the channel and hands them to a session per
//! correlation id. Each session is a task of its own, so that a slow request never blocks any
//! other call. A session answers its envelopes in the order in which they arrived and ends once
//! it emitted a terminal notification, or immediately once an **UNSUBSCRIBE** is received.
//!
//! A **REQUEST** is answered by consulting the [CachePolicy](CachePolicy) first. If no cached
//! response is present, the request is put into the [RequestQueue](RequestQueue) and its result
//! is stored in the cache before it is sent back to the caller. This can be fine tuned via the
//! **fromRemote** and **cacheResponse** options of the request.
//!
//! Invalid frames or envelopes are logged and dropped. They never affect any other session.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::policy::{CacheKey, CachePolicy};
use crate::cache::rules::CachePolicyConfig;
use crate::config::{ChangeNotifier, Config};
use crate::protocol::channel::{FrameSender, Port};
use crate::protocol::{
    Envelope, EnvelopeType, InvalidatePayload, Notification, ProtocolError, RequestPayload,
};
use crate::queue::RequestQueue;
use crate::spawn;

/// Answers the envelopes received via a channel.
///
/// # Examples
///
/// ```
/// # use courier::cache::CacheEntry;
/// # use courier::cache::mem::MemCache;
/// # use courier::cache::policy::CachePolicy;
/// # use courier::cache::rules::CachePolicyConfig;
/// # use courier::protocol::channel::duplex;
/// # use courier::protocol::interface::Interface;
/// # use courier::protocol::receiver::Receiver;
/// # use courier::queue::RequestQueue;
/// # use courier::request::transport_fn;
/// # use std::sync::Arc;
/// # use tokio_util::sync::CancellationToken;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> anyhow::Result<()> {
/// let (caller, worker) = duplex();
///
/// let policy = CachePolicy::new(CachePolicyConfig::new(), Arc::new(MemCache::<CacheEntry>::new()))?;
/// let queue = RequestQueue::new(Arc::new(transport_fn(|url, _| async move {
///     Ok(serde_json::json!(url))
/// })));
/// let shutdown = CancellationToken::new();
/// tokio::spawn(Receiver::new(worker, Arc::new(policy), queue).event_loop(shutdown.clone()));
///
/// let interface = Interface::new(caller);
/// let response = interface.add_request("/fish", None).response().await?;
/// assert_eq!(response, Some(serde_json::json!("/fish")));
///
/// shutdown.cancel();
/// # Ok(())
/// # }
/// ```
pub struct Receiver {
    port: Port,
    policy: Arc<CachePolicy>,
    queue: RequestQueue,
    config: Option<Arc<Config>>,
}

impl Receiver {
    /// Creates a receiver for the given port which answers requests using the given policy
    /// and queue.
    pub fn new(port: Port, policy: Arc<CachePolicy>, queue: RequestQueue) -> Self {
        Receiver {
            port,
            policy,
            queue,
            config: None,
        }
    }

    /// Rebuilds the cache policy from the **cache** section whenever the given config changes.
    ///
    /// The new policy operates on the same store as the current one. Sessions which are
    /// already running keep using the policy with which they were started.
    pub fn watch(mut self, config: Arc<Config>) -> Self {
        self.config = Some(config);
        self
    }

    /// Processes envelopes until either the channel is closed or the given token is cancelled.
    ///
    /// All sessions which are still running at this point are cancelled.
    pub async fn event_loop(self, shutdown: CancellationToken) {
        let Receiver {
            port,
            policy,
            queue,
            config,
        } = self;

        let (outbound, mut inbound) = port.split();
        let (closed, mut closed_endpoint) = mpsc::unbounded_channel();
        let mut notifier = config.as_ref().map(|config| config.notifier());

        let mut dispatcher = Dispatcher {
            outbound,
            policy,
            queue,
            config,
            sessions: HashMap::new(),
            generation: 0,
            closed,
        };

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => dispatcher.dispatch(&frame),
                    None => {
                        log::info!("The caller closed the channel - stopping the receiver...");
                        break;
                    }
                },
                Some((id, generation)) = closed_endpoint.recv() => dispatcher.forget(id, generation),
                _ = config_changed(&mut notifier) => dispatcher.reload_policy(),
            }
        }

        dispatcher.cancel_all();
    }
}

async fn config_changed(notifier: &mut Option<ChangeNotifier>) {
    match notifier {
        Some(receiver) => match receiver.recv().await {
            Ok(_) | Err(RecvError::Lagged(_)) => (),
            Err(RecvError::Closed) => {
                *notifier = None;
                std::future::pending::<()>().await
            }
        },
        None => std::future::pending::<()>().await,
    }
}

struct Session {
    inbox: mpsc::UnboundedSender<Envelope>,
    cancel: CancellationToken,
    generation: u64,
}

/// Owns the session table. Only ever used by the event loop.
struct Dispatcher {
    outbound: FrameSender,
    policy: Arc<CachePolicy>,
    queue: RequestQueue,
    config: Option<Arc<Config>>,
    sessions: HashMap<Uuid, Session>,
    generation: u64,
    closed: mpsc::UnboundedSender<(Uuid, u64)>,
}

impl Dispatcher {
    fn dispatch(&mut self, frame: &str) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(error) => {
                log::warn!("Dropping a frame received from the caller: {}", error);
                return;
            }
        };

        match envelope.envelope_type {
            EnvelopeType::Request | EnvelopeType::Invalidate | EnvelopeType::ClearCache => {
                self.route(envelope)
            }
            EnvelopeType::Unsubscribe => self.unsubscribe(envelope.id),
            other => log::warn!(
                "Dropping an envelope for {}: {}",
                envelope.id,
                ProtocolError::UnexpectedEnvelope(other)
            ),
        }
    }

    fn route(&mut self, envelope: Envelope) {
        let id = envelope.id;

        // A session which already finished its work no longer accepts envelopes, in this case
        // a new one is started...
        let envelope = match self.sessions.get(&id) {
            Some(session) => match session.inbox.send(envelope) {
                Ok(_) => return,
                Err(mpsc::error::SendError(envelope)) => envelope,
            },
            None => envelope,
        };

        let session = self.start_session(id);
        if session.inbox.send(envelope).is_err() {
            log::error!("Failed to hand over an envelope to the new session {}.", id);
        }
        let _ = self.sessions.insert(id, session);
    }

    fn start_session(&mut self, id: Uuid) -> Session {
        self.generation += 1;
        let generation = self.generation;

        let (inbox, endpoint) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let context = SessionContext {
            id,
            policy: self.policy.clone(),
            queue: self.queue.clone(),
            outbound: self.outbound.clone(),
            cancel: cancel.clone(),
        };

        let closed = self.closed.clone();
        spawn!(async move {
            context.run(endpoint).await;
            let _ = closed.send((id, generation));
        });

        Session {
            inbox,
            cancel,
            generation,
        }
    }

    fn unsubscribe(&mut self, id: Uuid) {
        match self.sessions.remove(&id) {
            Some(session) => {
                log::debug!("Cancelling call {}...", id);
                session.cancel.cancel();
            }
            None => log::debug!("Ignoring UNSUBSCRIBE for the unknown call {}...", id),
        }
    }

    fn forget(&mut self, id: Uuid, generation: u64) {
        if self
            .sessions
            .get(&id)
            .map(|session| session.generation == generation)
            .unwrap_or(false)
        {
            let _ = self.sessions.remove(&id);
        }
    }

    fn reload_policy(&mut self) {
        let config = match &self.config {
            Some(config) => config,
            None => return,
        };

        let handle = config.current();
        let policy = CachePolicyConfig::from_yaml(handle.query("cache"))
            .and_then(|rules| CachePolicy::new(rules, self.policy.store().clone()));

        match policy {
            Ok(policy) => {
                log::info!("The cache policy has been updated.");
                self.policy = Arc::new(policy);
            }
            Err(error) => log::error!(
                "Failed to update the cache policy: {} - Keeping the previous one.",
                error
            ),
        }
    }

    fn cancel_all(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.cancel.cancel();
        }
    }
}

/// Everything a session needs to answer its envelopes.
struct SessionContext {
    id: Uuid,
    policy: Arc<CachePolicy>,
    queue: RequestQueue,
    outbound: FrameSender,
    cancel: CancellationToken,
}

impl SessionContext {
    async fn run(self, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        loop {
            let envelope = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return,
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => return,
                },
            };

            if let Err(error) = self.process(envelope).await {
                log::error!("Failed to answer call {}: {}", self.id, error);
            }

            // Envelopes which are already queued are still processed, but no new ones are
            // accepted...
            inbox.close();
        }
    }

    async fn process(&self, envelope: Envelope) -> anyhow::Result<()> {
        match envelope.envelope_type {
            EnvelopeType::Request => match envelope.payload::<RequestPayload>() {
                Ok(payload) => self.request(payload).await,
                Err(error) => {
                    log::warn!("Dropping an envelope for {}: {}", self.id, error);
                    Ok(())
                }
            },
            EnvelopeType::Invalidate => match envelope.payload::<InvalidatePayload>() {
                Ok(payload) => self.invalidate(payload).await,
                Err(error) => {
                    log::warn!("Dropping an envelope for {}: {}", self.id, error);
                    Ok(())
                }
            },
            EnvelopeType::ClearCache => {
                let result = self.unless_cancelled(self.policy.clear()).await;
                self.finish_with(result.map(|result| result.map(|_| None)))
            }
            other => Err(ProtocolError::UnexpectedEnvelope(other).into()),
        }
    }

    async fn request(&self, payload: RequestPayload) -> anyhow::Result<()> {
        let options = payload.options.unwrap_or_default().normalize();
        let key = CacheKey::new(options.method(), payload.url);

        // Writes are always passed to the cache, as this is where dependent entries are
        // invalidated...
        if options.should_use_cache() || options.method().is_write() {
            match self.unless_cancelled(self.policy.get(&key)).await {
                None => return Ok(()),
                Some(Ok(Some(value))) => {
                    log::debug!("Serving {} from the cache...", key);
                    return self.finish(Ok(Some(value)));
                }
                Some(Ok(None)) => log::debug!("No cached response for {}...", key),
                Some(Err(error)) => return self.finish(Err(error.to_string())),
            }
        }

        let value = match self
            .unless_cancelled(self.queue.queue(&key.url, options.clone()))
            .await
        {
            None => return Ok(()),
            Some(Ok(value)) => value,
            Some(Err(error)) => return self.finish(Err(error.to_string())),
        };

        if !options.should_cache_response() {
            return self.finish(Ok(Some(value)));
        }

        let result = self.unless_cancelled(self.policy.set(&key, value)).await;
        self.finish_with(result.map(|result| result.map(Some)))
    }

    async fn invalidate(&self, payload: InvalidatePayload) -> anyhow::Result<()> {
        let key = CacheKey::new(payload.method.unwrap_or_default(), payload.url);
        log::debug!("Invalidating {}...", key);

        let result = self.unless_cancelled(self.policy.delete(&key)).await;
        self.finish_with(result.map(|result| result.map(|_| None)))
    }

    /// Awaits the given future unless the session is cancelled first.
    async fn unless_cancelled<F: Future>(&self, future: F) -> Option<F::Output> {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => None,
            result = future => Some(result),
        }
    }

    fn finish_with(&self, result: Option<anyhow::Result<Option<Value>>>) -> anyhow::Result<()> {
        match result {
            None => Ok(()),
            Some(result) => self.finish(result.map_err(|error| error.to_string())),
        }
    }

    /// Emits the final value (if any) along with the terminal notification.
    fn finish(&self, result: Result<Option<Value>, String>) -> anyhow::Result<()> {
        match result {
            Ok(Some(value)) => {
                self.emit(Notification::Next { value })?;
                self.emit(Notification::Complete)
            }
            Ok(None) => self.emit(Notification::Complete),
            Err(error) => self.emit(Notification::Error { error }),
        }
    }

    fn emit(&self, notification: Notification) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        self.outbound
            .send_envelope(&Envelope::notification(self.id, &notification)?)
    }
}
