//! Provides the caller side of the protocol.
//!
//! An [Interface](Interface) is a cheap handle to a dispatch actor. The actor owns the sending
//! half of the channel as well as a routing table which maps the id of each pending call to the
//! stream waiting for its notifications. Therefore a caller never touches the channel itself.
//!
//! Each request is represented as a [ResponseStream](ResponseStream). Nothing is sent until the
//! stream is polled for the first time. Dropping a stream before it completed abandons the call.
//! If the call is cancelable, the worker is notified via an **UNSUBSCRIBE** so that it can stop
//! all work related to it.
//!
//! # Examples
//!
//! ```no_run
//! # use courier::protocol::interface::Interface;
//! # use courier::request::{Method, RequestOptions};
//! # use serde_json::json;
//! # async fn example(interface: Interface) -> anyhow::Result<()> {
//! // Fetch (or serve from cache) a list of fish...
//! let fish = interface.add_request("https://example.com/fish", None).response().await?;
//!
//! // ..add a new one, which also invalidates the cached list..
//! let _ = interface
//!     .add_request(
//!         "https://example.com/fish",
//!         Some(RequestOptions::with_method(Method::Post).body(json!({ "name": "Wanda" }))),
//!     )
//!     .response()
//!     .await?;
//!
//! // ..or simply wipe the whole cache.
//! interface.clear().await?;
//! # Ok(())
//! # }
//! ```
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::channel::{FrameSender, Port};
use crate::protocol::{
    Envelope, EnvelopeType, InvalidatePayload, Notification, ProtocolError, RequestPayload,
};
use crate::request::{Method, RequestOptions};
use crate::spawn;

/// Describes why a call didn't deliver its values.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestError {
    /// The worker reported an error. This contains the message of the original error.
    Remote(String),

    /// The channel to the worker has been closed.
    Disconnected,

    /// The call couldn't be encoded.
    Protocol(ProtocolError),
}

impl Display for RequestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::Remote(message) => write!(f, "{}", message),
            RequestError::Disconnected => write!(f, "The worker is no longer reachable."),
            RequestError::Protocol(error) => write!(f, "{}", error),
        }
    }
}

impl std::error::Error for RequestError {}

enum Command {
    Open {
        id: Uuid,
        frame: String,
        events: mpsc::UnboundedSender<Notification>,
    },
    Close {
        id: Uuid,
        unsubscribe: bool,
    },
}

/// Provides the public API to send calls to a worker.
///
/// This is a handle which can be cloned and shared freely. The dispatch actor is stopped once
/// all handles and streams have been dropped.
#[derive(Clone)]
pub struct Interface {
    commands: mpsc::UnboundedSender<Command>,
}

impl Interface {
    /// Creates a new interface which talks to the worker on the other end of the given port.
    ///
    /// Note that this spawns the dispatch actor and therefore has to be called within a tokio
    /// runtime.
    pub fn new(port: Port) -> Self {
        let (commands, endpoint) = mpsc::unbounded_channel();
        let (outbound, inbound) = port.split();

        spawn!(dispatch_loop(endpoint, outbound, inbound));

        Interface { commands }
    }

    /// Creates a call which fetches the given URL.
    ///
    /// The returned stream yields the response (either from the cache or from the network) and
    /// ends once the worker completed the call. Note that the request is only sent once the
    /// stream is polled.
    ///
    /// Unless specified otherwise in the options, a GET request isn't cancelable, all other
    /// methods are.
    pub fn add_request(
        &self,
        url: impl Into<String>,
        options: Option<RequestOptions>,
    ) -> ResponseStream {
        let cancelable = options
            .as_ref()
            .map(RequestOptions::is_cancelable)
            .unwrap_or(false);
        let payload = RequestPayload {
            url: url.into(),
            options,
        };

        self.call(EnvelopeType::Request, Some(&payload), cancelable)
    }

    /// Wipes the cache of the worker.
    pub async fn clear(&self) -> Result<(), RequestError> {
        self.call::<()>(EnvelopeType::ClearCache, None, false)
            .response()
            .await
            .map(|_| ())
    }

    /// Removes the cached response for the given URL and method (**GET** if absent).
    pub async fn invalidate(
        &self,
        url: impl Into<String>,
        method: Option<Method>,
    ) -> Result<(), RequestError> {
        let payload = InvalidatePayload {
            url: url.into(),
            method,
        };

        self.call(EnvelopeType::Invalidate, Some(&payload), false)
            .response()
            .await
            .map(|_| ())
    }

    fn call<P: serde::Serialize>(
        &self,
        envelope_type: EnvelopeType,
        payload: Option<&P>,
        cancelable: bool,
    ) -> ResponseStream {
        let id = Uuid::new_v4();
        let envelope = match payload {
            Some(payload) => Envelope::with_payload(id, envelope_type, payload),
            None => Ok(Envelope::new(id, envelope_type)),
        };

        ResponseStream {
            id,
            cancelable,
            commands: self.commands.clone(),
            state: match envelope.and_then(|envelope| envelope.encode()) {
                Ok(frame) => State::Idle(frame),
                Err(error) => State::Failed(error),
            },
        }
    }
}

enum State {
    Idle(String),
    Failed(ProtocolError),
    Awaiting(mpsc::UnboundedReceiver<Notification>),
    Done,
}

/// Represents a single call to the worker.
///
/// This is a [Stream](futures::Stream) of all values delivered by the worker. It ends once the
/// worker completed the call, or yields a single error if the call failed.
pub struct ResponseStream {
    id: Uuid,
    cancelable: bool,
    commands: mpsc::UnboundedSender<Command>,
    state: State,
}

impl ResponseStream {
    /// Returns the correlation id of this call.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Determines if dropping this stream cancels the call in the worker.
    pub fn is_cancelable(&self) -> bool {
        self.cancelable
    }

    /// Drives the call to its end and returns the last value (if any).
    pub async fn response(mut self) -> Result<Option<Value>, RequestError> {
        let mut last = None;
        while let Some(value) = self.next().await {
            last = Some(value?);
        }

        Ok(last)
    }

    fn open(&mut self, frame: String) -> Result<(), RequestError> {
        let (events, receiver) = mpsc::unbounded_channel();
        self.commands
            .send(Command::Open {
                id: self.id,
                frame,
                events,
            })
            .map_err(|_| RequestError::Disconnected)?;
        self.state = State::Awaiting(receiver);

        Ok(())
    }
}

impl Stream for ResponseStream {
    type Item = Result<Value, RequestError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match std::mem::replace(&mut this.state, State::Done) {
            State::Idle(frame) => {
                if let Err(error) = this.open(frame) {
                    return Poll::Ready(Some(Err(error)));
                }
            }
            State::Failed(error) => return Poll::Ready(Some(Err(RequestError::Protocol(error)))),
            state => this.state = state,
        }

        let events = match &mut this.state {
            State::Awaiting(events) => events,
            _ => return Poll::Ready(None),
        };

        let result = match ready!(events.poll_recv(cx)) {
            Some(Notification::Next { value }) => return Poll::Ready(Some(Ok(value))),
            Some(Notification::Error { error }) => Some(Err(RequestError::Remote(error))),
            Some(Notification::Complete) => None,
            None => Some(Err(RequestError::Disconnected)),
        };

        this.state = State::Done;
        Poll::Ready(result)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if let State::Awaiting(_) = self.state {
            let _ = self.commands.send(Command::Close {
                id: self.id,
                unsubscribe: self.cancelable,
            });
        }
    }
}

async fn dispatch_loop(
    mut endpoint: mpsc::UnboundedReceiver<Command>,
    outbound: FrameSender,
    mut inbound: mpsc::UnboundedReceiver<String>,
) {
    let mut pending: HashMap<Uuid, mpsc::UnboundedSender<Notification>> = HashMap::new();
    let mut connected = true;

    loop {
        tokio::select! {
            // Commands go first so that a call is always registered before its response
            // is processed...
            biased;

            command = endpoint.recv() => match command {
                Some(Command::Open { id, frame, events }) => {
                    if !connected {
                        continue;
                    }
                    match outbound.send(frame) {
                        Ok(_) => {
                            let _ = pending.insert(id, events);
                        }
                        Err(error) => log::error!("Cannot send call {}: {}", id, error),
                    }
                }
                Some(Command::Close { id, unsubscribe }) => {
                    if pending.remove(&id).is_some() && unsubscribe {
                        log::debug!("Unsubscribing from call {}...", id);
                        let envelope = Envelope::new(id, EnvelopeType::Unsubscribe);
                        if let Err(error) = outbound.send_envelope(&envelope) {
                            log::error!("Cannot unsubscribe from call {}: {}", id, error);
                        }
                    }
                }
                None => return,
            },
            frame = inbound.recv(), if connected => match frame {
                Some(frame) => route_notification(&mut pending, &frame),
                None => {
                    log::info!(
                        "The worker closed the channel. Failing {} pending call(s)...",
                        pending.len()
                    );
                    connected = false;
                    pending.clear();
                }
            },
        }
    }
}

fn route_notification(pending: &mut HashMap<Uuid, mpsc::UnboundedSender<Notification>>, frame: &str) {
    let (id, notification) = match parse_notification(frame) {
        Ok(result) => result,
        Err(error) => {
            log::warn!("Dropping a frame received from the worker: {}", error);
            return;
        }
    };

    let terminal = notification.is_terminal();
    match pending.get(&id) {
        Some(events) => {
            let _ = events.send(notification);
        }
        None => {
            log::debug!("Ignoring a notification for the abandoned call {}...", id);
            return;
        }
    }

    if terminal {
        let _ = pending.remove(&id);
    }
}

fn parse_notification(frame: &str) -> Result<(Uuid, Notification), ProtocolError> {
    let envelope = Envelope::decode(frame)?;
    if envelope.envelope_type != EnvelopeType::ResponseNotification {
        return Err(ProtocolError::UnexpectedEnvelope(envelope.envelope_type));
    }

    Ok((envelope.id, envelope.payload()?))
}

#[cfg(test)]
mod tests {
    use crate::protocol::channel::{duplex, FrameSender};
    use crate::protocol::interface::{Interface, RequestError};
    use crate::protocol::{
        Envelope, EnvelopeType, InvalidatePayload, Notification, RequestPayload,
    };
    use crate::request::{Method, RequestOptions};
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    async fn next_envelope(inbound: &mut UnboundedReceiver<String>) -> Envelope {
        Envelope::decode(&inbound.recv().await.unwrap()).unwrap()
    }

    fn notify(worker: &FrameSender, id: Uuid, notification: Notification) {
        worker
            .send_envelope(&Envelope::notification(id, &notification).unwrap())
            .unwrap();
    }

    #[test]
    fn requests_are_sent_lazily_and_deliver_their_values() {
        crate::testing::test_async(async {
            let (caller, worker) = duplex();
            let interface = Interface::new(caller);
            let (worker_sender, mut worker_inbound) = worker.split();

            let mut stream = interface.add_request("/fish", None);
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(worker_inbound.try_recv().is_err(), true);

            let id = stream.id();
            let responder = async {
                let envelope = next_envelope(&mut worker_inbound).await;
                assert_eq!(envelope.id, id);
                assert_eq!(envelope.envelope_type, EnvelopeType::Request);
                assert_eq!(
                    envelope.payload::<RequestPayload>().unwrap(),
                    RequestPayload {
                        url: "/fish".to_owned(),
                        options: None
                    }
                );

                // Notifications for unknown calls are ignored...
                notify(&worker_sender, Uuid::new_v4(), Notification::Complete);
                notify(&worker_sender, envelope.id, Notification::Next { value: json!("Wanda") });
                notify(&worker_sender, envelope.id, Notification::Complete);
            };
            let (_, first) = tokio::join!(responder, stream.next());
            assert_eq!(first, Some(Ok(json!("Wanda"))));
            assert_eq!(stream.next().await, None);
            assert_eq!(stream.next().await, None);

            // Completed calls never unsubscribe...
            std::mem::drop(stream);
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(worker_inbound.try_recv().is_err(), true);
            assert_eq!(id.get_version_num(), 4);
        });
    }

    #[test]
    fn errors_are_delivered_as_is() {
        crate::testing::test_async(async {
            let (caller, worker) = duplex();
            let interface = Interface::new(caller);
            let (worker_sender, mut worker_inbound) = worker.split();

            let stream = interface.add_request("/broken", None);
            let responder = async {
                let envelope = next_envelope(&mut worker_inbound).await;
                notify(
                    &worker_sender,
                    envelope.id,
                    Notification::Error {
                        error: "The fish tank is broken".to_owned(),
                    },
                );
            };

            let (_, result) = tokio::join!(responder, stream.response());
            assert_eq!(
                result,
                Err(RequestError::Remote("The fish tank is broken".to_owned()))
            );
        });
    }

    #[test]
    fn only_cancelable_calls_unsubscribe() {
        crate::testing::test_async(async {
            let (caller, worker) = duplex();
            let interface = Interface::new(caller);
            let (_worker_sender, mut worker_inbound) = worker.split();

            // A GET isn't cancelable by default...
            let mut get = interface.add_request("/fish", None);
            let _ = tokio::time::timeout(Duration::from_millis(10), get.next()).await;
            let request = next_envelope(&mut worker_inbound).await;
            assert_eq!(request.id, get.id());
            std::mem::drop(get);
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(worker_inbound.try_recv().is_err(), true);

            // ..but a POST is.
            let mut post =
                interface.add_request("/fish", Some(RequestOptions::with_method(Method::Post)));
            let _ = tokio::time::timeout(Duration::from_millis(10), post.next()).await;
            let request = next_envelope(&mut worker_inbound).await;
            std::mem::drop(post);
            let unsubscribe = next_envelope(&mut worker_inbound).await;
            assert_eq!(unsubscribe.id, request.id);
            assert_eq!(unsubscribe.envelope_type, EnvelopeType::Unsubscribe);
            assert_eq!(unsubscribe.payload, None);

            // Explicit options win...
            let mut get = interface.add_request("/fish", Some(RequestOptions::default().cancelable(true)));
            let _ = tokio::time::timeout(Duration::from_millis(10), get.next()).await;
            let _ = next_envelope(&mut worker_inbound).await;
            std::mem::drop(get);
            assert_eq!(
                next_envelope(&mut worker_inbound).await.envelope_type,
                EnvelopeType::Unsubscribe
            );

            // A never polled stream sends nothing at all...
            std::mem::drop(interface.add_request("/fish", Some(RequestOptions::with_method(Method::Put))));
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(worker_inbound.try_recv().is_err(), true);
        });
    }

    #[test]
    fn clear_and_invalidate_resolve_on_completion() {
        crate::testing::test_async(async {
            let (caller, worker) = duplex();
            let interface = Interface::new(caller);
            let (worker_sender, mut worker_inbound) = worker.split();

            let responder = async {
                let clear = next_envelope(&mut worker_inbound).await;
                assert_eq!(clear.envelope_type, EnvelopeType::ClearCache);
                assert_eq!(clear.payload, None);
                notify(&worker_sender, clear.id, Notification::Complete);
            };
            let (_, result) = tokio::join!(responder, interface.clear());
            assert_eq!(result, Ok(()));

            let responder = async {
                let invalidate = next_envelope(&mut worker_inbound).await;
                assert_eq!(invalidate.envelope_type, EnvelopeType::Invalidate);
                assert_eq!(
                    invalidate.payload::<InvalidatePayload>().unwrap(),
                    InvalidatePayload {
                        url: "/fish".to_owned(),
                        method: Some(Method::Put)
                    }
                );
                notify(&worker_sender, invalidate.id, Notification::Complete);
            };
            let (_, result) = tokio::join!(responder, interface.invalidate("/fish", Some(Method::Put)));
            assert_eq!(result, Ok(()));
        });
    }

    #[test]
    fn pending_calls_fail_once_the_worker_is_gone() {
        crate::testing::test_async(async {
            let (caller, worker) = duplex();
            let interface = Interface::new(caller);
            let (worker_sender, mut worker_inbound) = worker.split();

            let stream = interface.add_request("/fish", None);
            let responder = async {
                let _ = next_envelope(&mut worker_inbound).await;
                std::mem::drop(worker_sender);
            };

            let (_, result) = tokio::join!(responder, stream.response());
            assert_eq!(result, Err(RequestError::Disconnected));

            // New calls fail right away...
            assert_eq!(
                interface.add_request("/fish", None).response().await,
                Err(RequestError::Disconnected)
            );
        });
    }
}
