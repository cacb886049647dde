//! Provides the duplex channel which connects the caller and the worker.
//!
//! A channel consists of two [Ports](Port). Whatever is sent on one port is received by the
//! other one, in the order in which it was sent. Frames are plain JSON strings, so that both
//! sides never share any memory.
//!
//! # Examples
//!
//! ```
//! # use courier::protocol::channel::duplex;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (caller, worker) = duplex();
//! let (outbound, _) = caller.split();
//! let (_, mut inbound) = worker.split();
//!
//! outbound.send("{}".to_owned()).unwrap();
//! assert_eq!(inbound.recv().await, Some("{}".to_owned()));
//! # }
//! ```
use tokio::sync::mpsc;

use crate::protocol::Envelope;

/// Represents one end of a channel.
pub struct Port {
    sender: FrameSender,
    receiver: mpsc::UnboundedReceiver<String>,
}

/// Sends frames to the opposite port. This can be cloned freely.
#[derive(Clone)]
pub struct FrameSender {
    sender: mpsc::UnboundedSender<String>,
}

/// Creates a new channel and returns its two ports.
pub fn duplex() -> (Port, Port) {
    let (left_sender, left_receiver) = mpsc::unbounded_channel();
    let (right_sender, right_receiver) = mpsc::unbounded_channel();

    (
        Port {
            sender: FrameSender {
                sender: right_sender,
            },
            receiver: left_receiver,
        },
        Port {
            sender: FrameSender {
                sender: left_sender,
            },
            receiver: right_receiver,
        },
    )
}

impl Port {
    /// Splits the port into its sending and receiving half.
    pub fn split(self) -> (FrameSender, mpsc::UnboundedReceiver<String>) {
        (self.sender, self.receiver)
    }
}

impl FrameSender {
    /// Sends a frame to the opposite port.
    ///
    /// # Errors
    /// Fails if the opposite port has been dropped.
    pub fn send(&self, frame: String) -> anyhow::Result<()> {
        self.sender
            .send(frame)
            .map_err(|_| anyhow::anyhow!("The channel has been closed by the opposite side."))
    }

    /// Encodes and sends the given envelope.
    pub fn send_envelope(&self, envelope: &Envelope) -> anyhow::Result<()> {
        self.send(envelope.encode()?)
    }

    /// Determines if the opposite port has been dropped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::channel::duplex;
    use crate::protocol::{Envelope, EnvelopeType};
    use uuid::Uuid;

    #[test]
    fn frames_travel_in_both_directions_in_order() {
        crate::testing::test_async(async {
            let (caller, worker) = duplex();
            let (caller_sender, mut caller_receiver) = caller.split();
            let (worker_sender, mut worker_receiver) = worker.split();

            for i in 0..3 {
                caller_sender.send(format!("request {}", i)).unwrap();
            }
            worker_sender.send("response".to_owned()).unwrap();

            for i in 0..3 {
                assert_eq!(worker_receiver.recv().await, Some(format!("request {}", i)));
            }
            assert_eq!(caller_receiver.recv().await, Some("response".to_owned()));
        });
    }

    #[test]
    fn sending_fails_once_the_other_side_is_gone() {
        let (caller, worker) = duplex();
        let (sender, _receiver) = caller.split();
        std::mem::drop(worker);

        assert_eq!(sender.is_closed(), true);
        assert_eq!(
            sender
                .send_envelope(&Envelope::new(Uuid::new_v4(), EnvelopeType::ClearCache))
                .is_err(),
            true
        );
    }
}
