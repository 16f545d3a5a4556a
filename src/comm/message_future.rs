use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::comm::node_addr::NodeAddr;

/// Terminal delivery failure reported to the application through a [DeliveryReceipt].
#[derive(Debug, Eq, PartialEq)]
pub enum DeliveryError {
    /// The peer was confirmed gone from the cluster while the message was still
    ///  unacknowledged. There is no further retry.
    PeerLeft(NodeAddr),
    /// The recovery layer was dropped without ever completing the message.
    Abandoned,
}
impl Display for DeliveryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::PeerLeft(peer) => write!(f, "failed to send message: peer {:?} has left the cluster", peer),
            DeliveryError::Abandoned => write!(f, "message delivery was abandoned without completion"),
        }
    }
}
impl std::error::Error for DeliveryError {}

/// Handle for one outbound message, shared between the transport (which completes it) and
///  the recovery descriptor (which holds it in the in-flight queue until the peer
///  acknowledges receipt).
///
/// Completion is single-fire: whichever path reaches the future first - ack-driven
///  success on the transport side, or a node-left failure - wins, and later attempts are
///  no-ops.
pub struct MessageFuture {
    skip_recovery: bool,
    done: AtomicBool,
    completion: Mutex<Option<oneshot::Sender<Result<(), DeliveryError>>>>,
}
impl Debug for MessageFuture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageFuture{{skip_recovery:{}, done:{}}}", self.skip_recovery, self.is_done())
    }
}

impl MessageFuture {
    /// Creates the future together with the application-facing receipt half.
    ///
    /// `skip_recovery` marks service messages (the handshake itself, ack-only messages)
    ///  that are not subject to redelivery and must never occupy in-flight queue capacity.
    pub fn new(skip_recovery: bool) -> (Arc<MessageFuture>, DeliveryReceipt) {
        let (tx, rx) = oneshot::channel();

        let fut = Arc::new(MessageFuture {
            skip_recovery,
            done: AtomicBool::new(false),
            completion: Mutex::new(Some(tx)),
        });
        (fut, DeliveryReceipt { rx })
    }

    pub fn skip_recovery(&self) -> bool {
        self.skip_recovery
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Marks the message as successfully handed to the peer. Returns `false` if the
    ///  future was already completed.
    pub fn complete(&self) -> bool {
        self.fire(Ok(()))
    }

    /// Fails the message terminally. Returns `false` if the future was already completed.
    pub fn fail(&self, error: DeliveryError) -> bool {
        self.fire(Err(error))
    }

    fn fire(&self, result: Result<(), DeliveryError>) -> bool {
        let sender = self.completion.lock()
            .expect("message future lock poisoned")
            .take();

        match sender {
            Some(tx) => {
                self.done.store(true, Ordering::Release);
                // the application may have dropped its receipt - completion stands anyway
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

/// Application-facing half of a [MessageFuture]: await the delivery outcome.
pub struct DeliveryReceipt {
    rx: oneshot::Receiver<Result<(), DeliveryError>>,
}
impl DeliveryReceipt {
    pub async fn wait(self) -> Result<(), DeliveryError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Abandoned),
        }
    }
}
