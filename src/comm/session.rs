use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::{debug, warn};

use crate::comm::message_future::MessageFuture;
use crate::comm::node_addr::NodeAddr;
use crate::comm::recovery::{HandshakeCallback, RecoveryDescriptor};

/// The narrow interface the recovery layer consumes from the physical transport. The
///  transport owns the sockets and the wire format; the recovery layer only tells it
///  *what* to do at protocol junctures.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionControl: Send + Sync + 'static {
    /// tear down the physical session, e.g. to enforce backpressure on queue overflow
    async fn close_session(&self, peer: NodeAddr);

    /// retransmit a still-unacknowledged message over the freshly established connection
    async fn resend(&self, peer: NodeAddr, fut: Arc<MessageFuture>);

    /// report to the peer how many of its messages have arrived so far
    async fn send_ack(&self, peer: NodeAddr, rcv_cnt: u64);
}

/// Drives one peer's [RecoveryDescriptor] through the protocol junctures in the order
///  the transport observes them: outbound dial or inbound accept, handshake, message
///  and acknowledgment traffic, disconnect.
pub struct PeerSession {
    descriptor: Arc<RecoveryDescriptor>,
    control: Arc<dyn SessionControl>,
    /// an acknowledgment is sent to the peer after this many unacknowledged inbound messages
    ack_threshold: u64,
}

impl PeerSession {
    pub fn new(descriptor: Arc<RecoveryDescriptor>, control: Arc<dyn SessionControl>, ack_threshold: u64) -> PeerSession {
        assert!(ack_threshold > 0);

        PeerSession {
            descriptor,
            control,
            ack_threshold,
        }
    }

    pub fn descriptor(&self) -> &Arc<RecoveryDescriptor> {
        &self.descriptor
    }

    /// Registers an outbound message as in-flight. When this overflows the in-flight
    ///  queue, the session is closed: the peer is not reading acknowledgments fast
    ///  enough, and closing is the backpressure mechanism - queued messages are
    ///  retransmitted on the next connection, nothing is dropped.
    pub async fn on_message(&self, fut: Arc<MessageFuture>) -> bool {
        if self.descriptor.add(fut) {
            return true;
        }

        warn!(peer = ?self.descriptor.peer(), limit = self.descriptor.queue_limit(), "in-flight queue limit reached - closing session for backpressure");
        self.control.close_session(self.descriptor.peer()).await;
        false
    }

    /// An outbound connection attempt starts: acquire the reservation, waiting out any
    ///  unresolved competing attempt. Returns the request id to carry in the handshake,
    ///  or `None` when a competing connection won and this attempt must be abandoned.
    pub async fn on_outbound_connect(&self) -> Option<u64> {
        let handshake_id = self.descriptor.increment_connect_count();

        if self.descriptor.reserve().await {
            Some(handshake_id)
        }
        else {
            debug!(peer = ?self.descriptor.peer(), "a competing connection was established - abandoning outbound attempt");
            None
        }
    }

    /// An inbound connection request arrived carrying the remote's request id. Returns
    ///  `true` if it owns the reservation immediately; otherwise the callback reports
    ///  the arbitration outcome later.
    pub fn on_inbound_connect(&self, handshake_id: u64, callback: HandshakeCallback) -> bool {
        self.descriptor.try_reserve(handshake_id, callback)
    }

    /// The handshake on a new physical connection completed, with the peer reporting
    ///  how many messages it has received in total. Reconciles the in-flight queue,
    ///  marks the connection established, and retransmits everything the peer is still
    ///  missing. The caller must hold the reservation.
    pub async fn on_handshake(&self, rcv_cnt: u64) {
        self.descriptor.on_handshake(rcv_cnt);
        self.descriptor.connected();

        for fut in self.descriptor.messages_futures() {
            self.control.resend(self.descriptor.peer(), fut.clone()).await;
            self.descriptor.add(fut);
        }
    }

    /// One application message arrived from the peer. Emits an acknowledgment once
    ///  enough messages accumulated since the last one.
    pub async fn on_message_received(&self) {
        let rcv_cnt = self.descriptor.on_received();

        if rcv_cnt - self.descriptor.last_acknowledged() >= self.ack_threshold {
            self.control.send_ack(self.descriptor.peer(), rcv_cnt).await;
            self.descriptor.set_last_acknowledged(rcv_cnt);
        }
    }

    /// The peer acknowledged its received-count (piggybacked or dedicated).
    pub fn on_ack(&self, rcv_cnt: u64) {
        self.descriptor.ack_received(rcv_cnt);
    }

    /// The physical connection went away - regularly or not. Queued messages stay put
    ///  for the next connection.
    pub fn on_disconnect(&self) {
        self.descriptor.release();
    }
}

#[cfg(test)]
mod tests {
    use mockall::predicate::{always, eq};

    use crate::comm::message_future::DeliveryReceipt;
    use crate::test_util::node::test_node_addr_from_number;

    use super::*;

    fn message() -> (Arc<MessageFuture>, DeliveryReceipt) {
        MessageFuture::new(false)
    }

    fn session(queue_limit: usize, ack_threshold: u64, control: MockSessionControl) -> PeerSession {
        let descriptor = Arc::new(RecoveryDescriptor::new(test_node_addr_from_number(1), queue_limit));
        PeerSession::new(descriptor, Arc::new(control), ack_threshold)
    }

    #[tokio::test]
    async fn test_queue_overflow_closes_session() {
        let peer = test_node_addr_from_number(1);

        let mut control = MockSessionControl::new();
        control.expect_close_session()
            .with(eq(peer))
            .times(1)
            .returning(|_| ());

        let session = session(2, 8, control);

        let (f1, _r1) = message();
        assert!(session.on_message(f1).await);

        let (f2, _r2) = message();
        assert!(!session.on_message(f2).await);

        // the overflowing message is still queued for the next connection
        assert_eq!(session.descriptor().messages_futures().len(), 2);
    }

    #[tokio::test]
    async fn test_handshake_resends_unacknowledged() {
        let peer = test_node_addr_from_number(1);

        let mut control = MockSessionControl::new();
        control.expect_resend()
            .with(eq(peer), always())
            .times(2)
            .returning(|_, _| ());

        let session = session(8, 8, control);

        let (f1, _r1) = message();
        f1.complete();
        session.on_message(f1).await;
        let (f2, _r2) = message();
        session.on_message(f2).await;
        let (f3, _r3) = message();
        session.on_message(f3).await;

        assert_eq!(session.on_outbound_connect().await, Some(0));
        // the peer already has the first message - the other two go out again
        session.on_handshake(1).await;

        assert!(session.descriptor().is_connected());
        assert_eq!(session.descriptor().messages_futures().len(), 2);
    }

    #[tokio::test]
    async fn test_ack_threshold() {
        let peer = test_node_addr_from_number(1);

        let mut control = MockSessionControl::new();
        control.expect_send_ack()
            .with(eq(peer), eq(3))
            .times(1)
            .returning(|_, _| ());
        control.expect_send_ack()
            .with(eq(peer), eq(6))
            .times(1)
            .returning(|_, _| ());

        let session = session(8, 3, control);

        for _ in 0..6 {
            session.on_message_received().await;
        }

        assert_eq!(session.descriptor().received(), 6);
        assert_eq!(session.descriptor().last_acknowledged(), 6);
    }

    #[tokio::test]
    async fn test_outbound_connect_ids_increase() {
        let session = session(8, 8, MockSessionControl::new());

        assert_eq!(session.on_outbound_connect().await, Some(0));
        // the dial failed - release and try again with the next id
        session.on_disconnect();
        assert_eq!(session.on_outbound_connect().await, Some(1));
    }

    #[tokio::test]
    async fn test_inbound_connect_and_ack_roundtrip() {
        let session = session(8, 8, MockSessionControl::new());

        assert!(session.on_inbound_connect(0, Box::new(|_| {})));
        session.on_handshake(0).await;

        let (f1, _r1) = message();
        f1.complete();
        session.on_message(f1).await;

        session.on_ack(1);
        assert!(session.descriptor().messages_futures().is_empty());

        session.on_disconnect();
        assert!(!session.descriptor().is_connected());
        assert!(!session.descriptor().is_reserved());
    }
}
