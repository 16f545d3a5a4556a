use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::debug;

use crate::comm::message_future::{DeliveryError, MessageFuture};
use crate::comm::node_addr::NodeAddr;

/// Outcome callback for an inbound connection request that went through [RecoveryDescriptor::try_reserve]:
///  invoked with `true` when the request ends up owning the reservation, `false` when it
///  lost the race and the caller must abandon the inbound connection.
pub type HandshakeCallback = Box<dyn FnOnce(bool) + Send + 'static>;

struct PendingHandshake {
    id: u64,
    callback: HandshakeCallback,
}

struct DescriptorState {
    /// sent-but-unacknowledged message futures, insertion order = send order
    msg_futs: VecDeque<Arc<MessageFuture>>,
    /// number of messages acknowledged by the peer so far
    acked: u64,
    /// last received-count we reported back to the peer
    last_ack: u64,
    /// number of messages received from the peer
    rcv_cnt: u64,
    /// number of queued messages the peer already has (from the handshake) that the
    ///  transport is about to retransmit - the next `resend_cnt` calls to `add` are
    ///  replays of futures that are already queued and must not be queued twice
    resend_cnt: usize,
    /// number of outbound connection attempts made towards this peer
    connect_cnt: u64,
    /// a connection attempt (either direction) holds the exclusive right to establish
    ///  the physical connection
    reserved: bool,
    connected: bool,
    /// irreversible - set once cluster membership confirms the peer is gone
    peer_left: bool,
    /// a competing inbound connection request that arrived while the descriptor was
    ///  already reserved; at most one at a time, a newer request id supersedes an older one
    pending_handshake: Option<PendingHandshake>,
}

/// Per-peer recovery state: the bounded queue of unacknowledged outbound messages, the
///  acknowledgment counters reconciled during the handshake on every new physical
///  connection, and the reservation state machine arbitrating which of two racing
///  connection attempts (both peers may dial each other simultaneously) gets to establish
///  the single physical connection.
///
/// All state is guarded by one mutex; no external callback and no future completion
///  happens while the lock is held - completions are always invoked on a snapshot taken
///  inside the critical section and processed after it.
pub struct RecoveryDescriptor {
    peer: NodeAddr,
    queue_limit: usize,
    state: Mutex<DescriptorState>,
    /// wakes tasks blocked in [RecoveryDescriptor::reserve] when the reservation state changes
    reserve_notify: Notify,
}
impl Debug for RecoveryDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecoveryDescriptor{{peer:{:?}}}", self.peer)
    }
}

impl RecoveryDescriptor {
    pub fn new(peer: NodeAddr, queue_limit: usize) -> RecoveryDescriptor {
        assert!(queue_limit > 0);

        RecoveryDescriptor {
            peer,
            queue_limit,
            state: Mutex::new(DescriptorState {
                msg_futs: VecDeque::with_capacity(queue_limit),
                acked: 0,
                last_ack: 0,
                rcv_cnt: 0,
                resend_cnt: 0,
                connect_cnt: 0,
                reserved: false,
                connected: false,
                peer_left: false,
                pending_handshake: None,
            }),
            reserve_notify: Notify::new(),
        }
    }

    pub fn peer(&self) -> NodeAddr {
        self.peer
    }

    pub fn queue_limit(&self) -> usize {
        self.queue_limit
    }

    /// `true` if the given identity is the same incarnation this descriptor was created
    ///  for - a different incarnation at the same address is a restarted process whose
    ///  predecessor's recovery state must not be replayed to it.
    pub fn node_alive(&self, node: &NodeAddr) -> bool {
        node.addr == self.peer.addr && node.incarnation == self.peer.incarnation
    }

    /// Registers an outbound message as in-flight.
    ///
    /// Returns `false` when the in-flight queue reached its limit with this message: the
    ///  caller must tear down the session to enforce backpressure. The message itself
    ///  *is* queued either way - nothing is dropped, it is retried on the next connection.
    pub fn add(&self, fut: Arc<MessageFuture>) -> bool {
        if fut.skip_recovery() {
            return true;
        }

        let mut state = self.state();
        if state.resend_cnt == 0 {
            state.msg_futs.push_back(fut);
            state.msg_futs.len() < self.queue_limit
        }
        else {
            // a replay of an already-queued future after a handshake
            state.resend_cnt -= 1;
            true
        }
    }

    /// The peer reported how many messages it has received in total: release queue
    ///  capacity for everything up to that count. Repeated or stale counts are no-ops
    ///  beyond their already-applied prefix.
    pub fn ack_received(&self, rcv_cnt: u64) {
        let mut state = self.state();
        Self::apply_ack(&mut state, rcv_cnt);
    }

    fn apply_ack(state: &mut DescriptorState, rcv_cnt: u64) {
        debug!(acked = state.acked, rcv_cnt, in_flight = state.msg_futs.len(), "handling acknowledgment");

        while state.acked < rcv_cnt {
            let fut = state.msg_futs.pop_front()
                .expect("peer acknowledged more messages than were ever sent");

            // the transport completes a future when the message goes out on the wire,
            //  which necessarily happens before the peer can acknowledge it
            debug_assert!(fut.is_done(), "acknowledged message future was never completed by the transport");

            state.acked += 1;
        }
    }

    /// Reconciles the in-flight queue against the received-count the peer reported in
    ///  the handshake of a new physical connection: everything the peer already has is
    ///  acknowledged, everything still queued after that must be retransmitted, and the
    ///  retransmissions must not be double-queued by [RecoveryDescriptor::add].
    pub fn on_handshake(&self, rcv_cnt: u64) {
        let mut state = self.state();
        Self::apply_ack(&mut state, rcv_cnt);
        state.resend_cnt = state.msg_futs.len();
    }

    /// Snapshot of the in-flight queue, used by the session manager to retransmit after
    ///  a reconnect.
    pub fn messages_futures(&self) -> Vec<Arc<MessageFuture>> {
        self.state().msg_futs.iter().cloned().collect()
    }

    /// Increments the peer's received-messages counter for one inbound message and
    ///  returns the new count (the value acknowledgments report back to the peer).
    pub fn on_received(&self) -> u64 {
        let mut state = self.state();
        state.rcv_cnt += 1;
        state.rcv_cnt
    }

    pub fn received(&self) -> u64 {
        self.state().rcv_cnt
    }

    pub fn last_acknowledged(&self) -> u64 {
        self.state().last_ack
    }

    pub fn set_last_acknowledged(&self, last_ack: u64) {
        self.state().last_ack = last_ack;
    }

    /// Returns the previous count, which doubles as the request id carried in the
    ///  handshake of the outbound attempt - ids are strictly increasing per descriptor,
    ///  which is what makes the arbitration in [RecoveryDescriptor::try_reserve] deterministic.
    pub fn increment_connect_count(&self) -> u64 {
        let mut state = self.state();
        let current = state.connect_cnt;
        state.connect_cnt += 1;
        current
    }

    /// Acquires the exclusive right to establish the physical connection, for an
    ///  outbound attempt. Waits while another attempt is in progress and unresolved;
    ///  returns `false` if that attempt won (a connection now exists and this attempt
    ///  must be abandoned).
    ///
    /// Cancel-safe: dropping the returned future while waiting leaves the descriptor
    ///  untouched, the reservation is only taken in the same critical section that
    ///  returns `true`.
    pub async fn reserve(&self) -> bool {
        loop {
            let notified = self.reserve_notify.notified();
            tokio::pin!(notified);
            // register for wakeup before inspecting state, so a notification between the
            //  check and the await is not lost
            notified.as_mut().enable();

            {
                let mut state = self.state();

                if state.connected {
                    return false;
                }
                if !state.reserved {
                    state.reserved = true;
                    return true;
                }
            }

            notified.await;
        }
    }

    /// Non-blocking reservation for an inbound connection request carrying request id
    ///  `id`. Returns `true` if the request owns the reservation now. Otherwise the
    ///  request either lost outright (callback already invoked with `false`) or was
    ///  recorded as the pending handshake, to be resolved with `false` by
    ///  [RecoveryDescriptor::connected] or with `true` by [RecoveryDescriptor::release].
    ///
    /// When two inbound requests compete for the pending slot, the higher id wins and
    ///  the lower id is rejected. Two requests with the same id are a caller contract
    ///  violation.
    pub fn try_reserve(&self, id: u64, callback: HandshakeCallback) -> bool {
        let mut rejected = None;
        let won;

        {
            let mut state = self.state();

            if state.connected {
                rejected = Some(callback);
                won = false;
            }
            else if state.reserved {
                match state.pending_handshake.take() {
                    Some(pending) => {
                        debug_assert!(pending.id != id, "two competing handshake requests with the same id {}", id);

                        if id > pending.id {
                            debug!(peer = ?self.peer, superseded = pending.id, id, "handshake request superseded by one with a higher id");
                            rejected = Some(pending.callback);
                            state.pending_handshake = Some(PendingHandshake { id, callback });
                        }
                        else {
                            debug!(peer = ?self.peer, pending = pending.id, id, "handshake request rejected, a higher id is already pending");
                            rejected = Some(callback);
                            state.pending_handshake = Some(pending);
                        }
                    }
                    None => {
                        state.pending_handshake = Some(PendingHandshake { id, callback });
                    }
                }
                won = false;
            }
            else {
                state.reserved = true;
                won = true;
            }
        }

        if let Some(callback) = rejected {
            callback(false);
        }
        won
    }

    /// The winning connection completed its handshake. Any pending competing handshake
    ///  lost the race and is notified accordingly.
    ///
    /// Calling this without holding the reservation is a bug in the session manager.
    pub fn connected(&self) {
        let lost;

        {
            let mut state = self.state();

            assert!(state.reserved, "connected() without holding the reservation");
            assert!(!state.connected, "connected() on an already connected descriptor");

            state.connected = true;
            lost = state.pending_handshake.take();
        }

        if let Some(pending) = lost {
            (pending.callback)(false);
        }
        self.reserve_notify.notify_waiters();
    }

    /// The active connection (or failed attempt) is torn down. A pending competing
    ///  handshake inherits the reservation and is granted with `true`; otherwise the
    ///  reservation is cleared and blocked [RecoveryDescriptor::reserve] callers race again. If the
    ///  peer left while the connection was up, the deferred drain happens here.
    pub fn release(&self) {
        let granted;
        let drained;

        {
            let mut state = self.state();

            state.connected = false;

            granted = state.pending_handshake.take();
            if granted.is_none() {
                state.reserved = false;
            }

            drained = Self::drain_on_peer_left(&mut state);
        }

        match granted {
            Some(pending) => {
                debug!(peer = ?self.peer, id = pending.id, "handing the reservation over to the pending handshake request");
                (pending.callback)(true);
            }
            None => self.reserve_notify.notify_waiters(),
        }

        if let Some(futs) = drained {
            self.fail_on_peer_left(futs);
        }
    }

    /// Cluster membership confirmed the peer is gone: fail all in-flight messages,
    ///  exactly once each. If a connection attempt is in flight, draining is deferred to
    ///  its [RecoveryDescriptor::release] so the two paths never see the same future.
    pub fn on_node_left(&self) {
        let drained;

        {
            let mut state = self.state();
            state.peer_left = true;

            drained = if state.reserved {
                None
            }
            else {
                Self::drain_on_peer_left(&mut state)
            };
        }

        if let Some(futs) = drained {
            self.fail_on_peer_left(futs);
        }
    }

    fn drain_on_peer_left(state: &mut DescriptorState) -> Option<Vec<Arc<MessageFuture>>> {
        if state.peer_left && !state.msg_futs.is_empty() {
            Some(state.msg_futs.drain(..).collect())
        }
        else {
            None
        }
    }

    fn fail_on_peer_left(&self, futs: Vec<Arc<MessageFuture>>) {
        debug!(peer = ?self.peer, count = futs.len(), "failing in-flight messages: peer left the cluster");

        for fut in futs {
            fut.fail(DeliveryError::PeerLeft(self.peer));
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.state().reserved
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn state(&self) -> MutexGuard<DescriptorState> {
        self.state.lock()
            .expect("recovery descriptor lock poisoned")
    }
}
