use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::comm::node_addr::NodeAddr;
use crate::comm::recovery::RecoveryDescriptor;

/// Maps peer identity to its [RecoveryDescriptor]. Descriptors are created lazily the
///  first time the transport needs to talk to a peer and live until cluster membership
///  confirms the peer is gone.
///
/// Keyed by socket address: at most one incarnation of a peer is tracked per address,
///  and a lookup with a different incarnation means the process at that address was
///  restarted - its predecessor's descriptor is failed and replaced.
pub struct RecoveryRegistry {
    queue_limit: usize,
    descriptors: Mutex<FxHashMap<SocketAddr, Arc<RecoveryDescriptor>>>,
}

impl RecoveryRegistry {
    pub fn new(queue_limit: usize) -> RecoveryRegistry {
        assert!(queue_limit > 0);

        RecoveryRegistry {
            queue_limit,
            descriptors: Mutex::new(FxHashMap::default()),
        }
    }

    /// Returns the descriptor for a peer, creating it if necessary.
    pub fn descriptor(&self, peer: NodeAddr) -> Arc<RecoveryDescriptor> {
        let mut stale = None;

        let result = {
            let mut lock = self.lock();

            match lock.get(&peer.addr).cloned() {
                Some(existing) if existing.node_alive(&peer) => existing,
                existing => {
                    stale = existing;
                    let fresh = Arc::new(RecoveryDescriptor::new(peer, self.queue_limit));
                    lock.insert(peer.addr, fresh.clone());
                    fresh
                }
            }
        };

        if let Some(stale) = stale {
            info!(previous = ?stale.peer(), current = ?peer, "peer restarted - failing in-flight messages of the previous incarnation");
            stale.on_node_left();
        }

        result
    }

    /// Cluster membership confirmed the peer is gone: drop its descriptor and fail all
    ///  of its in-flight messages. A no-op for unknown peers and for stale incarnations
    ///  that were already replaced.
    pub fn on_node_left(&self, peer: NodeAddr) {
        let removed = {
            let mut lock = self.lock();

            match lock.get(&peer.addr) {
                Some(existing) if existing.node_alive(&peer) => lock.remove(&peer.addr),
                _ => None,
            }
        };

        if let Some(desc) = removed {
            debug!(?peer, "removed recovery descriptor of departed peer");
            desc.on_node_left();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<FxHashMap<SocketAddr, Arc<RecoveryDescriptor>>> {
        self.descriptors.lock()
            .expect("recovery registry lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use crate::comm::message_future::{DeliveryError, MessageFuture};
    use crate::test_util::node::test_node_addr_from_number;

    use super::*;

    #[test]
    fn test_descriptor_lazy_and_stable() {
        let registry = RecoveryRegistry::new(8);

        let d1 = registry.descriptor(test_node_addr_from_number(1));
        let d2 = registry.descriptor(test_node_addr_from_number(1));
        assert!(Arc::ptr_eq(&d1, &d2));

        let other = registry.descriptor(test_node_addr_from_number(2));
        assert!(!Arc::ptr_eq(&d1, &other));
        assert_eq!(other.queue_limit(), 8);
    }

    #[tokio::test]
    async fn test_restarted_incarnation_replaces_descriptor() {
        let registry = RecoveryRegistry::new(8);

        let peer = test_node_addr_from_number(1);
        let d1 = registry.descriptor(peer);

        let (fut, receipt) = MessageFuture::new(false);
        d1.add(fut);

        let mut restarted = peer;
        restarted.incarnation += 1;
        let d2 = registry.descriptor(restarted);

        assert!(!Arc::ptr_eq(&d1, &d2));
        assert_eq!(d2.peer(), restarted);

        // messages in flight towards the previous incarnation are terminally failed,
        //  never replayed to the restarted process
        assert_eq!(receipt.wait().await, Err(DeliveryError::PeerLeft(peer)));
    }

    #[tokio::test]
    async fn test_node_left_removes_and_drains() {
        let registry = RecoveryRegistry::new(8);

        let peer = test_node_addr_from_number(1);
        let d1 = registry.descriptor(peer);

        let (fut, receipt) = MessageFuture::new(false);
        d1.add(fut);

        registry.on_node_left(peer);
        assert_eq!(receipt.wait().await, Err(DeliveryError::PeerLeft(peer)));

        // a later lookup starts from scratch
        let d2 = registry.descriptor(peer);
        assert!(!Arc::ptr_eq(&d1, &d2));
    }

    #[test]
    fn test_node_left_ignores_stale_incarnation() {
        let registry = RecoveryRegistry::new(8);

        let old = test_node_addr_from_number(1);
        let mut current = old;
        current.incarnation += 1;

        registry.descriptor(old);
        let d_current = registry.descriptor(current);

        // a departure event for the already-replaced incarnation must not touch the
        //  current descriptor
        registry.on_node_left(old);
        assert!(Arc::ptr_eq(&d_current, &registry.descriptor(current)));

        // unknown peers are a no-op as well
        registry.on_node_left(test_node_addr_from_number(7));
    }
}
