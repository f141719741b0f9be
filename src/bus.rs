// LNP Node Core Library implementing Lightning network channels
// and HTLC switching.
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! One-shot peer connectivity event bus.
//!
//! Components which need to act "when the peer is next online" (the
//! funding manager retrying `funding_locked`, the link retransmitting an
//! unacked signature) subscribe here by remote node id and receive a
//! single notification on the next connection.

use std::collections::HashMap;
use std::sync::Mutex;

use internet2::addr::NodeId;
use tokio::sync::oneshot;

/// Event delivered when a peer connects
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PeerOnline {
    /// Node id of the connected peer
    pub node_id: NodeId,
}

/// One-shot subscription bus keyed by remote node id
#[derive(Default)]
pub struct PeerBus {
    waiters: Mutex<HashMap<NodeId, Vec<oneshot::Sender<PeerOnline>>>>,
}

impl PeerBus {
    pub fn new() -> PeerBus {
        PeerBus::default()
    }

    /// Subscribes for the next connection of `node_id`.
    ///
    /// The returned receiver fires exactly once; to watch for subsequent
    /// reconnections a new subscription must be taken.
    pub fn subscribe(&self, node_id: NodeId) -> oneshot::Receiver<PeerOnline> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("peer bus lock poisoned")
            .entry(node_id)
            .or_default()
            .push(tx);
        rx
    }

    /// Notifies all one-shot subscribers that the peer connected; returns
    /// the number of delivered notifications
    pub fn notify_online(&self, node_id: NodeId) -> usize {
        let waiters = self
            .waiters
            .lock()
            .expect("peer bus lock poisoned")
            .remove(&node_id)
            .unwrap_or_default();
        let mut delivered = 0;
        for waiter in waiters {
            // Subscribers may be gone; their loss is not an error
            if waiter.send(PeerOnline { node_id }).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node_id(byte: u8) -> NodeId {
        let secret =
            secp256k1::SecretKey::from_slice(&[byte; 32]).unwrap();
        NodeId::from(secp256k1::PublicKey::from_secret_key(
            secp256k1::SECP256K1,
            &secret,
        ))
    }

    #[tokio::test]
    async fn one_shot_delivery() {
        let bus = PeerBus::new();
        let peer = node_id(7);
        let rx = bus.subscribe(peer);
        assert_eq!(bus.notify_online(peer), 1);
        assert_eq!(rx.await.unwrap().node_id, peer);
        // A second notification has no subscribers left
        assert_eq!(bus.notify_online(peer), 0);
    }

    #[tokio::test]
    async fn keyed_by_node() {
        let bus = PeerBus::new();
        let alice = node_id(1);
        let bob = node_id(2);
        let rx_alice = bus.subscribe(alice);
        assert_eq!(bus.notify_online(bob), 0);
        assert_eq!(bus.notify_online(alice), 1);
        assert!(rx_alice.await.is_ok());
    }
}
