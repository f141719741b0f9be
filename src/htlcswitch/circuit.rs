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

//! Persistent payment circuit map.
//!
//! A circuit pairs the incoming HTLC slot with its outgoing slot; it is
//! persisted before the outgoing `update_add_htlc` leaves the process and
//! removed once both legs reach a terminal state. After a restart the map
//! is the source of truth for settle/fail propagation and for detecting
//! orphaned outgoing adds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use amplify::{Slice32, Wrapper};
use lnwire::ChannelId;
use strict_encoding::StrictDecode;

use crate::persist::{encoded, Bucket, Store, StoreError, StoreExt, StoreOp};

/// Key of one leg of a payment circuit: the channel and the HTLC slot
/// within it
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    StrictEncode,
    StrictDecode,
)]
#[display("{channel_id}:{htlc_id}")]
pub struct CircuitKey {
    /// Channel carrying the HTLC
    pub channel_id: ChannelId,
    /// Id of the HTLC within the channel direction
    pub htlc_id: u64,
}

impl CircuitKey {
    #[inline]
    pub fn with(channel_id: ChannelId, htlc_id: u64) -> CircuitKey {
        CircuitKey {
            channel_id,
            htlc_id,
        }
    }

    fn storage_key(&self) -> Vec<u8> {
        let mut key = self.channel_id.as_slice32().to_inner().to_vec();
        key.extend(self.htlc_id.to_be_bytes());
        key
    }
}

/// A payment circuit: the pairing between the incoming and the outgoing
/// HTLC slots of one forwarded payment
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct Circuit {
    /// The incoming leg (upstream channel)
    pub incoming: CircuitKey,

    /// The outgoing leg (downstream channel)
    pub outgoing: CircuitKey,

    /// Onion shared secret of the incoming hop, used for wrapping failure
    /// messages travelling back
    pub shared_secret: Slice32,

    /// Amount of the incoming HTLC, msat
    pub incoming_amount_msat: u64,

    /// Amount forwarded downstream, msat
    pub outgoing_amount_msat: u64,

    /// Expiry of the incoming HTLC
    pub incoming_expiry: u32,

    /// Expiry of the outgoing HTLC
    pub outgoing_expiry: u32,
}

impl Circuit {
    /// Routing fee earned by this circuit, msat
    #[inline]
    pub fn fee_msat(&self) -> u64 {
        self.incoming_amount_msat
            .saturating_sub(self.outgoing_amount_msat)
    }
}

/// Process-singleton map of open payment circuits, indexed by both legs and
/// mirrored into the circuit bucket of the store.
pub struct CircuitMap {
    store: Arc<dyn Store>,
    by_outgoing: Mutex<HashMap<CircuitKey, Circuit>>,
}

impl CircuitMap {
    /// Restores the circuit map from the store
    pub fn restore(store: Arc<dyn Store>) -> Result<CircuitMap, StoreError> {
        let mut by_outgoing = HashMap::new();
        for (_, raw) in store.list(Bucket::Circuit)? {
            let circuit = Circuit::strict_deserialize(raw)?;
            by_outgoing.insert(circuit.outgoing, circuit);
        }
        debug!("restored {} in-flight circuits", by_outgoing.len());
        Ok(CircuitMap {
            store,
            by_outgoing: Mutex::new(by_outgoing),
        })
    }

    /// Number of circuits currently in flight
    pub fn len(&self) -> usize {
        self.by_outgoing.lock().expect("circuit map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opens a circuit, committing it durably before the outgoing add may
    /// be put on the wire. Returns the operations so the caller can commit
    /// them in one transaction with the channel state update.
    pub fn open(&self, circuit: Circuit) -> Result<(), StoreError> {
        self.store.commit(vec![StoreOp::Put(
            Bucket::Circuit,
            circuit.outgoing.storage_key(),
            encoded(&circuit)?,
        )])?;
        self.by_outgoing
            .lock()
            .expect("circuit map poisoned")
            .insert(circuit.outgoing, circuit);
        Ok(())
    }

    /// Finds the circuit of an outgoing HTLC slot
    pub fn by_outgoing(&self, key: CircuitKey) -> Option<Circuit> {
        self.by_outgoing
            .lock()
            .expect("circuit map poisoned")
            .get(&key)
            .cloned()
    }

    /// Finds the circuit by its incoming HTLC slot
    pub fn by_incoming(&self, key: CircuitKey) -> Option<Circuit> {
        self.by_outgoing
            .lock()
            .expect("circuit map poisoned")
            .values()
            .find(|circuit| circuit.incoming == key)
            .cloned()
    }

    /// Detects whether the incoming slot already has an open circuit
    /// (used for idempotent forwarding-package replay)
    pub fn contains_incoming(&self, key: CircuitKey) -> bool {
        self.by_incoming(key).is_some()
    }

    /// Closes the circuit after both legs reached a terminal state
    pub fn close(&self, outgoing: CircuitKey) -> Result<Option<Circuit>, StoreError> {
        let removed = self
            .by_outgoing
            .lock()
            .expect("circuit map poisoned")
            .remove(&outgoing);
        if removed.is_some() {
            self.store
                .delete_key(Bucket::Circuit, &outgoing.storage_key())?;
        }
        Ok(removed)
    }

    /// Returns the set of outgoing adds among `in_flight` which have no
    /// matching circuit; those must be failed back after a restart.
    pub fn orphaned(&self, in_flight: &[CircuitKey]) -> Vec<CircuitKey> {
        let map = self.by_outgoing.lock().expect("circuit map poisoned");
        in_flight
            .iter()
            .filter(|key| !map.contains_key(key))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod test {
    use amplify::DumbDefault;

    use super::*;
    use crate::persist::MemoryStore;

    fn circuit(incoming_id: u64, outgoing_id: u64) -> Circuit {
        Circuit {
            incoming: CircuitKey::with(
                ChannelId::dumb_default(),
                incoming_id,
            ),
            outgoing: CircuitKey::with(
                ChannelId::from(lnwire::TempChannelId::random()),
                outgoing_id,
            ),
            shared_secret: Slice32::default(),
            incoming_amount_msat: 11_001_000,
            outgoing_amount_msat: 10_000_000,
            incoming_expiry: 500_080,
            outgoing_expiry: 500_040,
        }
    }

    #[test]
    fn circuit_lifetime() {
        let store = Arc::new(MemoryStore::new());
        let map = CircuitMap::restore(store.clone()).unwrap();

        let circuit = circuit(0, 0);
        map.open(circuit.clone()).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.by_outgoing(circuit.outgoing), Some(circuit.clone()));
        assert_eq!(map.by_incoming(circuit.incoming), Some(circuit.clone()));
        assert_eq!(circuit.fee_msat(), 1_001_000);

        // A restart restores the same circuits from the store
        let restored = CircuitMap::restore(store.clone()).unwrap();
        assert_eq!(restored.len(), 1);
        assert!(restored.contains_incoming(circuit.incoming));

        map.close(circuit.outgoing).unwrap();
        assert!(map.is_empty());
        let after_close = CircuitMap::restore(store).unwrap();
        assert!(after_close.is_empty());
    }

    #[test]
    fn orphan_detection() {
        let store = Arc::new(MemoryStore::new());
        let map = CircuitMap::restore(store).unwrap();
        let known = circuit(0, 1);
        map.open(known.clone()).unwrap();

        let orphan = CircuitKey::with(known.outgoing.channel_id, 2);
        let orphans = map.orphaned(&[known.outgoing, orphan]);
        assert_eq!(orphans, vec![orphan]);
    }
}
