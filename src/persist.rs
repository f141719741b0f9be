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

//! Persistence seam: a transactional bucket-based key-value store.
//!
//! Values are strict-encoded; all mutations belonging to one protocol step
//! are committed atomically through [`Store::commit`]. The in-memory
//! implementation backs the tests and serves as the reference for the
//! semantics real backends must provide.

use std::collections::BTreeMap;
use std::sync::Mutex;

use strict_encoding::{StrictDecode, StrictEncode};

/// Buckets of the node core store
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display,
)]
pub enum Bucket {
    /// Per-channel state: commitments, update log, open-state flags
    #[display("channel")]
    Channel,

    /// Payment circuits of the switch
    #[display("circuit")]
    Circuit,

    /// Arbitrator and resolver checkpoints
    #[display("arbitrator")]
    Arbitrator,

    /// Per-height forwarding packages
    #[display("fwdpkg")]
    FwdPkg,

    /// Retribution records for revoked remote commitments
    #[display("retribution")]
    Retribution,

    /// Funding reservations of the funding manager
    #[display("reservation")]
    Reservation,
}

/// Persistence errors
#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum StoreError {
    /// storage backend failure: {0}
    Backend(String),

    /// stored value can't be decoded: {0}
    #[from]
    Encoding(strict_encoding::Error),
}

/// A single mutation within a transaction
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum StoreOp {
    /// Insert or replace the value under the key
    Put(Bucket, Vec<u8>, Vec<u8>),
    /// Remove the key
    Delete(Bucket, Vec<u8>),
}

/// Transactional bucket-based key-value store.
///
/// The store is a process singleton shared by the switch, the links and the
/// arbitrators; per-entity serialization of mutations is the caller's
/// responsibility.
pub trait Store: Send + Sync {
    /// Reads the value stored under the key
    fn get(
        &self,
        bucket: Bucket,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// Lists all key-value pairs of the bucket
    fn list(
        &self,
        bucket: Bucket,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Applies all operations atomically: either every mutation of the
    /// protocol step persists, or none does
    fn commit(&self, ops: Vec<StoreOp>) -> Result<(), StoreError>;
}

/// Extension helpers for strict-encoded values
pub trait StoreExt: Store {
    /// Reads and decodes a strict-encoded value
    fn get_value<T: StrictDecode>(
        &self,
        bucket: Bucket,
        key: &[u8],
    ) -> Result<Option<T>, StoreError> {
        self.get(bucket, key)?
            .map(|raw| T::strict_deserialize(raw).map_err(StoreError::from))
            .transpose()
    }

    /// Encodes and stores a value under the key as a single-op transaction
    fn put_value<T: StrictEncode>(
        &self,
        bucket: Bucket,
        key: &[u8],
        value: &T,
    ) -> Result<(), StoreError> {
        let raw = value.strict_serialize()?;
        self.commit(vec![StoreOp::Put(bucket, key.to_vec(), raw)])
    }

    /// Removes the key as a single-op transaction
    fn delete_key(
        &self,
        bucket: Bucket,
        key: &[u8],
    ) -> Result<(), StoreError> {
        self.commit(vec![StoreOp::Delete(bucket, key.to_vec())])
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

/// Serializes a value for inclusion into a multi-op transaction
pub fn encoded<T: StrictEncode>(value: &T) -> Result<Vec<u8>, StoreError> {
    value.strict_serialize().map_err(StoreError::from)
}

/// In-memory store used in tests and as the semantics reference
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<(Bucket, Vec<u8>), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

impl Store for MemoryStore {
    fn get(
        &self,
        bucket: Bucket,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let data = self.data.lock().expect("store lock poisoned");
        Ok(data.get(&(bucket, key.to_vec())).cloned())
    }

    fn list(
        &self,
        bucket: Bucket,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let data = self.data.lock().expect("store lock poisoned");
        Ok(data
            .iter()
            .filter(|((b, _), _)| *b == bucket)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    fn commit(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let mut data = self.data.lock().expect("store lock poisoned");
        for op in ops {
            match op {
                StoreOp::Put(bucket, key, value) => {
                    data.insert((bucket, key), value);
                }
                StoreOp::Delete(bucket, key) => {
                    data.remove(&(bucket, key));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn atomic_multi_op_commit() {
        let store = MemoryStore::new();
        store
            .commit(vec![
                StoreOp::Put(Bucket::Channel, b"a".to_vec(), vec![1]),
                StoreOp::Put(Bucket::Circuit, b"b".to_vec(), vec![2]),
                StoreOp::Delete(Bucket::Channel, b"missing".to_vec()),
            ])
            .unwrap();
        assert_eq!(
            store.get(Bucket::Channel, b"a").unwrap(),
            Some(vec![1])
        );
        assert_eq!(
            store.get(Bucket::Circuit, b"b").unwrap(),
            Some(vec![2])
        );
        assert_eq!(store.list(Bucket::Channel).unwrap().len(), 1);
    }

    #[test]
    fn typed_roundtrip() {
        let store = MemoryStore::new();
        store
            .put_value(Bucket::FwdPkg, b"height/100", &42u64)
            .unwrap();
        assert_eq!(
            store.get_value::<u64>(Bucket::FwdPkg, b"height/100").unwrap(),
            Some(42)
        );
        store.delete_key(Bucket::FwdPkg, b"height/100").unwrap();
        assert_eq!(
            store.get_value::<u64>(Bucket::FwdPkg, b"height/100").unwrap(),
            None
        );
    }
}
