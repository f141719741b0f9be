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

//! BOLT-3 per-commitment secret tree ("shachain").
//!
//! Secrets are generated from a 32-byte seed in *decreasing* index order:
//! secret `I` is obtained by flipping the bits of the seed marked by the
//! zero-padded binary representation of `I` and hashing at every flip.
//! Because derivation only moves from lower to higher bit prefixes, a
//! consumer can store one secret per trailing-zero class — 49 slots —
//! and recover every earlier-revealed secret from them.

use amplify::Slice32;
use bitcoin::hashes::{sha256, Hash};
use secp256k1::{PublicKey, SecretKey, SECP256K1};

/// Index of the first per-commitment secret in the production order.
///
/// Secrets are revealed from `START_INDEX` downwards; commitment number `n`
/// maps onto secret index `START_INDEX - n`.
pub const START_INDEX: u64 = (1 << 48) - 1;

/// Number of `(index, secret)` buckets sufficient to recover any revealed
/// prefix of the 2⁴⁸ secret chain.
pub const STORE_SIZE: usize = 49;

/// Errors happening when a received per-commitment secret does not belong to
/// the chain advertised by the remote peer.
#[derive(
    Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error
)]
#[display(doc_comments)]
pub enum Error {
    /// per-commitment secret for index {index} can't derive the previously
    /// received secret at index {derived}; the remote peer is lying about
    /// its revocation chain
    ChainMismatch {
        /// Index of the newly provided secret
        index: u64,
        /// Index of the stored secret which failed derivation check
        derived: u64,
    },

    /// per-commitment secrets must be received in strictly decreasing index
    /// order; got {got} while expecting {expected}
    OutOfOrder {
        /// Index the store expected to receive next
        expected: u64,
        /// Index actually provided
        got: u64,
    },
}

/// Derives per-commitment secret number `index` from the channel `seed`.
///
/// Implements the BOLT-3 `generate_from_seed(seed, I)` algorithm: for every
/// set bit `B` of `I` (counting from bit 47 down) flip bit `B` and replace
/// the value with its SHA-256.
pub fn secret_from_seed(seed: Slice32, index: u64) -> Slice32 {
    let mut value = seed.to_inner();
    for bit in (0..48).rev() {
        if index & (1 << bit) != 0 {
            value[47 / 8 - bit as usize / 8] ^= 1 << (bit & 7);
            value = sha256::Hash::hash(&value).into_inner();
        }
    }
    Slice32::from_inner(value)
}

/// Computes the per-commitment point matching the secret at `index`.
pub fn point_from_seed(seed: Slice32, index: u64) -> PublicKey {
    let secret = SecretKey::from_slice(secret_from_seed(seed, index).as_ref())
        .expect("SHA-256 output is a valid secp256k1 scalar with negligible probability of failure");
    PublicKey::from_secret_key(SECP256K1, &secret)
}

/// Derives the secret for `index` from the stored secret at `from_index`.
///
/// Possible only when `from_index` is a bit-prefix of `index` (all bits of
/// `from_index` below its trailing-zero count are free).
fn derive(from_index: u64, from_secret: Slice32, index: u64) -> Slice32 {
    let mut value = from_secret.to_inner();
    for bit in (0..from_index.trailing_zeros().min(48)).rev() {
        if index & (1 << bit) != 0 {
            value[47 / 8 - bit as usize / 8] ^= 1 << (bit & 7);
            value = sha256::Hash::hash(&value).into_inner();
        }
    }
    Slice32::from_inner(value)
}

fn can_derive(from_index: u64, index: u64) -> bool {
    let mask = !((1u64 << from_index.trailing_zeros().min(48)) - 1);
    from_index & mask == index & mask
}

/// Producer side of the per-commitment secret chain.
///
/// Stateless except for the seed: any secret or point is re-derived on
/// demand, which keeps the producer trivially persistent.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[derive(StrictEncode, StrictDecode)]
pub struct ShaChainProducer {
    seed: Slice32,
}

impl ShaChainProducer {
    /// Constructs the producer from a channel-specific random seed
    #[inline]
    pub fn with(seed: Slice32) -> ShaChainProducer {
        ShaChainProducer { seed }
    }

    /// Secret revealed when revoking commitment number `commitment_number`
    #[inline]
    pub fn secret_at(&self, commitment_number: u64) -> Slice32 {
        secret_from_seed(self.seed, START_INDEX - commitment_number)
    }

    /// Per-commitment point for commitment number `commitment_number`
    #[inline]
    pub fn point_at(&self, commitment_number: u64) -> PublicKey {
        point_from_seed(self.seed, START_INDEX - commitment_number)
    }

    /// Secret key form of the per-commitment secret, used for signing sweeps
    pub fn secret_key_at(&self, commitment_number: u64) -> SecretKey {
        SecretKey::from_slice(self.secret_at(commitment_number).as_ref())
            .expect("SHA-256 output is a valid secp256k1 scalar with negligible probability of failure")
    }
}

/// Consumer side of the chain: stores the secrets revealed by the remote
/// peer in `O(log N)` space and verifies each new secret against the already
/// known suffix of the chain.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[derive(StrictEncode, StrictDecode)]
pub struct ShaChainStore {
    /// `(index, secret)` pairs, one per trailing-zero class
    slots: Vec<(u64, Slice32)>,
}

impl ShaChainStore {
    /// Constructs an empty store
    #[inline]
    pub fn new() -> ShaChainStore {
        ShaChainStore::default()
    }

    /// The lowest (most recent) secret index received so far
    pub fn min_index(&self) -> Option<u64> {
        self.slots.iter().map(|(index, _)| *index).min()
    }

    /// Number of secrets received over the lifetime of the chain
    pub fn received_count(&self) -> u64 {
        match self.min_index() {
            Some(min) => START_INDEX - min + 1,
            None => 0,
        }
    }

    /// Adds a newly revealed secret at `index`, verifying that every stored
    /// secret is derivable from it where the chain structure requires so.
    pub fn provide(&mut self, index: u64, secret: Slice32) -> Result<(), Error> {
        if let Some(min) = self.min_index() {
            if index != min - 1 {
                return Err(Error::OutOfOrder {
                    expected: min - 1,
                    got: index,
                });
            }
        } else if index != START_INDEX {
            return Err(Error::OutOfOrder {
                expected: START_INDEX,
                got: index,
            });
        }

        // Every stored slot whose index lies in the subtree of the new
        // secret must be re-derivable from it.
        for (stored_index, stored_secret) in &self.slots {
            if can_derive(index, *stored_index)
                && derive(index, secret, *stored_index) != *stored_secret
            {
                return Err(Error::ChainMismatch {
                    index,
                    derived: *stored_index,
                });
            }
        }

        // The new secret supersedes every slot it can derive.
        self.slots
            .retain(|(stored_index, _)| !can_derive(index, *stored_index));
        self.slots.push((index, secret));
        debug_assert!(self.slots.len() <= STORE_SIZE);
        Ok(())
    }

    /// Recovers the secret at `index`, provided it was already revealed.
    pub fn secret_at(&self, index: u64) -> Option<Slice32> {
        self.slots
            .iter()
            .find(|(stored_index, _)| can_derive(*stored_index, index))
            .map(|(stored_index, stored_secret)| {
                derive(*stored_index, *stored_secret, index)
            })
    }

    /// Recovers the secret revealed for `commitment_number`, counting in
    /// commitment order
    #[inline]
    pub fn secret_for_commitment(
        &self,
        commitment_number: u64,
    ) -> Option<Slice32> {
        self.secret_at(START_INDEX - commitment_number)
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use amplify::hex::FromHex;

    use super::*;

    fn seed(hex: &str) -> Slice32 {
        Slice32::from_hex(hex).unwrap()
    }

    // Test vectors from BOLT-3, appendix D, "generation tests"
    #[test]
    fn bolt3_generate_from_seed() {
        assert_eq!(
            secret_from_seed(
                seed("0000000000000000000000000000000000000000000000000000000000000000"),
                0xFFFFFFFFFFFF
            ),
            seed("02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148")
        );
        assert_eq!(
            secret_from_seed(
                seed("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF"),
                0xFFFFFFFFFFFF
            ),
            seed("7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc")
        );
        assert_eq!(
            secret_from_seed(
                seed("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF"),
                0xaaaaaaaaaaa
            ),
            seed("56f4008fb007ca9acf0e15b054d5c9fd12ee06cea347914ddbaed70d1c13a528")
        );
        assert_eq!(
            secret_from_seed(
                seed("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF"),
                0x555555555555
            ),
            seed("9015daaeb06dba4ccc05b91b2f73bd54405f2be9f217fbacd3c5ac2e62327d31")
        );
        assert_eq!(
            secret_from_seed(
                seed("0101010101010101010101010101010101010101010101010101010101010101"),
                1
            ),
            seed("915c75942a26bb3a433a8ce2cb0427c29ec6c1775cfc78328b57f6ba7bfeaa9c")
        );
    }

    // Test vector from BOLT-3, appendix D, "storage tests"
    #[test]
    fn store_correct_sequence() {
        let seed = seed("0000000000000000000000000000000000000000000000000000000000000000");
        let mut store = ShaChainStore::new();
        for offset in 0..20u64 {
            let index = START_INDEX - offset;
            store
                .provide(index, secret_from_seed(seed, index))
                .unwrap();
            assert!(store.slots.len() <= STORE_SIZE);
        }
        // Every revealed secret must be recoverable
        for offset in 0..20u64 {
            let index = START_INDEX - offset;
            assert_eq!(
                store.secret_at(index),
                Some(secret_from_seed(seed, index))
            );
        }
        // Unrevealed ones must not
        assert_eq!(store.secret_at(START_INDEX - 20), None);
        assert_eq!(store.received_count(), 20);
    }

    #[test]
    fn store_rejects_invalid_secret() {
        let good = seed("0000000000000000000000000000000000000000000000000000000000000000");
        let mut store = ShaChainStore::new();
        store
            .provide(START_INDEX, secret_from_seed(good, START_INDEX))
            .unwrap();

        // A secret from a different seed cannot extend the chain once its
        // subtree overlaps a stored slot
        let evil = seed("0101010101010101010101010101010101010101010101010101010101010101");
        let mut err = None;
        for offset in 1..=2u64 {
            let index = START_INDEX - offset;
            if let Err(failure) =
                store.provide(index, secret_from_seed(evil, index))
            {
                err = Some(failure);
                break;
            }
        }
        assert!(matches!(err, Some(Error::ChainMismatch { .. })));
    }

    #[test]
    fn store_rejects_out_of_order() {
        let seed = seed("0000000000000000000000000000000000000000000000000000000000000000");
        let mut store = ShaChainStore::new();
        store
            .provide(START_INDEX, secret_from_seed(seed, START_INDEX))
            .unwrap();
        assert_eq!(
            store.provide(START_INDEX - 2, secret_from_seed(seed, START_INDEX - 2)),
            Err(Error::OutOfOrder {
                expected: START_INDEX - 1,
                got: START_INDEX - 2,
            })
        );
    }

    #[test]
    fn producer_point_matches_secret() {
        let producer = ShaChainProducer::with(seed(
            "0101010101010101010101010101010101010101010101010101010101010101",
        ));
        let secret = producer.secret_key_at(0);
        let point = PublicKey::from_secret_key(SECP256K1, &secret);
        assert_eq!(point, producer.point_at(0));
        // Consecutive commitments use different points
        assert_ne!(producer.point_at(0), producer.point_at(1));
    }

    #[test]
    fn str_helper() {
        // Slice32 hex round-trip used across persisted state
        let value = Slice32::from_str(
            "02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148",
        )
        .unwrap();
        assert_eq!(
            value.to_string(),
            "02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148"
        );
    }
}
