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

//! Static channel key sets and the BOLT-3 per-commitment key derivations.

use std::collections::BTreeMap;

use amplify::{DumbDefault, Slice32};
use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::util::bip32::{ChildNumber, ExtendedPrivKey, KeySource};
use bitcoin_scripts::PubkeyScript;
use lnwire::{AcceptChannel, OpenChannel};
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey, SECP256K1};
use wallet::hd::HardenedIndex;

/// Key + information about its derivation
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct LocalPubkey {
    pub key: PublicKey,
    pub source: KeySource,
}

impl LocalPubkey {
    #[inline]
    pub fn to_bip32_derivation_map(&self) -> BTreeMap<PublicKey, KeySource> {
        bmap! { self.key => self.source.clone() }
    }

    #[inline]
    pub fn to_bitcoin_pk(&self) -> bitcoin::PublicKey {
        bitcoin::PublicKey::new(self.key)
    }
}

/// Set of keys used by the local node for constructing channel transactions,
/// together with the seed of the local per-commitment secret chain.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct LocalKeyset {
    /// Public key used in the funding outpoint multisig
    pub funding_pubkey: LocalPubkey,
    /// Base point for deriving keys used for penalty spending paths
    pub revocation_basepoint: LocalPubkey,
    /// Base point for deriving keys in `to_remote`
    pub payment_basepoint: LocalPubkey,
    /// Base point for deriving keys in `to_local` time-locked spending paths
    pub delayed_payment_basepoint: LocalPubkey,
    /// Base point for deriving HTLC-related keys
    pub htlc_basepoint: LocalPubkey,
    /// Seed of the local shachain producing per-commitment secrets
    pub shachain_seed: Slice32,
    /// Allows the sending node to commit to where funds will go on mutual
    /// close, which the remote node should enforce even if a node is
    /// compromised later.
    pub shutdown_scriptpubkey: Option<PubkeyScript>,
    /// If `option_static_remotekey` is negotiated, the remote pubkey is
    /// simply the remote node's payment_basepoint, otherwise it is tweaked
    /// with the per-commitment point.
    pub static_remotekey: bool,
}

/// Set of keys received from the remote node
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct RemoteKeyset {
    /// Public key used in the funding outpoint multisig
    pub funding_pubkey: PublicKey,
    /// Base point for deriving keys used for penalty spending paths
    pub revocation_basepoint: PublicKey,
    /// Base point for deriving keys in `to_remote`
    pub payment_basepoint: PublicKey,
    /// Base point for deriving keys in `to_local` time-locked spending paths
    pub delayed_payment_basepoint: PublicKey,
    /// Base point for deriving HTLC-related keys
    pub htlc_basepoint: PublicKey,
    /// First per-commitment point advertised in the channel open dance
    pub first_per_commitment_point: PublicKey,
    /// Remote shutdown script committed during channel open
    pub shutdown_scriptpubkey: Option<PubkeyScript>,
    /// Whether the remote `to_remote` output uses a static key
    pub static_remotekey: bool,
}

impl From<&OpenChannel> for RemoteKeyset {
    fn from(open_channel: &OpenChannel) -> Self {
        Self {
            funding_pubkey: open_channel.funding_pubkey,
            revocation_basepoint: open_channel.revocation_basepoint,
            payment_basepoint: open_channel.payment_point,
            delayed_payment_basepoint: open_channel.delayed_payment_basepoint,
            htlc_basepoint: open_channel.htlc_basepoint,
            first_per_commitment_point: open_channel.first_per_commitment_point,
            shutdown_scriptpubkey: open_channel.shutdown_scriptpubkey.clone(),
            static_remotekey: open_channel.has_static_remotekey(),
        }
    }
}

impl From<&AcceptChannel> for RemoteKeyset {
    fn from(accept_channel: &AcceptChannel) -> Self {
        Self {
            funding_pubkey: accept_channel.funding_pubkey,
            revocation_basepoint: accept_channel.revocation_basepoint,
            payment_basepoint: accept_channel.payment_point,
            delayed_payment_basepoint: accept_channel
                .delayed_payment_basepoint,
            htlc_basepoint: accept_channel.htlc_basepoint,
            first_per_commitment_point: accept_channel
                .first_per_commitment_point,
            shutdown_scriptpubkey: accept_channel.shutdown_scriptpubkey.clone(),
            static_remotekey: accept_channel.has_static_remotekey(),
        }
    }
}

impl DumbDefault for LocalPubkey {
    fn dumb_default() -> Self {
        LocalPubkey {
            key: dumb_pubkey!(),
            source: KeySource::default(),
        }
    }
}

impl DumbDefault for LocalKeyset {
    fn dumb_default() -> Self {
        Self {
            funding_pubkey: DumbDefault::dumb_default(),
            revocation_basepoint: DumbDefault::dumb_default(),
            payment_basepoint: DumbDefault::dumb_default(),
            delayed_payment_basepoint: DumbDefault::dumb_default(),
            htlc_basepoint: DumbDefault::dumb_default(),
            shachain_seed: Slice32::default(),
            shutdown_scriptpubkey: None,
            static_remotekey: false,
        }
    }
}

impl DumbDefault for RemoteKeyset {
    fn dumb_default() -> Self {
        Self {
            funding_pubkey: dumb_pubkey!(),
            revocation_basepoint: dumb_pubkey!(),
            payment_basepoint: dumb_pubkey!(),
            delayed_payment_basepoint: dumb_pubkey!(),
            htlc_basepoint: dumb_pubkey!(),
            first_per_commitment_point: dumb_pubkey!(),
            shutdown_scriptpubkey: None,
            static_remotekey: false,
        }
    }
}

impl LocalKeyset {
    /// Derives keyset from a *channel extended key*, deriving each basepoint
    /// at its own hardened index and the shachain seed at the last one.
    pub fn with<C: secp256k1::Signing>(
        secp: &Secp256k1<C>,
        channel_source: KeySource,
        channel_xpriv: ExtendedPrivKey,
        shutdown_scriptpubkey: Option<PubkeyScript>,
    ) -> Self {
        let fingerprint = channel_source.0;

        let keys = (0u16..=5)
            .map(HardenedIndex::from)
            .map(ChildNumber::from)
            .map(|index| [index])
            .map(|path| {
                let derivation_path = channel_source.1.clone().extend(path);
                let seckey = channel_xpriv
                    .derive_priv(secp, &path)
                    .expect("negligible probability")
                    .private_key;
                (seckey, LocalPubkey {
                    key: PublicKey::from_secret_key(secp, &seckey),
                    source: (fingerprint, derivation_path),
                })
            })
            .collect::<Vec<_>>();

        Self {
            funding_pubkey: keys[0].1.clone(),
            payment_basepoint: keys[1].1.clone(),
            delayed_payment_basepoint: keys[2].1.clone(),
            revocation_basepoint: keys[3].1.clone(),
            htlc_basepoint: keys[4].1.clone(),
            shachain_seed: Slice32::from_inner(keys[5].0.secret_bytes()),
            shutdown_scriptpubkey,
            static_remotekey: false,
        }
    }
}

fn tweak_scalar(
    per_commitment_point: &PublicKey,
    basepoint: &PublicKey,
) -> Scalar {
    let mut engine = sha256::Hash::engine();
    engine.input(&per_commitment_point.serialize());
    engine.input(&basepoint.serialize());
    let tweak = sha256::Hash::from_engine(engine);
    Scalar::from_be_bytes(tweak.into_inner())
        .expect("negligible probability")
}

/// Derives `basepoint + SHA256(per_commitment_point || basepoint) * G`, the
/// generic BOLT-3 key derivation used for payment, delayed-payment and HTLC
/// keys.
pub fn derive_pubkey(
    basepoint: PublicKey,
    per_commitment_point: PublicKey,
) -> PublicKey {
    basepoint
        .add_exp_tweak(SECP256K1, &tweak_scalar(&per_commitment_point, &basepoint))
        .expect("negligible probability")
}

/// Private-key counterpart of [`derive_pubkey`]
pub fn derive_seckey(
    base_secret: SecretKey,
    per_commitment_point: PublicKey,
) -> SecretKey {
    let basepoint = PublicKey::from_secret_key(SECP256K1, &base_secret);
    base_secret
        .add_tweak(&tweak_scalar(&per_commitment_point, &basepoint))
        .expect("negligible probability")
}

/// Derives the revocation public key:
/// `revocation_basepoint * SHA256(revocation_basepoint || per_commitment_point)
///  + per_commitment_point * SHA256(per_commitment_point || revocation_basepoint)`.
///
/// A peer learning the matching per-commitment secret can reconstruct the
/// private key with [`derive_revocation_seckey`].
pub fn derive_revocation_pubkey(
    revocation_basepoint: PublicKey,
    per_commitment_point: PublicKey,
) -> PublicKey {
    let tweaked_basepoint = revocation_basepoint
        .mul_tweak(
            SECP256K1,
            &tweak_scalar(&revocation_basepoint, &per_commitment_point),
        )
        .expect("negligible probability");
    let tweaked_point = per_commitment_point
        .mul_tweak(
            SECP256K1,
            &tweak_scalar(&per_commitment_point, &revocation_basepoint),
        )
        .expect("negligible probability");
    tweaked_basepoint
        .combine(&tweaked_point)
        .expect("negligible probability")
}

/// Reconstructs the revocation private key from the revocation base secret
/// and the revealed per-commitment secret of the counterparty.
pub fn derive_revocation_seckey(
    revocation_base_secret: SecretKey,
    per_commitment_secret: SecretKey,
) -> SecretKey {
    let revocation_basepoint =
        PublicKey::from_secret_key(SECP256K1, &revocation_base_secret);
    let per_commitment_point =
        PublicKey::from_secret_key(SECP256K1, &per_commitment_secret);

    let part1 = revocation_base_secret
        .mul_tweak(&tweak_scalar(
            &revocation_basepoint,
            &per_commitment_point,
        ))
        .expect("negligible probability");
    let part2 = per_commitment_secret
        .mul_tweak(&tweak_scalar(
            &per_commitment_point,
            &revocation_basepoint,
        ))
        .expect("negligible probability");
    part1
        .add_tweak(
            &Scalar::from_be_bytes(part2.secret_bytes())
                .expect("negligible probability"),
        )
        .expect("negligible probability")
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    // Test vectors from BOLT-3, appendix E
    fn base_secret() -> SecretKey {
        SecretKey::from_str(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f",
        )
        .unwrap()
    }

    fn per_commitment_secret() -> SecretKey {
        SecretKey::from_str(
            "1f1e1d1c1b1a191817161514131211100f0e0d0c0b0a09080706050403020100",
        )
        .unwrap()
    }

    fn base_point() -> PublicKey {
        PublicKey::from_str(
            "036d6caac248af96f6afa7f904f550253a0f3ef3f5aa2fe6838a95b216691468e2",
        )
        .unwrap()
    }

    fn per_commitment_point() -> PublicKey {
        PublicKey::from_str(
            "025f7117a78150fe2ef97db7cfc83bd57b2e2c0d0dd25eaf467a4a1c2a45ce1486",
        )
        .unwrap()
    }

    #[test]
    fn bolt3_derive_pubkey() {
        assert_eq!(
            derive_pubkey(base_point(), per_commitment_point()),
            PublicKey::from_str(
                "0235f2dbfaa89b57ec7b055afe29849ef7ddfeb1cefdb9ebdc43f5494984db29e5"
            )
            .unwrap()
        );
    }

    #[test]
    fn bolt3_derive_seckey() {
        let derived = derive_seckey(base_secret(), per_commitment_point());
        assert_eq!(
            derived,
            SecretKey::from_str(
                "cbced912d3b21bf196a766651e436aff192362621ce317704ea2f75d87e7be0f"
            )
            .unwrap()
        );
        // Consistency between the public and the private derivation
        assert_eq!(
            PublicKey::from_secret_key(SECP256K1, &derived),
            derive_pubkey(
                PublicKey::from_secret_key(SECP256K1, &base_secret()),
                per_commitment_point()
            )
        );
    }

    #[test]
    fn bolt3_derive_revocation_pubkey() {
        assert_eq!(
            derive_revocation_pubkey(base_point(), per_commitment_point()),
            PublicKey::from_str(
                "02916e326636d19c33f13e8c0c3a03dd157f332f3e99c317c141dd865eb01f8ff0"
            )
            .unwrap()
        );
    }

    #[test]
    fn bolt3_derive_revocation_seckey() {
        let derived = derive_revocation_seckey(
            base_secret(),
            per_commitment_secret(),
        );
        assert_eq!(
            derived,
            SecretKey::from_str(
                "d09ffff62ddb2297ab000cc85bcb4283fdeb6aa052affbc9dddcf33b61078110"
            )
            .unwrap()
        );
        // The reconstructed private key must match the public derivation
        assert_eq!(
            PublicKey::from_secret_key(SECP256K1, &derived),
            derive_revocation_pubkey(
                PublicKey::from_secret_key(SECP256K1, &base_secret()),
                PublicKey::from_secret_key(
                    SECP256K1,
                    &per_commitment_secret()
                )
            )
        );
    }
}
