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

//! BOLT-2 channel operation messages: HTLC updates, fee updates and the
//! sign/revoke cycle.

use amplify::DumbDefault;
use bitcoin::hashes::sha256;
use bitcoin_scripts::hlc::{HashLock, HashPreimage};
use internet2::presentation::sphinx::Onion;
use internet2::tlv;
use secp256k1::ecdsa::Signature;
use secp256k1::{PublicKey, SecretKey};

use super::{ChannelId, PaymentOnion};

/// Total length of payment Sphinx package
pub const PAYMENT_SPHINX_LEN: usize = 1300;

/// Payment onion packet as it travels inside `update_add_htlc`
pub type OnionPacket = Onion<PaymentOnion, PAYMENT_SPHINX_LEN>;

/// Offers a new HTLC over the channel.
///
/// The onion routing packet commits to the HTLC by setting the payment_hash
/// as associated data, i.e. includes the payment_hash in the computation of
/// HMACs. This prevents replay attacks that would reuse a previous
/// onion_routing_packet with a different payment_hash.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[derive(NetworkEncode, NetworkDecode)]
#[network_encoding(use_tlv)]
#[lightning_encoding(use_tlv)]
#[display(
    "update_add_htlc({channel_id}, {htlc_id}, {amount_msat}, {payment_hash}, \
     {cltv_expiry}, ...)"
)]
pub struct UpdateAddHtlc {
    /// The channel ID
    pub channel_id: ChannelId,

    /// The HTLC ID, strictly increasing per channel direction
    pub htlc_id: u64,

    /// The HTLC value in milli-satoshi
    pub amount_msat: u64,

    /// The payment hash, the pre-image of which controls HTLC redemption
    pub payment_hash: HashLock,

    /// The expiry height of the HTLC
    pub cltv_expiry: u32,

    /// An obfuscated list of hops and instructions for each hop along the
    /// path
    pub onion_routing_packet: Onion<PaymentOnion, PAYMENT_SPHINX_LEN>,

    /// The rest of TLVs with unknown odd type ids
    #[lightning_encoding(unknown_tlvs)]
    #[network_encoding(unknown_tlvs)]
    pub unknown_tlvs: tlv::Stream,
}

impl UpdateAddHtlc {
    /// Constructs an onion packet template: a well-formed packet with a
    /// valid ephemeral key and zeroed routing data. Real packets come from
    /// the Sphinx construction at the payment origin.
    pub fn template_onion() -> OnionPacket {
        use lightning_encoding::LightningDecode;
        let mut raw = Vec::with_capacity(PAYMENT_SPHINX_LEN + 66);
        raw.push(0u8);
        raw.extend(dumb_pubkey!().serialize());
        raw.extend([0u8; PAYMENT_SPHINX_LEN]);
        raw.extend([0u8; 32]);
        OnionPacket::lightning_deserialize(&raw)
            .expect("static onion template is well-formed")
    }
}

impl DumbDefault for UpdateAddHtlc {
    fn dumb_default() -> Self {
        UpdateAddHtlc {
            channel_id: Default::default(),
            htlc_id: 0,
            amount_msat: 0,
            payment_hash: HashLock::from(HashPreimage::random()),
            cltv_expiry: 0,
            onion_routing_packet: UpdateAddHtlc::template_onion(),
            unknown_tlvs: none!(),
        }
    }
}

/// Settles an HTLC by disclosing its payment preimage.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[derive(NetworkEncode, NetworkDecode)]
#[display("update_fulfill_htlc({channel_id}, {htlc_id}, ...preimage)")]
pub struct UpdateFulfillHtlc {
    /// The channel ID
    pub channel_id: ChannelId,

    /// The HTLC ID
    pub htlc_id: u64,

    /// The pre-image of the payment hash, allowing HTLC redemption
    pub payment_preimage: HashPreimage,
}

/// Removes an HTLC carrying an onion-encrypted failure reason back towards
/// the HTLC origin.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[derive(NetworkEncode, NetworkDecode)]
#[display("update_fail_htlc({channel_id}, {htlc_id}, ...reason)")]
pub struct UpdateFailHtlc {
    /// The channel ID
    pub channel_id: ChannelId,

    /// The HTLC ID
    pub htlc_id: u64,

    /// An opaque encrypted blob for the benefit of the original HTLC
    /// initiator, as defined in BOLT #4
    pub reason: Vec<u8>,
}

/// Removes an HTLC whose onion could not be parsed by the peer; the current
/// node takes action instead, wrapping the failure into an
/// `update_fail_htlc` for relaying.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[derive(NetworkEncode, NetworkDecode)]
#[display("update_fail_malformed_htlc({channel_id}, {htlc_id}, {failure_code})")]
pub struct UpdateFailMalformedHtlc {
    /// The channel ID
    pub channel_id: ChannelId,

    /// The HTLC ID
    pub htlc_id: u64,

    /// SHA256 hash of onion data
    pub sha256_of_onion: sha256::Hash,

    /// The failure code; must have the BADONION bit set
    pub failure_code: u16,
}

/// Commits to the current set of pending updates with a signature over the
/// remote commitment transaction and each of its HTLC transactions.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[derive(NetworkEncode, NetworkDecode)]
#[display("commitment_signed({channel_id}, ...signatures)")]
pub struct CommitmentSigned {
    /// The channel ID
    pub channel_id: ChannelId,

    /// A signature on the commitment transaction
    pub signature: Signature,

    /// Signatures on the HTLC transactions, in commitment output order
    pub htlc_signatures: Vec<Signature>,
}

/// Revokes the previous commitment transaction by disclosing its
/// per-commitment secret and advertises the point for the commitment after
/// the newly signed one.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[derive(NetworkEncode, NetworkDecode)]
#[display(
    "revoke_and_ack({channel_id}, {next_per_commitment_point}, \
     ...per_commitment_secret)"
)]
pub struct RevokeAndAck {
    /// The channel ID
    pub channel_id: ChannelId,

    /// The secret corresponding to the per-commitment point of the revoked
    /// commitment transaction
    pub per_commitment_secret: SecretKey,

    /// The next sender-broadcast commitment transaction's per-commitment
    /// point
    pub next_per_commitment_point: PublicKey,
}

/// Adjusts the fee rate paid by the channel initiator on future commitment
/// transactions.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[derive(NetworkEncode, NetworkDecode)]
#[display("update_fee({channel_id}, {feerate_per_kw})")]
pub struct UpdateFee {
    /// The channel ID
    pub channel_id: ChannelId,

    /// Fee rate per 1000-weight of the transaction
    pub feerate_per_kw: u32,
}

#[cfg(test)]
mod test {
    use amplify::DumbDefault;
    use lightning_encoding::{LightningDecode, LightningEncode};

    use super::*;

    #[test]
    fn update_fulfill_roundtrip() {
        let msg = UpdateFulfillHtlc {
            channel_id: ChannelId::dumb_default(),
            htlc_id: 3,
            payment_preimage: HashPreimage::random(),
        };
        let encoded = msg.lightning_serialize().unwrap();
        // channel_id (32) + htlc_id (8) + preimage (32)
        assert_eq!(encoded.len(), 72);
        let decoded =
            UpdateFulfillHtlc::lightning_deserialize(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn update_fee_roundtrip() {
        let msg = UpdateFee {
            channel_id: ChannelId::dumb_default(),
            feerate_per_kw: 6000,
        };
        let encoded = msg.lightning_serialize().unwrap();
        assert_eq!(encoded.len(), 36);
        assert_eq!(UpdateFee::lightning_deserialize(&encoded).unwrap(), msg);
    }
}
