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

//! The part of BOLT-7 consumed by the node core: channel announcement
//! signatures, node announcements and the per-channel forwarding policy
//! (`channel_update`). The gossip store and graph synchronization are
//! external to this library.

use amplify::Slice32;
use internet2::addr::NodeId;
use secp256k1::ecdsa::Signature;

use crate::{AddressList, Alias, ChannelId, InitFeatures, NodeColor,
            ShortChannelId};

/// Direct message between the two endpoints of a channel serving as an opt-in
/// mechanism for announcing the channel to the rest of the network.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[derive(NetworkEncode, NetworkDecode)]
#[display("announcement_signatures({channel_id}, {short_channel_id}, ...)")]
pub struct AnnouncementSignatures {
    /// The channel ID
    pub channel_id: ChannelId,

    /// Coordinates of the confirmed funding output
    pub short_channel_id: ShortChannelId,

    /// Signature with the node key over the future `channel_announcement`
    pub node_signature: Signature,

    /// Signature with the funding key over the future `channel_announcement`
    pub bitcoin_signature: Signature,
}

/// Allows a node to indicate extra data associated with it, in addition to
/// its public key.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[derive(NetworkEncode, NetworkDecode)]
#[display("node_announcement({node_id}, {alias}, ...)")]
pub struct NodeAnnouncement {
    /// Signature of the announcing node over the remainder of the message
    pub signature: Signature,

    /// Features supported by the node
    pub features: InitFeatures,

    /// UNIX timestamp of the announcement; used for replacement ordering
    pub timestamp: u32,

    /// Public key of the announced node
    pub node_id: NodeId,

    /// Node color for rendering in network visualizations
    pub rgb_color: NodeColor,

    /// Human-readable node name (zero-padded, not necessarily UTF-8)
    pub alias: Alias,

    /// Network addresses on which the node accepts peer connections
    pub addresses: AddressList,
}

/// Independently announced forwarding parameters of one channel direction.
///
/// The switch consumes these as local forwarding-policy records; the network
/// propagation side lives outside of this library.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[derive(LightningEncode, LightningDecode)]
#[derive(NetworkEncode, NetworkDecode)]
#[display(
    "channel_update({short_channel_id}, {fee_base_msat}, \
     {fee_proportional_millionths}, {cltv_expiry_delta}, ...)"
)]
pub struct ChannelUpdate {
    /// Signature of the announcing node over the remainder of the message
    pub signature: Signature,

    /// The genesis hash of the blockchain where the channel resides
    pub chain_hash: Slice32,

    /// Coordinates of the funding output
    pub short_channel_id: ShortChannelId,

    /// UNIX timestamp of the update; used for replacement ordering
    pub timestamp: u32,

    /// Currently only the least-significant bit is defined:
    /// `must_be_one` (historically `option_channel_htlc_max`)
    pub message_flags: u8,

    /// Bit 0 is the direction this update refers to; bit 1 marks the channel
    /// as disabled
    pub channel_flags: u8,

    /// Number of blocks the forwarding node subtracts from the incoming HTLC
    /// expiry
    pub cltv_expiry_delta: u16,

    /// The minimum HTLC value the channel will forward, in millisatoshi
    pub htlc_minimum_msat: u64,

    /// Flat forwarding fee, in millisatoshi
    pub fee_base_msat: u32,

    /// Proportional forwarding fee, in millionths of the forwarded amount
    pub fee_proportional_millionths: u32,

    /// The maximum HTLC value the channel will forward, in millisatoshi
    pub htlc_maximum_msat: u64,
}

impl ChannelUpdate {
    /// Detects whether the update marks the channel direction as disabled
    #[inline]
    pub fn is_disabled(&self) -> bool {
        self.channel_flags & 0x02 == 0x02
    }

    /// Direction flag: `false` when the update comes from the node with the
    /// lexicographically lesser id
    #[inline]
    pub fn direction(&self) -> bool {
        self.channel_flags & 0x01 == 0x01
    }
}

#[cfg(test)]
mod test {
    use lightning_encoding::{LightningDecode, LightningEncode};
    use secp256k1::{Message, SecretKey, SECP256K1};

    use super::*;

    fn dumb_signature() -> Signature {
        let secret = SecretKey::from_slice(&[0x11; 32]).unwrap();
        SECP256K1.sign_ecdsa(&Message::from_slice(&[0x42; 32]).unwrap(), &secret)
    }

    #[test]
    fn channel_update_roundtrip() {
        let update = ChannelUpdate {
            signature: dumb_signature(),
            chain_hash: Slice32::default(),
            short_channel_id: ShortChannelId::new(700_000, 42, 1).unwrap(),
            timestamp: 1_640_995_200,
            message_flags: 1,
            channel_flags: 0,
            cltv_expiry_delta: 40,
            htlc_minimum_msat: 1000,
            fee_base_msat: 1000,
            fee_proportional_millionths: 100,
            htlc_maximum_msat: 990_000_000,
        };
        let encoded = update.lightning_serialize().unwrap();
        let decoded = ChannelUpdate::lightning_deserialize(&encoded).unwrap();
        assert_eq!(update, decoded);
        assert!(!decoded.is_disabled());
        assert!(!decoded.direction());
    }

    #[test]
    fn channel_flags_semantics() {
        let mut update = ChannelUpdate {
            signature: dumb_signature(),
            chain_hash: Slice32::default(),
            short_channel_id: ShortChannelId::new(700_000, 42, 1).unwrap(),
            timestamp: 0,
            message_flags: 1,
            channel_flags: 0x03,
            cltv_expiry_delta: 40,
            htlc_minimum_msat: 0,
            fee_base_msat: 0,
            fee_proportional_millionths: 0,
            htlc_maximum_msat: 0,
        };
        assert!(update.is_disabled());
        assert!(update.direction());
        update.channel_flags = 0x00;
        assert!(!update.is_disabled());
    }
}
