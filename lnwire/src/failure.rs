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

//! BOLT-4 onion failure codes and the unencrypted failure message layout.
//!
//! The failure message travelling back towards the payment origin is an
//! encrypted blob; this module defines its plaintext form. Encryption with
//! the per-hop shared secret happens at the onion processing seam.

use std::io;

use lightning_encoding::{LightningDecode, LightningEncode};

/// The failure was caused by an unparsable onion and is reported via
/// `update_fail_malformed_htlc`
pub const FAILURE_FLAG_BADONION: u16 = 0x8000;
/// The failure is permanent: retrying the same route can't succeed
pub const FAILURE_FLAG_PERM: u16 = 0x4000;
/// The failure concerns the whole node, not a specific channel
pub const FAILURE_FLAG_NODE: u16 = 0x2000;
/// The failure message carries a `channel_update` describing current policy
pub const FAILURE_FLAG_UPDATE: u16 = 0x1000;

/// Failure codes reported inside onion error messages.
///
/// The discriminants are the BOLT-4 wire values including their flag bits.
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
#[strict_encoding(by_value, repr = u16)]
#[repr(u16)]
#[non_exhaustive]
pub enum FailureCode {
    /// temporary node failure
    #[display("temporary_node_failure")]
    TemporaryNodeFailure = FAILURE_FLAG_NODE | 2,

    /// permanent node failure
    #[display("permanent_node_failure")]
    PermanentNodeFailure = FAILURE_FLAG_PERM | FAILURE_FLAG_NODE | 2,

    /// required node feature is missing
    #[display("required_node_feature_missing")]
    RequiredNodeFeatureMissing = FAILURE_FLAG_PERM | FAILURE_FLAG_NODE | 3,

    /// onion version is not understood
    #[display("invalid_onion_version")]
    InvalidOnionVersion = FAILURE_FLAG_BADONION | FAILURE_FLAG_PERM | 4,

    /// onion HMAC is incorrect
    #[display("invalid_onion_hmac")]
    InvalidOnionHmac = FAILURE_FLAG_BADONION | FAILURE_FLAG_PERM | 5,

    /// onion ephemeral key is unparsable
    #[display("invalid_onion_key")]
    InvalidOnionKey = FAILURE_FLAG_BADONION | FAILURE_FLAG_PERM | 6,

    /// the channel is unable to route the payment at the moment
    #[display("temporary_channel_failure")]
    TemporaryChannelFailure = FAILURE_FLAG_UPDATE | 7,

    /// the channel is disabled and can't route
    #[display("permanent_channel_failure")]
    PermanentChannelFailure = FAILURE_FLAG_PERM | 8,

    /// a required channel feature is missing
    #[display("required_channel_feature_missing")]
    RequiredChannelFeatureMissing = FAILURE_FLAG_PERM | 9,

    /// the next peer specified by the onion is not known
    #[display("unknown_next_peer")]
    UnknownNextPeer = FAILURE_FLAG_PERM | 10,

    /// the HTLC amount is below the outgoing channel minimum
    #[display("amount_below_minimum")]
    AmountBelowMinimum = FAILURE_FLAG_UPDATE | 11,

    /// the offered fee is below what the forwarding policy requires
    #[display("fee_insufficient")]
    FeeInsufficient = FAILURE_FLAG_UPDATE | 12,

    /// outgoing cltv value does not match the one from the onion
    #[display("incorrect_cltv_expiry")]
    IncorrectCltvExpiry = FAILURE_FLAG_UPDATE | 13,

    /// the HTLC expires too close to the current block height
    #[display("expiry_too_soon")]
    ExpiryTooSoon = FAILURE_FLAG_UPDATE | 14,

    /// payment details are incorrect or unknown to the final node
    #[display("incorrect_or_unknown_payment_details")]
    IncorrectOrUnknownPaymentDetails = FAILURE_FLAG_PERM | 15,

    /// the final node received an amount not matching the onion total
    #[display("final_incorrect_htlc_amount")]
    FinalIncorrectHtlcAmount = 19,

    /// the final node received a cltv expiry not matching the onion value
    #[display("final_incorrect_cltv_expiry")]
    FinalIncorrectCltvExpiry = 18,

    /// the channel has been closed or is closing
    #[display("channel_disabled")]
    ChannelDisabled = FAILURE_FLAG_UPDATE | 20,

    /// the HTLC expiry is too far in the future
    #[display("expiry_too_far")]
    ExpiryTooFar = 21,
}

impl FailureCode {
    /// Wire representation of the code with all flag bits
    #[inline]
    pub fn into_u16(self) -> u16 {
        self as u16
    }

    /// Detects whether the failure is permanent
    #[inline]
    pub fn is_perm(self) -> bool {
        self.into_u16() & FAILURE_FLAG_PERM != 0
    }

    /// Detects whether the failure reports an unparsable onion
    #[inline]
    pub fn is_badonion(self) -> bool {
        self.into_u16() & FAILURE_FLAG_BADONION != 0
    }

    /// Detects whether the failure message must carry a `channel_update`
    #[inline]
    pub fn has_update(self) -> bool {
        self.into_u16() & FAILURE_FLAG_UPDATE != 0
    }
}

/// Error indicating an unknown failure code on the wire
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Error,
)]
#[display("unknown onion failure code {0:#06x}")]
pub struct UnknownFailureCodeError(pub u16);

impl TryFrom<u16> for FailureCode {
    type Error = UnknownFailureCodeError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        use FailureCode::*;
        let all = [
            TemporaryNodeFailure,
            PermanentNodeFailure,
            RequiredNodeFeatureMissing,
            InvalidOnionVersion,
            InvalidOnionHmac,
            InvalidOnionKey,
            TemporaryChannelFailure,
            PermanentChannelFailure,
            RequiredChannelFeatureMissing,
            UnknownNextPeer,
            AmountBelowMinimum,
            FeeInsufficient,
            IncorrectCltvExpiry,
            ExpiryTooSoon,
            IncorrectOrUnknownPaymentDetails,
            FinalIncorrectHtlcAmount,
            FinalIncorrectCltvExpiry,
            ChannelDisabled,
            ExpiryTooFar,
        ];
        all.into_iter()
            .find(|known| known.into_u16() == code)
            .ok_or(UnknownFailureCodeError(code))
    }
}

/// Plaintext onion failure message: failure code plus code-specific data.
///
/// When relayed over `update_fail_htlc` the message is wrapped with the
/// shared secrets of every traversed hop; this structure is what the origin
/// recovers after unwrapping.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[display("failure({code})")]
pub struct FailureMessage {
    /// The failure code
    pub code: FailureCode,

    /// Code-specific payload: `channel_update` for UPDATE codes, expiry or
    /// amount values for the final-hop codes
    pub data: Vec<u8>,
}

impl FailureMessage {
    /// Constructs failure message without code-specific data
    #[inline]
    pub fn with(code: FailureCode) -> FailureMessage {
        FailureMessage { code, data: vec![] }
    }
}

impl LightningEncode for FailureMessage {
    fn lightning_encode<E: io::Write>(
        &self,
        mut e: E,
    ) -> Result<usize, lightning_encoding::Error> {
        self.code.into_u16().lightning_encode(&mut e)?;
        (self.data.len() as u16).lightning_encode(&mut e)?;
        e.write_all(&self.data)?;
        Ok(4 + self.data.len())
    }
}

impl LightningDecode for FailureMessage {
    fn lightning_decode<D: io::Read>(
        mut d: D,
    ) -> Result<Self, lightning_encoding::Error> {
        let code = u16::lightning_decode(&mut d)?;
        let code = FailureCode::try_from(code).map_err(|err| {
            lightning_encoding::Error::DataIntegrityError(err.to_string())
        })?;
        let len = u16::lightning_decode(&mut d)? as usize;
        let mut data = vec![0u8; len];
        d.read_exact(&mut data)?;
        Ok(FailureMessage { code, data })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn failure_code_flags() {
        assert!(FailureCode::PermanentNodeFailure.is_perm());
        assert!(!FailureCode::TemporaryChannelFailure.is_perm());
        assert!(FailureCode::TemporaryChannelFailure.has_update());
        assert!(FailureCode::InvalidOnionHmac.is_badonion());
        assert_eq!(FailureCode::UnknownNextPeer.into_u16(), 0x400a);
        assert_eq!(FailureCode::FeeInsufficient.into_u16(), 0x100c);
    }

    #[test]
    fn failure_code_u16_roundtrip() {
        for code in [
            FailureCode::TemporaryChannelFailure,
            FailureCode::UnknownNextPeer,
            FailureCode::FeeInsufficient,
            FailureCode::IncorrectCltvExpiry,
            FailureCode::IncorrectOrUnknownPaymentDetails,
        ] {
            assert_eq!(FailureCode::try_from(code.into_u16()), Ok(code));
        }
        assert_eq!(
            FailureCode::try_from(0x0001),
            Err(UnknownFailureCodeError(0x0001))
        );
    }

    #[test]
    fn failure_message_roundtrip() {
        let message = FailureMessage {
            code: FailureCode::FeeInsufficient,
            data: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let encoded = message.lightning_serialize().unwrap();
        assert_eq!(encoded.len(), 8);
        assert_eq!(
            FailureMessage::lightning_deserialize(&encoded).unwrap(),
            message
        );
    }
}
