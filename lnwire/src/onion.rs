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

//! BOLT-4 payment data as they are decrypted from the Sphinx onion packet.

use std::io;

use amplify::{Slice32, Wrapper};
use internet2::presentation::sphinx::SphinxPayload;
use internet2::tlv;
use lightning_encoding::{BigSize, LightningDecode, LightningEncode};

use crate::ShortChannelId;

/// Payment secret (a.k.a. payment address) binding the payment to the
/// invoice; prevents probing by intermediate nodes.
#[derive(
    Copy,
    Clone,
    Ord,
    PartialOrd,
    Eq,
    PartialEq,
    Hash,
    Debug,
    LightningEncode,
    LightningDecode,
    NetworkEncode,
    NetworkDecode,
)]
pub struct PaymentData {
    /// The `payment_secret` (`s` field) of the invoice being paid
    pub payment_secret: Slice32,

    /// Total amount of the (possibly multi-part) payment, in millisatoshi
    pub total_msat: u64,
}

/// Position-dependent part of the per-hop payload.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
#[derive(NetworkEncode, NetworkDecode)]
pub enum HopRealm {
    /// Fixed-size legacy (realm 0) payload of an intermediary hop
    Legacy(ShortChannelId),

    /// TLV payload of an intermediary hop carrying the outgoing channel
    TlvIntermediary(ShortChannelId),

    /// TLV payload of the final hop, optionally carrying the payment secret
    TlvReceiver(Option<PaymentData>),
}

/// Per-hop instructions decrypted from one onion layer.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
#[derive(NetworkEncode, NetworkDecode)]
pub struct PaymentOnion {
    pub realm: HopRealm,
    pub amt_to_forward: u64,
    pub outgoing_cltv_value: u32,
}

impl PaymentOnion {
    /// Constructs TLV payload for an intermediary hop
    pub fn intermediary(
        short_channel_id: ShortChannelId,
        amt_to_forward: u64,
        outgoing_cltv_value: u32,
    ) -> PaymentOnion {
        PaymentOnion {
            realm: HopRealm::TlvIntermediary(short_channel_id),
            amt_to_forward,
            outgoing_cltv_value,
        }
    }

    /// Constructs TLV payload for the final hop
    pub fn receiver(
        payment_data: Option<PaymentData>,
        amount_msat: u64,
        cltv_expiry: u32,
    ) -> PaymentOnion {
        PaymentOnion {
            realm: HopRealm::TlvReceiver(payment_data),
            amt_to_forward: amount_msat,
            outgoing_cltv_value: cltv_expiry,
        }
    }

    /// Returns the outgoing channel for an intermediary hop, `None` for the
    /// final one
    pub fn outgoing_channel(&self) -> Option<ShortChannelId> {
        match self.realm {
            HopRealm::Legacy(short_channel_id)
            | HopRealm::TlvIntermediary(short_channel_id) => {
                Some(short_channel_id)
            }
            HopRealm::TlvReceiver(_) => None,
        }
    }

    /// Detects whether this payload terminates the route
    #[inline]
    pub fn is_final(&self) -> bool {
        matches!(self.realm, HopRealm::TlvReceiver(_))
    }
}

// For internal use to simplify TLV encoding/decoding implementation
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
#[derive(LightningEncode, LightningDecode)]
#[lightning_encoding(use_tlv)]
struct TlvPayment {
    #[lightning_encoding(tlv = 2)]
    amt_to_forward: Option<u64>,

    #[lightning_encoding(tlv = 4)]
    outgoing_cltv_value: Option<u32>,

    #[lightning_encoding(tlv = 6)]
    short_channel_id: Option<ShortChannelId>,

    #[lightning_encoding(tlv = 8)]
    payment_data: Option<PaymentData>,

    #[lightning_encoding(unknown_tlvs)]
    unknown: tlv::Stream,
}

impl LightningEncode for PaymentOnion {
    fn lightning_encode<E: io::Write>(
        &self,
        mut e: E,
    ) -> Result<usize, lightning_encoding::Error> {
        let tlv = match self.realm {
            HopRealm::Legacy(short_channel_id) => {
                0u8.lightning_encode(&mut e)?;
                short_channel_id.lightning_encode(&mut e)?;
                self.amt_to_forward.lightning_encode(&mut e)?;
                self.outgoing_cltv_value.lightning_encode(&mut e)?;
                e.write_all(&[0u8; 12])?;
                return Ok(33);
            }
            HopRealm::TlvIntermediary(short_channel_id) => TlvPayment {
                amt_to_forward: Some(self.amt_to_forward),
                outgoing_cltv_value: Some(self.outgoing_cltv_value),
                short_channel_id: Some(short_channel_id),
                payment_data: None,
                unknown: none!(),
            },
            HopRealm::TlvReceiver(payment_data) => TlvPayment {
                amt_to_forward: Some(self.amt_to_forward),
                outgoing_cltv_value: Some(self.outgoing_cltv_value),
                short_channel_id: None,
                payment_data,
                unknown: none!(),
            },
        };
        let stream = tlv.lightning_serialize()?;
        BigSize::from(stream.len()).lightning_encode(&mut e)?;
        e.write_all(&stream)?;
        Ok(stream.len())
    }
}

impl LightningDecode for PaymentOnion {
    fn lightning_decode<D: io::Read>(
        mut d: D,
    ) -> Result<Self, lightning_encoding::Error> {
        let len = BigSize::lightning_decode(&mut d)?;
        match len.into_inner() {
            0 => {
                let onion = PaymentOnion {
                    realm: HopRealm::Legacy(ShortChannelId::lightning_decode(
                        &mut d,
                    )?),
                    amt_to_forward: LightningDecode::lightning_decode(&mut d)?,
                    outgoing_cltv_value: LightningDecode::lightning_decode(
                        &mut d,
                    )?,
                };
                let mut padding = [0u8; 12];
                d.read_exact(&mut padding)?;
                Ok(onion)
            }
            // A single 0x01 byte for length is reserved for future use to
            // signal a different payload format. This is safe since no TLV
            // value can ever be shorter than 2 bytes.
            1 => Err(lightning_encoding::Error::DataIntegrityError(s!(
                "payment onion with reserved realm=0x01"
            ))),
            len => {
                let tlv = TlvPayment::lightning_decode(d.take(len))?;
                match (
                    tlv.amt_to_forward,
                    tlv.outgoing_cltv_value,
                    tlv.short_channel_id,
                    tlv.payment_data,
                ) {
                    (None, _, _, _) => {
                        Err(lightning_encoding::Error::DataIntegrityError(s!(
                            "payment onion must contain amt_to_forward"
                        )))
                    }
                    (_, None, _, _) => {
                        Err(lightning_encoding::Error::DataIntegrityError(s!(
                            "payment onion must contain outgoing_cltv_value"
                        )))
                    }
                    (Some(_), Some(_), Some(_), Some(_)) => {
                        Err(lightning_encoding::Error::DataIntegrityError(s!(
                            "payment onion must not contain both \
                             short_channel_id and payment_data"
                        )))
                    }
                    (
                        Some(amt_to_forward),
                        Some(outgoing_cltv_value),
                        Some(short_channel_id),
                        None,
                    ) => Ok(PaymentOnion {
                        realm: HopRealm::TlvIntermediary(short_channel_id),
                        amt_to_forward,
                        outgoing_cltv_value,
                    }),
                    (
                        Some(amt_to_forward),
                        Some(outgoing_cltv_value),
                        None,
                        payment_data,
                    ) => Ok(PaymentOnion {
                        realm: HopRealm::TlvReceiver(payment_data),
                        amt_to_forward,
                        outgoing_cltv_value,
                    }),
                }
            }
        }
    }
}

impl SphinxPayload for PaymentOnion {
    type DecodeError = lightning_encoding::Error;

    fn serialized_len(&self) -> usize {
        match self.realm {
            HopRealm::Legacy(_) => 33,
            HopRealm::TlvIntermediary(_) => 27,
            HopRealm::TlvReceiver(None) => 27 - 10,
            HopRealm::TlvReceiver(Some(_)) => 27 + 32 + 10,
        }
    }

    #[inline]
    fn encode(&self, writer: impl io::Write) -> Result<usize, io::Error> {
        self.lightning_encode(writer).map_err(|err| match err {
            lightning_encoding::Error::Io(err) => err.into(),
            _ => unreachable!(),
        })
    }

    #[inline]
    fn decode(reader: impl io::Read) -> Result<Self, Self::DecodeError>
    where
        Self: Sized,
    {
        PaymentOnion::lightning_decode(reader)
    }
}

#[cfg(test)]
mod test {
    use amplify::Wrapper;

    use super::*;

    #[test]
    fn intermediary_payload_roundtrip() {
        let onion = PaymentOnion::intermediary(
            ShortChannelId::new(600_000, 12, 1).unwrap(),
            10_000_000,
            760_040,
        );
        let encoded = onion.lightning_serialize().unwrap();
        let decoded = PaymentOnion::lightning_deserialize(&encoded).unwrap();
        assert_eq!(onion, decoded);
        assert_eq!(
            decoded.outgoing_channel(),
            ShortChannelId::new(600_000, 12, 1)
        );
        assert!(!decoded.is_final());
    }

    #[test]
    fn receiver_payload_roundtrip() {
        let onion = PaymentOnion::receiver(
            Some(PaymentData {
                payment_secret: Slice32::from_inner([0xee; 32]),
                total_msat: 10_000_000,
            }),
            10_000_000,
            760_000,
        );
        let encoded = onion.lightning_serialize().unwrap();
        let decoded = PaymentOnion::lightning_deserialize(&encoded).unwrap();
        assert_eq!(onion, decoded);
        assert!(decoded.is_final());
        assert_eq!(decoded.outgoing_channel(), None);
    }

    #[test]
    fn legacy_payload_is_fixed_size() {
        let onion = PaymentOnion {
            realm: HopRealm::Legacy(
                ShortChannelId::new(600_000, 12, 1).unwrap(),
            ),
            amt_to_forward: 42,
            outgoing_cltv_value: 100,
        };
        let encoded = onion.lightning_serialize().unwrap();
        assert_eq!(encoded.len(), 33);
        let decoded = PaymentOnion::lightning_deserialize(&encoded).unwrap();
        assert_eq!(onion, decoded);
    }
}
