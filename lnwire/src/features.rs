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

//! BOLT-9 feature vectors: known features are kept as a typed set, unknown
//! bits are carried verbatim so that "required but unknown" detection and
//! vector comparison remain pure functions of the raw bits.

use std::collections::BTreeSet;
use std::io;
use std::ops::BitOr;

use amplify::flags::FlagVec;
use lightning_encoding::{LightningDecode, LightningEncode};

/// Contexts in which a feature bit may be communicated, per BOLT-9
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display,
)]
#[display(Debug)]
pub enum FeatureContext {
    /// `init` message
    Init,
    /// `node_announcement` message
    NodeAnnouncement,
    /// `channel_announcement` message
    ChannelAnnouncement,
    /// BOLT-11 invoice feature field
    Invoice,
}

/// Features known to this implementation.
///
/// The discriminant is the *even* ("required") bit of the feature pair; the
/// matching optional bit is the discriminant plus one.
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
pub enum Feature {
    /// `option_data_loss_protect`: requires or supports extra
    /// `channel_reestablish` fields
    #[display("option_data_loss_protect")]
    OptionDataLossProtect = 0,

    /// `option_upfront_shutdown_script`: commits to a shutdown scriptpubkey
    /// when opening a channel
    #[display("option_upfront_shutdown_script")]
    OptionUpfrontShutdownScript = 4,

    /// `gossip_queries`: more sophisticated gossip control
    #[display("gossip_queries")]
    GossipQueries = 6,

    /// `var_onion_optin`: requires/supports variable-length routing onion
    /// payloads
    #[display("var_onion_optin")]
    VarOnionOptin = 8,

    /// `gossip_queries_ex`: gossip queries can include additional information
    #[display("gossip_queries_ex")]
    GossipQueriesEx = 10,

    /// `option_static_remotekey`: static key for the remote output
    #[display("option_static_remotekey")]
    OptionStaticRemotekey = 12,

    /// `payment_secret`: node supports `payment_secret` field
    #[display("payment_secret")]
    PaymentSecret = 14,

    /// `basic_mpp`: node can receive basic multi-part payments
    #[display("basic_mpp")]
    BasicMpp = 16,

    /// `option_support_large_channel`: can create large ("wumbo") channels
    #[display("option_support_large_channel")]
    OptionSupportLargeChannel = 18,
}

impl Feature {
    /// All features known to the implementation, in bit order
    pub fn all() -> &'static [Feature] {
        &[
            Feature::OptionDataLossProtect,
            Feature::OptionUpfrontShutdownScript,
            Feature::GossipQueries,
            Feature::VarOnionOptin,
            Feature::GossipQueriesEx,
            Feature::OptionStaticRemotekey,
            Feature::PaymentSecret,
            Feature::BasicMpp,
            Feature::OptionSupportLargeChannel,
        ]
    }

    /// Bit signalling that the feature is required
    #[inline]
    pub fn required_bit(self) -> u16 {
        self as u16
    }

    /// Bit signalling that the feature is supported, but not required
    #[inline]
    pub fn optional_bit(self) -> u16 {
        self as u16 + 1
    }

    fn from_required_bit(bit: u16) -> Option<Feature> {
        Feature::all()
            .iter()
            .find(|feature| feature.required_bit() == bit)
            .copied()
    }
}

/// Error indicating that a peer requires a feature bit unknown to this
/// implementation
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display, Error,
)]
#[display(
    "remote peer requires feature with unknown even bit {0}; the connection \
     can't be served"
)]
pub struct UnknownFeatureError(pub u16);

/// Feature vector as communicated in `init`, `node_announcement` or invoice
/// feature fields.
///
/// Known features are split into required/optional typed sets; every bit not
/// recognized by the implementation is preserved in the raw [`FlagVec`] so
/// re-serialization is loss-less.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
#[derive(StrictEncode, StrictDecode)]
pub struct InitFeatures {
    /// Features the originator requires from its peer
    required: BTreeSet<Feature>,

    /// Features the originator supports but does not insist on
    optional: BTreeSet<Feature>,

    /// Bits not known to this implementation, kept verbatim
    unknown: FlagVec,
}

impl InitFeatures {
    /// Constructs an empty feature vector (no bits set)
    #[inline]
    pub fn new() -> InitFeatures {
        InitFeatures::default()
    }

    /// Marks the feature as supported, but not required
    pub fn set_optional(&mut self, feature: Feature) -> &mut Self {
        self.optional.insert(feature);
        self
    }

    /// Marks the feature as required from the remote peer
    pub fn set_required(&mut self, feature: Feature) -> &mut Self {
        self.required.insert(feature);
        self
    }

    /// Detects whether the feature is either required or optional in this
    /// vector
    pub fn supports(&self, feature: Feature) -> bool {
        self.required.contains(&feature) || self.optional.contains(&feature)
    }

    /// Detects whether the feature is required in this vector
    #[inline]
    pub fn requires(&self, feature: Feature) -> bool {
        self.required.contains(&feature)
    }

    /// Returns the lowest *even* unknown bit which the originator of this
    /// vector requires, if any.
    ///
    /// By BOLT-9 a node receiving a feature vector with an unknown even bit
    /// must fail the connection (or channel, or payment — depending on the
    /// context).
    pub fn requires_unknown_bits(&self) -> Result<(), UnknownFeatureError> {
        match self.unknown.iter().find(|bit| bit % 2 == 0) {
            Some(bit) => Err(UnknownFeatureError(bit)),
            None => Ok(()),
        }
    }

    /// Converts the feature vector into the raw flag representation used on
    /// the wire
    pub fn to_flag_vec(&self) -> FlagVec {
        let mut flags = self.unknown.clone();
        for feature in &self.required {
            flags.set(feature.required_bit());
        }
        for feature in &self.optional {
            flags.set(feature.optional_bit());
        }
        flags
    }

    /// Reconstructs the feature vector from raw wire flags
    pub fn from_flag_vec(flags: FlagVec) -> InitFeatures {
        let mut features = InitFeatures::new();
        let mut unknown = FlagVec::new();
        for bit in flags.iter() {
            let required_bit = bit & !1;
            match Feature::from_required_bit(required_bit) {
                Some(feature) if bit & 1 == 0 => {
                    features.required.insert(feature);
                }
                Some(feature) => {
                    features.optional.insert(feature);
                }
                None => {
                    unknown.set(bit);
                }
            }
        }
        unknown.shrink();
        features.unknown = unknown;
        features
    }
}

impl BitOr for InitFeatures {
    type Output = InitFeatures;

    fn bitor(self, rhs: InitFeatures) -> Self::Output {
        let mut flags = self.to_flag_vec();
        for bit in rhs.to_flag_vec().iter() {
            flags.set(bit);
        }
        InitFeatures::from_flag_vec(flags)
    }
}

impl std::fmt::Display for InitFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for feature in &self.required {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{}!", feature)?;
            first = false;
        }
        for feature in &self.optional {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{}", feature)?;
            first = false;
        }
        for bit in self.unknown.iter() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "unknown({})", bit)?;
            first = false;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

impl LightningEncode for InitFeatures {
    fn lightning_encode<E: io::Write>(
        &self,
        mut e: E,
    ) -> Result<usize, lightning_encoding::Error> {
        // BOLT-9 writes feature bytes big-endian: the highest bit lives in
        // the first byte.
        let flags = self.to_flag_vec();
        let mut bytes = flags.as_inner().to_vec();
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        bytes.reverse();
        (bytes.len() as u16).lightning_encode(&mut e)?;
        e.write_all(&bytes)?;
        Ok(bytes.len() + 2)
    }
}

impl LightningDecode for InitFeatures {
    fn lightning_decode<D: io::Read>(
        mut d: D,
    ) -> Result<Self, lightning_encoding::Error> {
        let len = u16::lightning_decode(&mut d)? as usize;
        let mut bytes = vec![0u8; len];
        d.read_exact(&mut bytes)?;
        bytes.reverse();
        let flags = FlagVec::from_inner(bytes);
        Ok(InitFeatures::from_flag_vec(flags))
    }
}

#[cfg(test)]
mod test {
    use amplify::hex::FromHex;

    use super::*;

    #[test]
    fn empty_features_encoding() {
        let features = InitFeatures::default();
        assert_eq!(
            features.lightning_serialize().unwrap(),
            Vec::<u8>::from_hex("0000").unwrap()
        );
        assert_eq!(
            InitFeatures::lightning_deserialize(&[0x00, 0x00]).unwrap(),
            features
        );
    }

    #[test]
    fn known_feature_roundtrip() {
        let mut features = InitFeatures::new();
        features
            .set_optional(Feature::OptionStaticRemotekey)
            .set_required(Feature::VarOnionOptin);
        let encoded = features.lightning_serialize().unwrap();
        let decoded = InitFeatures::lightning_deserialize(&encoded).unwrap();
        assert_eq!(decoded, features);
        assert!(decoded.supports(Feature::OptionStaticRemotekey));
        assert!(!decoded.requires(Feature::OptionStaticRemotekey));
        assert!(decoded.requires(Feature::VarOnionOptin));
        assert!(decoded.requires_unknown_bits().is_ok());
    }

    #[test]
    fn unknown_required_bit_detected() {
        // Bit 100 is unknown; the even position means "required"
        let mut flags = FlagVec::new();
        flags.set(100);
        let features = InitFeatures::from_flag_vec(flags);
        assert_eq!(
            features.requires_unknown_bits(),
            Err(UnknownFeatureError(100))
        );

        // The odd companion bit is merely optional and must pass
        let mut flags = FlagVec::new();
        flags.set(101);
        let features = InitFeatures::from_flag_vec(flags);
        assert!(features.requires_unknown_bits().is_ok());
    }

    #[test]
    fn merge_preserves_bits() {
        let mut lhs = InitFeatures::new();
        lhs.set_optional(Feature::GossipQueries);
        let mut rhs = InitFeatures::new();
        rhs.set_required(Feature::OptionDataLossProtect);
        let merged = lhs | rhs;
        assert!(merged.supports(Feature::GossipQueries));
        assert!(merged.requires(Feature::OptionDataLossProtect));
    }
}
