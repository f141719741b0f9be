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

use bitcoin_scripts::hlc::HashLock;
use strict_encoding::{
    strict_deserialize, strict_serialize, StrictDecode, StrictEncode,
};

use super::{BoltChannel, ChannelState, Error};
use crate::channel::bip69::Bip69;
use crate::channel::bolt::Htlc;
use crate::channel::{self, Channel, ChannelExtension};

/// Nomenclature of the BOLT channel extension pipeline
#[derive(
    Clone,
    Copy,
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
#[display(Debug)]
#[repr(u16)]
pub enum BoltExt {
    /// The channel itself
    Channel = 0,

    /// Main channel constructor
    Bolt3 = 1,

    /// HTLC payments
    Htlc = 2,

    /// Deterministic transaction ordering
    Bip69 = 1000,
}

impl Default for BoltExt {
    fn default() -> Self {
        BoltExt::Channel
    }
}

impl From<BoltExt> for u16 {
    fn from(id: BoltExt) -> Self {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(
            &strict_serialize(&id)
                .expect("Enum in-memory strict encoding can't fail"),
        );
        u16::from_be_bytes(buf)
    }
}

impl TryFrom<u16> for BoltExt {
    type Error = strict_encoding::Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        strict_deserialize(value.to_be_bytes())
    }
}

impl channel::Nomenclature for BoltExt {
    type State = ChannelState;
    type Error = Error;
    type Constructor = BoltChannel;
    type PeerMessage = lnwire::Messages;
    type UpdateMessage = UpdateMsg;

    #[inline]
    fn default_extenders() -> Vec<Box<dyn ChannelExtension<Self>>> {
        vec![Htlc::new()]
    }

    #[inline]
    fn default_modifiers() -> Vec<Box<dyn ChannelExtension<Self>>> {
        vec![Bip69::new()]
    }

    fn update_from_peer(
        _channel: &mut Channel<Self>,
        _message: &lnwire::Messages,
    ) -> Result<(), Error> {
        // No dynamic extension management: anchor channel types are not
        // served by this implementation and get rejected at policy level.
        Ok(())
    }
}

/// Transaction roles inside the channel transaction graph
#[derive(
    Clone,
    Copy,
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
#[display(Debug)]
#[non_exhaustive]
pub enum TxType {
    HtlcSuccess,
    HtlcTimeout,
    Unknown(u16),
}

impl From<TxType> for u16 {
    fn from(ty: TxType) -> Self {
        match ty {
            TxType::HtlcSuccess => 0x0,
            TxType::HtlcTimeout => 0x1,
            TxType::Unknown(x) => x,
        }
    }
}

impl From<u16> for TxType {
    fn from(ty: u16) -> Self {
        match ty {
            0x00 => TxType::HtlcSuccess,
            0x01 => TxType::HtlcTimeout,
            x => TxType::Unknown(x),
        }
    }
}

impl channel::TxRole for TxType {}

/// Channel lifecycle: states of the channel state machine
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[derive(
    Clone,
    Copy,
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
#[non_exhaustive]
#[repr(u8)]
pub enum Lifecycle {
    /// Channel is initialized, communications with the remote peer has not
    /// started yet
    #[display("INIT")]
    Initial,

    /// Sent or received `open_channel`
    #[display("PROPOSED")]
    Proposed,

    /// Sent or received `accept_channel`
    #[display("ACCEPTED")]
    Accepted,

    /// Local party signed funding tx
    #[display("FUNDING")]
    Funding,

    /// Other peer signed funding tx
    #[display("SIGNED")]
    Signed,

    /// Funding tx is published but not mined
    #[display("FUNDED")]
    Funded,

    /// Funding tx mining confirmed by one peer
    #[display("LOCKED")]
    Locked,

    /// Both peers confirmed lock, channel active
    #[display("ACTIVE")]
    Active,

    /// Reestablishing connectivity
    #[display("REESTABLISHING")]
    Reestablishing,

    /// Shutdown proposed but not yet accepted
    #[display("SHUTDOWN")]
    Shutdown,

    /// Shutdown agreed, exchanging `closing_signed`
    #[display("CLOSING-{round}")]
    Closing { round: usize },

    /// Non-cooperative unilateral closing initialized from the self
    #[display("ABORTING")]
    Aborting,

    /// Reacting to an uncooperative channel close from remote
    #[display("PENALIZE")]
    Penalize,

    /// Channel non-operational and closed
    #[display("CLOSED")]
    Closed,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::Initial
    }
}

/// Direction of an HTLC relative to the owner of the commitment transaction
/// it appears in
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
pub enum HtlcDirection {
    /// HTLC offered by the commitment owner (outgoing payment)
    #[display("offered")]
    Offered,

    /// HTLC received by the commitment owner (incoming payment)
    #[display("received")]
    Received,
}

impl HtlcDirection {
    /// Opposite direction, used when re-interpreting a commitment from the
    /// other party's point of view
    pub fn swapped(self) -> HtlcDirection {
        match self {
            HtlcDirection::Offered => HtlcDirection::Received,
            HtlcDirection::Received => HtlcDirection::Offered,
        }
    }
}

/// HTLC staged for inclusion into a specific commitment transaction
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    StrictEncode,
    StrictDecode,
)]
pub struct StagedHtlc {
    /// Id assigned by the offering party
    pub id: u64,
    /// Direction relative to the owner of the staged commitment
    pub direction: HtlcDirection,
    /// HTLC amount in millisatoshi
    pub amount_msat: u64,
    /// Hash lock of the HTLC
    pub payment_hash: HashLock,
    /// Absolute CLTV expiry
    pub cltv_expiry: u32,
}

/// Fully computed view of one commitment transaction, produced by the
/// channel core from the update log and consumed by the construction
/// pipeline.
///
/// All amounts are from the point of view of the commitment owner (the
/// party which can broadcast it): `to_local` pays the owner.
#[derive(Clone, PartialEq, Eq, Debug, StrictEncode, StrictDecode)]
pub struct CommitmentView {
    /// Whether the view belongs to the remote node's commitment
    pub as_remote_node: bool,
    /// Commitment number
    pub height: u64,
    /// Owner balance before fee deduction, in millisatoshi
    pub to_local_msat: u64,
    /// Counterparty balance before fee deduction, in millisatoshi
    pub to_remote_msat: u64,
    /// Fee rate this commitment pays
    pub feerate_per_kw: u32,
    /// Per-commitment point of the commitment owner at this height
    pub per_commitment_point: secp256k1::PublicKey,
    /// HTLCs included at this height
    pub htlcs: Vec<StagedHtlc>,
}

/// Local updates channelled through the extension pipeline
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum UpdateMsg {
    /// Stage a commitment view for rendering by `build_graph`
    Stage(CommitmentView),
}
