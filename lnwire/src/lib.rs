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

//! BOLT-defined peer wire messages consumed by the node core: channel
//! establishment and operation (BOLT-2), keepalive and diagnostics (BOLT-1),
//! onion per-hop payloads and failure codes (BOLT-4), local gossip surface
//! (BOLT-7) and feature vectors (BOLT-9).
//!
//! The underlying noise-authenticated transport is not part of this crate;
//! messages are encoded bit-exact per BOLT specifications with
//! [`lightning_encoding`].

// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate internet2;
#[macro_use]
extern crate lightning_encoding;
#[macro_use]
extern crate strict_encoding;
#[macro_use]
extern crate lazy_static;

#[cfg(feature = "serde")]
#[macro_use]
extern crate serde_with;
#[cfg(feature = "serde")]
extern crate serde_crate as serde;

macro_rules! dumb_pubkey {
    () => {
        secp256k1::PublicKey::from_secret_key(
            secp256k1::SECP256K1,
            &secp256k1::ONE_KEY,
        )
    };
}

mod channel;
mod failure;
mod features;
mod gossip;
mod htlc;
mod onion;
mod peer;
mod types;

use std::io;

pub use channel::*;
pub use failure::*;
pub use features::{
    Feature, FeatureContext, InitFeatures, UnknownFeatureError,
};
pub use gossip::*;
pub use htlc::*;
use internet2::{CreateUnmarshaller, Payload, Unmarshall, Unmarshaller};
use lightning_encoding::{LightningDecode, LightningEncode};
pub use onion::*;
pub use peer::*;
pub use types::*;

/// Default port for the Lightning network peer connections
pub const LNWIRE_PORT: u16 = 9735;

lazy_static! {
    pub static ref LNWIRE_UNMARSHALLER: Unmarshaller<Messages> =
        Messages::create_unmarshaller();
}

/// All peer wire messages known to — and processed by — the node core.
///
/// The set covers channel establishment, normal channel operation,
/// re-establishment, shutdown and the local gossip surface. Unknown odd-typed
/// messages are ignored at the transport level and never reach this enum.
#[derive(Clone, Debug, Display, Api)]
#[derive(NetworkEncode, NetworkDecode)]
#[api(encoding = "lightning")]
#[non_exhaustive]
#[display(inner)]
#[allow(clippy::large_enum_variant)]
pub enum Messages {
    // Part I: Generic messages outside of channel operations (BOLT-1)
    // ===============================================================
    /// Once authentication is complete, the first message reveals the features
    /// supported or required by this node, even if this is a reconnection.
    #[api(type = 16)]
    Init(Init),

    /// For simplicity of diagnosis, it's often useful to tell a peer that
    /// something is incorrect.
    #[api(type = 17)]
    Error(Error),

    /// In order to allow for the existence of long-lived TCP connections, at
    /// times it may be required that both ends keep alive the TCP connection
    /// at the application level.
    #[api(type = 18)]
    Ping(Ping),

    /// The pong message is to be sent whenever a ping message is received. It
    /// serves as a reply and also serves to keep the connection alive, while
    /// explicitly notifying the other end that the receiver is still active.
    #[api(type = 19)]
    Pong(Pong),

    // Part II: Channel establishment and close (BOLT-2)
    // =================================================
    /// This message contains information about a node and indicates its desire
    /// to set up a new channel. This is the first step toward creating the
    /// funding transaction and both versions of the commitment transaction.
    #[api(type = 32)]
    OpenChannel(OpenChannel),

    /// This message contains information about a node and indicates its
    /// acceptance of the new channel.
    #[api(type = 33)]
    AcceptChannel(AcceptChannel),

    /// This message describes the outpoint which the funder has created for
    /// the initial commitment transactions. After receiving the peer's
    /// signature, via `funding_signed`, it will broadcast the funding
    /// transaction.
    #[api(type = 34)]
    FundingCreated(FundingCreated),

    /// This message gives the funder the signature it needs for the first
    /// commitment transaction, so it can broadcast the transaction knowing
    /// that funds can be redeemed, if need be.
    #[api(type = 35)]
    FundingSigned(FundingSigned),

    /// This message indicates that the funding transaction has reached the
    /// `minimum_depth` asked for in `accept_channel`. Once both nodes have
    /// sent this, the channel enters normal operating mode.
    #[api(type = 36)]
    FundingLocked(FundingLocked),

    #[api(type = 38)]
    Shutdown(Shutdown),

    #[api(type = 39)]
    ClosingSigned(ClosingSigned),

    // Part III: Channel operation (BOLT-2)
    // ====================================
    #[api(type = 128)]
    UpdateAddHtlc(UpdateAddHtlc),

    #[api(type = 130)]
    UpdateFulfillHtlc(UpdateFulfillHtlc),

    #[api(type = 131)]
    UpdateFailHtlc(UpdateFailHtlc),

    #[api(type = 135)]
    UpdateFailMalformedHtlc(UpdateFailMalformedHtlc),

    #[api(type = 132)]
    CommitmentSigned(CommitmentSigned),

    #[api(type = 133)]
    RevokeAndAck(RevokeAndAck),

    #[api(type = 134)]
    UpdateFee(UpdateFee),

    #[api(type = 136)]
    ChannelReestablish(ChannelReestablish),

    // Part IV: Local gossip surface (BOLT-7)
    // ======================================
    /// This is a direct message between the two endpoints of a channel and
    /// serves as an opt-in mechanism to allow the announcement of the channel
    /// to the rest of the network.
    #[api(type = 259)]
    AnnouncementSignatures(AnnouncementSignatures),

    /// This gossip message allows a node to indicate extra data associated
    /// with it, in addition to its public key.
    #[api(type = 257)]
    NodeAnnouncement(NodeAnnouncement),

    /// After a channel has been initially announced, each side independently
    /// announces the fees and minimum expiry delta it requires to relay HTLCs
    /// through this channel.
    #[api(type = 258)]
    ChannelUpdate(ChannelUpdate),
}

impl LightningEncode for Messages {
    fn lightning_encode<E: io::Write>(
        &self,
        e: E,
    ) -> Result<usize, lightning_encoding::Error> {
        Payload::from(self.clone()).lightning_encode(e)
    }
}

impl LightningDecode for Messages {
    fn lightning_decode<D: io::Read>(
        d: D,
    ) -> Result<Self, lightning_encoding::Error> {
        let message = &*LNWIRE_UNMARSHALLER.unmarshall(d).map_err(|err| {
            lightning_encoding::Error::DataIntegrityError(format!(
                "can't unmarshall peer wire message. Details: {}",
                err
            ))
        })?;
        Ok(message.clone())
    }
}
