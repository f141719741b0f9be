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

//! Lightning network node core.
//!
//! The library implements the two tightly-coupled subsystems at the heart
//! of a Lightning node:
//!
//! - the channel lifecycle and commitment state machine — opening,
//!   updating and closing bidirectional payment channels with revocable
//!   commitments and penalty-based breach remedies;
//! - the HTLC switch and forwarding engine — cross-channel routing of
//!   hash-time-locked contracts with persistent payment circuits,
//!   link-level scheduling and on-chain contract resolution.
//!
//! Peer transport, gossip, path-finding, wallet, chain notifications and
//! storage primitives are external collaborators consumed through the
//! narrow trait seams in [`chain`], [`wallet`] and [`persist`].

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    //missing_docs
)]

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate strict_encoding;
#[macro_use]
extern crate log;

#[cfg(feature = "serde")]
#[macro_use]
extern crate serde_with;
#[cfg(feature = "serde")]
extern crate serde_crate as serde;

pub extern crate lnwire;

macro_rules! dumb_pubkey {
    () => {
        secp256k1::PublicKey::from_secret_key(
            secp256k1::SECP256K1,
            &secp256k1::ONE_KEY,
        )
    };
}

pub mod bus;
pub mod chain;
pub mod channel;
pub mod config;
pub mod contractcourt;
pub mod fundmgr;
pub mod htlcswitch;
pub mod invoice;
pub mod persist;
pub mod shachain;
pub mod sweep;
pub mod wallet;

pub use channel::Channel;
pub use config::Config;

/// Top-level classification of errors driving the recovery policy.
///
/// Every subsystem error maps into one of these kinds; the kind — not the
/// concrete error — decides whether the channel gets force-closed, the
/// operation is retried, or the failure is returned to the caller.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display,
)]
pub enum ErrorKind {
    /// Local invariant broken: fatal, force-close the channel and report
    /// to the operator
    #[display("invariant-violation")]
    InvariantViolation,

    /// The peer violated the protocol: send `error`, force-close,
    /// blacklist the peer session
    #[display("protocol-violation")]
    ProtocolViolation,

    /// Local policy rejection: no wire error, returned to the caller
    #[display("policy-rejection")]
    PolicyRejection,

    /// Transient I/O failure towards wallet or chain: retry with backoff
    #[display("transient")]
    Transient,

    /// HTLC expiry looming: preempt normal flow, initiate force-close
    #[display("timeout")]
    Timeout,

    /// Referenced circuit or channel is unknown: settle or fail back
    #[display("not-found")]
    NotFound,

    /// Operation canceled: release resources and return
    #[display("cancellation")]
    Cancellation,
}

impl ErrorKind {
    /// Detects whether errors of this kind require a force-close of the
    /// affected channel
    pub fn requires_force_close(self) -> bool {
        matches!(
            self,
            ErrorKind::InvariantViolation
                | ErrorKind::ProtocolViolation
                | ErrorKind::Timeout
        )
    }
}
