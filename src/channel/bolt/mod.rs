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

mod channel;
pub mod htlc;
mod keyset;
mod policy;
mod state;
mod updates;
mod util;

pub use channel::{
    BoltChannel, Direction, Error, Forwardable, ReestablishAction,
    ReestablishError, RevokedCommitment, ScriptGenerators, CLTV_EXPIRY_GRACE,
    CLTV_EXPIRY_MAX,
};
pub use htlc::{
    commitment_fee, htlc_dust_threshold, htlc_success_fee, htlc_timeout_fee,
    Htlc, TxGenerators, COMMITMENT_TX_WEIGHT, HTLC_OUTPUT_WEIGHT,
    HTLC_SUCCESS_WEIGHT, HTLC_TIMEOUT_WEIGHT,
};
pub use keyset::{
    derive_pubkey, derive_revocation_pubkey, derive_revocation_seckey,
    derive_seckey, LocalKeyset, LocalPubkey, RemoteKeyset,
};
pub use policy::{
    CommonParams, PeerParams, Policy, PolicyError,
    BOLT3_MAX_ACCEPTED_HTLC_LIMIT, BOLT3_DUST_LIMIT, MAX_FUNDING_SATOSHIS,
};
pub use state::ChannelState;
pub use updates::{
    ChainSide, Commitment, CommitmentChain, LogEntry, LogError, Originator,
    UpdateDetails, UpdateLog,
};
pub use util::{
    BoltExt, CommitmentView, HtlcDirection, Lifecycle, StagedHtlc, TxType,
    UpdateMsg,
};
