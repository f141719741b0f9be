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

use amplify::{DumbDefault, Slice32};
use lnwire::ActiveChannelId;
use secp256k1::PublicKey;

use super::{
    CommitmentChain, CommonParams, Direction, Lifecycle, LocalKeyset,
    PeerParams, Policy, RemoteKeyset, UpdateLog,
};
use crate::channel::{Funding, State};
use crate::shachain::ShaChainStore;

/// Complete persisted state of a BOLT channel.
///
/// This is the single value stored per channel in the channel bucket; all
/// extensions load from and store into it, and the strict-encoded round
/// trip of this structure is the crash-recovery contract of the channel
/// state machine.
#[derive(Clone, PartialEq, Debug, StrictEncode, StrictDecode)]
pub struct ChannelState {
    pub funding: Funding,

    /// Current channel lifecycle stage
    pub stage: Lifecycle,

    /// The chain_hash value denotes the exact blockchain that the opened
    /// channel will reside within. This is usually the genesis hash of the
    /// respective blockchain.
    pub chain_hash: Slice32,

    /// Channel id used by the channel; first temporary and later final.
    pub active_channel_id: ActiveChannelId,

    /// Keeps information about the channel direction (who initiated the
    /// funding flow)
    pub direction: Direction,

    /// The policy for accepting remote node params
    pub policy: Policy,

    /// Common parameters applying for both nodes
    pub common_params: CommonParams,

    /// Channel parameters required to be met by the remote node when
    /// operating towards the local one
    pub local_params: PeerParams,

    /// Channel parameters to be used towards the remote node
    pub remote_params: PeerParams,

    /// Set of locally-derived keys for creating channel transactions
    pub local_keys: LocalKeyset,

    /// Set of remote-derived keys for creating channel transactions
    pub remote_keys: RemoteKeyset,

    /// Per-commitment point of the current remote commitment tip
    pub remote_per_commitment_point: PublicKey,

    /// Per-commitment point advertised by the remote for its next
    /// commitment (from `funding_locked` or the last `revoke_and_ack`)
    pub next_remote_per_commitment_point: PublicKey,

    /// Compact store of the per-commitment secrets revealed by the remote
    /// peer
    pub remote_secrets: ShaChainStore,

    /// Append-only log of channel updates
    pub log: UpdateLog,

    /// Local commitment chain: tip plus the unrevoked prior
    pub local_chain: CommitmentChain,

    /// Remote commitment chain: tip plus the unrevoked prior
    pub remote_chain: CommitmentChain,

    /// Id to be assigned to the next HTLC offered by the local node
    pub next_local_htlc_id: u64,

    /// Id expected on the next HTLC offered by the remote node
    pub next_remote_htlc_id: u64,

    /// Highest local update-log index acknowledged by the remote through
    /// its revocations; local updates above it may not enter the local
    /// commitment chain yet
    pub local_acked_index: Option<u64>,

    /// Best known blockchain height, used for HTLC expiry checks
    pub best_height: u32,
}

impl State for ChannelState {
    fn to_funding(&self) -> Funding {
        self.funding.clone()
    }

    fn set_funding(&mut self, funding: &Funding) {
        self.funding = funding.clone()
    }
}

impl DumbDefault for ChannelState {
    fn dumb_default() -> Self {
        use super::Commitment;
        ChannelState {
            funding: Funding::new(),
            stage: Default::default(),
            chain_hash: Default::default(),
            active_channel_id: ActiveChannelId::random(),
            direction: Direction::Outbound,
            policy: Default::default(),
            common_params: Default::default(),
            local_params: Default::default(),
            remote_params: Default::default(),
            local_keys: LocalKeyset::dumb_default(),
            remote_keys: RemoteKeyset::dumb_default(),
            remote_per_commitment_point: dumb_pubkey!(),
            next_remote_per_commitment_point: dumb_pubkey!(),
            remote_secrets: ShaChainStore::new(),
            log: UpdateLog::default(),
            local_chain: CommitmentChain::with(Commitment::initial(
                0,
                0,
                0,
                dumb_pubkey!(),
            )),
            remote_chain: CommitmentChain::with(Commitment::initial(
                0,
                0,
                0,
                dumb_pubkey!(),
            )),
            next_local_htlc_id: 0,
            next_remote_htlc_id: 0,
            local_acked_index: None,
            best_height: 0,
        }
    }
}
